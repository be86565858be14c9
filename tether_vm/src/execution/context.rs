// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::ops::{Deref, DerefMut};

use super::{Isolate, TraceCategory};
use crate::{
    engine::rootable::{Local, ScopeKind},
    vm::{EngineValue, ProxyTraps, ValuePayload},
};

/// Embedder data slots per context. Setting a slot at or past this index is
/// fatal.
pub const MAX_EMBEDDER_DATA_SLOTS: usize = 1 << 16;

/// Handle to one logical context of an isolate.
///
/// A context owns a global object but hands out a proxy to it: the proxy's
/// `getPrototypeOf` trap returns the real global, which is otherwise not
/// reachable by embedder code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Context {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct ContextRecord {
    global_proxy: Option<EngineValue>,
    global: Option<EngineValue>,
    embedder_data: Vec<Option<EngineValue>>,
}

impl ContextRecord {
    /// The proxy is let go of before its target.
    fn release(mut self, context: Context) {
        if let Some(proxy) = self.global_proxy.take() {
            tracing::trace!(?context, ?proxy, "released global proxy");
        }
        if let Some(global) = self.global.take() {
            tracing::trace!(?context, ?global, "released global object");
        }
        self.embedder_data.clear();
    }
}

#[derive(Debug)]
struct ContextSlot {
    generation: u32,
    record: Option<ContextRecord>,
}

#[derive(Debug, Default)]
pub(crate) struct Contexts {
    slots: Vec<ContextSlot>,
    free_list: Vec<u32>,
    entered: Vec<Context>,
}

impl Contexts {
    pub(crate) fn create(&mut self, global: EngineValue, global_proxy: EngineValue) -> Context {
        let record = ContextRecord {
            global_proxy: Some(global_proxy),
            global: Some(global),
            embedder_data: Vec::new(),
        };
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return Context {
                index,
                generation: slot.generation,
            };
        }
        let Ok(index) = u32::try_from(self.slots.len()) else {
            handle_context_overflow()
        };
        self.slots.push(ContextSlot {
            generation: 0,
            record: Some(record),
        });
        Context {
            index,
            generation: 0,
        }
    }

    pub(crate) fn is_alive(&self, context: Context) -> bool {
        self.slots
            .get(context.index as usize)
            .is_some_and(|slot| slot.generation == context.generation && slot.record.is_some())
    }

    fn record(&self, context: Context) -> &ContextRecord {
        match self.slots.get(context.index as usize) {
            Some(ContextSlot {
                generation,
                record: Some(record),
            }) if *generation == context.generation => record,
            _ => handle_disposed_context(),
        }
    }

    fn record_mut(&mut self, context: Context) -> &mut ContextRecord {
        match self.slots.get_mut(context.index as usize) {
            Some(ContextSlot {
                generation,
                record: Some(record),
            }) if *generation == context.generation => record,
            _ => handle_disposed_context(),
        }
    }

    pub(crate) fn global(&self, context: Context) -> EngineValue {
        match self.record(context).global {
            Some(global) => global,
            None => handle_disposed_context(),
        }
    }

    pub(crate) fn global_proxy(&self, context: Context) -> EngineValue {
        match self.record(context).global_proxy {
            Some(proxy) => proxy,
            None => handle_disposed_context(),
        }
    }

    pub(crate) fn enter(&mut self, context: Context) {
        if !self.is_alive(context) {
            handle_disposed_context()
        }
        self.entered.push(context);
    }

    pub(crate) fn exit(&mut self, context: Context) {
        if self.entered.last() != Some(&context) {
            handle_context_exit_out_of_order()
        }
        self.entered.pop();
    }

    pub(crate) fn current(&self) -> Option<Context> {
        self.entered.last().copied()
    }

    pub(crate) fn entered_depth(&self) -> usize {
        self.entered.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.record.is_some()).count()
    }

    pub(crate) fn dispose(&mut self, context: Context) {
        if self.entered.contains(&context) {
            handle_dispose_entered_context()
        }
        let Some(slot) = self
            .slots
            .get_mut(context.index as usize)
            .filter(|slot| slot.generation == context.generation)
        else {
            handle_disposed_context()
        };
        let Some(record) = slot.record.take() else {
            handle_disposed_context()
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(context.index);
        record.release(context);
    }

    /// Stores `value` in embedder data slot `index`, growing the slots as
    /// needed.
    pub(crate) fn set_embedder_data(&mut self, context: Context, index: usize, value: EngineValue) {
        if index >= MAX_EMBEDDER_DATA_SLOTS {
            handle_embedder_data_index(index)
        }
        let data = &mut self.record_mut(context).embedder_data;
        if data.len() <= index {
            data.resize(index + 1, None);
        }
        data[index] = Some(value);
    }

    pub(crate) fn embedder_data(&self, context: Context, index: usize) -> Option<EngineValue> {
        self.record(context)
            .embedder_data
            .get(index)
            .copied()
            .flatten()
    }

    pub(crate) fn append_roots(&self, roots: &mut Vec<EngineValue>) {
        for record in self.slots.iter().filter_map(|slot| slot.record.as_ref()) {
            roots.extend(record.global_proxy);
            roots.extend(record.global);
            roots.extend(record.embedder_data.iter().flatten().copied());
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entered.clear();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(record) = slot.record.take() else {
                continue;
            };
            let context = Context {
                index: index as u32,
                generation: slot.generation,
            };
            slot.generation = slot.generation.wrapping_add(1);
            record.release(context);
        }
        self.free_list.clear();
        self.slots.clear();
    }
}

/// RAII context entry: enters on construction, exits on drop.
#[derive(Debug)]
pub struct ContextScope<'i> {
    isolate: &'i mut Isolate,
    context: Context,
}

impl<'i> ContextScope<'i> {
    pub fn new(isolate: &'i mut Isolate, context: Context) -> Self {
        isolate.enter_context(context);
        Self { isolate, context }
    }

    pub fn context(&self) -> Context {
        self.context
    }
}

impl Deref for ContextScope<'_> {
    type Target = Isolate;

    fn deref(&self) -> &Isolate {
        self.isolate
    }
}

impl DerefMut for ContextScope<'_> {
    fn deref_mut(&mut self) -> &mut Isolate {
        self.isolate
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() && self.isolate.current_context() != Some(self.context) {
            return;
        }
        self.isolate.exit_context(self.context);
    }
}

impl Isolate {
    /// Creates a context whose global object inherits from `global_template`.
    pub fn new_context(&mut self, global_template: Option<Local>) -> Context {
        let prototype = global_template.map(|template| self.value(template));
        let token = self.enter_scope(ScopeKind::Internal);
        let global = self.new_value(ValuePayload::Object { prototype });
        let global = self.value(global);
        let proxy = self.new_value(ValuePayload::Proxy {
            target: global,
            traps: ProxyTraps {
                get_prototype_of: Some(global),
            },
        });
        let proxy = self.value(proxy);
        let context = self.contexts.create(global, proxy);
        self.exit_scope(token);
        if self.options().is_trace_call_enabled(TraceCategory::Context) {
            tracing::trace!(?context, ?global, ?proxy, "context created");
        }
        context
    }

    /// The global proxy of `context`, which is what embedder code sees as
    /// the global.
    pub fn context_global(&mut self, context: Context) -> Local {
        let proxy = self.contexts.global_proxy(context);
        self.register(proxy)
    }

    /// The real global object behind the proxy.
    pub fn context_global_object(&mut self, context: Context) -> Local {
        let global = self.contexts.global(context);
        self.register(global)
    }

    pub fn enter_context(&mut self, context: Context) {
        self.contexts.enter(context);
        if self.options().is_trace_call_enabled(TraceCategory::Context) {
            tracing::trace!(?context, depth = self.contexts.entered_depth(), "context entered");
        }
    }

    pub fn exit_context(&mut self, context: Context) {
        self.contexts.exit(context);
        if self.options().is_trace_call_enabled(TraceCategory::Context) {
            tracing::trace!(?context, depth = self.contexts.entered_depth(), "context exited");
        }
    }

    pub fn current_context(&self) -> Option<Context> {
        self.contexts.current()
    }

    pub fn entered_context_depth(&self) -> usize {
        self.contexts.entered_depth()
    }

    pub fn is_context_alive(&self, context: Context) -> bool {
        self.contexts.is_alive(context)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn dispose_context(&mut self, context: Context) {
        self.contexts.dispose(context);
        if self.options().is_trace_call_enabled(TraceCategory::Context) {
            tracing::trace!(?context, "context disposed");
        }
    }

    pub fn set_embedder_data(&mut self, context: Context, index: usize, value: Local) {
        let value = self.value(value);
        self.contexts.set_embedder_data(context, index, value);
    }

    pub fn get_embedder_data(&mut self, context: Context, index: usize) -> Option<Local> {
        let value = self.contexts.embedder_data(context, index)?;
        Some(self.register(value))
    }
}

#[cold]
#[inline(never)]
fn handle_embedder_data_index(index: usize) -> ! {
    tracing::error!(index, "embedder data index out of range");
    panic!("Embedder data index out of range")
}

#[cold]
#[inline(never)]
fn handle_disposed_context() -> ! {
    tracing::error!("context used after it was disposed");
    panic!("Attempted to use a disposed Context")
}

#[cold]
#[inline(never)]
fn handle_context_exit_out_of_order() -> ! {
    tracing::error!("context exited while not the current context");
    panic!("Context exited out of order")
}

#[cold]
#[inline(never)]
fn handle_dispose_entered_context() -> ! {
    tracing::error!("entered context disposed");
    panic!("Cannot dispose an entered Context")
}

#[cold]
#[inline(never)]
fn handle_context_overflow() -> ! {
    panic!("Contexts overflowed")
}
