// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::num::NonZeroU32;
use std::{
    rc::Rc,
    sync::atomic::{AtomicU32, Ordering},
};

use super::{
    ArrayBufferAllocator, AtomicValueCache, CachedString, CreateParams, Options, TraceCategory,
    context::Contexts, current,
};
use crate::{
    engine::rootable::{
        HandleScope, Local, Persistent, PersistentRegistry, ScopeKind, ScopeStack, ScopeToken,
        WeakCallback, WeakCallbackInfo,
    },
    exception::ExceptionState,
    vm::{Engine, EngineValue, ValuePayload},
};

static NEXT_ISOLATE_ID: AtomicU32 = AtomicU32::new(0);

/// Process-unique identity of an [`Isolate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(NonZeroU32);

impl IsolateId {
    fn next() -> Self {
        let id = NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU32::MIN.saturating_add(id))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolateState {
    Allocated,
    Ready,
    Disposed,
}

/// Index of a value that stays rooted until its isolate is disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EternalIndex(u32);

/// # Isolate
///
/// One instance of the VM together with all rooting state the bridge keeps
/// for it: the scope stack, the persistent registry, the atomic value cache,
/// contexts, the exception slot and message listeners.
///
/// An isolate is confined to the thread that created it. Entering it pushes
/// a frame on that thread's current-isolate stack; entries nest and must be
/// balanced by exits.
pub struct Isolate {
    id: IsolateId,
    state: IsolateState,
    vm: Option<Box<dyn Engine>>,
    options: Options,
    array_buffer_allocator: Option<Rc<dyn ArrayBufferAllocator>>,
    cache: Option<AtomicValueCache>,
    entry_count: usize,
    eternals: Vec<EngineValue>,
    pub(crate) scopes: ScopeStack,
    pub(crate) persistents: PersistentRegistry,
    pub(crate) contexts: Contexts,
    pub(crate) exceptions: ExceptionState,
}

impl core::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("entry_count", &self.entry_count)
            .field("scope_depth", &self.scopes.depth())
            .field("persistents", &self.persistents.len())
            .field("contexts", &self.contexts.len())
            .finish_non_exhaustive()
    }
}

impl Isolate {
    /// Creates an uninitialized isolate around `vm`.
    pub fn allocate(vm: Box<dyn Engine>) -> Self {
        let isolate = Self {
            id: IsolateId::next(),
            state: IsolateState::Allocated,
            vm: Some(vm),
            options: Options::default(),
            array_buffer_allocator: None,
            cache: None,
            entry_count: 0,
            eternals: Vec::new(),
            scopes: ScopeStack::default(),
            persistents: PersistentRegistry::default(),
            contexts: Contexts::default(),
            exceptions: ExceptionState::default(),
        };
        tracing::debug!(isolate = isolate.id.get(), "isolate allocated");
        isolate
    }

    /// Attaches embedder configuration and interns the atomic values.
    pub fn initialize(&mut self, params: CreateParams) {
        if self.state != IsolateState::Allocated {
            handle_invalid_state("initialize", self.state)
        }
        let CreateParams {
            array_buffer_allocator,
            options,
        } = params;
        self.options = options;
        self.array_buffer_allocator = Some(array_buffer_allocator);
        self.cache = Some(AtomicValueCache::new(self.vm_mut()));
        self.state = IsolateState::Ready;
        if self.trace_call(TraceCategory::Isolate) {
            tracing::trace!(isolate = self.id.get(), "isolate initialized");
        }
    }

    pub fn new(vm: Box<dyn Engine>, params: CreateParams) -> Self {
        let mut isolate = Self::allocate(vm);
        isolate.initialize(params);
        isolate
    }

    pub fn id(&self) -> IsolateId {
        self.id
    }

    pub fn state(&self) -> IsolateState {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn array_buffer_allocator(&self) -> Option<&dyn ArrayBufferAllocator> {
        self.array_buffer_allocator.as_deref()
    }

    fn trace_call(&self, category: TraceCategory) -> bool {
        self.options.is_trace_call_enabled(category)
    }

    pub fn enter(&mut self) {
        if self.state != IsolateState::Ready {
            handle_invalid_state("enter", self.state)
        }
        current::push(self.id);
        self.entry_count += 1;
        if self.trace_call(TraceCategory::Isolate) {
            tracing::trace!(isolate = self.id.get(), entry_count = self.entry_count, "isolate entered");
        }
    }

    pub fn exit(&mut self) {
        if self.entry_count == 0 || !current::pop(self.id) {
            handle_unbalanced_exit()
        }
        self.entry_count -= 1;
        if self.trace_call(TraceCategory::Isolate) {
            tracing::trace!(isolate = self.id.get(), entry_count = self.entry_count, "isolate exited");
        }
    }

    /// The innermost isolate entered on this thread.
    pub fn get_current() -> Option<IsolateId> {
        current::current()
    }

    pub fn is_current(&self) -> bool {
        current::current() == Some(self.id)
    }

    /// Number of entries on this thread not yet balanced by an exit.
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn vm(&self) -> &dyn Engine {
        match self.vm.as_deref() {
            Some(vm) => vm,
            None => handle_disposed(),
        }
    }

    pub fn vm_mut(&mut self) -> &mut dyn Engine {
        match self.vm.as_deref_mut() {
            Some(vm) => vm,
            None => handle_disposed(),
        }
    }

    pub fn atomic_cache(&self) -> &AtomicValueCache {
        match &self.cache {
            Some(cache) => cache,
            None => handle_invalid_state("access the atomic value cache", self.state),
        }
    }

    pub fn enter_scope(&mut self, kind: ScopeKind) -> ScopeToken {
        let token = self.scopes.enter(kind);
        if self.trace_call(TraceCategory::HandleScope) {
            tracing::trace!(?kind, depth = token.depth(), "scope entered");
        }
        token
    }

    pub fn exit_scope(&mut self, token: ScopeToken) {
        if self.trace_call(TraceCategory::HandleScope) {
            tracing::trace!(
                depth = token.depth(),
                handles = self.scopes.current_scope_handles(),
                "scope exited"
            );
        }
        self.scopes.exit(token);
    }

    /// Roots `value` in the topmost scope.
    pub fn register(&mut self, value: EngineValue) -> Local {
        self.scopes.register(value)
    }

    /// Resolves a Local. Fatal if its scope has exited.
    pub fn value(&self, local: Local) -> EngineValue {
        self.scopes.get(local)
    }

    pub fn escape(&mut self, token: ScopeToken, local: Local) -> Local {
        let escaped = self.scopes.escape(token, local);
        if self.trace_call(TraceCategory::HandleScope) {
            tracing::trace!(depth = token.depth(), "value escaped");
        }
        escaped
    }

    pub fn with_handle_scope<R>(&mut self, f: impl FnOnce(&mut HandleScope<'_>) -> R) -> R {
        let mut scope = HandleScope::new(self);
        f(&mut scope)
    }

    pub fn scope_depth(&self) -> usize {
        self.scopes.depth()
    }

    pub fn number_of_handles(&self) -> usize {
        self.scopes.number_of_handles()
    }

    pub fn is_current_scope_sealed(&self) -> bool {
        self.scopes.is_current_scope_sealed()
    }

    pub fn is_scope_valid(&self, token: ScopeToken) -> bool {
        self.scopes.is_valid(token)
    }

    /// Creates a value in the VM and roots it in the topmost scope.
    pub fn new_value(&mut self, payload: ValuePayload<'_>) -> Local {
        let value = self.vm_mut().create_value(payload);
        self.register(value)
    }

    /// Reads a property named by a cached string.
    pub fn get_cached_property(&self, object: EngineValue, key: CachedString) -> Option<EngineValue> {
        let key = self.atomic_cache().string(key);
        self.vm().get(object, key)
    }

    pub fn promote(&mut self, local: Local) -> Persistent {
        let value = self.value(local);
        self.promote_value(value)
    }

    pub fn promote_value(&mut self, value: EngineValue) -> Persistent {
        let persistent = self.persistents.promote(value);
        if self.trace_call(TraceCategory::Persistent) {
            tracing::trace!(?value, count = self.persistents.count(value), "value promoted");
        }
        persistent
    }

    /// Number of persistent handles holding `value`.
    pub fn persistent_count(&self, value: EngineValue) -> usize {
        self.persistents.count(value)
    }

    /// Number of values held by persistent handles.
    pub fn persistent_registry_len(&self) -> usize {
        self.persistents.len()
    }

    pub fn is_weak(&self, value: EngineValue) -> bool {
        self.persistents.is_weak(value)
    }

    pub(crate) fn register_weak(&mut self, value: EngineValue, epoch: u64, callback: WeakCallback) -> bool {
        let Some(finalizer) = self.persistents.set_weak(value, epoch, callback) else {
            return false;
        };
        self.vm_mut().register_finalizer(value, Some(finalizer));
        if self.trace_call(TraceCategory::Persistent) {
            tracing::trace!(?value, ?finalizer, "persistent made weak");
        }
        true
    }

    pub(crate) fn unregister_weak(&mut self, value: EngineValue, epoch: u64) -> bool {
        if !self.persistents.clear_weak(value, epoch) {
            return false;
        }
        self.vm_mut().register_finalizer(value, None);
        if self.trace_call(TraceCategory::Persistent) {
            tracing::trace!(?value, "persistent made strong");
        }
        true
    }

    /// Roots the value until the isolate is disposed.
    pub fn set_eternal(&mut self, local: Local) -> EternalIndex {
        let value = self.value(local);
        let Ok(index) = u32::try_from(self.eternals.len()) else {
            handle_eternals_overflow()
        };
        self.eternals.push(value);
        EternalIndex(index)
    }

    pub fn get_eternal(&mut self, index: EternalIndex) -> Option<Local> {
        let value = *self.eternals.get(index.0 as usize)?;
        Some(self.register(value))
    }

    /// Everything the bridge currently keeps alive.
    fn gather_roots(&self) -> Vec<EngineValue> {
        let mut roots = Vec::new();
        if let Some(cache) = &self.cache {
            cache.append_roots(&mut roots);
        }
        roots.extend(self.scopes.values());
        self.persistents.append_roots(&mut roots);
        self.contexts.append_roots(&mut roots);
        self.exceptions.append_roots(&mut roots);
        roots.extend(self.eternals.iter().copied());
        roots
    }

    /// Runs one collection and the weak callbacks it made due. Returns the
    /// number of callbacks that ran.
    pub fn collect_garbage(&mut self) -> usize {
        let _span = tracing::debug_span!("collect_garbage", isolate = self.id.get()).entered();
        for value in self.persistents.take_released_finalizers() {
            self.vm_mut().register_finalizer(value, None);
        }
        let roots = self.gather_roots();
        let finalizations = self.vm_mut().run_collection(&roots);
        let due = finalizations.len();
        let mut fired = 0;
        for finalization in finalizations {
            let Some((epoch, callback)) = self.persistents.take_weak_callback(finalization) else {
                continue;
            };
            let value = finalization.value;
            callback(&mut WeakCallbackInfo::new(self, value, epoch));
            if self.persistents.finish_finalization(value, epoch) {
                tracing::trace!(?value, "weak entry revived");
            }
            fired += 1;
        }
        if self.options.trace_gc {
            tracing::info!(roots = roots.len(), due, fired, "collection finished");
        } else {
            tracing::debug!(roots = roots.len(), due, fired, "collection finished");
        }
        fired
    }

    /// Collects until a pass runs no weak callbacks, or the configured pass
    /// limit is reached.
    pub fn collect_all_garbage(&mut self) -> usize {
        let mut total = 0;
        for _ in 0..self.options.max_finalization_passes {
            let fired = self.collect_garbage();
            total += fired;
            if fired == 0 {
                return total;
            }
        }
        tracing::warn!(
            passes = self.options.max_finalization_passes,
            total,
            "weak callbacks still firing after the last collection pass"
        );
        total
    }

    /// Tears the isolate down. Finalizers are flushed first, then every
    /// root is dropped, and the VM is released last.
    pub fn dispose(&mut self) {
        if self.state == IsolateState::Disposed {
            handle_double_dispose()
        }
        if self.trace_call(TraceCategory::Isolate) {
            tracing::trace!(isolate = self.id.get(), "disposing isolate");
        }
        if self.state == IsolateState::Ready {
            self.collect_all_garbage();
        }
        let weak_values = self.persistents.clear();
        if let Some(vm) = self.vm.as_deref_mut() {
            for value in weak_values {
                vm.register_finalizer(value, None);
            }
        }
        self.contexts.clear();
        self.exceptions.clear();
        self.scopes.clear();
        self.eternals.clear();
        self.cache = None;
        let frames = current::remove_all(self.id);
        self.entry_count = 0;
        self.vm = None;
        self.array_buffer_allocator = None;
        self.state = IsolateState::Disposed;
        tracing::debug!(isolate = self.id.get(), frames, "isolate disposed");
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        if self.state == IsolateState::Disposed {
            return;
        }
        if std::thread::panicking() {
            current::remove_all(self.id);
            return;
        }
        self.dispose();
    }
}

#[cold]
#[inline(never)]
fn handle_invalid_state(operation: &str, state: IsolateState) -> ! {
    tracing::error!(operation, ?state, "isolate is in the wrong state");
    panic!("Cannot {operation} an isolate in state {state:?}")
}

#[cold]
#[inline(never)]
fn handle_unbalanced_exit() -> ! {
    tracing::error!("isolate exit without a matching enter");
    panic!("Isolate exit is unbalanced")
}

#[cold]
#[inline(never)]
fn handle_double_dispose() -> ! {
    tracing::error!("isolate disposed twice");
    panic!("Isolate disposed twice")
}

#[cold]
#[inline(never)]
fn handle_disposed() -> ! {
    tracing::error!("isolate used after dispose");
    panic!("Isolate has been disposed")
}

#[cold]
#[inline(never)]
fn handle_eternals_overflow() -> ! {
    panic!("Eternal handles overflowed")
}
