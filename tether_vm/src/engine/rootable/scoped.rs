// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::ops::{Deref, DerefMut};

use crate::{execution::Isolate, vm::EngineValue};

/// # Scope stack
///
/// Every value handed out to embedder code as a [`Local`] is rooted here for
/// as long as the scope that was topmost at registration stays open. All
/// scopes share one root vector: entering a scope records the current length
/// as a high-water mark and exiting truncates back to it, so releasing a
/// scope is O(1) no matter how many handles it holds.
///
/// Locals carry the generation of the root they point at. Every exit bumps
/// the stack's generation, so a Local that outlives its scope is detected
/// even after its slot has been reused.
#[derive(Debug, Default)]
pub struct ScopeStack {
    roots: Vec<LocalRoot>,
    frames: Vec<ScopeFrame>,
    generation: u64,
    next_serial: u64,
}

#[derive(Debug, Clone, Copy)]
struct LocalRoot {
    value: Option<EngineValue>,
    generation: u64,
}

#[derive(Debug)]
struct ScopeFrame {
    serial: u64,
    kind: ScopeKind,
    start: usize,
    escape_slot: Option<usize>,
    escaped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    Normal,
    /// Reserves one slot in the enclosing scope that a single value can be
    /// escaped into.
    Escapable,
    /// Forbids registering handles until it exits.
    Sealed,
    /// Opened by the bridge itself around its own allocations.
    Internal,
}

/// Identifies one entered scope. A token is only ever accepted while its
/// scope is the topmost one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeToken {
    serial: u64,
    depth: u32,
}

impl ScopeToken {
    /// Nesting depth of the scope, starting at 1 for the outermost scope.
    pub fn depth(self) -> u32 {
        self.depth
    }
}

/// Scope-bound handle to an [`EngineValue`].
///
/// Resolving a Local after its scope exited is a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Local {
    index: u32,
    generation: u64,
}

impl Local {
    /// Resolves the handle. Same as [`Isolate::value`].
    pub fn get(self, isolate: &Isolate) -> EngineValue {
        isolate.value(self)
    }
}

impl ScopeStack {
    pub fn enter(&mut self, kind: ScopeKind) -> ScopeToken {
        let escape_slot = if kind == ScopeKind::Escapable {
            match self.frames.last() {
                None => handle_escapable_without_parent(),
                Some(parent) if parent.kind == ScopeKind::Sealed => {
                    handle_register_in_sealed_scope()
                }
                Some(_) => {}
            }
            // The slot belongs to the enclosing scope so it survives our exit.
            self.roots.push(LocalRoot {
                value: None,
                generation: self.generation,
            });
            Some(self.roots.len() - 1)
        } else {
            None
        };
        self.next_serial += 1;
        self.frames.push(ScopeFrame {
            serial: self.next_serial,
            kind,
            start: self.roots.len(),
            escape_slot,
            escaped: false,
        });
        let Ok(depth) = u32::try_from(self.frames.len()) else {
            handle_index_overflow()
        };
        ScopeToken {
            serial: self.next_serial,
            depth,
        }
    }

    pub fn exit(&mut self, token: ScopeToken) {
        let frame = self.top_frame_for(token);
        let start = frame.start;
        self.roots.truncate(start);
        self.frames.pop();
        self.generation += 1;
    }

    pub fn register(&mut self, value: EngineValue) -> Local {
        let Some(frame) = self.frames.last() else {
            handle_register_without_scope()
        };
        if frame.kind == ScopeKind::Sealed {
            handle_register_in_sealed_scope()
        }
        let Ok(index) = u32::try_from(self.roots.len()) else {
            handle_index_overflow()
        };
        self.roots.push(LocalRoot {
            value: Some(value),
            generation: self.generation,
        });
        Local {
            index,
            generation: self.generation,
        }
    }

    pub fn get(&self, local: Local) -> EngineValue {
        match self.roots.get(local.index as usize) {
            Some(&LocalRoot {
                value: Some(value),
                generation,
            }) if generation == local.generation => value,
            _ => handle_bound_check_failure(),
        }
    }

    /// Copies `local` into the slot the escapable scope `token` reserved in
    /// its parent and returns a handle to that slot.
    pub fn escape(&mut self, token: ScopeToken, local: Local) -> Local {
        let value = self.get(local);
        let frame = self.top_frame_for(token);
        let Some(slot) = frame.escape_slot else {
            handle_escape_from_non_escapable()
        };
        if frame.escaped {
            handle_escape_twice()
        }
        frame.escaped = true;
        let root = &mut self.roots[slot];
        root.value = Some(value);
        Local {
            index: slot as u32,
            generation: root.generation,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn current_kind(&self) -> Option<ScopeKind> {
        self.frames.last().map(|frame| frame.kind)
    }

    pub fn is_current_scope_sealed(&self) -> bool {
        self.current_kind() == Some(ScopeKind::Sealed)
    }

    /// Number of live handles across all scopes.
    pub fn number_of_handles(&self) -> usize {
        self.roots.iter().filter(|root| root.value.is_some()).count()
    }

    /// Number of handles registered while the topmost scope was on top.
    pub fn current_scope_handles(&self) -> usize {
        match self.frames.last() {
            Some(frame) => self.roots.len() - frame.start,
            None => 0,
        }
    }

    pub fn is_valid(&self, token: ScopeToken) -> bool {
        self.frames.iter().any(|frame| frame.serial == token.serial)
    }

    pub fn is_topmost(&self, token: ScopeToken) -> bool {
        self.frames
            .last()
            .is_some_and(|frame| frame.serial == token.serial)
    }

    pub fn values(&self) -> impl Iterator<Item = EngineValue> + '_ {
        self.roots.iter().filter_map(|root| root.value)
    }

    pub(crate) fn clear(&mut self) {
        self.roots.clear();
        self.frames.clear();
        self.generation += 1;
    }

    fn top_frame_for(&mut self, token: ScopeToken) -> &mut ScopeFrame {
        match self.frames.last_mut() {
            Some(frame) if frame.serial == token.serial => frame,
            _ => handle_scope_out_of_order(),
        }
    }
}

/// RAII handle scope: enters a scope on construction and exits it on drop.
/// Derefs to the isolate so handles can be created through it.
#[derive(Debug)]
pub struct HandleScope<'i> {
    isolate: &'i mut Isolate,
    token: ScopeToken,
}

impl<'i> HandleScope<'i> {
    pub fn new(isolate: &'i mut Isolate) -> Self {
        Self::with_kind(isolate, ScopeKind::Normal)
    }

    pub fn escapable(isolate: &'i mut Isolate) -> Self {
        Self::with_kind(isolate, ScopeKind::Escapable)
    }

    pub fn sealed(isolate: &'i mut Isolate) -> Self {
        Self::with_kind(isolate, ScopeKind::Sealed)
    }

    pub fn with_kind(isolate: &'i mut Isolate, kind: ScopeKind) -> Self {
        let token = isolate.enter_scope(kind);
        Self { isolate, token }
    }

    pub fn token(&self) -> ScopeToken {
        self.token
    }

    pub fn escape(&mut self, local: Local) -> Local {
        self.isolate.escape(self.token, local)
    }
}

impl Deref for HandleScope<'_> {
    type Target = Isolate;

    fn deref(&self) -> &Isolate {
        self.isolate
    }
}

impl DerefMut for HandleScope<'_> {
    fn deref_mut(&mut self) -> &mut Isolate {
        self.isolate
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() && !self.isolate.scopes.is_topmost(self.token) {
            return;
        }
        self.isolate.exit_scope(self.token);
    }
}

#[cold]
#[inline(never)]
fn handle_bound_check_failure() -> ! {
    tracing::error!("stale Local dereferenced");
    panic!("Attempted to access dropped Local")
}

#[cold]
#[inline(never)]
fn handle_index_overflow() -> ! {
    panic!("Locals stack overflowed")
}

#[cold]
#[inline(never)]
fn handle_register_without_scope() -> ! {
    tracing::error!("handle registered with no open scope");
    panic!("Cannot create a handle without a HandleScope")
}

#[cold]
#[inline(never)]
fn handle_register_in_sealed_scope() -> ! {
    tracing::error!("handle registered in a sealed scope");
    panic!("Cannot create a handle in a sealed HandleScope")
}

#[cold]
#[inline(never)]
fn handle_scope_out_of_order() -> ! {
    tracing::error!("scope token is not the topmost scope");
    panic!("HandleScope exited out of order")
}

#[cold]
#[inline(never)]
fn handle_escapable_without_parent() -> ! {
    tracing::error!("escapable scope entered with no enclosing scope");
    panic!("EscapableHandleScope requires an enclosing HandleScope")
}

#[cold]
#[inline(never)]
fn handle_escape_from_non_escapable() -> ! {
    tracing::error!("escape called on a scope that is not escapable");
    panic!("Escape called on a non-escapable HandleScope")
}

#[cold]
#[inline(never)]
fn handle_escape_twice() -> ! {
    tracing::error!("escape called twice on the same scope");
    panic!("Escape called twice on the same HandleScope")
}
