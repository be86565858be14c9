// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::num::NonZeroU64;
use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use ahash::RandomState;
use hashbrown::HashMap;

use crate::{
    engine::rootable::Local,
    execution::Isolate,
    vm::{EngineValue, Finalization, FinalizerId},
};

pub(crate) type WeakCallback = Box<dyn FnOnce(&mut WeakCallbackInfo<'_>)>;

/// # Persistent registry
///
/// Maps each promoted [`EngineValue`] to the number of [`Persistent`]
/// handles currently holding it. Entries without a weak registration are
/// reported as roots on every collection; weak entries only arrange for a
/// callback once the value is otherwise unreachable.
///
/// The state is shared with the handles so that dropping a handle can
/// release its count without access to the isolate.
#[derive(Debug, Default)]
pub(crate) struct PersistentRegistry {
    state: Rc<RefCell<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<EngineValue, PersistentEntry, RandomState>,
    next_epoch: u64,
    next_finalizer: u64,
    /// Values whose weak entry went away while the VM was out of reach.
    released_finalizers: Vec<EngineValue>,
}

struct PersistentEntry {
    count: usize,
    epoch: u64,
    weak: Option<WeakRecord>,
}

struct WeakRecord {
    finalizer: FinalizerId,
    callback: WeakCallback,
}

impl core::fmt::Debug for RegistryState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegistryState")
            .field("entries", &self.entries.len())
            .field("released_finalizers", &self.released_finalizers)
            .finish()
    }
}

impl RegistryState {
    fn live_entry(&mut self, value: EngineValue, epoch: u64) -> Option<&mut PersistentEntry> {
        self.entries
            .get_mut(&value)
            .filter(|entry| entry.epoch == epoch)
    }

    /// Returns the remaining count and, once it reaches zero, the removed
    /// entry. The caller drops the entry after releasing its borrow since a
    /// weak callback may own handles of its own.
    fn release(
        &mut self,
        value: EngineValue,
        epoch: u64,
    ) -> Option<(usize, Option<PersistentEntry>)> {
        let entry = self.live_entry(value, epoch)?;
        entry.count -= 1;
        let count = entry.count;
        if count > 0 {
            return Some((count, None));
        }
        let removed = self.entries.remove(&value);
        if removed.as_ref().is_some_and(|entry| entry.weak.is_some()) {
            self.released_finalizers.push(value);
        }
        Some((0, removed))
    }
}

impl PersistentRegistry {
    pub(crate) fn promote(&self, value: EngineValue) -> Persistent {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let epoch = match state.entries.get_mut(&value) {
            Some(entry) => {
                entry.count += 1;
                entry.epoch
            }
            None => {
                state.next_epoch += 1;
                let epoch = state.next_epoch;
                state.entries.insert(
                    value,
                    PersistentEntry {
                        count: 1,
                        epoch,
                        weak: None,
                    },
                );
                epoch
            }
        };
        Persistent {
            value,
            epoch,
            registry: Rc::downgrade(&self.state),
        }
    }

    pub(crate) fn count(&self, value: EngineValue) -> usize {
        self.state
            .borrow()
            .entries
            .get(&value)
            .map_or(0, |entry| entry.count)
    }

    pub(crate) fn is_weak(&self, value: EngineValue) -> bool {
        self.state
            .borrow()
            .entries
            .get(&value)
            .is_some_and(|entry| entry.weak.is_some())
    }

    pub(crate) fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }

    /// Whether `handle` was promoted through this registry.
    pub(crate) fn owns(&self, handle: &Persistent) -> bool {
        core::ptr::eq(handle.registry.as_ptr(), Rc::as_ptr(&self.state))
    }

    /// Attaches `callback` to the entry, replacing any earlier registration.
    /// Returns the id to hand to the VM.
    pub(crate) fn set_weak(
        &self,
        value: EngineValue,
        epoch: u64,
        callback: WeakCallback,
    ) -> Option<FinalizerId> {
        let mut state = self.state.borrow_mut();
        if state.live_entry(value, epoch).is_none() {
            drop(state);
            drop(callback);
            return None;
        }
        let finalizer = FinalizerId::from_raw(NonZeroU64::MIN.saturating_add(state.next_finalizer));
        state.next_finalizer += 1;
        let mut previous = None;
        if let Some(entry) = state.live_entry(value, epoch) {
            previous = entry.weak.replace(WeakRecord {
                finalizer,
                callback,
            });
        }
        // A replaced callback may own handles; drop it once the borrow ends.
        drop(state);
        drop(previous);
        Some(finalizer)
    }

    pub(crate) fn clear_weak(&self, value: EngineValue, epoch: u64) -> bool {
        let mut state = self.state.borrow_mut();
        let previous = state
            .live_entry(value, epoch)
            .and_then(|entry| entry.weak.take());
        drop(state);
        previous.is_some()
    }

    pub(crate) fn append_roots(&self, roots: &mut Vec<EngineValue>) {
        roots.extend(
            self.state
                .borrow()
                .entries
                .iter()
                .filter(|(_, entry)| entry.weak.is_none())
                .map(|(&value, _)| value),
        );
    }

    /// Drains values whose VM-side finalizer registration is no longer
    /// backed by a weak entry.
    pub(crate) fn take_released_finalizers(&self) -> Vec<EngineValue> {
        let mut state = self.state.borrow_mut();
        let released = core::mem::take(&mut state.released_finalizers);
        released
            .into_iter()
            .filter(|value| {
                !state
                    .entries
                    .get(value)
                    .is_some_and(|entry| entry.weak.is_some())
            })
            .collect()
    }

    /// Detaches the callback a finalization was reported for. Stale
    /// finalizations, whose registration was cleared or replaced after the VM
    /// recorded them, yield nothing.
    pub(crate) fn take_weak_callback(
        &self,
        finalization: Finalization,
    ) -> Option<(u64, WeakCallback)> {
        let mut state = self.state.borrow_mut();
        let entry = state.entries.get_mut(&finalization.value)?;
        if entry
            .weak
            .as_ref()
            .is_none_or(|weak| weak.finalizer != finalization.finalizer)
        {
            return None;
        }
        let weak = entry.weak.take()?;
        Some((entry.epoch, weak.callback))
    }

    /// Removes the entry after its callback ran, unless the callback
    /// registered a new one.
    pub(crate) fn finish_finalization(&self, value: EngineValue, epoch: u64) -> bool {
        let mut state = self.state.borrow_mut();
        let revived = match state.live_entry(value, epoch) {
            Some(entry) => entry.weak.is_some(),
            None => return false,
        };
        if !revived {
            state.entries.remove(&value);
        }
        revived
    }

    /// Empties the registry and returns the values that still had a
    /// finalizer registered with the VM.
    pub(crate) fn clear(&self) -> Vec<EngineValue> {
        let mut state = self.state.borrow_mut();
        let entries = state.entries.drain().collect::<Vec<_>>();
        let mut weak_values = core::mem::take(&mut state.released_finalizers);
        drop(state);
        weak_values.extend(
            entries
                .iter()
                .filter(|(_, entry)| entry.weak.is_some())
                .map(|&(value, _)| value),
        );
        // Callbacks may own handles whose drop borrows the state again.
        drop(entries);
        weak_values
    }
}

/// # Persistent handle
///
/// Keeps an [`EngineValue`] alive independently of any scope. Every handle
/// holds one count on the value's registry entry: cloning adds a count and
/// dropping or [resetting](Persistent::reset) releases it. The entry, and
/// with it the rooting, goes away when the last count is released.
///
/// A handle whose entry was removed by its isolate (disposal, or a weak
/// callback firing) is empty; releasing it does nothing.
pub struct Persistent {
    value: EngineValue,
    epoch: u64,
    registry: Weak<RefCell<RegistryState>>,
}

impl Persistent {
    /// Returns the value while the handle's entry is alive.
    pub fn get(&self) -> Option<EngineValue> {
        let state = self.registry.upgrade()?;
        let state = state.borrow();
        state
            .entries
            .get(&self.value)
            .filter(|entry| entry.epoch == self.epoch)
            .map(|_| self.value)
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_none()
    }

    pub fn is_weak(&self) -> bool {
        let Some(state) = self.registry.upgrade() else {
            return false;
        };
        let state = state.borrow();
        state
            .entries
            .get(&self.value)
            .is_some_and(|entry| entry.epoch == self.epoch && entry.weak.is_some())
    }

    /// Registers the value in the current scope.
    pub fn to_local(&self, isolate: &mut Isolate) -> Option<Local> {
        let value = self.get()?;
        self.check_owner(isolate);
        Some(isolate.register(value))
    }

    /// Releases this handle's count and leaves it empty.
    pub fn reset(&mut self) {
        self.release();
        self.registry = Weak::new();
    }

    /// Turns the entry weak: it stops rooting the value, and `callback` runs
    /// with `parameter` once the VM finds the value otherwise unreachable.
    pub fn set_weak<P: 'static>(
        &self,
        isolate: &mut Isolate,
        parameter: P,
        callback: fn(&mut WeakCallbackInfo<'_>, P),
    ) {
        if self.is_empty() {
            handle_set_weak_on_empty()
        }
        self.check_owner(isolate);
        let callback: WeakCallback = Box::new(move |info| callback(info, parameter));
        if !isolate.register_weak(self.value, self.epoch, callback) {
            handle_set_weak_on_empty()
        }
    }

    /// Makes the entry strong again. Returns false if it was not weak.
    pub fn clear_weak(&self, isolate: &mut Isolate) -> bool {
        if self.is_empty() {
            return false;
        }
        self.check_owner(isolate);
        isolate.unregister_weak(self.value, self.epoch)
    }

    /// Epochs are only unique within one registry, so a handle must never
    /// reach another isolate's entries.
    fn check_owner(&self, isolate: &Isolate) {
        if !isolate.persistents.owns(self) {
            handle_foreign_isolate()
        }
    }

    fn release(&self) {
        let Some(state) = self.registry.upgrade() else {
            return;
        };
        let released = state.borrow_mut().release(self.value, self.epoch);
        match released {
            Some((count, removed)) => {
                tracing::trace!(value = ?self.value, count, "persistent handle released");
                drop(removed);
            }
            None => {
                tracing::debug!(value = ?self.value, "persistent handle released after its entry was removed");
            }
        }
    }
}

impl Clone for Persistent {
    fn clone(&self) -> Self {
        let registry = self.registry.upgrade().and_then(|state| {
            let mut state = state.borrow_mut();
            let entry = state.live_entry(self.value, self.epoch)?;
            entry.count += 1;
            Some(self.registry.clone())
        });
        Self {
            value: self.value,
            epoch: self.epoch,
            registry: registry.unwrap_or_default(),
        }
    }
}

impl Drop for Persistent {
    fn drop(&mut self) {
        self.release();
    }
}

impl core::fmt::Debug for Persistent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Persistent")
            .field("value", &self.value)
            .field("alive", &!self.is_empty())
            .finish()
    }
}

/// Handed to a weak callback while the collection that found its value
/// unreachable is still running. The value stays valid for the duration of
/// the callback.
pub struct WeakCallbackInfo<'a> {
    isolate: &'a mut Isolate,
    value: EngineValue,
    epoch: u64,
}

impl<'a> WeakCallbackInfo<'a> {
    pub(crate) fn new(isolate: &'a mut Isolate, value: EngineValue, epoch: u64) -> Self {
        Self {
            isolate,
            value,
            epoch,
        }
    }

    pub fn isolate(&mut self) -> &mut Isolate {
        self.isolate
    }

    pub fn value(&self) -> EngineValue {
        self.value
    }

    /// Registers a new callback, keeping the entry for one more collection.
    pub fn revive<P: 'static>(&mut self, parameter: P, callback: fn(&mut WeakCallbackInfo<'_>, P)) {
        let callback: WeakCallback = Box::new(move |info| callback(info, parameter));
        if !self.isolate.register_weak(self.value, self.epoch, callback) {
            tracing::warn!(value = ?self.value, "weak entry released before it could be revived");
        }
    }
}

#[cold]
#[inline(never)]
fn handle_set_weak_on_empty() -> ! {
    tracing::error!("set_weak called on an empty persistent handle");
    panic!("Attempted to make an empty Persistent weak")
}

#[cold]
#[inline(never)]
fn handle_foreign_isolate() -> ! {
    tracing::error!("persistent handle used with an isolate that did not create it");
    panic!("Persistent used with an isolate that does not own it")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(raw: u64) -> EngineValue {
        EngineValue::from_raw(NonZeroU64::new(raw).unwrap())
    }

    #[test]
    fn count_reaches_zero_once() {
        let registry = PersistentRegistry::default();
        let first = registry.promote(value(1));
        let second = registry.promote(value(1));
        assert_eq!(registry.count(value(1)), 2);

        drop(first);
        assert_eq!(registry.count(value(1)), 1);
        drop(second);
        assert_eq!(registry.count(value(1)), 0);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn stale_handle_does_not_release_new_entry() {
        let registry = PersistentRegistry::default();
        let mut old = registry.promote(value(1));
        let _ = registry.clear();
        assert!(old.is_empty());

        let fresh = registry.promote(value(1));
        old.reset();
        assert_eq!(registry.count(value(1)), 1);
        assert_eq!(fresh.get(), Some(value(1)));
    }

    #[test]
    fn registry_owns_only_its_own_handles() {
        let registry = PersistentRegistry::default();
        let other = PersistentRegistry::default();
        let mine = registry.promote(value(1));
        let theirs = other.promote(value(1));
        assert_eq!(mine.epoch, theirs.epoch);
        assert!(registry.owns(&mine));
        assert!(!registry.owns(&theirs));
        assert!(registry.owns(&mine.clone()));
    }

    #[test]
    fn clone_adds_a_count() {
        let registry = PersistentRegistry::default();
        let handle = registry.promote(value(4));
        let copy = handle.clone();
        assert_eq!(registry.count(value(4)), 2);
        drop(handle);
        assert_eq!(copy.get(), Some(value(4)));
    }

    #[test]
    fn weak_entries_are_not_roots() {
        let registry = PersistentRegistry::default();
        let strong = registry.promote(value(1));
        let weak = registry.promote(value(2));
        let finalizer = registry
            .set_weak(value(2), weak.epoch, Box::new(|_| {}))
            .unwrap();

        let mut roots = Vec::new();
        registry.append_roots(&mut roots);
        assert_eq!(roots, vec![value(1)]);

        let stale = Finalization {
            value: value(2),
            finalizer: FinalizerId::from_raw(NonZeroU64::MAX),
        };
        assert!(registry.take_weak_callback(stale).is_none());
        let due = Finalization {
            value: value(2),
            finalizer,
        };
        let (epoch, _callback) = registry.take_weak_callback(due).unwrap();
        assert!(!registry.finish_finalization(value(2), epoch));
        assert!(weak.is_empty());
        assert!(!strong.is_empty());
    }

    #[test]
    fn released_weak_entry_is_reported_for_unregistration() {
        let registry = PersistentRegistry::default();
        let weak = registry.promote(value(3));
        registry.set_weak(value(3), weak.epoch, Box::new(|_| {}));
        drop(weak);
        assert_eq!(registry.take_released_finalizers(), vec![value(3)]);
        assert!(registry.take_released_finalizers().is_empty());
    }
}
