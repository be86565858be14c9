// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![cfg(feature = "reference-vm")]

use std::{cell::Cell, rc::Rc};

use tether_vm::{
    CreateParams, EngineValue, Isolate, Persistent, ScopeKind, ValuePayload, WeakCallbackInfo,
    heap::Heap,
};

fn new_isolate() -> Isolate {
    Isolate::new(Box::new(Heap::new()), CreateParams::default())
}

/// Creates an object that nothing but the returned handle keeps alive.
fn new_persistent_object(isolate: &mut Isolate) -> (Persistent, EngineValue) {
    let token = isolate.enter_scope(ScopeKind::Normal);
    let local = isolate.new_value(ValuePayload::Object { prototype: None });
    let persistent = isolate.promote(local);
    let value = isolate.value(local);
    isolate.exit_scope(token);
    (persistent, value)
}

fn count_calls(_info: &mut WeakCallbackInfo<'_>, calls: Rc<Cell<usize>>) {
    calls.set(calls.get() + 1);
}

#[test]
fn entry_is_removed_when_count_reaches_zero() {
    let mut isolate = new_isolate();
    let token = isolate.enter_scope(ScopeKind::Normal);
    let local = isolate.new_value(ValuePayload::String("v"));
    let value = isolate.value(local);

    let first = isolate.promote(local);
    let second = isolate.promote(local);
    assert_eq!(isolate.persistent_count(value), 2);

    drop(first);
    assert_eq!(isolate.persistent_count(value), 1);
    assert_eq!(isolate.persistent_registry_len(), 1);
    drop(second);
    assert_eq!(isolate.persistent_count(value), 0);
    assert_eq!(isolate.persistent_registry_len(), 0);
    isolate.exit_scope(token);
}

#[test]
fn persistent_outlives_its_scope() {
    let mut isolate = new_isolate();
    let (persistent, value) = new_persistent_object(&mut isolate);
    isolate.collect_garbage();
    assert!(isolate.vm().is_live(value));

    let token = isolate.enter_scope(ScopeKind::Normal);
    let local = persistent.to_local(&mut isolate).unwrap();
    assert_eq!(isolate.value(local), value);
    isolate.exit_scope(token);

    drop(persistent);
    isolate.collect_garbage();
    assert!(!isolate.vm().is_live(value));
}

#[test]
fn clone_and_reset_balance_counts() {
    let mut isolate = new_isolate();
    let (mut persistent, value) = new_persistent_object(&mut isolate);
    let copy = persistent.clone();
    assert_eq!(isolate.persistent_count(value), 2);

    persistent.reset();
    assert!(persistent.is_empty());
    assert_eq!(isolate.persistent_count(value), 1);
    persistent.reset();
    assert_eq!(isolate.persistent_count(value), 1);
    assert_eq!(copy.get(), Some(value));
}

#[test]
fn weak_callback_fires_at_most_once() {
    let mut isolate = new_isolate();
    let calls = Rc::new(Cell::new(0));
    let (persistent, value) = new_persistent_object(&mut isolate);
    persistent.set_weak(&mut isolate, calls.clone(), count_calls);
    assert!(persistent.is_weak());
    assert!(isolate.is_weak(value));

    assert_eq!(isolate.collect_garbage(), 1);
    assert_eq!(calls.get(), 1);
    assert!(persistent.is_empty());

    assert_eq!(isolate.collect_garbage(), 0);
    assert_eq!(calls.get(), 1);
    assert!(!isolate.vm().is_live(value));
}

#[test]
fn revived_entry_is_finalized_once_more() {
    fn revive_once(info: &mut WeakCallbackInfo<'_>, calls: Rc<Cell<usize>>) {
        calls.set(calls.get() + 1);
        if calls.get() == 1 {
            info.revive(calls, revive_once);
        }
    }

    let mut isolate = new_isolate();
    let calls = Rc::new(Cell::new(0));
    let (persistent, value) = new_persistent_object(&mut isolate);
    persistent.set_weak(&mut isolate, calls.clone(), revive_once);

    assert_eq!(isolate.collect_garbage(), 1);
    assert!(!persistent.is_empty());
    assert!(isolate.vm().is_live(value));

    assert_eq!(isolate.collect_garbage(), 1);
    assert_eq!(calls.get(), 2);
    assert!(persistent.is_empty());
    assert_eq!(isolate.collect_garbage(), 0);
    assert!(!isolate.vm().is_live(value));
}

#[test]
fn weak_callback_can_read_its_value() {
    fn check_value(info: &mut WeakCallbackInfo<'_>, seen: Rc<Cell<Option<EngineValue>>>) {
        let value = info.value();
        assert_eq!(info.isolate().vm().to_display_string(value), "[object Object]");
        seen.set(Some(value));
    }

    let mut isolate = new_isolate();
    let seen = Rc::new(Cell::new(None));
    let (persistent, value) = new_persistent_object(&mut isolate);
    persistent.set_weak(&mut isolate, seen.clone(), check_value);
    isolate.collect_garbage();
    assert_eq!(seen.get(), Some(value));
}

#[test]
fn clear_weak_makes_the_entry_strong_again() {
    let mut isolate = new_isolate();
    let calls = Rc::new(Cell::new(0));
    let (persistent, value) = new_persistent_object(&mut isolate);
    persistent.set_weak(&mut isolate, calls.clone(), count_calls);

    assert!(persistent.clear_weak(&mut isolate));
    assert!(!persistent.clear_weak(&mut isolate));
    assert_eq!(isolate.collect_all_garbage(), 0);
    assert_eq!(calls.get(), 0);
    assert!(isolate.vm().is_live(value));
    assert!(!persistent.is_empty());
}

#[test]
fn weak_value_reachable_from_a_root_is_not_finalized() {
    let mut isolate = new_isolate();
    let calls = Rc::new(Cell::new(0));
    let (holder, holder_value) = new_persistent_object(&mut isolate);
    let (child, child_value) = new_persistent_object(&mut isolate);
    child.set_weak(&mut isolate, calls.clone(), count_calls);

    let token = isolate.enter_scope(ScopeKind::Normal);
    let key = isolate.new_value(ValuePayload::String("child"));
    let key = isolate.value(key);
    assert!(isolate.vm_mut().set(holder_value, key, child_value));
    isolate.exit_scope(token);

    assert_eq!(isolate.collect_garbage(), 0);
    drop(holder);
    assert_eq!(isolate.collect_garbage(), 1);
    assert_eq!(calls.get(), 1);
}

#[test]
fn dropping_a_weak_handle_cancels_its_callback() {
    let mut isolate = new_isolate();
    let calls = Rc::new(Cell::new(0));
    let (persistent, value) = new_persistent_object(&mut isolate);
    persistent.set_weak(&mut isolate, calls.clone(), count_calls);
    drop(persistent);

    assert_eq!(isolate.collect_all_garbage(), 0);
    assert_eq!(calls.get(), 0);
    assert!(!isolate.vm().is_live(value));
}

#[test]
fn handles_are_emptied_by_dispose() {
    let mut isolate = new_isolate();
    let (persistent, _) = new_persistent_object(&mut isolate);
    isolate.dispose();
    assert!(persistent.is_empty());
    assert!(!persistent.is_weak());
    drop(persistent);
}

#[test]
#[should_panic(expected = "Attempted to make an empty Persistent weak")]
fn set_weak_on_a_reset_handle_is_fatal() {
    let mut isolate = new_isolate();
    let (mut persistent, _) = new_persistent_object(&mut isolate);
    persistent.reset();
    persistent.set_weak(&mut isolate, Rc::new(Cell::new(0)), count_calls);
}

#[test]
#[should_panic(expected = "Persistent used with an isolate that does not own it")]
fn set_weak_through_another_isolate_is_fatal() {
    let mut first = new_isolate();
    let mut second = new_isolate();
    let (_first_handle, first_value) = new_persistent_object(&mut first);
    let (second_handle, second_value) = new_persistent_object(&mut second);
    assert_eq!(first_value, second_value);
    second_handle.set_weak(&mut first, Rc::new(Cell::new(0)), count_calls);
}

#[test]
#[should_panic(expected = "Persistent used with an isolate that does not own it")]
fn to_local_through_another_isolate_is_fatal() {
    let mut first = new_isolate();
    let mut second = new_isolate();
    let (first_handle, _) = new_persistent_object(&mut first);
    let token = second.enter_scope(ScopeKind::Normal);
    first_handle.to_local(&mut second);
    second.exit_scope(token);
}

#[test]
fn foreign_handle_leaves_the_other_registry_alone() {
    let mut first = new_isolate();
    let mut second = new_isolate();
    let (first_handle, _) = new_persistent_object(&mut first);
    let (second_handle, _) = new_persistent_object(&mut second);

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        second_handle.clear_weak(&mut first)
    }));
    assert!(result.is_err());
    first.collect_all_garbage();
    assert!(!first_handle.is_empty());
    assert!(!first_handle.is_weak());
}
