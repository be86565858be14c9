// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![cfg(feature = "reference-vm")]

use tether_vm::{
    ContextScope, CreateParams, HandleScope, Isolate, ScopeKind, ValuePayload, ValueTag,
    execution::MAX_EMBEDDER_DATA_SLOTS, heap::Heap,
};

fn new_isolate() -> Isolate {
    Isolate::new(Box::new(Heap::new()), CreateParams::default())
}

#[test]
fn global_proxy_exposes_the_global_as_its_prototype() {
    let mut isolate = new_isolate();
    let context = isolate.new_context(None);
    let mut scope = HandleScope::new(&mut isolate);
    let proxy = scope.context_global(context);
    let proxy = scope.value(proxy);
    let global = scope.context_global_object(context);
    let global = scope.value(global);

    assert_ne!(proxy, global);
    assert_eq!(scope.vm().tag(proxy), ValueTag::Proxy);
    assert_eq!(scope.vm().tag(global), ValueTag::Object);
    assert_eq!(scope.vm().get_prototype_of(proxy), Some(global));
    assert_eq!(scope.vm().get_prototype_of(global), None);
}

#[test]
fn template_becomes_the_prototype_of_the_global() {
    let mut isolate = new_isolate();
    let mut scope = HandleScope::new(&mut isolate);
    let template = scope.new_value(ValuePayload::Object { prototype: None });
    let context = scope.new_context(Some(template));
    let global = scope.context_global_object(context);
    let global = scope.value(global);
    let template = scope.value(template);
    assert_eq!(scope.vm().get_prototype_of(global), Some(template));
}

#[test]
fn properties_set_through_the_proxy_land_on_the_global() {
    let mut isolate = new_isolate();
    let context = isolate.new_context(None);
    let mut scope = HandleScope::new(&mut isolate);
    let proxy = scope.context_global(context);
    let proxy = scope.value(proxy);
    let key = scope.new_value(ValuePayload::String("answer"));
    let key = scope.value(key);
    let value = scope.new_value(ValuePayload::Number(42.0));
    let value = scope.value(value);

    assert!(scope.vm_mut().set(proxy, key, value));
    let global = scope.context_global_object(context);
    let global = scope.value(global);
    assert_eq!(scope.vm().get(global, key), Some(value));
}

#[test]
fn context_scopes_nest() {
    let mut isolate = new_isolate();
    let first = isolate.new_context(None);
    let second = isolate.new_context(None);
    assert_eq!(isolate.current_context(), None);
    {
        let mut outer = ContextScope::new(&mut isolate, first);
        assert_eq!(outer.current_context(), Some(first));
        {
            let inner = ContextScope::new(&mut outer, second);
            assert_eq!(inner.context(), second);
            assert_eq!(inner.current_context(), Some(second));
            assert_eq!(inner.entered_context_depth(), 2);
        }
        assert_eq!(outer.current_context(), Some(first));
    }
    assert_eq!(isolate.entered_context_depth(), 0);
}

#[test]
fn disposed_context_is_collected() {
    let mut isolate = new_isolate();
    let context = isolate.new_context(None);
    let token = isolate.enter_scope(ScopeKind::Normal);
    let proxy = isolate.context_global(context);
    let proxy = isolate.value(proxy);
    let global = isolate.context_global_object(context);
    let global = isolate.value(global);
    isolate.exit_scope(token);

    isolate.collect_garbage();
    assert!(isolate.vm().is_live(proxy));
    assert!(isolate.vm().is_live(global));

    isolate.dispose_context(context);
    assert!(!isolate.is_context_alive(context));
    assert_eq!(isolate.context_count(), 0);
    isolate.collect_garbage();
    assert!(!isolate.vm().is_live(proxy));
    assert!(!isolate.vm().is_live(global));

    let reused = isolate.new_context(None);
    assert_ne!(reused, context);
    assert!(isolate.is_context_alive(reused));
}

#[test]
fn embedder_data_grows_on_demand() {
    let mut isolate = new_isolate();
    let context = isolate.new_context(None);
    let mut scope = HandleScope::new(&mut isolate);
    let value = scope.new_value(ValuePayload::String("slot three"));
    scope.set_embedder_data(context, 3, value);

    assert!(scope.get_embedder_data(context, 0).is_none());
    assert!(scope.get_embedder_data(context, 9).is_none());
    let stored = scope.get_embedder_data(context, 3).unwrap();
    let stored = scope.value(stored);
    assert_eq!(scope.vm().to_display_string(stored), "slot three");
}

#[test]
#[should_panic(expected = "Context exited out of order")]
fn exiting_a_non_current_context_is_fatal() {
    let mut isolate = new_isolate();
    let first = isolate.new_context(None);
    let second = isolate.new_context(None);
    isolate.enter_context(first);
    isolate.enter_context(second);
    isolate.exit_context(first);
}

#[test]
#[should_panic(expected = "Cannot dispose an entered Context")]
fn disposing_an_entered_context_is_fatal() {
    let mut isolate = new_isolate();
    let context = isolate.new_context(None);
    let mut scope = ContextScope::new(&mut isolate, context);
    scope.dispose_context(context);
}

#[test]
#[should_panic(expected = "Attempted to use a disposed Context")]
fn using_a_disposed_context_is_fatal() {
    let mut isolate = new_isolate();
    let context = isolate.new_context(None);
    isolate.dispose_context(context);
    isolate.enter_context(context);
}

#[test]
#[should_panic(expected = "Embedder data index out of range")]
fn embedder_data_index_past_the_limit_is_fatal() {
    let mut isolate = new_isolate();
    let context = isolate.new_context(None);
    let mut scope = HandleScope::new(&mut isolate);
    let value = scope.new_value(ValuePayload::Null);
    scope.set_embedder_data(context, usize::MAX, value);
}

#[test]
fn last_embedder_data_slot_is_usable() {
    let mut isolate = new_isolate();
    let context = isolate.new_context(None);
    let mut scope = HandleScope::new(&mut isolate);
    let value = scope.new_value(ValuePayload::Boolean(true));
    let last = MAX_EMBEDDER_DATA_SLOTS - 1;
    scope.set_embedder_data(context, last, value);
    let stored = scope.get_embedder_data(context, last).unwrap();
    let stored = scope.value(stored);
    assert_eq!(scope.vm().to_display_string(stored), "true");
}
