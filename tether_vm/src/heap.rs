// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ## Reference VM
//!
//! A small mark-and-sweep heap implementing the collaborator interfaces. It
//! exists so the bridge can be driven end to end without a real script VM.
//! Cells never move: a reclaimed cell's slot is reused with a bumped
//! generation so stale [`EngineValue`]s can be told apart from live ones.

mod heap_data;
mod heap_gc;

use core::num::NonZeroU64;

use ahash::AHashMap;
use wtf8::Wtf8Buf;

use self::{
    heap_data::{ErrorHeapData, HeapData, ObjectHeapData, ProxyHeapData, SymbolHeapData},
    heap_gc::heap_gc,
};
use crate::vm::{
    EngineGc, EngineValue, EngineValues, Finalization, FinalizerId, ValuePayload, ValueTag,
};

#[derive(Debug, Default)]
pub struct Heap {
    entries: Vec<HeapEntry>,
    free_list: Vec<u32>,
    finalizers: AHashMap<EngineValue, FinalizerId>,
    collections: usize,
}

#[derive(Debug)]
struct HeapEntry {
    generation: u32,
    data: Option<HeapData>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            ..Default::default()
        }
    }

    /// Number of cells currently holding a value.
    pub fn live_count(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    /// Number of collections run so far.
    pub fn collections(&self) -> usize {
        self.collections
    }

    /// Number of values with a pending finalizer registration.
    pub fn pending_finalizers(&self) -> usize {
        self.finalizers.len()
    }

    fn allocate(&mut self, data: HeapData) -> EngineValue {
        if let Some(index) = self.free_list.pop() {
            let entry = &mut self.entries[index as usize];
            debug_assert!(entry.data.is_none());
            entry.data = Some(data);
            return encode(index, entry.generation);
        }
        let index = self.entries.len();
        let Some(index) = u32::try_from(index).ok().filter(|&index| index < u32::MAX) else {
            handle_heap_overflow()
        };
        self.entries.push(HeapEntry {
            generation: 0,
            data: Some(data),
        });
        encode(index, 0)
    }

    fn resolve_in(entries: &[HeapEntry], value: EngineValue) -> Option<usize> {
        let (index, generation) = decode(value);
        let entry = entries.get(index)?;
        (entry.generation == generation && entry.data.is_some()).then_some(index)
    }

    fn data(&self, value: EngineValue) -> &HeapData {
        let Some(index) = Self::resolve_in(&self.entries, value) else {
            handle_reclaimed_value_access(value)
        };
        match self.entries[index].data.as_ref() {
            Some(data) => data,
            None => handle_reclaimed_value_access(value),
        }
    }

    fn data_mut(&mut self, value: EngineValue) -> &mut HeapData {
        let Some(index) = Self::resolve_in(&self.entries, value) else {
            handle_reclaimed_value_access(value)
        };
        match self.entries[index].data.as_mut() {
            Some(data) => data,
            None => handle_reclaimed_value_access(value),
        }
    }

    fn same_key(&self, a: EngineValue, b: EngineValue) -> bool {
        if a == b {
            return true;
        }
        match (self.data(a).as_string(), self.data(b).as_string()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Resolves a proxy chain down to the object holding properties.
    fn property_holder(&self, mut object: EngineValue) -> EngineValue {
        while let HeapData::Proxy(data) = self.data(object) {
            object = data.target;
        }
        object
    }
}

fn encode(index: u32, generation: u32) -> EngineValue {
    let raw = (u64::from(generation) << 32) | (u64::from(index) + 1);
    match NonZeroU64::new(raw) {
        Some(raw) => EngineValue::from_raw(raw),
        None => unreachable!(),
    }
}

fn decode(value: EngineValue) -> (usize, u32) {
    let raw = value.into_raw().get();
    let index = (raw & u64::from(u32::MAX)) - 1;
    (index as usize, (raw >> 32) as u32)
}

fn number_to_string(value: f64) -> String {
    let mut buffer = ryu_js::Buffer::new();
    buffer.format(value).to_string()
}

impl EngineValues for Heap {
    fn create_value(&mut self, payload: ValuePayload<'_>) -> EngineValue {
        let data = match payload {
            ValuePayload::Undefined => HeapData::Undefined,
            ValuePayload::Null => HeapData::Null,
            ValuePayload::Boolean(value) => HeapData::Boolean(value),
            ValuePayload::Number(value) => HeapData::Number(value),
            ValuePayload::String(value) => HeapData::String(Wtf8Buf::from_str(value)),
            ValuePayload::Symbol { description } => HeapData::Symbol(SymbolHeapData {
                descriptor: description.map(Wtf8Buf::from_str),
            }),
            ValuePayload::Object { prototype } => HeapData::Object(ObjectHeapData {
                prototype,
                ..Default::default()
            }),
            ValuePayload::Error { kind, message } => HeapData::Error(ErrorHeapData {
                kind,
                message: Wtf8Buf::from_str(message),
                object: ObjectHeapData::default(),
            }),
            ValuePayload::Proxy { target, traps } => {
                HeapData::Proxy(ProxyHeapData { target, traps })
            }
        };
        self.allocate(data)
    }

    fn tag(&self, value: EngineValue) -> ValueTag {
        self.data(value).tag()
    }

    fn to_display_string(&self, value: EngineValue) -> String {
        match self.data(value) {
            HeapData::Undefined => "undefined".to_string(),
            HeapData::Null => "null".to_string(),
            HeapData::Boolean(value) => value.to_string(),
            HeapData::Number(value) => number_to_string(*value),
            HeapData::String(data) => data.to_string_lossy().into_owned(),
            HeapData::Symbol(data) => match &data.descriptor {
                Some(descriptor) => format!("Symbol({})", descriptor.to_string_lossy()),
                None => "Symbol()".to_string(),
            },
            HeapData::Object(_) | HeapData::Proxy(_) => "[object Object]".to_string(),
            HeapData::Error(data) => {
                let message = data.message.to_string_lossy();
                if message.is_empty() {
                    data.kind.name().to_string()
                } else {
                    format!("{}: {}", data.kind.name(), message)
                }
            }
        }
    }

    fn get(&self, object: EngineValue, key: EngineValue) -> Option<EngineValue> {
        let holder = self.property_holder(object);
        let properties = self.data(holder).properties()?;
        properties
            .keys
            .iter()
            .position(|&existing| self.same_key(existing, key))
            .map(|index| properties.values[index])
    }

    fn set(&mut self, object: EngineValue, key: EngineValue, value: EngineValue) -> bool {
        let holder = self.property_holder(object);
        let existing = match self.data(holder).properties() {
            Some(properties) => properties
                .keys
                .iter()
                .position(|&existing| self.same_key(existing, key)),
            None => return false,
        };
        let Some(properties) = self.data_mut(holder).properties_mut() else {
            return false;
        };
        match existing {
            Some(index) => properties.values[index] = value,
            None => {
                properties.keys.push(key);
                properties.values.push(value);
            }
        }
        true
    }

    fn get_prototype_of(&self, object: EngineValue) -> Option<EngineValue> {
        match self.data(object) {
            HeapData::Object(data) => data.prototype,
            HeapData::Proxy(data) => match data.traps.get_prototype_of {
                Some(prototype) => Some(prototype),
                None => self.get_prototype_of(data.target),
            },
            _ => None,
        }
    }
}

impl EngineGc for Heap {
    fn register_finalizer(&mut self, value: EngineValue, finalizer: Option<FinalizerId>) {
        if Self::resolve_in(&self.entries, value).is_none() {
            handle_reclaimed_value_access(value)
        }
        match finalizer {
            Some(finalizer) => {
                self.finalizers.insert(value, finalizer);
            }
            None => {
                self.finalizers.remove(&value);
            }
        }
    }

    fn run_collection(&mut self, roots: &[EngineValue]) -> Vec<Finalization> {
        heap_gc(self, roots)
    }

    fn is_live(&self, value: EngineValue) -> bool {
        Self::resolve_in(&self.entries, value).is_some()
    }
}

#[cold]
#[inline(never)]
fn handle_reclaimed_value_access(value: EngineValue) -> ! {
    panic!("Attempted to access reclaimed value {value:?}")
}

#[cold]
#[inline(never)]
fn handle_heap_overflow() -> ! {
    panic!("Heap entries overflowed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ExceptionType, ProxyTraps};

    #[test]
    fn unrooted_values_are_reclaimed() {
        let mut heap = Heap::new();
        let kept = heap.create_value(ValuePayload::Object { prototype: None });
        let dropped = heap.create_value(ValuePayload::String("temporary"));
        assert_eq!(heap.live_count(), 2);

        let due = heap.run_collection(&[kept]);
        assert!(due.is_empty());
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.collections(), 1);
    }

    #[test]
    fn reused_slots_do_not_revive_stale_values() {
        let mut heap = Heap::new();
        let first = heap.create_value(ValuePayload::Number(1.0));
        heap.run_collection(&[]);
        let second = heap.create_value(ValuePayload::Number(2.0));
        assert_ne!(first, second);
        assert!(!heap.is_live(first));
        assert!(heap.is_live(second));
    }

    #[test]
    fn properties_keep_their_values_alive() {
        let mut heap = Heap::new();
        let object = heap.create_value(ValuePayload::Object { prototype: None });
        let key = heap.create_value(ValuePayload::String("key"));
        let value = heap.create_value(ValuePayload::String("value"));
        assert!(heap.set(object, key, value));

        heap.run_collection(&[object]);
        assert!(heap.is_live(value));

        let lookup = heap.create_value(ValuePayload::String("key"));
        assert_eq!(heap.get(object, lookup), Some(value));
    }

    #[test]
    fn finalizable_values_survive_the_reporting_pass() {
        let mut heap = Heap::new();
        let object = heap.create_value(ValuePayload::Object { prototype: None });
        let finalizer = FinalizerId::from_raw(NonZeroU64::MIN);
        heap.register_finalizer(object, Some(finalizer));

        let due = heap.run_collection(&[]);
        assert_eq!(due, vec![Finalization { value: object, finalizer }]);
        assert!(heap.is_live(object));
        assert_eq!(heap.pending_finalizers(), 0);

        assert!(heap.run_collection(&[]).is_empty());
        assert!(!heap.is_live(object));
    }

    #[test]
    fn proxy_get_prototype_of_trap() {
        let mut heap = Heap::new();
        let global = heap.create_value(ValuePayload::Object { prototype: None });
        let proxy = heap.create_value(ValuePayload::Proxy {
            target: global,
            traps: ProxyTraps {
                get_prototype_of: Some(global),
            },
        });
        assert_eq!(heap.tag(proxy), ValueTag::Proxy);
        assert_eq!(heap.get_prototype_of(proxy), Some(global));

        heap.run_collection(&[proxy]);
        assert!(heap.is_live(global));
    }

    #[test]
    fn display_strings() {
        let mut heap = Heap::new();
        let error = heap.create_value(ValuePayload::Error {
            kind: ExceptionType::TypeError,
            message: "boom",
        });
        let number = heap.create_value(ValuePayload::Number(42.0));
        let symbol = heap.create_value(ValuePayload::Symbol {
            description: Some("tag"),
        });
        assert_eq!(heap.to_display_string(error), "TypeError: boom");
        assert_eq!(heap.to_display_string(number), "42");
        assert_eq!(heap.to_display_string(symbol), "Symbol(tag)");
    }

    #[test]
    #[should_panic(expected = "Attempted to access reclaimed value")]
    fn reclaimed_access_is_fatal() {
        let mut heap = Heap::new();
        let value = heap.create_value(ValuePayload::Null);
        heap.run_collection(&[]);
        heap.tag(value);
    }
}
