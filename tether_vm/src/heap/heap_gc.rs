// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::{Heap, HeapEntry};
use crate::vm::{EngineValue, Finalization};

pub(crate) trait HeapMarkAndSweep {
    fn mark_values(&self, queues: &mut WorkQueues);
}

#[derive(Debug, Default)]
pub(crate) struct WorkQueues {
    values: Vec<EngineValue>,
}

impl WorkQueues {
    pub(crate) fn push_value(&mut self, value: EngineValue) {
        self.values.push(value);
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug)]
struct HeapBits {
    marks: Box<[bool]>,
}

impl HeapBits {
    fn new(heap: &Heap) -> Self {
        Self {
            marks: vec![false; heap.entries.len()].into_boxed_slice(),
        }
    }
}

pub(crate) fn heap_gc(heap: &mut Heap, roots: &[EngineValue]) -> Vec<Finalization> {
    let mut bits = HeapBits::new(heap);
    let mut queues = WorkQueues::default();

    roots.iter().for_each(|&value| queues.push_value(value));
    mark(&heap.entries, &mut bits, &mut queues);

    // Values only reachable through their finalizer registration come due
    // now. They are marked so they survive this pass; the registration is
    // consumed, so a later pass reclaims them unless they are re-registered.
    let mut due = heap
        .finalizers
        .iter()
        .filter_map(|(&value, &finalizer)| {
            let index = Heap::resolve_in(&heap.entries, value)?;
            (!bits.marks[index]).then_some(Finalization { value, finalizer })
        })
        .collect::<Vec<_>>();
    due.sort_by_key(|finalization| finalization.value);
    for finalization in due.iter() {
        heap.finalizers.remove(&finalization.value);
        queues.push_value(finalization.value);
    }
    mark(&heap.entries, &mut bits, &mut queues);

    let reclaimed = sweep(heap, &bits);
    heap.collections += 1;
    tracing::trace!(
        reclaimed,
        due = due.len(),
        live = heap.live_count(),
        "reference heap swept"
    );
    due
}

fn mark(entries: &[HeapEntry], bits: &mut HeapBits, queues: &mut WorkQueues) {
    while !queues.is_empty() {
        let mut values = core::mem::take(&mut queues.values);
        values.sort();
        values.dedup();
        for value in values {
            let Some(index) = Heap::resolve_in(entries, value) else {
                tracing::error!(?value, "collection reached a value that was already reclaimed");
                continue;
            };
            if bits.marks[index] {
                // Already marked, ignore
                continue;
            }
            bits.marks[index] = true;
            if let Some(data) = entries[index].data.as_ref() {
                data.mark_values(queues);
            }
        }
    }
}

fn sweep(heap: &mut Heap, bits: &HeapBits) -> usize {
    let Heap {
        entries, free_list, ..
    } = heap;
    let mut reclaimed = 0;
    for (index, entry) in entries.iter_mut().enumerate() {
        if entry.data.is_some() && !bits.marks[index] {
            entry.data = None;
            entry.generation = entry.generation.wrapping_add(1);
            // Entries never exceed u32 indexes, see Heap::allocate.
            free_list.push(index as u32);
            reclaimed += 1;
        }
    }
    reclaimed
}
