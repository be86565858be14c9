// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-thread stack of entered isolates. Only this module touches the
//! thread-local; everything else is handed an [`Isolate`](super::Isolate)
//! explicitly and asks it about its own entry state.

use std::cell::RefCell;

use super::IsolateId;

thread_local! {
    static ENTERED_ISOLATES: RefCell<Vec<IsolateId>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn push(id: IsolateId) {
    ENTERED_ISOLATES.with_borrow_mut(|stack| stack.push(id));
}

/// Pops `id` if it is the innermost entered isolate.
pub(crate) fn pop(id: IsolateId) -> bool {
    ENTERED_ISOLATES.with_borrow_mut(|stack| {
        if stack.last() == Some(&id) {
            stack.pop();
            true
        } else {
            false
        }
    })
}

pub(crate) fn current() -> Option<IsolateId> {
    ENTERED_ISOLATES.with_borrow(|stack| stack.last().copied())
}

/// Drops every frame `id` holds on this thread's stack.
pub(crate) fn remove_all(id: IsolateId) -> usize {
    ENTERED_ISOLATES.with_borrow_mut(|stack| {
        let before = stack.len();
        stack.retain(|&entered| entered != id);
        before - stack.len()
    })
}
