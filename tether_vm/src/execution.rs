// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod atomic_cache;
mod context;
mod current;
mod isolate;
mod options;

pub use atomic_cache::{AtomicValueCache, CachedString, CachedSymbol};
pub use context::{Context, ContextScope, MAX_EMBEDDER_DATA_SLOTS};
pub use isolate::{EternalIndex, Isolate, IsolateId, IsolateState};
pub use options::{
    ArrayBufferAllocator, CreateParams, DefaultArrayBufferAllocator, Options, TraceCategory,
};
