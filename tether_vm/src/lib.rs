// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Tether
//!
//! A handle and rooting bridge that lets code written against a handle-based
//! embedding API drive a script VM with its own object model and its own
//! garbage collector. Callers only ever hold opaque handles: scope-bound
//! [`Local`]s and registry-bound [`Persistent`]s. The bridge guarantees that
//! whatever those handles refer to is reported to the VM's collector as a
//! root for exactly as long as the handles are valid.

pub mod engine;
pub mod error;
pub mod exception;
pub mod execution;
#[cfg(feature = "reference-vm")]
pub mod heap;
pub mod vm;

pub use engine::rootable::{
    HandleScope, Local, Persistent, ScopeKind, ScopeToken, WeakCallbackInfo,
};
pub use error::FlagsError;
pub use exception::{
    JsError, JsResult, Message, MessageListenerId, StackTraceData, Throw, TryCatch,
};
pub use execution::{
    ArrayBufferAllocator, CachedString, CachedSymbol, Context, ContextScope, CreateParams,
    DefaultArrayBufferAllocator, EternalIndex, Isolate, IsolateId, IsolateState, Options,
    TraceCategory,
};
pub use vm::{
    Engine, EngineGc, EngineValue, EngineValues, ExceptionType, Finalization, FinalizerId,
    ProxyTraps, ValuePayload, ValueTag,
};
