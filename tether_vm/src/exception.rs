// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ## Script exceptions
//!
//! A script-level throw never unwinds native frames. The collaborator that
//! ran the script reports it as a [`Throw`]; the isolate turns that into an
//! exception object plus a [`Message`] and parks it in its pending slot,
//! where the innermost [`TryCatch`] picks it up.

mod script_exception;
mod try_catch;

pub(crate) use script_exception::ExceptionState;
pub use script_exception::{Message, MessageListenerId, StackTraceData, Throw};
pub use try_catch::TryCatch;

use crate::vm::EngineValue;

pub type JsResult<T> = core::result::Result<T, JsError>;

/// A thrown value, as seen from Rust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsError(EngineValue);

impl JsError {
    pub(crate) fn new(value: EngineValue) -> Self {
        Self(value)
    }

    pub fn value(self) -> EngineValue {
        self.0
    }
}
