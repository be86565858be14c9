// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recoverable errors. Protocol violations never surface here: they are
//! fatal at the point they are detected.

/// Errors produced while parsing embedder flags into [`Options`](crate::Options).
#[derive(Debug, thiserror::Error)]
pub enum FlagsError {
    /// Unknown flags, missing `=` values and values of the wrong type.
    #[error(transparent)]
    Syntax(#[from] clap::Error),

    /// A `--trace-call` id that names no trace category.
    #[error("unknown trace id: {0}")]
    UnknownTraceId(String),

    #[error("invalid value for --{flag}: {value}")]
    InvalidValue { flag: &'static str, value: String },
}
