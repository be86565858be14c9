// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::rc::Rc;

use ahash::AHashSet;
use clap::Parser;

use crate::error::FlagsError;

/// Subsystems whose calls can be traced with `--trace-call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceCategory {
    Isolate,
    HandleScope,
    Persistent,
    TryCatch,
    Context,
}

impl TraceCategory {
    pub const ALL: [TraceCategory; 5] = [
        Self::Isolate,
        Self::HandleScope,
        Self::Persistent,
        Self::TryCatch,
        Self::Context,
    ];

    pub const fn id(self) -> &'static str {
        match self {
            Self::Isolate => "ISOLATE",
            Self::HandleScope => "HDLSCOPE",
            Self::Persistent => "PERSISTENT",
            Self::TryCatch => "TRYCATCH",
            Self::Context => "CONTEXT",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|category| category.id().eq_ignore_ascii_case(id))
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub trace_call: bool,
    /// When non-empty, only these categories are traced.
    pub trace_call_ids: AHashSet<TraceCategory>,
    /// Never traced, even if listed in `trace_call_ids`.
    pub trace_call_excluded_ids: AHashSet<TraceCategory>,
    pub trace_gc: bool,
    /// Upper bound on collections run while waiting for finalizers to settle.
    pub max_finalization_passes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            trace_call: false,
            trace_call_ids: AHashSet::default(),
            trace_call_excluded_ids: AHashSet::default(),
            trace_gc: false,
            max_finalization_passes: Self::DEFAULT_MAX_FINALIZATION_PASSES,
        }
    }
}

/// Command-line shape of the embedder flags.
#[derive(Debug, Parser)]
#[command(no_binary_name = true, disable_help_flag = true, disable_version_flag = true)]
struct Flags {
    #[arg(
        long = "trace-call",
        num_args = 0..,
        value_delimiter = ',',
        require_equals = true,
        allow_hyphen_values = true
    )]
    trace_call: Option<Vec<String>>,

    #[arg(long = "trace-gc")]
    trace_gc: bool,

    #[arg(long = "max-finalization-passes", require_equals = true)]
    max_finalization_passes: Option<usize>,
}

impl Options {
    pub const DEFAULT_MAX_FINALIZATION_PASSES: usize = 16;

    /// Parses embedder flags:
    ///
    /// - `--trace-call` traces every category; `--trace-call=HDLSCOPE,ISOLATE`
    ///   only the listed ones. A leading `-` excludes a category instead.
    /// - `--trace-gc` logs collection summaries at info level.
    /// - `--max-finalization-passes=N` bounds finalize-until-settled loops.
    pub fn parse_flags<I, S>(args: I) -> Result<Self, FlagsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let flags = Flags::try_parse_from(args.into_iter().map(|arg| arg.as_ref().to_string()))?;
        let mut options = Self {
            trace_gc: flags.trace_gc,
            ..Self::default()
        };
        if let Some(ids) = flags.trace_call {
            options.trace_call = true;
            for id in ids.iter().filter(|id| !id.is_empty()) {
                let (excluded, id) = match id.strip_prefix('-') {
                    Some(id) => (true, id),
                    None => (false, id.as_str()),
                };
                let Some(category) = TraceCategory::from_id(id) else {
                    return Err(FlagsError::UnknownTraceId(id.to_string()));
                };
                if excluded {
                    options.trace_call_excluded_ids.insert(category);
                } else {
                    options.trace_call_ids.insert(category);
                }
            }
        }
        if let Some(passes) = flags.max_finalization_passes {
            if passes == 0 {
                return Err(FlagsError::InvalidValue {
                    flag: "max-finalization-passes",
                    value: passes.to_string(),
                });
            }
            options.max_finalization_passes = passes;
        }
        Ok(options)
    }

    pub fn is_trace_call_enabled(&self, category: TraceCategory) -> bool {
        if !self.trace_call {
            return false;
        }
        if !self.trace_call_ids.is_empty() && !self.trace_call_ids.contains(&category) {
            return false;
        }
        !self.trace_call_excluded_ids.contains(&category)
    }
}

/// Backing store provider for raw buffers handed to the VM.
pub trait ArrayBufferAllocator: core::fmt::Debug {
    /// Returns zero-filled memory, or `None` if the request cannot be met.
    fn allocate(&self, length: usize) -> Option<Box<[u8]>>;

    fn allocate_uninitialized(&self, length: usize) -> Option<Box<[u8]>> {
        self.allocate(length)
    }

    fn free(&self, data: Box<[u8]>) {
        drop(data);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultArrayBufferAllocator;

impl ArrayBufferAllocator for DefaultArrayBufferAllocator {
    fn allocate(&self, length: usize) -> Option<Box<[u8]>> {
        Some(vec![0; length].into_boxed_slice())
    }
}

/// Configuration attached by [`Isolate::initialize`](crate::Isolate::initialize).
#[derive(Debug, Clone)]
pub struct CreateParams {
    pub array_buffer_allocator: Rc<dyn ArrayBufferAllocator>,
    pub options: Options,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            array_buffer_allocator: Rc::new(DefaultArrayBufferAllocator),
            options: Options::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn trace_call_ids_filter_categories() {
        let options = Options::parse_flags(["--trace-call=HDLSCOPE,isolate,-isolate"]).unwrap();
        assert!(options.is_trace_call_enabled(TraceCategory::HandleScope));
        assert!(!options.is_trace_call_enabled(TraceCategory::Isolate));
        assert!(!options.is_trace_call_enabled(TraceCategory::TryCatch));
    }

    #[test]
    fn bare_trace_call_enables_everything() {
        let options = Options::parse_flags(["--trace-call", "--trace-gc"]).unwrap();
        assert!(options.trace_gc);
        assert!(
            TraceCategory::ALL
                .into_iter()
                .all(|category| options.is_trace_call_enabled(category))
        );
        assert!(!Options::default().is_trace_call_enabled(TraceCategory::Isolate));
    }

    #[test]
    fn finalization_passes_must_be_positive() {
        let options = Options::parse_flags(["--max-finalization-passes=3"]).unwrap();
        assert_eq!(options.max_finalization_passes, 3);
        assert!(matches!(
            Options::parse_flags(["--max-finalization-passes=0"]).unwrap_err(),
            FlagsError::InvalidValue {
                flag: "max-finalization-passes",
                value,
            } if value == "0"
        ));
        assert!(matches!(
            Options::parse_flags(["--max-finalization-passes"]).unwrap_err(),
            FlagsError::Syntax(_)
        ));
        assert!(matches!(
            Options::parse_flags(["--max-finalization-passes=many"]).unwrap_err(),
            FlagsError::Syntax(error) if error.kind() == ErrorKind::ValueValidation
        ));
    }

    #[test]
    fn repeated_trace_call_flags_accumulate() {
        let options =
            Options::parse_flags(["--trace-call=TRYCATCH", "--trace-call=-context,PERSISTENT"])
                .unwrap();
        assert!(options.is_trace_call_enabled(TraceCategory::TryCatch));
        assert!(options.is_trace_call_enabled(TraceCategory::Persistent));
        assert!(!options.is_trace_call_enabled(TraceCategory::Context));
        assert!(!options.is_trace_call_enabled(TraceCategory::Isolate));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(matches!(
            Options::parse_flags(["--expose-everything"]).unwrap_err(),
            FlagsError::Syntax(error) if error.kind() == ErrorKind::UnknownArgument
        ));
        assert_eq!(
            Options::parse_flags(["--trace-call=GC"]).unwrap_err().to_string(),
            "unknown trace id: GC"
        );
        assert!(matches!(
            Options::parse_flags(["trace-gc"]).unwrap_err(),
            FlagsError::Syntax(_)
        ));
    }
}
