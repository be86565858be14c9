// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ## Collaborator interfaces
//!
//! The bridge never looks inside the underlying VM. Everything it needs is
//! expressed through [`EngineValues`] (value creation and inspection) and
//! [`EngineGc`] (finalizer registration and forced collection). A VM is
//! plugged into an [`Isolate`](crate::Isolate) as a `Box<dyn Engine>`.

use core::{fmt::Debug, num::NonZeroU64};

/// Opaque reference into the VM's heap.
///
/// Equality is identity: two `EngineValue`s are equal exactly when they refer
/// to the same heap cell. The VM's collector owns the cell; the bridge never
/// frees it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct EngineValue(NonZeroU64);

impl EngineValue {
    #[inline]
    pub const fn from_raw(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn into_raw(self) -> NonZeroU64 {
        self.0
    }
}

impl Debug for EngineValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EngineValue({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTag {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Error,
    Proxy,
}

impl ValueTag {
    pub const fn is_object(self) -> bool {
        matches!(self, Self::Object | Self::Error | Self::Proxy)
    }

    pub const fn is_primitive(self) -> bool {
        !self.is_object()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionType {
    Error,
    EvalError,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    UriError,
}

impl ExceptionType {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::EvalError => "EvalError",
            Self::RangeError => "RangeError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
            Self::TypeError => "TypeError",
            Self::UriError => "URIError",
        }
    }
}

/// Proxy handler traps the bridge relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyTraps {
    /// When set, `getPrototypeOf` on the proxy returns this value instead of
    /// forwarding to the target.
    pub get_prototype_of: Option<EngineValue>,
}

/// Payload for [`EngineValues::create_value`]. The VM copies borrowed data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValuePayload<'a> {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(&'a str),
    Symbol {
        description: Option<&'a str>,
    },
    Object {
        prototype: Option<EngineValue>,
    },
    Error {
        kind: ExceptionType,
        message: &'a str,
    },
    Proxy {
        target: EngineValue,
        traps: ProxyTraps,
    },
}

impl ValuePayload<'_> {
    pub const fn tag(&self) -> ValueTag {
        match self {
            Self::Undefined => ValueTag::Undefined,
            Self::Null => ValueTag::Null,
            Self::Boolean(_) => ValueTag::Boolean,
            Self::Number(_) => ValueTag::Number,
            Self::String(_) => ValueTag::String,
            Self::Symbol { .. } => ValueTag::Symbol,
            Self::Object { .. } => ValueTag::Object,
            Self::Error { .. } => ValueTag::Error,
            Self::Proxy { .. } => ValueTag::Proxy,
        }
    }
}

/// Identifies one finalizer registration. The callback and its user data
/// stay on the bridge side; the VM only ever sees this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct FinalizerId(NonZeroU64);

impl FinalizerId {
    pub const fn from_raw(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    pub const fn into_raw(self) -> NonZeroU64 {
        self.0
    }
}

/// A finalizer registration that came due during a collection. The
/// registration has been consumed and `value` is kept alive for the rest of
/// the pass that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finalization {
    pub value: EngineValue,
    pub finalizer: FinalizerId,
}

/// "Engine Value" operations.
pub trait EngineValues {
    fn create_value(&mut self, payload: ValuePayload<'_>) -> EngineValue;

    fn tag(&self, value: EngineValue) -> ValueTag;

    /// The VM's ToString, used when recording thrown values.
    fn to_display_string(&self, value: EngineValue) -> String;

    fn get(&self, object: EngineValue, key: EngineValue) -> Option<EngineValue>;

    /// Returns false if `object` cannot hold properties.
    fn set(&mut self, object: EngineValue, key: EngineValue, value: EngineValue) -> bool;

    /// Honors a proxy's `getPrototypeOf` trap.
    fn get_prototype_of(&self, object: EngineValue) -> Option<EngineValue>;
}

/// "Engine GC" callbacks.
pub trait EngineGc {
    /// Attaches `finalizer` to `value`, replacing any earlier registration.
    /// `None` removes the registration.
    fn register_finalizer(&mut self, value: EngineValue, finalizer: Option<FinalizerId>);

    /// Forces a full collection. Everything reachable from `roots` survives.
    /// Registrations of otherwise unreachable values are returned in the
    /// order the collector found them.
    fn run_collection(&mut self, roots: &[EngineValue]) -> Vec<Finalization>;

    fn is_live(&self, value: EngineValue) -> bool;
}

pub trait Engine: EngineValues + EngineGc + Debug {}

impl<T: EngineValues + EngineGc + Debug> Engine for T {}
