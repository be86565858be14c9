// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use wtf8::Wtf8Buf;

use super::heap_gc::{HeapMarkAndSweep, WorkQueues};
use crate::vm::{EngineValue, ExceptionType, ProxyTraps, ValueTag};

#[derive(Debug)]
pub(crate) enum HeapData {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(Wtf8Buf),
    Symbol(SymbolHeapData),
    Object(ObjectHeapData),
    Error(ErrorHeapData),
    Proxy(ProxyHeapData),
}

impl HeapData {
    pub(crate) fn tag(&self) -> ValueTag {
        match self {
            Self::Undefined => ValueTag::Undefined,
            Self::Null => ValueTag::Null,
            Self::Boolean(_) => ValueTag::Boolean,
            Self::Number(_) => ValueTag::Number,
            Self::String(_) => ValueTag::String,
            Self::Symbol(_) => ValueTag::Symbol,
            Self::Object(_) => ValueTag::Object,
            Self::Error(_) => ValueTag::Error,
            Self::Proxy(_) => ValueTag::Proxy,
        }
    }

    pub(crate) fn as_string(&self) -> Option<&Wtf8Buf> {
        match self {
            Self::String(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn properties(&self) -> Option<&ObjectHeapData> {
        match self {
            Self::Object(data) => Some(data),
            Self::Error(data) => Some(&data.object),
            _ => None,
        }
    }

    pub(crate) fn properties_mut(&mut self) -> Option<&mut ObjectHeapData> {
        match self {
            Self::Object(data) => Some(data),
            Self::Error(data) => Some(&mut data.object),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct SymbolHeapData {
    pub(crate) descriptor: Option<Wtf8Buf>,
}

#[derive(Debug, Default)]
pub(crate) struct ObjectHeapData {
    pub(crate) prototype: Option<EngineValue>,
    pub(crate) keys: Vec<EngineValue>,
    pub(crate) values: Vec<EngineValue>,
}

#[derive(Debug)]
pub(crate) struct ErrorHeapData {
    pub(crate) kind: ExceptionType,
    pub(crate) message: Wtf8Buf,
    pub(crate) object: ObjectHeapData,
}

#[derive(Debug)]
pub(crate) struct ProxyHeapData {
    pub(crate) target: EngineValue,
    pub(crate) traps: ProxyTraps,
}

impl HeapMarkAndSweep for HeapData {
    fn mark_values(&self, queues: &mut WorkQueues) {
        match self {
            Self::Undefined
            | Self::Null
            | Self::Boolean(_)
            | Self::Number(_)
            | Self::String(_)
            | Self::Symbol(_) => {}
            Self::Object(data) => data.mark_values(queues),
            Self::Error(data) => data.object.mark_values(queues),
            Self::Proxy(data) => data.mark_values(queues),
        }
    }
}

impl HeapMarkAndSweep for ObjectHeapData {
    fn mark_values(&self, queues: &mut WorkQueues) {
        if let Some(prototype) = self.prototype {
            queues.push_value(prototype);
        }
        self.keys.iter().for_each(|&key| queues.push_value(key));
        self.values.iter().for_each(|&value| queues.push_value(value));
    }
}

impl HeapMarkAndSweep for ProxyHeapData {
    fn mark_values(&self, queues: &mut WorkQueues) {
        queues.push_value(self.target);
        if let Some(prototype) = self.traps.get_prototype_of {
            queues.push_value(prototype);
        }
    }
}
