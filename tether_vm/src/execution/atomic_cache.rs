// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::vm::{Engine, EngineValue, ValuePayload, ValueTag};

macro_rules! cached_strings {
    ($($variant:ident => $text:literal,)*) => {
        /// Property names interned once per isolate.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum CachedString {
            $($variant,)*
        }

        impl CachedString {
            pub const ALL: &'static [CachedString] = &[$(CachedString::$variant,)*];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $(CachedString::$variant => $text,)*
                }
            }
        }
    };
}

macro_rules! cached_symbols {
    ($($variant:ident => $description:literal,)*) => {
        /// Symbols interned once per isolate.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum CachedSymbol {
            $($variant,)*
        }

        impl CachedSymbol {
            pub const ALL: &'static [CachedSymbol] = &[$(CachedSymbol::$variant,)*];

            pub const fn description(self) -> &'static str {
                match self {
                    $(CachedSymbol::$variant => $description,)*
                }
            }
        }
    };
}

cached_strings! {
    Empty => "",
    Column => "column",
    Constructor => "constructor",
    Exception => "exception",
    Gc => "gc",
    GetPrototypeOf => "getPrototypeOf",
    Length => "length",
    Line => "line",
    Message => "message",
    Name => "name",
    Prototype => "prototype",
    Source => "source",
    Stack => "stack",
    ToString => "toString",
    Url => "url",
}

cached_symbols! {
    KeepAlive => "__keepalive__",
    PrivateData => "__private_data__",
}

/// Pre-interned constants of one isolate. Every value here is reported as a
/// root for as long as the isolate lives.
#[derive(Debug)]
pub struct AtomicValueCache {
    undefined: EngineValue,
    null: EngineValue,
    true_value: EngineValue,
    false_value: EngineValue,
    strings: Box<[EngineValue]>,
    symbols: Box<[EngineValue]>,
}

impl AtomicValueCache {
    pub(crate) fn new(vm: &mut dyn Engine) -> Self {
        Self {
            undefined: vm.create_value(ValuePayload::Undefined),
            null: vm.create_value(ValuePayload::Null),
            true_value: vm.create_value(ValuePayload::Boolean(true)),
            false_value: vm.create_value(ValuePayload::Boolean(false)),
            strings: CachedString::ALL
                .iter()
                .map(|id| vm.create_value(ValuePayload::String(id.as_str())))
                .collect(),
            symbols: CachedSymbol::ALL
                .iter()
                .map(|id| {
                    vm.create_value(ValuePayload::Symbol {
                        description: Some(id.description()),
                    })
                })
                .collect(),
        }
    }

    pub fn undefined(&self) -> EngineValue {
        self.undefined
    }

    pub fn null(&self) -> EngineValue {
        self.null
    }

    pub fn boolean(&self, value: bool) -> EngineValue {
        if value { self.true_value } else { self.false_value }
    }

    pub fn string(&self, id: CachedString) -> EngineValue {
        self.strings[id as usize]
    }

    pub fn symbol(&self, id: CachedSymbol) -> EngineValue {
        self.symbols[id as usize]
    }

    /// Reverse lookup: which cached string, if any, has the same contents as
    /// `value`.
    pub fn find_string(&self, vm: &dyn Engine, value: EngineValue) -> Option<CachedString> {
        if let Some(index) = self.strings.iter().position(|&cached| cached == value) {
            return Some(CachedString::ALL[index]);
        }
        if vm.tag(value) != ValueTag::String {
            return None;
        }
        let text = vm.to_display_string(value);
        CachedString::ALL
            .iter()
            .copied()
            .find(|id| id.as_str() == text)
    }

    pub(crate) fn append_roots(&self, roots: &mut Vec<EngineValue>) {
        roots.extend([self.undefined, self.null, self.true_value, self.false_value]);
        roots.extend(self.strings.iter().copied());
        roots.extend(self.symbols.iter().copied());
    }
}

#[cfg(all(test, feature = "reference-vm"))]
mod tests {
    use super::*;
    use crate::{heap::Heap, vm::EngineValues};

    #[test]
    fn lookups_by_id_and_by_contents() {
        let mut heap = Heap::new();
        let cache = AtomicValueCache::new(&mut heap);
        let stack = cache.string(CachedString::Stack);
        assert_eq!(heap.to_display_string(stack), "stack");
        assert_eq!(cache.find_string(&heap, stack), Some(CachedString::Stack));

        let copy = heap.create_value(ValuePayload::String("getPrototypeOf"));
        assert_eq!(
            cache.find_string(&heap, copy),
            Some(CachedString::GetPrototypeOf)
        );
        assert_eq!(cache.find_string(&heap, cache.null()), None);
        assert_eq!(
            heap.to_display_string(cache.symbol(CachedSymbol::KeepAlive)),
            "Symbol(__keepalive__)"
        );
        assert_ne!(cache.boolean(true), cache.boolean(false));
    }
}
