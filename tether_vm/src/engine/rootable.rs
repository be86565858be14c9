// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ## Rooting
//!
//! The two ways an [`EngineValue`](crate::EngineValue) handed to embedder
//! code is kept alive against the VM's collector: scope-bound [`Local`]s on
//! the [`ScopeStack`], and counted [`Persistent`] handles in the persistent
//! registry.

mod persistent;
mod scoped;

pub(crate) use persistent::{PersistentRegistry, WeakCallback};
pub use persistent::{Persistent, WeakCallbackInfo};
pub use scoped::{HandleScope, Local, ScopeKind, ScopeStack, ScopeToken};
