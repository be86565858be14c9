// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::ops::{Deref, DerefMut};
use std::rc::Rc;

use super::Message;
use crate::{
    execution::{Isolate, TraceCategory},
    vm::EngineValue,
};

/// # TryCatch
///
/// Catches the exception that is pending while it is the innermost TryCatch
/// of its isolate. The pending exception is pulled in lazily, on the first
/// query, and stays caught for the lifetime of the TryCatch.
///
/// On drop the caught exception is discarded, unless [`rethrow`] was called,
/// in which case it becomes pending again for the enclosing TryCatch. A
/// verbose TryCatch with no user TryCatch around it reports what it caught
/// to the isolate's message listeners before discarding it.
///
/// [`rethrow`]: TryCatch::rethrow
#[derive(Debug)]
pub struct TryCatch<'i> {
    isolate: &'i mut Isolate,
    serial: u64,
}

impl<'i> TryCatch<'i> {
    pub fn new(isolate: &'i mut Isolate) -> Self {
        Self::push(isolate, true)
    }

    /// A TryCatch opened by the bridge itself. It does not count as an
    /// enclosing TryCatch when deciding whether to report an exception.
    pub fn new_internal(isolate: &'i mut Isolate) -> Self {
        Self::push(isolate, false)
    }

    fn push(isolate: &'i mut Isolate, user: bool) -> Self {
        let serial = isolate.exceptions.push_try_catch(user);
        if isolate.options().is_trace_call_enabled(TraceCategory::TryCatch) {
            tracing::trace!(serial, user, "TryCatch entered");
        }
        Self { isolate, serial }
    }

    pub fn has_caught(&mut self) -> bool {
        self.isolate.exceptions.catch_pending(self.serial).is_some()
    }

    /// The exception object of the caught exception.
    pub fn exception(&mut self) -> Option<EngineValue> {
        self.isolate
            .exceptions
            .catch_pending(self.serial)
            .map(|exception| exception.object)
    }

    /// The value the script threw.
    pub fn thrown_value(&mut self) -> Option<EngineValue> {
        self.isolate
            .exceptions
            .catch_pending(self.serial)
            .map(|exception| exception.thrown)
    }

    pub fn message(&mut self) -> Option<Rc<Message>> {
        self.isolate
            .exceptions
            .catch_pending(self.serial)
            .map(|exception| exception.message.clone())
    }

    /// Leaves the caught exception pending when this TryCatch is dropped.
    pub fn rethrow(&mut self) -> Option<EngineValue> {
        let exception = self.exception();
        self.isolate
            .exceptions
            .top_try_catch_mut(self.serial)
            .rethrow = true;
        exception
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.isolate
            .exceptions
            .top_try_catch_mut(self.serial)
            .verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.isolate.exceptions.top_try_catch(self.serial).verbose
    }

    /// Discards the caught exception, along with one that is still pending.
    pub fn reset(&mut self) {
        let record = self.isolate.exceptions.top_try_catch_mut(self.serial);
        record.caught = None;
        record.rethrow = false;
        self.isolate.exceptions.take_pending();
    }

    /// Decides what happens to an exception that crossed back into embedder
    /// code: it is reported unless a non-verbose user TryCatch encloses this
    /// one, and it is rethrown to that enclosing TryCatch if there is one.
    pub fn check_report_external_exception(&mut self) {
        if !self.has_caught() {
            return;
        }
        let enclosing = self
            .isolate
            .exceptions
            .enclosing_user_try_catch()
            .map(|record| record.verbose);
        if enclosing.is_none_or(|verbose| verbose) {
            let record = self.isolate.exceptions.top_try_catch_mut(self.serial);
            if let Some(mut exception) = record.caught.take() {
                self.isolate.report_exception(&mut exception);
                self.isolate
                    .exceptions
                    .top_try_catch_mut(self.serial)
                    .caught = Some(exception);
            }
        }
        if enclosing.is_some() {
            self.rethrow();
        }
    }
}

impl Deref for TryCatch<'_> {
    type Target = Isolate;

    fn deref(&self) -> &Isolate {
        self.isolate
    }
}

impl DerefMut for TryCatch<'_> {
    fn deref_mut(&mut self) -> &mut Isolate {
        self.isolate
    }
}

impl Drop for TryCatch<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() && !self.isolate.exceptions.is_topmost(self.serial) {
            return;
        }
        let record = self.isolate.exceptions.pop_try_catch(self.serial);
        if self
            .isolate
            .options()
            .is_trace_call_enabled(TraceCategory::TryCatch)
        {
            tracing::trace!(serial = self.serial, rethrow = record.rethrow, "TryCatch exited");
        }
        let exception = match record.caught {
            Some(exception) => Some(exception),
            None => self.isolate.exceptions.take_pending(),
        };
        let Some(mut exception) = exception else {
            return;
        };
        if record.rethrow {
            self.isolate.exceptions.set_pending(exception);
            return;
        }
        if record.verbose && !self.isolate.exceptions.has_user_try_catch() {
            self.isolate.report_exception(&mut exception);
        }
    }
}
