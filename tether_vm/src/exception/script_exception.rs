// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::num::NonZeroU32;
use std::rc::Rc;

use super::{JsError, JsResult};
use crate::{
    engine::rootable::{Local, ScopeKind},
    execution::{CachedString, Isolate, TraceCategory},
    vm::{EngineValue, ValuePayload},
};

const ERROR_PREFIX: &str = "Error: ";
const UNKNOWN_SOURCE_LINE: &str = "unknown";

/// One source position reported by the VM: either the throw site or a frame
/// of the call stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTraceData {
    pub url: String,
    /// Full text of the script the position points into.
    pub source_code: String,
    /// 1-based.
    pub line: i64,
    /// 1-based.
    pub column: i64,
    /// Offset of the position into `source_code`.
    pub index: i64,
    /// `None` for frames that are not function calls.
    pub function_name: Option<String>,
}

impl StackTraceData {
    pub fn new(url: impl Into<String>, source_code: impl Into<String>, line: i64, column: i64, index: i64) -> Self {
        Self {
            url: url.into(),
            source_code: source_code.into(),
            line,
            column,
            index,
            function_name: None,
        }
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }
}

/// A throw reported by the VM collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throw {
    pub value: EngineValue,
    /// Throw site. Falls back to the innermost frame of `stack_trace`.
    pub location: Option<StackTraceData>,
    /// Innermost frame first.
    pub stack_trace: Vec<StackTraceData>,
}

impl Throw {
    pub fn new(value: EngineValue) -> Self {
        Self {
            value,
            location: None,
            stack_trace: Vec::new(),
        }
    }

    pub fn at(mut self, location: StackTraceData) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_frame(mut self, frame: StackTraceData) -> Self {
        self.stack_trace.push(frame);
        self
    }
}

/// Formatted report of one exception, as handed to message listeners and
/// exposed through [`TryCatch::message`](super::TryCatch::message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    url: String,
    line: i64,
    start_column: i64,
    end_column: i64,
    start_position: i64,
    end_position: i64,
    source_line: String,
    exception: String,
    text: String,
    stack: String,
}

impl Message {
    pub(crate) fn new(
        exception: String,
        location: &StackTraceData,
        frames: &[StackTraceData],
    ) -> Self {
        let index = location.index.max(0);
        let column = location.column.max(0);
        let line = location.line.max(0);

        let text = match exception.find(ERROR_PREFIX) {
            Some(start) => exception[start + ERROR_PREFIX.len()..].to_string(),
            None => exception.clone(),
        };
        let line_start = index.saturating_sub(column).saturating_add(1);
        let source_line = source_line(&location.source_code, line_start)
            .unwrap_or(UNKNOWN_SOURCE_LINE)
            .to_string();

        let mut stack = format!("{exception}\n{source_line}\n\n");
        for frame in frames {
            stack.push_str(&format!(
                "\tat {} ({}:{}:{})\n",
                frame.function_name.as_deref().unwrap_or_default(),
                frame.url,
                frame.line,
                frame.column,
            ));
        }

        // Columns are exported one lower than reported.
        let start_column = column - 1;
        Self {
            url: location.url.clone(),
            line,
            start_column,
            end_column: start_column + 1,
            start_position: index,
            end_position: index.saturating_add(1),
            source_line,
            exception,
            text,
            stack,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn line(&self) -> i64 {
        self.line
    }

    pub fn start_column(&self) -> i64 {
        self.start_column
    }

    pub fn end_column(&self) -> i64 {
        self.end_column
    }

    pub fn start_position(&self) -> i64 {
        self.start_position
    }

    pub fn end_position(&self) -> i64 {
        self.end_position
    }

    /// Text of the offending line, or `"unknown"`.
    pub fn source_line(&self) -> &str {
        &self.source_line
    }

    /// The thrown value as a string.
    pub fn exception(&self) -> &str {
        &self.exception
    }

    /// The thrown value with everything up to the first `"Error: "` removed.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }
}

fn source_line(source: &str, start: i64) -> Option<&str> {
    let start = usize::try_from(start.max(0)).ok()?;
    let rest = source.get(start..)?;
    Some(rest.find('\n').map_or(rest, |end| &rest[..end]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageListenerId(NonZeroU32);

pub(crate) type MessageListener = Rc<dyn Fn(&Message, EngineValue)>;

/// A recorded exception. `object` carries the formatted fields; `thrown` is
/// the value the script threw.
#[derive(Debug)]
pub(crate) struct ScriptException {
    pub(crate) object: EngineValue,
    pub(crate) thrown: EngineValue,
    pub(crate) message: Rc<Message>,
    pub(crate) reported: bool,
}

#[derive(Debug)]
pub(crate) struct TryCatchRecord {
    pub(crate) serial: u64,
    pub(crate) user: bool,
    pub(crate) verbose: bool,
    pub(crate) rethrow: bool,
    pub(crate) caught: Option<ScriptException>,
}

#[derive(Default)]
pub(crate) struct ExceptionState {
    pending: Option<ScriptException>,
    try_catches: Vec<TryCatchRecord>,
    listeners: Vec<(MessageListenerId, MessageListener)>,
    next_try_catch: u64,
    next_listener: u32,
}

impl core::fmt::Debug for ExceptionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExceptionState")
            .field("pending", &self.pending)
            .field("try_catches", &self.try_catches)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl ExceptionState {
    pub(crate) fn pending(&self) -> Option<&ScriptException> {
        self.pending.as_ref()
    }

    pub(crate) fn set_pending(&mut self, exception: ScriptException) -> Option<ScriptException> {
        self.pending.replace(exception)
    }

    pub(crate) fn take_pending(&mut self) -> Option<ScriptException> {
        self.pending.take()
    }

    pub(crate) fn push_try_catch(&mut self, user: bool) -> u64 {
        self.next_try_catch += 1;
        self.try_catches.push(TryCatchRecord {
            serial: self.next_try_catch,
            user,
            verbose: false,
            rethrow: false,
            caught: None,
        });
        self.next_try_catch
    }

    pub(crate) fn pop_try_catch(&mut self, serial: u64) -> TryCatchRecord {
        if self.try_catches.last().is_none_or(|record| record.serial != serial) {
            handle_try_catch_out_of_order()
        }
        match self.try_catches.pop() {
            Some(record) => record,
            None => handle_try_catch_out_of_order(),
        }
    }

    pub(crate) fn is_topmost(&self, serial: u64) -> bool {
        self.try_catches
            .last()
            .is_some_and(|record| record.serial == serial)
    }

    pub(crate) fn top_try_catch(&self, serial: u64) -> &TryCatchRecord {
        match self.try_catches.last() {
            Some(record) if record.serial == serial => record,
            _ => handle_try_catch_out_of_order(),
        }
    }

    pub(crate) fn top_try_catch_mut(&mut self, serial: u64) -> &mut TryCatchRecord {
        top_record_mut(&mut self.try_catches, serial)
    }

    /// Moves the pending exception into the TryCatch `serial` unless it
    /// already caught one.
    pub(crate) fn catch_pending(&mut self, serial: u64) -> Option<&ScriptException> {
        let record = top_record_mut(&mut self.try_catches, serial);
        if record.caught.is_none() {
            record.caught = self.pending.take();
        }
        record.caught.as_ref()
    }

    /// Nearest user TryCatch below the topmost one.
    pub(crate) fn enclosing_user_try_catch(&self) -> Option<&TryCatchRecord> {
        self.try_catches.iter().rev().skip(1).find(|record| record.user)
    }

    pub(crate) fn has_user_try_catch(&self) -> bool {
        self.try_catches.iter().any(|record| record.user)
    }

    pub(crate) fn try_catch_depth(&self) -> usize {
        self.try_catches.len()
    }

    pub(crate) fn add_listener(&mut self, listener: MessageListener) -> MessageListenerId {
        self.next_listener += 1;
        let id = MessageListenerId(NonZeroU32::MIN.saturating_add(self.next_listener - 1));
        self.listeners.push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&mut self, id: MessageListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub(crate) fn listeners(&self) -> Vec<MessageListener> {
        self.listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub(crate) fn append_roots(&self, roots: &mut Vec<EngineValue>) {
        let caught = self
            .try_catches
            .iter()
            .filter_map(|record| record.caught.as_ref());
        for exception in self.pending.iter().chain(caught) {
            roots.extend([exception.object, exception.thrown]);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.pending = None;
        self.try_catches.clear();
        self.listeners.clear();
    }
}

fn top_record_mut(records: &mut [TryCatchRecord], serial: u64) -> &mut TryCatchRecord {
    match records.last_mut() {
        Some(record) if record.serial == serial => record,
        _ => handle_try_catch_out_of_order(),
    }
}

impl Isolate {
    /// Records a throw as the pending exception, replacing any earlier one.
    pub fn set_exception(&mut self, throw: Throw) {
        let Some(location) = throw.location.as_ref().or(throw.stack_trace.first()) else {
            handle_missing_location();
            return;
        };
        let stringified = self.vm().to_display_string(throw.value);
        let message = Message::new(stringified, location, &throw.stack_trace);
        let object = self.create_exception_object(&message);
        if self.options().is_trace_call_enabled(TraceCategory::TryCatch) {
            tracing::trace!(exception = message.exception(), url = message.url(), "exception set");
        }
        let previous = self.exceptions.set_pending(ScriptException {
            object,
            thrown: throw.value,
            message: Rc::new(message),
            reported: false,
        });
        if let Some(previous) = previous {
            tracing::debug!(exception = previous.message.exception(), "pending exception overwritten");
        }
    }

    fn create_exception_object(&mut self, message: &Message) -> EngineValue {
        let token = self.enter_scope(ScopeKind::Internal);
        let object = self.new_value(ValuePayload::Object { prototype: None });
        let object = self.value(object);
        self.set_cached_property(object, CachedString::Url, ValuePayload::String(message.url()));
        self.set_cached_property(object, CachedString::Line, ValuePayload::Number(message.line() as f64));
        self.set_cached_property(
            object,
            CachedString::Column,
            ValuePayload::Number(message.start_column() as f64),
        );
        self.set_cached_property(
            object,
            CachedString::Exception,
            ValuePayload::String(message.exception()),
        );
        self.set_cached_property(object, CachedString::Message, ValuePayload::String(message.text()));
        self.set_cached_property(
            object,
            CachedString::Source,
            ValuePayload::String(message.source_line()),
        );
        self.set_cached_property(object, CachedString::Length, ValuePayload::Number(1.0));
        self.set_cached_property(object, CachedString::Stack, ValuePayload::String(message.stack()));
        self.exit_scope(token);
        object
    }

    fn set_cached_property(&mut self, object: EngineValue, key: CachedString, payload: ValuePayload<'_>) {
        let value = self.new_value(payload);
        let value = self.value(value);
        let key = self.atomic_cache().string(key);
        let stored = self.vm_mut().set(object, key, value);
        debug_assert!(stored, "exception objects accept properties");
    }

    /// The exception object of the pending exception.
    pub fn pending_exception(&self) -> Option<EngineValue> {
        self.exceptions.pending().map(|exception| exception.object)
    }

    /// The value the script threw for the pending exception.
    pub fn pending_thrown_value(&self) -> Option<EngineValue> {
        self.exceptions.pending().map(|exception| exception.thrown)
    }

    pub fn pending_message(&self) -> Option<Rc<Message>> {
        self.exceptions
            .pending()
            .map(|exception| exception.message.clone())
    }

    pub fn has_pending_exception(&self) -> bool {
        self.exceptions.pending().is_some()
    }

    /// Returns false if nothing was pending.
    pub fn clear_exception(&mut self) -> bool {
        self.exceptions.take_pending().is_some()
    }

    /// Turns a collaborator's completion into a handle, or records the throw
    /// and hands back the thrown value.
    pub fn handle_completion(&mut self, completion: Result<EngineValue, Throw>) -> JsResult<Local> {
        match completion {
            Ok(value) => Ok(self.register(value)),
            Err(throw) => {
                let thrown = throw.value;
                self.set_exception(throw);
                Err(JsError::new(thrown))
            }
        }
    }

    pub fn add_message_listener(
        &mut self,
        listener: impl Fn(&Message, EngineValue) + 'static,
    ) -> MessageListenerId {
        self.exceptions.add_listener(Rc::new(listener))
    }

    pub fn remove_message_listener(&mut self, id: MessageListenerId) -> bool {
        self.exceptions.remove_listener(id)
    }

    /// Reports the pending exception to the message listeners if no
    /// TryCatch is open to receive it. The exception is consumed either way.
    pub fn report_pending_exception(&mut self) -> bool {
        if self.exceptions.try_catch_depth() > 0 {
            return false;
        }
        match self.exceptions.take_pending() {
            Some(mut exception) => self.report_exception(&mut exception),
            None => false,
        }
    }

    /// Notifies every message listener, once per exception.
    pub(crate) fn report_exception(&self, exception: &mut ScriptException) -> bool {
        if exception.reported {
            return false;
        }
        exception.reported = true;
        let listeners = self.exceptions.listeners();
        tracing::debug!(
            listeners = listeners.len(),
            exception = exception.message.exception(),
            "reporting exception"
        );
        for listener in listeners {
            listener(&exception.message, exception.object);
        }
        true
    }
}

#[cold]
#[inline(never)]
fn handle_missing_location() {
    tracing::error!("exception recorded without any location data");
    if cfg!(debug_assertions) {
        panic!("Exception has no location data")
    }
}

#[cold]
#[inline(never)]
fn handle_try_catch_out_of_order() -> ! {
    tracing::error!("TryCatch is not the innermost one");
    panic!("TryCatch destroyed out of order")
}
