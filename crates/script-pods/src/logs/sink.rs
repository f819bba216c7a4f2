//! Agent-originated script log lines, buffered until the next poll.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::clock::Clock;
use crate::logs::{wrapped, ProcessOutput, ProcessOutputSource};
use crate::ticket::ScriptTicket;

/// Owns one [`ScriptLog`] per script.
pub struct ScriptLogProvider {
    clock: Arc<dyn Clock>,
    logs: DashMap<ScriptTicket, Arc<ScriptLog>>,
}

impl ScriptLogProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            logs: DashMap::new(),
        }
    }

    pub fn get_or_create(&self, ticket: &ScriptTicket) -> Arc<ScriptLog> {
        self.logs
            .entry(ticket.clone())
            .or_insert_with(|| Arc::new(ScriptLog::new(self.clock.clone())))
            .clone()
    }

    /// Drop the buffer for `ticket`. Lines not yet popped are lost.
    pub fn delete(&self, ticket: &ScriptTicket) {
        self.logs.remove(ticket);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

/// Buffered lines for one script.
pub struct ScriptLog {
    clock: Arc<dyn Clock>,
    lines: Mutex<Vec<ProcessOutput>>,
}

impl ScriptLog {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn verbose(&self, message: impl Into<String>) {
        self.push([ProcessOutput::new(
            ProcessOutputSource::Debug,
            message,
            self.clock.now(),
        )]);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push([ProcessOutput::new(
            ProcessOutputSource::StdOut,
            message,
            self.clock.now(),
        )]);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(wrapped(
            "warning",
            ProcessOutputSource::StdOut,
            message,
            self.clock.now(),
        ));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push([ProcessOutput::new(
            ProcessOutputSource::StdErr,
            message,
            self.clock.now(),
        )]);
    }

    /// Take every buffered line, oldest first.
    pub fn pop_logs(&self) -> Vec<ProcessOutput> {
        std::mem::take(&mut *self.lock())
    }

    fn push(&self, outputs: impl IntoIterator<Item = ProcessOutput>) {
        self.lock().extend(outputs);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ProcessOutput>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
