//! Diagnostic message sink.
//!
//! The focus controller reports what it is doing (move requests, faults, transport
//! errors, disposal timeouts) through a [`DiagnosticSink`]. Applications plug in
//! whatever log window or file they have; the default [`TracingSink`] turns every
//! message into a `tracing` event under the `focus_daq::diagnostics` target.

use parking_lot::Mutex;
use std::sync::Arc;

/// Fire-and-forget message sink, callable from any thread.
pub trait DiagnosticSink: Send + Sync {
    /// Detailed progress information.
    fn debug(&self, message: &str);
    /// Normal operational messages.
    fn info(&self, message: &str);
    /// Something went wrong.
    fn error(&self, message: &str);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "focus_daq::diagnostics", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "focus_daq::diagnostics", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "focus_daq::diagnostics", "{message}");
    }
}

/// Severity of a recorded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// `debug`
    Debug,
    /// `info`
    Info,
    /// `error`
    Error,
}

/// Keeps every message in memory. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<(DiagnosticLevel, String)>>>,
}

impl RecordingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages so far, oldest first.
    pub fn messages(&self) -> Vec<(DiagnosticLevel, String)> {
        self.messages.lock().clone()
    }

    /// Messages at one level.
    pub fn messages_at(&self, level: DiagnosticLevel) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn push(&self, level: DiagnosticLevel, message: &str) {
        self.messages.lock().push((level, message.to_string()));
    }
}

impl DiagnosticSink for RecordingSink {
    fn debug(&self, message: &str) {
        self.push(DiagnosticLevel::Debug, message);
    }

    fn info(&self, message: &str) {
        self.push(DiagnosticLevel::Info, message);
    }

    fn error(&self, message: &str) {
        self.push(DiagnosticLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_tracing_sink_emits_events() {
        let sink = TracingSink;
        sink.info("Moving focus to 0.500");
        sink.error("Focus motor bridge A is stalled.");

        assert!(logs_contain("Moving focus to 0.500"));
        assert!(logs_contain("bridge A is stalled"));
    }

    #[test]
    fn test_recording_sink_keeps_levels() {
        let sink = RecordingSink::new();
        let shared: Arc<dyn DiagnosticSink> = Arc::new(sink.clone());

        shared.debug("poll");
        shared.error("fault");

        assert_eq!(sink.messages().len(), 2);
        assert_eq!(sink.messages_at(DiagnosticLevel::Error), vec!["fault"]);
    }
}
