//! Test-step output
//!
//! Commands write their raw stdout/stderr into an [`OutputSink`]. A
//! [`Logger`] is a sink that also takes harness messages and can be flushed
//! between steps, so the output of one step is reported together.

use std::sync::Mutex;

use tracing::info;

/// Destination for raw process output
pub trait OutputSink: Send + Sync {
    /// Append bytes exactly as the process produced them
    fn write_output(&self, bytes: &[u8]);
}

/// Per-step logger
pub trait Logger: OutputSink {
    /// Record a message
    fn log(&self, message: &str);

    /// Emit whatever output has been buffered so far
    fn flush(&self);
}

/// Logger that holds output until [`Logger::flush`]
///
/// Flushing emits each complete line as a `tracing` event tagged with the
/// step name. A trailing partial line stays buffered until the next flush
/// completes it. Everything flushed is also kept for [`BufferedLogger::lines`].
#[derive(Debug, Default)]
pub struct BufferedLogger {
    step: String,
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    pending: Vec<u8>,
    lines: Vec<String>,
}

impl BufferedLogger {
    /// Logger for the named step
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            state: Mutex::default(),
        }
    }

    /// Every line flushed so far, including logged messages
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        // A panic while holding the lock leaves the buffer usable
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, state: &mut LogState, line: String) {
        info!(step = %self.step, "{}", line);
        state.lines.push(line);
    }
}

impl OutputSink for BufferedLogger {
    fn write_output(&self, bytes: &[u8]) {
        self.lock().pending.extend_from_slice(bytes);
    }
}

impl Logger for BufferedLogger {
    fn log(&self, message: &str) {
        let mut state = self.lock();
        self.emit(&mut state, message.to_string());
    }

    fn flush(&self) {
        let mut state = self.lock();
        let Some(end) = state.pending.iter().rposition(|b| *b == b'\n') else {
            return;
        };

        let complete: Vec<u8> = state.pending.drain(..=end).collect();
        for line in String::from_utf8_lossy(&complete).lines() {
            self.emit(&mut state, line.to_string());
        }
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_output(&self, _bytes: &[u8]) {}
}
