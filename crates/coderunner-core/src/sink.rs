//! Capped text buffer for captured program output.

use std::sync::{Arc, Mutex};

/// Appended exactly once when a sink first overflows.
pub const TRUNCATION_MARKER: &str = "\n--- OUTPUT TRUNCATED ---";

/// Default capacity, in characters, of the engine's output capture.
pub const DEFAULT_OUTPUT_LIMIT: usize = 5000;

/// A write-only text sink holding at most `limit` characters.
///
/// The first write that crosses the limit is clipped at the boundary and the
/// truncation marker is appended. Every later write is dropped. Writes always
/// report the requested length so callers never see truncation as a failure.
#[derive(Debug)]
pub struct BoundedSink {
    buffer: String,
    limit: usize,
    written: usize,
    truncated: bool,
}

impl BoundedSink {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            limit,
            written: 0,
            truncated: false,
        }
    }

    /// Appends `text`, returning its length in characters.
    pub fn write(&mut self, text: &str) -> usize {
        let len = text.chars().count();
        if self.truncated {
            return len;
        }

        if self.written + len <= self.limit {
            self.buffer.push_str(text);
            self.written += len;
            return len;
        }

        let remaining = self.limit - self.written;
        self.buffer.extend(text.chars().take(remaining));
        self.written += remaining;
        self.buffer.push_str(TRUNCATION_MARKER);
        self.truncated = true;
        len
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn contents(&self) -> &str {
        &self.buffer
    }
}

impl Default for BoundedSink {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_LIMIT)
    }
}

/// Handle shared between the print and debug callbacks of one execution.
#[derive(Debug, Clone)]
pub struct SharedSink(Arc<Mutex<BoundedSink>>);

impl SharedSink {
    pub fn new(limit: usize) -> Self {
        Self(Arc::new(Mutex::new(BoundedSink::new(limit))))
    }

    pub fn write(&self, text: &str) -> usize {
        match self.0.lock() {
            Ok(mut sink) => sink.write(text),
            Err(poisoned) => poisoned.into_inner().write(text),
        }
    }

    /// Returns the captured text and whether it was truncated.
    pub fn snapshot(&self) -> (String, bool) {
        let sink = match self.0.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        (sink.contents().to_string(), sink.truncated())
    }
}
