//! Bounded per-connection log storage.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Maximum number of log lines retained per connection.
pub const MAX_LOG_LINES: usize = 1000;

/// Ring buffer storing recent log lines for one connection.
///
/// Single writer (the transport's reader loop); readers receive a copy.
#[derive(Debug)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a log line, dropping the oldest when at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Copy out up to `max` of the most recent lines, oldest first.
    pub fn tail(&self, max: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(max);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(MAX_LOG_LINES)
    }
}

/// Shared handle to a connection's log ring.
#[derive(Debug, Clone, Default)]
pub struct ConnectionLogs(Arc<Mutex<LogRing>>);

impl ConnectionLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        if let Ok(mut ring) = self.0.lock() {
            ring.push(line.into());
        }
    }

    pub fn tail(&self, max: usize) -> Vec<String> {
        self.0
            .lock()
            .map(|ring| ring.tail(max))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|ring| ring.len()).unwrap_or(0)
    }
}
