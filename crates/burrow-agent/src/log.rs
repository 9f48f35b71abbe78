//! Bounded in-memory log
//!
//! Embedders poll the agent's recent activity through the handle instead of
//! wiring up a tracing subscriber, so the session keeps a small ring of
//! timestamped lines alongside its tracing output.

use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 256;

pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: impl AsRef<str>) {
        let stamped = format!(
            "{} {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            line.as_ref()
        );
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(stamped);
    }

    /// Oldest first
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
