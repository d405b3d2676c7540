//! Classification of worker process output.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

const CONSOLE_LOG_PREFIX: &str = "LanguageWorkerConsoleLog";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLevel {
    Information,
    Warning,
    Error,
}

/// Strips the console-log marker and picks a level from the line's content.
pub fn classify_line(line: &str) -> (OutputLevel, &str) {
    let message = line
        .strip_prefix(CONSOLE_LOG_PREFIX)
        .map(str::trim_start)
        .unwrap_or(line);

    let lower = message.to_ascii_lowercase();
    let level = if lower.contains("error") || lower.contains("fail") || lower.contains("severe") {
        OutputLevel::Error
    } else if lower.contains("warn") {
        OutputLevel::Warning
    } else {
        OutputLevel::Information
    };
    (level, message)
}

/// Fixed-capacity buffer keeping the most recent error lines of a process.
#[derive(Clone, Debug)]
pub struct ErrorRing {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl ErrorRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.inner.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().iter().cloned().collect()
    }
}

/// Logs one line of worker output and remembers it if it looks like an error.
pub fn record_line(worker_id: &str, language: &str, line: &str, errors: &ErrorRing) {
    let (level, message) = classify_line(line);
    if message.is_empty() {
        return;
    }
    match level {
        OutputLevel::Error => {
            tracing::error!(target: "worker", %worker_id, %language, "{message}");
            errors.push(message);
        }
        OutputLevel::Warning => tracing::warn!(target: "worker", %worker_id, %language, "{message}"),
        OutputLevel::Information => tracing::info!(target: "worker", %worker_id, %language, "{message}"),
    }
}
