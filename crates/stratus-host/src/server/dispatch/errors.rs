use core::time::Duration;
use std::time::Instant;

/// Recent worker errors of the active languages.
///
/// The bucket empties itself when a new error arrives more than `window`
/// after the newest one recorded, so only bursts count towards the cap.
#[derive(Debug)]
pub struct ErrorBucket {
    window: Duration,
    cap: usize,
    events: Vec<Instant>,
}

impl ErrorBucket {
    pub fn new(window: Duration, cap: usize) -> Self {
        Self {
            window,
            cap,
            events: Vec::with_capacity(cap),
        }
    }

    /// Records an error and reports whether a restart is still allowed.
    pub fn record(&mut self, at: Instant) -> bool {
        if let Some(newest) = self.events.last() {
            if at.saturating_duration_since(*newest) > self.window {
                self.events.clear();
            }
        }
        self.events.push(at);
        self.events.len() < self.cap
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}
