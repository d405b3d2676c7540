use std::sync::atomic::{AtomicUsize, Ordering};
use stratus_rpc_core::{Error, Result};

/// Picks channels in turn.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next item and advances the counter modulo `items.len()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoInitializedWorkers`] for an empty candidate set.
    pub fn select<'a, T>(&self, language: &str, items: &'a [T]) -> Result<&'a T> {
        let len = items.len();
        if len == 0 {
            return Err(Error::NoInitializedWorkers {
                language: language.to_string(),
            });
        }
        let current = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some((n + 1) % len))
            .unwrap_or_default();
        Ok(&items[current % len])
    }
}
