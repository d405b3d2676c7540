//! Bookkeeping shared by both pool managers.

use crate::server::channel::WorkerChannel;
use crate::server::telemetry::record_pool_size;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stratus_rpc_core::{Error, Result};
use tokio::sync::watch;

type StartOutcome = Option<Result<()>>;

/// A channel whose start may still be running.
///
/// Cloning is cheap; every clone observes the same outcome.
#[derive(Clone)]
pub struct PendingChannel {
    channel: Arc<WorkerChannel>,
    outcome: watch::Receiver<StartOutcome>,
}

impl PendingChannel {
    pub fn channel(&self) -> &Arc<WorkerChannel> {
        &self.channel
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Waits for the start to finish.
    ///
    /// # Errors
    ///
    /// Returns the start failure, shared by every waiter.
    pub async fn wait(mut self) -> Result<Arc<WorkerChannel>> {
        let outcome = self
            .outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::channel("channel start was abandoned"))?
            .clone();
        match outcome {
            Some(Ok(())) => Ok(self.channel),
            Some(Err(e)) => Err(e),
            None => Err(Error::channel("channel start was abandoned")),
        }
    }
}

struct Slot {
    channel: Arc<WorkerChannel>,
    outcome: watch::Receiver<StartOutcome>,
}

impl Slot {
    fn pending(&self) -> PendingChannel {
        PendingChannel {
            channel: Arc::clone(&self.channel),
            outcome: self.outcome.clone(),
        }
    }
}

/// Channels of one pool, grouped by lowercased language in start order.
pub struct ChannelSlots {
    max_per_language: usize,
    slots: Mutex<HashMap<String, Vec<Slot>>>,
}

impl ChannelSlots {
    pub fn new(max_per_language: usize) -> Self {
        Self {
            max_per_language,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_per_language(&self) -> usize {
        self.max_per_language
    }

    /// Inserts `channel` and starts it in the background.
    ///
    /// The slot exists before the process is launched, so concurrent callers
    /// see the start in progress instead of starting another one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolFull`] when the language already holds the
    /// maximum number of channels.
    pub fn start(&self, channel: Arc<WorkerChannel>) -> Result<PendingChannel> {
        let language = channel.language().to_ascii_lowercase();
        let (tx, outcome) = watch::channel(None);
        let pending = {
            let mut slots = self.slots.lock();
            let entries = slots.entry(language.clone()).or_default();
            if entries.len() >= self.max_per_language {
                return Err(Error::PoolFull {
                    language,
                    max: self.max_per_language,
                });
            }
            let slot = Slot {
                channel: Arc::clone(&channel),
                outcome,
            };
            let pending = slot.pending();
            entries.push(slot);
            record_pool_size(&language, entries.len());
            pending
        };

        tokio::spawn(async move {
            let result = channel.start_worker_process().await;
            tx.send_replace(Some(result));
        });
        Ok(pending)
    }

    pub fn get(&self, language: &str, worker_id: &str) -> Option<Arc<WorkerChannel>> {
        self.slots
            .lock()
            .get(&language.to_ascii_lowercase())?
            .iter()
            .find(|slot| slot.channel.id() == worker_id)
            .map(|slot| Arc::clone(&slot.channel))
    }

    pub fn pending(&self, language: &str) -> Vec<PendingChannel> {
        self.slots
            .lock()
            .get(&language.to_ascii_lowercase())
            .map(|entries| entries.iter().map(Slot::pending).collect())
            .unwrap_or_default()
    }

    /// Channels of `language` that finished their handshake.
    pub fn ready(&self, language: &str) -> Vec<Arc<WorkerChannel>> {
        self.slots
            .lock()
            .get(&language.to_ascii_lowercase())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|slot| slot.channel.is_ready())
                    .map(|slot| Arc::clone(&slot.channel))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all(&self) -> Vec<Arc<WorkerChannel>> {
        self.slots
            .lock()
            .values()
            .flatten()
            .map(|slot| Arc::clone(&slot.channel))
            .collect()
    }

    pub fn languages(&self) -> Vec<String> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(language, _)| language.clone())
            .collect()
    }

    pub fn remove(&self, language: &str, worker_id: &str) -> Option<Arc<WorkerChannel>> {
        let language = language.to_ascii_lowercase();
        let mut slots = self.slots.lock();
        let entries = slots.get_mut(&language)?;
        let index = entries
            .iter()
            .position(|slot| slot.channel.id() == worker_id)?;
        let slot = entries.remove(index);
        record_pool_size(&language, entries.len());
        if entries.is_empty() {
            slots.remove(&language);
        }
        Some(slot.channel)
    }

    /// Removes every channel of the languages `filter` selects.
    pub fn take_where(&self, filter: impl Fn(&str) -> bool) -> Vec<Arc<WorkerChannel>> {
        let mut slots = self.slots.lock();
        let languages: Vec<String> = slots
            .keys()
            .filter(|language| filter(language))
            .cloned()
            .collect();
        let mut taken = Vec::new();
        for language in languages {
            if let Some(entries) = slots.remove(&language) {
                record_pool_size(&language, 0);
                taken.extend(entries.into_iter().map(|slot| slot.channel));
            }
        }
        taken
    }

    /// Removes and shuts down the channel; `false` if it was not here.
    pub async fn shutdown(&self, language: &str, worker_id: &str, fault: Option<Error>) -> bool {
        match self.remove(language, worker_id) {
            Some(channel) => {
                channel.shutdown(fault).await;
                true
            }
            None => false,
        }
    }

    /// Removes and shuts down every channel of the languages `filter` selects.
    pub async fn shutdown_where(&self, filter: impl Fn(&str) -> bool) -> usize {
        let channels = self.take_where(filter);
        let count = channels.len();
        futures::future::join_all(channels.iter().map(|channel| channel.shutdown(None))).await;
        count
    }
}
