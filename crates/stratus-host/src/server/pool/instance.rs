use crate::server::channel::WorkerChannel;
use crate::server::dispatch::target_pool_size;
use crate::server::pool::{ChannelFactory, ChannelPool, ChannelSlots, PendingChannel};
use async_trait::async_trait;
use std::sync::Arc;
use stratus_rpc_core::{Error, Result};

/// Channels owned by one host instance; disposed on every host restart.
pub struct InstanceChannelPool {
    factory: ChannelFactory,
    slots: ChannelSlots,
}

impl InstanceChannelPool {
    /// Sized from the current `FUNCTIONS_WORKER_PROCESS_COUNT`.
    pub fn new(factory: ChannelFactory) -> Self {
        let max = target_pool_size(factory.environment().process_count());
        Self {
            factory,
            slots: ChannelSlots::new(max),
        }
    }

    pub fn max_per_language(&self) -> usize {
        self.slots.max_per_language()
    }

    pub fn all_channels(&self) -> Vec<Arc<WorkerChannel>> {
        self.slots.all()
    }
}

#[async_trait]
impl ChannelPool for InstanceChannelPool {
    async fn initialize_channel(&self, language: &str) -> Result<PendingChannel> {
        let channel = self.factory.create(language)?;
        tracing::debug!(worker_id = %channel.id(), %language, "starting instance channel");
        self.slots.start(channel)
    }

    fn get_channel(&self, language: &str, worker_id: &str) -> Option<Arc<WorkerChannel>> {
        self.slots.get(language, worker_id)
    }

    fn get_channels(&self, language: &str) -> Vec<PendingChannel> {
        self.slots.pending(language)
    }

    async fn shutdown_channel(&self, language: &str, worker_id: &str, fault: Option<Error>) -> bool {
        self.slots.shutdown(language, worker_id, fault).await
    }

    async fn shutdown_all(&self) {
        let count = self.slots.shutdown_where(|_| true).await;
        tracing::debug!(count, "instance channels shut down");
    }
}
