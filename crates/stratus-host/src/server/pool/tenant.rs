use crate::server::channel::WorkerChannel;
use crate::server::pool::{ChannelFactory, ChannelPool, ChannelSlots, Debouncer, PendingChannel};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use stratus_rpc_core::{Error, Result};

/// Channels that outlive host restarts, including the placeholder channels
/// started before specialization.
pub struct TenantChannelPool {
    factory: ChannelFactory,
    slots: Arc<ChannelSlots>,
    standby_shutdown: Debouncer,
    idle_shutdown: Debouncer,
}

impl TenantChannelPool {
    pub fn new(factory: ChannelFactory) -> Self {
        let debounce = factory.config().dispatch.idle_shutdown_debounce;
        let max = factory.config().max_process_count();
        Self {
            factory,
            slots: Arc::new(ChannelSlots::new(max)),
            standby_shutdown: Debouncer::new(debounce),
            idle_shutdown: Debouncer::new(debounce),
        }
    }

    /// Initialized channels of `language`.
    pub fn ready_channels(&self, language: &str) -> Vec<Arc<WorkerChannel>> {
        self.slots.ready(language)
    }

    pub fn languages(&self) -> Vec<String> {
        self.slots.languages()
    }

    /// Whether the placeholder channel of `language` can serve the app after
    /// an environment reload instead of being replaced.
    pub fn uses_placeholder_channel(&self, language: &str, read_only: bool) -> bool {
        read_only
            && self
                .factory
                .config()
                .worker(language)
                .is_some_and(|worker| worker.supports_environment_reload)
            && !self.slots.ready(language).is_empty()
    }

    /// Adapts the pre-warmed channels to the app the host was assigned.
    ///
    /// Channels of the configured runtime either take the new environment or
    /// are shut down; channels of every other language are shut down after
    /// the debounce.
    ///
    /// # Errors
    ///
    /// Returns the first reload failure. The failing channel is shut down.
    pub async fn specialize(&self, read_only: bool) -> Result<()> {
        let Some(runtime) = self.factory.environment().worker_runtime() else {
            tracing::info!("no worker runtime configured, releasing all placeholder channels");
            self.schedule_standby_shutdown(None);
            return Ok(());
        };

        let mut outcome = Ok(());
        if self.uses_placeholder_channel(&runtime, read_only) {
            let variables: HashMap<String, Option<String>> = self
                .factory
                .environment()
                .variables()
                .into_iter()
                .map(|(name, value)| (name, Some(value)))
                .collect();
            for channel in self.slots.ready(&runtime) {
                tracing::info!(worker_id = %channel.id(), language = %runtime, "reusing placeholder channel");
                if let Err(e) = channel.reload_environment(&variables).await {
                    tracing::error!(worker_id = %channel.id(), error = %e, "placeholder channel rejected the new environment");
                    self.slots
                        .shutdown(&runtime, channel.id(), Some(e.clone()))
                        .await;
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                }
            }
        } else {
            let count = self.slots.shutdown_where(|language| language == runtime).await;
            tracing::info!(language = %runtime, count, "placeholder channels replaced for specialized app");
        }

        self.schedule_standby_shutdown(Some(runtime));
        outcome
    }

    /// Shuts down every channel whose language is not `keep`.
    pub async fn shutdown_standby_channels_except(&self, keep: Option<&str>) -> usize {
        let keep = keep.map(str::to_ascii_lowercase);
        self.slots
            .shutdown_where(|language| keep.as_deref() != Some(language))
            .await
    }

    fn schedule_standby_shutdown(&self, keep: Option<String>) {
        let slots = Arc::clone(&self.slots);
        self.standby_shutdown.call(move || async move {
            let count = slots
                .shutdown_where(|language| keep.as_deref() != Some(language))
                .await;
            tracing::info!(count, keep = ?keep, "standby channels shut down");
        });
    }

    /// Shuts every channel down once no other request for it arrives within
    /// the debounce window.
    pub fn schedule_idle_shutdown(&self) {
        let slots = Arc::clone(&self.slots);
        self.idle_shutdown.call(move || async move {
            let count = slots.shutdown_where(|_| true).await;
            if count > 0 {
                tracing::info!(count, "idle language workers shut down");
            }
        });
    }

    pub fn cancel_idle_shutdown(&self) {
        self.idle_shutdown.cancel();
    }
}

#[async_trait]
impl ChannelPool for TenantChannelPool {
    async fn initialize_channel(&self, language: &str) -> Result<PendingChannel> {
        let channel = self.factory.create(language)?;
        tracing::debug!(worker_id = %channel.id(), %language, "starting tenant channel");
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
        self.standby_shutdown.cancel();
        self.idle_shutdown.cancel();
        let count = self.slots.shutdown_where(|_| true).await;
        tracing::debug!(count, "tenant channels shut down");
    }
}
