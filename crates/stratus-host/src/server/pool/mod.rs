//! Worker channel pools.
//!
//! Two scopes hold channels:
//!
//! - [`TenantChannelPool`] lives as long as the process. In placeholder mode
//!   it holds the pre-warmed channels, and on specialization it decides which
//!   of them the app keeps.
//! - [`InstanceChannelPool`] is created for one host instance and disposed
//!   with it on every host restart.
//!
//! Both share [`ChannelSlots`]: a start is registered before the process is
//! launched, so two callers never start the same channel twice, and a
//! [`PendingChannel`] lets any number of callers wait on one start.

pub mod debounce;
pub mod instance;
pub mod slots;
pub mod tenant;

pub use debounce::Debouncer;
pub use instance::InstanceChannelPool;
pub use slots::{ChannelSlots, PendingChannel};
pub use tenant::TenantChannelPool;

use crate::server::channel::{ChannelSettings, WorkerChannel};
use crate::server::config::HostConfig;
use crate::server::environment::HostEnvironment;
use crate::server::events::EventBus;
use crate::server::process::WorkerProcessLauncher;
use crate::server::rpc::RpcRouter;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use stratus_rpc_core::{Error, Result, types::env};

#[async_trait]
pub trait ChannelPool: Send + Sync {
    /// Registers a new channel for `language` and starts it.
    async fn initialize_channel(&self, language: &str) -> Result<PendingChannel>;

    fn get_channel(&self, language: &str, worker_id: &str) -> Option<Arc<WorkerChannel>>;

    /// Every channel of `language`, started or still starting.
    fn get_channels(&self, language: &str) -> Vec<PendingChannel>;

    /// Shuts the channel down; `false` if this pool does not hold it.
    async fn shutdown_channel(&self, language: &str, worker_id: &str, fault: Option<Error>) -> bool;

    async fn shutdown_all(&self);
}

/// Builds channels wired to the host's router, launcher and event bus.
#[derive(Clone)]
pub struct ChannelFactory {
    router: RpcRouter,
    launcher: Arc<dyn WorkerProcessLauncher>,
    events: EventBus,
    config: Arc<HostConfig>,
    environment: Arc<HostEnvironment>,
}

impl ChannelFactory {
    pub fn new(
        router: RpcRouter,
        launcher: Arc<dyn WorkerProcessLauncher>,
        events: EventBus,
        config: Arc<HostConfig>,
        environment: Arc<HostEnvironment>,
    ) -> Self {
        Self {
            router,
            launcher,
            events,
            config,
            environment,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn environment(&self) -> &Arc<HostEnvironment> {
        &self.environment
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// App root as currently configured; specialization may move it.
    pub fn app_directory(&self) -> PathBuf {
        self.environment
            .variable(env::FUNCTIONS_APPLICATION_DIRECTORY)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.app_directory.clone())
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if no worker is configured for
    /// `language`.
    pub fn create(&self, language: &str) -> Result<Arc<WorkerChannel>> {
        let description = self
            .config
            .worker(language)
            .ok_or_else(|| Error::InvalidRequest {
                reason: format!("no language worker configured for '{language}'"),
            })?
            .clone();

        let settings = ChannelSettings {
            timeouts: self.config.timeouts,
            server_uri: self.config.server_uri(),
            app_directory: self.app_directory(),
            environment: self.environment.variables(),
        };

        Ok(Arc::new(WorkerChannel::new(
            description,
            settings,
            self.router.clone(),
            Arc::clone(&self.launcher),
            self.events.clone(),
        )))
    }
}

#[cfg(test)]
mod tests;
