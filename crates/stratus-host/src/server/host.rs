//! The composition root of one host process.
//!
//! [`ScriptHost`] owns what lives as long as the process: the event bus, the
//! worker router, the tenant channel pool and the specialization manager.
//! Each (re)start builds a fresh [`FunctionDispatcher`] with its own
//! [`InstanceChannelPool`] for the functions found under the app directory.
//!
//! In placeholder mode the host writes the warm-up app and pre-warms one
//! channel per placeholder language. A `HostRestart` (published when an
//! assignment completes) hands the placeholder channels to the assigned
//! app and restarts the dispatcher.

use crate::server::channel::InvocationResult;
use crate::server::config::HostConfig;
use crate::server::dispatch::{FunctionDispatcher, is_supported};
use crate::server::environment::HostEnvironment;
use crate::server::events::{EventBus, HostEvent};
use crate::server::metadata::{FunctionDescriptor, FunctionMetadataProvider, InvocationContext};
use crate::server::pool::{ChannelFactory, ChannelPool, InstanceChannelPool, TenantChannelPool};
use crate::server::process::WorkerProcessLauncher;
use crate::server::rpc::RpcRouter;
use crate::server::standby::{SpecializationManager, materialize_placeholder_app};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use stratus_rpc_core::{Error, Result, proto::ParameterBinding, types::env};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub struct ScriptHost {
    config: Arc<HostConfig>,
    environment: Arc<HostEnvironment>,
    events: EventBus,
    router: RpcRouter,
    factory: ChannelFactory,
    tenant: Arc<TenantChannelPool>,
    specialization: Arc<SpecializationManager>,
    metadata: Arc<dyn FunctionMetadataProvider>,
    functions: RwLock<Vec<FunctionDescriptor>>,
    dispatcher: RwLock<Option<Arc<FunctionDispatcher>>>,
    restarts: tokio::sync::Mutex<()>,
    stopping: CancellationToken,
}

impl ScriptHost {
    /// # Errors
    ///
    /// Returns an error if the specialization manager cannot be built.
    pub fn new(
        config: Arc<HostConfig>,
        router: RpcRouter,
        launcher: Arc<dyn WorkerProcessLauncher>,
        metadata: Arc<dyn FunctionMetadataProvider>,
    ) -> Result<Arc<Self>> {
        let environment = Arc::new(HostEnvironment::new(&config));
        let events = EventBus::new();
        let factory = ChannelFactory::new(
            router.clone(),
            launcher,
            events.clone(),
            Arc::clone(&config),
            Arc::clone(&environment),
        );
        let tenant = Arc::new(TenantChannelPool::new(factory.clone()));
        let specialization =
            SpecializationManager::new(&config, Arc::clone(&environment), events.clone())?;

        Ok(Arc::new(Self {
            config,
            environment,
            events,
            router,
            factory,
            tenant,
            specialization,
            metadata,
            functions: RwLock::new(Vec::new()),
            dispatcher: RwLock::new(None),
            restarts: tokio::sync::Mutex::new(()),
            stopping: CancellationToken::new(),
        }))
    }

    pub fn router(&self) -> &RpcRouter {
        &self.router
    }

    pub fn environment(&self) -> &Arc<HostEnvironment> {
        &self.environment
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn specialization(&self) -> &Arc<SpecializationManager> {
        &self.specialization
    }

    pub fn dispatcher(&self) -> Option<Arc<FunctionDispatcher>> {
        self.dispatcher.read().clone()
    }

    pub fn functions(&self) -> Vec<FunctionDescriptor> {
        self.functions.read().clone()
    }

    fn app_directory(&self) -> PathBuf {
        self.factory.app_directory()
    }

    /// Brings up the first dispatcher. In standby the warm-up app is written
    /// first and placeholder workers are pre-warmed afterwards.
    ///
    /// # Errors
    ///
    /// Returns the function discovery or dispatcher initialization failure.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        tokio::spawn(watch_restarts(
            Arc::downgrade(self),
            self.events.subscribe(),
            self.stopping.clone(),
        ));

        if !self.environment.in_standby_mode() {
            return self.restart().await;
        }
        materialize_placeholder_app(&self.app_directory()).await?;
        self.restart().await?;
        self.prewarm().await;
        Ok(())
    }

    /// Starts one tenant channel per placeholder language and loads the
    /// placeholder functions onto it.
    async fn prewarm(&self) {
        let functions = self.functions();
        for language in &self.config.placeholder_languages {
            let pending = match self.tenant.initialize_channel(language).await {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(%language, error = %e, "could not pre-warm language worker");
                    continue;
                }
            };
            let functions: Vec<FunctionDescriptor> = functions
                .iter()
                .filter(|function| is_supported(function, language))
                .cloned()
                .collect();
            tokio::spawn(async move {
                match pending.wait().await {
                    Ok(channel) => {
                        if let Err(e) = channel.load_functions(&functions).await {
                            tracing::warn!(worker_id = %channel.id(), error = %e, "placeholder functions did not load");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "placeholder worker did not start"),
                }
            });
        }
        tracing::info!(languages = ?self.config.placeholder_languages, "placeholder workers starting");
    }

    /// Replaces the dispatcher with one built for the current app directory.
    ///
    /// # Errors
    ///
    /// Returns the function discovery or dispatcher initialization failure.
    pub async fn restart(&self) -> Result<()> {
        let _guard = self.restarts.lock().await;
        let previous = self.dispatcher.write().take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        if self.stopping.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }

        let app_directory = self.app_directory();
        let functions = self.metadata.functions(&app_directory)?;
        tracing::info!(app = %app_directory.display(), count = functions.len(), "starting host");
        *self.functions.write() = functions.clone();

        let dispatcher = FunctionDispatcher::new(
            Arc::clone(&self.config),
            Arc::clone(&self.environment),
            self.events.clone(),
            Arc::clone(&self.tenant),
            Arc::new(InstanceChannelPool::new(self.factory.clone())),
        );
        *self.dispatcher.write() = Some(Arc::clone(&dispatcher));
        dispatcher.initialize(functions).await
    }

    /// Hands the placeholder workers to the assigned app and restarts.
    async fn specialize(&self) {
        let read_only = self
            .environment
            .variable(env::WEBSITE_RUN_FROM_PACKAGE)
            .is_some_and(|value| !value.trim().is_empty());
        if let Err(e) = self.tenant.specialize(read_only).await {
            tracing::warn!(error = %e, "placeholder workers could not be reused");
        }
        if let Err(e) = self.restart().await {
            tracing::error!(error = %e, "host restart after specialization failed");
        }
    }

    /// Invokes the function named `function_name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an unknown function, else the
    /// dispatcher's error.
    pub async fn invoke(
        &self,
        function_name: &str,
        inputs: Vec<ParameterBinding>,
        cancel: CancellationToken,
    ) -> Result<InvocationResult> {
        let function = self
            .functions
            .read()
            .iter()
            .find(|function| function.name.eq_ignore_ascii_case(function_name))
            .cloned()
            .ok_or_else(|| Error::InvalidRequest {
                reason: format!("function '{function_name}' does not exist"),
            })?;
        let dispatcher = self.dispatcher().ok_or(Error::ServiceShutdown)?;
        dispatcher
            .invoke(InvocationContext::new(&function, inputs), cancel)
            .await
    }

    pub async fn shutdown(&self) {
        self.stopping.cancel();
        let _guard = self.restarts.lock().await;
        let dispatcher = self.dispatcher.write().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.shutdown().await;
        }
        self.tenant.shutdown_all().await;
        tracing::info!("host shut down");
    }
}

async fn watch_restarts(
    host: Weak<ScriptHost>,
    mut events: broadcast::Receiver<HostEvent>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(HostEvent::HostRestart) => {
                let Some(host) = host.upgrade() else {
                    break;
                };
                tracing::info!("host restart requested");
                host.specialize().await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "host event watcher fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::Platform;
    use crate::server::dispatch::DispatcherState;
    use crate::server::metadata::DirectoryMetadataProvider;
    use crate::server::standby::{HostAssignmentContext, WARMUP_FUNCTION};
    use crate::server::testing::{FakeLauncher, test_config};
    use core::time::Duration;
    use stratus_rpc_core::proto::typed_data;

    struct Fixture {
        host: Arc<ScriptHost>,
        launcher: Arc<FakeLauncher>,
        _app: tempfile::TempDir,
    }

    fn fixture(configure: impl FnOnce(&mut HostConfig)) -> Fixture {
        let app = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.app_directory = app.path().to_path_buf();
        configure(&mut config);

        let router = RpcRouter::new();
        let launcher = FakeLauncher::new(router.clone());
        let host = ScriptHost::new(
            Arc::new(config),
            router,
            launcher.clone(),
            Arc::new(DirectoryMetadataProvider),
        )
        .unwrap();
        Fixture {
            host,
            launcher,
            _app: app,
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let reached = tokio::time::timeout(Duration::from_secs(3), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {what}");
    }

    fn served_by(result: &InvocationResult) -> String {
        match result.return_value.as_ref().and_then(|v| v.data.clone()) {
            Some(typed_data::Data::String(worker_id)) => worker_id,
            other => panic!("unexpected return value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn placeholder_serves_warmup_from_prewarmed_worker() {
        let fixture = fixture(|config| config.placeholder_mode = true);
        fixture.host.start().await.unwrap();

        eventually("placeholder workers", || {
            ["node", "python"]
                .iter()
                .all(|language| fixture.host.tenant.ready_channels(language).len() == 1)
        })
        .await;
        assert_eq!(fixture.launcher.launches(), 2);

        let warmup = fixture.host.functions().remove(0);
        assert_eq!(warmup.name, WARMUP_FUNCTION);
        let channel = Arc::clone(&fixture.host.tenant.ready_channels("node")[0]);
        eventually("warm-up function load", || channel.load_state(&warmup.id).is_some()).await;

        let result = fixture
            .host
            .invoke(WARMUP_FUNCTION, Vec::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(served_by(&result), channel.id());
        fixture.host.shutdown().await;
    }

    #[tokio::test]
    async fn specialization_reuses_the_runtime_worker() {
        let fixture = fixture(|config| {
            config.placeholder_mode = true;
            config.platform = Platform::Windows;
        });
        fixture.host.start().await.unwrap();
        eventually("placeholder workers", || {
            fixture.host.tenant.ready_channels("node").len() == 1
                && fixture.host.tenant.ready_channels("python").len() == 1
        })
        .await;
        let node = fixture.host.tenant.ready_channels("node")[0].id().to_string();

        let context = HostAssignmentContext::new(1, "orders")
            .with_environment(env::FUNCTIONS_WORKER_RUNTIME, "node")
            .with_environment(env::WEBSITE_RUN_FROM_PACKAGE, "1");
        assert!(fixture.host.specialization().start_assignment(context));

        eventually("specialized dispatcher", || {
            fixture
                .host
                .dispatcher()
                .is_some_and(|d| d.state() == DispatcherState::Initialized)
        })
        .await;
        eventually("python placeholder released", || {
            fixture.host.tenant.languages() == vec!["node".to_string()]
        })
        .await;
        assert_eq!(fixture.launcher.launches(), 2);

        let result = fixture
            .host
            .invoke(WARMUP_FUNCTION, Vec::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(served_by(&result), node);
        fixture.host.shutdown().await;
    }

    #[tokio::test]
    async fn specialized_host_runs_app_functions() {
        let fixture = fixture(|config| {
            config.worker_runtime = Some("node".into());
        });
        let function = fixture.host.app_directory().join("HttpTrigger");
        std::fs::create_dir_all(&function).unwrap();
        std::fs::write(function.join("index.js"), "").unwrap();

        fixture.host.start().await.unwrap();
        let dispatcher = fixture.host.dispatcher().unwrap();
        eventually("dispatcher initialized", || {
            dispatcher.state() == DispatcherState::Initialized
        })
        .await;

        assert!(
            fixture
                .host
                .invoke("httptrigger", Vec::new(), CancellationToken::new())
                .await
                .is_ok()
        );
        assert!(matches!(
            fixture
                .host
                .invoke("Missing", Vec::new(), CancellationToken::new())
                .await,
            Err(Error::InvalidRequest { .. })
        ));

        fixture.host.shutdown().await;
        assert!(matches!(
            fixture.host.restart().await,
            Err(Error::ServiceShutdown)
        ));
    }
}
