//! The function dispatcher of one host instance.
//!
//! [`FunctionDispatcher::initialize`] brings up `target` channels for every
//! active language, reusing ready tenant channels first and starting the
//! rest in the instance pool with a pause between starts. Invocations are
//! spread round-robin over the initialized channels of the function's
//! language.
//!
//! A supervision task listens on the event bus. A `WorkerError` of an active
//! language shuts the channel down and restarts it until the error bucket
//! reaches its cap; a `WorkerRestart` always restarts. Events of other
//! languages are only logged. Restarts are serialized, and each holds the
//! restart lock for the restart delay.

use crate::server::channel::{InvocationResult, WorkerChannel};
use crate::server::config::HostConfig;
use crate::server::dispatch::{
    ErrorBucket, RoundRobinBalancer, active_languages, is_supported, target_pool_size,
};
use crate::server::environment::HostEnvironment;
use crate::server::events::{EventBus, HostEvent, WorkerHealthEvent};
use crate::server::metadata::{FunctionDescriptor, InvocationContext};
use crate::server::pool::{ChannelPool, InstanceChannelPool, PendingChannel, TenantChannelPool};
use crate::server::telemetry::{
    increment_invocations, increment_invocations_throttled, increment_worker_errors,
    increment_worker_restarts,
};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use stratus_rpc_core::{Error, Result, types::ERRORS_PER_PROCESS};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Default,
    Initializing,
    Initialized,
}

pub struct FunctionDispatcher {
    config: Arc<HostConfig>,
    environment: Arc<HostEnvironment>,
    events: EventBus,
    tenant: Arc<TenantChannelPool>,
    instance: Arc<InstanceChannelPool>,
    balancer: RoundRobinBalancer,
    state: watch::Sender<DispatcherState>,
    functions: RwLock<Vec<FunctionDescriptor>>,
    languages: RwLock<Vec<String>>,
    errors: Mutex<ErrorBucket>,
    restart_lock: tokio::sync::Mutex<()>,
    supervision: CancellationToken,
}

impl FunctionDispatcher {
    /// Creates the dispatcher and starts health supervision.
    pub fn new(
        config: Arc<HostConfig>,
        environment: Arc<HostEnvironment>,
        events: EventBus,
        tenant: Arc<TenantChannelPool>,
        instance: Arc<InstanceChannelPool>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(DispatcherState::Default);
        let target = target_pool_size(environment.process_count());
        let errors = ErrorBucket::new(config.dispatch.error_window, target * ERRORS_PER_PROCESS);
        let health = events.subscribe();

        let dispatcher = Arc::new(Self {
            config,
            environment,
            events,
            tenant,
            instance,
            balancer: RoundRobinBalancer::new(),
            state,
            functions: RwLock::new(Vec::new()),
            languages: RwLock::new(Vec::new()),
            errors: Mutex::new(errors),
            restart_lock: tokio::sync::Mutex::new(()),
            supervision: CancellationToken::new(),
        });

        tokio::spawn(supervise(
            Arc::downgrade(&dispatcher),
            health,
            dispatcher.supervision.clone(),
        ));
        dispatcher
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state.subscribe()
    }

    pub fn active_languages(&self) -> Vec<String> {
        self.languages.read().clone()
    }

    /// Worker processes wanted per active language.
    pub fn target_pool_size(&self) -> usize {
        self.instance.max_per_language()
    }

    fn is_active(&self, language: &str) -> bool {
        self.languages
            .read()
            .iter()
            .any(|active| active.eq_ignore_ascii_case(language))
    }

    fn set_state(&self, next: DispatcherState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "dispatcher state changed");
        }
    }

    /// Prepares workers for `functions`.
    ///
    /// In standby mode nothing happens: the placeholder channels belong to
    /// the specialization flow. When no function needs an out-of-process
    /// worker, idle tenant channels are shut down after the debounce.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if an active language has no
    /// configured worker.
    pub async fn initialize(self: &Arc<Self>, functions: Vec<FunctionDescriptor>) -> Result<()> {
        if self.environment.in_standby_mode() {
            tracing::debug!("standby mode, leaving placeholder workers to specialization");
            return Ok(());
        }

        let runtime = self.environment.worker_runtime();
        let languages = active_languages(runtime.as_deref(), &functions);
        let needs_worker = languages
            .iter()
            .any(|language| functions.iter().any(|function| is_supported(function, language)));

        *self.functions.write() = functions;
        *self.languages.write() = languages.clone();

        if !needs_worker {
            tracing::info!(runtime = ?runtime, "no function needs a language worker");
            self.tenant.schedule_idle_shutdown();
            self.set_state(DispatcherState::Default);
            return Ok(());
        }
        self.tenant.cancel_idle_shutdown();

        if let Some(missing) = languages.iter().find(|l| self.config.worker(l).is_none()) {
            return Err(Error::InvalidRequest {
                reason: format!("no language worker configured for '{missing}'"),
            });
        }

        self.set_state(DispatcherState::Initializing);
        let target = self.target_pool_size();
        tracing::info!(?languages, target, "initializing language workers");

        for language in languages {
            let reused = self.adopt_tenant_channels(&language).await;
            let remaining = target.saturating_sub(reused);
            if remaining == 0 {
                continue;
            }
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                dispatcher.start_instance_channels(language, remaining).await;
            });
        }
        self.refresh_state();
        Ok(())
    }

    /// Loads functions onto the ready tenant channels of `language` and
    /// returns how many were kept.
    async fn adopt_tenant_channels(&self, language: &str) -> usize {
        let mut reused = 0;
        for pending in self.tenant.get_channels(language) {
            let worker_id = pending.channel().id().to_string();
            match pending.wait().await {
                Ok(channel) if channel.is_ready() => {
                    tracing::info!(worker_id = %channel.id(), %language, "reusing tenant channel");
                    self.load_functions(&channel).await;
                    reused += 1;
                }
                Ok(channel) => {
                    self.tenant.shutdown_channel(language, channel.id(), None).await;
                }
                Err(e) => {
                    tracing::warn!(%worker_id, %language, error = %e, "discarding failed tenant channel");
                    self.tenant.shutdown_channel(language, &worker_id, Some(e)).await;
                }
            }
        }
        reused
    }

    async fn start_instance_channels(self: Arc<Self>, language: String, count: usize) {
        let interval = self.config.dispatch.process_startup_interval;
        for started in 0..count {
            if self.supervision.is_cancelled() {
                return;
            }
            if started > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            match self.instance.initialize_channel(&language).await {
                Ok(pending) => self.track(pending),
                Err(e) => {
                    tracing::error!(%language, error = %e, "could not start language worker");
                    break;
                }
            }
        }
    }

    /// Follows a start: loads functions once it is ready, and reports
    /// launch failures the channel itself does not publish.
    fn track(self: &Arc<Self>, pending: PendingChannel) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let language = pending.channel().language().to_string();
            let worker_id = pending.channel().id().to_string();
            match pending.wait().await {
                Ok(channel) => {
                    dispatcher.load_functions(&channel).await;
                    dispatcher.refresh_state();
                }
                Err(e @ Error::ProcessLaunch { .. }) => {
                    dispatcher
                        .events
                        .publish(HostEvent::WorkerError(WorkerHealthEvent::error(
                            language, worker_id, e,
                        )));
                }
                Err(e) => tracing::debug!(%worker_id, error = %e, "language worker did not start"),
            }
        });
    }

    async fn load_functions(&self, channel: &WorkerChannel) {
        let functions: Vec<FunctionDescriptor> = self
            .functions
            .read()
            .iter()
            .filter(|function| is_supported(function, channel.language()))
            .cloned()
            .collect();
        if let Err(e) = channel.load_functions(&functions).await {
            tracing::error!(worker_id = %channel.id(), error = %e, "could not load functions");
        }
    }

    fn ready_channels(&self, language: &str) -> Vec<Arc<WorkerChannel>> {
        let mut channels = self.tenant.ready_channels(language);
        channels.extend(
            self.instance
                .get_channels(language)
                .iter()
                .map(|pending| Arc::clone(pending.channel()))
                .filter(|channel| channel.is_ready()),
        );
        channels
    }

    fn refresh_state(&self) {
        if self.state() != DispatcherState::Initializing {
            return;
        }
        let target = self.target_pool_size();
        let complete = self
            .languages
            .read()
            .iter()
            .all(|language| self.ready_channels(language).len() >= target);
        if complete {
            tracing::info!("all language workers initialized");
            self.set_state(DispatcherState::Initialized);
        }
    }

    /// Picks the channel for the next invocation of `language`.
    ///
    /// # Errors
    ///
    /// - [`Error::NoInitializedWorkers`] if none is ready.
    /// - [`Error::TooManyChannels`] if more than the target are ready.
    pub fn get_language_worker_channel(&self, language: &str) -> Result<Arc<WorkerChannel>> {
        let channels = self.ready_channels(language);
        let max = self.target_pool_size();
        if channels.len() > max {
            return Err(Error::TooManyChannels {
                language: language.to_string(),
                count: channels.len(),
                max,
            });
        }
        self.balancer.select(language, &channels).map(Arc::clone)
    }

    /// Routes `context` to a worker of its function's language.
    ///
    /// # Errors
    ///
    /// Returns the routing failure or the channel's invocation error.
    pub async fn invoke(
        &self,
        context: InvocationContext,
        cancel: CancellationToken,
    ) -> Result<InvocationResult> {
        tokio::select! {
            () = self.environment.requests().wait_until_open() => {}
            () = cancel.cancelled() => return Err(Error::InvocationCancelled),
        }

        let language = if context.language.is_empty() {
            self.environment.worker_runtime().unwrap_or_default()
        } else {
            context.language.to_ascii_lowercase()
        };

        let channel = match self.get_language_worker_channel(&language) {
            Ok(channel) => channel,
            Err(e) => {
                increment_invocations_throttled(&language);
                return Err(e);
            }
        };
        increment_invocations(&language);
        tracing::debug!(
            invocation_id = %context.invocation_id,
            function = %context.function_name,
            worker_id = %channel.id(),
            "dispatching invocation"
        );
        channel.invoke(context, cancel).await
    }

    async fn shutdown_worker(&self, language: &str, worker_id: &str, fault: Option<Error>) -> bool {
        if self
            .tenant
            .shutdown_channel(language, worker_id, fault.clone())
            .await
        {
            return true;
        }
        self.instance.shutdown_channel(language, worker_id, fault).await
    }

    async fn on_worker_error(self: &Arc<Self>, event: WorkerHealthEvent) {
        if !self.is_active(&event.language) {
            tracing::debug!(language = %event.language, worker_id = %event.worker_id, "ignoring worker error of inactive language");
            return;
        }
        increment_worker_errors(&event.language);

        if !self
            .shutdown_worker(&event.language, &event.worker_id, event.fault.clone())
            .await
        {
            tracing::debug!(worker_id = %event.worker_id, "worker already gone");
            return;
        }

        let allowed = self.errors.lock().record(event.created_at);
        if allowed {
            tracing::warn!(language = %event.language, worker_id = %event.worker_id, fault = ?event.fault, "restarting failed language worker");
            self.restart_channel(&event.language).await;
        } else {
            let cap = self.errors.lock().cap();
            tracing::error!(language = %event.language, cap, "worker error limit reached, not restarting");
        }
    }

    async fn on_worker_restart(self: &Arc<Self>, event: WorkerHealthEvent) {
        if !self.is_active(&event.language) {
            tracing::debug!(language = %event.language, worker_id = %event.worker_id, "ignoring restart request of inactive language");
            return;
        }
        if self
            .shutdown_worker(&event.language, &event.worker_id, None)
            .await
        {
            tracing::info!(language = %event.language, worker_id = %event.worker_id, "restarting language worker on request");
            self.restart_channel(&event.language).await;
        }
    }

    async fn restart_channel(self: &Arc<Self>, language: &str) {
        let _guard = self.restart_lock.lock().await;
        if self.supervision.is_cancelled() {
            return;
        }
        increment_worker_restarts(language);
        if self.state() == DispatcherState::Initialized {
            self.set_state(DispatcherState::Initializing);
        }
        match self.instance.initialize_channel(language).await {
            Ok(pending) => self.track(pending),
            Err(e) => tracing::error!(%language, error = %e, "could not restart language worker"),
        }
        tokio::select! {
            () = tokio::time::sleep(self.config.dispatch.restart_delay) => {}
            () = self.supervision.cancelled() => {}
        }
    }

    /// Restarts the worker running `invocation_id`; `false` if no channel
    /// holds it.
    pub async fn restart_worker_with_invocation(self: &Arc<Self>, invocation_id: &str) -> bool {
        let languages = self.active_languages();
        let owner = languages.iter().find_map(|language| {
            self.ready_channels(language)
                .into_iter()
                .find(|channel| channel.has_invocation(invocation_id))
        });
        let Some(channel) = owner else {
            return false;
        };

        tracing::info!(worker_id = %channel.id(), %invocation_id, "restarting worker of invocation");
        let fault = Error::WorkerFault {
            worker_id: channel.id().to_string(),
            message: format!("restarted while running invocation {invocation_id}"),
        };
        let language = channel.language().to_string();
        if self.shutdown_worker(&language, channel.id(), Some(fault)).await {
            self.restart_channel(&language).await;
        }
        true
    }

    /// Stops supervision, lets in-flight invocations finish within the
    /// shutdown timeout, then shuts the instance pool down.
    pub async fn shutdown(&self) {
        self.supervision.cancel();
        let channels = self.instance.all_channels();
        let drain = futures::future::join_all(channels.iter().map(|c| c.drain_invocations()));
        if tokio::time::timeout(self.config.dispatch.shutdown_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!("in-flight invocations did not drain before shutdown");
        }
        self.instance.shutdown_all().await;
        self.set_state(DispatcherState::Default);
        tracing::info!("function dispatcher shut down");
    }
}

async fn supervise(
    dispatcher: Weak<FunctionDispatcher>,
    mut health: broadcast::Receiver<HostEvent>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = stop.cancelled() => break,
            event = health.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "health supervision fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(dispatcher) = dispatcher.upgrade() else {
            break;
        };
        // Handlers run apart so a restart waiting out its delay does not hold
        // back the shutdown of the next failed worker.
        match event {
            HostEvent::WorkerError(event) => {
                tokio::spawn(async move { dispatcher.on_worker_error(event).await });
            }
            HostEvent::WorkerRestart(event) => {
                tokio::spawn(async move { dispatcher.on_worker_restart(event).await });
            }
            HostEvent::ChannelReady { .. } | HostEvent::HostRestart => {}
        }
    }
    tracing::debug!("health supervision stopped");
}
