//! One host-side connection to one language worker process.
//!
//! A [`WorkerChannel`] owns the process it launched and the bidirectional
//! frame stream that process opens back to the host. All traffic for the
//! worker goes through it: the init handshake, function loads, invocations,
//! environment reloads and the final terminate. Responses are correlated by
//! id through oneshot slots, so any number of callers can wait on the same
//! channel concurrently.
//!
//! The read loop is the only consumer of inbound frames. It never holds a
//! lock across an await.

use crate::server::channel::{
    capabilities::{Capabilities, UpdateStrategy},
    logs::emit_worker_log,
    state::ChannelState,
};
use crate::server::config::{ChannelTimeouts, WorkerDescription};
use crate::server::events::{EventBus, HostEvent, WorkerHealthEvent};
use crate::server::metadata::{FunctionDescriptor, InvocationContext};
use crate::server::process::{WorkerCreateContext, WorkerProcess, WorkerProcessLauncher};
use crate::server::rpc::{RpcRouter, WorkerConnection};
use core::time::Duration;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use stratus_rpc_core::{
    Error, Result,
    proto::{
        FunctionEnvironmentReloadRequest, FunctionEnvironmentReloadResponse, FunctionLoadRequest,
        FunctionLoadResponse, InvocationCancel, InvocationRequest, InvocationResponse,
        ParameterBinding, StatusResult, StreamingMessage, TypedData, WorkerInitRequest,
        WorkerInitResponse, WorkerTerminate, streaming_message::Content,
    },
    types::{
        FunctionId, HOST_VERSION, InvocationId, MAX_MESSAGE_LENGTH, WorkerId, capabilities, env,
    },
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Grace period a worker is offered in `WorkerTerminate`.
const WORKER_TERMINATE_GRACE: Duration = Duration::from_secs(5);
const TERMINATE_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-channel settings resolved by the pool that creates the channel.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub timeouts: ChannelTimeouts,
    pub server_uri: String,
    pub app_directory: PathBuf,
    /// Extra environment for the worker process.
    pub environment: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionLoadState {
    Pending,
    Loaded,
    /// Replayed as the error of every invocation of the function.
    Failed(Error),
}

/// Successful outcome of an invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    pub invocation_id: InvocationId,
    pub outputs: Vec<ParameterBinding>,
    pub return_value: Option<TypedData>,
}

struct FunctionBuffer {
    name: String,
    state: FunctionLoadState,
    /// Requests accepted while the load was pending.
    queued: Vec<InvocationRequest>,
}

struct PendingInvocation {
    function_id: FunctionId,
    /// `false` while the request waits in a function buffer.
    sent: bool,
    tx: oneshot::Sender<Result<InvocationResponse>>,
}

#[derive(Default)]
struct ChannelInner {
    init: Option<oneshot::Sender<WorkerInitResponse>>,
    reload: Option<oneshot::Sender<FunctionEnvironmentReloadResponse>>,
    functions: HashMap<FunctionId, FunctionBuffer>,
    invocations: HashMap<InvocationId, PendingInvocation>,
}

pub struct WorkerChannel {
    id: WorkerId,
    description: WorkerDescription,
    settings: ChannelSettings,
    router: RpcRouter,
    launcher: Arc<dyn WorkerProcessLauncher>,
    events: EventBus,
    state: watch::Sender<ChannelState>,
    outbound: OnceLock<mpsc::Sender<StreamingMessage>>,
    process: Mutex<Option<Box<dyn WorkerProcess>>>,
    inner: Mutex<ChannelInner>,
    capabilities: RwLock<Capabilities>,
    in_flight: watch::Sender<usize>,
    closing: CancellationToken,
    disposed: AtomicBool,
}

impl WorkerChannel {
    pub fn new(
        description: WorkerDescription,
        settings: ChannelSettings,
        router: RpcRouter,
        launcher: Arc<dyn WorkerProcessLauncher>,
        events: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Created);
        let (in_flight, _) = watch::channel(0);
        Self {
            id: Uuid::new_v4().to_string(),
            description,
            settings,
            router,
            launcher,
            events,
            state,
            outbound: OnceLock::new(),
            process: Mutex::new(None),
            inner: Mutex::new(ChannelInner::default()),
            capabilities: RwLock::new(Capabilities::default()),
            in_flight,
            closing: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language(&self) -> &str {
        &self.description.language
    }

    pub fn description(&self) -> &WorkerDescription {
        &self.description
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Initialized
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.read().clone()
    }

    pub fn load_state(&self, function_id: &str) -> Option<FunctionLoadState> {
        self.inner
            .lock()
            .functions
            .get(function_id)
            .map(|buffer| buffer.state.clone())
    }

    pub fn has_invocation(&self, invocation_id: &str) -> bool {
        self.inner.lock().invocations.contains_key(invocation_id)
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Moves to `next` if the state machine allows it.
    fn transition(&self, next: ChannelState) -> bool {
        let mut from = None;
        let moved = self.state.send_if_modified(|current| {
            from = Some(*current);
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(worker_id = %self.id, ?from, to = ?next, "channel state changed");
        } else {
            tracing::debug!(worker_id = %self.id, ?from, to = ?next, "refused channel state change");
        }
        moved
    }

    fn create_context(&self) -> WorkerCreateContext {
        let mut environment = self.settings.environment.clone();
        environment
            .entry(env::FUNCTIONS_WORKER_DIRECTORY.to_string())
            .or_insert_with(|| self.description.worker_directory.display().to_string());
        environment
            .entry(env::FUNCTIONS_APPLICATION_DIRECTORY.to_string())
            .or_insert_with(|| self.settings.app_directory.display().to_string());

        WorkerCreateContext {
            request_id: Uuid::new_v4().to_string(),
            worker_id: self.id.clone(),
            language: self.description.language.clone(),
            executable: self.description.executable.clone(),
            arguments: self.description.arguments.clone(),
            worker_path: self.description.worker_path.clone(),
            working_directory: self.description.worker_directory.clone(),
            server_uri: self.settings.server_uri.clone(),
            max_message_length: MAX_MESSAGE_LENGTH,
            environment,
        }
    }

    /// Launches the worker process and runs the init handshake.
    ///
    /// On success the channel is `Initialized` and `ChannelReady` has been
    /// published. On failure the channel is `Errored`; timeouts and rejected
    /// init responses are also published as `WorkerError`. A worker that dies
    /// during startup is reported by its process supervisor instead, and launch
    /// failures are only returned.
    ///
    /// # Errors
    ///
    /// Returns the launch, timeout or init failure unchanged.
    pub async fn start_worker_process(self: &Arc<Self>) -> Result<()> {
        let connection = self.router.register(&self.id);
        if !self.transition(ChannelState::Connecting) {
            self.router.unregister(&self.id);
            return Err(Error::channel(format!("worker {} was already started", self.id)));
        }

        let process = match self
            .launcher
            .launch(self.create_context(), self.events.clone())
            .await
        {
            Ok(process) => process,
            Err(e) => {
                self.router.unregister(&self.id);
                self.transition(ChannelState::Errored);
                return Err(e);
            }
        };
        // A shutdown that ran while the launch was pending found no process
        // to stop, so the late arrival is stopped here.
        let orphan = {
            let mut slot = self.process.lock();
            if self.disposed.load(Ordering::Acquire) {
                Some(process)
            } else {
                *slot = Some(process);
                None
            }
        };
        if let Some(process) = orphan {
            tracing::debug!(worker_id = %self.id, "channel shut down during launch, stopping worker");
            process.stop().await;
            self.router.unregister(&self.id);
            return Err(Error::ServiceShutdown);
        }

        let result = tokio::select! {
            result = self.handshake(connection) => result,
            () = self.closing.cancelled() => Err(Error::ServiceShutdown),
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    worker_id = %self.id,
                    language = %self.language(),
                    "language worker initialized"
                );
                self.events.publish(HostEvent::ChannelReady {
                    language: self.language().to_string(),
                    worker_id: self.id.clone(),
                });
                Ok(())
            }
            Err(e) => {
                self.router.unregister(&self.id);
                self.transition(ChannelState::Errored);
                tracing::error!(worker_id = %self.id, language = %self.language(), error = %e, "language worker failed to start");
                if matches!(e, Error::Timeout { .. } | Error::WorkerFault { .. }) {
                    self.events.publish(HostEvent::WorkerError(WorkerHealthEvent::error(
                        self.language(),
                        self.id.clone(),
                        e.clone(),
                    )));
                }
                Err(e)
            }
        }
    }

    async fn handshake(
        self: &Arc<Self>,
        connection: oneshot::Receiver<WorkerConnection>,
    ) -> Result<()> {
        let process_start = self.settings.timeouts.process_start;
        let WorkerConnection { inbound, outbound } =
            match tokio::time::timeout(process_start, connection).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(_)) => return Err(Error::channel("worker registration was dropped")),
                Err(_) => return Err(Error::timeout("worker stream", process_start)),
            };
        if self.outbound.set(outbound).is_err() {
            return Err(Error::channel("worker stream connected twice"));
        }

        let (init_tx, init_rx) = oneshot::channel();
        self.inner.lock().init = Some(init_tx);
        tokio::spawn(Arc::clone(self).read_loop(inbound));

        self.transition(ChannelState::Initializing);
        self.send(Content::WorkerInitRequest(WorkerInitRequest {
            host_version: HOST_VERSION.to_string(),
            capabilities: HashMap::new(),
            worker_directory: self.description.worker_directory.display().to_string(),
            function_app_directory: self.settings.app_directory.display().to_string(),
        }))
        .await?;

        let init = self.settings.timeouts.init;
        let response = match tokio::time::timeout(init, init_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::channel("worker stream closed during init")),
            Err(_) => {
                self.inner.lock().init.take();
                return Err(Error::timeout("worker init response", init));
            }
        };

        let status = response.result.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::WorkerFault {
                worker_id: self.id.clone(),
                message: format!("init failed: {}", status.failure_message()),
            });
        }

        self.apply_capabilities(&response.capabilities, UpdateStrategy::Replace);
        if self.transition(ChannelState::Initialized) {
            Ok(())
        } else {
            Err(Error::ServiceShutdown)
        }
    }

    fn apply_capabilities(&self, incoming: &HashMap<String, String>, strategy: UpdateStrategy) {
        if self.capabilities.write().update(incoming, strategy) {
            tracing::debug!(worker_id = %self.id, ?strategy, capabilities = ?incoming, "worker capabilities updated");
        }
    }

    async fn send(&self, content: Content) -> Result<()> {
        let outbound = self
            .outbound
            .get()
            .ok_or_else(|| Error::channel(format!("worker {} is not connected", self.id)))?;
        outbound
            .send(StreamingMessage::new(Uuid::new_v4().to_string(), content))
            .await
            .map_err(|_| Error::channel(format!("worker {} stream closed", self.id)))
    }

    /// Creates a pending buffer for every function not seen before.
    pub fn setup_function_buffers(&self, functions: &[FunctionDescriptor]) {
        let mut inner = self.inner.lock();
        for function in functions {
            inner
                .functions
                .entry(function.id.clone())
                .or_insert_with(|| FunctionBuffer {
                    name: function.name.clone(),
                    state: FunctionLoadState::Pending,
                    queued: Vec::new(),
                });
        }
    }

    /// Sends one load request per function, enabled functions first.
    ///
    /// # Errors
    ///
    /// Fails only when the stream is gone; per-function load failures arrive
    /// later and are recorded on the buffer.
    pub async fn load_functions(&self, functions: &[FunctionDescriptor]) -> Result<()> {
        self.setup_function_buffers(functions);
        for function in load_order(functions) {
            tracing::debug!(worker_id = %self.id, function = %function.name, "loading function");
            self.send(Content::FunctionLoadRequest(FunctionLoadRequest {
                function_id: function.id.clone(),
                metadata: Some(function.to_rpc_metadata()),
            }))
            .await?;
        }
        Ok(())
    }

    /// Runs one invocation on this worker.
    ///
    /// # Errors
    ///
    /// - [`Error::InvocationCancelled`] if `cancel` fires first (an already
    ///   cancelled invocation is never sent).
    /// - [`Error::FunctionLoad`] replayed from a failed load.
    /// - [`Error::Timeout`] after the function timeout.
    /// - [`Error::InvocationFailed`] if the worker reports a failure.
    pub async fn invoke(
        &self,
        context: InvocationContext,
        cancel: CancellationToken,
    ) -> Result<InvocationResult> {
        if cancel.is_cancelled() {
            tracing::debug!(invocation_id = %context.invocation_id, "invocation cancelled before dispatch");
            return Err(Error::InvocationCancelled);
        }
        if !self.is_ready() {
            return Err(Error::channel(format!(
                "worker {} is {:?}",
                self.id,
                self.state()
            )));
        }

        let invocation_id = context.invocation_id.clone();
        let request = InvocationRequest {
            invocation_id: invocation_id.clone(),
            function_id: context.function_id.clone(),
            input_data: context.inputs,
            trigger_metadata: context.trigger_metadata,
            trace_context: context.execution.trace_context,
        };

        let (tx, rx) = oneshot::channel();
        let send_now = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(buffer) = inner.functions.get_mut(&context.function_id) else {
                return Err(Error::FunctionNotLoaded {
                    function: context.function_name,
                });
            };
            let send_now = match &buffer.state {
                FunctionLoadState::Failed(e) => return Err(e.clone()),
                FunctionLoadState::Loaded => true,
                FunctionLoadState::Pending => {
                    buffer.queued.push(request.clone());
                    false
                }
            };
            inner.invocations.insert(
                invocation_id.clone(),
                PendingInvocation {
                    function_id: context.function_id.clone(),
                    sent: send_now,
                    tx,
                },
            );
            self.in_flight.send_replace(inner.invocations.len());
            send_now
        };

        if send_now {
            if let Err(e) = self.send(Content::InvocationRequest(request)).await {
                self.forget_invocation(&invocation_id);
                return Err(e);
            }
        }

        let function_timeout = self.settings.timeouts.function;
        let outcome = tokio::select! {
            response = tokio::time::timeout(function_timeout, rx) => match response {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => Err(Error::channel(format!("worker {} dropped the invocation", self.id))),
                Err(_) => {
                    self.forget_invocation(&invocation_id);
                    Err(Error::timeout("invocation response", function_timeout))
                }
            },
            () = cancel.cancelled() => {
                self.cancel_invocation(&invocation_id).await;
                Err(Error::InvocationCancelled)
            }
        };

        outcome.and_then(|response| invocation_result(invocation_id, response))
    }

    fn forget_invocation(&self, invocation_id: &str) -> Option<PendingInvocation> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pending = inner.invocations.remove(invocation_id)?;
        if !pending.sent {
            if let Some(buffer) = inner.functions.get_mut(&pending.function_id) {
                buffer.queued.retain(|r| r.invocation_id != invocation_id);
            }
        }
        self.in_flight.send_replace(inner.invocations.len());
        Some(pending)
    }

    async fn cancel_invocation(&self, invocation_id: &str) {
        let Some(pending) = self.forget_invocation(invocation_id) else {
            return;
        };
        let forward = self
            .capabilities
            .read()
            .is_enabled(capabilities::HANDLES_INVOCATION_CANCEL_MESSAGE);
        if pending.sent && forward {
            let cancel = Content::InvocationCancel(InvocationCancel {
                invocation_id: invocation_id.to_string(),
            });
            if let Err(e) = self.send(cancel).await {
                tracing::debug!(worker_id = %self.id, %invocation_id, error = %e, "could not forward cancellation");
            }
        }
    }

    /// Hands the worker a new environment, as on specialization.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] after the init timeout or
    /// [`Error::WorkerFault`] if the worker rejects the reload.
    pub async fn reload_environment(
        &self,
        variables: &HashMap<String, Option<String>>,
    ) -> Result<()> {
        let request = build_environment_reload_request(
            variables,
            &self.description.worker_directory,
            &self.settings.app_directory,
        );

        let (tx, rx) = oneshot::channel();
        if self.inner.lock().reload.replace(tx).is_some() {
            tracing::warn!(worker_id = %self.id, "replacing pending environment reload");
        }
        self.send(Content::FunctionEnvironmentReloadRequest(request))
            .await?;

        let init = self.settings.timeouts.init;
        let response = match tokio::time::timeout(init, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(Error::channel("worker stream closed during reload")),
            Err(_) => {
                self.inner.lock().reload.take();
                return Err(Error::timeout("environment reload response", init));
            }
        };

        let status = response.result.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::WorkerFault {
                worker_id: self.id.clone(),
                message: format!("environment reload failed: {}", status.failure_message()),
            });
        }
        self.apply_capabilities(&response.capabilities, UpdateStrategy::Merge);
        tracing::info!(worker_id = %self.id, "worker environment reloaded");
        Ok(())
    }

    /// Resolves once no invocation is in flight.
    pub async fn drain_invocations(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Stops the worker and fails everything still waiting on it.
    ///
    /// Safe to call more than once; only the first call has an effect.
    pub async fn shutdown(&self, fault: Option<Error>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(worker_id = %self.id, language = %self.language(), fault = ?fault, "shutting down language worker");

        let notify = self
            .capabilities
            .read()
            .is_enabled(capabilities::HANDLES_WORKER_TERMINATE_MESSAGE);
        if notify {
            let terminate = Content::WorkerTerminate(WorkerTerminate {
                grace_period_ms: WORKER_TERMINATE_GRACE.as_millis() as u64,
            });
            match tokio::time::timeout(TERMINATE_SEND_TIMEOUT, self.send(terminate)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(worker_id = %self.id, error = %e, "could not send terminate"),
                Err(_) => tracing::debug!(worker_id = %self.id, "timed out sending terminate"),
            }
        }

        self.transition(ChannelState::Errored);
        self.fail_pending(fault.unwrap_or(Error::ServiceShutdown));
        self.closing.cancel();
        self.router.unregister(&self.id);

        let process = self.process.lock().take();
        if let Some(process) = process {
            process.stop().await;
        }
    }

    fn fail_pending(&self, fault: Error) {
        let pending: Vec<PendingInvocation> = {
            let mut inner = self.inner.lock();
            inner.init.take();
            inner.reload.take();
            for buffer in inner.functions.values_mut() {
                buffer.queued.clear();
            }
            inner.invocations.drain().map(|(_, pending)| pending).collect()
        };
        self.in_flight.send_replace(0);
        for invocation in pending {
            let _ = invocation.tx.send(Err(fault.clone()));
        }
    }

    async fn read_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<StreamingMessage>) {
        loop {
            let frame = tokio::select! {
                biased;
                () = self.closing.cancelled() => break,
                frame = inbound.recv() => frame,
            };
            let Some(frame) = frame else {
                self.on_stream_closed();
                break;
            };
            if let Err(fault) = self.handle_frame(frame).await {
                tracing::error!(worker_id = %self.id, error = %fault, "worker protocol fault");
                let ready = self.is_ready();
                self.transition(ChannelState::Errored);
                self.fail_pending(fault.clone());
                // Faults during startup surface through `start_worker_process`.
                if ready {
                    self.events.publish(HostEvent::WorkerError(WorkerHealthEvent::error(
                        self.language(),
                        self.id.clone(),
                        fault,
                    )));
                }
                break;
            }
        }
        tracing::debug!(worker_id = %self.id, "read loop finished");
    }

    fn on_stream_closed(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        tracing::warn!(worker_id = %self.id, language = %self.language(), "worker stream closed");
        self.transition(ChannelState::Errored);
        self.fail_pending(Error::WorkerFault {
            worker_id: self.id.clone(),
            message: "worker stream closed".to_string(),
        });
    }

    async fn handle_frame(&self, frame: StreamingMessage) -> Result<()> {
        let kind = frame.kind();
        let Some(content) = frame.content else {
            return Err(Error::protocol("frame without content"));
        };
        tracing::trace!(worker_id = %self.id, %kind, "frame from worker");

        match content {
            Content::WorkerInitResponse(response) => {
                let waiter = self.inner.lock().init.take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::warn!(worker_id = %self.id, "unexpected init response"),
                }
            }
            Content::FunctionEnvironmentReloadResponse(response) => {
                let waiter = self.inner.lock().reload.take();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::warn!(worker_id = %self.id, "unexpected environment reload response"),
                }
            }
            Content::FunctionLoadResponse(response) => self.on_function_loaded(response).await,
            Content::InvocationResponse(response) => {
                let pending = self.forget_invocation(&response.invocation_id);
                match pending {
                    Some(pending) => {
                        let _ = pending.tx.send(Ok(response));
                    }
                    None => tracing::debug!(
                        worker_id = %self.id,
                        invocation_id = %response.invocation_id,
                        "response for unknown or abandoned invocation"
                    ),
                }
            }
            Content::RpcLog(log) => emit_worker_log(&self.id, &log),
            Content::StartStream(_)
            | Content::WorkerInitRequest(_)
            | Content::FunctionLoadRequest(_)
            | Content::InvocationRequest(_)
            | Content::FunctionEnvironmentReloadRequest(_)
            | Content::WorkerTerminate(_)
            | Content::InvocationCancel(_) => {
                return Err(Error::protocol(format!("unexpected {kind} from worker")));
            }
        }
        Ok(())
    }

    async fn on_function_loaded(&self, response: FunctionLoadResponse) {
        let status = response.result.unwrap_or_default();
        let (name, queued) = {
            let mut inner = self.inner.lock();
            let Some(buffer) = inner.functions.get_mut(&response.function_id) else {
                tracing::warn!(worker_id = %self.id, function_id = %response.function_id, "load response for unknown function");
                return;
            };
            buffer.state = if status.is_success() {
                FunctionLoadState::Loaded
            } else {
                FunctionLoadState::Failed(Error::FunctionLoad {
                    function: buffer.name.clone(),
                    message: status.failure_message(),
                })
            };
            (buffer.name.clone(), core::mem::take(&mut buffer.queued))
        };

        if !status.is_success() {
            let fault = Error::FunctionLoad {
                function: name.clone(),
                message: status.failure_message(),
            };
            tracing::error!(worker_id = %self.id, function = %name, error = %fault, "function failed to load");
            for request in queued {
                if let Some(pending) = self.forget_invocation(&request.invocation_id) {
                    let _ = pending.tx.send(Err(fault.clone()));
                }
            }
            return;
        }

        tracing::debug!(worker_id = %self.id, function = %name, queued = queued.len(), "function loaded");
        for request in queued {
            let invocation_id = request.invocation_id.clone();
            let still_waiting = {
                let mut inner = self.inner.lock();
                match inner.invocations.get_mut(&invocation_id) {
                    Some(pending) => {
                        pending.sent = true;
                        true
                    }
                    None => false,
                }
            };
            if !still_waiting {
                continue;
            }
            if let Err(e) = self.send(Content::InvocationRequest(request)).await {
                if let Some(pending) = self.forget_invocation(&invocation_id) {
                    let _ = pending.tx.send(Err(e));
                }
            }
        }
    }
}

impl core::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("id", &self.id)
            .field("language", &self.description.language)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn invocation_result(invocation_id: InvocationId, response: InvocationResponse) -> Result<InvocationResult> {
    let status: StatusResult = response.result.unwrap_or_default();
    if !status.is_success() {
        return Err(Error::InvocationFailed {
            invocation_id,
            message: status.failure_message(),
        });
    }
    Ok(InvocationResult {
        invocation_id,
        outputs: response.output_data,
        return_value: response.return_value,
    })
}

/// Enabled functions first, then disabled ones; enumeration order otherwise.
pub fn load_order(functions: &[FunctionDescriptor]) -> Vec<&FunctionDescriptor> {
    let mut ordered: Vec<&FunctionDescriptor> = functions.iter().collect();
    ordered.sort_by_key(|function| function.is_disabled);
    ordered
}

/// Builds the reload frame: null and empty values are dropped, and the worker
/// and app directories are added unless the caller already set them.
pub fn build_environment_reload_request(
    variables: &HashMap<String, Option<String>>,
    worker_directory: &Path,
    app_directory: &Path,
) -> FunctionEnvironmentReloadRequest {
    let mut environment_variables: HashMap<String, String> = variables
        .iter()
        .filter_map(|(name, value)| match value {
            Some(value) if !value.is_empty() => Some((name.clone(), value.clone())),
            _ => None,
        })
        .collect();
    environment_variables
        .entry(env::FUNCTIONS_WORKER_DIRECTORY.to_string())
        .or_insert_with(|| worker_directory.display().to_string());
    environment_variables
        .entry(env::FUNCTIONS_APPLICATION_DIRECTORY.to_string())
        .or_insert_with(|| app_directory.display().to_string());

    FunctionEnvironmentReloadRequest {
        environment_variables,
        function_app_directory: app_directory.display().to_string(),
    }
}
