//! Starting and stopping worker processes.

use crate::server::events::{EventBus, HostEvent, WorkerHealthEvent};
use crate::server::process::output::{ErrorRing, record_line};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use stratus_rpc_core::{
    Error, Result,
    types::{INTENTIONAL_RESTART_EXIT_CODE, STDERR_BUFFER_CAPACITY, WorkerId},
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const OUTPUT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to start one worker process.
#[derive(Debug, Clone)]
pub struct WorkerCreateContext {
    pub request_id: String,
    pub worker_id: WorkerId,
    pub language: String,
    pub executable: String,
    pub arguments: Vec<String>,
    pub worker_path: Option<PathBuf>,
    pub working_directory: PathBuf,
    pub server_uri: String,
    pub max_message_length: usize,
    pub environment: HashMap<String, String>,
}

impl WorkerCreateContext {
    /// Arguments passed to the executable, ending with the connection flags
    /// every worker understands.
    pub fn command_line(&self) -> Vec<String> {
        let mut args = self.arguments.clone();
        if let Some(path) = &self.worker_path {
            args.push(path.display().to_string());
        }

        let authority = self
            .server_uri
            .split_once("://")
            .map_or(self.server_uri.as_str(), |(_, rest)| rest);
        if let Some((host, port)) = authority.rsplit_once(':') {
            args.extend(["--host".to_string(), host.to_string(), "--port".to_string(), port.to_string()]);
        }

        args.extend([
            "--workerId".to_string(),
            self.worker_id.clone(),
            "--requestId".to_string(),
            self.request_id.clone(),
            "--grpcMaxMessageLength".to_string(),
            self.max_message_length.to_string(),
            "--functions-uri".to_string(),
            self.server_uri.clone(),
        ]);
        args
    }
}

/// A running worker process.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// The most recent error lines the process wrote.
    fn recent_errors(&self) -> Vec<String>;

    /// Terminates the process. Exits caused by `stop` publish no health event.
    async fn stop(&self);
}

#[async_trait]
pub trait WorkerProcessLauncher: Send + Sync {
    /// Starts a worker. Launch failures are returned as-is and never retried
    /// here.
    async fn launch(
        &self,
        context: WorkerCreateContext,
        events: EventBus,
    ) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches workers as OS child processes.
#[derive(Debug, Clone, Default)]
pub struct OsProcessLauncher;

#[async_trait]
impl WorkerProcessLauncher for OsProcessLauncher {
    async fn launch(
        &self,
        context: WorkerCreateContext,
        events: EventBus,
    ) -> Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&context.executable);
        command
            .args(context.command_line())
            .current_dir(&context.working_directory)
            .envs(&context.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| Error::ProcessLaunch {
            reason: format!("{}: {e}", context.executable),
        })?;
        let pid = child.id();

        tracing::info!(
            worker_id = %context.worker_id,
            language = %context.language,
            pid,
            "started worker process"
        );

        let errors = ErrorRing::new(STDERR_BUFFER_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, &context, errors.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, &context, errors.clone()));
        }

        let stopping = CancellationToken::new();
        let watcher = tokio::spawn(watch_exit(
            child,
            readers,
            context.language.clone(),
            context.worker_id.clone(),
            errors.clone(),
            events,
            stopping.clone(),
        ));

        Ok(Box::new(OsWorkerProcess {
            pid,
            errors,
            stopping,
            watcher: Mutex::new(Some(watcher)),
        }))
    }
}

struct OsWorkerProcess {
    pid: Option<u32>,
    errors: ErrorRing,
    stopping: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl WorkerProcess for OsWorkerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn recent_errors(&self) -> Vec<String> {
        self.errors.snapshot()
    }

    async fn stop(&self) {
        self.stopping.cancel();
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            if tokio::time::timeout(STOP_TIMEOUT, watcher).await.is_err() {
                tracing::warn!(pid = self.pid, "worker process did not exit in time");
            }
        }
    }
}

fn spawn_reader<R>(stream: R, context: &WorkerCreateContext, errors: ErrorRing) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let worker_id = context.worker_id.clone();
    let language = context.language.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => record_line(&worker_id, &language, &line, &errors),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(%worker_id, error = %e, "stopped reading worker output");
                    break;
                }
            }
        }
    })
}

async fn watch_exit(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    language: String,
    worker_id: WorkerId,
    errors: ErrorRing,
    events: EventBus,
    stopping: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = stopping.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::debug!(%worker_id, error = %e, "failed to kill worker process");
            }
            tracing::debug!(%worker_id, "worker process stopped");
            return;
        }
    };

    // Let the readers drain so the last stderr lines make it into the fault.
    let _ = tokio::time::timeout(OUTPUT_FLUSH_TIMEOUT, futures::future::join_all(readers)).await;

    if stopping.is_cancelled() {
        return;
    }

    match status {
        Ok(status) => {
            if let Some(event) = exit_event(status, &language, &worker_id, &errors) {
                events.publish(event);
            }
        }
        Err(e) => {
            let fault = Error::WorkerFault {
                worker_id: worker_id.clone(),
                message: format!("failed to observe worker exit: {e}"),
            };
            events.publish(HostEvent::WorkerError(WorkerHealthEvent::error(
                language, worker_id, fault,
            )));
        }
    }
}

/// Maps a worker's exit status to the health event it should raise.
pub fn exit_event(
    status: ExitStatus,
    language: &str,
    worker_id: &str,
    errors: &ErrorRing,
) -> Option<HostEvent> {
    match status.code() {
        Some(0) => {
            tracing::info!(%worker_id, %language, "worker process exited");
            None
        }
        Some(INTENTIONAL_RESTART_EXIT_CODE) => {
            tracing::info!(%worker_id, %language, "worker process requested a restart");
            Some(HostEvent::WorkerRestart(WorkerHealthEvent::restart(
                language, worker_id,
            )))
        }
        code => {
            let recent = errors.snapshot();
            let mut message = match code {
                Some(code) => format!("worker process exited with code {code}"),
                None => "worker process was terminated by a signal".to_string(),
            };
            if !recent.is_empty() {
                message.push_str(": ");
                message.push_str(&recent.join(", "));
            }
            tracing::error!(%worker_id, %language, "{message}");
            let fault = Error::WorkerFault {
                worker_id: worker_id.to_string(),
                message,
            };
            Some(HostEvent::WorkerError(WorkerHealthEvent::error(
                language, worker_id, fault,
            )))
        }
    }
}
