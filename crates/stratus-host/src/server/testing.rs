//! Test doubles shared by the unit tests of the host.
//!
//! [`FakeLauncher`] stands in for the OS process launcher: instead of spawning
//! a process it starts an in-process worker task that dials the router like a
//! real worker would and answers every host frame according to a
//! [`WorkerScript`].

use crate::server::config::{
    ChannelTimeouts, DispatchOptions, HostConfig, Platform, WorkerDescription,
};
use crate::server::events::{EventBus, HostEvent, WorkerHealthEvent};
use crate::server::process::{WorkerCreateContext, WorkerProcess, WorkerProcessLauncher};
use crate::server::rpc::{RpcRouter, WorkerEndpoint};
use async_trait::async_trait;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use stratus_rpc_core::{
    Error, Result,
    proto::{
        FunctionEnvironmentReloadResponse, FunctionLoadResponse, InvocationResponse, StatusResult,
        StreamingMessage, TypedData, WorkerInitResponse, streaming_message::Content,
    },
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) fn test_config() -> HostConfig {
    let workers_directory = PathBuf::from("/opt/stratus/workers");
    let workers = ["node", "python", "java", "powershell"]
        .into_iter()
        .map(|language| {
            let worker_directory = workers_directory.join(language);
            (
                language.to_string(),
                WorkerDescription {
                    language: language.to_string(),
                    executable: format!("{language}-worker"),
                    arguments: Vec::new(),
                    worker_path: None,
                    worker_directory,
                    supports_environment_reload: language != "java",
                },
            )
        })
        .collect();

    HostConfig {
        server_addr: "127.0.0.1:0".to_string(),
        worker_runtime: None,
        process_count: None,
        placeholder_mode: false,
        container_start_context: None,
        app_directory: PathBuf::from("/home/site/wwwroot"),
        workers_directory,
        placeholder_languages: vec!["node".to_string(), "python".to_string()],
        workers,
        platform: Platform::Linux,
        mount_enabled: false,
        timeouts: ChannelTimeouts {
            process_start: Duration::from_millis(500),
            init: Duration::from_millis(500),
            function: Duration::from_secs(2),
        },
        dispatch: DispatchOptions {
            process_startup_interval: Duration::from_millis(5),
            restart_delay: Duration::from_millis(10),
            error_window: Duration::from_secs(60),
            idle_shutdown_debounce: Duration::from_millis(50),
            shutdown_timeout: Duration::from_millis(500),
        },
    }
}

/// How a fake worker behaves.
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkerScript {
    pub fail_launch: bool,
    pub never_connect: bool,
    pub silent_init: bool,
    pub reject_init: bool,
    pub capabilities: HashMap<String, String>,
    /// Names of functions whose load fails.
    pub failing_functions: HashSet<String>,
    pub load_delay: Duration,
    pub invocation_delay: Duration,
    pub reject_reload: bool,
    /// How long `launch` takes before handing back the process.
    pub launch_delay: Duration,
}

#[derive(Clone)]
pub(crate) struct FakeWorker {
    pub worker_id: String,
    pub language: String,
    frames: Arc<Mutex<Vec<StreamingMessage>>>,
    crash: CancellationToken,
    restart: CancellationToken,
    stopped: CancellationToken,
    exited: CancellationToken,
}

impl FakeWorker {
    /// Every frame the host sent this worker.
    pub fn frames(&self) -> Vec<StreamingMessage> {
        self.frames.lock().clone()
    }

    pub fn frame_kinds(&self) -> Vec<&'static str> {
        self.frames.lock().iter().map(StreamingMessage::kind).collect()
    }

    /// Simulates the process dying with an error.
    pub fn crash(&self) {
        self.crash.cancel();
    }

    /// Simulates the process exiting with the restart code.
    pub fn request_restart(&self) {
        self.restart.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}

pub(crate) struct FakeLauncher {
    router: RpcRouter,
    script: Mutex<WorkerScript>,
    workers: Mutex<Vec<FakeWorker>>,
    launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(router: RpcRouter) -> Arc<Self> {
        Self::with_script(router, WorkerScript::default())
    }

    pub fn with_script(router: RpcRouter, script: WorkerScript) -> Arc<Self> {
        Arc::new(Self {
            router,
            script: Mutex::new(script),
            workers: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
        })
    }

    pub fn set_script(&self, script: WorkerScript) {
        *self.script.lock() = script;
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> Vec<FakeWorker> {
        self.workers.lock().clone()
    }

    pub fn worker(&self, worker_id: &str) -> Option<FakeWorker> {
        self.workers
            .lock()
            .iter()
            .find(|worker| worker.worker_id == worker_id)
            .cloned()
    }
}

struct FakeProcess {
    stopped: CancellationToken,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn recent_errors(&self) -> Vec<String> {
        Vec::new()
    }

    async fn stop(&self) {
        self.stopped.cancel();
    }
}

#[async_trait]
impl WorkerProcessLauncher for FakeLauncher {
    async fn launch(
        &self,
        context: WorkerCreateContext,
        events: EventBus,
    ) -> Result<Box<dyn WorkerProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().clone();
        if script.fail_launch {
            return Err(Error::ProcessLaunch {
                reason: format!("{}: not found", context.executable),
            });
        }

        let worker = FakeWorker {
            worker_id: context.worker_id.clone(),
            language: context.language.clone(),
            frames: Arc::new(Mutex::new(Vec::new())),
            crash: CancellationToken::new(),
            restart: CancellationToken::new(),
            stopped: CancellationToken::new(),
            exited: CancellationToken::new(),
        };
        self.workers.lock().push(worker.clone());
        let stopped = worker.stopped.clone();
        if !script.launch_delay.is_zero() {
            tokio::time::sleep(script.launch_delay).await;
        }

        if !script.never_connect {
            let router = self.router.clone();
            tokio::spawn(async move {
                // Give the channel a moment, like a real process starting up.
                tokio::task::yield_now().await;
                match router.connect(&worker.worker_id) {
                    Ok(endpoint) => run_worker(worker, script, endpoint, events).await,
                    Err(e) => tracing::debug!(error = %e, "fake worker could not connect"),
                }
            });
        }

        Ok(Box::new(FakeProcess { stopped }))
    }
}

async fn run_worker(
    worker: FakeWorker,
    script: WorkerScript,
    mut endpoint: WorkerEndpoint,
    events: EventBus,
) {
    // Replies still in flight die with the worker.
    let _exited = worker.exited.clone().drop_guard();
    loop {
        let frame = tokio::select! {
            () = worker.stopped.cancelled() => return,
            () = worker.crash.cancelled() => {
                events.publish(HostEvent::WorkerError(WorkerHealthEvent::error(
                    worker.language.clone(),
                    worker.worker_id.clone(),
                    Error::WorkerFault {
                        worker_id: worker.worker_id.clone(),
                        message: "worker process exited with code 1".to_string(),
                    },
                )));
                return;
            }
            () = worker.restart.cancelled() => {
                events.publish(HostEvent::WorkerRestart(WorkerHealthEvent::restart(
                    worker.language.clone(),
                    worker.worker_id.clone(),
                )));
                return;
            }
            frame = endpoint.from_host.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        worker.frames.lock().push(frame.clone());
        let Some(content) = frame.content else {
            continue;
        };
        let reply = match content {
            Content::WorkerInitRequest(_) => {
                if script.silent_init {
                    continue;
                }
                let result = if script.reject_init {
                    StatusResult::failure("unsupported host version")
                } else {
                    StatusResult::success()
                };
                Content::WorkerInitResponse(WorkerInitResponse {
                    worker_version: "1.0.0".to_string(),
                    capabilities: script.capabilities.clone(),
                    result: Some(result),
                })
            }
            Content::FunctionLoadRequest(request) => {
                let name = request.metadata.map(|m| m.name).unwrap_or_default();
                let result = if script.failing_functions.contains(&name) {
                    StatusResult::failure(format!("cannot load {name}"))
                } else {
                    StatusResult::success()
                };
                respond_later(
                    endpoint.to_host.clone(),
                    worker.exited.clone(),
                    script.load_delay,
                    Content::FunctionLoadResponse(FunctionLoadResponse {
                        function_id: request.function_id,
                        result: Some(result),
                    }),
                );
                continue;
            }
            Content::InvocationRequest(request) => {
                respond_later(
                    endpoint.to_host.clone(),
                    worker.exited.clone(),
                    script.invocation_delay,
                    Content::InvocationResponse(InvocationResponse {
                        invocation_id: request.invocation_id,
                        output_data: Vec::new(),
                        return_value: Some(TypedData::string(worker.worker_id.clone())),
                        result: Some(StatusResult::success()),
                    }),
                );
                continue;
            }
            Content::FunctionEnvironmentReloadRequest(_) => {
                let result = if script.reject_reload {
                    StatusResult::failure("reload rejected")
                } else {
                    StatusResult::success()
                };
                Content::FunctionEnvironmentReloadResponse(FunctionEnvironmentReloadResponse {
                    capabilities: HashMap::from([("Reloaded".to_string(), "true".to_string())]),
                    result: Some(result),
                })
            }
            Content::WorkerTerminate(_) => return,
            _ => continue,
        };
        if endpoint
            .to_host
            .send(StreamingMessage::new(frame.request_id, reply))
            .await
            .is_err()
        {
            return;
        }
    }
}

fn respond_later(
    to_host: mpsc::Sender<StreamingMessage>,
    exited: CancellationToken,
    delay: Duration,
    content: Content,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = exited.cancelled() => {}
            () = tokio::time::sleep(delay) => {
                let _ = to_host.send(StreamingMessage::new("", content)).await;
            }
        }
    });
}
