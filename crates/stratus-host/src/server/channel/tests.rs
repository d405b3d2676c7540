use super::*;
use crate::server::config::HostConfig;
use crate::server::events::{EventBus, HostEvent};
use crate::server::metadata::{FunctionDescriptor, InvocationContext};
use crate::server::rpc::RpcRouter;
use crate::server::testing::{FakeLauncher, WorkerScript, test_config};
use core::time::Duration;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use stratus_rpc_core::{
    Error,
    proto::{streaming_message::Content, typed_data},
    types::{capabilities, env},
};
use tokio_util::sync::CancellationToken;

struct Harness {
    config: HostConfig,
    router: RpcRouter,
    launcher: Arc<FakeLauncher>,
    events: EventBus,
}

impl Harness {
    fn new(script: WorkerScript) -> Self {
        Self::with_config(test_config(), script)
    }

    fn with_config(config: HostConfig, script: WorkerScript) -> Self {
        let router = RpcRouter::new();
        let launcher = FakeLauncher::with_script(router.clone(), script);
        Self {
            config,
            router,
            launcher,
            events: EventBus::new(),
        }
    }

    fn channel(&self, language: &str) -> Arc<WorkerChannel> {
        let settings = ChannelSettings {
            timeouts: self.config.timeouts,
            server_uri: self.config.server_uri(),
            app_directory: self.config.app_directory.clone(),
            environment: HashMap::new(),
        };
        Arc::new(WorkerChannel::new(
            self.config.worker(language).unwrap().clone(),
            settings,
            self.router.clone(),
            self.launcher.clone(),
            self.events.clone(),
        ))
    }

    async fn ready_channel(&self, functions: &[FunctionDescriptor]) -> Arc<WorkerChannel> {
        let channel = self.channel("node");
        channel.start_worker_process().await.unwrap();
        channel.load_functions(functions).await.unwrap();
        channel
    }
}

fn with_capability(name: &str) -> WorkerScript {
    WorkerScript {
        capabilities: HashMap::from([(name.to_string(), "true".to_string())]),
        ..Default::default()
    }
}

async fn wait_for_loaded(channel: &WorkerChannel, function: &FunctionDescriptor) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while channel.load_state(&function.id) == Some(FunctionLoadState::Pending) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn start_reaches_initialized_and_announces_it() {
    let harness = Harness::new(WorkerScript::default());
    let mut events = harness.events.subscribe();
    let channel = harness.channel("node");
    assert_eq!(channel.state(), ChannelState::Created);

    channel.start_worker_process().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Initialized);
    assert!(channel.is_ready());

    match events.recv().await.unwrap() {
        HostEvent::ChannelReady {
            language,
            worker_id,
        } => {
            assert_eq!(language, "node");
            assert_eq!(worker_id, channel.id());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let worker = harness.launcher.worker(channel.id()).unwrap();
    match &worker.frames()[0].content {
        Some(Content::WorkerInitRequest(init)) => {
            assert_eq!(init.worker_directory, "/opt/stratus/workers/node");
            assert_eq!(init.function_app_directory, "/home/site/wwwroot");
        }
        other => panic!("unexpected first frame: {other:?}"),
    }
}

#[tokio::test]
async fn launch_failure_is_returned_without_an_event() {
    let harness = Harness::new(WorkerScript {
        fail_launch: true,
        ..Default::default()
    });
    let mut events = harness.events.subscribe();
    let channel = harness.channel("node");

    let err = channel.start_worker_process().await.unwrap_err();
    assert!(matches!(err, Error::ProcessLaunch { .. }));
    assert_eq!(channel.state(), ChannelState::Errored);
    assert!(!harness.router.is_pending(channel.id()));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn missing_stream_times_out_and_reports() {
    let harness = Harness::new(WorkerScript {
        never_connect: true,
        ..Default::default()
    });
    let mut events = harness.events.subscribe();
    let channel = harness.channel("node");

    let err = channel.start_worker_process().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
    assert_eq!(channel.state(), ChannelState::Errored);
    match events.recv().await.unwrap() {
        HostEvent::WorkerError(event) => assert_eq!(event.worker_id, channel.id()),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn silent_worker_times_out_during_init() {
    let harness = Harness::new(WorkerScript {
        silent_init: true,
        ..Default::default()
    });
    let channel = harness.channel("node");
    let err = channel.start_worker_process().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { ref operation, .. } if operation.contains("init")));
    assert_eq!(channel.state(), ChannelState::Errored);
}

#[tokio::test]
async fn rejected_init_errors_the_channel() {
    let harness = Harness::new(WorkerScript {
        reject_init: true,
        ..Default::default()
    });
    let channel = harness.channel("node");
    let err = channel.start_worker_process().await.unwrap_err();
    match err {
        Error::WorkerFault { message, .. } => assert!(message.contains("unsupported host version")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(channel.state(), ChannelState::Errored);
}

#[tokio::test]
async fn init_capabilities_replace_the_set() {
    let harness = Harness::new(with_capability(capabilities::RAW_HTTP_BODY_BYTES));
    let channel = harness.channel("node");
    channel.start_worker_process().await.unwrap();
    assert!(channel.capabilities().is_enabled(capabilities::RAW_HTTP_BODY_BYTES));
}

#[test]
fn disabled_functions_load_last() {
    let functions = vec![
        FunctionDescriptor::new("a", "node").disabled(),
        FunctionDescriptor::new("b", "node"),
        FunctionDescriptor::new("c", "node").disabled(),
        FunctionDescriptor::new("d", "node"),
    ];
    let names: Vec<&str> = load_order(&functions)
        .into_iter()
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(names, vec!["b", "d", "a", "c"]);
}

#[tokio::test]
async fn load_requests_follow_load_order() {
    let harness = Harness::new(WorkerScript::default());
    let functions = vec![
        FunctionDescriptor::new("disabled", "node").disabled(),
        FunctionDescriptor::new("enabled", "node"),
    ];
    let channel = harness.ready_channel(&functions).await;
    let worker = harness.launcher.worker(channel.id()).unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let loaded: Vec<String> = worker
        .frames()
        .into_iter()
        .filter_map(|frame| match frame.content {
            Some(Content::FunctionLoadRequest(request)) => request.metadata.map(|m| m.name),
            _ => None,
        })
        .collect();
    assert_eq!(loaded, vec!["enabled", "disabled"]);
}

#[tokio::test]
async fn invocation_round_trip() {
    let harness = Harness::new(WorkerScript::default());
    let function = FunctionDescriptor::new("http", "node");
    let channel = harness.ready_channel(std::slice::from_ref(&function)).await;
    wait_for_loaded(&channel, &function).await;

    let context = InvocationContext::new(&function, Vec::new());
    let invocation_id = context.invocation_id.clone();
    let result = channel
        .invoke(context, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.invocation_id, invocation_id);
    let value = result.return_value.and_then(|v| v.data);
    assert_eq!(
        value,
        Some(typed_data::Data::String(channel.id().to_string()))
    );
    assert_eq!(channel.in_flight(), 0);
}

#[tokio::test]
async fn invocation_waits_for_pending_load() {
    let harness = Harness::new(WorkerScript {
        load_delay: Duration::from_millis(50),
        ..Default::default()
    });
    let function = FunctionDescriptor::new("slow", "node");
    let channel = harness.ready_channel(std::slice::from_ref(&function)).await;
    assert_eq!(channel.load_state(&function.id), Some(FunctionLoadState::Pending));

    let result = channel
        .invoke(
            InvocationContext::new(&function, Vec::new()),
            CancellationToken::new(),
        )
        .await;
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(channel.load_state(&function.id), Some(FunctionLoadState::Loaded));
}

#[tokio::test]
async fn failed_load_is_replayed_on_invoke() {
    let harness = Harness::new(WorkerScript {
        failing_functions: ["broken".to_string()].into(),
        ..Default::default()
    });
    let broken = FunctionDescriptor::new("broken", "node");
    let healthy = FunctionDescriptor::new("healthy", "node");
    let channel = harness
        .ready_channel(&[broken.clone(), healthy.clone()])
        .await;
    wait_for_loaded(&channel, &broken).await;
    wait_for_loaded(&channel, &healthy).await;

    for _ in 0..2 {
        let err = channel
            .invoke(
                InvocationContext::new(&broken, Vec::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FunctionLoad { ref function, .. } if function == "broken"));
    }
    assert!(
        channel
            .invoke(
                InvocationContext::new(&healthy, Vec::new()),
                CancellationToken::new()
            )
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn unknown_function_is_rejected() {
    let harness = Harness::new(WorkerScript::default());
    let channel = harness.ready_channel(&[]).await;
    let stranger = FunctionDescriptor::new("stranger", "node");
    let err = channel
        .invoke(
            InvocationContext::new(&stranger, Vec::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FunctionNotLoaded { .. }));
}

#[tokio::test]
async fn cancelled_invocation_is_never_sent() {
    let harness = Harness::new(WorkerScript::default());
    let function = FunctionDescriptor::new("http", "node");
    let channel = harness.ready_channel(std::slice::from_ref(&function)).await;
    wait_for_loaded(&channel, &function).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = channel
        .invoke(InvocationContext::new(&function, Vec::new()), cancel)
        .await
        .unwrap_err();
    assert_eq!(err, Error::InvocationCancelled);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let worker = harness.launcher.worker(channel.id()).unwrap();
    assert!(!worker.frame_kinds().contains(&"InvocationRequest"));
}

#[tokio::test]
async fn cancellation_is_forwarded_when_supported() {
    let mut script = with_capability(capabilities::HANDLES_INVOCATION_CANCEL_MESSAGE);
    script.invocation_delay = Duration::from_secs(1);
    let harness = Harness::new(script);
    let function = FunctionDescriptor::new("http", "node");
    let channel = harness.ready_channel(std::slice::from_ref(&function)).await;
    wait_for_loaded(&channel, &function).await;

    let cancel = CancellationToken::new();
    let invoke = {
        let channel = Arc::clone(&channel);
        let cancel = cancel.clone();
        let context = InvocationContext::new(&function, Vec::new());
        tokio::spawn(async move { channel.invoke(context, cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(channel.in_flight(), 1);
    cancel.cancel();

    let err = invoke.await.unwrap().unwrap_err();
    assert_eq!(err, Error::InvocationCancelled);
    assert_eq!(channel.in_flight(), 0);
    assert_eq!(channel.state(), ChannelState::Initialized);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let worker = harness.launcher.worker(channel.id()).unwrap();
    assert!(worker.frame_kinds().contains(&"InvocationCancel"));
}

#[tokio::test]
async fn slow_invocation_times_out() {
    let mut config = test_config();
    config.timeouts.function = Duration::from_millis(50);
    let harness = Harness::with_config(
        config,
        WorkerScript {
            invocation_delay: Duration::from_secs(1),
            ..Default::default()
        },
    );
    let function = FunctionDescriptor::new("http", "node");
    let channel = harness.ready_channel(std::slice::from_ref(&function)).await;
    wait_for_loaded(&channel, &function).await;

    let err = channel
        .invoke(
            InvocationContext::new(&function, Vec::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert_eq!(channel.in_flight(), 0);
}

#[test]
fn reload_request_drops_empty_values_and_adds_directories() {
    let variables = HashMap::from([
        ("KEEP".to_string(), Some("1".to_string())),
        ("EMPTY".to_string(), Some(String::new())),
        ("NULL".to_string(), None),
    ]);
    let request = build_environment_reload_request(
        &variables,
        Path::new("/workers/node"),
        Path::new("/home/site/wwwroot"),
    );
    let vars = &request.environment_variables;
    assert_eq!(vars.get("KEEP").map(String::as_str), Some("1"));
    assert!(!vars.contains_key("EMPTY"));
    assert!(!vars.contains_key("NULL"));
    assert_eq!(
        vars.get(env::FUNCTIONS_WORKER_DIRECTORY).map(String::as_str),
        Some("/workers/node")
    );
    assert_eq!(
        vars.get(env::FUNCTIONS_APPLICATION_DIRECTORY).map(String::as_str),
        Some("/home/site/wwwroot")
    );
    assert_eq!(request.function_app_directory, "/home/site/wwwroot");
}

#[test]
fn reload_request_keeps_explicit_directories() {
    let variables = HashMap::from([(
        env::FUNCTIONS_APPLICATION_DIRECTORY.to_string(),
        Some("/mnt/app".to_string()),
    )]);
    let request =
        build_environment_reload_request(&variables, Path::new("/w"), Path::new("/home/site/wwwroot"));
    assert_eq!(
        request
            .environment_variables
            .get(env::FUNCTIONS_APPLICATION_DIRECTORY)
            .map(String::as_str),
        Some("/mnt/app")
    );
}

#[tokio::test]
async fn reload_merges_capabilities() {
    let harness = Harness::new(with_capability(capabilities::RAW_HTTP_BODY_BYTES));
    let channel = harness.ready_channel(&[]).await;
    channel
        .reload_environment(&HashMap::from([("SITE".to_string(), Some("x".to_string()))]))
        .await
        .unwrap();
    let caps = channel.capabilities();
    assert!(caps.is_enabled(capabilities::RAW_HTTP_BODY_BYTES));
    assert!(caps.is_enabled("Reloaded"));
}

#[tokio::test]
async fn rejected_reload_is_an_error() {
    let harness = Harness::new(WorkerScript {
        reject_reload: true,
        ..Default::default()
    });
    let channel = harness.ready_channel(&[]).await;
    let err = channel.reload_environment(&HashMap::new()).await.unwrap_err();
    assert!(matches!(err, Error::WorkerFault { .. }));
}

#[tokio::test]
async fn shutdown_fails_in_flight_and_terminates() {
    let mut script = with_capability(capabilities::HANDLES_WORKER_TERMINATE_MESSAGE);
    script.invocation_delay = Duration::from_secs(1);
    let harness = Harness::new(script);
    let function = FunctionDescriptor::new("http", "node");
    let channel = harness.ready_channel(std::slice::from_ref(&function)).await;
    wait_for_loaded(&channel, &function).await;

    let invoke = {
        let channel = Arc::clone(&channel);
        let context = InvocationContext::new(&function, Vec::new());
        tokio::spawn(async move { channel.invoke(context, CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let fault = Error::WorkerFault {
        worker_id: channel.id().to_string(),
        message: "restarting".into(),
    };
    channel.shutdown(Some(fault.clone())).await;
    channel.shutdown(None).await;

    assert_eq!(invoke.await.unwrap().unwrap_err(), fault);
    assert_eq!(channel.state(), ChannelState::Errored);

    let worker = harness.launcher.worker(channel.id()).unwrap();
    assert!(worker.is_stopped());
    assert!(worker.frame_kinds().contains(&"WorkerTerminate"));
}

#[tokio::test]
async fn terminate_requires_capability() {
    let harness = Harness::new(WorkerScript::default());
    let channel = harness.ready_channel(&[]).await;
    channel.shutdown(None).await;
    let worker = harness.launcher.worker(channel.id()).unwrap();
    assert!(!worker.frame_kinds().contains(&"WorkerTerminate"));
}

#[tokio::test]
async fn shutdown_during_launch_stops_the_late_process() {
    let harness = Harness::new(WorkerScript {
        launch_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let channel = harness.channel("node");
    let start = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move { channel.start_worker_process().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    channel.shutdown(None).await;

    assert_eq!(start.await.unwrap(), Err(Error::ServiceShutdown));
    assert_eq!(channel.state(), ChannelState::Errored);
    let worker = harness.launcher.worker(channel.id()).unwrap();
    assert!(worker.is_stopped());
    assert!(!harness.router.is_pending(channel.id()));
}

#[tokio::test]
async fn crashed_worker_fails_pending_invocations() {
    let harness = Harness::new(WorkerScript {
        invocation_delay: Duration::from_secs(1),
        ..Default::default()
    });
    let function = FunctionDescriptor::new("http", "node");
    let channel = harness.ready_channel(std::slice::from_ref(&function)).await;
    wait_for_loaded(&channel, &function).await;

    let invoke = {
        let channel = Arc::clone(&channel);
        let context = InvocationContext::new(&function, Vec::new());
        tokio::spawn(async move { channel.invoke(context, CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    harness.launcher.worker(channel.id()).unwrap().crash();

    let err = tokio::time::timeout(Duration::from_secs(2), invoke)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::WorkerFault { .. }), "{err:?}");
    assert_eq!(channel.state(), ChannelState::Errored);
}

#[tokio::test]
async fn drain_resolves_when_invocations_finish() {
    let harness = Harness::new(WorkerScript {
        invocation_delay: Duration::from_millis(50),
        ..Default::default()
    });
    let function = FunctionDescriptor::new("http", "node");
    let channel = harness.ready_channel(std::slice::from_ref(&function)).await;
    wait_for_loaded(&channel, &function).await;

    let invoke = {
        let channel = Arc::clone(&channel);
        let context = InvocationContext::new(&function, Vec::new());
        tokio::spawn(async move { channel.invoke(context, CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    tokio::time::timeout(Duration::from_secs(1), channel.drain_invocations())
        .await
        .unwrap();
    assert!(invoke.await.unwrap().is_ok());
}
