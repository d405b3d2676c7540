use super::*;
use crate::server::channel::ChannelState;
use crate::server::config::HostConfig;
use crate::server::testing::{FakeLauncher, WorkerScript, test_config};
use core::time::Duration;
use std::collections::HashMap;
use stratus_rpc_core::types::env;

struct Fixture {
    launcher: Arc<FakeLauncher>,
    environment: Arc<HostEnvironment>,
    factory: ChannelFactory,
}

fn fixture(config: HostConfig, script: WorkerScript) -> Fixture {
    let router = RpcRouter::new();
    let launcher = FakeLauncher::with_script(router.clone(), script);
    let environment = Arc::new(HostEnvironment::new(&config));
    let factory = ChannelFactory::new(
        router,
        launcher.clone(),
        EventBus::new(),
        Arc::new(config),
        Arc::clone(&environment),
    );
    Fixture {
        launcher,
        environment,
        factory,
    }
}

fn sized(count: usize) -> HostConfig {
    let mut config = test_config();
    config.process_count = Some(count);
    config
}

#[tokio::test]
async fn start_is_visible_before_it_completes() {
    let f = fixture(test_config(), WorkerScript::default());
    let pool = InstanceChannelPool::new(f.factory.clone());

    let pending = pool.initialize_channel("node").await.unwrap();
    let listed = pool.get_channels("NODE");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].channel().id(), pending.channel().id());

    let channel = pending.wait().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Initialized);
    assert!(pool.get_channel("node", channel.id()).is_some());
    assert_eq!(f.launcher.launches(), 1);
}

#[tokio::test]
async fn pool_refuses_channels_beyond_its_size() {
    let f = fixture(sized(2), WorkerScript::default());
    let pool = InstanceChannelPool::new(f.factory.clone());
    assert_eq!(pool.max_per_language(), 2);

    pool.initialize_channel("node").await.unwrap();
    pool.initialize_channel("node").await.unwrap();
    let err = pool.initialize_channel("node").await.err().unwrap();
    assert_eq!(
        err,
        Error::PoolFull {
            language: "node".into(),
            max: 2
        }
    );
    // Other languages have their own budget.
    assert!(pool.initialize_channel("python").await.is_ok());
}

#[tokio::test]
async fn every_waiter_sees_the_same_failure() {
    let f = fixture(
        test_config(),
        WorkerScript {
            fail_launch: true,
            ..Default::default()
        },
    );
    let pool = InstanceChannelPool::new(f.factory.clone());
    let pending = pool.initialize_channel("node").await.unwrap();
    let other = pool.get_channels("node").remove(0);

    let (first, second) = tokio::join!(pending.wait(), other.wait());
    assert!(matches!(first, Err(Error::ProcessLaunch { .. })));
    assert_eq!(first.err(), second.err());
}

#[tokio::test]
async fn unknown_language_is_rejected() {
    let f = fixture(test_config(), WorkerScript::default());
    let pool = InstanceChannelPool::new(f.factory.clone());
    assert!(matches!(
        pool.initialize_channel("cobol").await,
        Err(Error::InvalidRequest { .. })
    ));
}

#[tokio::test]
async fn shutdown_channel_is_idempotent() {
    let f = fixture(test_config(), WorkerScript::default());
    let pool = InstanceChannelPool::new(f.factory.clone());
    let channel = pool
        .initialize_channel("node")
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(pool.shutdown_channel("node", channel.id(), None).await);
    assert!(!pool.shutdown_channel("node", channel.id(), None).await);
    assert!(!pool.shutdown_channel("python", "missing", None).await);
    assert_eq!(channel.state(), ChannelState::Errored);
    assert!(pool.get_channels("node").is_empty());
}

#[tokio::test]
async fn instance_pool_follows_environment_process_count() {
    let f = fixture(test_config(), WorkerScript::default());
    f.environment.apply(&HashMap::from([(
        env::FUNCTIONS_WORKER_PROCESS_COUNT.to_string(),
        "3".to_string(),
    )]));
    let pool = InstanceChannelPool::new(f.factory.clone());
    assert_eq!(pool.max_per_language(), 3);
}

async fn warm(pool: &TenantChannelPool, language: &str) -> Arc<WorkerChannel> {
    pool.initialize_channel(language)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap()
}

#[tokio::test]
async fn read_only_specialization_reuses_placeholder_channel() {
    let f = fixture(test_config(), WorkerScript::default());
    let pool = TenantChannelPool::new(f.factory.clone());
    let node = warm(&pool, "node").await;
    let python = warm(&pool, "python").await;

    f.environment.apply(&HashMap::from([(
        env::FUNCTIONS_WORKER_RUNTIME.to_string(),
        "node".to_string(),
    )]));
    assert!(pool.uses_placeholder_channel("node", true));
    assert!(!pool.uses_placeholder_channel("node", false));

    pool.specialize(true).await.unwrap();
    assert!(node.is_ready());
    let worker = f.launcher.worker(node.id()).unwrap();
    assert!(worker.frame_kinds().contains(&"FunctionEnvironmentReloadRequest"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(python.state(), ChannelState::Errored);
    assert_eq!(pool.languages(), vec!["node".to_string()]);
}

#[tokio::test]
async fn writable_specialization_replaces_placeholder_channel() {
    let f = fixture(test_config(), WorkerScript::default());
    let pool = TenantChannelPool::new(f.factory.clone());
    let node = warm(&pool, "node").await;

    f.environment.apply(&HashMap::from([(
        env::FUNCTIONS_WORKER_RUNTIME.to_string(),
        "node".to_string(),
    )]));
    pool.specialize(false).await.unwrap();
    assert_eq!(node.state(), ChannelState::Errored);
    assert!(pool.ready_channels("node").is_empty());
}

#[tokio::test]
async fn languages_without_live_reload_are_replaced() {
    let f = fixture(test_config(), WorkerScript::default());
    let pool = TenantChannelPool::new(f.factory.clone());
    warm(&pool, "java").await;
    assert!(!pool.uses_placeholder_channel("java", true));
}

#[tokio::test]
async fn standby_shutdown_keeps_one_language() {
    let f = fixture(test_config(), WorkerScript::default());
    let pool = TenantChannelPool::new(f.factory.clone());
    warm(&pool, "node").await;
    warm(&pool, "python").await;
    warm(&pool, "powershell").await;

    assert_eq!(pool.shutdown_standby_channels_except(Some("Python")).await, 2);
    assert_eq!(pool.languages(), vec!["python".to_string()]);
}

#[tokio::test]
async fn idle_shutdown_collapses_repeated_requests() {
    let f = fixture(test_config(), WorkerScript::default());
    let pool = TenantChannelPool::new(f.factory.clone());
    let node = warm(&pool, "node").await;

    for _ in 0..3 {
        pool.schedule_idle_shutdown();
    }
    assert!(node.is_ready());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(node.state(), ChannelState::Errored);
    assert!(pool.languages().is_empty());
}
