use clap::Parser;
use std::sync::Arc;
use stratus_host::server::config::{CliArgs, HostConfig};
use stratus_host::server::host::ScriptHost;
use stratus_host::server::metadata::DirectoryMetadataProvider;
use stratus_host::server::process::OsProcessLauncher;
use stratus_host::server::rpc::{FunctionRpcService, RpcRouter};
use stratus_host::server::telemetry::{TelemetryProviders, init_telemetry};
use stratus_rpc_core::proto::function_rpc_server::FunctionRpcServer;
use stratus_rpc_core::types::MAX_MESSAGE_LENGTH;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = Arc::new(HostConfig::try_from(args)?);

    let providers = init_telemetry()?;

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    let router = RpcRouter::new();
    let host = ScriptHost::new(
        Arc::clone(&config),
        router.clone(),
        Arc::new(OsProcessLauncher),
        Arc::new(DirectoryMetadataProvider),
    )?;

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<FunctionRpcServer<FunctionRpcService>>()
        .await;

    // Workers dial back into the listener, so it must be accepting before
    // the first worker is launched.
    let server = tokio::spawn(
        Server::builder()
            .http2_adaptive_window(Some(true))
            .add_service(health_service)
            .add_service(build_rpc_service(FunctionRpcService::new(router)))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                shutdown_signal(Arc::clone(&host), health_reporter, providers),
            ),
    );

    if let Err(e) = host.start().await {
        tracing::error!(error = %e, "host failed to start");
    }

    server.await??;
    tracing::info!("Service shut down successfully");
    Ok(())
}

fn log_startup_info(config: &HostConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting function host on {} with full config: {:#?}",
            config.server_addr,
            config
        );
    } else {
        tracing::info!(
            "Starting function host on {} (runtime: {:?}, placeholder: {}, workers per language: {})",
            config.server_addr,
            config.worker_runtime,
            config.placeholder_mode,
            config.max_process_count()
        );
    }
}

fn build_rpc_service(service: FunctionRpcService) -> FunctionRpcServer<FunctionRpcService> {
    FunctionRpcServer::new(service)
        .max_decoding_message_size(MAX_MESSAGE_LENGTH)
        .max_encoding_message_size(MAX_MESSAGE_LENGTH)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
}

async fn shutdown_signal(
    host: Arc<ScriptHost>,
    health_reporter: HealthReporter,
    providers: TelemetryProviders,
) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<FunctionRpcServer<FunctionRpcService>>()
        .await;

    // 2. Drain invocations and stop every worker
    host.shutdown().await;

    #[cfg(feature = "tracing")]
    {
        if let Err(err) = providers.tracer_provider.force_flush() {
            eprintln!("Error flushing traces: {:#?}", err);
        }
        if let Err(err) = providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {:#?}", err);
        }
    }

    #[cfg(feature = "metrics")]
    {
        if let Err(err) = providers.meter_provider.force_flush() {
            eprintln!("Error flushing metrics: {:#?}", err);
        }
        if let Err(err) = providers.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {:#?}", err);
        }
    }

    #[cfg(not(any(feature = "tracing", feature = "metrics")))]
    let _ = providers;
}
