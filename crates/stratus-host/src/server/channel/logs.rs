//! Re-emission of worker log frames.

use stratus_rpc_core::proto::{RpcLog, rpc_log::Level};

/// Host log level for a worker log level. Worker `Trace` is promoted to
/// `INFO`; `None` is dropped.
pub fn map_log_level(level: Level) -> Option<tracing::Level> {
    match level {
        Level::Trace | Level::Information => Some(tracing::Level::INFO),
        Level::Debug => Some(tracing::Level::DEBUG),
        Level::Warning => Some(tracing::Level::WARN),
        Level::Error | Level::Critical => Some(tracing::Level::ERROR),
        Level::None => None,
    }
}

pub fn emit_worker_log(worker_id: &str, log: &RpcLog) {
    let Some(level) = map_log_level(log.level()) else {
        return;
    };
    let invocation_id = log.invocation_id.as_str();
    let category = log.category.as_str();
    let message = match &log.exception {
        Some(exception) if !exception.message.is_empty() => {
            format!("{} ({})", log.message, exception.message)
        }
        _ => log.message.clone(),
    };

    match level {
        tracing::Level::ERROR => {
            tracing::error!(target: "worker", %worker_id, %invocation_id, %category, "{message}")
        }
        tracing::Level::WARN => {
            tracing::warn!(target: "worker", %worker_id, %invocation_id, %category, "{message}")
        }
        tracing::Level::DEBUG => {
            tracing::debug!(target: "worker", %worker_id, %invocation_id, %category, "{message}")
        }
        _ => tracing::info!(target: "worker", %worker_id, %invocation_id, %category, "{message}"),
    }
}
