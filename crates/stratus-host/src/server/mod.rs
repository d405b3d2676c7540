//! The function host.
//!
//! ## Structure
//!
//! - [`config`] - CLI/environment settings and their validated form.
//! - [`environment`] - process-wide host state shared through `Arc`.
//! - [`events`] - the in-process event bus.
//! - [`rpc`] - the gRPC endpoint workers dial into.
//! - [`process`] - worker process launch and supervision.
//! - [`channel`] - the per-worker protocol state machine.
//! - [`pool`] - tenant- and instance-scoped channel pools.
//! - [`dispatch`] - invocation routing and the restart policy.
//! - [`standby`] - placeholder mode and specialization.
//! - [`metadata`] - function descriptors and discovery.
//! - [`host`] - the composition root tying it together.
//! - [`telemetry`] - logging, tracing and metrics setup.

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod environment;
pub mod events;
pub mod host;
pub mod metadata;
pub mod pool;
pub mod process;
pub mod rpc;
pub mod standby;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
