//! # Shared Protocol Types and Constants
//!
//! Identifiers, capability names, well-known environment variables and the
//! protocol defaults both sides of the worker stream agree on.
//!
//! ## Identifiers
//!
//! - [`WorkerId`] - assigned by the host when it decides to start a worker
//! - [`FunctionId`] - assigned once per function descriptor
//! - [`InvocationId`] - unique per call
//!
//! All three travel on the wire as strings; the aliases only document intent.

use core::time::Duration;

pub type WorkerId = String;
pub type FunctionId = String;
pub type InvocationId = String;

/// Version string sent to workers in `WorkerInitRequest`.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Largest gRPC message a worker may send or receive.
pub const MAX_MESSAGE_LENGTH: usize = i32::MAX as usize;

/// Exit code a worker uses to ask for a clean restart.
pub const INTENTIONAL_RESTART_EXIT_CODE: i32 = 200;

/// Default number of worker processes per language.
pub const DEFAULT_PROCESS_COUNT: usize = 1;

/// Hard ceiling on worker processes per language.
pub const MAX_PROCESS_COUNT: usize = 10;

/// Each pool size unit tolerates this many errors within the error window
/// before restarts stop.
pub const ERRORS_PER_PROCESS: usize = 3;

/// Default deadline for a launched worker to open its stream.
pub const DEFAULT_PROCESS_START_TIMEOUT: Duration = Duration::from_secs(40);

/// Default deadline for init and environment-reload responses.
pub const DEFAULT_WORKER_INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of stderr error lines kept per worker process.
pub const STDERR_BUFFER_CAPACITY: usize = 3;

/// Languages executed inside the host that never need a worker process.
pub const IN_PROCESS_LANGUAGES: &[&str] = &["dotnet"];

/// Capability names the host understands. Any other capability a worker
/// advertises is kept but never consulted.
pub mod capabilities {
    pub const RAW_HTTP_BODY_BYTES: &str = "RawHttpBodyBytes";
    pub const HANDLES_WORKER_TERMINATE_MESSAGE: &str = "HandlesWorkerTerminateMessage";
    pub const HANDLES_INVOCATION_CANCEL_MESSAGE: &str = "HandlesInvocationCancelMessage";
}

/// Environment variable names shared with workers and the host config.
pub mod env {
    pub const FUNCTIONS_WORKER_RUNTIME: &str = "FUNCTIONS_WORKER_RUNTIME";
    pub const FUNCTIONS_WORKER_PROCESS_COUNT: &str = "FUNCTIONS_WORKER_PROCESS_COUNT";
    pub const FUNCTIONS_WORKER_DIRECTORY: &str = "FUNCTIONS_WORKER_DIRECTORY";
    pub const FUNCTIONS_APPLICATION_DIRECTORY: &str = "FUNCTIONS_APPLICATION_DIRECTORY";
    pub const WEBSITE_PLACEHOLDER_MODE: &str = "WEBSITE_PLACEHOLDER_MODE";
    pub const CONTAINER_START_CONTEXT: &str = "CONTAINER_START_CONTEXT";
    pub const WEBSITE_RUN_FROM_PACKAGE: &str = "WEBSITE_RUN_FROM_PACKAGE";
}
