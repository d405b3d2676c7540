//! Error types for the function host.
//!
//! This module defines the central `Error` enum shared by the worker channel,
//! the pool managers, the dispatcher and the specialization manager. It is
//! `Clone` so a single fault can be fanned out to every waiter of a pending
//! channel and carried inside broadcast health events. `From<Error>` for
//! `tonic::Status` maps each case to a gRPC status for the worker stream.
//!
//! ## Error Cases
//! - `ChannelError`: an internal queue between tasks was closed.
//! - `Timeout`: a deadline expired while awaiting a worker.
//! - `ProcessLaunch`: the worker process could not be started.
//! - `Protocol`: a frame was missing, malformed or unexpected.
//! - `WorkerFault`: the worker reported a failure or its process died.
//! - `FunctionLoad`: a function failed to load in its worker.
//! - `NoInitializedWorkers`: no ready channel exists for a language.
//! - `PoolFull`: a pool already holds its maximum number of channels.
//! - `InvocationCancelled`: the caller abandoned an invocation.
//! - `Assignment`: specialization could not be applied.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the function host.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed queue).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// An awaited worker response did not arrive in time.
    #[error("Timed out after {after_ms}ms waiting for {operation}")]
    Timeout { operation: String, after_ms: u64 },

    /// The worker process could not be launched.
    #[error("Failed to start worker process: {reason}")]
    ProcessLaunch { reason: String },

    /// The worker sent a frame the host cannot accept.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// The worker reported a failure or exited unexpectedly.
    #[error("Worker {worker_id} failed: {message}")]
    WorkerFault { worker_id: String, message: String },

    /// A function could not be loaded by its worker.
    #[error("Function '{function}' failed to load: {message}")]
    FunctionLoad { function: String, message: String },

    /// The function has no buffer on the selected channel.
    #[error("Function '{function}' is not loaded by the language worker")]
    FunctionNotLoaded { function: String },

    /// The worker completed the invocation with a failure status.
    #[error("Invocation {invocation_id} failed: {message}")]
    InvocationFailed {
        invocation_id: String,
        message: String,
    },

    /// The caller cancelled the invocation before a response arrived.
    #[error("Invocation cancelled")]
    InvocationCancelled,

    /// There is no channel in the `Initialized` state for the language.
    #[error("Did not find any initialized language workers for '{language}'")]
    NoInitializedWorkers { language: String },

    /// More initialized channels exist than the configured pool size.
    #[error("Found {count} initialized '{language}' workers, exceeding the maximum of {max}")]
    TooManyChannels {
        language: String,
        count: usize,
        max: usize,
    },

    /// The pool for a language already holds its maximum number of channels.
    #[error("Pool for '{language}' already holds {max} channels")]
    PoolFull { language: String, max: usize },

    /// A `StartStream` arrived for a worker id nobody is waiting for.
    #[error("Unknown worker id: {worker_id}")]
    UnknownWorker { worker_id: String },

    /// The specialization pipeline could not apply an assignment.
    #[error("Assignment failed: {reason}")]
    Assignment { reason: String },

    /// The request was malformed or violated a precondition.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The host, or the channel, is shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub fn timeout(operation: impl Into<String>, after: core::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn channel(context: impl Into<String>) -> Self {
        Self::ChannelError {
            context: context.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {}", context))
            }
            Error::Timeout { .. } => Status::deadline_exceeded(err.to_string()),
            Error::Protocol { reason } => Status::invalid_argument(reason),
            Error::UnknownWorker { worker_id } => {
                Status::not_found(format!("Unknown worker id: {}", worker_id))
            }
            Error::InvocationCancelled => Status::cancelled("Invocation was cancelled"),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::NoInitializedWorkers { .. } | Error::PoolFull { .. } => {
                Status::unavailable(err.to_string())
            }
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
            other => Status::internal(other.to_string()),
        }
    }
}
