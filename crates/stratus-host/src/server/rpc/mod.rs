//! Transport between the host and its language workers.
//!
//! - [`router`] - pairs a worker's `StartStream` with the channel waiting for it.
//! - [`service`] - the gRPC `FunctionRpc` implementation workers dial into.

pub mod router;
pub mod service;

pub use router::{RpcRouter, WorkerConnection, WorkerEndpoint};
pub use service::FunctionRpcService;
