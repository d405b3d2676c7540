//! Language worker channels.
//!
//! - [`state`] - the channel lifecycle.
//! - [`capabilities`] - what a worker advertised and how updates combine.
//! - [`logs`] - re-emission of worker log frames.
//! - [`worker_channel`] - the channel itself.

pub mod capabilities;
pub mod logs;
pub mod state;
pub mod worker_channel;

pub use capabilities::{Capabilities, UpdateStrategy};
pub use state::ChannelState;
pub use worker_channel::{
    ChannelSettings, FunctionLoadState, InvocationResult, WorkerChannel,
    build_environment_reload_request, load_order,
};

#[cfg(test)]
mod tests;
