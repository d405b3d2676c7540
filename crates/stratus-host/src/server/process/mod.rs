//! Worker process supervision.
//!
//! - [`launcher`] - starts worker executables and turns their exits into
//!   health events.
//! - [`output`] - classifies worker stdout/stderr and keeps the last error
//!   lines for diagnostics.

pub mod launcher;
pub mod output;

pub use launcher::{OsProcessLauncher, WorkerCreateContext, WorkerProcess, WorkerProcessLauncher};
