//! Placeholder mode and specialization.
//!
//! A placeholder host boots before it knows which site it will serve. It
//! pre-warms workers for the common languages and serves a synthetic
//! `WarmUp` function. An assignment then applies the site's settings and
//! package through the [`SpecializationManager`], after which the host
//! restarts with the site's functions.

pub mod context;
pub mod manager;
pub mod package;

pub use context::{HostAssignmentContext, PackageSource};
pub use manager::{SpecializationManager, SpecializationState};
pub use package::AssignmentPipeline;

use std::path::{Path, PathBuf};
use stratus_rpc_core::{Error, Result};

pub const WARMUP_FUNCTION: &str = "WarmUp";

const WARMUP_SCRIPT: &str = "module.exports = async function (context) {\n    return 'WarmUp';\n};\n";

/// Writes the app a placeholder host serves and returns its function
/// directory.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if the files cannot be written.
pub async fn materialize_placeholder_app(app_directory: &Path) -> Result<PathBuf> {
    let function = app_directory.join(WARMUP_FUNCTION);
    tokio::fs::create_dir_all(&function)
        .await
        .map_err(|e| Error::InvalidRequest {
            reason: format!("cannot create {}: {e}", function.display()),
        })?;
    tokio::fs::write(function.join("index.js"), WARMUP_SCRIPT)
        .await
        .map_err(|e| Error::InvalidRequest {
            reason: format!("cannot write warm-up function: {e}"),
        })?;
    tracing::debug!(directory = %function.display(), "placeholder app written");
    Ok(function)
}
