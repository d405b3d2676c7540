use std::collections::HashMap;
use std::path::PathBuf;
use stratus_rpc_core::types::env;

/// Where the app's package comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// Downloaded over HTTP(S) before it is unpacked.
    Url(String),
    /// Already on the local file system.
    Local(PathBuf),
}

/// The site a placeholder host is being assigned to.
///
/// Two contexts are the same assignment when every field matches; a repeated
/// request with an equal context is acknowledged, a different one is refused.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAssignmentContext {
    pub site_id: u64,
    pub site_name: String,
    pub environment: HashMap<String, String>,
    pub package: Option<PackageSource>,
    /// Warm-up pings exercise the assignment endpoint without specializing.
    pub is_warmup: bool,
}

impl HostAssignmentContext {
    pub fn new(site_id: u64, site_name: impl Into<String>) -> Self {
        Self {
            site_id,
            site_name: site_name.into(),
            ..Default::default()
        }
    }

    pub fn with_environment(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    pub fn with_package(mut self, package: PackageSource) -> Self {
        self.package = Some(package);
        self
    }

    /// The explicit package, else a URL in `WEBSITE_RUN_FROM_PACKAGE`.
    pub fn package_source(&self) -> Option<PackageSource> {
        if let Some(package) = &self.package {
            return Some(package.clone());
        }
        self.environment
            .get(env::WEBSITE_RUN_FROM_PACKAGE)
            .map(|value| value.trim())
            .filter(|value| value.starts_with("http://") || value.starts_with("https://"))
            .map(|url| PackageSource::Url(url.to_string()))
    }

    /// Whether the app runs from a mounted, read-only package.
    pub fn runs_from_package(&self) -> bool {
        self.environment
            .get(env::WEBSITE_RUN_FROM_PACKAGE)
            .is_some_and(|value| !value.trim().is_empty())
    }
}
