//! Applying an assignment's package to the app directory.
//!
//! The platform is fixed at startup, so the variants form a closed enum:
//! Linux hosts download the package and extract it (or mount it when
//! mounting is enabled), Windows hosts only take the environment.

use crate::server::config::Platform;
use crate::server::standby::context::{HostAssignmentContext, PackageSource};
use core::fmt::Display;
use core::future::Future;
use core::time::Duration;
use futures::StreamExt;
use reqwest::{Client, Url};
use std::path::{Path, PathBuf};
use stratus_rpc_core::{Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const DOWNLOAD_RETRIES: usize = 2;
const DOWNLOAD_RETRY_INTERVAL: Duration = Duration::from_millis(500);

const FUSE_DEVICE: &str = "/dev/fuse";

/// File system images mounted with `squashfuse_ll`.
const IMAGE_EXTENSIONS: &[&str] = &[".squashfs", ".sfs", ".sqsh", ".img", ".fs"];

pub enum AssignmentPipeline {
    Linux(LinuxPipeline),
    Windows,
}

impl AssignmentPipeline {
    pub fn for_platform(
        platform: Platform,
        client: Client,
        mount_enabled: bool,
        download_directory: PathBuf,
    ) -> Self {
        match platform {
            Platform::Linux => Self::Linux(LinuxPipeline {
                client,
                mount_enabled,
                download_directory,
            }),
            Platform::Windows => Self::Windows,
        }
    }

    /// Puts the app's package in place under `app_directory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Assignment`] if the package cannot be fetched or
    /// unpacked.
    pub async fn apply_package(
        &self,
        context: &HostAssignmentContext,
        app_directory: &Path,
    ) -> Result<()> {
        match self {
            Self::Linux(linux) => linux.apply(context, app_directory).await,
            Self::Windows => {
                tracing::debug!("package deployment is handled by the platform");
                Ok(())
            }
        }
    }
}

pub struct LinuxPipeline {
    client: Client,
    mount_enabled: bool,
    download_directory: PathBuf,
}

impl LinuxPipeline {
    async fn apply(&self, context: &HostAssignmentContext, app_directory: &Path) -> Result<()> {
        let package = match context.package_source() {
            None => {
                tracing::info!("assignment has no package");
                return Ok(());
            }
            Some(PackageSource::Url(url)) => self.download(&url).await?,
            Some(PackageSource::Local(path)) => path,
        };
        self.unpack(&package, app_directory).await
    }

    /// Streams `url` into the download directory.
    pub async fn download(&self, url: &str) -> Result<PathBuf> {
        let url = Url::parse(url).map_err(|e| assignment(format!("invalid package url: {e}")))?;
        let shown = redacted(&url);
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("package.zip")
            .to_string();
        let target = self.download_directory.join(file_name);
        tracing::info!(url = %shown, path = %target.display(), "downloading package");

        tokio::fs::create_dir_all(&self.download_directory)
            .await
            .map_err(|e| assignment(format!("cannot create download directory: {e}")))?;

        let bytes = with_retries(DOWNLOAD_RETRIES, DOWNLOAD_RETRY_INTERVAL, || {
            self.download_once(url.clone(), &target)
        })
        .await
        .map_err(|e| assignment(format!("error downloading {shown}: {e}")))?;
        tracing::info!(bytes, "package downloaded");
        Ok(target)
    }

    /// One download attempt. The URL is kept out of the error, since its
    /// query may carry a SAS token.
    async fn download_once(&self, url: Url, target: &Path) -> core::result::Result<u64, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.without_url().to_string())?;

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| format!("cannot create {}: {e}", target.display()))?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| e.without_url().to_string())?;
            file.write_all(&chunk)
                .await
                .map_err(|e| format!("cannot write {}: {e}", target.display()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| format!("cannot write {}: {e}", target.display()))?;
        Ok(written)
    }

    async fn unpack(&self, package: &Path, app_directory: &Path) -> Result<()> {
        if !self.mount_enabled {
            let entries = extract_zip(package.to_path_buf(), app_directory.to_path_buf()).await?;
            tracing::info!(entries, target = %app_directory.display(), "package extracted");
            return Ok(());
        }

        let name = package.to_string_lossy();
        let (tool, options): (&str, &[&str]) = if has_extension(&name, IMAGE_EXTENSIONS) {
            ("squashfuse_ll", &["-o", "nonempty"])
        } else if has_extension(&name, &[".zip"]) {
            ("fuse-zip", &["-o", "nonempty", "-r"])
        } else {
            return Err(assignment(format!("no file system matches {}", package.display())));
        };
        mount_package(tool, options, package, app_directory).await
    }
}

fn has_extension(file: &str, extensions: &[&str]) -> bool {
    let file = file.to_ascii_lowercase();
    extensions.iter().any(|extension| file.ends_with(extension))
}

/// Mounts `package` on `target` with the FUSE driver `tool`. Paths are
/// passed as arguments, never through a shell.
async fn mount_package(tool: &str, options: &[&str], package: &Path, target: &Path) -> Result<()> {
    ensure_fuse_device().await;
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|e| assignment(format!("cannot create {}: {e}", target.display())))?;

    tracing::info!(tool, package = %package.display(), target = %target.display(), "mounting package");
    let output = Command::new(tool)
        .args(options)
        .arg(package)
        .arg(target)
        .output()
        .await
        .map_err(|e| assignment(format!("cannot run {tool}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(assignment(format!(
            "{tool} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Creates `/dev/fuse` when the container lacks it. Failure is only logged;
/// the mount itself reports a missing device.
async fn ensure_fuse_device() {
    if tokio::fs::try_exists(FUSE_DEVICE).await.unwrap_or(false) {
        return;
    }
    match Command::new("mknod")
        .args([FUSE_DEVICE, "c", "10", "229"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            tracing::debug!(device = FUSE_DEVICE, "created fuse device");
        }
        Ok(output) => {
            tracing::debug!(device = FUSE_DEVICE, status = %output.status, "mknod failed");
        }
        Err(e) => tracing::debug!(error = %e, "cannot run mknod"),
    }
}

/// Extracts the zip archive `package` into `target`, overwriting existing
/// files, and returns the number of entries.
pub async fn extract_zip(package: PathBuf, target: PathBuf) -> Result<usize> {
    tokio::task::spawn_blocking(move || -> Result<usize> {
        let file = std::fs::File::open(&package)
            .map_err(|e| assignment(format!("cannot open {}: {e}", package.display())))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| assignment(format!("{} is not a zip archive: {e}", package.display())))?;
        std::fs::create_dir_all(&target)
            .map_err(|e| assignment(format!("cannot create {}: {e}", target.display())))?;
        archive
            .extract(&target)
            .map_err(|e| assignment(format!("extraction failed: {e}")))?;
        Ok(archive.len())
    })
    .await
    .map_err(|e| assignment(format!("extraction task failed: {e}")))?
}

/// Runs `attempt` once plus up to `retries` more times, pausing `interval`
/// between attempts.
pub(crate) async fn with_retries<T, E, F, Fut>(
    retries: usize,
    interval: Duration,
    mut attempt: F,
) -> core::result::Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = core::result::Result<T, E>>,
{
    let mut remaining = retries;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if remaining > 0 => {
                remaining -= 1;
                tracing::debug!(error = %e, remaining, "attempt failed, retrying");
                tokio::time::sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The URL without its query, which may carry a SAS token.
pub(crate) fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

fn assignment(reason: String) -> Error {
    Error::Assignment { reason }
}
