use crate::server::config::HostConfig;
use crate::server::environment::HostEnvironment;
use crate::server::events::{EventBus, HostEvent};
use crate::server::standby::context::{HostAssignmentContext, PackageSource};
use crate::server::standby::package::{AssignmentPipeline, redacted, with_retries};
use crate::server::telemetry::increment_specializations;
use core::time::Duration;
use parking_lot::Mutex;
use reqwest::{Client, Url};
use std::path::PathBuf;
use std::sync::Arc;
use stratus_rpc_core::{Error, Result, types::env};
use tokio::sync::watch;

const VALIDATION_RETRIES: usize = 2;
const VALIDATION_RETRY_INTERVAL: Duration = Duration::from_millis(300);
const VALIDATION_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecializationState {
    Standby,
    Assigning,
    Specialized,
}

/// Turns a placeholder host into the host of one site.
///
/// At most one assignment is ever accepted. It runs in the background while
/// inbound requests are held at the request gate; whatever happens to the
/// package step, the host leaves standby afterwards and a
/// [`HostEvent::HostRestart`] is published.
pub struct SpecializationManager {
    environment: Arc<HostEnvironment>,
    events: EventBus,
    pipeline: AssignmentPipeline,
    client: Client,
    app_directory: PathBuf,
    state: watch::Sender<SpecializationState>,
    assignment: Mutex<Option<HostAssignmentContext>>,
}

impl SpecializationManager {
    /// # Errors
    ///
    /// Returns [`Error::Assignment`] if the HTTP client cannot be built.
    pub fn new(
        config: &HostConfig,
        environment: Arc<HostEnvironment>,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Assignment {
                reason: format!("cannot build http client: {e}"),
            })?;
        let pipeline = AssignmentPipeline::for_platform(
            config.platform,
            client.clone(),
            config.mount_enabled,
            std::env::temp_dir().join("stratus-packages"),
        );

        let initial = if environment.in_standby_mode() || environment.pinned_start_context().is_some() {
            SpecializationState::Standby
        } else {
            SpecializationState::Specialized
        };
        let (state, _) = watch::channel(initial);

        Ok(Arc::new(Self {
            environment,
            events,
            pipeline,
            client,
            app_directory: config.app_directory.clone(),
            state,
            assignment: Mutex::new(None),
        }))
    }

    pub fn state(&self) -> SpecializationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SpecializationState> {
        self.state.subscribe()
    }

    /// The context of the accepted assignment, if any.
    pub fn assignment(&self) -> Option<HostAssignmentContext> {
        self.assignment.lock().clone()
    }

    /// Accepts `context` and specializes the host in the background.
    ///
    /// Returns `true` when the assignment was started, or when it equals the
    /// one already accepted. Returns `false` outside standby (unless a start
    /// context pinned this container) and for a context that differs from
    /// the accepted one.
    pub fn start_assignment(self: &Arc<Self>, context: HostAssignmentContext) -> bool {
        if context.is_warmup {
            tracing::debug!("warm-up assignment acknowledged");
            return true;
        }
        if !self.environment.in_standby_mode() && self.environment.pinned_start_context().is_none() {
            tracing::error!(site = %context.site_name, "assignment requested while not in placeholder mode");
            return false;
        }

        {
            let mut accepted = self.assignment.lock();
            if let Some(current) = accepted.as_ref() {
                let same = *current == context;
                if !same {
                    tracing::warn!(current = %current.site_name, requested = %context.site_name, "host is already being assigned to another site");
                }
                return same;
            }
            *accepted = Some(context.clone());
        }

        tracing::info!(site_id = context.site_id, site = %context.site_name, "starting assignment");
        self.state.send_replace(SpecializationState::Assigning);
        // Requests that arrive from here on wait until specialization ends.
        self.environment.requests().delay();

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.assign(context).await });
        true
    }

    async fn assign(&self, context: HostAssignmentContext) {
        if let Err(e) = self.apply_context(&context).await {
            tracing::error!(site = %context.site_name, error = %e, "assignment failed");
            self.environment.record_assignment_error(e.to_string());
        }

        // Standby ends even when the package step failed.
        tracing::info!(site = %context.site_name, "triggering specialization");
        self.environment.mark_specialized();
        self.state.send_replace(SpecializationState::Specialized);
        increment_specializations();
        self.events.publish(HostEvent::HostRestart);
        self.environment.requests().resume();
    }

    async fn apply_context(&self, context: &HostAssignmentContext) -> Result<()> {
        tracing::info!(count = context.environment.len(), "applying app settings");
        self.environment.apply(&context.environment);
        let app_directory = self
            .environment
            .variable(env::FUNCTIONS_APPLICATION_DIRECTORY)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.app_directory.clone());
        self.pipeline.apply_package(context, &app_directory).await
    }

    /// Checks that the package of `context` is reachable.
    ///
    /// Returns a description of the problem, or `None` when the context has
    /// no remote package or the package answered a `HEAD` request.
    pub async fn validate_context(&self, context: &HostAssignmentContext) -> Option<String> {
        tracing::info!(site_id = context.site_id, site = %context.site_name, "validating assignment context");
        let Some(PackageSource::Url(url)) = context.package_source() else {
            return None;
        };
        let url = match Url::parse(&url) {
            Ok(url) => url,
            Err(e) => return Some(format!("Invalid zip url specified ({e})")),
        };

        let client = self.client.clone();
        let probe = with_retries(VALIDATION_RETRIES, VALIDATION_RETRY_INTERVAL, || {
            let client = client.clone();
            let url = url.clone();
            async move {
                client
                    .head(url)
                    .timeout(VALIDATION_REQUEST_TIMEOUT)
                    .send()
                    .await?
                    .error_for_status()
            }
        })
        .await;

        match probe {
            Ok(_) => None,
            Err(e) => {
                tracing::error!(url = %redacted(&url), error = %e, "package validation failed");
                let status = e
                    .status()
                    .map_or_else(|| "none".to_string(), |status| status.as_u16().to_string());
                Some(format!("Invalid zip url specified (StatusCode: {status})"))
            }
        }
    }
}
