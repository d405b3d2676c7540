//! Process-wide host state.
//!
//! One [`HostEnvironment`] is built by the composition root and shared through
//! `Arc` with every component that needs to know whether the host is still a
//! placeholder, which environment the app runs with, or whether inbound
//! requests must wait.

use crate::server::config::HostConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use stratus_rpc_core::types::env;
use tokio::sync::watch;

pub struct HostEnvironment {
    standby: AtomicBool,
    specialized_ready: AtomicBool,
    pinned_start_context: RwLock<Option<String>>,
    variables: RwLock<HashMap<String, String>>,
    last_assignment_error: Mutex<Option<String>>,
    gate: RequestGate,
}

impl HostEnvironment {
    pub fn new(config: &HostConfig) -> Self {
        let mut variables = HashMap::new();
        if let Some(runtime) = &config.worker_runtime {
            variables.insert(env::FUNCTIONS_WORKER_RUNTIME.to_string(), runtime.clone());
        }
        if let Some(count) = config.process_count {
            variables.insert(env::FUNCTIONS_WORKER_PROCESS_COUNT.to_string(), count.to_string());
        }
        variables.insert(
            env::FUNCTIONS_APPLICATION_DIRECTORY.to_string(),
            config.app_directory.display().to_string(),
        );

        Self {
            standby: AtomicBool::new(config.placeholder_mode),
            specialized_ready: AtomicBool::new(!config.placeholder_mode),
            pinned_start_context: RwLock::new(config.container_start_context.clone()),
            variables: RwLock::new(variables),
            last_assignment_error: Mutex::new(None),
            gate: RequestGate::new(),
        }
    }

    pub fn in_standby_mode(&self) -> bool {
        self.standby.load(Ordering::Acquire)
    }

    pub fn is_specialized_and_ready(&self) -> bool {
        self.specialized_ready.load(Ordering::Acquire)
    }

    /// Leaves placeholder mode for good.
    pub fn mark_specialized(&self) {
        self.standby.store(false, Ordering::Release);
        self.specialized_ready.store(true, Ordering::Release);
        self.pinned_start_context.write().take();
    }

    pub fn pinned_start_context(&self) -> Option<String> {
        self.pinned_start_context.read().clone()
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.variables.read().get(name).cloned()
    }

    pub fn variables(&self) -> HashMap<String, String> {
        self.variables.read().clone()
    }

    /// Overlays `variables`; an empty value removes the entry.
    pub fn apply(&self, variables: &HashMap<String, String>) {
        let mut current = self.variables.write();
        for (name, value) in variables {
            if value.is_empty() {
                current.remove(name);
            } else {
                current.insert(name.clone(), value.clone());
            }
        }
    }

    /// Configured worker language, lowercased.
    pub fn worker_runtime(&self) -> Option<String> {
        self.variable(env::FUNCTIONS_WORKER_RUNTIME)
            .map(|runtime| runtime.trim().to_ascii_lowercase())
            .filter(|runtime| !runtime.is_empty())
    }

    pub fn process_count(&self) -> Option<usize> {
        self.variable(env::FUNCTIONS_WORKER_PROCESS_COUNT)
            .and_then(|count| count.trim().parse().ok())
    }

    pub fn record_assignment_error(&self, error: impl Into<String>) {
        *self.last_assignment_error.lock() = Some(error.into());
    }

    pub fn last_assignment_error(&self) -> Option<String> {
        self.last_assignment_error.lock().clone()
    }

    pub fn requests(&self) -> &RequestGate {
        &self.gate
    }
}

/// Holds inbound requests while an assignment is applied.
pub struct RequestGate {
    delayed: watch::Sender<bool>,
}

impl RequestGate {
    fn new() -> Self {
        let (delayed, _) = watch::channel(false);
        Self { delayed }
    }

    pub fn delay(&self) {
        self.delayed.send_replace(true);
    }

    pub fn resume(&self) {
        self.delayed.send_replace(false);
    }

    pub fn is_delayed(&self) -> bool {
        *self.delayed.borrow()
    }

    /// Resolves once requests are not being delayed.
    pub async fn wait_until_open(&self) {
        let mut rx = self.delayed.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|delayed| !*delayed).await;
    }
}
