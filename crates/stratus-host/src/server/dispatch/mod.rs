//! Routing of invocations to language workers.
//!
//! - [`balancer`] - round-robin choice among the ready channels of a language.
//! - [`errors`] - the sliding bucket that caps worker restarts.
//! - [`dispatcher`] - pool startup, invocation routing and health supervision.

pub mod balancer;
pub mod dispatcher;
pub mod errors;

pub use balancer::RoundRobinBalancer;
pub use dispatcher::{DispatcherState, FunctionDispatcher};
pub use errors::ErrorBucket;

use crate::server::metadata::FunctionDescriptor;
use stratus_rpc_core::types::{DEFAULT_PROCESS_COUNT, IN_PROCESS_LANGUAGES, MAX_PROCESS_COUNT};

/// Worker processes per language: 1 when unset or zero, at most 10.
pub fn target_pool_size(configured: Option<usize>) -> usize {
    match configured {
        None | Some(0) => DEFAULT_PROCESS_COUNT,
        Some(count) => count.min(MAX_PROCESS_COUNT),
    }
}

/// Whether `function` runs on the workers of `configured_language`. A
/// function without a language runs on the configured one.
pub fn is_supported(function: &FunctionDescriptor, configured_language: &str) -> bool {
    function.language.is_empty() || function.language.eq_ignore_ascii_case(configured_language)
}

pub fn is_in_process(language: &str) -> bool {
    IN_PROCESS_LANGUAGES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(language))
}

/// Languages whose workers the dispatcher must start: the configured runtime
/// or, when none is configured, the languages the functions are written in.
/// In-process languages never need a worker.
pub fn active_languages(runtime: Option<&str>, functions: &[FunctionDescriptor]) -> Vec<String> {
    let mut languages: Vec<String> = match runtime {
        Some(runtime) => vec![runtime.to_ascii_lowercase()],
        None => functions
            .iter()
            .filter(|function| !function.language.is_empty())
            .map(|function| function.language.to_ascii_lowercase())
            .collect(),
    };
    languages.sort();
    languages.dedup();
    languages.retain(|language| !is_in_process(language));
    languages
}
