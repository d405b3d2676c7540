use crate::server::dispatch::target_pool_size;
use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stratus_rpc_core::types::{DEFAULT_PROCESS_START_TIMEOUT, DEFAULT_WORKER_INIT_TIMEOUT};

/// Runtime configuration for the `stratus-host` binary.
///
/// These settings control which language workers the host launches, how many
/// processes each language gets, how long the host waits on workers, and how
/// the restart policy and placeholder mode behave. All values are parsed from
/// CLI arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "stratus-host",
    version,
    about = "A function host that supervises out-of-process language workers"
)]
pub struct CliArgs {
    /// Address the worker gRPC endpoint listens on.
    ///
    /// Workers are launched with this host and port on their command line.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("127.0.0.1:50051"))]
    pub server_addr: String,

    /// Language every function of the app is written in (e.g. `node`).
    ///
    /// When unset, the language is inferred from the function set when all
    /// functions agree on one.
    ///
    /// Environment variable: `FUNCTIONS_WORKER_RUNTIME`
    #[arg(long, env = "FUNCTIONS_WORKER_RUNTIME")]
    pub worker_runtime: Option<String>,

    /// Number of worker processes started per language.
    ///
    /// Defaults to 1 and is clamped to the range [1, 10].
    ///
    /// Environment variable: `FUNCTIONS_WORKER_PROCESS_COUNT`
    #[arg(long, env = "FUNCTIONS_WORKER_PROCESS_COUNT")]
    pub process_count: Option<usize>,

    /// Start as a generic pre-warmed placeholder awaiting assignment.
    ///
    /// Environment variable: `WEBSITE_PLACEHOLDER_MODE`
    #[arg(
        long,
        env = "WEBSITE_PLACEHOLDER_MODE",
        default_value_t = false,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub placeholder_mode: bool,

    /// Start context of a container pinned to a site before it booted.
    ///
    /// Its presence allows assignment outside of placeholder mode.
    ///
    /// Environment variable: `CONTAINER_START_CONTEXT`
    #[arg(long, env = "CONTAINER_START_CONTEXT")]
    pub container_start_context: Option<String>,

    /// Root directory of the function app.
    ///
    /// Environment variable: `FUNCTIONS_APPLICATION_DIRECTORY`
    #[arg(long, env = "FUNCTIONS_APPLICATION_DIRECTORY", default_value = "./site/wwwroot")]
    pub app_directory: PathBuf,

    /// Directory holding one sub-directory per installed language worker.
    ///
    /// Environment variable: `FUNCTIONS_WORKERS_DIRECTORY`
    #[arg(long, env = "FUNCTIONS_WORKERS_DIRECTORY", default_value = "./workers")]
    pub workers_directory: PathBuf,

    /// Languages whose workers are pre-started while in placeholder mode.
    ///
    /// Environment variable: `FUNCTIONS_PLACEHOLDER_LANGUAGES`
    #[arg(
        long,
        env = "FUNCTIONS_PLACEHOLDER_LANGUAGES",
        value_delimiter = ',',
        default_value = "node,python,powershell,java"
    )]
    pub placeholder_languages: Vec<String>,

    /// Per-language executable overrides, as `language=path`.
    ///
    /// Environment variable: `FUNCTIONS_WORKER_EXECUTABLES` (`;` separated)
    #[arg(long = "worker-executable", env = "FUNCTIONS_WORKER_EXECUTABLES", value_delimiter = ';')]
    pub worker_executables: Vec<String>,

    /// Per-language extra arguments, as `language=args` (e.g. a debug flag).
    ///
    /// Environment variable: `FUNCTIONS_WORKER_ARGUMENTS` (`;` separated)
    #[arg(long = "worker-arguments", env = "FUNCTIONS_WORKER_ARGUMENTS", value_delimiter = ';')]
    pub worker_arguments: Vec<String>,

    /// Hosting platform, which selects how assignments are applied.
    ///
    /// `linux` downloads and extracts (or mounts) packages, `windows` only
    /// applies environment.
    ///
    /// Environment variable: `FUNCTIONS_HOST_PLATFORM`
    #[arg(long, env = "FUNCTIONS_HOST_PLATFORM", default_value_t = String::from("linux"))]
    pub platform: String,

    /// Mount squashfs/zip packages instead of extracting them.
    ///
    /// Environment variable: `FUNCTIONS_MOUNT_ENABLED`
    #[arg(
        long,
        env = "FUNCTIONS_MOUNT_ENABLED",
        default_value_t = false,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub mount_enabled: bool,

    /// Time a launched worker has to open its stream.
    ///
    /// Environment variable: `WORKER_PROCESS_START_TIMEOUT_MS`
    #[arg(long, env = "WORKER_PROCESS_START_TIMEOUT_MS", default_value_t = DEFAULT_PROCESS_START_TIMEOUT.as_millis() as u64)]
    pub process_start_timeout_ms: u64,

    /// Time a worker has to answer init and environment-reload requests.
    ///
    /// Environment variable: `WORKER_INIT_TIMEOUT_MS`
    #[arg(long, env = "WORKER_INIT_TIMEOUT_MS", default_value_t = DEFAULT_WORKER_INIT_TIMEOUT.as_millis() as u64)]
    pub init_timeout_ms: u64,

    /// Time an invocation may run before the caller gets a timeout.
    ///
    /// Environment variable: `FUNCTION_TIMEOUT_MS`
    #[arg(long, env = "FUNCTION_TIMEOUT_MS", default_value_t = 300_000)]
    pub function_timeout_ms: u64,

    /// Pause between consecutive worker process starts for one language.
    ///
    /// Environment variable: `WORKER_PROCESS_STARTUP_INTERVAL_MS`
    #[arg(long, env = "WORKER_PROCESS_STARTUP_INTERVAL_MS", default_value_t = 10_000)]
    pub process_startup_interval_ms: u64,

    /// How long the restart lock stays held after a worker restart.
    ///
    /// Environment variable: `WORKER_RESTART_DELAY_MS`
    #[arg(long, env = "WORKER_RESTART_DELAY_MS", default_value_t = 10_000)]
    pub restart_delay_ms: u64,

    /// Sliding window over which worker errors count towards the restart cap.
    ///
    /// Environment variable: `WORKER_ERROR_WINDOW_MS`
    #[arg(long, env = "WORKER_ERROR_WINDOW_MS", default_value_t = 600_000)]
    pub error_window_ms: u64,

    /// Quiet period before idle workers are shut down.
    ///
    /// Environment variable: `IDLE_SHUTDOWN_DEBOUNCE_MS`
    #[arg(long, env = "IDLE_SHUTDOWN_DEBOUNCE_MS", default_value_t = 5_000)]
    pub idle_shutdown_debounce_ms: u64,

    /// Time in-flight invocations get to finish on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_MS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_MS", default_value_t = 10_000)]
    pub shutdown_timeout_ms: u64,
}

/// How an assignment is applied; chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
}

/// How to launch the worker for one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescription {
    pub language: String,
    pub executable: String,
    pub arguments: Vec<String>,
    pub worker_path: Option<PathBuf>,
    pub worker_directory: PathBuf,
    /// Whether a running worker can take a new environment instead of being
    /// restarted on specialization.
    pub supports_environment_reload: bool,
}

impl WorkerDescription {
    fn builtin(language: &str, workers_directory: &Path) -> Option<Self> {
        let worker_directory = workers_directory.join(language);
        let (executable, arguments, worker_file): (&str, &[&str], &str) = match language {
            "node" => ("node", &[], "worker.js"),
            "python" => ("python3", &[], "worker.py"),
            "java" => ("java", &["-jar"], "worker.jar"),
            "powershell" => ("dotnet", &[], "worker.dll"),
            _ => return None,
        };
        Some(Self {
            language: language.to_string(),
            executable: executable.to_string(),
            arguments: arguments.iter().map(|a| (*a).to_string()).collect(),
            worker_path: Some(worker_directory.join(worker_file)),
            worker_directory,
            supports_environment_reload: true,
        })
    }
}

/// Deadlines applied by every language worker channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelTimeouts {
    pub process_start: Duration,
    pub init: Duration,
    pub function: Duration,
}

/// Timing knobs of the dispatcher's startup and restart policy.
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub process_startup_interval: Duration,
    pub restart_delay: Duration,
    pub error_window: Duration,
    pub idle_shutdown_debounce: Duration,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub server_addr: String,
    pub worker_runtime: Option<String>,
    pub process_count: Option<usize>,
    pub placeholder_mode: bool,
    pub container_start_context: Option<String>,
    pub app_directory: PathBuf,
    pub workers_directory: PathBuf,
    pub placeholder_languages: Vec<String>,
    pub workers: HashMap<String, WorkerDescription>,
    pub platform: Platform,
    pub mount_enabled: bool,
    pub timeouts: ChannelTimeouts,
    pub dispatch: DispatchOptions,
}

impl HostConfig {
    /// Pool size per language after applying the default and the ceiling.
    pub fn max_process_count(&self) -> usize {
        target_pool_size(self.process_count)
    }

    pub fn worker(&self, language: &str) -> Option<&WorkerDescription> {
        self.workers.get(&language.to_ascii_lowercase())
    }

    /// URI workers dial back to.
    pub fn server_uri(&self) -> String {
        format!("http://{}", self.server_addr)
    }
}

fn parse_overrides(raw: &[String], setting: &str) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((language, value)) if !language.trim().is_empty() => {
                Ok((language.trim().to_ascii_lowercase(), value.trim().to_string()))
            }
            _ => bail!("{setting} entry '{entry}' must have the form language=value"),
        })
        .collect()
}

fn non_zero(value: u64, setting: &str) -> anyhow::Result<Duration> {
    if value == 0 {
        bail!("{setting} must be greater than 0");
    }
    Ok(Duration::from_millis(value))
}

impl TryFrom<CliArgs> for HostConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let platform = match args.platform.to_ascii_lowercase().as_str() {
            "linux" => Platform::Linux,
            "windows" => Platform::Windows,
            other => bail!("FUNCTIONS_HOST_PLATFORM must be 'linux' or 'windows', got '{other}'"),
        };

        let timeouts = ChannelTimeouts {
            process_start: non_zero(args.process_start_timeout_ms, "WORKER_PROCESS_START_TIMEOUT_MS")?,
            init: non_zero(args.init_timeout_ms, "WORKER_INIT_TIMEOUT_MS")?,
            function: non_zero(args.function_timeout_ms, "FUNCTION_TIMEOUT_MS")?,
        };

        let dispatch = DispatchOptions {
            process_startup_interval: Duration::from_millis(args.process_startup_interval_ms),
            restart_delay: Duration::from_millis(args.restart_delay_ms),
            error_window: non_zero(args.error_window_ms, "WORKER_ERROR_WINDOW_MS")?,
            idle_shutdown_debounce: Duration::from_millis(args.idle_shutdown_debounce_ms),
            shutdown_timeout: non_zero(args.shutdown_timeout_ms, "SHUTDOWN_TIMEOUT_MS")?,
        };

        let mut workers: HashMap<String, WorkerDescription> = ["node", "python", "java", "powershell"]
            .into_iter()
            .filter_map(|language| WorkerDescription::builtin(language, &args.workers_directory))
            .map(|description| (description.language.clone(), description))
            .collect();

        for (language, executable) in parse_overrides(&args.worker_executables, "FUNCTIONS_WORKER_EXECUTABLES")? {
            let description = workers.entry(language.clone()).or_insert_with(|| WorkerDescription {
                worker_directory: args.workers_directory.join(&language),
                language,
                executable: String::new(),
                arguments: Vec::new(),
                worker_path: None,
                supports_environment_reload: false,
            });
            description.executable = executable;
        }

        for (language, arguments) in parse_overrides(&args.worker_arguments, "FUNCTIONS_WORKER_ARGUMENTS")? {
            let Some(description) = workers.get_mut(&language) else {
                bail!("FUNCTIONS_WORKER_ARGUMENTS names unknown language '{language}'");
            };
            description
                .arguments
                .extend(arguments.split_whitespace().map(str::to_string));
        }

        let worker_runtime = args
            .worker_runtime
            .map(|runtime| runtime.trim().to_ascii_lowercase())
            .filter(|runtime| !runtime.is_empty());

        Ok(Self {
            server_addr: args.server_addr,
            worker_runtime,
            process_count: args.process_count,
            placeholder_mode: args.placeholder_mode,
            container_start_context: args.container_start_context.filter(|c| !c.is_empty()),
            app_directory: args.app_directory,
            workers_directory: args.workers_directory,
            placeholder_languages: args
                .placeholder_languages
                .into_iter()
                .map(|language| language.trim().to_ascii_lowercase())
                .filter(|language| !language.is_empty())
                .collect(),
            workers,
            platform,
            mount_enabled: args.mount_enabled,
            timeouts,
            dispatch,
        })
    }
}
