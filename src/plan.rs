pub mod process_id;

use crate::cron::{CronParseError, CronSchedule};
use process_id::{ProcessId, ProcessIdError};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "pup.json";
pub const DEFAULT_RESTART_DELAY_MS: u64 = 10_000;
pub const DEFAULT_TERMINATE_TIMEOUT_MS: u64 = 30_000;

/// Relative path of the IPC socket, resolved against the config directory.
const SOCKET_RELATIVE_PATH: &str = ".pup/pup.sock";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("process id error: {0}")]
    ProcessId(#[from] ProcessIdError),

    #[error("duplicate process id `{0}`")]
    DuplicateId(String),

    #[error("process `{0}`: cmd must not be empty")]
    EmptyCmd(ProcessId),

    #[error("process `{id}`: invalid cron expression: {source}")]
    InvalidCron { id: ProcessId, source: CronParseError },

    #[error("process `{0}`: instances must be at least 1")]
    InvalidInstances(ProcessId),

    #[error("process `{0}`: `path` requires `port` to open a load-balancing front-end")]
    MissingPort(ProcessId),

    #[error("process `{0}`: `watch` must name at least one path")]
    EmptyWatch(ProcessId),
}

/// How a supervisor reacts to its child exiting.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
    OnError,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    pub stdout: Option<PathBuf>,
    pub decorate: Option<bool>,
    pub colors: Option<bool>,
}

/// One `processes` entry as written in `pup.json`. Paths are raw here;
/// [`Plan::load`] resolves them against the config directory.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProcessEntry {
    id: String,
    cmd: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    autostart: bool,
    cron: Option<String>,
    watch: Option<Vec<PathBuf>>,
    #[serde(default)]
    restart: RestartPolicy,
    #[serde(default = "default_restart_delay_ms")]
    restart_delay_ms: u64,
    restart_limit: Option<u32>,
    #[serde(default = "default_terminate_timeout_ms")]
    terminate_timeout_ms: u64,
    #[serde(default = "default_instances")]
    instances: u32,
    path: Option<String>,
    port: Option<u16>,
    start_port: Option<u16>,
    #[serde(default)]
    strategy: BalancingStrategy,
}

fn default_restart_delay_ms() -> u64 {
    DEFAULT_RESTART_DELAY_MS
}

fn default_terminate_timeout_ms() -> u64 {
    DEFAULT_TERMINATE_TIMEOUT_MS
}

fn default_instances() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    #[serde(default)]
    logger: LoggerConfig,
    processes: Vec<ProcessEntry>,
}

/// Front-end settings of a clustered process.
#[derive(Debug, Clone, PartialEq)]
pub struct BalancerSpec {
    pub path: String,
    pub port: u16,
    /// Backend port of replica `i` is `start_port + i`.
    pub start_port: u16,
    pub strategy: BalancingStrategy,
}

/// A validated process declaration. Immutable once the [`Plan`] is built.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub id: ProcessId,
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub autostart: bool,
    pub cron: Option<CronSchedule>,
    pub watch: Vec<PathBuf>,
    pub restart: RestartPolicy,
    pub restart_delay_ms: u64,
    pub restart_limit: Option<u32>,
    pub terminate_timeout_ms: u64,
    pub instances: u32,
    pub balancer: Option<BalancerSpec>,
}

/// The validated, immutable configuration consumed by the core.
#[derive(Debug, Clone)]
pub struct Plan {
    pub processes: Vec<ProcessSpec>,
    pub logger: LoggerConfig,
    /// Directory the config file lives in; every relative path resolves here.
    pub base_dir: PathBuf,
    pub socket_path: PathBuf,
}

impl Plan {
    /// Reads and validates the configuration file. Partial loads are not
    /// permitted: the first validation failure aborts the whole load.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let base_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&contents, base_dir)
    }

    fn parse(contents: &str, base_dir: PathBuf) -> Result<Self, ConfigError> {
        let document: ConfigDocument = serde_json::from_str(contents)?;

        let mut processes = Vec::with_capacity(document.processes.len());
        for entry in document.processes {
            processes.push(validate_entry(entry, &base_dir)?);
        }

        let mut seen: Vec<&ProcessId> = Vec::with_capacity(processes.len());
        for spec in &processes {
            if seen.contains(&&spec.id) {
                return Err(ConfigError::DuplicateId(spec.id.to_string()));
            }
            seen.push(&spec.id);
        }

        let mut logger = document.logger;
        logger.stdout = logger.stdout.map(|p| resolve(&base_dir, p));

        let socket_path = base_dir.join(SOCKET_RELATIVE_PATH);
        Ok(Plan {
            processes,
            logger,
            base_dir,
            socket_path,
        })
    }

    /// Largest graceful-stop window in the plan; the global shutdown deadline
    /// is derived from this.
    pub fn max_terminate_timeout_ms(&self) -> u64 {
        self.processes
            .iter()
            .map(|p| p.terminate_timeout_ms)
            .max()
            .unwrap_or(DEFAULT_TERMINATE_TIMEOUT_MS)
    }
}

fn validate_entry(entry: ProcessEntry, base_dir: &Path) -> Result<ProcessSpec, ConfigError> {
    let id = ProcessId::try_from(entry.id)?;

    if entry.cmd.is_empty() {
        return Err(ConfigError::EmptyCmd(id));
    }
    if entry.instances < 1 {
        return Err(ConfigError::InvalidInstances(id));
    }

    let cron = entry
        .cron
        .map(|expr| CronSchedule::parse(&expr))
        .transpose()
        .map_err(|source| ConfigError::InvalidCron {
            id: id.clone(),
            source,
        })?;

    let watch = match entry.watch {
        Some(paths) if paths.is_empty() => return Err(ConfigError::EmptyWatch(id)),
        Some(paths) => paths.into_iter().map(|p| resolve(base_dir, p)).collect(),
        None => Vec::new(),
    };

    let balancer = match entry.path {
        Some(path) => {
            let port = entry.port.ok_or_else(|| ConfigError::MissingPort(id.clone()))?;
            Some(BalancerSpec {
                path,
                port,
                start_port: entry.start_port.unwrap_or(port + 1),
                strategy: entry.strategy,
            })
        }
        None => None,
    };

    let cwd = entry
        .cwd
        .map(|p| resolve(base_dir, p))
        .unwrap_or_else(|| base_dir.to_path_buf());

    Ok(ProcessSpec {
        id,
        cmd: entry.cmd,
        cwd,
        env: entry.env,
        autostart: entry.autostart,
        cron,
        watch,
        restart: entry.restart,
        restart_delay_ms: entry.restart_delay_ms,
        restart_limit: entry.restart_limit,
        terminate_timeout_ms: entry.terminate_timeout_ms,
        instances: entry.instances,
        balancer,
    })
}

fn resolve(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}
