use crate::readiness::Endpoint;
use crate::state::StateStore;
use anyhow::{Context, Result};
use serde::Deserialize;
use slog_scope::debug;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Variables layered on top of the supervisor's own environment
    /// for every service, given as `KEY=VALUE` strings.
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// A dotenv-style file whose variables are applied before [`Config::env`].
    pub env_file: Option<PathBuf>,

    /// The services to launch, in launch order.
    #[serde(default)]
    pub services: Vec<Service>,

    /// The directory that relative paths in the configuration are resolved against. Set to
    /// the config file's directory on load.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SupervisorConfig {
    /// Where the PIDs of a running session are recorded. Default: `.pids.json`
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// How long to give services to bind their sockets before probing them. Default: 3s
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,

    /// Time between SIGTERM and SIGKILL on shutdown. Default: 2s
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// How long a single service may take to pass its readiness probe. Default: 30s
    #[serde(default = "default_readiness_timeout", with = "humantime_serde")]
    pub readiness_timeout: Duration,

    /// Pause between two readiness probe attempts. Default: 1s
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub readiness_poll_interval: Duration,

    /// Upper bound for a single probe attempt (connect, request and response). Default: 1s
    #[serde(default = "default_probe_attempt_timeout", with = "humantime_serde")]
    pub probe_attempt_timeout: Duration,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".pids.json")
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(2)
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_probe_attempt_timeout() -> Duration {
    Duration::from_secs(1)
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            state_file: default_state_file(),
            settle_delay: default_settle_delay(),
            grace_period: default_grace_period(),
            readiness_timeout: default_readiness_timeout(),
            readiness_poll_interval: default_poll_interval(),
            probe_attempt_timeout: default_probe_attempt_timeout(),
        }
    }
}

/// One supervised service.
#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Service {
    /// Unique name, used in logs and to find the service again after launch.
    pub name: String,

    /// The directory to chdir into before running the commandline.
    pub dir: PathBuf,

    /// The commandline as an array of arguments. No shell expansion happens.
    pub cmd: Vec<String>,

    /// The port the service listens on. Only informational.
    pub port: u16,

    /// An HTTP URL that answers `200 OK` with `"status":"ok"` once the service is up. Services
    /// without one are assumed ready as soon as they're launched.
    #[serde(default)]
    pub readiness: Option<Endpoint>,
}

/// A single `KEY=VALUE` environment override.
#[derive(Deserialize)]
#[serde(try_from = "String")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl TryFrom<String> for EnvVar {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let mut parts = s.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some(key), Some(value)) if !key.trim().is_empty() => Ok(EnvVar {
                key: key.trim().to_string(),
                value: value.to_string(),
            }),
            _ => Err(ConfigError::MalformedEnvVar(s)),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl From<LogLevel> for slog::Level {
    fn from(level: LogLevel) -> slog::Level {
        match level {
            LogLevel::Debug => slog::Level::Debug,
            LogLevel::Info => slog::Level::Info,
            LogLevel::Warn => slog::Level::Warning,
            LogLevel::Error => slog::Level::Error,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum LogFormat {
    Json,
    Logfmt {
        #[serde(default)]
        print_prefix: bool,
    },
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Logfmt {
            print_prefix: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum LogOutput {
    Stderr,
    Stdout,
}

impl Default for LogOutput {
    fn default() -> Self {
        LogOutput::Stderr
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment override {0:?} is not of the form KEY=VALUE")]
    MalformedEnvVar(String),

    #[error("service {0:?} is defined more than once")]
    DuplicateService(String),

    #[error("service {0:?} has an empty commandline")]
    EmptyCommand(String),
}

impl Config {
    /// Reads and validates the configuration file at `path`. Relative paths inside it are
    /// resolved against the file's directory.
    pub fn from_file(path: &Path) -> Result<Config> {
        let config_file = path
            .canonicalize()
            .with_context(|| format!("Could not find configuration file {:?}", path))?;
        let mut settings = config::Config::default();
        settings.merge(config::File::from(config_file.as_path()))?;
        let mut settings = settings
            .try_into::<Config>()
            .with_context(|| format!("Could not parse configuration file {:?}", &config_file))?;
        if let Some(dir) = config_file.parent() {
            settings.base_dir = dir.to_owned();
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
            if service.cmd.is_empty() {
                return Err(ConfigError::EmptyCommand(service.name.clone()));
            }
        }
        Ok(())
    }

    pub fn canonical_path(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    /// The configured services in launch order, with their working directories resolved.
    pub fn registry(&self) -> Vec<Service> {
        self.services
            .iter()
            .map(|service| Service {
                dir: self.canonical_path(&service.dir),
                ..service.clone()
            })
            .collect()
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(self.canonical_path(&self.supervisor.state_file))
    }

    /// Environment overrides for the services: the env file's variables first, then the
    /// `env` list on top.
    pub fn environment(&self) -> Result<HashMap<String, String>> {
        let mut vars = HashMap::new();
        if let Some(env_file) = &self.env_file {
            let path = self.canonical_path(env_file);
            if path.exists() {
                let entries = dotenvy::from_path_iter(&path)
                    .with_context(|| format!("Could not read env file {:?}", &path))?;
                for entry in entries {
                    let (key, value) =
                        entry.with_context(|| format!("Could not parse env file {:?}", &path))?;
                    vars.insert(key, value);
                }
            } else {
                debug!("env file does not exist, skipping"; "path" => ?path);
            }
        }
        for var in &self.env {
            vars.insert(var.key.clone(), var.value.clone());
        }
        Ok(vars)
    }
}
