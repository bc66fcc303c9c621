//! `config.toml` for clients and agents alike.
//!
//! Every table and key is optional; a missing file means all defaults.

use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fmt, fs};
use thiserror::Error;

const CONFIG_FILE: &str = "config.toml";
const SCHEMA_VERSION: u32 = 1;

/// Rendezvous section shared with in-host tooling.
pub const DEFAULT_SECTION: &str = "reapy";
pub const DEFAULT_SERVER_PORT: u16 = 2306;
pub const DEFAULT_WEB_INTERFACE_PORT: u16 = 2307;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub config_version: u32,
    pub bridge: BridgeConfig,
    pub bootstrap: BootstrapConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: SCHEMA_VERSION,
            bridge: BridgeConfig::default(),
            bootstrap: BootstrapConfig::default(),
            agent: AgentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where the agent listens and how clients find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub section: String,
    pub server_port: u16,
    pub web_interface_port: u16,
    pub bind_host: String,
    /// Hosts a client may drive; the first one is used unless told otherwise.
    pub slaves: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            section: DEFAULT_SECTION.into(),
            server_port: DEFAULT_SERVER_PORT,
            web_interface_port: DEFAULT_WEB_INTERFACE_PORT,
            bind_host: "0.0.0.0".into(),
            slaves: vec!["localhost".into()],
        }
    }
}

/// How long a client waits for the web interface to publish a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub poll_attempts: u32,
    pub poll_interval_ms: u64,
    pub http_timeout_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 10,
            poll_interval_ms: 1_000,
            http_timeout_ms: 2_000,
        }
    }
}

impl BootstrapConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Per-tick wait on an idle connection; zero is bumped to one.
    pub read_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { read_timeout_ms: 1 }
    }
}

impl AgentConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub max_log_files: usize,
    /// Mirror log lines to stderr as well as the rolling file.
    pub stdout: bool,
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            max_log_files: 7,
            stdout: true,
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.directive())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{path}: {source}")]
    Invalid {
        path: PathBuf,
        source: ValidationError,
    },
    #[error(transparent)]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("config_version {found} is not understood by this build")]
    UnsupportedVersion { found: u32 },
    #[error("bridge.section must not be empty")]
    EmptySection,
    #[error("bridge.slaves must list at least one host")]
    NoSlaves,
    #[error("bootstrap.poll_attempts must be at least 1")]
    NoPollAttempts,
    #[error("bridge.server_port and bridge.web_interface_port are both {port}")]
    PortClash { port: u16 },
}

impl Config {
    /// Reads `config.toml` from the config directory, creating the directories first.
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        Self::load_from(&dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(|source| ConfigError::Invalid {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let bridge = &self.bridge;
        if self.config_version != SCHEMA_VERSION {
            Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
            })
        } else if bridge.section.trim().is_empty() {
            Err(ValidationError::EmptySection)
        } else if bridge.slaves.is_empty() {
            Err(ValidationError::NoSlaves)
        } else if self.bootstrap.poll_attempts == 0 {
            Err(ValidationError::NoPollAttempts)
        } else if bridge.server_port == bridge.web_interface_port {
            Err(ValidationError::PortClash {
                port: bridge.server_port,
            })
        } else {
            Ok(())
        }
    }
}
