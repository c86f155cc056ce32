//! Configuration of the API daemon

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default path of the API control socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/hop-api.sock";

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [api]
/// socket = "/var/run/hop-api.sock"
/// allow_list = "/var/lib/hop-api/allowed.json"
/// delivery_timeout_ms = 2000
///
/// [engine]
/// command = "ruhop"
/// args = ["-c", "{config}", "client"]
/// control_socket = "/var/run/ruhop.sock"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.api.socket.as_os_str().is_empty() {
            return Err(Error::Config("api.socket is required".into()));
        }

        if self.api.delivery_timeout_ms == 0 {
            return Err(Error::Config("api.delivery_timeout_ms must be > 0".into()));
        }

        self.engine.validate()
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# hop-api daemon configuration

[api]
# Control socket API callers connect to
socket = "/var/run/hop-api.sock"

# Names of the accounts allowed to use the API (JSON array).
# Manage it with `hop-apid allow <name>` and `hop-apid revoke <name>`.
allow_list = "/var/lib/hop-api/allowed.json"

# An observer that does not take a status update within this time
# is treated as unreachable and dropped
delivery_timeout_ms = 2000

# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

[engine]
# Tunnel program started for a profile. "{config}" is replaced by the path
# of the profile configuration written to runtime_dir.
command = "ruhop"
args = ["-c", "{config}", "client"]
runtime_dir = "/var/run/hop-api"

# Control socket of the tunnel program, polled for its state
control_socket = "/var/run/ruhop.sock"
poll_interval_ms = 1000

# Firewall mark set on protected sockets so policy routing keeps them
# out of the tunnel (Linux only)
fwmark = 26736
"#
        .to_string()
    }
}

/// Control socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_socket")]
    pub socket: PathBuf,

    #[serde(default = "default_allow_list")]
    pub allow_list: PathBuf,

    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ApiConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            allow_list: default_allow_list(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

/// Tunnel process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_command")]
    pub command: String,

    #[serde(default = "default_args")]
    pub args: Vec<String>,

    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_fwmark")]
    pub fwmark: u32,
}

impl EngineConfig {
    /// Validate engine configuration
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::Config("engine.command is required".into()));
        }

        if !self.args.iter().any(|a| a.contains("{config}")) {
            return Err(Error::Config(
                "engine.args must contain the {config} placeholder".into(),
            ));
        }

        if self.poll_interval_ms == 0 {
            return Err(Error::Config("engine.poll_interval_ms must be > 0".into()));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Command line arguments for a profile written to `config_path`
    pub fn args_for(&self, config_path: &Path) -> Vec<String> {
        let path = config_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{config}", &path))
            .collect()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            runtime_dir: default_runtime_dir(),
            control_socket: default_control_socket(),
            poll_interval_ms: default_poll_interval_ms(),
            fwmark: default_fwmark(),
        }
    }
}

// Default value functions
fn default_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_allow_list() -> PathBuf {
    PathBuf::from("/var/lib/hop-api/allowed.json")
}

fn default_delivery_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_command() -> String {
    "ruhop".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-c".into(), "{config}".into(), "client".into()]
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/var/run/hop-api")
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/var/run/ruhop.sock")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_fwmark() -> u32 {
    0x6870
}
