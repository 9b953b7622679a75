//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VAWS_CLI`, `AWS_PROFILE`, `AWS_REGION`
//!    (then `AWS_DEFAULT_REGION`), `VAWS_STATE_DIR`
//! 2. **Config file** — path via `--config <path>`, or `~/.vaws/config.toml`
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [aws]
//! cli = "aws"
//! profile = "staging"
//! region = "eu-west-1"
//!
//! [tunnels]
//! state_dir = "~/.vaws"
//! public_ready_ms = 100
//! private_ready_timeout_ms = 2000
//! shutdown_timeout_secs = 5
//! output_limit = 65536
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::util::{default_state_dir, expand_tilde};

/// Errors raised while reading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aws: AwsConfig,
    #[serde(default)]
    pub tunnels: TunnelsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the cloud CLI is invoked for `ssm start-session`.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// Executable used for sessions (default `aws`, looked up on `PATH`).
    #[serde(default = "default_cli")]
    pub cli: String,
    /// Named profile passed as `--profile`. Omitted when empty.
    #[serde(default)]
    pub profile: String,
    /// Region passed as `--region`. Omitted when empty.
    #[serde(default)]
    pub region: String,
}

/// Tunnel lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelsConfig {
    /// Directory holding `tunnels.json` (default `~/.vaws`).
    #[serde(default = "default_state_dir_string")]
    pub state_dir: String,
    /// Delay after spawning a public proxy server before reporting it active.
    #[serde(default = "default_public_ready_ms")]
    pub public_ready_ms: u64,
    /// Upper bound on waiting for a private forwarder to accept connections.
    #[serde(default = "default_private_ready_timeout_ms")]
    pub private_ready_timeout_ms: u64,
    /// Graceful HTTP shutdown bound when stopping a gateway tunnel.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Bytes of stdout and stderr retained per session child.
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_cli() -> String {
    "aws".to_string()
}
fn default_state_dir_string() -> String {
    "~/.vaws".to_string()
}
fn default_public_ready_ms() -> u64 {
    100
}
fn default_private_ready_timeout_ms() -> u64 {
    2000
}
fn default_shutdown_timeout_secs() -> u64 {
    5
}
fn default_output_limit() -> usize {
    64 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            cli: default_cli(),
            profile: String::new(),
            region: String::new(),
        }
    }
}

impl Default for TunnelsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir_string(),
            public_ready_ms: default_public_ready_ms(),
            private_ready_timeout_ms: default_private_ready_timeout_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            output_limit: default_output_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TunnelsConfig {
    /// `state_dir` with `~` expanded.
    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(expand_tilde(&self.state_dir).into_owned())
    }

    pub fn public_ready(&self) -> Duration {
        Duration::from_millis(self.public_ready_ms)
    }

    pub fn private_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.private_ready_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise
    /// `~/.vaws/config.toml` is used when present, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else {
            let default_path = default_state_dir().join("config.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Config::default()
            }
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    /// Apply environment overrides through `lookup` (injected for tests).
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(cli) = lookup("VAWS_CLI") {
            self.aws.cli = cli;
        }
        if let Some(profile) = lookup("AWS_PROFILE") {
            self.aws.profile = profile;
        }
        if let Some(region) = lookup("AWS_REGION").or_else(|| lookup("AWS_DEFAULT_REGION")) {
            self.aws.region = region;
        }
        if let Some(dir) = lookup("VAWS_STATE_DIR") {
            self.tunnels.state_dir = dir;
        }
    }
}
