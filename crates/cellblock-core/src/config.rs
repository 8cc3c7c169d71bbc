//! Configuration model and validation.
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. [`CellblockConfig::validate`] enforces the floors the
//! runtime relies on and dry-runs the isolation translator.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{CellblockError, Result};
use crate::isolation::{translate, IsolationPolicy};
use crate::retry::RetryPolicy;

/// Shortest allowed session, in seconds.
pub const MIN_SESSION_TIMEOUT_SECS: u64 = 60;
/// Shortest allowed sandbox creation timeout, in seconds.
pub const MIN_SPAWN_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of sandboxes kept ready.
    pub size: usize,
    /// Image every sandbox is created from.
    pub image: String,
    /// Timeout for one sandbox creation attempt.
    pub spawn_timeout_secs: u64,
    /// Delay before the single creation retry.
    pub retry_delay_ms: u64,
    /// Prefix for generated sandbox names.
    pub name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            image: "cellblock-target-ubuntu:latest".into(),
            spawn_timeout_secs: 30,
            retry_delay_ms: 2_000,
            name_prefix: "cellblock-target".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum session duration.
    pub timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { timeout_secs: 3600 }
    }
}

/// The interactive command run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub command: Vec<String>,
    pub user: String,
    pub workdir: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command: vec!["/bin/bash".into()],
            user: "root".into(),
            workdir: "/root".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from("/data/recordings"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit newline-delimited JSON.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Engine socket; the platform default is used when unset.
    pub socket_path: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellblockConfig {
    pub pool: PoolConfig,
    pub isolation: IsolationPolicy,
    pub session: SessionConfig,
    pub shell: ShellConfig,
    pub recording: RecordingConfig,
    pub logging: LoggingConfig,
    pub docker: DockerConfig,
}

impl CellblockConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: CellblockConfig = toml::from_str(source)
            .map_err(|e| CellblockError::config(format!("malformed TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            CellblockError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Check every bound the pool, proxy and orchestrator rely on.
    pub fn validate(&self) -> Result<()> {
        if self.pool.size < 1 {
            return Err(CellblockError::config("pool.size must be at least 1"));
        }
        if self.pool.image.trim().is_empty() {
            return Err(CellblockError::config("pool.image must not be empty"));
        }
        if self.pool.spawn_timeout_secs < MIN_SPAWN_TIMEOUT_SECS {
            return Err(CellblockError::config(format!(
                "pool.spawn_timeout_secs must be at least {MIN_SPAWN_TIMEOUT_SECS}"
            )));
        }
        if self.session.timeout_secs < MIN_SESSION_TIMEOUT_SECS {
            return Err(CellblockError::config(format!(
                "session.timeout_secs must be at least {MIN_SESSION_TIMEOUT_SECS}"
            )));
        }
        if !(0.1..=8.0).contains(&self.isolation.cpu_quota) {
            return Err(CellblockError::config(
                "isolation.cpu_quota must be between 0.1 and 8.0 cores",
            ));
        }
        if self.isolation.pids_limit < 10 {
            return Err(CellblockError::config(
                "isolation.pids_limit must be at least 10",
            ));
        }
        if self.shell.command.is_empty() {
            return Err(CellblockError::config("shell.command must not be empty"));
        }
        if self.recording.enabled && self.recording.output_dir.as_os_str().is_empty() {
            return Err(CellblockError::config(
                "recording.output_dir is required when recording is enabled",
            ));
        }

        translate(
            &self.isolation,
            &self.pool.image,
            &self.pool.name_prefix,
            Utc::now(),
            None,
        )?;
        Ok(())
    }

    /// Retry timing for sandbox creation.
    pub fn creation_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout_ms: self.pool.spawn_timeout_secs * 1000,
            retry_delay_ms: self.pool.retry_delay_ms,
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session.timeout_secs)
    }
}
