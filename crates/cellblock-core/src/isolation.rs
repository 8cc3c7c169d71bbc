//! Isolation policy translation.
//!
//! [`translate`] maps a declarative [`IsolationPolicy`] onto the concrete
//! [`CreateParams`] a runtime needs to build one sandbox. It performs no I/O
//! and touches no shared state; the creation timestamp is passed in so the
//! output depends only on the arguments.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CellblockError, Result};

/// CPU scheduling period in microseconds.
pub const CPU_PERIOD_US: i64 = 100_000;

/// Label keys stamped onto every sandbox.
pub const LABEL_ROLE: &str = "cellblock.role";
pub const LABEL_VERSION: &str = "cellblock.version";
pub const LABEL_CREATED: &str = "cellblock.created";
pub const LABEL_SESSION: &str = "cellblock.session_id";

/// Linux capability adjustments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityPolicy {
    pub drop: Vec<String>,
    pub add: Vec<String>,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            drop: vec!["ALL".into()],
            add: vec!["CHOWN".into(), "SETUID".into(), "SETGID".into()],
        }
    }
}

/// Resource and security limits applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationPolicy {
    /// Network mode, e.g. `none`.
    pub network_mode: String,
    /// Memory ceiling as `<number>[k|m|g]`.
    pub memory_limit: String,
    /// CPU share in cores.
    pub cpu_quota: f64,
    /// Maximum number of processes.
    pub pids_limit: i64,
    /// Size of the `/tmp` scratch mount as `<number>[k|m|g]`.
    pub tmpfs_size: String,
    pub capabilities: CapabilityPolicy,
    pub security_opt: Vec<String>,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            network_mode: "none".into(),
            memory_limit: "256m".into(),
            cpu_quota: 0.5,
            pids_limit: 100,
            tmpfs_size: "50m".into(),
            capabilities: CapabilityPolicy::default(),
            security_opt: vec!["no-new-privileges:true".into(), "seccomp=default".into()],
        }
    }
}

/// Fully resolved sandbox creation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    pub image: String,
    pub name: String,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    /// Mount point → mount options.
    pub tmpfs: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Keep stdin open so an interactive channel can attach later.
    pub open_stdin: bool,
    /// The terminal is allocated per channel, not at container start.
    pub tty: bool,
}

fn size_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+[kmgKMG]$").expect("static regex"))
}

/// Returns `true` if `limit` matches `<number>[k|m|g]` (case-insensitive unit).
pub fn is_valid_size(limit: &str) -> bool {
    size_pattern().is_match(limit)
}

/// Parse a `<number>[k|m|g]` size into bytes.
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    if !is_valid_size(limit) {
        return Err(CellblockError::config(format!(
            "invalid size '{limit}': expected <number>[k|m|g], e.g. '256m'"
        )));
    }
    let (digits, unit) = limit.split_at(limit.len() - 1);
    let number: i64 = digits
        .parse()
        .map_err(|_| CellblockError::config(format!("size '{limit}' is out of range")))?;
    let multiplier: i64 = match unit.to_ascii_lowercase().as_str() {
        "k" => 1024,
        "m" => 1024 * 1024,
        _ => 1024 * 1024 * 1024,
    };
    number
        .checked_mul(multiplier)
        .ok_or_else(|| CellblockError::config(format!("size '{limit}' is out of range")))
}

/// Human-readable CPU share.
pub fn format_cpu_quota(cores: f64) -> String {
    if cores == 1.0 {
        "1 core".to_string()
    } else if cores < 1.0 {
        format!("{cores} cores ({}% of 1 core)", (cores * 100.0) as i64)
    } else {
        format!("{cores} cores")
    }
}

/// Translate a policy into creation parameters for one sandbox.
///
/// Fails with [`CellblockError::Configuration`] on malformed sizes or
/// non-positive bounds. Values are never clamped.
pub fn translate(
    policy: &IsolationPolicy,
    image: &str,
    name: &str,
    created_at: DateTime<Utc>,
    session_id: Option<&str>,
) -> Result<CreateParams> {
    if image.trim().is_empty() {
        return Err(CellblockError::config("sandbox image must not be empty"));
    }
    if name.trim().is_empty() {
        return Err(CellblockError::config("sandbox name must not be empty"));
    }

    let memory_bytes = parse_memory_limit(&policy.memory_limit)
        .map_err(|e| CellblockError::config(format!("memory_limit: {e}")))?;
    if !is_valid_size(&policy.tmpfs_size) {
        return Err(CellblockError::config(format!(
            "tmpfs_size: invalid size '{}': expected <number>[k|m|g]",
            policy.tmpfs_size
        )));
    }
    if !(policy.cpu_quota.is_finite() && policy.cpu_quota > 0.0) {
        return Err(CellblockError::config(format!(
            "cpu_quota must be a positive number of cores, got {}",
            policy.cpu_quota
        )));
    }
    if policy.pids_limit <= 0 {
        return Err(CellblockError::config(format!(
            "pids_limit must be positive, got {}",
            policy.pids_limit
        )));
    }

    let cpu_quota = (policy.cpu_quota * CPU_PERIOD_US as f64) as i64;
    if cpu_quota <= 0 {
        return Err(CellblockError::config(format!(
            "cpu_quota {} is below the scheduler resolution",
            policy.cpu_quota
        )));
    }

    if policy.cpu_quota > 2.0 {
        warn!(
            cpu_quota = policy.cpu_quota,
            "high CPU quota configured; consider reducing to prevent resource exhaustion"
        );
    }
    if policy.pids_limit < 50 {
        warn!(
            pids_limit = policy.pids_limit,
            "very low pids limit; the shell may fail to spawn processes"
        );
    }

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_ROLE.to_string(), "target".to_string());
    labels.insert(
        LABEL_VERSION.to_string(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    labels.insert(LABEL_CREATED.to_string(), created_at.to_rfc3339());
    if let Some(session_id) = session_id {
        labels.insert(LABEL_SESSION.to_string(), session_id.to_string());
    }

    let mut tmpfs = BTreeMap::new();
    tmpfs.insert("/tmp".to_string(), format!("size={}", policy.tmpfs_size));

    debug!(
        memory = %policy.memory_limit,
        cpu = %format_cpu_quota(policy.cpu_quota),
        pids = policy.pids_limit,
        network = %policy.network_mode,
        "translated isolation policy"
    );

    Ok(CreateParams {
        image: image.to_string(),
        name: name.to_string(),
        memory_bytes,
        cpu_quota,
        cpu_period: CPU_PERIOD_US,
        pids_limit: policy.pids_limit,
        network_mode: policy.network_mode.clone(),
        cap_drop: policy.capabilities.drop.clone(),
        cap_add: policy.capabilities.add.clone(),
        security_opt: policy.security_opt.clone(),
        tmpfs,
        labels,
        open_stdin: true,
        tty: false,
    })
}
