//! Error taxonomy for Cellblock.
//!
//! Disconnects and session timeouts are not errors; they surface as
//! [`crate::session::SessionOutcome`] values.

/// Errors reported by a [`crate::runtime::SandboxRuntime`] backend.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("runtime backend error: {0}")]
    Backend(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cellblock errors.
#[derive(Debug, thiserror::Error)]
pub enum CellblockError {
    /// Invalid policy or settings. Fatal at startup, never per session.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Sandbox creation failed after its retry.
    #[error("sandbox creation failed: {0}")]
    SandboxCreation(String),

    /// The session already holds a sandbox.
    #[error("session {session_id} already holds sandbox {sandbox_id}")]
    AllocationConflict {
        session_id: String,
        sandbox_id: String,
    },

    /// The sandbox exists but its interactive channel could not be opened.
    #[error("channel open failed for sandbox {sandbox_id}: {reason}")]
    ChannelOpen { sandbox_id: String, reason: String },

    /// A forwarding loop failed for a reason other than a disconnect.
    #[error("unexpected proxy failure in session {session_id}: {reason}")]
    UnexpectedProxy { session_id: String, reason: String },

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CellblockError {
    /// Shorthand for a [`CellblockError::Configuration`] error.
    pub fn config(msg: impl Into<String>) -> Self {
        CellblockError::Configuration(msg.into())
    }
}

/// Result type for Cellblock operations.
pub type Result<T> = std::result::Result<T, CellblockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_converts() {
        let err: CellblockError = RuntimeError::NotFound("abc".into()).into();
        assert!(matches!(err, CellblockError::Runtime(_)));
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_channel_open_display_names_sandbox() {
        let err = CellblockError::ChannelOpen {
            sandbox_id: "sbx-1".into(),
            reason: "exited".into(),
        };
        assert_eq!(
            err.to_string(),
            "channel open failed for sandbox sbx-1: exited"
        );
    }
}
