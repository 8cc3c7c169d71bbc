//! Sandbox runtime seam.
//!
//! A [`SandboxRuntime`] creates, stops and attaches to sandboxes on some
//! container engine. The pool and proxy only ever talk to this trait; the
//! in-memory implementation lives in [`crate::fakes`] and the Docker one in
//! the `cellblock-docker` crate.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::RuntimeError;
use crate::isolation::CreateParams;

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl std::fmt::Display for Geometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Parameters for opening an interactive channel into a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub command: Vec<String>,
    pub user: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub geometry: Geometry,
}

impl ChannelRequest {
    /// Build a request for `command`, exporting the terminal type and size.
    pub fn new(
        command: Vec<String>,
        user: impl Into<String>,
        workdir: impl Into<String>,
        term_type: &str,
        geometry: Geometry,
    ) -> Self {
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), term_type.to_string());
        env.insert("COLUMNS".to_string(), geometry.cols.to_string());
        env.insert("LINES".to_string(), geometry.rows.to_string());
        Self {
            command,
            user: user.into(),
            workdir: workdir.into(),
            env,
            geometry,
        }
    }
}

/// Out-of-band control over an open channel.
#[async_trait]
pub trait ChannelControl: Send + Sync {
    /// Change the terminal size of the running shell.
    async fn resize(&self, geometry: Geometry) -> Result<(), RuntimeError>;
}

/// Reader half of a channel (sandbox → client).
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
/// Writer half of a channel (client → sandbox).
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An interactive channel split into independently owned halves.
pub struct SandboxChannel {
    pub reader: ChannelReader,
    pub writer: ChannelWriter,
    pub control: Box<dyn ChannelControl>,
}

impl std::fmt::Debug for SandboxChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxChannel").finish_non_exhaustive()
    }
}

/// Container engine operations used by the pool and the proxy.
///
/// `create` must return a *started* sandbox. `stop` preserves the sandbox's
/// filesystem; nothing in this crate ever removes one.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create and start a sandbox, returning its runtime id.
    async fn create(&self, params: &CreateParams) -> Result<String, RuntimeError>;

    /// Stop a running sandbox without removing it.
    async fn stop(&self, sandbox_id: &str) -> Result<(), RuntimeError>;

    /// Open an interactive shell channel into a running sandbox.
    async fn open_channel(
        &self,
        sandbox_id: &str,
        request: &ChannelRequest,
    ) -> Result<SandboxChannel, RuntimeError>;
}
