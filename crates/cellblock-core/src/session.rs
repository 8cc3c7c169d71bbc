//! Per-session types shared by the proxy, recorder and orchestrator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::runtime::Geometry;

/// The only message shown to a client when allocation or channel setup fails.
pub const GENERIC_FAILURE_NOTICE: &[u8] =
    b"\r\nSession error: unable to start a shell. Please try again later.\r\n";

/// Written to the client when the session duration limit is reached.
pub const TIMEOUT_NOTICE: &[u8] = b"\r\nSession timeout reached. Disconnecting.\r\n";

/// How long a notice may wait for the client sink before it is dropped.
pub const NOTICE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Identity and terminal parameters of one accepted connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    /// Authenticated user name as reported by the listener.
    pub identity: String,
    pub source_addr: String,
    pub term_type: String,
    pub geometry: Geometry,
    pub created_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        identity: impl Into<String>,
        source_addr: impl Into<String>,
        geometry: Geometry,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            identity: identity.into(),
            source_addr: source_addr.into(),
            term_type: "xterm".into(),
            geometry,
            created_at: Utc::now(),
        }
    }

    pub fn with_term_type(mut self, term_type: impl Into<String>) -> Self {
        self.term_type = term_type.into();
        self
    }
}

/// Bytes from the client.
pub type ClientReader = Box<dyn AsyncRead + Send + Unpin>;

/// Bytes to the client. Shared between the proxy and the orchestrator's
/// notices; the lock is held for one chunk at a time.
pub type ClientSink = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Streams handed over by the listener for one session.
pub struct SessionIo {
    pub input: ClientReader,
    pub output: Box<dyn AsyncWrite + Send + Unpin>,
    /// Terminal size changes requested by the client.
    pub resizes: mpsc::UnboundedReceiver<Geometry>,
}

impl SessionIo {
    /// Bundle client streams, returning the sender the listener uses for
    /// resize notifications.
    pub fn new(
        input: impl AsyncRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> (Self, mpsc::UnboundedSender<Geometry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let io = Self {
            input: Box::new(input),
            output: Box::new(output),
            resizes: rx,
        };
        (io, tx)
    }
}

impl std::fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIo").finish_non_exhaustive()
    }
}

/// Orchestrator state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Allocating,
    Proxying,
    Draining,
    Released,
    Errored,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Allocating => "allocating",
            SessionPhase::Proxying => "proxying",
            SessionPhase::Draining => "draining",
            SessionPhase::Released => "released",
            SessionPhase::Errored => "errored",
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The client closed or dropped the connection.
    Disconnected,
    /// The shell inside the sandbox exited.
    ChannelClosed,
    TimedOut,
    AllocationFailed,
    ChannelFailed,
    /// A forwarding loop failed unexpectedly; surfaced as an error.
    ProxyFailed,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Disconnected => "disconnected",
            SessionOutcome::ChannelClosed => "channel_closed",
            SessionOutcome::TimedOut => "timed_out",
            SessionOutcome::AllocationFailed => "allocation_failed",
            SessionOutcome::ChannelFailed => "channel_failed",
            SessionOutcome::ProxyFailed => "proxy_failed",
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub sandbox_id: Option<String>,
    pub outcome: SessionOutcome,
    /// Phases in the order they were entered.
    pub phases: Vec<SessionPhase>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Write a notice to the client, giving up after [`NOTICE_WRITE_TIMEOUT`].
///
/// A client that has gone away or stopped reading loses the notice; the
/// session carries on to teardown either way.
pub(crate) async fn write_notice(sink: &ClientSink, notice: &[u8]) {
    let write = async {
        let mut out = sink.lock().await;
        out.write_all(notice).await?;
        out.flush().await
    };
    match tokio::time::timeout(NOTICE_WRITE_TIMEOUT, write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "could not deliver notice to client"),
        Err(_) => warn!(
            timeout_ms = NOTICE_WRITE_TIMEOUT.as_millis() as u64,
            "client is not reading; notice dropped"
        ),
    }
}
