//! Bidirectional byte forwarding between a client and a sandbox channel.
//!
//! Two loops run as separate tasks: client→sandbox and sandbox→client. The
//! first loop to end decides the session's end reason; the other is stopped
//! by [`SessionProxy::stop`] through a shared cancellation token.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CellblockError, Result};
use crate::obs::short_id;
use crate::recorder::SessionRecorder;
use crate::runtime::{
    ChannelControl, ChannelReader, ChannelRequest, ChannelWriter, Geometry, SandboxRuntime,
};
use crate::session::{ClientReader, ClientSink};

/// Bytes read per forwarding step.
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on one resize call into the runtime.
pub const RESIZE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToSandbox,
    SandboxToClient,
}

/// Why a forwarding loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The reading side returned end-of-stream.
    Closed,
    /// Reset, broken pipe, aborted or truncated connection.
    Disconnected,
    /// Stopped through the shutdown token.
    Cancelled,
    /// Any other I/O error.
    Failed(String),
}

/// The first loop exit observed by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyExit {
    pub direction: Direction,
    pub end: StreamEnd,
}

fn classify(err: &std::io::Error) -> StreamEnd {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionAborted
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => StreamEnd::Disconnected,
        _ => StreamEnd::Failed(err.to_string()),
    }
}

/// Shared bookkeeping for both loops.
#[derive(Clone)]
struct LoopSignals {
    shutdown: CancellationToken,
    finished: CancellationToken,
    first_exit: Arc<Mutex<Option<ProxyExit>>>,
}

impl LoopSignals {
    fn exited(&self, direction: Direction, end: StreamEnd) {
        {
            let mut first = self.first_exit.lock();
            if first.is_none() {
                debug!(?direction, ?end, "forwarding loop ended first");
                *first = Some(ProxyExit { direction, end });
            }
        }
        self.finished.cancel();
    }
}

/// Proxies one session's bytes and forwards terminal resizes.
pub struct SessionProxy {
    session_id: String,
    sandbox_id: String,
    runtime: Arc<dyn SandboxRuntime>,
    request: ChannelRequest,
    recorder: Arc<dyn SessionRecorder>,
    input: Mutex<Option<ClientReader>>,
    output: ClientSink,
    control: Option<Box<dyn ChannelControl>>,
    signals: LoopSignals,
    tasks: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl SessionProxy {
    pub fn new(
        session_id: impl Into<String>,
        sandbox_id: impl Into<String>,
        runtime: Arc<dyn SandboxRuntime>,
        request: ChannelRequest,
        recorder: Arc<dyn SessionRecorder>,
        input: ClientReader,
        output: ClientSink,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sandbox_id: sandbox_id.into(),
            runtime,
            request,
            recorder,
            input: Mutex::new(Some(input)),
            output,
            control: None,
            signals: LoopSignals {
                shutdown: CancellationToken::new(),
                finished: CancellationToken::new(),
                first_exit: Arc::new(Mutex::new(None)),
            },
            tasks: Vec::new(),
            stopped: false,
        }
    }

    /// Open the shell channel and start both forwarding loops.
    pub async fn start(&mut self) -> Result<()> {
        let Some(input) = self.input.get_mut().take() else {
            return Err(CellblockError::ChannelOpen {
                sandbox_id: self.sandbox_id.clone(),
                reason: "proxy already started".into(),
            });
        };

        let channel = self
            .runtime
            .open_channel(&self.sandbox_id, &self.request)
            .await
            .map_err(|e| CellblockError::ChannelOpen {
                sandbox_id: self.sandbox_id.clone(),
                reason: e.to_string(),
            })?;

        self.control = Some(channel.control);
        self.tasks.push(tokio::spawn(client_to_sandbox(
            input,
            channel.writer,
            Arc::clone(&self.recorder),
            self.signals.clone(),
        )));
        self.tasks.push(tokio::spawn(sandbox_to_client(
            channel.reader,
            Arc::clone(&self.output),
            Arc::clone(&self.recorder),
            self.signals.clone(),
        )));

        info!(
            session_id = %self.session_id,
            sandbox = %short_id(&self.sandbox_id),
            geometry = %self.request.geometry,
            "proxy started"
        );
        Ok(())
    }

    /// Forward a terminal size change. A no-op unless the channel is open.
    pub async fn handle_resize(&self, geometry: Geometry) {
        if self.stopped || self.signals.shutdown.is_cancelled() {
            return;
        }
        let Some(control) = self.control.as_ref() else {
            return;
        };
        self.recorder.record_resize(geometry);
        match tokio::time::timeout(RESIZE_TIMEOUT, control.resize(geometry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, %geometry, error = %e, "resize failed")
            }
            Err(_) => warn!(session_id = %self.session_id, %geometry, "resize timed out"),
        }
    }

    /// Resolve once either loop has ended, with the first end reason.
    ///
    /// Returns `None` if the proxy was never started.
    pub async fn wait_completion(&self) -> Option<ProxyExit> {
        if self.tasks.is_empty() {
            return None;
        }
        self.signals.finished.cancelled().await;
        self.signals.first_exit.lock().clone()
    }

    /// Cancel both loops and wait for them. Idempotent.
    ///
    /// A loop is only forgotten once it has finished, so calling `stop` again
    /// after an interrupted call still waits for whatever is left.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.signals.shutdown.cancel();

        while let Some(task) = self.tasks.last_mut() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(session_id = %self.session_id, "forwarding loop panicked");
                }
            }
            self.tasks.pop();
        }
        self.stopped = true;
        self.control = None;
        self.input.get_mut().take();
        debug!(session_id = %self.session_id, "proxy stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for SessionProxy {
    fn drop(&mut self) {
        self.signals.shutdown.cancel();
    }
}

async fn client_to_sandbox(
    mut input: ClientReader,
    mut writer: ChannelWriter,
    recorder: Arc<dyn SessionRecorder>,
    signals: LoopSignals,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let end = loop {
        let n = tokio::select! {
            biased;
            _ = signals.shutdown.cancelled() => break StreamEnd::Cancelled,
            read = input.read(&mut buf) => match read {
                Ok(0) => break StreamEnd::Closed,
                Ok(n) => n,
                Err(e) => break classify(&e),
            },
        };

        recorder.record_input(&buf[..n]);
        let written = tokio::select! {
            biased;
            _ = signals.shutdown.cancelled() => break StreamEnd::Cancelled,
            r = write_chunk(&mut writer, &buf[..n]) => r,
        };
        if let Err(e) = written {
            break classify(&e);
        }
    };

    signals.exited(Direction::ClientToSandbox, end);
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "channel writer shutdown failed");
    }
}

async fn sandbox_to_client(
    mut reader: ChannelReader,
    output: ClientSink,
    recorder: Arc<dyn SessionRecorder>,
    signals: LoopSignals,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let end = loop {
        let n = tokio::select! {
            biased;
            _ = signals.shutdown.cancelled() => break StreamEnd::Cancelled,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break StreamEnd::Closed,
                Ok(n) => n,
                Err(e) => break classify(&e),
            },
        };

        recorder.record_output(&buf[..n]);
        let written = tokio::select! {
            biased;
            _ = signals.shutdown.cancelled() => break StreamEnd::Cancelled,
            r = async {
                let mut sink = output.lock().await;
                write_chunk(&mut *sink, &buf[..n]).await
            } => r,
        };
        if let Err(e) = written {
            break classify(&e);
        }
    };

    signals.exited(Direction::SandboxToClient, end);
}

async fn write_chunk<W>(writer: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(chunk).await?;
    writer.flush().await
}
