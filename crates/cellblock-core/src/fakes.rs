//! In-memory fakes for the runtime and recorder traits (testing only)
//!
//! `MemoryRuntime` hands out sandboxes backed by a tiny line-oriented fake
//! shell running on an in-process duplex pipe. `MemoryRecorder` keeps every
//! call in memory. Both append to a shared [`EventLog`] so tests can check
//! the relative order of teardown steps.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};

use crate::error::RuntimeError;
use crate::isolation::CreateParams;
use crate::recorder::{RecorderFactory, RecordingMetadata, SessionRecorder};
use crate::runtime::{ChannelControl, ChannelRequest, Geometry, SandboxChannel, SandboxRuntime};
use crate::session::{SessionContext, SessionReport};

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Something a fake observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    SandboxCreated(String),
    SandboxStopped(String),
    ChannelOpened(String),
    /// The client-facing write half of a channel was dropped.
    ChannelClosed(String),
    ChannelResized(String, Geometry),
    RecorderStarted(String),
    RecorderStopped(String),
    MetadataWritten(String),
}

/// Ordered, shared record of fake events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<FakeEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: FakeEvent) {
        self.events.lock().push(event);
    }

    pub fn snapshot(&self) -> Vec<FakeEvent> {
        self.events.lock().clone()
    }

    /// Index of the first event equal to `event`.
    pub fn position(&self, event: &FakeEvent) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    pub fn count(&self, pred: impl Fn(&FakeEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

// ---------------------------------------------------------------------------
// MemoryRuntime
// ---------------------------------------------------------------------------

/// In-memory sandbox runtime.
///
/// Sandbox ids are `fake-<n>`. Channels run a fake shell that answers
/// `whoami` with the requested user, exits on `exit`, and otherwise prints
/// `<cmd>: command not found`.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    next_id: AtomicU64,
    created: AtomicU64,
    running: Mutex<HashSet<String>>,
    log: EventLog,
    names: Mutex<HashSet<String>>,
    failing_creates: AtomicU32,
    failing_starts: AtomicU32,
    create_delay: Mutex<Option<Duration>>,
    start_delay: Mutex<Option<Duration>>,
    stop_delay: Mutex<Option<Duration>>,
    resize_delay: Mutex<Option<Duration>>,
    fail_stops: AtomicBool,
    reject_channels: AtomicBool,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an event log with other fakes.
    pub fn with_log(log: EventLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: u32) {
        self.failing_creates.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` create calls fail after the name is taken, the way
    /// an engine leaves a created but unstarted container behind.
    pub fn fail_next_starts(&self, n: u32) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    /// Sleep this long inside every create call, before anything exists.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    /// Sleep this long inside every create call, after the sandbox is running.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = Some(delay);
    }

    /// Sleep this long inside every channel resize.
    pub fn set_resize_delay(&self, delay: Duration) {
        *self.resize_delay.lock() = Some(delay);
    }

    /// Sleep this long inside every stop call.
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = Some(delay);
    }

    pub fn set_fail_stops(&self, fail: bool) {
        self.fail_stops.store(fail, Ordering::SeqCst);
    }

    pub fn set_reject_channels(&self, reject: bool) {
        self.reject_channels.store(reject, Ordering::SeqCst);
    }

    /// Successful create calls so far.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    pub fn is_running(&self, sandbox_id: &str) -> bool {
        self.running.lock().contains(sandbox_id)
    }

    pub fn stopped_ids(&self) -> Vec<String> {
        self.log
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                FakeEvent::SandboxStopped(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn resizes(&self, sandbox_id: &str) -> Vec<Geometry> {
        self.log
            .snapshot()
            .into_iter()
            .filter_map(|e| match e {
                FakeEvent::ChannelResized(id, g) if id == sandbox_id => Some(g),
                _ => None,
            })
            .collect()
    }

    fn take_create_failure(&self) -> bool {
        take_one(&self.failing_creates)
    }

    fn take_start_failure(&self) -> bool {
        take_one(&self.failing_starts)
    }
}

#[async_trait]
impl SandboxRuntime for MemoryRuntime {
    async fn create(&self, params: &CreateParams) -> Result<String, RuntimeError> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.take_create_failure() {
            return Err(RuntimeError::Backend(format!(
                "injected create failure for {}",
                params.name
            )));
        }
        if !self.names.lock().insert(params.name.clone()) {
            return Err(RuntimeError::Backend(format!(
                "name {} is already in use",
                params.name
            )));
        }
        if self.take_start_failure() {
            return Err(RuntimeError::Backend(format!(
                "injected start failure for {}",
                params.name
            )));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("fake-{n:04}");
        self.running.lock().insert(id.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        self.log.push(FakeEvent::SandboxCreated(id.clone()));

        let delay = *self.start_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), RuntimeError> {
        let delay = *self.stop_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_stops.load(Ordering::SeqCst) {
            return Err(RuntimeError::Backend(format!(
                "injected stop failure for {sandbox_id}"
            )));
        }
        if !self.running.lock().remove(sandbox_id) {
            return Err(RuntimeError::NotFound(sandbox_id.to_string()));
        }
        self.log.push(FakeEvent::SandboxStopped(sandbox_id.to_string()));
        Ok(())
    }

    async fn open_channel(
        &self,
        sandbox_id: &str,
        request: &ChannelRequest,
    ) -> Result<SandboxChannel, RuntimeError> {
        if self.reject_channels.load(Ordering::SeqCst) {
            return Err(RuntimeError::Backend("exec rejected".into()));
        }
        if !self.is_running(sandbox_id) {
            return Err(RuntimeError::NotFound(sandbox_id.to_string()));
        }

        let (client_end, shell_end) = tokio::io::duplex(8192);
        tokio::spawn(fake_shell(shell_end, request.user.clone()));

        let (reader, writer) = tokio::io::split(client_end);
        self.log.push(FakeEvent::ChannelOpened(sandbox_id.to_string()));
        Ok(SandboxChannel {
            reader: Box::new(reader),
            writer: Box::new(TrackedWriter {
                inner: writer,
                sandbox_id: sandbox_id.to_string(),
                log: self.log.clone(),
            }),
            control: Box::new(MemoryControl {
                sandbox_id: sandbox_id.to_string(),
                log: self.log.clone(),
                delay: *self.resize_delay.lock(),
            }),
        })
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn fake_shell(stream: DuplexStream, user: String) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match line.trim() {
            "" => continue,
            "exit" => break,
            "whoami" => format!("{user}\n"),
            other => format!("{other}: command not found\n"),
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = write.shutdown().await;
}

/// Write half that logs when the proxy lets go of it.
struct TrackedWriter {
    inner: WriteHalf<DuplexStream>,
    sandbox_id: String,
    log: EventLog,
}

impl AsyncWrite for TrackedWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for TrackedWriter {
    fn drop(&mut self) {
        self.log
            .push(FakeEvent::ChannelClosed(std::mem::take(&mut self.sandbox_id)));
    }
}

struct MemoryControl {
    sandbox_id: String,
    log: EventLog,
    delay: Option<Duration>,
}

#[async_trait]
impl ChannelControl for MemoryControl {
    async fn resize(&self, geometry: Geometry) -> Result<(), RuntimeError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.log
            .push(FakeEvent::ChannelResized(self.sandbox_id.clone(), geometry));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryRecorder
// ---------------------------------------------------------------------------

/// Everything a [`MemoryRecorder`] was told.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recording {
    pub metadata: Option<RecordingMetadata>,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub resizes: Vec<Geometry>,
    pub stopped: bool,
    pub report: Option<SessionReport>,
}

/// Recorder that keeps traffic in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    session_id: String,
    recording: Mutex<Recording>,
    log: EventLog,
}

impl MemoryRecorder {
    pub fn new(session_id: impl Into<String>, log: EventLog) -> Self {
        Self {
            session_id: session_id.into(),
            recording: Mutex::new(Recording::default()),
            log,
        }
    }

    pub fn recording(&self) -> Recording {
        self.recording.lock().clone()
    }
}

impl SessionRecorder for MemoryRecorder {
    fn start(&self, metadata: &RecordingMetadata) {
        self.recording.lock().metadata = Some(metadata.clone());
        self.log
            .push(FakeEvent::RecorderStarted(self.session_id.clone()));
    }

    fn record_input(&self, data: &[u8]) {
        self.recording.lock().input.extend_from_slice(data);
    }

    fn record_output(&self, data: &[u8]) {
        self.recording.lock().output.extend_from_slice(data);
    }

    fn record_resize(&self, geometry: Geometry) {
        self.recording.lock().resizes.push(geometry);
    }

    fn stop(&self) {
        self.recording.lock().stopped = true;
        self.log
            .push(FakeEvent::RecorderStopped(self.session_id.clone()));
    }

    fn write_metadata(&self, report: &SessionReport) {
        self.recording.lock().report = Some(report.clone());
        self.log
            .push(FakeEvent::MetadataWritten(self.session_id.clone()));
    }
}

/// Factory that remembers every recorder it built.
#[derive(Debug, Default)]
pub struct MemoryRecorderFactory {
    log: EventLog,
    recorders: Mutex<Vec<Arc<MemoryRecorder>>>,
}

impl MemoryRecorderFactory {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            recorders: Mutex::new(Vec::new()),
        }
    }

    /// The recorder built for `session_id`, if any.
    pub fn recorder(&self, session_id: &str) -> Option<Arc<MemoryRecorder>> {
        self.recorders
            .lock()
            .iter()
            .find(|r| r.session_id == session_id)
            .cloned()
    }
}

impl RecorderFactory for MemoryRecorderFactory {
    fn create(&self, ctx: &SessionContext) -> Arc<dyn SessionRecorder> {
        let recorder = Arc::new(MemoryRecorder::new(&ctx.session_id, self.log.clone()));
        self.recorders.lock().push(Arc::clone(&recorder));
        recorder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::{translate, IsolationPolicy};
    use chrono::Utc;
    use tokio::io::AsyncReadExt;

    fn params() -> CreateParams {
        translate(&IsolationPolicy::default(), "img", "name", Utc::now(), None).unwrap()
    }

    fn request() -> ChannelRequest {
        ChannelRequest::new(vec!["/bin/bash".into()], "root", "/root", "xterm", Geometry::default())
    }

    #[tokio::test]
    async fn test_create_and_stop() {
        let runtime = MemoryRuntime::new();
        let id = runtime.create(&params()).await.unwrap();
        assert!(runtime.is_running(&id));
        assert_eq!(runtime.created_count(), 1);

        runtime.stop(&id).await.unwrap();
        assert!(!runtime.is_running(&id));
        assert_eq!(runtime.stopped_ids(), vec![id.clone()]);
        assert!(matches!(
            runtime.stop(&id).await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_create_failures() {
        let runtime = MemoryRuntime::new();
        runtime.fail_next_creates(2);
        assert!(runtime.create(&params()).await.is_err());
        assert!(runtime.create(&params()).await.is_err());
        assert!(runtime.create(&params()).await.is_ok());
        assert_eq!(runtime.created_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_start_keeps_name_taken() {
        let runtime = MemoryRuntime::new();
        runtime.fail_next_starts(1);
        let params = params();
        let err = runtime.create(&params).await.unwrap_err();
        assert!(err.to_string().contains("injected start failure"));

        let err = runtime.create(&params).await.unwrap_err();
        assert!(err.to_string().contains("already in use"));
        assert_eq!(runtime.created_count(), 0);
    }

    #[tokio::test]
    async fn test_fake_shell_answers_whoami_and_exits() {
        let runtime = MemoryRuntime::new();
        let id = runtime.create(&params()).await.unwrap();
        let mut channel = runtime.open_channel(&id, &request()).await.unwrap();

        channel.writer.write_all(b"whoami\nfoo\nexit\n").await.unwrap();
        let mut out = String::new();
        channel.reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "root\nfoo: command not found\n");
    }

    #[tokio::test]
    async fn test_channel_requires_running_sandbox() {
        let runtime = MemoryRuntime::new();
        let err = runtime.open_channel("fake-9999", &request()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_dropping_writer_logs_channel_closed() {
        let runtime = MemoryRuntime::new();
        let id = runtime.create(&params()).await.unwrap();
        let channel = runtime.open_channel(&id, &request()).await.unwrap();
        channel.control.resize(Geometry::new(90, 20)).await.unwrap();
        drop(channel);

        assert_eq!(runtime.resizes(&id), vec![Geometry::new(90, 20)]);
        assert!(runtime
            .log()
            .position(&FakeEvent::ChannelClosed(id.clone()))
            .is_some());
    }
}
