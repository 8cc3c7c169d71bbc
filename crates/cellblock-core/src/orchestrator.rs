//! Per-session control flow.
//!
//! ```text
//! Allocating ──► Proxying ──► Draining ──► Released
//!      │             │            │
//!      └─────────────┴────────────┴──► Errored
//! ```
//!
//! Once a sandbox has been allocated, teardown always runs in the order
//! proxy stop, recorder stop, sandbox release. A [`TeardownGuard`] keeps that
//! promise even when the session future is dropped or panics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn, Instrument};

use crate::config::{CellblockConfig, ShellConfig};
use crate::error::{CellblockError, Result};
use crate::metrics::METRICS;
use crate::obs::{
    emit_phase_entered, emit_session_finished, emit_session_started, emit_teardown_error,
    session_span, SessionSpan,
};
use crate::pool::SandboxPool;
use crate::proxy::{Direction, ProxyExit, SessionProxy, StreamEnd};
use crate::recorder::{RecorderFactory, RecordingMetadata, SessionRecorder};
use crate::runtime::{ChannelRequest, Geometry, SandboxRuntime};
use crate::session::{
    write_notice, ClientSink, SessionContext, SessionIo, SessionOutcome, SessionPhase,
    SessionReport, GENERIC_FAILURE_NOTICE, TIMEOUT_NOTICE,
};

/// Per-session limits and the shell to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub timeout: Duration,
    pub shell: ShellConfig,
}

impl SessionSettings {
    pub fn from_config(config: &CellblockConfig) -> Self {
        Self {
            timeout: config.session_timeout(),
            shell: config.shell.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&CellblockConfig::default())
    }
}

/// Fires once after the session duration limit unless cancelled.
struct TimeoutWatcher {
    cancel: CancellationToken,
    fired: oneshot::Receiver<()>,
    task: JoinHandle<()>,
    _on_drop: DropGuard,
}

impl TimeoutWatcher {
    fn start(limit: Duration) -> Self {
        let cancel = CancellationToken::new();
        let (tx, fired) = oneshot::channel();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(limit) => {
                    let _ = tx.send(());
                }
            }
        });
        Self {
            _on_drop: cancel.clone().drop_guard(),
            cancel,
            fired,
            task,
        }
    }

    /// Resolves when the limit is reached; pends forever if cancelled.
    async fn fired(&mut self) {
        if (&mut self.fired).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    async fn cancel(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("timeout watcher panicked");
            }
        }
    }
}

/// Records visited phases and logs each transition.
struct PhaseTracker {
    session_id: String,
    phases: Vec<SessionPhase>,
}

impl PhaseTracker {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            phases: Vec::new(),
        }
    }

    fn enter(&mut self, phase: SessionPhase) {
        emit_phase_entered(&self.session_id, phase.as_str());
        self.phases.push(phase);
    }
}

/// Owns everything that must be torn down once a sandbox is allocated.
struct TeardownGuard {
    session_id: String,
    pool: SandboxPool,
    recorder: Arc<dyn SessionRecorder>,
    proxy: Option<SessionProxy>,
    armed: bool,
}

impl TeardownGuard {
    fn new(session_id: &str, pool: SandboxPool, recorder: Arc<dyn SessionRecorder>) -> Self {
        Self {
            session_id: session_id.to_string(),
            pool,
            recorder,
            proxy: None,
            armed: true,
        }
    }

    /// Stop the proxy, finalize the recording, release the sandbox.
    ///
    /// The proxy stays in the guard until its stop has completed, so a drop
    /// partway through still waits for the forwarding loops before release.
    async fn run(mut self, report: &SessionReport) {
        if let Some(proxy) = self.proxy.as_mut() {
            proxy.stop().await;
        }
        self.recorder.stop();
        self.recorder.write_metadata(report);
        self.pool.release(&self.session_id).await;
        self.armed = false;
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _span = SessionSpan::enter(&self.session_id);
        let session_id = std::mem::take(&mut self.session_id);
        let proxy = self.proxy.take();
        let pool = self.pool.clone();
        let recorder = Arc::clone(&self.recorder);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("session ended abnormally; tearing down in background");
                let span = session_span(&session_id);
                handle.spawn(
                    async move {
                        if let Some(mut proxy) = proxy {
                            proxy.stop().await;
                        }
                        recorder.stop();
                        pool.release(&session_id).await;
                    }
                    .instrument(span),
                );
            }
            Err(e) => emit_teardown_error(&session_id, "release", &e),
        }
    }
}

enum Race {
    Proxy(Option<ProxyExit>),
    Timeout,
}

/// Drives sessions from allocation to release.
#[derive(Clone)]
pub struct SessionOrchestrator {
    pool: SandboxPool,
    runtime: Arc<dyn SandboxRuntime>,
    recorders: Arc<dyn RecorderFactory>,
    settings: SessionSettings,
}

impl SessionOrchestrator {
    pub fn new(
        pool: SandboxPool,
        runtime: Arc<dyn SandboxRuntime>,
        recorders: Arc<dyn RecorderFactory>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            pool,
            runtime,
            recorders,
            settings,
        }
    }

    pub fn pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Run one session to completion.
    ///
    /// Allocation and channel failures are reported to the client with a
    /// single generic notice and returned as an `Ok` report. Unexpected
    /// forwarding failures are returned as errors after teardown.
    pub async fn run_session(&self, ctx: SessionContext, io: SessionIo) -> Result<SessionReport> {
        let span = session_span(&ctx.session_id);
        self.drive(ctx, io).instrument(span).await
    }

    async fn drive(&self, ctx: SessionContext, io: SessionIo) -> Result<SessionReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        emit_session_started(&ctx.session_id, &ctx.identity, &ctx.source_addr);

        let SessionIo {
            input,
            output,
            mut resizes,
        } = io;
        let output: ClientSink = Arc::new(tokio::sync::Mutex::new(output));
        let mut phases = PhaseTracker::new(&ctx.session_id);

        let report = |phases: &PhaseTracker, sandbox_id: Option<&str>, outcome: SessionOutcome| SessionReport {
            session_id: ctx.session_id.clone(),
            sandbox_id: sandbox_id.map(str::to_string),
            outcome,
            phases: phases.phases.clone(),
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
        };

        phases.enter(SessionPhase::Allocating);
        let instance = match self.pool.allocate(&ctx.session_id).await {
            Ok(instance) => instance,
            Err(e) => {
                error!(stage = "allocate", error = %e, "sandbox allocation failed");
                write_notice(&output, GENERIC_FAILURE_NOTICE).await;
                phases.enter(SessionPhase::Errored);
                return Ok(self.finish(report(&phases, None, SessionOutcome::AllocationFailed)));
            }
        };
        let sandbox_id = instance.id.clone();

        let recorder = self.recorders.create(&ctx);
        recorder.start(&RecordingMetadata::new(&ctx, &sandbox_id));
        let mut teardown = TeardownGuard::new(&ctx.session_id, self.pool.clone(), Arc::clone(&recorder));

        let request = ChannelRequest::new(
            self.settings.shell.command.clone(),
            self.settings.shell.user.clone(),
            self.settings.shell.workdir.clone(),
            &ctx.term_type,
            ctx.geometry,
        );
        let proxy = teardown.proxy.insert(SessionProxy::new(
            ctx.session_id.clone(),
            sandbox_id.clone(),
            Arc::clone(&self.runtime),
            request,
            recorder,
            input,
            Arc::clone(&output),
        ));

        phases.enter(SessionPhase::Proxying);
        let outcome = match proxy.start().await {
            Ok(()) => {
                let race = race(proxy, self.settings.timeout, &mut resizes).await;
                if matches!(race, Race::Timeout) {
                    info!(timeout_secs = self.settings.timeout.as_secs(), "session timeout reached");
                    write_notice(&output, TIMEOUT_NOTICE).await;
                }
                phases.enter(SessionPhase::Draining);
                proxy.stop().await;
                resolve(race)
            }
            Err(e) => {
                error!(stage = "channel_open", error = %e, "failed to open shell channel");
                write_notice(&output, GENERIC_FAILURE_NOTICE).await;
                Ok(SessionOutcome::ChannelFailed)
            }
        };

        let (outcome, failure) = match outcome {
            Ok(SessionOutcome::ChannelFailed) => {
                phases.enter(SessionPhase::Errored);
                (SessionOutcome::ChannelFailed, None)
            }
            Ok(outcome) => (outcome, None),
            Err(reason) => {
                error!(stage = "proxy", reason = %reason, "forwarding failed unexpectedly");
                phases.enter(SessionPhase::Errored);
                (SessionOutcome::ProxyFailed, Some(reason))
            }
        };

        teardown
            .run(&report(&phases, Some(&sandbox_id), outcome))
            .await;
        phases.enter(SessionPhase::Released);
        let report = self.finish(report(&phases, Some(&sandbox_id), outcome));

        match failure {
            Some(reason) => Err(CellblockError::UnexpectedProxy {
                session_id: ctx.session_id,
                reason,
            }),
            None => Ok(report),
        }
    }

    fn finish(&self, report: SessionReport) -> SessionReport {
        METRICS.inc_sessions_completed();
        emit_session_finished(&report.session_id, report.outcome.as_str(), report.duration_ms);
        report
    }
}

/// Wait for the proxy to finish or the timeout to fire, forwarding resizes
/// in the meantime.
async fn race(
    proxy: &SessionProxy,
    limit: Duration,
    resizes: &mut mpsc::UnboundedReceiver<Geometry>,
) -> Race {
    let mut watcher = TimeoutWatcher::start(limit);
    let mut resizes_open = true;

    let race = loop {
        tokio::select! {
            exit = proxy.wait_completion() => break Race::Proxy(exit),
            _ = watcher.fired() => break Race::Timeout,
            geometry = resizes.recv(), if resizes_open => match geometry {
                Some(geometry) => proxy.handle_resize(geometry).await,
                None => resizes_open = false,
            },
        }
    };

    watcher.cancel().await;
    race
}

/// Map the race result to an outcome, or the failure reason for an
/// unexpected forwarding error.
fn resolve(race: Race) -> std::result::Result<SessionOutcome, String> {
    match race {
        Race::Timeout => Ok(SessionOutcome::TimedOut),
        Race::Proxy(None) => Ok(SessionOutcome::Disconnected),
        Race::Proxy(Some(exit)) => match exit.end {
            StreamEnd::Failed(reason) => Err(reason),
            StreamEnd::Closed if exit.direction == Direction::SandboxToClient => {
                Ok(SessionOutcome::ChannelClosed)
            }
            StreamEnd::Closed | StreamEnd::Disconnected | StreamEnd::Cancelled => {
                Ok(SessionOutcome::Disconnected)
            }
        },
    }
}
