//! End-to-end session tests: orchestrator, proxy, pool and recorder wired to
//! the in-memory runtime.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use cellblock_core::fakes::{EventLog, FakeEvent, MemoryRecorderFactory, MemoryRuntime};
use cellblock_core::{
    CellblockError, Geometry, IsolationPolicy, PoolSettings, RetryPolicy, SandboxPool,
    SessionContext, SessionIo, SessionOrchestrator, SessionOutcome, SessionPhase, SessionReport,
    SessionSettings, ShellConfig, GENERIC_FAILURE_NOTICE, TIMEOUT_NOTICE,
};

struct World {
    runtime: Arc<MemoryRuntime>,
    recorders: Arc<MemoryRecorderFactory>,
    pool: SandboxPool,
    orchestrator: SessionOrchestrator,
}

async fn world(size: usize, timeout: Duration) -> World {
    let log = EventLog::new();
    let runtime = Arc::new(MemoryRuntime::with_log(log.clone()));
    let recorders = Arc::new(MemoryRecorderFactory::new(log));
    let pool = SandboxPool::new(
        runtime.clone(),
        PoolSettings {
            target_size: size,
            image: "cellblock-target:test".into(),
            name_prefix: "cellblock-test".into(),
            policy: IsolationPolicy::default(),
            retry: RetryPolicy {
                attempt_timeout_ms: 1_000,
                retry_delay_ms: 10,
            },
        },
    );
    pool.initialize().await.unwrap();

    let orchestrator = SessionOrchestrator::new(
        pool.clone(),
        runtime.clone(),
        recorders.clone(),
        SessionSettings {
            timeout,
            shell: ShellConfig::default(),
        },
    );
    World {
        runtime,
        recorders,
        pool,
        orchestrator,
    }
}

/// The client's side of a session.
struct Client {
    input: DuplexStream,
    output: DuplexStream,
    resizes: UnboundedSender<Geometry>,
}

fn connect() -> (SessionIo, Client) {
    connect_with_output_buffer(4096)
}

/// Like [`connect`], with a client output pipe holding at most `capacity` bytes.
fn connect_with_output_buffer(capacity: usize) -> (SessionIo, Client) {
    let (client_in, proxy_in) = duplex(4096);
    let (proxy_out, client_out) = duplex(capacity);
    let (io, resizes) = SessionIo::new(proxy_in, proxy_out);
    (
        io,
        Client {
            input: client_in,
            output: client_out,
            resizes,
        },
    )
}

fn spawn_session(
    world: &World,
    session_id: &str,
    io: SessionIo,
) -> JoinHandle<cellblock_core::Result<SessionReport>> {
    let orchestrator = world.orchestrator.clone();
    let ctx = SessionContext::new(session_id, "root", "203.0.113.7:50022", Geometry::default());
    tokio::spawn(async move { orchestrator.run_session(ctx, io).await })
}

async fn read_until(output: &mut DuplexStream, needle: &[u8]) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = [0u8; 256];
    tokio::time::timeout(Duration::from_secs(5), async {
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let n = output.read(&mut buf).await.unwrap();
            assert!(n > 0, "client output closed before {needle:?} arrived");
            seen.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("timed out waiting for client output");
    seen
}

fn occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_normal_session_releases_after_proxy_stops() {
    let world = world(2, Duration::from_secs(3600)).await;
    let (io, mut client) = connect();
    let session = spawn_session(&world, "s1", io);

    client.input.write_all(b"whoami\n").await.unwrap();
    read_until(&mut client.output, b"root\n").await;
    let sandbox_id = world.pool.active_sandbox("s1").unwrap().id;
    drop(client.input);

    let report = session.await.unwrap().unwrap();
    assert_eq!(report.outcome, SessionOutcome::Disconnected);
    assert_eq!(report.sandbox_id.as_deref(), Some(sandbox_id.as_str()));
    assert_eq!(
        report.phases,
        vec![
            SessionPhase::Allocating,
            SessionPhase::Proxying,
            SessionPhase::Draining,
            SessionPhase::Released,
        ]
    );

    assert!(world.pool.active_sandbox("s1").is_none());
    let stopped = world.pool.stopped();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].instance.id, sandbox_id);

    let log = world.runtime.log();
    let closed = log.position(&FakeEvent::ChannelClosed(sandbox_id.clone())).unwrap();
    let recorder_stopped = log.position(&FakeEvent::RecorderStopped("s1".into())).unwrap();
    let released = log.position(&FakeEvent::SandboxStopped(sandbox_id.clone())).unwrap();
    assert!(closed < recorder_stopped, "proxy must stop before the recorder");
    assert!(recorder_stopped < released, "recorder must stop before release");
    assert_eq!(
        log.count(|e| *e == FakeEvent::SandboxStopped(sandbox_id.clone())),
        1
    );

    let recording = world.recorders.recorder("s1").unwrap().recording();
    assert_eq!(recording.input, b"whoami\n");
    assert_eq!(recording.output, b"root\n");
    assert!(recording.stopped);
    assert_eq!(
        recording.report.unwrap().outcome,
        SessionOutcome::Disconnected
    );
    assert_eq!(recording.metadata.unwrap().sandbox_id, sandbox_id);
}

#[tokio::test]
async fn test_shell_exit_ends_session() {
    let world = world(1, Duration::from_secs(3600)).await;
    let (io, mut client) = connect();
    let session = spawn_session(&world, "s-exit", io);

    client.input.write_all(b"exit\n").await.unwrap();
    let report = session.await.unwrap().unwrap();

    assert_eq!(report.outcome, SessionOutcome::ChannelClosed);
    assert_eq!(world.pool.stopped().len(), 1);
    assert!(world.pool.active_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_writes_one_notice_and_releases() {
    let world = world(1, Duration::from_secs(60)).await;
    let (io, mut client) = connect();
    let session = spawn_session(&world, "s-idle", io);

    let report = session.await.unwrap().unwrap();
    assert_eq!(report.outcome, SessionOutcome::TimedOut);
    assert!(report.phases.contains(&SessionPhase::Draining));
    assert_eq!(report.phases.last(), Some(&SessionPhase::Released));

    let mut received = Vec::new();
    client.output.read_to_end(&mut received).await.unwrap();
    assert_eq!(occurrences(&received, TIMEOUT_NOTICE), 1);
    assert_eq!(occurrences(&received, GENERIC_FAILURE_NOTICE), 0);

    assert_eq!(world.pool.stopped().len(), 1);
    assert!(world.pool.active_sandbox("s-idle").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_releases_sandbox_when_client_stops_reading() {
    let world = world(1, Duration::from_secs(60)).await;
    let (io, mut client) = connect_with_output_buffer(64);
    let session = spawn_session(&world, "s-stalled", io);

    // Replies overflow the client pipe, and the client never drains it.
    for _ in 0..50 {
        client.input.write_all(b"foo\n").await.unwrap();
    }

    let report = tokio::time::timeout(Duration::from_secs(3600), session)
        .await
        .expect("session must end once its timeout fires")
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, SessionOutcome::TimedOut);
    assert_eq!(report.phases.last(), Some(&SessionPhase::Released));

    let sandbox_id = report.sandbox_id.unwrap();
    assert!(world.pool.active_sessions().is_empty());
    assert_eq!(world.pool.stopped().len(), 1);
    assert_eq!(world.pool.stopped()[0].instance.id, sandbox_id);
    assert!(!world.runtime.is_running(&sandbox_id));
}

#[tokio::test]
async fn test_allocation_failure_writes_generic_notice_and_never_releases() {
    let world = world(1, Duration::from_secs(3600)).await;
    world.runtime.fail_next_creates(u32::MAX);
    // Take the only ready sandbox; its replacement fails.
    world.pool.allocate("hog").await.unwrap();

    let (io, mut client) = connect();
    let report = world
        .orchestrator
        .run_session(
            SessionContext::new("s-fail", "root", "198.51.100.1:4000", Geometry::default()),
            io,
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, SessionOutcome::AllocationFailed);
    assert_eq!(report.sandbox_id, None);
    assert_eq!(
        report.phases,
        vec![SessionPhase::Allocating, SessionPhase::Errored]
    );
    assert!(world.recorders.recorder("s-fail").is_none());

    let mut received = Vec::new();
    client.output.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, GENERIC_FAILURE_NOTICE);

    assert!(world.pool.stopped().is_empty());
    world.pool.release("s-fail").await;
    assert!(world.pool.stopped().is_empty());
    assert_eq!(world.pool.active_sessions(), vec!["hog".to_string()]);
}

#[tokio::test]
async fn test_channel_failure_still_releases_sandbox() {
    let world = world(1, Duration::from_secs(3600)).await;
    world.runtime.set_reject_channels(true);

    let (io, mut client) = connect();
    let session = spawn_session(&world, "s-chan", io);
    let report = session.await.unwrap().unwrap();

    assert_eq!(report.outcome, SessionOutcome::ChannelFailed);
    assert_eq!(
        report.phases,
        vec![
            SessionPhase::Allocating,
            SessionPhase::Proxying,
            SessionPhase::Errored,
            SessionPhase::Released,
        ]
    );
    assert_eq!(world.pool.stopped().len(), 1);
    assert!(world.recorders.recorder("s-chan").unwrap().recording().stopped);

    let mut received = Vec::new();
    client.output.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, GENERIC_FAILURE_NOTICE);
}

#[tokio::test]
async fn test_resize_is_forwarded_mid_session() {
    let world = world(1, Duration::from_secs(3600)).await;
    let (io, mut client) = connect();
    let session = spawn_session(&world, "s-resize", io);

    client.input.write_all(b"whoami\n").await.unwrap();
    read_until(&mut client.output, b"root\n").await;
    let sandbox_id = world.pool.active_sandbox("s-resize").unwrap().id;

    client.resizes.send(Geometry::new(100, 30)).unwrap();
    let runtime = world.runtime.clone();
    let id = sandbox_id.clone();
    wait_for(move || !runtime.resizes(&id).is_empty()).await;

    drop(client.input);
    session.await.unwrap().unwrap();

    assert_eq!(world.runtime.resizes(&sandbox_id), vec![Geometry::new(100, 30)]);
    let recording = world.recorders.recorder("s-resize").unwrap().recording();
    assert_eq!(recording.resizes, vec![Geometry::new(100, 30)]);
    assert!(client.resizes.send(Geometry::new(90, 20)).is_err());
}

#[tokio::test]
async fn test_dropped_session_is_still_torn_down() {
    let world = world(1, Duration::from_secs(3600)).await;
    let (io, mut client) = connect();
    let session = spawn_session(&world, "s-abort", io);

    client.input.write_all(b"whoami\n").await.unwrap();
    read_until(&mut client.output, b"root\n").await;
    let sandbox_id = world.pool.active_sandbox("s-abort").unwrap().id;

    session.abort();
    assert!(session.await.unwrap_err().is_cancelled());

    let pool = world.pool.clone();
    wait_for(move || pool.stopped().len() == 1).await;
    assert!(world.pool.active_sandbox("s-abort").is_none());
    assert_eq!(world.pool.stopped()[0].instance.id, sandbox_id);
    assert!(world.recorders.recorder("s-abort").unwrap().recording().stopped);

    let log = world.runtime.log();
    assert!(
        log.position(&FakeEvent::ChannelClosed(sandbox_id.clone())).unwrap()
            < log.position(&FakeEvent::SandboxStopped(sandbox_id)).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_dropped_during_release_still_retires_sandbox() {
    let world = world(1, Duration::from_secs(3600)).await;
    world.runtime.set_stop_delay(Duration::from_millis(500));
    let (io, mut client) = connect();
    let session = spawn_session(&world, "s-late", io);

    client.input.write_all(b"whoami\n").await.unwrap();
    read_until(&mut client.output, b"root\n").await;
    let sandbox_id = world.pool.active_sandbox("s-late").unwrap().id;
    drop(client.input);

    // The recorder stops right before release, which then waits on the slow stop.
    let recorders = world.recorders.clone();
    wait_for(move || {
        recorders
            .recorder("s-late")
            .is_some_and(|r| r.recording().stopped)
    })
    .await;
    session.abort();
    assert!(session.await.unwrap_err().is_cancelled());

    let pool = world.pool.clone();
    wait_for(move || pool.stopped().len() == 1).await;
    let stopped = world.pool.stopped();
    assert_eq!(stopped[0].instance.id, sandbox_id);
    assert!(stopped[0].stop_error.is_none());
    assert!(world.pool.active_sessions().is_empty());
    assert!(!world.runtime.is_running(&sandbox_id));
}

/// Client stream that fails with a non-disconnect error.
struct BrokenInput;

impl AsyncRead for BrokenInput {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::other("device on fire")))
    }
}

#[tokio::test]
async fn test_unexpected_proxy_failure_surfaces_after_teardown() {
    let world = world(1, Duration::from_secs(3600)).await;
    let (proxy_out, _client_out) = duplex(4096);
    let (io, _resizes) = SessionIo::new(BrokenInput, proxy_out);

    let err = spawn_session(&world, "s-broken", io)
        .await
        .unwrap()
        .unwrap_err();
    match err {
        CellblockError::UnexpectedProxy { session_id, reason } => {
            assert_eq!(session_id, "s-broken");
            assert!(reason.contains("device on fire"));
        }
        other => panic!("expected unexpected proxy error, got {other:?}"),
    }

    assert_eq!(world.pool.stopped().len(), 1);
    assert!(world.pool.active_sessions().is_empty());
    let recording = world.recorders.recorder("s-broken").unwrap().recording();
    assert_eq!(recording.report.unwrap().outcome, SessionOutcome::ProxyFailed);
}

#[tokio::test]
async fn test_concurrent_sessions_get_distinct_sandboxes() {
    let world = world(2, Duration::from_secs(3600)).await;
    let (io_a, mut a) = connect();
    let (io_b, mut b) = connect();
    let session_a = spawn_session(&world, "a", io_a);
    let session_b = spawn_session(&world, "b", io_b);

    a.input.write_all(b"whoami\n").await.unwrap();
    b.input.write_all(b"whoami\n").await.unwrap();
    read_until(&mut a.output, b"root\n").await;
    read_until(&mut b.output, b"root\n").await;

    let sandbox_a = world.pool.active_sandbox("a").unwrap().id;
    let sandbox_b = world.pool.active_sandbox("b").unwrap().id;
    assert_ne!(sandbox_a, sandbox_b);

    drop(a.input);
    drop(b.input);
    session_a.await.unwrap().unwrap();
    session_b.await.unwrap().unwrap();
    assert_eq!(world.pool.stopped().len(), 2);
}
