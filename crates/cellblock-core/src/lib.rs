//! Cellblock Core Library
//!
//! Hands each interactive terminal session its own isolated, pre-warmed
//! sandbox, proxies the session's bytes into it, and retires the sandbox
//! (stopped, never removed) when the session ends.

pub mod config;
pub mod error;
pub mod fakes;
pub mod isolation;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod recorder;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod telemetry;

pub use config::{
    CellblockConfig, DockerConfig, LoggingConfig, PoolConfig, RecordingConfig, SessionConfig,
    ShellConfig,
};
pub use error::{CellblockError, Result, RuntimeError};
pub use isolation::{translate, CapabilityPolicy, CreateParams, IsolationPolicy};
pub use orchestrator::{SessionOrchestrator, SessionSettings};
pub use pool::{PoolSettings, PoolStats, SandboxInstance, SandboxPool, SandboxState, StoppedSandbox};
pub use proxy::{Direction, ProxyExit, SessionProxy, StreamEnd};
pub use recorder::{
    recorder_factory, AsciicastRecorder, AsciicastRecorderFactory, NullRecorder, RecorderFactory,
    RecordingMetadata, SessionRecorder,
};
pub use retry::{retry_once, RetryPolicy};
pub use runtime::{
    ChannelControl, ChannelReader, ChannelRequest, ChannelWriter, Geometry, SandboxChannel,
    SandboxRuntime,
};
pub use session::{
    SessionContext, SessionIo, SessionOutcome, SessionPhase, SessionReport,
    GENERIC_FAILURE_NOTICE, TIMEOUT_NOTICE,
};

/// Cellblock version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
