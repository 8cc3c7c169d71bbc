//! Session recording.
//!
//! Recorders are best-effort: every method is synchronous and infallible from
//! the caller's point of view. I/O problems are logged and the recorder
//! disables itself rather than disturbing the session.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RecordingConfig;
use crate::runtime::Geometry;
use crate::session::{SessionContext, SessionReport};

/// Describes the session being recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub session_id: String,
    pub identity: String,
    pub source_addr: String,
    pub sandbox_id: String,
    pub term_type: String,
    pub geometry: Geometry,
    pub started_at: DateTime<Utc>,
}

impl RecordingMetadata {
    pub fn new(ctx: &SessionContext, sandbox_id: &str) -> Self {
        Self {
            session_id: ctx.session_id.clone(),
            identity: ctx.identity.clone(),
            source_addr: ctx.source_addr.clone(),
            sandbox_id: sandbox_id.to_string(),
            term_type: ctx.term_type.clone(),
            geometry: ctx.geometry,
            started_at: Utc::now(),
        }
    }
}

/// Sink for one session's terminal traffic.
pub trait SessionRecorder: Send + Sync {
    fn start(&self, metadata: &RecordingMetadata);
    /// Bytes typed by the client.
    fn record_input(&self, data: &[u8]);
    /// Bytes produced by the sandbox.
    fn record_output(&self, data: &[u8]);
    fn record_resize(&self, geometry: Geometry);
    fn stop(&self);
    /// Persist the session summary next to the recording.
    fn write_metadata(&self, report: &SessionReport);
}

/// Builds one recorder per session.
pub trait RecorderFactory: Send + Sync {
    fn create(&self, ctx: &SessionContext) -> Arc<dyn SessionRecorder>;
}

/// Recorder used when recording is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl SessionRecorder for NullRecorder {
    fn start(&self, _metadata: &RecordingMetadata) {}
    fn record_input(&self, _data: &[u8]) {}
    fn record_output(&self, _data: &[u8]) {}
    fn record_resize(&self, _geometry: Geometry) {}
    fn stop(&self) {}
    fn write_metadata(&self, _report: &SessionReport) {}
}

impl RecorderFactory for NullRecorder {
    fn create(&self, _ctx: &SessionContext) -> Arc<dyn SessionRecorder> {
        Arc::new(NullRecorder)
    }
}

#[derive(Default)]
struct CastState {
    file: Option<File>,
    started: Option<Instant>,
    metadata: Option<RecordingMetadata>,
    events: u64,
    stopped: bool,
}

/// Writes asciicast v2 files: `<dir>/<session_id>.cast` plus a
/// `<session_id>.json` metadata sidecar.
pub struct AsciicastRecorder {
    output_dir: PathBuf,
    session_id: String,
    state: Mutex<CastState>,
}

impl AsciicastRecorder {
    pub fn new(output_dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            session_id: session_id.into(),
            state: Mutex::new(CastState::default()),
        }
    }

    pub fn cast_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.cast", self.session_id))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.json", self.session_id))
    }

    fn open(&self, metadata: &RecordingMetadata) -> std::io::Result<File> {
        std::fs::create_dir_all(&self.output_dir)?;
        let mut file = File::create(self.cast_path())?;
        let header = serde_json::json!({
            "version": 2,
            "width": metadata.geometry.cols,
            "height": metadata.geometry.rows,
            "timestamp": metadata.started_at.timestamp(),
            "env": {
                "TERM": metadata.term_type,
                "SESSION_ID": metadata.session_id,
                "IDENTITY": metadata.identity,
                "SOURCE_ADDR": metadata.source_addr,
                "SANDBOX_ID": metadata.sandbox_id,
            },
        });
        writeln!(file, "{header}")?;
        file.flush()?;
        Ok(file)
    }

    fn event(&self, kind: &str, text: &str) {
        let mut state = self.state.lock();
        let elapsed = match state.started {
            Some(started) => round_micros(started.elapsed().as_secs_f64()),
            None => return,
        };
        let Some(file) = state.file.as_mut() else {
            return;
        };

        let line = serde_json::json!([elapsed, kind, text]);
        let written = writeln!(file, "{line}").and_then(|_| file.flush());
        match written {
            Ok(()) => state.events += 1,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "recording write failed; disabling recorder");
                state.file = None;
            }
        }
    }
}

fn round_micros(secs: f64) -> f64 {
    (secs * 1_000_000.0).round() / 1_000_000.0
}

impl SessionRecorder for AsciicastRecorder {
    fn start(&self, metadata: &RecordingMetadata) {
        let mut state = self.state.lock();
        if state.started.is_some() {
            return;
        }
        state.started = Some(Instant::now());
        state.metadata = Some(metadata.clone());
        match self.open(metadata) {
            Ok(file) => {
                state.file = Some(file);
                info!(path = %self.cast_path().display(), "recording started");
            }
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    path = %self.cast_path().display(),
                    error = %e,
                    "cannot open recording; continuing without it"
                );
            }
        }
    }

    fn record_input(&self, data: &[u8]) {
        self.event("i", &String::from_utf8_lossy(data));
    }

    fn record_output(&self, data: &[u8]) {
        self.event("o", &String::from_utf8_lossy(data));
    }

    fn record_resize(&self, geometry: Geometry) {
        self.event("r", &geometry.to_string());
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        if let Some(mut file) = state.file.take() {
            if let Err(e) = file.flush() {
                warn!(session_id = %self.session_id, error = %e, "final recording flush failed");
            }
        }
        debug!(session_id = %self.session_id, events = state.events, "recording stopped");
    }

    fn write_metadata(&self, report: &SessionReport) {
        let session = self.state.lock().metadata.clone();
        let document = serde_json::json!({
            "session": session,
            "report": report,
            "recording": self.cast_path().display().to_string(),
        });
        if let Err(e) = write_json(&self.metadata_path(), &document) {
            warn!(session_id = %self.session_id, error = %e, "cannot write recording metadata");
        }
    }
}

fn write_json(path: &Path, value: &serde_json::Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, body)
}

/// Creates an [`AsciicastRecorder`] per session under one directory.
#[derive(Debug, Clone)]
pub struct AsciicastRecorderFactory {
    output_dir: PathBuf,
}

impl AsciicastRecorderFactory {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

impl RecorderFactory for AsciicastRecorderFactory {
    fn create(&self, ctx: &SessionContext) -> Arc<dyn SessionRecorder> {
        Arc::new(AsciicastRecorder::new(&self.output_dir, &ctx.session_id))
    }
}

/// Pick the recorder factory for a recording section.
pub fn recorder_factory(config: &RecordingConfig) -> Arc<dyn RecorderFactory> {
    if config.enabled {
        Arc::new(AsciicastRecorderFactory::new(&config.output_dir))
    } else {
        Arc::new(NullRecorder)
    }
}
