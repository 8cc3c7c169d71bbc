//! Structured observability hooks for session and sandbox lifecycle events.
//!
//! Events are emitted at `info!` level with an `event` field naming the
//! transition, so log pipelines can filter on it.

use tracing::info;

/// RAII guard that enters a session-scoped tracing span.
///
/// For synchronous code such as `Drop` impls; futures take [`session_span`]
/// through `tracing::Instrument`.
pub struct SessionSpan {
    _span: tracing::span::EnteredSpan,
}

impl SessionSpan {
    /// Create and enter a span tagged with the session id.
    pub fn enter(session_id: &str) -> Self {
        Self {
            _span: session_span(session_id).entered(),
        }
    }
}

/// Span carrying the session id, for instrumenting futures.
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("cellblock.session", session_id = %session_id)
}

pub fn emit_session_started(session_id: &str, identity: &str, source_addr: &str) {
    info!(
        event = "session.started",
        session_id = %session_id,
        identity = %identity,
        source_addr = %source_addr,
    );
}

pub fn emit_session_finished(session_id: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "session.finished",
        session_id = %session_id,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

pub fn emit_phase_entered(session_id: &str, phase: &str) {
    info!(event = "session.phase", session_id = %session_id, phase = %phase);
}

pub fn emit_sandbox_allocated(session_id: &str, sandbox_id: &str, on_demand: bool) {
    info!(
        event = "sandbox.allocated",
        session_id = %session_id,
        sandbox_id = %sandbox_id,
        on_demand = on_demand,
    );
}

pub fn emit_sandbox_released(session_id: &str, sandbox_id: &str) {
    info!(event = "sandbox.released", session_id = %session_id, sandbox_id = %sandbox_id);
}

/// Emit event: a teardown step failed (warning level).
pub fn emit_teardown_error(session_id: &str, step: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(
        event = "session.teardown_error",
        session_id = %session_id,
        step = %step,
        error = %error,
    );
}

/// Short form of a runtime id for log lines.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
