//! Sandbox pool: pre-warmed sandboxes handed out one per session.
//!
//! Lifecycle of a sandbox: created (at startup or as a replacement), parked
//! in the ready queue, moved to the active map on allocation, stopped and
//! appended to the stopped list on release. Stopped sandboxes are retained
//! for forensics and never handed out again.
//!
//! The three collections live behind a single mutex that is only held for
//! synchronous bookkeeping. Runtime calls (create/stop) always happen with
//! the lock released.
//!
//! Create and stop calls run in tasks owned by the pool, so a caller that
//! times out or is dropped never leaves a sandbox outside all three
//! collections.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::CellblockConfig;
use crate::error::{CellblockError, Result, RuntimeError};
use crate::isolation::{translate, CreateParams, IsolationPolicy};
use crate::metrics::METRICS;
use crate::obs::{emit_sandbox_allocated, emit_sandbox_released, short_id};
use crate::retry::{retry_once, RetryPolicy};
use crate::runtime::SandboxRuntime;

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Creating,
    Ready,
    Active,
    Stopped,
}

/// One isolated execution environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInstance {
    /// Runtime-assigned id.
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub state: SandboxState,
    /// Owning session while active (kept after stop for forensics).
    pub session_id: Option<String>,
    pub params: CreateParams,
}

/// A retired sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoppedSandbox {
    pub instance: SandboxInstance,
    pub stopped_at: DateTime<Utc>,
    /// Set when the runtime failed to stop the sandbox cleanly.
    pub stop_error: Option<String>,
}

/// Point-in-time pool counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub ready: usize,
    pub active: usize,
    pub stopped: usize,
    pub total: usize,
    pub replacements_in_flight: usize,
}

/// What the pool builds and how hard it tries.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub target_size: usize,
    pub image: String,
    pub name_prefix: String,
    pub policy: IsolationPolicy,
    pub retry: RetryPolicy,
}

impl PoolSettings {
    pub fn from_config(config: &CellblockConfig) -> Self {
        Self {
            target_size: config.pool.size,
            image: config.pool.image.clone(),
            name_prefix: config.pool.name_prefix.clone(),
            policy: config.isolation.clone(),
            retry: config.creation_retry(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    ready: VecDeque<SandboxInstance>,
    active: HashMap<String, SandboxInstance>,
    stopped: Vec<StoppedSandbox>,
}

struct PoolInner {
    runtime: Arc<dyn SandboxRuntime>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    shutdown: AtomicBool,
    replacements: TaskTracker,
    /// Detached create and stop calls.
    background: TaskTracker,
}

/// Shared handle to the sandbox pool. Cloning is cheap.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("settings", &self.inner.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl SandboxPool {
    /// Create an empty pool. Call [`SandboxPool::initialize`] before use.
    pub fn new(runtime: Arc<dyn SandboxRuntime>, settings: PoolSettings) -> Self {
        info!(
            target_size = settings.target_size,
            image = %settings.image,
            "sandbox pool created"
        );
        Self {
            inner: Arc::new(PoolInner {
                runtime,
                settings,
                state: Mutex::new(PoolState::default()),
                shutdown: AtomicBool::new(false),
                replacements: TaskTracker::new(),
                background: TaskTracker::new(),
            }),
        }
    }

    /// Create `target_size` sandboxes concurrently and park them as ready.
    ///
    /// Any creation failure is fatal: sandboxes that were created are stopped
    /// and the first error is returned.
    pub async fn initialize(&self) -> Result<()> {
        let size = self.inner.settings.target_size;
        info!(size, "initializing sandbox pool");
        let started = Instant::now();

        let results = join_all((0..size).map(|_| self.inner.create_sandbox(None))).await;

        let mut created = Vec::with_capacity(size);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(instance) => created.push(instance),
                Err(e) => {
                    error!(error = %e, "sandbox creation failed during pool initialization");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(err) = first_error {
            warn!(
                created = created.len(),
                "stopping partially initialized pool"
            );
            self.inner.stop_all(created).await;
            return Err(err);
        }

        let leftover = {
            let mut state = self.inner.state.lock();
            if self.inner.is_shutdown() {
                created
            } else {
                state.ready.extend(created);
                Vec::new()
            }
        };
        if !leftover.is_empty() {
            warn!("pool shut down during initialization; stopping new sandboxes");
            self.inner.stop_all(leftover).await;
            return Err(CellblockError::SandboxCreation(
                "pool shut down during initialization".into(),
            ));
        }

        info!(
            size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox pool ready"
        );
        Ok(())
    }

    /// Hand a sandbox to `session_id`.
    ///
    /// Takes the oldest ready sandbox if there is one; otherwise creates one
    /// on demand, bounded by the creation timeout. Either way a replacement
    /// is scheduled in the background.
    pub async fn allocate(&self, session_id: &str) -> Result<SandboxInstance> {
        if self.inner.is_shutdown() {
            return Err(CellblockError::SandboxCreation(
                "pool is shut down".into(),
            ));
        }

        let popped = {
            let mut state = self.inner.state.lock();
            if let Some(existing) = state.active.get(session_id) {
                return Err(CellblockError::AllocationConflict {
                    session_id: session_id.to_string(),
                    sandbox_id: existing.id.clone(),
                });
            }
            state.ready.pop_front().map(|instance| {
                let instance = activate(instance, session_id);
                state.active.insert(session_id.to_string(), instance.clone());
                instance
            })
        };

        let on_demand = popped.is_none();
        let instance = match popped {
            Some(instance) => instance,
            None => self.allocate_on_demand(session_id).await?,
        };

        self.schedule_replacement();
        emit_sandbox_allocated(session_id, &instance.id, on_demand);
        debug!(
            sandbox = %short_id(&instance.id),
            stats = ?self.stats(),
            "sandbox allocated"
        );
        Ok(instance)
    }

    async fn allocate_on_demand(&self, session_id: &str) -> Result<SandboxInstance> {
        warn!(session_id, "ready queue empty; creating sandbox on demand (degraded)");
        METRICS.inc_on_demand_allocations();

        let limit = self.inner.settings.retry.attempt_timeout();
        let instance = tokio::time::timeout(limit, self.inner.create_sandbox(Some(session_id)))
            .await
            .map_err(|_| {
                CellblockError::SandboxCreation(format!(
                    "on-demand creation exceeded {}ms",
                    limit.as_millis()
                ))
            })??;

        let rejected = {
            let mut state = self.inner.state.lock();
            if self.inner.is_shutdown() {
                Err((
                    instance,
                    CellblockError::SandboxCreation("pool is shut down".into()),
                ))
            } else if let Some(existing) = state.active.get(session_id) {
                let conflict = CellblockError::AllocationConflict {
                    session_id: session_id.to_string(),
                    sandbox_id: existing.id.clone(),
                };
                Err((instance, conflict))
            } else {
                let instance = activate(instance, session_id);
                state.active.insert(session_id.to_string(), instance.clone());
                Ok(instance)
            }
        };

        match rejected {
            Ok(instance) => Ok(instance),
            Err((instance, err)) => {
                self.inner.stop_into_stopped(instance).await;
                Err(err)
            }
        }
    }

    /// Retire the sandbox held by `session_id`.
    ///
    /// Unknown or already released ids are a logged no-op. The stop runs in
    /// a pool-owned task: if this future is dropped midway, the sandbox still
    /// reaches the stopped list.
    pub async fn release(&self, session_id: &str) {
        let instance = self.inner.state.lock().active.remove(session_id);
        let Some(instance) = instance else {
            warn!(session_id, "release requested for unknown session; ignoring");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let session_id = session_id.to_string();
        let retiring = self.inner.background.spawn(async move {
            let sandbox_id = instance.id.clone();
            inner.stop_into_stopped(instance).await;
            emit_sandbox_released(&session_id, &sandbox_id);
        });
        if let Err(e) = retiring.await {
            error!(error = %e, "sandbox release task failed");
        }
    }

    /// Stop every ready and active sandbox. The stopped list is left intact.
    ///
    /// Waits for in-flight replacements first; those finishing after the
    /// shutdown flag is set stop their own sandbox. Safe to call more than
    /// once and before [`SandboxPool::initialize`] has completed.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            debug!("sandbox pool already shut down");
            return;
        }
        info!("shutting down sandbox pool");

        self.inner.replacements.close();
        self.inner.replacements.wait().await;

        let to_stop: Vec<SandboxInstance> = {
            let mut state = self.inner.state.lock();
            let mut all: Vec<_> = state.active.drain().map(|(_, instance)| instance).collect();
            all.extend(state.ready.drain(..));
            all
        };
        self.inner.stop_all(to_stop).await;

        self.inner.background.close();
        let limit = self.inner.settings.retry.attempt_timeout();
        if tokio::time::timeout(limit, self.inner.background.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.inner.background.len(),
                "runtime calls still in flight at shutdown; they retire their own sandboxes"
            );
        }

        METRICS.flush();
        info!(
            stopped_preserved = self.inner.state.lock().stopped.len(),
            "sandbox pool shutdown complete"
        );
    }

    fn schedule_replacement(&self) {
        if self.inner.is_shutdown() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.inner.replacements.spawn(async move {
            inner.spawn_replacement().await;
        });
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            ready: state.ready.len(),
            active: state.active.len(),
            stopped: state.stopped.len(),
            total: state.ready.len() + state.active.len() + state.stopped.len(),
            replacements_in_flight: self.inner.replacements.len(),
        }
    }

    /// The sandbox currently held by `session_id`, if any.
    pub fn active_sandbox(&self, session_id: &str) -> Option<SandboxInstance> {
        self.inner.state.lock().active.get(session_id).cloned()
    }

    /// Session ids currently holding a sandbox, sorted.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self.inner.state.lock().active.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    /// Ids of the ready sandboxes, oldest first.
    pub fn ready_ids(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .ready
            .iter()
            .map(|instance| instance.id.clone())
            .collect()
    }

    /// Retired sandboxes, in stop order.
    pub fn stopped(&self) -> Vec<StoppedSandbox> {
        self.inner.state.lock().stopped.clone()
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }
}

fn activate(mut instance: SandboxInstance, session_id: &str) -> SandboxInstance {
    instance.state = SandboxState::Active;
    instance.session_id = Some(session_id.to_string());
    instance
}

impl PoolInner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn generate_name(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}",
            self.settings.name_prefix,
            &id[..8],
            Utc::now().format("%Y%m%d-%H%M%S")
        )
    }

    /// Translate the policy and create one started sandbox, retrying once.
    ///
    /// Every attempt gets a fresh name, since a failed attempt may leave a
    /// sandbox holding the previous one.
    async fn create_sandbox(self: &Arc<Self>, session_id: Option<&str>) -> Result<SandboxInstance> {
        let created_at = Utc::now();
        let params = translate(
            &self.settings.policy,
            &self.settings.image,
            &self.generate_name(),
            created_at,
            session_id,
        )?;

        let instance = retry_once(&self.settings.retry, "sandbox.create", || {
            let mut attempt = params.clone();
            attempt.name = self.generate_name();
            debug!(name = %attempt.name, "creating sandbox");
            self.create_detached(attempt, created_at)
        })
        .await
        .map_err(|e| {
            error!(error = %e, "sandbox creation failed after retry");
            CellblockError::SandboxCreation(e.to_string())
        })?;

        METRICS.inc_sandboxes_created();
        debug!(sandbox = %short_id(&instance.id), name = %instance.name, "sandbox created and started");
        Ok(instance)
    }

    /// Run one create call in a pool-owned task.
    ///
    /// If the caller stops waiting, a sandbox that still comes up is stopped
    /// into the stopped list instead of running untracked.
    fn create_detached(
        self: &Arc<Self>,
        params: CreateParams,
        created_at: DateTime<Utc>,
    ) -> impl Future<Output = std::result::Result<SandboxInstance, RuntimeError>> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        self.background.spawn(async move {
            let result = match inner.runtime.create(&params).await {
                Ok(id) => Ok(SandboxInstance {
                    id,
                    name: params.name.clone(),
                    created_at,
                    state: SandboxState::Ready,
                    session_id: None,
                    params,
                }),
                Err(e) => Err(e),
            };
            if let Err(Ok(orphan)) = tx.send(result) {
                warn!(
                    sandbox = %short_id(&orphan.id),
                    "sandbox came up after its creator gave up; retiring it"
                );
                inner.stop_into_stopped(orphan).await;
            }
        });

        async move {
            rx.await.unwrap_or_else(|_| {
                Err(RuntimeError::Backend("sandbox creation task failed".into()))
            })
        }
    }

    async fn spawn_replacement(self: &Arc<Self>) {
        if self.is_shutdown() {
            return;
        }
        match self.create_sandbox(None).await {
            Ok(instance) => {
                let leftover = {
                    let mut state = self.state.lock();
                    if self.is_shutdown() {
                        Some(instance)
                    } else {
                        debug!(
                            sandbox = %short_id(&instance.id),
                            ready = state.ready.len() + 1,
                            "replacement sandbox ready"
                        );
                        state.ready.push_back(instance);
                        None
                    }
                };
                if let Some(instance) = leftover {
                    debug!("pool shut down while replacement was spawning; stopping it");
                    self.stop_into_stopped(instance).await;
                }
            }
            Err(e) => {
                METRICS.inc_replacement_failures();
                error!(error = %e, "failed to spawn replacement sandbox");
            }
        }
    }

    /// Stop one sandbox and retain it in the stopped list.
    ///
    /// A failed or timed-out stop is logged and recorded on the entry.
    async fn stop_into_stopped(&self, mut instance: SandboxInstance) {
        let limit = self.settings.retry.attempt_timeout();
        let stop_error =
            match tokio::time::timeout(limit, self.runtime.stop(&instance.id)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    error!(sandbox = %short_id(&instance.id), error = %e, "failed to stop sandbox");
                    Some(e.to_string())
                }
                Err(_) => {
                    error!(sandbox = %short_id(&instance.id), "timed out stopping sandbox");
                    Some(format!("stop timed out after {}ms", limit.as_millis()))
                }
            };

        instance.state = SandboxState::Stopped;
        let mut state = self.state.lock();
        state.stopped.push(StoppedSandbox {
            instance,
            stopped_at: Utc::now(),
            stop_error,
        });
    }

    async fn stop_all(&self, instances: Vec<SandboxInstance>) {
        join_all(instances.into_iter().map(|i| self.stop_into_stopped(i))).await;
    }
}
