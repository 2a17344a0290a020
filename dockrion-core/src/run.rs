//! [`RunManager`] — run lifecycle, cancellation, and terminal-event ordering
//! (spec §4.5).
//!
//! Grounded on the corpus's `TaskQueue`/`Task` split (guarded, CAS-style
//! state transitions) and `TimeoutEnforcer`/orchestrator cancellation
//! plumbing (a `CancellationToken` carried through the agent invocation,
//! force-resolved after a grace period). Unlike the corpus, the run
//! registry here is purely in-process: persisting `RunRecord`s to a
//! database is out of scope (§4.5 ADDED note).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::RunConfig;
use crate::context::StreamContext;
use crate::error::{BusError, CoreError, RunManagerError};
use crate::filter::EventsFilter;
use crate::ids::RunId;

/// A run's position in the state machine (spec §3.2/§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// `{run_id, status, created_at, started_at?, finished_at?, result?, error?, ttl_seconds}` (spec §3.2).
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub ttl_seconds: u64,
}

/// What an agent invocation returns: success with a JSON output, or a
/// machine-readable failure.
#[derive(Debug, Clone)]
pub struct AgentError {
    pub message: String,
    pub code: String,
}

pub type AgentOutput = Result<serde_json::Value, AgentError>;
pub type AgentFuture = Pin<Box<dyn Future<Output = AgentOutput> + Send>>;
/// An agent invocation: given its bus-mode [`StreamContext`] and an input
/// payload, runs to completion and reports a terminal outcome. The manager
/// never inspects `payload`; it is opaque pass-through to the agent.
pub type AgentCallable = Box<dyn FnOnce(Arc<StreamContext>, serde_json::Value) -> AgentFuture + Send>;

struct RunHandle {
    record: Mutex<RunRecord>,
    cancel_token: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
}

enum Outcome {
    Finished(AgentOutput),
    Cancelled,
}

/// Owns run creation, execution, cancellation, and status for every run in
/// this process.
pub struct RunManager {
    bus: Arc<dyn EventBus>,
    config: RunConfig,
    registry: RwLock<HashMap<RunId, Arc<RunHandle>>>,
}

impl RunManager {
    pub fn new(bus: Arc<dyn EventBus>, config: RunConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            registry: RwLock::new(HashMap::new()),
        })
    }

    async fn handle(&self, run_id: &RunId) -> Result<Arc<RunHandle>, RunManagerError> {
        self.registry
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunManagerError::RunNotFound(run_id.clone()))
    }

    /// Allocates a run id and writes its PENDING record.
    pub async fn create_run(&self) -> RunId {
        let run_id = RunId::generate();
        let record = RunRecord {
            run_id: run_id.clone(),
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            ttl_seconds: self.config.stream_ttl.as_secs(),
        };
        let handle = Arc::new(RunHandle {
            record: Mutex::new(record),
            cancel_token: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
        });
        self.registry.write().await.insert(run_id.clone(), handle);
        run_id
    }

    /// Guarded transition: only succeeds if the run's current status is one
    /// of `expected` (the in-process analogue of a `WHERE state = $old`
    /// guarded `UPDATE`).
    async fn transition(&self, run_id: &RunId, expected: &[RunStatus], new_status: RunStatus) -> Result<(), RunManagerError> {
        let handle = self.handle(run_id).await?;
        let mut record = handle.record.lock().await;
        if !expected.contains(&record.status) {
            return Err(RunManagerError::InvalidTransition {
                run_id: run_id.clone(),
                from: record.status.to_string(),
                to: new_status.to_string(),
            });
        }
        record.status = new_status;
        if new_status == RunStatus::Running {
            record.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Commits a terminal transition together with publishing its terminal
    /// event, as one logical unit (spec §4.5: "a crash between persisting
    /// run-state and publishing the terminal event cannot happen... a single
    /// critical section"). `emit` is only awaited, and the record only
    /// mutated, while `handle.record`'s lock is held, so no concurrent
    /// reader can observe a status change that the bus never received (or
    /// vice versa). If the transition guard fails or the emit itself fails,
    /// the record is left untouched and the error is returned rather than
    /// swallowed — the run stays RUNNING for the caller to retry or
    /// investigate instead of silently appearing terminal.
    async fn finalize_with_event<F>(
        &self,
        run_id: &RunId,
        new_status: RunStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        emit: F,
    ) -> Result<(), RunManagerError>
    where
        F: Future<Output = Result<(), CoreError>>,
    {
        let handle = self.handle(run_id).await?;
        let mut record = handle.record.lock().await;
        if record.status != RunStatus::Running {
            return Err(RunManagerError::InvalidTransition {
                run_id: run_id.clone(),
                from: record.status.to_string(),
                to: new_status.to_string(),
            });
        }
        emit.await.map_err(core_err_to_run_err)?;
        record.status = new_status;
        record.finished_at = Some(Utc::now());
        record.result = result;
        record.error = error;
        Ok(())
    }

    /// Spawns `agent` in the background, installs a bus-mode [`StreamContext`]
    /// bound to `run_id`, transitions PENDING→RUNNING, and emits `started`.
    pub async fn start(
        self: &Arc<Self>,
        run_id: RunId,
        agent_name: impl Into<String>,
        framework: impl Into<String>,
        filter: EventsFilter,
        payload: serde_json::Value,
        agent: AgentCallable,
    ) -> Result<(), RunManagerError> {
        self.transition(&run_id, &[RunStatus::Pending], RunStatus::Running).await?;

        let handle = self.handle(&run_id).await?;
        let ctx = Arc::new(StreamContext::new_bus_with_cancellation(
            run_id.clone(),
            filter,
            self.bus.clone(),
            handle.cancel_token.clone(),
        ));
        ctx.emit_started(&agent_name.into(), &framework.into(), None)
            .await
            .map_err(core_err_to_run_err)?;

        let manager = Arc::clone(self);
        let ctx_for_task = ctx.clone();
        let cancel_token = handle.cancel_token.clone();
        let run_id_for_task = run_id.clone();

        tokio::spawn(async move {
            manager.drive_run(run_id_for_task, ctx_for_task, cancel_token, payload, agent).await;
        });

        Ok(())
    }

    /// Requests cooperative cancellation of `run_id`. Returns once the
    /// signal has been delivered, not once the run has actually stopped —
    /// see [`Self::drive_run`] for the grace-period resolution.
    pub async fn cancel(&self, run_id: &RunId, reason: Option<String>) -> Result<(), RunManagerError> {
        let handle = self.handle(run_id).await?;
        *handle.cancel_reason.lock().await = reason;
        handle.cancel_token.cancel();
        Ok(())
    }

    pub async fn get_status(&self, run_id: &RunId) -> Result<RunRecord, RunManagerError> {
        let handle = self.handle(run_id).await?;
        Ok(handle.record.lock().await.clone())
    }

    /// `None` while the run has not yet reached a terminal status; `Some(Ok)`
    /// for a completed output, `Some(Err)` for a failed or cancelled run.
    pub async fn get_result(&self, run_id: &RunId) -> Result<Option<Result<serde_json::Value, String>>, RunManagerError> {
        let record = self.get_status(run_id).await?;
        Ok(match record.status {
            RunStatus::Completed => Some(Ok(record.result.unwrap_or(serde_json::Value::Null))),
            RunStatus::Failed | RunStatus::Cancelled => Some(Err(record.error.unwrap_or_default())),
            RunStatus::Pending | RunStatus::Running => None,
        })
    }

    /// Removes the run record and trims its stored events from the bus.
    pub async fn delete_run(&self, run_id: &RunId) -> Result<(), RunManagerError> {
        self.registry.write().await.remove(run_id);
        self.bus.trim(run_id).await?;
        Ok(())
    }

    fn spawn_heartbeat(&self, ctx: Arc<StreamContext>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval_dur = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_dur);
            interval.tick().await; // first tick is immediate; skip so heartbeat never fires at t=0
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let _ = ctx.emit_heartbeat().await;
                    }
                }
            }
        })
    }

    fn spawn_timeout(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let duration = self.config.max_run_duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Timeout is cancellation with a different trigger, not a
            // separate code path: it reuses the same grace-period logic.
            cancel.cancel();
        })
    }

    /// Drives one run to a terminal state. Cancellation is cooperative and
    /// first-wins: if `agent` resolves before `cancel_grace` elapses after a
    /// cancel request, the run completes/fails normally; otherwise it is
    /// forced to CANCELLED and any later output from `agent` is discarded.
    async fn drive_run(
        self: Arc<Self>,
        run_id: RunId,
        ctx: Arc<StreamContext>,
        cancel: CancellationToken,
        payload: serde_json::Value,
        agent: AgentCallable,
    ) {
        let heartbeat = self.spawn_heartbeat(ctx.clone(), cancel.clone());
        let timeout = self.spawn_timeout(cancel.clone());

        let agent_fut = (agent)(ctx.clone(), payload);
        tokio::pin!(agent_fut);

        let outcome = tokio::select! {
            result = &mut agent_fut => Outcome::Finished(result),
            _ = cancel.cancelled() => {
                tokio::select! {
                    result = &mut agent_fut => Outcome::Finished(result),
                    _ = tokio::time::sleep(self.config.cancel_grace) => Outcome::Cancelled,
                }
            }
        };

        heartbeat.abort();
        timeout.abort();

        match outcome {
            Outcome::Finished(Ok(output)) => {
                let emit_output = output.clone();
                if let Err(e) = self
                    .finalize_with_event(&run_id, RunStatus::Completed, Some(output), None, ctx.emit_complete(emit_output, None, None))
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to finalize completed run, leaving it RUNNING for recovery");
                }
            }
            Outcome::Finished(Err(agent_err)) => {
                if let Err(e) = self
                    .finalize_with_event(
                        &run_id,
                        RunStatus::Failed,
                        None,
                        Some(agent_err.message.clone()),
                        ctx.emit_error(&agent_err.message, &agent_err.code, None),
                    )
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to finalize failed run, leaving it RUNNING for recovery");
                }
            }
            Outcome::Cancelled => {
                let reason = match self.handle(&run_id).await {
                    Ok(handle) => handle.cancel_reason.lock().await.clone(),
                    Err(_) => None,
                };
                if let Err(e) = self
                    .finalize_with_event(&run_id, RunStatus::Cancelled, None, reason.clone(), ctx.emit_cancelled(reason.as_deref()))
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to finalize cancelled run, leaving it RUNNING for recovery");
                }
            }
        }
    }
}

fn core_err_to_run_err(err: CoreError) -> RunManagerError {
    match err {
        CoreError::Bus(e) => RunManagerError::Bus(e),
        other => RunManagerError::Bus(BusError::Codec(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use std::time::Duration;

    fn test_config() -> RunConfig {
        RunConfig {
            heartbeat_interval: Duration::from_millis(50),
            max_run_duration: Duration::from_secs(60),
            cancel_grace: Duration::from_millis(100),
            stream_ttl: Duration::from_secs(3600),
            max_events_per_run: 1000,
        }
    }

    fn manager_with_bus() -> (Arc<RunManager>, Arc<InMemoryBackend>) {
        let bus = InMemoryBackend::new(1000, Duration::from_secs(3600));
        let manager = RunManager::new(bus.clone(), test_config());
        (manager, bus)
    }

    #[tokio::test]
    async fn happy_path_completes_and_records_output() {
        let (manager, bus) = manager_with_bus();
        let run_id = manager.create_run().await;

        let agent: AgentCallable = Box::new(|ctx, _payload| {
            Box::pin(async move {
                ctx.emit_progress("working", 0.5, None).await.unwrap();
                Ok(serde_json::json!({"result": "ok"}))
            })
        });

        manager
            .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = manager.get_status(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Completed);

        let events = bus.get_events(&run_id, 0, None).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, crate::event::EventType::Complete);
    }

    #[tokio::test]
    async fn agent_failure_transitions_to_failed() {
        let (manager, _bus) = manager_with_bus();
        let run_id = manager.create_run().await;

        let agent: AgentCallable = Box::new(|_ctx, _payload| {
            Box::pin(async move {
                Err(AgentError { message: "boom".to_string(), code: "boom_code".to_string() })
            })
        });

        manager
            .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = manager.get_status(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert_eq!(status.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cancel_forces_cancelled_after_grace_when_agent_never_yields() {
        let (manager, _bus) = manager_with_bus();
        let run_id = manager.create_run().await;

        let agent: AgentCallable = Box::new(|_ctx, _payload| {
            Box::pin(async move {
                // Never observes cancellation; sleeps far past cancel_grace.
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(serde_json::json!({}))
            })
        });

        manager
            .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.cancel(&run_id, Some("client requested".to_string())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = manager.get_status(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn agent_finishing_during_grace_wins_over_cancellation() {
        let (manager, _bus) = manager_with_bus();
        let run_id = manager.create_run().await;

        let agent: AgentCallable = Box::new(|_ctx, _payload| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(serde_json::json!({"finished": true}))
            })
        });

        manager
            .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent)
            .await
            .unwrap();

        manager.cancel(&run_id, Some("race".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = manager.get_status(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn agent_observing_cancellation_exits_before_grace_elapses() {
        let (manager, bus) = manager_with_bus();
        let run_id = manager.create_run().await;

        let agent: AgentCallable = Box::new(|ctx, _payload| {
            Box::pin(async move {
                ctx.cancelled().await;
                Err(AgentError { message: "cancelled cooperatively".to_string(), code: "cancelled".to_string() })
            })
        });

        manager
            .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.cancel(&run_id, Some("client".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = manager.get_status(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);

        let events = bus.get_events(&run_id, 0, None).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, crate::event::EventType::Error);
    }

    #[tokio::test]
    async fn unknown_run_id_is_not_found() {
        let (manager, _bus) = manager_with_bus();
        let bogus = RunId::generate();
        assert!(manager.get_status(&bogus).await.is_err());
        assert!(manager.cancel(&bogus, None).await.is_err());
    }

    #[tokio::test]
    async fn starting_a_running_run_fails_transition() {
        let (manager, _bus) = manager_with_bus();
        let run_id = manager.create_run().await;

        let agent: AgentCallable = Box::new(|_ctx, _payload| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(serde_json::json!({}))
            })
        });
        manager
            .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent)
            .await
            .unwrap();

        let agent2: AgentCallable = Box::new(|_ctx, _payload| Box::pin(async move { Ok(serde_json::json!({})) }));
        let result = manager
            .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent2)
            .await;
        assert!(result.is_err());
    }
}
