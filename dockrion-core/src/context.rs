//! [`StreamContext`] — the producer-side emission API (spec §4.1).
//!
//! A context is constructed in one of two modes: queue mode (Pattern A,
//! direct streaming — events live only in an internal bounded FIFO until
//! drained by an HTTP adapter) or bus mode (Pattern B, async runs — events
//! are published straight through an [`crate::bus::EventBus`]). The two
//! modes share everything except the sink, grounded on the corpus's
//! `AdapterContext` (task metadata + an event channel + a cancel token)
//! generalized to the two-sink split this crate needs.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::error::CoreError;
use crate::event::{Event, EventType};
use crate::filter::EventsFilter;
use crate::ids::{CorrelationId, RunId};

/// Default high-water mark for a queue-mode context's internal FIFO,
/// matching [`crate::config::RunConfig::max_events_per_run`]'s default.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

enum Sink {
    Queue(Mutex<VecDeque<Event>>),
    Bus(Arc<dyn EventBus>),
}

/// Sequence counter and terminal flag, committed together so that no two
/// concurrent emits can both believe they are the one terminal event.
struct SequenceState {
    next_sequence: i64,
    terminated: bool,
}

/// The producer-facing emission API agents use to record events for a run.
///
/// In queue mode, `run_id`-shaped fields on emitted [`Event`]s actually carry
/// a [`CorrelationId`]'s string, never a [`RunId`] the bus would recognize —
/// queue mode holds no bus reference at all, so there is no code path by
/// which that identifier can reach [`EventBus::publish`] (spec §9, "hard
/// boundary... compile-time guarantee rather than a runtime check").
pub struct StreamContext {
    stamp_id: RunId,
    filter: EventsFilter,
    sink: Sink,
    state: Mutex<SequenceState>,
    queue_capacity: usize,
    cancel_token: CancellationToken,
}

tokio::task_local! {
    static CURRENT_CONTEXT: Arc<StreamContext>;
}

impl StreamContext {
    fn new(stamp_id: RunId, filter: EventsFilter, sink: Sink, queue_capacity: usize, cancel_token: CancellationToken) -> Self {
        Self {
            stamp_id,
            filter,
            sink,
            state: Mutex::new(SequenceState { next_sequence: 0, terminated: false }),
            queue_capacity,
            cancel_token,
        }
    }

    /// Queue-mode constructor for Pattern A (direct, in-request streaming).
    /// No `EventBus` is ever held, by construction.
    pub fn new_queue(correlation_id: CorrelationId, filter: EventsFilter) -> Self {
        Self::new(
            RunId::new(correlation_id.as_str()),
            filter,
            Sink::Queue(Mutex::new(VecDeque::new())),
            DEFAULT_QUEUE_CAPACITY,
            CancellationToken::new(),
        )
    }

    /// Queue-mode constructor with an explicit high-water mark.
    pub fn new_queue_with_capacity(correlation_id: CorrelationId, filter: EventsFilter, queue_capacity: usize) -> Self {
        Self::new(
            RunId::new(correlation_id.as_str()),
            filter,
            Sink::Queue(Mutex::new(VecDeque::new())),
            queue_capacity,
            CancellationToken::new(),
        )
    }

    /// Bus-mode constructor for Pattern B (server-managed async runs). Carries
    /// no shared cancellation signal of its own — use
    /// [`Self::new_bus_with_cancellation`] when the caller (namely
    /// [`crate::run::RunManager`]) needs agent code to observe cancellation
    /// through this context.
    pub fn new_bus(run_id: RunId, filter: EventsFilter, bus: Arc<dyn EventBus>) -> Self {
        Self::new(run_id, filter, Sink::Bus(bus), DEFAULT_QUEUE_CAPACITY, CancellationToken::new())
    }

    /// Bus-mode constructor sharing an externally owned [`CancellationToken`],
    /// so agent code holding only this context can still observe the run's
    /// cancellation signal via [`Self::is_cancelled`]/[`Self::cancelled`].
    pub(crate) fn new_bus_with_cancellation(run_id: RunId, filter: EventsFilter, bus: Arc<dyn EventBus>, cancel_token: CancellationToken) -> Self {
        Self::new(run_id, filter, Sink::Bus(bus), DEFAULT_QUEUE_CAPACITY, cancel_token)
    }

    /// True once the run's cancellation has been requested (client cancel or
    /// timeout). Agent code should check this between units of work and stop
    /// promptly when it flips.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the run's cancellation has been requested. Agents doing
    /// long-running I/O can race this against their own work to react
    /// immediately rather than polling [`Self::is_cancelled`].
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }

    /// The identifier this context stamps onto every event it emits. In bus
    /// mode this is the real [`RunId`]; in queue mode it is a
    /// [`CorrelationId`]'s string wearing a `RunId` shape purely so
    /// [`Event::new`] can be called — it is never handed to an `EventBus`.
    pub fn stamp_id(&self) -> &RunId {
        &self.stamp_id
    }

    /// Installs `ctx` as the ambient context for the duration of `fut`'s
    /// task. Cleared on every exit path (return, panic-unwind, early drop)
    /// because it is scoped storage owned by the resulting future, not a
    /// guard the caller must remember to drop.
    pub async fn scope<F: Future>(ctx: Arc<StreamContext>, fut: F) -> F::Output {
        CURRENT_CONTEXT.scope(ctx, fut).await
    }

    /// Looks up the ambient context installed by an enclosing [`Self::scope`]
    /// call, if any.
    pub fn get_current_context() -> Option<Arc<StreamContext>> {
        CURRENT_CONTEXT.try_with(Arc::clone).ok()
    }

    /// Removes and returns all currently queued events (queue mode only).
    /// In bus mode this is a no-op returning an empty vector, since bus-mode
    /// events are never buffered here.
    pub async fn drain_queued_events(&self) -> Vec<Event> {
        match &self.sink {
            Sink::Queue(queue) => queue.lock().await.drain(..).collect(),
            Sink::Bus(_) => Vec::new(),
        }
    }

    /// Reserves the next sequence number for `event_type`, or `None` if the
    /// event is filtered out or the run already has a terminal event
    /// recorded. Assigning sequence only after both checks pass keeps the
    /// stored/delivered sequence dense (spec §9, sequence-gap open question).
    async fn next_sequence_for(&self, event_type: &EventType) -> Option<i64> {
        if !self.filter.is_allowed(event_type) {
            return None;
        }
        let mut state = self.state.lock().await;
        if state.terminated {
            return None;
        }
        let seq = state.next_sequence;
        state.next_sequence += 1;
        if event_type.is_terminal() {
            state.terminated = true;
        }
        Some(seq)
    }

    async fn dispatch(&self, event: Event) -> Result<(), CoreError> {
        match &self.sink {
            Sink::Queue(queue) => {
                let fatal = {
                    let mut q = queue.lock().await;
                    q.push_back(event);
                    evict_oldest_non_mandatory(&mut q, self.queue_capacity)
                };
                if fatal {
                    self.record_queue_overflow().await;
                }
                Ok(())
            }
            Sink::Bus(bus) => {
                bus.publish(&self.stamp_id, event).await?;
                Ok(())
            }
        }
    }

    /// Only mandatory events remain in the queue and it is still over
    /// capacity: a fatal condition (spec §4.1 step 5). Synthesizes a
    /// terminal `error` event in place of further eviction.
    async fn record_queue_overflow(&self) {
        if let Some(seq) = self.next_sequence_for(&EventType::Error).await {
            let synthetic = Event::error(
                &self.stamp_id,
                seq,
                "queue overflow: mandatory events could not be evicted",
                "queue_overflow",
                None,
            );
            if let Sink::Queue(queue) = &self.sink {
                queue.lock().await.push_back(synthetic);
            }
        }
    }

    /// Fire-and-forget error capture for a detached emit that failed: best
    /// effort, itself silently dropped if the run has already terminated.
    async fn record_detached_error(&self, err: CoreError) {
        tracing::warn!(run_id = %self.stamp_id, error = %err, "detached emit failed, recording error event");
        let _ = self.emit_error(&err.to_string(), "bus_error", None).await;
    }

    pub async fn emit_started(&self, agent_name: &str, framework: &str, metadata: Option<serde_json::Value>) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Started).await else { return Ok(()) };
        self.dispatch(Event::started(&self.stamp_id, seq, agent_name, framework, metadata)).await
    }

    pub fn emit_started_detached(self: &Arc<Self>, agent_name: impl Into<String>, framework: impl Into<String>, metadata: Option<serde_json::Value>) {
        let ctx = Arc::clone(self);
        let agent_name = agent_name.into();
        let framework = framework.into();
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_started(&agent_name, &framework, metadata).await {
                ctx.record_detached_error(err).await;
            }
        });
    }

    pub async fn emit_progress(&self, step: &str, progress: f64, message: Option<&str>) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Progress).await else { return Ok(()) };
        self.dispatch(Event::progress(&self.stamp_id, seq, step, progress, message)).await
    }

    pub fn emit_progress_detached(self: &Arc<Self>, step: impl Into<String>, progress: f64, message: Option<String>) {
        let ctx = Arc::clone(self);
        let step = step.into();
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_progress(&step, progress, message.as_deref()).await {
                ctx.record_detached_error(err).await;
            }
        });
    }

    pub async fn emit_checkpoint(&self, name: &str, data: serde_json::Value) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Checkpoint).await else { return Ok(()) };
        self.dispatch(Event::checkpoint(&self.stamp_id, seq, name, data)).await
    }

    pub fn emit_checkpoint_detached(self: &Arc<Self>, name: impl Into<String>, data: serde_json::Value) {
        let ctx = Arc::clone(self);
        let name = name.into();
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_checkpoint(&name, data).await {
                ctx.record_detached_error(err).await;
            }
        });
    }

    pub async fn emit_token(&self, content: &str, finish_reason: Option<&str>) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Token).await else { return Ok(()) };
        self.dispatch(Event::token(&self.stamp_id, seq, content, finish_reason)).await
    }

    pub fn emit_token_detached(self: &Arc<Self>, content: impl Into<String>, finish_reason: Option<String>) {
        let ctx = Arc::clone(self);
        let content = content.into();
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_token(&content, finish_reason.as_deref()).await {
                ctx.record_detached_error(err).await;
            }
        });
    }

    pub async fn emit_step(
        &self,
        node_name: &str,
        duration_ms: Option<u64>,
        input_keys: Option<Vec<String>>,
        output_keys: Option<Vec<String>>,
    ) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Step).await else { return Ok(()) };
        self.dispatch(Event::step(&self.stamp_id, seq, node_name, duration_ms, input_keys, output_keys)).await
    }

    pub fn emit_step_detached(
        self: &Arc<Self>,
        node_name: impl Into<String>,
        duration_ms: Option<u64>,
        input_keys: Option<Vec<String>>,
        output_keys: Option<Vec<String>>,
    ) {
        let ctx = Arc::clone(self);
        let node_name = node_name.into();
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_step(&node_name, duration_ms, input_keys, output_keys).await {
                ctx.record_detached_error(err).await;
            }
        });
    }

    pub async fn emit_complete(&self, output: serde_json::Value, latency_seconds: Option<f64>, metadata: Option<serde_json::Value>) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Complete).await else { return Ok(()) };
        self.dispatch(Event::complete(&self.stamp_id, seq, output, latency_seconds, metadata)).await
    }

    pub fn emit_complete_detached(self: &Arc<Self>, output: serde_json::Value, latency_seconds: Option<f64>, metadata: Option<serde_json::Value>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_complete(output, latency_seconds, metadata).await {
                ctx.record_detached_error(err).await;
            }
        });
    }

    pub async fn emit_error(&self, error: &str, code: &str, details: Option<serde_json::Value>) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Error).await else { return Ok(()) };
        self.dispatch(Event::error(&self.stamp_id, seq, error, code, details)).await
    }

    pub fn emit_error_detached(self: &Arc<Self>, error: impl Into<String>, code: impl Into<String>, details: Option<serde_json::Value>) {
        let ctx = Arc::clone(self);
        let error = error.into();
        let code = code.into();
        tokio::spawn(async move {
            // This already is the detached-error path; do not recurse into it on failure.
            if let Err(err) = ctx.emit_error(&error, &code, details).await {
                tracing::error!(run_id = %ctx.stamp_id, error = %err, "failed to record detached error event");
            }
        });
    }

    pub async fn emit_cancelled(&self, reason: Option<&str>) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Cancelled).await else { return Ok(()) };
        self.dispatch(Event::cancelled(&self.stamp_id, seq, reason)).await
    }

    pub fn emit_cancelled_detached(self: &Arc<Self>, reason: Option<String>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_cancelled(reason.as_deref()).await {
                ctx.record_detached_error(err).await;
            }
        });
    }

    pub async fn emit_heartbeat(&self) -> Result<(), CoreError> {
        let Some(seq) = self.next_sequence_for(&EventType::Heartbeat).await else { return Ok(()) };
        self.dispatch(Event::heartbeat(&self.stamp_id, seq)).await
    }

    pub fn emit_heartbeat_detached(self: &Arc<Self>) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_heartbeat().await {
                ctx.record_detached_error(err).await;
            }
        });
    }

    pub async fn emit_custom(&self, name: &str, data: serde_json::Value) -> Result<(), CoreError> {
        let event_type = EventType::Custom(name.to_string());
        let Some(seq) = self.next_sequence_for(&event_type).await else { return Ok(()) };
        self.dispatch(Event::custom(&self.stamp_id, seq, name, data)).await
    }

    pub fn emit_custom_detached(self: &Arc<Self>, name: impl Into<String>, data: serde_json::Value) {
        let ctx = Arc::clone(self);
        let name = name.into();
        tokio::spawn(async move {
            if let Err(err) = ctx.emit_custom(&name, data).await {
                ctx.record_detached_error(err).await;
            }
        });
    }
}

/// Only mandatory events remain and the queue is still over capacity.
fn evict_oldest_non_mandatory(queue: &mut VecDeque<Event>, capacity: usize) -> bool {
    while queue.len() > capacity {
        match queue.iter().position(|e| !e.event_type.is_mandatory()) {
            Some(idx) => {
                queue.remove(idx);
            }
            None => return true,
        }
    }
    false
}

/// Builds a queue-mode context for Pattern A (direct, in-request streaming).
pub fn make_direct_context(correlation_id: CorrelationId, filter: EventsFilter) -> StreamContext {
    StreamContext::new_queue(correlation_id, filter)
}

/// Builds a bus-mode context for Pattern B (server-managed async runs).
pub fn make_bus_context(run_id: RunId, filter: EventsFilter, bus: Arc<dyn EventBus>) -> StreamContext {
    StreamContext::new_bus(run_id, filter, bus)
}
