//! In-memory [`crate::bus::EventBus`] backend (spec §4.3).
//!
//! Single-process reference backend: correct, low-overhead, no external
//! dependency. Grounded on the corpus's `DashMap`-shaped sharded-state idiom,
//! realized here with a `RwLock<HashMap<...>>` whose outer lock is only ever
//! write-locked to insert/remove a run entry (rare) — the per-run
//! `tokio::sync::Mutex` is what actually serializes publish/subscribe
//! against one run, so two runs never contend (SPEC_FULL §4.3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, EventStream};
use crate::error::BusError;
use crate::event::Event;
use crate::ids::RunId;

/// Bounded capacity for each subscriber's live-tail channel. A full channel
/// means a slow subscriber; it is dropped rather than awaited on, per the
/// "producer never blocks on subscribers" non-goal.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

struct RunState {
    events: Vec<Event>,
    subscribers: Vec<mpsc::Sender<Event>>,
    terminated: bool,
    terminated_at: Option<Instant>,
}

impl RunState {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            subscribers: Vec::new(),
            terminated: false,
            terminated_at: None,
        }
    }

    /// Ring-buffer eviction: oldest non-mandatory events drop first once
    /// `max_events_per_run` is exceeded. Mandatory events are never evicted,
    /// even if that leaves the run over the configured cap.
    fn evict_if_over_cap(&mut self, max_events_per_run: usize) {
        while self.events.len() > max_events_per_run {
            let oldest_non_mandatory = self
                .events
                .iter()
                .position(|e| !e.event_type.is_mandatory());
            match oldest_non_mandatory {
                Some(idx) => {
                    self.events.remove(idx);
                }
                None => break,
            }
        }
    }
}

/// Single-process reference [`EventBus`] backend.
pub struct InMemoryBackend {
    runs: RwLock<HashMap<RunId, Arc<Mutex<RunState>>>>,
    max_events_per_run: usize,
    stream_ttl: Duration,
    sweep_cancel: CancellationToken,
}

impl InMemoryBackend {
    /// Builds a backend and spawns its background TTL sweep task.
    ///
    /// The sweep task removes terminated run entries older than
    /// `stream_ttl` and is cancelled when the backend (and the
    /// `CancellationToken` handed back by [`Self::shutdown_token`]) is
    /// dropped or explicitly cancelled.
    pub fn new(max_events_per_run: usize, stream_ttl: Duration) -> Arc<Self> {
        let backend = Arc::new(Self {
            runs: RwLock::new(HashMap::new()),
            max_events_per_run,
            stream_ttl,
            sweep_cancel: CancellationToken::new(),
        });

        let sweep_backend = backend.clone();
        let cancel = backend.sweep_cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30).min(sweep_backend.stream_ttl));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => sweep_backend.sweep_expired().await,
                }
            }
        });

        backend
    }

    /// Cancels the background TTL sweep task. Intended for test teardown and
    /// graceful shutdown of a host process.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.sweep_cancel.clone()
    }

    async fn sweep_expired(&self) {
        let mut expired = Vec::new();
        {
            let runs = self.runs.read().await;
            for (run_id, state) in runs.iter() {
                let state = state.lock().await;
                if let Some(terminated_at) = state.terminated_at {
                    if terminated_at.elapsed() >= self.stream_ttl {
                        expired.push(run_id.clone());
                    }
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        let mut runs = self.runs.write().await;
        for run_id in expired {
            tracing::debug!(run_id = %run_id, "sweeping expired run from in-memory backend");
            runs.remove(&run_id);
        }
    }

    async fn entry(&self, run_id: &RunId) -> Arc<Mutex<RunState>> {
        if let Some(existing) = self.runs.read().await.get(run_id) {
            return existing.clone();
        }
        let mut runs = self.runs.write().await;
        runs.entry(run_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RunState::new())))
            .clone()
    }
}

#[async_trait]
impl EventBus for InMemoryBackend {
    async fn publish(&self, run_id: &RunId, event: Event) -> Result<(), BusError> {
        let entry = self.entry(run_id).await;
        let mut state = entry.lock().await;

        if state.terminated {
            tracing::debug!(run_id = %run_id, sequence = event.sequence, "dropping publish after terminal event");
            return Ok(());
        }

        let is_terminal = event.event_type.is_terminal();
        state.events.push(event.clone());
        state.evict_if_over_cap(self.max_events_per_run);

        if is_terminal {
            state.terminated = true;
            state.terminated_at = Some(Instant::now());
        }

        state.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(run_id = %run_id, "dropping slow subscriber: channel full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        Ok(())
    }

    async fn subscribe(
        &self,
        run_id: &RunId,
        from_sequence: i64,
        include_historical: bool,
    ) -> Result<EventStream, BusError> {
        let entry = self.entry(run_id).await;
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);

        let (snapshot, already_terminal) = {
            let mut state = entry.lock().await;
            let snapshot: Vec<Event> = if include_historical {
                state
                    .events
                    .iter()
                    .filter(|e| e.sequence >= from_sequence)
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            if !state.terminated {
                state.subscribers.push(tx);
            }
            (snapshot, state.terminated)
        };

        let snapshot_has_terminal = snapshot.iter().any(|e| e.event_type.is_terminal());

        let stream = async_stream::stream! {
            for event in snapshot {
                yield Ok(event);
            }
            if snapshot_has_terminal || (already_terminal && !include_historical) {
                return;
            }
            while let Some(event) = rx.recv().await {
                let terminal = event.event_type.is_terminal();
                yield Ok(event);
                if terminal {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn get_events(
        &self,
        run_id: &RunId,
        from_sequence: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, BusError> {
        let entry = self.entry(run_id).await;
        let state = entry.lock().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|e| e.sequence >= from_sequence)
            .cloned()
            .collect();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn trim(&self, run_id: &RunId) -> Result<(), BusError> {
        let mut runs = self.runs.write().await;
        runs.remove(run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn run_id() -> RunId {
        RunId::new("r1")
    }

    #[tokio::test]
    async fn happy_path_sequence_is_delivered_in_order() {
        let backend = InMemoryBackend::new(1000, Duration::from_secs(3600));
        let run_id = run_id();

        backend
            .publish(&run_id, Event::started(&run_id, 0, "agent", "custom", None))
            .await
            .unwrap();
        backend
            .publish(&run_id, Event::progress(&run_id, 1, "a", 0.5, None))
            .await
            .unwrap();
        backend
            .publish(&run_id, Event::complete(&run_id, 2, serde_json::json!({"r": 1}), None, None))
            .await
            .unwrap();

        let mut stream = backend.subscribe(&run_id, 0, true).await.unwrap();
        let mut sequences = Vec::new();
        while let Some(event) = stream.next().await {
            sequences.push(event.unwrap().sequence);
        }
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn subscribe_past_terminal_sequence_closes_immediately() {
        let backend = InMemoryBackend::new(1000, Duration::from_secs(3600));
        let run_id = run_id();
        backend
            .publish(&run_id, Event::started(&run_id, 0, "agent", "custom", None))
            .await
            .unwrap();
        backend
            .publish(&run_id, Event::complete(&run_id, 1, serde_json::json!({}), None, None))
            .await
            .unwrap();

        let mut stream = backend.subscribe(&run_id, 5, true).await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn reconnect_mid_run_observes_continuation() {
        let backend = InMemoryBackend::new(1000, Duration::from_secs(3600));
        let run_id = run_id();
        for seq in 0..5 {
            backend
                .publish(&run_id, Event::progress(&run_id, seq, "s", 0.1, None))
                .await
                .unwrap();
        }

        let events = backend.get_events(&run_id, 3, None).await.unwrap();
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_non_mandatory_but_keeps_mandatory() {
        let backend = InMemoryBackend::new(5, Duration::from_secs(3600));
        let run_id = run_id();
        backend
            .publish(&run_id, Event::started(&run_id, 0, "agent", "custom", None))
            .await
            .unwrap();
        for seq in 1..=10 {
            backend
                .publish(&run_id, Event::progress(&run_id, seq, "s", 0.1, None))
                .await
                .unwrap();
        }
        backend
            .publish(&run_id, Event::complete(&run_id, 11, serde_json::json!({}), None, None))
            .await
            .unwrap();

        let events = backend.get_events(&run_id, 0, None).await.unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events.first().unwrap().event_type, crate::event::EventType::Started);
        assert_eq!(events.last().unwrap().event_type, crate::event::EventType::Complete);
    }

    #[tokio::test]
    async fn publish_after_terminal_is_dropped() {
        let backend = InMemoryBackend::new(1000, Duration::from_secs(3600));
        let run_id = run_id();
        backend
            .publish(&run_id, Event::complete(&run_id, 0, serde_json::json!({}), None, None))
            .await
            .unwrap();
        backend
            .publish(&run_id, Event::progress(&run_id, 1, "s", 0.1, None))
            .await
            .unwrap();

        let events = backend.get_events(&run_id, 0, None).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn trim_removes_all_events() {
        let backend = InMemoryBackend::new(1000, Duration::from_secs(3600));
        let run_id = run_id();
        backend
            .publish(&run_id, Event::started(&run_id, 0, "agent", "custom", None))
            .await
            .unwrap();
        backend.trim(&run_id).await.unwrap();
        let events = backend.get_events(&run_id, 0, None).await.unwrap();
        assert!(events.is_empty());
    }
}
