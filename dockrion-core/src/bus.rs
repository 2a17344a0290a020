//! [`EventBus`] — the uniform facade over pluggable backends (spec §4.2).
//!
//! `EventBus` is a pure facade: it carries no state of its own beyond
//! whichever backend it wraps. Concrete backends live in [`crate::backend`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::BusError;
use crate::event::Event;
use crate::ids::RunId;

/// A lazily-produced, ordered sequence of events: the shape returned by
/// [`EventBus::subscribe`]. Backed by `async-stream`/`tokio-stream`
/// combinators over each backend's native iteration primitive.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, BusError>> + Send>>;

/// Uniform API over the storage/fan-out substrate behind a run's events.
///
/// Object-safe over `Arc<dyn EventBus + Send + Sync>` so a host process can
/// hold one trait object and swap `InMemoryBackend` for `RedisBackend` by
/// configuration alone (§9 "interface polymorphism over backends" — a plain
/// capability set, no inheritance).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Persists `event` and fans it out to any live subscribers. Must be
    /// safe to call from many producers concurrently, though in practice
    /// there is one producer per run.
    async fn publish(&self, run_id: &RunId, event: Event) -> Result<(), BusError>;

    /// Opens a subscription that first yields all stored events with
    /// `sequence >= from_sequence` (when `include_historical`), then yields
    /// live events as they are published, until the terminal event is
    /// observed or the returned stream is dropped.
    async fn subscribe(
        &self,
        run_id: &RunId,
        from_sequence: i64,
        include_historical: bool,
    ) -> Result<EventStream, BusError>;

    /// One-shot query with no live tail: at most `limit` events starting at
    /// `from_sequence`, in order.
    async fn get_events(
        &self,
        run_id: &RunId,
        from_sequence: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, BusError>;

    /// Deletes all stored events for a run (used by [`crate::run::RunManager`]
    /// on run deletion).
    async fn trim(&self, run_id: &RunId) -> Result<(), BusError>;
}
