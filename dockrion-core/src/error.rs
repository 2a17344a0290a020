//! Error taxonomy (spec §7).
//!
//! `FilterRejected` and `CancelRequested` from the spec's taxonomy
//! deliberately have no variant here: filter rejection is a plain `bool`
//! (see [`crate::filter::EventsFilter::is_allowed`]) and cancellation is
//! observed through a `CancellationToken`, never through `Result::Err` —
//! neither is a failure, so neither belongs in an error enum.

use crate::ids::RunId;

/// Errors from the [`crate::bus::EventBus`] facade and its backends.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The backend could not be reached at all (e.g. initial Redis connect
    /// failed), as distinct from a protocol-level [`Self::Redis`] error on an
    /// otherwise-healthy connection.
    #[error("backend unavailable for run {run_id}: {reason}")]
    BackendUnavailable { run_id: RunId, reason: String },

    /// Operation referenced a run the backend has no record of.
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Underlying Redis error, for the Redis backend.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// An event payload could not be serialized or a stored entry could not
    /// be decoded back into an [`crate::event::Event`].
    #[error("event codec error: {0}")]
    Codec(String),

    /// A backend enforces a hard cap on in-flight events for a run and
    /// rejected this publish outright rather than evicting older entries.
    /// Neither backend in this crate returns it today (both evict instead,
    /// per spec §4.3/§4.4); it exists for a future bounded backend and for
    /// callers matching on `BusError` exhaustively.
    #[error("event stream full for run {run_id}")]
    StreamFull { run_id: RunId },
}

/// Errors from [`crate::run::RunManager`].
#[derive(Debug, thiserror::Error)]
pub enum RunManagerError {
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("invalid state transition for run {run_id}: {from} -> {to}")]
    InvalidTransition { run_id: RunId, from: String, to: String },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors surfaced by [`crate::context::StreamContext`] construction and
/// configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    RunManager(#[from] RunManagerError),

    #[error("configuration error: {0}")]
    Config(String),
}
