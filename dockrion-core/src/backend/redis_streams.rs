//! Redis Streams [`crate::bus::EventBus`] backend (spec §4.4).
//!
//! Grounded on the corpus's `RedisClient`/`StreamWriter`/`StreamReader` split:
//! a cheaply-cloneable `ConnectionManager` handle, XADD for publish, and
//! XRANGE (backfill) + XREAD BLOCK (live tail) for subscribe. Unlike the
//! corpus's hash-chained `TaskEvent`, events here carry no `hash_prev`/
//! `hash_curr` — sequencing alone is enough to detect gaps, and chaining adds
//! nothing a single-writer-per-run stream needs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};

use crate::bus::{EventBus, EventStream};
use crate::error::BusError;
use crate::event::Event;
use crate::ids::RunId;

fn stream_key(run_id: &RunId) -> String {
    format!("dockrion:stream:{}", run_id.as_str())
}

fn run_key(run_id: &RunId) -> String {
    format!("dockrion:run:{}", run_id.as_str())
}

/// Distinguishes a dropped/unreachable connection from any other
/// protocol-level Redis error, so callers can tell "the backend is down" from
/// "the backend answered with something unexpected" (spec §7).
fn classify_redis_err(run_id: &RunId, err: redis::RedisError) -> BusError {
    if err.is_io_error() || err.is_connection_dropped() {
        BusError::BackendUnavailable { run_id: run_id.clone(), reason: err.to_string() }
    } else {
        BusError::Redis(err)
    }
}

const RUNS_INDEX_KEY: &str = "dockrion:runs:index";

/// When to attach a Redis key TTL to a run's stream and run-record keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlPolicy {
    /// Set the TTL once, on the first publish for a run.
    OnFirstPublish,
    /// Refresh the TTL on every publish (sliding window).
    OnEveryPublish,
    /// Set the TTL only once the terminal event has been published.
    OnTerminal,
}

#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    pub url: String,
    pub connection_pool_size: usize,
    pub stream_ttl: Duration,
    pub max_events_per_run: usize,
    pub ttl_policy: TtlPolicy,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_pool_size: 10,
            stream_ttl: Duration::from_secs(3600),
            max_events_per_run: 1000,
            ttl_policy: TtlPolicy::OnTerminal,
        }
    }
}

/// Redis Streams backed [`EventBus`].
///
/// Holds one primary `ConnectionManager` used for writes plus a small
/// round-robin pool of read connections sized by `connection_pool_size`, all
/// clones of the same manager (which itself pools and auto-reconnects) so the
/// "pool" here is really about spreading blocking XREAD calls across
/// distinct logical handles rather than opening extra sockets.
pub struct RedisBackend {
    write_conn: ConnectionManager,
    read_pool: Vec<ConnectionManager>,
    next_reader: std::sync::atomic::AtomicUsize,
    config: RedisBackendConfig,
}

impl RedisBackend {
    pub async fn connect(config: RedisBackendConfig) -> Result<Self, BusError> {
        let client = Client::open(config.url.as_str()).map_err(BusError::Redis)?;
        let write_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(BusError::Redis)?;

        let pool_size = config.connection_pool_size.max(1);
        let mut read_pool = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            read_pool.push(ConnectionManager::new(client.clone()).await.map_err(BusError::Redis)?);
        }

        tracing::info!(pool_size, "connected to redis streams backend");

        Ok(Self {
            write_conn,
            read_pool,
            next_reader: std::sync::atomic::AtomicUsize::new(0),
            config,
        })
    }

    fn read_conn(&self) -> ConnectionManager {
        let idx = self
            .next_reader
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            % self.read_pool.len();
        self.read_pool[idx].clone()
    }

    fn encode_fields(event: &Event) -> Result<Vec<(&'static str, String)>, BusError> {
        let payload = serde_json::to_string(&event.payload).map_err(|e| BusError::Codec(e.to_string()))?;
        Ok(vec![
            ("seq", event.sequence.to_string()),
            ("type", event.event_type.to_string()),
            ("ts", event.timestamp.to_rfc3339()),
            ("payload", payload),
        ])
    }

    /// The `dockrion:run:{run_id}` hash fields this event updates. Bookkeeping
    /// (`last_sequence`/`terminal`) is always refreshed; `started`/terminal
    /// events additionally project the run-record fields derivable from the
    /// event stream itself (`status`, `started_at`, `finished_at`,
    /// `result`/`error`) so a reader of this hash alone can recover a run's
    /// status without replaying the stream. `created_at`/`ttl_seconds` are not
    /// derivable from any event (they exist before the first event is
    /// published) and stay owned by `RunManager`'s in-process registry.
    fn run_hash_fields(event: &Event) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("last_sequence", event.sequence.to_string()),
            ("terminal", event.event_type.is_terminal().to_string()),
        ];
        match &event.event_type {
            crate::event::EventType::Started => {
                fields.push(("status", "running".to_string()));
                fields.push(("started_at", event.timestamp.to_rfc3339()));
            }
            crate::event::EventType::Complete => {
                fields.push(("status", "completed".to_string()));
                fields.push(("finished_at", event.timestamp.to_rfc3339()));
                if let Some(output) = event.payload.get("output") {
                    fields.push(("result", output.to_string()));
                }
            }
            crate::event::EventType::Error => {
                fields.push(("status", "failed".to_string()));
                fields.push(("finished_at", event.timestamp.to_rfc3339()));
                if let Some(message) = event.payload.get("error").and_then(|v| v.as_str()) {
                    fields.push(("error", message.to_string()));
                }
            }
            crate::event::EventType::Cancelled => {
                fields.push(("status", "cancelled".to_string()));
                fields.push(("finished_at", event.timestamp.to_rfc3339()));
                if let Some(reason) = event.payload.get("reason").and_then(|v| v.as_str()) {
                    fields.push(("error", reason.to_string()));
                }
            }
            _ => {}
        }
        fields
    }

    fn decode_event(run_id: &RunId, fields: &HashMap<String, String>) -> Result<Event, BusError> {
        let seq: i64 = fields
            .get("seq")
            .ok_or_else(|| BusError::Codec("missing seq field".to_string()))?
            .parse()
            .map_err(|e| BusError::Codec(format!("invalid seq field: {e}")))?;
        let event_type: crate::event::EventType = fields
            .get("type")
            .ok_or_else(|| BusError::Codec("missing type field".to_string()))?
            .parse()
            .map_err(|e: crate::event::EventTypeParseError| BusError::Codec(e.to_string()))?;
        let ts: chrono::DateTime<chrono::Utc> = fields
            .get("ts")
            .ok_or_else(|| BusError::Codec("missing ts field".to_string()))?
            .parse()
            .map_err(|e| BusError::Codec(format!("invalid ts field: {e}")))?;
        let payload: serde_json::Value = fields
            .get("payload")
            .map(|raw| serde_json::from_str(raw))
            .transpose()
            .map_err(|e| BusError::Codec(e.to_string()))?
            .unwrap_or(serde_json::json!({}));

        Ok(Event {
            event_type,
            run_id: run_id.to_string(),
            sequence: seq,
            timestamp: ts,
            payload,
        })
    }

    fn decode_reply(run_id: &RunId, reply: StreamReadReply) -> (Vec<(String, Event)>, Vec<String>) {
        let mut decoded = Vec::new();
        let mut decode_errors = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let fields: HashMap<String, String> = id
                    .map
                    .into_iter()
                    .filter_map(|(k, v)| redis::from_redis_value::<String>(&v).ok().map(|v| (k, v)))
                    .collect();
                match Self::decode_event(run_id, &fields) {
                    Ok(event) => decoded.push((id.id, event)),
                    Err(e) => decode_errors.push(e.to_string()),
                }
            }
        }
        (decoded, decode_errors)
    }

    fn should_set_ttl(&self, is_terminal: bool) -> bool {
        match self.config.ttl_policy {
            TtlPolicy::OnFirstPublish | TtlPolicy::OnEveryPublish => true,
            TtlPolicy::OnTerminal => is_terminal,
        }
    }
}

#[async_trait]
impl EventBus for RedisBackend {
    /// Commits the stream append, the run-record hash update, the runs
    /// index, and the TTL refresh as one `MULTI`/`EXEC` transaction — spec
    /// §4.5/§5 require the terminal-event-plus-status-change to be a single
    /// logical commit, and for the Redis backend specifically that means no
    /// partial write can leave `dockrion:run:{run_id}` stale relative to
    /// `dockrion:stream:{run_id}`'s actual contents after a dropped
    /// connection.
    async fn publish(&self, run_id: &RunId, event: Event) -> Result<(), BusError> {
        let mut conn = self.write_conn.clone();
        let key = stream_key(run_id);
        let fields = Self::encode_fields(&event)?;
        let hash_fields = Self::run_hash_fields(&event);
        let is_terminal = event.event_type.is_terminal();
        let maxlen = StreamMaxlen::Approx(self.config.max_events_per_run);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.xadd_maxlen(&key, maxlen, "*", &fields).ignore();
        pipe.hset_multiple(run_key(run_id), &hash_fields).ignore();

        if self.config.ttl_policy != TtlPolicy::OnEveryPublish || event.sequence == 0 {
            pipe.zadd(RUNS_INDEX_KEY, run_id.as_str(), event.timestamp.timestamp()).ignore();
        }

        if self.should_set_ttl(is_terminal) {
            let seconds = self.config.stream_ttl.as_secs() as i64;
            pipe.expire(&key, seconds).ignore();
            pipe.expire(run_key(run_id), seconds).ignore();
        }

        let _: () = pipe.query_async(&mut conn).await.map_err(|e| classify_redis_err(run_id, e))?;

        tracing::debug!(run_id = %run_id, sequence = event.sequence, "published event to redis stream");
        Ok(())
    }

    async fn subscribe(
        &self,
        run_id: &RunId,
        from_sequence: i64,
        include_historical: bool,
    ) -> Result<EventStream, BusError> {
        let key = stream_key(run_id);
        let mut read_conn = self.read_conn();
        let run_id = run_id.clone();

        let stream = async_stream::try_stream! {
            let mut last_id = "0".to_string();
            let mut saw_terminal = false;

            if include_historical {
                loop {
                    let reply: StreamReadReply = read_conn
                        .xread_options(&[&key], &[last_id.as_str()], &StreamReadOptions::default().count(500))
                        .await
                        .map_err(|e| classify_redis_err(&run_id, e))?;

                    let (decoded, errors) = Self::decode_reply(&run_id, reply);
                    for e in errors {
                        tracing::warn!(run_id = %run_id, error = %e, "skipping undecodable event during backfill");
                    }
                    if decoded.is_empty() {
                        break;
                    }
                    for (stream_id, event) in decoded {
                        last_id = stream_id;
                        if event.event_type.is_terminal() {
                            saw_terminal = true;
                        }
                        if event.sequence >= from_sequence {
                            yield event;
                        }
                    }
                }
            } else {
                // Position at the live tail without replaying history.
                let reply: StreamReadReply = read_conn
                    .xrevrange_count(&key, "+", "-", 1)
                    .await
                    .map_err(|e| classify_redis_err(&run_id, e))?;
                if let Some(last_key) = reply.keys.into_iter().next() {
                    if let Some(last) = last_key.ids.into_iter().next() {
                        last_id = last.id;
                    }
                }
            }

            if saw_terminal {
                return;
            }

            loop {
                let reply: StreamReadReply = read_conn
                    .xread_options(
                        &[&key],
                        &[last_id.as_str()],
                        &StreamReadOptions::default().count(100).block(5_000),
                    )
                    .await
                    .map_err(|e| classify_redis_err(&run_id, e))?;

                let (decoded, errors) = Self::decode_reply(&run_id, reply);
                for e in errors {
                    tracing::warn!(run_id = %run_id, error = %e, "skipping undecodable event during live tail");
                }
                let mut terminated = false;
                for (stream_id, event) in decoded {
                    last_id = stream_id;
                    if event.event_type.is_terminal() {
                        terminated = true;
                    }
                    yield event;
                }
                if terminated {
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
        let key = stream_key(run_id);
        let mut conn = self.read_conn();

        let reply: StreamReadReply = conn
            .xread_options(&[&key], &["0"], &StreamReadOptions::default().count(10_000))
            .await
            .map_err(|e| classify_redis_err(run_id, e))?;

        let (decoded, errors) = Self::decode_reply(run_id, reply);
        for e in errors {
            tracing::warn!(run_id = %run_id, error = %e, "skipping undecodable event");
        }

        let mut events: Vec<Event> = decoded
            .into_iter()
            .map(|(_, event)| event)
            .filter(|e| e.sequence >= from_sequence)
            .collect();
        if let Some(limit) = limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn trim(&self, run_id: &RunId) -> Result<(), BusError> {
        let mut conn = self.write_conn.clone();
        let _: () = conn.del(stream_key(run_id)).await.map_err(|e| classify_redis_err(run_id, e))?;
        let _: () = conn.del(run_key(run_id)).await.map_err(|e| classify_redis_err(run_id, e))?;
        let _: () = conn
            .zrem(RUNS_INDEX_KEY, run_id.as_str())
            .await
            .map_err(|e| classify_redis_err(run_id, e))?;
        Ok(())
    }
}
