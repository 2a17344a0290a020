//! Backend implementations of [`crate::bus::EventBus`] (spec §4.3/§4.4).
//!
//! Backends are swapped by configuration, never by inheritance — both
//! implement the same `EventBus` capability set and nothing more.

pub mod memory;
pub mod redis_streams;

pub use memory::InMemoryBackend;
pub use redis_streams::{RedisBackend, RedisBackendConfig, TtlPolicy};
