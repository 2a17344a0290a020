//! Configuration (spec §6, expanded in SPEC_FULL.md §2.1/§6).
//!
//! A single immutable [`CoreConfig`] record, loaded once at startup from
//! environment variables, following the `Config::from_env()` convention this
//! crate is grounded on: `dotenvy::dotenv().ok()` then `env::var(...)` reads
//! with typed parsing and defaults, never a mutable global.

use std::env;
use std::time::Duration;

use crate::filter::EventsFilter;

/// Which [`crate::bus::EventBus`] backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    InMemory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
    pub preset: String,
    pub custom_mode: String,
    /// Explicit allow-list from `DOCKRION_EVENTS_ALLOWED`, bypassing
    /// `preset`/`custom_mode` entirely when present.
    pub allowed: Option<Vec<String>>,
}

impl EventsConfig {
    /// Resolves this config into a concrete [`EventsFilter`].
    pub fn to_filter(&self) -> EventsFilter {
        if let Some(allowed) = &self.allowed {
            return EventsFilter::explicit(allowed);
        }

        let mut filter = EventsFilter::from_preset_name(&self.preset).unwrap_or_else(EventsFilter::chat);
        if self.custom_mode == "all" {
            // Re-derive with custom:* enabled on top of the chosen preset's configurable set.
            filter = match self.preset.as_str() {
                "minimal" => EventsFilter::explicit(["custom"]),
                "chat" => EventsFilter::explicit(["token", "step", "heartbeat", "custom"]),
                _ => EventsFilter::debug(),
            };
        }
        filter
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub heartbeat_interval: Duration,
    pub max_run_duration: Duration,
    pub cancel_grace: Duration,
    pub stream_ttl: Duration,
    pub max_events_per_run: usize,
}

/// The crate's single immutable configuration record.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub backend: BackendKind,
    pub redis: RedisConfig,
    pub events: EventsConfig,
    pub run: RunConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DOCKRION_BACKEND must be 'in_memory' or 'redis', got: {0}")]
    InvalidBackend(String),

    #[error("REDIS_URL is required when DOCKRION_BACKEND=redis")]
    MissingRedisUrl,

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

impl CoreConfig {
    /// Loads configuration from environment variables, applying the
    /// defaults listed in SPEC_FULL.md §6. Fails fast on malformed values
    /// rather than deferring the error to first use.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let backend = match env::var("DOCKRION_BACKEND").ok().as_deref() {
            None | Some("in_memory") => BackendKind::InMemory,
            Some("redis") => BackendKind::Redis,
            Some(other) => return Err(ConfigError::InvalidBackend(other.to_string())),
        };

        let redis_url = env::var("REDIS_URL").unwrap_or_default();
        if backend == BackendKind::Redis && redis_url.is_empty() {
            return Err(ConfigError::MissingRedisUrl);
        }

        let connection_pool_size = parse_env("REDIS_CONNECTION_POOL_SIZE", 10)?;
        let stream_ttl_seconds: u64 = parse_env("DOCKRION_STREAM_TTL_SECONDS", 3600)?;
        let max_events_per_run = parse_env("DOCKRION_MAX_EVENTS_PER_RUN", 1000)?;
        let heartbeat_interval_secs: u64 = parse_env("DOCKRION_HEARTBEAT_INTERVAL_SECS", 15)?;
        let max_run_duration_secs: u64 = parse_env("DOCKRION_MAX_RUN_DURATION_SECS", 3600)?;
        let cancel_grace_seconds: u64 = parse_env("DOCKRION_CANCEL_GRACE_SECONDS", 30)?;

        let preset = env::var("DOCKRION_EVENTS_PRESET").unwrap_or_else(|_| "chat".to_string());
        let custom_mode = env::var("DOCKRION_EVENTS_CUSTOM_MODE").unwrap_or_else(|_| "none".to_string());
        let allowed = env::var("DOCKRION_EVENTS_ALLOWED").ok().map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        });

        Ok(Self {
            backend,
            redis: RedisConfig {
                url: redis_url,
                connection_pool_size,
            },
            events: EventsConfig { preset, custom_mode, allowed },
            run: RunConfig {
                heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
                max_run_duration: Duration::from_secs(max_run_duration_secs),
                cancel_grace: Duration::from_secs(cancel_grace_seconds),
                stream_ttl: Duration::from_secs(stream_ttl_seconds),
                max_events_per_run,
            },
        })
    }

    /// A configuration suitable for tests: in-memory backend, generous timeouts.
    #[cfg(any(test, feature = "test-util"))]
    pub fn default_for_test() -> Self {
        Self {
            backend: BackendKind::InMemory,
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                connection_pool_size: 10,
            },
            events: EventsConfig {
                preset: "chat".to_string(),
                custom_mode: "none".to_string(),
                allowed: None,
            },
            run: RunConfig {
                heartbeat_interval: Duration::from_secs(15),
                max_run_duration: Duration::from_secs(3600),
                cancel_grace: Duration::from_secs(30),
                stream_ttl: Duration::from_secs(3600),
                max_events_per_run: 1000,
            },
        }
    }
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue { field: key, value: raw }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_for_test_uses_in_memory_backend() {
        let config = CoreConfig::default_for_test();
        assert_eq!(config.backend, BackendKind::InMemory);
        assert_eq!(config.run.max_events_per_run, 1000);
    }

    #[test]
    fn events_config_resolves_known_preset() {
        let events = EventsConfig {
            preset: "minimal".to_string(),
            custom_mode: "none".to_string(),
            allowed: None,
        };
        let filter = events.to_filter();
        assert!(!filter.is_allowed(&crate::event::EventType::Progress));
    }

    #[test]
    fn events_config_allowed_list_overrides_preset_and_custom_mode() {
        let events = EventsConfig {
            preset: "minimal".to_string(),
            custom_mode: "none".to_string(),
            allowed: Some(vec!["token".to_string(), "custom:fraud_check".to_string()]),
        };
        let filter = events.to_filter();
        assert!(filter.is_allowed(&crate::event::EventType::Token));
        assert!(!filter.is_allowed(&crate::event::EventType::Progress));
        assert!(filter.is_allowed(&crate::event::EventType::Custom("fraud_check".to_string())));
        assert!(!filter.is_allowed(&crate::event::EventType::Custom("other".to_string())));
    }
}
