//! The event model (spec §3.1).
//!
//! An [`Event`] is an immutable record of one happening within a run. Events
//! are constructed through the typed helpers below (`Event::started`,
//! `Event::progress`, ...) rather than built from a bare payload, so that the
//! required/optional field table in the spec is enforced by the type
//! checker at the call site instead of by runtime validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::ids::RunId;

/// The event kind. `Custom` carries the `<name>` suffix of `custom:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Started,
    Progress,
    Checkpoint,
    Token,
    Step,
    Complete,
    Error,
    Cancelled,
    Heartbeat,
    Custom(String),
}

impl EventType {
    /// The four types that every [`crate::filter::EventsFilter`] allows
    /// regardless of configuration.
    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            EventType::Started | EventType::Complete | EventType::Error | EventType::Cancelled
        )
    }

    /// One of `{complete, error, cancelled}` — exactly one is ever stored per run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Complete | EventType::Error | EventType::Cancelled)
    }

    pub fn as_custom_name(&self) -> Option<&str> {
        match self {
            EventType::Custom(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Started => write!(f, "started"),
            EventType::Progress => write!(f, "progress"),
            EventType::Checkpoint => write!(f, "checkpoint"),
            EventType::Token => write!(f, "token"),
            EventType::Step => write!(f, "step"),
            EventType::Complete => write!(f, "complete"),
            EventType::Error => write!(f, "error"),
            EventType::Cancelled => write!(f, "cancelled"),
            EventType::Heartbeat => write!(f, "heartbeat"),
            EventType::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = EventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "started" => EventType::Started,
            "progress" => EventType::Progress,
            "checkpoint" => EventType::Checkpoint,
            "token" => EventType::Token,
            "step" => EventType::Step,
            "complete" => EventType::Complete,
            "error" => EventType::Error,
            "cancelled" => EventType::Cancelled,
            "heartbeat" => EventType::Heartbeat,
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => EventType::Custom(name.to_string()),
                _ => return Err(EventTypeParseError(other.to_string())),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized event type: {0}")]
pub struct EventTypeParseError(String);

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An immutable, strictly-ordered record of one happening within a run.
///
/// `payload` is kept as a JSON object rather than a tagged enum of payload
/// structs so `custom:<name>` events stay open-ended; the per-type
/// constructors below are what actually enforces the required/optional
/// field table in the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub run_id: String,
    pub sequence: i64,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Value,
}

impl Event {
    /// Builds an event with the given type and payload, stamped with
    /// `run_id`/`sequence` by the caller (normally [`crate::context::StreamContext`]).
    pub(crate) fn new(run_id: &RunId, sequence: i64, event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            run_id: run_id.to_string(),
            sequence,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn started(run_id: &RunId, sequence: i64, agent_name: &str, framework: &str, metadata: Option<Value>) -> Self {
        let mut payload = json!({ "agent_name": agent_name, "framework": framework });
        if let Some(metadata) = metadata {
            payload["metadata"] = metadata;
        }
        Self::new(run_id, sequence, EventType::Started, payload)
    }

    pub fn progress(run_id: &RunId, sequence: i64, step: &str, progress: f64, message: Option<&str>) -> Self {
        let mut payload = json!({ "step": step, "progress": progress });
        if let Some(message) = message {
            payload["message"] = json!(message);
        }
        Self::new(run_id, sequence, EventType::Progress, payload)
    }

    pub fn checkpoint(run_id: &RunId, sequence: i64, name: &str, data: Value) -> Self {
        Self::new(
            run_id,
            sequence,
            EventType::Checkpoint,
            json!({ "name": name, "data": data }),
        )
    }

    pub fn token(run_id: &RunId, sequence: i64, content: &str, finish_reason: Option<&str>) -> Self {
        let mut payload = json!({ "content": content });
        if let Some(reason) = finish_reason {
            payload["finish_reason"] = json!(reason);
        }
        Self::new(run_id, sequence, EventType::Token, payload)
    }

    pub fn step(
        run_id: &RunId,
        sequence: i64,
        node_name: &str,
        duration_ms: Option<u64>,
        input_keys: Option<Vec<String>>,
        output_keys: Option<Vec<String>>,
    ) -> Self {
        let mut payload = json!({ "node_name": node_name });
        if let Some(d) = duration_ms {
            payload["duration_ms"] = json!(d);
        }
        if let Some(keys) = input_keys {
            payload["input_keys"] = json!(keys);
        }
        if let Some(keys) = output_keys {
            payload["output_keys"] = json!(keys);
        }
        Self::new(run_id, sequence, EventType::Step, payload)
    }

    pub fn complete(
        run_id: &RunId,
        sequence: i64,
        output: Value,
        latency_seconds: Option<f64>,
        metadata: Option<Value>,
    ) -> Self {
        let mut payload = json!({ "output": output });
        if let Some(latency) = latency_seconds {
            payload["latency_seconds"] = json!(latency);
        }
        if let Some(metadata) = metadata {
            payload["metadata"] = metadata;
        }
        Self::new(run_id, sequence, EventType::Complete, payload)
    }

    pub fn error(run_id: &RunId, sequence: i64, error: &str, code: &str, details: Option<Value>) -> Self {
        let mut payload = json!({ "error": error, "code": code });
        if let Some(details) = details {
            payload["details"] = details;
        }
        Self::new(run_id, sequence, EventType::Error, payload)
    }

    pub fn cancelled(run_id: &RunId, sequence: i64, reason: Option<&str>) -> Self {
        let payload = match reason {
            Some(reason) => json!({ "reason": reason }),
            None => json!({}),
        };
        Self::new(run_id, sequence, EventType::Cancelled, payload)
    }

    pub fn heartbeat(run_id: &RunId, sequence: i64) -> Self {
        Self::new(run_id, sequence, EventType::Heartbeat, json!({}))
    }

    pub fn custom(run_id: &RunId, sequence: i64, name: &str, data: Value) -> Self {
        Self::new(
            run_id,
            sequence,
            EventType::Custom(name.to_string()),
            json!({ "data": data }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_through_display_and_parse() {
        let types = vec![
            EventType::Started,
            EventType::Progress,
            EventType::Checkpoint,
            EventType::Token,
            EventType::Step,
            EventType::Complete,
            EventType::Error,
            EventType::Cancelled,
            EventType::Heartbeat,
            EventType::Custom("fraud_check".to_string()),
        ];
        for t in types {
            let s = t.to_string();
            let parsed: EventType = s.parse().unwrap();
            assert_eq!(parsed.to_string(), t.to_string());
        }
    }

    #[test]
    fn custom_without_name_fails_to_parse() {
        assert!("custom:".parse::<EventType>().is_err());
        assert!("not-a-type".parse::<EventType>().is_err());
    }

    #[test]
    fn mandatory_and_terminal_classification() {
        assert!(EventType::Started.is_mandatory());
        assert!(!EventType::Started.is_terminal());
        assert!(EventType::Complete.is_mandatory());
        assert!(EventType::Complete.is_terminal());
        assert!(EventType::Cancelled.is_terminal());
        assert!(EventType::Error.is_terminal());
        assert!(!EventType::Progress.is_mandatory());
        assert!(!EventType::Heartbeat.is_mandatory());
    }

    #[test]
    fn json_round_trip_is_field_equal() {
        let run_id = RunId::new("r1");
        let event = Event::progress(&run_id, 1, "a", 0.5, Some("halfway"));
        let json = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(decoded.event_type.to_string(), "progress");
        assert_eq!(decoded.run_id, "r1");
        assert_eq!(decoded.sequence, 1);
        assert_eq!(decoded.payload["step"], json!("a"));
        assert_eq!(decoded.payload["progress"], json!(0.5));
        assert_eq!(decoded.payload["message"], json!("halfway"));
    }

    #[test]
    fn custom_event_serializes_with_custom_prefix() {
        let run_id = RunId::new("r1");
        let event = Event::custom(&run_id, 2, "fraud_check", json!({"score": 0.2}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], json!("custom:fraud_check"));
        assert_eq!(json["data"]["score"], json!(0.2));
    }
}
