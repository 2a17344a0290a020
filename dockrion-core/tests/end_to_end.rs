//! End-to-end scenarios against the in-memory backend, driven through both
//! the raw `EventBus` API and the full `RunManager` lifecycle.

use std::sync::Arc;
use std::time::Duration;

use dockrion_core::backend::InMemoryBackend;
use dockrion_core::config::RunConfig;
use dockrion_core::run::{AgentCallable, AgentError};
use dockrion_core::{Event, EventBus, EventType, EventsFilter, RunManager, RunStatus};
use futures::StreamExt;

fn run_config() -> RunConfig {
    RunConfig {
        heartbeat_interval: Duration::from_millis(50),
        max_run_duration: Duration::from_secs(60),
        cancel_grace: Duration::from_millis(100),
        stream_ttl: Duration::from_secs(3600),
        max_events_per_run: 1000,
    }
}

/// Scenario 1: happy path, in-memory. Status PENDING -> RUNNING -> COMPLETED;
/// delivered sequence is started, progress, token, complete in order.
#[tokio::test]
async fn happy_path_in_memory() {
    let bus = InMemoryBackend::new(1000, Duration::from_secs(3600));
    let manager = RunManager::new(bus.clone(), run_config());
    let run_id = manager.create_run().await;

    let status = manager.get_status(&run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Pending);

    let agent: AgentCallable = Box::new(|ctx, _payload| {
        Box::pin(async move {
            ctx.emit_progress("a", 0.5, None).await.unwrap();
            ctx.emit_token("hi", None).await.unwrap();
            Ok(serde_json::json!({"r": 1}))
        })
    });

    manager
        .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = bus.get_events(&run_id, 0, None).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type.clone()).collect();
    assert_eq!(types, vec![EventType::Started, EventType::Progress, EventType::Token, EventType::Complete]);
    assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    let status = manager.get_status(&run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Completed);
}

/// Scenario 3: reconnect mid-run. A subscriber that dropped off after seq 2
/// reconnects at from_sequence=3 and observes 3..=8 including the terminal.
#[tokio::test]
async fn reconnect_mid_run_continues_from_requested_sequence() {
    let bus = InMemoryBackend::new(1000, Duration::from_secs(3600));
    let run_id = dockrion_core::RunId::new("r3");

    for seq in 0..=4 {
        bus.publish(&run_id, Event::progress(&run_id, seq, "s", 0.1, None)).await.unwrap();
    }

    // Subscriber A received 0..=2 then disconnected; nothing further to
    // simulate here beyond dropping the first stream.
    drop(bus.subscribe(&run_id, 0, true).await.unwrap());

    bus.publish(&run_id, Event::progress(&run_id, 5, "s", 0.1, None)).await.unwrap();
    bus.publish(&run_id, Event::progress(&run_id, 6, "s", 0.1, None)).await.unwrap();
    bus.publish(&run_id, Event::progress(&run_id, 7, "s", 0.1, None)).await.unwrap();
    bus.publish(&run_id, Event::complete(&run_id, 8, serde_json::json!({}), None, None)).await.unwrap();

    let mut stream = bus.subscribe(&run_id, 3, true).await.unwrap();
    let mut sequences = Vec::new();
    while let Some(event) = stream.next().await {
        sequences.push(event.unwrap().sequence);
    }
    assert_eq!(sequences, vec![3, 4, 5, 6, 7, 8]);
}

/// Scenario 4: cancellation. Client cancels; the agent observes it and the
/// run settles to a terminal status well inside cancel_grace.
#[tokio::test]
async fn cancellation_settles_within_grace_period() {
    let bus = InMemoryBackend::new(1000, Duration::from_secs(3600));
    let manager = RunManager::new(bus.clone(), run_config());
    let run_id = manager.create_run().await;

    let agent: AgentCallable = Box::new(|ctx, _payload| {
        Box::pin(async move {
            ctx.emit_progress("working", 0.1, None).await.unwrap();
            ctx.cancelled().await;
            Err(AgentError { message: "cancelled".to_string(), code: "cancelled".to_string() })
        })
    });

    manager
        .start(run_id.clone(), "agent", "custom", EventsFilter::debug(), serde_json::json!({}), agent)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.cancel(&run_id, Some("client".to_string())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = manager.get_status(&run_id).await.unwrap();
    assert!(matches!(status.status, RunStatus::Failed | RunStatus::Cancelled));

    let events = bus.get_events(&run_id, 0, None).await.unwrap();
    assert!(events.last().unwrap().event_type.is_terminal());
}

/// Scenario 5: filter `minimal` drops progress/token; delivered sequences
/// stay dense over just started and complete.
#[tokio::test]
async fn minimal_filter_drops_non_mandatory_events() {
    let bus = InMemoryBackend::new(1000, Duration::from_secs(3600));
    let manager = RunManager::new(bus.clone(), run_config());
    let run_id = manager.create_run().await;

    let agent: AgentCallable = Box::new(|ctx, _payload| {
        Box::pin(async move {
            ctx.emit_progress("a", 0.5, None).await.unwrap();
            ctx.emit_token("hi", None).await.unwrap();
            Ok(serde_json::json!({}))
        })
    });

    manager
        .start(run_id.clone(), "agent", "custom", EventsFilter::minimal(), serde_json::json!({}), agent)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = bus.get_events(&run_id, 0, None).await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type.clone()).collect();
    assert_eq!(types, vec![EventType::Started, EventType::Complete]);
    assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![0, 1]);
}

/// Scenario 6: overflow. max_events_per_run=5, 10 non-mandatory events plus a
/// terminal; replay keeps the 4 most recent non-mandatory plus the terminal.
#[tokio::test]
async fn overflow_keeps_newest_non_mandatory_and_the_terminal() {
    let bus = InMemoryBackend::new(5, Duration::from_secs(3600));
    let run_id = dockrion_core::RunId::new("r6");

    bus.publish(&run_id, Event::started(&run_id, 0, "agent", "custom", None)).await.unwrap();
    for seq in 1..=10 {
        bus.publish(&run_id, Event::progress(&run_id, seq, "s", 0.1, None)).await.unwrap();
    }
    bus.publish(&run_id, Event::complete(&run_id, 11, serde_json::json!({}), None, None)).await.unwrap();

    let events = bus.get_events(&run_id, 0, None).await.unwrap();
    assert_eq!(events.len(), 5);
    assert_eq!(events.first().unwrap().event_type, EventType::Started);
    assert_eq!(events.last().unwrap().event_type, EventType::Complete);
    assert_eq!(events[events.len() - 2].sequence, 10);
}
