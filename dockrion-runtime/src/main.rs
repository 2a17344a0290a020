//! # dockrion-runtime
//!
//! Standalone process harness for `dockrion-core`. It owns no HTTP surface
//! of its own (out of scope for this crate) — it wires configuration, the
//! configured `EventBus` backend, and `RunManager` together the way a host
//! application would, and drives a couple of demo runs through them so the
//! wiring can be exercised end to end from a single binary.
//!
//! ```bash
//! cargo run -p dockrion-runtime
//! ```

use std::sync::Arc;

use dockrion_core::backend::{InMemoryBackend, RedisBackend, RedisBackendConfig, TtlPolicy};
use dockrion_core::config::BackendKind;
use dockrion_core::run::{AgentCallable, AgentError};
use dockrion_core::{CoreConfig, EventBus, EventsFilter, RunManager};
use futures::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "dockrion_runtime=info,dockrion_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("dockrion-runtime v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = CoreConfig::from_env()?;
    let bus = build_bus(&config).await?;
    let filter = config.events.to_filter();
    let manager = RunManager::new(bus.clone(), config.run.clone());

    run_demo(&manager, &bus, filter.clone(), "greeter", echo_agent("hello from dockrion")).await?;
    run_demo(&manager, &bus, filter, "failer", failing_agent("simulated adapter failure")).await?;

    tracing::info!("demo runs complete, waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, exiting");

    Ok(())
}

async fn build_bus(config: &CoreConfig) -> anyhow::Result<Arc<dyn EventBus>> {
    match config.backend {
        BackendKind::InMemory => {
            tracing::info!("using in-memory event bus");
            Ok(InMemoryBackend::new(config.run.max_events_per_run, config.run.stream_ttl))
        }
        BackendKind::Redis => {
            tracing::info!(url = %sanitize_redis_url(&config.redis.url), "using Redis Streams event bus");
            let redis_config = RedisBackendConfig {
                url: config.redis.url.clone(),
                connection_pool_size: config.redis.connection_pool_size,
                stream_ttl: config.run.stream_ttl,
                max_events_per_run: config.run.max_events_per_run,
                ttl_policy: TtlPolicy::OnTerminal,
            };
            let backend = RedisBackend::connect(redis_config).await?;
            Ok(Arc::new(backend))
        }
    }
}

fn sanitize_redis_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => format!("redis://***@{host}"),
        None => url.to_string(),
    }
}

async fn run_demo(manager: &Arc<RunManager>, bus: &Arc<dyn EventBus>, filter: EventsFilter, agent_name: &str, agent: AgentCallable) -> anyhow::Result<()> {
    let run_id = manager.create_run().await;
    tracing::info!(run_id = %run_id, agent = agent_name, "starting demo run");

    manager
        .start(run_id.clone(), agent_name, "dockrion-demo", filter, serde_json::json!({}), agent)
        .await?;

    let mut stream = bus.subscribe(&run_id, 0, true).await?;
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => tracing::info!(run_id = %run_id, sequence = event.sequence, event_type = %event.event_type, "event"),
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "event stream error");
                break;
            }
        }
    }

    let status = manager.get_status(&run_id).await?;
    tracing::info!(run_id = %run_id, status = %status.status, "demo run finished");
    Ok(())
}

fn echo_agent(message: &'static str) -> AgentCallable {
    Box::new(move |ctx, _payload| {
        Box::pin(async move {
            ctx.emit_progress("greeting", 0.5, Some(message)).await.ok();
            Ok(serde_json::json!({ "message": message }))
        })
    })
}

fn failing_agent(reason: &'static str) -> AgentCallable {
    Box::new(move |_ctx, _payload| {
        Box::pin(async move {
            Err(AgentError {
                message: reason.to_string(),
                code: "demo_failure".to_string(),
            })
        })
    })
}
