//! Engine lifecycle against the real clock.

use std::{sync::Arc, time::Duration};

use anyhow::{ensure, Result};
use hookline_core::{Attempt, AttemptStatus, Clock, RealClock, WorkspaceId};
use hookline_delivery::{
    plugin::NoPlugins, queue::InMemoryTaskQueue, storage::mock::MockLedger, DeliveryEngine,
    EngineConfig, EngineParts, Ledger, ReconcilerConfig, WorkerConfig,
};
use hookline_testing::{EndpointBuilder, EventBuilder, ScriptedDeliverer};

struct Harness {
    engine: DeliveryEngine,
    ledger: MockLedger,
    deliverer: ScriptedDeliverer,
    clock: Arc<dyn Clock>,
    workspace_id: WorkspaceId,
}

fn harness() -> Result<Harness> {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let ledger = MockLedger::new();
    let deliverer = ScriptedDeliverer::new();
    let parts = EngineParts {
        queue: Arc::new(InMemoryTaskQueue::new(clock.clone())),
        ledger: Arc::new(ledger.clone()),
        deliverer: Arc::new(deliverer.clone()),
        plugins: Arc::new(NoPlugins),
        clock: clock.clone(),
    };
    let config = EngineConfig {
        worker: WorkerConfig {
            poll_interval: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        },
        reconciler: ReconcilerConfig {
            interval: Duration::from_millis(50),
            min_age: Duration::ZERO,
            ..ReconcilerConfig::default()
        },
        ..EngineConfig::default()
    };
    let engine = DeliveryEngine::new(parts, config)?;
    Ok(Harness { engine, ledger, deliverer, clock, workspace_id: WorkspaceId::new() })
}

async fn record_attempt(h: &Harness) -> Attempt {
    let now = h.clock.now_utc();
    let endpoint = EndpointBuilder::new(h.workspace_id).build(now);
    let event = EventBuilder::new(h.workspace_id).build(now);
    h.ledger.add_endpoint(endpoint.clone()).await;
    h.ledger.add_event(event.clone()).await;
    let attempt = Attempt::first(&event, &endpoint, now);
    h.ledger.add_attempt(attempt.clone()).await;
    attempt
}

async fn wait_for_status(h: &Harness, attempt: &Attempt, status: AttemptStatus) -> Result<()> {
    for _ in 0..200 {
        if h.ledger.attempt(attempt.id).await.map(|a| a.status) == Some(status) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("attempt {} never reached {status}", attempt.id)
}

#[tokio::test]
async fn scheduled_attempt_is_delivered_and_engine_stops_cleanly() -> Result<()> {
    let mut h = harness()?;
    h.engine.start()?;

    let attempt = record_attempt(&h).await;
    h.engine.scheduler().schedule(std::slice::from_ref(&attempt)).await?;

    wait_for_status(&h, &attempt, AttemptStatus::Success).await?;
    ensure!(h.deliverer.call_count().await == 1, "expected exactly one delivery");

    let stats = h.engine.stats();
    assert!(stats.polled >= 1);
    h.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn reconciler_picks_up_attempts_never_enqueued() -> Result<()> {
    let mut h = harness()?;
    let attempt = record_attempt(&h).await;

    h.engine.start()?;
    wait_for_status(&h, &attempt, AttemptStatus::Success).await?;

    assert!(h.engine.stats().requeued >= 1);
    h.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn attempts_queued_by_a_previous_process_are_delivered_after_reclaim() -> Result<()> {
    let mut h = harness()?;
    let attempt = record_attempt(&h).await;
    // left Queued by a process whose in-memory queue is gone
    h.ledger.update_status(vec![attempt.id], AttemptStatus::Queued).await?;

    assert_eq!(h.engine.reclaim_queued().await?, 1);
    h.engine.start()?;
    wait_for_status(&h, &attempt, AttemptStatus::Success).await?;

    h.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn starting_twice_is_rejected() -> Result<()> {
    let mut h = harness()?;
    h.engine.start()?;
    assert!(h.engine.start().is_err());
    h.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let parts = EngineParts {
        queue: Arc::new(InMemoryTaskQueue::new(clock.clone())),
        ledger: Arc::new(MockLedger::new()),
        deliverer: Arc::new(ScriptedDeliverer::new()),
        plugins: Arc::new(NoPlugins),
        clock,
    };
    let config = EngineConfig {
        worker: WorkerConfig { poll_batch_size: 0, ..WorkerConfig::default() },
        ..EngineConfig::default()
    };

    assert!(DeliveryEngine::new(parts, config).is_err());
}
