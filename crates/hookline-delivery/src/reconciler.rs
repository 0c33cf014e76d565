//! Requeue reconciler.
//!
//! Periodically pages the ledger for attempts that are due but were never
//! handed to the queue and enqueues them. This is what recovers work after a
//! lost enqueue or attempts deferred past the pre-schedule window. After a
//! wiped queue, [`Reconciler::reclaim_queued`] first turns the orphaned
//! `Queued` attempts back into sweepable ones. Several processes may run it at once: duplicate adds are absorbed
//! by the queue and handlers are idempotent against the ledger.

use std::{sync::Arc, time::Duration};

use hookline_core::Clock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{engine::StatsCounters, error::Result, scheduler::TaskScheduler, storage::Ledger};

/// Reconciler settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Attempts fetched per ledger page.
    pub batch_size: usize,
    /// Time between sweeps.
    pub interval: Duration,
    /// Attempts younger than this are left to their normal enqueue.
    pub min_age: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { batch_size: 20, interval: Duration::from_secs(60), min_age: Duration::from_secs(60) }
    }
}

/// Re-injects due, unqueued attempts into the task queue.
pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    scheduler: Arc<TaskScheduler>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    stats: Arc<StatsCounters>,
}

impl Reconciler {
    /// Creates a reconciler.
    pub fn new(
        ledger: Arc<dyn Ledger>,
        scheduler: Arc<TaskScheduler>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self { ledger, scheduler, clock, config, stats }
    }

    /// Sweeps on the configured interval until `token` is cancelled.
    ///
    /// The first sweep starts after a random delay within one interval so
    /// processes started together do not sweep in lockstep.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX);
        let jitter = Duration::from_millis(rand::rng().random_range(0..interval_ms.max(1)));

        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            first_sweep_in_ms = jitter.as_millis(),
            "requeue reconciler starting"
        );

        tokio::select! {
            () = token.cancelled() => return Ok(()),
            () = self.clock.sleep(jitter) => {},
        }

        loop {
            match self.run_once().await {
                Ok(0) => debug!("requeue sweep found nothing"),
                Ok(requeued) => info!(requeued, "requeued unqueued attempts"),
                Err(e) => error!(error = %e, "requeue sweep aborted"),
            }

            tokio::select! {
                () = token.cancelled() => break,
                () = self.clock.sleep(self.config.interval) => {},
            }
        }

        info!("requeue reconciler stopped");
        Ok(())
    }

    /// Hands every `Queued` attempt back to the sweep. Call this before the
    /// first sweep when the queue starts empty, so tasks lost with the
    /// previous queue are enqueued again.
    ///
    /// # Errors
    ///
    /// Returns the ledger error.
    pub async fn reclaim_queued(&self) -> Result<u64> {
        let reclaimed = self.ledger.reset_queued().await?;
        if reclaimed > 0 {
            info!(reclaimed, "queued attempts returned to the ledger backlog");
        }
        Ok(reclaimed)
    }

    /// Runs one sweep, paging until a short page. Returns the number of
    /// attempts marked queued.
    ///
    /// # Errors
    ///
    /// Returns the first ledger or queue error; the sweep stops there and the
    /// next tick starts over.
    pub async fn run_once(&self) -> Result<u64> {
        let min_age = chrono::Duration::from_std(self.config.min_age).unwrap_or(chrono::Duration::MAX);
        let mut requeued = 0;

        loop {
            let now = self.clock.now_utc();
            let created_before = now.checked_sub_signed(min_age).unwrap_or(now);
            let batch =
                self.ledger.list_unqueued(self.config.batch_size, now, created_before).await?;
            let fetched = batch.len();

            if fetched > 0 {
                let changed = self.scheduler.enqueue(&batch).await?;
                if changed < u64::try_from(fetched).unwrap_or(u64::MAX) {
                    warn!(fetched, changed, "some attempts changed state during requeue");
                }
                requeued += changed;
                self.stats.record_requeued(changed);
            }

            if fetched == 0 || fetched < self.config.batch_size {
                break;
            }
        }

        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use hookline_core::{
        Attempt, AttemptStatus, Endpoint, EndpointId, EndpointRetry, Event, EventId, HttpMethod,
        TestClock, WorkspaceId,
    };

    use super::*;
    use crate::{
        queue::{InMemoryTaskQueue, TaskQueue},
        storage::mock::{LedgerOp, MockLedger},
    };

    struct Fixture {
        clock: TestClock,
        queue: Arc<InMemoryTaskQueue>,
        ledger: MockLedger,
        reconciler: Reconciler,
        event: Event,
        endpoint: Endpoint,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let clock = TestClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = Arc::new(InMemoryTaskQueue::new(shared.clone()));
        let ledger = MockLedger::new();
        let scheduler =
            Arc::new(TaskScheduler::new(queue.clone(), Arc::new(ledger.clone()), shared.clone()));
        let reconciler = Reconciler::new(
            Arc::new(ledger.clone()),
            scheduler,
            shared,
            ReconcilerConfig { batch_size, ..ReconcilerConfig::default() },
            Arc::new(StatsCounters::default()),
        );
        let now = clock.now_utc();
        let workspace_id = WorkspaceId::new();
        let endpoint = Endpoint {
            id: EndpointId::new(),
            workspace_id,
            name: None,
            url: "https://example.com".to_string(),
            method: HttpMethod::Post,
            headers: Default::default(),
            timeout_ms: 1000,
            enabled: true,
            retry: EndpointRetry::default(),
            created_at: now,
            updated_at: now,
        };
        let event = Event { id: EventId::new(), workspace_id, data: b"{}".to_vec(), created_at: now };
        Fixture { clock, queue, ledger, reconciler, event, endpoint }
    }

    async fn stale_attempt(f: &Fixture) -> Attempt {
        let attempt = Attempt::first(&f.event, &f.endpoint, f.clock.now_utc());
        f.ledger.add_attempt(attempt.clone()).await;
        attempt
    }

    #[tokio::test]
    async fn pages_through_backlog() {
        let f = fixture(2);
        for _ in 0..5 {
            stale_attempt(&f).await;
        }
        f.clock.advance(Duration::from_secs(120));

        assert_eq!(f.reconciler.run_once().await.unwrap(), 5);
        assert_eq!(f.queue.size().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn young_attempts_are_left_alone() {
        let f = fixture(20);
        let attempt = stale_attempt(&f).await;
        f.clock.advance(Duration::from_secs(10));

        assert_eq!(f.reconciler.run_once().await.unwrap(), 0);
        assert_eq!(f.ledger.attempt(attempt.id).await.unwrap().status, AttemptStatus::Init);
    }

    #[tokio::test]
    async fn list_failure_aborts_sweep() {
        let f = fixture(20);
        stale_attempt(&f).await;
        f.clock.advance(Duration::from_secs(120));
        f.ledger.fail_on(LedgerOp::ListUnqueued).await;

        assert!(f.reconciler.run_once().await.is_err());
        assert!(f.queue.is_empty().await);

        f.ledger.clear_failures().await;
        assert_eq!(f.reconciler.run_once().await.unwrap(), 1);
    }
}
