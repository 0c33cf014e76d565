//! Delivery engine: wires the worker, scheduler and reconciler together and
//! owns their lifecycle.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use hookline_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::Deliverer,
    error::{DeliveryError, Result},
    plugin::PluginSource,
    queue::TaskQueue,
    reconciler::{Reconciler, ReconcilerConfig},
    scheduler::{TaskScheduler, DEFAULT_PRE_SCHEDULE_WINDOW},
    storage::Ledger,
    worker::{DeliveryWorker, TaskOutcome, WorkerConfig},
};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Poll loop settings.
    pub worker: WorkerConfig,
    /// Reconciler settings.
    pub reconciler: ReconcilerConfig,
    /// How far ahead attempts are pushed to the queue.
    pub pre_schedule_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            pre_schedule_window: DEFAULT_PRE_SCHEDULE_WINDOW,
        }
    }
}

impl EngineConfig {
    /// Checks values the loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.worker.poll_batch_size == 0 {
            return Err(DeliveryError::configuration("worker poll batch size must be positive"));
        }
        if self.worker.poll_interval.is_zero() {
            return Err(DeliveryError::configuration("worker poll interval must be positive"));
        }
        if self.reconciler.batch_size == 0 {
            return Err(DeliveryError::configuration("requeue batch size must be positive"));
        }
        if self.reconciler.interval.is_zero() {
            return Err(DeliveryError::configuration("requeue interval must be positive"));
        }
        Ok(())
    }
}

/// Point-in-time copy of the engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Tasks claimed from the queue.
    pub polled: u64,
    /// Attempts delivered successfully.
    pub succeeded: u64,
    /// Failed attempts that scheduled a retry.
    pub failed: u64,
    /// Attempts canceled before delivery.
    pub canceled: u64,
    /// Failed attempts with no retry left.
    pub exhausted: u64,
    /// Tasks left for redelivery, including panicked handlers.
    pub abandoned: u64,
    /// Tasks dropped as unmatched or already finalized.
    pub discarded: u64,
    /// Attempts requeued by the reconciler.
    pub requeued: u64,
}

/// Shared engine counters.
#[derive(Debug, Default)]
pub struct StatsCounters {
    polled: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    exhausted: AtomicU64,
    abandoned: AtomicU64,
    discarded: AtomicU64,
    requeued: AtomicU64,
}

impl StatsCounters {
    /// Counts a handler outcome.
    pub fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Succeeded => &self.succeeded,
            TaskOutcome::Retried { .. } => &self.failed,
            TaskOutcome::Exhausted => &self.exhausted,
            TaskOutcome::Canceled { .. } => &self.canceled,
            TaskOutcome::AlreadyFinalized | TaskOutcome::Discarded { .. } => &self.discarded,
            TaskOutcome::Abandoned(_) => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts claimed tasks.
    pub fn record_polled(&self, count: usize) {
        self.polled.fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Counts requeued attempts.
    pub fn record_requeued(&self, count: u64) {
        self.requeued.fetch_add(count, Ordering::Relaxed);
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            polled: self.polled.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// Collaborators the engine runs against.
pub struct EngineParts {
    /// Task queue backend.
    pub queue: Arc<dyn TaskQueue>,
    /// Attempt ledger.
    pub ledger: Arc<dyn Ledger>,
    /// Network transport.
    pub deliverer: Arc<dyn Deliverer>,
    /// Per-endpoint plugin pipelines.
    pub plugins: Arc<dyn PluginSource>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Runs the delivery worker and the requeue reconciler.
pub struct DeliveryEngine {
    config: EngineConfig,
    worker: Arc<DeliveryWorker>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<TaskScheduler>,
    stats: Arc<StatsCounters>,
    cancellation_token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl DeliveryEngine {
    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(parts: EngineParts, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(StatsCounters::default());
        let scheduler = Arc::new(
            TaskScheduler::new(parts.queue.clone(), parts.ledger.clone(), parts.clock.clone())
                .with_window(config.pre_schedule_window),
        );
        let worker = Arc::new(DeliveryWorker::new(
            parts.queue,
            parts.ledger.clone(),
            parts.deliverer,
            parts.plugins,
            scheduler.clone(),
            parts.clock.clone(),
            config.worker.clone(),
            stats.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            parts.ledger,
            scheduler.clone(),
            parts.clock,
            config.reconciler.clone(),
            stats.clone(),
        ));

        Ok(Self {
            config,
            worker,
            reconciler,
            scheduler,
            stats,
            cancellation_token: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// Spawns the poll loop and the reconciler. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the engine is already running.
    pub fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(DeliveryError::internal("delivery engine already started"));
        }

        info!(
            poll_batch_size = self.config.worker.poll_batch_size,
            requeue_interval_secs = self.config.reconciler.interval.as_secs(),
            pre_schedule_window_secs = self.config.pre_schedule_window.as_secs(),
            "starting delivery engine"
        );

        let worker = self.worker.clone();
        let token = self.cancellation_token.child_token();
        self.handles.push(("worker", tokio::spawn(worker.run(token))));

        let reconciler = self.reconciler.clone();
        let token = self.cancellation_token.child_token();
        self.handles.push(("reconciler", tokio::spawn(reconciler.run(token))));

        Ok(())
    }

    /// Scheduler for enqueueing new attempts, shared with the engine's loops.
    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        self.scheduler.clone()
    }

    /// Returns the current counters.
    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Runs one reconciler sweep outside the timer.
    ///
    /// # Errors
    ///
    /// Returns the sweep's first ledger or queue error.
    pub async fn reconcile_now(&self) -> Result<u64> {
        self.reconciler.run_once().await
    }

    /// Returns attempts left `Queued` by a previous process to the
    /// reconciler. Only safe while no other process shares the queue, as
    /// with the in-memory backend.
    ///
    /// # Errors
    ///
    /// Returns the ledger error.
    pub async fn reclaim_queued(&self) -> Result<u64> {
        self.reconciler.reclaim_queued().await
    }

    /// Stops polling and waits for in-flight handlers to finish.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] if handlers outlive the
    /// configured shutdown timeout.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.cancellation_token.cancel();

        let mut result = Ok(());
        for (name, handle) in std::mem::take(&mut self.handles) {
            match handle.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    warn!(component = name, error = %e, "component stopped with error");
                    result = Err(e);
                },
                Err(join_error) => {
                    error!(component = name, error = %join_error, "component panicked");
                    result = Err(DeliveryError::HandlerPanic { message: join_error.to_string() });
                },
            }
        }

        info!(stats = ?self.stats.snapshot(), "delivery engine stopped");
        result
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if self.handles.iter().any(|(_, h)| !h.is_finished())
            && !self.cancellation_token.is_cancelled()
        {
            warn!("delivery engine dropped without shutdown; cancelling background tasks");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = EngineConfig::default();
        config.worker.poll_batch_size = 0;
        assert!(matches!(config.validate(), Err(DeliveryError::Configuration { .. })));

        let mut config = EngineConfig::default();
        config.reconciler.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn outcomes_map_to_counters() {
        let stats = StatsCounters::default();
        stats.record(&TaskOutcome::Succeeded);
        stats.record(&TaskOutcome::Canceled { error_code: None });
        stats.record(&TaskOutcome::Abandoned(DeliveryError::queue("down")));
        stats.record(&TaskOutcome::AlreadyFinalized);
        stats.record_polled(4);
        stats.record_requeued(2);

        assert_eq!(
            stats.snapshot(),
            EngineStats {
                polled: 4,
                succeeded: 1,
                canceled: 1,
                abandoned: 1,
                discarded: 1,
                requeued: 2,
                ..EngineStats::default()
            }
        );
    }
}
