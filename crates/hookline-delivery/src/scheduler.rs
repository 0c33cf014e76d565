//! Hands ledger attempts to the task queue.
//!
//! Every path that puts work on the queue goes through [`TaskScheduler`]:
//! the worker when it creates a successor, the reconciler when it recovers
//! unqueued attempts, and the ingestion side when it records first attempts.
//! An attempt is marked `Queued` only after the queue accepted its task.

use std::{sync::Arc, time::Duration};

use hookline_core::{Attempt, AttemptStatus, Clock};
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    error::Result,
    queue::{TaskMessage, TaskPayload, TaskQueue},
    storage::Ledger,
};

/// Attempts scheduled further out than this stay `Init` until the reconciler
/// finds them due.
pub const DEFAULT_PRE_SCHEDULE_WINDOW: Duration = Duration::from_secs(180);

/// Result of [`TaskScheduler::schedule`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    /// Attempts whose tasks were added to the queue.
    pub enqueued: usize,
    /// Attempts left for the reconciler.
    pub deferred: usize,
    /// Ledger rows flipped to `Queued`.
    pub marked_queued: u64,
}

/// Enqueues attempts and marks them queued.
pub struct TaskScheduler {
    queue: Arc<dyn TaskQueue>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    window: Duration,
    wake: Arc<Notify>,
}

impl TaskScheduler {
    /// Creates a scheduler with the default pre-schedule window.
    pub fn new(queue: Arc<dyn TaskQueue>, ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, ledger, clock, window: DEFAULT_PRE_SCHEDULE_WINDOW, wake: Arc::new(Notify::new()) }
    }

    /// Sets how far ahead attempts are pushed to the queue.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Returns the pre-schedule window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Returns the notification fired when an attempt due now is enqueued.
    ///
    /// At most one wake-up is stored while nobody is waiting.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Enqueues the attempts that fall inside the pre-schedule window.
    ///
    /// # Errors
    ///
    /// Returns a queue or ledger error. Attempts are marked `Queued` only if
    /// the queue accepted them, so a failure leaves them for the reconciler.
    pub async fn schedule(&self, attempts: &[Attempt]) -> Result<ScheduleReport> {
        let now = self.clock.now_utc();
        let horizon = chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(now);

        let (ready, deferred): (Vec<Attempt>, Vec<Attempt>) =
            attempts.iter().cloned().partition(|a| a.scheduled_at <= horizon);

        if !deferred.is_empty() {
            debug!(count = deferred.len(), "attempts deferred past pre-schedule window");
        }

        let marked_queued = self.enqueue(&ready).await?;

        if ready.iter().any(|a| a.scheduled_at <= now) {
            self.wake.notify_one();
        }

        Ok(ScheduleReport { enqueued: ready.len(), deferred: deferred.len(), marked_queued })
    }

    /// Adds tasks for `attempts` regardless of their schedule and marks them
    /// `Queued`. Returns the number of ledger rows changed.
    ///
    /// # Errors
    ///
    /// Returns a queue or ledger error.
    pub async fn enqueue(&self, attempts: &[Attempt]) -> Result<u64> {
        if attempts.is_empty() {
            return Ok(0);
        }

        let tasks = attempts.iter().map(task_for).collect::<Result<Vec<_>>>()?;
        self.queue.add(&tasks).await?;

        let ids = attempts.iter().map(|a| a.id).collect();
        let changed = self.ledger.update_status(ids, AttemptStatus::Queued).await?;

        debug!(count = tasks.len(), marked_queued = changed, "attempts enqueued");
        Ok(changed)
    }
}

/// Builds the queue task for an attempt.
///
/// # Errors
///
/// Returns a payload error if encoding fails.
pub fn task_for(attempt: &Attempt) -> Result<TaskMessage> {
    let payload = TaskPayload {
        event_id: attempt.event_id,
        endpoint_id: attempt.endpoint_id,
        attempt: attempt.attempt_number,
    };
    TaskMessage::new(attempt.id, &payload, attempt.scheduled_at)
}
