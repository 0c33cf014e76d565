//! In-process queue used when the queue backend is `off`.
//!
//! Holds the same three namespaces as the Redis backend behind one mutex, so
//! every operation is atomic with respect to concurrent handlers in this
//! process. Tasks do not survive a restart; the binary resets `Queued`
//! attempts to `Init` on startup (see `DeliveryEngine::reclaim_queued`) and
//! the reconciler re-injects them from the ledger.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookline_core::{AttemptId, Clock};
use tokio::sync::Mutex;
use tracing::debug;

use super::{TaskMessage, TaskQueue, DEFAULT_VISIBILITY_TIMEOUT};
use crate::error::Result;

/// Ids ordered by a timestamp score.
#[derive(Debug, Default)]
struct ScoredSet {
    ordered: BTreeSet<(DateTime<Utc>, AttemptId)>,
    scores: HashMap<AttemptId, DateTime<Utc>>,
}

impl ScoredSet {
    fn insert(&mut self, id: AttemptId, score: DateTime<Utc>) {
        self.remove(id);
        self.ordered.insert((score, id));
        self.scores.insert(id, score);
    }

    fn remove(&mut self, id: AttemptId) -> Option<DateTime<Utc>> {
        let score = self.scores.remove(&id)?;
        self.ordered.remove(&(score, id));
        Some(score)
    }

    fn contains(&self, id: AttemptId) -> bool {
        self.scores.contains_key(&id)
    }

    /// Removes and returns up to `limit` entries scored at or before `now`.
    fn take_due(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<(AttemptId, DateTime<Utc>)> {
        let due: Vec<_> = self
            .ordered
            .iter()
            .take_while(|(score, _)| *score <= now)
            .take(limit)
            .map(|(score, id)| (*id, *score))
            .collect();
        for (id, _) in &due {
            self.remove(*id);
        }
        due
    }

    fn count_due(&self, now: DateTime<Utc>) -> usize {
        self.ordered.iter().take_while(|(score, _)| *score <= now).count()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    scheduled: ScoredSet,
    invisible: ScoredSet,
    data: HashMap<AttemptId, Vec<u8>>,
}

/// Process-local [`TaskQueue`].
#[derive(Debug, Clone)]
pub struct InMemoryTaskQueue {
    state: Arc<Mutex<QueueState>>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl InMemoryTaskQueue {
    /// Creates an empty queue with the default visibility timeout.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_visibility_timeout(clock, DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Creates an empty queue with a custom visibility timeout.
    pub fn with_visibility_timeout(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self { state: Arc::new(Mutex::new(QueueState::default())), clock, visibility_timeout }
    }

    /// Returns the configured visibility timeout.
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Number of tasks currently claimed and not yet deleted or expired.
    pub async fn in_flight(&self) -> usize {
        let now = self.clock.now_utc();
        let state = self.state.lock().await;
        state.invisible.ordered.iter().filter(|(expiry, _)| *expiry > now).count()
    }

    /// Total number of tasks held in any namespace.
    pub async fn len(&self) -> usize {
        self.state.lock().await.data.len()
    }

    /// Returns true when no task is held.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Moves claims whose visibility timeout elapsed back to the scheduled
    /// set.
    fn requeue_expired(state: &mut QueueState, now: DateTime<Utc>) -> usize {
        let expired = state.invisible.take_due(now, usize::MAX);
        for (id, _) in &expired {
            state.scheduled.insert(*id, now);
        }
        expired.len()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn add(&self, tasks: &[TaskMessage]) -> Result<()> {
        let mut state = self.state.lock().await;
        for task in tasks {
            state.data.insert(task.id, task.data.clone());
            if !state.invisible.contains(task.id) {
                state.scheduled.insert(task.id, task.scheduled_at);
            }
            debug!(task_id = %task.id, scheduled_at = %task.scheduled_at, "task added");
        }
        Ok(())
    }

    async fn get(&self, max_count: usize) -> Result<Vec<TaskMessage>> {
        let now = self.clock.now_utc();
        let timeout =
            chrono::Duration::from_std(self.visibility_timeout).unwrap_or(chrono::Duration::MAX);
        let expiry = now.checked_add_signed(timeout).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut state = self.state.lock().await;
        let requeued = Self::requeue_expired(&mut state, now);
        if requeued > 0 {
            debug!(count = requeued, "expired tasks returned to queue");
        }

        let mut tasks = Vec::new();
        for (id, scheduled_at) in state.scheduled.take_due(now, max_count) {
            let Some(data) = state.data.get(&id).cloned() else {
                continue;
            };
            state.invisible.insert(id, expiry);
            tasks.push(TaskMessage { id, data, scheduled_at });
        }
        Ok(tasks)
    }

    async fn delete(&self, task: &TaskMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        state.scheduled.remove(task.id);
        state.invisible.remove(task.id);
        state.data.remove(&task.id);
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let now = self.clock.now_utc();
        let state = self.state.lock().await;
        let visible = state.scheduled.count_due(now) + state.invisible.count_due(now);
        Ok(visible as u64)
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{EndpointId, EventId, TestClock};

    use super::*;
    use crate::queue::TaskPayload;

    fn task(scheduled_at: DateTime<Utc>) -> TaskMessage {
        let payload =
            TaskPayload { event_id: EventId::new(), endpoint_id: EndpointId::new(), attempt: 1 };
        TaskMessage::new(AttemptId::new(), &payload, scheduled_at).unwrap()
    }

    fn queue() -> (InMemoryTaskQueue, TestClock) {
        let clock = TestClock::new();
        (InMemoryTaskQueue::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn get_returns_due_tasks_in_schedule_order() {
        let (queue, clock) = queue();
        let now = clock.now_utc();
        let later = task(now - chrono::Duration::seconds(1));
        let earlier = task(now - chrono::Duration::seconds(5));
        queue.add(&[later.clone(), earlier.clone()]).await.unwrap();

        let claimed = queue.get(10).await.unwrap();

        assert_eq!(claimed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![earlier.id, later.id]);
        assert_eq!(claimed[0].data, earlier.data);
    }

    #[tokio::test]
    async fn future_tasks_are_not_returned() {
        let (queue, clock) = queue();
        let pending = task(clock.now_utc() + chrono::Duration::seconds(30));
        queue.add(&[pending.clone()]).await.unwrap();

        assert!(queue.get(10).await.unwrap().is_empty());
        assert_eq!(queue.size().await.unwrap(), 0);

        clock.advance(Duration::from_secs(30));
        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(queue.get(10).await.unwrap()[0].id, pending.id);
    }

    #[tokio::test]
    async fn claimed_task_is_hidden_until_timeout() {
        let (queue, clock) = queue();
        let t = task(clock.now_utc());
        queue.add(&[t.clone()]).await.unwrap();

        assert_eq!(queue.get(1).await.unwrap().len(), 1);
        assert!(queue.get(1).await.unwrap().is_empty());
        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.in_flight().await, 1);

        clock.advance(DEFAULT_VISIBILITY_TIMEOUT - Duration::from_secs(1));
        assert!(queue.get(1).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        let again = queue.get(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, t.id);
    }

    #[tokio::test]
    async fn expired_claim_counts_toward_size_before_next_get() {
        let (queue, clock) = queue();
        queue.add(&[task(clock.now_utc())]).await.unwrap();
        queue.get(1).await.unwrap();
        assert_eq!(queue.size().await.unwrap(), 0);

        clock.advance(DEFAULT_VISIBILITY_TIMEOUT);

        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (queue, clock) = queue();
        let t = task(clock.now_utc());
        queue.add(&[t.clone()]).await.unwrap();
        let claimed = queue.get(1).await.unwrap();

        queue.delete(&claimed[0]).await.unwrap();
        queue.delete(&claimed[0]).await.unwrap();

        clock.advance(DEFAULT_VISIBILITY_TIMEOUT * 2);
        assert!(queue.get(1).await.unwrap().is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn re_adding_scheduled_task_does_not_duplicate() {
        let (queue, clock) = queue();
        let t = task(clock.now_utc());
        queue.add(&[t.clone()]).await.unwrap();
        queue.add(&[t.clone()]).await.unwrap();

        assert_eq!(queue.size().await.unwrap(), 1);
        assert_eq!(queue.get(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn re_adding_claimed_task_keeps_claim() {
        let (queue, clock) = queue();
        let t = task(clock.now_utc());
        queue.add(&[t.clone()]).await.unwrap();
        queue.get(1).await.unwrap();

        queue.add(&[t.clone()]).await.unwrap();

        assert!(queue.get(1).await.unwrap().is_empty());
        assert_eq!(queue.in_flight().await, 1);
    }

    #[tokio::test]
    async fn get_respects_max_count() {
        let (queue, clock) = queue();
        let now = clock.now_utc();
        let tasks: Vec<_> = (0..5).map(|_| task(now)).collect();
        queue.add(&tasks).await.unwrap();

        assert_eq!(queue.get(2).await.unwrap().len(), 2);
        assert_eq!(queue.size().await.unwrap(), 3);
    }
}
