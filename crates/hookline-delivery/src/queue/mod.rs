//! Visibility-timeout task queue.
//!
//! A task is visible once its scheduled time has passed. [`TaskQueue::get`]
//! hides the tasks it returns until `now + visibility_timeout`; a task that is
//! not deleted before then becomes visible again. That expiry is the only
//! redelivery mechanism, there is no explicit nack.
//!
//! Backends keep three namespaces: the scheduled set ordered by due time,
//! the invisible set ordered by expiry, and the payload store keyed by task
//! id, so making a task visible again only moves its id.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookline_core::{AttemptId, EndpointId, EventId};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryTaskQueue;
#[cfg(feature = "redis")]
pub use self::redis::{RedisQueueConfig, RedisTaskQueue};

/// Default time a claimed task stays hidden.
///
/// Must exceed the worst-case handler latency (delivery timeout plus ledger
/// writes) or slow successful deliveries are duplicated.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// Routing data carried by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Event to deliver.
    pub event_id: EventId,
    /// Destination endpoint.
    pub endpoint_id: EndpointId,
    /// Attempt number within the lineage.
    pub attempt: u32,
}

/// Queue envelope for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMessage {
    /// Task id, equal to the attempt id.
    pub id: AttemptId,

    /// Encoded [`TaskPayload`].
    pub data: Vec<u8>,

    /// Earliest time the task becomes visible.
    pub scheduled_at: DateTime<Utc>,
}

impl TaskMessage {
    /// Encodes `payload` into a task for attempt `id`.
    ///
    /// # Errors
    ///
    /// Returns a payload error if encoding fails.
    pub fn new(id: AttemptId, payload: &TaskPayload, scheduled_at: DateTime<Utc>) -> Result<Self> {
        Ok(Self { id, data: serde_json::to_vec(payload)?, scheduled_at })
    }

    /// Decodes the routing payload.
    ///
    /// # Errors
    ///
    /// Returns a payload error if the stored bytes are not a valid payload.
    pub fn payload(&self) -> Result<TaskPayload> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// At-least-once, delay-aware work queue.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    /// Enqueues tasks, each visible no earlier than its `scheduled_at`.
    ///
    /// Re-adding a known id replaces its payload and schedule; re-adding an
    /// id that is currently claimed leaves the claim in place.
    async fn add(&self, tasks: &[TaskMessage]) -> Result<()>;

    /// Claims up to `max_count` due tasks and hides them for the visibility
    /// timeout.
    async fn get(&self, max_count: usize) -> Result<Vec<TaskMessage>>;

    /// Removes a task from every namespace. Deleting an unknown or already
    /// deleted task succeeds.
    async fn delete(&self, task: &TaskMessage) -> Result<()>;

    /// Counts tasks that are visible and due right now.
    async fn size(&self) -> Result<u64>;
}
