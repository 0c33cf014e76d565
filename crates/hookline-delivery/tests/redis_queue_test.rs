//! Redis task queue scripts against a live server.
//!
//! Built with the `redis` feature only. Set `REDIS_HOST` (and optionally
//! `REDIS_PORT`) to run them; each test uses its own key namespace.

#![cfg(feature = "redis")]

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use hookline_core::{AttemptId, EndpointId, EventId};
use hookline_delivery::{
    queue::{RedisQueueConfig, RedisTaskQueue},
    TaskMessage, TaskPayload, TaskQueue,
};
use uuid::Uuid;

async fn queue(visibility_timeout: Duration) -> Result<Option<RedisTaskQueue>> {
    let Ok(host) = std::env::var("REDIS_HOST") else {
        return Ok(None);
    };
    let port = match std::env::var("REDIS_PORT") {
        Ok(port) => port.parse().context("invalid REDIS_PORT")?,
        Err(_) => 6379,
    };
    let config = RedisQueueConfig {
        host,
        port,
        namespace: format!("hookline_test_{}", Uuid::new_v4().simple()),
        visibility_timeout,
        ..RedisQueueConfig::default()
    };
    Ok(Some(RedisTaskQueue::connect(&config).await?))
}

fn task(delay: chrono::Duration) -> Result<TaskMessage> {
    let payload = TaskPayload { event_id: EventId::new(), endpoint_id: EndpointId::new(), attempt: 1 };
    Ok(TaskMessage::new(AttemptId::new(), &payload, Utc::now() + delay)?)
}

#[tokio::test]
async fn due_tasks_are_claimed_once_with_their_payload() -> Result<()> {
    let Some(queue) = queue(Duration::from_secs(30)).await? else {
        return Ok(());
    };
    let due = task(chrono::Duration::seconds(-5))?;
    let later = task(chrono::Duration::seconds(300))?;
    queue.add(&[due.clone(), later.clone()]).await?;

    assert_eq!(queue.size().await?, 1);

    let claimed = queue.get(10).await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, due.id);
    assert_eq!(claimed[0].data, due.data);
    assert_eq!(claimed[0].payload()?, due.payload()?);
    assert_eq!(claimed[0].scheduled_at.timestamp_millis(), due.scheduled_at.timestamp_millis());

    assert!(queue.get(10).await?.is_empty());
    assert_eq!(queue.size().await?, 0);
    Ok(())
}

#[tokio::test]
async fn re_adding_a_claimed_task_keeps_it_hidden() -> Result<()> {
    let Some(queue) = queue(Duration::from_secs(30)).await? else {
        return Ok(());
    };
    let t = task(chrono::Duration::zero())?;
    queue.add(std::slice::from_ref(&t)).await?;
    assert_eq!(queue.get(1).await?.len(), 1);

    queue.add(std::slice::from_ref(&t)).await?;
    assert!(queue.get(1).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn unacknowledged_claim_returns_after_visibility_timeout() -> Result<()> {
    let Some(queue) = queue(Duration::from_millis(300)).await? else {
        return Ok(());
    };
    let t = task(chrono::Duration::zero())?;
    queue.add(std::slice::from_ref(&t)).await?;
    assert_eq!(queue.get(1).await?.len(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(queue.size().await?, 1);
    let again = queue.get(1).await?;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, t.id);
    Ok(())
}

#[tokio::test]
async fn delete_is_idempotent_and_final() -> Result<()> {
    let Some(queue) = queue(Duration::from_millis(200)).await? else {
        return Ok(());
    };
    let t = task(chrono::Duration::zero())?;
    queue.add(std::slice::from_ref(&t)).await?;
    let claimed = queue.get(1).await?;

    queue.delete(&claimed[0]).await?;
    queue.delete(&claimed[0]).await?;
    queue.delete(&t).await?;

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(queue.requeue_expired().await?, 0);
    assert!(queue.get(10).await?.is_empty());
    assert_eq!(queue.size().await?, 0);
    Ok(())
}
