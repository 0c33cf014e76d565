//! Redis-backed task queue shared by every worker process.
//!
//! Keys, for a namespace `ns`:
//!
//! - `ns:queue` sorted set of task ids scored by due time (ms)
//! - `ns:queue_invisible` sorted set of claimed ids scored by expiry (ms)
//! - `ns:queue_data` hash of task id to encoded payload
//!
//! Every operation is a Lua script so claims are atomic across processes.
//! Scripts read the server clock, which keeps visibility decisions consistent
//! between workers whose local clocks drift.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hookline_core::AttemptId;
use redis::{aio::MultiplexedConnection, Script};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{TaskMessage, TaskQueue, DEFAULT_VISIBILITY_TIMEOUT};
use crate::error::{DeliveryError, Result};

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "hookline";

const REQUEUE_INTERVAL: Duration = Duration::from_secs(1);

const ADD_SCRIPT: &str = r"
for i = 1, #ARGV, 3 do
    local id = ARGV[i]
    redis.call('HSET', KEYS[2], id, ARGV[i + 2])
    if not redis.call('ZSCORE', KEYS[3], id) then
        redis.call('ZADD', KEYS[1], ARGV[i + 1], id)
    end
end
return 1
";

const GET_SCRIPT: &str = r"
redis.replicate_commands()
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[3], id)
    redis.call('ZADD', KEYS[1], now, id)
end
local entries = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'WITHSCORES', 'LIMIT', 0, tonumber(ARGV[1]))
local result = {}
for i = 1, #entries, 2 do
    local id = entries[i]
    redis.call('ZREM', KEYS[1], id)
    local data = redis.call('HGET', KEYS[2], id)
    if data then
        redis.call('ZADD', KEYS[3], now + tonumber(ARGV[2]), id)
        table.insert(result, id)
        table.insert(result, entries[i + 1])
        table.insert(result, data)
    end
end
return result
";

const DELETE_SCRIPT: &str = r"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
";

const REQUEUE_SCRIPT: &str = r"
redis.replicate_commands()
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
for _, id in ipairs(expired) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('ZADD', KEYS[2], now, id)
end
return #expired
";

const SIZE_SCRIPT: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
return redis.call('ZCOUNT', KEYS[1], '-inf', now) + redis.call('ZCOUNT', KEYS[2], '-inf', now)
";

/// Connection parameters for [`RedisTaskQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisQueueConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Optional password.
    pub password: Option<String>,
    /// Logical database index.
    pub database: u32,
    /// Key prefix.
    pub namespace: String,
    /// Time a claimed task stays hidden.
    pub visibility_timeout: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            database: 0,
            namespace: DEFAULT_NAMESPACE.to_string(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl RedisQueueConfig {
    /// Returns the connection URL.
    pub fn url(&self) -> String {
        let auth = match &self.password {
            Some(password) if !password.is_empty() => format!(":{password}@"),
            _ => String::new(),
        };
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.database)
    }
}

/// [`TaskQueue`] stored in Redis.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: MultiplexedConnection,
    queue_key: String,
    invisible_key: String,
    data_key: String,
    visibility_timeout: Duration,
}

impl std::fmt::Debug for RedisTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskQueue")
            .field("queue_key", &self.queue_key)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisTaskQueue {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(config: &RedisQueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.url())
            .map_err(|e| DeliveryError::queue(format!("invalid redis config: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to connect to redis: {e}")))?;

        info!(
            host = %config.host,
            port = config.port,
            database = config.database,
            namespace = %config.namespace,
            "connected to redis task queue"
        );

        Ok(Self {
            conn,
            queue_key: format!("{}:queue", config.namespace),
            invisible_key: format!("{}:queue_invisible", config.namespace),
            data_key: format!("{}:queue_data", config.namespace),
            visibility_timeout: config.visibility_timeout,
        })
    }

    /// Moves expired claims back to the scheduled set.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the script fails.
    pub async fn requeue_expired(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = Script::new(REQUEUE_SCRIPT)
            .key(&self.invisible_key)
            .key(&self.queue_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to requeue expired tasks: {e}")))?;
        Ok(count)
    }

    /// Spawns the once-per-second sweep of expired claims.
    ///
    /// [`TaskQueue::get`] performs the same sweep and [`TaskQueue::size`]
    /// already counts expired claims, so this only keeps the invisible set
    /// from growing between polls.
    pub fn spawn_requeue(&self, token: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REQUEUE_INTERVAL);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match queue.requeue_expired().await {
                            Ok(0) => {},
                            Ok(count) => debug!(count, "expired tasks returned to queue"),
                            Err(e) => error!(error = %e, "failed to run requeue script"),
                        }
                    },
                }
            }
            debug!("redis requeue sweep stopped");
        })
    }
}

fn parse_claimed(fields: &[String]) -> Result<TaskMessage> {
    let [id, score, data] = fields else {
        return Err(DeliveryError::queue("malformed get script reply"));
    };
    let id = Uuid::parse_str(id)
        .map_err(|e| DeliveryError::queue(format!("invalid task id '{id}': {e}")))?;
    let score_ms: f64 =
        score.parse().map_err(|e| DeliveryError::queue(format!("invalid task score: {e}")))?;
    if !score_ms.is_finite() {
        return Err(DeliveryError::queue(format!("task score '{score}' is not finite")));
    }
    #[allow(clippy::cast_possible_truncation)]
    let scheduled_at = Utc
        .timestamp_millis_opt(score_ms as i64)
        .single()
        .ok_or_else(|| DeliveryError::queue(format!("task score '{score}' is out of range")))?;

    Ok(TaskMessage { id: AttemptId(id), data: data.clone().into_bytes(), scheduled_at })
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn add(&self, tasks: &[TaskMessage]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let script = Script::new(ADD_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(&self.queue_key).key(&self.data_key).key(&self.invisible_key);
        for task in tasks {
            invocation.arg(task.id.to_string()).arg(score(task.scheduled_at)).arg(&task.data);
        }

        let mut conn = self.conn.clone();
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to add tasks: {e}")))?;
        debug!(count = tasks.len(), "tasks added");
        Ok(())
    }

    async fn get(&self, max_count: usize) -> Result<Vec<TaskMessage>> {
        let timeout_ms = u64::try_from(self.visibility_timeout.as_millis()).unwrap_or(u64::MAX);
        let mut conn = self.conn.clone();
        let reply: Vec<String> = Script::new(GET_SCRIPT)
            .key(&self.queue_key)
            .key(&self.data_key)
            .key(&self.invisible_key)
            .arg(max_count)
            .arg(timeout_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to get tasks: {e}")))?;

        reply.chunks(3).map(parse_claimed).collect()
    }

    async fn delete(&self, task: &TaskMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(DELETE_SCRIPT)
            .key(&self.invisible_key)
            .key(&self.queue_key)
            .key(&self.data_key)
            .arg(task.id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to delete task: {e}")))?;
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let size: u64 = Script::new(SIZE_SCRIPT)
            .key(&self.queue_key)
            .key(&self.invisible_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| DeliveryError::queue(format!("failed to count tasks: {e}")))?;
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_includes_password_and_database() {
        let config = RedisQueueConfig {
            password: Some("secret".to_string()),
            database: 2,
            ..RedisQueueConfig::default()
        };
        assert_eq!(config.url(), "redis://:secret@localhost:6379/2");
        assert_eq!(RedisQueueConfig::default().url(), "redis://localhost:6379/0");
    }

    #[test]
    fn claimed_reply_is_parsed() {
        let id = Uuid::new_v4();
        let fields =
            vec![id.to_string(), "1700000000000".to_string(), r#"{"attempt":1}"#.to_string()];
        let task = parse_claimed(&fields).unwrap();

        assert_eq!(task.id, AttemptId(id));
        assert_eq!(task.scheduled_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(task.data, br#"{"attempt":1}"#.to_vec());
    }

    #[test]
    fn corrupt_score_is_rejected() {
        let id = Uuid::new_v4().to_string();
        for score in ["not-a-number", "NaN", "inf", "1e300"] {
            let fields = vec![id.clone(), score.to_string(), "{}".to_string()];
            let err = parse_claimed(&fields).unwrap_err();
            assert!(matches!(err, DeliveryError::Queue { .. }), "{score}: {err}");
        }
    }

    #[test]
    fn short_reply_is_rejected() {
        assert!(parse_claimed(&["only-one".to_string()]).is_err());
    }
}
