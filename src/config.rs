//! Configuration for the hookline worker process.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use hookline_delivery::{
    acl::DenyList, client::DEFAULT_MAX_RESPONSE_BODY_BYTES, queue::DEFAULT_VISIBILITY_TIMEOUT,
    ClientConfig,
    EngineConfig, ReconcilerConfig, WorkerConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "hookline.toml";
const ENV_PREFIX: &str = "HOOKLINE_";

/// Complete worker configuration.
///
/// Loaded in priority order, highest first:
/// 1. Environment variables prefixed `HOOKLINE_`, nested with `__`
///    (`HOOKLINE_WORKER__POLL_BATCH_SIZE=50`)
/// 2. `hookline.toml` in the working directory
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum number of pooled database connections.
    pub database_max_connections: u32,
    /// `text` or `json`.
    pub log_format: LogFormat,
    /// Task queue settings.
    pub queue: QueueConfig,
    /// Poll loop settings.
    pub worker: WorkerSection,
    /// Reconciler settings.
    pub requeue: RequeueSection,
    /// HTTP deliverer settings.
    pub deliverer: DelivererSection,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Task queue backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Process-local queue for a single worker process. On startup every
    /// `Queued` attempt is reset to `Init` and the reconciler enqueues it
    /// again.
    #[default]
    #[serde(alias = "off")]
    Memory,
    /// Shared Redis queue.
    Redis,
}

/// `[queue]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Which backend to use.
    pub backend: QueueBackend,
    /// How long a claimed task stays hidden.
    pub visibility_timeout_secs: u64,
    /// Redis connection, used by the `redis` backend.
    pub redis: RedisSection,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT.as_secs(),
            redis: RedisSection::default(),
        }
    }
}

/// `[queue.redis]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Optional password.
    pub password: Option<String>,
    /// Logical database index.
    pub database: u32,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self { host: "localhost".to_string(), port: 6379, password: None, database: 0 }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Idle time between polls.
    pub poll_interval_ms: u64,
    /// Tasks claimed per queue call.
    pub poll_batch_size: usize,
    /// Handlers allowed to run at once, 0 for no limit.
    pub max_concurrency: usize,
    /// Time given to in-flight handlers on shutdown.
    pub shutdown_timeout_secs: u64,
    /// How far ahead attempts are pushed to the queue.
    pub pre_schedule_window_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            poll_batch_size: 20,
            max_concurrency: 0,
            shutdown_timeout_secs: 30,
            pre_schedule_window_secs: 180,
        }
    }
}

/// `[requeue]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequeueSection {
    /// Attempts fetched per ledger page.
    pub batch_size: usize,
    /// Time between sweeps.
    pub interval_secs: u64,
    /// Minimum attempt age before it is considered lost.
    pub min_age_secs: u64,
}

impl Default for RequeueSection {
    fn default() -> Self {
        Self { batch_size: 20, interval_secs: 60, min_age_secs: 60 }
    }
}

/// `[deliverer]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelivererSection {
    /// `User-Agent` sent with every delivery.
    pub user_agent: String,
    /// Response bodies are truncated to this many bytes.
    pub max_response_body_bytes: usize,
    /// Denied destinations: IPs, CIDR blocks, host names or presets such as
    /// `@default`. An empty list allows every destination.
    pub deny: Vec<String>,
}

impl Default for DelivererSection {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            user_agent: client.user_agent,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            deny: client.deny,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/hookline".to_string(),
            database_max_connections: 10,
            log_format: LogFormat::default(),
            queue: QueueConfig::default(),
            worker: WorkerSection::default(),
            requeue: RequeueSection::default(),
            deliverer: DelivererSection::default(),
        }
    }
}

impl Config {
    /// Loads defaults, then `hookline.toml`, then `HOOKLINE_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result fails
    /// [`Config::validate`].
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }
        if self.queue.visibility_timeout_secs == 0 {
            anyhow::bail!("queue.visibility_timeout_secs must be greater than 0");
        }
        if self.queue.backend == QueueBackend::Redis && !cfg!(feature = "redis") {
            anyhow::bail!("queue.backend = \"redis\" requires building with the redis feature");
        }
        if self.worker.poll_interval_ms == 0 {
            anyhow::bail!("worker.poll_interval_ms must be greater than 0");
        }
        if self.worker.poll_batch_size == 0 {
            anyhow::bail!("worker.poll_batch_size must be greater than 0");
        }
        if self.requeue.batch_size == 0 {
            anyhow::bail!("requeue.batch_size must be greater than 0");
        }
        if self.requeue.interval_secs == 0 {
            anyhow::bail!("requeue.interval_secs must be greater than 0");
        }
        DenyList::parse(&self.deliverer.deny).context("invalid deliverer.deny rule")?;
        self.to_engine_config().validate().context("invalid engine configuration")?;
        Ok(())
    }

    /// Converts into the engine's configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(self.worker.poll_interval_ms),
                poll_batch_size: self.worker.poll_batch_size,
                max_concurrency: self.worker.max_concurrency,
                shutdown_timeout: Duration::from_secs(self.worker.shutdown_timeout_secs),
            },
            reconciler: ReconcilerConfig {
                batch_size: self.requeue.batch_size,
                interval: Duration::from_secs(self.requeue.interval_secs),
                min_age: Duration::from_secs(self.requeue.min_age_secs),
            },
            pre_schedule_window: Duration::from_secs(self.worker.pre_schedule_window_secs),
        }
    }

    /// Converts into the HTTP deliverer's configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            user_agent: self.deliverer.user_agent.clone(),
            max_response_body_bytes: self.deliverer.max_response_body_bytes,
            deny: self.deliverer.deny.clone(),
            ..ClientConfig::default()
        }
    }

    /// Visibility timeout for claimed tasks.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.visibility_timeout_secs)
    }

    /// Redis queue connection for the configured namespace.
    #[cfg(feature = "redis")]
    pub fn to_redis_config(&self) -> hookline_delivery::queue::RedisQueueConfig {
        hookline_delivery::queue::RedisQueueConfig {
            host: self.queue.redis.host.clone(),
            port: self.queue.redis.port,
            password: self.queue.redis.password.clone(),
            database: self.queue.redis.database,
            visibility_timeout: self.visibility_timeout(),
            ..hookline_delivery::queue::RedisQueueConfig::default()
        }
    }

    /// Database URL with the password masked for logging.
    pub fn database_url_masked(&self) -> String {
        let url = &self.database_url;
        let authority_start = url.find("://").map_or(0, |i| i + 3);
        if let Some(at_pos) = url[authority_start..].find('@').map(|i| i + authority_start) {
            if let Some(colon_pos) = url[authority_start..at_pos].find(':') {
                let mut masked = url.clone();
                masked.replace_range(authority_start + colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        url.clone()
    }
}
