//! Ledger entities and strongly-typed identifiers.
//!
//! Events and endpoints are read-only inputs to the delivery engine. Attempts
//! are the mutable part of the ledger: one row per delivery try, linked into
//! a lineage per (event, endpoint) pair by a monotonically increasing
//! attempt number. Attempt details hold the variable-size request and
//! response captures for a single attempt.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type BoxDynError = sqlx::error::BoxDynError;
type EncodeResult = Result<sqlx::encode::IsNull, BoxDynError>;

/// Declares a UUID-backed identifier with serde and Postgres support.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

/// Implements Postgres TEXT mapping for an enum with `as_str` and `FromStr`.
macro_rules! text_column {
    ($name:ident) => {
        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <&str as sqlx::Type<PgDb>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <&str as sqlx::Type<PgDb>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                s.parse::<$name>().map_err(Into::into)
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

uuid_id!(
    /// Identifier of the workspace that owns events, endpoints and attempts.
    WorkspaceId
);

uuid_id!(
    /// Identifier of an ingested event.
    EventId
);

uuid_id!(
    /// Identifier of a delivery endpoint.
    EndpointId
);

uuid_id!(
    /// Identifier of an attempt.
    ///
    /// The same value identifies the attempt's queue task, so a task and its
    /// ledger row are always 1:1.
    AttemptId
);

impl AttemptId {
    /// Derives the id of the attempt that follows this one in its lineage.
    ///
    /// Deterministic, so a handler that re-runs after a crash collides with
    /// the successor it already inserted instead of creating a second one.
    pub fn successor(&self) -> Self {
        Self(Uuid::new_v5(&self.0, b"successor"))
    }
}

/// Tenant boundary for all ledger entities.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Workspace {
    /// Unique identifier.
    pub id: WorkspaceId,

    /// Human-readable name.
    pub name: String,

    /// When the workspace was created.
    pub created_at: DateTime<Utc>,
}

/// Immutable payload record produced by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Event {
    /// Unique identifier.
    pub id: EventId,

    /// Owning workspace.
    pub workspace_id: WorkspaceId,

    /// Opaque payload delivered as the request body.
    pub data: Vec<u8>,

    /// When the event was ingested.
    pub created_at: DateTime<Utc>,
}

/// HTTP methods an endpoint may be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    #[default]
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP PATCH.
    Patch,
    /// HTTP DELETE.
    Delete,
}

impl HttpMethod {
    /// Returns the method name as sent on the wire.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(format!("invalid http method: {s}")),
        }
    }
}

text_column!(HttpMethod);

/// Retry strategy named in an endpoint's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Per-position delay list.
    #[default]
    Fixed,
    /// Computed backoff. Reserved; no policy implements it yet.
    Backoff,
}

impl RetryStrategy {
    /// Returns the configuration name of the strategy.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Backoff => "backoff",
        }
    }
}

impl FromStr for RetryStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "backoff" => Ok(Self::Backoff),
            _ => Err(format!("invalid retry strategy: {s}")),
        }
    }
}

text_column!(RetryStrategy);

/// Retry configuration attached to an endpoint.
///
/// A failed attempt `n` is retried after `attempts[n - 1]` seconds as long as
/// `n` is below the schedule length, so a lineage makes at most
/// `attempts.len()` tries (and always at least one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRetry {
    /// Strategy used to interpret the schedule.
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Ordered delays in seconds.
    #[serde(default)]
    pub attempts: Vec<u64>,
}

impl Default for EndpointRetry {
    fn default() -> Self {
        Self { strategy: RetryStrategy::Fixed, attempts: vec![0, 60, 3600] }
    }
}

/// Delivery destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique identifier.
    pub id: EndpointId,

    /// Owning workspace.
    pub workspace_id: WorkspaceId,

    /// Optional display name.
    pub name: Option<String>,

    /// Target URL.
    pub url: String,

    /// HTTP method used for delivery.
    pub method: HttpMethod,

    /// Static headers added to every delivery.
    pub headers: HashMap<String, String>,

    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,

    /// Disabled endpoints cancel their pending attempts.
    pub enabled: bool,

    /// Retry schedule.
    pub retry: EndpointRetry,

    /// When the endpoint was created.
    pub created_at: DateTime<Utc>,

    /// When the endpoint was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Returns the per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Endpoint {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let headers: sqlx::types::Json<HashMap<String, String>> = row.try_get("headers")?;
        let retry: sqlx::types::Json<EndpointRetry> = row.try_get("retry")?;
        let timeout_ms: i64 = row.try_get("timeout_ms")?;

        Ok(Self {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            method: row.try_get("method")?,
            headers: headers.0,
            timeout_ms: u64::try_from(timeout_ms)
                .map_err(|_| sqlx::Error::Decode("timeout_ms cannot be negative".into()))?,
            enabled: row.try_get("enabled")?,
            retry: retry.0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Lifecycle state of an attempt.
///
/// `Init -> Queued -> {Success, Failure, Canceled}`. Only the worker and the
/// reconciler change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Recorded in the ledger, not yet known to the queue.
    Init,
    /// Handed to the queue.
    Queued,
    /// Endpoint answered with 2xx.
    Success,
    /// Delivery failed; may or may not have a successor.
    Failure,
    /// Delivery was not attempted because a reference was missing or
    /// disabled, or a plugin terminated it.
    Canceled,
}

impl AttemptStatus {
    /// Returns the persisted representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Queued => "queued",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Canceled => "canceled",
        }
    }

    /// Returns true once an outcome has been recorded.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Canceled)
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "queued" => Ok(Self::Queued),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("invalid attempt status: {s}")),
        }
    }
}

text_column!(AttemptStatus);

/// Machine-readable reason attached to failed or canceled attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptErrorCode {
    /// The endpoint no longer exists.
    EndpointNotFound,
    /// The endpoint exists but is disabled.
    EndpointDisabled,
    /// The request exceeded the endpoint's timeout.
    Timeout,
    /// Any other failure, including a missing event.
    Unknown,
}

impl AttemptErrorCode {
    /// Returns the persisted representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EndpointNotFound => "endpoint_not_found",
            Self::EndpointDisabled => "endpoint_disabled",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for AttemptErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "endpoint_not_found" => Ok(Self::EndpointNotFound),
            "endpoint_disabled" => Ok(Self::EndpointDisabled),
            "timeout" => Ok(Self::Timeout),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("invalid attempt error code: {s}")),
        }
    }
}

text_column!(AttemptErrorCode);

/// How an attempt came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Created by ingestion or by the retry schedule.
    #[default]
    Automatic,
    /// Created by an operator retry.
    Manual,
}

impl TriggerMode {
    /// Returns the persisted representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for TriggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("invalid trigger mode: {s}")),
        }
    }
}

text_column!(TriggerMode);

/// Summary of the request sent for an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRequest {
    /// HTTP method.
    pub method: String,
    /// Final URL after plugins ran.
    pub url: String,
}

/// Summary of a received response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptResponse {
    /// HTTP status code.
    pub status: u16,
    /// Wall time between send and response, in milliseconds.
    pub latency_ms: u64,
}

/// One delivery try of an event to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Unique identifier, shared with the queue task.
    pub id: AttemptId,

    /// Event being delivered.
    pub event_id: EventId,

    /// Destination endpoint.
    pub endpoint_id: EndpointId,

    /// Owning workspace.
    pub workspace_id: WorkspaceId,

    /// Position within the lineage, starting at 1.
    pub attempt_number: u32,

    /// Current lifecycle state.
    pub status: AttemptStatus,

    /// Earliest time the attempt may run.
    pub scheduled_at: DateTime<Utc>,

    /// When the delivery was executed.
    pub attempted_at: Option<DateTime<Utc>>,

    /// How the attempt was created.
    pub trigger_mode: TriggerMode,

    /// Reason for a failed or canceled outcome.
    pub error_code: Option<AttemptErrorCode>,

    /// Request summary, present once the delivery ran.
    pub request: Option<AttemptRequest>,

    /// Response summary, present only if a response was received.
    pub response: Option<AttemptResponse>,

    /// True when this failure consumed the last retry.
    pub exhausted: bool,

    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

impl Attempt {
    /// Creates the first attempt of a lineage, due immediately.
    pub fn first(event: &Event, endpoint: &Endpoint, now: DateTime<Utc>) -> Self {
        Self {
            id: AttemptId::new(),
            event_id: event.id,
            endpoint_id: endpoint.id,
            workspace_id: endpoint.workspace_id,
            attempt_number: 1,
            status: AttemptStatus::Init,
            scheduled_at: now,
            attempted_at: None,
            trigger_mode: TriggerMode::Automatic,
            error_code: None,
            request: None,
            response: None,
            exhausted: false,
            created_at: now,
        }
    }

    /// Creates the next attempt in this attempt's lineage.
    ///
    /// The successor's id is [`AttemptId::successor`] of this attempt's id.
    pub fn successor(&self, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id.successor(),
            event_id: self.event_id,
            endpoint_id: self.endpoint_id,
            workspace_id: self.workspace_id,
            attempt_number: self.attempt_number + 1,
            status: AttemptStatus::Init,
            scheduled_at,
            attempted_at: None,
            trigger_mode: TriggerMode::Automatic,
            error_code: None,
            request: None,
            response: None,
            exhausted: false,
            created_at: now,
        }
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Attempt {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let attempt_number: i32 = row.try_get("attempt_number")?;
        let request: Option<sqlx::types::Json<AttemptRequest>> = row.try_get("request")?;
        let response: Option<sqlx::types::Json<AttemptResponse>> = row.try_get("response")?;

        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            endpoint_id: row.try_get("endpoint_id")?,
            workspace_id: row.try_get("workspace_id")?,
            attempt_number: u32::try_from(attempt_number)
                .map_err(|_| sqlx::Error::Decode("attempt_number cannot be negative".into()))?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            attempted_at: row.try_get("attempted_at")?,
            trigger_mode: row.try_get("trigger_mode")?,
            error_code: row.try_get("error_code")?,
            request: request.map(|r| r.0),
            response: response.map(|r| r.0),
            exhausted: row.try_get("exhausted")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Outcome fields written to an attempt after execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptResult {
    /// Final status.
    pub status: AttemptStatus,
    /// Classified failure reason.
    pub error_code: Option<AttemptErrorCode>,
    /// Request summary.
    pub request: Option<AttemptRequest>,
    /// Response summary, only if a response arrived.
    pub response: Option<AttemptResponse>,
    /// When the delivery finished.
    pub attempted_at: DateTime<Utc>,
    /// True when no retry remains.
    pub exhausted: bool,
}

/// Request and response captures for one attempt.
///
/// Kept apart from [`Attempt`] so the ledger rows stay small. Written once
/// per execution and overwritten on re-execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptDetail {
    /// Attempt this detail belongs to.
    pub id: AttemptId,

    /// Owning workspace.
    pub workspace_id: WorkspaceId,

    /// Headers sent.
    pub request_headers: HashMap<String, String>,

    /// Body sent.
    pub request_body: Option<Vec<u8>>,

    /// Headers received.
    pub response_headers: Option<HashMap<String, String>>,

    /// Body received, possibly truncated.
    pub response_body: Option<Vec<u8>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AttemptDetail {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let request_headers: sqlx::types::Json<HashMap<String, String>> =
            row.try_get("request_headers")?;
        let response_headers: Option<sqlx::types::Json<HashMap<String, String>>> =
            row.try_get("response_headers")?;

        Ok(Self {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            request_headers: request_headers.0,
            request_body: row.try_get("request_body")?,
            response_headers: response_headers.map(|h| h.0),
            response_body: row.try_get("response_body")?,
        })
    }
}
