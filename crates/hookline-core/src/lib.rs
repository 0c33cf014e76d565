//! Core domain types for the hookline delivery engine.
//!
//! Holds the ledger's entities (events, endpoints, attempts and their
//! details), strongly-typed identifiers, the clock abstraction shared by the
//! queue and worker, and the PostgreSQL repositories that back the ledger.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    Attempt, AttemptDetail, AttemptErrorCode, AttemptId, AttemptRequest, AttemptResponse,
    AttemptResult, AttemptStatus, Endpoint, EndpointId, EndpointRetry, Event, EventId,
    HttpMethod, RetryStrategy, TriggerMode, Workspace, WorkspaceId,
};
pub use time::{Clock, RealClock, TestClock};
