//! Delivery engine for hookline.
//!
//! Takes attempts recorded in the ledger and delivers them to their
//! endpoints with at-least-once semantics. The ledger is the source of
//! truth; the task queue is a rebuildable acceleration structure on top of
//! it.
//!
//! # Architecture
//!
//! - **Task queue** ([`queue`]) - visibility-timeout work queue keyed by
//!   attempt id. A claimed task that is not deleted comes back on its own.
//! - **Worker** ([`worker`]) - polls the queue and runs one handler per task:
//!   load references, run the endpoint's plugin pipeline, deliver, record the
//!   outcome, then finish the lineage or schedule the next attempt.
//! - **Retry policy** ([`retry`]) - maps a failed attempt number to the delay
//!   before the next one.
//! - **Reconciler** ([`reconciler`]) - periodically enqueues attempts that are
//!   due but unknown to the queue.
//!
//! A task is deleted only after the ledger holds the handler's decision, so a
//! crash at any point costs at most one repeated network call.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_core::RealClock;
//! use hookline_delivery::{
//!     plugin::NoPlugins, queue::InMemoryTaskQueue, storage::mock::MockLedger, DeliveryEngine,
//!     EngineConfig, EngineParts, HttpDeliverer,
//! };
//!
//! # async fn example() -> hookline_delivery::Result<()> {
//! let clock = Arc::new(RealClock::new());
//! let parts = EngineParts {
//!     queue: Arc::new(InMemoryTaskQueue::new(clock.clone())),
//!     ledger: Arc::new(MockLedger::new()),
//!     deliverer: Arc::new(HttpDeliverer::with_defaults()?),
//!     plugins: Arc::new(NoPlugins),
//!     clock,
//! };
//!
//! let mut engine = DeliveryEngine::new(parts, EngineConfig::default())?;
//! engine.start()?;
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod acl;
pub mod client;
pub mod engine;
pub mod error;
pub mod handler_pool;
pub mod plugin;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use client::{ClientConfig, Deliverer, DeliveryRequest, DeliveryResponse, HttpDeliverer};
pub use engine::{DeliveryEngine, EngineConfig, EngineParts, EngineStats};
pub use error::{DeliveryError, Result};
pub use queue::{TaskMessage, TaskPayload, TaskQueue};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use scheduler::TaskScheduler;
pub use storage::{Ledger, PostgresLedger};
pub use worker::{DeliveryWorker, TaskOutcome, WorkerConfig};
