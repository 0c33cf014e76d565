//! Test infrastructure for the delivery engine.
//!
//! Everything here runs in memory: [`TestEnv`] bundles the mock ledger, the
//! in-memory task queue, a [`TestClock`] and a [`ScriptedDeliverer`], so
//! worker and reconciler behavior can be driven step by step without a
//! database, a Redis server or real time passing. [`TestDatabase`] is the
//! exception: it provisions a real PostgreSQL database for repository tests.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod deliverer;
pub mod env;
pub mod fixtures;

pub use database::TestDatabase;
pub use deliverer::{ScriptedDeliverer, ScriptedResponse};
pub use env::TestEnv;
pub use fixtures::{EndpointBuilder, EventBuilder};
pub use hookline_core::{Clock, TestClock};
