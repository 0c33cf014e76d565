//! Ledger contract used by the worker, scheduler and reconciler.
//!
//! The ledger is the durable source of truth for attempts; the queue can be
//! rebuilt from it at any time. Production uses [`PostgresLedger`] over the
//! `hookline_core` repositories, tests use [`mock::MockLedger`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookline_core::{
    error::Result,
    models::{
        Attempt, AttemptDetail, AttemptErrorCode, AttemptId, AttemptResult, AttemptStatus,
        Endpoint, EndpointId, Event, EventId, Workspace, WorkspaceId,
    },
    storage::Storage,
};

type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Ledger operations required by the delivery engine.
pub trait Ledger: Send + Sync + 'static {
    /// Loads a workspace.
    fn get_workspace(&self, id: WorkspaceId) -> LedgerFuture<'_, Option<Workspace>>;

    /// Loads an event.
    fn get_event(&self, id: EventId) -> LedgerFuture<'_, Option<Event>>;

    /// Loads an endpoint.
    fn get_endpoint(&self, id: EndpointId) -> LedgerFuture<'_, Option<Endpoint>>;

    /// Loads an attempt.
    fn get_attempt(&self, id: AttemptId) -> LedgerFuture<'_, Option<Attempt>>;

    /// Loads the request/response capture of an attempt.
    fn get_attempt_detail(&self, id: AttemptId) -> LedgerFuture<'_, Option<AttemptDetail>>;

    /// Lists up to `batch_size` attempts in `Init` state that are due by
    /// `due_before` and were created no later than `created_before`.
    fn list_unqueued(
        &self,
        batch_size: usize,
        due_before: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> LedgerFuture<'_, Vec<Attempt>>;

    /// Inserts a new attempt.
    fn insert_attempt(&self, attempt: Attempt) -> LedgerFuture<'_, ()>;

    /// Sets the status of the given attempts, skipping terminal ones.
    /// Returns how many rows changed.
    fn update_status(&self, ids: Vec<AttemptId>, status: AttemptStatus) -> LedgerFuture<'_, u64>;

    /// Returns every `Queued` attempt to `Init`. Returns how many rows
    /// changed.
    fn reset_queued(&self) -> LedgerFuture<'_, u64>;

    /// Finalizes an attempt that never reached delivery.
    fn update_error_code(
        &self,
        id: AttemptId,
        status: AttemptStatus,
        error_code: AttemptErrorCode,
    ) -> LedgerFuture<'_, ()>;

    /// Records the outcome of an executed delivery.
    fn update_delivery(&self, id: AttemptId, result: AttemptResult) -> LedgerFuture<'_, ()>;

    /// Writes the capture of an attempt, replacing any previous one.
    fn upsert_attempt_detail(&self, detail: AttemptDetail) -> LedgerFuture<'_, ()>;
}

/// [`Ledger`] backed by PostgreSQL.
pub struct PostgresLedger {
    storage: Arc<Storage>,
}

impl PostgresLedger {
    /// Wraps the core repositories.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl Ledger for PostgresLedger {
    fn get_workspace(&self, id: WorkspaceId) -> LedgerFuture<'_, Option<Workspace>> {
        Box::pin(async move { self.storage.workspaces.find_by_id(id).await })
    }

    fn get_event(&self, id: EventId) -> LedgerFuture<'_, Option<Event>> {
        Box::pin(async move { self.storage.events.find_by_id(id).await })
    }

    fn get_endpoint(&self, id: EndpointId) -> LedgerFuture<'_, Option<Endpoint>> {
        Box::pin(async move { self.storage.endpoints.find_by_id(id).await })
    }

    fn get_attempt(&self, id: AttemptId) -> LedgerFuture<'_, Option<Attempt>> {
        Box::pin(async move { self.storage.attempts.find_by_id(id).await })
    }

    fn get_attempt_detail(&self, id: AttemptId) -> LedgerFuture<'_, Option<AttemptDetail>> {
        Box::pin(async move { self.storage.attempt_details.find_by_id(id).await })
    }

    fn list_unqueued(
        &self,
        batch_size: usize,
        due_before: DateTime<Utc>,
        created_before: DateTime<Utc>,
    ) -> LedgerFuture<'_, Vec<Attempt>> {
        Box::pin(async move {
            self.storage.attempts.list_unqueued(batch_size, created_before, due_before).await
        })
    }

    fn insert_attempt(&self, attempt: Attempt) -> LedgerFuture<'_, ()> {
        Box::pin(async move { self.storage.attempts.create(&attempt).await })
    }

    fn update_status(&self, ids: Vec<AttemptId>, status: AttemptStatus) -> LedgerFuture<'_, u64> {
        Box::pin(async move { self.storage.attempts.update_status(&ids, status).await })
    }

    fn reset_queued(&self) -> LedgerFuture<'_, u64> {
        Box::pin(async move { self.storage.attempts.reset_queued().await })
    }

    fn update_error_code(
        &self,
        id: AttemptId,
        status: AttemptStatus,
        error_code: AttemptErrorCode,
    ) -> LedgerFuture<'_, ()> {
        Box::pin(async move { self.storage.attempts.update_error_code(id, status, error_code).await })
    }

    fn update_delivery(&self, id: AttemptId, result: AttemptResult) -> LedgerFuture<'_, ()> {
        Box::pin(async move { self.storage.attempts.update_delivery(id, &result).await })
    }

    fn upsert_attempt_detail(&self, detail: AttemptDetail) -> LedgerFuture<'_, ()> {
        Box::pin(async move { self.storage.attempt_details.upsert(&detail).await })
    }
}

pub mod mock {
    //! In-memory ledger for tests.
    //!
    //! Mirrors the PostgreSQL semantics the engine relies on, including the
    //! terminal-status guard on bulk status updates, and lets tests make
    //! individual operations fail.

    use std::{
        collections::{HashMap, HashSet},
        sync::Arc,
    };

    use hookline_core::error::CoreError;
    use tokio::sync::RwLock;

    use super::{
        Attempt, AttemptDetail, AttemptErrorCode, AttemptId, AttemptResult, AttemptStatus,
        DateTime, Endpoint, EndpointId, Event, EventId, Ledger, LedgerFuture, Result, Utc,
        Workspace, WorkspaceId,
    };

    /// Ledger operations that can be made to fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum LedgerOp {
        /// [`Ledger::get_event`]
        GetEvent,
        /// [`Ledger::get_endpoint`]
        GetEndpoint,
        /// [`Ledger::get_attempt`]
        GetAttempt,
        /// [`Ledger::list_unqueued`]
        ListUnqueued,
        /// [`Ledger::insert_attempt`]
        InsertAttempt,
        /// [`Ledger::update_status`]
        UpdateStatus,
        /// [`Ledger::reset_queued`]
        ResetQueued,
        /// [`Ledger::update_error_code`]
        UpdateErrorCode,
        /// [`Ledger::update_delivery`]
        UpdateDelivery,
        /// [`Ledger::upsert_attempt_detail`]
        UpsertAttemptDetail,
    }

    /// In-memory [`Ledger`].
    #[derive(Clone, Default)]
    pub struct MockLedger {
        workspaces: Arc<RwLock<HashMap<WorkspaceId, Workspace>>>,
        events: Arc<RwLock<HashMap<EventId, Event>>>,
        endpoints: Arc<RwLock<HashMap<EndpointId, Endpoint>>>,
        attempts: Arc<RwLock<HashMap<AttemptId, Attempt>>>,
        details: Arc<RwLock<HashMap<AttemptId, AttemptDetail>>>,
        failing: Arc<RwLock<HashSet<LedgerOp>>>,
    }

    impl MockLedger {
        /// Creates an empty ledger.
        pub fn new() -> Self {
            Self::default()
        }

        /// Stores a workspace.
        pub async fn add_workspace(&self, workspace: Workspace) {
            self.workspaces.write().await.insert(workspace.id, workspace);
        }

        /// Stores an event.
        pub async fn add_event(&self, event: Event) {
            self.events.write().await.insert(event.id, event);
        }

        /// Stores or replaces an endpoint.
        pub async fn add_endpoint(&self, endpoint: Endpoint) {
            self.endpoints.write().await.insert(endpoint.id, endpoint);
        }

        /// Removes an endpoint.
        pub async fn remove_endpoint(&self, id: EndpointId) {
            self.endpoints.write().await.remove(&id);
        }

        /// Removes an event.
        pub async fn remove_event(&self, id: EventId) {
            self.events.write().await.remove(&id);
        }

        /// Stores or replaces an attempt.
        pub async fn add_attempt(&self, attempt: Attempt) {
            self.attempts.write().await.insert(attempt.id, attempt);
        }

        /// Returns a copy of an attempt.
        pub async fn attempt(&self, id: AttemptId) -> Option<Attempt> {
            self.attempts.read().await.get(&id).cloned()
        }

        /// Returns a copy of an attempt detail.
        pub async fn attempt_detail(&self, id: AttemptId) -> Option<AttemptDetail> {
            self.details.read().await.get(&id).cloned()
        }

        /// Returns all attempts of a lineage ordered by attempt number.
        pub async fn lineage(&self, event_id: EventId, endpoint_id: EndpointId) -> Vec<Attempt> {
            let mut lineage: Vec<Attempt> = self
                .attempts
                .read()
                .await
                .values()
                .filter(|a| a.event_id == event_id && a.endpoint_id == endpoint_id)
                .cloned()
                .collect();
            lineage.sort_by_key(|a| a.attempt_number);
            lineage
        }

        /// Returns the number of stored attempts.
        pub async fn attempt_count(&self) -> usize {
            self.attempts.read().await.len()
        }

        /// Makes `op` fail until [`MockLedger::clear_failures`] is called.
        pub async fn fail_on(&self, op: LedgerOp) {
            self.failing.write().await.insert(op);
        }

        /// Stops injecting failures.
        pub async fn clear_failures(&self) {
            self.failing.write().await.clear();
        }

        async fn check(&self, op: LedgerOp) -> Result<()> {
            if self.failing.read().await.contains(&op) {
                return Err(CoreError::Database(format!("injected failure for {op:?}")));
            }
            Ok(())
        }
    }

    impl Ledger for MockLedger {
        fn get_workspace(&self, id: WorkspaceId) -> LedgerFuture<'_, Option<Workspace>> {
            Box::pin(async move { Ok(self.workspaces.read().await.get(&id).cloned()) })
        }

        fn get_event(&self, id: EventId) -> LedgerFuture<'_, Option<Event>> {
            Box::pin(async move {
                self.check(LedgerOp::GetEvent).await?;
                Ok(self.events.read().await.get(&id).cloned())
            })
        }

        fn get_endpoint(&self, id: EndpointId) -> LedgerFuture<'_, Option<Endpoint>> {
            Box::pin(async move {
                self.check(LedgerOp::GetEndpoint).await?;
                Ok(self.endpoints.read().await.get(&id).cloned())
            })
        }

        fn get_attempt(&self, id: AttemptId) -> LedgerFuture<'_, Option<Attempt>> {
            Box::pin(async move {
                self.check(LedgerOp::GetAttempt).await?;
                Ok(self.attempts.read().await.get(&id).cloned())
            })
        }

        fn get_attempt_detail(&self, id: AttemptId) -> LedgerFuture<'_, Option<AttemptDetail>> {
            Box::pin(async move { Ok(self.details.read().await.get(&id).cloned()) })
        }

        fn list_unqueued(
            &self,
            batch_size: usize,
            due_before: DateTime<Utc>,
            created_before: DateTime<Utc>,
        ) -> LedgerFuture<'_, Vec<Attempt>> {
            Box::pin(async move {
                self.check(LedgerOp::ListUnqueued).await?;
                let mut due: Vec<Attempt> = self
                    .attempts
                    .read()
                    .await
                    .values()
                    .filter(|a| {
                        a.status == AttemptStatus::Init
                            && a.scheduled_at <= due_before
                            && a.created_at <= created_before
                    })
                    .cloned()
                    .collect();
                due.sort_by_key(|a| a.scheduled_at);
                due.truncate(batch_size);
                Ok(due)
            })
        }

        fn insert_attempt(&self, attempt: Attempt) -> LedgerFuture<'_, ()> {
            Box::pin(async move {
                self.check(LedgerOp::InsertAttempt).await?;
                let mut attempts = self.attempts.write().await;
                if attempts.contains_key(&attempt.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "attempt {} already exists",
                        attempt.id
                    )));
                }
                attempts.insert(attempt.id, attempt);
                Ok(())
            })
        }

        fn update_status(
            &self,
            ids: Vec<AttemptId>,
            status: AttemptStatus,
        ) -> LedgerFuture<'_, u64> {
            Box::pin(async move {
                self.check(LedgerOp::UpdateStatus).await?;
                let mut attempts = self.attempts.write().await;
                let mut changed = 0;
                for id in ids {
                    if let Some(attempt) = attempts.get_mut(&id) {
                        if !attempt.status.is_terminal() {
                            attempt.status = status;
                            changed += 1;
                        }
                    }
                }
                Ok(changed)
            })
        }

        fn reset_queued(&self) -> LedgerFuture<'_, u64> {
            Box::pin(async move {
                self.check(LedgerOp::ResetQueued).await?;
                let mut changed = 0;
                for attempt in self.attempts.write().await.values_mut() {
                    if attempt.status == AttemptStatus::Queued {
                        attempt.status = AttemptStatus::Init;
                        changed += 1;
                    }
                }
                Ok(changed)
            })
        }

        fn update_error_code(
            &self,
            id: AttemptId,
            status: AttemptStatus,
            error_code: AttemptErrorCode,
        ) -> LedgerFuture<'_, ()> {
            Box::pin(async move {
                self.check(LedgerOp::UpdateErrorCode).await?;
                if let Some(attempt) = self.attempts.write().await.get_mut(&id) {
                    attempt.status = status;
                    attempt.error_code = Some(error_code);
                }
                Ok(())
            })
        }

        fn update_delivery(&self, id: AttemptId, result: AttemptResult) -> LedgerFuture<'_, ()> {
            Box::pin(async move {
                self.check(LedgerOp::UpdateDelivery).await?;
                if let Some(attempt) = self.attempts.write().await.get_mut(&id) {
                    attempt.status = result.status;
                    attempt.error_code = result.error_code;
                    attempt.request = result.request;
                    attempt.response = result.response;
                    attempt.attempted_at = Some(result.attempted_at);
                    attempt.exhausted = result.exhausted;
                }
                Ok(())
            })
        }

        fn upsert_attempt_detail(&self, detail: AttemptDetail) -> LedgerFuture<'_, ()> {
            Box::pin(async move {
                self.check(LedgerOp::UpsertAttemptDetail).await?;
                self.details.write().await.insert(detail.id, detail);
                Ok(())
            })
        }
    }
}
