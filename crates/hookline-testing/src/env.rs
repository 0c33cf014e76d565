//! In-memory environment for driving the engine deterministically.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use hookline_core::{Attempt, Clock, Endpoint, Event, TestClock, Workspace, WorkspaceId};
use hookline_delivery::{
    engine::StatsCounters,
    plugin::{NoPlugins, PluginSource},
    queue::{InMemoryTaskQueue, DEFAULT_VISIBILITY_TIMEOUT},
    storage::mock::MockLedger,
    DeliveryWorker, Reconciler, ReconcilerConfig, TaskOutcome, TaskQueue, TaskScheduler,
    WorkerConfig,
};

use crate::{
    deliverer::ScriptedDeliverer,
    fixtures::{EndpointBuilder, EventBuilder},
};

/// Ledger, queue, clock and deliverer wired together.
pub struct TestEnv {
    /// Virtual clock shared by every component.
    pub clock: TestClock,
    /// In-memory ledger.
    pub ledger: MockLedger,
    /// In-memory queue.
    pub queue: Arc<InMemoryTaskQueue>,
    /// Scripted network transport.
    pub deliverer: ScriptedDeliverer,
    /// Scheduler shared by the worker and reconciler.
    pub scheduler: Arc<TaskScheduler>,
    /// Counters the worker and reconciler record into.
    pub stats: Arc<StatsCounters>,
    /// Workspace owning generated fixtures.
    pub workspace_id: WorkspaceId,
    plugins: Arc<dyn PluginSource>,
}

impl TestEnv {
    /// Creates an environment with the default visibility timeout.
    pub async fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT).await
    }

    /// Creates an environment whose queue hides claimed tasks for `timeout`.
    pub async fn with_visibility_timeout(timeout: Duration) -> Self {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap_or_else(Utc::now);
        let clock = TestClock::starting_at(start);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let ledger = MockLedger::new();
        let queue = Arc::new(InMemoryTaskQueue::with_visibility_timeout(shared.clone(), timeout));
        let scheduler = Arc::new(TaskScheduler::new(queue.clone(), Arc::new(ledger.clone()), shared));

        let workspace_id = WorkspaceId::new();
        ledger
            .add_workspace(Workspace { id: workspace_id, name: "test".to_string(), created_at: start })
            .await;

        Self {
            clock,
            ledger,
            queue,
            deliverer: ScriptedDeliverer::new(),
            scheduler,
            stats: Arc::new(StatsCounters::default()),
            workspace_id,
            plugins: Arc::new(NoPlugins),
        }
    }

    /// Simulates a process restart: the ledger, clock and deliverer carry
    /// over, the in-memory queue and counters start empty.
    pub fn restart(&self) -> Self {
        let shared: Arc<dyn Clock> = Arc::new(self.clock.clone());
        let queue = Arc::new(InMemoryTaskQueue::with_visibility_timeout(
            shared.clone(),
            self.queue.visibility_timeout(),
        ));
        let scheduler =
            Arc::new(TaskScheduler::new(queue.clone(), Arc::new(self.ledger.clone()), shared));

        Self {
            clock: self.clock.clone(),
            ledger: self.ledger.clone(),
            queue,
            deliverer: self.deliverer.clone(),
            scheduler,
            stats: Arc::new(StatsCounters::default()),
            workspace_id: self.workspace_id,
            plugins: self.plugins.clone(),
        }
    }

    /// Uses `plugins` for workers built afterwards.
    pub fn set_plugins(&mut self, plugins: Arc<dyn PluginSource>) {
        self.plugins = plugins;
    }

    /// Returns an endpoint builder for this environment's workspace.
    pub fn endpoint(&self) -> EndpointBuilder {
        EndpointBuilder::new(self.workspace_id)
    }

    /// Builds and stores an endpoint.
    pub async fn create_endpoint(&self, builder: EndpointBuilder) -> Endpoint {
        let endpoint = builder.build(self.clock.now_utc());
        self.ledger.add_endpoint(endpoint.clone()).await;
        endpoint
    }

    /// Builds and stores an event with a generated payload.
    pub async fn create_event(&self) -> Event {
        self.create_event_with(EventBuilder::new(self.workspace_id)).await
    }

    /// Builds and stores an event.
    pub async fn create_event_with(&self, builder: EventBuilder) -> Event {
        let event = builder.build(self.clock.now_utc());
        self.ledger.add_event(event.clone()).await;
        event
    }

    /// Records the first attempt of a lineage and schedules it, the way the
    /// ingestion path does.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger or queue rejects it.
    pub async fn ingest(&self, event: &Event, endpoint: &Endpoint) -> Result<Attempt> {
        let attempt = Attempt::first(event, endpoint, self.clock.now_utc());
        self.ledger.add_attempt(attempt.clone()).await;
        self.scheduler
            .schedule(std::slice::from_ref(&attempt))
            .await
            .context("failed to schedule first attempt")?;
        Ok(attempt)
    }

    /// Records the first attempt without enqueueing it, as if the enqueue
    /// step was lost.
    pub async fn record_unqueued(&self, event: &Event, endpoint: &Endpoint) -> Attempt {
        let attempt = Attempt::first(event, endpoint, self.clock.now_utc());
        self.ledger.add_attempt(attempt.clone()).await;
        attempt
    }

    /// Builds a worker over this environment.
    pub fn worker(&self) -> Arc<DeliveryWorker> {
        Arc::new(DeliveryWorker::new(
            self.queue.clone(),
            Arc::new(self.ledger.clone()),
            Arc::new(self.deliverer.clone()),
            self.plugins.clone(),
            self.scheduler.clone(),
            Arc::new(self.clock.clone()),
            WorkerConfig::default(),
            self.stats.clone(),
        ))
    }

    /// Builds a reconciler over this environment.
    pub fn reconciler(&self, config: ReconcilerConfig) -> Reconciler {
        Reconciler::new(
            Arc::new(self.ledger.clone()),
            self.scheduler.clone(),
            Arc::new(self.clock.clone()),
            config,
            self.stats.clone(),
        )
    }

    /// Claims every due task and handles them one after another.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue fails.
    pub async fn process_due(&self) -> Result<Vec<TaskOutcome>> {
        let worker = self.worker();
        let mut outcomes = Vec::new();
        loop {
            let tasks = self.queue.get(20).await.context("failed to claim tasks")?;
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                let outcome = worker.handle(task).await;
                self.stats.record(&outcome);
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}
