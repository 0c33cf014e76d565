//! Delivery worker: the poll loop and the per-task attempt lifecycle.
//!
//! The loop claims due tasks in small batches and hands each one to its own
//! handler in a [`HandlerPool`]. A handler loads the attempt's references,
//! runs the endpoint's plugin pipeline, delivers once, records the outcome,
//! and either finishes the lineage or creates the next attempt. The task is
//! deleted only after the ledger reflects the decision; any error before
//! that leaves it to come back after the visibility timeout, and the handler
//! picks up from whatever the ledger already holds.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookline_core::{
    Attempt, AttemptDetail, AttemptErrorCode, AttemptId, AttemptRequest, AttemptResponse,
    AttemptResult, AttemptStatus, Clock, CoreError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    client::{Deliverer, DeliveryRequest, DeliveryResponse, TransportError},
    engine::StatsCounters,
    error::{DeliveryError, ErrorCategory, Result},
    handler_pool::HandlerPool,
    plugin::{OutboundRequest, PipelineOutcome, PluginContext, PluginSource},
    queue::{TaskMessage, TaskQueue},
    retry::{self, RetryDecision},
    scheduler::TaskScheduler,
    storage::Ledger,
};

/// Default number of tasks claimed per `get`.
pub const DEFAULT_POLL_BATCH_SIZE: usize = 20;

/// Poll loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Time between polls when the queue is idle.
    pub poll_interval: Duration,
    /// Tasks claimed per `get`.
    pub poll_batch_size: usize,
    /// Upper bound on concurrent handlers; 0 is unbounded.
    pub max_concurrency: usize,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_batch_size: DEFAULT_POLL_BATCH_SIZE,
            max_concurrency: 0,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// What a handler did with its task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Delivered with a 2xx response; task deleted.
    Succeeded,
    /// Delivery failed and the successor attempt was scheduled; task deleted.
    Retried {
        /// Successor attempt
        next_attempt_id: AttemptId,
        /// When the successor becomes due
        scheduled_at: DateTime<Utc>,
    },
    /// Delivery failed on the last scheduled attempt; task deleted.
    Exhausted,
    /// Delivery was not attempted; task deleted.
    Canceled {
        /// Recorded reason, absent when a plugin stopped delivery
        error_code: Option<AttemptErrorCode>,
    },
    /// The attempt already had an outcome from an earlier run; task deleted.
    AlreadyFinalized,
    /// The task could not be matched to an attempt; task deleted.
    Discarded {
        /// Why the task was dropped
        reason: String,
    },
    /// Processing stopped before a decision was recorded; task left in the
    /// queue for redelivery.
    Abandoned(DeliveryError),
}

impl TaskOutcome {
    /// Returns true if the handler removed the task from the queue.
    pub fn deleted_task(&self) -> bool {
        !matches!(self, Self::Abandoned(_))
    }
}

/// Polls the queue and runs handlers.
pub struct DeliveryWorker {
    queue: Arc<dyn TaskQueue>,
    ledger: Arc<dyn Ledger>,
    deliverer: Arc<dyn Deliverer>,
    plugins: Arc<dyn PluginSource>,
    scheduler: Arc<TaskScheduler>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    stats: Arc<StatsCounters>,
}

impl DeliveryWorker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        ledger: Arc<dyn Ledger>,
        deliverer: Arc<dyn Deliverer>,
        plugins: Arc<dyn PluginSource>,
        scheduler: Arc<TaskScheduler>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self { queue, ledger, deliverer, plugins, scheduler, clock, config, stats }
    }

    /// Returns the worker's configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs the poll loop until `token` is cancelled, then drains in-flight
    /// handlers.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] if handlers outlive the
    /// shutdown timeout. Poll failures are logged and retried on the next
    /// tick.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.poll_batch_size,
            max_concurrency = self.config.max_concurrency,
            "delivery worker starting"
        );

        let wake = self.scheduler.wake_handle();
        let mut pool = HandlerPool::new(self.config.max_concurrency, self.stats.clone());

        loop {
            if token.is_cancelled() {
                break;
            }

            match self.poll_once(&mut pool, &token).await {
                Ok(0) => {},
                Ok(claimed) => debug!(claimed, in_flight = pool.len(), "dispatched tasks"),
                Err(e) => error!(error = %e, "failed to poll task queue"),
            }
            pool.reap();

            tokio::select! {
                () = token.cancelled() => break,
                () = wake.notified() => {},
                () = self.clock.sleep(self.config.poll_interval) => {},
            }
        }

        info!(in_flight = pool.len(), "delivery worker stopping");
        let drained = pool.drain(self.config.shutdown_timeout).await;
        info!("delivery worker stopped");
        drained
    }

    /// Claims batches until the queue has nothing due and spawns a handler
    /// per task. Returns the number of tasks claimed.
    ///
    /// # Errors
    ///
    /// Returns a queue error if `get` fails. Tasks already dispatched keep
    /// running.
    pub async fn poll_once(
        self: &Arc<Self>,
        pool: &mut HandlerPool,
        token: &CancellationToken,
    ) -> Result<usize> {
        let mut claimed = 0;

        while !token.is_cancelled() {
            let tasks = self.queue.get(self.config.poll_batch_size).await?;
            if tasks.is_empty() {
                break;
            }

            claimed += tasks.len();
            self.stats.record_polled(tasks.len());

            for task in tasks {
                let worker = Arc::clone(self);
                pool.spawn(async move { worker.handle(task).await }).await;
            }
        }

        Ok(claimed)
    }

    /// Runs the full lifecycle for one task.
    pub async fn handle(&self, task: TaskMessage) -> TaskOutcome {
        let span = info_span!("handle_task", attempt_id = %task.id);

        async {
            match self.process(&task).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    if e.category() == ErrorCategory::Plugin {
                        warn!(error = %e, "plugin failed; task left for redelivery");
                    } else {
                        error!(
                            error = %e,
                            category = %e.category(),
                            "task processing failed; task left for redelivery"
                        );
                    }
                    TaskOutcome::Abandoned(e)
                },
            }
        }
        .instrument(span)
        .await
    }

    async fn process(&self, task: &TaskMessage) -> Result<TaskOutcome> {
        let payload = match task.payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "undecodable task payload; discarding");
                self.queue.delete(task).await?;
                return Ok(TaskOutcome::Discarded { reason: e.to_string() });
            },
        };

        let Some(attempt) = self.ledger.get_attempt(task.id).await? else {
            warn!(event_id = %payload.event_id, "no attempt recorded for task; discarding");
            self.queue.delete(task).await?;
            return Ok(TaskOutcome::Discarded { reason: "attempt not found".to_string() });
        };

        if attempt.status.is_terminal() {
            return self.resume_finalized(task, &attempt).await;
        }

        let Some(endpoint) = self.ledger.get_endpoint(payload.endpoint_id).await? else {
            return self.cancel(task, &attempt, AttemptErrorCode::EndpointNotFound).await;
        };
        if !endpoint.enabled {
            return self.cancel(task, &attempt, AttemptErrorCode::EndpointDisabled).await;
        }

        let Some(event) = self.ledger.get_event(payload.event_id).await? else {
            return self.cancel(task, &attempt, AttemptErrorCode::Unknown).await;
        };

        let policy = retry::policy_for(&endpoint.retry)?;
        let pipeline = self.plugins.pipeline_for(&endpoint).await?;

        let started_at = self.clock.now_utc();
        let mut request = OutboundRequest::from_endpoint(&endpoint, &event);
        let context = PluginContext {
            event: &event,
            endpoint: &endpoint,
            attempt_id: attempt.id,
            attempt_number: attempt.attempt_number,
            now: started_at,
        };

        if let PipelineOutcome::Terminated { plugin, reason } =
            pipeline.run(&mut request, &context).await?
        {
            info!(plugin = %plugin, reason = %reason, "plugin terminated delivery");
            let result = AttemptResult {
                status: AttemptStatus::Canceled,
                error_code: None,
                request: None,
                response: None,
                attempted_at: started_at,
                exhausted: false,
            };
            self.ledger.update_delivery(attempt.id, result).await?;
            self.queue.delete(task).await?;
            return Ok(TaskOutcome::Canceled { error_code: None });
        }

        let delivery = DeliveryRequest {
            url: request.url,
            method: request.method,
            headers: request.headers,
            payload: request.payload,
            timeout: endpoint.timeout(),
        };

        debug!(
            endpoint_id = %endpoint.id,
            attempt = attempt.attempt_number,
            url = %delivery.url,
            "delivering"
        );
        let response = self.deliverer.deliver(&delivery).await;
        let finished_at = self.clock.now_utc();

        let decision = if response.is_2xx() {
            None
        } else {
            Some(retry::decide(policy.as_ref(), attempt.attempt_number, finished_at))
        };

        let result = AttemptResult {
            status: if decision.is_none() { AttemptStatus::Success } else { AttemptStatus::Failure },
            error_code: decision.as_ref().and_then(|_| error_code_for(&response)),
            request: Some(AttemptRequest {
                method: delivery.method.as_str().to_string(),
                url: delivery.url.clone(),
            }),
            response: response.status_code.map(|status| AttemptResponse {
                status,
                latency_ms: u64::try_from(response.latency.as_millis()).unwrap_or(u64::MAX),
            }),
            attempted_at: finished_at,
            exhausted: matches!(decision, Some(RetryDecision::Exhausted)),
        };
        self.ledger.update_delivery(attempt.id, result).await?;
        self.record_detail(&attempt, &delivery, &response).await;

        match decision {
            None => {
                self.queue.delete(task).await?;
                info!(
                    status = response.status_code,
                    latency_ms = response.latency.as_millis(),
                    attempt = attempt.attempt_number,
                    "webhook delivered"
                );
                Ok(TaskOutcome::Succeeded)
            },
            Some(RetryDecision::Exhausted) => {
                self.queue.delete(task).await?;
                warn!(
                    status = response.status_code,
                    attempt = attempt.attempt_number,
                    "delivery failed; retry schedule exhausted"
                );
                Ok(TaskOutcome::Exhausted)
            },
            Some(RetryDecision::Retry { next_attempt_at }) => {
                let successor = self.schedule_successor(&attempt, next_attempt_at).await?;
                self.queue.delete(task).await?;
                info!(
                    status = response.status_code,
                    attempt = attempt.attempt_number,
                    next_attempt_at = %next_attempt_at,
                    "delivery failed; retry scheduled"
                );
                Ok(TaskOutcome::Retried {
                    next_attempt_id: successor.id,
                    scheduled_at: successor.scheduled_at,
                })
            },
        }
    }

    async fn cancel(
        &self,
        task: &TaskMessage,
        attempt: &Attempt,
        error_code: AttemptErrorCode,
    ) -> Result<TaskOutcome> {
        info!(error_code = %error_code, "attempt canceled");
        self.ledger.update_error_code(attempt.id, AttemptStatus::Canceled, error_code).await?;
        self.queue.delete(task).await?;
        Ok(TaskOutcome::Canceled { error_code: Some(error_code) })
    }

    /// Finishes a task whose attempt was finalized by an earlier run that
    /// died before deleting it.
    async fn resume_finalized(&self, task: &TaskMessage, attempt: &Attempt) -> Result<TaskOutcome> {
        if attempt.status == AttemptStatus::Failure && !attempt.exhausted {
            self.recover_successor(attempt).await?;
        }
        self.queue.delete(task).await?;
        debug!(status = %attempt.status, "attempt already finalized; task removed");
        Ok(TaskOutcome::AlreadyFinalized)
    }

    async fn recover_successor(&self, attempt: &Attempt) -> Result<()> {
        if let Some(existing) = self.ledger.get_attempt(attempt.id.successor()).await? {
            if existing.status == AttemptStatus::Init {
                self.scheduler.schedule(std::slice::from_ref(&existing)).await?;
            }
            return Ok(());
        }

        let Some(endpoint) = self.ledger.get_endpoint(attempt.endpoint_id).await? else {
            warn!(
                endpoint_id = %attempt.endpoint_id,
                "endpoint gone; lineage ends without the lost successor"
            );
            return Ok(());
        };
        if self.ledger.get_event(attempt.event_id).await?.is_none() {
            warn!(
                event_id = %attempt.event_id,
                "event gone; lineage ends without the lost successor"
            );
            return Ok(());
        }

        let policy = retry::policy_for(&endpoint.retry)?;
        let finished_at = attempt.attempted_at.unwrap_or_else(|| self.clock.now_utc());
        if let RetryDecision::Retry { next_attempt_at } =
            retry::decide(policy.as_ref(), attempt.attempt_number, finished_at)
        {
            info!(attempt = attempt.attempt_number, "recovering missing successor attempt");
            self.schedule_successor(attempt, next_attempt_at).await?;
        }
        Ok(())
    }

    /// Inserts the successor of `attempt` and hands it to the scheduler.
    ///
    /// The successor id is derived from the predecessor, so a second insert
    /// from a re-run handler collides and the existing row is used instead.
    async fn schedule_successor(
        &self,
        attempt: &Attempt,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Attempt> {
        let successor = attempt.successor(scheduled_at, self.clock.now_utc());

        let successor = match self.ledger.insert_attempt(successor.clone()).await {
            Ok(()) => successor,
            Err(CoreError::ConstraintViolation(_)) => {
                self.ledger.get_attempt(successor.id).await?.ok_or_else(|| {
                    DeliveryError::ledger(format!(
                        "successor {} rejected but not found",
                        successor.id
                    ))
                })?
            },
            Err(e) => return Err(e.into()),
        };

        if successor.status == AttemptStatus::Init {
            self.scheduler.schedule(std::slice::from_ref(&successor)).await?;
        }
        Ok(successor)
    }

    async fn record_detail(
        &self,
        attempt: &Attempt,
        request: &DeliveryRequest,
        response: &DeliveryResponse,
    ) {
        let received = response.status_code.is_some();
        let detail = AttemptDetail {
            id: attempt.id,
            workspace_id: attempt.workspace_id,
            request_headers: request.headers.clone(),
            request_body: Some(request.payload.to_vec()),
            response_headers: received.then(|| response.headers.clone()),
            response_body: received.then(|| response.body.clone()),
        };

        if let Err(e) = self.ledger.upsert_attempt_detail(detail).await {
            warn!(error = %e, "failed to store attempt detail");
        }
    }
}

/// Error code recorded for a failed delivery.
///
/// A non-2xx response carries no code; the status is on the response
/// summary.
fn error_code_for(response: &DeliveryResponse) -> Option<AttemptErrorCode> {
    match response.error {
        Some(TransportError::Timeout) => Some(AttemptErrorCode::Timeout),
        Some(TransportError::Denied(_) | TransportError::Other(_)) => {
            Some(AttemptErrorCode::Unknown)
        },
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use hookline_core::{
        Endpoint, EndpointId, EndpointRetry, Event, EventId, HttpMethod, TestClock, WorkspaceId,
    };

    use super::*;
    use crate::{
        plugin::{NoPlugins, OutboundPlugin, PluginOutcome, StaticPlugins},
        queue::InMemoryTaskQueue,
        storage::mock::MockLedger,
    };

    #[derive(Debug)]
    struct FixedStatus(u16);

    #[async_trait]
    impl Deliverer for FixedStatus {
        async fn deliver(&self, _request: &DeliveryRequest) -> DeliveryResponse {
            DeliveryResponse {
                status_code: Some(self.0),
                latency: Duration::from_millis(12),
                ..DeliveryResponse::default()
            }
        }
    }

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl OutboundPlugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn execute(
            &self,
            _request: &mut OutboundRequest,
            _context: &PluginContext<'_>,
        ) -> Result<PluginOutcome> {
            Err(DeliveryError::internal("signing key unavailable"))
        }
    }

    struct Harness {
        clock: TestClock,
        queue: Arc<InMemoryTaskQueue>,
        ledger: MockLedger,
        scheduler: Arc<TaskScheduler>,
        endpoint: Endpoint,
        event: Event,
    }

    impl Harness {
        async fn new() -> Self {
            let clock =
                TestClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
            let shared: Arc<dyn Clock> = Arc::new(clock.clone());
            let queue = Arc::new(InMemoryTaskQueue::new(shared.clone()));
            let ledger = MockLedger::new();
            let scheduler =
                Arc::new(TaskScheduler::new(queue.clone(), Arc::new(ledger.clone()), shared));
            let now = clock.now_utc();
            let workspace_id = WorkspaceId::new();
            let endpoint = Endpoint {
                id: EndpointId::new(),
                workspace_id,
                name: None,
                url: "https://example.com/hook".to_string(),
                method: HttpMethod::Post,
                headers: HashMap::new(),
                timeout_ms: 1000,
                enabled: true,
                retry: EndpointRetry::default(),
                created_at: now,
                updated_at: now,
            };
            let event =
                Event { id: EventId::new(), workspace_id, data: b"{}".to_vec(), created_at: now };
            ledger.add_endpoint(endpoint.clone()).await;
            ledger.add_event(event.clone()).await;
            Self { clock, queue, ledger, scheduler, endpoint, event }
        }

        fn worker(&self, deliverer: Arc<dyn Deliverer>, plugins: Arc<dyn PluginSource>) -> DeliveryWorker {
            DeliveryWorker::new(
                self.queue.clone(),
                Arc::new(self.ledger.clone()),
                deliverer,
                plugins,
                self.scheduler.clone(),
                Arc::new(self.clock.clone()),
                WorkerConfig::default(),
                Arc::new(StatsCounters::default()),
            )
        }

        async fn enqueue_first(&self) -> (Attempt, TaskMessage) {
            let attempt = Attempt::first(&self.event, &self.endpoint, self.clock.now_utc());
            self.ledger.add_attempt(attempt.clone()).await;
            self.scheduler.schedule(std::slice::from_ref(&attempt)).await.unwrap();
            let task = self.queue.get(1).await.unwrap().remove(0);
            (attempt, task)
        }
    }

    #[tokio::test]
    async fn success_finalizes_and_deletes() {
        let h = Harness::new().await;
        let (attempt, task) = h.enqueue_first().await;

        let outcome = h.worker(Arc::new(FixedStatus(200)), Arc::new(NoPlugins)).handle(task).await;

        assert!(matches!(outcome, TaskOutcome::Succeeded));
        let stored = h.ledger.attempt(attempt.id).await.unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
        assert_eq!(stored.response.unwrap().status, 200);
        assert_eq!(stored.error_code, None);
        assert_eq!(h.queue.in_flight().await, 0);
        assert!(h.ledger.attempt_detail(attempt.id).await.is_some());
    }

    #[tokio::test]
    async fn undecodable_payload_is_discarded() {
        let h = Harness::new().await;
        let task = TaskMessage {
            id: AttemptId::new(),
            data: b"not json".to_vec(),
            scheduled_at: h.clock.now_utc(),
        };
        h.queue.add(std::slice::from_ref(&task)).await.unwrap();
        let task = h.queue.get(1).await.unwrap().remove(0);

        let outcome = h.worker(Arc::new(FixedStatus(200)), Arc::new(NoPlugins)).handle(task).await;

        assert!(matches!(outcome, TaskOutcome::Discarded { .. }));
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn plugin_error_abandons_without_ledger_write() {
        let h = Harness::new().await;
        let (attempt, task) = h.enqueue_first().await;
        let plugins = StaticPlugins::new().bind(h.endpoint.id, Arc::new(Failing));

        let outcome = h.worker(Arc::new(FixedStatus(200)), Arc::new(plugins)).handle(task).await;

        assert!(matches!(
            outcome,
            TaskOutcome::Abandoned(DeliveryError::Plugin { ref plugin, .. }) if plugin == "failing"
        ));
        assert!(!outcome.deleted_task());
        assert_eq!(h.ledger.attempt(attempt.id).await.unwrap().status, AttemptStatus::Queued);
        assert_eq!(h.queue.in_flight().await, 1);
    }

    #[tokio::test]
    async fn backoff_strategy_abandons_before_delivery() {
        let mut h = Harness::new().await;
        h.endpoint.retry.strategy = hookline_core::RetryStrategy::Backoff;
        h.ledger.add_endpoint(h.endpoint.clone()).await;
        let (_, task) = h.enqueue_first().await;

        let outcome = h.worker(Arc::new(FixedStatus(200)), Arc::new(NoPlugins)).handle(task).await;

        assert!(matches!(outcome, TaskOutcome::Abandoned(DeliveryError::UnsupportedStrategy { .. })));
    }

    #[test]
    fn transport_errors_map_to_codes() {
        let timeout =
            DeliveryResponse { error: Some(TransportError::Timeout), ..DeliveryResponse::default() };
        let refused = DeliveryResponse {
            error: Some(TransportError::Other("refused".to_string())),
            ..DeliveryResponse::default()
        };
        let status = DeliveryResponse { status_code: Some(503), ..DeliveryResponse::default() };

        assert_eq!(error_code_for(&timeout), Some(AttemptErrorCode::Timeout));
        assert_eq!(error_code_for(&refused), Some(AttemptErrorCode::Unknown));
        assert_eq!(error_code_for(&status), None);
    }
}
