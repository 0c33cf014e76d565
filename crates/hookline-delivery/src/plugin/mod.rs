//! Outbound plugin pipeline.
//!
//! A [`Pipeline`] is an explicit, ordered list of plugins built for one
//! endpoint by a [`PluginSource`] and handed to the worker. There is no
//! process-wide registry. Plugins run highest priority first; equal
//! priorities run in descending name order so the sequence is stable.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hookline_core::{AttemptId, Endpoint, EndpointId, Event, HttpMethod};

use crate::error::{DeliveryError, Result};

pub mod signature;

pub use signature::SignaturePlugin;

/// Request as seen and mutated by plugins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Headers to send.
    pub headers: HashMap<String, String>,
    /// Body to send.
    pub payload: Bytes,
}

impl OutboundRequest {
    /// Builds the initial request from endpoint configuration and event
    /// payload.
    pub fn from_endpoint(endpoint: &Endpoint, event: &Event) -> Self {
        Self {
            url: endpoint.url.clone(),
            method: endpoint.method,
            headers: endpoint.headers.clone(),
            payload: Bytes::from(event.data.clone()),
        }
    }
}

/// Read-only data available to plugins.
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    /// Event being delivered.
    pub event: &'a Event,
    /// Destination endpoint.
    pub endpoint: &'a Endpoint,
    /// Attempt being executed.
    pub attempt_id: AttemptId,
    /// Attempt number within the lineage.
    pub attempt_number: u32,
    /// Time the handler started.
    pub now: DateTime<Utc>,
}

/// What a plugin wants to happen next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginOutcome {
    /// Run the next plugin, then deliver.
    Continue,
    /// Skip delivery; the attempt is canceled.
    Terminate {
        /// Logged reason
        reason: String,
    },
}

/// A transformation applied to requests before delivery.
#[async_trait]
pub trait OutboundPlugin: Send + Sync + fmt::Debug {
    /// Stable plugin name.
    fn name(&self) -> &str;

    /// Ordering key; higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Mutates `request` or stops the pipeline.
    async fn execute(
        &self,
        request: &mut OutboundRequest,
        context: &PluginContext<'_>,
    ) -> Result<PluginOutcome>;
}

/// Result of running a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every plugin continued.
    Deliver,
    /// A plugin terminated the pipeline.
    Terminated {
        /// Name of the terminating plugin
        plugin: String,
        /// Reason it gave
        reason: String,
    },
}

/// Ordered plugin chain for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    plugins: Vec<Arc<dyn OutboundPlugin>>,
}

impl Pipeline {
    /// Creates a pipeline, ordering plugins by priority then name, both
    /// descending.
    pub fn new(mut plugins: Vec<Arc<dyn OutboundPlugin>>) -> Self {
        plugins.sort_by(|a, b| {
            b.priority().cmp(&a.priority()).then_with(|| b.name().cmp(a.name()))
        });
        Self { plugins }
    }

    /// Creates a pipeline with no plugins.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns plugin names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Returns the number of plugins.
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Returns true if the pipeline has no plugins.
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Runs every plugin in order.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Plugin`] naming the first plugin that failed.
    pub async fn run(
        &self,
        request: &mut OutboundRequest,
        context: &PluginContext<'_>,
    ) -> Result<PipelineOutcome> {
        for plugin in &self.plugins {
            let outcome = plugin.execute(request, context).await.map_err(|e| match e {
                DeliveryError::Plugin { .. } => e,
                other => DeliveryError::plugin(plugin.name(), other.to_string()),
            })?;

            if let PluginOutcome::Terminate { reason } = outcome {
                return Ok(PipelineOutcome::Terminated { plugin: plugin.name().to_string(), reason });
            }
        }
        Ok(PipelineOutcome::Deliver)
    }
}

/// Builds the pipeline bound to an endpoint.
#[async_trait]
pub trait PluginSource: Send + Sync + 'static {
    /// Returns the plugins configured for `endpoint`.
    async fn pipeline_for(&self, endpoint: &Endpoint) -> Result<Pipeline>;
}

/// Source that never configures plugins.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPlugins;

#[async_trait]
impl PluginSource for NoPlugins {
    async fn pipeline_for(&self, _endpoint: &Endpoint) -> Result<Pipeline> {
        Ok(Pipeline::empty())
    }
}

/// Source with plugin bindings fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticPlugins {
    bindings: HashMap<EndpointId, Vec<Arc<dyn OutboundPlugin>>>,
}

impl StaticPlugins {
    /// Creates a source with no bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `plugin` to `endpoint_id`.
    #[must_use]
    pub fn bind(mut self, endpoint_id: EndpointId, plugin: Arc<dyn OutboundPlugin>) -> Self {
        self.bindings.entry(endpoint_id).or_default().push(plugin);
        self
    }
}

#[async_trait]
impl PluginSource for StaticPlugins {
    async fn pipeline_for(&self, endpoint: &Endpoint) -> Result<Pipeline> {
        let plugins = self.bindings.get(&endpoint.id).cloned().unwrap_or_default();
        Ok(Pipeline::new(plugins))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use hookline_core::{EndpointRetry, EventId, WorkspaceId};

    use super::*;

    #[derive(Debug)]
    struct Recording {
        name: &'static str,
        priority: i32,
        log: Arc<Mutex<Vec<&'static str>>>,
        outcome: PluginOutcome,
        fail: bool,
    }

    impl Recording {
        fn new(name: &'static str, priority: i32, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self { name, priority, log: log.clone(), outcome: PluginOutcome::Continue, fail: false }
        }
    }

    #[async_trait]
    impl OutboundPlugin for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn execute(
            &self,
            request: &mut OutboundRequest,
            _context: &PluginContext<'_>,
        ) -> Result<PluginOutcome> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err(DeliveryError::internal("boom"));
            }
            request.headers.insert(format!("x-{}", self.name), "1".to_string());
            Ok(self.outcome.clone())
        }
    }

    fn fixtures() -> (Endpoint, Event) {
        let workspace_id = WorkspaceId::new();
        let endpoint = Endpoint {
            id: EndpointId::new(),
            workspace_id,
            name: None,
            url: "https://example.com".to_string(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            timeout_ms: 1000,
            enabled: true,
            retry: EndpointRetry::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let event =
            Event { id: EventId::new(), workspace_id, data: b"{}".to_vec(), created_at: Utc::now() };
        (endpoint, event)
    }

    fn context<'a>(endpoint: &'a Endpoint, event: &'a Event) -> PluginContext<'a> {
        PluginContext { event, endpoint, attempt_id: AttemptId::new(), attempt_number: 1, now: Utc::now() }
    }

    #[tokio::test]
    async fn plugins_run_by_priority_then_name_descending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            Arc::new(Recording::new("alpha", 0, &log)),
            Arc::new(Recording::new("zeta", 0, &log)),
            Arc::new(Recording::new("first", 10, &log)),
        ]);
        let (endpoint, event) = fixtures();
        let mut request = OutboundRequest::from_endpoint(&endpoint, &event);

        let outcome = pipeline.run(&mut request, &context(&endpoint, &event)).await.unwrap();

        assert_eq!(outcome, PipelineOutcome::Deliver);
        assert_eq!(pipeline.names(), vec!["first", "zeta", "alpha"]);
        assert_eq!(*log.lock().unwrap(), vec!["first", "zeta", "alpha"]);
        assert_eq!(request.headers.len(), 3);
    }

    #[tokio::test]
    async fn terminate_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stopper = Recording::new("stopper", 5, &log);
        stopper.outcome = PluginOutcome::Terminate { reason: "filtered".to_string() };
        let pipeline =
            Pipeline::new(vec![Arc::new(stopper), Arc::new(Recording::new("later", 1, &log))]);
        let (endpoint, event) = fixtures();
        let mut request = OutboundRequest::from_endpoint(&endpoint, &event);

        let outcome = pipeline.run(&mut request, &context(&endpoint, &event)).await.unwrap();

        assert_eq!(
            outcome,
            PipelineOutcome::Terminated { plugin: "stopper".to_string(), reason: "filtered".to_string() }
        );
        assert_eq!(*log.lock().unwrap(), vec!["stopper"]);
    }

    #[tokio::test]
    async fn plugin_errors_name_the_plugin() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut broken = Recording::new("broken", 0, &log);
        broken.fail = true;
        let pipeline = Pipeline::new(vec![Arc::new(broken)]);
        let (endpoint, event) = fixtures();
        let mut request = OutboundRequest::from_endpoint(&endpoint, &event);

        let err = pipeline.run(&mut request, &context(&endpoint, &event)).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Plugin { ref plugin, .. } if plugin == "broken"));
    }

    #[tokio::test]
    async fn static_source_binds_per_endpoint() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (endpoint, _) = fixtures();
        let (other, _) = fixtures();
        let source =
            StaticPlugins::new().bind(endpoint.id, Arc::new(Recording::new("only", 0, &log)));

        assert_eq!(source.pipeline_for(&endpoint).await.unwrap().names(), vec!["only"]);
        assert!(source.pipeline_for(&other).await.unwrap().is_empty());
        assert!(NoPlugins.pipeline_for(&endpoint).await.unwrap().is_empty());
    }
}
