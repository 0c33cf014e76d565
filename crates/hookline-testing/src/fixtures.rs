//! Builders for endpoints and events with test defaults.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use hookline_core::{
    Endpoint, EndpointId, EndpointRetry, Event, EventId, HttpMethod, RetryStrategy, WorkspaceId,
};
use rand::Rng;
use serde_json::{json, Value};

/// Builder for test endpoints.
#[derive(Debug, Clone)]
pub struct EndpointBuilder {
    workspace_id: WorkspaceId,
    name: Option<String>,
    url: String,
    method: HttpMethod,
    headers: HashMap<String, String>,
    timeout_ms: u64,
    enabled: bool,
    retry: EndpointRetry,
}

impl EndpointBuilder {
    /// Creates a builder for an enabled POST endpoint with the default retry
    /// schedule.
    pub fn new(workspace_id: WorkspaceId) -> Self {
        Self {
            workspace_id,
            name: None,
            url: "https://hooks.example.com/receive".to_string(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            timeout_ms: 5_000,
            enabled: true,
            retry: EndpointRetry::default(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the target URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Adds a static header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Marks the endpoint disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Uses a fixed retry schedule, in seconds.
    #[must_use]
    pub fn retry_schedule(mut self, delays: &[u64]) -> Self {
        self.retry = EndpointRetry { strategy: RetryStrategy::Fixed, attempts: delays.to_vec() };
        self
    }

    /// Uses the reserved backoff strategy.
    #[must_use]
    pub fn backoff(mut self) -> Self {
        self.retry.strategy = RetryStrategy::Backoff;
        self
    }

    /// Builds the endpoint.
    pub fn build(self, now: DateTime<Utc>) -> Endpoint {
        Endpoint {
            id: EndpointId::new(),
            workspace_id: self.workspace_id,
            name: self.name,
            url: self.url,
            method: self.method,
            headers: self.headers,
            timeout_ms: self.timeout_ms,
            enabled: self.enabled,
            retry: self.retry,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Builder for test events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    workspace_id: WorkspaceId,
    data: Vec<u8>,
}

impl EventBuilder {
    /// Creates a builder with a small JSON payload carrying a random nonce.
    pub fn new(workspace_id: WorkspaceId) -> Self {
        let nonce: u64 = rand::rng().random();
        let data = json!({ "type": "test.event", "nonce": nonce }).to_string().into_bytes();
        Self { workspace_id, data }
    }

    /// Sets the raw payload.
    #[must_use]
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    /// Sets a JSON payload.
    #[must_use]
    pub fn json(mut self, value: &Value) -> Self {
        self.data = value.to_string().into_bytes();
        self
    }

    /// Builds the event.
    pub fn build(self, now: DateTime<Utc>) -> Event {
        Event { id: EventId::new(), workspace_id: self.workspace_id, data: self.data, created_at: now }
    }
}
