//! Deliverer that replays scripted responses and records requests.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use hookline_delivery::{
    client::TransportError, Deliverer, DeliveryRequest, DeliveryResponse,
};
use tokio::sync::Mutex;

/// One scripted reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    /// Respond with this status and body.
    Status {
        /// HTTP status code
        code: u16,
        /// Response body
        body: Vec<u8>,
    },
    /// Fail as if the deadline elapsed.
    Timeout,
    /// Fail as if the connection was refused.
    ConnectionError,
}

impl ScriptedResponse {
    /// Status-only reply.
    pub fn status(code: u16) -> Self {
        Self::Status { code, body: Vec::new() }
    }
}

#[derive(Debug, Default)]
struct Script {
    replies: VecDeque<ScriptedResponse>,
    fallback: Option<ScriptedResponse>,
    requests: Vec<DeliveryRequest>,
}

/// [`Deliverer`] driven by a script.
///
/// Replies are consumed in order. Once the script is empty the fallback is
/// used, which defaults to `200 OK`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDeliverer {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDeliverer {
    /// Creates a deliverer that answers `200` to everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a reply to the script.
    pub async fn push(&self, reply: ScriptedResponse) {
        self.script.lock().await.replies.push_back(reply);
    }

    /// Appends a status-only reply.
    pub async fn push_status(&self, code: u16) {
        self.push(ScriptedResponse::status(code)).await;
    }

    /// Sets the reply used once the script runs out.
    pub async fn set_fallback(&self, reply: ScriptedResponse) {
        self.script.lock().await.fallback = Some(reply);
    }

    /// Returns every request received so far.
    pub async fn requests(&self) -> Vec<DeliveryRequest> {
        self.script.lock().await.requests.clone()
    }

    /// Returns how many deliveries were made.
    pub async fn call_count(&self) -> usize {
        self.script.lock().await.requests.len()
    }
}

#[async_trait]
impl Deliverer for ScriptedDeliverer {
    async fn deliver(&self, request: &DeliveryRequest) -> DeliveryResponse {
        let reply = {
            let mut script = self.script.lock().await;
            script.requests.push(request.clone());
            script
                .replies
                .pop_front()
                .or_else(|| script.fallback.clone())
                .unwrap_or_else(|| ScriptedResponse::status(200))
        };

        let latency = Duration::from_millis(5);
        match reply {
            ScriptedResponse::Status { code, body } => DeliveryResponse {
                status_code: Some(code),
                body,
                latency,
                ..DeliveryResponse::default()
            },
            ScriptedResponse::Timeout => DeliveryResponse {
                latency: request.timeout,
                error: Some(TransportError::Timeout),
                ..DeliveryResponse::default()
            },
            ScriptedResponse::ConnectionError => DeliveryResponse {
                latency,
                error: Some(TransportError::Other("connection refused".to_string())),
                ..DeliveryResponse::default()
            },
        }
    }
}
