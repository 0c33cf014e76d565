//! HMAC-SHA256 request signing.
//!
//! Signs `"{timestamp}.{payload}"` with the endpoint secret and sends
//! `webhook-signature: v1=<hex>` alongside `webhook-timestamp: <unix secs>`.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{OutboundPlugin, OutboundRequest, PluginContext, PluginOutcome};
use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "webhook-signature";

/// Header carrying the signing timestamp.
pub const TIMESTAMP_HEADER: &str = "webhook-timestamp";

/// Adds an HMAC signature to every request.
#[derive(Clone)]
pub struct SignaturePlugin {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignaturePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignaturePlugin").finish_non_exhaustive()
    }
}

impl SignaturePlugin {
    /// Creates a plugin signing with `secret`.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self { secret: secret.into() }
    }

    /// Computes the hex signature for a timestamp and payload.
    ///
    /// # Errors
    ///
    /// Returns a plugin error if the key is rejected.
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| DeliveryError::plugin("webhook-signature", e.to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl OutboundPlugin for SignaturePlugin {
    fn name(&self) -> &str {
        "webhook-signature"
    }

    async fn execute(
        &self,
        request: &mut OutboundRequest,
        context: &PluginContext<'_>,
    ) -> Result<PluginOutcome> {
        if self.secret.is_empty() {
            return Err(DeliveryError::plugin(self.name(), "signing secret is empty"));
        }

        let timestamp = context.now.timestamp();
        let signature = self.sign(timestamp, &request.payload)?;
        request.headers.insert(SIGNATURE_HEADER.to_string(), format!("v1={signature}"));
        request.headers.insert(TIMESTAMP_HEADER.to_string(), timestamp.to_string());
        Ok(PluginOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use hookline_core::{
        AttemptId, Endpoint, EndpointId, EndpointRetry, Event, EventId, HttpMethod, WorkspaceId,
    };

    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        let plugin = SignaturePlugin::new("secret");
        let expected = {
            let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
            mac.update(b"1700000000.{\"a\":1}");
            hex::encode(mac.finalize().into_bytes())
        };
        assert_eq!(plugin.sign(1_700_000_000, br#"{"a":1}"#).unwrap(), expected);
        assert_eq!(expected.len(), 64);
    }

    #[tokio::test]
    async fn execute_sets_signature_headers() {
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
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let context = PluginContext {
            event: &event,
            endpoint: &endpoint,
            attempt_id: AttemptId::new(),
            attempt_number: 1,
            now,
        };
        let mut request = OutboundRequest {
            url: endpoint.url.clone(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            payload: Bytes::from_static(b"{}"),
        };

        let plugin = SignaturePlugin::new("secret");
        let outcome = plugin.execute(&mut request, &context).await.unwrap();

        assert_eq!(outcome, PluginOutcome::Continue);
        assert_eq!(request.headers[TIMESTAMP_HEADER], "1700000000");
        assert_eq!(
            request.headers[SIGNATURE_HEADER],
            format!("v1={}", plugin.sign(1_700_000_000, b"{}").unwrap())
        );
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let plugin = SignaturePlugin::new("top-secret");
        assert!(!format!("{plugin:?}").contains("top-secret"));
    }
}
