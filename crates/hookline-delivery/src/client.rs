//! Deliverer contract and the reqwest-backed HTTP implementation.
//!
//! A deliverer makes exactly one network call per invocation and never
//! retries. It does not fail: transport problems are reported in
//! [`DeliveryResponse::error`] so the worker can record them on the attempt.

use std::{
    collections::HashMap,
    error::Error as StdError,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Bytes;
use hookline_core::HttpMethod;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    acl::{DenyList, DenyListResolver, DestinationDenied, DEFAULT_DENY},
    error::{DeliveryError, Result},
};

/// Default cap on captured response bodies.
pub const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 64 * 1024;

/// Configuration for [`HttpDeliverer`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sent as `User-Agent` unless the request overrides it.
    pub user_agent: String,
    /// Response bodies longer than this are truncated.
    pub max_response_body_bytes: usize,
    /// Maximum redirects to follow. A redirect past the limit is returned as
    /// the response.
    pub max_redirects: usize,
    /// Destinations the deliverer refuses to connect to. See [`crate::acl`].
    pub deny: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("hookline/{}", env!("CARGO_PKG_VERSION")),
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            max_redirects: 0,
            deny: vec![DEFAULT_DENY.to_string()],
        }
    }
}

/// A finalized outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Headers, overriding the deliverer's defaults.
    pub headers: HashMap<String, String>,
    /// Request body.
    pub payload: Bytes,
    /// Deadline for the whole exchange.
    pub timeout: Duration,
}

/// Classified transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The deadline elapsed.
    Timeout,
    /// The destination is on the deny-list.
    Denied(String),
    /// Any other failure to send or receive.
    Other(String),
}

/// Result of one delivery call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// Status code, if a response arrived.
    pub status_code: Option<u16>,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, possibly truncated.
    pub body: Vec<u8>,
    /// Time from send to completion.
    pub latency: Duration,
    /// Transport failure, if any.
    pub error: Option<TransportError>,
}

impl DeliveryResponse {
    /// Returns true for a 2xx status.
    pub fn is_2xx(&self) -> bool {
        matches!(self.status_code, Some(200..=299))
    }
}

/// Performs a single network delivery.
#[async_trait]
pub trait Deliverer: Send + Sync + 'static {
    /// Sends `request` once and reports what happened.
    async fn deliver(&self, request: &DeliveryRequest) -> DeliveryResponse;
}

/// [`Deliverer`] over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpDeliverer {
    client: reqwest::Client,
    config: ClientConfig,
    deny: Arc<DenyList>,
}

impl HttpDeliverer {
    /// Builds the HTTP client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a deny rule is malformed or the
    /// client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let deny = Arc::new(DenyList::parse(&config.deny)?);

        let mut builder = reqwest::Client::builder().redirect(redirect_policy(
            config.max_redirects,
            deny.clone(),
        ));
        if !deny.is_empty() {
            builder = builder.dns_resolver(Arc::new(DenyListResolver::new(deny.clone())));
        }
        let client = builder
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build http client: {e}")))?;

        Ok(Self { client, config, deny })
    }

    /// Creates a deliverer with default configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    fn build_headers(&self, request: &DeliveryRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)
                .map_err(|e| DeliveryError::configuration(format!("invalid user agent: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| DeliveryError::network(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| DeliveryError::network(format!("invalid header value: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn send(&self, request: &DeliveryRequest) -> DeliveryResponse {
        let start = Instant::now();

        let headers = match self.build_headers(request) {
            Ok(headers) => headers,
            Err(e) => {
                return DeliveryResponse {
                    error: Some(TransportError::Other(e.to_string())),
                    ..DeliveryResponse::default()
                };
            },
        };

        if let Ok(url) = reqwest::Url::parse(&request.url) {
            if let Err(denied) = self.deny.check_url(&url) {
                warn!(host = %denied.host, "destination denied");
                return DeliveryResponse {
                    error: Some(TransportError::Denied(denied.to_string())),
                    ..DeliveryResponse::default()
                };
            }
        }

        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::POST);

        let result = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .timeout(request.timeout)
            .body(request.payload.clone())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                let latency = start.elapsed();
                warn!(latency_ms = latency.as_millis(), error = %e, "request failed");
                return DeliveryResponse {
                    latency,
                    error: Some(classify(&e)),
                    ..DeliveryResponse::default()
                };
            },
        };

        let status_code = response.status().as_u16();
        let headers = extract_headers(response.headers());
        let (body, error) = match read_body(response, self.config.max_response_body_bytes).await {
            Ok(body) => (body, None),
            Err(e) => {
                warn!(error = %e, "failed to read response body");
                (Vec::new(), Some(classify(&e)))
            },
        };
        let latency = start.elapsed();

        debug!(status = status_code, latency_ms = latency.as_millis(), "received response");

        DeliveryResponse { status_code: Some(status_code), headers, body, latency, error }
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, request: &DeliveryRequest) -> DeliveryResponse {
        let span = info_span!(
            "webhook_delivery",
            url = %request.url,
            method = %request.method,
            timeout_ms = request.timeout.as_millis()
        );
        self.send(request).instrument(span).await
    }
}

fn redirect_policy(max_redirects: usize, deny: Arc<DenyList>) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            attempt.stop()
        } else if let Err(denied) = deny.check_url(attempt.url()) {
            attempt.error(denied)
        } else {
            attempt.follow()
        }
    })
}

fn classify(error: &reqwest::Error) -> TransportError {
    let mut source = error.source();
    while let Some(inner) = source {
        if let Some(denied) = inner.downcast_ref::<DestinationDenied>() {
            return TransportError::Denied(denied.to_string());
        }
        source = inner.source();
    }

    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Other(format!("connection failed: {error}"))
    } else {
        TransportError::Other(error.to_string())
    }
}

/// Reads at most `max` bytes of the body; the rest is never buffered.
async fn read_body(
    mut response: reqwest::Response,
    max: usize,
) -> std::result::Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::new();
    while body.len() < max {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let room = max - body.len();
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    Ok(body)
}

/// Copies response headers, skipping values that are not valid UTF-8.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    header_map
        .iter()
        .filter_map(|(key, value)| value.to_str().ok().map(|v| (key.to_string(), v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request(url: String) -> DeliveryRequest {
        DeliveryRequest {
            url,
            method: HttpMethod::Post,
            headers: HashMap::new(),
            payload: Bytes::from_static(br#"{"event":"order.paid"}"#),
            timeout: Duration::from_secs(5),
        }
    }

    fn open_config() -> ClientConfig {
        ClientConfig { deny: Vec::new(), ..ClientConfig::default() }
    }

    fn deliverer() -> HttpDeliverer {
        HttpDeliverer::new(open_config()).unwrap()
    }

    #[tokio::test]
    async fn successful_delivery_reports_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::body_string(r#"{"event":"order.paid"}"#))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let deliverer = deliverer();
        let response = deliverer.deliver(&request(format!("{}/hook", server.uri()))).await;

        assert_eq!(response.status_code, Some(200));
        assert!(response.is_2xx());
        assert_eq!(response.body, b"ok".to_vec());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn request_headers_override_defaults() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("PUT"))
            .and(matchers::header("content-type", "text/plain"))
            .and(matchers::header("x-tenant", "acme"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request(server.uri());
        req.method = HttpMethod::Put;
        req.headers.insert("Content-Type".to_string(), "text/plain".to_string());
        req.headers.insert("X-Tenant".to_string(), "acme".to_string());

        let response = deliverer().deliver(&req).await;
        assert_eq!(response.status_code, Some(204));
    }

    #[tokio::test]
    async fn server_error_is_not_2xx() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let response = deliverer().deliver(&request(server.uri())).await;

        assert_eq!(response.status_code, Some(500));
        assert!(!response.is_2xx());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn slow_endpoint_is_classified_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let mut req = request(server.uri());
        req.timeout = Duration::from_millis(100);

        let response = deliverer().deliver(&req).await;

        assert_eq!(response.status_code, None);
        assert_eq!(response.error, Some(TransportError::Timeout));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_other_error() {
        let response = HttpDeliverer::with_defaults()
            .unwrap()
            .deliver(&request("http://127.0.0.1:1/hook".to_string()))
            .await;

        assert_eq!(response.status_code, None);
        assert!(matches!(response.error, Some(TransportError::Other(_))));
    }

    #[tokio::test]
    async fn long_bodies_are_truncated() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(100)))
            .mount(&server)
            .await;

        let config = ClientConfig { max_response_body_bytes: 10, ..open_config() };
        let response = HttpDeliverer::new(config).unwrap().deliver(&request(server.uri())).await;

        assert_eq!(response.body.len(), 10);
    }

    #[tokio::test]
    async fn body_larger_than_limit_is_read_only_up_to_limit() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4 * 1024 * 1024]))
            .mount(&server)
            .await;

        let config = ClientConfig { max_response_body_bytes: 1024, ..open_config() };
        let response = HttpDeliverer::new(config).unwrap().deliver(&request(server.uri())).await;

        assert_eq!(response.status_code, Some(200));
        assert_eq!(response.body.len(), 1024);
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn loopback_destination_is_denied_by_default() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let response = HttpDeliverer::with_defaults().unwrap().deliver(&request(server.uri())).await;

        assert_eq!(response.status_code, None);
        assert!(matches!(response.error, Some(TransportError::Denied(_))));
    }

    #[tokio::test]
    async fn localhost_name_is_denied_through_resolver() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let url = format!("http://localhost:{}/hook", server.address().port());

        let response = HttpDeliverer::with_defaults().unwrap().deliver(&request(url)).await;

        assert_eq!(response.status_code, None);
        assert!(matches!(response.error, Some(TransportError::Denied(_))));
    }

    #[tokio::test]
    async fn redirect_to_denied_destination_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(matchers::path("/start"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "http://10.0.0.1/internal"),
            )
            .mount(&server)
            .await;

        let config = ClientConfig {
            max_redirects: 3,
            deny: vec!["@private".to_string()],
            ..ClientConfig::default()
        };
        let response = HttpDeliverer::new(config)
            .unwrap()
            .deliver(&request(format!("{}/start", server.uri())))
            .await;

        assert_eq!(response.status_code, None);
        assert!(matches!(response.error, Some(TransportError::Denied(_))));
    }

    #[test]
    fn malformed_deny_rule_fails_construction() {
        let config = ClientConfig { deny: vec!["10.0.0.0/99".to_string()], ..ClientConfig::default() };
        assert!(matches!(HttpDeliverer::new(config), Err(DeliveryError::Configuration { .. })));
    }
}
