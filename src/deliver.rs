//! Delivery of decoded webhooks to a local target.
//!
//! Both consumers (the relay consumer and the legacy tunnel client) decode
//! their own wire formats into a [`DecodedWebhook`] and hand it to a
//! [`Deliver`] implementation.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use std::time::Duration;

use tracing::{debug, warn};

use crate::wire;

/// Headers that describe the original hop and must not be replayed.
const HOP_BY_HOP: [&str; 5] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
];

/// One webhook ready to be re-sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedWebhook {
    /// Header pairs in their conventional casing.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl DecodedWebhook {
    pub fn new(headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    pub fn event_type(&self) -> Option<String> {
        wire::event_type(&self.headers)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn delivery_id(&self) -> Option<&str> {
        self.header("x-github-delivery")
            .or_else(|| self.header("x-gitea-delivery"))
            .or_else(|| self.header("x-request-id"))
    }
}

#[derive(Debug, Error)]
pub enum DeliverError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("local action failed: {0}")]
    Local(#[from] std::io::Error),
}

/// Status reported by a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStatus(pub u16);

impl DeliveryStatus {
    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }
}

#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, hook: &DecodedWebhook) -> Result<DeliveryStatus, DeliverError>;
}

// ─── HTTP forwarder ──────────────────────────────────────────────────────────

/// Upper bound on one forward, connect through response headers.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs each webhook to a fixed target URL with its original headers.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    target_url: String,
}

impl Forwarder {
    pub fn new(target_url: impl Into<String>) -> Self {
        Self::with_timeout(target_url, FORWARD_TIMEOUT)
    }

    pub fn with_timeout(target_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build forwarding client, using defaults");
                reqwest::Client::new()
            });
        Self::with_client(client, target_url)
    }

    pub fn with_client(client: reqwest::Client, target_url: impl Into<String>) -> Self {
        Self {
            client,
            target_url: target_url.into(),
        }
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }
}

#[async_trait]
impl Deliver for Forwarder {
    async fn deliver(&self, hook: &DecodedWebhook) -> Result<DeliveryStatus, DeliverError> {
        let resp = self
            .client
            .post(&self.target_url)
            .headers(forward_headers(&hook.headers))
            .body(hook.body.clone())
            .send()
            .await
            .map_err(|source| DeliverError::Http {
                url: self.target_url.clone(),
                source,
            })?;

        let status = resp.status().as_u16();
        debug!(target = %self.target_url, status, "forwarded webhook");
        Ok(DeliveryStatus(status))
    }
}

/// Converts header pairs for an outbound request, dropping hop-by-hop and
/// unrepresentable headers.
pub fn forward_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hook() -> DecodedWebhook {
        DecodedWebhook::new(
            vec![
                ("Content-Type".into(), "application/json".into()),
                ("X-GitHub-Event".into(), "push".into()),
                ("X-GitHub-Delivery".into(), "abc-123".into()),
                ("Host".into(), "relay.example.com".into()),
                ("Content-Length".into(), "999".into()),
            ],
            br#"{"ref":"refs/heads/main"}"#.to_vec(),
        )
    }

    #[test]
    fn accessors() {
        let h = hook();
        assert_eq!(h.event_type().as_deref(), Some("push"));
        assert_eq!(h.delivery_id(), Some("abc-123"));
        assert_eq!(h.header("content-type"), Some("application/json"));
        assert_eq!(h.header("x-missing"), None);
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let map = forward_headers(&hook().headers);
        assert!(map.get("host").is_none());
        assert!(map.get("content-length").is_none());
        assert_eq!(map.get("x-github-event").unwrap(), "push");
    }

    #[test]
    fn invalid_headers_are_skipped() {
        let map = forward_headers(&[
            ("bad header".into(), "x".into()),
            ("X-Ok".into(), "fine".into()),
            ("X-Bad-Value".into(), "line\nbreak".into()),
        ]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("x-ok").unwrap(), "fine");
    }

    #[tokio::test]
    async fn forwards_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-github-event", "push"))
            .and(header("content-type", "application/json"))
            .and(body_bytes(br#"{"ref":"refs/heads/main"}"#.to_vec()))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = Forwarder::new(format!("{}/hook", server.uri()));
        let status = forwarder.deliver(&hook()).await.unwrap();
        assert_eq!(status, DeliveryStatus(202));
        assert!(status.is_success());
    }

    #[tokio::test]
    async fn hung_target_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let forwarder = Forwarder::with_timeout(server.uri(), Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = forwarder.deliver(&hook()).await;
        assert!(matches!(result, Err(DeliverError::Http { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unreachable_target_is_an_error() {
        let forwarder = Forwarder::new("http://127.0.0.1:1/hook");
        assert!(matches!(
            forwarder.deliver(&hook()).await,
            Err(DeliverError::Http { .. })
        ));
    }
}
