//! Client for smee-style public tunnels.
//!
//! These relays wrap each webhook in a flat JSON object where the body sits
//! under `body` and a handful of headers sit next to it. Anything that does
//! not parse as that wrapper is forwarded verbatim without headers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::consumer::ConsumerError;
use crate::deliver::{DecodedWebhook, Deliver, Forwarder};
use crate::sse::{SseDecoder, SseMessage};
use crate::wire::canonical_header_name;

pub const LEGACY_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Wrapper fields copied to the forwarded request as headers.
const WRAPPER_HEADERS: [&str; 6] = [
    "x-github-event",
    "x-github-delivery",
    "x-hub-signature",
    "x-hub-signature-256",
    "content-type",
    "user-agent",
];

/// SSE event names that never carry a webhook.
const SKIPPED_EVENTS: [&str; 2] = ["ready", "ping"];

pub struct LegacyClient {
    source_url: String,
    client: reqwest::Client,
    target: Arc<dyn Deliver>,
    policy: ReconnectPolicy,
}

impl LegacyClient {
    pub fn new(source_url: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self::with_target(source_url, Arc::new(Forwarder::new(target_url)))
    }

    pub fn with_target(source_url: impl Into<String>, target: Arc<dyn Deliver>) -> Self {
        Self {
            source_url: source_url.into(),
            client: reqwest::Client::new(),
            target,
            policy: ReconnectPolicy::Fixed(LEGACY_RECONNECT_DELAY),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.policy = ReconnectPolicy::Fixed(delay);
        self
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// One connection: returns when the stream ends, fails or is cancelled.
    async fn connect_once(&self, cancel: &CancellationToken) -> Result<(), ConsumerError> {
        let resp = self
            .client
            .get(&self.source_url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| ConsumerError::Connect {
                url: self.source_url.clone(),
                source,
            })?;
        if !resp.status().is_success() {
            return Err(ConsumerError::Status {
                url: self.source_url.clone(),
                status: resp.status().as_u16(),
            });
        }
        info!(source = %self.source_url, "connected to tunnel");

        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for msg in decoder.push(&bytes) {
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = self.handle_message(&msg) => {}
                        }
                    }
                }
                Some(Err(e)) => return Err(ConsumerError::Stream(e)),
                None => return Err(ConsumerError::Closed),
            }
        }
    }

    /// Delivers one message. Returns `false` when it was skipped.
    pub async fn handle_message(&self, msg: &SseMessage) -> bool {
        if let Some(event) = msg.event.as_deref() {
            if SKIPPED_EVENTS.contains(&event) {
                debug!(event, "skipping tunnel control event");
                return false;
            }
        }
        if msg.data.is_empty() {
            return false;
        }

        let hook = decode_wrapper(&msg.data);
        match self.target.deliver(&hook).await {
            Ok(status) => {
                info!(
                    event = hook.event_type().as_deref().unwrap_or("unknown"),
                    status = status.0,
                    "forwarded tunnel webhook"
                );
            }
            Err(e) => warn!(error = %e, "failed to forward tunnel webhook"),
        }
        true
    }

    /// Reconnects after a fixed delay until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut policy = self.policy.clone();
        while !cancel.is_cancelled() {
            if let Err(e) = self.connect_once(&cancel).await {
                warn!(source = %self.source_url, error = %e, "tunnel connection lost");
            }
            let delay = policy.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("tunnel client stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

/// Parses the flat wrapper. Data that is not a JSON object carrying a `body`
/// field is passed through unchanged with no headers.
///
/// Object keys keep their order, so the re-serialized body matches what the
/// sender signed.
pub fn decode_wrapper(data: &str) -> DecodedWebhook {
    let raw = || DecodedWebhook::new(Vec::new(), data.as_bytes().to_vec());
    let Ok(mut wrapper) = serde_json::from_str::<Map<String, Value>>(data) else {
        return raw();
    };
    let Some(body) = wrapper.remove("body") else {
        return raw();
    };
    let Ok(body) = serde_json::to_vec(&body) else {
        return raw();
    };

    let headers = WRAPPER_HEADERS
        .iter()
        .filter_map(|name| {
            let value = wrapper.get(*name)?.as_str()?;
            Some((canonical_header_name(name), value.to_string()))
        })
        .collect();
    DecodedWebhook::new(headers, body)
}
