//! Relay consumer: follows a channel's SSE stream and re-delivers each
//! webhook to a local target.
//!
//! The connection is retried forever with exponential backoff until the
//! cancellation token fires. Forwarding and capture failures are logged and
//! never end the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Json, Router};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, ReconnectPolicy};
use crate::capture::CaptureDir;
use crate::config::ClientConfig;
use crate::deliver::{DecodedWebhook, Deliver, DeliveryStatus, Forwarder};
use crate::sse::{SseDecoder, SseMessage};
use crate::wire::RelayEvent;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("stream error: {0}")]
    Stream(#[source] reqwest::Error),

    #[error("stream closed by server")]
    Closed,
}

/// What happened to one SSE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Keep-alive or greeting.
    Control,
    /// Not a relay payload.
    Invalid,
    Ignored(String),
    /// Written to disk only.
    Captured,
    Forwarded(DeliveryStatus),
    Failed,
}

pub struct Consumer {
    config: ClientConfig,
    events_url: String,
    client: reqwest::Client,
    target: Arc<dyn Deliver>,
    capture: Option<CaptureDir>,
    policy: ReconnectPolicy,
}

impl Consumer {
    /// A consumer that POSTs to `config.target_url`.
    pub fn new(config: ClientConfig) -> Self {
        let target = Arc::new(Forwarder::new(config.target_url.clone()));
        Self::with_target(config, target)
    }

    pub fn with_target(config: ClientConfig, target: Arc<dyn Deliver>) -> Self {
        Self {
            events_url: events_url(&config.source_url),
            capture: config.save_dir.clone().map(CaptureDir::new),
            config,
            client: reqwest::Client::new(),
            target,
            policy: ReconnectPolicy::Exponential(Backoff::default()),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn events_url(&self) -> &str {
        &self.events_url
    }

    /// Opens the event stream. Any status other than 200 is an error.
    pub async fn connect(&self) -> Result<reqwest::Response, ConsumerError> {
        let resp = self
            .client
            .get(&self.events_url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| ConsumerError::Connect {
                url: self.events_url.clone(),
                source,
            })?;

        if resp.status() != StatusCode::OK {
            return Err(ConsumerError::Status {
                url: self.events_url.clone(),
                status: resp.status().as_u16(),
            });
        }
        Ok(resp)
    }

    /// Reads messages until the stream ends or fails. Returns `Ok` only
    /// when cancelled.
    async fn consume(
        &self,
        resp: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
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

    pub async fn handle_message(&self, msg: &SseMessage) -> MessageOutcome {
        let data = msg.data.trim();
        if is_control(data) {
            debug!(data, "control message");
            return MessageOutcome::Control;
        }

        let hook = match decode(data) {
            Some(hook) => hook,
            None => {
                warn!(data, "unrecognized message on event stream");
                return MessageOutcome::Invalid;
            }
        };

        let event = hook.event_type();
        if self.config.is_ignored(event.as_deref()) {
            let event = event.unwrap_or_default();
            info!(%event, "ignoring event");
            return MessageOutcome::Ignored(event);
        }

        if let Some(capture) = &self.capture {
            if let Err(e) = capture.save(&hook, &self.config.target_url) {
                warn!(dir = %capture.path().display(), error = %e, "failed to capture webhook");
            }
        }

        if self.config.no_replay {
            return MessageOutcome::Captured;
        }

        let event = event.as_deref().unwrap_or("unknown");
        match self.target.deliver(&hook).await {
            Ok(status) => {
                info!(
                    event,
                    delivery = hook.delivery_id().unwrap_or("-"),
                    status = status.0,
                    "forwarded webhook"
                );
                MessageOutcome::Forwarded(status)
            }
            Err(e) => {
                warn!(event, error = %e, "failed to forward webhook");
                MessageOutcome::Failed
            }
        }
    }

    /// Connects, consumes and reconnects until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut policy = self.policy.clone();
        info!(source = %self.events_url, target = %self.config.target_url, "starting relay consumer");

        while !cancel.is_cancelled() {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.connect() => r,
            };

            match connected {
                Ok(resp) => {
                    info!(source = %self.events_url, "connected");
                    policy.reset();
                    match self.consume(resp, &cancel).await {
                        Ok(()) => break,
                        Err(e) => warn!(error = %e, "event stream ended"),
                    }
                }
                Err(e) => warn!(error = %e, "connection failed"),
            }

            let delay = policy.next_delay();
            info!(?delay, "reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("relay consumer stopped");
    }

    /// Runs the consumer, and the health server when a port is configured,
    /// on background tasks.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        if let Some(port) = self.config.health_port {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_health(SocketAddr::from(([0, 0, 0, 0], port)), cancel).await {
                    warn!(port, error = %e, "health server failed");
                }
            });
        }
        tokio::spawn(async move { self.run(cancel).await })
    }
}

/// Inserts `/events/` before the channel of a channel URL. URLs that already
/// point at an events path are returned unchanged.
pub fn events_url(source: &str) -> String {
    let source = source.trim_end_matches('/');
    if source.contains("/events/") {
        return source.to_string();
    }
    match source.rsplit_once('/') {
        Some((base, channel)) if !base.ends_with('/') && !channel.is_empty() => {
            format!("{base}/events/{channel}")
        }
        _ => source.to_string(),
    }
}

fn is_control(data: &str) -> bool {
    if data.is_empty() {
        return true;
    }
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(data) else {
        return false;
    };
    match map.len() {
        0 => true,
        1 => matches!(
            map.get("message").and_then(Value::as_str),
            Some("connected" | "ready")
        ),
        _ => false,
    }
}

fn decode(data: &str) -> Option<DecodedWebhook> {
    let event = RelayEvent::from_json(data).ok()?;
    let body = event.body().ok()?;
    Some(DecodedWebhook::new(event.canonical_headers(), body))
}

/// Serves `GET /health` until cancelled.
pub async fn serve_health(addr: SocketAddr, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "health server listening");
    let app = Router::new().route("/health", get(|| async { Json(json!({ "status": "ok" })) }));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
