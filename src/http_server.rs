//! Relay HTTP front end.
//!
//! - `GET /health`, `GET /version`: liveness probe
//! - `GET /new`: URL of a fresh channel
//! - `GET /events/{channel}`: SSE stream of everything posted to the channel
//! - `POST /{channel}`: webhook ingest (202 on success)
//!
//! Every response carries `X-Gosmee-Version` so gosmee clients accept it.

use crate::broker::{EventBroker, Subscriber};
use crate::channel::Channel;
use crate::config::RelayConfig;
use crate::verification;
use crate::wire::{RelayEvent, WireError};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_HEADER: &str = "x-gosmee-version";

/// Maximum accepted webhook body (25 MiB).
pub const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ServerState {
    broker: EventBroker,
    inner: Arc<ServerConfig>,
}

struct ServerConfig {
    public_url: String,
    webhook_secrets: Vec<String>,
}

impl ServerState {
    pub fn new(broker: EventBroker, config: &RelayConfig) -> Self {
        Self {
            broker,
            inner: Arc::new(ServerConfig {
                public_url: config.public_url(),
                webhook_secrets: config.webhook_secrets.clone(),
            }),
        }
    }

    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid channel")]
    InvalidChannel,

    #[error("content type must be application/json")]
    UnsupportedContentType,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] WireError),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidChannel
            | RelayError::UnsupportedContentType
            | RelayError::Body(_)
            | RelayError::InvalidJson(_) => StatusCode::BAD_REQUEST,
            RelayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::InvalidSignature => StatusCode::UNAUTHORIZED,
            RelayError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "status": status.as_u16(),
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/version", get(handle_health))
        .route("/new", get(handle_new))
        .route("/events/{channel}", get(handle_events))
        .route("/{channel}", post(handle_webhook))
        .layer(axum::middleware::map_response(add_version_header))
        .with_state(state)
}

async fn add_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        HeaderName::from_static(VERSION_HEADER),
        HeaderValue::from_static(VERSION),
    );
    response
}

/// Serve on `listener` until `cancel` fires, then drain in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "relay server listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// Spawn the server on `addr` (port 0 picks a free port) and return the
/// bound port.
pub async fn start(
    addr: std::net::SocketAddr,
    state: ServerState,
    cancel: CancellationToken,
) -> std::io::Result<(u16, tokio::task::JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let port = listener.local_addr()?.port();

    let handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, state, cancel).await {
            warn!(error = %e, "relay server error");
        }
    });

    Ok((port, handle))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": VERSION }))
}

async fn handle_new(State(state): State<ServerState>) -> Response {
    let channel = Channel::generate();
    let url = format!("{}/{}", state.inner.public_url, channel);
    debug!(%channel, "new channel");
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        url,
    )
        .into_response()
}

async fn handle_events(
    Path(channel): Path<String>,
    State(state): State<ServerState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RelayError> {
    let channel = Channel::parse(&channel).ok_or(RelayError::InvalidChannel)?;

    let subscriber = state.broker.subscribe(channel.as_str());
    info!(
        %channel,
        subscribers = state.broker.subscriber_count(channel.as_str()),
        "SSE client connected"
    );

    Ok(Sse::new(event_stream(subscriber)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    ))
}

/// `connected`, then `ready`, then every published payload. Dropping the
/// stream (client gone) drops the subscriber, which unsubscribes it.
fn event_stream(subscriber: Subscriber) -> impl Stream<Item = Result<Event, Infallible>> {
    let greeting = stream::iter([
        Ok(Event::default().data(r#"{"message":"connected"}"#)),
        Ok(Event::default().data(r#"{"message":"ready"}"#)),
    ]);

    let published = stream::unfold(subscriber, |mut sub| async move {
        let payload = sub.recv().await?;
        Some((Ok(Event::default().data(&*payload)), sub))
    });

    greeting.chain(published)
}

async fn handle_webhook(
    Path(channel): Path<String>,
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<serde_json::Value>), RelayError> {
    let channel = Channel::parse(&channel).ok_or(RelayError::InvalidChannel)?;

    if !is_json_content_type(&headers) {
        return Err(RelayError::UnsupportedContentType);
    }

    let body = read_body(body).await?;

    if !verification::verify_request(&state.inner.webhook_secrets, &headers, &body) {
        warn!(%channel, "webhook signature verification failed");
        return Err(RelayError::InvalidSignature);
    }

    serde_json::from_slice::<serde::de::IgnoredAny>(&body)?;

    let header_pairs = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)));
    let payload = RelayEvent::encode(header_pairs, &body).to_json()?;

    let report = state.broker.publish(channel.as_str(), payload);
    info!(
        %channel,
        bytes = body.len(),
        delivered = report.delivered,
        dropped = report.dropped,
        "webhook published"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": 202, "channel": channel.as_str(), "message": "ok" })),
    ))
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

async fn read_body(body: Body) -> Result<axum::body::Bytes, RelayError> {
    match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            let too_large = std::error::Error::source(&e)
                .map(|s| s.is::<http_body_util::LengthLimitError>())
                .unwrap_or(false);
            if too_large {
                Err(RelayError::PayloadTooLarge)
            } else {
                Err(RelayError::Body(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const CHANNEL: &str = "abcdef123456";

    fn state(secrets: &[&str]) -> ServerState {
        let config = RelayConfig {
            public_url: Some("https://relay.example.com".into()),
            webhook_secrets: secrets.iter().map(|s| s.to_string()).collect(),
            ..RelayConfig::default()
        };
        ServerState::new(EventBroker::new(), &config)
    }

    fn post_json(channel: &str) -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri(format!("/{channel}"))
            .header("content-type", "application/json")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn next_frame(body: &mut Body) -> String {
        loop {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                return String::from_utf8(data.to_vec()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn health_and_version_header() {
        let app = build_router(state(&[]));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[VERSION_HEADER], VERSION);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn new_returns_channel_url() {
        let app = build_router(state(&[]));
        let response = app
            .oneshot(Request::get("/new").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let url = String::from_utf8(bytes.to_vec()).unwrap();
        let channel = url.strip_prefix("https://relay.example.com/").unwrap();
        assert!(Channel::parse(channel).is_some());
    }

    #[tokio::test]
    async fn channel_length_is_enforced_on_both_routes() {
        let app = build_router(state(&[]));
        let too_long = "x".repeat(65);
        for bad in ["short", too_long.as_str()] {
            let response = app
                .clone()
                .oneshot(Request::get(format!("/events/{bad}")).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let response = app
                .clone()
                .oneshot(post_json(bad).body(Body::from("{}")).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn accepted_webhook_reaches_subscriber() {
        let state = state(&[]);
        let mut sub = state.broker().subscribe(CHANNEL);
        let app = build_router(state);

        let response = app
            .oneshot(
                post_json(CHANNEL)
                    .header("x-github-event", "push")
                    .body(Body::from(r#"{"ref":"refs/heads/main"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[VERSION_HEADER], VERSION);
        let json = body_json(response).await;
        assert_eq!(json["status"], 202);
        assert_eq!(json["channel"], CHANNEL);
        assert_eq!(json["message"], "ok");

        let payload = sub.try_recv().unwrap();
        let event = RelayEvent::from_json(&payload).unwrap();
        assert_eq!(event.headers["x-github-event"], "push");
        assert_eq!(event.body().unwrap(), br#"{"ref":"refs/heads/main"}"#);
    }

    #[tokio::test]
    async fn sse_stream_greets_then_relays() {
        let state = state(&[]);
        let broker = state.broker().clone();
        let app = build_router(state);

        let response = app
            .oneshot(Request::get(format!("/events/{CHANNEL}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(broker.subscriber_count(CHANNEL), 1);

        let mut body = response.into_body();
        assert_eq!(next_frame(&mut body).await, "data: {\"message\":\"connected\"}\n\n");
        assert_eq!(next_frame(&mut body).await, "data: {\"message\":\"ready\"}\n\n");

        broker.publish(CHANNEL, r#"{"timestamp":"1","bodyB":"e30="}"#);
        assert_eq!(
            next_frame(&mut body).await,
            "data: {\"timestamp\":\"1\",\"bodyB\":\"e30=\"}\n\n"
        );

        drop(body);
        assert_eq!(broker.subscriber_count(CHANNEL), 0);
    }

    #[tokio::test]
    async fn posted_body_arrives_as_sse_data_line() {
        let app = build_router(state(&[]));
        let response = app
            .clone()
            .oneshot(Request::get("/events/abcdefabcdef").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let mut body = response.into_body();
        next_frame(&mut body).await;
        next_frame(&mut body).await;

        let posted = app
            .oneshot(post_json("abcdefabcdef").body(Body::from(r#"{"a":1}"#)).unwrap())
            .await
            .unwrap();
        assert_eq!(posted.status(), StatusCode::ACCEPTED);

        let frame = next_frame(&mut body).await;
        let data = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .unwrap();
        let event = RelayEvent::from_json(data).unwrap();
        assert_eq!(event.body().unwrap(), br#"{"a":1}"#);
        assert_eq!(event.headers["content-type"], "application/json");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_without_publishing() {
        let state = state(&[]);
        let mut sub = state.broker().subscribe(CHANNEL);
        let app = build_router(state);

        let mut big = vec![b' '; MAX_BODY_BYTES + 1];
        big[0] = b'{';
        let response = app
            .oneshot(post_json(CHANNEL).body(Body::from(big)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn content_type_must_be_json() {
        let app = build_router(state(&[]));
        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/{CHANNEL}"))
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::post(format!("/{CHANNEL}"))
                    .header("content-type", "application/json; charset=utf-8")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let state = state(&[]);
        let mut sub = state.broker().subscribe(CHANNEL);
        let app = build_router(state);
        let response = app
            .oneshot(post_json(CHANNEL).body(Body::from("{not json")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn signatures_are_checked_when_secrets_configured() {
        let body = r#"{"zen":"Keep it logically awesome."}"#;
        let app = build_router(state(&["s3cret"]));

        let unsigned = app
            .clone()
            .oneshot(post_json(CHANNEL).body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

        let wrong = app
            .clone()
            .oneshot(
                post_json(CHANNEL)
                    .header(
                        verification::HEADER_GITHUB_SIGNATURE,
                        verification::github_signature_header(b"other", body.as_bytes()),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let signed = app
            .oneshot(
                post_json(CHANNEL)
                    .header(
                        verification::HEADER_GITHUB_SIGNATURE,
                        verification::github_signature_header(b"s3cret", body.as_bytes()),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(signed.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn served_over_tcp_until_cancelled() {
        let cancel = CancellationToken::new();
        let (port, handle) = start(([127, 0, 0, 1], 0).into(), state(&[]), cancel.clone())
            .await
            .unwrap();

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/version"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[VERSION_HEADER], VERSION);

        cancel.cancel();
        handle.await.unwrap();
    }
}
