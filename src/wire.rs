//! Relay wire payload.
//!
//! Every inbound header becomes a lower-cased top-level string field, next
//! to `timestamp` (milliseconds since the epoch, as a string) and `bodyB`
//! (standard base64 of the raw body). The body is never carried decoded.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_BODY: &str = "bodyB";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid relay payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// The JSON object published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    #[serde(flatten)]
    pub headers: BTreeMap<String, String>,
    pub timestamp: String,
    #[serde(rename = "bodyB")]
    pub body_b: String,
}

impl RelayEvent {
    /// Builds a payload from header pairs and the raw body, stamped now.
    pub fn encode<'a, I>(headers: I, body: &[u8]) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        Self::encode_at(headers, body, Utc::now().timestamp_millis())
    }

    pub fn encode_at<'a, I>(headers: I, body: &[u8], timestamp_ms: i64) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut map = BTreeMap::new();
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if name == FIELD_TIMESTAMP || name.eq_ignore_ascii_case(FIELD_BODY) {
                continue;
            }
            // Repeated headers keep the first value.
            map.entry(name).or_insert_with(|| value.to_string());
        }
        Self {
            headers: map,
            timestamp: timestamp_ms.to_string(),
            body_b: STANDARD.encode(body),
        }
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn body(&self) -> Result<Vec<u8>, WireError> {
        Ok(STANDARD.decode(&self.body_b)?)
    }

    /// Headers with their conventional casing restored.
    pub fn canonical_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(k, v)| (canonical_header_name(k), v.clone()))
            .collect()
    }
}

/// Restores conventional casing for a lower-cased header name.
///
/// Each dash-separated word is capitalised, and a few vendor words keep
/// their brand casing (`x-github-event` becomes `X-GitHub-Event`).
pub fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|word| match word.to_ascii_lowercase().as_str() {
            "github" => "GitHub".to_string(),
            "gitlab" => "Gitlab".to_string(),
            "id" => "ID".to_string(),
            "" => String::new(),
            lower => {
                let mut chars = lower.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Provider event type from a decoded header set, if any.
pub fn event_type<'a, I>(headers: I) -> Option<String>
where
    I: IntoIterator<Item = &'a (String, String)>,
{
    const EVENT_HEADERS: [&str; 4] = [
        "x-github-event",
        "x-gitea-event",
        "x-gitlab-event",
        "x-event-key",
    ];
    let headers: Vec<&(String, String)> = headers.into_iter().collect();
    EVENT_HEADERS.iter().find_map(|wanted| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(wanted))
            .map(|(_, v)| v.clone())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_expected_fields() {
        let event = RelayEvent::encode_at(
            [("Content-Type", "application/json"), ("X-GitHub-Event", "push")],
            br#"{"a":1}"#,
            1_700_000_000_123,
        );
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(json["content-type"], "application/json");
        assert_eq!(json["x-github-event"], "push");
        assert_eq!(json["timestamp"], "1700000000123");
        assert_eq!(json["bodyB"], "eyJhIjoxfQ==");
    }

    #[test]
    fn reserved_header_names_do_not_clobber_fields() {
        let event = RelayEvent::encode_at([("Timestamp", "evil"), ("BodyB", "evil")], b"x", 5);
        assert_eq!(event.timestamp, "5");
        assert!(event.headers.is_empty());
        assert_eq!(event.body().unwrap(), b"x");
    }

    #[test]
    fn first_repeated_header_wins() {
        let event = RelayEvent::encode_at([("accept", "a"), ("Accept", "b")], b"", 0);
        assert_eq!(event.headers["accept"], "a");
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_header_name("x-github-event"), "X-GitHub-Event");
        assert_eq!(canonical_header_name("x-github-delivery"), "X-GitHub-Delivery");
        assert_eq!(canonical_header_name("x-hub-signature-256"), "X-Hub-Signature-256");
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-gitlab-token"), "X-Gitlab-Token");
        assert_eq!(canonical_header_name("x-request-id"), "X-Request-ID");
    }

    #[test]
    fn event_type_prefers_github_then_others() {
        let headers = vec![
            ("X-Gitea-Event".to_string(), "push".to_string()),
            ("X-GitHub-Event".to_string(), "pull_request".to_string()),
        ];
        assert_eq!(event_type(&headers).as_deref(), Some("pull_request"));

        let bitbucket = vec![("X-Event-Key".to_string(), "repo:push".to_string())];
        assert_eq!(event_type(&bitbucket).as_deref(), Some("repo:push"));

        assert_eq!(event_type(&Vec::<(String, String)>::new()), None);
    }

    #[test]
    fn decoding_rejects_bad_base64() {
        let event = RelayEvent::from_json(r#"{"timestamp":"1","bodyB":"!!!"}"#).unwrap();
        assert!(matches!(event.body(), Err(WireError::Base64(_))));
    }

    proptest! {
        #[test]
        fn prop_headers_and_body_survive_the_wire(
            body: Vec<u8>,
            headers in proptest::collection::btree_map("x-[a-z]{1,12}", "[ -~]{0,40}", 0..8),
        ) {
            let pairs: Vec<(&str, &str)> =
                headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let encoded = RelayEvent::encode_at(pairs, &body, 42).to_json().unwrap();

            let decoded = RelayEvent::from_json(&encoded).unwrap();
            prop_assert_eq!(decoded.body().unwrap(), body);
            prop_assert_eq!(decoded.headers, headers);
        }
    }
}
