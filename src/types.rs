use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Last seen commit for one repository + ref.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoCommitState {
    #[serde(rename = "ref")]
    pub reference: String,
    pub commit_hash: String,
    pub last_checked: DateTime<Utc>,
}

/// Persisted poll state, keyed by `owner/repo@ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollState {
    #[serde(default)]
    pub repos: BTreeMap<String, RepoCommitState>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for PollState {
    fn default() -> Self {
        Self {
            repos: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

impl PollState {
    pub fn key(repo: &str, reference: &str) -> String {
        format!("{repo}@{reference}")
    }

    pub fn get(&self, repo: &str, reference: &str) -> Option<&RepoCommitState> {
        self.repos.get(&Self::key(repo, reference))
    }

    /// True when nothing is recorded yet or the recorded hash differs.
    pub fn has_changed(&self, repo: &str, reference: &str, hash: &str) -> bool {
        match self.get(repo, reference) {
            Some(prev) => prev.commit_hash != hash,
            None => true,
        }
    }

    /// Records `hash` and returns the previous one ("" on first record).
    pub fn update(&mut self, repo: &str, reference: &str, hash: &str) -> String {
        let now = Utc::now();
        let previous = self.repos.insert(
            Self::key(repo, reference),
            RepoCommitState {
                reference: reference.to_string(),
                commit_hash: hash.to_string(),
                last_checked: now,
            },
        );
        self.updated_at = now;
        previous.map(|p| p.commit_hash).unwrap_or_default()
    }

    /// Entries in key order, for display.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &RepoCommitState)> {
        self.repos.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A commit update seen by one poll. `old_hash` is always empty here; the
/// base poller keeps no state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollUpdate {
    pub repo: String,
    pub reference: String,
    pub old_hash: String,
    pub new_hash: String,
}

/// A genuine change detected against persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitChange {
    pub repo: String,
    pub reference: String,
    /// Empty on the first observation.
    pub old_hash: String,
    pub new_hash: String,
}

// ─── Provider hook deliveries ────────────────────────────────────────────────

/// A configured repository or organization hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInfo {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub config: HookConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// One recorded delivery, as listed by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: u64,
    pub guid: String,
    pub delivered_at: DateTime<Utc>,
    #[serde(default)]
    pub redelivery: bool,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    pub event: String,
    #[serde(default)]
    pub action: Option<String>,
}

/// Full delivery record including the original request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDeliveryDetail {
    #[serde(flatten)]
    pub summary: WebhookDelivery,
    pub request: RecordedRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedRequest {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}
