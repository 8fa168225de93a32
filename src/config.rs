//! Configuration read from the environment.
//!
//! Every setting has a default; the binary and embedding applications can
//! also build these structs directly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_PORT: u16 = 3333;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

// ─── Relay server ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    /// Base URL handed out by `GET /new`. Defaults to `http://<addr>`.
    pub public_url: Option<String>,
    /// Webhook secrets; empty disables signature checks.
    pub webhook_secrets: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            public_url: None,
            webhook_secrets: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Reads `HOOKRELAY_ADDR`, `HOOKRELAY_PUBLIC_URL` and
    /// `HOOKRELAY_WEBHOOK_SECRETS` (comma separated).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = env("HOOKRELAY_ADDR") {
            config.addr = addr.parse().map_err(|e| ConfigError::Invalid {
                var: "HOOKRELAY_ADDR",
                reason: format!("{e}"),
            })?;
        }
        config.public_url = env("HOOKRELAY_PUBLIC_URL");
        config.webhook_secrets = env_list("HOOKRELAY_WEBHOOK_SECRETS");
        Ok(config)
    }

    pub fn public_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.addr),
        }
    }
}

// ─── Relay consumer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Full events URL, or a channel URL that `/events/` is inserted into.
    pub source_url: String,
    pub target_url: String,
    pub ignore_events: Vec<String>,
    pub save_dir: Option<PathBuf>,
    /// Capture only; do not forward.
    pub no_replay: bool,
    pub health_port: Option<u16>,
}

impl ClientConfig {
    /// Reads `HOOKRELAY_SOURCE_URL`, `HOOKRELAY_TARGET_URL`,
    /// `HOOKRELAY_IGNORE_EVENTS`, `HOOKRELAY_SAVE_DIR`, `HOOKRELAY_NO_REPLAY`
    /// and `HOOKRELAY_HEALTH_PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let health_port = match env("HOOKRELAY_HEALTH_PORT") {
            Some(p) => Some(p.parse().map_err(|e| ConfigError::Invalid {
                var: "HOOKRELAY_HEALTH_PORT",
                reason: format!("{e}"),
            })?),
            None => None,
        };
        let config = Self {
            source_url: env("HOOKRELAY_SOURCE_URL").ok_or(ConfigError::Missing("HOOKRELAY_SOURCE_URL"))?,
            target_url: env("HOOKRELAY_TARGET_URL").ok_or(ConfigError::Missing("HOOKRELAY_TARGET_URL"))?,
            ignore_events: env_list("HOOKRELAY_IGNORE_EVENTS"),
            save_dir: env("HOOKRELAY_SAVE_DIR").map(PathBuf::from),
            no_replay: env_flag("HOOKRELAY_NO_REPLAY"),
            health_port,
        };
        Ok(config)
    }

    pub fn is_ignored(&self, event: Option<&str>) -> bool {
        is_ignored(&self.ignore_events, event)
    }
}

pub(crate) fn is_ignored(list: &[String], event: Option<&str>) -> bool {
    match event {
        Some(event) => list.iter().any(|e| e == event),
        None => false,
    }
}

// ─── Poller ──────────────────────────────────────────────────────────────────

/// One repository and ref to watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    /// `owner/name`
    pub repo: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
}

impl PollTarget {
    pub fn branch(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: Some(branch.into()),
            tag: None,
        }
    }

    pub fn tag(repo: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: None,
            tag: Some(tag.into()),
        }
    }

    /// The tag when set, otherwise the branch (default `main`).
    pub fn reference(&self) -> &str {
        self.tag
            .as_deref()
            .or(self.branch.as_deref())
            .unwrap_or("main")
    }

    /// Parses `owner/name`, `owner/name@branch` or `owner/name#tag`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            var: "HOOKRELAY_POLL_REPOS",
            reason: format!("{raw}: {reason}"),
        };
        let (repo, target) = if let Some((repo, tag)) = raw.split_once('#') {
            (repo, Self::tag(repo, tag))
        } else if let Some((repo, branch)) = raw.split_once('@') {
            (repo, Self::branch(repo, branch))
        } else {
            (raw, Self::branch(raw, "main"))
        };
        match repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(target)
            }
            _ => Err(invalid("expected owner/name")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub targets: Vec<PollTarget>,
    pub interval: Duration,
    pub state_path: PathBuf,
    pub github_token: Option<String>,
    pub api_base: String,
    /// Directory cleared whenever a target changes.
    pub cache_dir: Option<PathBuf>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            state_path: default_state_path(),
            github_token: None,
            api_base: crate::github::DEFAULT_API_BASE.to_string(),
            cache_dir: None,
        }
    }
}

impl PollerConfig {
    /// Reads `HOOKRELAY_POLL_REPOS` (comma separated targets),
    /// `HOOKRELAY_POLL_INTERVAL_SECS`, `HOOKRELAY_STATE_PATH`, `GITHUB_TOKEN`,
    /// `HOOKRELAY_GITHUB_API` and `HOOKRELAY_CACHE_DIR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.targets = env_list("HOOKRELAY_POLL_REPOS")
            .iter()
            .map(|s| PollTarget::parse(s))
            .collect::<Result<_, _>>()?;
        if let Some(secs) = env("HOOKRELAY_POLL_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|e| ConfigError::Invalid {
                var: "HOOKRELAY_POLL_INTERVAL_SECS",
                reason: format!("{e}"),
            })?;
            config.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(path) = env("HOOKRELAY_STATE_PATH") {
            config.state_path = PathBuf::from(path);
        }
        config.github_token = env("GITHUB_TOKEN");
        if let Some(api) = env("HOOKRELAY_GITHUB_API") {
            config.api_base = api;
        }
        config.cache_dir = env("HOOKRELAY_CACHE_DIR").map(PathBuf::from);
        Ok(config)
    }
}

/// `<user cache dir>/hookrelay/poll-state.json`, or the working directory
/// when no cache dir is known.
pub fn default_state_path() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("hookrelay"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("poll-state.json")
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_list(var: &str) -> Vec<String> {
    env(var)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn env_flag(var: &str) -> bool {
    matches!(
        env(var).as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("1" | "true" | "yes")
    )
}
