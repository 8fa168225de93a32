//! Replays historical hook deliveries from the GitHub API to a local target.
//!
//! A pass lists deliveries newer than the `since` watermark and re-sends them
//! oldest first with their recorded headers, moving the watermark past each
//! one handled. Continuous mode repeats passes on an interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureDir;
use crate::config::is_ignored;
use crate::deliver::{DecodedWebhook, Deliver, Forwarder};
use crate::github::{GitHubClient, GitHubError, HookOwner, DEFAULT_API_BASE};
use crate::types::{HookInfo, WebhookDelivery};

const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay configuration: {0} is required")]
    Missing(&'static str),

    #[error(transparent)]
    GitHub(#[from] GitHubError),
}

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Repository or organization owning the hook.
    pub target: Option<HookOwner>,
    pub hook_id: Option<u64>,
    pub target_url: String,
    /// Only deliveries at or after this instant. `None` replays everything
    /// the API still lists.
    pub since: Option<DateTime<Utc>>,
    pub ignore_events: Vec<String>,
    pub save_dir: Option<PathBuf>,
    pub continuous: bool,
    pub poll_interval: Duration,
    pub token: Option<String>,
    pub api_base: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            target: None,
            hook_id: None,
            target_url: String::new(),
            since: None,
            ignore_events: Vec::new(),
            save_dir: None,
            continuous: false,
            poll_interval: DEFAULT_REPLAY_INTERVAL,
            token: None,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl ReplayConfig {
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.target.is_none() {
            return Err(ReplayError::Missing("repository or organization"));
        }
        if self.hook_id.is_none() {
            return Err(ReplayError::Missing("hook id"));
        }
        if self.target_url.trim().is_empty() {
            return Err(ReplayError::Missing("target URL"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub replayed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Replayed,
    Skipped,
    /// Not delivered; the watermark stays before it.
    Retry,
}

pub struct Replayer {
    config: ReplayConfig,
    owner: HookOwner,
    hook_id: u64,
    github: GitHubClient,
    target: Arc<dyn Deliver>,
    capture: Option<CaptureDir>,
    since: Option<DateTime<Utc>>,
}

impl Replayer {
    /// Validates `config` before any network activity.
    pub fn new(config: ReplayConfig) -> Result<Self, ReplayError> {
        let target = Arc::new(Forwarder::new(config.target_url.clone()));
        Self::with_target(config, target)
    }

    pub fn with_target(config: ReplayConfig, target: Arc<dyn Deliver>) -> Result<Self, ReplayError> {
        config.validate()?;
        let (Some(owner), Some(hook_id)) = (config.target.clone(), config.hook_id) else {
            return Err(ReplayError::Missing("hook"));
        };
        let github = GitHubClient::new(&config.api_base, config.token.as_deref())?;
        Ok(Self {
            owner,
            hook_id,
            github,
            target,
            capture: config.save_dir.clone().map(CaptureDir::new),
            since: config.since,
            config,
        })
    }

    /// Current watermark.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    pub async fn list_hooks(&self) -> Result<Vec<HookInfo>, ReplayError> {
        Ok(self.github.list_hooks(&self.owner).await?)
    }

    /// Deliveries at or after `since`, newest first. Paging stops at the
    /// first page that reaches older entries.
    pub async fn list_deliveries(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<WebhookDelivery>, ReplayError> {
        let mut url = Some(self.github.deliveries_url(&self.owner, self.hook_id));
        let mut out = Vec::new();

        while let Some(page_url) = url {
            let (page, next) = self.github.deliveries_page(&page_url).await?;
            let reached_older = since.is_some_and(|s| page.iter().any(|d| d.delivered_at < s));
            out.extend(
                page.into_iter()
                    .filter(|d| since.map_or(true, |s| d.delivered_at >= s)),
            );
            if reached_older {
                break;
            }
            url = next;
        }
        Ok(out)
    }

    /// One pass over new deliveries, oldest first.
    ///
    /// The watermark moves past each delivery that was replayed or skipped.
    /// A delivery whose detail could not be fetched or whose target could
    /// not be reached ends the pass and is retried by the next one.
    pub async fn replay_once(&mut self) -> Result<ReplayReport, ReplayError> {
        let deliveries = self.list_deliveries(self.since).await?;
        debug!(hook = self.hook_id, count = deliveries.len(), "deliveries to replay");

        let mut report = ReplayReport::default();
        for delivery in deliveries.into_iter().rev() {
            match self.replay_delivery(&delivery).await {
                Outcome::Replayed => report.replayed += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Retry => {
                    report.failed += 1;
                    break;
                }
            }
            self.since = Some(delivery.delivered_at + TimeDelta::milliseconds(1));
        }
        Ok(report)
    }

    async fn replay_delivery(&self, delivery: &WebhookDelivery) -> Outcome {
        if is_ignored(&self.config.ignore_events, Some(delivery.event.as_str())) {
            info!(event = %delivery.event, guid = %delivery.guid, "Replay: skipping ignored event");
            return Outcome::Skipped;
        }

        let detail = match self
            .github
            .delivery_detail(&self.owner, self.hook_id, delivery.id)
            .await
        {
            Ok(detail) => detail,
            Err(e) => {
                warn!(guid = %delivery.guid, error = %e, "Replay: failed to fetch delivery");
                return Outcome::Retry;
            }
        };

        let headers = detail.request.headers.into_iter().collect();
        // Keys keep their recorded order, so the recorded signature still holds.
        let body = match serde_json::to_vec(&detail.request.payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(guid = %delivery.guid, error = %e, "Replay: failed to encode payload");
                return Outcome::Retry;
            }
        };
        let hook = DecodedWebhook::new(headers, body);

        if let Some(capture) = &self.capture {
            if let Err(e) = capture.save(&hook, &self.config.target_url) {
                warn!(dir = %capture.path().display(), error = %e, "Replay: failed to capture delivery");
            }
        }

        match self.target.deliver(&hook).await {
            Ok(status) => {
                info!(
                    "Replay: Replayed {} [{}] -> {}",
                    delivery.event, delivery.guid, status.0
                );
                Outcome::Replayed
            }
            Err(e) => {
                warn!(event = %delivery.event, guid = %delivery.guid, error = %e, "Replay: delivery failed");
                Outcome::Retry
            }
        }
    }

    /// One pass, or repeated passes in continuous mode until cancelled.
    /// Continuous mode logs failed passes and keeps going.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ReplayError> {
        info!(owner = %self.owner, hook = self.hook_id, target = %self.config.target_url, "starting replay");
        loop {
            match self.replay_once().await {
                Ok(report) => {
                    if report != ReplayReport::default() {
                        info!(
                            replayed = report.replayed,
                            skipped = report.skipped,
                            failed = report.failed,
                            "replay pass finished"
                        );
                    }
                }
                Err(e) if self.config.continuous => warn!(error = %e, "replay pass failed"),
                Err(e) => return Err(e),
            }

            if !self.config.continuous {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}
