//! Pull-based change detection.
//!
//! [`Poller`] reports the current commit of every target on every pass.
//! [`StatefulPoller`] wraps it and only reports commits that differ from
//! the persisted [`PollState`](crate::types::PollState).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PollTarget;
use crate::github::{short_hash, GitHubClient, GitHubError};
use crate::store::{PollStateStore, Recorded};
use crate::types::{CommitChange, PollState, PollUpdate};

/// Where commit hashes come from.
#[async_trait]
pub trait CommitSource: Send + Sync {
    async fn branch_head(&self, repo: &str, branch: &str) -> Result<String, GitHubError>;
    async fn tag_commit(&self, repo: &str, tag: &str) -> Result<String, GitHubError>;
}

#[async_trait]
impl CommitSource for GitHubClient {
    async fn branch_head(&self, repo: &str, branch: &str) -> Result<String, GitHubError> {
        GitHubClient::branch_head(self, repo, branch).await
    }

    async fn tag_commit(&self, repo: &str, tag: &str) -> Result<String, GitHubError> {
        GitHubClient::tag_commit(self, repo, tag).await
    }
}

/// Notified after every successful check, changed or not.
#[async_trait]
pub trait PollObserver: Send + Sync {
    async fn on_update(&self, update: &PollUpdate);
}

/// Notified only when a commit differs from the recorded one.
#[async_trait]
pub trait ChangeObserver: Send + Sync {
    async fn on_change(&self, change: &CommitChange);
}

#[async_trait]
impl<F> PollObserver for F
where
    F: Fn(&PollUpdate) + Send + Sync,
{
    async fn on_update(&self, update: &PollUpdate) {
        self(update)
    }
}

#[async_trait]
impl<F> ChangeObserver for F
where
    F: Fn(&CommitChange) + Send + Sync,
{
    async fn on_change(&self, change: &CommitChange) {
        self(change)
    }
}

struct NoopObserver;

#[async_trait]
impl PollObserver for NoopObserver {
    async fn on_update(&self, _update: &PollUpdate) {}
}

// ─── Poller ──────────────────────────────────────────────────────────────────

pub struct Poller {
    targets: Vec<PollTarget>,
    source: Arc<dyn CommitSource>,
    interval: Duration,
    observer: Arc<dyn PollObserver>,
}

impl Poller {
    pub fn new(targets: Vec<PollTarget>, source: Arc<dyn CommitSource>, interval: Duration) -> Self {
        Self {
            targets,
            source,
            interval,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Poller backed by the GitHub API.
    pub fn github(config: &crate::config::PollerConfig) -> Result<Self, GitHubError> {
        let client = GitHubClient::new(&config.api_base, config.github_token.as_deref())?;
        Ok(Self::new(config.targets.clone(), Arc::new(client), config.interval))
    }

    pub fn on_update(mut self, observer: impl PollObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn targets(&self) -> &[PollTarget] {
        &self.targets
    }

    /// Current short hash for one target.
    pub async fn fetch(&self, target: &PollTarget) -> Result<String, GitHubError> {
        let sha = match &target.tag {
            Some(tag) => self.source.tag_commit(&target.repo, tag).await?,
            None => {
                let branch = target.branch.as_deref().unwrap_or("main");
                self.source.branch_head(&target.repo, branch).await?
            }
        };
        Ok(short_hash(&sha))
    }

    /// Checks every target once. A failing target is logged and skipped.
    /// Returns the number of targets checked successfully.
    pub async fn check_all(&self) -> usize {
        let mut ok = 0;
        for target in &self.targets {
            match self.fetch(target).await {
                Ok(hash) => {
                    debug!(repo = %target.repo, reference = target.reference(), hash = %hash, "polled");
                    let update = PollUpdate {
                        repo: target.repo.clone(),
                        reference: target.reference().to_string(),
                        old_hash: String::new(),
                        new_hash: hash,
                    };
                    self.observer.on_update(&update).await;
                    ok += 1;
                }
                Err(e) => {
                    warn!(repo = %target.repo, reference = target.reference(), error = %e, "poll failed");
                }
            }
        }
        ok
    }

    /// Checks immediately, then on every interval tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(targets = self.targets.len(), interval = ?self.interval, "poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_all().await;
                }
            }
        }
        info!("poller stopped");
    }

    pub fn start_async(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

// ─── StatefulPoller ──────────────────────────────────────────────────────────

/// Bridges poll updates to change notifications through the state store.
struct ChangeFilter {
    store: Arc<PollStateStore>,
    observer: Arc<dyn ChangeObserver>,
}

#[async_trait]
impl PollObserver for ChangeFilter {
    async fn on_update(&self, update: &PollUpdate) {
        let recorded = self
            .store
            .record_if_changed(&update.repo, &update.reference, &update.new_hash)
            .await;
        if let Recorded::Changed { old_hash, .. } = recorded {
            info!(
                repo = %update.repo,
                reference = %update.reference,
                old = %old_hash,
                new = %update.new_hash,
                "commit changed"
            );
            let change = CommitChange {
                repo: update.repo.clone(),
                reference: update.reference.clone(),
                old_hash,
                new_hash: update.new_hash.clone(),
            };
            self.observer.on_change(&change).await;
        }
    }
}

pub struct StatefulPoller {
    poller: Poller,
    store: Arc<PollStateStore>,
}

impl StatefulPoller {
    /// Loads state from `state_path` and wires the change filter into
    /// `poller`, replacing any update observer it had.
    pub fn new(
        poller: Poller,
        state_path: impl Into<PathBuf>,
        observer: impl ChangeObserver + 'static,
    ) -> Self {
        Self::with_store(poller, Arc::new(PollStateStore::open(state_path)), observer)
    }

    /// Shares an existing store, e.g. between pollers in one process.
    pub fn with_store(
        poller: Poller,
        store: Arc<PollStateStore>,
        observer: impl ChangeObserver + 'static,
    ) -> Self {
        let filter = ChangeFilter {
            store: store.clone(),
            observer: Arc::new(observer),
        };
        Self {
            poller: poller.on_update(filter),
            store,
        }
    }

    pub async fn check_all(&self) -> usize {
        self.poller.check_all().await
    }

    pub async fn state(&self) -> PollState {
        self.store.snapshot().await
    }

    pub fn store(&self) -> &Arc<PollStateStore> {
        &self.store
    }

    pub async fn run(&self, cancel: CancellationToken) {
        self.poller.run(cancel).await
    }

    pub fn start_async(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
