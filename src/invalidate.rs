//! Cache invalidation on upstream change.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::deliver::{DecodedWebhook, Deliver, DeliverError, DeliveryStatus};
use crate::poller::ChangeObserver;
use crate::types::CommitChange;

/// Removes one local cache directory.
#[derive(Debug, Clone)]
pub struct CacheInvalidator {
    dir: PathBuf,
}

impl CacheInvalidator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deletes the directory. `Ok(false)` when it was already gone.
    pub fn invalidate(&self) -> io::Result<bool> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                info!(dir = %self.dir.display(), "cache invalidated");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn invalidate_logged(&self) {
        if let Err(e) = self.invalidate() {
            warn!(dir = %self.dir.display(), error = %e, "cache invalidation failed");
        }
    }
}

/// A change callback that clears `dir`.
pub fn cache_invalidator(dir: impl Into<PathBuf>) -> impl Fn(&CommitChange) + Send + Sync + 'static {
    let invalidator = CacheInvalidator::new(dir);
    move |change: &CommitChange| {
        info!(repo = %change.repo, reference = %change.reference, "upstream changed");
        invalidator.invalidate_logged();
    }
}

#[async_trait]
impl ChangeObserver for CacheInvalidator {
    async fn on_change(&self, change: &CommitChange) {
        info!(repo = %change.repo, reference = %change.reference, "upstream changed");
        self.invalidate_logged();
    }
}

/// Any received webhook clears the cache.
#[async_trait]
impl Deliver for CacheInvalidator {
    async fn deliver(&self, _hook: &DecodedWebhook) -> Result<DeliveryStatus, DeliverError> {
        self.invalidate()?;
        Ok(DeliveryStatus(200))
    }
}
