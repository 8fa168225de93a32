use crate::types::PollState;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize poll state: {0}")]
    Json(#[from] serde_json::Error),

    #[error("poll state writer panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Loads a poll state document.
///
/// A missing, unreadable or corrupt file yields an empty state: the next
/// poll then treats every ref as changed, which is safe.
pub fn load_state(path: &Path) -> PollState {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return PollState::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable poll state, starting fresh");
            return PollState::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(state) => state,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt poll state, starting fresh");
            PollState::default()
        }
    }
}

/// Writes the document via a temp file and rename. The temp file is
/// removed again when either step fails.
pub fn save_state(path: &Path, state: &PollState) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let content = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    let written = std::fs::write(&tmp, content).and_then(|()| std::fs::rename(&tmp, path));
    if let Err(source) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(source));
    }
    Ok(())
}

/// Runs [`save_state`] on the blocking pool.
async fn persist(path: &Path, state: PollState) -> Result<(), StoreError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || save_state(&path, &state)).await?
}

/// Poll state bound to a file. The mutex spans each read-modify-write so
/// pollers sharing a store never interleave their saves.
pub struct PollStateStore {
    path: PathBuf,
    state: Mutex<PollState>,
}

/// Result of [`PollStateStore::record_if_changed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Unchanged,
    /// `saved` is false when the new hash could not be persisted.
    Changed { old_hash: String, saved: bool },
}

impl PollStateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_state(&path);
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> PollState {
        self.state.lock().await.clone()
    }

    pub async fn has_changed(&self, repo: &str, reference: &str, hash: &str) -> bool {
        self.state.lock().await.has_changed(repo, reference, hash)
    }

    /// Compares, updates and persists under one lock.
    pub async fn record_if_changed(&self, repo: &str, reference: &str, hash: &str) -> Recorded {
        let mut state = self.state.lock().await;
        if !state.has_changed(repo, reference, hash) {
            return Recorded::Unchanged;
        }
        let old_hash = state.update(repo, reference, hash);
        let saved = match persist(&self.path, state.clone()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "failed to persist poll state");
                false
            }
        };
        Recorded::Changed { old_hash, saved }
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let state = self.state.lock().await;
        persist(&self.path, state.clone()).await
    }
}
