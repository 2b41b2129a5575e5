use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::PipelineError;

/// Repositories with a run in flight. A second run against the same path is
/// refused rather than queued.
#[derive(Clone, Default)]
pub struct RepoLocks {
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Held for the duration of one run; releases the repository on drop.
pub struct RepoGuard {
    active: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, repo: &Path) -> Result<RepoGuard, PipelineError> {
        let key = repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf());
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.clone()) {
            return Err(PipelineError::RepoBusy(repo.display().to_string()));
        }
        Ok(RepoGuard {
            active: Arc::clone(&self.active),
            path: key,
        })
    }

    pub fn is_busy(&self, repo: &Path) -> bool {
        let key = repo.canonicalize().unwrap_or_else(|_| repo.to_path_buf());
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&key)
    }
}

impl Drop for RepoGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let locks = RepoLocks::new();

        let guard = locks.try_acquire(dir.path()).unwrap();
        assert!(locks.is_busy(dir.path()));
        assert!(matches!(locks.try_acquire(dir.path()), Err(PipelineError::RepoBusy(_))));

        let other = tempfile::tempdir().unwrap();
        assert!(locks.try_acquire(other.path()).is_ok());

        drop(guard);
        assert!(!locks.is_busy(dir.path()));
        assert!(locks.try_acquire(dir.path()).is_ok());
    }
}
