//! Disposable linked working copies, one per pipeline run.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use crate::exec::Limits;
use crate::git::{is_protected_branch, Git};

/// A linked worktree checked out on a branch created for one run.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub repo_path: PathBuf,
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorkspaceManager {
    root: PathBuf,
    branch_prefix: String,
    probe: Limits,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, branch_prefix: impl Into<String>, probe: Limits) -> Self {
        Self {
            root: root.into(),
            branch_prefix: branch_prefix.into(),
            probe,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn git(&self, repo_path: &Path) -> Git {
        Git::new(repo_path).with_limits(self.probe, self.probe)
    }

    /// Pick the branch a run will create: the sanitized request, or a
    /// generated name when the request is empty, invalid or protected. A
    /// random suffix is added if the branch already exists.
    pub async fn resolve_branch(&self, repo_path: &Path, requested: Option<&str>) -> String {
        let base = requested
            .and_then(sanitize_branch_name)
            .filter(|b| !is_protected_branch(b))
            .unwrap_or_else(|| fallback_branch_name(&self.branch_prefix));
        let git = self.git(repo_path);
        if git.branch_exists(&base).await {
            format!("{base}-{}", random_suffix())
        } else {
            base
        }
    }

    /// Create a worktree of the current HEAD of `repo_path` on the new
    /// branch `branch`.
    pub async fn create(&self, repo_path: &Path, branch: &str) -> Result<Workspace> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating worktree root {}", self.root.display()))?;

        let repo_name = repo_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repo");
        let dir_name = format!("{repo_name}-{}-{}", branch.replace('/', "-"), random_suffix());
        let path = self.root.join(dir_name);

        self.git(repo_path).create_worktree(&path, branch).await?;
        info!(repo = %repo_path.display(), branch, path = %path.display(), "workspace created");
        Ok(Workspace {
            repo_path: repo_path.to_path_buf(),
            path,
            branch: branch.to_string(),
        })
    }

    /// Remove the worktree and, when asked, force-delete its branch. Safe to
    /// call more than once.
    pub async fn cleanup(&self, ws: &Workspace, delete_branch: bool) -> Result<()> {
        let git = self.git(&ws.repo_path);

        if ws.path.exists() {
            if let Err(e) = git.remove_worktree(&ws.path).await {
                warn!(path = %ws.path.display(), "worktree remove failed, deleting directory: {e:#}");
            }
            if ws.path.exists() {
                std::fs::remove_dir_all(&ws.path)
                    .with_context(|| format!("removing {}", ws.path.display()))?;
            }
        }
        if let Err(e) = git.prune_worktrees().await {
            warn!(repo = %ws.repo_path.display(), "worktree prune failed: {e:#}");
        }

        if delete_branch && git.branch_exists(&ws.branch).await {
            git.delete_branch(&ws.branch).await?;
            info!(branch = %ws.branch, "branch deleted");
        }

        if ws.path.exists() {
            return Err(anyhow!("workspace {} still exists after cleanup", ws.path.display()));
        }
        Ok(())
    }
}

/// Reduce `raw` to a git-safe branch name: `[A-Za-z0-9._/-]`, no empty or
/// dot-led segments, no `..`, no `.lock` suffix. `None` if nothing is left.
pub fn sanitize_branch_name(raw: &str) -> Option<String> {
    let mapped: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();

    let segments: Vec<String> = mapped
        .split('/')
        .map(|seg| {
            let mut s = seg.to_string();
            while s.contains("..") {
                s = s.replace("..", ".");
            }
            while s.contains("--") {
                s = s.replace("--", "-");
            }
            let mut s = s.trim_start_matches(['.', '-']).to_string();
            while let Some(stripped) = s.strip_suffix(".lock") {
                s = stripped.to_string();
            }
            s.trim_end_matches(['.', '-']).to_string()
        })
        .filter(|s| !s.is_empty())
        .collect();

    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}

pub fn fallback_branch_name(prefix: &str) -> String {
    format!("{prefix}update-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}

fn random_suffix() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{n:06x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::test_support::{git, init_repo};

    #[test]
    fn sanitizes_branch_names() {
        assert_eq!(sanitize_branch_name("depbot/lodash update").as_deref(), Some("depbot/lodash-update"));
        assert_eq!(sanitize_branch_name("feat//x").as_deref(), Some("feat/x"));
        assert_eq!(sanitize_branch_name("../../etc").as_deref(), Some("etc"));
        assert_eq!(sanitize_branch_name("a..b").as_deref(), Some("a.b"));
        assert_eq!(sanitize_branch_name("deps.lock").as_deref(), Some("deps"));
        assert_eq!(sanitize_branch_name("  ~^:?*[ ").as_deref(), None);
        assert_eq!(sanitize_branch_name(""), None);
        assert_eq!(sanitize_branch_name("/").as_deref(), None);
    }

    #[test]
    fn fallback_uses_prefix() {
        let name = fallback_branch_name("depbot/");
        assert!(name.starts_with("depbot/update-"));
        assert!(sanitize_branch_name(&name).as_deref() == Some(name.as_str()));
    }

    #[tokio::test]
    async fn protected_or_empty_request_gets_fallback() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path(), &[("a.txt", "a\n")]);
        let root = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(root.path(), "depbot/", Limits::secs(30));

        let b = mgr.resolve_branch(repo.path(), Some("main")).await;
        assert!(b.starts_with("depbot/update-"));
        let b = mgr.resolve_branch(repo.path(), Some("   ")).await;
        assert!(b.starts_with("depbot/update-"));
        let b = mgr.resolve_branch(repo.path(), Some("deps/weekly")).await;
        assert_eq!(b, "deps/weekly");

        git(repo.path(), &["branch", "deps/weekly"]);
        let b = mgr.resolve_branch(repo.path(), Some("deps/weekly")).await;
        assert!(b.starts_with("deps/weekly-"));
    }

    #[tokio::test]
    async fn create_and_cleanup_is_idempotent() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path(), &[("a.txt", "a\n")]);
        let root = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(root.path().join("wt"), "depbot/", Limits::secs(30));

        let ws = mgr.create(repo.path(), "depbot/x").await.unwrap();
        assert!(ws.path.join("a.txt").exists());
        std::fs::write(ws.path.join("a.txt"), "mutated\n").unwrap();

        mgr.cleanup(&ws, true).await.unwrap();
        assert!(!ws.path.exists());
        mgr.cleanup(&ws, true).await.unwrap();

        let g = Git::new(repo.path());
        assert!(!g.branch_exists("depbot/x").await);
        assert!(!g.is_dirty(repo.path()).await.unwrap());
        assert_eq!(std::fs::read_to_string(repo.path().join("a.txt")).unwrap(), "a\n");
    }

    #[tokio::test]
    async fn cleanup_can_keep_branch() {
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path(), &[("a.txt", "a\n")]);
        let root = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(root.path(), "depbot/", Limits::secs(30));

        let ws = mgr.create(repo.path(), "depbot/keep").await.unwrap();
        mgr.cleanup(&ws, false).await.unwrap();
        assert!(!ws.path.exists());
        assert!(Git::new(repo.path()).branch_exists("depbot/keep").await);
    }
}
