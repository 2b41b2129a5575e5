use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::exec::{self, ExecResult, Limits};

/// Branches the engine never mutates directly.
pub const PROTECTED_BRANCHES: [&str; 5] = ["main", "master", "develop", "production", "staging"];

pub fn is_protected_branch(name: &str) -> bool {
    PROTECTED_BRANCHES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictPrediction {
    pub default_branch: String,
    pub behind: u32,
    pub conflicting_files: Vec<String>,
    /// Set only when at least one file is touched on both sides.
    pub severity: Option<ConflictSeverity>,
}

impl ConflictPrediction {
    pub fn warning(&self) -> Option<String> {
        let severity = self.severity?;
        Some(format!(
            "{:?} merge-conflict risk: {} commits behind origin/{}; {} file(s) changed on both sides",
            severity,
            self.behind,
            self.default_branch,
            self.conflicting_files.len()
        ))
    }
}

pub struct Git {
    pub repo_path: PathBuf,
    probe: Limits,
    network: Limits,
}

impl Git {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            probe: Limits::secs(30),
            network: Limits::secs(120),
        }
    }

    pub fn with_limits(mut self, probe: Limits, network: Limits) -> Self {
        self.probe = probe;
        self.network = network;
        self
    }

    pub async fn exec(&self, dir: &Path, args: &[&str]) -> ExecResult {
        exec::run(dir, "git", args, self.probe).await
    }

    async fn exec_ok(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let result = self.exec(dir, args).await;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                failure_text(&result)
            ));
        }
        Ok(result.stdout)
    }

    pub async fn is_repo(&self) -> bool {
        self.exec(&self.repo_path, &["rev-parse", "--git-dir"]).await.success()
    }

    pub async fn current_branch(&self, dir: &Path) -> Result<String> {
        let out = self
            .exec_ok(dir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        Ok(out.trim().to_string())
    }

    /// `origin/HEAD` when known, otherwise a local `main` or `master`.
    pub async fn default_branch(&self) -> Result<String> {
        let remote_head = self
            .exec(
                &self.repo_path,
                &["symbolic-ref", "--quiet", "--short", "refs/remotes/origin/HEAD"],
            )
            .await;
        if remote_head.success() {
            let name = remote_head.stdout.trim();
            if let Some(branch) = name.strip_prefix("origin/") {
                return Ok(branch.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.branch_exists(candidate).await {
                return Ok(candidate.to_string());
            }
        }
        Err(anyhow!(
            "could not determine default branch of {}",
            self.repo_path.display()
        ))
    }

    pub async fn is_dirty(&self, dir: &Path) -> Result<bool> {
        let out = self.exec_ok(dir, &["status", "--porcelain"]).await?;
        Ok(!out.trim().is_empty())
    }

    /// `(ahead, behind)` relative to the upstream of the current branch, or
    /// `None` when no upstream is configured.
    pub async fn ahead_behind(&self, dir: &Path) -> Result<Option<(u32, u32)>> {
        let upstream = self
            .exec(dir, &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{upstream}"])
            .await;
        if !upstream.success() {
            return Ok(None);
        }
        let out = self
            .exec_ok(dir, &["rev-list", "--left-right", "--count", "HEAD...@{upstream}"])
            .await?;
        parse_left_right(&out).map(Some)
    }

    pub async fn has_remote(&self, name: &str) -> bool {
        let result = self.exec(&self.repo_path, &["remote"]).await;
        result.success() && result.stdout.lines().any(|l| l.trim() == name)
    }

    pub async fn fetch(&self, remote: &str) -> Result<()> {
        let result = exec::run(&self.repo_path, "git", &["fetch", remote], self.network).await;
        if !result.success() {
            return Err(anyhow!("git fetch {remote} failed: {}", failure_text(&result)));
        }
        Ok(())
    }

    pub async fn branch_exists(&self, branch: &str) -> bool {
        let refname = format!("refs/heads/{branch}");
        self.exec(&self.repo_path, &["rev-parse", "--verify", "--quiet", &refname])
            .await
            .success()
    }

    /// Linked working copy of the current HEAD on a new branch. The source
    /// checkout's index and working tree are not touched.
    pub async fn create_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        let result = self
            .exec(
                &self.repo_path,
                &["worktree", "add", "-b", branch, &path_str, "HEAD"],
            )
            .await;
        if !result.success() {
            return Err(anyhow!(
                "git worktree add failed for branch={branch}: {}",
                failure_text(&result)
            ));
        }
        debug!(branch, path = %path.display(), "worktree created");
        Ok(())
    }

    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        self.exec_ok(&self.repo_path, &["worktree", "remove", "--force", &path_str])
            .await
            .with_context(|| format!("removing worktree {}", path.display()))?;
        Ok(())
    }

    pub async fn prune_worktrees(&self) -> Result<()> {
        self.exec_ok(&self.repo_path, &["worktree", "prune"]).await?;
        Ok(())
    }

    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.exec_ok(&self.repo_path, &["branch", "-D", branch]).await?;
        Ok(())
    }

    /// Stage `files` (those present in `dir`) and commit. Returns `false`
    /// when nothing ended up staged.
    pub async fn commit_files(
        &self,
        dir: &Path,
        files: &[String],
        message: &str,
        author: Option<(&str, &str)>,
    ) -> Result<bool> {
        let present: Vec<&str> = files
            .iter()
            .map(String::as_str)
            .filter(|f| dir.join(f).exists())
            .collect();
        if present.is_empty() {
            return Ok(false);
        }

        let mut add = vec!["add", "-A", "--"];
        add.extend(present.iter().copied());
        self.exec_ok(dir, &add).await?;

        let staged = self.exec(dir, &["diff", "--cached", "--quiet"]).await;
        if staged.success() {
            return Ok(false);
        }

        let mut args = vec!["commit", "-m", message];
        let author_str;
        if let Some((name, email)) = author {
            author_str = format!("{name} <{email}>");
            args.push("--author");
            args.push(&author_str);
        }
        let result = self.exec(dir, &args).await;
        if !result.success() {
            return Err(anyhow!(
                "git commit failed in {}: {}",
                dir.display(),
                failure_text(&result)
            ));
        }
        Ok(true)
    }

    pub async fn push_branch(&self, dir: &Path, branch: &str) -> Result<()> {
        let result = exec::run(dir, "git", &["push", "-u", "origin", branch], self.network).await;
        if !result.success() {
            return Err(anyhow!(
                "git push origin {branch} failed: {}",
                failure_text(&result)
            ));
        }
        Ok(())
    }

    /// Throw away uncommitted changes in `dir`.
    pub async fn discard_changes(&self, dir: &Path) -> Result<()> {
        self.exec_ok(dir, &["checkout", "--", "."]).await?;
        self.exec_ok(dir, &["clean", "-fd"]).await?;
        Ok(())
    }

    pub async fn rev_parse(&self, dir: &Path, refname: &str) -> Result<String> {
        let out = self.exec_ok(dir, &["rev-parse", refname]).await?;
        Ok(out.trim().to_string())
    }

    pub async fn count_commits(&self, dir: &Path, range: &str) -> Result<u32> {
        let out = self.exec_ok(dir, &["rev-list", "--count", range]).await?;
        out.trim()
            .parse()
            .with_context(|| format!("parsing rev-list count {:?}", out.trim()))
    }

    async fn changed_files(&self, from: &str, to: &str) -> Result<BTreeSet<String>> {
        let range = format!("{from}..{to}");
        let out = self
            .exec_ok(&self.repo_path, &["diff", "--name-only", &range])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Fetch `origin` and compare the current HEAD with `origin/<default>`.
    /// When HEAD is at least `threshold` commits behind, files changed on
    /// both sides since the merge base are reported.
    pub async fn predict_merge_conflicts(
        &self,
        threshold: u32,
        high_threshold: u32,
    ) -> Result<ConflictPrediction> {
        self.fetch("origin").await?;
        let default_branch = self.default_branch().await?;
        let upstream = format!("origin/{default_branch}");
        let behind = self
            .count_commits(&self.repo_path, &format!("HEAD..{upstream}"))
            .await?;

        let mut prediction = ConflictPrediction {
            default_branch,
            behind,
            conflicting_files: Vec::new(),
            severity: None,
        };
        if behind < threshold {
            return Ok(prediction);
        }

        let base = self
            .exec_ok(&self.repo_path, &["merge-base", "HEAD", &upstream])
            .await?;
        let base = base.trim();
        let ours = self.changed_files(base, "HEAD").await?;
        let theirs = self.changed_files(base, &upstream).await?;
        prediction.conflicting_files = ours.intersection(&theirs).cloned().collect();
        if !prediction.conflicting_files.is_empty() {
            prediction.severity = Some(if behind >= high_threshold {
                ConflictSeverity::High
            } else {
                ConflictSeverity::Medium
            });
        }
        Ok(prediction)
    }

    /// Unix timestamps of commits on HEAD from the last `days` days.
    pub async fn commit_timestamps(&self, days: u32) -> Result<Vec<i64>> {
        let since = format!("--since={days} days ago");
        let out = self
            .exec_ok(&self.repo_path, &["log", &since, "--format=%ct"])
            .await?;
        Ok(out
            .lines()
            .filter_map(|l| l.trim().parse::<i64>().ok())
            .collect())
    }
}

fn failure_text(result: &ExecResult) -> String {
    let out = result.combined_output();
    if out.trim().is_empty() {
        result.describe()
    } else {
        out.trim().to_string()
    }
}

fn parse_left_right(out: &str) -> Result<(u32, u32)> {
    let mut parts = out.split_whitespace();
    let ahead = parts.next().and_then(|s| s.parse().ok());
    let behind = parts.next().and_then(|s| s.parse().ok());
    match (ahead, behind) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(anyhow!("unexpected rev-list output: {out:?}")),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::process::Command;

    pub fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).into_owned()
    }

    /// A repository on `main` with one commit containing `files`.
    pub fn init_repo(dir: &Path, files: &[(&str, &str)]) {
        git(dir, &["init", "-q", "-b", "main"]);
        git(dir, &["config", "user.name", "Test"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "commit.gpgsign", "false"]);
        for (name, body) in files {
            std::fs::write(dir.join(name), body).unwrap();
        }
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "initial"]);
    }
}
