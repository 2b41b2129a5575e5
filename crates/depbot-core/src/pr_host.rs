use std::path::Path;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::exec::{self, Limits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrReadiness {
    Ready,
    NotInstalled,
    NotAuthenticated,
}

#[derive(Debug, Clone)]
pub struct PrRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: Option<String>,
}

/// Hosted pull-request service reached through its CLI.
#[async_trait]
pub trait PrHost: Send + Sync {
    async fn readiness(&self, repo: &Path) -> PrReadiness;

    /// Open a PR for an already-pushed branch and return its URL.
    async fn create_pr(&self, dir: &Path, req: &PrRequest) -> Result<String>;

    async fn create_issue(&self, dir: &Path, title: &str, body: &str) -> Result<String>;
}

/// The GitHub CLI.
pub struct GhCli {
    bin: String,
    probe: Limits,
    network: Limits,
}

impl GhCli {
    pub fn new(bin: impl Into<String>, probe: Limits, network: Limits) -> Self {
        Self {
            bin: bin.into(),
            probe,
            network,
        }
    }
}

/// `gh` prints the created URL as the last stdout line.
fn last_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with("http://") || l.starts_with("https://"))
        .map(str::to_string)
}

#[async_trait]
impl PrHost for GhCli {
    async fn readiness(&self, repo: &Path) -> PrReadiness {
        if !exec::is_installed(&self.bin, self.probe).await {
            return PrReadiness::NotInstalled;
        }
        let status = exec::run(repo, &self.bin, &["auth", "status"], self.probe).await;
        if status.success() {
            PrReadiness::Ready
        } else {
            PrReadiness::NotAuthenticated
        }
    }

    async fn create_pr(&self, dir: &Path, req: &PrRequest) -> Result<String> {
        let mut args: Vec<&str> = vec![
            "pr",
            "create",
            "--title",
            req.title.as_str(),
            "--body",
            req.body.as_str(),
            "--head",
            req.head.as_str(),
        ];
        if let Some(base) = &req.base {
            args.push("--base");
            args.push(base.as_str());
        }
        let result = exec::run(dir, &self.bin, &args, self.network).await;
        if !result.success() {
            return Err(anyhow!("gh pr create {}: {}", result.describe(), result.combined_output().trim()));
        }
        let url = last_url(&result.stdout).ok_or_else(|| anyhow!("gh pr create printed no URL"))?;
        info!(url = %url, head = %req.head, "pull request created");
        Ok(url)
    }

    async fn create_issue(&self, dir: &Path, title: &str, body: &str) -> Result<String> {
        let result = exec::run(
            dir,
            &self.bin,
            &["issue", "create", "--title", title, "--body", body],
            self.network,
        )
        .await;
        if !result.success() {
            return Err(anyhow!("gh issue create {}: {}", result.describe(), result.combined_output().trim()));
        }
        last_url(&result.stdout).ok_or_else(|| anyhow!("gh issue create printed no URL"))
    }
}
