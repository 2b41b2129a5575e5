use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ecosystem::version;

// ── Ecosystems ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcosystemKind {
    Node,
    Python,
    Ruby,
    Elixir,
}

impl EcosystemKind {
    pub const ALL: [EcosystemKind; 4] = [Self::Node, Self::Python, Self::Ruby, Self::Elixir];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Python => "python",
            Self::Ruby => "ruby",
            Self::Elixir => "elixir",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "node" | "npm" | "javascript" => Some(Self::Node),
            "python" | "pip" => Some(Self::Python),
            "ruby" | "bundler" => Some(Self::Ruby),
            "elixir" | "mix" => Some(Self::Elixir),
            _ => None,
        }
    }

    /// Manifest files whose presence marks a directory as this ecosystem.
    pub fn manifests(&self) -> &'static [&'static str] {
        match self {
            Self::Node => &["package.json"],
            Self::Python => &["requirements.txt", "pyproject.toml", "Pipfile"],
            Self::Ruby => &["Gemfile"],
            Self::Elixir => &["mix.exs"],
        }
    }

    pub fn detect(dir: &Path) -> Vec<EcosystemKind> {
        Self::ALL
            .into_iter()
            .filter(|k| k.manifests().iter().any(|m| dir.join(m).is_file()))
            .collect()
    }
}

impl fmt::Display for EcosystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Repository ───────────────────────────────────────────────────────────

/// A local repository known to the installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub path: String,
    pub name: String,
    pub ecosystems: Vec<EcosystemKind>,
    pub has_git: bool,
    pub exists: bool,
}

impl Repository {
    /// Inspect `path` on disk: existence, `.git` presence and ecosystems.
    pub fn inspect(path: &str) -> Self {
        let p = Path::new(path);
        let exists = p.is_dir();
        let name = p
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_string();
        Self {
            path: path.to_string(),
            name,
            ecosystems: if exists { EcosystemKind::detect(p) } else { Vec::new() },
            has_git: exists && p.join(".git").exists(),
            exists,
        }
    }
}

// ── Packages ─────────────────────────────────────────────────────────────

/// A package selected for update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateTarget {
    pub name: String,
    pub ecosystem: EcosystemKind,
}

impl UpdateTarget {
    pub fn new(name: impl Into<String>, ecosystem: EcosystemKind) -> Self {
        Self {
            name: name.into(),
            ecosystem,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Patch,
    Minor,
    Major,
    Unknown,
}

impl UpdateType {
    pub fn is_non_breaking(&self) -> bool {
        matches!(self, Self::Patch | Self::Minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    Direct,
    Dev,
}

/// One outdated dependency. Computed per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutdatedPackage {
    pub name: String,
    pub ecosystem: EcosystemKind,
    pub current: String,
    pub wanted: String,
    pub latest: String,
    pub dependency_type: DependencyType,
    pub update_type: UpdateType,
    pub is_non_breaking: bool,
}

impl OutdatedPackage {
    pub fn new(
        ecosystem: EcosystemKind,
        name: impl Into<String>,
        current: impl Into<String>,
        wanted: impl Into<String>,
        latest: impl Into<String>,
        dependency_type: DependencyType,
    ) -> Self {
        let current = current.into();
        let latest = latest.into();
        let update_type = version::classify(&current, &latest);
        Self {
            name: name.into(),
            ecosystem,
            current,
            wanted: wanted.into(),
            latest,
            dependency_type,
            update_type,
            is_non_breaking: update_type.is_non_breaking(),
        }
    }

    pub fn target_version(&self, strategy: UpdateStrategy) -> &str {
        match strategy {
            UpdateStrategy::Latest => &self.latest,
            UpdateStrategy::Wanted if !self.wanted.is_empty() => &self.wanted,
            UpdateStrategy::Wanted => &self.latest,
        }
    }
}

/// Which version an update moves a package to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    #[default]
    Latest,
    /// Highest version satisfying the manifest's declared range.
    Wanted,
}

/// Result of an adapter's `update` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub updated: Vec<String>,
    pub failed: Vec<String>,
}

// ── Pipeline ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Preparing,
    Updating,
    Installing,
    Testing,
    Linting,
    Committing,
    Pushing,
    CreatingPr,
    Done,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Updating => "updating",
            Self::Installing => "installing",
            Self::Testing => "testing",
            Self::Linting => "linting",
            Self::Committing => "committing",
            Self::Pushing => "pushing",
            Self::CreatingPr => "creating_pr",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to a selective update run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub targets: Vec<UpdateTarget>,
    /// Branch to create; sanitized, and replaced by a generated name when empty.
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default)]
    pub run_tests: bool,
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    /// Overrides the configured test timeout.
    #[serde(default)]
    pub test_timeout_s: Option<u64>,
    #[serde(default)]
    pub pr_title: Option<String>,
    #[serde(default)]
    pub pr_body: Option<String>,
}

impl UpdateRequest {
    pub fn new(targets: Vec<UpdateTarget>) -> Self {
        Self {
            targets,
            branch_name: None,
            create_pr: false,
            run_tests: false,
            update_strategy: UpdateStrategy::Latest,
            test_timeout_s: None,
            pr_title: None,
            pr_body: None,
        }
    }
}

/// Flags for the non-breaking bulk variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NonBreakingRequest {
    pub ecosystem: Option<EcosystemKind>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default)]
    pub run_tests: bool,
    #[serde(default)]
    pub test_timeout_s: Option<u64>,
}

/// Terminal outcome of one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub updated_packages: Vec<String>,
    pub failed_packages: Vec<String>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub tests_passed: Option<bool>,
    pub branch: String,
    /// True once a commit exists on `branch`; the branch is then preserved.
    pub committed: bool,
    pub log: Vec<String>,
}

/// Observer-facing events. This is the only UI contract of the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress {
        branch: String,
        message: String,
        step: usize,
        total: usize,
    },
    Log {
        branch: String,
        line: String,
    },
    Warning {
        branch: String,
        message: String,
        output: String,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Log { .. } => "log",
            Self::Warning { .. } => "warning",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Progress { message, .. } | Self::Warning { message, .. } => message,
            Self::Log { line, .. } => line,
        }
    }
}

// ── Security ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" | "info" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Moderate,
        }
    }
}

/// A vulnerable dependency reported by an audit collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub package: String,
    pub ecosystem: EcosystemKind,
    pub severity: Severity,
    pub fix_version: Option<String>,
    pub fix_is_major: bool,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityRequest {
    pub ecosystem: Option<EcosystemKind>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default)]
    pub run_tests: bool,
    /// Open a follow-up issue for each package that could not be patched.
    #[serde(default)]
    pub open_issues: bool,
    #[serde(default)]
    pub test_timeout_s: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFix {
    pub package: String,
    pub version: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFailure {
    pub package: String,
    pub reason: String,
    pub issue_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityPatchResult {
    pub success: bool,
    pub fixed: Vec<PackageFix>,
    pub failed: Vec<PackageFailure>,
    /// Vulnerabilities with no fix or only a major-version fix.
    pub skipped: Vec<String>,
    pub branch: String,
    pub committed: bool,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub log: Vec<String>,
}

// ── Scheduling ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Some(Self::Hourly),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }
}

/// A recurring update job as persisted in the `scheduled_jobs` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub repo_path: String,
    pub repo_name: String,
    pub frequency: Frequency,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub create_pr: bool,
    pub run_tests: bool,
}

/// Fields accepted when creating or editing a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub repo_path: String,
    #[serde(default)]
    pub repo_name: Option<String>,
    pub frequency: Frequency,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub create_pr: bool,
    #[serde(default)]
    pub run_tests: bool,
}

fn default_true() -> bool {
    true
}

/// Append-only record of one job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub updated_packages: Vec<String>,
    pub error: Option<String>,
}

/// What an executor reports back for a fired job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub updated_packages: Vec<String>,
    pub error: Option<String>,
}

impl From<&PipelineResult> for JobOutcome {
    fn from(r: &PipelineResult) -> Self {
        Self {
            success: r.success,
            updated_packages: r.updated_packages.clone(),
            error: r.error.clone(),
        }
    }
}

/// A quiet-hour scan schedule, keyed by repository path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmartScanSchedule {
    pub repo_path: String,
    pub repo_name: String,
    pub quiet_hour: u32,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
}

/// Broadcast by both schedulers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobStarted { job_id: String, repo_path: String },
    JobFinished { job_id: String, success: bool, next_run: DateTime<Utc> },
    ScanStarted { repo_path: String },
    ScanFinished { repo_path: String, success: bool, next_run: DateTime<Utc> },
}
