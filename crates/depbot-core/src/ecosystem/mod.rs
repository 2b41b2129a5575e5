//! Per-ecosystem package manager adapters behind one capability trait.

pub mod elixir;
pub mod node;
pub mod python;
pub mod ruby;
pub mod version;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::classifier::{HeuristicClassifier, TestResultClassifier};
use crate::exec::{ExecResult, ExitKind, Limits};
use crate::types::{EcosystemKind, OutdatedPackage, UpdateOutcome, UpdateStrategy};

pub use elixir::Mix;
pub use node::Npm;
pub use python::Pip;
pub use ruby::Bundler;

/// What the pipeline needs from a package manager.
#[async_trait]
pub trait Ecosystem: Send + Sync {
    fn kind(&self) -> EcosystemKind;

    fn manifest_present(&self, dir: &Path) -> bool {
        self.kind().manifests().iter().any(|m| dir.join(m).is_file())
    }

    /// Outdated direct and dev dependencies of the project in `dir`.
    async fn list_outdated(&self, dir: &Path) -> Result<Vec<OutdatedPackage>>;

    /// Move `names` to the version picked by `strategy`. Names that are not
    /// outdated, or that the tool refused to update, land in `failed`.
    async fn update(&self, dir: &Path, names: &[String], strategy: UpdateStrategy) -> Result<UpdateOutcome>;

    /// Install exactly `version` of `name`.
    async fn install_version(&self, dir: &Path, name: &str, version: &str) -> Result<()>;

    /// Shell command that applies every in-range (non-breaking) update and
    /// records it in the files from [`Ecosystem::files_to_commit`]. `None`
    /// when the tool has no such command; each package is then installed
    /// at its latest version with [`Ecosystem::install_version`].
    fn non_breaking_update_command(&self, dir: &Path) -> Option<String>;

    fn clean_install_command(&self, dir: &Path) -> String;

    fn test_command(&self, dir: &Path) -> Option<String>;

    fn lint_command(&self, dir: &Path) -> Option<String>;

    /// Manifest and lockfile paths, relative to `dir`, that an update commit
    /// should contain.
    fn files_to_commit(&self, dir: &Path) -> Vec<String>;

    fn result_classifier(&self) -> Arc<dyn TestResultClassifier> {
        Arc::new(HeuristicClassifier)
    }
}

/// Well-known manifests and lockfiles, staged when an adapter lists none.
pub const FALLBACK_COMMIT_FILES: [&str; 13] = [
    "package.json",
    "package-lock.json",
    "npm-shrinkwrap.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "requirements.txt",
    "pyproject.toml",
    "Pipfile",
    "Pipfile.lock",
    "Gemfile",
    "Gemfile.lock",
    "mix.exs",
    "mix.lock",
];

#[derive(Clone, Default)]
pub struct EcosystemRegistry {
    adapters: BTreeMap<EcosystemKind, Arc<dyn Ecosystem>>,
}

impl EcosystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// npm, pip, bundler and mix with the given install limits.
    pub fn standard(install: Limits) -> Self {
        Self::new()
            .with(Arc::new(Npm::new(install)))
            .with(Arc::new(Pip::new(install)))
            .with(Arc::new(Bundler::new(install)))
            .with(Arc::new(Mix::new(install)))
    }

    pub fn with(mut self, adapter: Arc<dyn Ecosystem>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn Ecosystem>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: EcosystemKind) -> Option<Arc<dyn Ecosystem>> {
        self.adapters.get(&kind).cloned()
    }

    /// Adapters whose manifest is present in `dir`.
    pub fn detect(&self, dir: &Path) -> Vec<Arc<dyn Ecosystem>> {
        self.adapters
            .values()
            .filter(|a| a.manifest_present(dir))
            .cloned()
            .collect()
    }
}

/// Listing tools exit non-zero when updates exist; only spawn failures and
/// timeouts are errors.
pub(crate) fn listing_output<'a>(tool: &str, result: &'a ExecResult) -> Result<&'a str> {
    match result.kind {
        ExitKind::SpawnFailed | ExitKind::TimedOut => {
            Err(anyhow!("{tool} {}", result.describe()))
        }
        ExitKind::Failed(_) if result.stdout.trim().is_empty() && !result.stderr.trim().is_empty() => {
            Err(anyhow!("{tool} failed: {}", result.stderr.trim()))
        }
        _ => Ok(&result.stdout),
    }
}

/// Names from `snapshot` whose installed version moved between the two
/// listings, or that are no longer outdated.
pub fn moved_packages(snapshot: &[OutdatedPackage], after: &[OutdatedPackage]) -> Vec<String> {
    let after: HashMap<&str, &OutdatedPackage> = after.iter().map(|p| (p.name.as_str(), p)).collect();
    snapshot
        .iter()
        .filter(|p| match after.get(p.name.as_str()) {
            None => true,
            Some(now) => now.current != p.current,
        })
        .map(|p| p.name.clone())
        .collect()
}

/// Split `names` into those present in `outdated` and the rest.
pub(crate) fn partition_known<'a>(
    outdated: &'a [OutdatedPackage],
    names: &[String],
) -> (Vec<&'a OutdatedPackage>, Vec<String>) {
    let mut known = Vec::new();
    let mut unknown = Vec::new();
    for name in names {
        match outdated.iter().find(|p| p.name.eq_ignore_ascii_case(name)) {
            Some(p) => known.push(p),
            None => unknown.push(name.clone()),
        }
    }
    (known, unknown)
}

/// Split requested names by whether a second listing shows them moved.
pub(crate) fn outcome_from_relist(
    requested: &[&OutdatedPackage],
    after: &[OutdatedPackage],
    mut failed: Vec<String>,
) -> UpdateOutcome {
    let before: Vec<OutdatedPackage> = requested.iter().map(|p| (*p).clone()).collect();
    let moved = moved_packages(&before, after);
    for p in requested {
        if !moved.contains(&p.name) {
            failed.push(p.name.clone());
        }
    }
    UpdateOutcome { updated: moved, failed }
}

pub(crate) fn existing(dir: &Path, candidates: &[&str]) -> Vec<String> {
    candidates
        .iter()
        .filter(|f| dir.join(f).is_file())
        .map(|f| f.to_string())
        .collect()
}
