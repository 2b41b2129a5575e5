//! Scratch repositories, a fake npm-style adapter and a stub PR host.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use depbot_core::config::PipelineSettings;
use depbot_core::ecosystem::{Ecosystem, EcosystemRegistry};
use depbot_core::pipeline::Pipeline;
use depbot_core::pr_host::{PrHost, PrReadiness, PrRequest};
use depbot_core::{DependencyType, EcosystemKind, OutdatedPackage, UpdateOutcome, UpdateStrategy};

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git").args(args).current_dir(dir).output().unwrap();
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// `(name, installed, wanted, latest)` for the fake registry.
pub const PACKAGES: [(&str, &str, &str, &str); 3] = [
    ("left-pad", "1.0.0", "1.0.1", "1.0.1"),
    ("chalk", "2.1.0", "2.1.5", "2.1.5"),
    ("react", "17.0.2", "17.0.2", "18.2.0"),
];

pub fn manifest(versions: &BTreeMap<String, String>) -> String {
    let deps = serde_json::Map::from_iter(
        versions
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()))),
    );
    let doc = serde_json::json!({ "name": "shop", "version": "1.0.0", "dependencies": deps });
    serde_json::to_string_pretty(&doc).unwrap()
}

fn initial_versions() -> BTreeMap<String, String> {
    PACKAGES
        .iter()
        .map(|(n, cur, _, _)| (n.to_string(), cur.to_string()))
        .collect()
}

/// A repository on `main` whose `package.json` pins every fake package at
/// its outdated version.
pub fn init_repo(dir: &Path) {
    let package_json = manifest(&initial_versions());
    init_repo_with(dir, &[("package.json", &package_json), ("README.md", "# shop\n")]);
}

fn read_versions(dir: &Path) -> Result<BTreeMap<String, String>> {
    let raw = std::fs::read_to_string(dir.join("package.json"))?;
    let doc: serde_json::Value = serde_json::from_str(&raw)?;
    let deps = doc
        .get("dependencies")
        .and_then(|d| d.as_object())
        .ok_or_else(|| anyhow!("no dependencies"))?;
    Ok(deps
        .iter()
        .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
        .collect())
}

fn write_versions(dir: &Path, versions: &BTreeMap<String, String>) -> Result<()> {
    std::fs::write(dir.join("package.json"), manifest(versions))?;
    Ok(())
}

/// Node-flavoured adapter whose registry is [`PACKAGES`] and whose only
/// state is `package.json`.
pub struct FakeNpm {
    pub test_command: Option<String>,
}

impl FakeNpm {
    pub fn passing() -> Self {
        Self {
            test_command: Some("echo '12 passing'".into()),
        }
    }

    pub fn failing() -> Self {
        Self {
            test_command: Some("echo '11 passing'; echo '1 failing'; exit 1".into()),
        }
    }

    pub fn with_tests(cmd: &str) -> Self {
        Self {
            test_command: Some(cmd.into()),
        }
    }
}

#[async_trait]
impl Ecosystem for FakeNpm {
    fn kind(&self) -> EcosystemKind {
        EcosystemKind::Node
    }

    async fn list_outdated(&self, dir: &Path) -> Result<Vec<OutdatedPackage>> {
        let installed = read_versions(dir)?;
        Ok(PACKAGES
            .iter()
            .filter_map(|(name, _, wanted, latest)| {
                let current = installed.get(*name)?;
                if current == latest {
                    return None;
                }
                Some(OutdatedPackage::new(
                    EcosystemKind::Node,
                    *name,
                    current.clone(),
                    *wanted,
                    *latest,
                    DependencyType::Direct,
                ))
            })
            .collect())
    }

    async fn update(&self, dir: &Path, names: &[String], strategy: UpdateStrategy) -> Result<UpdateOutcome> {
        let outdated = self.list_outdated(dir).await?;
        let mut versions = read_versions(dir)?;
        let mut outcome = UpdateOutcome::default();
        for name in names {
            match outdated.iter().find(|p| &p.name == name) {
                Some(p) => {
                    versions.insert(name.clone(), p.target_version(strategy).to_string());
                    outcome.updated.push(name.clone());
                }
                None => outcome.failed.push(name.clone()),
            }
        }
        write_versions(dir, &versions)?;
        Ok(outcome)
    }

    async fn install_version(&self, dir: &Path, name: &str, version: &str) -> Result<()> {
        let mut versions = read_versions(dir)?;
        versions.insert(name.to_string(), version.to_string());
        write_versions(dir, &versions)
    }

    /// Rewrites `package.json` with every package at its wanted version.
    fn non_breaking_update_command(&self, dir: &Path) -> Option<String> {
        let mut versions = read_versions(dir).unwrap_or_default();
        for (name, _, wanted, _) in PACKAGES {
            if let Some(v) = versions.get_mut(name) {
                *v = wanted.to_string();
            }
        }
        Some(format!("printf '%s\\n' '{}' > package.json", manifest(&versions)))
    }

    fn clean_install_command(&self, _dir: &Path) -> String {
        "true".into()
    }

    fn test_command(&self, _dir: &Path) -> Option<String> {
        self.test_command.clone()
    }

    fn lint_command(&self, _dir: &Path) -> Option<String> {
        Some("echo 'lint: 1 warning' >&2; exit 1".into())
    }

    fn files_to_commit(&self, _dir: &Path) -> Vec<String> {
        vec!["package.json".into(), "package-lock.json".into()]
    }
}

/// PR host that never touches the network.
pub struct StubPrHost {
    pub readiness: PrReadiness,
    pub prs: Mutex<Vec<PrRequest>>,
    pub issues: Mutex<Vec<String>>,
}

impl StubPrHost {
    pub fn new(readiness: PrReadiness) -> Arc<Self> {
        Arc::new(Self {
            readiness,
            prs: Mutex::new(Vec::new()),
            issues: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PrHost for StubPrHost {
    async fn readiness(&self, _repo: &Path) -> PrReadiness {
        self.readiness
    }

    async fn create_pr(&self, _dir: &Path, req: &PrRequest) -> Result<String> {
        let mut prs = self.prs.lock().unwrap();
        prs.push(req.clone());
        Ok(format!("https://example.test/shop/pull/{}", prs.len()))
    }

    async fn create_issue(&self, _dir: &Path, title: &str, _body: &str) -> Result<String> {
        let mut issues = self.issues.lock().unwrap();
        issues.push(title.to_string());
        Ok(format!("https://example.test/shop/issues/{}", issues.len()))
    }
}

pub fn pipeline(adapter: FakeNpm, host: Arc<StubPrHost>, worktrees: &Path) -> Pipeline {
    pipeline_with(EcosystemRegistry::new().with(Arc::new(adapter)), host, worktrees)
}

pub fn pipeline_with(registry: EcosystemRegistry, host: Arc<StubPrHost>, worktrees: &Path) -> Pipeline {
    let settings = PipelineSettings {
        worktree_root: worktrees.to_path_buf(),
        git_author: None,
        ..PipelineSettings::default()
    };
    let (p, _rx) = Pipeline::new(registry, host, settings);
    p
}

/// A repository on `main` holding exactly `files`.
pub fn init_repo_with(dir: &Path, files: &[(&str, &str)]) {
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

pub fn worktree_count(root: &Path) -> usize {
    std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
}
