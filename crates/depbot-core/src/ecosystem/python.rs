use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

use super::{existing, listing_output, partition_known, Ecosystem};
use crate::exec::{self, Limits};
use crate::types::{DependencyType, EcosystemKind, OutdatedPackage, UpdateOutcome, UpdateStrategy};

const DEV_REQUIREMENTS: [&str; 2] = ["requirements-dev.txt", "dev-requirements.txt"];
const OTHER_MANIFESTS: [&str; 5] = ["pyproject.toml", "Pipfile", "Pipfile.lock", "poetry.lock", "setup.cfg"];

/// `name[extras] <op> version` at the start of a requirements line.
static REQUIREMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9][A-Za-z0-9._-]*)(\[[^\]]*\])?\s*(==|>=|~=|<=|!=|>|<)?\s*([^\s;#,]*)").expect("invalid regex")
});

pub struct Pip {
    python: String,
    install: Limits,
}

impl Pip {
    pub fn new(install: Limits) -> Self {
        Self {
            python: "python3".into(),
            install,
        }
    }

    pub fn with_interpreter(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    async fn pip(&self, dir: &Path, args: &[&str]) -> exec::ExecResult {
        let mut full = vec!["-m", "pip"];
        full.extend_from_slice(args);
        exec::run(dir, &self.python, &full, self.install).await
    }
}

#[derive(Deserialize)]
struct PipOutdated {
    name: String,
    version: String,
    latest_version: String,
}

/// PEP 503 normalisation: case-insensitive, `-`, `_` and `.` equivalent.
pub fn normalize(name: &str) -> String {
    name.to_ascii_lowercase().replace(['_', '.'], "-")
}

/// `requirements*.txt` files at the top of `dir`, sorted.
fn requirement_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .filter(|n| n.ends_with(".txt") && (n.starts_with("requirements") || DEV_REQUIREMENTS.contains(&n.as_str())))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn declared_names(body: &str) -> HashSet<String> {
    body.lines()
        .filter(|l| !l.trim_start().starts_with(['#', '-']))
        .filter_map(|l| REQUIREMENT_REGEX.captures(l))
        .map(|c| normalize(&c[1]))
        .collect()
}

fn read_declared(dir: &Path, files: &[&str]) -> HashSet<String> {
    files
        .iter()
        .filter_map(|f| std::fs::read_to_string(dir.join(f)).ok())
        .flat_map(|body| declared_names(&body))
        .collect()
}

/// Parse `pip list --outdated --format=json`. When the project declares
/// requirements, packages outside them (transitive or unrelated installs)
/// are dropped.
pub fn parse_outdated(json: &str, declared: &HashSet<String>, dev: &HashSet<String>) -> Result<Vec<OutdatedPackage>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<PipOutdated> = serde_json::from_str(json).context("parsing pip list output")?;
    Ok(rows
        .into_iter()
        .filter(|r| declared.is_empty() || declared.contains(&normalize(&r.name)))
        .map(|r| {
            let dep_type = if dev.contains(&normalize(&r.name)) {
                DependencyType::Dev
            } else {
                DependencyType::Direct
            };
            OutdatedPackage::new(
                EcosystemKind::Python,
                r.name,
                r.version,
                r.latest_version.clone(),
                r.latest_version,
                dep_type,
            )
        })
        .collect())
}

/// Rewrite the version of `name` in a requirements body, keeping extras and
/// the comparison operator. Unpinned lines are left alone.
pub fn rewrite_requirement(body: &str, name: &str, version: &str) -> (String, bool) {
    let wanted = normalize(name);
    let mut changed = false;
    let lines: Vec<String> = body
        .lines()
        .map(|line| {
            let Some(c) = REQUIREMENT_REGEX.captures(line) else {
                return line.to_string();
            };
            if normalize(&c[1]) != wanted || line.trim_start().starts_with('#') {
                return line.to_string();
            }
            let (Some(op), Some(ver)) = (c.get(3), c.get(4)) else {
                return line.to_string();
            };
            if ver.as_str().is_empty() {
                return line.to_string();
            }
            changed = true;
            let extras = c.get(2).map(|m| m.as_str()).unwrap_or("");
            let rest = &line[ver.end()..];
            format!("{}{}{}{}{}", &c[1], extras, op.as_str(), version, rest)
        })
        .collect();
    let mut out = lines.join("\n");
    if body.ends_with('\n') {
        out.push('\n');
    }
    (out, changed)
}

fn has_pytest_config(dir: &Path) -> bool {
    if dir.join("pytest.ini").is_file() || dir.join("conftest.py").is_file() || dir.join("tests").is_dir() {
        return true;
    }
    let contains = |file: &str, needle: &str| {
        std::fs::read_to_string(dir.join(file))
            .map(|b| b.contains(needle))
            .unwrap_or(false)
    };
    contains("pyproject.toml", "[tool.pytest") || contains("setup.cfg", "[tool:pytest]") || contains("tox.ini", "[pytest]")
}

#[async_trait]
impl Ecosystem for Pip {
    fn kind(&self) -> EcosystemKind {
        EcosystemKind::Python
    }

    async fn list_outdated(&self, dir: &Path) -> Result<Vec<OutdatedPackage>> {
        let req_files = requirement_files(dir);
        let all: Vec<&str> = req_files.iter().map(String::as_str).collect();
        let declared = read_declared(dir, &all);
        let dev = read_declared(dir, &DEV_REQUIREMENTS);

        let result = self.pip(dir, &["list", "--outdated", "--format=json"]).await;
        let stdout = listing_output("pip list", &result)?;
        parse_outdated(stdout, &declared, &dev)
    }

    async fn update(&self, dir: &Path, names: &[String], strategy: UpdateStrategy) -> Result<UpdateOutcome> {
        let outdated = self.list_outdated(dir).await?;
        let (known, mut failed) = partition_known(&outdated, names);
        let mut updated = Vec::new();
        for pkg in known {
            let target = pkg.target_version(strategy).to_string();
            match self.install_version(dir, &pkg.name, &target).await {
                Ok(()) => updated.push(pkg.name.clone()),
                Err(e) => {
                    warn!(package = %pkg.name, "pip upgrade failed: {e:#}");
                    failed.push(pkg.name.clone());
                }
            }
        }
        Ok(UpdateOutcome { updated, failed })
    }

    async fn install_version(&self, dir: &Path, name: &str, version: &str) -> Result<()> {
        let spec = format!("{name}=={version}");
        let result = self.pip(dir, &["install", "--upgrade", &spec]).await;
        if !result.success() {
            return Err(anyhow!("pip install {spec} {}: {}", result.describe(), result.combined_output()));
        }
        for file in requirement_files(dir) {
            let path = dir.join(&file);
            let body = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let (rewritten, changed) = rewrite_requirement(&body, name, version);
            if changed {
                std::fs::write(&path, rewritten).with_context(|| format!("writing {}", path.display()))?;
                info!(package = name, version, file = %file, "requirement pin rewritten");
            }
        }
        Ok(())
    }

    /// pip has no in-range upgrade that also rewrites requirement pins.
    fn non_breaking_update_command(&self, _dir: &Path) -> Option<String> {
        None
    }

    fn clean_install_command(&self, dir: &Path) -> String {
        if dir.join("requirements.txt").is_file() {
            format!("{} -m pip install -r requirements.txt", self.python)
        } else {
            format!("{} -m pip install .", self.python)
        }
    }

    fn test_command(&self, dir: &Path) -> Option<String> {
        has_pytest_config(dir).then(|| format!("{} -m pytest", self.python))
    }

    fn lint_command(&self, dir: &Path) -> Option<String> {
        let ruff_in_pyproject = std::fs::read_to_string(dir.join("pyproject.toml"))
            .map(|b| b.contains("[tool.ruff"))
            .unwrap_or(false);
        if ruff_in_pyproject || dir.join("ruff.toml").is_file() || dir.join(".ruff.toml").is_file() {
            Some("ruff check .".into())
        } else if dir.join(".flake8").is_file() {
            Some("flake8".into())
        } else {
            None
        }
    }

    fn files_to_commit(&self, dir: &Path) -> Vec<String> {
        let mut files = requirement_files(dir);
        files.extend(existing(dir, &OTHER_MANIFESTS));
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateType;

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize("Django_Rest.Framework"), "django-rest-framework");
    }

    #[test]
    fn filters_to_declared_requirements() {
        let json = r#"[
            {"name": "requests", "version": "2.30.0", "latest_version": "2.31.0", "latest_filetype": "wheel"},
            {"name": "pytest", "version": "7.4.0", "latest_version": "8.0.0", "latest_filetype": "wheel"},
            {"name": "setuptools", "version": "68.0.0", "latest_version": "69.0.0", "latest_filetype": "wheel"}
        ]"#;
        let declared: HashSet<String> = ["requests", "pytest"].iter().map(|s| s.to_string()).collect();
        let dev: HashSet<String> = ["pytest"].iter().map(|s| s.to_string()).collect();

        let pkgs = parse_outdated(json, &declared, &dev).unwrap();
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs[0].name, "requests");
        assert_eq!(pkgs[0].update_type, UpdateType::Minor);
        assert_eq!(pkgs[1].dependency_type, DependencyType::Dev);
        assert_eq!(pkgs[1].update_type, UpdateType::Major);
    }

    #[test]
    fn declared_names_skip_comments_and_options() {
        let body = "# comment\n-r base.txt\nrequests[socks]>=2.0\nFlask==2.3.0 ; python_version > '3.8'\n\n";
        let names = declared_names(body);
        assert!(names.contains("requests"));
        assert!(names.contains("flask"));
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn rewrites_pins_keeping_operator_and_extras() {
        let body = "requests[socks]>=2.30.0  # http\nflask==2.3.0\nnumpy\n";
        let (out, changed) = rewrite_requirement(body, "requests", "2.31.0");
        assert!(changed);
        assert_eq!(out, "requests[socks]>=2.31.0  # http\nflask==2.3.0\nnumpy\n");

        let (out, changed) = rewrite_requirement(&out, "Flask", "2.3.3");
        assert!(changed);
        assert!(out.contains("flask==2.3.3\n"));

        let (_, changed) = rewrite_requirement(&out, "numpy", "2.0.0");
        assert!(!changed);
    }

    #[test]
    fn resolves_commands_from_project_layout() {
        let dir = tempfile::tempdir().unwrap();
        let pip = Pip::new(Limits::secs(300));
        std::fs::write(dir.path().join("requirements.txt"), "requests==2.30.0\n").unwrap();
        std::fs::write(dir.path().join("requirements-dev.txt"), "pytest==7.4.0\n").unwrap();
        assert_eq!(pip.test_command(dir.path()), None);
        assert_eq!(pip.lint_command(dir.path()), None);

        std::fs::create_dir(dir.path().join("tests")).unwrap();
        std::fs::write(dir.path().join(".flake8"), "[flake8]\n").unwrap();
        assert_eq!(pip.test_command(dir.path()).as_deref(), Some("python3 -m pytest"));
        assert_eq!(pip.lint_command(dir.path()).as_deref(), Some("flake8"));

        std::fs::write(dir.path().join("pyproject.toml"), "[tool.ruff]\nline-length = 100\n").unwrap();
        assert_eq!(pip.lint_command(dir.path()).as_deref(), Some("ruff check ."));
        assert_eq!(
            pip.files_to_commit(dir.path()),
            vec!["requirements-dev.txt", "requirements.txt", "pyproject.toml"]
        );
        assert!(pip.clean_install_command(dir.path()).ends_with("-r requirements.txt"));
        assert_eq!(pip.non_breaking_update_command(dir.path()), None);
    }
}
