use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::version::range_prefix;
use super::{existing, listing_output, partition_known, Ecosystem};
use crate::exec::{self, Limits};
use crate::types::{DependencyType, EcosystemKind, OutdatedPackage, UpdateOutcome, UpdateStrategy};

const DEP_SECTIONS: [&str; 3] = ["dependencies", "devDependencies", "optionalDependencies"];
const LOCKFILES: [&str; 4] = ["package-lock.json", "npm-shrinkwrap.json", "yarn.lock", "pnpm-lock.yaml"];
/// What `npm init` writes as the test script.
const NPM_PLACEHOLDER_TEST: &str = "no test specified";

pub struct Npm {
    npm: String,
    install: Limits,
}

impl Npm {
    pub fn new(install: Limits) -> Self {
        Self {
            npm: "npm".into(),
            install,
        }
    }

    pub fn with_bin(mut self, npm: impl Into<String>) -> Self {
        self.npm = npm.into();
        self
    }
}

fn read_manifest(dir: &Path) -> Result<Value> {
    let path = dir.join("package.json");
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn write_manifest(dir: &Path, manifest: &Value) -> Result<()> {
    let path = dir.join("package.json");
    let mut body = serde_json::to_string_pretty(manifest)?;
    body.push('\n');
    std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))
}

fn script<'a>(manifest: &'a Value, name: &str) -> Option<&'a str> {
    manifest.get("scripts")?.get(name)?.as_str()
}

fn dependency_type(manifest: &Value, name: &str) -> DependencyType {
    let is_dev = manifest
        .get("devDependencies")
        .and_then(|d| d.get(name))
        .is_some();
    if is_dev {
        DependencyType::Dev
    } else {
        DependencyType::Direct
    }
}

/// Parse `npm outdated --json`. Entries without an installed version fall
/// back to the range declared in the manifest.
pub fn parse_outdated(json: &str, manifest: &Value) -> Result<Vec<OutdatedPackage>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let root: Value = serde_json::from_str(json).context("parsing npm outdated output")?;
    let Some(entries) = root.as_object() else {
        return Err(anyhow!("npm outdated output is not an object"));
    };

    let mut out = Vec::new();
    for (name, info) in entries {
        // Workspaces report one entry per dependent.
        let info = match info {
            Value::Array(items) => match items.first() {
                Some(first) => first,
                None => continue,
            },
            other => other,
        };
        let field = |k: &str| info.get(k).and_then(Value::as_str).map(str::to_string);
        let declared = DEP_SECTIONS
            .iter()
            .find_map(|s| manifest.get(s)?.get(name)?.as_str())
            .map(|s| s.trim_start_matches(|c: char| !c.is_ascii_digit()).to_string());
        let Some(current) = field("current").or(declared) else {
            continue;
        };
        let latest = field("latest").unwrap_or_default();
        let wanted = field("wanted").unwrap_or_else(|| latest.clone());
        out.push(OutdatedPackage::new(
            EcosystemKind::Node,
            name.clone(),
            current,
            wanted,
            latest,
            dependency_type(manifest, name),
        ));
    }
    Ok(out)
}

/// Point `name` at `version` in whichever dependency section declares it,
/// keeping the original range operator. Returns false if it isn't declared.
pub fn rewrite_dependency(manifest: &mut Value, name: &str, version: &str) -> bool {
    for section in DEP_SECTIONS {
        let Some(entry) = manifest.get_mut(section).and_then(|s| s.get_mut(name)) else {
            continue;
        };
        let Some(spec) = entry.as_str() else {
            continue;
        };
        let prefix = range_prefix(spec).to_string();
        *entry = Value::String(format!("{prefix}{version}"));
        return true;
    }
    false
}

#[async_trait]
impl Ecosystem for Npm {
    fn kind(&self) -> EcosystemKind {
        EcosystemKind::Node
    }

    async fn list_outdated(&self, dir: &Path) -> Result<Vec<OutdatedPackage>> {
        let manifest = read_manifest(dir)?;
        let result = exec::run(dir, &self.npm, &["outdated", "--json"], self.install).await;
        let stdout = listing_output("npm outdated", &result)?;
        parse_outdated(stdout, &manifest)
    }

    async fn update(&self, dir: &Path, names: &[String], strategy: UpdateStrategy) -> Result<UpdateOutcome> {
        let outdated = self.list_outdated(dir).await?;
        let (known, mut failed) = partition_known(&outdated, names);
        let mut manifest = read_manifest(dir)?;
        let mut updated = Vec::new();

        for pkg in known {
            let target = pkg.target_version(strategy);
            if target.is_empty() || target == pkg.current {
                failed.push(pkg.name.clone());
                continue;
            }
            if rewrite_dependency(&mut manifest, &pkg.name, target) {
                info!(package = %pkg.name, from = %pkg.current, to = target, "package.json rewritten");
                updated.push(pkg.name.clone());
            } else {
                warn!(package = %pkg.name, "not declared in package.json");
                failed.push(pkg.name.clone());
            }
        }
        if !updated.is_empty() {
            write_manifest(dir, &manifest)?;
        }
        Ok(UpdateOutcome { updated, failed })
    }

    async fn install_version(&self, dir: &Path, name: &str, version: &str) -> Result<()> {
        let spec = format!("{name}@{version}");
        let result = exec::run(dir, &self.npm, &["install", &spec], self.install).await;
        if !result.success() {
            return Err(anyhow!("npm install {spec} {}: {}", result.describe(), result.combined_output()));
        }
        Ok(())
    }

    /// `--save` so the new ranges land in `package.json`, not only the lockfile.
    fn non_breaking_update_command(&self, _dir: &Path) -> Option<String> {
        Some(format!("{} update --save", self.npm))
    }

    fn clean_install_command(&self, _dir: &Path) -> String {
        format!("rm -rf node_modules && {} install", self.npm)
    }

    fn test_command(&self, dir: &Path) -> Option<String> {
        let manifest = read_manifest(dir).ok()?;
        let test = script(&manifest, "test")?;
        if test.trim().is_empty() || test.contains(NPM_PLACEHOLDER_TEST) {
            return None;
        }
        Some(format!("{} test", self.npm))
    }

    fn lint_command(&self, dir: &Path) -> Option<String> {
        let manifest = read_manifest(dir).ok()?;
        script(&manifest, "lint").map(|_| format!("{} run lint", self.npm))
    }

    fn files_to_commit(&self, dir: &Path) -> Vec<String> {
        let mut files = vec!["package.json".to_string()];
        files.extend(existing(dir, &LOCKFILES));
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateType;

    fn manifest() -> Value {
        serde_json::json!({
            "name": "app",
            "scripts": { "test": "mocha", "lint": "eslint ." },
            "dependencies": { "lodash": "^4.17.20", "express": "~4.18.0", "left-pad": "1.0.0" },
            "devDependencies": { "mocha": ">=9.0.0" }
        })
    }

    #[test]
    fn parses_outdated_json() {
        let json = r#"{
            "lodash": {"current": "4.17.20", "wanted": "4.17.21", "latest": "4.17.21", "dependent": "app"},
            "mocha": {"current": "9.2.0", "wanted": "9.2.2", "latest": "10.2.0", "dependent": "app"},
            "express": [{"current": "4.18.0", "wanted": "4.18.2", "latest": "4.19.2"}]
        }"#;
        let pkgs = parse_outdated(json, &manifest()).unwrap();
        assert_eq!(pkgs.len(), 3);

        let lodash = pkgs.iter().find(|p| p.name == "lodash").unwrap();
        assert_eq!(lodash.update_type, UpdateType::Patch);
        assert_eq!(lodash.dependency_type, DependencyType::Direct);

        let mocha = pkgs.iter().find(|p| p.name == "mocha").unwrap();
        assert_eq!(mocha.update_type, UpdateType::Major);
        assert_eq!(mocha.dependency_type, DependencyType::Dev);
        assert_eq!(mocha.wanted, "9.2.2");

        let express = pkgs.iter().find(|p| p.name == "express").unwrap();
        assert_eq!(express.update_type, UpdateType::Minor);
    }

    #[test]
    fn missing_current_uses_declared_range() {
        let json = r#"{"left-pad": {"wanted": "1.3.0", "latest": "1.3.0"}}"#;
        let pkgs = parse_outdated(json, &manifest()).unwrap();
        assert_eq!(pkgs[0].current, "1.0.0");
        assert_eq!(pkgs[0].update_type, UpdateType::Minor);
    }

    #[test]
    fn empty_output_means_up_to_date() {
        assert!(parse_outdated("", &manifest()).unwrap().is_empty());
        assert!(parse_outdated("{}", &manifest()).unwrap().is_empty());
    }

    #[test]
    fn rewrite_preserves_range_prefix() {
        let mut m = manifest();
        assert!(rewrite_dependency(&mut m, "lodash", "4.17.21"));
        assert!(rewrite_dependency(&mut m, "express", "4.19.2"));
        assert!(rewrite_dependency(&mut m, "left-pad", "1.3.0"));
        assert!(rewrite_dependency(&mut m, "mocha", "10.2.0"));
        assert!(!rewrite_dependency(&mut m, "react", "18.0.0"));

        assert_eq!(m["dependencies"]["lodash"], "^4.17.21");
        assert_eq!(m["dependencies"]["express"], "~4.19.2");
        assert_eq!(m["dependencies"]["left-pad"], "1.3.0");
        assert_eq!(m["devDependencies"]["mocha"], ">=10.2.0");
    }

    #[test]
    fn rewrite_keeps_key_order() {
        let raw = r#"{"name":"x","version":"1.0.0","dependencies":{"zeta":"^1.0.0","alpha":"^1.0.0"}}"#;
        let mut m: Value = serde_json::from_str(raw).unwrap();
        rewrite_dependency(&mut m, "zeta", "1.1.0");
        let keys: Vec<&String> = m["dependencies"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }

    #[test]
    fn resolves_scripts_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let npm = Npm::new(Limits::secs(300));
        std::fs::write(dir.path().join("package.json"), manifest().to_string()).unwrap();
        std::fs::write(dir.path().join("package-lock.json"), "{}").unwrap();

        assert_eq!(npm.test_command(dir.path()).as_deref(), Some("npm test"));
        assert_eq!(npm.lint_command(dir.path()).as_deref(), Some("npm run lint"));
        assert_eq!(npm.files_to_commit(dir.path()), vec!["package.json", "package-lock.json"]);

        let pinned = Npm::new(Limits::secs(300)).with_bin("/opt/node/bin/npm");
        assert_eq!(
            pinned.non_breaking_update_command(dir.path()).as_deref(),
            Some("/opt/node/bin/npm update --save")
        );
        assert_eq!(
            pinned.clean_install_command(dir.path()),
            "rm -rf node_modules && /opt/node/bin/npm install"
        );

        let placeholder = serde_json::json!({
            "scripts": { "test": "echo \"Error: no test specified\" && exit 1" }
        });
        std::fs::write(dir.path().join("package.json"), placeholder.to_string()).unwrap();
        assert_eq!(npm.test_command(dir.path()), None);
        assert_eq!(npm.lint_command(dir.path()), None);
    }
}
