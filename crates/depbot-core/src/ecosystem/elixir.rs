use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tracing::info;

use super::version::{parse_triple, range_prefix};
use super::{existing, listing_output, outcome_from_relist, partition_known, Ecosystem};
use crate::exec::{self, Limits};
use crate::types::{DependencyType, EcosystemKind, OutdatedPackage, UpdateOutcome, UpdateStrategy};

static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("invalid regex"));

/// `{:name, "requirement"...}` dependency tuples in `mix.exs`.
static DEP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\{:([a-z0-9_]+),\s*"([^"]*)"([^}]*)\}"#).expect("invalid regex"));

pub struct Mix {
    install: Limits,
}

impl Mix {
    pub fn new(install: Limits) -> Self {
        Self { install }
    }

    async fn mix(&self, dir: &Path, args: &[&str]) -> exec::ExecResult {
        exec::run(dir, "mix", args, self.install).await
    }

    fn rewrite_manifest(&self, dir: &Path, name: &str, version: &str) -> Result<bool> {
        let path = dir.join("mix.exs");
        let body = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let (rewritten, changed) = rewrite_requirement(&body, name, version);
        if changed {
            std::fs::write(&path, rewritten).with_context(|| format!("writing {}", path.display()))?;
            info!(package = name, version, "mix.exs requirement rewritten");
        }
        Ok(changed)
    }
}

/// Deps restricted to `only: :dev`/`:test` environments.
pub fn dev_deps(mix_exs: &str) -> HashSet<String> {
    DEP_REGEX
        .captures_iter(mix_exs)
        .filter(|c| {
            let opts = &c[3];
            opts.contains("only:") && !opts.contains(":prod")
        })
        .map(|c| c[1].to_string())
        .collect()
}

/// Parse the `mix hex.outdated` table. Up-to-date rows are skipped; `wanted`
/// is the latest version when the status says the requirement allows it.
pub fn parse_outdated(output: &str, dev: &HashSet<String>) -> Vec<OutdatedPackage> {
    let clean = ANSI_REGEX.replace_all(output, "");
    let mut in_table = false;
    let mut out = Vec::new();
    for line in clean.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.first() == Some(&"Dependency") {
            in_table = true;
            continue;
        }
        if !in_table || cols.len() < 3 || parse_triple(cols[1]).is_none() {
            continue;
        }
        let (name, current, latest) = (cols[0], cols[1], cols[2]);
        let status = cols[3..].join(" ");
        if current == latest || status.starts_with("Up-to-date") {
            continue;
        }
        let wanted = if status == "Update possible" { latest } else { current };
        let dep_type = if dev.contains(name) {
            DependencyType::Dev
        } else {
            DependencyType::Direct
        };
        out.push(OutdatedPackage::new(EcosystemKind::Elixir, name, current, wanted, latest, dep_type));
    }
    out
}

/// Point the requirement of `name` at `version`, keeping its operator and
/// precision (`~> 1.6` stays two components).
pub fn rewrite_requirement(mix_exs: &str, name: &str, version: &str) -> (String, bool) {
    let mut changed = false;
    let out = DEP_REGEX.replace_all(mix_exs, |c: &regex::Captures<'_>| {
        if &c[1] != name {
            return c[0].to_string();
        }
        let req = &c[2];
        let prefix = range_prefix(req);
        let old = req.trim_start_matches(|ch: char| !ch.is_ascii_digit());
        let components = old.split('.').count().max(1);
        let new: Vec<&str> = version.split('.').take(components).collect();
        let spaced = if prefix.is_empty() { String::new() } else { format!("{prefix} ") };
        changed = true;
        format!("{{:{}, \"{}{}\"{}}}", &c[1], spaced, new.join("."), &c[3])
    });
    (out.into_owned(), changed)
}

#[async_trait]
impl Ecosystem for Mix {
    fn kind(&self) -> EcosystemKind {
        EcosystemKind::Elixir
    }

    async fn list_outdated(&self, dir: &Path) -> Result<Vec<OutdatedPackage>> {
        let mix_exs = std::fs::read_to_string(dir.join("mix.exs")).unwrap_or_default();
        let result = self.mix(dir, &["hex.outdated"]).await;
        let stdout = listing_output("mix hex.outdated", &result)?;
        Ok(parse_outdated(stdout, &dev_deps(&mix_exs)))
    }

    async fn update(&self, dir: &Path, names: &[String], strategy: UpdateStrategy) -> Result<UpdateOutcome> {
        let outdated = self.list_outdated(dir).await?;
        let (known, failed) = partition_known(&outdated, names);
        if known.is_empty() {
            return Ok(UpdateOutcome { updated: Vec::new(), failed });
        }

        if strategy == UpdateStrategy::Latest {
            for pkg in &known {
                self.rewrite_manifest(dir, &pkg.name, &pkg.latest)?;
            }
        }
        let mut args = vec!["deps.update"];
        args.extend(known.iter().map(|p| p.name.as_str()));
        let result = self.mix(dir, &args).await;
        if !result.success() {
            return Err(anyhow!("mix deps.update {}: {}", result.describe(), result.combined_output()));
        }
        let after = self.list_outdated(dir).await?;
        Ok(outcome_from_relist(&known, &after, failed))
    }

    async fn install_version(&self, dir: &Path, name: &str, version: &str) -> Result<()> {
        self.rewrite_manifest(dir, name, version)?;
        let result = self.mix(dir, &["deps.update", name]).await;
        if !result.success() {
            return Err(anyhow!("mix deps.update {name} {}: {}", result.describe(), result.combined_output()));
        }
        Ok(())
    }

    fn non_breaking_update_command(&self, _dir: &Path) -> Option<String> {
        Some("mix deps.update --all".into())
    }

    fn clean_install_command(&self, _dir: &Path) -> String {
        "rm -rf deps _build && mix deps.get".into()
    }

    fn test_command(&self, dir: &Path) -> Option<String> {
        dir.join("test").is_dir().then(|| "mix test".into())
    }

    fn lint_command(&self, dir: &Path) -> Option<String> {
        if dir.join(".credo.exs").is_file() {
            Some("mix credo --strict".into())
        } else {
            Some("mix format --check-formatted".into())
        }
    }

    fn files_to_commit(&self, dir: &Path) -> Vec<String> {
        existing(dir, &["mix.exs", "mix.lock"])
    }
}
