use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use regex::Regex;

use super::{existing, listing_output, outcome_from_relist, partition_known, Ecosystem};
use crate::exec::{self, Limits};
use crate::types::{DependencyType, EcosystemKind, OutdatedPackage, UpdateOutcome, UpdateStrategy};

/// `name (newest X, installed Y[, requested Z])` from `bundle outdated --parseable`.
static PARSEABLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.-]+) \(newest ([^,\s]+), installed ([^,\s)]+)(?:, requested ([^)]+))?\)").expect("invalid regex")
});

static GEM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*gem\s+['"]([^'"]+)['"](.*)$"#).expect("invalid regex"));

static GROUP_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*group\s+(.+?)\s+do\b").expect("invalid regex"));

const DEV_GROUPS: [&str; 2] = [":development", ":test"];

pub struct Bundler {
    install: Limits,
}

impl Bundler {
    pub fn new(install: Limits) -> Self {
        Self { install }
    }

    async fn bundle(&self, dir: &Path, args: &[&str]) -> exec::ExecResult {
        exec::run(dir, "bundle", args, self.install).await
    }
}

/// Gems declared only for development or test, from `group ... do` blocks
/// and inline `group:`/`groups:` options.
pub fn dev_gems(gemfile: &str) -> HashSet<String> {
    let mut dev = HashSet::new();
    let mut stack: Vec<bool> = Vec::new();
    for line in gemfile.lines() {
        let trimmed = line.trim();
        if let Some(c) = GROUP_REGEX.captures(line) {
            let groups = &c[1];
            stack.push(DEV_GROUPS.iter().any(|g| groups.contains(g)));
            continue;
        }
        if trimmed == "end" {
            stack.pop();
            continue;
        }
        // Nested blocks inherit the enclosing group.
        let opens_block = trimmed.starts_with("if ")
            || trimmed.starts_with("unless ")
            || trimmed.ends_with(" do")
            || trimmed.contains(" do |");
        if opens_block {
            stack.push(stack.last().copied().unwrap_or(false));
            continue;
        }
        let Some(c) = GEM_REGEX.captures(line) else {
            continue;
        };
        let inline_dev = {
            let opts = &c[2];
            (opts.contains("group:") || opts.contains("groups:")) && DEV_GROUPS.iter().any(|g| opts.contains(g))
        };
        if inline_dev || stack.last().copied().unwrap_or(false) {
            dev.insert(c[1].to_string());
        }
    }
    dev
}

pub fn parse_outdated(output: &str, dev: &HashSet<String>) -> Vec<OutdatedPackage> {
    output
        .lines()
        .filter_map(|l| PARSEABLE_REGEX.captures(l.trim()))
        .map(|c| {
            let name = c[1].to_string();
            let dep_type = if dev.contains(&name) {
                DependencyType::Dev
            } else {
                DependencyType::Direct
            };
            OutdatedPackage::new(EcosystemKind::Ruby, name, &c[3], &c[2], &c[2], dep_type)
        })
        .collect()
}

#[async_trait]
impl Ecosystem for Bundler {
    fn kind(&self) -> EcosystemKind {
        EcosystemKind::Ruby
    }

    async fn list_outdated(&self, dir: &Path) -> Result<Vec<OutdatedPackage>> {
        let gemfile = std::fs::read_to_string(dir.join("Gemfile")).unwrap_or_default();
        let result = self.bundle(dir, &["outdated", "--parseable"]).await;
        let stdout = listing_output("bundle outdated", &result)?;
        Ok(parse_outdated(stdout, &dev_gems(&gemfile)))
    }

    /// Bundler resolves within the Gemfile requirements, so both strategies
    /// behave the same; the relisting decides what actually moved.
    async fn update(&self, dir: &Path, names: &[String], _strategy: UpdateStrategy) -> Result<UpdateOutcome> {
        let outdated = self.list_outdated(dir).await?;
        let (known, failed) = partition_known(&outdated, names);
        if known.is_empty() {
            return Ok(UpdateOutcome { updated: Vec::new(), failed });
        }

        let mut args = vec!["update", "--conservative"];
        args.extend(known.iter().map(|p| p.name.as_str()));
        let result = self.bundle(dir, &args).await;
        if !result.success() {
            return Err(anyhow!("bundle update {}: {}", result.describe(), result.combined_output()));
        }
        let after = self.list_outdated(dir).await?;
        Ok(outcome_from_relist(&known, &after, failed))
    }

    async fn install_version(&self, dir: &Path, name: &str, _version: &str) -> Result<()> {
        let result = self.bundle(dir, &["update", "--conservative", name]).await;
        if !result.success() {
            return Err(anyhow!("bundle update {name} {}: {}", result.describe(), result.combined_output()));
        }
        Ok(())
    }

    fn non_breaking_update_command(&self, _dir: &Path) -> Option<String> {
        Some("bundle update --minor --strict".into())
    }

    fn clean_install_command(&self, _dir: &Path) -> String {
        "bundle install".into()
    }

    fn test_command(&self, dir: &Path) -> Option<String> {
        if dir.join("spec").is_dir() {
            Some("bundle exec rspec".into())
        } else if dir.join("test").is_dir() {
            Some("bundle exec rake test".into())
        } else {
            None
        }
    }

    fn lint_command(&self, dir: &Path) -> Option<String> {
        dir.join(".rubocop.yml")
            .is_file()
            .then(|| "bundle exec rubocop".into())
    }

    fn files_to_commit(&self, dir: &Path) -> Vec<String> {
        existing(dir, &["Gemfile", "Gemfile.lock"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateType;

    const GEMFILE: &str = r#"
source "https://rubygems.org"

gem "rails", "~> 7.0.4"
gem 'rubocop', require: false, group: :development

group :development, :test do
  gem "rspec-rails"
  if ENV["CI"]
    gem "simplecov"
  end
end

group :production do
  gem "pg"
end
"#;

    #[test]
    fn finds_dev_gems() {
        let dev = dev_gems(GEMFILE);
        assert!(dev.contains("rspec-rails"));
        assert!(dev.contains("rubocop"));
        assert!(!dev.contains("rails"));
        assert!(!dev.contains("pg"));
    }

    #[test]
    fn parses_parseable_output() {
        let out = "rails (newest 7.1.2, installed 7.0.4, requested ~> 7.0.4)\n\
                   rspec-rails (newest 6.1.0, installed 6.0.3) in groups \"development, test\"\n\
                   Fetching gem metadata...\n";
        let dev = dev_gems(GEMFILE);
        let pkgs = parse_outdated(out, &dev);
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs[0].name, "rails");
        assert_eq!(pkgs[0].current, "7.0.4");
        assert_eq!(pkgs[0].latest, "7.1.2");
        assert_eq!(pkgs[0].update_type, UpdateType::Minor);
        assert_eq!(pkgs[1].dependency_type, DependencyType::Dev);
    }

    #[test]
    fn resolves_commands() {
        let dir = tempfile::tempdir().unwrap();
        let b = Bundler::new(Limits::secs(300));
        std::fs::write(dir.path().join("Gemfile"), GEMFILE).unwrap();
        assert_eq!(b.test_command(dir.path()), None);

        std::fs::create_dir(dir.path().join("test")).unwrap();
        assert_eq!(b.test_command(dir.path()).as_deref(), Some("bundle exec rake test"));
        std::fs::create_dir(dir.path().join("spec")).unwrap();
        assert_eq!(b.test_command(dir.path()).as_deref(), Some("bundle exec rspec"));

        assert_eq!(b.lint_command(dir.path()), None);
        std::fs::write(dir.path().join(".rubocop.yml"), "").unwrap();
        assert_eq!(b.lint_command(dir.path()).as_deref(), Some("bundle exec rubocop"));
        assert_eq!(b.files_to_commit(dir.path()), vec!["Gemfile"]);
    }
}
