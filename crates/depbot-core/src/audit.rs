//! Vulnerability audit collaborators consumed by the security patch run.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::ecosystem::version::parse_triple;
use crate::exec::{self, ExitKind, Limits};
use crate::types::{EcosystemKind, Severity, Vulnerability};

#[async_trait]
pub trait AuditSource: Send + Sync {
    fn ecosystem(&self) -> EcosystemKind;

    async fn audit(&self, dir: &Path) -> Result<Vec<Vulnerability>>;
}

/// `npm audit --json` (npm 7+ report format).
pub struct NpmAudit {
    limits: Limits,
}

impl NpmAudit {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

/// One vulnerability per affected package, keeping the highest severity.
/// `fixAvailable` is either `true`, `false` or `{name, version, isSemVerMajor}`.
pub fn parse_npm_audit(json: &str, installed: impl Fn(&str) -> Option<String>) -> Result<Vec<Vulnerability>> {
    let root: Value = serde_json::from_str(json).context("parsing npm audit output")?;
    let Some(vulns) = root.get("vulnerabilities").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for (name, v) in vulns {
        let severity = Severity::parse(v.get("severity").and_then(Value::as_str).unwrap_or("moderate"));
        let title = v
            .get("via")
            .and_then(Value::as_array)
            .and_then(|via| via.iter().find_map(|x| x.get("title")?.as_str()))
            .unwrap_or("")
            .to_string();

        let (fix_version, fix_is_major) = match v.get("fixAvailable") {
            Some(Value::Object(fix)) => {
                let version = fix.get("version").and_then(Value::as_str).map(str::to_string);
                let fix_target = fix.get("name").and_then(Value::as_str).unwrap_or(name);
                let major = fix.get("isSemVerMajor").and_then(Value::as_bool).unwrap_or(false);
                // A fix through a different top-level package doesn't pin this one.
                if fix_target == name {
                    (version, major)
                } else {
                    (None, major)
                }
            }
            _ => (None, false),
        };
        let fix_is_major = fix_is_major
            || match (&fix_version, installed(name)) {
                (Some(fix), Some(cur)) => matches!(
                    (parse_triple(fix), parse_triple(&cur)),
                    (Some(f), Some(c)) if f.0 > c.0
                ),
                _ => false,
            };

        out.push(Vulnerability {
            package: name.clone(),
            ecosystem: EcosystemKind::Node,
            severity,
            fix_version,
            fix_is_major,
            title,
        });
    }
    out.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.package.cmp(&b.package)));
    Ok(out)
}

fn installed_version(dir: &Path, name: &str) -> Option<String> {
    let path = dir.join("node_modules").join(name).join("package.json");
    let raw = std::fs::read_to_string(path).ok()?;
    let v: Value = serde_json::from_str(&raw).ok()?;
    v.get("version")?.as_str().map(str::to_string)
}

#[async_trait]
impl AuditSource for NpmAudit {
    fn ecosystem(&self) -> EcosystemKind {
        EcosystemKind::Node
    }

    async fn audit(&self, dir: &Path) -> Result<Vec<Vulnerability>> {
        let result = exec::run(dir, "npm", &["audit", "--json"], self.limits).await;
        // npm audit exits 1 when vulnerabilities are found.
        if matches!(result.kind, ExitKind::SpawnFailed | ExitKind::TimedOut) || result.stdout.trim().is_empty() {
            return Err(anyhow!("npm audit {}: {}", result.describe(), result.stderr.trim()));
        }
        parse_npm_audit(&result.stdout, |name| installed_version(dir, name))
    }
}
