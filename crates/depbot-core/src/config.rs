use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::db::Db;
use crate::exec::Limits;

/// Full application configuration.
/// Every field is seeded to and loaded from the DB `config` table, so the
/// settings API can change them at runtime.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Web API
    pub web_bind: String,
    pub web_port: u16,

    // External process limits
    pub install_timeout_s: u64,
    pub test_timeout_s: u64,
    pub lint_timeout_s: u64,
    pub probe_timeout_s: u64,
    pub push_timeout_s: u64,
    pub max_output_bytes: u64,

    // Merge-conflict prediction
    pub conflict_threshold: u32,
    pub conflict_high_threshold: u32,

    // Scheduling
    pub job_result_retention: u32,
    pub missed_job_grace_s: u64,
    pub max_arm_horizon_h: u64,
    pub smart_history_days: u32,
    pub default_quiet_hour: u32,
    pub schedule_hour: u32,

    // Branches and workspaces
    pub branch_prefix: String,
    pub worktree_root: String,
    pub gh_bin: String,

    // Git attribution; empty means git's own user config.
    pub git_author_name: String,
    pub git_author_email: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn default_worktree_root() -> String {
    std::env::temp_dir()
        .join("depbot-worktrees")
        .to_string_lossy()
        .into_owned()
}

impl Default for Config {
    fn default() -> Self {
        Self::from_map(&HashMap::new(), false)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_map(&parse_dotenv(), true))
    }

    fn from_map(dotenv: &HashMap<String, String>, read_env: bool) -> Self {
        let lookup = |key: &str| {
            if read_env {
                get(key, dotenv)
            } else {
                dotenv.get(key).cloned()
            }
        };
        let s = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        macro_rules! num {
            ($key:expr, $default:expr) => {
                lookup($key).and_then(|v| v.parse().ok()).unwrap_or($default)
            };
        }
        Config {
            data_dir: s("DATA_DIR", "store"),
            web_bind: s("WEB_BIND", "127.0.0.1"),
            web_port: num!("WEB_PORT", 3232),
            install_timeout_s: num!("INSTALL_TIMEOUT_S", 300),
            test_timeout_s: num!("TEST_TIMEOUT_S", 300),
            lint_timeout_s: num!("LINT_TIMEOUT_S", 120),
            probe_timeout_s: num!("PROBE_TIMEOUT_S", 30),
            push_timeout_s: num!("PUSH_TIMEOUT_S", 120),
            max_output_bytes: num!("MAX_OUTPUT_BYTES", crate::exec::DEFAULT_MAX_OUTPUT_BYTES as u64),
            conflict_threshold: num!("CONFLICT_THRESHOLD", 10),
            conflict_high_threshold: num!("CONFLICT_HIGH_THRESHOLD", 25),
            job_result_retention: num!("JOB_RESULT_RETENTION", 100),
            missed_job_grace_s: num!("MISSED_JOB_GRACE_S", 5),
            max_arm_horizon_h: num!("MAX_ARM_HORIZON_H", 24),
            smart_history_days: num!("SMART_HISTORY_DAYS", 30),
            default_quiet_hour: num!("DEFAULT_QUIET_HOUR", 6),
            schedule_hour: num!("SCHEDULE_HOUR", 3),
            branch_prefix: s("BRANCH_PREFIX", "depbot/"),
            worktree_root: s("WORKTREE_ROOT", &default_worktree_root()),
            gh_bin: s("GH_BIN", "gh"),
            git_author_name: s("GIT_AUTHOR_NAME", ""),
            git_author_email: s("GIT_AUTHOR_EMAIL", ""),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("depbot.db")
    }

    /// Every runtime-editable key with its current value.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("data_dir", self.data_dir.clone()),
            ("web_bind", self.web_bind.clone()),
            ("web_port", self.web_port.to_string()),
            ("install_timeout_s", self.install_timeout_s.to_string()),
            ("test_timeout_s", self.test_timeout_s.to_string()),
            ("lint_timeout_s", self.lint_timeout_s.to_string()),
            ("probe_timeout_s", self.probe_timeout_s.to_string()),
            ("push_timeout_s", self.push_timeout_s.to_string()),
            ("max_output_bytes", self.max_output_bytes.to_string()),
            ("conflict_threshold", self.conflict_threshold.to_string()),
            ("conflict_high_threshold", self.conflict_high_threshold.to_string()),
            ("job_result_retention", self.job_result_retention.to_string()),
            ("missed_job_grace_s", self.missed_job_grace_s.to_string()),
            ("max_arm_horizon_h", self.max_arm_horizon_h.to_string()),
            ("smart_history_days", self.smart_history_days.to_string()),
            ("default_quiet_hour", self.default_quiet_hour.to_string()),
            ("schedule_hour", self.schedule_hour.to_string()),
            ("branch_prefix", self.branch_prefix.clone()),
            ("worktree_root", self.worktree_root.clone()),
            ("gh_bin", self.gh_bin.clone()),
            ("git_author_name", self.git_author_name.clone()),
            ("git_author_email", self.git_author_email.clone()),
        ]
    }

    pub fn is_setting_key(&self, key: &str) -> bool {
        self.entries().iter().any(|(k, _)| *k == key)
    }

    /// Write all fields to DB if not already present (first-run seeding).
    pub fn seed_db(&self, db: &Db) -> Result<()> {
        for (key, value) in self.entries() {
            db.insert_config_if_absent(key, &value)?;
        }
        Ok(())
    }

    /// Return a new Config with fields overridden from DB values.
    pub fn load_from_db(&self, db: &Db) -> Self {
        let mut c = self.clone();
        let get = |key: &str| db.get_config(key).ok().flatten();
        let get_str = |key: &str, cur: &str| get(key).unwrap_or_else(|| cur.to_string());
        macro_rules! load_num {
            ($key:expr, $field:expr) => {
                if let Some(v) = get($key).and_then(|s| s.parse().ok()) {
                    $field = v;
                }
            };
        }
        c.data_dir = get_str("data_dir", &c.data_dir);
        c.web_bind = get_str("web_bind", &c.web_bind);
        c.branch_prefix = get_str("branch_prefix", &c.branch_prefix);
        c.worktree_root = get_str("worktree_root", &c.worktree_root);
        c.gh_bin = get_str("gh_bin", &c.gh_bin);
        c.git_author_name = get_str("git_author_name", &c.git_author_name);
        c.git_author_email = get_str("git_author_email", &c.git_author_email);
        load_num!("web_port", c.web_port);
        load_num!("install_timeout_s", c.install_timeout_s);
        load_num!("test_timeout_s", c.test_timeout_s);
        load_num!("lint_timeout_s", c.lint_timeout_s);
        load_num!("probe_timeout_s", c.probe_timeout_s);
        load_num!("push_timeout_s", c.push_timeout_s);
        load_num!("max_output_bytes", c.max_output_bytes);
        load_num!("conflict_threshold", c.conflict_threshold);
        load_num!("conflict_high_threshold", c.conflict_high_threshold);
        load_num!("job_result_retention", c.job_result_retention);
        load_num!("missed_job_grace_s", c.missed_job_grace_s);
        load_num!("max_arm_horizon_h", c.max_arm_horizon_h);
        load_num!("smart_history_days", c.smart_history_days);
        load_num!("default_quiet_hour", c.default_quiet_hour);
        load_num!("schedule_hour", c.schedule_hour);
        c
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let author = (!self.git_author_name.is_empty() && !self.git_author_email.is_empty())
            .then(|| (self.git_author_name.clone(), self.git_author_email.clone()));
        PipelineSettings {
            install_timeout_s: self.install_timeout_s,
            test_timeout_s: self.test_timeout_s,
            lint_timeout_s: self.lint_timeout_s,
            probe_timeout_s: self.probe_timeout_s,
            push_timeout_s: self.push_timeout_s,
            max_output_bytes: usize::try_from(self.max_output_bytes).unwrap_or(usize::MAX),
            conflict_threshold: self.conflict_threshold,
            conflict_high_threshold: self.conflict_high_threshold,
            branch_prefix: self.branch_prefix.clone(),
            worktree_root: PathBuf::from(&self.worktree_root),
            git_author: author,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            job_result_retention: self.job_result_retention as usize,
            missed_job_grace: Duration::from_secs(self.missed_job_grace_s),
            max_arm_horizon: Duration::from_secs(self.max_arm_horizon_h * 3600),
            smart_history_days: self.smart_history_days,
            default_quiet_hour: self.default_quiet_hour.min(23),
            schedule_hour: self.schedule_hour.min(23),
        }
    }
}

/// The slice of configuration a pipeline run reads.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub install_timeout_s: u64,
    pub test_timeout_s: u64,
    pub lint_timeout_s: u64,
    pub probe_timeout_s: u64,
    pub push_timeout_s: u64,
    pub max_output_bytes: usize,
    pub conflict_threshold: u32,
    pub conflict_high_threshold: u32,
    pub branch_prefix: String,
    pub worktree_root: PathBuf,
    pub git_author: Option<(String, String)>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Config::default().pipeline_settings()
    }
}

impl PipelineSettings {
    fn limits(&self, secs: u64) -> Limits {
        Limits::secs(secs).with_max_output(self.max_output_bytes)
    }

    pub fn install_limits(&self) -> Limits {
        self.limits(self.install_timeout_s)
    }

    pub fn test_limits(&self, override_s: Option<u64>) -> Limits {
        self.limits(override_s.unwrap_or(self.test_timeout_s))
    }

    pub fn lint_limits(&self) -> Limits {
        self.limits(self.lint_timeout_s)
    }

    pub fn probe_limits(&self) -> Limits {
        self.limits(self.probe_timeout_s)
    }

    pub fn push_limits(&self) -> Limits {
        self.limits(self.push_timeout_s)
    }
}

/// The slice of configuration both schedulers read.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub job_result_retention: usize,
    pub missed_job_grace: Duration,
    pub max_arm_horizon: Duration,
    pub smart_history_days: u32,
    pub default_quiet_hour: u32,
    pub schedule_hour: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Config::default().scheduler_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.web_port, 3232);
        assert_eq!(c.install_timeout_s, 300);
        assert_eq!(c.lint_timeout_s, 120);
        assert_eq!(c.conflict_threshold, 10);
        assert_eq!(c.branch_prefix, "depbot/");

        let s = c.scheduler_settings();
        assert_eq!(s.missed_job_grace, Duration::from_secs(5));
        assert_eq!(s.max_arm_horizon, Duration::from_secs(24 * 3600));
        assert_eq!(s.job_result_retention, 100);
        assert_eq!(s.default_quiet_hour, 6);
        assert_eq!(s.schedule_hour, 3);
    }

    #[test]
    fn map_values_override_defaults() {
        let mut m = HashMap::new();
        m.insert("TEST_TIMEOUT_S".to_string(), "60".to_string());
        m.insert("WEB_PORT".to_string(), "not-a-port".to_string());
        m.insert("GIT_AUTHOR_NAME".to_string(), "Bot".to_string());
        m.insert("GIT_AUTHOR_EMAIL".to_string(), "bot@example.com".to_string());
        let c = Config::from_map(&m, false);
        assert_eq!(c.test_timeout_s, 60);
        assert_eq!(c.web_port, 3232);

        let p = c.pipeline_settings();
        assert_eq!(p.test_limits(None).timeout, Duration::from_secs(60));
        assert_eq!(p.test_limits(Some(5)).timeout, Duration::from_secs(5));
        assert_eq!(p.git_author, Some(("Bot".to_string(), "bot@example.com".to_string())));
    }

    #[test]
    fn seed_then_load_round_trips_db_edits() {
        let db = Db::open_in_memory().unwrap();
        let c = Config::default();
        c.seed_db(&db).unwrap();

        db.set_config("test_timeout_s", "42").unwrap();
        db.set_config("branch_prefix", "deps/").unwrap();
        // Re-seeding never clobbers edited values.
        c.seed_db(&db).unwrap();

        let loaded = c.load_from_db(&db);
        assert_eq!(loaded.test_timeout_s, 42);
        assert_eq!(loaded.branch_prefix, "deps/");
        assert_eq!(loaded.lint_timeout_s, 120);
        assert!(c.is_setting_key("schedule_hour"));
        assert!(!c.is_setting_key("nope"));
    }
}
