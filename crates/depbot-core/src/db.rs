use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{JobResult, Repository};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS config (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repos (
    path       TEXT PRIMARY KEY,
    name       TEXT NOT NULL,
    added_at   TEXT NOT NULL
);
";

/// Keyed record holding the scheduled job list.
pub const JOBS_RECORD: &str = "scheduled_jobs";
/// Keyed record holding recent job results, oldest first.
pub const JOB_RESULTS_RECORD: &str = "job_results";
/// Keyed record holding the smart scan schedules.
pub const SMART_SCHEDULES_RECORD: &str = "smart_schedules";

pub struct Db {
    conn: Mutex<Connection>,
}

fn now_str() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data dir {}", parent.display()))?;
        }
        let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .context("setting pragmas")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory db")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL).context("migrate")?;
        Ok(())
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("get_config")?;
        Ok(result)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_str()],
        )
        .context("set_config")?;
        Ok(())
    }

    pub fn insert_config_if_absent(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_str()],
        )
        .context("insert_config_if_absent")?;
        Ok(())
    }

    pub fn list_config(&self) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare("SELECT key, value FROM config ORDER BY key")
            .context("list_config")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Keyed records ─────────────────────────────────────────────────────

    /// Read a JSON record, or `T::default()` when it was never written.
    pub fn get_record<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        read_record(&conn, key)
    }

    pub fn set_record<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        write_record(&conn, key, value)
    }

    /// Read-modify-write of one record inside an immediate transaction. The
    /// record is only written back when `f` returns `Ok`.
    pub fn update_record<T, R, F>(&self, key: &str, f: F) -> Result<R>
    where
        T: DeserializeOwned + Serialize + Default,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("update_record begin")?;
        let mut value: T = read_record(&tx, key)?;
        let out = f(&mut value)?;
        write_record(&tx, key, &value)?;
        tx.commit().context("update_record commit")?;
        Ok(out)
    }

    /// Append to the job result log, keeping the most recent `retention`.
    pub fn append_job_result(&self, result: &JobResult, retention: usize) -> Result<()> {
        self.update_record(JOB_RESULTS_RECORD, |results: &mut Vec<JobResult>| {
            results.push(result.clone());
            if results.len() > retention {
                let excess = results.len() - retention;
                results.drain(..excess);
            }
            Ok(())
        })
    }

    /// Most recent results first.
    pub fn job_results(&self, limit: usize) -> Result<Vec<JobResult>> {
        let results: Vec<JobResult> = self.get_record(JOB_RESULTS_RECORD)?;
        Ok(results.into_iter().rev().take(limit).collect())
    }

    // ── Repositories ──────────────────────────────────────────────────────

    pub fn upsert_repo(&self, repo: &Repository) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO repos (path, name, added_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(path) DO UPDATE SET name = excluded.name",
            params![repo.path, repo.name, now_str()],
        )
        .context("upsert_repo")?;
        Ok(())
    }

    /// Registered repositories, re-inspected on disk.
    pub fn list_repos(&self) -> Result<Vec<Repository>> {
        let paths: Vec<String> = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let mut stmt = conn
                .prepare("SELECT path FROM repos ORDER BY name, path")
                .context("list_repos")?;
            let rows = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            rows
        };
        Ok(paths.iter().map(|p| Repository::inspect(p)).collect())
    }

    pub fn remove_repo(&self, path: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute("DELETE FROM repos WHERE path = ?1", params![path])
            .context("remove_repo")?;
        Ok(n > 0)
    }

    /// Drop registered repositories whose path no longer exists.
    pub fn prune_repos(&self) -> Result<Vec<String>> {
        let missing: Vec<String> = self
            .list_repos()?
            .into_iter()
            .filter(|r| !r.exists)
            .map(|r| r.path)
            .collect();
        for path in &missing {
            self.remove_repo(path)?;
        }
        Ok(missing)
    }
}

fn read_record<T: DeserializeOwned + Default>(conn: &Connection, key: &str) -> Result<T> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM records WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("reading record {key}"))?;
    match raw {
        Some(s) => serde_json::from_str(&s).with_context(|| format!("decoding record {key}")),
        None => Ok(T::default()),
    }
}

fn write_record<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO records (key, value, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, json, now_str()],
    )
    .with_context(|| format!("writing record {key}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn result(job: &str, n: usize) -> JobResult {
        JobResult {
            job_id: job.to_string(),
            success: n % 2 == 0,
            timestamp: Utc::now(),
            updated_packages: vec![format!("pkg{n}")],
            error: None,
        }
    }

    #[test]
    fn config_set_and_get() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.get_config("k").unwrap(), None);
        db.set_config("k", "1").unwrap();
        db.set_config("k", "2").unwrap();
        db.insert_config_if_absent("k", "3").unwrap();
        assert_eq!(db.get_config("k").unwrap().as_deref(), Some("2"));
        assert_eq!(db.list_config().unwrap(), vec![("k".to_string(), "2".to_string())]);
    }

    #[test]
    fn missing_record_is_default() {
        let db = Db::open_in_memory().unwrap();
        let jobs: Vec<crate::types::ScheduledJob> = db.get_record(JOBS_RECORD).unwrap();
        assert!(jobs.is_empty());
    }

    #[test]
    fn update_record_discards_on_error() {
        let db = Db::open_in_memory().unwrap();
        db.set_record("nums", &vec![1, 2]).unwrap();
        let err = db.update_record("nums", |v: &mut Vec<i32>| -> Result<()> {
            v.push(3);
            anyhow::bail!("nope")
        });
        assert!(err.is_err());
        let v: Vec<i32> = db.get_record("nums").unwrap();
        assert_eq!(v, vec![1, 2]);
    }

    #[test]
    fn job_results_are_capped_and_newest_first() {
        let db = Db::open_in_memory().unwrap();
        for n in 0..7 {
            db.append_job_result(&result("j", n), 5).unwrap();
        }
        let all = db.job_results(100).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].updated_packages, vec!["pkg6"]);
        assert_eq!(all[4].updated_packages, vec!["pkg2"]);
        assert_eq!(db.job_results(2).unwrap().len(), 2);
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open(&dir.path().join("depbot.db")).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for n in 0..10 {
                        db.append_job_result(&result(&format!("t{t}"), n), 1000).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(db.job_results(1000).unwrap().len(), 80);
    }

    #[test]
    fn repo_registry_revalidates_and_prunes() {
        let db = Db::open_in_memory().unwrap();
        let live = tempfile::tempdir().unwrap();
        std::fs::write(live.path().join("package.json"), "{}").unwrap();
        let live_path = live.path().to_str().unwrap().to_string();

        db.upsert_repo(&Repository::inspect(&live_path)).unwrap();
        db.upsert_repo(&Repository::inspect("/nonexistent/depbot/gone")).unwrap();

        let repos = db.list_repos().unwrap();
        assert_eq!(repos.len(), 2);
        let live_repo = repos.iter().find(|r| r.path == live_path).unwrap();
        assert!(live_repo.exists);
        assert_eq!(live_repo.ecosystems, vec![crate::types::EcosystemKind::Node]);

        assert_eq!(db.prune_repos().unwrap(), vec!["/nonexistent/depbot/gone".to_string()]);
        assert_eq!(db.list_repos().unwrap().len(), 1);
        assert!(db.remove_repo(&live_path).unwrap());
        assert!(!db.remove_repo(&live_path).unwrap());
    }
}
