//! Quiet-hour scans: one schedule per repository, fired daily at the hour of
//! the day with the least commit activity.

use std::path::Path;
use std::sync::{Arc, Weak};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Days, Local, Timelike, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    config::SchedulerSettings,
    db::{Db, SMART_SCHEDULES_RECORD},
    exec::Limits,
    git::Git,
    scheduler::{delay_until, pinned, repo_basename, ScheduleZone},
    types::{JobOutcome, SchedulerEvent, SmartScanSchedule},
    wakeup::{InFlight, Wake, WakeQueue},
};

/// Runs a fired scan. Supplied by the host.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    async fn scan(&self, schedule: &SmartScanSchedule) -> JobOutcome;
}

/// Hour (0-23) with the fewest commits. Ties go to the lowest hour; no
/// history at all yields `default`.
pub fn quiet_hour<Tz: chrono::TimeZone>(timestamps: &[i64], tz: &Tz, default: u32) -> u32 {
    let mut buckets = [0usize; 24];
    let mut seen = 0;
    for ts in timestamps {
        if let Some(t) = DateTime::from_timestamp(*ts, 0) {
            buckets[t.with_timezone(tz).hour() as usize] += 1;
            seen += 1;
        }
    }
    if seen == 0 {
        return default;
    }
    (0..24u32)
        .min_by_key(|h| (buckets[*h as usize], *h))
        .unwrap_or(default)
}

/// Today at `hour:00`, or tomorrow when that has already passed.
pub fn next_quiet_run<Tz: chrono::TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Utc> {
    let tz = now.timezone();
    let now_utc = now.with_timezone(&Utc);
    let today = now.date_naive();
    match pinned(&tz, Some(today), hour) {
        Some(at) if at > now_utc => at,
        _ => pinned(&tz, today.checked_add_days(Days::new(1)), hour)
            .unwrap_or_else(|| now_utc + chrono::Duration::days(1)),
    }
}

pub struct SmartScheduler<Tz: ScheduleZone = Local> {
    inner: Arc<Inner<Tz>>,
}

impl<Tz: ScheduleZone> Clone for SmartScheduler<Tz> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<Tz> {
    db: Arc<Db>,
    executor: Arc<dyn ScanExecutor>,
    settings: SchedulerSettings,
    probe: Limits,
    tz: Tz,
    queue: WakeQueue<String>,
    running: InFlight<String>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SmartScheduler<Local> {
    pub fn new(
        db: Arc<Db>,
        executor: Arc<dyn ScanExecutor>,
        settings: SchedulerSettings,
        probe: Limits,
    ) -> (Self, broadcast::Receiver<SchedulerEvent>) {
        Self::with_timezone(db, executor, settings, probe, Local)
    }
}

impl<Tz: ScheduleZone> SmartScheduler<Tz> {
    pub fn with_timezone(
        db: Arc<Db>,
        executor: Arc<dyn ScanExecutor>,
        settings: SchedulerSettings,
        probe: Limits,
        tz: Tz,
    ) -> (Self, broadcast::Receiver<SchedulerEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let inner = Inner {
            db,
            executor,
            settings,
            probe,
            tz,
            queue: WakeQueue::new(settings.max_arm_horizon),
            running: InFlight::new(),
            events: tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn next_run(&self, hour: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        next_quiet_run(&now.with_timezone(&self.inner.tz), hour)
    }

    /// Quiet hour of `repo` over the configured history window. Falls back
    /// to the default hour when git history can't be read.
    pub async fn analyze_commit_patterns(&self, repo: &Path) -> u32 {
        let default = self.inner.settings.default_quiet_hour;
        let git = Git::new(repo).with_limits(self.inner.probe, self.inner.probe);
        match git.commit_timestamps(self.inner.settings.smart_history_days).await {
            Ok(ts) => {
                let hour = quiet_hour(&ts, &self.inner.tz, default);
                debug!(repo = %repo.display(), commits = ts.len(), "quiet hour {hour}");
                hour
            }
            Err(e) => {
                warn!(repo = %repo.display(), "commit history unavailable, using hour {default}: {e:#}");
                default
            }
        }
    }

    pub fn initialize(&self) -> Result<usize> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.start(move |wake| on_wake(&weak, wake));

        let schedules = self.schedules()?;
        let mut armed = 0;
        for s in schedules.iter().filter(|s| s.enabled) {
            if self.arm_or_catch_up(s) {
                armed += 1;
            }
        }
        info!("smart scheduler initialised: {} schedule(s), {armed} armed", schedules.len());
        Ok(armed)
    }

    pub fn cleanup(&self) {
        self.inner.queue.shutdown();
    }

    pub fn schedules(&self) -> Result<Vec<SmartScanSchedule>> {
        self.inner.db.get_record(SMART_SCHEDULES_RECORD)
    }

    pub fn schedule(&self, repo_path: &str) -> Result<Option<SmartScanSchedule>> {
        Ok(self.schedules()?.into_iter().find(|s| s.repo_path == repo_path))
    }

    pub fn is_armed(&self, repo_path: &str) -> bool {
        self.inner.queue.is_armed(&repo_path.to_string())
    }

    /// Analyse `repo_path` and store its schedule, replacing any existing
    /// schedule for the same path.
    pub async fn add_schedule(&self, repo_path: &str, repo_name: Option<String>) -> Result<SmartScanSchedule> {
        if repo_path.trim().is_empty() {
            bail!("repo_path is required");
        }
        let quiet_hour = self.analyze_commit_patterns(Path::new(repo_path)).await;
        let schedule = SmartScanSchedule {
            repo_path: repo_path.to_string(),
            repo_name: repo_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| repo_basename(repo_path)),
            quiet_hour,
            enabled: true,
            last_run: None,
            next_run: self.next_run(quiet_hour, Utc::now()),
        };
        self.inner
            .db
            .update_record(SMART_SCHEDULES_RECORD, |all: &mut Vec<SmartScanSchedule>| {
                all.retain(|s| s.repo_path != schedule.repo_path);
                all.push(schedule.clone());
                Ok(())
            })?;
        info!(repo = %repo_path, "smart scan scheduled at {quiet_hour}:00, next run {}", schedule.next_run);
        self.arm(&schedule);
        Ok(schedule)
    }

    /// Re-analyse the quiet hour of an existing schedule.
    pub async fn refresh(&self, repo_path: &str) -> Result<Option<SmartScanSchedule>> {
        if self.schedule(repo_path)?.is_none() {
            return Ok(None);
        }
        let quiet_hour = self.analyze_commit_patterns(Path::new(repo_path)).await;
        let next_run = self.next_run(quiet_hour, Utc::now());
        let updated = self.modify(repo_path, |s| {
            s.quiet_hour = quiet_hour;
            s.next_run = next_run;
        })?;
        if let Some(s) = &updated {
            if s.enabled {
                self.arm(s);
            }
        }
        Ok(updated)
    }

    pub fn set_enabled(&self, repo_path: &str, enabled: bool) -> Result<Option<SmartScanSchedule>> {
        let next_run = self
            .schedule(repo_path)?
            .map(|s| self.next_run(s.quiet_hour, Utc::now()));
        let updated = self.modify(repo_path, |s| {
            s.enabled = enabled;
            if let Some(at) = next_run {
                s.next_run = at;
            }
        })?;
        if let Some(s) = &updated {
            if s.enabled {
                self.arm(s);
            } else {
                self.inner.queue.disarm(&s.repo_path);
            }
        }
        Ok(updated)
    }

    pub fn remove_schedule(&self, repo_path: &str) -> Result<bool> {
        let removed = self
            .inner
            .db
            .update_record(SMART_SCHEDULES_RECORD, |all: &mut Vec<SmartScanSchedule>| {
                let before = all.len();
                all.retain(|s| s.repo_path != repo_path);
                Ok(all.len() != before)
            })?;
        self.inner.queue.disarm(&repo_path.to_string());
        Ok(removed)
    }

    fn modify(&self, repo_path: &str, f: impl FnOnce(&mut SmartScanSchedule)) -> Result<Option<SmartScanSchedule>> {
        self.inner
            .db
            .update_record(SMART_SCHEDULES_RECORD, |all: &mut Vec<SmartScanSchedule>| {
                let Some(s) = all.iter_mut().find(|s| s.repo_path == repo_path) else {
                    return Ok(None);
                };
                f(s);
                Ok(Some(s.clone()))
            })
    }

    fn arm(&self, schedule: &SmartScanSchedule) -> bool {
        let delay = delay_until(schedule.next_run, Utc::now());
        self.inner.queue.arm(schedule.repo_path.clone(), delay)
    }

    fn arm_or_catch_up(&self, schedule: &SmartScanSchedule) -> bool {
        if schedule.next_run <= Utc::now() {
            info!(repo = %schedule.repo_path, "missed scan at {}, firing after grace delay", schedule.next_run);
            self.inner
                .queue
                .arm(schedule.repo_path.clone(), self.inner.settings.missed_job_grace)
        } else {
            self.arm(schedule)
        }
    }

    pub fn is_running(&self, repo_path: &str) -> bool {
        self.inner.running.contains(&repo_path.to_string())
    }

    fn rederive(&self) {
        match self.schedules() {
            Ok(all) => {
                for s in all
                    .iter()
                    .filter(|s| s.enabled && !self.is_armed(&s.repo_path) && !self.is_running(&s.repo_path))
                {
                    self.arm_or_catch_up(s);
                }
            }
            Err(e) => warn!("could not reload smart schedules: {e:#}"),
        }
    }

    /// Run one scan, then record the run and arm the next day's scan.
    pub async fn fire(&self, repo_path: &str) {
        let Some(_running) = self.inner.running.claim(repo_path.to_string()) else {
            debug!(repo = %repo_path, "scan already running, skipping");
            return;
        };
        let schedule = match self.schedule(repo_path) {
            Ok(Some(s)) if s.enabled => s,
            Ok(_) => return,
            Err(e) => {
                error!(repo = %repo_path, "could not load smart schedule: {e:#}");
                return;
            }
        };

        info!(repo = %repo_path, "running quiet-hour scan");
        self.emit(SchedulerEvent::ScanStarted {
            repo_path: schedule.repo_path.clone(),
        });
        let outcome = self.inner.executor.scan(&schedule).await;

        let now = Utc::now();
        let next_run = self.next_run(schedule.quiet_hour, now.max(schedule.next_run));
        match self.modify(repo_path, |s| {
            s.last_run = Some(now);
            s.next_run = next_run;
        }) {
            Ok(Some(s)) if s.enabled => {
                self.arm(&s);
            }
            Ok(_) => {}
            Err(e) => error!(repo = %repo_path, "could not persist next scan: {e:#}"),
        }

        if !outcome.success {
            warn!(repo = %repo_path, "scan failed: {}", outcome.error.as_deref().unwrap_or("unknown error"));
        }
        self.emit(SchedulerEvent::ScanFinished {
            repo_path: schedule.repo_path,
            success: outcome.success,
            next_run,
        });
    }
}

fn on_wake<Tz: ScheduleZone>(inner: &Weak<Inner<Tz>>, wake: Wake<String>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let scheduler = SmartScheduler { inner };
    match wake {
        Wake::Due(path) => {
            tokio::spawn(async move { scheduler.fire(&path).await });
        }
        Wake::Horizon => scheduler.rederive(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, TimeZone};

    fn utc(s: &str) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap().and_utc()
    }

    fn at_hours(hours: &[u32]) -> Vec<i64> {
        hours
            .iter()
            .enumerate()
            .map(|(day, h)| {
                Utc.with_ymd_and_hms(2024, 5, 1 + (day as u32 % 28), *h, 15, 0)
                    .unwrap()
                    .timestamp()
            })
            .collect()
    }

    #[test]
    fn picks_least_active_hour() {
        // Every hour has two commits except 14, which has one.
        let mut hours: Vec<u32> = (0..24).flat_map(|h| [h, h]).collect();
        hours.retain(|h| *h != 14);
        hours.push(14);
        assert_eq!(quiet_hour(&at_hours(&hours), &Utc, 6), 14);
    }

    #[test]
    fn ties_go_to_lowest_hour() {
        let busy: Vec<u32> = (0..24).filter(|h| *h != 4 && *h != 19).collect();
        assert_eq!(quiet_hour(&at_hours(&busy), &Utc, 6), 4);
        // Hours 0..=8 untouched, so 0 wins.
        assert_eq!(quiet_hour(&at_hours(&[9, 10, 11]), &Utc, 6), 0);
    }

    #[test]
    fn no_history_uses_default() {
        assert_eq!(quiet_hour(&[], &Utc, 6), 6);
    }

    #[test]
    fn buckets_in_local_zone() {
        let tz = chrono::FixedOffset::east_opt(3 * 3600).unwrap();
        // 21:15 UTC is 00:15 at +03:00; every other local hour gets a commit.
        let busy: Vec<u32> = (0..24).filter(|h| *h != 0).map(|h| (h + 21) % 24).collect();
        let mut ts = at_hours(&busy);
        ts.extend(at_hours(&[21]));
        ts.extend(at_hours(&busy));
        assert_eq!(quiet_hour(&ts, &tz, 6), 0);
    }

    #[test]
    fn next_quiet_run_today_or_tomorrow() {
        let now = utc("2024-05-10 04:30:00");
        assert_eq!(next_quiet_run(&now, 6), utc("2024-05-10 06:00:00"));
        assert_eq!(next_quiet_run(&now, 4), utc("2024-05-11 04:00:00"));
        assert_eq!(next_quiet_run(&utc("2024-05-10 06:00:00"), 6), utc("2024-05-11 06:00:00"));
    }

    struct Idle;

    #[async_trait]
    impl ScanExecutor for Idle {
        async fn scan(&self, _schedule: &SmartScanSchedule) -> JobOutcome {
            JobOutcome::default()
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn unreadable_history_warns_and_uses_default() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let (s, _rx) =
            SmartScheduler::with_timezone(db, Arc::new(Idle), SchedulerSettings::default(), Limits::secs(30), Utc);
        assert_eq!(s.analyze_commit_patterns(dir.path()).await, 6);
        assert!(logs_contain("commit history unavailable"));
    }
}
