//! Recurring update jobs.
//!
//! Jobs persist in the `scheduled_jobs` record. Each enabled job has at most
//! one entry in a [`WakeQueue`]; jobs due beyond the arming horizon are picked
//! up by the queue's horizon tick or the next [`Scheduler::initialize`].

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, Local, NaiveDate, TimeZone, Timelike, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    config::SchedulerSettings,
    db::{Db, JOBS_RECORD},
    types::{Frequency, JobOutcome, JobResult, JobSpec, ScheduledJob, SchedulerEvent},
    wakeup::{InFlight, Wake, WakeQueue},
};

/// Runs a fired job. Bound by the host; the server runs the non-breaking
/// pipeline here.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &ScheduledJob) -> JobOutcome;
}

/// Time zone cadence math runs in. `Local` in production, `Utc` in tests.
pub trait ScheduleZone: TimeZone + Copy + Send + Sync + 'static {}

impl<T: TimeZone + Copy + Send + Sync + 'static> ScheduleZone for T {}

// ── Cadence math ──────────────────────────────────────────────────────────

/// Next fire time after `now` for `frequency`. Hourly runs at the top of the
/// next hour; the other cadences are pinned to `hour:00` local time.
pub fn compute_next_run<Tz: TimeZone>(frequency: Frequency, now: &DateTime<Tz>, hour: u32) -> DateTime<Utc> {
    let tz = now.timezone();
    let today = now.date_naive();
    let next = match frequency {
        Frequency::Hourly => {
            let utc = now.with_timezone(&Utc);
            utc.date_naive()
                .and_hms_opt(utc.hour(), 0, 0)
                .map(|top| top.and_utc() + chrono::Duration::hours(1))
        }
        Frequency::Daily => pinned(&tz, today.checked_add_days(Days::new(1)), hour),
        Frequency::Weekly => pinned(&tz, today.checked_add_days(Days::new(7)), hour),
        Frequency::Monthly => {
            let (y, m) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            pinned(&tz, NaiveDate::from_ymd_opt(y, m, 1), hour)
        }
    };
    next.unwrap_or_else(|| now.with_timezone(&Utc) + chrono::Duration::days(1))
}

/// `day` at `hour:00` in `tz`. A time skipped by a DST jump moves an hour later.
pub(crate) fn pinned<Tz: TimeZone>(tz: &Tz, day: Option<NaiveDate>, hour: u32) -> Option<DateTime<Utc>> {
    let naive = day?.and_hms_opt(hour.min(23), 0, 0)?;
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
}

/// Delay until `at`, zero if it already passed.
pub(crate) fn delay_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

pub(crate) fn repo_basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

// ── Scheduler ─────────────────────────────────────────────────────────────

pub struct Scheduler<Tz: ScheduleZone = Local> {
    inner: Arc<Inner<Tz>>,
}

impl<Tz: ScheduleZone> Clone for Scheduler<Tz> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<Tz> {
    db: Arc<Db>,
    executor: Arc<dyn JobExecutor>,
    settings: SchedulerSettings,
    tz: Tz,
    queue: WakeQueue<String>,
    running: InFlight<String>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler<Local> {
    pub fn new(
        db: Arc<Db>,
        executor: Arc<dyn JobExecutor>,
        settings: SchedulerSettings,
    ) -> (Self, broadcast::Receiver<SchedulerEvent>) {
        Self::with_timezone(db, executor, settings, Local)
    }
}

impl<Tz: ScheduleZone> Scheduler<Tz> {
    pub fn with_timezone(
        db: Arc<Db>,
        executor: Arc<dyn JobExecutor>,
        settings: SchedulerSettings,
        tz: Tz,
    ) -> (Self, broadcast::Receiver<SchedulerEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let inner = Inner {
            db,
            executor,
            settings,
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

    pub fn next_run(&self, frequency: Frequency, now: DateTime<Utc>) -> DateTime<Utc> {
        compute_next_run(frequency, &now.with_timezone(&self.inner.tz), self.inner.settings.schedule_hour)
    }

    /// Start the wake task and arm every persisted job. Jobs whose next run
    /// already passed fire once after the missed-job grace delay.
    pub fn initialize(&self) -> Result<usize> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue.start(move |wake| on_wake(&weak, wake));

        let jobs = self.jobs()?;
        let now = Utc::now();
        let mut armed = 0;
        for job in jobs.iter().filter(|j| j.enabled) {
            if job.next_run <= now {
                info!(job_id = %job.id, "missed run at {}, firing after grace delay", job.next_run);
                self.inner
                    .queue
                    .arm(job.id.clone(), self.inner.settings.missed_job_grace);
                armed += 1;
            } else if self.arm(job) {
                armed += 1;
            }
        }
        info!("scheduler initialised: {} job(s), {armed} armed", jobs.len());
        Ok(armed)
    }

    /// Cancel every timer. Persisted jobs are untouched.
    pub fn cleanup(&self) {
        self.inner.queue.shutdown();
    }

    pub fn jobs(&self) -> Result<Vec<ScheduledJob>> {
        self.inner.db.get_record(JOBS_RECORD)
    }

    pub fn job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        Ok(self.jobs()?.into_iter().find(|j| j.id == id))
    }

    /// Most recent first.
    pub fn results(&self, limit: usize) -> Result<Vec<JobResult>> {
        self.inner.db.job_results(limit)
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.inner.queue.is_armed(&id.to_string())
    }

    pub fn add_job(&self, spec: JobSpec) -> Result<ScheduledJob> {
        if spec.repo_path.trim().is_empty() {
            bail!("repo_path is required");
        }
        let now = Utc::now();
        let job = ScheduledJob {
            id: format!("job-{}-{:04x}", now.timestamp_millis(), rand::random::<u16>()),
            repo_name: spec
                .repo_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| repo_basename(&spec.repo_path)),
            repo_path: spec.repo_path,
            frequency: spec.frequency,
            enabled: spec.enabled,
            last_run: None,
            next_run: self.next_run(spec.frequency, now),
            create_pr: spec.create_pr,
            run_tests: spec.run_tests,
        };
        self.inner
            .db
            .update_record(JOBS_RECORD, |jobs: &mut Vec<ScheduledJob>| {
                jobs.push(job.clone());
                Ok(())
            })?;
        info!(job_id = %job.id, repo = %job.repo_path, "job added, next run {}", job.next_run);
        if job.enabled {
            self.arm(&job);
        }
        Ok(job)
    }

    /// Replace a job's settings and recompute its next run. `None` when the
    /// id is unknown.
    pub fn update_job(&self, id: &str, spec: JobSpec) -> Result<Option<ScheduledJob>> {
        let next_run = self.next_run(spec.frequency, Utc::now());
        let updated = self
            .inner
            .db
            .update_record(JOBS_RECORD, |jobs: &mut Vec<ScheduledJob>| {
                let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
                    return Ok(None);
                };
                job.repo_path = spec.repo_path.clone();
                if let Some(name) = spec.repo_name.clone().filter(|n| !n.trim().is_empty()) {
                    job.repo_name = name;
                }
                job.frequency = spec.frequency;
                job.enabled = spec.enabled;
                job.create_pr = spec.create_pr;
                job.run_tests = spec.run_tests;
                job.next_run = next_run;
                Ok(Some(job.clone()))
            })?;
        if let Some(job) = &updated {
            if job.enabled {
                self.arm(job);
            } else {
                self.inner.queue.disarm(&job.id);
            }
        }
        Ok(updated)
    }

    pub fn delete_job(&self, id: &str) -> Result<bool> {
        let removed = self
            .inner
            .db
            .update_record(JOBS_RECORD, |jobs: &mut Vec<ScheduledJob>| {
                let before = jobs.len();
                jobs.retain(|j| j.id != id);
                Ok(jobs.len() != before)
            })?;
        self.inner.queue.disarm(&id.to_string());
        Ok(removed)
    }

    /// Arm `job` if it is due within the horizon.
    fn arm(&self, job: &ScheduledJob) -> bool {
        let delay = delay_until(job.next_run, Utc::now());
        let armed = self.inner.queue.arm(job.id.clone(), delay);
        if !armed {
            debug!(job_id = %job.id, "next run {} is beyond the arming horizon", job.next_run);
        }
        armed
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner.running.contains(&id.to_string())
    }

    /// Arm every enabled job that is neither armed nor running and now fits
    /// the horizon. A running job re-arms itself when it finishes.
    fn rederive(&self) {
        let jobs = match self.jobs() {
            Ok(j) => j,
            Err(e) => {
                warn!("could not reload jobs: {e:#}");
                return;
            }
        };
        let now = Utc::now();
        for job in jobs
            .iter()
            .filter(|j| j.enabled && !self.is_armed(&j.id) && !self.is_running(&j.id))
        {
            if job.next_run <= now {
                self.inner
                    .queue
                    .arm(job.id.clone(), self.inner.settings.missed_job_grace);
            } else {
                self.arm(job);
            }
        }
    }

    /// Run one job, then record the result and schedule the next run
    /// whatever the executor reported. A job already running is skipped.
    pub async fn fire(&self, id: &str) {
        let Some(_running) = self.inner.running.claim(id.to_string()) else {
            debug!(job_id = %id, "job already running, skipping");
            return;
        };
        let job = match self.job(id) {
            Ok(Some(job)) if job.enabled => job,
            Ok(_) => return,
            Err(e) => {
                error!(job_id = %id, "could not load job: {e:#}");
                return;
            }
        };

        info!(job_id = %job.id, repo = %job.repo_path, "running scheduled job");
        self.emit(SchedulerEvent::JobStarted {
            job_id: job.id.clone(),
            repo_path: job.repo_path.clone(),
        });

        let outcome = self.inner.executor.execute(&job).await;
        let now = Utc::now();

        let result = JobResult {
            job_id: job.id.clone(),
            success: outcome.success,
            timestamp: now,
            updated_packages: outcome.updated_packages.clone(),
            error: outcome.error.clone(),
        };
        if let Err(e) = self
            .inner
            .db
            .append_job_result(&result, self.inner.settings.job_result_retention)
        {
            error!(job_id = %job.id, "could not record job result: {e:#}");
        }

        let base = now.max(job.next_run);
        let next_run = self.next_run(job.frequency, base);
        let stored = self
            .inner
            .db
            .update_record(JOBS_RECORD, |jobs: &mut Vec<ScheduledJob>| {
                let Some(j) = jobs.iter_mut().find(|j| j.id == job.id) else {
                    return Ok(None);
                };
                j.last_run = Some(now);
                j.next_run = next_run;
                Ok(Some(j.clone()))
            });

        match stored {
            Ok(Some(j)) => {
                if j.enabled {
                    self.arm(&j);
                }
            }
            Ok(None) => debug!(job_id = %job.id, "job deleted while running"),
            Err(e) => error!(job_id = %job.id, "could not persist next run: {e:#}"),
        }

        if outcome.success {
            info!(job_id = %job.id, "job finished, {} package(s) updated", outcome.updated_packages.len());
        } else {
            warn!(job_id = %job.id, "job failed: {}", outcome.error.as_deref().unwrap_or("unknown error"));
        }
        self.emit(SchedulerEvent::JobFinished {
            job_id: job.id,
            success: outcome.success,
            next_run,
        });
    }
}

fn on_wake<Tz: ScheduleZone>(inner: &Weak<Inner<Tz>>, wake: Wake<String>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let scheduler = Scheduler { inner };
    match wake {
        Wake::Due(id) => {
            tokio::spawn(async move { scheduler.fire(&id).await });
        }
        Wake::Horizon => scheduler.rederive(),
    }
}
