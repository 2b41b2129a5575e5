use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use depbot_core::{
    audit::AuditSource,
    ecosystem::EcosystemRegistry,
    pipeline::Pipeline,
    scheduler::JobExecutor,
    smart_scheduler::ScanExecutor,
    JobOutcome, NonBreakingRequest, ScheduledJob, SmartScanSchedule,
};
use tracing::{info, warn};

/// Scheduled jobs run the non-breaking pipeline with the job's flags.
pub(crate) struct PipelineJobExecutor {
    pub pipeline: Arc<Pipeline>,
}

#[async_trait]
impl JobExecutor for PipelineJobExecutor {
    async fn execute(&self, job: &ScheduledJob) -> JobOutcome {
        let req = NonBreakingRequest {
            create_pr: job.create_pr,
            run_tests: job.run_tests,
            ..Default::default()
        };
        let result = self.pipeline.run_non_breaking(Path::new(&job.repo_path), req).await;
        JobOutcome::from(&result)
    }
}

/// Quiet-hour scans are read-only: list outdated packages and audit
/// findings and report a summary.
pub(crate) struct OutdatedScanExecutor {
    pub registry: EcosystemRegistry,
    pub audits: Vec<Arc<dyn AuditSource>>,
}

#[async_trait]
impl ScanExecutor for OutdatedScanExecutor {
    async fn scan(&self, schedule: &SmartScanSchedule) -> JobOutcome {
        let dir = Path::new(&schedule.repo_path);
        let adapters = self.registry.detect(dir);
        if adapters.is_empty() {
            return JobOutcome {
                success: false,
                updated_packages: Vec::new(),
                error: Some(format!("no supported package manifest in {}", schedule.repo_path)),
            };
        }

        let mut errors = Vec::new();
        let mut outdated = Vec::new();
        for adapter in &adapters {
            match adapter.list_outdated(dir).await {
                Ok(pkgs) => outdated.extend(pkgs),
                Err(e) => errors.push(format!("{}: {e:#}", adapter.kind())),
            }
        }

        let mut vulnerable = 0;
        for audit in &self.audits {
            if !adapters.iter().any(|a| a.kind() == audit.ecosystem()) {
                continue;
            }
            match audit.audit(dir).await {
                Ok(v) => vulnerable += v.len(),
                Err(e) => errors.push(format!("{} audit: {e:#}", audit.ecosystem())),
            }
        }

        let non_breaking = outdated.iter().filter(|p| p.is_non_breaking).count();
        info!(
            repo = %schedule.repo_path,
            "scan: {} outdated ({non_breaking} non-breaking), {vulnerable} vulnerable",
            outdated.len()
        );
        if !errors.is_empty() {
            warn!(repo = %schedule.repo_path, "scan errors: {}", errors.join("; "));
        }

        JobOutcome {
            success: errors.is_empty(),
            updated_packages: Vec::new(),
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        }
    }
}
