use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub use crate::types::PipelineEvent;

use crate::{
    config::PipelineSettings,
    ecosystem::{moved_packages, Ecosystem, EcosystemRegistry, FALLBACK_COMMIT_FILES},
    error::PipelineError,
    exec,
    git::Git,
    pr_host::{PrHost, PrReadiness, PrRequest},
    repo_lock::{RepoGuard, RepoLocks},
    types::{
        EcosystemKind, NonBreakingRequest, OutdatedPackage, PackageFailure, PackageFix, PipelineResult, PipelineStep,
        SecurityPatchResult, SecurityRequest, UpdateRequest, Vulnerability,
    },
    workspace::{Workspace, WorkspaceManager},
};

type Adapter = Arc<dyn Ecosystem>;

pub struct Pipeline {
    registry: EcosystemRegistry,
    pr_host: Arc<dyn PrHost>,
    workspaces: WorkspaceManager,
    settings: PipelineSettings,
    locks: RepoLocks,
    pub event_tx: broadcast::Sender<PipelineEvent>,
}

/// Targets of one ecosystem within a selective update.
struct Lane {
    adapter: Adapter,
    names: Vec<String>,
}

/// Flags shared by every variant.
struct Flags {
    run_tests: bool,
    create_pr: bool,
    test_timeout_s: Option<u64>,
    pr_title: Option<String>,
    pr_body: Option<String>,
}

impl Flags {
    /// Preparing, Updating, Installing, Committing and Done, plus the
    /// optional Testing/Linting and Pushing/CreatingPR pairs.
    fn total_steps(&self) -> usize {
        5 + if self.run_tests { 2 } else { 0 } + if self.create_pr { 2 } else { 0 }
    }
}

/// Mutable outcome of a run, filled in as steps complete.
#[derive(Default)]
struct Progress {
    updated: Vec<String>,
    failed: Vec<String>,
    tests_passed: Option<bool>,
    committed: bool,
    pr_url: Option<String>,
}

/// Step counter, log and event emission for one run.
struct Run {
    tx: broadcast::Sender<PipelineEvent>,
    branch: String,
    step: usize,
    total: usize,
    log: Vec<String>,
}

impl Run {
    fn progress(&mut self, step: PipelineStep, message: impl Into<String>) {
        let message = message.into();
        self.step = (self.step + 1).min(self.total);
        if step == PipelineStep::Done {
            self.step = self.total;
        }
        info!(branch = %self.branch, step = %step, "{message}");
        self.log.push(format!("[{}/{}] {message}", self.step, self.total));
        let _ = self.tx.send(PipelineEvent::Progress {
            branch: self.branch.clone(),
            message,
            step: self.step,
            total: self.total,
        });
    }

    fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.log.push(line.clone());
        let _ = self.tx.send(PipelineEvent::Log {
            branch: self.branch.clone(),
            line,
        });
    }

    fn warn(&mut self, message: impl Into<String>, output: impl Into<String>) {
        let message = message.into();
        let output = output.into();
        warn!(branch = %self.branch, "{message}");
        self.log.push(format!("warning: {message}"));
        let _ = self.tx.send(PipelineEvent::Warning {
            branch: self.branch.clone(),
            message,
            output,
        });
    }

    fn record_error(&mut self, err: &PipelineError) {
        error!(branch = %self.branch, "run failed: {err}");
        self.log(format!("error: {err}"));
        let output = err.output().trim();
        if !output.is_empty() {
            self.log(output.to_string());
        }
    }
}

impl Pipeline {
    pub fn new(
        registry: EcosystemRegistry,
        pr_host: Arc<dyn PrHost>,
        settings: PipelineSettings,
    ) -> (Self, broadcast::Receiver<PipelineEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let workspaces = WorkspaceManager::new(
            settings.worktree_root.clone(),
            settings.branch_prefix.clone(),
            settings.probe_limits(),
        );
        let p = Self {
            registry,
            pr_host,
            workspaces,
            settings,
            locks: RepoLocks::new(),
            event_tx: tx,
        };
        (p, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    pub fn registry(&self) -> &EcosystemRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn is_busy(&self, repo: &Path) -> bool {
        self.locks.is_busy(repo)
    }

    fn git(&self, repo: &Path) -> Git {
        Git::new(repo).with_limits(self.settings.probe_limits(), self.settings.push_limits())
    }

    fn start_run(&self, total: usize) -> Run {
        Run {
            tx: self.event_tx.clone(),
            branch: String::new(),
            step: 0,
            total,
            log: Vec::new(),
        }
    }

    // ── Variants ──────────────────────────────────────────────────────────

    /// Update the selected packages on a fresh branch, verify, commit and
    /// optionally publish.
    pub async fn run_update(&self, repo: &Path, req: UpdateRequest) -> PipelineResult {
        let flags = Flags {
            run_tests: req.run_tests,
            create_pr: req.create_pr,
            test_timeout_s: req.test_timeout_s,
            pr_title: req.pr_title.clone(),
            pr_body: req.pr_body.clone(),
        };
        let mut run = self.start_run(flags.total_steps());

        let lanes = match self.update_lanes(&req) {
            Ok(l) => l,
            Err(e) => return rejected(run, e),
        };
        let adapters: Vec<Adapter> = lanes.iter().map(|l| Arc::clone(&l.adapter)).collect();
        let _guard = match self.admit(repo, &adapters, &flags, false).await {
            Ok(g) => g,
            Err(e) => return rejected(run, e),
        };
        let ws = match self.prepare(repo, req.branch_name.as_deref(), &mut run).await {
            Ok(ws) => ws,
            Err(e) => return rejected(run, e),
        };

        let mut st = Progress::default();
        let outcome = self.update_steps(&ws, &lanes, &req, &flags, &mut run, &mut st).await;
        self.finish(&ws, outcome, run, st).await
    }

    /// Apply every in-range (patch/minor) update of the detected ecosystems.
    pub async fn run_non_breaking(&self, repo: &Path, req: NonBreakingRequest) -> PipelineResult {
        let flags = Flags {
            run_tests: req.run_tests,
            create_pr: req.create_pr,
            test_timeout_s: req.test_timeout_s,
            pr_title: None,
            pr_body: None,
        };
        let mut run = self.start_run(flags.total_steps());

        let adapters = match self.ecosystem_adapters(repo, req.ecosystem) {
            Ok(a) => a,
            Err(e) => return rejected(run, e),
        };
        let _guard = match self.admit(repo, &adapters, &flags, false).await {
            Ok(g) => g,
            Err(e) => return rejected(run, e),
        };
        let ws = match self.prepare(repo, req.branch_name.as_deref(), &mut run).await {
            Ok(ws) => ws,
            Err(e) => return rejected(run, e),
        };

        let mut st = Progress::default();
        let outcome = self.non_breaking_steps(&ws, &adapters, &flags, &mut run, &mut st).await;
        self.finish(&ws, outcome, run, st).await
    }

    /// Patch vulnerable packages one at a time. Each success is its own
    /// commit; a failing package is rolled back and reported without
    /// blocking the others.
    pub async fn run_security_patch(
        &self,
        repo: &Path,
        vulnerabilities: Vec<Vulnerability>,
        req: SecurityRequest,
    ) -> SecurityPatchResult {
        let flags = Flags {
            run_tests: req.run_tests,
            create_pr: req.create_pr,
            test_timeout_s: req.test_timeout_s,
            pr_title: None,
            pr_body: None,
        };
        // Preparing, Updating, Done and the optional publish pair.
        let total = 3 + if flags.create_pr { 2 } else { 0 };
        let mut run = self.start_run(total);

        let (patchable, skipped) = split_patchable(vulnerabilities, req.ecosystem);
        let mut result = SecurityPatchResult {
            skipped,
            ..Default::default()
        };

        let prepared = self.security_preconditions(repo, &patchable, &flags, req.open_issues).await;
        let (adapters, _guard) = match prepared {
            Ok(p) => p,
            Err(e) => {
                run.record_error(&e);
                result.error = Some(e.to_string());
                result.log = run.log;
                return result;
            }
        };
        let ws = match self.prepare(repo, req.branch_name.as_deref(), &mut run).await {
            Ok(ws) => ws,
            Err(e) => {
                run.record_error(&e);
                result.error = Some(e.to_string());
                result.branch = run.branch.clone();
                result.log = run.log;
                return result;
            }
        };

        run.progress(
            PipelineStep::Updating,
            format!("Patching {} vulnerable package(s)", patchable.len()),
        );
        let git = self.git(repo);
        for vuln in &patchable {
            let Some(adapter) = adapters.get(&vuln.ecosystem) else {
                continue;
            };
            let Some(fix) = vuln.fix_version.as_deref() else {
                continue;
            };
            run.log(format!("patching {} to {fix} ({:?})", vuln.package, vuln.severity));

            let attempt = match self.patch_one(&ws, adapter, vuln, fix, &flags, &mut run).await {
                Ok(()) => {
                    let files = commit_file_list(&ws.path, std::slice::from_ref(adapter));
                    let message = security_commit_message(vuln, fix);
                    match git.commit_files(&ws.path, &files, &message, self.author()).await {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(("install changed no dependency files".to_string(), String::new())),
                        Err(e) => Err(("git commit failed".to_string(), format!("{e:#}"))),
                    }
                }
                Err(failure) => Err(failure),
            };

            match attempt {
                Ok(()) => {
                    result.committed = true;
                    run.log(format!("patched {} to {fix}", vuln.package));
                    result.fixed.push(PackageFix {
                        package: vuln.package.clone(),
                        version: fix.to_string(),
                        severity: vuln.severity,
                    });
                }
                Err((reason, output)) => {
                    run.warn(format!("could not patch {}: {reason}", vuln.package), output.clone());
                    self.roll_back_package(&ws, adapter, &flags, &mut run).await;
                    let issue_url = if req.open_issues {
                        self.open_follow_up(repo, vuln, fix, &reason, &output, &mut run).await
                    } else {
                        None
                    };
                    result.failed.push(PackageFailure {
                        package: vuln.package.clone(),
                        reason,
                        issue_url,
                    });
                }
            }
        }

        let outcome = if result.fixed.is_empty() {
            Err(PipelineError::step(
                PipelineStep::Updating,
                "no vulnerable packages could be patched",
                "",
            ))
        } else if flags.create_pr {
            let names: Vec<String> = result.fixed.iter().map(|f| f.package.clone()).collect();
            let title = format!("fix(deps): patch {} vulnerable package(s)", names.len());
            let body = security_pr_body(&result.fixed, &result.failed);
            let mut st = Progress {
                updated: names,
                committed: true,
                ..Default::default()
            };
            let published = self.publish(&ws, title, body, &mut run, &mut st).await;
            result.pr_url = st.pr_url;
            published
        } else {
            Ok(())
        };

        self.close(&ws, result.committed, &mut run).await;
        if let Err(e) = &outcome {
            run.record_error(e);
        }
        result.success = outcome.is_ok();
        result.error = outcome.err().map(|e| e.to_string());
        result.branch = ws.branch.clone();
        result.log = run.log;
        result
    }

    // ── Preconditions ─────────────────────────────────────────────────────

    fn update_lanes(&self, req: &UpdateRequest) -> Result<Vec<Lane>, PipelineError> {
        if req.targets.is_empty() {
            return Err(PipelineError::Precondition("no packages selected".into()));
        }
        let mut grouped: BTreeMap<EcosystemKind, Vec<String>> = BTreeMap::new();
        for t in &req.targets {
            let names = grouped.entry(t.ecosystem).or_default();
            if !names.contains(&t.name) {
                names.push(t.name.clone());
            }
        }
        grouped
            .into_iter()
            .map(|(kind, names)| {
                self.registry
                    .get(kind)
                    .map(|adapter| Lane { adapter, names })
                    .ok_or_else(|| PipelineError::Precondition(format!("no {kind} package manager adapter")))
            })
            .collect()
    }

    fn ecosystem_adapters(&self, repo: &Path, only: Option<EcosystemKind>) -> Result<Vec<Adapter>, PipelineError> {
        let adapters = match only {
            Some(kind) => self.registry.get(kind).into_iter().collect(),
            None => self.registry.detect(repo),
        };
        if adapters.is_empty() {
            return Err(PipelineError::Precondition(format!(
                "no supported package manifest found in {}",
                repo.display()
            )));
        }
        Ok(adapters)
    }

    /// Everything checked before the first mutation. The returned guard
    /// keeps other runs off this repository.
    async fn admit(
        &self,
        repo: &Path,
        adapters: &[Adapter],
        flags: &Flags,
        needs_issues: bool,
    ) -> Result<RepoGuard, PipelineError> {
        let guard = self.locks.try_acquire(repo)?;

        if !repo.join(".git").exists() || !self.git(repo).is_repo().await {
            return Err(PipelineError::Precondition(format!(
                "{} is not a git repository",
                repo.display()
            )));
        }
        for a in adapters {
            if !a.manifest_present(repo) {
                return Err(PipelineError::Precondition(format!(
                    "no {} manifest ({}) in {}",
                    a.kind(),
                    a.kind().manifests().join(", "),
                    repo.display()
                )));
            }
        }
        if flags.run_tests {
            for a in adapters {
                if a.test_command(repo).is_none() {
                    return Err(PipelineError::Precondition(format!(
                        "tests requested but no {} test command could be resolved",
                        a.kind()
                    )));
                }
            }
        }
        if flags.create_pr || needs_issues {
            match self.pr_host.readiness(repo).await {
                PrReadiness::Ready => {}
                PrReadiness::NotInstalled => return Err(PipelineError::PrCliMissing),
                PrReadiness::NotAuthenticated => return Err(PipelineError::PrCliUnauthenticated),
            }
        }
        Ok(guard)
    }

    async fn security_preconditions(
        &self,
        repo: &Path,
        patchable: &[Vulnerability],
        flags: &Flags,
        open_issues: bool,
    ) -> Result<(BTreeMap<EcosystemKind, Adapter>, RepoGuard), PipelineError> {
        if patchable.is_empty() {
            return Err(PipelineError::Precondition(
                "no vulnerabilities with a non-major fix version".into(),
            ));
        }
        let mut adapters = BTreeMap::new();
        for v in patchable {
            let adapter = self.registry.get(v.ecosystem).ok_or_else(|| {
                PipelineError::Precondition(format!("no {} package manager adapter", v.ecosystem))
            })?;
            adapters.insert(v.ecosystem, adapter);
        }
        let list: Vec<Adapter> = adapters.values().cloned().collect();
        let guard = self.admit(repo, &list, flags, open_issues).await?;
        Ok((adapters, guard))
    }

    // ── Steps ─────────────────────────────────────────────────────────────

    /// Pick the branch, warn about likely merge conflicts and create the
    /// workspace. The source checkout is not touched after this.
    async fn prepare(&self, repo: &Path, branch: Option<&str>, run: &mut Run) -> Result<Workspace, PipelineError> {
        run.branch = self.workspaces.resolve_branch(repo, branch).await;
        run.progress(PipelineStep::Preparing, format!("Preparing workspace on {}", run.branch));

        let git = self.git(repo);
        if git.has_remote("origin").await {
            let prediction = git
                .predict_merge_conflicts(self.settings.conflict_threshold, self.settings.conflict_high_threshold)
                .await;
            match prediction {
                Ok(p) => {
                    if let Some(w) = p.warning() {
                        run.warn(w, p.conflicting_files.join("\n"));
                    }
                }
                Err(e) => run.log(format!("merge-conflict prediction skipped: {e:#}")),
            }
        }

        self.workspaces
            .create(repo, &run.branch)
            .await
            .map_err(|e| PipelineError::step(PipelineStep::Preparing, "could not create workspace", format!("{e:#}")))
    }

    async fn update_steps(
        &self,
        ws: &Workspace,
        lanes: &[Lane],
        req: &UpdateRequest,
        flags: &Flags,
        run: &mut Run,
        st: &mut Progress,
    ) -> Result<(), PipelineError> {
        let count: usize = lanes.iter().map(|l| l.names.len()).sum();
        run.progress(PipelineStep::Updating, format!("Updating {count} package(s)"));

        let mut active = Vec::new();
        for lane in lanes {
            match lane.adapter.update(&ws.path, &lane.names, req.update_strategy).await {
                Ok(outcome) => {
                    for name in &outcome.updated {
                        run.log(format!("updated {name}"));
                    }
                    for name in &outcome.failed {
                        run.log(format!("could not update {name}"));
                    }
                    if !outcome.updated.is_empty() {
                        active.push(Arc::clone(&lane.adapter));
                    }
                    st.updated.extend(outcome.updated);
                    st.failed.extend(outcome.failed);
                }
                Err(e) => {
                    run.warn(format!("{} update failed", lane.adapter.kind()), format!("{e:#}"));
                    st.failed.extend(lane.names.iter().cloned());
                }
            }
        }
        if st.updated.is_empty() {
            return Err(PipelineError::step(PipelineStep::Updating, "no packages were updated", ""));
        }

        self.install(ws, &active, run).await?;
        let title = flags
            .pr_title
            .clone()
            .unwrap_or_else(|| default_pr_title(&st.updated));
        self.verify_and_commit(ws, &active, flags, title, run, st).await
    }

    async fn non_breaking_steps(
        &self,
        ws: &Workspace,
        adapters: &[Adapter],
        flags: &Flags,
        run: &mut Run,
        st: &mut Progress,
    ) -> Result<(), PipelineError> {
        run.progress(PipelineStep::Updating, "Applying non-breaking updates");

        let mut snapshots: Vec<(Adapter, Vec<OutdatedPackage>)> = Vec::new();
        for a in adapters {
            let outdated = a.list_outdated(&ws.path).await.map_err(|e| {
                PipelineError::step(
                    PipelineStep::Updating,
                    format!("listing outdated {} packages failed", a.kind()),
                    format!("{e:#}"),
                )
            })?;
            let snapshot: Vec<OutdatedPackage> = outdated.into_iter().filter(|p| p.is_non_breaking).collect();
            if snapshot.is_empty() {
                run.log(format!("{}: no non-breaking updates", a.kind()));
                continue;
            }

            match a.non_breaking_update_command(&ws.path) {
                Some(cmd) => {
                    run.log(format!("$ {cmd}"));
                    let result = exec::run_shell(&ws.path, &cmd, self.settings.install_limits()).await;
                    if !result.success() {
                        return Err(PipelineError::step(
                            PipelineStep::Updating,
                            format!("`{cmd}` {}", result.describe()),
                            result.combined_output(),
                        ));
                    }
                }
                None => {
                    for p in &snapshot {
                        run.log(format!("installing {}@{}", p.name, p.latest));
                        if let Err(e) = a.install_version(&ws.path, &p.name, &p.latest).await {
                            run.warn(format!("{} install failed", p.name), format!("{e:#}"));
                        }
                    }
                }
            }
            snapshots.push((Arc::clone(a), snapshot));
        }
        if snapshots.is_empty() {
            return Err(PipelineError::step(
                PipelineStep::Updating,
                "no non-breaking updates available",
                "",
            ));
        }

        let active: Vec<Adapter> = snapshots.iter().map(|(a, _)| Arc::clone(a)).collect();
        self.install(ws, &active, run).await?;

        for (a, snapshot) in &snapshots {
            let after = a.list_outdated(&ws.path).await.map_err(|e| {
                PipelineError::step(
                    PipelineStep::Installing,
                    format!("re-listing outdated {} packages failed", a.kind()),
                    format!("{e:#}"),
                )
            })?;
            let moved = moved_packages(snapshot, &after);
            for p in snapshot {
                if moved.contains(&p.name) {
                    run.log(format!("updated {} ({} -> {})", p.name, p.current, p.wanted));
                } else {
                    st.failed.push(p.name.clone());
                }
            }
            st.updated.extend(moved);
        }
        if st.updated.is_empty() {
            return Err(PipelineError::step(PipelineStep::Updating, "no packages were updated", ""));
        }

        let title = format!("chore(deps): non-breaking updates ({} package(s))", st.updated.len());
        self.verify_and_commit(ws, &active, flags, title, run, st).await
    }

    async fn install(&self, ws: &Workspace, adapters: &[Adapter], run: &mut Run) -> Result<(), PipelineError> {
        run.progress(PipelineStep::Installing, "Running clean install");
        for a in adapters {
            let cmd = a.clean_install_command(&ws.path);
            run.log(format!("$ {cmd}"));
            let result = exec::run_shell(&ws.path, &cmd, self.settings.install_limits()).await;
            if !result.success() {
                return Err(PipelineError::step(
                    PipelineStep::Installing,
                    format!("`{cmd}` {}", result.describe()),
                    result.combined_output(),
                ));
            }
        }
        Ok(())
    }

    /// Testing, Linting, Committing and the optional publish steps.
    async fn verify_and_commit(
        &self,
        ws: &Workspace,
        adapters: &[Adapter],
        flags: &Flags,
        pr_title: String,
        run: &mut Run,
        st: &mut Progress,
    ) -> Result<(), PipelineError> {
        if flags.run_tests {
            run.progress(PipelineStep::Testing, "Running tests");
            for a in adapters {
                let Some(cmd) = a.test_command(&ws.path) else {
                    st.tests_passed = Some(false);
                    return Err(PipelineError::step(
                        PipelineStep::Testing,
                        format!("no {} test command", a.kind()),
                        "",
                    ));
                };
                run.log(format!("$ {cmd}"));
                let result = exec::run_shell(&ws.path, &cmd, self.settings.test_limits(flags.test_timeout_s)).await;
                let verdict = a.result_classifier().classify(&result);
                run.log(verdict.summary.clone());
                if !verdict.passed {
                    st.tests_passed = Some(false);
                    return Err(PipelineError::step(
                        PipelineStep::Testing,
                        verdict.summary,
                        result.combined_output(),
                    ));
                }
            }
            st.tests_passed = Some(true);

            run.progress(PipelineStep::Linting, "Running linters");
            for a in adapters {
                let Some(cmd) = a.lint_command(&ws.path) else {
                    continue;
                };
                run.log(format!("$ {cmd}"));
                let result = exec::run_shell(&ws.path, &cmd, self.settings.lint_limits()).await;
                if result.success() {
                    run.log("lint passed");
                } else {
                    run.warn(format!("lint failed: `{cmd}` {}", result.describe()), result.combined_output());
                }
            }
        }

        run.progress(PipelineStep::Committing, "Committing dependency changes");
        let files = commit_file_list(&ws.path, adapters);
        let message = commit_message(&st.updated);
        let committed = self
            .git(&ws.repo_path)
            .commit_files(&ws.path, &files, &message, self.author())
            .await
            .map_err(|e| PipelineError::step(PipelineStep::Committing, "git commit failed", format!("{e:#}")))?;
        if !committed {
            return Err(PipelineError::step(
                PipelineStep::Committing,
                "no dependency files changed",
                "",
            ));
        }
        st.committed = true;
        run.log(format!("committed on {}", ws.branch));

        if flags.create_pr {
            let body = flags
                .pr_body
                .clone()
                .unwrap_or_else(|| default_pr_body(&st.updated, &st.failed, st.tests_passed));
            self.publish(ws, pr_title, body, run, st).await?;
        }
        Ok(())
    }

    async fn publish(
        &self,
        ws: &Workspace,
        title: String,
        body: String,
        run: &mut Run,
        st: &mut Progress,
    ) -> Result<(), PipelineError> {
        let git = self.git(&ws.repo_path);
        run.progress(PipelineStep::Pushing, format!("Pushing {}", ws.branch));
        git.push_branch(&ws.path, &ws.branch)
            .await
            .map_err(|e| PipelineError::step(PipelineStep::Pushing, "git push failed", format!("{e:#}")))?;

        run.progress(PipelineStep::CreatingPr, "Creating pull request");
        let req = PrRequest {
            title,
            body,
            head: ws.branch.clone(),
            base: git.default_branch().await.ok(),
        };
        let url = self
            .pr_host
            .create_pr(&ws.path, &req)
            .await
            .map_err(|e| PipelineError::step(PipelineStep::CreatingPr, "pull request creation failed", format!("{e:#}")))?;
        run.log(format!("pull request: {url}"));
        st.pr_url = Some(url);
        Ok(())
    }

    async fn patch_one(
        &self,
        ws: &Workspace,
        adapter: &Adapter,
        vuln: &Vulnerability,
        fix: &str,
        flags: &Flags,
        run: &mut Run,
    ) -> Result<(), (String, String)> {
        adapter
            .install_version(&ws.path, &vuln.package, fix)
            .await
            .map_err(|e| ("install failed".to_string(), format!("{e:#}")))?;
        if !flags.run_tests {
            return Ok(());
        }
        let Some(cmd) = adapter.test_command(&ws.path) else {
            return Err(("no test command".to_string(), String::new()));
        };
        run.log(format!("$ {cmd}"));
        let result = exec::run_shell(&ws.path, &cmd, self.settings.test_limits(flags.test_timeout_s)).await;
        let verdict = adapter.result_classifier().classify(&result);
        run.log(verdict.summary.clone());
        if verdict.passed {
            Ok(())
        } else {
            Err((verdict.summary, result.combined_output()))
        }
    }

    /// Undo one package's uncommitted changes so the next package starts
    /// from the last good commit.
    async fn roll_back_package(&self, ws: &Workspace, adapter: &Adapter, flags: &Flags, run: &mut Run) {
        if let Err(e) = self.git(&ws.repo_path).discard_changes(&ws.path).await {
            run.warn("could not discard changes", format!("{e:#}"));
        }
        if flags.run_tests {
            let cmd = adapter.clean_install_command(&ws.path);
            let result = exec::run_shell(&ws.path, &cmd, self.settings.install_limits()).await;
            if !result.success() {
                run.warn(format!("reinstall after rollback failed: {}", result.describe()), result.combined_output());
            }
        }
    }

    async fn open_follow_up(
        &self,
        repo: &Path,
        vuln: &Vulnerability,
        fix: &str,
        reason: &str,
        output: &str,
        run: &mut Run,
    ) -> Option<String> {
        let title = format!("Security: could not patch {} to {fix}", vuln.package);
        let body = follow_up_body(vuln, fix, reason, output);
        match self.pr_host.create_issue(repo, &title, &body).await {
            Ok(url) => {
                run.log(format!("opened follow-up issue {url}"));
                Some(url)
            }
            Err(e) => {
                run.warn(format!("could not open follow-up issue for {}", vuln.package), format!("{e:#}"));
                None
            }
        }
    }

    // ── Finish ────────────────────────────────────────────────────────────

    /// Remove the workspace and emit Done. The branch survives only if a
    /// commit was made on it.
    async fn close(&self, ws: &Workspace, committed: bool, run: &mut Run) {
        if let Err(e) = self.workspaces.cleanup(ws, !committed).await {
            run.warn("workspace cleanup failed", format!("{e:#}"));
        }
        let message = if committed {
            format!("Finished; branch {} kept", ws.branch)
        } else {
            "Finished; branch removed".to_string()
        };
        run.progress(PipelineStep::Done, message);
    }

    async fn finish(&self, ws: &Workspace, outcome: Result<(), PipelineError>, mut run: Run, st: Progress) -> PipelineResult {
        if let Err(e) = &outcome {
            run.record_error(e);
        }
        self.close(ws, st.committed, &mut run).await;
        PipelineResult {
            success: outcome.is_ok(),
            updated_packages: st.updated,
            failed_packages: st.failed,
            pr_url: st.pr_url,
            error: outcome.err().map(|e| e.to_string()),
            tests_passed: st.tests_passed,
            branch: ws.branch.clone(),
            committed: st.committed,
            log: run.log,
        }
    }

    fn author(&self) -> Option<(&str, &str)> {
        self.settings
            .git_author
            .as_ref()
            .map(|(n, e)| (n.as_str(), e.as_str()))
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn rejected(mut run: Run, err: PipelineError) -> PipelineResult {
    run.record_error(&err);
    PipelineResult {
        success: false,
        error: Some(err.to_string()),
        branch: run.branch.clone(),
        log: run.log,
        ..Default::default()
    }
}

/// Vulnerabilities with a non-major fix, most severe first, and a
/// description of everything else.
fn split_patchable(vulns: Vec<Vulnerability>, only: Option<EcosystemKind>) -> (Vec<Vulnerability>, Vec<String>) {
    let mut patchable = Vec::new();
    let mut skipped = Vec::new();
    for v in vulns {
        if only.is_some_and(|k| k != v.ecosystem) {
            continue;
        }
        match (&v.fix_version, v.fix_is_major) {
            (Some(_), false) => {
                if !patchable.iter().any(|p: &Vulnerability| p.package == v.package) {
                    patchable.push(v);
                }
            }
            (Some(fix), true) => skipped.push(format!("{} (fix {fix} is a major upgrade)", v.package)),
            (None, _) => skipped.push(format!("{} (no fix available)", v.package)),
        }
    }
    patchable.sort_by(|a, b| b.severity.cmp(&a.severity));
    (patchable, skipped)
}

fn commit_file_list(dir: &Path, adapters: &[Adapter]) -> Vec<String> {
    let mut files: BTreeSet<String> = adapters.iter().flat_map(|a| a.files_to_commit(dir)).collect();
    if files.is_empty() {
        files = FALLBACK_COMMIT_FILES.iter().map(|f| f.to_string()).collect();
    }
    files.into_iter().collect()
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        "package"
    } else {
        "packages"
    }
}

pub fn commit_message(updated: &[String]) -> String {
    let mut msg = format!("chore(deps): update {} {}\n\n", updated.len(), plural(updated.len()));
    for name in updated {
        let _ = writeln!(msg, "- {name}");
    }
    msg
}

fn security_commit_message(vuln: &Vulnerability, fix: &str) -> String {
    let mut msg = format!("fix(deps): patch {} to {fix}\n\nSeverity: {:?}", vuln.package, vuln.severity);
    if !vuln.title.is_empty() {
        let _ = write!(msg, "\nAdvisory: {}", vuln.title);
    }
    msg.push('\n');
    msg
}

fn default_pr_title(updated: &[String]) -> String {
    match updated {
        [one] => format!("chore(deps): update {one}"),
        _ => format!("chore(deps): update {} {}", updated.len(), plural(updated.len())),
    }
}

fn default_pr_body(updated: &[String], failed: &[String], tests_passed: Option<bool>) -> String {
    let mut body = String::from("Automated dependency update.\n\nUpdated packages:\n");
    for name in updated {
        let _ = writeln!(body, "- {name}");
    }
    if !failed.is_empty() {
        body.push_str("\nNot updated:\n");
        for name in failed {
            let _ = writeln!(body, "- {name}");
        }
    }
    let tests = match tests_passed {
        Some(true) => "passed",
        Some(false) => "failed",
        None => "not run",
    };
    let _ = write!(body, "\nTests: {tests}\n");
    body
}

fn security_pr_body(fixed: &[PackageFix], failed: &[PackageFailure]) -> String {
    let mut body = String::from("Automated security patch.\n\nPatched:\n");
    for f in fixed {
        let _ = writeln!(body, "- {} -> {} ({:?})", f.package, f.version, f.severity);
    }
    if !failed.is_empty() {
        body.push_str("\nNeeds manual follow-up:\n");
        for f in failed {
            let _ = writeln!(body, "- {}: {}", f.package, f.reason);
        }
    }
    body
}

fn follow_up_body(vuln: &Vulnerability, fix: &str, reason: &str, output: &str) -> String {
    let mut body = format!(
        "Automated patching of `{}` to `{fix}` failed.\n\nSeverity: {:?}\nReason: {reason}\n",
        vuln.package, vuln.severity
    );
    if !vuln.title.is_empty() {
        let _ = writeln!(body, "Advisory: {}", vuln.title);
    }
    let tail: Vec<&str> = output.lines().rev().take(40).collect();
    if !tail.is_empty() {
        body.push_str("\n```\n");
        for line in tail.into_iter().rev() {
            let _ = writeln!(body, "{line}");
        }
        body.push_str("```\n");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn vuln(name: &str, severity: Severity, fix: Option<&str>, major: bool) -> Vulnerability {
        Vulnerability {
            package: name.into(),
            ecosystem: EcosystemKind::Node,
            severity,
            fix_version: fix.map(str::to_string),
            fix_is_major: major,
            title: String::new(),
        }
    }

    #[test]
    fn step_totals_follow_flags() {
        let mut f = Flags {
            run_tests: false,
            create_pr: false,
            test_timeout_s: None,
            pr_title: None,
            pr_body: None,
        };
        assert_eq!(f.total_steps(), 5);
        f.run_tests = true;
        assert_eq!(f.total_steps(), 7);
        f.create_pr = true;
        assert_eq!(f.total_steps(), 9);
    }

    #[test]
    fn commit_message_lists_packages() {
        let msg = commit_message(&["lodash".into(), "express".into()]);
        assert_eq!(msg, "chore(deps): update 2 packages\n\n- lodash\n- express\n");
        assert!(commit_message(&["a".into()]).starts_with("chore(deps): update 1 package\n"));
    }

    #[test]
    fn splits_patchable_vulnerabilities() {
        let (patchable, skipped) = split_patchable(
            vec![
                vuln("a", Severity::Low, Some("1.0.1"), false),
                vuln("b", Severity::Critical, Some("2.0.0"), true),
                vuln("c", Severity::High, None, false),
                vuln("d", Severity::High, Some("3.1.0"), false),
                vuln("d", Severity::Moderate, Some("3.1.0"), false),
            ],
            None,
        );
        let names: Vec<&str> = patchable.iter().map(|v| v.package.as_str()).collect();
        assert_eq!(names, vec!["d", "a"]);
        assert_eq!(skipped.len(), 2);
        assert!(skipped[0].contains("major"));

        let (patchable, _) = split_patchable(vec![vuln("a", Severity::Low, Some("1.0.1"), false)], Some(EcosystemKind::Ruby));
        assert!(patchable.is_empty());
    }

    #[test]
    fn pr_body_reports_tests() {
        let body = default_pr_body(&["a".into()], &["b".into()], Some(true));
        assert!(body.contains("- a\n"));
        assert!(body.contains("Not updated:\n- b\n"));
        assert!(body.ends_with("Tests: passed\n"));
    }

    #[test]
    fn follow_up_body_keeps_output_tail() {
        let output: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let body = follow_up_body(&vuln("a", Severity::High, Some("1.0.1"), false), "1.0.1", "tests failed", &output);
        assert!(body.contains("line 99"));
        assert!(!body.contains("line 10\n"));
    }
}
