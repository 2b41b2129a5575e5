//! External process execution with timeout and output caps.
//!
//! Every package-manager, git and `gh` invocation goes through here. A call
//! never returns `Err`: spawn failures and timeouts are classified in
//! [`ExitKind`] so callers can surface them as step failures.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]";
/// How long to wait for pipe readers after the child was killed. Grandchildren
/// of `sh -c` may keep the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Failed(i32),
    TimedOut,
    SpawnFailed,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub kind: ExitKind,
    pub elapsed: Duration,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.kind == ExitKind::Success
    }

    pub fn timed_out(&self) -> bool {
        self.kind == ExitKind::TimedOut
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// One-line description used in step failure messages.
    pub fn describe(&self) -> String {
        match self.kind {
            ExitKind::Success => "succeeded".into(),
            ExitKind::Failed(code) => format!("exited with code {code}"),
            ExitKind::TimedOut => format!("timed out after {}s", self.elapsed.as_secs()),
            ExitKind::SpawnFailed => format!("could not be started: {}", self.stderr.trim()),
        }
    }

    fn spawn_failed(message: String, started: Instant) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit_code: -1,
            kind: ExitKind::SpawnFailed,
            elapsed: started.elapsed(),
        }
    }
}

/// Timeout and buffer limits for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Limits {
    pub fn secs(timeout_s: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_s),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

pub async fn run(dir: &Path, program: &str, args: &[&str], limits: Limits) -> ExecResult {
    run_env(dir, program, args, &[], limits).await
}

pub async fn run_env(
    dir: &Path,
    program: &str,
    args: &[&str],
    env: &[(&str, &str)],
    limits: Limits,
) -> ExecResult {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir);
    for (k, v) in env {
        cmd.env(k, v);
    }
    let label = format!("{program} {}", args.join(" "));
    execute(cmd, &label, limits).await
}

/// Run `cmd` through `sh -c` in `dir`. Used for ecosystem command strings
/// such as `rm -rf node_modules && npm install`.
pub async fn run_shell(dir: &Path, cmd: &str, limits: Limits) -> ExecResult {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };
    command.current_dir(dir);
    execute(command, cmd, limits).await
}

/// True when `program` can be spawned at all (`<program> --version` exits 0).
pub async fn is_installed(program: &str, limits: Limits) -> bool {
    let cwd = std::env::temp_dir();
    run(&cwd, program, &["--version"], limits).await.success()
}

async fn execute(mut cmd: Command, label: &str, limits: Limits) -> ExecResult {
    let started = Instant::now();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = %label, "spawning process");

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(command = %label, "spawn failed: {e}");
            return ExecResult::spawn_failed(format!("failed to spawn {label}: {e}"), started);
        }
    };

    let cap = limits.max_output_bytes;
    let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_capped(s, cap)));
    let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_capped(s, cap)));

    let (kind, exit_code) = match tokio::time::timeout(limits.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let code = status.code().unwrap_or(-1);
            if status.success() {
                (ExitKind::Success, code)
            } else {
                (ExitKind::Failed(code), code)
            }
        }
        Ok(Err(e)) => {
            warn!(command = %label, "wait failed: {e}");
            (ExitKind::Failed(-1), -1)
        }
        Err(_) => {
            warn!(command = %label, timeout_s = limits.timeout.as_secs(), "process timed out, killing");
            let _ = child.kill().await;
            (ExitKind::TimedOut, -1)
        }
    };

    let drain = if kind == ExitKind::TimedOut {
        DRAIN_GRACE
    } else {
        limits.timeout.max(DRAIN_GRACE)
    };
    let stdout = collect(stdout_task, drain).await;
    let stderr = collect(stderr_task, drain).await;

    debug!(command = %label, exit_code, elapsed_ms = started.elapsed().as_millis() as u64, "process finished");

    ExecResult {
        stdout,
        stderr,
        exit_code,
        kind,
        elapsed: started.elapsed(),
    }
}

async fn collect(task: Option<tokio::task::JoinHandle<String>>, wait: Duration) -> String {
    let Some(handle) = task else {
        return String::new();
    };
    let abort = handle.abort_handle();
    match tokio::time::timeout(wait, handle).await {
        Ok(Ok(s)) => s,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

/// Read a stream to EOF, keeping at most `cap` bytes. The stream is always
/// drained so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> String {
    let mut kept: Vec<u8> = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if room >= n {
                    kept.extend_from_slice(&buf[..n]);
                } else {
                    kept.extend_from_slice(&buf[..room]);
                    truncated = true;
                }
            }
        }
    }
    let mut out = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        out.push_str(TRUNCATION_MARKER);
    }
    out
}
