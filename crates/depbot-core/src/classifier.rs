//! Decides whether a test command's output means the suite passed.

use std::sync::LazyLock;

use regex::Regex;

use crate::exec::{ExecResult, ExitKind};

/// Non-zero counts of failures or errors, or an explicit FAIL marker.
static FAILURE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i:\b[1-9]\d*\s+(failed|failing|failures?|errors?)\b)|\bFAIL(ED)?\b").expect("invalid regex")
});

/// A non-zero count of tests run or passed.
static COUNT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i:\b[1-9]\d*\s+(passing|passed|tests?|examples?|runs?|specs?)\b)").expect("invalid regex")
});

/// A run that collected nothing (`Ran 0 tests`, `0 passing`).
static EMPTY_RUN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i:\b0\s+(passing|passed|tests?|examples?|runs?|specs?)\b)").expect("invalid regex")
});

/// Explicit PASS/OK marker.
static MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bPASS(ED)?\b|\bOK\b").expect("invalid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestVerdict {
    pub passed: bool,
    pub summary: String,
}

impl TestVerdict {
    fn pass(summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            summary: summary.into(),
        }
    }

    fn fail(summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
        }
    }
}

/// Strategy for reading a test run. Ecosystems with machine-readable runner
/// output can supply a stricter implementation.
pub trait TestResultClassifier: Send + Sync {
    fn classify(&self, result: &ExecResult) -> TestVerdict;
}

/// Pattern match on common runner summaries (mocha, jest, pytest, rspec,
/// minitest, ExUnit). Requires exit 0, a positive signal and no failure signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

impl TestResultClassifier for HeuristicClassifier {
    fn classify(&self, result: &ExecResult) -> TestVerdict {
        match result.kind {
            ExitKind::TimedOut => return TestVerdict::fail(format!("test command {}", result.describe())),
            ExitKind::SpawnFailed => return TestVerdict::fail(format!("test command {}", result.describe())),
            ExitKind::Failed(code) => return TestVerdict::fail(format!("tests failed (exit code {code})")),
            ExitKind::Success => {}
        }

        let output = result.combined_output();
        if let Some(m) = FAILURE_REGEX.find(&output) {
            return TestVerdict::fail(format!("failure reported in output: {}", m.as_str()));
        }
        if let Some(m) = COUNT_REGEX.find(&output) {
            return TestVerdict::pass(format!("tests passed ({})", m.as_str()));
        }
        if let Some(m) = EMPTY_RUN_REGEX.find(&output) {
            return TestVerdict::fail(format!("no tests ran ({})", m.as_str()));
        }
        match MARKER_REGEX.find(&output) {
            Some(m) => TestVerdict::pass(format!("tests passed ({})", m.as_str())),
            None => TestVerdict::fail("no test results detected in output"),
        }
    }
}
