use thiserror::Error;

use crate::types::PipelineStep;

/// Why a pipeline run stopped. Every variant ends up as the human-readable
/// `error` of a result; none of them escape to the host.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before any mutation.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("hosted PR CLI is not installed")]
    PrCliMissing,

    #[error("hosted PR CLI is not authenticated (run `gh auth login`)")]
    PrCliUnauthenticated,

    #[error("another run is already active for {0}")]
    RepoBusy(String),

    #[error("{step} failed: {message}")]
    Step {
        step: PipelineStep,
        message: String,
        output: String,
    },
}

impl PipelineError {
    pub fn step(step: PipelineStep, message: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Step {
            step,
            message: message.into(),
            output: output.into(),
        }
    }

    /// True for errors raised before the workspace existed.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, Self::Step { .. })
    }

    pub fn output(&self) -> &str {
        match self {
            Self::Step { output, .. } => output,
            _ => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        let e = PipelineError::step(PipelineStep::Installing, "npm install exited with code 1", "ERR!");
        assert_eq!(e.to_string(), "installing failed: npm install exited with code 1");
        assert_eq!(e.output(), "ERR!");
        assert!(!e.is_precondition());

        let e = PipelineError::PrCliUnauthenticated;
        assert!(e.to_string().contains("not authenticated"));
        assert!(e.is_precondition());
    }
}
