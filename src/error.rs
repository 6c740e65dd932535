use std::time::Duration;
use thiserror::Error;

/// Fatal run errors. Every phase-level error terminates the run; there is no
/// retry anywhere in the controller.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("phase '{phase}' timed out after {timeout:?}")]
    PhaseTimeout { phase: String, timeout: Duration },

    #[error("phase '{phase}' failed: matched {matched:?}")]
    PhaseFailure { phase: String, matched: String },

    #[error("phase '{phase}': console closed unexpectedly")]
    StreamClosed { phase: String },

    #[error("interface {0} does not exist on the target")]
    NoSuchInterface(String),
}

impl RunError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::PhaseTimeout { .. })
    }
}
