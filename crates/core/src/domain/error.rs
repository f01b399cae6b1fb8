// Job Error Taxonomy
// Every variant reaches the caller through the job's ticket, never as a panic or thrown error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single job did not produce a result
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum JobError {
    /// Code failed to prepare; sticky for the worker incarnation
    #[error("{0}")]
    Preparation(String),

    /// The snippet failed while running; does not affect later jobs
    #[error("{0}")]
    Execution(String),

    /// Rejected before reaching a worker (malformed request, no code)
    #[error("{0}")]
    Request(String),

    /// Wall-clock limit exceeded
    #[error("Timedout")]
    Timedout,

    /// Sampled resident memory exceeded the ceiling
    #[error("MemoryExceeded")]
    MemoryExceeded,

    /// Worker exited with no other recorded reason
    #[error("Process Failed")]
    ProcessFailed,

    /// Supervisor was killed before the job resolved
    #[error("Killed")]
    Killed,

    /// A worker could not be started for this job
    #[error("Worker launch failed: {0}")]
    Launch(String),
}

impl JobError {
    /// True for failures caused by the supervisor enforcing a limit or losing the worker
    pub fn is_termination(&self) -> bool {
        matches!(
            self,
            JobError::Timedout | JobError::MemoryExceeded | JobError::ProcessFailed
        )
    }
}

/// Outcome delivered to a job's ticket
pub type JobResult = std::result::Result<serde_json::Value, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_wire_reasons() {
        assert_eq!(JobError::Timedout.to_string(), "Timedout");
        assert_eq!(JobError::MemoryExceeded.to_string(), "MemoryExceeded");
        assert_eq!(JobError::ProcessFailed.to_string(), "Process Failed");
        assert_eq!(
            JobError::Execution("Runtime error: boom".to_string()).to_string(),
            "Runtime error: boom"
        );
    }

    #[test]
    fn test_termination_classification() {
        assert!(JobError::Timedout.is_termination());
        assert!(JobError::ProcessFailed.is_termination());
        assert!(!JobError::Preparation("x".to_string()).is_termination());
        assert!(!JobError::Killed.is_termination());
    }
}
