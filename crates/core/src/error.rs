// Central Error Type for operational failures
// Per-job failures travel as domain::JobError through the job's ticket instead.

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Supervisor busy: job {0} is in flight")]
    Busy(String),

    #[error("Supervisor is relaunching its worker")]
    Restarting,

    #[error("Supervisor was killed")]
    Killed,

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
