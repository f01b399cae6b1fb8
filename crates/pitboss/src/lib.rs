//! Pitboss - run untrusted snippets in supervised worker processes
//!
//! Wires the core supervisor to the OS adapters:
//!
//! ```ignore
//! let scheduler = pitboss::new_scheduler("data", SupervisorOptions::default())?;
//! let value = scheduler.submit(JobRequest::new(context)).await?;
//! ```

pub mod config;

use std::sync::Arc;
use tracing::debug;

pub use config::{PitbossConfig, DEFAULT_WORKER_PROGRAM};
pub use pitboss_core::{
    AppError, Job, JobError, JobId, JobRequest, JobResult, JobTicket, Libraries, Rejection, Result,
    Scheduler, Supervisor, SupervisorEvent, SupervisorOptions, SupervisorState,
};
pub use pitboss_infra_system::{SamplerBackend, SubprocessLauncher, WorkerCommand};

/// Supervisor for `code` with explicit limits; worker and sampler come from the environment
pub fn new_supervisor(code: impl Into<String>, options: SupervisorOptions) -> Result<Supervisor> {
    let config = PitbossConfig::from_env()?.with_options(options);
    new_supervisor_with_config(code, &config)
}

pub fn new_supervisor_with_config(
    code: impl Into<String>,
    config: &PitbossConfig,
) -> Result<Supervisor> {
    debug!(
        worker = %config.worker.program.display(),
        sampler = ?config.sampler,
        "Creating supervisor"
    );
    Supervisor::new(
        code,
        config.options.clone(),
        Arc::new(SubprocessLauncher::new(config.worker.clone())),
        pitboss_infra_system::sampler_for(config.sampler),
    )
}

/// Queueing front-end over `new_supervisor`
pub fn new_scheduler(code: impl Into<String>, options: SupervisorOptions) -> Result<Scheduler> {
    new_supervisor(code, options).map(Scheduler::new)
}

pub fn new_scheduler_with_config(
    code: impl Into<String>,
    config: &PitbossConfig,
) -> Result<Scheduler> {
    new_supervisor_with_config(code, config).map(Scheduler::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tokio_test::assert_ok;

    fn missing_worker() -> PitbossConfig {
        PitbossConfig::default().with_worker(WorkerCommand::new("/nonexistent/pitboss-worker"))
    }

    #[tokio::test]
    async fn test_unlaunchable_worker_fails_jobs_not_construction() {
        let supervisor = assert_ok!(new_supervisor_with_config("data", &missing_worker()));
        let mut context = Map::new();
        context.insert("data".to_string(), json!(1));

        let outcome = assert_ok!(supervisor.submit(JobRequest::new(context))).await;
        assert!(matches!(outcome, Err(JobError::Launch(_))));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_scheduler_rejects_invalid_options() {
        let config = missing_worker().with_options(SupervisorOptions::default().with_timeout_ms(0));
        assert!(matches!(
            new_scheduler_with_config("data", &config),
            Err(AppError::Config(_))
        ));
    }
}
