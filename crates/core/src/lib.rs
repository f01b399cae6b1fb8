// Pitboss Core - Supervision Logic, Protocol & Ports
// NO infrastructure dependencies (hexagonal architecture)

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod port;
pub mod protocol;

pub use application::{JobTicket, Rejection, Scheduler, Supervisor, SupervisorEvent, SupervisorState};
pub use config::SupervisorOptions;
pub use domain::{Job, JobError, JobId, JobRequest, JobResult, Libraries};
pub use error::{AppError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
