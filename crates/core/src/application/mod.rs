// Application Layer - Supervision and scheduling

pub mod scheduler;
pub mod supervisor;

// Re-exports
pub use scheduler::Scheduler;
pub use supervisor::{
    JobTicket, RejectReason, Rejection, Supervisor, SupervisorEvent, SupervisorState,
};
