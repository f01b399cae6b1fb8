// Domain Layer - Jobs and the per-job error taxonomy

pub mod error;
pub mod job;

// Re-exports
pub use error::{JobError, JobResult};
pub use job::{Job, JobId, JobRequest, Libraries, LIBRARIES_SHAPE_ERROR};
