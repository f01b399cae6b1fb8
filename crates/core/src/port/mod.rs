// Port Layer - Interfaces for external dependencies

pub mod id_provider; // For deterministic testing
pub mod resource_sampler;
pub mod worker_process;

// Re-exports
pub use id_provider::{IdProvider, SequentialIdProvider};
pub use resource_sampler::{ResourceSampler, SamplerError};
pub use worker_process::{
    ChannelError, ExitInfo, KillMode, LaunchError, WorkerChannel, WorkerEvent, WorkerHandle,
    WorkerLauncher,
};
