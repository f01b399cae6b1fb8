// Pitboss Infrastructure - System Adapters
// Implements: WorkerLauncher, ResourceSampler

pub mod resource_sampler_impl;
pub mod subprocess_worker;

pub use resource_sampler_impl::{
    platform_sampler, sampler_for, PsSampler, SamplerBackend, SysinfoSampler, TasklistSampler,
};
pub use subprocess_worker::{SubprocessLauncher, WorkerCommand, DEFAULT_ENV_ALLOWLIST};
