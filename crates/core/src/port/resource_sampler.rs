// Resource sampling port
// reason: async-trait, backends shell out to OS utilities
use async_trait::async_trait;
use thiserror::Error;

/// Sampler failures (logged by the supervisor, never surfaced to jobs)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    #[error("Sampling command failed: {0}")]
    CommandFailed(String),

    #[error("Unparseable sampler output: {0}")]
    Parse(String),
}

/// Resident memory probe for a process that may not cooperate
///
/// Backends are chosen once per process (see infra-system `platform_sampler`).
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Current resident memory of `pid` in bytes
    ///
    /// # Returns
    /// - `Ok(Some(bytes))` for a successful sample
    /// - `Ok(None)` when the process is already gone (benign miss)
    /// - `Err(_)` when the sampling utility itself failed
    async fn sample(&self, pid: u32) -> Result<Option<u64>, SamplerError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    /// What the mock reports on every sample
    #[derive(Debug, Clone)]
    pub enum MockSample {
        Bytes(u64),
        Missing,
        Fail(String),
    }

    /// Mock ResourceSampler for testing
    #[derive(Clone)]
    pub struct MockResourceSampler {
        sample: Arc<Mutex<MockSample>>,
        calls: Arc<AtomicUsize>,
    }

    impl MockResourceSampler {
        pub fn new(sample: MockSample) -> Self {
            Self {
                sample: Arc::new(Mutex::new(sample)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn with_bytes(bytes: u64) -> Self {
            Self::new(MockSample::Bytes(bytes))
        }

        pub fn set(&self, sample: MockSample) {
            *self.sample.lock().unwrap_or_else(PoisonError::into_inner) = sample;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceSampler for MockResourceSampler {
        async fn sample(&self, _pid: u32) -> Result<Option<u64>, SamplerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let sample = self
                .sample
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            match sample {
                MockSample::Bytes(bytes) => Ok(Some(bytes)),
                MockSample::Missing => Ok(None),
                MockSample::Fail(msg) => Err(SamplerError::CommandFailed(msg)),
            }
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }
}
