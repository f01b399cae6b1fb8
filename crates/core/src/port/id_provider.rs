// ID Provider Port (job correlation ids)
use std::sync::atomic::{AtomicU64, Ordering};

/// ID provider interface (allows deterministic IDs in tests)
pub trait IdProvider: Send + Sync {
    /// Generate an id unique among the supervisor's outstanding jobs
    fn generate_id(&self) -> String;
}

/// Monotonic counter provider
///
/// At most one job is outstanding per supervisor, so a counter is enough;
/// ids are for correlation, not security.
#[derive(Debug, Default)]
pub struct SequentialIdProvider {
    next: AtomicU64,
}

impl SequentialIdProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdProvider for SequentialIdProvider {
    fn generate_id(&self) -> String {
        (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}
