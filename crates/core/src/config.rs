// Supervisor configuration (immutable after construction)

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::application::supervisor::constants::{
    DEFAULT_HEARTBEAT_TICK_MS, DEFAULT_MEMORY_LIMIT_KB, DEFAULT_TIMEOUT_MS, TIMEOUT_HINT_SLACK_MS,
};
use crate::error::{AppError, Result};

/// Limits enforced around every job
///
/// Accepts the wire names `memoryLimit`, `timeout` and `heartBeatTick`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorOptions {
    /// Resident memory ceiling in KiB
    #[serde(alias = "memoryLimit")]
    pub memory_limit_kb: u64,
    /// Wall-clock limit per job in milliseconds
    #[serde(alias = "timeout")]
    pub timeout_ms: u64,
    /// Memory sampling interval in milliseconds
    #[serde(alias = "heartBeatTick")]
    pub heartbeat_tick_ms: u64,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            memory_limit_kb: DEFAULT_MEMORY_LIMIT_KB,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            heartbeat_tick_ms: DEFAULT_HEARTBEAT_TICK_MS,
        }
    }
}

impl SupervisorOptions {
    pub fn with_memory_limit_kb(mut self, memory_limit_kb: u64) -> Self {
        self.memory_limit_kb = memory_limit_kb;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_heartbeat_tick_ms(mut self, heartbeat_tick_ms: u64) -> Self {
        self.heartbeat_tick_ms = heartbeat_tick_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.memory_limit_kb == 0 {
            return Err(AppError::Config("memory limit must be positive".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(AppError::Config("timeout must be positive".to_string()));
        }
        if self.heartbeat_tick_ms == 0 {
            return Err(AppError::Config("heartbeat tick must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_tick(&self) -> Duration {
        Duration::from_millis(self.heartbeat_tick_ms)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_kb.saturating_mul(1024)
    }

    /// Timeout handed to the engine; slightly longer so the supervisor's timer wins
    pub fn engine_timeout_hint_ms(&self) -> u64 {
        self.timeout_ms.saturating_add(TIMEOUT_HINT_SLACK_MS)
    }
}
