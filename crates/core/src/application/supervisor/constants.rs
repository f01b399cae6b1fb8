// Supervisor constants (no magic values)

/// Default resident memory ceiling: 64 MiB, expressed in KiB
pub const DEFAULT_MEMORY_LIMIT_KB: u64 = 64 * 1024;

/// Default wall-clock limit per job (500ms)
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Default memory sampling interval (100ms)
pub const DEFAULT_HEARTBEAT_TICK_MS: u64 = 100;

/// Added to the job timeout before it is handed to the engine, so the
/// supervisor's own timer always fires first
pub const TIMEOUT_HINT_SLACK_MS: u64 = 100;

/// Capacity of the observer event channel; slow observers see `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
