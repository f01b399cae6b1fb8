// Pitboss configuration: library defaults, overridable from the environment

use pitboss_core::{AppError, Result, SupervisorOptions};
use pitboss_infra_system::{SamplerBackend, WorkerCommand};

/// Worker binary looked up on `PATH` unless `PITBOSS_WORKER_BIN` says otherwise
pub const DEFAULT_WORKER_PROGRAM: &str = "pitboss-worker";

const ENV_MEMORY_LIMIT_KB: &str = "PITBOSS_MEMORY_LIMIT_KB";
const ENV_TIMEOUT_MS: &str = "PITBOSS_TIMEOUT_MS";
const ENV_HEARTBEAT_TICK_MS: &str = "PITBOSS_HEARTBEAT_TICK_MS";
const ENV_WORKER_BIN: &str = "PITBOSS_WORKER_BIN";
const ENV_SAMPLER: &str = "PITBOSS_SAMPLER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PitbossConfig {
    pub options: SupervisorOptions,
    pub worker: WorkerCommand,
    pub sampler: SamplerBackend,
}

impl Default for PitbossConfig {
    fn default() -> Self {
        Self {
            options: SupervisorOptions::default(),
            worker: WorkerCommand::new(DEFAULT_WORKER_PROGRAM),
            sampler: SamplerBackend::default(),
        }
    }
}

impl PitbossConfig {
    /// Defaults overridden by `PITBOSS_*` variables
    ///
    /// # Errors
    /// - AppError::Config for unparseable or zero values
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_MEMORY_LIMIT_KB) {
            config.options.memory_limit_kb = parse_u64(ENV_MEMORY_LIMIT_KB, &value)?;
        }
        if let Some(value) = lookup(ENV_TIMEOUT_MS) {
            config.options.timeout_ms = parse_u64(ENV_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_HEARTBEAT_TICK_MS) {
            config.options.heartbeat_tick_ms = parse_u64(ENV_HEARTBEAT_TICK_MS, &value)?;
        }
        if let Some(program) = lookup(ENV_WORKER_BIN).filter(|p| !p.trim().is_empty()) {
            config.worker.program = program.into();
        }
        if let Some(value) = lookup(ENV_SAMPLER) {
            config.sampler = value
                .parse()
                .map_err(|e| AppError::Config(format!("{}: {}", ENV_SAMPLER, e)))?;
        }

        config.options.validate()?;
        Ok(config)
    }

    pub fn with_options(mut self, options: SupervisorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_worker(mut self, worker: WorkerCommand) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerBackend) -> Self {
        self.sampler = sampler;
        self
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| AppError::Config(format!("{} must be a non-negative integer, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio_test::{assert_err, assert_ok};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = assert_ok!(PitbossConfig::from_lookup(lookup(&[])));
        assert_eq!(config, PitbossConfig::default());
        assert_eq!(config.options.memory_limit_kb, 64 * 1024);
        assert_eq!(config.options.timeout_ms, 500);
        assert_eq!(config.options.heartbeat_tick_ms, 100);
        assert_eq!(config.worker.program, PathBuf::from(DEFAULT_WORKER_PROGRAM));
        assert_eq!(config.sampler, SamplerBackend::Native);
    }

    #[test]
    fn test_environment_overrides() {
        let config = assert_ok!(PitbossConfig::from_lookup(lookup(&[
            ("PITBOSS_MEMORY_LIMIT_KB", "2048"),
            ("PITBOSS_TIMEOUT_MS", " 1500 "),
            ("PITBOSS_HEARTBEAT_TICK_MS", "50"),
            ("PITBOSS_WORKER_BIN", "/opt/pitboss/worker"),
            ("PITBOSS_SAMPLER", "sysinfo"),
        ])));

        assert_eq!(
            config.options,
            SupervisorOptions::default()
                .with_memory_limit_kb(2048)
                .with_timeout_ms(1500)
                .with_heartbeat_tick_ms(50)
        );
        assert_eq!(config.worker.program, PathBuf::from("/opt/pitboss/worker"));
        assert_eq!(config.sampler, SamplerBackend::Sysinfo);
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for vars in [
            [("PITBOSS_TIMEOUT_MS", "soon")],
            [("PITBOSS_TIMEOUT_MS", "0")],
            [("PITBOSS_SAMPLER", "top")],
        ] {
            assert!(matches!(
                assert_err!(PitbossConfig::from_lookup(lookup(&vars))),
                AppError::Config(_)
            ));
        }
    }
}
