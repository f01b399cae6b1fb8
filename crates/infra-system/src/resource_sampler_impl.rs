// Resource sampler implementations
// reason: sysinfo for in-process sampling, csv for tasklist output
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::{Pid, System};
use tokio::process::Command;
use tracing::debug;

use pitboss_core::port::{ResourceSampler, SamplerError};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Which sampler family to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerBackend {
    /// The platform's own utility (`ps` on unix, `tasklist` on windows)
    #[default]
    Native,
    /// In-process sampling through sysinfo
    Sysinfo,
}

impl FromStr for SamplerBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" | "ps" | "tasklist" => Ok(SamplerBackend::Native),
            "sysinfo" => Ok(SamplerBackend::Sysinfo),
            other => Err(format!("unknown sampler backend '{}'", other)),
        }
    }
}

/// Sampler for the current platform, chosen once
pub fn platform_sampler() -> Arc<dyn ResourceSampler> {
    #[cfg(windows)]
    {
        Arc::new(TasklistSampler)
    }

    #[cfg(unix)]
    {
        Arc::new(PsSampler)
    }

    #[cfg(not(any(unix, windows)))]
    {
        Arc::new(SysinfoSampler::new())
    }
}

pub fn sampler_for(backend: SamplerBackend) -> Arc<dyn ResourceSampler> {
    match backend {
        SamplerBackend::Native => platform_sampler(),
        SamplerBackend::Sysinfo => Arc::new(SysinfoSampler::new()),
    }
}

async fn run_utility(program: &str, args: &[&str]) -> Result<std::process::Output, SamplerError> {
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SamplerError::CommandFailed(format!("{}: {}", program, e)))
}

// ----------------------------------------------------------------------------
// ps
// ----------------------------------------------------------------------------

/// `ps -o rss= -p <pid>`
#[derive(Debug, Default, Clone, Copy)]
pub struct PsSampler;

#[async_trait]
impl ResourceSampler for PsSampler {
    async fn sample(&self, pid: u32) -> Result<Option<u64>, SamplerError> {
        let pid_arg = pid.to_string();
        let output = run_utility("ps", &["-o", "rss=", "-p", &pid_arg]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        // ps exits non-zero with no rows when the pid is gone
        if !output.status.success() && stdout.trim().is_empty() {
            debug!(pid, status = ?output.status.code(), "ps found no such process");
            return Ok(None);
        }
        parse_ps_rss(&stdout)
    }

    fn name(&self) -> &'static str {
        "ps"
    }
}

/// RSS column in KiB, converted to bytes
fn parse_ps_rss(output: &str) -> Result<Option<u64>, SamplerError> {
    let Some(line) = output.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Ok(None);
    };
    line.parse::<u64>()
        .map(|kib| Some(kib.saturating_mul(KIB)))
        .map_err(|_| SamplerError::Parse(line.to_string()))
}

// ----------------------------------------------------------------------------
// tasklist
// ----------------------------------------------------------------------------

/// `tasklist /fi "PID eq <pid>" /fo CSV /nh`
#[derive(Debug, Default, Clone, Copy)]
pub struct TasklistSampler;

#[async_trait]
impl ResourceSampler for TasklistSampler {
    async fn sample(&self, pid: u32) -> Result<Option<u64>, SamplerError> {
        let filter = format!("PID eq {}", pid);
        let output = run_utility("tasklist", &["/fi", &filter, "/fo", "CSV", "/nh"]).await?;
        if !output.status.success() {
            return Err(SamplerError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_tasklist(&String::from_utf8_lossy(&output.stdout), pid)
    }

    fn name(&self) -> &'static str {
        "tasklist"
    }
}

/// Find the row for `pid` and read its memory column
fn parse_tasklist(output: &str, pid: u32) -> Result<Option<u64>, SamplerError> {
    let trimmed = output.trim();
    // "INFO: No tasks are running which match the specified criteria."
    if trimmed.is_empty() || trimmed.starts_with("INFO:") {
        return Ok(None);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(trimmed.as_bytes());

    for record in reader.records() {
        let record = record.map_err(|e| SamplerError::Parse(e.to_string()))?;
        let row_pid = record.get(1).and_then(|p| p.trim().parse::<u32>().ok());
        if row_pid != Some(pid) {
            continue;
        }
        let memory = record
            .get(4)
            .ok_or_else(|| SamplerError::Parse(format!("missing memory column: {:?}", record)))?;
        return parse_memory_column(memory).map(Some);
    }
    Ok(None)
}

/// "25,432 K" / "1.024 K" / "12 M" / "2048"
fn parse_memory_column(raw: &str) -> Result<u64, SamplerError> {
    let value = raw.trim();
    let upper = value.to_ascii_uppercase();
    let unit = if upper.ends_with('M') || upper.ends_with("MB") {
        MIB
    } else {
        KIB
    };

    // Separators differ per locale: ',' '.' ' ' and no-break space
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(SamplerError::Parse(raw.to_string()));
    }
    digits
        .parse::<u64>()
        .map(|n| n.saturating_mul(unit))
        .map_err(|_| SamplerError::Parse(raw.to_string()))
}

// ----------------------------------------------------------------------------
// sysinfo
// ----------------------------------------------------------------------------

/// In-process sampler backed by sysinfo
pub struct SysinfoSampler {
    system: Arc<Mutex<System>>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceSampler for SysinfoSampler {
    async fn sample(&self, pid: u32) -> Result<Option<u64>, SamplerError> {
        let system = Arc::clone(&self.system);
        tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().unwrap_or_else(PoisonError::into_inner);
            let pid = Pid::from_u32(pid);
            if !sys.refresh_process(pid) {
                return None;
            }
            // sysinfo reports bytes
            sys.process(pid).map(|process| process.memory())
        })
        .await
        .map_err(|e| SamplerError::CommandFailed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "sysinfo"
    }
}
