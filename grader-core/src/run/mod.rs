use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use nix::sys::resource::{
    setrlimit,
    Resource::{RLIMIT_AS, RLIMIT_CORE, RLIMIT_CPU, RLIMIT_FSIZE},
};
use serde_derive::{Deserialize, Serialize};

pub mod executor;
pub mod sandbox;

const MIB: u64 = 1024 * 1024;

/// Upper bound on any single file a sandboxed process may write.
const FSIZE_LIMIT: u64 = 64 * MIB;

/// Resource caps of one sandboxed invocation. A value of zero disables that cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_seconds: u64,
    pub wall_seconds: u64,
    pub memory_bytes: u64,
    pub output_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_seconds: 5,
            wall_seconds: 10,
            memory_bytes: 256 * MIB,
            output_bytes: MIB,
        }
    }
}

impl ResourceLimits {
    /// Limits for toolchain invocations: only time and output are bounded.
    pub fn for_build(timeout_seconds: u64) -> Self {
        Self {
            cpu_seconds: timeout_seconds,
            wall_seconds: timeout_seconds,
            memory_bytes: 0,
            output_bytes: 4 * MIB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationPolicy {
    Off,
    #[default]
    BestEffort,
    Strict,
}

impl std::str::FromStr for IsolationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(Self::Off),
            "best-effort" => Ok(Self::BestEffort),
            "strict" => Ok(Self::Strict),
            _ => Err(anyhow::anyhow!("Isolation policy not found: {}", s)),
        }
    }
}

/// Shared flag checked by the sandbox monitor; raising it kills the running
/// process group.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Values are `(soft, hard)` pairs handed to `setrlimit`.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct RlimitConfigs {
    pub as_limit: Option<(u64, u64)>,
    pub cpu_limit: Option<(u64, u64)>,
    pub fsize_limit: Option<(u64, u64)>,
    pub core_limit: Option<(u64, u64)>,
}

impl RlimitConfigs {
    pub fn from_limits(limits: &ResourceLimits, limit_address_space: bool) -> Self {
        let cpu_limit = match limits.cpu_seconds {
            0 => None,
            cpu => Some((cpu, cpu + 1)),
        };
        let as_limit = match limits.memory_bytes {
            0 => None,
            _ if !limit_address_space => None,
            memory => Some((memory, memory)),
        };
        Self {
            as_limit,
            cpu_limit,
            fsize_limit: Some((FSIZE_LIMIT, FSIZE_LIMIT)),
            core_limit: Some((0, 0)),
        }
    }

    /// Runs between fork and exec: no logging, no allocation.
    pub fn load(&self) -> nix::Result<()> {
        if let Some(as_limit) = self.as_limit {
            setrlimit(RLIMIT_AS, as_limit.0, as_limit.1)?;
        }
        if let Some(cpu_limit) = self.cpu_limit {
            setrlimit(RLIMIT_CPU, cpu_limit.0, cpu_limit.1)?;
        }
        if let Some(fsize_limit) = self.fsize_limit {
            setrlimit(RLIMIT_FSIZE, fsize_limit.0, fsize_limit.1)?;
        }
        if let Some(core_limit) = self.core_limit {
            setrlimit(RLIMIT_CORE, core_limit.0, core_limit.1)?;
        }
        Ok(())
    }
}
