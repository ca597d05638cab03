//! Platform-specific implementations of OS capability traits.
//!
//! - [`StdExecutable`]: `std::env::current_exe`
//! - [`SystemCpu`]: CPU facts via `sysinfo`
//! - [`RecordingScriptHost`]: collects scripts instead of running them (CLI, tests)

use crate::traits::*;
use std::path::PathBuf;
use std::sync::Mutex;
use sysinfo::{CpuRefreshKind, RefreshKind, System};

// ===========================================================================
// Executable location
// ===========================================================================

pub struct StdExecutable;

impl ExecutableLocator for StdExecutable {
    fn current_exe(&self) -> CapResult<PathBuf> {
        std::env::current_exe().map_err(CapError::Io)
    }
}

/// Pretends the running executable is `path`. `None` simulates a platform
/// where the executable path cannot be resolved.
pub struct FixedExecutable(pub Option<PathBuf>);

impl ExecutableLocator for FixedExecutable {
    fn current_exe(&self) -> CapResult<PathBuf> {
        self.0
            .clone()
            .ok_or_else(|| CapError::Unsupported("executable path unavailable".into()))
    }
}

// ===========================================================================
// CPU – wraps sysinfo
// ===========================================================================

pub struct SystemCpu;

impl SystemCpu {
    fn load() -> System {
        System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::everything()))
    }
}

impl CpuInfo for SystemCpu {
    fn brand(&self) -> String {
        let sys = Self::load();
        sys.cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn snapshot(&self) -> CpuSnapshot {
        let sys = Self::load();
        let first = sys.cpus().first();
        CpuSnapshot {
            brand: first
                .map(|c| c.brand().trim().to_string())
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| "unknown".to_string()),
            vendor_id: first.map(|c| c.vendor_id().to_string()).unwrap_or_default(),
            logical_cores: sys.cpus().len(),
            frequency_mhz: first.map(|c| c.frequency()).unwrap_or(0),
        }
    }
}

/// Deterministic CPU for tests and demos.
pub struct FixedCpu(pub String);

impl CpuInfo for FixedCpu {
    fn brand(&self) -> String {
        self.0.clone()
    }

    fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            brand: self.0.clone(),
            vendor_id: String::new(),
            logical_cores: 1,
            frequency_mhz: 0,
        }
    }
}

// ===========================================================================
// Script host that records instead of evaluating
// ===========================================================================

#[derive(Default)]
pub struct RecordingScriptHost {
    scripts: Mutex<Vec<String>>,
}

impl RecordingScriptHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl ScriptHost for RecordingScriptHost {
    fn execute_script(&self, script: &str) -> CapResult<()> {
        self.scripts
            .lock()
            .map_err(|_| CapError::Other("script recorder poisoned".into()))?
            .push(script.to_string());
        Ok(())
    }
}
