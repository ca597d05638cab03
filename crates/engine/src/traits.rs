use std::path::PathBuf;

/// Result type for trait operations that may be unsupported.
pub type CapResult<T> = Result<T, CapError>;

#[derive(Debug, thiserror::Error)]
pub enum CapError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("script host unavailable: {0}")]
    HostUnavailable(String),

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Executable location
// ---------------------------------------------------------------------------

/// Locates the running executable, which is where the app archive lives.
pub trait ExecutableLocator: Send + Sync {
    fn current_exe(&self) -> CapResult<PathBuf>;
}

// ---------------------------------------------------------------------------
// CPU information
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CpuSnapshot {
    pub brand: String,
    pub vendor_id: String,
    pub logical_cores: usize,
    pub frequency_mhz: u64,
}

pub trait CpuInfo: Send + Sync {
    /// Human readable CPU model string, e.g. "Intel(R) Core(TM) i7-8700 CPU @ 3.20GHz".
    fn brand(&self) -> String;

    fn snapshot(&self) -> CpuSnapshot;
}

// ---------------------------------------------------------------------------
// Script execution
// ---------------------------------------------------------------------------

/// Something that can evaluate JavaScript in a page: the webview in the GUI,
/// a recorder in the CLI and tests.
pub trait ScriptHost {
    fn execute_script(&self, script: &str) -> CapResult<()>;
}
