//! Application context – holds capability trait objects, the protocol
//! handler, and the binding registry.

use crate::binding::BindingRegistry;
use crate::platform::SystemCpu;
use crate::protocol::ProtocolHandler;
use crate::traits::*;

/// Central context passed to all engine operations.
///
/// The GUI builds one with the real CPU source and an archive rooted at the
/// executable; the CLI points it at an archive file; tests swap in fixed
/// implementations.
pub struct AppContext {
    cpu: Box<dyn CpuInfo>,
    protocol: Option<ProtocolHandler>,
    bindings: BindingRegistry,
}

impl AppContext {
    pub fn new(cpu: Box<dyn CpuInfo>, protocol: Option<ProtocolHandler>, bindings: BindingRegistry) -> Self {
        Self {
            cpu,
            protocol,
            bindings,
        }
    }

    /// Real platform CPU with the given protocol handler and default bindings.
    pub fn default_platform(protocol: ProtocolHandler) -> Self {
        Self::new(Box::new(SystemCpu), Some(protocol), BindingRegistry::default())
    }

    /// No archive attached; for commands that only need bindings or CPU info.
    pub fn headless() -> Self {
        Self::new(Box::new(SystemCpu), None, BindingRegistry::default())
    }

    pub fn headless_with_cpu(cpu: Box<dyn CpuInfo>) -> Self {
        Self::new(cpu, None, BindingRegistry::default())
    }

    pub fn cpu(&self) -> &dyn CpuInfo {
        self.cpu.as_ref()
    }

    pub fn protocol(&self) -> Option<&ProtocolHandler> {
        self.protocol.as_ref()
    }

    pub fn bindings(&self) -> &BindingRegistry {
        &self.bindings
    }
}
