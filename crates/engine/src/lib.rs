//! Engine crate – shared backend logic for muban.
//!
//! Archive format, entry decryption, custom-scheme request handling, and the
//! page bindings all live here. It does NOT depend on Tauri runtime types,
//! so it is used by both the GUI wrapper and the headless CLI.

pub mod archive;
pub mod binding;
pub mod cipher;
pub mod commands;
pub mod context;
pub mod doctor;
pub mod platform;
pub mod protocol;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use archive::{Archive, ArchiveBuilder, ArchiveError};
pub use binding::BindingRegistry;
pub use cipher::Decipher;
pub use commands::CommandRegistry;
pub use context::AppContext;
pub use protocol::{ArchiveJob, ArchiveSource, ProtocolConfig, ProtocolHandler, ProtocolResponse};
pub use types::{CommandResult, ErrorCode, ErrorInfo, Status};
