//! Command registry and built-in commands.
//!
//! Commands are registered by name and invoked with JSON input/output. The
//! CLI harness and daemon mode drive the engine exclusively through here.

use crate::archive::{Archive, ArchiveError};
use crate::binding::BindingError;
use crate::context::AppContext;
use crate::platform::RecordingScriptHost;
use crate::protocol::{resolve_archive_path, ProtocolConfig};
use crate::types::*;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

/// Signature for all engine commands.
pub type CommandHandler = fn(Value, &AppContext) -> Result<Value, CommandError>;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error("script: {0}")]
    Script(String),
}

impl CommandError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CommandError::InvalidInput(_) => ErrorCode::InvalidInput,
            CommandError::NotFound(_) => ErrorCode::NotFound,
            CommandError::Unsupported(_) => ErrorCode::Unsupported,
            CommandError::Io(_) => ErrorCode::IoError,
            CommandError::Decrypt(_) => ErrorCode::DecryptFailed,
            CommandError::Corrupt(_) => ErrorCode::CorruptArchive,
            CommandError::Script(_) => ErrorCode::ScriptError,
        }
    }
}

impl From<ArchiveError> for CommandError {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::NotFound(_) | ArchiveError::IsDirectory(_) => CommandError::NotFound(e.to_string()),
            ArchiveError::InvalidPath(_) => CommandError::InvalidInput(e.to_string()),
            ArchiveError::MissingKey(_) | ArchiveError::Cipher(_) => CommandError::Decrypt(e.to_string()),
            ArchiveError::Io(io) => CommandError::Io(io),
            other => CommandError::Corrupt(other.to_string()),
        }
    }
}

impl From<BindingError> for CommandError {
    fn from(e: BindingError) -> Self {
        match e {
            BindingError::UnknownFunction(_) | BindingError::InvalidArguments { .. } => {
                CommandError::InvalidInput(e.to_string())
            }
            BindingError::Script(_) => CommandError::Script(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register("ping", cmd_ping);
        reg.register("resolve_url", cmd_resolve_url);
        reg.register("list_entries", cmd_list_entries);
        reg.register("read_entry", cmd_read_entry);
        reg.register("fetch", cmd_fetch);
        reg.register("sys_info", cmd_sys_info);
        reg.register("invoke_binding", cmd_invoke_binding);
        reg
    }

    pub fn register(&mut self, name: &str, handler: CommandHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Execute a command by name and return a full CommandResult.
    pub fn execute(&self, name: &str, args: Value, ctx: &AppContext) -> CommandResult {
        let run_id = new_run_id();
        let start = Instant::now();

        let Some(handler) = self.handlers.get(name) else {
            return result_err(
                "call",
                name,
                &run_id,
                start.elapsed().as_millis() as u64,
                ErrorCode::InvalidInput,
                format!("unknown command: {}", name),
            );
        };

        match handler(args, ctx) {
            Ok(data) => {
                let mut r = result_ok("call", name, &run_id, start.elapsed().as_millis() as u64);
                r.data = Some(data);
                r
            }
            Err(e) => {
                tracing::debug!(command = name, error = %e, "command failed");
                result_err(
                    "call",
                    name,
                    &run_id,
                    start.elapsed().as_millis() as u64,
                    e.error_code(),
                    e.to_string(),
                )
            }
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn str_arg<'a>(args: &'a Value, field: &str) -> Result<&'a str, CommandError> {
    args.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CommandError::InvalidInput(format!("missing '{}' string field", field)))
}

/// Open the archive named by `args.archive`, or the one the context's
/// protocol handler serves from.
fn open_archive(args: &Value, ctx: &AppContext) -> Result<Archive, CommandError> {
    if let Some(path) = args.get("archive").and_then(|v| v.as_str()) {
        return Ok(Archive::open(Path::new(path))?);
    }
    let location = ctx
        .protocol()
        .and_then(|p| p.archive_location())
        .ok_or_else(|| CommandError::InvalidInput("missing 'archive' string field".into()))?;
    Ok(Archive::open_colocated(&location)?)
}

// ===========================================================================
// Built-in commands
// ===========================================================================

/// `ping` – returns { "pong": true }. Proves wiring works.
fn cmd_ping(_args: Value, _ctx: &AppContext) -> Result<Value, CommandError> {
    Ok(serde_json::json!({ "pong": true }))
}

/// `resolve_url` – map a custom-scheme URL to its in-archive path.
///
/// Args: `{ "url": "muban://app/index.html" }`
/// Returns: `{ "path": "index.html" }`
fn cmd_resolve_url(args: Value, ctx: &AppContext) -> Result<Value, CommandError> {
    let url = str_arg(&args, "url")?;
    let default_config = ProtocolConfig::default();
    let config = ctx.protocol().map(|p| p.config()).unwrap_or(&default_config);
    let path = resolve_archive_path(url, config).map_err(|e| CommandError::InvalidInput(e.to_string()))?;
    Ok(serde_json::json!({ "path": path }))
}

/// `list_entries` – list files in an archive.
///
/// Args: `{ "archive": "/path/app.asar" }` (optional when an archive is attached)
fn cmd_list_entries(args: Value, ctx: &AppContext) -> Result<Value, CommandError> {
    let archive = open_archive(&args, ctx)?;
    let entries = archive.list();
    Ok(serde_json::json!({
        "archive": archive.path().display().to_string(),
        "appended": archive.is_appended(),
        "count": entries.len(),
        "entries": entries,
    }))
}

/// `read_entry` – read and decrypt one file.
///
/// Args: `{ "archive": "/path/app.asar", "path": "index.html" }`
/// Returns: `{ "content": "...", "size_bytes": 123 }`
fn cmd_read_entry(args: Value, ctx: &AppContext) -> Result<Value, CommandError> {
    let path = str_arg(&args, "path")?;
    let archive = open_archive(&args, ctx)?;
    let data = archive.read(path, ctx.protocol().and_then(|p| p.decipher()))?;
    Ok(serde_json::json!({
        "content": String::from_utf8_lossy(&data),
        "size_bytes": data.len(),
    }))
}

/// `fetch` – serve a URL through the protocol handler, as the webview would.
///
/// Args: `{ "url": "muban://app/index.html" }`
/// Returns: `{ "status": 200, "mime_type": "text/html; charset=utf-8", "size_bytes": 42 }`
fn cmd_fetch(args: Value, ctx: &AppContext) -> Result<Value, CommandError> {
    let url = str_arg(&args, "url")?;
    let handler = ctx
        .protocol()
        .ok_or_else(|| CommandError::Unsupported("no archive attached to this context".into()))?;
    let response = handler.respond(url);
    let mut out = serde_json::json!({
        "status": response.status,
        "mime_type": response.mime_type,
        "size_bytes": response.body.len(),
    });
    if response.mime_type.starts_with("text/") || response.mime_type.contains("javascript") {
        out["body"] = Value::String(String::from_utf8_lossy(&response.body).into_owned());
    }
    Ok(out)
}

/// `sys_info` – CPU facts of this machine.
fn cmd_sys_info(_args: Value, ctx: &AppContext) -> Result<Value, CommandError> {
    serde_json::to_value(ctx.cpu().snapshot()).map_err(|e| CommandError::Script(e.to_string()))
}

/// `invoke_binding` – call a page binding and return the scripts it would
/// have run in the page.
///
/// Args: `{ "name": "showSysInfo", "args": ["cpu"] }`
/// Returns: `{ "scripts": ["window.report(\"...\")"] }`
fn cmd_invoke_binding(args: Value, ctx: &AppContext) -> Result<Value, CommandError> {
    let name = str_arg(&args, "name")?;
    let call_args = match args.get("args") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(a)) => a.clone(),
        Some(other) => vec![other.clone()],
    };
    let host = RecordingScriptHost::new();
    ctx.bindings().invoke(name, &call_args, ctx, &host)?;
    Ok(serde_json::json!({
        "binding": ctx.bindings().name(),
        "scripts": host.scripts(),
    }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveBuilder;
    use crate::binding::BindingRegistry;
    use crate::cipher::{Decipher, DEFAULT_IV};
    use crate::platform::{FixedCpu, FixedExecutable};
    use crate::protocol::{ArchiveSource, ProtocolHandler};

    fn key() -> Decipher {
        Decipher::new(b"0123456789abcdef", DEFAULT_IV).unwrap()
    }

    fn archive_ctx(dir: &Path) -> (AppContext, String) {
        let path = dir.join("app.asar");
        let mut b = ArchiveBuilder::new().encrypt_with(key());
        b.add_file("index.html", b"<p>hello engine</p>".to_vec()).unwrap();
        b.write_to(&path).unwrap();
        let handler = ProtocolHandler::new(
            ProtocolConfig::default(),
            ArchiveSource::Path(path.clone()),
            Box::new(FixedExecutable(None)),
            Some(key()),
        );
        let ctx = AppContext::new(
            Box::new(FixedCpu("Fixed CPU".into())),
            Some(handler),
            BindingRegistry::default(),
        );
        (ctx, path.display().to_string())
    }

    #[test]
    fn test_ping_command() {
        let ctx = AppContext::headless_with_cpu(Box::new(FixedCpu("x".into())));
        let reg = CommandRegistry::new();
        let result = reg.execute("ping", serde_json::json!({}), &ctx);
        assert_eq!(result.status, Status::Pass);
        assert_eq!(result.data.unwrap()["pong"], true);
    }

    #[test]
    fn test_unknown_command() {
        let ctx = AppContext::headless_with_cpu(Box::new(FixedCpu("x".into())));
        let reg = CommandRegistry::new();
        let result = reg.execute("nonexistent", serde_json::json!({}), &ctx);
        assert_eq!(result.status, Status::Error);
        assert_eq!(result.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[test]
    fn test_resolve_url() {
        let ctx = AppContext::headless_with_cpu(Box::new(FixedCpu("x".into())));
        let reg = CommandRegistry::new();
        let r = reg.execute("resolve_url", serde_json::json!({ "url": "muban://app/a/b.js" }), &ctx);
        assert_eq!(r.data.unwrap()["path"], "a/b.js");

        let r = reg.execute("resolve_url", serde_json::json!({ "url": "https://evil.test/" }), &ctx);
        assert_eq!(r.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[test]
    fn test_archive_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, archive) = archive_ctx(dir.path());
        let reg = CommandRegistry::new();

        let listed = reg.execute("list_entries", serde_json::json!({ "archive": archive }), &ctx);
        assert_eq!(listed.status, Status::Pass);
        assert_eq!(listed.data.unwrap()["count"], 1);

        let read = reg.execute(
            "read_entry",
            serde_json::json!({ "archive": archive, "path": "index.html" }),
            &ctx,
        );
        assert_eq!(read.data.unwrap()["content"], "<p>hello engine</p>");

        let missing = reg.execute(
            "read_entry",
            serde_json::json!({ "archive": archive, "path": "nope.html" }),
            &ctx,
        );
        assert_eq!(missing.error.unwrap().code, ErrorCode::NotFound);
    }

    #[test]
    fn test_fetch_command() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = archive_ctx(dir.path());
        let reg = CommandRegistry::new();
        let r = reg.execute("fetch", serde_json::json!({ "url": "muban://app/" }), &ctx);
        let data = r.data.unwrap();
        assert_eq!(data["status"], 200);
        assert_eq!(data["body"], "<p>hello engine</p>");

        let bare = AppContext::headless_with_cpu(Box::new(FixedCpu("x".into())));
        let r = reg.execute("fetch", serde_json::json!({ "url": "muban://app/" }), &bare);
        assert_eq!(r.error.unwrap().code, ErrorCode::Unsupported);
    }

    #[test]
    fn test_invoke_binding_command() {
        let ctx = AppContext::headless_with_cpu(Box::new(FixedCpu("Fixed CPU".into())));
        let reg = CommandRegistry::new();
        let r = reg.execute(
            "invoke_binding",
            serde_json::json!({ "name": "showSysInfo", "args": ["cpu"] }),
            &ctx,
        );
        assert_eq!(r.status, Status::Pass);
        assert_eq!(r.data.unwrap()["scripts"][0], "window.report(\"Fixed CPU\")");
    }

    #[test]
    fn test_list_commands() {
        let reg = CommandRegistry::new();
        let names = reg.list();
        for expected in ["fetch", "invoke_binding", "list_entries", "ping", "read_entry", "resolve_url", "sys_info"] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
    }
}
