//! `mubanctl` – packs app archives and drives the muban engine headlessly.
//!
//! Runs the same engine logic that serves the GUI's `muban://` scheme, but
//! without a window server, so archives and bindings can be checked in CI.

#[cfg(unix)]
mod serve;

use clap::{Args, Parser, Subcommand};
use engine::archive::{Archive, ArchiveBuilder, ArchiveError};
use engine::cipher::{read_key_file, Decipher};
use engine::platform::{FixedExecutable, StdExecutable};
use engine::types::*;
use engine::{AppContext, ArchiveSource, BindingRegistry, CommandRegistry, CommandResult, ProtocolConfig, ProtocolHandler};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(
    name = "mubanctl",
    version,
    about = "Archive packer and CLI harness for muban"
)]
struct Cli {
    /// Emit logs on stderr as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where the archive lives and how to decrypt it.
#[derive(Args, Clone, Default)]
struct ArchiveOpts {
    /// Archive file to read (standalone or appended to an executable).
    #[arg(long)]
    archive: Option<PathBuf>,
    /// Treat this file as the app executable (appended archive or sidecar app.asar).
    #[arg(long, conflicts_with = "archive")]
    exe: Option<PathBuf>,
    /// File holding the 16-byte encryption key.
    #[arg(long, env = "MUBAN_KEY_FILE")]
    key_file: Option<PathBuf>,
    /// 16-byte IV string.
    #[arg(long, default_value = "yue is good lib!")]
    iv: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a directory into an archive.
    Pack {
        /// Directory whose contents become the archive root.
        src: PathBuf,
        /// Output file.
        #[arg(long)]
        out: PathBuf,
        /// Encrypt entries with the key in this file.
        #[arg(long, env = "MUBAN_KEY_FILE")]
        key_file: Option<PathBuf>,
        /// 16-byte IV string.
        #[arg(long, default_value = "yue is good lib!")]
        iv: String,
        /// Glob of paths to keep outside the archive (repeatable).
        #[arg(long)]
        unpack: Vec<String>,
        /// Append the archive to a copy of this executable instead of
        /// writing a standalone archive.
        #[arg(long)]
        append_to: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// List the files in an archive.
    List {
        archive: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Extract one file, decrypting it if needed.
    Extract {
        /// In-archive path, e.g. "index.html".
        path: String,
        /// Write here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        opts: ArchiveOpts,
    },

    /// Check every entry against its integrity hash.
    Verify {
        archive: PathBuf,
        #[arg(long)]
        json: bool,
    },

    /// Serve a URL through the protocol handler, as the webview would.
    Fetch {
        /// e.g. "muban://app/index.html"
        url: String,
        #[command(flatten)]
        opts: ArchiveOpts,
        #[arg(long)]
        json: bool,
    },

    /// Invoke an engine command by name with JSON args.
    Call {
        /// Command name (e.g. "ping", "fetch", "invoke_binding").
        cmd: String,
        /// JSON args to pass to the command.
        #[arg(long, default_value = "{}")]
        args: String,
        #[command(flatten)]
        opts: ArchiveOpts,
        #[arg(long)]
        json: bool,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Collect environment and archive facts.
    Doctor {
        #[command(flatten)]
        opts: ArchiveOpts,
        #[arg(long)]
        json: bool,
        /// Write result JSON to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Start daemon mode over a Unix socket.
    #[cfg(unix)]
    Serve {
        /// Path for the Unix domain socket.
        #[arg(long)]
        socket: PathBuf,
        #[command(flatten)]
        opts: ArchiveOpts,
    },
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Pack {
            src,
            out,
            key_file,
            iv,
            unpack,
            append_to,
            json,
        } => cmd_pack(&src, &out, key_file.as_deref(), &iv, &unpack, append_to.as_deref(), json),
        Commands::List { archive, json } => cmd_list(&archive, json),
        Commands::Extract { path, out, opts } => cmd_extract(&path, out.as_deref(), &opts),
        Commands::Verify { archive, json } => cmd_verify(&archive, json),
        Commands::Fetch { url, opts, json } => cmd_fetch(&url, &opts, json),
        Commands::Call {
            cmd,
            args,
            opts,
            json,
            artifacts,
        } => cmd_call(&cmd, &args, &opts, json, artifacts),
        Commands::Doctor { opts, json, out } => cmd_doctor(&opts, json, out),
        #[cfg(unix)]
        Commands::Serve { socket, opts } => match build_context(&opts) {
            Ok(ctx) => serve::run_daemon(socket, ctx, CommandRegistry::new()).await,
            Err(r) => output_result(&r, false),
        },
    }
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ===========================================================================
// Context construction
// ===========================================================================

fn load_decipher(key_file: Option<&Path>, iv: &str) -> Result<Option<Decipher>, String> {
    let Some(path) = key_file else {
        return Ok(None);
    };
    let key = read_key_file(path).map_err(|e| e.to_string())?;
    Decipher::new(&key, iv.as_bytes())
        .map(Some)
        .map_err(|e| e.to_string())
}

fn build_context(opts: &ArchiveOpts) -> Result<AppContext, CommandResult> {
    let decipher = load_decipher(opts.key_file.as_deref(), &opts.iv)
        .map_err(|e| result_err("setup", "key", &new_run_id(), 0, ErrorCode::InvalidInput, e))?;

    let handler = match (&opts.archive, &opts.exe) {
        (Some(path), _) => ProtocolHandler::new(
            ProtocolConfig::default(),
            ArchiveSource::Path(path.clone()),
            Box::new(StdExecutable),
            decipher,
        ),
        (None, Some(exe)) => ProtocolHandler::new(
            ProtocolConfig::default(),
            ArchiveSource::Executable,
            Box::new(FixedExecutable(Some(exe.clone()))),
            decipher,
        ),
        (None, None) => return Ok(AppContext::headless()),
    };
    Ok(AppContext::default_platform(handler))
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

fn cmd_pack(
    src: &Path,
    out: &Path,
    key_file: Option<&Path>,
    iv: &str,
    unpack: &[String],
    append_to: Option<&Path>,
    json: bool,
) {
    let run_id = new_run_id();
    let start = Instant::now();
    let target = out.display().to_string();
    let fail = |code: ErrorCode, msg: String| {
        result_err("pack", &target, &run_id, start.elapsed().as_millis() as u64, code, msg)
    };

    let decipher = match load_decipher(key_file, iv) {
        Ok(d) => d,
        Err(e) => return output_result(&fail(ErrorCode::InvalidInput, e), json),
    };

    let mut builder = ArchiveBuilder::new();
    if let Some(d) = decipher.clone() {
        builder = builder.encrypt_with(d);
    }
    for pattern in unpack {
        builder = match builder.unpack(pattern) {
            Ok(b) => b,
            Err(e) => return output_result(&fail(ErrorCode::InvalidInput, e.to_string()), json),
        };
    }
    if let Err(e) = builder.add_dir(src) {
        return output_result(&fail(ErrorCode::IoError, e.to_string()), json);
    }

    let written = match append_to {
        Some(exe) => builder.append_to(exe, out),
        None => builder.write_to(out),
    };
    match written {
        Ok(bytes) => {
            tracing::info!(out = %out.display(), bytes, encrypted = decipher.is_some(), "archive written");
            let mut r = result_ok("pack", &target, &run_id, start.elapsed().as_millis() as u64);
            r.data = Some(serde_json::json!({
                "archive_bytes": bytes,
                "encrypted": decipher.is_some(),
                "appended_to": append_to.map(|p| p.display().to_string()),
            }));
            output_result(&r, json);
        }
        Err(e) => output_result(&fail(ErrorCode::IoError, e.to_string()), json),
    }
}

fn cmd_list(archive: &Path, json: bool) {
    let ctx = AppContext::headless();
    let args = serde_json::json!({ "archive": archive.display().to_string() });
    let result = CommandRegistry::new().execute("list_entries", args, &ctx);
    if json || result.status != Status::Pass {
        return output_result(&result, json);
    }
    // Human output: one path per line, like `asar list`.
    if let Some(entries) = result
        .data
        .as_ref()
        .and_then(|d| d["entries"].as_array())
    {
        for e in entries {
            let mut flags = String::new();
            if e["encrypted"] == true {
                flags.push_str(" [encrypted]");
            }
            if e["unpacked"] == true {
                flags.push_str(" [unpacked]");
            }
            println!("/{}{}", e["path"].as_str().unwrap_or_default(), flags);
        }
    }
}

fn cmd_extract(path: &str, out: Option<&Path>, opts: &ArchiveOpts) {
    let run_id = new_run_id();
    let start = Instant::now();
    let fail = |code: ErrorCode, msg: String| {
        result_err("extract", path, &run_id, start.elapsed().as_millis() as u64, code, msg)
    };

    let decipher = match load_decipher(opts.key_file.as_deref(), &opts.iv) {
        Ok(d) => d,
        Err(e) => return output_result(&fail(ErrorCode::InvalidInput, e), false),
    };
    let opened = match (&opts.archive, &opts.exe) {
        (Some(a), _) => Archive::open(a),
        (None, Some(exe)) => Archive::open_colocated(exe),
        (None, None) => {
            return output_result(
                &fail(ErrorCode::InvalidInput, "one of --archive or --exe is required".into()),
                false,
            )
        }
    };
    let archive = match opened {
        Ok(a) => a,
        Err(e) => return output_result(&fail(archive_error_code(&e), e.to_string()), false),
    };
    let data = match archive.read(path, decipher.as_ref()) {
        Ok(d) => d,
        Err(e) => return output_result(&fail(archive_error_code(&e), e.to_string()), false),
    };

    match out {
        Some(out) => {
            if let Err(e) = std::fs::write(out, &data) {
                return output_result(&fail(ErrorCode::IoError, e.to_string()), false);
            }
            eprintln!("wrote {} bytes to {}", data.len(), out.display());
        }
        None => {
            if let Err(e) = write_entry(&data, &mut std::io::stdout().lock()) {
                return output_result(&fail(ErrorCode::IoError, e.to_string()), false);
            }
        }
    }
}

fn write_entry(data: &[u8], w: &mut impl Write) -> std::io::Result<()> {
    w.write_all(data)?;
    w.flush()
}

fn archive_error_code(e: &ArchiveError) -> ErrorCode {
    match e {
        ArchiveError::NotFound(_) | ArchiveError::IsDirectory(_) => ErrorCode::NotFound,
        ArchiveError::InvalidPath(_) => ErrorCode::InvalidInput,
        ArchiveError::MissingKey(_) | ArchiveError::Cipher(_) => ErrorCode::DecryptFailed,
        ArchiveError::Io(_) => ErrorCode::IoError,
        _ => ErrorCode::CorruptArchive,
    }
}

fn cmd_verify(archive_path: &Path, json: bool) {
    let run_id = new_run_id();
    let start = Instant::now();
    let target = archive_path.display().to_string();

    let archive = match Archive::open(archive_path) {
        Ok(a) => a,
        Err(e) => {
            let r = result_err(
                "verify",
                &target,
                &run_id,
                start.elapsed().as_millis() as u64,
                ErrorCode::CorruptArchive,
                e.to_string(),
            );
            return output_result(&r, json);
        }
    };

    let mut failed = Vec::new();
    let entries = archive.list();
    for entry in &entries {
        if let Err(e) = archive.verify(&entry.path) {
            failed.push(serde_json::json!({ "path": entry.path, "error": e.to_string() }));
        }
    }

    let mut r = result_ok("verify", &target, &run_id, start.elapsed().as_millis() as u64);
    if !failed.is_empty() {
        r.status = Status::Fail;
        r.error = Some(ErrorInfo {
            code: ErrorCode::CorruptArchive,
            message: format!("{} of {} entries failed verification", failed.len(), entries.len()),
            details: serde_json::Value::Array(failed.clone()),
        });
    }
    r.data = Some(serde_json::json!({ "checked": entries.len(), "failed": failed }));
    output_result(&r, json);
}

fn cmd_fetch(url: &str, opts: &ArchiveOpts, json: bool) {
    let ctx = match build_context(opts) {
        Ok(c) => c,
        Err(r) => return output_result(&r, json),
    };
    let result = CommandRegistry::new().execute("fetch", serde_json::json!({ "url": url }), &ctx);
    output_result(&result, json);
}

fn cmd_call(cmd: &str, args_str: &str, opts: &ArchiveOpts, json: bool, artifacts: Option<PathBuf>) {
    let args: serde_json::Value = match serde_json::from_str(args_str) {
        Ok(v) => v,
        Err(e) => {
            let r = result_err(
                "call",
                cmd,
                &new_run_id(),
                0,
                ErrorCode::InvalidInput,
                format!("invalid JSON args: {}", e),
            );
            return output_result(&r, json);
        }
    };
    let ctx = match build_context(opts) {
        Ok(c) => c,
        Err(r) => return output_result(&r, json),
    };

    let result = CommandRegistry::new().execute(cmd, args, &ctx);
    if let Some(ref dir) = artifacts {
        write_artifacts(dir, &result);
    }
    output_result(&result, json);
}

fn cmd_doctor(opts: &ArchiveOpts, json: bool, out: Option<PathBuf>) {
    let ctx = match build_context(opts) {
        Ok(c) => c,
        // Doctor should still report the machine without an archive.
        Err(_) => AppContext::new(
            Box::new(engine::platform::SystemCpu),
            None,
            BindingRegistry::default(),
        ),
    };
    let result = engine::doctor::run_doctor(&ctx);
    if let Some(ref path) = out {
        write_result_file(path, &result);
    }
    output_result(&result, json);
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn output_result(result: &CommandResult, json: bool) {
    if json {
        let j = serde_json::to_string_pretty(result).unwrap_or_default();
        println!("{}", j);
    } else {
        print_human(result);
    }

    // Exit with non-zero status on error/fail
    match result.status {
        Status::Pass | Status::Skip => {}
        Status::Fail => std::process::exit(1),
        Status::Error => std::process::exit(2),
    }
}

fn print_human(r: &CommandResult) {
    let status_icon = match r.status {
        Status::Pass => "PASS",
        Status::Fail => "FAIL",
        Status::Skip => "SKIP",
        Status::Error => "ERROR",
    };

    println!("[{}] {} {}", status_icon, r.command, r.target);
    println!("  timing: {}ms", r.timing_ms.total);

    if let Some(ref err) = r.error {
        println!("  error:  {} – {}", err.code, err.message);
    }

    if let Some(ref data) = r.data {
        if let Ok(s) = serde_json::to_string_pretty(data) {
            for line in s.lines() {
                println!("  {}", line);
            }
        }
    }
}

// ===========================================================================
// Artifact helpers
// ===========================================================================

fn write_result_file(path: &Path, result: &CommandResult) {
    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    if let Err(e) = std::fs::write(path, &j) {
        eprintln!(
            "warning: failed to write result to {}: {}",
            path.display(),
            e
        );
    }
}

fn write_artifacts(dir: &Path, result: &CommandResult) {
    let art_dir = dir.join(&result.run_id);
    if let Err(e) = std::fs::create_dir_all(&art_dir) {
        eprintln!(
            "warning: failed to create artifacts dir {}: {}",
            art_dir.display(),
            e
        );
        return;
    }
    write_result_file(&art_dir.join("result.json"), result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use engine::cipher::DEFAULT_IV;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_iv_matches_engine() {
        let cli = Cli::parse_from(["mubanctl", "fetch", "muban://app/", "--archive", "a.asar"]);
        let Commands::Fetch { opts, .. } = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(opts.iv.as_bytes(), DEFAULT_IV);
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_entry_reports_write_errors() {
        let err = write_entry(b"<h1>hi</h1>", &mut ClosedPipe).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        let mut buf = Vec::new();
        write_entry(b"<h1>hi</h1>", &mut buf).unwrap();
        assert_eq!(buf, b"<h1>hi</h1>");
    }

    #[test]
    fn test_archive_and_exe_conflict() {
        let parsed = Cli::try_parse_from([
            "mubanctl", "fetch", "muban://app/", "--archive", "a.asar", "--exe", "muban",
        ]);
        assert!(parsed.is_err());
    }
}
