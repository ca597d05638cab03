//! Doctor – gather environment and archive facts for diagnostics.

use crate::archive::Archive;
use crate::context::AppContext;
use crate::types::*;
use std::time::Instant;

/// Run the doctor check and return a full report as a CommandResult.
pub fn run_doctor(ctx: &AppContext) -> CommandResult {
    let run_id = new_run_id();
    let start = Instant::now();

    let report = gather_report(ctx);

    let mut r = result_ok("doctor", "env", &run_id, start.elapsed().as_millis() as u64);
    r.data = Some(serde_json::to_value(&report).unwrap_or_default());
    r
}

fn gather_report(ctx: &AppContext) -> DoctorReport {
    DoctorReport {
        os_name: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        headless: detect_headless(),
        display_server: display_server(),
        cpu: ctx.cpu().snapshot(),
        executable: std::env::current_exe()
            .ok()
            .map(|p| p.display().to_string()),
        archive: archive_status(ctx),
    }
}

fn archive_status(ctx: &AppContext) -> ArchiveStatus {
    let mut status = ArchiveStatus {
        found: false,
        path: None,
        appended: false,
        entries: 0,
        encrypted_entries: 0,
        error: None,
    };
    let Some(location) = ctx.protocol().and_then(|p| p.archive_location()) else {
        status.error = Some("no archive location configured".into());
        return status;
    };
    match Archive::open_colocated(&location) {
        Ok(archive) => {
            let entries = archive.list();
            status.found = true;
            status.path = Some(archive.path().display().to_string());
            status.appended = archive.is_appended();
            status.encrypted_entries = entries.iter().filter(|e| e.encrypted).count();
            status.entries = entries.len();
        }
        Err(e) => {
            status.path = Some(location.display().to_string());
            status.error = Some(e.to_string());
        }
    }
    status
}

fn display_server() -> Option<String> {
    if let Ok(d) = std::env::var("WAYLAND_DISPLAY") {
        return Some(format!("wayland ({})", d));
    }
    if let Ok(d) = std::env::var("DISPLAY") {
        return Some(format!("x11 ({})", d));
    }
    match std::env::consts::OS {
        "macos" => Some("quartz".to_string()),
        "windows" => Some("win32".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::FixedCpu;

    #[test]
    fn test_doctor_without_archive() {
        let ctx = AppContext::headless_with_cpu(Box::new(FixedCpu("Doctor CPU".into())));
        let r = run_doctor(&ctx);
        assert_eq!(r.status, Status::Pass);
        let data = r.data.unwrap();
        assert_eq!(data["cpu"]["brand"], "Doctor CPU");
        assert_eq!(data["archive"]["found"], false);
    }
}
