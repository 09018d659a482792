//! Doctor – report how the native module would be found on this host.

use crate::context::PbfContext;
use crate::platform::{PlatformDescriptor, WordWidth, WOW64_MARKER_VAR};
use crate::types::*;
use std::time::Instant;

/// Run the doctor check and return a full report as a CommandResult.
///
/// Nothing is loaded; `loaded` only reflects what the context already did.
pub fn run_doctor(ctx: &PbfContext) -> CommandResult {
    let run_id = new_run_id();
    let start = Instant::now();

    let report = gather_report(ctx);

    let mut r = result_ok("doctor", "env", &run_id, start.elapsed().as_millis() as u64);
    r.data = Some(serde_json::to_value(&report).unwrap_or_default());
    r
}

fn gather_report(ctx: &PbfContext) -> DoctorReport {
    let platform = ctx.platform();
    DoctorReport {
        os_name: std::env::consts::OS.to_string(),
        os_version: os_version(),
        kernel: kernel_version(),
        arch: std::env::consts::ARCH.to_string(),
        os_family: platform.os_family,
        word_width: platform.word_width,
        width_source: ctx.width_source(),
        wow64_marker: std::env::var_os(WOW64_MARKER_VAR).is_some(),
        temp_dir: std::env::temp_dir().display().to_string(),
        extract_dir: ctx.extract_dir().display().to_string(),
        library: library_report(ctx),
    }
}

fn library_report(ctx: &PbfContext) -> LibraryReport {
    let resolved = ctx.resolve();
    let bundle = ctx.bundle();
    let platform = ctx.platform();

    let widths_available = [WordWidth::Bits32, WordWidth::Bits64]
        .into_iter()
        .filter(|w| {
            let candidate = PlatformDescriptor::new(platform.os_family, *w);
            bundle.contains(&candidate.resource_path(&resolved.decorated))
        })
        .collect();

    let artifact_path = ctx.artifact_path();
    LibraryReport {
        resource_present: bundle.contains(&resolved.resource),
        logical_name: resolved.logical,
        decorated_name: resolved.decorated,
        resource_path: resolved.resource,
        bundle: bundle.describe(),
        widths_available,
        loaded: artifact_path.is_some(),
        artifact_path: artifact_path.map(|p| p.display().to_string()),
    }
}

fn os_version() -> String {
    #[cfg(target_os = "macos")]
    {
        run_cmd("sw_vers", &["-productVersion"]).unwrap_or_else(|| "unknown".into())
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
            for line in content.lines() {
                if let Some(ver) = line.strip_prefix("PRETTY_NAME=") {
                    return ver.trim_matches('"').to_string();
                }
            }
        }
        "unknown".to_string()
    }
    #[cfg(windows)]
    {
        run_cmd("cmd", &["/C", "ver"]).unwrap_or_else(|| "unknown".into())
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", windows)))]
    {
        "unknown".to_string()
    }
}

fn kernel_version() -> String {
    #[cfg(unix)]
    {
        run_cmd("uname", &["-r"]).unwrap_or_else(|| "unknown".into())
    }
    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

fn run_cmd(cmd: &str, args: &[&str]) -> Option<String> {
    std::process::Command::new(cmd)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::EmbeddedBundle;
    use crate::loader::tests::{linux64, CountingLinker};
    use crate::platform::FixedProbe;
    use std::sync::Arc;

    fn ctx_with(bundle: EmbeddedBundle) -> PbfContext {
        PbfContext::new(
            &FixedProbe(linux64()),
            Arc::new(bundle),
            Box::new(CountingLinker::default()),
            "pbf",
        )
    }

    #[test]
    fn test_doctor_reports_resolution() {
        let ctx = ctx_with(EmbeddedBundle::new().with("/native/linux/64/libpbf.so", &b"x"[..]));
        let r = run_doctor(&ctx);
        assert_eq!(r.status, Status::Pass);
        let data = r.data.unwrap();
        assert_eq!(data["os_family"], "linux");
        assert_eq!(data["word_width"], "64");
        let lib = &data["library"];
        assert_eq!(lib["decorated_name"], "libpbf.so");
        assert_eq!(lib["resource_path"], "/native/linux/64/libpbf.so");
        assert_eq!(lib["resource_present"], true);
        assert_eq!(lib["loaded"], false);
        assert!(lib.get("artifact_path").is_none());
    }

    #[test]
    fn test_doctor_lists_other_widths() {
        let ctx = ctx_with(EmbeddedBundle::new().with("/native/linux/32/libpbf.so", &b"x"[..]));
        let data = run_doctor(&ctx).data.unwrap();
        let lib = &data["library"];
        assert_eq!(lib["resource_present"], false);
        assert_eq!(lib["widths_available"], serde_json::json!(["32"]));
    }
}
