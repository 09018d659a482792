//! Targeted probes – platform detection, bundled resource, extraction.
//!
//! Probes check the load path step by step without linking anything, so they
//! are safe to run on a host where the native module would misbehave.

use crate::context::PbfContext;
use crate::loader::LoaderError;
use crate::types::*;
use std::collections::HashMap;
use std::io::Read;
use std::time::Instant;

pub const PROBES: [&str; 3] = ["platform", "resource", "extract"];

/// Run a probe by name and return a full CommandResult.
pub fn run_probe(name: &str, ctx: &PbfContext) -> CommandResult {
    match name {
        "platform" => probe_platform(ctx),
        "resource" => probe_resource(ctx),
        "extract" => probe_extract(ctx),
        _ => {
            let run_id = new_run_id();
            result_err(
                "probe",
                name,
                &run_id,
                0,
                ErrorCode::InvalidInput,
                format!("unknown probe: {} (available: {})", name, PROBES.join(", ")),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Platform probe
// ---------------------------------------------------------------------------

fn probe_platform(ctx: &PbfContext) -> CommandResult {
    let run_id = new_run_id();
    let start = Instant::now();
    let platform = ctx.platform();
    let resolved = ctx.resolve();

    let mut r = result_ok("probe", "platform", &run_id, start.elapsed().as_millis() as u64);
    r.data = Some(serde_json::json!({
        "os_family": platform.os_family,
        "word_width": platform.word_width,
        "width_source": ctx.width_source(),
        "decorated_name": resolved.decorated,
        "resource_path": resolved.resource,
    }));
    r
}

// ---------------------------------------------------------------------------
// Resource probe
// ---------------------------------------------------------------------------

fn probe_resource(ctx: &PbfContext) -> CommandResult {
    let run_id = new_run_id();
    let start = Instant::now();
    let mut steps = HashMap::new();
    let resolved = ctx.resolve();
    let bundle = ctx.bundle();

    // Step 1: open
    let t0 = Instant::now();
    let opened = bundle.open(&resolved.resource);
    steps.insert("open".into(), t0.elapsed().as_millis() as u64);
    let mut reader = match opened {
        Ok(Some(reader)) => reader,
        Ok(None) => {
            let err = LoaderError::Resolution {
                resource: resolved.resource.clone(),
                platform: ctx.platform(),
                bundle: bundle.describe(),
            };
            return probe_err("resource", &run_id, start, steps, ErrorCode::from(&err), err.to_string());
        }
        Err(e) => {
            return probe_err(
                "resource",
                &run_id,
                start,
                steps,
                ErrorCode::ExtractionError,
                format!("cannot open {}: {}", resolved.resource, e),
            );
        }
    };

    // Step 2: read through
    let t1 = Instant::now();
    let mut bytes = 0u64;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => bytes += n as u64,
            Err(e) => {
                steps.insert("read".into(), t1.elapsed().as_millis() as u64);
                return probe_err(
                    "resource",
                    &run_id,
                    start,
                    steps,
                    ErrorCode::ExtractionError,
                    format!("cannot read {} after {} bytes: {}", resolved.resource, bytes, e),
                );
            }
        }
    }
    steps.insert("read".into(), t1.elapsed().as_millis() as u64);

    let mut r = result_ok("probe", "resource", &run_id, start.elapsed().as_millis() as u64);
    r.timing_ms.steps = steps;
    r.data = Some(serde_json::json!({
        "resource_path": resolved.resource,
        "bundle": bundle.describe(),
        "bytes": bytes,
    }));
    r
}

// ---------------------------------------------------------------------------
// Extract probe
// ---------------------------------------------------------------------------

fn probe_extract(ctx: &PbfContext) -> CommandResult {
    let run_id = new_run_id();
    let start = Instant::now();
    let mut steps = HashMap::new();

    let Some(loader) = ctx.loader() else {
        return result_skip(
            "probe",
            "extract",
            &run_id,
            start.elapsed().as_millis() as u64,
            "context has no module loader",
        );
    };

    // Step 1: extract to the artifact directory
    let t0 = Instant::now();
    let artifact = match loader.extract(ctx.library_name()) {
        Ok(a) => a,
        Err(e) => {
            steps.insert("extract".into(), t0.elapsed().as_millis() as u64);
            return probe_err("extract", &run_id, start, steps, ErrorCode::from(&e), e.to_string());
        }
    };
    steps.insert("extract".into(), t0.elapsed().as_millis() as u64);

    // Step 2: the file on disk matches what was copied
    let t1 = Instant::now();
    let path = artifact.path().display().to_string();
    let on_disk = std::fs::metadata(artifact.path()).map(|m| m.len());
    steps.insert("verify".into(), t1.elapsed().as_millis() as u64);
    match on_disk {
        Ok(len) if len == artifact.bytes => {}
        Ok(len) => {
            let message = format!(
                "extracted artifact {} holds {} bytes, expected {}",
                path, len, artifact.bytes
            );
            return probe_err("extract", &run_id, start, steps, ErrorCode::ExtractionError, message);
        }
        Err(e) => {
            return probe_err(
                "extract",
                &run_id,
                start,
                steps,
                ErrorCode::IoError,
                format!("extract probe failed at verify: {}", e),
            );
        }
    }

    // Step 3: cleanup
    let t2 = Instant::now();
    let bytes = artifact.bytes;
    let removed = artifact.discard();
    steps.insert("cleanup".into(), t2.elapsed().as_millis() as u64);
    if let Err(e) = removed {
        return probe_err(
            "extract",
            &run_id,
            start,
            steps,
            ErrorCode::IoError,
            format!("extract probe failed at cleanup: {}", e),
        );
    }

    let mut r = result_ok("probe", "extract", &run_id, start.elapsed().as_millis() as u64);
    r.timing_ms.steps = steps;
    r.data = Some(serde_json::json!({
        "artifact_path": path,
        "bytes": bytes,
    }));
    r
}

fn probe_err(
    target: &str,
    run_id: &str,
    start: Instant,
    steps: HashMap<String, u64>,
    code: ErrorCode,
    message: String,
) -> CommandResult {
    let mut r = result_err(
        "probe",
        target,
        run_id,
        start.elapsed().as_millis() as u64,
        code,
        message,
    );
    r.timing_ms.steps = steps;
    r
}
