//! `pbfctl` – command-line harness for the PBF engine façade.
//!
//! Loads the native engine from the configured resource directory and drives
//! it through the same command registry a host application would use.

mod config;
mod logging;
#[cfg(unix)]
mod serve;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pbf_engine::types::*;
use pbf_engine::{CommandRegistry, CommandResult, HostSettings, PbfContext};
use std::path::{Path, PathBuf};

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(name = "pbfctl", version, about = "CLI harness for the PBF native engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report platform detection and where the native module would come from.
    Doctor {
        /// Output as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
        /// Write result JSON to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Invoke an engine command by name with JSON args.
    Call {
        /// Command name (e.g. "init", "resize", "zoom").
        cmd: String,
        /// JSON args to pass to the command.
        #[arg(long, default_value = "{}")]
        args: String,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Check one step of the load path: platform | resource | extract
    Probe {
        target: String,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Run a scripted scenario from a YAML file.
    RunScenario {
        /// Path to the scenario YAML file.
        file: PathBuf,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Keep one engine resident and serve requests over a Unix socket.
    #[cfg(unix)]
    Serve {
        /// Path for the Unix domain socket.
        #[arg(long)]
        socket: PathBuf,
    },
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    // `run` owns the context, so extracted artifacts are gone by the time
    // the process exits.
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            2
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let cfg = config::get_config().context("failed to load configuration")?;
    logging::init_logging(&cfg.logging);

    let resource_dir = match &cfg.library.resource_dir {
        Some(dir) => dir.clone(),
        None => executable_dir().context("cannot determine the executable's directory")?,
    };
    let ctx = PbfContext::host(HostSettings {
        library_name: cfg.library.name.clone(),
        resource_dir,
        extract_dir: cfg.library.extract_dir.clone(),
    })?;
    tracing::debug!(context = ?ctx, "context ready");
    let registry = CommandRegistry::new();

    let code = match cli.command {
        Commands::Doctor { json, out } => cmd_doctor(json, out, &ctx),
        Commands::Call {
            cmd,
            args,
            json,
            artifacts,
        } => cmd_call(&cmd, &args, json, artifacts, &ctx, &registry),
        Commands::Probe {
            target,
            json,
            artifacts,
        } => cmd_probe(&target, json, artifacts, &ctx),
        Commands::RunScenario {
            file,
            artifacts,
            json,
        } => cmd_run_scenario(&file, json, artifacts, &ctx, &registry),
        #[cfg(unix)]
        Commands::Serve { socket } => {
            serve::run_daemon(socket, ctx.into(), registry.into()).await?;
            0
        }
    };
    Ok(code)
}

fn executable_dir() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

// ===========================================================================
// Subcommand implementations
// ===========================================================================

fn cmd_doctor(json: bool, out: Option<PathBuf>, ctx: &PbfContext) -> i32 {
    let result = pbf_engine::doctor::run_doctor(ctx);
    if let Some(ref path) = out {
        write_result_file(path, &result);
    }
    output_result(&result, json)
}

fn cmd_call(
    cmd: &str,
    args_str: &str,
    json: bool,
    artifacts: Option<PathBuf>,
    ctx: &PbfContext,
    registry: &CommandRegistry,
) -> i32 {
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

    let result = registry.execute(cmd, args, ctx);
    if let Some(ref dir) = artifacts {
        write_artifacts(dir, &result);
    }
    output_result(&result, json)
}

fn cmd_probe(target: &str, json: bool, artifacts: Option<PathBuf>, ctx: &PbfContext) -> i32 {
    let result = pbf_engine::probes::run_probe(target, ctx);
    if let Some(ref dir) = artifacts {
        write_artifacts(dir, &result);
    }
    output_result(&result, json)
}

fn cmd_run_scenario(
    file: &Path,
    json: bool,
    artifacts: Option<PathBuf>,
    ctx: &PbfContext,
    registry: &CommandRegistry,
) -> i32 {
    let target = file.display().to_string();
    let yaml = match std::fs::read_to_string(file) {
        Ok(s) => s,
        Err(e) => {
            let r = result_err(
                "run-scenario",
                &target,
                &new_run_id(),
                0,
                ErrorCode::IoError,
                format!("cannot read scenario file: {}", e),
            );
            return output_result(&r, json);
        }
    };

    let scenario = match pbf_engine::scenario::load_scenario(&yaml) {
        Ok(s) => s,
        Err(e) => {
            let r = result_err(
                "run-scenario",
                &target,
                &new_run_id(),
                0,
                ErrorCode::InvalidInput,
                e,
            );
            return output_result(&r, json);
        }
    };

    let scenario_result = pbf_engine::scenario::run_scenario(&scenario, ctx, registry);

    if json {
        let j = serde_json::to_string_pretty(&scenario_result).unwrap_or_default();
        println!("{}", j);
    } else {
        println!(
            "Scenario: {}",
            scenario_result.name.as_deref().unwrap_or("<unnamed>")
        );
        println!("Overall: {:?}", scenario_result.overall_status);
        for (i, sr) in scenario_result.step_results.iter().enumerate() {
            println!(
                "  Step {}: {} -> {:?} ({}ms)",
                i, sr.target, sr.status, sr.timing_ms.total
            );
            if let Some(ref err) = sr.error {
                println!("    {} – {}", err.code, err.message);
            }
        }
    }

    if let Some(ref dir) = artifacts {
        let art_dir = dir.join(new_run_id());
        let events = scenario_result
            .step_results
            .iter()
            .filter_map(|sr| serde_json::to_string(sr).ok());
        write_artifact_dir(&art_dir, &scenario_result, events);
    }

    exit_code(scenario_result.overall_status)
}

// ===========================================================================
// Output helpers
// ===========================================================================

fn exit_code(status: Status) -> i32 {
    match status {
        Status::Pass | Status::Skip => 0,
        Status::Fail => 1,
        Status::Error => 2,
    }
}

fn output_result(result: &CommandResult, json: bool) -> i32 {
    if json {
        let j = serde_json::to_string_pretty(result).unwrap_or_default();
        println!("{}", j);
    } else {
        print_human(result);
    }
    exit_code(result.status)
}

fn print_human(r: &CommandResult) {
    let status_icon = match r.status {
        Status::Pass => "PASS",
        Status::Fail => "FAIL",
        Status::Skip => "SKIP",
        Status::Error => "ERROR",
    };

    println!("[{}] {} {}", status_icon, r.command, r.target);
    println!("  run_id: {}", r.run_id);
    println!("  timing: {}ms", r.timing_ms.total);

    let mut steps: Vec<_> = r.timing_ms.steps.iter().collect();
    steps.sort();
    for (step, ms) in steps {
        println!("    {}: {}ms", step, ms);
    }

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

    println!(
        "  env: os={} arch={} platform={}/{}",
        r.env_summary.os, r.env_summary.arch, r.env_summary.os_family, r.env_summary.word_width
    );
}

// ===========================================================================
// Artifact helpers
// ===========================================================================

fn write_result_file(path: &Path, result: &CommandResult) {
    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    if let Err(e) = std::fs::write(path, &j) {
        tracing::warn!(path = %path.display(), error = %e, "failed to write result file");
    }
}

fn write_artifacts(dir: &Path, result: &CommandResult) {
    let events = serde_json::to_string(result).ok();
    write_artifact_dir(&dir.join(&result.run_id), result, events);
}

/// `result.json` plus one JSON line per event in `events.jsonl`.
fn write_artifact_dir<T: serde::Serialize>(
    art_dir: &Path,
    result: &T,
    events: impl IntoIterator<Item = String>,
) {
    if let Err(e) = std::fs::create_dir_all(art_dir) {
        tracing::warn!(dir = %art_dir.display(), error = %e, "failed to create artifacts dir");
        return;
    }

    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    if let Err(e) = std::fs::write(art_dir.join("result.json"), j) {
        tracing::warn!(dir = %art_dir.display(), error = %e, "failed to write result.json");
    }

    let mut lines = String::new();
    for line in events {
        lines.push_str(&line);
        lines.push('\n');
    }
    if let Err(e) = std::fs::write(art_dir.join("events.jsonl"), lines) {
        tracing::warn!(dir = %art_dir.display(), error = %e, "failed to write events.jsonl");
    }
}
