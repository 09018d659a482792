//! Command registry – the engine's command interface addressed by name.
//!
//! Commands are registered by name and invoked with JSON input/output. Every
//! engine command acquires the context's façade (loading the native module
//! on first use) and forwards one call.

use crate::context::PbfContext;
use crate::facade::{EngineError, EngineFacade};
use crate::loader::LoaderError;
use crate::types::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::PoisonError;
use std::time::Instant;

/// Signature for all engine commands.
pub type CommandHandler = fn(Value, &PbfContext) -> Result<Value, CommandError>;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Loader(#[from] LoaderError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl CommandError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CommandError::InvalidInput(_) => ErrorCode::InvalidInput,
            CommandError::Loader(e) => ErrorCode::from(e),
            CommandError::Engine(e) => ErrorCode::from(e),
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
        reg.register("state", cmd_state);
        reg.register("init", cmd_init);
        reg.register("display", cmd_display);
        reg.register("resize", cmd_resize);
        reg.register("start", cmd_start);
        reg.register("stop", cmd_stop);
        reg.register("zoom", cmd_zoom);
        reg.register("move", cmd_move);
        reg.register("rotate", cmd_rotate);
        reg.register("dispose", cmd_dispose);
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
    pub fn execute(&self, name: &str, args: Value, ctx: &PbfContext) -> CommandResult {
        let run_id = new_run_id();
        let start = Instant::now();

        let handler = match self.handlers.get(name) {
            Some(h) => h,
            None => {
                return result_err(
                    "call",
                    name,
                    &run_id,
                    start.elapsed().as_millis() as u64,
                    ErrorCode::InvalidInput,
                    format!("unknown command: {}", name),
                );
            }
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

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Run `f` on the façade and report the resulting lifecycle state.
fn with_engine(
    ctx: &PbfContext,
    f: impl FnOnce(&mut EngineFacade) -> Result<(), EngineError>,
) -> Result<Value, CommandError> {
    let engine = ctx.engine()?;
    let mut engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut *engine)?;
    Ok(serde_json::json!({ "state": engine.state() }))
}

fn f32_arg(args: &Value, key: &str) -> Result<f32, CommandError> {
    args.get(key)
        .and_then(Value::as_f64)
        .map(|v| v as f32)
        .ok_or_else(|| CommandError::InvalidInput(format!("missing '{}' number field", key)))
}

fn u32_arg(args: &Value, key: &str) -> Result<u32, CommandError> {
    let v = args
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            CommandError::InvalidInput(format!("missing '{}' non-negative integer field", key))
        })?;
    u32::try_from(v).map_err(|_| CommandError::InvalidInput(format!("'{}' is out of range", key)))
}

// ===========================================================================
// Built-in commands
// ===========================================================================

/// `ping` – returns { "pong": true } without touching the engine.
fn cmd_ping(_args: Value, _ctx: &PbfContext) -> Result<Value, CommandError> {
    Ok(serde_json::json!({ "pong": true }))
}

/// `state` – current lifecycle state. Acquires (and so loads) the engine.
fn cmd_state(_args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    with_engine(ctx, |_| Ok(()))
}

fn cmd_init(_args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    with_engine(ctx, EngineFacade::init)
}

fn cmd_display(_args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    with_engine(ctx, EngineFacade::display)
}

/// `resize` – Args: `{ "width": 800, "height": 600 }`
fn cmd_resize(args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    let width = u32_arg(&args, "width")?;
    let height = u32_arg(&args, "height")?;
    with_engine(ctx, |e| e.resize(width, height))
}

fn cmd_start(_args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    with_engine(ctx, EngineFacade::start)
}

fn cmd_stop(_args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    with_engine(ctx, EngineFacade::stop)
}

/// `zoom` – Args: `{ "factor": 1.5 }`
fn cmd_zoom(args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    let factor = f32_arg(&args, "factor")?;
    with_engine(ctx, |e| e.zoom(factor))
}

/// `move` – Args: `{ "dx": 4, "dy": -2 }`
fn cmd_move(args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    let dx = f32_arg(&args, "dx")?;
    let dy = f32_arg(&args, "dy")?;
    with_engine(ctx, |e| e.move_by(dx, dy))
}

/// `rotate` – Args: `{ "dx": 4, "dy": -2 }`
fn cmd_rotate(args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    let dx = f32_arg(&args, "dx")?;
    let dy = f32_arg(&args, "dy")?;
    with_engine(ctx, |e| e.rotate(dx, dy))
}

fn cmd_dispose(_args: Value, ctx: &PbfContext) -> Result<Value, CommandError> {
    with_engine(ctx, EngineFacade::dispose)
}

// ===========================================================================
// Tests
// ===========================================================================
