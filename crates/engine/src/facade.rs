//! Engine façade – the typed, stateful wrapper around a [`NativeCommandPort`].
//!
//! ```text
//! Uninitialized ──init──▶ Initialized ──start──▶ Running ⇄ Stopped
//!        │                     │                    │        │
//!        └─────────────────────┴──── dispose ───────┴────────┴──▶ Disposed
//! ```
//!
//! Every command goes through [`EngineFacade::forward`]: the state table is
//! checked first, then the port is called, and a `false` from native code
//! becomes the command's own [`EngineError`]. A failed command never moves
//! the state machine.

use crate::traits::NativeCommandPort;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    Running,
    Stopped,
    Disposed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Initialized => "initialized",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Init,
    Display,
    Resize,
    Start,
    Stop,
    Zoom,
    Move,
    Rotate,
    Dispose,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Init => "init",
            Command::Display => "display",
            Command::Resize => "resize",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Zoom => "zoom",
            Command::Move => "move",
            Command::Rotate => "rotate",
            Command::Dispose => "dispose",
        };
        f.write_str(s)
    }
}

/// Why a command was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// Native code reported failure. It gives no further detail.
    NativeFailure,
    /// The state machine does not allow the command; native code was not
    /// called.
    InvalidState(Lifecycle),
    /// An argument could not be forwarded; native code was not called.
    InvalidArgument(&'static str),
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::NativeFailure => f.write_str("native call returned false"),
            Cause::InvalidState(state) => write!(f, "not allowed while {}", state),
            Cause::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("could not initialize pbf: {0}")]
    Initialization(Cause),

    #[error("render failed: {0}")]
    Render(Cause),

    #[error("resize to {width}x{height} failed: {cause}")]
    Resize { width: u32, height: u32, cause: Cause },

    #[error("start failed, engine was not initialized: {0}")]
    Start(Cause),

    #[error("stop failed: {0}")]
    Stop(Cause),

    #[error("{command} failed: {cause}")]
    Transform { command: Command, cause: Cause },

    #[error("{0} called after dispose")]
    UseAfterDispose(Command),
}

impl EngineError {
    /// The refusal reason, if the error carries one.
    pub fn cause(&self) -> Option<Cause> {
        match self {
            EngineError::Initialization(c)
            | EngineError::Render(c)
            | EngineError::Start(c)
            | EngineError::Stop(c) => Some(*c),
            EngineError::Resize { cause, .. } | EngineError::Transform { cause, .. } => Some(*cause),
            EngineError::UseAfterDispose(_) => None,
        }
    }
}

const PREPARED: &[Lifecycle] = &[Lifecycle::Initialized, Lifecycle::Running, Lifecycle::Stopped];

pub struct EngineFacade {
    port: Box<dyn NativeCommandPort>,
    state: Lifecycle,
}

impl EngineFacade {
    pub fn new(port: Box<dyn NativeCommandPort>) -> Self {
        Self {
            port,
            state: Lifecycle::Uninitialized,
        }
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn init(&mut self) -> Result<(), EngineError> {
        self.forward(
            Command::Init,
            &[Lifecycle::Uninitialized],
            Some(Lifecycle::Initialized),
            |port| port.init(),
            EngineError::Initialization,
        )
    }

    pub fn display(&mut self) -> Result<(), EngineError> {
        self.forward(
            Command::Display,
            PREPARED,
            None,
            |port| port.display(),
            EngineError::Render,
        )
    }

    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), EngineError> {
        let fail = |cause| EngineError::Resize {
            width,
            height,
            cause,
        };
        let (Ok(w), Ok(h)) = (i32::try_from(width), i32::try_from(height)) else {
            self.reject_disposed(Command::Resize)?;
            return Err(fail(Cause::InvalidArgument("dimension exceeds native int range")));
        };
        self.forward(Command::Resize, PREPARED, None, |port| port.resized(w, h), fail)
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        self.forward(
            Command::Start,
            &[Lifecycle::Initialized, Lifecycle::Stopped],
            Some(Lifecycle::Running),
            |port| port.start(),
            EngineError::Start,
        )
    }

    pub fn stop(&mut self) -> Result<(), EngineError> {
        self.forward(
            Command::Stop,
            &[Lifecycle::Running],
            Some(Lifecycle::Stopped),
            |port| port.stop(),
            EngineError::Stop,
        )
    }

    pub fn zoom(&mut self, factor: f32) -> Result<(), EngineError> {
        self.forward(
            Command::Zoom,
            PREPARED,
            None,
            |port| port.zoom(factor),
            |cause| EngineError::Transform {
                command: Command::Zoom,
                cause,
            },
        )
    }

    pub fn move_by(&mut self, dx: f32, dy: f32) -> Result<(), EngineError> {
        self.forward(
            Command::Move,
            PREPARED,
            None,
            |port| port.move_by(dx, dy),
            |cause| EngineError::Transform {
                command: Command::Move,
                cause,
            },
        )
    }

    pub fn rotate(&mut self, dx: f32, dy: f32) -> Result<(), EngineError> {
        self.forward(
            Command::Rotate,
            PREPARED,
            None,
            |port| port.rotate(dx, dy),
            |cause| EngineError::Transform {
                command: Command::Rotate,
                cause,
            },
        )
    }

    /// Release the engine. Always ends in `Disposed`; a native failure is
    /// only logged.
    pub fn dispose(&mut self) -> Result<(), EngineError> {
        self.reject_disposed(Command::Dispose)?;
        if !self.port.dispose() {
            tracing::warn!(state = %self.state, "native dispose reported failure");
        }
        tracing::debug!(from = %self.state, to = %Lifecycle::Disposed, "engine disposed");
        self.state = Lifecycle::Disposed;
        Ok(())
    }

    fn reject_disposed(&self, command: Command) -> Result<(), EngineError> {
        if self.state == Lifecycle::Disposed {
            return Err(EngineError::UseAfterDispose(command));
        }
        Ok(())
    }

    /// The single translation point from native booleans to typed errors.
    fn forward(
        &mut self,
        command: Command,
        allowed: &[Lifecycle],
        next: Option<Lifecycle>,
        call: impl FnOnce(&mut dyn NativeCommandPort) -> bool,
        fail: impl FnOnce(Cause) -> EngineError,
    ) -> Result<(), EngineError> {
        self.reject_disposed(command)?;
        if !allowed.contains(&self.state) {
            tracing::debug!(%command, state = %self.state, "command refused by state machine");
            return Err(fail(Cause::InvalidState(self.state)));
        }

        tracing::debug!(%command, "forwarding to native engine");
        if !call(self.port.as_mut()) {
            tracing::warn!(%command, state = %self.state, "native command returned false");
            return Err(fail(Cause::NativeFailure));
        }

        if let Some(next) = next {
            tracing::debug!(%command, from = %self.state, to = %next, "engine state changed");
            self.state = next;
        }
        Ok(())
    }
}

impl fmt::Debug for EngineFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineFacade")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
