//! Engine crate – host-side façade over the native PBF rendering engine.
//!
//! Selects the platform-specific build of the native module from a resource
//! bundle, extracts it to a temporary file, links it into the process and
//! exposes its commands through [`EngineFacade`]. Nothing here depends on a
//! particular host; the CLI and tests build a [`PbfContext`] and pass it in.

pub mod bundle;
pub mod commands;
pub mod context;
pub mod doctor;
pub mod facade;
pub mod loader;
pub mod platform;
pub mod port;
pub mod probes;
pub mod scenario;
pub mod traits;
pub mod types;

// Re-exports for convenience
pub use bundle::{DirBundle, EmbeddedBundle};
pub use commands::{CommandError, CommandRegistry};
pub use context::{HostSettings, PbfContext, SharedEngine};
pub use facade::{Cause, EngineError, EngineFacade, Lifecycle};
pub use loader::{LoaderError, NativeModuleLoader};
pub use platform::{OsFamily, PlatformDescriptor, WordWidth};
pub use types::{CommandResult, ErrorCode, ErrorInfo, Status};
