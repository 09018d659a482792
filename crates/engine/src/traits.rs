//! Capability seams – everything the core touches outside its own memory.
//!
//! Callers (CLI / host application / tests) choose the implementations and
//! hand them to [`crate::context::PbfContext`]; nothing is looked up ambiently.

use crate::platform::{PlatformDescriptor, WidthSource};
use std::io::{self, Read};
use std::path::Path;

// ---------------------------------------------------------------------------
// Platform probe
// ---------------------------------------------------------------------------

/// Determines the OS family and word width used to pick a native artifact.
pub trait PlatformProbe: Send + Sync {
    fn detect(&self) -> PlatformDescriptor;

    /// How `detect` arrived at the word width. Probes that are handed a
    /// descriptor report it as read from the architecture.
    fn width_source(&self) -> WidthSource {
        WidthSource::Architecture
    }
}

// ---------------------------------------------------------------------------
// Bundled resources
// ---------------------------------------------------------------------------

/// The application's bundled resource set, addressed by `/`-rooted paths
/// such as `/native/linux/64/libpbf.so`.
pub trait ResourceBundle: Send + Sync {
    /// Open a resource for streaming.
    ///
    /// `Ok(None)` means the bundle has no such resource; `Err` means it
    /// exists but could not be opened.
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn Read + '_>>>;

    /// Human-readable location of the bundle, for logs and diagnostics.
    fn describe(&self) -> String;

    fn contains(&self, path: &str) -> bool {
        matches!(self.open(path), Ok(Some(_)))
    }
}

// ---------------------------------------------------------------------------
// Dynamic linking
// ---------------------------------------------------------------------------

pub type LinkResult = Result<libloading::Library, Box<dyn std::error::Error + Send + Sync>>;

/// Hands an extracted artifact to the operating system's dynamic loader.
pub trait DynamicLinker: Send + Sync {
    fn link(&self, artifact: &Path) -> LinkResult;
}

// ---------------------------------------------------------------------------
// Native command port
// ---------------------------------------------------------------------------

/// The raw command surface of the native engine.
///
/// Every call forwards straight to native code and reports only whether it
/// succeeded; there is no further diagnostic detail to be had.
pub trait NativeCommandPort: Send {
    fn resized(&mut self, width: i32, height: i32) -> bool;
    fn init(&mut self) -> bool;
    fn display(&mut self) -> bool;
    fn start(&mut self) -> bool;
    fn stop(&mut self) -> bool;
    fn zoom(&mut self, factor: f32) -> bool;
    fn move_by(&mut self, dx: f32, dy: f32) -> bool;
    fn rotate(&mut self, dx: f32, dy: f32) -> bool;
    fn dispose(&mut self) -> bool;
}
