//! Command port bound to a loaded native module.
//!
//! The module exports one C-ABI function per command, each returning a C
//! `bool`. All symbols are resolved up front so a module that does not speak
//! the ABI is rejected at load time rather than on first use.

use crate::loader::{LoaderError, ModuleHandle};
use crate::traits::NativeCommandPort;
use std::os::raw::{c_float, c_int};
use std::sync::Arc;

type VoidFn = unsafe extern "C" fn() -> bool;
type SizeFn = unsafe extern "C" fn(c_int, c_int) -> bool;
type ScalarFn = unsafe extern "C" fn(c_float) -> bool;
type DeltaFn = unsafe extern "C" fn(c_float, c_float) -> bool;

pub const SYMBOL_RESIZED: &str = "pbf_resized";
pub const SYMBOL_INIT: &str = "pbf_init";
pub const SYMBOL_DISPLAY: &str = "pbf_display";
pub const SYMBOL_START: &str = "pbf_start";
pub const SYMBOL_STOP: &str = "pbf_stop";
pub const SYMBOL_ZOOM: &str = "pbf_zoom";
pub const SYMBOL_MOVE: &str = "pbf_move";
pub const SYMBOL_ROTATE: &str = "pbf_rotate";
pub const SYMBOL_DISPOSE: &str = "pbf_dispose";

pub const ALL_SYMBOLS: [&str; 9] = [
    SYMBOL_RESIZED,
    SYMBOL_INIT,
    SYMBOL_DISPLAY,
    SYMBOL_START,
    SYMBOL_STOP,
    SYMBOL_ZOOM,
    SYMBOL_MOVE,
    SYMBOL_ROTATE,
    SYMBOL_DISPOSE,
];

pub struct LibraryPort {
    resized: SizeFn,
    init: VoidFn,
    display: VoidFn,
    start: VoidFn,
    stop: VoidFn,
    zoom: ScalarFn,
    move_by: DeltaFn,
    rotate: DeltaFn,
    dispose: VoidFn,
    // keeps the function pointers above valid
    module: Arc<ModuleHandle>,
}

impl LibraryPort {
    pub fn bind(module: Arc<ModuleHandle>) -> Result<Self, LoaderError> {
        Ok(Self {
            resized: symbol(&module, SYMBOL_RESIZED)?,
            init: symbol(&module, SYMBOL_INIT)?,
            display: symbol(&module, SYMBOL_DISPLAY)?,
            start: symbol(&module, SYMBOL_START)?,
            stop: symbol(&module, SYMBOL_STOP)?,
            zoom: symbol(&module, SYMBOL_ZOOM)?,
            move_by: symbol(&module, SYMBOL_MOVE)?,
            rotate: symbol(&module, SYMBOL_ROTATE)?,
            dispose: symbol(&module, SYMBOL_DISPOSE)?,
            module,
        })
    }

    pub fn module(&self) -> &ModuleHandle {
        &self.module
    }
}

fn symbol<T: Copy>(module: &ModuleHandle, name: &str) -> Result<T, LoaderError> {
    let mut c_name = Vec::with_capacity(name.len() + 1);
    c_name.extend_from_slice(name.as_bytes());
    c_name.push(0);
    // SAFETY: `T` is one of the fn pointer types above, matching the
    // documented export signatures. The module is never unloaded.
    unsafe { module.library().get::<T>(&c_name) }
        .map(|s| *s)
        .map_err(|e| LoaderError::Link {
            artifact: module.artifact_path().to_path_buf(),
            reason: format!("missing symbol {}: {}", name, e),
        })
}

// SAFETY (for every call below): the pointers were resolved from a module
// that stays mapped for the life of `self.module`, and the engine accepts
// any argument values.
impl NativeCommandPort for LibraryPort {
    fn resized(&mut self, width: i32, height: i32) -> bool {
        unsafe { (self.resized)(width, height) }
    }

    fn init(&mut self) -> bool {
        unsafe { (self.init)() }
    }

    fn display(&mut self) -> bool {
        unsafe { (self.display)() }
    }

    fn start(&mut self) -> bool {
        unsafe { (self.start)() }
    }

    fn stop(&mut self) -> bool {
        unsafe { (self.stop)() }
    }

    fn zoom(&mut self, factor: f32) -> bool {
        unsafe { (self.zoom)(factor) }
    }

    fn move_by(&mut self, dx: f32, dy: f32) -> bool {
        unsafe { (self.move_by)(dx, dy) }
    }

    fn rotate(&mut self, dx: f32, dy: f32) -> bool {
        unsafe { (self.rotate)(dx, dy) }
    }

    fn dispose(&mut self) -> bool {
        unsafe { (self.dispose)() }
    }
}
