//! Application context – the explicit owner of the native engine.
//!
//! Consumers receive a `PbfContext` and ask it for the engine; the module is
//! loaded on the first request and every later request gets the same façade.

use crate::bundle::{DirBundle, EmbeddedBundle};
use crate::facade::EngineFacade;
use crate::loader::{decorate, LoaderError, NativeModuleLoader, Resolved, SystemLinker};
use crate::platform::{HostProbe, PlatformDescriptor, WidthSource};
use crate::port::LibraryPort;
use crate::traits::*;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

pub const DEFAULT_LIBRARY_NAME: &str = "pbf";

/// The façade as handed to consumers.
pub type SharedEngine = Arc<Mutex<EngineFacade>>;

/// How a host context is put together.
#[derive(Debug, Clone)]
pub struct HostSettings {
    pub library_name: String,
    pub resource_dir: PathBuf,
    pub extract_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("the system linker is already owned by another context in this process")]
    LinkerClaimed,
}

/// Central context passed to all engine consumers.
///
/// Holds the platform, the resource bundle and the loader so callers (CLI /
/// host application / tests) can swap implementations.
pub struct PbfContext {
    platform: PlatformDescriptor,
    width_source: WidthSource,
    bundle: Arc<dyn ResourceBundle>,
    library_name: String,
    loader: Option<NativeModuleLoader>,
    engine: Mutex<Option<SharedEngine>>,
}

impl PbfContext {
    pub fn new(
        probe: &dyn PlatformProbe,
        bundle: Arc<dyn ResourceBundle>,
        linker: Box<dyn DynamicLinker>,
        library_name: impl Into<String>,
    ) -> Self {
        let loader = NativeModuleLoader::new(probe.detect(), bundle, linker);
        Self::from_loader(loader, probe.width_source(), library_name)
    }

    /// Build around a preconfigured loader.
    pub fn from_loader(
        loader: NativeModuleLoader,
        width_source: WidthSource,
        library_name: impl Into<String>,
    ) -> Self {
        Self {
            platform: loader.platform(),
            width_source,
            bundle: loader.bundle(),
            library_name: library_name.into(),
            loader: Some(loader),
            engine: Mutex::new(None),
        }
    }

    /// Context for the running process: host probe, resources on disk and
    /// the system linker. Only one can be built per process.
    pub fn host(settings: HostSettings) -> Result<Self, ContextError> {
        let linker = SystemLinker::claim().ok_or(ContextError::LinkerClaimed)?;
        let probe = HostProbe::new();
        let bundle: Arc<dyn ResourceBundle> = Arc::new(DirBundle::new(settings.resource_dir));
        let mut loader = NativeModuleLoader::new(probe.detect(), bundle, Box::new(linker));
        if let Some(dir) = settings.extract_dir {
            loader = loader.with_extract_dir(dir);
        }
        Ok(Self::from_loader(
            loader,
            probe.width_source(),
            settings.library_name,
        ))
    }

    /// Context around an already available command port (stubs, headless
    /// runs). Nothing is loaded.
    pub fn with_port(port: Box<dyn NativeCommandPort>) -> Self {
        let probe = HostProbe::new();
        Self {
            platform: probe.detect(),
            width_source: probe.width_source(),
            bundle: Arc::new(EmbeddedBundle::new()),
            library_name: DEFAULT_LIBRARY_NAME.to_string(),
            loader: None,
            engine: Mutex::new(Some(Arc::new(Mutex::new(EngineFacade::new(port))))),
        }
    }

    pub fn platform(&self) -> PlatformDescriptor {
        self.platform
    }

    pub fn width_source(&self) -> WidthSource {
        self.width_source
    }

    pub fn bundle(&self) -> &dyn ResourceBundle {
        self.bundle.as_ref()
    }

    pub fn library_name(&self) -> &str {
        &self.library_name
    }

    pub fn loader(&self) -> Option<&NativeModuleLoader> {
        self.loader.as_ref()
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.loader
            .as_ref()
            .map(NativeModuleLoader::extract_dir)
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn resolve(&self) -> Resolved {
        let decorated = decorate(&self.library_name, self.platform.os_family);
        Resolved {
            logical: self.library_name.clone(),
            resource: self.platform.resource_path(&decorated),
            decorated,
        }
    }

    /// The engine façade, loading the native module on first use.
    ///
    /// A load failure is returned to this and every later caller; there is
    /// no partially loaded engine.
    pub fn engine(&self) -> Result<SharedEngine, LoaderError> {
        let mut slot = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }

        // port-backed contexts start with their engine in place, so only a
        // loader can get here
        let Some(loader) = &self.loader else {
            return Err(LoaderError::Resolution {
                resource: self.resolve().resource,
                platform: self.platform,
                bundle: self.bundle.describe(),
            });
        };
        let module = loader.load(&self.library_name)?;
        let port = LibraryPort::bind(module)?;

        let engine = Arc::new(Mutex::new(EngineFacade::new(Box::new(port))));
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// Whether the façade has been created.
    pub fn engine_ready(&self) -> bool {
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Resident module artifact, if one has been loaded.
    pub fn artifact_path(&self) -> Option<PathBuf> {
        let loader = self.loader.as_ref()?;
        loader
            .load_cached(&self.library_name)
            .map(|m| m.artifact_path().to_path_buf())
    }
}

impl std::fmt::Debug for PbfContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbfContext")
            .field("platform", &self.platform)
            .field("library_name", &self.library_name)
            .field("bundle", &self.bundle.describe())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::tests::ScriptedPort;
    use crate::facade::Lifecycle;
    use crate::loader::tests::{bundle_with_pbf, linux64, CountingLinker};
    use crate::platform::{FixedProbe, ProbeEnv, WordWidth};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_with_port_hands_out_one_engine() {
        let ctx = PbfContext::with_port(Box::new(ScriptedPort::default()));
        assert!(ctx.engine_ready());
        let a = ctx.engine().unwrap();
        let b = ctx.engine().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        a.lock().unwrap().init().unwrap();
        assert_eq!(b.lock().unwrap().state(), Lifecycle::Initialized);
    }

    #[test]
    fn test_missing_module_fails_every_acquisition() {
        let linker = CountingLinker::default();
        let ctx = PbfContext::new(
            &FixedProbe(linux64()),
            Arc::new(EmbeddedBundle::new()),
            Box::new(linker.clone()),
            "pbf",
        );
        assert!(matches!(ctx.engine(), Err(LoaderError::Resolution { .. })));
        assert!(matches!(ctx.engine(), Err(LoaderError::Resolution { .. })));
        assert!(!ctx.engine_ready());
        assert_eq!(linker.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_module_without_abi_does_not_leave_an_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let linker = CountingLinker::default();
        let loader = NativeModuleLoader::new(linux64(), bundle_with_pbf(), Box::new(linker.clone()))
            .with_extract_dir(tmp.path());
        let ctx = PbfContext::from_loader(loader, WidthSource::Architecture, "pbf");

        assert!(matches!(ctx.engine(), Err(LoaderError::Link { .. })));
        assert!(matches!(ctx.engine(), Err(LoaderError::Link { .. })));
        assert!(!ctx.engine_ready());
        // linked once; the symbol check fails on the cached module
        assert_eq!(linker.calls.load(Ordering::SeqCst), 1);
        assert!(ctx.artifact_path().is_some());
    }

    #[test]
    fn test_new_keeps_probe_width_source() {
        let probe = HostProbe::with_env(ProbeEnv {
            os_name: "windows".into(),
            arch: "".into(),
            wow64_marker: true,
        });
        let ctx = PbfContext::new(
            &probe,
            Arc::new(EmbeddedBundle::new()),
            Box::new(CountingLinker::default()),
            "pbf",
        );
        assert_eq!(ctx.width_source(), WidthSource::Wow64Heuristic);
        assert_eq!(ctx.platform().word_width, WordWidth::Bits64);
        assert_eq!(ctx.resolve().resource, "/native/windows/64/pbf.dll");

        let fixed = PbfContext::new(
            &FixedProbe(linux64()),
            Arc::new(EmbeddedBundle::new()),
            Box::new(CountingLinker::default()),
            "pbf",
        );
        assert_eq!(fixed.width_source(), WidthSource::Architecture);
    }

    #[test]
    fn test_resolve_uses_platform() {
        let ctx = PbfContext::new(
            &FixedProbe(linux64()),
            Arc::new(EmbeddedBundle::new()),
            Box::new(CountingLinker::default()),
            "pbf",
        );
        let r = ctx.resolve();
        assert_eq!(r.decorated, "libpbf.so");
        assert_eq!(r.resource, "/native/linux/64/libpbf.so");
        assert_eq!(ctx.library_name(), "pbf");
    }
}
