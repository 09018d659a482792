//! Native module loader – resolve, extract and link a bundled shared library.
//!
//! A load goes through four stages:
//!
//! 1. decorate the logical name for the platform (`pbf` → `libpbf.so`)
//! 2. resolve `/native/<family>/<width>/<file>` in the resource bundle
//! 3. stream the resource into a fresh temporary file
//! 4. hand the temporary file to the [`DynamicLinker`]
//!
//! Outcomes are cached per decorated name, so each module is extracted and
//! linked at most once per loader, however many threads ask for it.

use crate::platform::{OsFamily, PlatformDescriptor};
use crate::traits::{DynamicLinker, LinkResult, ResourceBundle};
use libloading::Library;
use std::collections::HashMap;
use std::io::{self, Write};
use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::TempPath;

/// Extensions that mark a name as already decorated.
pub const DECORATED_SUFFIXES: [&str; 4] = [".so", ".dylib", ".dll", ".jnilib"];

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoaderError {
    #[error("no bundled resource {resource} for platform {platform} in {bundle}")]
    Resolution {
        resource: String,
        platform: PlatformDescriptor,
        bundle: String,
    },

    #[error("could not extract {resource}: {source}")]
    Extraction {
        resource: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("loader rejected {}: {reason}", .artifact.display())]
    Link { artifact: PathBuf, reason: String },
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Platform file name for a logical library name. Names that already carry a
/// shared-library extension are returned unchanged.
pub fn decorate(name: &str, family: OsFamily) -> String {
    if DECORATED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        return name.to_string();
    }
    format!(
        "{}{}{}",
        family.library_prefix(),
        name,
        family.library_suffix()
    )
}

/// Split `libpbf.so` into (`libpbf`, `.so`).
fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(i) if i > 0 => file_name.split_at(i),
        _ => (file_name, ""),
    }
}

/// Where a logical name resolves to on the current platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub logical: String,
    pub decorated: String,
    pub resource: String,
}

// ---------------------------------------------------------------------------
// Extracted artifacts and module handles
// ---------------------------------------------------------------------------

/// A bundled resource materialised on disk. The file is deleted when the
/// artifact is dropped.
#[derive(Debug)]
pub struct Artifact {
    pub resource: String,
    pub bytes: u64,
    path: TempPath,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now and report whether that worked.
    pub fn discard(self) -> io::Result<()> {
        self.path.close()
    }
}

/// A native module resident in this process.
///
/// The library image is never unloaded. The extracted file is removed when
/// the last reference to the handle goes away, which in practice is when the
/// owning loader is torn down at shutdown.
pub struct ModuleHandle {
    name: String,
    resource: String,
    artifact_path: PathBuf,
    artifact: Option<TempPath>,
    library: ManuallyDrop<Library>,
}

impl ModuleHandle {
    /// Decorated file name, e.g. `libpbf.so`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_path(&self) -> &str {
        &self.resource
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub(crate) fn library(&self) -> &Library {
        &self.library
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .field("artifact_path", &self.artifact_path)
            .finish_non_exhaustive()
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        if let Some(artifact) = self.artifact.take() {
            // Windows refuses to delete a mapped DLL; leave it for the OS.
            if let Err(e) = artifact.close() {
                tracing::warn!(
                    artifact = %self.artifact_path.display(),
                    error = %e,
                    "could not delete extracted native module"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// System linker
// ---------------------------------------------------------------------------

static SYSTEM_LINKER_CLAIMED: AtomicBool = AtomicBool::new(false);

/// The operating system's dynamic loader.
///
/// Loaded images cannot be unloaded, so only one of these may exist per
/// process: a second loader linking the same library would map a second copy
/// of it.
#[derive(Debug)]
pub struct SystemLinker {
    _claim: (),
}

impl SystemLinker {
    /// Claim the process's linker. Returns `None` once it has been claimed.
    pub fn claim() -> Option<Self> {
        SYSTEM_LINKER_CLAIMED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { _claim: () })
    }
}

impl DynamicLinker for SystemLinker {
    fn link(&self, artifact: &Path) -> LinkResult {
        // SAFETY: loading runs the module's initialisers. The artifact was
        // just written by us from the application's own bundle.
        let library = unsafe { Library::new(artifact) }?;
        Ok(library)
    }
}

// ===========================================================================
// Loader
// ===========================================================================

type LoadOutcome = Result<Arc<ModuleHandle>, LoaderError>;

pub struct NativeModuleLoader {
    platform: PlatformDescriptor,
    bundle: Arc<dyn ResourceBundle>,
    linker: Box<dyn DynamicLinker>,
    extract_dir: Option<PathBuf>,
    modules: Mutex<HashMap<String, LoadOutcome>>,
}

impl NativeModuleLoader {
    pub fn new(
        platform: PlatformDescriptor,
        bundle: Arc<dyn ResourceBundle>,
        linker: Box<dyn DynamicLinker>,
    ) -> Self {
        Self {
            platform,
            bundle,
            linker,
            extract_dir: None,
            modules: Mutex::new(HashMap::new()),
        }
    }

    /// Extract into `dir` instead of the system temp directory.
    pub fn with_extract_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extract_dir = Some(dir.into());
        self
    }

    pub fn platform(&self) -> PlatformDescriptor {
        self.platform
    }

    pub fn bundle(&self) -> Arc<dyn ResourceBundle> {
        self.bundle.clone()
    }

    pub fn extract_dir(&self) -> PathBuf {
        self.extract_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn resolve(&self, logical_name: &str) -> Resolved {
        let decorated = decorate(logical_name, self.platform.os_family);
        Resolved {
            logical: logical_name.to_string(),
            resource: self.platform.resource_path(&decorated),
            decorated,
        }
    }

    /// Names of modules that are resident (successful loads only).
    pub fn loaded(&self) -> Vec<String> {
        let modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = modules
            .iter()
            .filter(|(_, outcome)| outcome.is_ok())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// The module for `logical_name` if an earlier load succeeded.
    pub fn load_cached(&self, logical_name: &str) -> Option<Arc<ModuleHandle>> {
        let resolved = self.resolve(logical_name);
        let modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        modules.get(&resolved.decorated)?.as_ref().ok().cloned()
    }

    /// Load a module, or return the outcome of the earlier attempt.
    ///
    /// The registry lock is held for the whole extract-and-link sequence, so
    /// racing first callers block until the winner finishes and then see its
    /// result.
    pub fn load(&self, logical_name: &str) -> Result<Arc<ModuleHandle>, LoaderError> {
        let resolved = self.resolve(logical_name);
        let mut modules = self.modules.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outcome) = modules.get(&resolved.decorated) {
            return outcome.clone();
        }

        let outcome = self
            .extract(logical_name)
            .and_then(|artifact| self.link(&resolved, artifact));
        match &outcome {
            Ok(handle) => tracing::info!(
                module = %handle.name,
                resource = %handle.resource,
                artifact = %handle.artifact_path.display(),
                "native module loaded"
            ),
            Err(e) => tracing::error!(module = %resolved.decorated, error = %e, "native module load failed"),
        }
        modules.insert(resolved.decorated, outcome.clone());
        outcome
    }

    /// Materialise the bundled resource for `logical_name` without linking
    /// it. The resource is resolved before any file is created.
    pub fn extract(&self, logical_name: &str) -> Result<Artifact, LoaderError> {
        let resolved = self.resolve(logical_name);
        let extraction = |source: io::Error| LoaderError::Extraction {
            resource: resolved.resource.clone(),
            source: Arc::new(source),
        };

        let mut reader = self
            .bundle
            .open(&resolved.resource)
            .map_err(extraction)?
            .ok_or_else(|| LoaderError::Resolution {
                resource: resolved.resource.clone(),
                platform: self.platform,
                bundle: self.bundle.describe(),
            })?;

        let (stem, extension) = split_extension(&resolved.decorated);
        let prefix = format!("{}-", stem);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(extension);
        let mut file = match &self.extract_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(extraction)?;

        // A failed copy drops `file`, which deletes the partial artifact.
        let bytes = io::copy(&mut reader, &mut file).map_err(extraction)?;
        file.flush().map_err(extraction)?;
        drop(reader);

        tracing::debug!(
            resource = %resolved.resource,
            bytes,
            artifact = %file.path().display(),
            "extracted native module"
        );
        Ok(Artifact {
            resource: resolved.resource,
            bytes,
            path: file.into_temp_path(),
        })
    }

    fn link(&self, resolved: &Resolved, artifact: Artifact) -> Result<Arc<ModuleHandle>, LoaderError> {
        let library = self
            .linker
            .link(artifact.path())
            .map_err(|e| LoaderError::Link {
                artifact: artifact.path().to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Arc::new(ModuleHandle {
            name: resolved.decorated.clone(),
            artifact_path: artifact.path().to_path_buf(),
            resource: artifact.resource,
            artifact: Some(artifact.path),
            library: ManuallyDrop::new(library),
        }))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bundle::EmbeddedBundle;
    use crate::platform::WordWidth;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    /// Handle to the running process, standing in for a freshly linked module.
    pub(crate) fn this_process() -> Library {
        #[cfg(unix)]
        {
            libloading::os::unix::Library::this().into()
        }
        #[cfg(windows)]
        {
            libloading::os::windows::Library::this()
                .expect("process handle")
                .into()
        }
    }

    /// Linker that counts calls and either hands out the process handle or
    /// rejects every artifact.
    #[derive(Clone, Default)]
    pub(crate) struct CountingLinker {
        pub calls: Arc<AtomicUsize>,
        pub reject: bool,
        pub seen: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl DynamicLinker for CountingLinker {
        fn link(&self, artifact: &Path) -> LinkResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(artifact.to_path_buf());
            // widen the window for racing callers
            std::thread::sleep(Duration::from_millis(20));
            if self.reject {
                return Err("wrong ELF class".into());
            }
            Ok(this_process())
        }
    }

    pub(crate) fn linux64() -> PlatformDescriptor {
        PlatformDescriptor::new(OsFamily::Linux, WordWidth::Bits64)
    }

    pub(crate) fn bundle_with_pbf() -> Arc<dyn ResourceBundle> {
        Arc::new(EmbeddedBundle::new().with("/native/linux/64/libpbf.so", &b"\x7fELF fake module"[..]))
    }

    /// Bundle holding `/native/linux/64/libpbf.so` that cannot be read:
    /// opening fails, or reading fails after a few bytes.
    pub(crate) struct BrokenBundle {
        pub fail_open: bool,
    }

    struct DeviceGone;

    impl io::Read for DeviceGone {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("device went away"))
        }
    }

    impl ResourceBundle for BrokenBundle {
        fn open(&self, path: &str) -> io::Result<Option<Box<dyn io::Read + '_>>> {
            if path != "/native/linux/64/libpbf.so" {
                return Ok(None);
            }
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"));
            }
            let head: &'static [u8] = b"\x7fELF partial";
            Ok(Some(Box::new(io::Read::chain(head, DeviceGone))))
        }

        fn describe(&self) -> String {
            "broken".into()
        }
    }

    fn dir_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_decorate_per_family() {
        assert_eq!(decorate("pbf", OsFamily::Linux), "libpbf.so");
        assert_eq!(decorate("pbf", OsFamily::Mac), "libpbf.dylib");
        assert_eq!(decorate("pbf", OsFamily::Windows), "pbf.dll");
        // already decorated names pass through
        assert_eq!(decorate("libpbf_jni.jnilib", OsFamily::Windows), "libpbf_jni.jnilib");
        assert_eq!(decorate("libpbf.so", OsFamily::Mac), "libpbf.so");
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("libpbf.so"), ("libpbf", ".so"));
        assert_eq!(split_extension("pbf"), ("pbf", ""));
        assert_eq!(split_extension(".hidden"), (".hidden", ""));
    }

    #[test]
    fn test_resolve_builds_resource_path() {
        let loader = NativeModuleLoader::new(
            PlatformDescriptor::new(OsFamily::Windows, WordWidth::Bits32),
            Arc::new(EmbeddedBundle::new()),
            Box::new(CountingLinker::default()),
        );
        let r = loader.resolve("pbf");
        assert_eq!(r.decorated, "pbf.dll");
        assert_eq!(r.resource, "/native/windows/32/pbf.dll");
    }

    #[test]
    fn test_load_extracts_and_links() {
        let tmp = tempfile::tempdir().unwrap();
        let linker = CountingLinker::default();
        let loader = NativeModuleLoader::new(linux64(), bundle_with_pbf(), Box::new(linker.clone()))
            .with_extract_dir(tmp.path());

        let handle = loader.load("pbf").unwrap();
        assert_eq!(handle.name(), "libpbf.so");
        assert_eq!(handle.resource_path(), "/native/linux/64/libpbf.so");

        let file_name = handle.artifact_path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("libpbf-"), "{}", file_name);
        assert!(file_name.ends_with(".so"), "{}", file_name);
        assert_eq!(std::fs::read(handle.artifact_path()).unwrap(), b"\x7fELF fake module");
        assert_eq!(linker.seen.lock().unwrap().as_slice(), &[handle.artifact_path().to_path_buf()]);
        assert_eq!(loader.loaded(), vec!["libpbf.so".to_string()]);

        let artifact = handle.artifact_path().to_path_buf();
        drop(handle);
        // still owned by the loader
        assert!(artifact.exists());
        drop(loader);
        assert!(!artifact.exists());
    }

    #[test]
    fn test_load_is_cached_across_spellings() {
        let tmp = tempfile::tempdir().unwrap();
        let linker = CountingLinker::default();
        let loader = NativeModuleLoader::new(linux64(), bundle_with_pbf(), Box::new(linker.clone()))
            .with_extract_dir(tmp.path());

        let a = loader.load("pbf").unwrap();
        let b = loader.load("libpbf.so").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(linker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dir_entries(tmp.path()), 1);
    }

    #[test]
    fn test_concurrent_first_load_runs_once() {
        let tmp = tempfile::tempdir().unwrap();
        let linker = CountingLinker::default();
        let loader = NativeModuleLoader::new(linux64(), bundle_with_pbf(), Box::new(linker.clone()))
            .with_extract_dir(tmp.path());

        let threads = 8;
        let barrier = Barrier::new(threads);
        let handles: Vec<Arc<ModuleHandle>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        loader.load("pbf").unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(linker.calls.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(dir_entries(tmp.path()), 1);
    }

    #[test]
    fn test_concurrent_failures_are_shared() {
        let tmp = tempfile::tempdir().unwrap();
        let linker = CountingLinker {
            reject: true,
            ..Default::default()
        };
        let loader = NativeModuleLoader::new(linux64(), bundle_with_pbf(), Box::new(linker.clone()))
            .with_extract_dir(tmp.path());

        let errors: Vec<String> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|_| s.spawn(|| loader.load("pbf").unwrap_err().to_string()))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(linker.calls.load(Ordering::SeqCst), 1);
        assert!(errors.iter().all(|e| e == &errors[0]));
        assert!(errors[0].contains("wrong ELF class"));
    }

    #[test]
    fn test_missing_resource_is_resolution_error() {
        let tmp = tempfile::tempdir().unwrap();
        let linker = CountingLinker::default();
        let loader = NativeModuleLoader::new(
            linux64(),
            Arc::new(EmbeddedBundle::new()),
            Box::new(linker.clone()),
        )
        .with_extract_dir(tmp.path());

        let err = loader.load("pbf").unwrap_err();
        assert!(matches!(err, LoaderError::Resolution { ref resource, .. } if resource == "/native/linux/64/libpbf.so"));
        assert_eq!(linker.calls.load(Ordering::SeqCst), 0);
        assert_eq!(dir_entries(tmp.path()), 0);
        assert!(loader.loaded().is_empty());
    }

    #[test]
    fn test_wrong_width_only_is_resolution_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bundle = EmbeddedBundle::new().with("/native/linux/32/libpbf.so", &b"32-bit"[..]);
        let loader = NativeModuleLoader::new(linux64(), Arc::new(bundle), Box::new(CountingLinker::default()))
            .with_extract_dir(tmp.path());

        assert!(matches!(loader.load("pbf"), Err(LoaderError::Resolution { .. })));
        assert_eq!(dir_entries(tmp.path()), 0);
    }

    #[test]
    fn test_link_rejection_removes_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let linker = CountingLinker {
            reject: true,
            ..Default::default()
        };
        let loader = NativeModuleLoader::new(linux64(), bundle_with_pbf(), Box::new(linker.clone()))
            .with_extract_dir(tmp.path());

        let err = loader.load("pbf").unwrap_err();
        assert!(matches!(err, LoaderError::Link { .. }));
        assert_eq!(dir_entries(tmp.path()), 0);

        // cached: the second attempt does not relink
        assert!(matches!(loader.load("pbf"), Err(LoaderError::Link { .. })));
        assert_eq!(linker.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unwritable_extract_dir_is_extraction_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");
        let loader = NativeModuleLoader::new(linux64(), bundle_with_pbf(), Box::new(CountingLinker::default()))
            .with_extract_dir(&missing);

        let err = loader.extract("pbf").unwrap_err();
        assert!(matches!(err, LoaderError::Extraction { .. }), "{:?}", err);
    }

    #[test]
    fn test_failed_copy_removes_partial_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let linker = CountingLinker::default();
        let loader = NativeModuleLoader::new(
            linux64(),
            Arc::new(BrokenBundle { fail_open: false }),
            Box::new(linker.clone()),
        )
        .with_extract_dir(tmp.path());

        match loader.extract("pbf") {
            Err(LoaderError::Extraction { resource, source }) => {
                assert_eq!(resource, "/native/linux/64/libpbf.so");
                assert!(source.to_string().contains("device went away"));
            }
            other => panic!("expected extraction error, got {:?}", other),
        }
        assert_eq!(dir_entries(tmp.path()), 0);

        assert!(matches!(loader.load("pbf"), Err(LoaderError::Extraction { .. })));
        assert_eq!(dir_entries(tmp.path()), 0);
        assert_eq!(linker.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unopenable_resource_is_extraction_error() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = NativeModuleLoader::new(
            linux64(),
            Arc::new(BrokenBundle { fail_open: true }),
            Box::new(CountingLinker::default()),
        )
        .with_extract_dir(tmp.path());

        assert!(matches!(loader.extract("pbf"), Err(LoaderError::Extraction { .. })));
        assert_eq!(dir_entries(tmp.path()), 0);
    }

    #[test]
    fn test_extract_then_discard() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = NativeModuleLoader::new(linux64(), bundle_with_pbf(), Box::new(CountingLinker::default()))
            .with_extract_dir(tmp.path());

        let artifact = loader.extract("pbf").unwrap();
        assert_eq!(artifact.bytes, 16);
        assert!(artifact.path().exists());
        artifact.discard().unwrap();
        assert_eq!(dir_entries(tmp.path()), 0);
    }

    #[test]
    fn test_system_linker_claimed_once() {
        let first = SystemLinker::claim();
        let second = SystemLinker::claim();
        // another test in this binary may have claimed it already
        assert!(second.is_none());
        drop(first);
        assert!(SystemLinker::claim().is_none());
    }
}
