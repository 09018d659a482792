//! Resource bundle implementations.
//!
//! - [`DirBundle`]: resources laid out under a directory on disk
//! - [`EmbeddedBundle`]: resources held in memory (e.g. `include_bytes!`)

use crate::traits::ResourceBundle;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

// ===========================================================================
// Directory bundle
// ===========================================================================

/// Resource `/native/linux/64/libpbf.so` lives at
/// `<root>/native/linux/64/libpbf.so`.
#[derive(Debug, Clone)]
pub struct DirBundle {
    root: PathBuf,
}

impl DirBundle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of a bundle path. Empty and `..` segments are
    /// dropped so a path can never leave the root.
    pub fn locate(&self, path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                continue;
            }
            out.push(segment);
        }
        out
    }
}

impl ResourceBundle for DirBundle {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        let location = self.locate(path);
        if !location.is_file() {
            return Ok(None);
        }
        let file = std::fs::File::open(&location)?;
        Ok(Some(Box::new(file)))
    }

    fn describe(&self) -> String {
        format!("dir:{}", self.root.display())
    }
}

// ===========================================================================
// Embedded bundle
// ===========================================================================

#[derive(Debug, Clone, Default)]
pub struct EmbeddedBundle {
    entries: BTreeMap<String, Cow<'static, [u8]>>,
}

impl EmbeddedBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource. Paths are normalised to a single leading `/`.
    pub fn insert(&mut self, path: &str, bytes: impl Into<Cow<'static, [u8]>>) {
        self.entries.insert(normalise(path), bytes.into());
    }

    pub fn with(mut self, path: &str, bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        self.insert(path, bytes);
        self
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

fn normalise(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

impl ResourceBundle for EmbeddedBundle {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn Read + '_>>> {
        Ok(self
            .entries
            .get(&normalise(path))
            .map(|bytes| Box::new(io::Cursor::new(&bytes[..])) as Box<dyn Read + '_>))
    }

    fn describe(&self) -> String {
        format!("embedded:{} entries", self.entries.len())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(bundle: &dyn ResourceBundle, path: &str) -> Option<Vec<u8>> {
        let mut reader = bundle.open(path).unwrap()?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        Some(out)
    }

    #[test]
    fn test_dir_bundle_reads_nested_resource() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("native/linux/64");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("libpbf.so"), b"ELF").unwrap();

        let bundle = DirBundle::new(tmp.path());
        assert_eq!(
            read_all(&bundle, "/native/linux/64/libpbf.so"),
            Some(b"ELF".to_vec())
        );
        assert!(bundle.contains("/native/linux/64/libpbf.so"));
        assert!(!bundle.contains("/native/linux/32/libpbf.so"));
    }

    #[test]
    fn test_dir_bundle_does_not_escape_root() {
        let bundle = DirBundle::new("/srv/app");
        assert_eq!(
            bundle.locate("/../../etc/passwd"),
            PathBuf::from("/srv/app/etc/passwd")
        );
    }

    #[test]
    fn test_dir_bundle_directory_is_not_a_resource() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("native/mac/64")).unwrap();
        let bundle = DirBundle::new(tmp.path());
        assert!(bundle.open("/native/mac/64").unwrap().is_none());
    }

    #[test]
    fn test_embedded_bundle_normalises_paths() {
        let bundle = EmbeddedBundle::new().with("native/windows/32/pbf.dll", &b"MZ"[..]);
        assert_eq!(
            read_all(&bundle, "/native/windows/32/pbf.dll"),
            Some(b"MZ".to_vec())
        );
        assert_eq!(read_all(&bundle, "/native/windows/64/pbf.dll"), None);
        assert_eq!(
            bundle.paths().collect::<Vec<_>>(),
            vec!["/native/windows/32/pbf.dll"]
        );
    }
}
