//! Platform probe – OS family and word width of the running process.
//!
//! - [`HostProbe`]: the real process environment
//! - [`FixedProbe`]: a preset descriptor (tests, cross-packaging tools)
//!
//! Detection itself is a pure function of a [`ProbeEnv`] so any environment
//! can be simulated deterministically.

use crate::traits::PlatformProbe;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Environment variable that only exists on 64-bit Windows. Used as a
/// fallback signal when the architecture string is not recognised.
pub const WOW64_MARKER_VAR: &str = "ProgramFiles(x86)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Windows,
    Mac,
    Linux,
}

impl OsFamily {
    /// Classify an OS name. Unknown systems fall back to Linux.
    pub fn from_os_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        // "darwin" contains "win", so macOS has to be checked first
        if name.contains("darwin") || name.contains("mac") {
            OsFamily::Mac
        } else if name.contains("win") {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        }
    }

    /// Directory name under `/native/` in the resource bundle.
    pub fn dir_name(self) -> &'static str {
        match self {
            OsFamily::Windows => "windows",
            OsFamily::Mac => "mac",
            OsFamily::Linux => "linux",
        }
    }

    pub fn library_prefix(self) -> &'static str {
        match self {
            OsFamily::Windows => "",
            OsFamily::Mac | OsFamily::Linux => "lib",
        }
    }

    pub fn library_suffix(self) -> &'static str {
        match self {
            OsFamily::Windows => ".dll",
            OsFamily::Mac => ".dylib",
            OsFamily::Linux => ".so",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WordWidth {
    #[serde(rename = "32")]
    Bits32,
    #[serde(rename = "64")]
    Bits64,
}

impl WordWidth {
    /// Read the width from a machine architecture string, if it is one we
    /// recognise.
    pub fn from_arch(arch: &str) -> Option<Self> {
        let arch = arch.to_ascii_lowercase();
        let known_64 = ["s390x", "sparcv9"];
        if arch.contains("64") || known_64.contains(&arch.as_str()) {
            return Some(WordWidth::Bits64);
        }
        let is_x86_32 = arch.len() == 4 && arch.starts_with('i') && arch.ends_with("86");
        let known_32 = ["x86", "arm", "mips", "powerpc", "sparc", "m68k", "hexagon"];
        if is_x86_32 || arch.contains("32") || known_32.iter().any(|k| arch.starts_with(k)) {
            return Some(WordWidth::Bits32);
        }
        None
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            WordWidth::Bits32 => "32",
            WordWidth::Bits64 => "64",
        }
    }
}

impl fmt::Display for WordWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Which signal the word width was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidthSource {
    Architecture,
    Wow64Heuristic,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformDescriptor {
    pub os_family: OsFamily,
    pub word_width: WordWidth,
}

impl PlatformDescriptor {
    pub fn new(os_family: OsFamily, word_width: WordWidth) -> Self {
        Self {
            os_family,
            word_width,
        }
    }

    /// Bundle path of a decorated library file for this platform.
    pub fn resource_path(&self, decorated: &str) -> String {
        format!(
            "/native/{}/{}/{}",
            self.os_family.dir_name(),
            self.word_width.dir_name(),
            decorated
        )
    }
}

impl fmt::Display for PlatformDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os_family, self.word_width)
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Snapshot of the inputs detection looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEnv {
    pub os_name: String,
    pub arch: String,
    pub wow64_marker: bool,
}

impl ProbeEnv {
    /// Inputs of the current process. `ARCH` is the architecture the process
    /// was built for, which is what the artifact has to match.
    pub fn current() -> Self {
        Self {
            os_name: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            wow64_marker: std::env::var_os(WOW64_MARKER_VAR).is_some(),
        }
    }
}

/// Classify an environment. Never fails.
pub fn detect(env: &ProbeEnv) -> (PlatformDescriptor, WidthSource) {
    let os_family = OsFamily::from_os_name(&env.os_name);
    let (word_width, source) = match WordWidth::from_arch(&env.arch) {
        Some(w) => (w, WidthSource::Architecture),
        None if os_family == OsFamily::Windows => {
            let w = if env.wow64_marker {
                WordWidth::Bits64
            } else {
                WordWidth::Bits32
            };
            (w, WidthSource::Wow64Heuristic)
        }
        None => (WordWidth::Bits32, WidthSource::Default),
    };
    (PlatformDescriptor::new(os_family, word_width), source)
}

/// Probe of the running process. The environment is read once, at
/// construction.
#[derive(Debug, Clone)]
pub struct HostProbe {
    env: ProbeEnv,
}

impl HostProbe {
    pub fn new() -> Self {
        Self::with_env(ProbeEnv::current())
    }

    /// Probe a simulated environment.
    pub fn with_env(env: ProbeEnv) -> Self {
        Self { env }
    }

    pub fn env(&self) -> &ProbeEnv {
        &self.env
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformProbe for HostProbe {
    fn detect(&self) -> PlatformDescriptor {
        detect(&self.env).0
    }

    fn width_source(&self) -> WidthSource {
        detect(&self.env).1
    }
}

/// Probe that always reports the same descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub PlatformDescriptor);

impl PlatformProbe for FixedProbe {
    fn detect(&self) -> PlatformDescriptor {
        self.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn env(os: &str, arch: &str, wow64: bool) -> ProbeEnv {
        ProbeEnv {
            os_name: os.into(),
            arch: arch.into(),
            wow64_marker: wow64,
        }
    }

    #[test]
    fn test_os_family_classification() {
        assert_eq!(OsFamily::from_os_name("windows"), OsFamily::Windows);
        assert_eq!(OsFamily::from_os_name("Windows 10"), OsFamily::Windows);
        assert_eq!(OsFamily::from_os_name("macos"), OsFamily::Mac);
        assert_eq!(OsFamily::from_os_name("Mac OS X"), OsFamily::Mac);
        assert_eq!(OsFamily::from_os_name("Darwin"), OsFamily::Mac);
        assert_eq!(OsFamily::from_os_name("linux"), OsFamily::Linux);
        // unknown systems default to the linux family
        assert_eq!(OsFamily::from_os_name("freebsd"), OsFamily::Linux);
        assert_eq!(OsFamily::from_os_name(""), OsFamily::Linux);
    }

    #[test]
    fn test_width_from_arch() {
        assert_eq!(WordWidth::from_arch("x86_64"), Some(WordWidth::Bits64));
        assert_eq!(WordWidth::from_arch("aarch64"), Some(WordWidth::Bits64));
        assert_eq!(WordWidth::from_arch("amd64"), Some(WordWidth::Bits64));
        assert_eq!(WordWidth::from_arch("s390x"), Some(WordWidth::Bits64));
        assert_eq!(WordWidth::from_arch("x86"), Some(WordWidth::Bits32));
        assert_eq!(WordWidth::from_arch("i686"), Some(WordWidth::Bits32));
        assert_eq!(WordWidth::from_arch("arm"), Some(WordWidth::Bits32));
        assert_eq!(WordWidth::from_arch("wasm32"), Some(WordWidth::Bits32));
        assert_eq!(WordWidth::from_arch("sparc"), Some(WordWidth::Bits32));
        assert_eq!(WordWidth::from_arch("quantum"), None);
        assert_eq!(WordWidth::from_arch(""), None);
    }

    #[test]
    fn test_sparcv9_is_64_bit() {
        assert_eq!(WordWidth::from_arch("sparcv9"), Some(WordWidth::Bits64));
        assert_eq!(WordWidth::from_arch("SPARCV9"), Some(WordWidth::Bits64));
        let (d, src) = detect(&env("solaris", "sparcv9", false));
        assert_eq!(d, PlatformDescriptor::new(OsFamily::Linux, WordWidth::Bits64));
        assert_eq!(src, WidthSource::Architecture);
    }

    #[test]
    fn test_detect_prefers_architecture() {
        let (d, src) = detect(&env("windows", "x86", true));
        assert_eq!(d, PlatformDescriptor::new(OsFamily::Windows, WordWidth::Bits32));
        assert_eq!(src, WidthSource::Architecture);
    }

    #[test]
    fn test_detect_windows_falls_back_to_marker() {
        let (d, src) = detect(&env("windows", "", true));
        assert_eq!(d.word_width, WordWidth::Bits64);
        assert_eq!(src, WidthSource::Wow64Heuristic);

        let (d, _) = detect(&env("windows", "", false));
        assert_eq!(d.word_width, WordWidth::Bits32);
    }

    #[test]
    fn test_detect_unknown_arch_off_windows() {
        // the marker is meaningless outside windows
        let (d, src) = detect(&env("linux", "mystery", true));
        assert_eq!(d, PlatformDescriptor::new(OsFamily::Linux, WordWidth::Bits32));
        assert_eq!(src, WidthSource::Default);
    }

    #[test]
    fn test_detect_is_deterministic() {
        let cases = [
            env("windows", "x86_64", false),
            env("macos", "aarch64", false),
            env("linux", "x86", false),
            env("solaris", "sparcv9", false),
        ];
        for e in &cases {
            assert_eq!(detect(e), detect(e));
        }
    }

    #[test]
    fn test_resource_path() {
        let d = PlatformDescriptor::new(OsFamily::Mac, WordWidth::Bits64);
        assert_eq!(d.resource_path("libpbf.dylib"), "/native/mac/64/libpbf.dylib");
        let d = PlatformDescriptor::new(OsFamily::Windows, WordWidth::Bits32);
        assert_eq!(d.resource_path("pbf.dll"), "/native/windows/32/pbf.dll");
    }

    #[test]
    fn test_host_probe_matches_build_target() {
        let d = HostProbe::new().detect();
        let expected = if cfg!(target_pointer_width = "64") {
            WordWidth::Bits64
        } else {
            WordWidth::Bits32
        };
        assert_eq!(d.word_width, expected);
    }
}
