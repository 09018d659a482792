use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub library: LibraryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LibraryConfig {
    #[serde(default = "default_library_name")]
    pub name: String,
    /// Root of the on-disk resource bundle. Defaults to the directory of
    /// the running executable.
    #[serde(default)]
    pub resource_dir: Option<PathBuf>,
    #[serde(default)]
    pub extract_dir: Option<PathBuf>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            name: default_library_name(),
            resource_dir: None,
            extract_dir: None,
        }
    }
}

fn default_library_name() -> String {
    pbf_engine::context::DEFAULT_LIBRARY_NAME.to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub format: LoggingFormatConfig,
    pub levels: LoggingLevelsConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingFormatConfig {
    pub show_time: bool,
    pub location: LoggingLocationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLocationConfig {
    pub show_file: bool,
    pub show_line: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLevelsConfig {
    pub debug: bool,
    pub info: bool,
    pub warning: bool,
    pub error: bool,
    pub critical: bool,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RedactionConfig {
    #[serde(default = "true_default")]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<RedactionPattern>,
}

fn true_default() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

static CONFIG: RwLock<Option<&'static AppConfig>> = RwLock::new(None);

/// The process configuration, loaded on first use.
pub fn get_config() -> Result<&'static AppConfig, ConfigError> {
    if let Some(cfg) = *CONFIG.read().unwrap_or_else(PoisonError::into_inner) {
        return Ok(cfg);
    }

    let mut write = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(cfg) = *write {
        return Ok(cfg);
    }

    let cfg: &'static AppConfig = Box::leak(Box::new(load_config()?));
    *write = Some(cfg);
    Ok(cfg)
}

#[cfg(test)]
pub fn reset_config() {
    let mut write = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
    *write = None;
}

/// `name` under the manifest dir when running through cargo, otherwise
/// under `crates/cli/` relative to the working directory.
fn config_file(base: &Path, name: &str) -> PathBuf {
    let beside_manifest = base.join(name);
    if beside_manifest.exists() {
        beside_manifest
    } else {
        Path::new("crates").join("cli").join(name)
    }
}

fn load_config() -> Result<AppConfig, ConfigError> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let base = Path::new(&manifest_dir);

    Config::builder()
        .add_source(File::from(config_file(base, "global_config.yaml")).required(true))
        .add_source(File::from(config_file(base, "production_config.yaml")).required(false))
        .add_source(File::from(config_file(base, ".global_config.yaml")).required(false))
        // PBF__LIBRARY__EXTRACT_DIR=/var/tmp/pbf
        .add_source(Environment::with_prefix("PBF").separator("__"))
        .build()?
        .try_deserialize()
}
