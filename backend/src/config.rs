use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::arch::{ArchitectureDescriptor, ArchitectureKind, DEFAULT_CHANNELS, DEFAULT_SCALE_FACTOR};
use crate::storage::UploadPolicy;

pub const CONFIG_PATH_VAR: &str = "ENHANCER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/enhancer.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for {key}")]
    Override { key: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub model: ModelConfig,
    pub upload: UploadPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory of a built web frontend to serve at `/`, if any.
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("uploads"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub path: PathBuf,
    pub kind: ArchitectureKind,
    pub scale_factor: usize,
    pub channels: usize,
    /// BLAKE3 hex digest the checkpoint must match.
    pub checksum: Option<String>,
    pub allow_untrained: bool,
    /// Load at startup instead of on the first enhancement.
    pub preload: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/enhanced_xray.safetensors"),
            kind: ArchitectureKind::default(),
            scale_factor: DEFAULT_SCALE_FACTOR,
            channels: DEFAULT_CHANNELS,
            checksum: None,
            allow_untrained: false,
            preload: true,
        }
    }
}

impl ModelConfig {
    pub fn descriptor(&self) -> ArchitectureDescriptor {
        ArchitectureDescriptor::new(self.kind)
            .with_scale_factor(self.scale_factor)
            .with_channels(self.channels)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Override { key, value })
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Override { key, value }),
    }
}

impl AppConfig {
    /// Reads the YAML file named by `ENHANCER_CONFIG` (or the default path,
    /// when present) and applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).ok().map(PathBuf::from);
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded configuration from {}", path.display());
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = lookup("PORT") {
            self.server.port = parse("PORT", port)?;
        }
        if let Some(dir) = lookup("STORAGE_DIR") {
            self.storage.root = PathBuf::from(dir);
        }
        if let Some(path) = lookup("MODEL_PATH") {
            self.model.path = PathBuf::from(path);
        }
        if let Some(kind) = lookup("MODEL_KIND") {
            self.model.kind = parse("MODEL_KIND", kind)?;
        }
        if let Some(checksum) = lookup("MODEL_CHECKSUM") {
            self.model.checksum = Some(checksum).filter(|c| !c.trim().is_empty());
        }
        if let Some(flag) = lookup("ALLOW_UNTRAINED") {
            self.model.allow_untrained = parse_flag("ALLOW_UNTRAINED", flag)?;
        }
        Ok(())
    }
}
