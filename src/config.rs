use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::classify::ContentTypeTag;

pub const PROJECT_CONFIG_FILE: &str = "netcapture.toml";
pub const HOME_CONFIG_DIR: &str = ".netcapture";
pub const HOME_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_DATABASE_FILE: &str = "capture.db";

const DEFAULT_WARN_THRESHOLD_MIB: u64 = 200;
const DEFAULT_COMPRESSION_LEVEL: u32 = 6;
const MAX_COMPRESSION_LEVEL: u32 = 9;
const DEFAULT_SAVE_DIR: &str = "saved";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub save: SaveConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Loads `explicit` when given, otherwise the first of
    /// `./netcapture.toml` and `$HOME/.netcapture/config.toml` that exists.
    /// Falls back to defaults when neither does.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path)
                .with_context(|| format!("load config from --config {}", path.display()));
        }

        let project = Path::new(PROJECT_CONFIG_FILE);
        if project.is_file() {
            return Self::from_path(project)
                .with_context(|| format!("load config from project ./{PROJECT_CONFIG_FILE}"));
        }

        if let Some(home) = home_dir() {
            let home_config = home.join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILE);
            if home_config.is_file() {
                return Self::from_path(&home_config).with_context(|| {
                    format!("load config from home {}", home_config.display())
                });
            }
        }

        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
    }

    /// `[storage].path`, or `$HOME/.netcapture/capture.db` when unset.
    pub fn database_path(&self) -> PathBuf {
        if let Some(path) = self.storage.path.as_ref() {
            return path.clone();
        }
        match home_dir() {
            Some(home) => home.join(HOME_CONFIG_DIR).join(DEFAULT_DATABASE_FILE),
            None => PathBuf::from(DEFAULT_DATABASE_FILE),
        }
    }

    /// Directory exports are written to; `override_dir` wins over config.
    pub fn export_dir(&self, override_dir: Option<&Path>) -> PathBuf {
        override_dir
            .map(Path::to_path_buf)
            .or_else(|| self.export.out_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn save_dir(&self, override_dir: Option<&Path>) -> PathBuf {
        override_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.save.out_dir.clone())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.export.compression_level > MAX_COMPRESSION_LEVEL {
            bail!(
                "`export.compression_level` must be between 0 and {MAX_COMPRESSION_LEVEL}, got {}",
                self.export.compression_level
            );
        }
        if self.storage.path.as_ref().is_some_and(|path| path.as_os_str().is_empty()) {
            bail!("`storage.path` cannot be empty");
        }
        if self.save.content_types.contains(&ContentTypeTag::Unknown) {
            bail!("`save.content_types` cannot include `unknown`");
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    pub out_dir: Option<PathBuf>,
    #[serde(default = "default_warn_threshold_mib")]
    pub warn_threshold_mib: u64,
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            out_dir: None,
            warn_threshold_mib: DEFAULT_WARN_THRESHOLD_MIB,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

fn default_warn_threshold_mib() -> u64 {
    DEFAULT_WARN_THRESHOLD_MIB
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SaveConfig {
    #[serde(default = "default_save_dir")]
    pub out_dir: PathBuf,
    #[serde(default = "default_save_content_types")]
    pub content_types: Vec<ContentTypeTag>,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            out_dir: default_save_dir(),
            content_types: default_save_content_types(),
        }
    }
}

fn default_save_dir() -> PathBuf {
    PathBuf::from(DEFAULT_SAVE_DIR)
}

fn default_save_content_types() -> Vec<ContentTypeTag> {
    vec![
        ContentTypeTag::Html,
        ContentTypeTag::Css,
        ContentTypeTag::Javascript,
    ]
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}
