/// Runtime configuration for the local store
///
/// Values are layered: built-in defaults, then an optional TOML file,
/// then `TRAINEASY_*` environment variables
/// (e.g. `TRAINEASY_DATA_DIR`, `TRAINEASY_INLINE_LIMIT_BYTES`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Files below this size are kept inline in the catalog when no
/// persistent area is available
pub const DEFAULT_INLINE_LIMIT: u64 = 50 * 1024 * 1024;

const DB_FILE_NAME: &str = "traineasy.db";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the catalog database
    pub data_dir: PathBuf,
    /// Whether a persistent dataset area may be used at all
    pub durable_enabled: bool,
    /// Root of the persistent dataset area, `<data_dir>/datasets` when unset
    pub durable_root: Option<PathBuf>,
    /// Where one-shot exports land, the user's download folder when unset
    pub download_dir: Option<PathBuf>,
    pub inline_limit_bytes: u64,
    pub default_epochs: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let mut data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        data_dir.push("traineasy");

        Self {
            data_dir,
            durable_enabled: true,
            durable_root: None,
            download_dir: None,
            inline_limit_bytes: DEFAULT_INLINE_LIMIT,
            default_epochs: 50,
        }
    }
}

impl StoreConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let defaults = Self::default();

        let mut builder = config::Config::builder()
            .set_default("data_dir", defaults.data_dir.to_string_lossy().to_string())?
            .set_default("durable_enabled", defaults.durable_enabled)?
            .set_default("inline_limit_bytes", defaults.inline_limit_bytes as i64)?
            .set_default("default_epochs", defaults.default_epochs as i64)?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("TRAINEASY").try_parsing(true));

        let settings: StoreConfig = builder.build()?.try_deserialize()?;
        tracing::debug!("Loaded configuration: {:?}", settings);
        Ok(settings)
    }

    /// Configuration rooted entirely under `dir`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            durable_root: Some(dir.join("datasets")),
            download_dir: Some(dir.join("downloads")),
            data_dir: dir,
            ..Self::default()
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    /// Root of the persistent area, `None` when the area is disabled
    pub fn durable_root(&self) -> Option<PathBuf> {
        if !self.durable_enabled {
            return None;
        }
        Some(
            self.durable_root
                .clone()
                .unwrap_or_else(|| self.data_dir.join("datasets")),
        )
    }

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .or_else(dirs::download_dir)
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }
}
