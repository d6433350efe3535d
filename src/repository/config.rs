// src/repository/config.rs

//! Repository configuration, stored as JSON

use crate::compression::Compression;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default trove store location
pub const DEFAULT_DB_PATH: &str = "/srv/conary/repository.db";

/// Default content store location
pub const DEFAULT_CONTENTS_DIR: &str = "/srv/conary/contents";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Hosts this repository is authoritative for
    pub server_names: Vec<String>,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_contents_dir")]
    pub contents_dir: PathBuf,

    #[serde(default)]
    pub require_signatures: bool,

    #[serde(default)]
    pub compression: Compression,

    /// Filesystem root for capsule installs; capsules are not applied
    /// when unset
    #[serde(default)]
    pub root: Option<PathBuf>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

fn default_contents_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CONTENTS_DIR)
}

impl RepositoryConfig {
    pub fn new(server_names: Vec<String>) -> Self {
        Self {
            server_names,
            db_path: default_db_path(),
            contents_dir: default_contents_dir(),
            require_signatures: false,
            compression: Compression::default(),
            root: None,
        }
    }

    /// Read a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading repository configuration from {}", path.display());
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// True when `host` is served by this repository
    pub fn serves(&self, host: &str) -> bool {
        self.server_names.iter().any(|name| name == host)
    }
}
