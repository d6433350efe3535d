// src/repository/mod.rs

//! A Conary repository: trove store, content store and commit pipeline
//!
//! This module provides:
//! - Opening and initializing a repository from its configuration
//! - Trove and file content lookups
//! - Committing changesets (`commit.rs`)
//! - Building changesets for clients (`create.rs`)

mod commit;
mod config;
mod create;

pub use commit::{CommitOptions, CommitSummary};
pub use config::{DEFAULT_CONTENTS_DIR, DEFAULT_DB_PATH, RepositoryConfig};
pub use create::{ChangeSetJob, CreatedChangeSet};

use crate::capsule::{CapsuleInstaller, CapsuleKind, CapsuleOperations};
use crate::cas::{ContentStore, DataStore};
use crate::db::{self, models::FileStream};
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::{FileId, Sha1Digest};
use crate::signature::{NoKeys, SignatureVerifier};
use crate::trove::{Trove, TroveKey, TroveSource};
use crate::version::Version;
use rusqlite::Connection;
use tracing::info;

pub struct Repository {
    conn: Connection,
    store: DataStore,
    config: RepositoryConfig,
    verifier: Box<dyn SignatureVerifier>,
    capsules: CapsuleOperations,
}

impl Repository {
    /// Create the trove store and content directory if needed, then open
    pub fn init(config: RepositoryConfig) -> Result<Self> {
        let conn = db::init(&config.db_path.to_string_lossy())?;
        let store = DataStore::new(&config.contents_dir, config.compression)?;
        info!(
            "Initialized repository for {} at {}",
            config.server_names.join(", "),
            config.db_path.display()
        );
        Ok(Self::assemble(conn, store, config))
    }

    /// Open an existing repository
    pub fn open(config: RepositoryConfig) -> Result<Self> {
        let conn = db::open(&config.db_path.to_string_lossy())?;
        if !config.contents_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "content store {}",
                config.contents_dir.display()
            )));
        }
        let store = DataStore::new(&config.contents_dir, config.compression)?;
        Ok(Self::assemble(conn, store, config))
    }

    fn assemble(conn: Connection, store: DataStore, config: RepositoryConfig) -> Self {
        Self {
            conn,
            store,
            config,
            verifier: Box::new(NoKeys),
            capsules: CapsuleOperations::new(),
        }
    }

    pub fn with_verifier(mut self, verifier: Box<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn register_capsule(&mut self, kind: CapsuleKind, installer: Box<dyn CapsuleInstaller>) {
        self.capsules.register(kind, installer);
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn has_trove(&self, name: &str, version: &Version, flavor: &Flavor) -> Result<bool> {
        Ok(db::models::TroveRecord::find(&self.conn, name, version, flavor)?.is_some())
    }

    pub fn get_trove(&self, name: &str, version: &Version, flavor: &Flavor) -> Result<Trove> {
        db::models::load_trove(&self.conn, name, version, flavor)?.ok_or_else(|| {
            Error::TroveMissing {
                name: name.to_string(),
                version: version.to_string(),
                flavor: flavor.to_string(),
            }
        })
    }

    pub fn list_troves(&self, name: Option<&str>) -> Result<Vec<TroveKey>> {
        db::models::list_troves(&self.conn, name)
    }

    /// Contents identity recorded for a file version
    pub fn file_stream(&self, file_id: &FileId, version: &Version) -> Result<FileStream> {
        FileStream::find(&self.conn, file_id, version)?
            .ok_or_else(|| Error::NotFound(format!("file {}={}", file_id, version)))
    }

    /// Bytes of one file version
    pub fn file_contents(&self, file_id: &FileId, version: &Version) -> Result<Vec<u8>> {
        let stream = self.file_stream(file_id, version)?;
        if stream.config {
            self.store.get_config(&stream.sha1)
        } else {
            self.store.get(&stream.sha1)
        }
    }

    /// Bytes stored under a content digest
    pub fn contents(&self, sha1: &Sha1Digest) -> Result<Vec<u8>> {
        self.store.get(sha1)
    }
}

impl TroveSource for Repository {
    fn get_trove(&self, name: &str, version: &Version, flavor: &Flavor) -> Result<Trove> {
        Repository::get_trove(self, name, version, flavor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn test_config(dir: &TempDir) -> RepositoryConfig {
        let mut config = RepositoryConfig::new(vec!["conary.example.com".to_string()]);
        config.db_path = dir.path().join("repository.db");
        config.contents_dir = dir.path().join("contents");
        config
    }

    #[test]
    fn test_init_then_open() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        {
            let repo = Repository::init(config.clone()).unwrap();
            assert!(repo.list_troves(None).unwrap().is_empty());
        }
        let repo = Repository::open(config).unwrap();
        assert!(repo.store().top().is_dir());
    }

    #[test]
    fn test_open_missing_repository() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Repository::open(test_config(&dir)),
            Err(Error::DatabaseNotFound(_))
        ));
    }

    #[test]
    fn test_missing_lookups_are_not_found() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(test_config(&dir)).unwrap();
        let version: Version = "/conary.example.com@rpl:devel/1.0-1-1".parse().unwrap();

        assert!(!repo.has_trove("foo", &version, &Flavor::new()).unwrap());
        let err = repo.get_trove("foo", &version, &Flavor::new()).unwrap_err();
        assert!(err.is_not_found());
        let err = repo
            .file_contents(&FileId::derive(b"x"), &version)
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
