// src/db/models.rs

//! Rows of the trove store and the mapping between them and [`Trove`]
//!
//! Versions are stored twice: the timestamp-free string form, which keys
//! lookups, and the frozen form, which restores timestamps on load.

use crate::capsule::CapsuleKind;
use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::{FileId, Sha1Digest};
use crate::trove::{CapsuleInfo, Trove, TroveInfo, TroveKey, TroveSignature};
use crate::version::Version;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::BTreeSet;
use tracing::debug;

/// A row in `troves`
#[derive(Debug, Clone)]
pub struct TroveRecord {
    pub id: Option<i64>,
    pub name: String,
    pub version: String,
    pub frozen_version: String,
    pub flavor: String,
    pub requires: String,
    pub provides: String,
    pub sha1: Option<String>,
    pub trove_version: u32,
    pub incomplete: bool,
    pub capsule_kind: Option<String>,
    pub capsule_sha1: Option<String>,
    pub capsule_metadata: Option<String>,
}

const TROVE_COLUMNS: &str = "id, name, version, frozen_version, flavor, requires, provides, sha1, \
                             trove_version, incomplete, capsule_kind, capsule_sha1, capsule_metadata";

impl TroveRecord {
    pub fn from_trove(trove: &Trove) -> Self {
        let info = trove.info();
        let capsule = info.capsule.as_ref();
        Self {
            id: None,
            name: trove.name().to_string(),
            version: trove.version().as_string(),
            frozen_version: trove.version().freeze(),
            flavor: trove.flavor().freeze(),
            requires: trove.requires().freeze(),
            provides: trove.provides().freeze(),
            sha1: info.sha1.map(|s| s.to_hex()),
            trove_version: info.trove_version,
            incomplete: info.incomplete,
            capsule_kind: capsule.map(|c| c.kind.to_string()),
            capsule_sha1: capsule.map(|c| c.content_id.to_hex()),
            capsule_metadata: capsule.and_then(|c| c.metadata).map(|m| m.to_hex()),
        }
    }

    /// Insert this trove row, returning its id
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO troves (name, version, frozen_version, flavor, requires, provides, sha1,
                                 trove_version, incomplete, capsule_kind, capsule_sha1, capsule_metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                &self.name,
                &self.version,
                &self.frozen_version,
                &self.flavor,
                &self.requires,
                &self.provides,
                &self.sha1,
                self.trove_version,
                self.incomplete,
                &self.capsule_kind,
                &self.capsule_sha1,
                &self.capsule_metadata,
            ],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    /// Find a trove by its key
    pub fn find(
        conn: &Connection,
        name: &str,
        version: &Version,
        flavor: &Flavor,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM troves WHERE name = ?1 AND version = ?2 AND flavor = ?3",
            TROVE_COLUMNS
        ))?;
        let record = stmt
            .query_row(
                params![name, version.as_string(), flavor.freeze()],
                Self::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Find all troves with a given name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM troves WHERE name = ?1 ORDER BY version, flavor",
            TROVE_COLUMNS
        ))?;
        let records = stmt
            .query_map([name], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// List all troves
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM troves ORDER BY name, version, flavor",
            TROVE_COLUMNS
        ))?;
        let records = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Delete a trove row; files, members and signatures cascade
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        conn.execute("DELETE FROM troves WHERE id = ?1", [id])?;
        Ok(())
    }

    pub fn key(&self) -> Result<TroveKey> {
        Ok(TroveKey::new(
            &self.name,
            Version::thaw(&self.frozen_version)?,
            Flavor::thaw(&self.flavor)?,
        ))
    }

    fn info(&self) -> Result<TroveInfo> {
        let capsule = match (&self.capsule_kind, &self.capsule_sha1) {
            (Some(kind), Some(sha1)) => Some(CapsuleInfo {
                kind: kind.parse::<CapsuleKind>()?,
                content_id: sha1.parse()?,
                metadata: self
                    .capsule_metadata
                    .as_deref()
                    .map(str::parse)
                    .transpose()?,
            }),
            _ => None,
        };
        Ok(TroveInfo {
            sha1: self.sha1.as_deref().map(str::parse).transpose()?,
            trove_version: self.trove_version,
            incomplete: self.incomplete,
            signatures: Vec::new(),
            capsule,
        })
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            version: row.get(2)?,
            frozen_version: row.get(3)?,
            flavor: row.get(4)?,
            requires: row.get(5)?,
            provides: row.get(6)?,
            sha1: row.get(7)?,
            trove_version: row.get(8)?,
            incomplete: row.get(9)?,
            capsule_kind: row.get(10)?,
            capsule_sha1: row.get(11)?,
            capsule_metadata: row.get(12)?,
        })
    }
}

/// Contents identity of one file version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStream {
    pub file_id: FileId,
    pub version: Version,
    pub sha1: Sha1Digest,
    pub config: bool,
}

impl FileStream {
    /// Record the stream; an existing identical row is left alone
    ///
    /// A file version always names the same contents, so a row that
    /// disagrees is an integrity error.
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        if let Some(existing) = Self::find(conn, &self.file_id, &self.version)? {
            if existing.sha1 != self.sha1 || existing.config != self.config {
                return Err(Error::DigestMismatch {
                    id: format!("{}={}", self.file_id, self.version),
                    expected: existing.sha1.to_hex(),
                    actual: self.sha1.to_hex(),
                });
            }
            return Ok(());
        }
        conn.execute(
            "INSERT INTO file_streams (file_id, version, sha1, is_config) VALUES (?1, ?2, ?3, ?4)",
            params![
                self.file_id.to_hex(),
                self.version.as_string(),
                self.sha1.to_hex(),
                self.config
            ],
        )?;
        Ok(())
    }

    pub fn find(conn: &Connection, file_id: &FileId, version: &Version) -> Result<Option<Self>> {
        let row = conn
            .query_row(
                "SELECT sha1, is_config FROM file_streams WHERE file_id = ?1 AND version = ?2",
                params![file_id.to_hex(), version.as_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)),
            )
            .optional()?;
        match row {
            Some((sha1, config)) => Ok(Some(Self {
                file_id: *file_id,
                version: version.clone(),
                sha1: sha1.parse()?,
                config,
            })),
            None => Ok(None),
        }
    }

    /// Drop the stream if no trove file still uses it
    ///
    /// Returns the digest when no stream refers to it any more.
    pub fn release(conn: &Connection, file_id: &FileId, version: &Version) -> Result<Option<Sha1Digest>> {
        let users: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trove_files WHERE file_id = ?1 AND version = ?2",
            params![file_id.to_hex(), version.as_string()],
            |row| row.get(0),
        )?;
        if users > 0 {
            return Ok(None);
        }
        let Some(stream) = Self::find(conn, file_id, version)? else {
            return Ok(None);
        };
        conn.execute(
            "DELETE FROM file_streams WHERE file_id = ?1 AND version = ?2",
            params![file_id.to_hex(), version.as_string()],
        )?;
        let remaining: i64 = conn.query_row(
            "SELECT COUNT(*) FROM file_streams WHERE sha1 = ?1",
            [stream.sha1.to_hex()],
            |row| row.get(0),
        )?;
        Ok((remaining == 0).then_some(stream.sha1))
    }

    /// Number of trove files whose contents have this digest
    pub fn references(conn: &Connection, sha1: &Sha1Digest) -> Result<i64> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM trove_files tf
             JOIN file_streams fs ON fs.file_id = tf.file_id AND fs.version = tf.version
             WHERE fs.sha1 = ?1",
            [sha1.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Write a whole trove: row, files, members and signatures
pub fn insert_trove(conn: &Connection, trove: &Trove) -> Result<i64> {
    if TroveRecord::find(conn, trove.name(), trove.version(), trove.flavor())?.is_some() {
        return Err(Error::CommitError(format!(
            "trove {} already exists",
            trove.key()
        )));
    }

    let mut record = TroveRecord::from_trove(trove);
    let trove_id = record.insert(conn)?;

    let mut file_stmt = conn.prepare(
        "INSERT INTO trove_files (trove_id, file_id, path, version, frozen_version)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (file_id, file) in trove.iter_file_list() {
        file_stmt.execute(params![
            trove_id,
            file_id.to_hex(),
            &file.path,
            file.version.as_string(),
            file.version.freeze()
        ])?;
    }

    let mut member_stmt = conn.prepare(
        "INSERT INTO trove_members (trove_id, name, version, flavor) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for key in trove.iter_trove_list() {
        member_stmt.execute(params![
            trove_id,
            &key.name,
            key.version.freeze(),
            key.flavor.freeze()
        ])?;
    }

    let mut sig_stmt = conn.prepare(
        "INSERT INTO trove_signatures (trove_id, fingerprint, signature) VALUES (?1, ?2, ?3)",
    )?;
    for sig in &trove.info().signatures {
        sig_stmt.execute(params![trove_id, &sig.fingerprint, hex::encode(&sig.signature)])?;
    }

    debug!(
        "Stored trove {} with {} files and {} members",
        trove.key(),
        trove.file_count(),
        trove.trove_count()
    );
    Ok(trove_id)
}

/// Load a whole trove by key
pub fn load_trove(
    conn: &Connection,
    name: &str,
    version: &Version,
    flavor: &Flavor,
) -> Result<Option<Trove>> {
    let Some(record) = TroveRecord::find(conn, name, version, flavor)? else {
        return Ok(None);
    };
    let trove_id = record
        .id
        .ok_or_else(|| Error::NotFound(format!("row id for trove {}", name)))?;
    let key = record.key()?;

    let mut trove = Trove::new(&key.name, key.version, key.flavor);
    trove.set_requires(DependencySet::thaw(&record.requires)?);
    trove.set_provides(DependencySet::thaw(&record.provides)?);
    *trove.info_mut() = record.info()?;

    let mut stmt = conn.prepare(
        "SELECT file_id, path, frozen_version FROM trove_files WHERE trove_id = ?1",
    )?;
    let files = stmt
        .query_map([trove_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (file_id, path, version) in files {
        trove.add_file(file_id.parse()?, &path, Version::thaw(&version)?)?;
    }

    let mut stmt =
        conn.prepare("SELECT name, version, flavor FROM trove_members WHERE trove_id = ?1")?;
    let members = stmt
        .query_map([trove_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (member, version, flavor) in members {
        trove.add_trove(&member, Version::thaw(&version)?, Flavor::thaw(&flavor)?, false)?;
    }

    let mut stmt = conn.prepare(
        "SELECT fingerprint, signature FROM trove_signatures WHERE trove_id = ?1 ORDER BY id",
    )?;
    let signatures = stmt
        .query_map([trove_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (fingerprint, signature) in signatures {
        let signature = hex::decode(&signature)
            .map_err(|e| Error::ParseError(format!("stored signature: {}", e)))?;
        trove.info_mut().signatures.push(TroveSignature {
            fingerprint,
            signature,
        });
    }

    Ok(Some(trove))
}

/// Delete a trove and return digests no stream refers to any more
pub fn delete_trove(conn: &Connection, key: &TroveKey) -> Result<Vec<Sha1Digest>> {
    let trove = load_trove(conn, &key.name, &key.version, &key.flavor)?.ok_or_else(|| {
        Error::TroveMissing {
            name: key.name.clone(),
            version: key.version.to_string(),
            flavor: key.flavor.to_string(),
        }
    })?;
    let record = TroveRecord::find(conn, &key.name, &key.version, &key.flavor)?;
    if let Some(id) = record.and_then(|r| r.id) {
        TroveRecord::delete(conn, id)?;
    }

    let mut orphaned = BTreeSet::new();
    for (file_id, file) in trove.iter_file_list() {
        if let Some(sha1) = FileStream::release(conn, file_id, &file.version)? {
            orphaned.insert(sha1);
        }
    }
    debug!("Deleted trove {}, {} blobs orphaned", key, orphaned.len());
    Ok(orphaned.into_iter().collect())
}

/// Keys of every stored trove, optionally only those with `name`
pub fn list_troves(conn: &Connection, name: Option<&str>) -> Result<Vec<TroveKey>> {
    let records = match name {
        Some(name) => TroveRecord::find_by_name(conn, name)?,
        None => TroveRecord::list_all(conn)?,
    };
    records.iter().map(TroveRecord::key).collect()
}
