// src/repository/commit.rs

//! Commit pipeline
//!
//! A commit runs in three phases:
//! 1. Stage: decode every file's contents and check it against the digest
//!    the changeset declares. This runs in parallel and touches nothing.
//! 2. Publish: write the verified contents to the content store, one blob
//!    per digest. Blobs are content addressed, so blobs from a batch that
//!    later fails are harmless and reused by a retry.
//! 3. Record: a single write transaction removes old troves, applies every
//!    trove changeset, enforces integrity and signature policy, records
//!    file streams, stores the troves and applies capsules. Any failure
//!    rolls the whole batch back.
//!
//! Blobs orphaned by removed troves are deleted as the last step of the
//! transaction, while the write lock is held, so a concurrent commit that
//! published against the same digest either sees the blob gone and writes
//! it again or finds the new reference and keeps it.

use super::Repository;
use crate::capsule::InstallFlags;
use crate::cas::{ContentStore, DataStore};
use crate::changeset::{ChangeSet, FileContents, FileInfo, TroveChangeSet};
use crate::db::{self, models::FileStream};
use crate::error::{Error, Result};
use crate::hash::{FileId, Sha1Digest};
use crate::signature::{required_trust, verify_trove};
use crate::trove::{TROVE_VERSION, Trove, TroveKey};
use crate::version::Timestamp;
use rayon::prelude::*;
use rusqlite::Connection;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOptions {
    /// Require a fully trusted signature on every trove, in addition to
    /// the repository's own policy
    pub require_signatures: bool,
    /// Replicating history from another repository: keep timestamps and
    /// accept troves without a digest
    pub mirror: bool,
    pub flags: InstallFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub added: Vec<TroveKey>,
    pub removed: Vec<TroveKey>,
    /// Blobs written by this commit
    pub blobs_stored: usize,
    /// Contents that were already stored or repeated within the batch
    pub blobs_deduplicated: usize,
    /// Blobs deleted because no trove refers to them any more
    pub blobs_removed: usize,
}

/// Verified contents ready to publish
struct StagedContents {
    file_id: FileId,
    sha1: Sha1Digest,
    config: bool,
    data: Vec<u8>,
}

impl Repository {
    /// Commit a changeset batch; all of it or none of it becomes visible
    pub fn commit_change_set(
        &mut self,
        cs: &ChangeSet,
        options: &CommitOptions,
    ) -> Result<CommitSummary> {
        info!(
            "Committing {} troves, removing {}",
            cs.new_trove_count(),
            cs.iter_old_troves().count()
        );

        for trove_cs in cs.iter_new_troves() {
            if trove_cs.new_version().is_on_local_host() {
                return Err(Error::CommitError(format!(
                    "{} is on a local label and cannot be committed",
                    trove_cs.new_key()
                )));
            }
        }

        let staged = stage_contents(cs)?;
        let mut summary = CommitSummary::default();
        publish(&self.store, &staged, &mut summary)?;

        let require_signatures = options.require_signatures || self.config.require_signatures;
        let Self {
            conn,
            store,
            config,
            verifier,
            capsules,
        } = self;
        let store: &DataStore = store;

        let result = db::transaction(conn, |tx| {
            let timestamp = Timestamp::now();
            let mut added = Vec::new();

            for trove_cs in cs.iter_new_troves() {
                let old = match trove_cs.old_key() {
                    Some(key) => Some(
                        db::models::load_trove(tx, &key.name, &key.version, &key.flavor)?
                            .ok_or_else(|| Error::TroveMissing {
                                name: key.name.clone(),
                                version: key.version.to_string(),
                                flavor: key.flavor.to_string(),
                            })?,
                    ),
                    None => None,
                };

                let mut trove = match &old {
                    Some(old) => {
                        let mut trove = old.clone();
                        trove.apply_change_set(trove_cs, false)?;
                        trove
                    }
                    None => Trove::from_change_set(trove_cs)?,
                };
                if !options.mirror {
                    trove.reset_timestamps(timestamp);
                }

                check_integrity(&trove, options.mirror)?;
                verify_trove(&trove, &**verifier, required_trust(require_signatures))?;
                record_streams(tx, store, &staged, cs, trove_cs, &trove)?;
                db::models::insert_trove(tx, &trove)?;

                if config.root.is_some() {
                    capsules.install(&options.flags, &trove, old.as_ref())?;
                }
                added.push(trove.key());
            }

            let mut orphaned = BTreeSet::new();
            let mut removed = Vec::new();
            for key in cs.iter_old_troves() {
                if config.root.is_some()
                    && let Some(trove) =
                        db::models::load_trove(tx, &key.name, &key.version, &key.flavor)?
                {
                    capsules.remove(&trove)?;
                }
                orphaned.extend(db::models::delete_trove(tx, key)?);
                removed.push(key.clone());
            }

            if let Some(root) = &config.root {
                capsules.apply(root, store, &options.flags)?;
            }

            let blobs_removed = remove_orphans(tx, store, &orphaned)?;
            Ok((added, removed, blobs_removed))
        });

        let (added, removed, blobs_removed) = match result {
            Ok(done) => done,
            Err(e) => {
                capsules.reset();
                warn!("Commit rolled back: {}", e);
                return Err(e);
            }
        };

        summary.blobs_removed = blobs_removed;
        summary.added = added;
        summary.removed = removed;
        info!(
            "Commit complete: {} troves added, {} removed, {} blobs stored, {} deduplicated",
            summary.added.len(),
            summary.removed.len(),
            summary.blobs_stored,
            summary.blobs_deduplicated
        );
        Ok(summary)
    }
}

/// Decode and verify every file's contents against its declared digest
fn stage_contents(cs: &ChangeSet) -> Result<Vec<StagedContents>> {
    let entries: Vec<(&FileId, &FileContents, &FileInfo)> = cs
        .iter_contents()
        .map(|(file_id, contents)| {
            let info = cs.file_info(file_id).ok_or_else(|| {
                Error::ContractViolation(format!("contents for unlisted file {}", file_id))
            })?;
            Ok((file_id, contents, info))
        })
        .collect::<Result<_>>()?;

    let full: Vec<StagedContents> = entries
        .par_iter()
        .filter_map(|(file_id, contents, info)| match contents {
            FileContents::Full { .. } => Some(verify(**file_id, contents, info)),
            FileContents::Pointer(_) => None,
        })
        .collect::<Result<_>>()?;

    // a pointer shares bytes with its target, so only the digests compare
    for (file_id, contents, info) in &entries {
        let FileContents::Pointer(target) = contents else {
            continue;
        };
        if info.config {
            return Err(Error::ContractViolation(format!(
                "config file {} has pointer contents",
                file_id
            )));
        }
        let target_sha1 = full
            .iter()
            .find(|staged| staged.file_id == *target)
            .map(|staged| staged.sha1)
            .ok_or_else(|| {
                Error::ContractViolation(format!(
                    "file {} points at {}, which has no contents",
                    file_id, target
                ))
            })?;
        if target_sha1 != info.sha1 {
            return Err(Error::DigestMismatch {
                id: file_id.to_string(),
                expected: info.sha1.to_hex(),
                actual: target_sha1.to_hex(),
            });
        }
    }

    debug!("Staged {} verified contents", full.len());
    Ok(full)
}

fn verify(file_id: FileId, contents: &FileContents, info: &FileInfo) -> Result<StagedContents> {
    let data = contents.bytes()?;
    let actual = Sha1Digest::of(&data);
    if actual != info.sha1 {
        return Err(Error::DigestMismatch {
            id: file_id.to_string(),
            expected: info.sha1.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(StagedContents {
        file_id,
        sha1: actual,
        config: info.config,
        data,
    })
}

/// Write staged contents, one blob per digest
fn publish(
    store: &dyn ContentStore,
    staged: &[StagedContents],
    summary: &mut CommitSummary,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for contents in staged {
        let first = seen.insert((contents.sha1, contents.config));
        let present = if contents.config {
            store.has_config(&contents.sha1)?
        } else {
            store.has(&contents.sha1)?
        };
        if !first || present {
            debug!("Contents {} already stored", contents.sha1);
            summary.blobs_deduplicated += 1;
            continue;
        }
        if contents.config {
            store.put_config(&contents.data)?;
        } else {
            store.put(&contents.data)?;
        }
        summary.blobs_stored += 1;
    }
    Ok(())
}

fn check_integrity(trove: &Trove, mirror: bool) -> Result<()> {
    let key = trove.key();
    let info = trove.info();

    if info.trove_version > TROVE_VERSION {
        return Err(Error::TroveSchemaError {
            name: key.name,
            version: key.version.to_string(),
            flavor: key.flavor.to_string(),
            found: info.trove_version,
            supported: TROVE_VERSION,
        });
    }
    if info.incomplete {
        return Err(Error::TroveIntegrityError {
            name: key.name,
            version: key.version.to_string(),
            flavor: key.flavor.to_string(),
            reason: "trove is marked incomplete".to_string(),
        });
    }

    match info.sha1 {
        Some(expected) => {
            let actual = trove.compute_digest();
            if actual != expected {
                return Err(Error::DigestMismatch {
                    id: key.to_string(),
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }
        None if !mirror => {
            return Err(Error::TroveChecksumMissing {
                name: key.name,
                version: key.version.to_string(),
                flavor: key.flavor.to_string(),
            });
        }
        None => {}
    }
    Ok(())
}

/// Delete blobs that no trove file refers to any more
///
/// Runs inside the write transaction; references are counted again there
/// since another commit may have claimed a digest after it was released.
fn remove_orphans(
    conn: &Connection,
    store: &dyn ContentStore,
    orphaned: &BTreeSet<Sha1Digest>,
) -> Result<usize> {
    let mut removed = 0;
    for sha1 in orphaned {
        if FileStream::references(conn, sha1)? > 0 {
            debug!("Blob {} is referenced again, keeping it", sha1);
            continue;
        }
        match store.remove(sha1) {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => debug!("Could not remove orphaned blob {}: {}", sha1, e),
        }
    }
    Ok(removed)
}

/// Record a file stream for every file version the changeset introduces
///
/// The contents must be in the store by now, either published by this
/// batch or committed before. Staged contents that went missing since
/// publishing are written again.
fn record_streams(
    conn: &Connection,
    store: &dyn ContentStore,
    staged: &[StagedContents],
    cs: &ChangeSet,
    trove_cs: &TroveChangeSet,
    trove: &Trove,
) -> Result<()> {
    for (file_id, version) in trove_cs.iter_file_versions() {
        let stream = match cs.file_info(&file_id) {
            Some(info) => {
                if info.version != *version {
                    return Err(Error::ContractViolation(format!(
                        "file {} is listed at {} but used at {}",
                        file_id, info.version, version
                    )));
                }
                let stream = FileStream {
                    file_id,
                    version: version.clone(),
                    sha1: info.sha1,
                    config: info.config,
                };
                stream.insert(conn)?;
                stream
            }
            None => FileStream::find(conn, &file_id, version)?.ok_or_else(|| {
                Error::TroveIntegrityError {
                    name: trove.name().to_string(),
                    version: trove.version().to_string(),
                    flavor: trove.flavor().to_string(),
                    reason: format!("no contents recorded for file {}={}", file_id, version),
                }
            })?,
        };

        let present = if stream.config {
            store.has_config(&stream.sha1)?
        } else {
            store.has(&stream.sha1)?
        };
        if present {
            continue;
        }
        let Some(contents) = staged
            .iter()
            .find(|c| c.sha1 == stream.sha1 && c.config == stream.config)
        else {
            return Err(Error::MissingContents {
                file_id: file_id.to_string(),
                sha1: stream.sha1.to_hex(),
            });
        };
        debug!("Contents {} vanished after publishing, writing again", stream.sha1);
        if contents.config {
            store.put_config(&contents.data)?;
        } else {
            store.put(&contents.data)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Flavor;
    use crate::repository::tests::test_config;
    use crate::version::Version;
    use tempfile::TempDir;

    const VER: &str = "/conary.example.com@rpl:devel/1.0-1-1";

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    /// Absolute changeset for a trove holding `files` as (path, contents)
    fn package(name: &str, version: &str, files: &[(&str, &[u8])]) -> ChangeSet {
        let mut trove = Trove::new(name, v(version), Flavor::new());
        let mut cs = ChangeSet::new();
        for (path, data) in files {
            let file_id = FileId::derive(format!("{}{}", name, path).as_bytes());
            trove.add_file(file_id, path, v(version)).unwrap();
            cs.add_file(
                file_id,
                FileInfo {
                    version: v(version),
                    sha1: Sha1Digest::of(data),
                    config: path.starts_with("/etc"),
                },
            )
            .unwrap();
            cs.add_file_contents(file_id, FileContents::from_bytes(data, true).unwrap());
        }
        trove.compute_digests();
        cs.new_trove(trove.diff(None, true).unwrap().change_set);
        cs
    }

    #[test]
    fn test_commit_stores_troves_and_contents() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        let cs = package("foo", VER, &[("/usr/bin/foo", b"binary"), ("/etc/foo.conf", b"conf")]);

        let summary = repo.commit_change_set(&cs, &CommitOptions::default()).unwrap();
        assert_eq!(summary.added.len(), 1);
        assert_eq!(summary.blobs_stored, 2);

        let trove = repo.get_trove("foo", &v(VER), &Flavor::new()).unwrap();
        assert_eq!(trove.file_count(), 2);
        // commit stamps a fresh timestamp
        assert!(trove.version().timestamp().0 > 0);

        let conf = FileId::derive(b"foo/etc/foo.conf");
        assert_eq!(repo.file_contents(&conf, &v(VER)).unwrap(), b"conf");
    }

    #[test]
    fn test_local_label_rejected() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        let cs = package("foo", "/local@local:COOK/1.0-1-1", &[]);
        assert!(matches!(
            repo.commit_change_set(&cs, &CommitOptions::default()),
            Err(Error::CommitError(_))
        ));
    }

    #[test]
    fn test_corrupt_contents_rejected() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        let mut cs = package("foo", VER, &[("/usr/bin/foo", b"binary")]);
        let file_id = FileId::derive(b"foo/usr/bin/foo");
        cs.add_file_contents(file_id, FileContents::from_bytes(b"tampered", false).unwrap());

        assert!(matches!(
            repo.commit_change_set(&cs, &CommitOptions::default()),
            Err(Error::DigestMismatch { .. })
        ));
        assert!(repo.list_troves(None).unwrap().is_empty());
    }

    #[test]
    fn test_missing_digest_only_allowed_when_mirroring() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();

        let stamped: Version = "/conary.example.com@rpl:devel/1600000000.000:1.0-1-1"
            .parse()
            .unwrap();
        let trove = Trove::new("bare", stamped.clone(), Flavor::new());
        let mut cs = ChangeSet::new();
        cs.new_trove(trove.diff(None, true).unwrap().change_set);

        assert!(matches!(
            repo.commit_change_set(&cs, &CommitOptions::default()),
            Err(Error::TroveChecksumMissing { .. })
        ));

        let mirror = CommitOptions {
            mirror: true,
            ..Default::default()
        };
        repo.commit_change_set(&cs, &mirror).unwrap();
        let stored = repo.get_trove("bare", &stamped, &Flavor::new()).unwrap();
        assert!(stored.version().identical(&stamped));
    }

    #[test]
    fn test_future_schema_and_incomplete_rejected() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();

        let mut trove = Trove::new("future", v(VER), Flavor::new());
        trove.info_mut().trove_version = TROVE_VERSION + 1;
        trove.compute_digests();
        let mut cs = ChangeSet::new();
        cs.new_trove(trove.diff(None, true).unwrap().change_set);
        assert!(matches!(
            repo.commit_change_set(&cs, &CommitOptions::default()),
            Err(Error::TroveSchemaError { found: 2, supported: 1, .. })
        ));

        let mut trove = Trove::new("partial", v(VER), Flavor::new());
        trove.info_mut().incomplete = true;
        trove.compute_digests();
        let mut cs = ChangeSet::new();
        cs.new_trove(trove.diff(None, true).unwrap().change_set);
        assert!(matches!(
            repo.commit_change_set(&cs, &CommitOptions::default()),
            Err(Error::TroveIntegrityError { .. })
        ));
    }

    #[test]
    fn test_signatures_required_by_option() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        let cs = package("foo", VER, &[]);
        let options = CommitOptions {
            require_signatures: true,
            ..Default::default()
        };
        assert!(matches!(
            repo.commit_change_set(&cs, &options),
            Err(Error::MissingSignature(_))
        ));
    }

    #[test]
    fn test_relative_commit_and_removal() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        repo.commit_change_set(
            &package("foo", VER, &[("/usr/bin/foo", b"one")]),
            &CommitOptions::default(),
        )
        .unwrap();
        let old = repo.get_trove("foo", &v(VER), &Flavor::new()).unwrap();

        let v2 = "/conary.example.com@rpl:devel/1.0-2-1";
        let mut new = old.clone();
        new.change_version(v(v2));
        let bin = FileId::derive(b"foo/usr/bin/foo");
        new.update_file(&bin, None, Some(&v(v2))).unwrap();
        new.compute_digests();

        let mut cs = ChangeSet::new();
        cs.new_trove(new.diff(Some(&old), false).unwrap().change_set);
        cs.add_file(
            bin,
            FileInfo {
                version: v(v2),
                sha1: Sha1Digest::of(b"two"),
                config: false,
            },
        )
        .unwrap();
        cs.add_file_contents(bin, FileContents::from_bytes(b"two", true).unwrap());
        cs.old_trove(old.key());

        let summary = repo.commit_change_set(&cs, &CommitOptions::default()).unwrap();
        assert_eq!(summary.removed, vec![old.key()]);
        assert_eq!(summary.blobs_removed, 1);

        let keys = repo.list_troves(Some("foo")).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].version, v(v2));
        assert_eq!(repo.file_contents(&bin, &v(v2)).unwrap(), b"two");
        assert!(repo.contents(&Sha1Digest::of(b"one")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_old_trove() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        let old = Trove::new("foo", v(VER), Flavor::new());
        let mut new = Trove::new("foo", v("/conary.example.com@rpl:devel/1.0-2-1"), Flavor::new());
        new.compute_digests();
        let mut cs = ChangeSet::new();
        cs.new_trove(new.diff(Some(&old), false).unwrap().change_set);

        let err = repo.commit_change_set(&cs, &CommitOptions::default()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_contents_lost_after_publish_are_written_again() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        let cs = package("foo", VER, &[("/usr/bin/foo", b"binary")]);
        let sha1 = Sha1Digest::of(b"binary");

        let staged = stage_contents(&cs).unwrap();
        publish(&repo.store, &staged, &mut CommitSummary::default()).unwrap();
        // another writer collects the blob before this commit takes the lock
        repo.store.remove(&sha1).unwrap();

        let trove_cs = cs.iter_new_troves().next().unwrap();
        let trove = Trove::from_change_set(trove_cs).unwrap();
        let store: &DataStore = &repo.store;
        db::transaction(&mut repo.conn, |tx| {
            record_streams(tx, store, &staged, &cs, trove_cs, &trove)
        })
        .unwrap();
        assert!(repo.store.has(&sha1).unwrap());
    }

    #[test]
    fn test_orphan_removal_keeps_referenced_blobs() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        let cs = package("foo", VER, &[("/usr/bin/foo", b"binary")]);
        repo.commit_change_set(&cs, &CommitOptions::default()).unwrap();

        let sha1 = Sha1Digest::of(b"binary");
        let unused = repo.store.put(b"unused").unwrap();
        let orphaned = BTreeSet::from([sha1, unused]);
        let store: &DataStore = &repo.store;
        let removed =
            db::transaction(&mut repo.conn, |tx| remove_orphans(tx, store, &orphaned)).unwrap();

        assert_eq!(removed, 1);
        assert!(repo.store.has(&sha1).unwrap());
        assert!(!repo.store.has(&unused).unwrap());
    }

    #[test]
    fn test_regular_file_may_point_at_config_contents() {
        let dir = TempDir::new().unwrap();
        let mut repo = Repository::init(test_config(&dir)).unwrap();
        let mut cs = package(
            "foo",
            VER,
            &[("/etc/foo.conf", b"shared"), ("/usr/share/foo/default", b"shared")],
        );
        let conf = FileId::derive(b"foo/etc/foo.conf");
        let regular = FileId::derive(b"foo/usr/share/foo/default");
        cs.add_file_contents(regular, FileContents::Pointer(conf));

        let summary = repo.commit_change_set(&cs, &CommitOptions::default()).unwrap();
        assert_eq!(summary.blobs_stored, 1);
        assert_eq!(repo.file_contents(&regular, &v(VER)).unwrap(), b"shared");
        assert_eq!(repo.file_contents(&conf, &v(VER)).unwrap(), b"shared");
    }
}
