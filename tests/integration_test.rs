// tests/integration_test.rs

//! Integration tests for the Conary repository
//!
//! These tests verify end-to-end functionality across modules: commits,
//! deduplication, rollback, capsule ownership takeover and changeset
//! export.

use conary_repository::Error;
use conary_repository::capsule::{CapsuleInstaller, CapsuleJob, CapsuleKind, InstallFlags};
use conary_repository::cas::ContentStore;
use conary_repository::changeset::{ChangeSet, FileContents, FileInfo, TroveChangeSet};
use conary_repository::db::models::FileStream;
use conary_repository::flavor::Flavor;
use conary_repository::hash::{FileId, Sha1Digest};
use conary_repository::repository::{ChangeSetJob, CommitOptions, Repository, RepositoryConfig};
use conary_repository::trove::{CapsuleInfo, Trove, TroveKey};
use conary_repository::version::Version;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const HOST: &str = "conary.example.com";
const VER: &str = "/conary.example.com@rpl:devel/1.0-1-1";

fn v(s: &str) -> Version {
    s.parse().unwrap()
}

fn config(dir: &Path) -> RepositoryConfig {
    let mut config = RepositoryConfig::new(vec![HOST.to_string()]);
    config.db_path = dir.join("repository.db");
    config.contents_dir = dir.join("contents");
    config
}

/// Absolute changeset entry for `trove`, with contents for `files`
fn add_trove(cs: &mut ChangeSet, trove: &mut Trove, files: &[(FileId, &[u8], bool)]) {
    for (file_id, data, config) in files {
        let version = trove.get_file(file_id).unwrap().version.clone();
        cs.add_file(
            *file_id,
            FileInfo {
                version,
                sha1: Sha1Digest::of(data),
                config: *config,
            },
        )
        .unwrap();
        cs.add_file_contents(*file_id, FileContents::from_bytes(data, !config).unwrap());
    }
    trove.compute_digests();
    cs.new_trove(trove.diff(None, true).unwrap().change_set);
}

#[test]
fn test_commit_dedups_identical_contents() {
    let dir = TempDir::new().unwrap();
    let mut repo = Repository::init(config(dir.path())).unwrap();

    let (a, b) = (FileId::derive(b"foo:a"), FileId::derive(b"foo:b"));
    let mut trove = Trove::new("foo", v(VER), Flavor::new());
    trove.add_file(a, "/usr/share/foo/a", v(VER)).unwrap();
    trove.add_file(b, "/usr/share/foo/b", v(VER)).unwrap();
    let mut cs = ChangeSet::new();
    add_trove(&mut cs, &mut trove, &[(a, b"same bytes", false), (b, b"same bytes", false)]);

    let summary = repo.commit_change_set(&cs, &CommitOptions::default()).unwrap();
    assert_eq!(summary.blobs_stored, 1);
    assert_eq!(summary.blobs_deduplicated, 1);

    // one blob, two references to it
    let digest = Sha1Digest::of(b"same bytes");
    assert_eq!(repo.store().stored_blobs().unwrap(), vec![digest]);
    let conn = conary_repository::db::open(&config(dir.path()).db_path.to_string_lossy()).unwrap();
    assert_eq!(FileStream::references(&conn, &digest).unwrap(), 2);

    assert_eq!(repo.file_contents(&a, &v(VER)).unwrap(), b"same bytes");
    assert_eq!(repo.file_contents(&b, &v(VER)).unwrap(), b"same bytes");
}

#[test]
fn test_failed_trove_rolls_back_whole_batch() {
    let dir = TempDir::new().unwrap();
    let mut repo = Repository::init(config(dir.path())).unwrap();

    let mut cs = ChangeSet::new();
    let mut good = Trove::new("good", v(VER), Flavor::new());
    add_trove(&mut cs, &mut good, &[]);

    // digest no longer matches the trove
    let mut bad = Trove::new("bad", v(VER), Flavor::new());
    bad.compute_digests();
    bad.set_requires("trove: good".parse().unwrap());
    cs.new_trove(bad.diff(None, true).unwrap().change_set);

    let err = repo
        .commit_change_set(&cs, &CommitOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::DigestMismatch { .. }));
    assert!(repo.list_troves(None).unwrap().is_empty());
    assert!(!repo.has_trove("good", &v(VER), &Flavor::new()).unwrap());
}

/// Installer that scribbles over a conary-owned path and then fails
struct ClobberingInstaller {
    path: PathBuf,
}

impl CapsuleInstaller for ClobberingInstaller {
    fn install(&mut self, _flags: &InstallFlags, _job: &CapsuleJob) -> conary_repository::Result<()> {
        Ok(())
    }

    fn remove(&mut self, _trove: &Trove) -> conary_repository::Result<()> {
        Ok(())
    }

    fn apply(
        &mut self,
        _payloads: &BTreeMap<TroveKey, PathBuf>,
        root: &Path,
        _flags: &InstallFlags,
    ) -> conary_repository::Result<()> {
        fs::write(root.join(&self.path), b"written by the installer")?;
        Ok(())
    }

    fn errors(&self) -> Vec<String> {
        vec!["scriptlet exited with status 1".to_string()]
    }
}

#[test]
fn test_capsule_failure_restores_owned_paths() {
    let dir = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    fs::create_dir_all(root.path().join("etc")).unwrap();
    fs::write(root.path().join("etc/foo.conf"), b"pre-commit bytes").unwrap();

    let mut cfg = config(dir.path());
    cfg.root = Some(root.path().to_path_buf());
    let mut repo = Repository::init(cfg).unwrap();
    repo.register_capsule(
        CapsuleKind::Rpm,
        Box::new(ClobberingInstaller {
            path: PathBuf::from("etc/foo.conf"),
        }),
    );

    let payload: &[u8] = b"\xed\xab\xee\xdb rpm payload";
    let conf = FileId::derive(b"foo:conf");
    let mut trove = Trove::new("foo", v(VER), Flavor::new());
    trove.add_file(FileId::CAPSULE, "foo-1.0-1.x86_64.rpm", v(VER)).unwrap();
    trove.add_file(conf, "/etc/foo.conf", v(VER)).unwrap();
    trove.info_mut().capsule = Some(CapsuleInfo {
        kind: CapsuleKind::Rpm,
        content_id: Sha1Digest::of(payload),
        metadata: None,
    });
    let mut cs = ChangeSet::new();
    add_trove(
        &mut cs,
        &mut trove,
        &[(FileId::CAPSULE, payload, false), (conf, b"conary config", true)],
    );

    let err = repo
        .commit_change_set(&cs, &CommitOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::CapsuleError(_)));
    assert_eq!(
        fs::read(root.path().join("etc/foo.conf")).unwrap(),
        b"pre-commit bytes"
    );
    assert!(repo.list_troves(None).unwrap().is_empty());
}

#[test]
fn test_unregistered_capsule_kind_fails_commit() {
    let dir = TempDir::new().unwrap();
    let root = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.root = Some(root.path().to_path_buf());
    let mut repo = Repository::init(cfg).unwrap();

    let payload: &[u8] = b"deb payload";
    let mut trove = Trove::new("bar", v(VER), Flavor::new());
    trove.add_file(FileId::CAPSULE, "bar_1.0_amd64.deb", v(VER)).unwrap();
    trove.info_mut().capsule = Some(CapsuleInfo {
        kind: CapsuleKind::Deb,
        content_id: Sha1Digest::of(payload),
        metadata: None,
    });
    let mut cs = ChangeSet::new();
    add_trove(&mut cs, &mut trove, &[(FileId::CAPSULE, payload, false)]);

    assert!(matches!(
        repo.commit_change_set(&cs, &CommitOptions::default()),
        Err(Error::UnregisteredCapsule(_))
    ));
}

#[test]
fn test_export_and_commit_into_mirror() {
    let source_dir = TempDir::new().unwrap();
    let mirror_dir = TempDir::new().unwrap();
    let mut source = Repository::init(config(source_dir.path())).unwrap();

    let bin = FileId::derive(b"foo:bin");
    let conf = FileId::derive(b"foo:conf");
    let mut runtime = Trove::new("foo:runtime", v(VER), "is: x86".parse().unwrap());
    runtime.add_file(bin, "/usr/bin/foo", v(VER)).unwrap();
    runtime.add_file(conf, "/etc/foo conf", v(VER)).unwrap();
    let mut group = Trove::new("foo", v(VER), "is: x86".parse().unwrap());
    group
        .add_trove("foo:runtime", v(VER), "is: x86".parse().unwrap(), false)
        .unwrap();
    let mut cs = ChangeSet::new();
    add_trove(&mut cs, &mut runtime, &[(bin, b"\x7fELF", false), (conf, b"key = value\n", true)]);
    add_trove(&mut cs, &mut group, &[]);
    source.commit_change_set(&cs, &CommitOptions::default()).unwrap();

    let job = ChangeSetJob::install("foo", v(VER), "is: x86".parse().unwrap());
    let created = source.create_change_set(&[job], true, true).unwrap();
    assert!(created.external.is_empty());
    let path = source_dir.path().join("foo.ccs");
    created.change_set.write_file(&path).unwrap();

    let exported = ChangeSet::read_file(&path).unwrap();
    assert_eq!(exported, created.change_set);

    let mut mirror = Repository::init(config(mirror_dir.path())).unwrap();
    let options = CommitOptions {
        mirror: true,
        ..Default::default()
    };
    mirror.commit_change_set(&exported, &options).unwrap();

    let flavor: Flavor = "is: x86".parse().unwrap();
    let original = source.get_trove("foo:runtime", &v(VER), &flavor).unwrap();
    let copy = mirror.get_trove("foo:runtime", &v(VER), &flavor).unwrap();
    assert_eq!(copy, original);
    // mirrored history keeps the source commit timestamps
    assert!(copy.version().identical(original.version()));
    assert_eq!(mirror.file_contents(&conf, &v(VER)).unwrap(), b"key = value\n");
    assert_eq!(mirror.file_contents(&bin, &v(VER)).unwrap(), b"\x7fELF");
    assert_eq!(mirror.list_troves(None).unwrap().len(), 2);
}

#[test]
fn test_commit_then_erase_frees_contents() {
    let dir = TempDir::new().unwrap();
    let mut repo = Repository::init(config(dir.path())).unwrap();

    let f = FileId::derive(b"tmp:file");
    let mut trove = Trove::new("tmp", v(VER), Flavor::new());
    trove.add_file(f, "/usr/share/tmp", v(VER)).unwrap();
    let mut cs = ChangeSet::new();
    add_trove(&mut cs, &mut trove, &[(f, b"temporary", false)]);
    repo.commit_change_set(&cs, &CommitOptions::default()).unwrap();

    let erase = repo
        .create_change_set(&[ChangeSetJob::erase("tmp", v(VER), Flavor::new())], true, false)
        .unwrap();
    let summary = repo
        .commit_change_set(&erase.change_set, &CommitOptions::default())
        .unwrap();
    assert_eq!(summary.removed.len(), 1);
    assert!(repo.list_troves(None).unwrap().is_empty());
    assert!(
        repo.store()
            .get(&Sha1Digest::of(b"temporary"))
            .unwrap_err()
            .is_not_found()
    );
}

// Round-trip properties

const BRANCH: &str = "/conary.example.com@rpl:devel";

fn file_version(n: u8) -> Version {
    v(&format!("{}/1.{}-1-1", BRANCH, n))
}

prop_compose! {
    fn arb_trove(release: u8)(
        files in prop::collection::btree_map(0u8..12, (0u8..4, 0u8..3), 0..8),
        members in prop::collection::btree_set((0u8..3, 0u8..3), 0..4),
        requires in prop::bool::ANY,
    ) -> Trove {
        let version = v(&format!("{}/2.{}-1-1", BRANCH, release));
        let mut trove = Trove::new("group-test", version, "ssl is: x86".parse().unwrap());
        for (id, (path, ver)) in files {
            let path = if path == 3 {
                format!("/usr/share/doc/with space {}", id)
            } else {
                format!("/usr/lib/f{}-{}", id, path)
            };
            trove.add_file(FileId::from_bytes([id; 20]), &path, file_version(ver)).unwrap();
        }
        for (name, ver) in members {
            trove
                .add_trove(&format!("member{}", name), file_version(ver), Flavor::new(), false)
                .unwrap();
        }
        if requires {
            trove.set_requires("trove: bash:runtime".parse().unwrap());
        }
        trove
    }
}

fn members(trove: &Trove) -> BTreeSet<TroveKey> {
    trove.iter_trove_list().cloned().collect()
}

proptest! {
    #[test]
    fn diff_then_apply_reconstructs(new in arb_trove(1), old in arb_trove(0)) {
        let diff = new.diff(Some(&old), false).unwrap();
        let mut rebuilt = old.clone();
        rebuilt.apply_change_set(&diff.change_set, false).unwrap();
        prop_assert_eq!(&rebuilt, &new);
        prop_assert_eq!(members(&rebuilt), members(&new));
        prop_assert_eq!(rebuilt.requires(), new.requires());
    }

    #[test]
    fn absolute_changeset_rebuilds_trove(trove in arb_trove(0)) {
        let diff = trove.diff(None, true).unwrap();
        prop_assert!(diff.change_set.is_absolute());
        let rebuilt = Trove::from_change_set(&diff.change_set).unwrap();
        prop_assert_eq!(&rebuilt, &trove);
        prop_assert_eq!(rebuilt.file_count(), trove.file_count());
    }

    #[test]
    fn freeze_then_thaw_is_identity(new in arb_trove(1), old in arb_trove(0), absolute in prop::bool::ANY) {
        let cs = if absolute {
            new.diff(None, true).unwrap().change_set
        } else {
            new.diff(Some(&old), false).unwrap().change_set
        };
        let thawed = TroveChangeSet::thaw(&cs.freeze()).unwrap();
        prop_assert_eq!(thawed, cs);
    }
}
