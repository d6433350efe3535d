// src/capsule/mod.rs

//! Foreign package payloads ("capsules") carried inside troves
//!
//! A capsule trove holds one payload in a foreign format (RPM, DEB, Arch)
//! under [`FileId::CAPSULE`] plus any files conary itself owns. Installing
//! the payload is delegated to a [`CapsuleInstaller`] registered for its
//! kind; conary only decides what needs (re)installing and keeps its own
//! files out of the installer's way with an [`OwnershipJournal`].

mod journal;

pub use journal::{OwnershipJournal, path_under_root};

use crate::cas::ContentStore;
use crate::error::{Error, Result};
use crate::hash::{FileId, Sha1Digest};
use crate::trove::{Trove, TroveKey};
use crate::version::Version;
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Foreign package formats a capsule may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CapsuleKind {
    Rpm,
    Deb,
    Arch,
}

impl CapsuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapsuleKind::Rpm => "rpm",
            CapsuleKind::Deb => "deb",
            CapsuleKind::Arch => "arch",
        }
    }
}

impl fmt::Display for CapsuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapsuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rpm" => Ok(CapsuleKind::Rpm),
            "deb" => Ok(CapsuleKind::Deb),
            "arch" => Ok(CapsuleKind::Arch),
            other => Err(Error::ParseError(format!("unknown capsule kind '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallFlags {
    /// Record the change without touching the filesystem
    pub just_database: bool,
    /// Ask installers not to run package scripts
    pub no_scripts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Skipped,
}

/// One payload queued for installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleJob {
    pub kind: CapsuleKind,
    pub trove: TroveKey,
    pub path: String,
    pub version: Version,
    pub sha1: Sha1Digest,
}

/// Installer for one foreign package format
///
/// `install` and `remove` only queue work; `apply` performs it.
pub trait CapsuleInstaller: Send {
    fn install(&mut self, flags: &InstallFlags, job: &CapsuleJob) -> Result<()>;

    fn remove(&mut self, trove: &Trove) -> Result<()>;

    /// Install every queued payload; `payloads` maps each trove to its
    /// payload written out as a regular file
    fn apply(
        &mut self,
        payloads: &BTreeMap<TroveKey, PathBuf>,
        root: &Path,
        flags: &InstallFlags,
    ) -> Result<()>;

    /// Failures reported by the last `apply`
    fn errors(&self) -> Vec<String>;
}

/// Installers by kind plus the work queued for the current commit
#[derive(Default)]
pub struct CapsuleOperations {
    installers: BTreeMap<CapsuleKind, Box<dyn CapsuleInstaller>>,
    queued: Vec<CapsuleJob>,
    removed: Vec<TroveKey>,
    /// Paths conary owns inside queued capsule troves
    preserve: BTreeSet<String>,
}

impl CapsuleOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: CapsuleKind, installer: Box<dyn CapsuleInstaller>) {
        debug!("Registered {} capsule installer", kind);
        self.installers.insert(kind, installer);
    }

    pub fn is_registered(&self, kind: CapsuleKind) -> bool {
        self.installers.contains_key(&kind)
    }

    pub fn queued(&self) -> &[CapsuleJob] {
        &self.queued
    }

    pub fn has_pending(&self) -> bool {
        !self.queued.is_empty() || !self.removed.is_empty()
    }

    fn installer(&mut self, kind: CapsuleKind) -> Result<&mut Box<dyn CapsuleInstaller>> {
        self.installers
            .get_mut(&kind)
            .ok_or_else(|| Error::UnregisteredCapsule(kind.to_string()))
    }

    /// Queue the capsule of `new` unless nothing about it changed
    ///
    /// `old` is the trove `new` replaces, if any. A changed capsule removes
    /// the old payload before queueing the new one.
    pub fn install(
        &mut self,
        flags: &InstallFlags,
        new: &Trove,
        old: Option<&Trove>,
    ) -> Result<InstallOutcome> {
        let Some(capsule) = &new.info().capsule else {
            return Ok(InstallOutcome::Skipped);
        };

        // troves on the local label were never installed by a capsule
        if let Some(old) = old
            && old.version().is_on_local_host()
        {
            debug!("Skipping capsule for {}: old version is local", new.key());
            return Ok(InstallOutcome::Skipped);
        }

        if !self.is_registered(capsule.kind) {
            return Err(Error::UnregisteredCapsule(capsule.kind.to_string()));
        }

        let payload = new.get_file(&FileId::CAPSULE).ok_or_else(|| {
            let key = new.key();
            Error::TroveIntegrityError {
                name: key.name,
                version: key.version.to_string(),
                flavor: key.flavor.to_string(),
                reason: "capsule trove has no capsule file".to_string(),
            }
        })?;

        if let Some(old) = old {
            if capsule_unchanged(old, new) {
                debug!("Capsule for {} unchanged, not reinstalling", new.key());
                return Ok(InstallOutcome::Skipped);
            }
            if old.is_capsule() {
                self.remove(old)?;
            }
        }

        let job = CapsuleJob {
            kind: capsule.kind,
            trove: new.key(),
            path: payload.path.clone(),
            version: payload.version.clone(),
            sha1: capsule.content_id,
        };
        self.installer(capsule.kind)?.install(flags, &job)?;
        for (file_id, file) in new.iter_file_list() {
            if *file_id != FileId::CAPSULE {
                self.preserve.insert(file.path.clone());
            }
        }
        debug!("Queued {} capsule for {}", job.kind, job.trove);
        self.queued.push(job);
        Ok(InstallOutcome::Installed)
    }

    /// Queue removal of a capsule trove's payload
    ///
    /// Returns false for troves that carry no capsule.
    pub fn remove(&mut self, trove: &Trove) -> Result<bool> {
        let Some(capsule) = &trove.info().capsule else {
            return Ok(false);
        };
        self.installer(capsule.kind)?.remove(trove)?;
        self.removed.push(trove.key());
        Ok(true)
    }

    /// Run every installer against `root` and clear the queues
    ///
    /// Payloads come from `store` and are checked against their digest on
    /// the way out. Paths conary owns in the queued troves are journaled
    /// for the duration, so whatever an installer leaves there is replaced
    /// by the pre-commit state.
    pub fn apply(
        &mut self,
        root: &Path,
        store: &dyn ContentStore,
        flags: &InstallFlags,
    ) -> Result<()> {
        let queued = std::mem::take(&mut self.queued);
        let removed = std::mem::take(&mut self.removed);
        let preserve = std::mem::take(&mut self.preserve);
        if queued.is_empty() && removed.is_empty() {
            return Ok(());
        }

        let tmp_dir = if root.join("var/tmp").is_dir() {
            root.join("var/tmp")
        } else {
            root.to_path_buf()
        };

        // keeps the temporary payloads alive until the installers are done
        let mut payload_files = Vec::new();
        let mut payloads: BTreeMap<CapsuleKind, BTreeMap<TroveKey, PathBuf>> = BTreeMap::new();
        for job in &queued {
            let file = write_payload(&tmp_dir, store, job)?;
            payloads
                .entry(job.kind)
                .or_default()
                .insert(job.trove.clone(), file.path().to_path_buf());
            payload_files.push(file);
        }

        let journal = if flags.just_database {
            None
        } else {
            let mut journal = OwnershipJournal::new()?;
            for path in &preserve {
                journal.backup(&path_under_root(root, path)?)?;
            }
            Some(journal)
        };

        let mut errors = Vec::new();
        let empty = BTreeMap::new();
        for (kind, installer) in self.installers.iter_mut() {
            let batch = payloads.get(kind).unwrap_or(&empty);
            if let Err(e) = installer.apply(batch, root, flags) {
                errors.push(format!("{}: {}", kind, e));
            }
            errors.extend(installer.errors().into_iter().map(|e| format!("{}: {}", kind, e)));
        }

        if let Some(journal) = journal
            && let Err(e) = journal.revert()
        {
            warn!("Ownership journal revert failed: {}", e);
            errors.push(format!("journal revert: {}", e));
        }

        for file in payload_files {
            if let Err(e) = file.close() {
                debug!("Could not remove temporary capsule payload: {}", e);
            }
        }

        if !errors.is_empty() {
            return Err(Error::CapsuleError(errors));
        }
        info!(
            "Applied {} capsule installs and {} removals",
            queued.len(),
            removed.len()
        );
        Ok(())
    }

    /// Drop queued work without running it
    pub fn reset(&mut self) {
        self.queued.clear();
        self.removed.clear();
        self.preserve.clear();
    }
}

fn capsule_unchanged(old: &Trove, new: &Trove) -> bool {
    let (Some(old_info), Some(new_info)) = (&old.info().capsule, &new.info().capsule) else {
        return false;
    };
    if old_info == new_info || old_info.content_id == new_info.content_id {
        return true;
    }
    if old_info.metadata.is_some() && old_info.metadata == new_info.metadata {
        return true;
    }
    match (old.get_file(&FileId::CAPSULE), new.get_file(&FileId::CAPSULE)) {
        (Some(a), Some(b)) => a.version == b.version,
        _ => false,
    }
}

fn write_payload(
    dir: &Path,
    store: &dyn ContentStore,
    job: &CapsuleJob,
) -> Result<tempfile::NamedTempFile> {
    let data = store.get(&job.sha1)?;
    let mut file = tempfile::Builder::new()
        .prefix("capsule-")
        .suffix(".conary")
        .tempfile_in(dir)?;

    let mut hasher = Sha1::new();
    hasher.update(&data);
    let actual = Sha1Digest::from_hasher(hasher);
    if actual != job.sha1 {
        return Err(Error::DigestMismatch {
            id: job.trove.to_string(),
            expected: job.sha1.to_hex(),
            actual: actual.to_hex(),
        });
    }
    file.write_all(&data)?;
    file.flush()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::DataStore;
    use crate::compression::Compression;
    use crate::flavor::Flavor;
    use crate::trove::CapsuleInfo;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Log {
        installed: Vec<CapsuleJob>,
        removed: Vec<TroveKey>,
        applied: Vec<Vec<u8>>,
    }

    struct FakeInstaller {
        log: Arc<Mutex<Log>>,
        clobber: Option<String>,
        fail: bool,
    }

    impl CapsuleInstaller for FakeInstaller {
        fn install(&mut self, _flags: &InstallFlags, job: &CapsuleJob) -> Result<()> {
            self.log.lock().unwrap().installed.push(job.clone());
            Ok(())
        }

        fn remove(&mut self, trove: &Trove) -> Result<()> {
            self.log.lock().unwrap().removed.push(trove.key());
            Ok(())
        }

        fn apply(
            &mut self,
            payloads: &BTreeMap<TroveKey, PathBuf>,
            root: &Path,
            _flags: &InstallFlags,
        ) -> Result<()> {
            for path in payloads.values() {
                self.log.lock().unwrap().applied.push(fs::read(path)?);
            }
            if let Some(path) = &self.clobber {
                fs::write(root.join(path), b"installer wrote this")?;
            }
            if self.fail {
                return Err(Error::CommitError("scriptlet failed".to_string()));
            }
            Ok(())
        }

        fn errors(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn capsule_trove(version: &str, payload: &[u8]) -> Trove {
        let mut trove = Trove::new("foo", v(version), Flavor::new());
        trove
            .add_file(FileId::CAPSULE, "foo-1.0.rpm", v(version))
            .unwrap();
        trove
            .add_file(FileId::derive(b"conf"), "/etc/foo.conf", v(version))
            .unwrap();
        trove.info_mut().capsule = Some(CapsuleInfo {
            kind: CapsuleKind::Rpm,
            content_id: Sha1Digest::of(payload),
            metadata: None,
        });
        trove
    }

    fn operations(clobber: Option<&str>, fail: bool) -> (CapsuleOperations, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut ops = CapsuleOperations::new();
        ops.register(
            CapsuleKind::Rpm,
            Box::new(FakeInstaller {
                log: log.clone(),
                clobber: clobber.map(str::to_string),
                fail,
            }),
        );
        (ops, log)
    }

    const V1: &str = "/conary.example.com@rpl:devel/1.0-1-1";
    const V2: &str = "/conary.example.com@rpl:devel/1.0-2-1";

    #[test]
    fn test_kind_round_trip() {
        for kind in [CapsuleKind::Rpm, CapsuleKind::Deb, CapsuleKind::Arch] {
            assert_eq!(kind.to_string().parse::<CapsuleKind>().unwrap(), kind);
        }
        assert!("msi".parse::<CapsuleKind>().is_err());
    }

    #[test]
    fn test_plain_trove_is_skipped() {
        let (mut ops, _) = operations(None, false);
        let trove = Trove::new("bar", v(V1), Flavor::new());
        assert_eq!(
            ops.install(&InstallFlags::default(), &trove, None).unwrap(),
            InstallOutcome::Skipped
        );
        assert!(!ops.has_pending());
    }

    #[test]
    fn test_unregistered_kind_fails() {
        let mut ops = CapsuleOperations::new();
        let trove = capsule_trove(V1, b"payload");
        assert!(matches!(
            ops.install(&InstallFlags::default(), &trove, None),
            Err(Error::UnregisteredCapsule(_))
        ));
    }

    #[test]
    fn test_unchanged_capsule_not_reinstalled() {
        let (mut ops, log) = operations(None, false);
        let old = capsule_trove(V1, b"payload");
        let new = capsule_trove(V2, b"payload");
        assert_eq!(
            ops.install(&InstallFlags::default(), &new, Some(&old)).unwrap(),
            InstallOutcome::Skipped
        );

        let changed = capsule_trove(V2, b"payload v2");
        assert_eq!(
            ops.install(&InstallFlags::default(), &changed, Some(&old)).unwrap(),
            InstallOutcome::Installed
        );
        let log = log.lock().unwrap();
        assert_eq!(log.removed, vec![old.key()]);
        assert_eq!(log.installed.len(), 1);
    }

    #[test]
    fn test_local_old_version_is_skipped() {
        let (mut ops, _) = operations(None, false);
        let old = capsule_trove("/local@local:COOK/1.0-1-1", b"a");
        let new = capsule_trove(V2, b"b");
        assert_eq!(
            ops.install(&InstallFlags::default(), &new, Some(&old)).unwrap(),
            InstallOutcome::Skipped
        );
    }

    #[test]
    fn test_apply_restores_owned_paths() {
        let root = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = DataStore::new(store_dir.path(), Compression::Zstd).unwrap();
        store.put(b"payload").unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/foo.conf"), b"conary copy").unwrap();

        let (mut ops, log) = operations(Some("etc/foo.conf"), false);
        let trove = capsule_trove(V1, b"payload");
        ops.install(&InstallFlags::default(), &trove, None).unwrap();
        ops.apply(root.path(), &store, &InstallFlags::default()).unwrap();

        assert_eq!(
            fs::read(root.path().join("etc/foo.conf")).unwrap(),
            b"conary copy"
        );
        assert_eq!(log.lock().unwrap().applied, vec![b"payload".to_vec()]);
        assert!(!ops.has_pending());
    }

    #[test]
    fn test_failed_apply_reverts_and_reports() {
        let root = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = DataStore::new(store_dir.path(), Compression::None).unwrap();
        store.put(b"payload").unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/foo.conf"), b"before").unwrap();

        let (mut ops, _) = operations(Some("etc/foo.conf"), true);
        ops.install(&InstallFlags::default(), &capsule_trove(V1, b"payload"), None)
            .unwrap();
        let err = ops
            .apply(root.path(), &store, &InstallFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::CapsuleError(ref errors) if errors.len() == 1));
        assert_eq!(fs::read(root.path().join("etc/foo.conf")).unwrap(), b"before");
    }

    #[test]
    fn test_missing_payload_is_not_found() {
        let root = TempDir::new().unwrap();
        let store_dir = TempDir::new().unwrap();
        let store = DataStore::new(store_dir.path(), Compression::Zstd).unwrap();

        let (mut ops, _) = operations(None, false);
        ops.install(&InstallFlags::default(), &capsule_trove(V1, b"payload"), None)
            .unwrap();
        let err = ops
            .apply(root.path(), &store, &InstallFlags::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
