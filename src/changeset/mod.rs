// src/changeset/mod.rs

//! Changesets: the deltas exchanged between repositories
//!
//! A [`TroveChangeSet`] describes how one trove moves from an old version
//! (or from nothing) to a new version. A [`ChangeSet`] bundles trove
//! changesets with the file table and file contents they need, and is the
//! unit the commit pipeline accepts.

mod file;
mod freeze;

use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::{FileId, Sha1Digest};
use crate::compression::Compression;
use crate::trove::{TroveInfo, TroveKey};
use crate::version::Version;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    pub file_id: FileId,
    pub path: String,
    pub version: Version,
}

/// A file present on both sides; `None` fields are unchanged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedFile {
    pub file_id: FileId,
    pub path: Option<String>,
    pub version: Option<Version>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TroveOp {
    Add,
    Remove,
}

impl TroveOp {
    pub fn as_char(&self) -> char {
        match self {
            TroveOp::Add => '+',
            TroveOp::Remove => '-',
        }
    }
}

/// One member trove reference added or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveDelta {
    pub op: TroveOp,
    pub version: Version,
    pub flavor: Flavor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveChangeSet {
    name: String,
    flavor: Flavor,
    old_version: Option<Version>,
    new_version: Version,
    absolute: bool,
    new_files: Vec<NewFile>,
    changed_files: Vec<ChangedFile>,
    old_files: Vec<FileId>,
    trove_changes: BTreeMap<String, Vec<TroveDelta>>,
    requires: DependencySet,
    provides: DependencySet,
    info: TroveInfo,
}

impl TroveChangeSet {
    /// An absolute changeset never carries an old version
    pub fn new(
        name: &str,
        flavor: Flavor,
        old_version: Option<Version>,
        new_version: Version,
        absolute: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            flavor,
            old_version: if absolute { None } else { old_version },
            new_version,
            absolute,
            new_files: Vec::new(),
            changed_files: Vec::new(),
            old_files: Vec::new(),
            trove_changes: BTreeMap::new(),
            requires: DependencySet::new(),
            provides: DependencySet::new(),
            info: TroveInfo::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn old_version(&self) -> Option<&Version> {
        self.old_version.as_ref()
    }

    pub fn new_version(&self) -> &Version {
        &self.new_version
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    /// Key of the trove this changeset produces
    pub fn new_key(&self) -> TroveKey {
        TroveKey::new(&self.name, self.new_version.clone(), self.flavor.clone())
    }

    /// Key of the trove this changeset applies to, if relative
    pub fn old_key(&self) -> Option<TroveKey> {
        self.old_version
            .as_ref()
            .map(|v| TroveKey::new(&self.name, v.clone(), self.flavor.clone()))
    }

    pub fn new_files(&self) -> &[NewFile] {
        &self.new_files
    }

    pub fn changed_files(&self) -> &[ChangedFile] {
        &self.changed_files
    }

    pub fn old_files(&self) -> &[FileId] {
        &self.old_files
    }

    pub fn requires(&self) -> &DependencySet {
        &self.requires
    }

    pub fn provides(&self) -> &DependencySet {
        &self.provides
    }

    pub fn info(&self) -> &TroveInfo {
        &self.info
    }

    pub fn set_requires(&mut self, requires: DependencySet) {
        self.requires = requires;
    }

    pub fn set_provides(&mut self, provides: DependencySet) {
        self.provides = provides;
    }

    pub fn set_info(&mut self, info: TroveInfo) {
        self.info = info;
    }

    pub fn info_mut(&mut self) -> &mut TroveInfo {
        &mut self.info
    }

    pub fn new_file(&mut self, file_id: FileId, path: &str, version: Version) {
        self.new_files.push(NewFile {
            file_id,
            path: path.to_string(),
            version,
        });
    }

    pub fn changed_file(&mut self, file_id: FileId, path: Option<String>, version: Option<Version>) {
        self.changed_files.push(ChangedFile {
            file_id,
            path,
            version,
        });
    }

    pub fn old_file(&mut self, file_id: FileId) {
        self.old_files.push(file_id);
    }

    pub fn new_trove_version(&mut self, name: &str, version: Version, flavor: Flavor) {
        self.push_trove_change(name, TroveOp::Add, version, flavor);
    }

    pub fn old_trove_version(&mut self, name: &str, version: Version, flavor: Flavor) {
        self.push_trove_change(name, TroveOp::Remove, version, flavor);
    }

    fn push_trove_change(&mut self, name: &str, op: TroveOp, version: Version, flavor: Flavor) {
        self.trove_changes
            .entry(name.to_string())
            .or_default()
            .push(TroveDelta { op, version, flavor });
    }

    /// Member deltas, grouped by name in name order
    pub fn iter_trove_changes(&self) -> impl Iterator<Item = (&str, &TroveDelta)> {
        self.trove_changes
            .iter()
            .flat_map(|(name, deltas)| deltas.iter().map(move |d| (name.as_str(), d)))
    }

    /// Files whose content version this changeset sets
    pub fn iter_file_versions(&self) -> impl Iterator<Item = (FileId, &Version)> {
        self.new_files
            .iter()
            .map(|f| (f.file_id, &f.version))
            .chain(
                self.changed_files
                    .iter()
                    .filter_map(|f| f.version.as_ref().map(|v| (f.file_id, v))),
            )
    }

    /// No file or member trove changes at all
    pub fn is_empty_delta(&self) -> bool {
        self.new_files.is_empty()
            && self.changed_files.is_empty()
            && self.old_files.is_empty()
            && self.trove_changes.values().all(|d| d.is_empty())
    }
}

/// What the repository records about one file version's contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub version: Version,
    pub sha1: Sha1Digest,
    pub config: bool,
}

/// File contents carried by a changeset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContents {
    /// Whole contents, optionally gzip compressed
    Full { data: Vec<u8>, compressed: bool },
    /// Same bytes as another file in this changeset
    Pointer(FileId),
}

impl FileContents {
    pub fn from_bytes(data: &[u8], compress: bool) -> Result<Self> {
        let data = if compress {
            Compression::Gzip.compress(data)?
        } else {
            data.to_vec()
        };
        Ok(FileContents::Full {
            data,
            compressed: compress,
        })
    }

    /// Decompressed bytes of a full entry
    pub fn bytes(&self) -> Result<Vec<u8>> {
        match self {
            FileContents::Full { data, compressed } => {
                if *compressed {
                    Compression::Gzip.decompress(data)
                } else {
                    Ok(data.clone())
                }
            }
            FileContents::Pointer(target) => Err(Error::ContractViolation(format!(
                "contents are a pointer to {}",
                target
            ))),
        }
    }
}

/// A batch of trove changesets plus the file data they reference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    new_troves: Vec<TroveChangeSet>,
    old_troves: Vec<TroveKey>,
    files: BTreeMap<FileId, FileInfo>,
    contents: BTreeMap<FileId, FileContents>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_trove(&mut self, cs: TroveChangeSet) {
        self.new_troves.push(cs);
    }

    pub fn old_trove(&mut self, key: TroveKey) {
        self.old_troves.push(key);
    }

    pub fn iter_new_troves(&self) -> impl Iterator<Item = &TroveChangeSet> {
        self.new_troves.iter()
    }

    pub fn iter_old_troves(&self) -> impl Iterator<Item = &TroveKey> {
        self.old_troves.iter()
    }

    pub fn new_trove_count(&self) -> usize {
        self.new_troves.len()
    }

    /// Record a file's contents identity; one entry per file id
    pub fn add_file(&mut self, file_id: FileId, info: FileInfo) -> Result<()> {
        if let Some(existing) = self.files.get(&file_id) {
            if *existing == info {
                return Ok(());
            }
            return Err(Error::ContractViolation(format!(
                "file {} listed twice with different contents",
                file_id
            )));
        }
        self.files.insert(file_id, info);
        Ok(())
    }

    pub fn file_info(&self, file_id: &FileId) -> Option<&FileInfo> {
        self.files.get(file_id)
    }

    pub fn iter_files(&self) -> impl Iterator<Item = (&FileId, &FileInfo)> {
        self.files.iter()
    }

    pub fn add_file_contents(&mut self, file_id: FileId, contents: FileContents) {
        self.contents.insert(file_id, contents);
    }

    pub fn file_contents(&self, file_id: &FileId) -> Option<&FileContents> {
        self.contents.get(file_id)
    }

    pub fn iter_contents(&self) -> impl Iterator<Item = (&FileId, &FileContents)> {
        self.contents.iter()
    }

    /// Every trove changeset needs no prior state
    pub fn is_absolute(&self) -> bool {
        self.new_troves.iter().all(|cs| cs.is_absolute())
    }

    pub fn is_empty(&self) -> bool {
        self.new_troves.is_empty() && self.old_troves.is_empty()
    }
}
