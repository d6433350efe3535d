// src/trove/mod.rs

//! Troves: named, versioned, flavored units of software
//!
//! A trove owns a file map (file id → path and version) and a set of
//! references to member troves. A trove with only files is a package, one
//! with only member troves is a group; nothing enforces the distinction.
//!
//! Troves change by applying a [`TroveChangeSet`], which is produced by
//! [`Trove::diff`] (see `diff.rs`) or thawed from the wire.

mod diff;

pub use diff::{FileNeeded, TroveDiff, TroveNeeded};

use crate::capsule::CapsuleKind;
use crate::changeset::{TroveChangeSet, TroveOp};
use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::{FileId, Sha1Digest};
use crate::version::{Timestamp, Version};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use tracing::debug;

/// Trove schema this repository understands
pub const TROVE_VERSION: u32 = 1;

/// `(name, version, flavor)`, the identity of a trove everywhere
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TroveKey {
    pub name: String,
    pub version: Version,
    pub flavor: Flavor,
}

impl TroveKey {
    pub fn new(name: &str, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            version,
            flavor,
        }
    }
}

impl fmt::Display for TroveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}[{}]", self.name, self.version, self.flavor)
    }
}

/// Where a file lives and the version its content was introduced at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveFile {
    pub path: String,
    pub version: Version,
}

/// Path, version and owning trove name for each file touched by an apply
pub type FileMap = BTreeMap<FileId, (String, Version, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveSignature {
    /// Key fingerprint, hex
    pub fingerprint: String,
    pub signature: Vec<u8>,
}

/// Identity of the foreign payload carried by a capsule trove
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleInfo {
    pub kind: CapsuleKind,
    /// SHA-1 of the payload
    pub content_id: Sha1Digest,
    /// Digest of the foreign format's own metadata block, when known
    pub metadata: Option<Sha1Digest>,
}

/// Metadata that travels with a trove and with its changesets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveInfo {
    pub sha1: Option<Sha1Digest>,
    pub trove_version: u32,
    pub incomplete: bool,
    pub signatures: Vec<TroveSignature>,
    pub capsule: Option<CapsuleInfo>,
}

impl Default for TroveInfo {
    fn default() -> Self {
        Self {
            sha1: None,
            trove_version: TROVE_VERSION,
            incomplete: false,
            signatures: Vec::new(),
            capsule: None,
        }
    }
}

impl TroveInfo {
    pub fn is_default(&self) -> bool {
        *self == TroveInfo::default()
    }

    /// `key=value` pairs joined by `;`, no whitespace
    pub fn freeze(&self) -> String {
        let mut parts = Vec::new();
        if let Some(sha1) = &self.sha1 {
            parts.push(format!("sha1={}", sha1));
        }
        if self.trove_version != TROVE_VERSION {
            parts.push(format!("schema={}", self.trove_version));
        }
        if self.incomplete {
            parts.push("incomplete=1".to_string());
        }
        for sig in &self.signatures {
            parts.push(format!("sig={}:{}", sig.fingerprint, hex::encode(&sig.signature)));
        }
        if let Some(capsule) = &self.capsule {
            let mut item = format!("capsule={}:{}", capsule.kind, capsule.content_id);
            if let Some(metadata) = &capsule.metadata {
                item.push(':');
                item.push_str(&metadata.to_hex());
            }
            parts.push(item);
        }
        parts.join(";")
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        let bad = || Error::ParseError(format!("Invalid trove info '{}'", frozen));
        let mut info = TroveInfo::default();
        for part in frozen.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(bad)?;
            match key {
                "sha1" => info.sha1 = Some(value.parse()?),
                "schema" => info.trove_version = value.parse().map_err(|_| bad())?,
                "incomplete" => info.incomplete = value == "1",
                "sig" => {
                    let (fingerprint, signature) = value.split_once(':').ok_or_else(bad)?;
                    if fingerprint.is_empty() {
                        return Err(bad());
                    }
                    info.signatures.push(TroveSignature {
                        fingerprint: fingerprint.to_string(),
                        signature: hex::decode(signature).map_err(|_| bad())?,
                    });
                }
                "capsule" => {
                    let mut fields = value.split(':');
                    let kind = fields.next().ok_or_else(bad)?.parse()?;
                    let content_id = fields.next().ok_or_else(bad)?.parse()?;
                    let metadata = fields.next().map(str::parse).transpose()?;
                    info.capsule = Some(CapsuleInfo {
                        kind,
                        content_id,
                        metadata,
                    });
                }
                _ => return Err(bad()),
            }
        }
        Ok(info)
    }
}

/// Fetches troves by key; lets closures walk member troves lazily
pub trait TroveSource {
    fn get_trove(&self, name: &str, version: &Version, flavor: &Flavor) -> Result<Trove>;
}

#[derive(Debug, Clone)]
pub struct Trove {
    name: String,
    version: Version,
    flavor: Flavor,
    files: BTreeMap<FileId, TroveFile>,
    troves: BTreeSet<TroveKey>,
    provides: DependencySet,
    requires: DependencySet,
    info: TroveInfo,
}

impl Trove {
    pub fn new(name: &str, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            version,
            flavor,
            files: BTreeMap::new(),
            troves: BTreeSet::new(),
            provides: DependencySet::new(),
            requires: DependencySet::new(),
            info: TroveInfo::default(),
        }
    }

    /// Build a trove from a changeset that needs no prior state
    pub fn from_change_set(cs: &TroveChangeSet) -> Result<Self> {
        if cs.old_version().is_some() {
            return Err(Error::ContractViolation(format!(
                "changeset for {} is relative to {}",
                cs.name(),
                cs.new_version()
            )));
        }
        let mut trove = Trove::new(cs.name(), cs.new_version().clone(), cs.flavor().clone());
        trove.apply_change_set(cs, false)?;
        Ok(trove)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn key(&self) -> TroveKey {
        TroveKey::new(&self.name, self.version.clone(), self.flavor.clone())
    }

    pub fn change_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn change_flavor(&mut self, flavor: Flavor) {
        self.flavor = flavor;
    }

    pub fn info(&self) -> &TroveInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut TroveInfo {
        &mut self.info
    }

    pub fn provides(&self) -> &DependencySet {
        &self.provides
    }

    pub fn requires(&self) -> &DependencySet {
        &self.requires
    }

    pub fn set_provides(&mut self, provides: DependencySet) {
        self.provides = provides;
    }

    pub fn set_requires(&mut self, requires: DependencySet) {
        self.requires = requires;
    }

    pub fn is_capsule(&self) -> bool {
        self.info.capsule.is_some()
    }

    pub fn add_file(&mut self, file_id: FileId, path: &str, version: Version) -> Result<()> {
        if self.files.contains_key(&file_id) {
            return Err(Error::DuplicateFile {
                trove: self.name.clone(),
                file_id: file_id.to_hex(),
            });
        }
        self.files.insert(
            file_id,
            TroveFile {
                path: path.to_string(),
                version,
            },
        );
        Ok(())
    }

    /// Change a file's path and/or version; `None` keeps the current value
    pub fn update_file(
        &mut self,
        file_id: &FileId,
        path: Option<&str>,
        version: Option<&Version>,
    ) -> Result<()> {
        let file = self.files.get_mut(file_id).ok_or_else(|| {
            Error::NotFound(format!("file {} in trove {}", file_id, self.name))
        })?;
        if let Some(path) = path {
            file.path = path.to_string();
        }
        if let Some(version) = version {
            file.version = version.clone();
        }
        Ok(())
    }

    pub fn remove_file(&mut self, file_id: &FileId) -> Result<TroveFile> {
        self.files
            .remove(file_id)
            .ok_or_else(|| Error::NotFound(format!("file {} in trove {}", file_id, self.name)))
    }

    pub fn get_file(&self, file_id: &FileId) -> Option<&TroveFile> {
        self.files.get(file_id)
    }

    pub fn has_file(&self, file_id: &FileId) -> bool {
        self.files.contains_key(file_id)
    }

    /// Files in file-id order
    pub fn iter_file_list(&self) -> impl Iterator<Item = (&FileId, &TroveFile)> {
        self.files.iter()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn add_trove(
        &mut self,
        name: &str,
        version: Version,
        flavor: Flavor,
        present_okay: bool,
    ) -> Result<()> {
        let key = TroveKey::new(name, version, flavor);
        if self.troves.contains(&key) {
            if present_okay {
                return Ok(());
            }
            return Err(Error::DuplicateTrove {
                trove: self.name.clone(),
                name: key.name,
                version: key.version.to_string(),
            });
        }
        self.troves.insert(key);
        Ok(())
    }

    pub fn del_trove(
        &mut self,
        name: &str,
        version: &Version,
        flavor: &Flavor,
        missing_okay: bool,
    ) -> Result<()> {
        let key = TroveKey::new(name, version.clone(), flavor.clone());
        if !self.troves.remove(&key) && !missing_okay {
            return Err(Error::NotFound(format!("trove {} in {}", key, self.name)));
        }
        Ok(())
    }

    pub fn has_trove(&self, name: &str, version: &Version, flavor: &Flavor) -> bool {
        self.troves
            .contains(&TroveKey::new(name, version.clone(), flavor.clone()))
    }

    /// Member troves in key order
    pub fn iter_trove_list(&self) -> impl Iterator<Item = &TroveKey> {
        self.troves.iter()
    }

    pub fn trove_count(&self) -> usize {
        self.troves.len()
    }

    /// Apply per-name `+`/`-` member deltas
    pub fn merge_trove_list_changes<'a>(
        &mut self,
        changes: impl IntoIterator<Item = (&'a str, TroveOp, &'a Version, &'a Flavor)>,
        redundant_okay: bool,
    ) -> Result<()> {
        for (name, op, version, flavor) in changes {
            match op {
                TroveOp::Add => self.add_trove(name, version.clone(), flavor.clone(), redundant_okay)?,
                TroveOp::Remove => self.del_trove(name, version, flavor, redundant_okay)?,
            }
        }
        Ok(())
    }

    /// Mutate this trove into the changeset's new state
    ///
    /// Returns every file the changeset added or changed, keyed by id.
    pub fn apply_change_set(&mut self, cs: &TroveChangeSet, redundant_okay: bool) -> Result<FileMap> {
        if cs.name() != self.name {
            return Err(Error::ContractViolation(format!(
                "cannot apply changeset for {} to trove {}",
                cs.name(),
                self.name
            )));
        }
        if let Some(old) = cs.old_version()
            && *old != self.version
        {
            return Err(Error::ContractViolation(format!(
                "changeset for {} starts at {}, trove is at {}",
                self.name, old, self.version
            )));
        }

        self.version = cs.new_version().clone();
        self.flavor = cs.flavor().clone();
        self.requires = cs.requires().clone();
        self.provides = cs.provides().clone();
        self.info = cs.info().clone();

        let mut file_map = FileMap::new();
        for file in cs.new_files() {
            self.add_file(file.file_id, &file.path, file.version.clone())?;
            file_map.insert(
                file.file_id,
                (file.path.clone(), file.version.clone(), self.name.clone()),
            );
        }
        for file in cs.changed_files() {
            self.update_file(&file.file_id, file.path.as_deref(), file.version.as_ref())?;
            if let Some(current) = self.files.get(&file.file_id) {
                file_map.insert(
                    file.file_id,
                    (current.path.clone(), current.version.clone(), self.name.clone()),
                );
            }
        }
        for file_id in cs.old_files() {
            self.remove_file(file_id)?;
        }

        self.merge_trove_list_changes(
            cs.iter_trove_changes()
                .map(|(name, delta)| (name, delta.op, &delta.version, &delta.flavor)),
            redundant_okay,
        )?;

        debug!(
            "Applied changeset to {}: {} files touched, {} files total",
            self.name,
            file_map.len(),
            self.files.len()
        );
        Ok(file_map)
    }

    /// Stamp the trove version, and every file version introduced by it
    pub fn reset_timestamps(&mut self, timestamp: Timestamp) {
        let current = self.version.clone();
        for file in self.files.values_mut() {
            if file.version == current {
                file.version.reset_timestamps(timestamp);
            }
        }
        self.version.reset_timestamps(timestamp);
    }

    /// SHA-1 over a canonical form that ignores timestamps and trove info
    /// other than the capsule identity
    pub fn compute_digest(&self) -> Sha1Digest {
        let mut hasher = Sha1::new();
        hasher.update(format!("{}\n{}\n{}\n", self.name, self.version, self.flavor.freeze()));
        hasher.update(format!("{}\n{}\n", self.requires.freeze(), self.provides.freeze()));
        for (file_id, file) in &self.files {
            hasher.update(format!("F {} {} {}\n", file_id, file.version, file.path));
        }
        for key in &self.troves {
            hasher.update(format!(
                "T {} {} {}\n",
                key.name,
                key.version,
                key.flavor.freeze()
            ));
        }
        if let Some(capsule) = &self.info.capsule {
            hasher.update(format!("C {} {}\n", capsule.kind, capsule.content_id));
        }
        Sha1Digest::from_hasher(hasher)
    }

    /// Compute and record the trove digest
    pub fn compute_digests(&mut self) -> Sha1Digest {
        let digest = self.compute_digest();
        self.info.sha1 = Some(digest);
        digest
    }

    /// `<count>` then `FILEID PATH VERSION` per line; file-only troves
    pub fn freeze_file_list(&self) -> Result<String> {
        if !self.troves.is_empty() {
            return Err(Error::ContractViolation(format!(
                "trove {} has member troves; only file lists can be frozen",
                self.name
            )));
        }
        let mut out = format!("{}\n", self.files.len());
        for (file_id, file) in &self.files {
            out.push_str(&format!("{} {} {}\n", file_id, file.path, file.version.freeze()));
        }
        Ok(out)
    }

    /// Add the files listed by `freeze_file_list`
    pub fn read_file_list(&mut self, text: &str) -> Result<()> {
        let mut lines = text.lines();
        let count: usize = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| Error::ParseError("file list is missing its count".to_string()))?;
        for _ in 0..count {
            let line = lines
                .next()
                .ok_or_else(|| Error::ParseError("file list is truncated".to_string()))?;
            let (file_id, path, version) = split_id_path_version(line)?;
            self.add_file(file_id.parse()?, path, Version::thaw(version)?)?;
        }
        Ok(())
    }

    /// Breadth-first closure of this trove and its members, each key once
    pub fn walk_trove_set<S: TroveSource>(&self, source: &S) -> Result<Vec<Trove>> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        let mut out = Vec::new();

        seen.insert(self.key());
        queue.push_back(self.clone());
        while let Some(trove) = queue.pop_front() {
            for key in trove.iter_trove_list() {
                if seen.insert(key.clone()) {
                    queue.push_back(source.get_trove(&key.name, &key.version, &key.flavor)?);
                }
            }
            out.push(trove);
        }
        Ok(out)
    }
}

/// Split `ID PATH VERSION` where the path may contain spaces
pub(crate) fn split_id_path_version(line: &str) -> Result<(&str, &str, &str)> {
    let bad = || Error::ParseError(format!("Malformed file line '{}'", line));
    let (id, rest) = line.split_once(' ').ok_or_else(bad)?;
    let (path, version) = rest.rsplit_once(' ').ok_or_else(bad)?;
    if id.is_empty() || path.is_empty() || version.is_empty() {
        return Err(bad());
    }
    Ok((id, path, version))
}

/// Same identity and no residual file or member delta
impl PartialEq for Trove {
    fn eq(&self, other: &Self) -> bool {
        if self.name != other.name || self.version != other.version || self.flavor != other.flavor
        {
            return false;
        }
        match self.diff(Some(other), false) {
            Ok(diff) => diff.change_set.is_empty_delta(),
            Err(_) => false,
        }
    }
}

impl Eq for Trove {}
