// src/trove/diff.rs

//! Trove diff engine
//!
//! `diff` compares a trove against an older trove of the same name and
//! flavor (or against nothing) and produces the changeset that turns the
//! old trove into this one, plus two worklists the caller resolves: files
//! whose contents are needed and member troves that must be diffed in turn.
//! The engine never recurses into member troves itself.

use super::Trove;
use crate::changeset::TroveChangeSet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::FileId;
use crate::version::Version;
use std::collections::BTreeMap;

/// A file whose contents the caller must resolve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNeeded {
    pub file_id: FileId,
    pub old_version: Option<Version>,
    pub new_version: Version,
    pub path: String,
}

/// A member trove the caller must diff in turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveNeeded {
    pub name: String,
    pub old_version: Option<Version>,
    pub new_version: Version,
    pub flavor: Flavor,
}

#[derive(Debug, Clone)]
pub struct TroveDiff {
    pub change_set: TroveChangeSet,
    pub files_needed: Vec<FileNeeded>,
    pub troves_needed: Vec<TroveNeeded>,
}

type Bucket = BTreeMap<(String, Flavor), Vec<Version>>;

impl Trove {
    /// Changeset from `them` (the old trove, if any) to `self`
    ///
    /// With `absolute` set, no worklist entry carries an old version, and
    /// the changeset is marked absolute when there is no old trove.
    pub fn diff(&self, them: Option<&Trove>, absolute: bool) -> Result<TroveDiff> {
        if let Some(them) = them {
            if them.name != self.name {
                return Err(Error::ContractViolation(format!(
                    "cannot diff trove {} against {}",
                    self.name, them.name
                )));
            }
            if them.flavor != self.flavor {
                return Err(Error::ContractViolation(format!(
                    "cannot diff {}[{}] against flavor [{}]",
                    self.name, self.flavor, them.flavor
                )));
            }
        }

        let mut cs = TroveChangeSet::new(
            &self.name,
            self.flavor.clone(),
            them.map(|t| t.version.clone()),
            self.version.clone(),
            absolute && them.is_none(),
        );
        cs.set_requires(self.requires.clone());
        cs.set_provides(self.provides.clone());
        cs.set_info(self.info.clone());

        let mut files_needed = Vec::new();

        if let Some(them) = them {
            for file_id in them.files.keys() {
                if !self.files.contains_key(file_id) {
                    cs.old_file(*file_id);
                }
            }
        }

        for (file_id, file) in &self.files {
            let old = them.and_then(|t| t.files.get(file_id));
            match old {
                None => {
                    cs.new_file(*file_id, &file.path, file.version.clone());
                    files_needed.push(FileNeeded {
                        file_id: *file_id,
                        old_version: None,
                        new_version: file.version.clone(),
                        path: file.path.clone(),
                    });
                }
                Some(old) => {
                    let path = (old.path != file.path).then(|| file.path.clone());
                    let version = (old.version != file.version).then(|| file.version.clone());
                    if version.is_some() {
                        files_needed.push(FileNeeded {
                            file_id: *file_id,
                            old_version: (!absolute).then(|| old.version.clone()),
                            new_version: file.version.clone(),
                            path: file.path.clone(),
                        });
                    }
                    if path.is_some() || version.is_some() {
                        cs.changed_file(*file_id, path, version);
                    }
                }
            }
        }

        let mut added = Bucket::new();
        let mut removed = Bucket::new();
        for key in &self.troves {
            if them.is_none_or(|t| !t.troves.contains(key)) {
                cs.new_trove_version(&key.name, key.version.clone(), key.flavor.clone());
                added
                    .entry((key.name.clone(), key.flavor.clone()))
                    .or_default()
                    .push(key.version.clone());
            }
        }
        if let Some(them) = them {
            for key in &them.troves {
                if !self.troves.contains(key) {
                    cs.old_trove_version(&key.name, key.version.clone(), key.flavor.clone());
                    removed
                        .entry((key.name.clone(), key.flavor.clone()))
                        .or_default()
                        .push(key.version.clone());
                }
            }
        }

        let troves_needed = if absolute {
            added
                .into_iter()
                .flat_map(|((name, flavor), versions)| {
                    versions.into_iter().map(move |new_version| TroveNeeded {
                        name: name.clone(),
                        old_version: None,
                        new_version,
                        flavor: flavor.clone(),
                    })
                })
                .collect()
        } else {
            pair_trove_versions(added, &removed)?
        };

        Ok(TroveDiff {
            change_set: cs,
            files_needed,
            troves_needed,
        })
    }
}

/// Choose a removed version to diff each added member version against
///
/// Per added version: a removed version on the same branch, else one that
/// is the added version's parent, else the only removed version. Anything
/// else is ambiguous.
fn pair_trove_versions(added: Bucket, removed: &Bucket) -> Result<Vec<TroveNeeded>> {
    let mut needed = Vec::new();
    for ((name, flavor), versions) in added {
        let candidates = removed
            .get(&(name.clone(), flavor.clone()))
            .map(|v| v.as_slice())
            .unwrap_or_default();

        for new_version in versions {
            let old_version = if candidates.is_empty() {
                None
            } else {
                let branch = new_version.branch();
                let parent = new_version.parent();
                let chosen = candidates
                    .iter()
                    .find(|old| old.branch() == branch)
                    .or_else(|| {
                        parent
                            .as_ref()
                            .and_then(|p| candidates.iter().find(|old| *old == p))
                    });
                match chosen {
                    Some(old) => Some(old.clone()),
                    // the single remaining candidate may sit on an unrelated branch
                    None if candidates.len() == 1 => Some(candidates[0].clone()),
                    None => {
                        return Err(Error::AmbiguousMerge {
                            name,
                            flavor: flavor.to_string(),
                            version: new_version.to_string(),
                            candidates: candidates.len(),
                        });
                    }
                }
            };
            needed.push(TroveNeeded {
                name: name.clone(),
                old_version,
                new_version,
                flavor: flavor.clone(),
            });
        }
    }
    Ok(needed)
}
