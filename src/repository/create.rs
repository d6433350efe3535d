// src/repository/create.rs

//! Building changesets from the repository's troves
//!
//! The diff engine never recurses into member troves; this module drives
//! it over a worklist. Each diff's member troves go back on the list, each
//! needed file is resolved to its contents, and jobs touching versions on
//! hosts this repository does not serve are handed back to the caller.

use super::Repository;
use crate::cas::ContentStore;
use crate::changeset::{ChangeSet, FileContents, FileInfo};
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::{FileId, Sha1Digest};
use crate::trove::FileNeeded;
use crate::version::Version;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// One requested trove change
///
/// `old` absent means the trove is new to the client; `new` absent means
/// the trove is being removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeSetJob {
    pub name: String,
    pub old: Option<(Version, Flavor)>,
    pub new: Option<(Version, Flavor)>,
    pub absolute: bool,
}

impl ChangeSetJob {
    /// Everything needed to install `name=version[flavor]` from scratch
    pub fn install(name: &str, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            old: None,
            new: Some((version, flavor)),
            absolute: true,
        }
    }

    pub fn update(name: &str, old: Version, new: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            old: Some((old, flavor.clone())),
            new: Some((new, flavor)),
            absolute: false,
        }
    }

    pub fn erase(name: &str, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            old: Some((version, flavor)),
            new: None,
            absolute: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreatedChangeSet {
    pub change_set: ChangeSet,
    /// Jobs involving troves served elsewhere
    pub external: Vec<ChangeSetJob>,
    /// Files whose versions are served elsewhere, with the owning trove
    pub external_files: Vec<(String, FileNeeded)>,
}

impl Repository {
    pub fn create_change_set(
        &self,
        jobs: &[ChangeSetJob],
        recurse: bool,
        with_contents: bool,
    ) -> Result<CreatedChangeSet> {
        let mut created = CreatedChangeSet::default();
        let mut queue: VecDeque<ChangeSetJob> = jobs.iter().cloned().collect();
        let mut seen = HashSet::new();
        // first non-config file seen with each digest
        let mut pointers: HashMap<Sha1Digest, FileId> = HashMap::new();

        while let Some(job) = queue.pop_front() {
            if !seen.insert((job.name.clone(), job.old.clone(), job.new.clone())) {
                continue;
            }

            let Some((new_version, new_flavor)) = &job.new else {
                let (old_version, old_flavor) = job.old.as_ref().ok_or_else(|| {
                    Error::ContractViolation(format!("job for {} has no versions", job.name))
                })?;
                if !self.config.serves(old_version.host()) {
                    created.external.push(job);
                    continue;
                }
                // removing a trove removes everything it includes
                let old = self.get_trove(&job.name, old_version, old_flavor)?;
                for member in old.iter_trove_list() {
                    queue.push_back(ChangeSetJob::erase(
                        &member.name,
                        member.version.clone(),
                        member.flavor.clone(),
                    ));
                }
                created.change_set.old_trove(old.key());
                continue;
            };

            let old_external = job
                .old
                .as_ref()
                .is_some_and(|(v, _)| !self.config.serves(v.host()));
            if !self.config.serves(new_version.host()) || old_external {
                created.external.push(job);
                continue;
            }

            let new = self.get_trove(&job.name, new_version, new_flavor)?;
            let old = match &job.old {
                Some((version, flavor)) => Some(self.get_trove(&job.name, version, flavor)?),
                None => None,
            };
            let diff = new.diff(old.as_ref(), job.absolute)?;

            if recurse {
                for needed in diff.troves_needed {
                    queue.push_back(ChangeSetJob {
                        name: needed.name,
                        old: needed.old_version.map(|v| (v, needed.flavor.clone())),
                        new: Some((needed.new_version, needed.flavor)),
                        absolute: job.absolute,
                    });
                }
            }
            created.change_set.new_trove(diff.change_set);

            for file in diff.files_needed {
                let external = !self.config.serves(file.new_version.host())
                    || file
                        .old_version
                        .as_ref()
                        .is_some_and(|v| !self.config.serves(v.host()));
                if external {
                    created.external_files.push((job.name.clone(), file));
                    continue;
                }
                self.add_needed_file(&mut created.change_set, &file, with_contents, &mut pointers)?;
            }
        }

        debug!(
            "Created changeset with {} troves, {} removals, {} external jobs",
            created.change_set.new_trove_count(),
            created.change_set.iter_old_troves().count(),
            created.external.len()
        );
        Ok(created)
    }

    fn add_needed_file(
        &self,
        cs: &mut ChangeSet,
        file: &FileNeeded,
        with_contents: bool,
        pointers: &mut HashMap<Sha1Digest, FileId>,
    ) -> Result<()> {
        let new = self.file_stream(&file.file_id, &file.new_version)?;
        let old = file
            .old_version
            .as_ref()
            .map(|version| self.file_stream(&file.file_id, version))
            .transpose()?;

        cs.add_file(
            file.file_id,
            FileInfo {
                version: file.new_version.clone(),
                sha1: new.sha1,
                config: new.config,
            },
        )?;
        if !with_contents {
            return Ok(());
        }

        // a file that just became config always carries its pristine contents
        let changed = match &old {
            None => true,
            Some(old) => old.sha1 != new.sha1 || (new.config && !old.config),
        };
        if !changed {
            return Ok(());
        }

        let contents = if new.config {
            FileContents::from_bytes(&self.store.get_config(&new.sha1)?, false)?
        } else if let Some(target) = pointers.get(&new.sha1) {
            FileContents::Pointer(*target)
        } else {
            pointers.insert(new.sha1, file.file_id);
            FileContents::from_bytes(&self.store.get(&new.sha1)?, true)?
        };
        cs.add_file_contents(file.file_id, contents);
        Ok(())
    }
}
