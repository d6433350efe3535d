// src/changeset/freeze.rs

//! Line-oriented text encoding of a trove changeset
//!
//! ```text
//! CS <name> <oldVersion> <newVersion>      (or ABS/NEW <name> <newVersion>)
//! REQUIRES <deps>
//! PROVIDES <deps>
//! FLAVOR <flavor>
//! INFO <trove info>
//! -<fileId>
//! +<fileId> <path> <version>
//! ~<fileId> <path|-> <version|->
//! p <name> <op><version>|<flavor> ...
//! ```
//!
//! Versions are written frozen. Optional lines appear only when they carry
//! something. Paths may contain spaces: a path is whatever sits between the
//! first and last space of its line.

use super::{ChangedFile, TroveChangeSet};
use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::FileId;
use crate::trove::{TroveInfo, split_id_path_version};
use crate::version::Version;

impl TroveChangeSet {
    pub fn freeze(&self) -> String {
        let mut out = String::new();

        if self.absolute {
            out.push_str(&format!("ABS {} {}\n", self.name, self.new_version.freeze()));
        } else if let Some(old) = &self.old_version {
            out.push_str(&format!(
                "CS {} {} {}\n",
                self.name,
                old.freeze(),
                self.new_version.freeze()
            ));
        } else {
            out.push_str(&format!("NEW {} {}\n", self.name, self.new_version.freeze()));
        }

        if !self.requires.is_empty() {
            out.push_str(&format!("REQUIRES {}\n", self.requires.freeze()));
        }
        if !self.provides.is_empty() {
            out.push_str(&format!("PROVIDES {}\n", self.provides.freeze()));
        }
        if !self.flavor.is_empty() {
            out.push_str(&format!("FLAVOR {}\n", self.flavor.freeze()));
        }
        if !self.info.is_default() {
            out.push_str(&format!("INFO {}\n", self.info.freeze()));
        }

        for file_id in &self.old_files {
            out.push_str(&format!("-{}\n", file_id));
        }
        for file in &self.new_files {
            out.push_str(&format!(
                "+{} {} {}\n",
                file.file_id,
                file.path,
                file.version.freeze()
            ));
        }
        for file in &self.changed_files {
            out.push_str(&format!(
                "~{} {} {}\n",
                file.file_id,
                file.path.as_deref().unwrap_or("-"),
                file.version
                    .as_ref()
                    .map(|v| v.freeze())
                    .unwrap_or_else(|| "-".to_string())
            ));
        }

        for (name, deltas) in &self.trove_changes {
            if deltas.is_empty() {
                continue;
            }
            out.push_str("p ");
            out.push_str(name);
            for delta in deltas {
                out.push_str(&format!(
                    " {}{}|{}",
                    delta.op.as_char(),
                    delta.version.freeze(),
                    delta.flavor.freeze()
                ));
            }
            out.push('\n');
        }

        out
    }

    /// Parse the output of `freeze`
    ///
    /// The changed file list comes back sorted by file id.
    pub fn thaw(text: &str) -> Result<Self> {
        let lines: Vec<&str> = text.lines().collect();
        Self::thaw_lines(&lines)
    }

    pub fn thaw_lines(lines: &[&str]) -> Result<Self> {
        let header = lines
            .first()
            .ok_or_else(|| Error::ParseError("empty trove changeset".to_string()))?;
        let mut cs = parse_header(header)?;

        let mut seen_requires = false;
        let mut seen_provides = false;
        let mut seen_flavor = false;
        let mut seen_info = false;

        for line in &lines[1..] {
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("REQUIRES ") {
                once(&mut seen_requires, "REQUIRES")?;
                cs.requires = DependencySet::thaw(rest)?;
            } else if let Some(rest) = line.strip_prefix("PROVIDES ") {
                once(&mut seen_provides, "PROVIDES")?;
                cs.provides = DependencySet::thaw(rest)?;
            } else if let Some(rest) = line.strip_prefix("FLAVOR ") {
                once(&mut seen_flavor, "FLAVOR")?;
                cs.flavor = Flavor::thaw(rest)?;
            } else if let Some(rest) = line.strip_prefix("INFO ") {
                once(&mut seen_info, "INFO")?;
                cs.info = TroveInfo::thaw(rest)?;
            } else if let Some(rest) = line.strip_prefix("p ") {
                parse_trove_line(&mut cs, rest)?;
            } else if let Some(rest) = line.strip_prefix('+') {
                let (file_id, path, version) = split_id_path_version(rest)?;
                if path == "-" || version == "-" {
                    return Err(Error::ParseError(format!("incomplete new file '{}'", line)));
                }
                cs.new_file(file_id.parse()?, path, Version::thaw(version)?);
            } else if let Some(rest) = line.strip_prefix('~') {
                let (file_id, path, version) = split_id_path_version(rest)?;
                let path = (path != "-").then(|| path.to_string());
                let version = match version {
                    "-" => None,
                    v => Some(Version::thaw(v)?),
                };
                cs.changed_file(file_id.parse()?, path, version);
            } else if let Some(rest) = line.strip_prefix('-') {
                cs.old_file(rest.parse::<FileId>()?);
            } else {
                return Err(Error::ParseError(format!(
                    "unknown changeset line '{}'",
                    line
                )));
            }
        }

        cs.changed_files.sort_by_key(|f: &ChangedFile| f.file_id);
        Ok(cs)
    }
}

fn once(seen: &mut bool, what: &str) -> Result<()> {
    if *seen {
        return Err(Error::ParseError(format!("duplicate {} line", what)));
    }
    *seen = true;
    Ok(())
}

fn parse_header(header: &str) -> Result<TroveChangeSet> {
    let bad = || Error::ParseError(format!("invalid changeset header '{}'", header));
    let fields: Vec<&str> = header.split(' ').collect();
    match fields.as_slice() {
        ["ABS", name, new] if !name.is_empty() => Ok(TroveChangeSet::new(
            name,
            Flavor::new(),
            None,
            Version::thaw(new)?,
            true,
        )),
        ["NEW", name, new] if !name.is_empty() => Ok(TroveChangeSet::new(
            name,
            Flavor::new(),
            None,
            Version::thaw(new)?,
            false,
        )),
        ["CS", name, old, new] if !name.is_empty() => Ok(TroveChangeSet::new(
            name,
            Flavor::new(),
            Some(Version::thaw(old)?),
            Version::thaw(new)?,
            false,
        )),
        _ => Err(bad()),
    }
}

fn parse_trove_line(cs: &mut TroveChangeSet, rest: &str) -> Result<()> {
    let bad = || Error::ParseError(format!("invalid trove line 'p {}'", rest));
    let mut fields = rest.split(' ');
    let name = fields.next().filter(|n| !n.is_empty()).ok_or_else(bad)?;
    let mut any = false;
    for item in fields {
        let (version, flavor) = item
            .get(1..)
            .and_then(|body| body.split_once('|'))
            .ok_or_else(bad)?;
        let version = Version::thaw(version)?;
        let flavor = Flavor::thaw(flavor)?;
        match item.chars().next() {
            Some('+') => cs.new_trove_version(name, version, flavor),
            Some('-') => cs.old_trove_version(name, version, flavor),
            _ => return Err(bad()),
        }
        any = true;
    }
    if !any {
        return Err(bad());
    }
    Ok(())
}
