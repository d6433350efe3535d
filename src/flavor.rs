// src/flavor.rs

//! Flavors: instruction-set and use-flag predicates describing how a trove
//! was built
//!
//! Human form is `ssl,!debug,~gtk is: x86 x86_64`. The frozen form used on
//! the wire has no whitespace and no `|`: `use:ssl,!debug,~gtk;is:x86,x86_64`.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// How strongly a use flag is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FlagSense {
    Required,
    Disallowed,
    Preferred,
    PreferNot,
}

impl FlagSense {
    fn prefix(&self) -> &'static str {
        match self {
            FlagSense::Required => "",
            FlagSense::Disallowed => "!",
            FlagSense::Preferred => "~",
            FlagSense::PreferNot => "~!",
        }
    }

    fn split(item: &str) -> (FlagSense, &str) {
        if let Some(rest) = item.strip_prefix("~!") {
            (FlagSense::PreferNot, rest)
        } else if let Some(rest) = item.strip_prefix('~') {
            (FlagSense::Preferred, rest)
        } else if let Some(rest) = item.strip_prefix('!') {
            (FlagSense::Disallowed, rest)
        } else {
            (FlagSense::Required, item)
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Flavor {
    arch: BTreeSet<String>,
    flags: BTreeMap<String, FlagSense>,
}

impl Flavor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.arch.is_empty() && self.flags.is_empty()
    }

    pub fn add_arch(&mut self, arch: &str) -> Result<()> {
        if !valid_name(arch) {
            return Err(Error::InvalidFlavor(arch.to_string()));
        }
        self.arch.insert(arch.to_string());
        Ok(())
    }

    pub fn add_flag(&mut self, flag: &str, sense: FlagSense) -> Result<()> {
        if !valid_name(flag) {
            return Err(Error::InvalidFlavor(flag.to_string()));
        }
        self.flags.insert(flag.to_string(), sense);
        Ok(())
    }

    pub fn arches(&self) -> impl Iterator<Item = &str> {
        self.arch.iter().map(|s| s.as_str())
    }

    pub fn flag(&self, flag: &str) -> Option<FlagSense> {
        self.flags.get(flag).copied()
    }

    /// Combine two flavors; flags present in both take `other`'s sense
    pub fn union(&self, other: &Flavor) -> Flavor {
        let mut merged = self.clone();
        merged.arch.extend(other.arch.iter().cloned());
        for (flag, sense) in &other.flags {
            merged.flags.insert(flag.clone(), *sense);
        }
        merged
    }

    pub fn freeze(&self) -> String {
        let mut parts = Vec::new();
        if !self.flags.is_empty() {
            parts.push(format!("use:{}", self.flag_list()));
        }
        if !self.arch.is_empty() {
            let arch: Vec<&str> = self.arches().collect();
            parts.push(format!("is:{}", arch.join(",")));
        }
        parts.join(";")
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        let mut flavor = Flavor::new();
        if frozen.is_empty() {
            return Ok(flavor);
        }
        for part in frozen.split(';') {
            let (kind, items) = part
                .split_once(':')
                .ok_or_else(|| Error::InvalidFlavor(frozen.to_string()))?;
            for item in items.split(',') {
                match kind {
                    "use" => {
                        let (sense, name) = FlagSense::split(item);
                        flavor.add_flag(name, sense)?;
                    }
                    "is" => flavor.add_arch(item)?,
                    _ => return Err(Error::InvalidFlavor(frozen.to_string())),
                }
            }
        }
        Ok(flavor)
    }

    fn flag_list(&self) -> String {
        self.flags
            .iter()
            .map(|(name, sense)| format!("{}{}", sense.prefix(), name))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.flags.is_empty() {
            parts.push(self.flag_list());
        }
        if !self.arch.is_empty() {
            let arch: Vec<&str> = self.arches().collect();
            parts.push(format!("is: {}", arch.join(" ")));
        }
        f.write_str(&parts.join(" "))
    }
}

impl FromStr for Flavor {
    type Err = Error;

    /// Parse the human form
    fn from_str(s: &str) -> Result<Self> {
        let mut flavor = Flavor::new();
        let s = s.trim();
        let (flags, arch) = match s.find("is:") {
            Some(idx) => (&s[..idx], Some(&s[idx + 3..])),
            None => (s, None),
        };

        for item in flags.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let (sense, name) = FlagSense::split(item);
            flavor
                .add_flag(name, sense)
                .map_err(|_| Error::InvalidFlavor(s.to_string()))?;
        }
        if let Some(arch) = arch {
            let mut any = false;
            for name in arch.split_whitespace() {
                flavor
                    .add_arch(name)
                    .map_err(|_| Error::InvalidFlavor(s.to_string()))?;
                any = true;
            }
            if !any {
                return Err(Error::InvalidFlavor(s.to_string()));
            }
        }
        Ok(flavor)
    }
}
