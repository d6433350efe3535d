// src/deps.rs

//! Dependency sets carried by troves as requires/provides
//!
//! The core never interprets a dependency; it only stores, compares,
//! unions and serializes them. Human form is one `class: name(flag flag)`
//! entry per line. Frozen form is `tag#name:flag:flag|tag#name`, with
//! reserved characters escaped by a backslash.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyClass {
    Abi,
    Soname,
    File,
    Trove,
    Python,
    Perl,
    Ruby,
    Java,
    Rpm,
}

impl DependencyClass {
    const ALL: [DependencyClass; 9] = [
        DependencyClass::Abi,
        DependencyClass::Soname,
        DependencyClass::File,
        DependencyClass::Trove,
        DependencyClass::Python,
        DependencyClass::Perl,
        DependencyClass::Ruby,
        DependencyClass::Java,
        DependencyClass::Rpm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyClass::Abi => "abi",
            DependencyClass::Soname => "soname",
            DependencyClass::File => "file",
            DependencyClass::Trove => "trove",
            DependencyClass::Python => "python",
            DependencyClass::Perl => "perl",
            DependencyClass::Ruby => "ruby",
            DependencyClass::Java => "java",
            DependencyClass::Rpm => "rpm",
        }
    }

    /// Numeric tag used in the frozen form
    pub fn tag(&self) -> u8 {
        match self {
            DependencyClass::Abi => 0,
            DependencyClass::Soname => 4,
            DependencyClass::File => 5,
            DependencyClass::Trove => 6,
            DependencyClass::Python => 9,
            DependencyClass::Perl => 10,
            DependencyClass::Ruby => 11,
            DependencyClass::Java => 12,
            DependencyClass::Rpm => 16,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag() == tag)
    }
}

impl FromStr for DependencyClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::InvalidDependency(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
    pub name: String,
    pub flags: BTreeSet<String>,
}

impl Dependency {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            flags: BTreeSet::new(),
        }
    }

    pub fn with_flags<'a>(name: &str, flags: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            name: name.to_string(),
            flags: flags.into_iter().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DependencySet {
    members: BTreeMap<DependencyClass, BTreeSet<Dependency>>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.values().all(|deps| deps.is_empty())
    }

    pub fn add(&mut self, class: DependencyClass, dep: Dependency) {
        self.members.entry(class).or_default().insert(dep);
    }

    pub fn contains(&self, class: DependencyClass, dep: &Dependency) -> bool {
        self.members.get(&class).is_some_and(|deps| deps.contains(dep))
    }

    pub fn iter(&self) -> impl Iterator<Item = (DependencyClass, &Dependency)> {
        self.members
            .iter()
            .flat_map(|(class, deps)| deps.iter().map(move |d| (*class, d)))
    }

    pub fn len(&self) -> usize {
        self.members.values().map(|deps| deps.len()).sum()
    }

    pub fn union(&self, other: &DependencySet) -> DependencySet {
        let mut merged = self.clone();
        for (class, dep) in other.iter() {
            merged.add(class, dep.clone());
        }
        merged
    }

    pub fn freeze(&self) -> String {
        self.iter()
            .map(|(class, dep)| {
                let mut item = format!("{}#{}", class.tag(), escape(&dep.name));
                for flag in &dep.flags {
                    item.push(':');
                    item.push_str(&escape(flag));
                }
                item
            })
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        let mut set = DependencySet::new();
        if frozen.is_empty() {
            return Ok(set);
        }
        let bad = || Error::InvalidDependency(frozen.to_string());
        for item in split_escaped(frozen, '|') {
            let (tag, rest) = item.split_once('#').ok_or_else(bad)?;
            let class = tag
                .parse::<u8>()
                .ok()
                .and_then(DependencyClass::from_tag)
                .ok_or_else(bad)?;
            let mut fields = split_escaped(rest, ':').into_iter().map(|f| unescape(&f));
            let name = fields.next().filter(|n| !n.is_empty()).ok_or_else(bad)?;
            let mut dep = Dependency::new(&name);
            dep.flags.extend(fields);
            set.add(class, dep);
        }
        Ok(set)
    }
}

const RESERVED: [char; 5] = ['\\', '|', ':', '#', ' '];

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if RESERVED.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split on `sep` unless it is escaped; escapes are kept for `unescape`
fn split_escaped(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

impl fmt::Display for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .iter()
            .map(|(class, dep)| {
                if dep.flags.is_empty() {
                    format!("{}: {}", class.as_str(), dep.name)
                } else {
                    let flags: Vec<&str> = dep.flags.iter().map(|s| s.as_str()).collect();
                    format!("{}: {}({})", class.as_str(), dep.name, flags.join(" "))
                }
            })
            .collect();
        f.write_str(&lines.join("\n"))
    }
}

impl FromStr for DependencySet {
    type Err = Error;

    /// Parse the human form, one dependency per line
    fn from_str(s: &str) -> Result<Self> {
        let mut set = DependencySet::new();
        for line in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (class, rest) = line
                .split_once(':')
                .ok_or_else(|| Error::InvalidDependency(line.to_string()))?;
            let class: DependencyClass = class.trim().parse()?;
            let rest = rest.trim();
            let dep = match rest.strip_suffix(')').and_then(|r| r.rsplit_once('(')) {
                Some((name, flags)) => Dependency::with_flags(name, flags.split_whitespace()),
                None => Dependency::new(rest),
            };
            if dep.name.is_empty() {
                return Err(Error::InvalidDependency(line.to_string()));
            }
            set.add(class, dep);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DependencySet {
        "soname: ELF64/libc.so.6(GLIBC_2.2 x86_64)\ntrove: bash:runtime\nfile: /usr/bin/my tool"
            .parse()
            .unwrap()
    }

    #[test]
    fn test_human_parse() {
        let set = sample();
        assert_eq!(set.len(), 3);
        assert!(set.contains(DependencyClass::Trove, &Dependency::new("bash:runtime")));
        assert!(set.contains(
            DependencyClass::Soname,
            &Dependency::with_flags("ELF64/libc.so.6", ["GLIBC_2.2", "x86_64"])
        ));
    }

    #[test]
    fn test_freeze_escapes_reserved() {
        let set = sample();
        let frozen = set.freeze();
        assert!(!frozen.contains(' ') || frozen.contains("\\ "));
        assert!(frozen.contains("6#bash\\:runtime"));
        assert_eq!(DependencySet::thaw(&frozen).unwrap(), set);
    }

    #[test]
    fn test_union_and_empty() {
        let a: DependencySet = "trove: a".parse().unwrap();
        let b: DependencySet = "trove: b\ntrove: a".parse().unwrap();
        assert_eq!(a.union(&b).len(), 2);
        assert!(DependencySet::new().is_empty());
        assert!(DependencySet::thaw("").unwrap().is_empty());
    }

    #[test]
    fn test_thaw_rejects_unknown_class() {
        assert!(DependencySet::thaw("99#foo").is_err());
        assert!(DependencySet::thaw("nohash").is_err());
    }
}
