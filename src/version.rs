// src/version.rs

//! Versions, branches and labels
//!
//! A version reads `/label/revision`, and a version on a branch sprouted
//! from another version adds further pairs:
//! `/conary.example.com@rpl:devel/1.0-1-1/conary.example.com@rpl:shadow/1.0-1-1.1`.
//! The frozen form prefixes each revision with its commit timestamp,
//! `1700000000.250:1.0-1-1`.
//!
//! Versions are identified by their string form: equality and hashing
//! ignore timestamps, which only order versions along a branch.

use crate::error::{Error, Result};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Host name reserved for staging-only labels
pub const LOCAL_HOST: &str = "local";

/// `host@namespace:tag`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    host: String,
    namespace: String,
    tag: String,
}

impl Label {
    pub fn new(host: &str, namespace: &str, tag: &str) -> Result<Self> {
        let label = Self {
            host: host.to_string(),
            namespace: namespace.to_string(),
            tag: tag.to_string(),
        };
        for part in [&label.host, &label.namespace, &label.tag] {
            if part.is_empty()
                || part
                    .chars()
                    .any(|c| c.is_whitespace() || matches!(c, '/' | '@' | ':' | '|'))
            {
                return Err(Error::InvalidVersion(label.to_string()));
            }
        }
        Ok(label)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_local(&self) -> bool {
        self.host == LOCAL_HOST
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.host, self.namespace, self.tag)
    }
}

impl FromStr for Label {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, rest) = s
            .split_once('@')
            .ok_or_else(|| Error::InvalidVersion(s.to_string()))?;
        let (namespace, tag) = rest
            .split_once(':')
            .ok_or_else(|| Error::InvalidVersion(s.to_string()))?;
        Label::new(host, namespace, tag)
    }
}

/// Milliseconds since the epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(chrono::Utc::now().timestamp_millis().max(0) as u64)
    }

    fn freeze(&self) -> String {
        format!("{}.{:03}", self.0 / 1000, self.0 % 1000)
    }

    fn thaw(s: &str) -> Option<Self> {
        let (secs, frac) = s.split_once('.').unwrap_or((s, "0"));
        if secs.is_empty() || frac.is_empty() || frac.len() > 3 {
            return None;
        }
        let secs: u64 = secs.parse().ok()?;
        let mut millis: u64 = frac.parse().ok()?;
        for _ in frac.len()..3 {
            millis *= 10;
        }
        secs.checked_mul(1000)?.checked_add(millis).map(Timestamp)
    }
}

/// One revision of a version: an opaque revision string plus its timestamp
#[derive(Debug, Clone)]
pub struct Revision {
    value: String,
    timestamp: Timestamp,
}

impl Revision {
    pub fn new(value: &str) -> Result<Self> {
        if value.is_empty()
            || value
                .chars()
                .any(|c| c.is_whitespace() || matches!(c, '/' | ':' | '|' | '@'))
        {
            return Err(Error::InvalidVersion(value.to_string()));
        }
        Ok(Self {
            value: value.to_string(),
            timestamp: Timestamp::default(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn parse(segment: &str) -> Result<Self> {
        match segment.split_once(':') {
            Some((stamp, value)) => {
                let timestamp = Timestamp::thaw(stamp)
                    .ok_or_else(|| Error::InvalidVersion(segment.to_string()))?;
                let mut rev = Revision::new(value)?;
                rev.timestamp = timestamp;
                Ok(rev)
            }
            None => Revision::new(segment),
        }
    }
}

impl PartialEq for Revision {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Revision {}

impl Hash for Revision {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

/// A line of development: labels interleaved with the revisions the
/// deeper labels branched from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Branch {
    labels: Vec<Label>,
    // always labels.len() - 1 entries
    branch_points: Vec<Revision>,
}

impl Branch {
    /// A top-level branch on a label
    pub fn new(label: Label) -> Self {
        Self {
            labels: vec![label],
            branch_points: Vec::new(),
        }
    }

    pub fn label(&self) -> &Label {
        // a branch is never built without a label
        &self.labels[self.labels.len() - 1]
    }

    pub fn has_parent(&self) -> bool {
        !self.branch_points.is_empty()
    }

    /// Version this branch sprouted from, if any
    pub fn parent_version(&self) -> Option<Version> {
        let revision = self.branch_points.last()?.clone();
        let depth = self.labels.len() - 1;
        Some(Version {
            branch: Branch {
                labels: self.labels[..depth].to_vec(),
                branch_points: self.branch_points[..depth - 1].to_vec(),
            },
            revision,
        })
    }

    /// Create a version on this branch
    pub fn create_version(&self, revision: Revision) -> Version {
        Version {
            branch: self.clone(),
            revision,
        }
    }

    fn write(&self, f: &mut fmt::Formatter<'_>, frozen: bool) -> fmt::Result {
        for (i, label) in self.labels.iter().enumerate() {
            write!(f, "/{}", label)?;
            if let Some(rev) = self.branch_points.get(i) {
                write_revision(f, rev, frozen)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write(f, false)
    }
}

fn write_revision(f: &mut fmt::Formatter<'_>, rev: &Revision, frozen: bool) -> fmt::Result {
    if frozen {
        write!(f, "/{}:{}", rev.timestamp.freeze(), rev.value)
    } else {
        write!(f, "/{}", rev.value)
    }
}

/// A specific revision on a branch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    branch: Branch,
    revision: Revision,
}

impl Version {
    pub fn branch(&self) -> Branch {
        self.branch.clone()
    }

    pub fn label(&self) -> &Label {
        self.branch.label()
    }

    pub fn trailing_revision(&self) -> &Revision {
        &self.revision
    }

    pub fn host(&self) -> &str {
        self.label().host()
    }

    pub fn is_on_local_host(&self) -> bool {
        self.label().is_local()
    }

    pub fn has_parent(&self) -> bool {
        self.branch.has_parent()
    }

    /// The version this version's branch was created from
    pub fn parent(&self) -> Option<Version> {
        self.branch.parent_version()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.revision.timestamp
    }

    /// Newer on the same branch, by commit timestamp
    pub fn newer_than(&self, other: &Version) -> bool {
        self.branch == other.branch && self.revision.timestamp > other.revision.timestamp
    }

    /// Stamp every revision in the version with `timestamp`
    pub fn reset_timestamps(&mut self, timestamp: Timestamp) {
        for rev in self.branch.branch_points.iter_mut() {
            rev.timestamp = timestamp;
        }
        self.revision.timestamp = timestamp;
    }

    /// Canonical string without timestamps
    pub fn as_string(&self) -> String {
        self.to_string()
    }

    /// String form carrying timestamps; `thaw` restores it exactly
    pub fn freeze(&self) -> String {
        struct Frozen<'a>(&'a Version);
        impl fmt::Display for Frozen<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.branch.write(f, true)?;
                write_revision(f, &self.0.revision, true)
            }
        }
        Frozen(self).to_string()
    }

    /// Parse either the plain or the frozen form
    pub fn thaw(s: &str) -> Result<Self> {
        s.parse()
    }

    /// Timestamps are compared too, unlike `==`
    pub fn identical(&self, other: &Version) -> bool {
        self == other && self.freeze() == other.freeze()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.branch.write(f, false)?;
        write_revision(f, &self.revision, false)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion(s.to_string());
        let body = s.strip_prefix('/').ok_or_else(invalid)?;
        let segments: Vec<&str> = body.split('/').collect();
        if segments.len() < 2 || segments.len() % 2 != 0 {
            return Err(invalid());
        }

        let mut labels = Vec::new();
        let mut revisions = Vec::new();
        for pair in segments.chunks(2) {
            labels.push(pair[0].parse::<Label>().map_err(|_| invalid())?);
            revisions.push(Revision::parse(pair[1]).map_err(|_| invalid())?);
        }

        let revision = revisions.pop().ok_or_else(invalid)?;
        Ok(Version {
            branch: Branch {
                labels,
                branch_points: revisions,
            },
            revision,
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deterministic order by string form, consistent with `==`
impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_string().cmp(&other.as_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVEL: &str = "/conary.example.com@rpl:devel/1.0-1-1";
    const SHADOW: &str = "/conary.example.com@rpl:devel/1.0-1-1/conary.example.com@rpl:shadow/1.0-1-1.1";

    #[test]
    fn test_parse_and_display() {
        let v: Version = DEVEL.parse().unwrap();
        assert_eq!(v.as_string(), DEVEL);
        assert_eq!(v.host(), "conary.example.com");
        assert_eq!(v.label().tag(), "devel");
        assert_eq!(v.trailing_revision().as_str(), "1.0-1-1");
        assert!(!v.has_parent());
        assert!(v.parent().is_none());
    }

    #[test]
    fn test_branch_and_parent() {
        let v: Version = SHADOW.parse().unwrap();
        assert!(v.has_parent());
        assert_eq!(
            v.branch().to_string(),
            "/conary.example.com@rpl:devel/1.0-1-1/conary.example.com@rpl:shadow"
        );
        let parent = v.parent().unwrap();
        assert_eq!(parent.as_string(), DEVEL);
    }

    #[test]
    fn test_freeze_thaw_keeps_timestamps() {
        let v = Version::thaw("/a.example.com@ns:tag/1700000000.250:1.0-1-1").unwrap();
        assert_eq!(v.timestamp(), Timestamp(1_700_000_000_250));
        assert_eq!(v.freeze(), "/a.example.com@ns:tag/1700000000.250:1.0-1-1");
        let back = Version::thaw(&v.freeze()).unwrap();
        assert!(back.identical(&v));
    }

    #[test]
    fn test_equality_ignores_timestamps() {
        let mut a: Version = DEVEL.parse().unwrap();
        let b: Version = DEVEL.parse().unwrap();
        a.reset_timestamps(Timestamp(42));
        assert_eq!(a, b);
        assert!(!a.identical(&b));
        assert!(a.newer_than(&b));
    }

    #[test]
    fn test_local_host() {
        let v: Version = "/local@local:COOK/1.0-1-1".parse().unwrap();
        assert!(v.is_on_local_host());
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "conary.example.com@rpl:devel/1.0",
            "/conary.example.com@rpl:devel",
            "/conary.example.com/1.0",
            "/a@b:c/1.0/d@e:f",
            "/a@b:c/x.y:1.0",
        ] {
            assert!(bad.parse::<Version>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_thaw_rejects_overflowing_timestamp() {
        let err = Version::thaw("/a.example.com@ns:tag/18446744073709552.000:1.0-1-1").unwrap_err();
        assert!(matches!(err, Error::InvalidVersion(_)));
        assert!(Version::thaw("/a.example.com@ns:tag/18446744073709551.615:1.0-1-1").is_ok());
    }
}
