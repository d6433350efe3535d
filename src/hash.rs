// src/hash.rs

//! Fixed-width identifiers used throughout the repository
//!
//! Both content digests and file ids are 20-byte values rendered as
//! 40-character lowercase hex strings.

use crate::error::{Error, Result};
use sha1::{Digest, Sha1};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// Width in bytes of a digest or file id
pub const ID_LEN: usize = 20;

fn parse_hex_id(s: &str, what: &str) -> Result<[u8; ID_LEN]> {
    let mut out = [0u8; ID_LEN];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| Error::ParseError(format!("Invalid {} '{}': {}", what, s, e)))?;
    Ok(out)
}

/// SHA-1 digest of decompressed content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sha1Digest([u8; ID_LEN]);

impl Sha1Digest {
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Digest an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// Digest everything a reader produces
    pub fn of_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Sha1::new();
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(Self::from_hasher(hasher))
    }

    pub(crate) fn from_hasher(hasher: Sha1) -> Self {
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&hasher.finalize());
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Sha1Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex_id(s, "sha1").map(Self)
    }
}

/// Opaque identifier of a file within a trove
///
/// Ordering is byte order, which is also the order of the hex form; changed
/// file lists are normalized with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId([u8; ID_LEN]);

impl FileId {
    /// Reserved id of the foreign payload file in a capsule trove
    pub const CAPSULE: FileId = FileId([0xff; ID_LEN]);

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a file id from arbitrary identifying data
    pub fn derive(data: &[u8]) -> Self {
        Self(*Sha1Digest::of(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for FileId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex_id(s, "file id").map(Self)
    }
}
