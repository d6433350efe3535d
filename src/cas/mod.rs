// src/cas/mod.rs

//! Content-addressed blob storage
//!
//! Blobs are keyed by the SHA-1 of their decompressed bytes, so equal
//! contents share one blob. Sharing between files of a changeset travels as
//! `ptr` contents and collapses to the target's digest on commit. Config file
//! contents are never compressed: they are written and read as independent
//! full bytes.

mod datastore;

pub use datastore::DataStore;

use crate::error::Result;
use crate::hash::Sha1Digest;

pub trait ContentStore {
    /// Store bytes and return their digest; storing known content is a no-op
    fn put(&self, data: &[u8]) -> Result<Sha1Digest>;

    /// Store config contents as uncompressed full bytes
    fn put_config(&self, data: &[u8]) -> Result<Sha1Digest>;

    /// Decompressed bytes; `NotFound` when absent
    fn get(&self, digest: &Sha1Digest) -> Result<Vec<u8>>;

    /// Full bytes written by `put_config`
    fn get_config(&self, digest: &Sha1Digest) -> Result<Vec<u8>>;

    fn has(&self, digest: &Sha1Digest) -> Result<bool>;

    fn has_config(&self, digest: &Sha1Digest) -> Result<bool>;

    /// Drop every stored form of `digest`
    fn remove(&self, digest: &Sha1Digest) -> Result<()>;
}
