// src/cas/datastore.rs

//! Filesystem content store
//!
//! A blob with digest `abcdef...` lives under `<top>/ab/cd/ef...`. The file
//! name carries a suffix for the storage form: none for full bytes, the
//! compression suffix (`.zst`, `.gz`) for compressed bytes. New files are written
//! to a temporary file in `<top>/.tmp` and renamed into place, so a reader
//! never sees a partial blob.

use super::ContentStore;
use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::hash::Sha1Digest;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const TMP_DIR: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct DataStore {
    top: PathBuf,
    compression: Compression,
}

impl DataStore {
    /// Open (creating if needed) a store rooted at `top`
    pub fn new(top: &Path, compression: Compression) -> Result<Self> {
        fs::create_dir_all(top.join(TMP_DIR))?;
        Ok(Self {
            top: top.to_path_buf(),
            compression,
        })
    }

    pub fn top(&self) -> &Path {
        &self.top
    }

    fn base_path(&self, digest: &Sha1Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.top.join(&hex[..2]).join(&hex[2..4]).join(&hex[4..])
    }

    fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
        let mut path = base.as_os_str().to_owned();
        path.push(suffix);
        PathBuf::from(path)
    }

    fn full_path(&self, digest: &Sha1Digest) -> PathBuf {
        self.base_path(digest)
    }

    fn compressed_path(&self, digest: &Sha1Digest, compression: Compression) -> PathBuf {
        Self::with_suffix(&self.base_path(digest), compression.suffix())
    }

    /// Stored compressed forms, any compression
    fn find_compressed(&self, digest: &Sha1Digest) -> Option<(PathBuf, Compression)> {
        [Compression::Zstd, Compression::Gzip]
            .into_iter()
            .map(|c| (self.compressed_path(digest, c), c))
            .find(|(path, _)| path.exists())
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = NamedTempFile::new_in(self.top.join(TMP_DIR))?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Digests of every stored blob
    pub fn stored_blobs(&self) -> Result<Vec<Sha1Digest>> {
        let mut out = Vec::new();
        for first in read_dir_sorted(&self.top)? {
            let Some(a) = hex_dir_name(&first) else {
                continue;
            };
            for second in read_dir_sorted(&first)? {
                let Some(b) = hex_dir_name(&second) else {
                    continue;
                };
                for entry in read_dir_sorted(&second)? {
                    let Some(name) = entry.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    let rest = name.split('.').next().unwrap_or_default();
                    if let Ok(digest) = format!("{}{}{}", a, b, rest).parse::<Sha1Digest>()
                        && !out.contains(&digest)
                    {
                        out.push(digest);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        entries.push(entry?.path());
    }
    entries.sort();
    Ok(entries)
}

fn hex_dir_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    (path.is_dir() && name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| name.to_string())
}

impl ContentStore for DataStore {
    fn put(&self, data: &[u8]) -> Result<Sha1Digest> {
        let digest = Sha1Digest::of(data);
        if self.has(&digest)? {
            debug!("Blob {} already stored", digest);
            return Ok(digest);
        }
        match self.compression {
            Compression::None => self.write_atomic(&self.full_path(&digest), data)?,
            compression => self.write_atomic(
                &self.compressed_path(&digest, compression),
                &compression.compress(data)?,
            )?,
        }
        debug!("Stored blob {} ({} bytes)", digest, data.len());
        Ok(digest)
    }

    fn put_config(&self, data: &[u8]) -> Result<Sha1Digest> {
        let digest = Sha1Digest::of(data);
        let path = self.full_path(&digest);
        if !path.exists() {
            self.write_atomic(&path, data)?;
            debug!("Stored config blob {} ({} bytes)", digest, data.len());
        }
        Ok(digest)
    }

    fn get(&self, digest: &Sha1Digest) -> Result<Vec<u8>> {
        let full = self.full_path(digest);
        if full.exists() {
            return Ok(fs::read(full)?);
        }
        if let Some((path, compression)) = self.find_compressed(digest) {
            return compression.decompress(&fs::read(path)?);
        }
        Err(Error::NotFound(format!("blob {}", digest)))
    }

    fn get_config(&self, digest: &Sha1Digest) -> Result<Vec<u8>> {
        let full = self.full_path(digest);
        if !full.exists() {
            return Err(Error::NotFound(format!("config blob {}", digest)));
        }
        Ok(fs::read(full)?)
    }

    fn has(&self, digest: &Sha1Digest) -> Result<bool> {
        Ok(self.full_path(digest).exists() || self.find_compressed(digest).is_some())
    }

    fn has_config(&self, digest: &Sha1Digest) -> Result<bool> {
        Ok(self.full_path(digest).exists())
    }

    fn remove(&self, digest: &Sha1Digest) -> Result<()> {
        let mut paths = vec![self.full_path(digest)];
        paths.extend(
            [Compression::Zstd, Compression::Gzip]
                .into_iter()
                .map(|c| self.compressed_path(digest, c)),
        );

        let mut removed = false;
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if !removed {
            return Err(Error::NotFound(format!("blob {}", digest)));
        }
        debug!("Removed blob {}", digest);
        Ok(())
    }
}
