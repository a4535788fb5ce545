// src/filesystem/blob.rs

//! Content-addressed blob store
//!
//! Blobs are keyed by the SHA-1 of their bytes and laid out like git's
//! loose objects:
//!
//! ```text
//! <root>/ab/cdef0123...   (first two hex digits, then the rest)
//! ```
//!
//! Writes go to a temporary file in the destination directory which is
//! then renamed over the final name, so a reader never sees a partial
//! blob. Reference counts live in the owning database, not here.

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, Hasher, Sha1Digest};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            fs::create_dir_all(&root)?;
            debug!("Created blob store at {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, digest: &Sha1Digest) -> PathBuf {
        let hex = digest.to_hex();
        let (prefix, rest) = hex.split_at(2);
        self.root.join(prefix).join(rest)
    }

    pub fn exists(&self, digest: &Sha1Digest) -> bool {
        self.path_for(digest).exists()
    }

    /// Store `content`, returning its SHA-1; existing blobs are left alone
    pub fn store(&self, content: &[u8]) -> Result<Sha1Digest> {
        self.store_reader(content)
    }

    /// Stream `reader` into the store
    pub fn store_reader<R: Read>(&self, mut reader: R) -> Result<Sha1Digest> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        let mut buf = [0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            size += n as u64;
        }
        let digest = Sha1Digest::from_slice(&hasher.finalize())?;
        let path = self.path_for(&digest);
        if path.exists() {
            debug!("Blob {} already stored", digest);
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        debug!("Stored blob {} ({} bytes)", digest, size);
        Ok(digest)
    }

    /// Read a blob back, verifying its hash
    pub fn retrieve(&self, digest: &Sha1Digest) -> Result<Vec<u8>> {
        let content = match fs::read(self.path_for(digest)) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("blob {}", digest)));
            }
            Err(e) => return Err(e.into()),
        };
        let actual = Sha1Digest::of(&content);
        if actual != *digest {
            return Err(Error::ChecksumMismatch {
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(content)
    }

    pub fn open(&self, digest: &Sha1Digest) -> Result<fs::File> {
        fs::File::open(self.path_for(digest)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(format!("blob {}", digest)),
            _ => e.into(),
        })
    }

    /// Delete a blob; returns whether it existed
    pub fn remove(&self, digest: &Sha1Digest) -> Result<bool> {
        match fs::remove_file(self.path_for(digest)) {
            Ok(()) => {
                debug!("Removed blob {}", digest);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Every blob digest present on disk
    ///
    /// Staging files in the root and names that are not a digest are
    /// skipped.
    pub fn digests(&self) -> Result<Vec<Sha1Digest>> {
        let mut digests = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            if let (Some(prefix), Some(rest)) = (
                entry.path().parent().and_then(|p| p.file_name()),
                entry.path().file_name(),
            ) {
                let hex = format!("{}{}", prefix.to_string_lossy(), rest.to_string_lossy());
                if hex.len() == 40
                    && let Ok(bytes) = hex::decode(&hex)
                {
                    digests.push(Sha1Digest::from_slice(&bytes)?);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Adopt a file already on disk, hard-linking when possible
    pub fn adopt(&self, existing: &Path) -> Result<Sha1Digest> {
        let digest = crate::hash::sha1_reader(fs::File::open(existing)?)?;
        let path = self.path_for(&digest);
        if path.exists() {
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::hard_link(existing, &path) {
            Ok(()) => Ok(digest),
            Err(e) => {
                debug!("Hard link into blob store failed ({}), copying {}", e, existing.display());
                self.store_reader(fs::File::open(existing)?)
            }
        }
    }
}
