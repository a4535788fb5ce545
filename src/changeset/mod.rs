// src/changeset/mod.rs

//! Changesets: the unit of transport, commit and rollback
//!
//! An in-memory [`ChangeSet`] holds trove changes, trove erasures, file
//! stream changes keyed by pathId, and file contents. It serialises to the
//! framed container described in [`container`].
//!
//! Contents entries come in four forms ([`FileContents`]). The writer turns
//! a second copy of identical contents into a pointer at the first one, so
//! an in-memory change set only needs to carry plain contents.

pub mod container;
mod invert;

pub use container::{ChangeSetReader, DumpIter, Entry, EntryType};
pub use invert::PreState;

use crate::error::{Error, Result};
use crate::files::{FileId, FileStream, PathId};
use crate::hash::Sha1Digest;
use crate::trove::{TroveChangeSet, TroveTuple};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Contents attached to a file change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContents {
    /// Raw bytes
    File(Vec<u8>),
    /// Unified diff against the pristine old contents (config files only)
    Diff(Vec<u8>),
    /// Same bytes as the contents of another pathId in this change set
    Ptr(PathId),
    /// Contents intentionally absent
    Placeholder,
}

/// A file stream change: full freeze or diff from `old_file_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub old_file_id: Option<FileId>,
    pub new_file_id: FileId,
    pub stream: Vec<u8>,
}

impl FileChange {
    /// Rebuild the new stream, given the old one for relative diffs
    pub fn new_stream(&self, old: Option<&FileStream>) -> Result<FileStream> {
        let stream = FileStream::apply_diff(old, &self.stream)?;
        if stream.file_id() != self.new_file_id {
            return Err(Error::Integrity(format!(
                "file stream does not hash to its fileId {}",
                self.new_file_id
            )));
        }
        Ok(stream)
    }

    pub fn is_full(&self) -> bool {
        self.stream.first() != Some(&0x01)
    }

    /// Diff contents need a known old file and a config new file
    pub fn may_carry_diff(&self) -> bool {
        if self.old_file_id.is_none() {
            return false;
        }
        if !self.is_full() {
            return true;
        }
        FileStream::thaw(&self.stream).is_ok_and(|s| s.is_config())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    troves: BTreeMap<TroveTuple, TroveChangeSet>,
    erasures: BTreeSet<TroveTuple>,
    files: BTreeMap<PathId, FileChange>,
    contents: BTreeMap<PathId, FileContents>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.troves.is_empty() && self.erasures.is_empty()
    }

    /// Absolute when no trove change references an old version
    pub fn is_absolute(&self) -> bool {
        self.troves.values().all(TroveChangeSet::is_absolute)
    }

    pub fn add_trove(&mut self, tcs: TroveChangeSet) -> Result<()> {
        let tuple = tcs.new_tuple();
        if self.troves.contains_key(&tuple) {
            return Err(Error::Integrity(format!("{} appears twice in the change set", tuple)));
        }
        self.troves.insert(tuple, tcs);
        Ok(())
    }

    pub fn add_erasure(&mut self, tuple: TroveTuple) {
        self.erasures.insert(tuple);
    }

    /// Record a file change; a second change for the same pathId must agree
    pub fn add_file(&mut self, path_id: PathId, change: FileChange) -> Result<()> {
        if let Some(existing) = self.files.get(&path_id) {
            if existing.new_file_id != change.new_file_id || existing.old_file_id != change.old_file_id {
                return Err(Error::Integrity(format!("pathId collision on {}", path_id)));
            }
            return Ok(());
        }
        self.files.insert(path_id, change);
        Ok(())
    }

    /// Convenience: record `new` as a diff from `old` (or a full freeze)
    pub fn add_file_stream(&mut self, path_id: PathId, old: Option<&FileStream>, new: &FileStream) -> Result<()> {
        let stream = match old {
            Some(old) => new.diff(old).unwrap_or_else(|| new.freeze()),
            None => new.freeze(),
        };
        self.add_file(
            path_id,
            FileChange {
                old_file_id: old.map(FileStream::file_id),
                new_file_id: new.file_id(),
                stream,
            },
        )
    }

    pub fn add_contents(&mut self, path_id: PathId, contents: FileContents) -> Result<()> {
        if let Some(existing) = self.contents.get(&path_id) {
            if *existing != contents {
                return Err(Error::Integrity(format!("conflicting contents for pathId {}", path_id)));
            }
            return Ok(());
        }
        self.contents.insert(path_id, contents);
        Ok(())
    }

    pub fn troves(&self) -> impl Iterator<Item = &TroveChangeSet> {
        self.troves.values()
    }

    pub fn trove(&self, tuple: &TroveTuple) -> Option<&TroveChangeSet> {
        self.troves.get(tuple)
    }

    pub fn trove_count(&self) -> usize {
        self.troves.len()
    }

    pub fn erasures(&self) -> impl Iterator<Item = &TroveTuple> {
        self.erasures.iter()
    }

    pub fn files(&self) -> impl Iterator<Item = (&PathId, &FileChange)> {
        self.files.iter()
    }

    pub fn file(&self, path_id: &PathId) -> Option<&FileChange> {
        self.files.get(path_id)
    }

    pub fn contents(&self, path_id: &PathId) -> Option<&FileContents> {
        self.contents.get(path_id)
    }

    /// Raw contents for `path_id`, following pointers
    pub fn resolve_contents(&self, path_id: &PathId) -> Option<&[u8]> {
        let mut current = *path_id;
        // pointers never chain far; the bound stops a malformed loop
        for _ in 0..=self.contents.len() {
            match self.contents.get(&current)? {
                FileContents::File(bytes) => return Some(bytes),
                FileContents::Ptr(target) => current = *target,
                FileContents::Diff(_) | FileContents::Placeholder => return None,
            }
        }
        None
    }

    /// Fold `other` into this change set
    pub fn merge(&mut self, other: ChangeSet) -> Result<()> {
        for tcs in other.troves.into_values() {
            self.add_trove(tcs)?;
        }
        self.erasures.extend(other.erasures);
        for (path_id, change) in other.files {
            self.add_file(path_id, change)?;
        }
        for (path_id, contents) in other.contents {
            self.add_contents(path_id, contents)?;
        }
        Ok(())
    }

    /// Lazy serialisation into container chunks
    pub fn dump_iter(&self) -> DumpIter<'_> {
        DumpIter::new(self)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.dump_iter().flatten().collect()
    }

    /// Write the container to `path` through a temporary file
    pub fn write_to(&self, path: &Path) -> Result<u64> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut written = 0u64;
        for chunk in self.dump_iter() {
            tmp.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        debug!("wrote change set {} ({} bytes)", path.display(), written);
        Ok(written)
    }

    pub fn read_from(path: &Path) -> Result<ChangeSet> {
        ChangeSetReader::open(path)?.into_change_set()
    }

    pub fn from_bytes(data: &[u8]) -> Result<ChangeSet> {
        ChangeSetReader::from_bytes(data.to_vec())?.into_change_set()
    }

    /// Check contents entries against their streams where both are full
    pub(crate) fn verify_contents(&self) -> Result<()> {
        for (path_id, contents) in &self.contents {
            let FileContents::File(bytes) = contents else {
                continue;
            };
            let Some(change) = self.files.get(path_id) else {
                continue;
            };
            if !change.is_full() {
                continue;
            }
            let stream = FileStream::thaw(&change.stream)?;
            if let Some(expected) = stream.contents_sha1() {
                let actual = Sha1Digest::of(bytes);
                if actual != expected {
                    return Err(Error::Integrity(format!(
                        "contents for pathId {} hash to {} but the stream says {}",
                        path_id, actual, expected
                    )));
                }
            }
        }
        Ok(())
    }
}
