// src/changeset/invert.rs

//! Reverse change sets for rollback

use super::{ChangeSet, FileContents};
use crate::error::{Error, Result};
use crate::files::{FileId, FileKind, FileStream, PathId};
use crate::trove::{Trove, TroveTuple};

/// Read access to the state a change set is about to replace
pub trait PreState {
    fn trove(&self, tuple: &TroveTuple) -> Result<Option<Trove>>;

    fn file_stream(&self, path_id: &PathId, file_id: &FileId) -> Result<Option<FileStream>>;

    /// Contents of a regular file before the change is applied
    fn file_contents(&self, path_id: &PathId, stream: &FileStream) -> Result<Option<Vec<u8>>>;
}

impl ChangeSet {
    /// Change set that takes the post-state of `self` back to `pre`
    ///
    /// Installs become erasures, erasures become absolute installs, and
    /// updates become relative changes from the new version back to the
    /// old one. Every restored file carries its full stream and contents.
    pub fn invert(&self, pre: &dyn PreState) -> Result<ChangeSet> {
        let mut rev = ChangeSet::new();

        for tcs in self.troves() {
            let Some(old_tuple) = tcs.old_tuple() else {
                rev.add_erasure(tcs.new_tuple());
                continue;
            };
            let old = pre
                .trove(&old_tuple)?
                .ok_or_else(|| Error::TroveMissing(old_tuple.to_string()))?;
            let new = tcs.apply(Some(&old))?;
            let back = old.diff(Some(&new));
            for (path_id, entry) in back.touched_files() {
                let new_file_id = new.file(path_id).map(|e| e.file_id);
                add_restore(&mut rev, pre, path_id, &entry.file_id, new_file_id)?;
            }
            rev.add_trove(back)?;
        }

        for tuple in self.erasures() {
            let old = pre
                .trove(tuple)?
                .ok_or_else(|| Error::TroveMissing(tuple.to_string()))?;
            for (path_id, entry) in old.files() {
                add_restore(&mut rev, pre, path_id, &entry.file_id, None)?;
            }
            rev.add_trove(old.diff(None))?;
        }

        Ok(rev)
    }
}

fn add_restore(
    rev: &mut ChangeSet,
    pre: &dyn PreState,
    path_id: &PathId,
    file_id: &FileId,
    replaces: Option<FileId>,
) -> Result<()> {
    let stream = pre
        .file_stream(path_id, file_id)?
        .ok_or_else(|| Error::TroveMissing(format!("file stream {} for pathId {}", file_id, path_id)))?;
    rev.add_file(
        *path_id,
        super::FileChange {
            old_file_id: replaces,
            new_file_id: stream.file_id(),
            stream: stream.freeze(),
        },
    )?;
    if stream.kind() == FileKind::Regular {
        let contents = match pre.file_contents(path_id, &stream)? {
            Some(bytes) => FileContents::File(bytes),
            None => FileContents::Placeholder,
        };
        rev.add_contents(*path_id, contents)?;
    }
    Ok(())
}
