// src/changeset/container.rs

//! Changeset container format
//!
//! ```text
//! "CSMG" 0x05
//! entry*          id:16 | type:u16 BE | size:u64 BE | payload
//! trailer         SHA-1 of every byte before it
//! ```
//!
//! Trove entries come first, ordered by tuple, then erasures. File entries
//! follow in pathId order, each stream entry directly followed by its
//! contents entry. A contents entry whose bytes were already written as
//! an earlier entry is written as a pointer to that entry instead.

use super::{ChangeSet, FileChange, FileContents};
use crate::error::{Error, Result};
use crate::files::{FileId, PathId};
use crate::hash::{HashAlgorithm, Hasher, Sha1Digest};
use crate::trove::{TroveChangeSet, TroveTuple};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

pub const MAGIC: &[u8; 4] = b"CSMG";
pub const FORMAT_VERSION: u8 = 0x05;
const HEADER_LEN: u64 = 5;
const TRAILER_LEN: u64 = 20;
const ENTRY_HEADER_LEN: u64 = 16 + 2 + 8;

const TROVE_CHANGE: u8 = 0;
const TROVE_ERASE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    TroveChangeSet,
    FileStream,
    FileContents,
    FileContentsDiff,
    FileContentsPtr,
    FileContentsPlaceholder,
}

impl EntryType {
    pub fn tag(&self) -> u16 {
        match self {
            EntryType::TroveChangeSet => 1,
            EntryType::FileStream => 2,
            EntryType::FileContents => 3,
            EntryType::FileContentsDiff => 4,
            EntryType::FileContentsPtr => 5,
            EntryType::FileContentsPlaceholder => 6,
        }
    }

    pub fn from_tag(tag: u16) -> Result<Self> {
        Ok(match tag {
            1 => EntryType::TroveChangeSet,
            2 => EntryType::FileStream,
            3 => EntryType::FileContents,
            4 => EntryType::FileContentsDiff,
            5 => EntryType::FileContentsPtr,
            6 => EntryType::FileContentsPlaceholder,
            other => return Err(Error::ParseError(format!("unknown change set entry type {}", other))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub id: [u8; 16],
    pub kind: EntryType,
    pub payload: Vec<u8>,
}

fn encode_entry(id: &[u8; 16], kind: EntryType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_HEADER_LEN as usize + payload.len());
    out.extend_from_slice(id);
    out.extend_from_slice(&kind.tag().to_be_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

enum Stage {
    Header,
    Troves,
    Erasures,
    Files,
    Trailer,
    Done,
}

/// Chunks of a serialised change set
///
/// Finite and not restartable; the last chunk is the SHA-1 trailer.
pub struct DumpIter<'a> {
    cs: &'a ChangeSet,
    stage: Stage,
    troves: std::collections::btree_map::Values<'a, TroveTuple, TroveChangeSet>,
    erasures: std::collections::btree_set::Iter<'a, TroveTuple>,
    paths: std::vec::IntoIter<PathId>,
    pending: Option<Vec<u8>>,
    seen: HashMap<Sha1Digest, PathId>,
    hasher: Option<Hasher>,
}

impl<'a> DumpIter<'a> {
    pub(super) fn new(cs: &'a ChangeSet) -> Self {
        let paths: BTreeSet<PathId> = cs.files.keys().chain(cs.contents.keys()).copied().collect();
        Self {
            cs,
            stage: Stage::Header,
            troves: cs.troves.values(),
            erasures: cs.erasures.iter(),
            paths: paths.into_iter().collect::<Vec<_>>().into_iter(),
            pending: None,
            seen: HashMap::new(),
            hasher: Some(Hasher::new(HashAlgorithm::Sha1)),
        }
    }

    fn contents_entry(&mut self, path_id: PathId, contents: &FileContents) -> Vec<u8> {
        match contents {
            FileContents::File(bytes) => {
                let digest = Sha1Digest::of(bytes);
                match self.seen.get(&digest) {
                    Some(target) => encode_entry(&path_id.0, EntryType::FileContentsPtr, &target.0),
                    None => {
                        self.seen.insert(digest, path_id);
                        encode_entry(&path_id.0, EntryType::FileContents, bytes)
                    }
                }
            }
            FileContents::Diff(diff) => encode_entry(&path_id.0, EntryType::FileContentsDiff, diff),
            FileContents::Ptr(target) => encode_entry(&path_id.0, EntryType::FileContentsPtr, &target.0),
            FileContents::Placeholder => encode_entry(&path_id.0, EntryType::FileContentsPlaceholder, &[]),
        }
    }

    fn produce(&mut self) -> Option<Vec<u8>> {
        if let Some(chunk) = self.pending.take() {
            return Some(chunk);
        }
        loop {
            match self.stage {
                Stage::Header => {
                    self.stage = Stage::Troves;
                    let mut header = MAGIC.to_vec();
                    header.push(FORMAT_VERSION);
                    return Some(header);
                }
                Stage::Troves => match self.troves.next() {
                    Some(tcs) => {
                        let mut payload = vec![TROVE_CHANGE];
                        payload.extend(tcs.freeze());
                        return Some(encode_entry(&tcs.new_tuple().entry_id(), EntryType::TroveChangeSet, &payload));
                    }
                    None => self.stage = Stage::Erasures,
                },
                Stage::Erasures => match self.erasures.next() {
                    Some(tuple) => {
                        let mut payload = vec![TROVE_ERASE];
                        payload.extend_from_slice(tuple.freeze().as_bytes());
                        return Some(encode_entry(&tuple.entry_id(), EntryType::TroveChangeSet, &payload));
                    }
                    None => self.stage = Stage::Files,
                },
                Stage::Files => {
                    let Some(path_id) = self.paths.next() else {
                        self.stage = Stage::Trailer;
                        continue;
                    };
                    let cs = self.cs;
                    let stream_chunk = cs.files.get(&path_id).map(|change| {
                        let mut payload = Vec::with_capacity(40 + change.stream.len());
                        payload.extend_from_slice(change.old_file_id.unwrap_or_default().as_bytes());
                        payload.extend_from_slice(change.new_file_id.as_bytes());
                        payload.extend_from_slice(&change.stream);
                        encode_entry(&path_id.0, EntryType::FileStream, &payload)
                    });
                    let contents_chunk = cs.contents.get(&path_id).map(|c| self.contents_entry(path_id, c));
                    match (stream_chunk, contents_chunk) {
                        (Some(stream), contents) => {
                            self.pending = contents;
                            return Some(stream);
                        }
                        (None, Some(contents)) => return Some(contents),
                        (None, None) => continue,
                    }
                }
                Stage::Trailer => {
                    self.stage = Stage::Done;
                    let hasher = self.hasher.take()?;
                    return Some(hasher.finalize());
                }
                Stage::Done => return None,
            }
        }
    }
}

impl Iterator for DumpIter<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let chunk = self.produce()?;
        // the trailer stage takes the hasher, so the trailer is never hashed
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&chunk);
        }
        Some(chunk)
    }
}

/// Reader over a serialised change set
///
/// Construction checks the magic, the version byte and the trailer, so
/// every entry handed out afterwards comes from an intact container.
pub struct ChangeSetReader<R> {
    reader: R,
    pos: u64,
    end: u64,
}

impl ChangeSetReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl ChangeSetReader<Cursor<Vec<u8>>> {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::new(Cursor::new(data))
    }
}

impl<R: Read + Seek> ChangeSetReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        if len < HEADER_LEN + TRAILER_LEN {
            return Err(Error::ParseError("change set is truncated".to_string()));
        }
        reader.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_LEN as usize];
        reader.read_exact(&mut header)?;
        if &header[..4] != MAGIC {
            return Err(Error::ParseError("not a change set (bad magic)".to_string()));
        }
        if header[4] != FORMAT_VERSION {
            return Err(Error::ParseError(format!("unsupported change set version {}", header[4])));
        }

        let end = len - TRAILER_LEN;
        reader.seek(SeekFrom::Start(0))?;
        let mut hasher = Hasher::new(HashAlgorithm::Sha1);
        let mut remaining = end;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            reader.read_exact(&mut buf[..want])?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
        }
        let mut trailer = [0u8; TRAILER_LEN as usize];
        reader.read_exact(&mut trailer)?;
        if hasher.finalize() != trailer {
            return Err(Error::Integrity("change set trailer does not match its contents".to_string()));
        }

        reader.seek(SeekFrom::Start(HEADER_LEN))?;
        Ok(Self {
            reader,
            pos: HEADER_LEN,
            end,
        })
    }

    fn read_entry(&mut self) -> Result<Entry> {
        if self.end - self.pos < ENTRY_HEADER_LEN {
            return Err(Error::ParseError("truncated change set entry header".to_string()));
        }
        let mut id = [0u8; 16];
        self.reader.read_exact(&mut id)?;
        let mut kind = [0u8; 2];
        self.reader.read_exact(&mut kind)?;
        let mut size = [0u8; 8];
        self.reader.read_exact(&mut size)?;
        self.pos += ENTRY_HEADER_LEN;

        let size = u64::from_be_bytes(size);
        if size > self.end - self.pos {
            return Err(Error::ParseError(format!("change set entry of {} bytes overruns the container", size)));
        }
        let mut payload = vec![0u8; size as usize];
        self.reader.read_exact(&mut payload)?;
        self.pos += size;
        Ok(Entry {
            id,
            kind: EntryType::from_tag(u16::from_be_bytes(kind))?,
            payload,
        })
    }

    /// Decode every entry into an in-memory change set
    pub fn into_change_set(self) -> Result<ChangeSet> {
        let mut cs = ChangeSet::new();
        for entry in self {
            let entry = entry?;
            let path_id = PathId(entry.id);
            match entry.kind {
                EntryType::TroveChangeSet => {
                    let (&kind, body) = entry
                        .payload
                        .split_first()
                        .ok_or_else(|| Error::ParseError("empty trove entry".to_string()))?;
                    if kind == TROVE_ERASE {
                        let text = std::str::from_utf8(body)
                            .map_err(|_| Error::ParseError("erasure is not UTF-8".to_string()))?;
                        cs.add_erasure(TroveTuple::thaw(text)?);
                    } else {
                        cs.add_trove(TroveChangeSet::thaw(body)?)?;
                    }
                }
                EntryType::FileStream => {
                    if entry.payload.len() < 40 {
                        return Err(Error::ParseError("short file stream entry".to_string()));
                    }
                    let old = FileId::from_slice(&entry.payload[..20])?;
                    let change = FileChange {
                        old_file_id: if old.is_zero() { None } else { Some(old) },
                        new_file_id: FileId::from_slice(&entry.payload[20..40])?,
                        stream: entry.payload[40..].to_vec(),
                    };
                    cs.add_file(path_id, change)?;
                }
                EntryType::FileContents => cs.add_contents(path_id, FileContents::File(entry.payload))?,
                EntryType::FileContentsDiff => {
                    if !cs.file(&path_id).is_some_and(FileChange::may_carry_diff) {
                        return Err(Error::Integrity(format!(
                            "diff contents for pathId {} without a config file change",
                            path_id
                        )));
                    }
                    cs.add_contents(path_id, FileContents::Diff(entry.payload))?;
                }
                EntryType::FileContentsPtr => {
                    let target = PathId::from_slice(&entry.payload)?;
                    if cs.contents(&target).is_none() {
                        return Err(Error::Integrity(format!(
                            "pointer {} refers to {} which has not been seen",
                            path_id, target
                        )));
                    }
                    cs.add_contents(path_id, FileContents::Ptr(target))?;
                }
                EntryType::FileContentsPlaceholder => cs.add_contents(path_id, FileContents::Placeholder)?,
            }
        }
        cs.verify_contents()?;
        Ok(cs)
    }
}

impl<R: Read + Seek> Iterator for ChangeSetReader<R> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let entry = self.read_entry();
        if entry.is_err() {
            self.pos = self.end;
        }
        Some(entry)
    }
}
