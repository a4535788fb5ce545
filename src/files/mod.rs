// src/files/mod.rs

//! File objects
//!
//! Every installable file is a [`FileStream`]: a one-byte [`FileKind`]
//! followed by a stream set carrying inode, contents, flags, tags and the
//! other per-file fields. The SHA-1 of the frozen stream (without mtime) is
//! the file's [`FileId`]. A [`PathId`] names the file's role inside a trove
//! so two versions of a trove can be compared entry by entry.

mod ownership;

use crate::dependencies::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::Sha1Digest;
use crate::streams::{FieldDef, MergeResult, Schema, SkipSet, StreamKind, StreamSet, StreamValue};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

pub use ownership::{group_name, is_root, user_name};

pub const FILE_CONTENTS: u8 = 1;
pub const FILE_DEVICE: u8 = 2;
pub const FILE_FLAGS: u8 = 3;
pub const FILE_FLAVOR: u8 = 4;
pub const FILE_INODE: u8 = 5;
pub const FILE_PROVIDES: u8 = 6;
pub const FILE_REQUIRES: u8 = 7;
pub const FILE_TAGS: u8 = 8;
pub const FILE_TARGET: u8 = 9;
pub const FILE_LINKGROUP: u8 = 10;

pub const INODE_PERMS: u8 = 1;
pub const INODE_MTIME: u8 = 2;
pub const INODE_OWNER: u8 = 3;
pub const INODE_GROUP: u8 = 4;

pub const CONTENTS_SIZE: u8 = 1;
pub const CONTENTS_SHA1: u8 = 2;

pub const DEVICE_MAJOR: u8 = 1;
pub const DEVICE_MINOR: u8 = 2;

/// Marker byte that starts a same-kind file diff
const DIFF_MARKER: u8 = 0x01;

static INODE_SCHEMA: Schema = Schema {
    name: "inode",
    fields: &[
        FieldDef { tag: INODE_PERMS, name: "perms", kind: StreamKind::U16 },
        FieldDef { tag: INODE_MTIME, name: "mtime", kind: StreamKind::Mtime },
        FieldDef { tag: INODE_OWNER, name: "owner", kind: StreamKind::Bytes },
        FieldDef { tag: INODE_GROUP, name: "group", kind: StreamKind::Bytes },
    ],
};

static CONTENTS_SCHEMA: Schema = Schema {
    name: "contents",
    fields: &[
        FieldDef { tag: CONTENTS_SIZE, name: "size", kind: StreamKind::U64 },
        FieldDef { tag: CONTENTS_SHA1, name: "sha1", kind: StreamKind::Sha1 },
    ],
};

static DEVICE_SCHEMA: Schema = Schema {
    name: "device",
    fields: &[
        FieldDef { tag: DEVICE_MAJOR, name: "major", kind: StreamKind::U32 },
        FieldDef { tag: DEVICE_MINOR, name: "minor", kind: StreamKind::U32 },
    ],
};

pub static FILE_SCHEMA: Schema = Schema {
    name: "file",
    fields: &[
        FieldDef { tag: FILE_CONTENTS, name: "contents", kind: StreamKind::Set(&CONTENTS_SCHEMA) },
        FieldDef { tag: FILE_DEVICE, name: "device", kind: StreamKind::Set(&DEVICE_SCHEMA) },
        FieldDef { tag: FILE_FLAGS, name: "flags", kind: StreamKind::U32 },
        FieldDef { tag: FILE_FLAVOR, name: "flavor", kind: StreamKind::Bytes },
        FieldDef { tag: FILE_INODE, name: "inode", kind: StreamKind::Set(&INODE_SCHEMA) },
        FieldDef { tag: FILE_PROVIDES, name: "provides", kind: StreamKind::Bytes },
        FieldDef { tag: FILE_REQUIRES, name: "requires", kind: StreamKind::Bytes },
        FieldDef { tag: FILE_TAGS, name: "tags", kind: StreamKind::StrSet },
        FieldDef { tag: FILE_TARGET, name: "target", kind: StreamKind::Bytes },
        FieldDef { tag: FILE_LINKGROUP, name: "linkGroup", kind: StreamKind::Bytes },
    ],
};

/// Stable 16-byte identifier of a file's role inside a trove
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PathId(pub [u8; 16]);

impl PathId {
    /// Path id derived from the path a file was first packaged at
    pub fn for_path(path: &str) -> Self {
        let digest = Sha1Digest::of(path.as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest.0[..16]);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let id: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::ParseError(format!("pathId must be 16 bytes, got {}", bytes.len())))?;
        Ok(Self(id))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", self.to_hex())
    }
}

impl FromStr for PathId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::ParseError(format!("bad pathId '{}': {}", s, e)))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PathId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PathId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Content identity of a file stream
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub Sha1Digest);

impl FileId {
    pub fn as_bytes(&self) -> &[u8; 20] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self(Sha1Digest::from_slice(bytes)?))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.to_hex())
    }
}

/// Per-file flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FileFlags(pub u32);

impl FileFlags {
    pub const CONFIG: u32 = 1 << 0;
    pub const PATH_DEPENDENCY_TARGET: u32 = 1 << 1;
    pub const INITIAL_CONTENTS: u32 = 1 << 2;
    pub const TRANSIENT: u32 = 1 << 4;
    pub const SOURCE: u32 = 1 << 5;
    pub const AUTO_SOURCE: u32 = 1 << 6;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    pub fn with(self, bit: u32) -> Self {
        Self(self.0 | bit)
    }

    pub fn without(self, bit: u32) -> Self {
        Self(self.0 & !bit)
    }

    pub fn is_config(&self) -> bool {
        self.contains(Self::CONFIG)
    }

    pub fn is_initial_contents(&self) -> bool {
        self.contains(Self::INITIAL_CONTENTS)
    }

    pub fn is_transient(&self) -> bool {
        self.contains(Self::TRANSIENT)
    }

    pub fn is_source(&self) -> bool {
        self.contains(Self::SOURCE)
    }

    pub fn is_auto_source(&self) -> bool {
        self.contains(Self::AUTO_SOURCE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    /// Contents intentionally absent
    Missing,
}

impl FileKind {
    pub fn tag(&self) -> u8 {
        match self {
            FileKind::Regular => b'-',
            FileKind::Directory => b'd',
            FileKind::Symlink => b'l',
            FileKind::CharDevice => b'c',
            FileKind::BlockDevice => b'b',
            FileKind::Fifo => b'p',
            FileKind::Socket => b's',
            FileKind::Missing => b'm',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            b'-' => FileKind::Regular,
            b'd' => FileKind::Directory,
            b'l' => FileKind::Symlink,
            b'c' => FileKind::CharDevice,
            b'b' => FileKind::BlockDevice,
            b'p' => FileKind::Fifo,
            b's' => FileKind::Socket,
            b'm' => FileKind::Missing,
            other => return Err(Error::ParseError(format!("unknown file kind byte 0x{:02x}", other))),
        })
    }

    pub fn has_contents(&self) -> bool {
        matches!(self, FileKind::Regular)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileKind::Regular => "regular file",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
            FileKind::CharDevice => "character device",
            FileKind::BlockDevice => "block device",
            FileKind::Fifo => "fifo",
            FileKind::Socket => "socket",
            FileKind::Missing => "missing",
        };
        f.write_str(name)
    }
}

/// A typed file stream
#[derive(Clone, PartialEq, Eq)]
pub struct FileStream {
    kind: FileKind,
    streams: StreamSet,
}

impl FileStream {
    pub fn new(kind: FileKind) -> Self {
        Self {
            kind,
            streams: StreamSet::new(&FILE_SCHEMA),
        }
    }

    /// Regular file stream for in-memory contents
    pub fn regular(contents: &[u8], perms: u16) -> Self {
        let mut f = Self::new(FileKind::Regular);
        f.set_contents(contents.len() as u64, Sha1Digest::of(contents));
        f.set_perms(perms);
        f.set_owner("root");
        f.set_group("root");
        f
    }

    pub fn directory(perms: u16) -> Self {
        let mut f = Self::new(FileKind::Directory);
        f.set_perms(perms);
        f.set_owner("root");
        f.set_group("root");
        f
    }

    pub fn symlink(target: &str) -> Self {
        let mut f = Self::new(FileKind::Symlink);
        f.set_target(target);
        f.set_perms(0o777);
        f.set_owner("root");
        f.set_group("root");
        f
    }

    /// Capture the on-disk state of `path` without following symlinks
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path)?;
        let ft = meta.file_type();
        let kind = if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_char_device() {
            FileKind::CharDevice
        } else if ft.is_block_device() {
            FileKind::BlockDevice
        } else if ft.is_fifo() {
            FileKind::Fifo
        } else if ft.is_socket() {
            FileKind::Socket
        } else {
            FileKind::Regular
        };

        let mut f = Self::new(kind);
        f.set_perms((meta.mode() & 0o7777) as u16);
        f.set_mtime(meta.mtime().clamp(0, u32::MAX as i64) as u32);
        f.set_owner(&user_name(meta.uid()));
        f.set_group(&group_name(meta.gid()));

        match kind {
            FileKind::Regular => {
                let digest = crate::hash::sha1_reader(fs::File::open(path)?)?;
                f.set_contents(meta.len(), digest);
            }
            FileKind::Symlink => {
                let target = fs::read_link(path)?;
                f.set_target(&target.to_string_lossy());
            }
            FileKind::CharDevice | FileKind::BlockDevice => {
                let rdev = meta.rdev();
                f.set_device(libc::major(rdev), libc::minor(rdev));
            }
            _ => {}
        }
        Ok(f)
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn streams(&self) -> &StreamSet {
        &self.streams
    }

    fn inode_mut(&mut self) -> &mut StreamSet {
        self.streams
            .get_set_mut(FILE_INODE)
            .unwrap_or_else(|| unreachable!("inode is a nested set"))
    }

    pub fn perms(&self) -> Option<u16> {
        self.streams.get_set(FILE_INODE)?.get_u16(INODE_PERMS)
    }

    pub fn set_perms(&mut self, perms: u16) {
        self.inode_mut().set(INODE_PERMS, StreamValue::U16(perms));
    }

    pub fn mtime(&self) -> Option<u32> {
        self.streams.get_set(FILE_INODE)?.get_u32(INODE_MTIME)
    }

    pub fn set_mtime(&mut self, mtime: u32) {
        self.inode_mut().set(INODE_MTIME, StreamValue::Mtime(mtime));
    }

    pub fn owner(&self) -> Option<&str> {
        self.streams.get_set(FILE_INODE)?.get_str(INODE_OWNER)
    }

    pub fn set_owner(&mut self, owner: &str) {
        self.inode_mut().set(INODE_OWNER, StreamValue::Bytes(owner.as_bytes().to_vec()));
    }

    pub fn group(&self) -> Option<&str> {
        self.streams.get_set(FILE_INODE)?.get_str(INODE_GROUP)
    }

    pub fn set_group(&mut self, group: &str) {
        self.inode_mut().set(INODE_GROUP, StreamValue::Bytes(group.as_bytes().to_vec()));
    }

    pub fn size(&self) -> Option<u64> {
        self.streams.get_set(FILE_CONTENTS)?.get_u64(CONTENTS_SIZE)
    }

    pub fn contents_sha1(&self) -> Option<Sha1Digest> {
        self.streams.get_set(FILE_CONTENTS)?.get_sha1(CONTENTS_SHA1)
    }

    pub fn set_contents(&mut self, size: u64, sha1: Sha1Digest) {
        if let Some(contents) = self.streams.get_set_mut(FILE_CONTENTS) {
            contents.set(CONTENTS_SIZE, StreamValue::U64(size));
            contents.set(CONTENTS_SHA1, StreamValue::Sha1(sha1));
        }
    }

    pub fn device(&self) -> Option<(u32, u32)> {
        let dev = self.streams.get_set(FILE_DEVICE)?;
        Some((dev.get_u32(DEVICE_MAJOR)?, dev.get_u32(DEVICE_MINOR)?))
    }

    pub fn set_device(&mut self, major: u32, minor: u32) {
        if let Some(dev) = self.streams.get_set_mut(FILE_DEVICE) {
            dev.set(DEVICE_MAJOR, StreamValue::U32(major));
            dev.set(DEVICE_MINOR, StreamValue::U32(minor));
        }
    }

    pub fn flags(&self) -> FileFlags {
        FileFlags(self.streams.get_u32(FILE_FLAGS).unwrap_or(0))
    }

    pub fn set_flags(&mut self, flags: FileFlags) {
        if flags.0 == 0 {
            self.streams.remove(FILE_FLAGS);
        } else {
            self.streams.set(FILE_FLAGS, StreamValue::U32(flags.0));
        }
    }

    pub fn is_config(&self) -> bool {
        self.flags().is_config()
    }

    pub fn target(&self) -> Option<&str> {
        self.streams.get_str(FILE_TARGET)
    }

    pub fn set_target(&mut self, target: &str) {
        self.streams.set(FILE_TARGET, StreamValue::Bytes(target.as_bytes().to_vec()));
    }

    pub fn tags(&self) -> BTreeSet<String> {
        self.streams.get_str_set(FILE_TAGS).cloned().unwrap_or_default()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.streams.get_str_set(FILE_TAGS).is_some_and(|t| t.contains(tag))
    }

    pub fn add_tag(&mut self, tag: &str) {
        let mut tags = self.tags();
        tags.insert(tag.to_string());
        self.streams.set(FILE_TAGS, StreamValue::StrSet(tags));
    }

    pub fn link_group(&self) -> Option<&[u8]> {
        self.streams.get_bytes(FILE_LINKGROUP)
    }

    pub fn set_link_group(&mut self, group: &[u8]) {
        self.streams.set(FILE_LINKGROUP, StreamValue::Bytes(group.to_vec()));
    }

    pub fn flavor(&self) -> Result<Flavor> {
        match self.streams.get_str(FILE_FLAVOR) {
            Some(frozen) => Flavor::thaw(frozen),
            None => Ok(Flavor::empty()),
        }
    }

    pub fn set_flavor(&mut self, flavor: &Flavor) {
        self.streams.set(FILE_FLAVOR, StreamValue::Bytes(flavor.freeze().into_bytes()));
    }

    pub fn provides(&self) -> Result<DependencySet> {
        match self.streams.get_str(FILE_PROVIDES) {
            Some(frozen) => DependencySet::thaw(frozen),
            None => Ok(DependencySet::new()),
        }
    }

    pub fn set_provides(&mut self, deps: &DependencySet) {
        self.streams.set(FILE_PROVIDES, StreamValue::Bytes(deps.freeze().into_bytes()));
    }

    pub fn requires(&self) -> Result<DependencySet> {
        match self.streams.get_str(FILE_REQUIRES) {
            Some(frozen) => DependencySet::thaw(frozen),
            None => Ok(DependencySet::new()),
        }
    }

    pub fn set_requires(&mut self, deps: &DependencySet) {
        self.streams.set(FILE_REQUIRES, StreamValue::Bytes(deps.freeze().into_bytes()));
    }

    /// Skip set used for identity: mtime never contributes to a fileId
    pub fn identity_skip() -> SkipSet {
        SkipSet::new().with(&[FILE_INODE, INODE_MTIME])
    }

    pub fn file_id(&self) -> FileId {
        let mut buf = vec![self.kind.tag()];
        buf.extend(self.streams.freeze_with(&Self::identity_skip()));
        FileId(Sha1Digest::of(&buf))
    }

    pub fn freeze(&self) -> Vec<u8> {
        self.freeze_with(&SkipSet::new())
    }

    pub fn freeze_with(&self, skip: &SkipSet) -> Vec<u8> {
        let mut buf = vec![self.kind.tag()];
        buf.extend(self.streams.freeze_with(skip));
        buf
    }

    pub fn thaw(data: &[u8]) -> Result<Self> {
        let (&kind, rest) = data
            .split_first()
            .ok_or_else(|| Error::ParseError("empty file stream".to_string()))?;
        Ok(Self {
            kind: FileKind::from_tag(kind)?,
            streams: StreamSet::thaw(&FILE_SCHEMA, rest)?,
        })
    }

    /// Diff from `old` to `self`; `None` when they are identical
    pub fn diff(&self, old: &FileStream) -> Option<Vec<u8>> {
        if self.kind != old.kind {
            return Some(self.freeze());
        }
        let inner = self.streams.diff(&old.streams)?;
        let mut buf = vec![DIFF_MARKER, self.kind.tag()];
        buf.extend(inner);
        Some(buf)
    }

    fn is_relative_diff(diff: &[u8]) -> bool {
        diff.first() == Some(&DIFF_MARKER)
    }

    /// Rebuild the new stream from `old` and a diff or full freeze
    pub fn apply_diff(old: Option<&FileStream>, diff: &[u8]) -> Result<FileStream> {
        if !Self::is_relative_diff(diff) {
            return Self::thaw(diff);
        }
        let old = old.ok_or_else(|| Error::ParseError("relative file diff without a base stream".to_string()))?;
        let kind = FileKind::from_tag(*diff.get(1).ok_or_else(|| Error::ParseError("short file diff".to_string()))?)?;
        if kind != old.kind {
            return Err(Error::ParseError(format!("file diff for a {} applied to a {}", kind, old.kind)));
        }
        let mut new = old.clone();
        new.streams.apply_diff(&diff[2..])?;
        Ok(new)
    }

    /// Three-way merge of a repository diff (base → new) into this local stream
    pub fn twm(&self, diff: &[u8], base: &FileStream) -> Result<MergeResult<FileStream>> {
        if !Self::is_relative_diff(diff) {
            let new = Self::thaw(diff)?;
            if self == base || *self == new {
                return Ok(MergeResult::Merged(new));
            }
            return Ok(MergeResult::ConflictAt("kind".to_string()));
        }
        if self.kind != base.kind {
            return Ok(MergeResult::ConflictAt("kind".to_string()));
        }
        Ok(match self.streams.twm(&diff[2..], &base.streams)? {
            MergeResult::Merged(streams) => MergeResult::Merged(FileStream {
                kind: self.kind,
                streams,
            }),
            MergeResult::ConflictAt(field) => MergeResult::ConflictAt(field),
        })
    }

    /// Compare the metadata that matters on disk, ignoring mtime
    pub fn same_metadata(&self, other: &FileStream) -> bool {
        self.kind == other.kind
            && self.perms() == other.perms()
            && self.contents_sha1() == other.contents_sha1()
            && self.target() == other.target()
            && self.device() == other.device()
    }

    /// Write this file to `path`
    ///
    /// Regular files are written through a temporary file in the target
    /// directory and renamed into place. The contents must hash to the
    /// stream's SHA-1.
    pub fn restore(&self, path: &Path, contents: Option<&mut dyn Read>) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match self.kind {
            FileKind::Regular => {
                let reader = contents.ok_or_else(|| {
                    Error::NotFound(format!("no contents to restore {}", path.display()))
                })?;
                self.restore_regular(path, reader)?;
            }
            FileKind::Directory => {
                match fs::symlink_metadata(path) {
                    Ok(meta) if meta.is_dir() => {}
                    Ok(_) => {
                        fs::remove_file(path)?;
                        fs::create_dir(path)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir(path)?,
                    Err(e) => return Err(e.into()),
                }
            }
            FileKind::Symlink => {
                let target = self
                    .target()
                    .ok_or_else(|| Error::ParseError(format!("symlink {} has no target", path.display())))?;
                remove_existing(path)?;
                std::os::unix::fs::symlink(target, path)?;
            }
            FileKind::Fifo => {
                remove_existing(path)?;
                make_node(path, libc::S_IFIFO, 0)?;
            }
            FileKind::CharDevice | FileKind::BlockDevice => {
                let (major, minor) = self
                    .device()
                    .ok_or_else(|| Error::ParseError(format!("device {} has no numbers", path.display())))?;
                let kind = if self.kind == FileKind::CharDevice { libc::S_IFCHR } else { libc::S_IFBLK };
                remove_existing(path)?;
                make_node(path, kind, libc::makedev(major, minor))?;
            }
            // sockets are created by their owners; missing files carry nothing
            FileKind::Socket | FileKind::Missing => return Ok(()),
        }
        self.apply_metadata(path)?;
        debug!("restored {} {}", self.kind, path.display());
        Ok(())
    }

    fn restore_regular(&self, path: &Path, reader: &mut dyn Read) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut hasher = crate::hash::Hasher::new(crate::hash::HashAlgorithm::Sha1);
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }
        let actual = Sha1Digest::from_slice(&hasher.finalize())?;
        if let Some(expected) = self.contents_sha1()
            && expected != actual
        {
            return Err(Error::Integrity(format!(
                "contents of {} hash to {} but the stream says {}",
                path.display(),
                actual,
                expected
            )));
        }
        tmp.as_file().sync_all()?;
        if fs::symlink_metadata(path).is_ok_and(|m| m.is_dir()) {
            return Err(Error::FileConflict(format!("{} is a directory", path.display())));
        }
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Apply perms, mtime and ownership to a file already in place
    pub fn restore_metadata(&self, path: &Path) -> Result<()> {
        self.apply_metadata(path)
    }

    fn apply_metadata(&self, path: &Path) -> Result<()> {
        // mtime first: the file may not be writable once perms are applied
        if self.kind == FileKind::Regular
            && let Some(mtime) = self.mtime()
        {
            let when = std::time::UNIX_EPOCH + std::time::Duration::from_secs(mtime as u64);
            fs::File::options().write(true).open(path)?.set_modified(when)?;
        }
        if self.kind != FileKind::Symlink
            && let Some(perms) = self.perms()
        {
            fs::set_permissions(path, fs::Permissions::from_mode(perms as u32))?;
        }
        if ownership::is_root() {
            let uid = self.owner().and_then(ownership::uid_for);
            let gid = self.group().and_then(ownership::gid_for);
            std::os::unix::fs::lchown(path, uid, gid)?;
        }
        Ok(())
    }

    /// Remove this file from `path`
    ///
    /// Directories are only removed when empty. Returns whether anything
    /// was removed.
    pub fn remove(&self, path: &Path) -> Result<bool> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return match fs::remove_dir(path) {
                Ok(()) => Ok(true),
                Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) || e.raw_os_error() == Some(libc::EEXIST) => {
                    debug!("keeping non-empty directory {}", path.display());
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            };
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("kind", &self.kind)
            .field("streams", &self.streams)
            .finish()
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir(path)?;
            Ok(())
        }
        Ok(_) => {
            fs::remove_file(path)?;
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn make_node(path: &Path, kind: libc::mode_t, dev: libc::dev_t) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidPath(path.display().to_string()))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    let rc = unsafe { libc::mknod(c_path.as_ptr(), kind | 0o600, dev) };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}
