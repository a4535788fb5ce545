// src/trove/mod.rs

//! Troves
//!
//! A [`Trove`] is a named, versioned, flavored set of files and references
//! to other troves, together with its provides/requires, change log and
//! [`TroveInfo`]. Components are named `pkg:comp`, source troves end in
//! `:source`, and groups are named `group-*`.
//!
//! Sub-troves are held by [`TroveTuple`] only; a trove never owns another
//! trove object, so cyclic group membership is just a cycle of ids.

mod changeset;
mod info;

pub use changeset::TroveChangeSet;
pub use info::TroveInfo;

use crate::dependencies::{DepClass, Dependency, DependencySet};
use crate::error::{Error, Result};
use crate::files::{FileId, PathId};
use crate::flavor::Flavor;
use crate::hash::Sha1Digest;
use crate::streams::frame::{write_frame, FrameReader};
use crate::streams::{FieldDef, Schema, SkipSet, StreamKind, StreamSet, StreamValue};
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

pub const TROVE_NAME: u8 = 0;
pub const TROVE_VERSION: u8 = 1;
pub const TROVE_FLAVOR: u8 = 2;
pub const TROVE_CHANGELOG: u8 = 3;
pub const TROVE_INFO: u8 = 4;
pub const TROVE_PROVIDES: u8 = 5;
pub const TROVE_REQUIRES: u8 = 6;
pub const TROVE_TROVES: u8 = 7;
pub const TROVE_FILES: u8 = 8;

const CHANGELOG_NAME: u8 = 1;
const CHANGELOG_CONTACT: u8 = 2;
const CHANGELOG_MESSAGE: u8 = 3;

static CHANGELOG_SCHEMA: Schema = Schema {
    name: "changeLog",
    fields: &[
        FieldDef { tag: CHANGELOG_NAME, name: "name", kind: StreamKind::Bytes },
        FieldDef { tag: CHANGELOG_CONTACT, name: "contact", kind: StreamKind::Bytes },
        FieldDef { tag: CHANGELOG_MESSAGE, name: "message", kind: StreamKind::Bytes },
    ],
};

static TROVE_SCHEMA: Schema = Schema {
    name: "trove",
    fields: &[
        FieldDef { tag: TROVE_NAME, name: "name", kind: StreamKind::Bytes },
        FieldDef { tag: TROVE_VERSION, name: "version", kind: StreamKind::Bytes },
        FieldDef { tag: TROVE_FLAVOR, name: "flavor", kind: StreamKind::Bytes },
        FieldDef { tag: TROVE_CHANGELOG, name: "changeLog", kind: StreamKind::Set(&CHANGELOG_SCHEMA) },
        FieldDef { tag: TROVE_INFO, name: "troveInfo", kind: StreamKind::Set(&info::INFO_SCHEMA) },
        FieldDef { tag: TROVE_PROVIDES, name: "provides", kind: StreamKind::Bytes },
        FieldDef { tag: TROVE_REQUIRES, name: "requires", kind: StreamKind::Bytes },
        FieldDef { tag: TROVE_TROVES, name: "troves", kind: StreamKind::Bytes },
        FieldDef { tag: TROVE_FILES, name: "files", kind: StreamKind::Bytes },
    ],
};

/// `(name, version, flavor)`: the identity of a trove
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TroveTuple {
    pub name: String,
    pub version: Version,
    pub flavor: Flavor,
}

impl TroveTuple {
    pub fn new(name: impl Into<String>, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.into(),
            version,
            flavor,
        }
    }

    /// NUL-separated frozen form (version with timestamps)
    pub fn freeze(&self) -> String {
        format!("{}\0{}\0{}", self.name, self.version.freeze(), self.flavor.freeze())
    }

    pub fn thaw(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, '\0');
        let (Some(name), Some(version), Some(flavor)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::ParseError(format!("bad trove tuple {:?}", s)));
        };
        Ok(Self::new(name, Version::thaw(version)?, Flavor::thaw(flavor)?))
    }

    /// Parse `name=version[flavor]`
    pub fn parse_spec(s: &str) -> Result<Self> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| Error::ParseError(format!("expected name=version in '{}'", s)))?;
        let (version, flavor) = match rest.find('[') {
            Some(idx) => {
                let flavor = rest[idx..]
                    .strip_prefix('[')
                    .and_then(|f| f.strip_suffix(']'))
                    .ok_or_else(|| Error::FlavorParse(format!("unterminated flavor in '{}'", s)))?;
                (&rest[..idx], Flavor::parse(flavor)?)
            }
            None => (rest, Flavor::empty()),
        };
        Ok(Self::new(name, Version::parse(version)?, flavor))
    }

    /// 16-byte changeset entry id for a trove change to this tuple
    pub fn entry_id(&self) -> [u8; 16] {
        let digest = Sha1Digest::of(self.freeze().as_bytes());
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest.0[..16]);
        id
    }
}

impl Ord for TroveTuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.version.as_string().cmp(&other.version.as_string()))
            .then_with(|| self.flavor.freeze().cmp(&other.flavor.freeze()))
    }
}

impl PartialOrd for TroveTuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TroveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.version)?;
        if !self.flavor.is_empty() {
            write!(f, "[{}]", self.flavor)?;
        }
        Ok(())
    }
}

/// One row of a trove's file list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub file_id: FileId,
    pub version: Version,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    pub name: String,
    pub contact: String,
    pub message: String,
}

impl ChangeLog {
    pub fn new(name: &str, contact: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            contact: contact.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.contact.is_empty() && self.message.is_empty()
    }

    pub(crate) fn to_streams(&self) -> StreamSet {
        let mut set = StreamSet::new(&CHANGELOG_SCHEMA);
        set.set(CHANGELOG_NAME, StreamValue::Bytes(self.name.as_bytes().to_vec()));
        set.set(CHANGELOG_CONTACT, StreamValue::Bytes(self.contact.as_bytes().to_vec()));
        set.set(CHANGELOG_MESSAGE, StreamValue::Bytes(self.message.as_bytes().to_vec()));
        set
    }

    pub(crate) fn from_streams(set: &StreamSet) -> Self {
        Self {
            name: set.get_str(CHANGELOG_NAME).unwrap_or_default().to_string(),
            contact: set.get_str(CHANGELOG_CONTACT).unwrap_or_default().to_string(),
            message: set.get_str(CHANGELOG_MESSAGE).unwrap_or_default().to_string(),
        }
    }

    pub(crate) fn schema() -> &'static Schema {
        &CHANGELOG_SCHEMA
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trove {
    name: String,
    version: Version,
    flavor: Flavor,
    files: BTreeMap<PathId, FileEntry>,
    troves: BTreeMap<TroveTuple, bool>,
    provides: DependencySet,
    requires: DependencySet,
    change_log: ChangeLog,
    info: TroveInfo,
}

impl Trove {
    /// New empty trove; `provides` starts with the self-provide
    pub fn new(name: impl Into<String>, version: Version, flavor: Flavor) -> Self {
        let name = name.into();
        let mut provides = DependencySet::new();
        if !name.ends_with(":source") {
            provides.add(DepClass::Trove, Dependency::new(name.clone()));
        }
        Self {
            name,
            version,
            flavor,
            files: BTreeMap::new(),
            troves: BTreeMap::new(),
            provides,
            requires: DependencySet::new(),
            change_log: ChangeLog::default(),
            info: TroveInfo::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn tuple(&self) -> TroveTuple {
        TroveTuple::new(self.name.clone(), self.version.clone(), self.flavor.clone())
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn is_source(&self) -> bool {
        self.name.ends_with(":source")
    }

    pub fn is_component(&self) -> bool {
        self.name.contains(':')
    }

    pub fn is_group(&self) -> bool {
        self.name.starts_with("group-")
    }

    /// Package name without the `:component` suffix
    pub fn package_name(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }

    pub fn add_file(&mut self, path_id: PathId, path: impl Into<String>, file_id: FileId, version: Version) {
        self.files.insert(
            path_id,
            FileEntry {
                path: path.into(),
                file_id,
                version,
            },
        );
    }

    pub fn update_file(&mut self, path_id: PathId, entry: FileEntry) {
        self.files.insert(path_id, entry);
    }

    pub fn remove_file(&mut self, path_id: &PathId) -> Option<FileEntry> {
        self.files.remove(path_id)
    }

    pub fn file(&self, path_id: &PathId) -> Option<&FileEntry> {
        self.files.get(path_id)
    }

    /// Files in pathId order
    pub fn files(&self) -> impl Iterator<Item = (&PathId, &FileEntry)> {
        self.files.iter()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn path_id_for(&self, path: &str) -> Option<PathId> {
        self.files.iter().find(|(_, e)| e.path == path).map(|(id, _)| *id)
    }

    pub fn add_trove(&mut self, tuple: TroveTuple, by_default: bool) {
        self.troves.insert(tuple, by_default);
    }

    pub fn remove_trove(&mut self, tuple: &TroveTuple) -> bool {
        self.troves.remove(tuple).is_some()
    }

    pub fn troves(&self) -> impl Iterator<Item = (&TroveTuple, bool)> {
        self.troves.iter().map(|(t, d)| (t, *d))
    }

    pub fn provides(&self) -> &DependencySet {
        &self.provides
    }

    pub fn provides_mut(&mut self) -> &mut DependencySet {
        &mut self.provides
    }

    pub fn requires(&self) -> &DependencySet {
        &self.requires
    }

    pub fn requires_mut(&mut self) -> &mut DependencySet {
        &mut self.requires
    }

    pub fn set_provides(&mut self, provides: DependencySet) {
        self.provides = provides;
    }

    pub fn set_requires(&mut self, requires: DependencySet) {
        self.requires = requires;
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn set_change_log(&mut self, change_log: ChangeLog) {
        self.change_log = change_log;
    }

    pub fn info(&self) -> &TroveInfo {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut TroveInfo {
        &mut self.info
    }

    /// Non-source troves must provide `trove: <name>`
    pub fn verify_self_provide(&self) -> Result<()> {
        if self.is_source() {
            if self.provides.contains(DepClass::Trove, &self.name) {
                return Err(Error::Integrity(format!(
                    "source trove {} must not be a dependency target",
                    self.name
                )));
            }
            return Ok(());
        }
        if !self.provides.contains(DepClass::Trove, &self.name) {
            return Err(Error::Integrity(format!("{} does not provide trove: {}", self.name, self.name)));
        }
        Ok(())
    }

    fn to_streams(&self) -> StreamSet {
        let mut set = StreamSet::new(&TROVE_SCHEMA);
        set.set(TROVE_NAME, StreamValue::Bytes(self.name.as_bytes().to_vec()));
        set.set(TROVE_VERSION, StreamValue::Bytes(self.version.freeze().into_bytes()));
        set.set(TROVE_FLAVOR, StreamValue::Bytes(self.flavor.freeze().into_bytes()));
        set.set(TROVE_CHANGELOG, StreamValue::Set(self.change_log.to_streams()));
        set.set(TROVE_INFO, StreamValue::Set(self.info.streams().clone()));
        set.set(TROVE_PROVIDES, StreamValue::Bytes(self.provides.freeze().into_bytes()));
        set.set(TROVE_REQUIRES, StreamValue::Bytes(self.requires.freeze().into_bytes()));
        set.set(TROVE_TROVES, StreamValue::Bytes(encode_refs(self.troves.iter().map(|(t, d)| (t, *d)))));
        set.set(TROVE_FILES, StreamValue::Bytes(encode_files(self.files.iter())));
        set
    }

    pub fn freeze(&self) -> Vec<u8> {
        self.to_streams().freeze()
    }

    pub fn freeze_with(&self, skip: &SkipSet) -> Vec<u8> {
        self.to_streams().freeze_with(skip)
    }

    pub fn thaw(data: &[u8]) -> Result<Self> {
        let set = StreamSet::thaw(&TROVE_SCHEMA, data)?;
        let name = set
            .get_str(TROVE_NAME)
            .ok_or_else(|| Error::ParseError("trove without a name".to_string()))?
            .to_string();
        let version = Version::thaw(
            set.get_str(TROVE_VERSION)
                .ok_or_else(|| Error::ParseError(format!("trove {} has no version", name)))?,
        )?;
        let flavor = Flavor::thaw(set.get_str(TROVE_FLAVOR).unwrap_or_default())?;
        Ok(Self {
            name,
            version,
            flavor,
            files: decode_files(set.get_bytes(TROVE_FILES).unwrap_or_default())?,
            troves: decode_refs(set.get_bytes(TROVE_TROVES).unwrap_or_default())?.into_iter().collect(),
            provides: DependencySet::thaw(set.get_str(TROVE_PROVIDES).unwrap_or_default())?,
            requires: DependencySet::thaw(set.get_str(TROVE_REQUIRES).unwrap_or_default())?,
            change_log: set.get_set(TROVE_CHANGELOG).map(ChangeLog::from_streams).unwrap_or_default(),
            info: set
                .get_set(TROVE_INFO)
                .cloned()
                .map(TroveInfo::from_streams)
                .unwrap_or_default(),
        })
    }

    /// Bytes covered by the trove digests: signatures excluded, versions
    /// without timestamps
    fn digest_input(&self) -> Vec<u8> {
        let mut plain = self.clone();
        plain.version = plain.version.without_timestamps();
        for entry in plain.files.values_mut() {
            entry.version = entry.version.without_timestamps();
        }
        plain.troves = plain
            .troves
            .into_iter()
            .map(|(mut t, d)| {
                t.version = t.version.without_timestamps();
                (t, d)
            })
            .collect();
        plain.freeze_with(&SkipSet::new().with(&[TROVE_INFO, info::INFO_SIGNATURES]))
    }

    pub fn compute_digests(&mut self) {
        let input = self.digest_input();
        self.info.set_digests(Sha1Digest::of(&input), crate::hash::sha256(&input));
    }

    /// Check recorded digests; a trove with none recorded passes
    pub fn verify_digests(&self) -> Result<()> {
        let Some(recorded) = self.info.sha1_digest() else {
            return Ok(());
        };
        let input = self.digest_input();
        let actual = Sha1Digest::of(&input);
        if recorded != actual {
            return Err(Error::Integrity(format!(
                "digest mismatch for {}: recorded {} computed {}",
                self.tuple(),
                recorded,
                actual
            )));
        }
        if let Some(sha256) = self.info.sha256_digest()
            && sha256 != crate::hash::sha256(&input)
        {
            return Err(Error::Integrity(format!("sha256 digest mismatch for {}", self.tuple())));
        }
        Ok(())
    }

    /// Change set turning `old` (or nothing) into `self`
    pub fn diff(&self, old: Option<&Trove>) -> TroveChangeSet {
        TroveChangeSet::between(old, self)
    }

    /// Apply a relative trove change set to this trove in place
    pub fn apply_change_set(&mut self, tcs: &TroveChangeSet) -> Result<()> {
        *self = tcs.apply(Some(self))?;
        Ok(())
    }
}

pub(crate) fn encode_files<'a>(files: impl Iterator<Item = (&'a PathId, &'a FileEntry)>) -> Vec<u8> {
    let mut out = Vec::new();
    for (path_id, entry) in files {
        let mut payload = Vec::with_capacity(64 + entry.path.len());
        payload.extend_from_slice(&path_id.0);
        payload.extend_from_slice(entry.file_id.as_bytes());
        payload.extend_from_slice(entry.path.as_bytes());
        payload.push(0);
        payload.extend_from_slice(entry.version.freeze().as_bytes());
        // entries are far below the frame size limit
        let _ = write_frame(&mut out, 1, &payload);
    }
    out
}

pub(crate) fn decode_files(data: &[u8]) -> Result<BTreeMap<PathId, FileEntry>> {
    let mut files = BTreeMap::new();
    for frame in FrameReader::new(data) {
        let (_, payload) = frame?;
        if payload.len() < 37 {
            return Err(Error::ParseError("short file entry".to_string()));
        }
        let path_id = PathId::from_slice(&payload[..16])?;
        let file_id = FileId::from_slice(&payload[16..36])?;
        let rest = std::str::from_utf8(&payload[36..])
            .map_err(|_| Error::ParseError("file entry is not UTF-8".to_string()))?;
        let (path, version) = rest
            .split_once('\0')
            .ok_or_else(|| Error::ParseError("file entry without version".to_string()))?;
        files.insert(
            path_id,
            FileEntry {
                path: path.to_string(),
                file_id,
                version: Version::thaw(version)?,
            },
        );
    }
    Ok(files)
}

pub(crate) fn encode_refs<'a>(refs: impl Iterator<Item = (&'a TroveTuple, bool)>) -> Vec<u8> {
    let mut out = Vec::new();
    for (tuple, by_default) in refs {
        let mut payload = vec![by_default as u8];
        payload.extend_from_slice(tuple.freeze().as_bytes());
        let _ = write_frame(&mut out, 1, &payload);
    }
    out
}

pub(crate) fn decode_refs(data: &[u8]) -> Result<Vec<(TroveTuple, bool)>> {
    let mut refs = Vec::new();
    for frame in FrameReader::new(data) {
        let (_, payload) = frame?;
        let (&by_default, rest) = payload
            .split_first()
            .ok_or_else(|| Error::ParseError("empty trove reference".to_string()))?;
        let text = std::str::from_utf8(rest)
            .map_err(|_| Error::ParseError("trove reference is not UTF-8".to_string()))?;
        refs.push((TroveTuple::thaw(text)?, by_default != 0));
    }
    Ok(refs)
}
