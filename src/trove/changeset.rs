// src/trove/changeset.rs

//! Per-trove differences
//!
//! A [`TroveChangeSet`] without an old version is absolute and lists every
//! file as new. A relative one lists files added, changed and removed
//! against the old trove, plus the new provides/requires and metadata in
//! full.

use super::{decode_files, decode_refs, encode_files, ChangeLog, FileEntry, Trove, TroveInfo, TroveTuple};
use crate::dependencies::DependencySet;
use crate::error::{Error, Result};
use crate::files::PathId;
use crate::flavor::Flavor;
use crate::streams::frame::{write_frame, FrameReader};
use crate::streams::{FieldDef, Schema, StreamKind, StreamSet, StreamValue};
use crate::version::Version;
use std::collections::{BTreeMap, BTreeSet};

const TCS_NAME: u8 = 0;
const TCS_OLD_VERSION: u8 = 1;
const TCS_NEW_VERSION: u8 = 2;
const TCS_REQUIRES: u8 = 3;
const TCS_PROVIDES: u8 = 4;
const TCS_CHANGE_LOG: u8 = 5;
const TCS_OLD_FILES: u8 = 6;
const TCS_TROVE_CHANGES: u8 = 8;
const TCS_NEW_FILES: u8 = 9;
const TCS_CHG_FILES: u8 = 10;
const TCS_OLD_FLAVOR: u8 = 11;
const TCS_NEW_FLAVOR: u8 = 12;
const TCS_TROVEINFO: u8 = 14;

const REF_ADDED: u8 = 1;
const REF_REMOVED: u8 = 2;

static TCS_SCHEMA: Schema = Schema {
    name: "troveChangeSet",
    fields: &[
        FieldDef { tag: TCS_NAME, name: "name", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_OLD_VERSION, name: "oldVersion", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_NEW_VERSION, name: "newVersion", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_REQUIRES, name: "requires", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_PROVIDES, name: "provides", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_CHANGE_LOG, name: "changeLog", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_OLD_FILES, name: "oldFiles", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_TROVE_CHANGES, name: "troves", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_NEW_FILES, name: "newFiles", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_CHG_FILES, name: "changedFiles", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_OLD_FLAVOR, name: "oldFlavor", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_NEW_FLAVOR, name: "newFlavor", kind: StreamKind::Bytes },
        FieldDef { tag: TCS_TROVEINFO, name: "troveInfo", kind: StreamKind::Bytes },
    ],
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveChangeSet {
    pub name: String,
    pub old_version: Option<Version>,
    pub new_version: Version,
    pub old_flavor: Option<Flavor>,
    pub new_flavor: Flavor,
    pub new_files: BTreeMap<PathId, FileEntry>,
    pub changed_files: BTreeMap<PathId, FileEntry>,
    pub old_files: BTreeSet<PathId>,
    pub troves_added: BTreeMap<TroveTuple, bool>,
    pub troves_removed: BTreeSet<TroveTuple>,
    pub provides: DependencySet,
    pub requires: DependencySet,
    pub change_log: ChangeLog,
    pub info: TroveInfo,
}

impl TroveChangeSet {
    pub(crate) fn between(old: Option<&Trove>, new: &Trove) -> Self {
        let mut tcs = TroveChangeSet {
            name: new.name.clone(),
            old_version: old.map(|o| o.version.clone()),
            new_version: new.version.clone(),
            old_flavor: old.map(|o| o.flavor.clone()),
            new_flavor: new.flavor.clone(),
            new_files: BTreeMap::new(),
            changed_files: BTreeMap::new(),
            old_files: BTreeSet::new(),
            troves_added: BTreeMap::new(),
            troves_removed: BTreeSet::new(),
            provides: new.provides.clone(),
            requires: new.requires.clone(),
            change_log: new.change_log.clone(),
            info: new.info.clone(),
        };

        let Some(old) = old else {
            tcs.new_files = new.files.clone();
            tcs.troves_added = new.troves.clone();
            return tcs;
        };

        for (path_id, entry) in &new.files {
            match old.files.get(path_id) {
                None => {
                    tcs.new_files.insert(*path_id, entry.clone());
                }
                Some(prev) if prev != entry || prev.version.freeze() != entry.version.freeze() => {
                    tcs.changed_files.insert(*path_id, entry.clone());
                }
                Some(_) => {}
            }
        }
        tcs.old_files = old
            .files
            .keys()
            .filter(|id| !new.files.contains_key(id))
            .copied()
            .collect();

        for (tuple, by_default) in &new.troves {
            if old.troves.get(tuple) != Some(by_default) {
                tcs.troves_added.insert(tuple.clone(), *by_default);
            }
        }
        tcs.troves_removed = old
            .troves
            .keys()
            .filter(|t| !new.troves.contains_key(t))
            .cloned()
            .collect();
        tcs
    }

    pub fn is_absolute(&self) -> bool {
        self.old_version.is_none()
    }

    pub fn new_tuple(&self) -> TroveTuple {
        TroveTuple::new(self.name.clone(), self.new_version.clone(), self.new_flavor.clone())
    }

    pub fn old_tuple(&self) -> Option<TroveTuple> {
        let version = self.old_version.clone()?;
        Some(TroveTuple::new(
            self.name.clone(),
            version,
            self.old_flavor.clone().unwrap_or_default(),
        ))
    }

    /// Every file this change touches, in pathId order
    pub fn touched_files(&self) -> impl Iterator<Item = (&PathId, &FileEntry)> {
        let mut all: Vec<(&PathId, &FileEntry)> = self.new_files.iter().chain(self.changed_files.iter()).collect();
        all.sort_by_key(|(id, _)| **id);
        all.into_iter()
    }

    /// Build the new trove; relative change sets need the matching old trove
    pub fn apply(&self, old: Option<&Trove>) -> Result<Trove> {
        let mut trove = match (&self.old_version, old) {
            (None, _) => Trove::new(self.name.clone(), self.new_version.clone(), self.new_flavor.clone()),
            (Some(expected), Some(old)) => {
                if old.name != self.name || old.version != *expected {
                    return Err(Error::Integrity(format!(
                        "change set for {}={} applied to {}",
                        self.name,
                        expected,
                        old.tuple()
                    )));
                }
                old.clone()
            }
            (Some(expected), None) => {
                return Err(Error::TroveMissing(format!("{}={}", self.name, expected)));
            }
        };

        trove.version = self.new_version.clone();
        trove.flavor = self.new_flavor.clone();
        for path_id in &self.old_files {
            trove.files.remove(path_id);
        }
        for (path_id, entry) in self.new_files.iter().chain(self.changed_files.iter()) {
            trove.files.insert(*path_id, entry.clone());
        }
        for tuple in &self.troves_removed {
            trove.troves.remove(tuple);
        }
        for (tuple, by_default) in &self.troves_added {
            trove.troves.insert(tuple.clone(), *by_default);
        }
        trove.provides = self.provides.clone();
        trove.requires = self.requires.clone();
        trove.change_log = self.change_log.clone();
        trove.info = self.info.clone();
        Ok(trove)
    }

    pub fn freeze(&self) -> Vec<u8> {
        let mut set = StreamSet::new(&TCS_SCHEMA);
        let bytes = |s: String| StreamValue::Bytes(s.into_bytes());
        set.set(TCS_NAME, bytes(self.name.clone()));
        if let Some(v) = &self.old_version {
            set.set(TCS_OLD_VERSION, bytes(v.freeze()));
        }
        set.set(TCS_NEW_VERSION, bytes(self.new_version.freeze()));
        set.set(TCS_REQUIRES, bytes(self.requires.freeze()));
        set.set(TCS_PROVIDES, bytes(self.provides.freeze()));
        set.set(TCS_CHANGE_LOG, StreamValue::Bytes(self.change_log.to_streams().freeze()));
        set.set(
            TCS_OLD_FILES,
            StreamValue::Bytes(self.old_files.iter().flat_map(|id| id.0).collect()),
        );

        let mut refs = Vec::new();
        for (tuple, by_default) in &self.troves_added {
            let mut payload = vec![*by_default as u8];
            payload.extend_from_slice(tuple.freeze().as_bytes());
            let _ = write_frame(&mut refs, REF_ADDED, &payload);
        }
        for tuple in &self.troves_removed {
            let mut payload = vec![0u8];
            payload.extend_from_slice(tuple.freeze().as_bytes());
            let _ = write_frame(&mut refs, REF_REMOVED, &payload);
        }
        set.set(TCS_TROVE_CHANGES, StreamValue::Bytes(refs));

        set.set(TCS_NEW_FILES, StreamValue::Bytes(encode_files(self.new_files.iter())));
        set.set(TCS_CHG_FILES, StreamValue::Bytes(encode_files(self.changed_files.iter())));
        if let Some(f) = &self.old_flavor {
            set.set(TCS_OLD_FLAVOR, bytes(f.freeze()));
        }
        set.set(TCS_NEW_FLAVOR, bytes(self.new_flavor.freeze()));
        set.set(TCS_TROVEINFO, StreamValue::Bytes(self.info.freeze()));
        set.freeze()
    }

    pub fn thaw(data: &[u8]) -> Result<Self> {
        let set = StreamSet::thaw(&TCS_SCHEMA, data)?;
        let name = set
            .get_str(TCS_NAME)
            .ok_or_else(|| Error::ParseError("trove change set without a name".to_string()))?
            .to_string();
        let new_version = Version::thaw(
            set.get_str(TCS_NEW_VERSION)
                .ok_or_else(|| Error::ParseError(format!("change set for {} has no new version", name)))?,
        )?;
        let old_version = set.get_str(TCS_OLD_VERSION).map(Version::thaw).transpose()?;
        // an empty old flavor freezes to nothing, so presence follows the old version
        let old_flavor = match old_version {
            Some(_) => Some(Flavor::thaw(set.get_str(TCS_OLD_FLAVOR).unwrap_or_default())?),
            None => None,
        };

        let old_bytes = set.get_bytes(TCS_OLD_FILES).unwrap_or_default();
        if old_bytes.len() % 16 != 0 {
            return Err(Error::ParseError("oldFiles is not a list of pathIds".to_string()));
        }
        let old_files = old_bytes
            .chunks(16)
            .map(PathId::from_slice)
            .collect::<Result<BTreeSet<_>>>()?;

        let mut troves_added = BTreeMap::new();
        let mut troves_removed = BTreeSet::new();
        for frame in FrameReader::new(set.get_bytes(TCS_TROVE_CHANGES).unwrap_or_default()) {
            let (tag, payload) = frame?;
            let mut framed = Vec::new();
            write_frame(&mut framed, 1, payload)?;
            for (tuple, by_default) in decode_refs(&framed)? {
                if tag == REF_REMOVED {
                    troves_removed.insert(tuple);
                } else {
                    troves_added.insert(tuple, by_default);
                }
            }
        }

        let change_log = match set.get_bytes(TCS_CHANGE_LOG) {
            Some(raw) => ChangeLog::from_streams(&StreamSet::thaw(ChangeLog::schema(), raw)?),
            None => ChangeLog::default(),
        };

        Ok(Self {
            name,
            old_version,
            new_version,
            old_flavor,
            new_flavor: Flavor::thaw(set.get_str(TCS_NEW_FLAVOR).unwrap_or_default())?,
            new_files: decode_files(set.get_bytes(TCS_NEW_FILES).unwrap_or_default())?,
            changed_files: decode_files(set.get_bytes(TCS_CHG_FILES).unwrap_or_default())?,
            old_files,
            troves_added,
            troves_removed,
            provides: DependencySet::thaw(set.get_str(TCS_PROVIDES).unwrap_or_default())?,
            requires: DependencySet::thaw(set.get_str(TCS_REQUIRES).unwrap_or_default())?,
            change_log,
            info: TroveInfo::thaw(set.get_bytes(TCS_TROVEINFO).unwrap_or_default())?,
        })
    }
}
