// src/streams/mod.rs

//! Typed binary records
//!
//! A [`StreamSet`] is an ordered collection of tagged values described by a
//! static [`Schema`]. It freezes to a concatenation of frames (see
//! [`frame`]) in tag order and thaws back. Tags the schema does not know
//! are kept as [`StreamValue::Unknown`] so records written by newer code
//! survive a round trip.
//!
//! Three operations exist beyond freeze/thaw:
//! - `diff(old)` lists only the changed tags, recursing into nested sets
//! - `apply_diff(diff)` turns `old` into `new`
//! - `twm(diff, base)` is the three-way merge: local changes are kept, the
//!   diff is taken where the local value still equals `base`, and anything
//!   else is reported as [`MergeResult::ConflictAt`]

pub mod frame;

use crate::error::{Error, Result};
use crate::hash::Sha1Digest;
use frame::{write_frame, FrameReader};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Value type of a field
#[derive(Debug, Clone, Copy)]
pub enum StreamKind {
    U8,
    U16,
    U32,
    U64,
    Bytes,
    Sha1,
    /// A u32 timestamp that never conflicts during a merge
    Mtime,
    /// Set of strings, frozen NUL-separated
    StrSet,
    Set(&'static Schema),
}

#[derive(Debug)]
pub struct FieldDef {
    pub tag: u8,
    pub name: &'static str,
    pub kind: StreamKind,
}

#[derive(Debug)]
pub struct Schema {
    pub name: &'static str,
    pub fields: &'static [FieldDef],
}

impl Schema {
    pub fn field(&self, tag: u8) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.tag == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
    Sha1(Sha1Digest),
    Mtime(u32),
    StrSet(BTreeSet<String>),
    Set(StreamSet),
    Unknown(Vec<u8>),
}

impl StreamValue {
    fn encode(&self, skip: &SkipSet) -> Vec<u8> {
        match self {
            StreamValue::U8(v) => vec![*v],
            StreamValue::U16(v) => v.to_be_bytes().to_vec(),
            StreamValue::U32(v) | StreamValue::Mtime(v) => v.to_be_bytes().to_vec(),
            StreamValue::U64(v) => v.to_be_bytes().to_vec(),
            StreamValue::Bytes(b) | StreamValue::Unknown(b) => b.clone(),
            StreamValue::Sha1(d) => d.0.to_vec(),
            StreamValue::StrSet(items) => {
                let parts: Vec<&str> = items.iter().map(String::as_str).collect();
                parts.join("\0").into_bytes()
            }
            StreamValue::Set(set) => set.freeze_with(skip),
        }
    }

    fn decode(kind: StreamKind, payload: &[u8], field: &str) -> Result<Self> {
        let wrong = || Error::ParseError(format!("bad payload length {} for '{}'", payload.len(), field));
        Ok(match kind {
            StreamKind::U8 => StreamValue::U8(*payload.first().filter(|_| payload.len() == 1).ok_or_else(wrong)?),
            StreamKind::U16 => StreamValue::U16(u16::from_be_bytes(payload.try_into().map_err(|_| wrong())?)),
            StreamKind::U32 => StreamValue::U32(u32::from_be_bytes(payload.try_into().map_err(|_| wrong())?)),
            StreamKind::Mtime => StreamValue::Mtime(u32::from_be_bytes(payload.try_into().map_err(|_| wrong())?)),
            StreamKind::U64 => StreamValue::U64(u64::from_be_bytes(payload.try_into().map_err(|_| wrong())?)),
            StreamKind::Bytes => StreamValue::Bytes(payload.to_vec()),
            StreamKind::Sha1 => StreamValue::Sha1(Sha1Digest::from_slice(payload).map_err(|_| wrong())?),
            StreamKind::StrSet => {
                let text = std::str::from_utf8(payload)
                    .map_err(|_| Error::ParseError(format!("'{}' is not UTF-8", field)))?;
                StreamValue::StrSet(text.split('\0').filter(|s| !s.is_empty()).map(String::from).collect())
            }
            StreamKind::Set(schema) => StreamValue::Set(StreamSet::thaw(schema, payload)?),
        })
    }

    /// Empty values are not frozen
    fn is_empty(&self) -> bool {
        match self {
            StreamValue::Bytes(b) | StreamValue::Unknown(b) => b.is_empty(),
            StreamValue::StrSet(items) => items.is_empty(),
            StreamValue::Set(set) => set.is_empty(),
            _ => false,
        }
    }
}

/// Tag paths omitted from a freeze
///
/// `SkipSet::new().with(&[5, 2])` skips tag 2 inside the nested set at tag 5.
#[derive(Debug, Clone, Default)]
pub struct SkipSet {
    paths: Vec<Vec<u8>>,
}

impl SkipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &[u8]) -> Self {
        self.paths.push(path.to_vec());
        self
    }

    fn skips(&self, tag: u8) -> bool {
        self.paths.iter().any(|p| p.len() == 1 && p[0] == tag)
    }

    fn nested(&self, tag: u8) -> SkipSet {
        SkipSet {
            paths: self
                .paths
                .iter()
                .filter(|p| p.len() > 1 && p[0] == tag)
                .map(|p| p[1..].to_vec())
                .collect(),
        }
    }
}

/// Outcome of a three-way merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult<T> {
    Merged(T),
    /// Dotted field path of the first conflicting field
    ConflictAt(String),
}

impl<T> MergeResult<T> {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeResult::ConflictAt(_))
    }
}

#[derive(Clone)]
pub struct StreamSet {
    schema: &'static Schema,
    values: BTreeMap<u8, StreamValue>,
}

impl StreamSet {
    pub fn new(schema: &'static Schema) -> Self {
        Self {
            schema,
            values: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(StreamValue::is_empty)
    }

    pub fn get(&self, tag: u8) -> Option<&StreamValue> {
        self.values.get(&tag).filter(|v| !v.is_empty())
    }

    /// Set a value; empty values clear the field
    pub fn set(&mut self, tag: u8, value: StreamValue) {
        if value.is_empty() {
            self.values.remove(&tag);
        } else {
            self.values.insert(tag, value);
        }
    }

    pub fn remove(&mut self, tag: u8) -> Option<StreamValue> {
        self.values.remove(&tag)
    }

    pub fn get_u8(&self, tag: u8) -> Option<u8> {
        match self.get(tag) {
            Some(StreamValue::U8(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u16(&self, tag: u8) -> Option<u16> {
        match self.get(tag) {
            Some(StreamValue::U16(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u32(&self, tag: u8) -> Option<u32> {
        match self.get(tag) {
            Some(StreamValue::U32(v)) | Some(StreamValue::Mtime(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, tag: u8) -> Option<u64> {
        match self.get(tag) {
            Some(StreamValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, tag: u8) -> Option<&[u8]> {
        match self.get(tag) {
            Some(StreamValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn get_str(&self, tag: u8) -> Option<&str> {
        self.get_bytes(tag).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn get_sha1(&self, tag: u8) -> Option<Sha1Digest> {
        match self.get(tag) {
            Some(StreamValue::Sha1(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn get_str_set(&self, tag: u8) -> Option<&BTreeSet<String>> {
        match self.get(tag) {
            Some(StreamValue::StrSet(items)) => Some(items),
            _ => None,
        }
    }

    pub fn get_set(&self, tag: u8) -> Option<&StreamSet> {
        match self.values.get(&tag) {
            Some(StreamValue::Set(set)) => Some(set),
            _ => None,
        }
    }

    /// Nested set at `tag`, created empty when absent
    ///
    /// Returns `None` when the schema does not declare `tag` as a nested set.
    pub fn get_set_mut(&mut self, tag: u8) -> Option<&mut StreamSet> {
        let StreamKind::Set(schema) = self.schema.field(tag)?.kind else {
            return None;
        };
        let entry = self
            .values
            .entry(tag)
            .or_insert_with(|| StreamValue::Set(StreamSet::new(schema)));
        match entry {
            StreamValue::Set(set) => Some(set),
            _ => None,
        }
    }

    /// Tags of unknown frames carried through unchanged
    pub fn unknown_tags(&self) -> Vec<u8> {
        self.values
            .iter()
            .filter(|(_, v)| matches!(v, StreamValue::Unknown(_)))
            .map(|(t, _)| *t)
            .collect()
    }

    pub fn freeze(&self) -> Vec<u8> {
        self.freeze_with(&SkipSet::new())
    }

    pub fn freeze_with(&self, skip: &SkipSet) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, value) in &self.values {
            if skip.skips(*tag) || value.is_empty() {
                continue;
            }
            let payload = value.encode(&skip.nested(*tag));
            if payload.is_empty() {
                continue;
            }
            // a frame only fails past 2 GiB, which no field reaches
            if write_frame(&mut out, *tag, &payload).is_err() {
                tracing::warn!("dropping oversized field {} of {}", tag, self.schema.name);
            }
        }
        out
    }

    pub fn thaw(schema: &'static Schema, data: &[u8]) -> Result<Self> {
        let mut set = StreamSet::new(schema);
        for frame in FrameReader::new(data) {
            let (tag, payload) = frame?;
            let value = match schema.field(tag) {
                Some(field) => StreamValue::decode(field.kind, payload, field.name)?,
                None => StreamValue::Unknown(payload.to_vec()),
            };
            set.set(tag, value);
        }
        Ok(set)
    }

    /// Frames for every tag that differs from `old`; `None` when nothing does
    pub fn diff(&self, old: &StreamSet) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let tags: BTreeSet<u8> = self.values.keys().chain(old.values.keys()).copied().collect();
        for tag in tags {
            let new_val = self.get(tag);
            let old_val = old.get(tag);
            if new_val == old_val {
                continue;
            }
            let payload = match (new_val, old_val) {
                (Some(StreamValue::Set(new_set)), Some(StreamValue::Set(old_set))) => {
                    match new_set.diff(old_set) {
                        Some(d) => d,
                        None => continue,
                    }
                }
                (Some(StreamValue::Set(new_set)), None) => new_set.diff(&StreamSet::new(new_set.schema)).unwrap_or_default(),
                (Some(v), _) => v.encode(&SkipSet::new()),
                (None, _) => Vec::new(),
            };
            if write_frame(&mut out, tag, &payload).is_err() {
                tracing::warn!("dropping oversized diff field {} of {}", tag, self.schema.name);
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }

    /// Apply a diff produced by [`StreamSet::diff`]
    pub fn apply_diff(&mut self, diff: &[u8]) -> Result<()> {
        for frame in FrameReader::new(diff) {
            let (tag, payload) = frame?;
            match self.schema.field(tag).map(|f| (f.kind, f.name)) {
                Some((StreamKind::Set(_), _)) => {
                    if payload.is_empty() {
                        self.values.remove(&tag);
                    } else if let Some(nested) = self.get_set_mut(tag) {
                        nested.apply_diff(payload)?;
                    }
                }
                Some((kind, name)) => {
                    if payload.is_empty() {
                        self.values.remove(&tag);
                    } else {
                        self.set(tag, StreamValue::decode(kind, payload, name)?);
                    }
                }
                None => self.set(tag, StreamValue::Unknown(payload.to_vec())),
            }
        }
        Ok(())
    }

    /// Three-way merge of `diff` (base → new) into `self` (local)
    pub fn twm(&self, diff: &[u8], base: &StreamSet) -> Result<MergeResult<StreamSet>> {
        let mut merged = self.clone();
        for frame in FrameReader::new(diff) {
            let (tag, payload) = frame?;
            let field = self.schema.field(tag);
            let name = field.map(|f| f.name.to_string()).unwrap_or_else(|| format!("tag{}", tag));

            if let Some(FieldDef { kind: StreamKind::Set(schema), .. }) = field {
                let empty = StreamSet::new(schema);
                let local = self.get_set(tag).unwrap_or(&empty);
                let base_sub = base.get_set(tag).unwrap_or(&empty);
                if payload.is_empty() {
                    if local == base_sub || local.is_empty() {
                        merged.values.remove(&tag);
                        continue;
                    }
                    return Ok(MergeResult::ConflictAt(name));
                }
                match local.twm(payload, base_sub)? {
                    MergeResult::Merged(sub) => merged.set(tag, StreamValue::Set(sub)),
                    MergeResult::ConflictAt(inner) => {
                        return Ok(MergeResult::ConflictAt(format!("{}.{}", name, inner)));
                    }
                }
                continue;
            }

            let new_val = if payload.is_empty() {
                None
            } else {
                Some(match field {
                    Some(f) => StreamValue::decode(f.kind, payload, f.name)?,
                    None => StreamValue::Unknown(payload.to_vec()),
                })
            };
            let is_mtime = matches!(field.map(|f| f.kind), Some(StreamKind::Mtime));
            let local = self.get(tag);

            if is_mtime || local == base.get(tag) {
                match new_val {
                    Some(v) => merged.set(tag, v),
                    None => {
                        merged.values.remove(&tag);
                    }
                }
            } else if local != new_val.as_ref() {
                return Ok(MergeResult::ConflictAt(name));
            }
        }
        Ok(MergeResult::Merged(merged))
    }
}

impl PartialEq for StreamSet {
    fn eq(&self, other: &Self) -> bool {
        self.freeze() == other.freeze()
    }
}

impl Eq for StreamSet {}

impl fmt::Debug for StreamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (tag, value) in &self.values {
            let name = self
                .schema
                .field(*tag)
                .map(|d| d.name.to_string())
                .unwrap_or_else(|| format!("tag{}", tag));
            map.entry(&name, value);
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static INNER: Schema = Schema {
        name: "inner",
        fields: &[
            FieldDef { tag: 1, name: "perms", kind: StreamKind::U16 },
            FieldDef { tag: 2, name: "mtime", kind: StreamKind::Mtime },
            FieldDef { tag: 3, name: "owner", kind: StreamKind::Bytes },
        ],
    };

    static OUTER: Schema = Schema {
        name: "outer",
        fields: &[
            FieldDef { tag: 1, name: "size", kind: StreamKind::U64 },
            FieldDef { tag: 2, name: "inode", kind: StreamKind::Set(&INNER) },
            FieldDef { tag: 3, name: "tags", kind: StreamKind::StrSet },
        ],
    };

    fn sample() -> StreamSet {
        let mut s = StreamSet::new(&OUTER);
        s.set(1, StreamValue::U64(42));
        let inode = s.get_set_mut(2).unwrap();
        inode.set(1, StreamValue::U16(0o644));
        inode.set(2, StreamValue::Mtime(1000));
        inode.set(3, StreamValue::Bytes(b"root".to_vec()));
        s.set(3, StreamValue::StrSet(["shlib".to_string()].into_iter().collect()));
        s
    }

    #[test]
    fn test_freeze_thaw_and_unknown_tags() {
        let s = sample();
        let mut frozen = s.freeze();
        let back = StreamSet::thaw(&OUTER, &frozen).unwrap();
        assert_eq!(back, s);

        // append a frame with a tag the schema does not know
        write_frame(&mut frozen, 200, b"future").unwrap();
        let with_unknown = StreamSet::thaw(&OUTER, &frozen).unwrap();
        assert_eq!(with_unknown.unknown_tags(), vec![200]);
        assert_eq!(with_unknown.freeze(), frozen);
    }

    #[test]
    fn test_skip_set_omits_nested_field() {
        let a = sample();
        let mut b = sample();
        b.get_set_mut(2).unwrap().set(2, StreamValue::Mtime(5000));
        let skip = SkipSet::new().with(&[2, 2]);
        assert_ne!(a.freeze(), b.freeze());
        assert_eq!(a.freeze_with(&skip), b.freeze_with(&skip));
    }

    #[test]
    fn test_empty_values_are_absent() {
        let mut s = StreamSet::new(&OUTER);
        s.set(3, StreamValue::StrSet(BTreeSet::new()));
        s.get_set_mut(2).unwrap();
        assert!(s.is_empty());
        assert!(s.freeze().is_empty());
        assert_eq!(s, StreamSet::new(&OUTER));
    }

    #[test]
    fn test_diff_and_apply() {
        let old = sample();
        let mut new = sample();
        new.set(1, StreamValue::U64(43));
        new.get_set_mut(2).unwrap().remove(3);
        new.set(3, StreamValue::StrSet(BTreeSet::new()));

        assert!(old.diff(&old).is_none());
        let diff = new.diff(&old).unwrap();
        let mut patched = old.clone();
        patched.apply_diff(&diff).unwrap();
        assert_eq!(patched, new);
    }

    #[test]
    fn test_twm_takes_diff_when_local_is_base() {
        let base = sample();
        let mut new = sample();
        new.get_set_mut(2).unwrap().set(1, StreamValue::U16(0o755));
        let diff = new.diff(&base).unwrap();

        match base.twm(&diff, &base).unwrap() {
            MergeResult::Merged(m) => assert_eq!(m, new),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_twm_keeps_unrelated_local_change() {
        let base = sample();
        let mut new = sample();
        new.set(1, StreamValue::U64(99));
        let mut local = sample();
        local.get_set_mut(2).unwrap().set(3, StreamValue::Bytes(b"daemon".to_vec()));

        let diff = new.diff(&base).unwrap();
        let MergeResult::Merged(m) = local.twm(&diff, &base).unwrap() else {
            panic!("expected merge");
        };
        assert_eq!(m.get_u64(1), Some(99));
        assert_eq!(m.get_set(2).unwrap().get_str(3), Some("daemon"));
    }

    #[test]
    fn test_twm_conflict_and_mtime_never_conflicts() {
        let base = sample();
        let mut new = sample();
        new.get_set_mut(2).unwrap().set(1, StreamValue::U16(0o600));
        new.get_set_mut(2).unwrap().set(2, StreamValue::Mtime(3000));
        let mut local = sample();
        local.get_set_mut(2).unwrap().set(1, StreamValue::U16(0o640));
        let diff = new.diff(&base).unwrap();
        assert_eq!(
            local.twm(&diff, &base).unwrap(),
            MergeResult::ConflictAt("inode.perms".to_string())
        );

        // only mtime differs on both sides: the diff wins without conflict
        let mut new = sample();
        new.get_set_mut(2).unwrap().set(2, StreamValue::Mtime(3000));
        let mut local = sample();
        local.get_set_mut(2).unwrap().set(2, StreamValue::Mtime(2000));
        let diff = new.diff(&base).unwrap();
        let MergeResult::Merged(m) = local.twm(&diff, &base).unwrap() else {
            panic!("expected merge");
        };
        assert_eq!(m.get_set(2).unwrap().get_u32(2), Some(3000));
    }

    #[test]
    fn test_thaw_rejects_bad_payload() {
        let mut data = Vec::new();
        write_frame(&mut data, 1, b"abc").unwrap();
        assert!(StreamSet::thaw(&OUTER, &data).is_err());
    }
}
