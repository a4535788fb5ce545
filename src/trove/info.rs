// src/trove/info.rs

//! Extensible trove metadata

use super::TroveTuple;
use crate::error::{Error, Result};
use crate::hash::Sha1Digest;
use crate::streams::{FieldDef, Schema, StreamKind, StreamSet, StreamValue};

pub const INFO_SIZE: u8 = 0;
pub const INFO_SOURCE_NAME: u8 = 1;
pub const INFO_BUILD_TIME: u8 = 2;
pub const INFO_CONARY_VERSION: u8 = 3;
pub const INFO_BUILD_REQS: u8 = 4;
pub const INFO_SIGNATURES: u8 = 5;
pub const INFO_METADATA: u8 = 6;
pub const INFO_REDIRECT: u8 = 7;

pub const SIG_SHA1: u8 = 1;
pub const SIG_SHA256: u8 = 2;

static SIGNATURES_SCHEMA: Schema = Schema {
    name: "signatures",
    fields: &[
        FieldDef { tag: SIG_SHA1, name: "sha1", kind: StreamKind::Sha1 },
        FieldDef { tag: SIG_SHA256, name: "sha256", kind: StreamKind::Bytes },
    ],
};

pub static INFO_SCHEMA: Schema = Schema {
    name: "troveInfo",
    fields: &[
        FieldDef { tag: INFO_SIZE, name: "size", kind: StreamKind::U64 },
        FieldDef { tag: INFO_SOURCE_NAME, name: "sourceName", kind: StreamKind::Bytes },
        FieldDef { tag: INFO_BUILD_TIME, name: "buildTime", kind: StreamKind::U64 },
        FieldDef { tag: INFO_CONARY_VERSION, name: "conaryVersion", kind: StreamKind::Bytes },
        FieldDef { tag: INFO_BUILD_REQS, name: "buildReqs", kind: StreamKind::Bytes },
        FieldDef { tag: INFO_SIGNATURES, name: "signatures", kind: StreamKind::Set(&SIGNATURES_SCHEMA) },
        FieldDef { tag: INFO_METADATA, name: "metadata", kind: StreamKind::Bytes },
        FieldDef { tag: INFO_REDIRECT, name: "redirect", kind: StreamKind::U8 },
    ],
};

/// Trove metadata; tags unknown to this build are carried through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TroveInfo {
    streams: StreamSet,
}

impl Default for TroveInfo {
    fn default() -> Self {
        Self {
            streams: StreamSet::new(&INFO_SCHEMA),
        }
    }
}

impl TroveInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_streams(streams: StreamSet) -> Self {
        Self { streams }
    }

    pub(crate) fn streams(&self) -> &StreamSet {
        &self.streams
    }

    pub fn size(&self) -> Option<u64> {
        self.streams.get_u64(INFO_SIZE)
    }

    pub fn set_size(&mut self, size: u64) {
        self.streams.set(INFO_SIZE, StreamValue::U64(size));
    }

    pub fn source_name(&self) -> Option<&str> {
        self.streams.get_str(INFO_SOURCE_NAME)
    }

    pub fn set_source_name(&mut self, name: &str) {
        self.streams.set(INFO_SOURCE_NAME, StreamValue::Bytes(name.as_bytes().to_vec()));
    }

    pub fn build_time(&self) -> Option<u64> {
        self.streams.get_u64(INFO_BUILD_TIME)
    }

    pub fn set_build_time(&mut self, when: u64) {
        self.streams.set(INFO_BUILD_TIME, StreamValue::U64(when));
    }

    pub fn conary_version(&self) -> Option<&str> {
        self.streams.get_str(INFO_CONARY_VERSION)
    }

    pub fn set_conary_version(&mut self, version: &str) {
        self.streams.set(INFO_CONARY_VERSION, StreamValue::Bytes(version.as_bytes().to_vec()));
    }

    pub fn build_reqs(&self) -> Result<Vec<TroveTuple>> {
        let Some(raw) = self.streams.get_str(INFO_BUILD_REQS) else {
            return Ok(Vec::new());
        };
        raw.lines().map(TroveTuple::thaw).collect()
    }

    pub fn set_build_reqs(&mut self, reqs: &[TroveTuple]) {
        let frozen: Vec<String> = reqs.iter().map(TroveTuple::freeze).collect();
        self.streams.set(INFO_BUILD_REQS, StreamValue::Bytes(frozen.join("\n").into_bytes()));
    }

    pub fn metadata(&self) -> Option<&[u8]> {
        self.streams.get_bytes(INFO_METADATA)
    }

    pub fn set_metadata(&mut self, metadata: &[u8]) {
        self.streams.set(INFO_METADATA, StreamValue::Bytes(metadata.to_vec()));
    }

    /// Silent-redirect annotation
    pub fn is_redirect(&self) -> bool {
        self.streams.get_u8(INFO_REDIRECT).unwrap_or(0) != 0
    }

    pub fn set_redirect(&mut self, redirect: bool) {
        if redirect {
            self.streams.set(INFO_REDIRECT, StreamValue::U8(1));
        } else {
            self.streams.remove(INFO_REDIRECT);
        }
    }

    pub fn sha1_digest(&self) -> Option<Sha1Digest> {
        self.streams.get_set(INFO_SIGNATURES)?.get_sha1(SIG_SHA1)
    }

    pub fn sha256_digest(&self) -> Option<&[u8]> {
        self.streams.get_set(INFO_SIGNATURES)?.get_bytes(SIG_SHA256)
    }

    pub(crate) fn set_digests(&mut self, sha1: Sha1Digest, sha256: [u8; 32]) {
        if let Some(sigs) = self.streams.get_set_mut(INFO_SIGNATURES) {
            sigs.set(SIG_SHA1, StreamValue::Sha1(sha1));
            sigs.set(SIG_SHA256, StreamValue::Bytes(sha256.to_vec()));
        }
    }

    pub fn freeze(&self) -> Vec<u8> {
        self.streams.freeze()
    }

    pub fn thaw(data: &[u8]) -> Result<Self> {
        StreamSet::thaw(&INFO_SCHEMA, data)
            .map(Self::from_streams)
            .map_err(|e| Error::ParseError(format!("troveInfo: {}", e)))
    }
}
