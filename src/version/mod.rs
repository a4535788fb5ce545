// src/version/mod.rs

//! Version algebra for troves
//!
//! A [`Version`] is a [`Branch`] plus a trailing [`Revision`] plus one
//! timestamp per label on the branch. Two forms exist:
//!
//! - the string form omits timestamps: `/a@b:c//d@e:f/1.0-1-1`
//! - the frozen form embeds them: `1700000000,1700000100:/a@b:c//d@e:f/1.0-1-1`
//!
//! Equality looks only at the string form. Ordering is by timestamp and is
//! exposed through [`Version::cmp_timestamps`] rather than `Ord`, because
//! equal versions may still carry different timestamps.

mod branch;
mod revision;

pub use branch::{Branch, BranchNode};
pub use revision::{Revision, SerialNumber};

use crate::error::{Error, Result};
use crate::label::Label;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Version {
    branch: Branch,
    revision: Revision,
    /// One per label, or empty when the version came from a string
    timestamps: Vec<u32>,
}

/// Result of [`Version::create_branch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branched {
    Branch(Branch),
    Version(Version),
}

impl Version {
    pub fn new(branch: Branch, revision: Revision) -> Self {
        Self {
            branch,
            revision,
            timestamps: Vec::new(),
        }
    }

    /// Parse the string form (no timestamps)
    pub fn parse(s: &str) -> Result<Self> {
        let (nodes, trailing) = branch::parse_segments(s)?;
        let revision = trailing
            .ok_or_else(|| Error::VersionParse(format!("'{}' has no trailing revision", s)))?;
        Ok(Self::new(Branch::from_nodes(nodes)?, revision))
    }

    /// Parse the frozen form; the plain string form is accepted as well
    pub fn thaw(s: &str) -> Result<Self> {
        let Some((stamps, rest)) = s.split_once(':').filter(|(head, _)| !head.starts_with('/')) else {
            return Self::parse(s);
        };
        let timestamps = stamps
            .split(',')
            .map(|t| {
                t.parse::<u32>()
                    .map_err(|_| Error::VersionParse(format!("bad timestamp '{}' in '{}'", t, s)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::parse(rest)?.with_timestamps(timestamps)
    }

    /// Frozen form; versions without timestamps freeze to their string form
    pub fn freeze(&self) -> String {
        if self.timestamps.is_empty() {
            return self.as_string();
        }
        let stamps: Vec<String> = self.timestamps.iter().map(|t| t.to_string()).collect();
        format!("{}:{}", stamps.join(","), self.as_string())
    }

    pub fn as_string(&self) -> String {
        format!("{}/{}", self.branch, self.revision)
    }

    /// Attach timestamps, one per label, strictly positive and non-decreasing
    pub fn with_timestamps(mut self, timestamps: Vec<u32>) -> Result<Self> {
        let labels = self.branch.nodes().len();
        if timestamps.len() != labels {
            return Err(Error::VersionParse(format!(
                "{} timestamps given for {} labels in {}",
                timestamps.len(),
                labels,
                self.as_string()
            )));
        }
        if timestamps.iter().any(|t| *t == 0) {
            return Err(Error::VersionParse(format!("zero timestamp in {}", self.as_string())));
        }
        if timestamps.windows(2).any(|w| w[1] < w[0]) {
            return Err(Error::VersionParse(format!(
                "timestamps decrease along the branch of {}",
                self.as_string()
            )));
        }
        self.timestamps = timestamps;
        Ok(self)
    }

    /// Stamp every label with `now`; used for a version built from a string
    pub fn stamped(self, now: u32) -> Result<Self> {
        let n = self.branch.nodes().len();
        self.with_timestamps(vec![now.max(1); n])
    }

    pub fn without_timestamps(&self) -> Self {
        Self::new(self.branch.clone(), self.revision.clone())
    }

    pub fn timestamps(&self) -> &[u32] {
        &self.timestamps
    }

    pub fn has_timestamps(&self) -> bool {
        !self.timestamps.is_empty()
    }

    pub fn trailing_timestamp(&self) -> Option<u32> {
        self.timestamps.last().copied()
    }

    pub fn trailing_revision(&self) -> &Revision {
        &self.revision
    }

    pub fn trailing_label(&self) -> &Label {
        self.branch.label()
    }

    pub fn branch(&self) -> &Branch {
        &self.branch
    }

    pub fn is_shadow(&self) -> bool {
        self.branch.is_shadow()
    }

    pub fn shadow_depth(&self) -> usize {
        self.branch.depth()
    }

    /// Whether the version's branch passes through the label
    pub fn on_label(&self, label: &Label) -> bool {
        self.branch.has_label(label)
    }

    /// Copy of this version onto a shadow of `label`
    pub fn create_shadow(&self, label: &Label) -> Result<Version> {
        self.create_shadow_at(label, now_timestamp())
    }

    /// As [`Version::create_shadow`] with an explicit clock
    pub fn create_shadow_at(&self, label: &Label, now: u32) -> Result<Version> {
        let branch = self.branch.with_node(BranchNode::Shadow(label.clone()))?;
        Ok(Version {
            branch,
            revision: self.revision.clone(),
            timestamps: self.extended_timestamps(now),
        })
    }

    /// Branch off this version onto `label`
    ///
    /// With `with_ver_rel` the result is a version on the new branch that
    /// carries this revision; otherwise only the new branch is returned.
    pub fn create_branch(&self, label: &Label, with_ver_rel: bool) -> Result<Branched> {
        self.create_branch_at(label, with_ver_rel, now_timestamp())
    }

    pub fn create_branch_at(&self, label: &Label, with_ver_rel: bool, now: u32) -> Result<Branched> {
        let branch = self.branch.with_node(BranchNode::Branch {
            parent: self.revision.clone(),
            label: label.clone(),
        })?;
        if !with_ver_rel {
            return Ok(Branched::Branch(branch));
        }
        Ok(Branched::Version(Version {
            branch,
            revision: self.revision.clone(),
            timestamps: self.extended_timestamps(now),
        }))
    }

    fn extended_timestamps(&self, now: u32) -> Vec<u32> {
        match self.timestamps.iter().max() {
            Some(&max) => {
                let mut stamps = self.timestamps.clone();
                stamps.push(now.max(max.saturating_add(1)));
                stamps
            }
            None => Vec::new(),
        }
    }

    /// The version this one was shadowed or branched from
    pub fn parent_version(&self) -> Option<Version> {
        let parent_branch = self.branch.parent_branch()?;
        let revision = match self.branch.nodes().last()? {
            BranchNode::Branch { parent, .. } => parent.clone(),
            _ => self.revision.clone(),
        };
        let mut timestamps = self.timestamps.clone();
        timestamps.pop();
        Some(Version {
            branch: parent_branch,
            revision,
            timestamps,
        })
    }

    /// A new source revision of this version on the same branch
    pub fn increment_source(&self, now: u32) -> Version {
        self.successor(self.revision.increment_source(self.shadow_depth()), now)
    }

    /// A new build of this source revision on the same branch
    pub fn increment_build(&self, now: u32) -> Version {
        self.successor(self.revision.increment_build(self.shadow_depth()), now)
    }

    fn successor(&self, revision: Revision, now: u32) -> Version {
        let mut timestamps = self.timestamps.clone();
        if let Some(last) = timestamps.last_mut() {
            *last = now.max(last.saturating_add(1));
        }
        Version {
            branch: self.branch.clone(),
            revision,
            timestamps,
        }
    }

    /// Total timestamp order: trailing timestamp, then the whole list, then string form
    pub fn cmp_timestamps(&self, other: &Version) -> Ordering {
        self.trailing_timestamp()
            .cmp(&other.trailing_timestamp())
            .then_with(|| self.timestamps.cmp(&other.timestamps))
            .then_with(|| self.as_string().cmp(&other.as_string()))
    }

    /// `self < other` in timestamp order
    pub fn is_before(&self, other: &Version) -> bool {
        self.cmp_timestamps(other) == Ordering::Less
    }

    pub fn is_after(&self, other: &Version) -> bool {
        self.cmp_timestamps(other) == Ordering::Greater
    }
}

/// Seconds since the epoch clamped into the 32-bit timestamp range
pub fn now_timestamp() -> u32 {
    u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX)
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.branch == other.branch && self.revision == other.revision
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.revision.hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.revision)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Version::thaw(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.freeze())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::thaw(&s).map_err(serde::de::Error::custom)
    }
}
