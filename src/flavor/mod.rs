// src/flavor/mod.rs
//! Flavors: the build configuration a trove was produced under
//!
//! A [`Flavor`] is a [`DependencySet`] restricted in practice to the `use`
//! and `is` classes. Text syntax follows the historical Conary form:
//!
//! - `ssl,~!debug is: x86(sse2,cmov) x86_64`
//! - `use: ~!foo, is: x86(sse2)` (an explicit `use:` prefix is accepted)
//! - `[ssl, !debug, is: x86_64]` (bracketed form is accepted)
//!
//! There is no process-wide flavor. Callers thread a [`FlavorContext`]
//! through resolution and lookup instead.

use crate::dependencies::{DepClass, Dependency, DependencySet, MergeType, Sense};
use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Flavor(DependencySet);

impl Flavor {
    pub fn empty() -> Self {
        Self(DependencySet::new())
    }

    pub fn from_deps(deps: DependencySet) -> Self {
        Self(deps)
    }

    pub fn deps(&self) -> &DependencySet {
        &self.0
    }

    pub fn into_deps(self) -> DependencySet {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the flavor text form
    pub fn parse(s: &str) -> Result<Self> {
        let mut s = s.trim();
        if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            s = inner.trim();
        }
        if s.is_empty() {
            return Ok(Self::empty());
        }

        let (use_part, is_part) = match find_is_marker(s) {
            Some(pos) => (&s[..pos], Some(&s[pos + 3..])),
            None => (s, None),
        };

        let mut deps = DependencySet::new();

        let use_part = use_part.trim().trim_end_matches(',').trim();
        let use_part = use_part.strip_prefix("use:").unwrap_or(use_part);
        let mut use_dep = Dependency::new("use");
        for flag in use_part.split(|c: char| c == ',' || c.is_whitespace()) {
            if flag.is_empty() {
                continue;
            }
            let (sense, name) = Sense::split_flag(flag);
            validate_flag(name, s)?;
            use_dep.flags.insert(name.to_string(), sense);
        }
        if !use_dep.flags.is_empty() {
            deps.add(DepClass::Use, use_dep);
        }

        if let Some(is_part) = is_part {
            let arches = split_arches(is_part, s)?;
            if arches.is_empty() {
                return Err(Error::FlavorParse(format!("empty 'is:' section in '{}'", s)));
            }
            for arch in arches {
                deps.add(DepClass::InstructionSet, arch);
            }
        }

        Ok(Self(deps))
    }

    pub fn freeze(&self) -> String {
        self.0.freeze()
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        Ok(Self(DependencySet::thaw(frozen)?))
    }

    /// Score `trove` with `self` as the preference flavor
    pub fn score(&self, trove: &Flavor) -> Option<i32> {
        self.0.score(&trove.0)
    }

    /// Whether `trove` is usable under this preference at all
    pub fn satisfies(&self, trove: &Flavor) -> bool {
        self.score(trove).is_some()
    }

    pub fn strongly_satisfies(&self, trove: &Flavor) -> bool {
        self.0.strongly_satisfies(&trove.0)
    }

    pub fn merge(&mut self, other: &Flavor, merge_type: MergeType) -> Result<()> {
        self.0.merge(&other.0, merge_type)
    }

    /// Architectures named in the `is:` section
    pub fn architectures(&self) -> Vec<&str> {
        self.0
            .class_atoms(DepClass::InstructionSet)
            .map(|d| d.name.as_str())
            .collect()
    }
}

/// Position of an `is:` that starts a word
fn find_is_marker(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut start = 0;
    while let Some(off) = s[start..].find("is:") {
        let pos = start + off;
        let boundary = pos == 0 || matches!(bytes[pos - 1], b' ' | b',' | b'\t');
        if boundary {
            return Some(pos);
        }
        start = pos + 3;
    }
    None
}

fn validate_flag(name: &str, whole: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '+'))
    {
        return Err(Error::FlavorParse(format!("bad flag '{}' in '{}'", name, whole)));
    }
    Ok(())
}

/// `x86(sse2,cmov) x86_64` → atoms
fn split_arches(s: &str, whole: &str) -> Result<Vec<Dependency>> {
    let mut arches = Vec::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let end = rest
            .find(|c: char| c == '(' || c == ',' || c.is_whitespace())
            .unwrap_or(rest.len());
        let name = &rest[..end];
        validate_flag(name, whole)?;
        let mut arch = Dependency::new(name);
        rest = &rest[end..];
        if let Some(after) = rest.strip_prefix('(') {
            let close = after
                .find(')')
                .ok_or_else(|| Error::FlavorParse(format!("unbalanced '(' in '{}'", whole)))?;
            for flag in after[..close].split(|c: char| c == ',' || c.is_whitespace()) {
                if flag.is_empty() {
                    continue;
                }
                let (sense, flag) = Sense::split_flag(flag);
                validate_flag(flag, whole)?;
                arch.flags.insert(flag.to_string(), sense);
            }
            rest = &after[close + 1..];
        }
        arches.push(arch);
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }
    Ok(arches)
}

fn format_flags(dep: &Dependency) -> String {
    let flags: Vec<String> = dep
        .flags
        .iter()
        .map(|(flag, sense)| format!("{}{}", sense.prefix(), flag))
        .collect();
    flags.join(",")
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let use_flags: Vec<String> = self.0.class_atoms(DepClass::Use).map(format_flags).collect();
        let arches: Vec<String> = self
            .0
            .class_atoms(DepClass::InstructionSet)
            .map(|arch| {
                if arch.flags.is_empty() {
                    arch.name.clone()
                } else {
                    format!("{}({})", arch.name, format_flags(arch))
                }
            })
            .collect();

        let mut out = use_flags.join(",");
        if !arches.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str("is: ");
            out.push_str(&arches.join(" "));
        }
        f.write_str(&out)
    }
}

impl FromStr for Flavor {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Flavor::parse(s)
    }
}

impl Serialize for Flavor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.freeze())
    }
}

impl<'de> Deserialize<'de> for Flavor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Flavor::thaw(&s).map_err(serde::de::Error::custom)
    }
}

/// The build/install flavor preferences in effect for one operation
///
/// Holds an ordered stack of preference flavors; the first one that
/// accepts any candidate decides.
#[derive(Debug, Clone, Default)]
pub struct FlavorContext {
    stack: Vec<Flavor>,
}

impl FlavorContext {
    pub fn new(stack: Vec<Flavor>) -> Self {
        Self { stack }
    }

    pub fn single(flavor: Flavor) -> Self {
        Self { stack: vec![flavor] }
    }

    pub fn parse_stack<S: AsRef<str>>(flavors: &[S]) -> Result<Self> {
        let stack = flavors
            .iter()
            .map(|f| Flavor::parse(f.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { stack })
    }

    pub fn stack(&self) -> &[Flavor] {
        &self.stack
    }

    /// The first preference flavor, or the empty flavor
    pub fn primary(&self) -> Flavor {
        self.stack.first().cloned().unwrap_or_default()
    }

    /// Merge an installed trove's flavor into every preference; the
    /// affinity flavor's senses win where both speak
    pub fn with_affinity(&self, affinity: &Flavor) -> Result<FlavorContext> {
        let stack = if self.stack.is_empty() {
            vec![affinity.clone()]
        } else {
            self.stack
                .iter()
                .map(|pref| {
                    let mut merged = affinity.clone();
                    merged.merge(pref, MergeType::Preference)?;
                    Ok(merged)
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(FlavorContext { stack })
    }

    /// Best score of `trove` under the first preference that accepts it,
    /// paired with that preference's index
    pub fn score(&self, trove: &Flavor) -> Option<(usize, i32)> {
        if self.stack.is_empty() {
            return Some((0, 0));
        }
        self.stack
            .iter()
            .enumerate()
            .find_map(|(i, pref)| pref.score(trove).map(|s| (i, s)))
    }

    /// Pick the best candidate: lowest preference index, then highest score;
    /// ties keep the earlier candidate
    pub fn select_best<'a, T>(&self, candidates: &'a [(Flavor, T)]) -> Option<&'a T> {
        let mut best: Option<((usize, i32), &T)> = None;
        for (flavor, item) in candidates {
            let Some(score) = self.score(flavor) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(((idx, s), _)) => score.0 < *idx || (score.0 == *idx && score.1 > *s),
            };
            if better {
                best = Some((score, item));
            }
        }
        best.map(|(_, item)| item)
    }
}
