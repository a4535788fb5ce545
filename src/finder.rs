// src/finder.rs

//! Trove finder
//!
//! Turns a user query `name[=versionSpec][[flavor]]` into concrete tuples.
//! The version spec is classified first:
//!
//! | spec | kind |
//! |---|---|
//! | *(none)* | latest on the label path |
//! | `/a@b:c/1.0-1-1` or frozen | exact version |
//! | `/a@b:c` | latest on the branch |
//! | `a@b:c` | latest on the label |
//! | `@b:c` | label path hosts with this namespace and tag |
//! | `:c` | label path hosts and namespaces with this tag |
//! | `a@` | this host with the label path namespaces and tags |
//! | `1.0-1-1` | latest with this revision on the label path |
//! | `1.0` | latest with this upstream version on the label path |
//!
//! Label-like specs may carry a trailing `/revision`.

use crate::dependencies::{DepClass, MergeType};
use crate::error::{Error, Result};
use crate::flavor::{Flavor, FlavorContext};
use crate::label::{Label, LabelPath};
use crate::local::LocalDatabase;
use crate::source::TroveSource;
use crate::trove::TroveTuple;
use crate::version::{Branch, Revision, Version};
use std::collections::BTreeMap;
use tracing::debug;

/// A classified version string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Absent,
    Full(Version),
    Branch(Branch),
    Label { label: Label, revision: Option<String> },
    /// `@namespace:tag`
    BranchName { namespace: String, tag: String, revision: Option<String> },
    /// `:tag`
    Tag { tag: String, revision: Option<String> },
    /// `host@`
    Host { host: String, revision: Option<String> },
    Revision(Revision),
    /// Upstream version only
    TroveVersion(String),
}

impl VersionSpec {
    pub fn classify(spec: Option<&str>) -> Result<Self> {
        let Some(spec) = spec.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(VersionSpec::Absent);
        };

        if spec.starts_with(|c: char| c.is_ascii_digit()) && spec.contains(":/") {
            return Ok(VersionSpec::Full(Version::thaw(spec)?));
        }
        if spec.starts_with('/') {
            return match Version::parse(spec) {
                Ok(version) => Ok(VersionSpec::Full(version)),
                Err(_) => Branch::parse(spec)
                    .map(VersionSpec::Branch)
                    .map_err(|e| Error::TroveNotFound(format!("invalid version '{}': {}", spec, e))),
            };
        }

        let (head, revision) = match spec.split_once('/') {
            Some((_, rest)) if rest.contains('/') => {
                return Err(Error::TroveNotFound(format!("incomplete version string '{}' not allowed", spec)));
            }
            Some((head, rev)) => (head, Some(rev.to_string())),
            None => (spec, None),
        };

        if let Some(rest) = head.strip_prefix('@') {
            let (namespace, tag) = rest
                .split_once(':')
                .filter(|(n, t)| !n.is_empty() && !t.is_empty())
                .ok_or_else(|| Error::TroveNotFound(format!("invalid branch name '{}'", head)))?;
            return Ok(VersionSpec::BranchName {
                namespace: namespace.to_string(),
                tag: tag.to_string(),
                revision,
            });
        }
        if let Some(tag) = head.strip_prefix(':') {
            return Ok(VersionSpec::Tag {
                tag: tag.to_string(),
                revision,
            });
        }
        if let Some(host) = head.strip_suffix('@') {
            return Ok(VersionSpec::Host {
                host: host.to_string(),
                revision,
            });
        }
        if head.contains('@') {
            return Ok(VersionSpec::Label {
                label: Label::parse(head)?,
                revision,
            });
        }
        if revision.is_some() {
            return Err(Error::TroveNotFound(format!("illegal version prefix in '{}'", spec)));
        }
        if spec.contains([' ', ',']) {
            return Err(Error::ParseError(format!("illegal version or revision '{}'", spec)));
        }
        if spec.contains('-') {
            return Revision::parse(spec)
                .map(VersionSpec::Revision)
                .map_err(|e| Error::TroveNotFound(e.to_string()));
        }
        Ok(VersionSpec::TroveVersion(spec.to_string()))
    }

    fn revision_filter(&self) -> Option<&str> {
        match self {
            VersionSpec::Label { revision, .. }
            | VersionSpec::BranchName { revision, .. }
            | VersionSpec::Tag { revision, .. }
            | VersionSpec::Host { revision, .. } => revision.as_deref(),
            _ => None,
        }
    }

    /// Labels to search, or `None` when the spec pins the branch itself
    fn search_path(&self, path: &LabelPath) -> Option<LabelPath> {
        match self {
            VersionSpec::Full(_) | VersionSpec::Branch(_) => None,
            VersionSpec::Label { label, .. } => Some(LabelPath::from_labels([label.clone()])),
            VersionSpec::BranchName { namespace, tag, .. } => Some(LabelPath::from_labels(
                path.iter().map(|l| Label::new(l.host.clone(), namespace.clone(), tag.clone())),
            )),
            VersionSpec::Tag { tag, .. } => Some(LabelPath::from_labels(
                path.iter().map(|l| Label::new(l.host.clone(), l.namespace.clone(), tag.clone())),
            )),
            VersionSpec::Host { host, .. } => Some(LabelPath::from_labels(
                path.iter().map(|l| Label::new(host.clone(), l.namespace.clone(), l.tag.clone())),
            )),
            VersionSpec::Absent | VersionSpec::Revision(_) | VersionSpec::TroveVersion(_) => Some(path.clone()),
        }
    }

    /// Whether `version` fits the spec, ignoring which label searches it
    pub fn matches(&self, version: &Version) -> bool {
        let label = version.trailing_label();
        let fits = match self {
            VersionSpec::Absent => true,
            VersionSpec::Full(full) => full == version,
            VersionSpec::Branch(branch) => version.branch() == branch,
            VersionSpec::Label { label: l, .. } => label == l,
            VersionSpec::BranchName { namespace, tag, .. } => &label.namespace == namespace && &label.tag == tag,
            VersionSpec::Tag { tag, .. } => &label.tag == tag,
            VersionSpec::Host { host, .. } => &label.host == host,
            VersionSpec::Revision(rev) => revision_matches(rev, version.trailing_revision()),
            VersionSpec::TroveVersion(upstream) => &version.trailing_revision().upstream == upstream,
        };
        fits && self.revision_filter().is_none_or(|rev| revision_text_matches(rev, version))
    }
}

/// A revision without a build count matches every build of that source
fn revision_matches(wanted: &Revision, have: &Revision) -> bool {
    match &wanted.build {
        Some(_) => wanted == have,
        None => wanted.upstream == have.upstream && wanted.source == have.source,
    }
}

fn revision_text_matches(text: &str, version: &Version) -> bool {
    match Revision::parse(text) {
        Ok(rev) => revision_matches(&rev, version.trailing_revision()),
        Err(_) => version.trailing_revision().upstream == text,
    }
}

/// Split `name[=version][[flavor]]`
pub fn parse_trove_spec(spec: &str) -> Result<(String, Option<String>, Option<Flavor>)> {
    let (rest, flavor) = match spec.find('[') {
        Some(pos) if spec.ends_with(']') => (&spec[..pos], Some(Flavor::parse(&spec[pos..])?)),
        Some(_) => return Err(Error::ParseError(format!("unterminated flavor in '{}'", spec))),
        None => (spec, None),
    };
    let (name, version) = match rest.split_once('=') {
        Some((name, version)) => (name, Some(version.to_string())),
        None => (rest, None),
    };
    if name.is_empty() {
        return Err(Error::ParseError(format!("trove spec '{}' has no name", spec)));
    }
    Ok((name.to_string(), version, flavor))
}

/// Finds troves in a repository-like source
pub struct TroveFinder<'a, S: TroveSource + ?Sized> {
    source: &'a S,
    label_path: LabelPath,
    flavor: FlavorContext,
    affinity: Vec<TroveTuple>,
}

impl<'a, S: TroveSource + ?Sized> TroveFinder<'a, S> {
    pub fn new(source: &'a S, label_path: LabelPath, flavor: FlavorContext) -> Self {
        Self {
            source,
            label_path,
            flavor,
            affinity: Vec::new(),
        }
    }

    /// Installed troves whose flavors are preferred for the same name
    pub fn with_affinity(mut self, affinity: Vec<TroveTuple>) -> Self {
        self.affinity = affinity;
        self
    }

    /// Flavor preferences for `name`
    ///
    /// A caller flavor overrides each default preference; without one, an
    /// installed trove of the same name pulls the choice toward its flavor.
    fn flavors_for(&self, name: &str, flavor: Option<&Flavor>) -> Result<FlavorContext> {
        if let Some(flavor) = flavor {
            if self.flavor.stack().is_empty() {
                return Ok(FlavorContext::single(flavor.clone()));
            }
            let stack = self
                .flavor
                .stack()
                .iter()
                .map(|pref| override_flavor(pref, flavor))
                .collect::<Result<Vec<_>>>()?;
            return Ok(FlavorContext::new(stack));
        }
        match self.affinity.iter().find(|t| t.name == name) {
            Some(installed) => self.flavor.with_affinity(&installed.flavor),
            None => Ok(self.flavor.clone()),
        }
    }

    /// Tuples for `name=version_spec[flavor]`
    pub fn find(&self, name: &str, version_spec: Option<&str>, flavor: Option<&Flavor>) -> Result<Vec<TroveTuple>> {
        let spec = VersionSpec::classify(version_spec)?;
        let ctx = self.flavors_for(name, flavor)?;
        let candidates: Vec<TroveTuple> = self
            .source
            .versions_of(name)?
            .into_iter()
            .filter(|t| spec.matches(&t.version))
            .filter(|t| ctx.score(&t.flavor).is_some())
            .collect();

        let found = match spec.search_path(&self.label_path) {
            None => latest(&ctx, candidates),
            // an empty path searches wherever the trove lives
            Some(path) if path.is_empty() => latest(&ctx, candidates),
            Some(path) => path
                .iter()
                .map(|label| {
                    latest(
                        &ctx,
                        candidates
                            .iter()
                            .filter(|t| t.version.trailing_label() == label)
                            .cloned()
                            .collect(),
                    )
                })
                .find(|found| !found.is_empty())
                .unwrap_or_default(),
        };

        if found.is_empty() {
            let what = version_spec.map(|v| format!("{}={}", name, v)).unwrap_or_else(|| name.to_string());
            return Err(match spec.search_path(&self.label_path) {
                Some(path) if !path.is_empty() => {
                    Error::TroveNotFound(format!("{} was not found on label(s) {}", what, path))
                }
                _ => Error::TroveNotFound(format!("{} was not found", what)),
            });
        }
        debug!("{} matched {} tuple(s)", name, found.len());
        Ok(found)
    }

    /// Parse and find a `name[=version][[flavor]]` spec
    pub fn find_spec(&self, spec: &str) -> Result<Vec<TroveTuple>> {
        let (name, version, flavor) = parse_trove_spec(spec)?;
        self.find(&name, version.as_deref(), flavor.as_ref())
    }
}

/// `pref` with `caller` laid over it; naming any architecture replaces
/// the preference's architectures
fn override_flavor(pref: &Flavor, caller: &Flavor) -> Result<Flavor> {
    let mut deps = pref.deps().clone();
    if caller.deps().classes().any(|c| c == DepClass::InstructionSet) {
        let arches: Vec<String> = deps
            .class_atoms(DepClass::InstructionSet)
            .map(|d| d.name.clone())
            .collect();
        for arch in arches {
            deps.remove(DepClass::InstructionSet, &arch);
        }
    }
    let mut merged = Flavor::from_deps(deps);
    merged.merge(caller, MergeType::Override)?;
    Ok(merged)
}

/// The newest candidates under the best flavor
///
/// With no preferences, every flavor's newest version is kept. Otherwise
/// the best flavor wins (earliest matching preference, then score) and its
/// newest version is returned.
fn latest(ctx: &FlavorContext, candidates: Vec<TroveTuple>) -> Vec<TroveTuple> {
    if ctx.stack().is_empty() {
        let mut leaves: BTreeMap<String, TroveTuple> = BTreeMap::new();
        for cand in candidates {
            match leaves.get(&cand.flavor.freeze()) {
                Some(cur) if !cand.version.is_after(&cur.version) => {}
                _ => {
                    leaves.insert(cand.flavor.freeze(), cand);
                }
            }
        }
        let mut out: Vec<TroveTuple> = leaves.into_values().collect();
        out.sort();
        return out;
    }

    let mut best: Option<((usize, i32), TroveTuple)> = None;
    for cand in candidates {
        let Some(score) = ctx.score(&cand.flavor) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some(((idx, s), cur)) => {
                score.0 < *idx
                    || (score.0 == *idx && score.1 > *s)
                    || (score == (*idx, *s) && cand.version.is_after(&cur.version))
            }
        };
        if better {
            best = Some((score, cand));
        }
    }
    best.map(|(_, t)| vec![t]).unwrap_or_default()
}

/// Installed troves named `name` that fit `version_spec`
///
/// The local database has no label path, so label-like specs match the
/// trailing label's parts directly. Every match is returned.
pub fn find_installed(db: &LocalDatabase, name: &str, version_spec: Option<&str>) -> Result<Vec<TroveTuple>> {
    let spec = VersionSpec::classify(version_spec)?;
    let found: Vec<TroveTuple> = db
        .installed_named(name)?
        .into_iter()
        .filter(|t| spec.matches(&t.version))
        .collect();
    if found.is_empty() {
        let what = version_spec.map(|v| format!("{}={}", name, v)).unwrap_or_else(|| name.to_string());
        return Err(Error::TroveNotFound(format!("{} is not installed", what)));
    }
    Ok(found)
}
