// src/version/revision.rs

//! Revisions: `upstream-source[-build]`

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A dotted counter such as `1` or `1.2`
///
/// Each extra component is a counter that started on a shadow or branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(Vec<u32>);

impl SerialNumber {
    pub fn new(parts: Vec<u32>) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::VersionParse("empty counter".to_string()));
        }
        Ok(Self(parts))
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }

    /// Increment the counter at the given branch depth
    ///
    /// Depth 0 is the root label; a counter shorter than `depth + 1`
    /// components is padded with zeros first, a longer one is truncated.
    pub fn incremented(&self, depth: usize) -> Self {
        let want = depth + 1;
        let mut parts = self.0.clone();
        parts.resize(want, 0);
        if let Some(last) = parts.last_mut() {
            *last += 1;
        }
        Self(parts)
    }

    /// A fresh counter for the given depth (`1`, `0.1`, `0.0.1`, ...)
    pub fn first(depth: usize) -> Self {
        let mut parts = vec![0; depth + 1];
        parts[depth] = 1;
        Self(parts)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

impl FromStr for SerialNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split('.')
            .map(|p| {
                if p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()) {
                    return Err(Error::VersionParse(format!("invalid counter '{}'", s)));
                }
                p.parse::<u32>()
                    .map_err(|_| Error::VersionParse(format!("counter out of range '{}'", s)))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(parts)
    }
}

/// The `upstream-source[-build]` part of a version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    /// Upstream version string, e.g. `1.0`
    pub upstream: String,
    /// Source counter, bumped for every commit of the same upstream source
    pub source: SerialNumber,
    /// Build counter; absent on source troves
    pub build: Option<SerialNumber>,
}

impl Revision {
    pub fn new(upstream: impl Into<String>, source: SerialNumber, build: Option<SerialNumber>) -> Result<Self> {
        let upstream = upstream.into();
        validate_upstream(&upstream)?;
        Ok(Self {
            upstream,
            source,
            build,
        })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('-');
        let upstream = parts.next().unwrap_or_default();
        let source = parts
            .next()
            .ok_or_else(|| Error::VersionParse(format!("revision '{}' lacks a source count", s)))?;
        let build = parts.next();
        if parts.next().is_some() {
            return Err(Error::VersionParse(format!("too many '-' in revision '{}'", s)));
        }

        let source: SerialNumber = source.parse()?;
        let build = build.map(str::parse::<SerialNumber>).transpose()?;
        Self::new(upstream, source, build)
    }

    /// Next source revision at the given shadow/branch depth; drops the build count
    pub fn increment_source(&self, depth: usize) -> Self {
        Self {
            upstream: self.upstream.clone(),
            source: self.source.incremented(depth),
            build: None,
        }
    }

    /// Next build of the same source
    pub fn increment_build(&self, depth: usize) -> Self {
        let build = match &self.build {
            Some(b) => b.incremented(depth),
            None => SerialNumber::first(depth),
        };
        Self {
            upstream: self.upstream.clone(),
            source: self.source.clone(),
            build: Some(build),
        }
    }
}

fn validate_upstream(upstream: &str) -> Result<()> {
    let first = upstream
        .chars()
        .next()
        .ok_or_else(|| Error::VersionParse("empty upstream version".to_string()))?;
    if !first.is_ascii_alphanumeric() {
        return Err(Error::VersionParse(format!(
            "upstream version '{}' must begin with a letter or digit",
            upstream
        )));
    }
    if upstream
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '-' | '/' | '@' | ':' | ','))
    {
        return Err(Error::VersionParse(format!(
            "invalid character in upstream version '{}'",
            upstream
        )));
    }
    Ok(())
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.upstream, self.source)?;
        if let Some(build) = &self.build {
            write!(f, "-{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Revision::parse(s)
    }
}
