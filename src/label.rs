// src/label.rs

//! Repository naming authorities
//!
//! A label has the form `host@namespace:tag`. The host selects which
//! repository answers for the label (see `repositoryMap` in the config),
//! the namespace and tag name a line of development inside it.
//!
//! Examples:
//! - `conary.example.com@rpl:devel`
//! - `contrib.example.com@rpl:2-qa`
//!
//! A [`LabelPath`] is the ordered list of labels searched when finding or
//! resolving troves. Earlier labels take precedence.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A `host@namespace:tag` label
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub host: String,
    pub namespace: String,
    pub tag: String,
}

/// Errors that can occur when parsing a label
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelParseError {
    #[error("missing '@' in label: {0}")]
    MissingAt(String),
    #[error("missing ':' in label: {0}")]
    MissingColon(String),
    #[error("empty component in label: {0}")]
    EmptyComponent(String),
    #[error("invalid character in label: {0}")]
    InvalidCharacter(String),
}

fn valid_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | '~')
}

impl Label {
    pub fn new(host: impl Into<String>, namespace: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            tag: tag.into(),
        }
    }

    /// Parse `host@namespace:tag`
    pub fn parse(s: &str) -> Result<Self, LabelParseError> {
        let (host, rest) = s
            .split_once('@')
            .ok_or_else(|| LabelParseError::MissingAt(s.to_string()))?;
        let (namespace, tag) = rest
            .split_once(':')
            .ok_or_else(|| LabelParseError::MissingColon(s.to_string()))?;

        if host.is_empty() || namespace.is_empty() || tag.is_empty() {
            return Err(LabelParseError::EmptyComponent(s.to_string()));
        }

        for part in [host, namespace, tag] {
            if !part.chars().all(valid_label_char) {
                return Err(LabelParseError::InvalidCharacter(s.to_string()));
            }
        }

        Ok(Self::new(host, namespace, tag))
    }

    /// Labels served by the same repository
    pub fn same_host(&self, other: &Label) -> bool {
        self.host == other.host
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.host, self.namespace, self.tag)
    }
}

impl FromStr for Label {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::parse(s)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Label::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Ordered search path of labels, highest precedence first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelPath {
    labels: Vec<Label>,
}

impl LabelPath {
    pub fn new() -> Self {
        Self { labels: Vec::new() }
    }

    /// Build from labels, dropping later duplicates
    pub fn from_labels(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut path = Self::new();
        for label in labels {
            path.push(label);
        }
        path
    }

    /// Append a label with the lowest precedence; duplicates are ignored
    pub fn push(&mut self, label: Label) {
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.labels.iter()
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.labels.contains(label)
    }

    /// Position of a label in the path (0 = highest precedence)
    pub fn precedence(&self, label: &Label) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Parse a whitespace or comma separated list of labels
    pub fn parse(s: &str) -> Result<Self, LabelParseError> {
        let labels = s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|part| !part.is_empty())
            .map(Label::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_labels(labels))
    }
}

impl fmt::Display for LabelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.labels.iter().map(|l| l.to_string()).collect();
        write!(f, "{}", labels.join(" "))
    }
}

impl<'a> IntoIterator for &'a LabelPath {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.labels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parse() {
        let label = Label::parse("conary.example.com@rpl:devel").unwrap();
        assert_eq!(label.host, "conary.example.com");
        assert_eq!(label.namespace, "rpl");
        assert_eq!(label.tag, "devel");
        assert_eq!(label.to_string(), "conary.example.com@rpl:devel");
    }

    #[test]
    fn test_label_parse_errors() {
        assert_eq!(
            Label::parse("missing-at"),
            Err(LabelParseError::MissingAt("missing-at".into()))
        );
        assert!(matches!(Label::parse("host@ns"), Err(LabelParseError::MissingColon(_))));
        assert!(matches!(Label::parse("@ns:tag"), Err(LabelParseError::EmptyComponent(_))));
        assert!(matches!(Label::parse("host@ns:"), Err(LabelParseError::EmptyComponent(_))));
        assert!(matches!(Label::parse("a/b@ns:tag"), Err(LabelParseError::InvalidCharacter(_))));
        assert!(matches!(Label::parse("a@b:c:d"), Err(LabelParseError::InvalidCharacter(_))));
    }

    #[test]
    fn test_label_path_precedence_and_dedup() {
        let path = LabelPath::parse("a@b:c, d@e:f a@b:c").unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path.precedence(&Label::parse("a@b:c").unwrap()), Some(0));
        assert_eq!(path.precedence(&Label::parse("d@e:f").unwrap()), Some(1));
        assert_eq!(path.to_string(), "a@b:c d@e:f");
    }

    #[test]
    fn test_label_serde() {
        let label = Label::parse("a@b:c").unwrap();
        let json = serde_json::to_string(&label).unwrap();
        assert_eq!(json, "\"a@b:c\"");
        let back: Label = serde_json::from_str(&json).unwrap();
        assert_eq!(back, label);
        assert!(serde_json::from_str::<Label>("\"bogus\"").is_err());
    }
}
