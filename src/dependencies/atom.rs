// src/dependencies/atom.rs

//! Dependency atoms: a name plus a flag → sense map

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// How strongly a flag is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sense {
    Required,
    Preferred,
    PreferNot,
    Disallowed,
}

impl Sense {
    pub fn prefix(&self) -> &'static str {
        match self {
            Sense::Required => "",
            Sense::Preferred => "~",
            Sense::PreferNot => "~!",
            Sense::Disallowed => "!",
        }
    }

    /// Strong senses are hard constraints, weak ones are preferences
    pub fn is_strong(&self) -> bool {
        matches!(self, Sense::Required | Sense::Disallowed)
    }

    /// Preferred → Required, PreferNot → Disallowed
    pub fn to_strong(self) -> Self {
        match self {
            Sense::Preferred => Sense::Required,
            Sense::PreferNot => Sense::Disallowed,
            strong => strong,
        }
    }

    /// Split a prefixed flag such as `~!debug` into its sense and name
    pub fn split_flag(flag: &str) -> (Sense, &str) {
        if let Some(rest) = flag.strip_prefix("~!") {
            (Sense::PreferNot, rest)
        } else if let Some(rest) = flag.strip_prefix('~') {
            (Sense::Preferred, rest)
        } else if let Some(rest) = flag.strip_prefix('!') {
            (Sense::Disallowed, rest)
        } else {
            (Sense::Required, flag)
        }
    }
}

/// A single dependency: a name and its flags
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
    pub name: String,
    pub flags: BTreeMap<String, Sense>,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: BTreeMap::new(),
        }
    }

    /// Builder-style flag addition
    pub fn with_flag(mut self, flag: impl Into<String>, sense: Sense) -> Self {
        self.flags.insert(flag.into(), sense);
        self
    }

    /// Flags with sense `Required`
    pub fn required_flags(&self) -> impl Iterator<Item = &str> {
        self.flags
            .iter()
            .filter(|(_, s)| **s == Sense::Required)
            .map(|(f, _)| f.as_str())
    }

    /// Whether this (providing) atom covers every required flag of `required`
    pub fn satisfies(&self, required: &Dependency) -> bool {
        required.required_flags().all(|flag| {
            matches!(self.flags.get(flag), Some(sense) if *sense != Sense::Disallowed)
        })
    }

    pub fn to_strong(&self) -> Self {
        Self {
            name: self.name.clone(),
            flags: self.flags.iter().map(|(f, s)| (f.clone(), s.to_strong())).collect(),
        }
    }

    /// `name[:flag...]` with `:` doubled inside names and flags
    pub fn freeze(&self) -> String {
        let mut out = escape(&self.name);
        for (flag, sense) in &self.flags {
            out.push(':');
            out.push_str(sense.prefix());
            out.push_str(&escape(flag));
        }
        out
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        let mut parts = split_escaped(frozen).into_iter();
        let name = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::ParseError(format!("empty dependency name in '{}'", frozen)))?;
        let mut dep = Dependency::new(name);
        for part in parts {
            let (sense, flag) = Sense::split_flag(&part);
            if flag.is_empty() {
                return Err(Error::ParseError(format!("empty flag in '{}'", frozen)));
            }
            dep.flags.insert(flag.to_string(), sense);
        }
        Ok(dep)
    }

    /// Parse the text form `name(flag ~flag !flag)`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, flags) = match s.find('(') {
            Some(open) => {
                let inner = s[open + 1..]
                    .strip_suffix(')')
                    .ok_or_else(|| Error::ParseError(format!("unbalanced '(' in '{}'", s)))?;
                (&s[..open], Some(inner))
            }
            None => (s, None),
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(Error::ParseError(format!("bad dependency name in '{}'", s)));
        }
        let mut dep = Dependency::new(name);
        for flag in flags.into_iter().flat_map(|f| f.split(|c: char| c.is_whitespace() || c == ',')) {
            if flag.is_empty() {
                continue;
            }
            let (sense, flag) = Sense::split_flag(flag);
            dep.flags.insert(flag.to_string(), sense);
        }
        Ok(dep)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.flags.is_empty() {
            let flags: Vec<String> = self
                .flags
                .iter()
                .map(|(flag, sense)| format!("{}{}", sense.prefix(), flag))
                .collect();
            write!(f, "({})", flags.join(" "))?;
        }
        Ok(())
    }
}

fn escape(s: &str) -> String {
    s.replace(':', "::")
}

/// Split on single `:` while treating `::` as a literal colon
fn split_escaped(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ':' {
            if chars.peek() == Some(&':') {
                chars.next();
                current.push(':');
            } else {
                parts.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}
