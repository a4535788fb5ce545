// src/dependencies/set.rs

//! Dependency sets: class → atoms, with satisfaction, merging and scoring

use super::atom::{Dependency, Sense};
use super::classes::{DepClass, FlagPolicy};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// How [`DependencySet::merge`] resolves a flag present on both sides
/// with different senses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    /// The incoming (newer) sense wins
    Override,
    /// The existing (older) sense wins
    Preference,
    /// Differing senses are an error
    Strict,
}

/// Score contribution of one flag: `system` is the preference side, `trove` the
/// flavor being judged. `None` means incompatible.
pub fn flavor_score(system: Option<Sense>, trove: Sense) -> Option<i32> {
    use Sense::*;
    match (system, trove) {
        (None, Required) => None,
        (None, Disallowed) => Some(0),
        (None, Preferred) => Some(-1),
        (None, PreferNot) => Some(1),

        (Some(Required), Required) => Some(2),
        (Some(Required), Disallowed) => None,
        (Some(Required), Preferred) => Some(1),
        (Some(Required), PreferNot) => None,

        (Some(Disallowed), Required) => None,
        (Some(Disallowed), Disallowed) => Some(2),
        (Some(Disallowed), Preferred) => None,
        (Some(Disallowed), PreferNot) => Some(1),

        (Some(Preferred), Required) => Some(1),
        (Some(Preferred), Disallowed) => None,
        (Some(Preferred), Preferred) => Some(2),
        (Some(Preferred), PreferNot) => Some(-1),

        // a prefer-not preference rules out troves built with the flag on
        (Some(PreferNot), Required) => None,
        (Some(PreferNot), Disallowed) => Some(1),
        (Some(PreferNot), Preferred) => Some(-1),
        (Some(PreferNot), PreferNot) => Some(1),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencySet {
    classes: BTreeMap<DepClass, BTreeMap<String, Dependency>>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.values().all(|atoms| atoms.is_empty())
    }

    /// Add an atom; flags of an existing atom with the same name are
    /// overridden. Single-atom classes fold everything into one atom.
    pub fn add(&mut self, class: DepClass, dep: Dependency) {
        let atoms = self.classes.entry(class).or_default();
        let key = if class.just_one() {
            atoms.keys().next().cloned().unwrap_or_else(|| dep.name.clone())
        } else {
            dep.name.clone()
        };
        match atoms.get_mut(&key) {
            Some(existing) => existing.flags.extend(dep.flags),
            None => {
                atoms.insert(key, dep);
            }
        }
    }

    pub fn with(mut self, class: DepClass, dep: Dependency) -> Self {
        self.add(class, dep);
        self
    }

    pub fn get(&self, class: DepClass, name: &str) -> Option<&Dependency> {
        let atoms = self.classes.get(&class)?;
        if class.just_one() {
            return atoms.values().next();
        }
        atoms.get(name)
    }

    pub fn contains(&self, class: DepClass, name: &str) -> bool {
        self.get(class, name).is_some()
    }

    pub fn remove(&mut self, class: DepClass, name: &str) -> Option<Dependency> {
        let atoms = self.classes.get_mut(&class)?;
        let removed = atoms.remove(name);
        if atoms.is_empty() {
            self.classes.remove(&class);
        }
        removed
    }

    pub fn class_atoms(&self, class: DepClass) -> impl Iterator<Item = &Dependency> {
        self.classes.get(&class).into_iter().flat_map(|atoms| atoms.values())
    }

    pub fn classes(&self) -> impl Iterator<Item = DepClass> + '_ {
        self.classes
            .iter()
            .filter(|(_, atoms)| !atoms.is_empty())
            .map(|(class, _)| *class)
    }

    /// Every (class, atom) pair in deterministic order
    pub fn iter(&self) -> impl Iterator<Item = (DepClass, &Dependency)> {
        self.classes
            .iter()
            .flat_map(|(class, atoms)| atoms.values().map(move |dep| (*class, dep)))
    }

    pub fn len(&self) -> usize {
        self.classes.values().map(|atoms| atoms.len()).sum()
    }

    /// Whether `self` (the providing side) satisfies every atom of `required`
    pub fn satisfies(&self, required: &DependencySet) -> bool {
        required
            .iter()
            .all(|(class, dep)| self.satisfies_atom(class, dep))
    }

    pub fn satisfies_atom(&self, class: DepClass, required: &Dependency) -> bool {
        match self.get(class, &required.name) {
            Some(provider) => provider.satisfies(required),
            None => false,
        }
    }

    /// Atoms of `required` that `self` does not satisfy
    pub fn unsatisfied(&self, required: &DependencySet) -> DependencySet {
        let mut missing = DependencySet::new();
        for (class, dep) in required.iter() {
            if !self.satisfies_atom(class, dep) {
                missing.add(class, dep.clone());
            }
        }
        missing
    }

    /// Merge `other` into `self`
    pub fn merge(&mut self, other: &DependencySet, merge_type: MergeType) -> Result<()> {
        for (class, dep) in other.iter() {
            let existing = self.get(class, &dep.name).cloned();
            let Some(mut existing) = existing else {
                self.add(class, dep.clone());
                continue;
            };
            for (flag, sense) in &dep.flags {
                match existing.flags.get(flag) {
                    None => {
                        existing.flags.insert(flag.clone(), *sense);
                    }
                    Some(current) if current == sense => {}
                    Some(current) => match merge_type {
                        MergeType::Override => {
                            existing.flags.insert(flag.clone(), *sense);
                        }
                        MergeType::Preference => {}
                        MergeType::Strict => {
                            return Err(Error::ConflictingFlags(format!(
                                "{}: {}{} and {}{}",
                                class,
                                current.prefix(),
                                flag,
                                sense.prefix(),
                                flag
                            )));
                        }
                    },
                }
            }
            // replace the atom wholesale so single-atom classes keep one key
            if let Some(atoms) = self.classes.get_mut(&class) {
                let key = if class.just_one() {
                    atoms.keys().next().cloned().unwrap_or_else(|| existing.name.clone())
                } else {
                    existing.name.clone()
                };
                atoms.insert(key, existing);
            }
        }
        Ok(())
    }

    /// Copy with preferences promoted to strong senses
    pub fn to_strong(&self) -> DependencySet {
        let mut strong = DependencySet::new();
        for (class, dep) in self.iter() {
            strong.add(class, dep.to_strong());
        }
        strong
    }

    /// Score `trove` against `self` as the system/preference flavor
    ///
    /// `None` means the trove flavor is incompatible; higher is better.
    pub fn score(&self, trove: &DependencySet) -> Option<i32> {
        let mut total = 0;
        for class in trove.classes() {
            for required in trove.class_atoms(class) {
                let contribution = match self.get(class, &required.name) {
                    Some(system) => score_atom(Some(system), required)?,
                    None if class.name_significant() => return None,
                    None => score_atom(None, required)?,
                };
                total += contribution;
            }
        }
        Some(total)
    }

    /// Scoring with preferences treated as hard requirements
    pub fn strongly_satisfies(&self, trove: &DependencySet) -> bool {
        self.to_strong().score(&trove.to_strong()).is_some()
    }

    /// Frozen form: `tag#atom` entries joined by `|`
    pub fn freeze(&self) -> String {
        let entries: Vec<String> = self
            .iter()
            .map(|(class, dep)| format!("{}#{}", class.tag(), dep.freeze()))
            .collect();
        entries.join("|")
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        let mut set = DependencySet::new();
        if frozen.is_empty() {
            return Ok(set);
        }
        for entry in frozen.split('|') {
            let (tag, atom) = entry
                .split_once('#')
                .ok_or_else(|| Error::ParseError(format!("missing class tag in '{}'", entry)))?;
            let tag: u8 = tag
                .parse()
                .map_err(|_| Error::ParseError(format!("bad class tag in '{}'", entry)))?;
            set.add(DepClass::from_tag(tag), Dependency::thaw(atom)?);
        }
        Ok(set)
    }

    /// Parse the text form: one `class: atom` entry per line
    pub fn parse(s: &str) -> Result<Self> {
        let mut set = DependencySet::new();
        for line in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (class_name, atom) = line
                .split_once(':')
                .ok_or_else(|| Error::ParseError(format!("missing class in '{}'", line)))?;
            let class = DepClass::from_name(class_name.trim())
                .ok_or_else(|| Error::ParseError(format!("unknown dependency class '{}'", class_name)))?;
            let dep = if class.just_one() && !atom.contains('(') {
                Dependency::parse(&format!("{}({})", class.name(), atom.trim()))?
            } else {
                Dependency::parse(atom)?
            };
            if class.flag_policy() == FlagPolicy::NoFlags && !dep.flags.is_empty() {
                return Err(Error::ParseError(format!("{} dependencies take no flags: '{}'", class, line)));
            }
            set.add(class, dep);
        }
        Ok(set)
    }
}

fn score_atom(system: Option<&Dependency>, required: &Dependency) -> Option<i32> {
    if system.is_none() && required.flags.is_empty() {
        return None;
    }
    let mut total = 0;
    for (flag, sense) in &required.flags {
        let system_sense = system.and_then(|s| s.flags.get(flag)).copied();
        total += flavor_score(system_sense, *sense)?;
    }
    Some(total)
}

impl fmt::Display for DependencySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .iter()
            .map(|(class, dep)| {
                if class.just_one() {
                    let flags: Vec<String> = dep
                        .flags
                        .iter()
                        .map(|(flag, sense)| format!("{}{}", sense.prefix(), flag))
                        .collect();
                    format!("{}: {}", class, flags.join(" "))
                } else {
                    format!("{}: {}", class, dep)
                }
            })
            .collect();
        f.write_str(&lines.join("\n"))
    }
}
