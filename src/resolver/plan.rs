// src/resolver/plan.rs

//! Resolution result data structures

use super::conflict::{Ambiguity, Unresolved};
use crate::dependencies::{DepClass, Dependency};
use crate::error::{Error, Result};
use crate::trove::TroveTuple;
use std::collections::{BTreeMap, BTreeSet};

/// The candidates chosen for one required atom
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    pub class: DepClass,
    pub dep: Dependency,
    /// One tuple, or every tied tuple when ambiguous
    pub candidates: Vec<TroveTuple>,
}

/// Result of dependency resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Every required atom seen, in resolution order
    pub solutions: Vec<Solution>,
    pub unresolved: Vec<Unresolved>,
    pub ambiguous: Vec<Ambiguity>,
    /// Troves selected to be installed, including ones pulled in by
    /// their own requirements
    pub chosen: BTreeSet<TroveTuple>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty() && self.ambiguous.is_empty()
    }

    /// Candidates for a required atom
    pub fn candidates(&self, class: DepClass, dep: &Dependency) -> Option<&[TroveTuple]> {
        self.solutions
            .iter()
            .find(|s| s.class == class && &s.dep == dep)
            .map(|s| s.candidates.as_slice())
    }

    /// atom (as text) → candidates
    pub fn as_map(&self) -> BTreeMap<String, Vec<TroveTuple>> {
        self.solutions
            .iter()
            .map(|s| (format!("{}: {}", s.class, s.dep), s.candidates.clone()))
            .collect()
    }

    /// Turn leftover problems into an error for callers that need a full set
    pub fn require_complete(self) -> Result<Self> {
        if !self.unresolved.is_empty() {
            let atoms: Vec<String> = self.unresolved.iter().map(ToString::to_string).collect();
            return Err(Error::DependencyFailure(atoms.join("; ")));
        }
        if !self.ambiguous.is_empty() {
            let atoms: Vec<String> = self.ambiguous.iter().map(ToString::to_string).collect();
            return Err(Error::DependencyFailure(atoms.join("; ")));
        }
        Ok(self)
    }
}
