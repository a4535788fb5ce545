// src/resolver/conflict.rs

//! Requirements the resolver could not settle on its own

use crate::dependencies::{DepClass, Dependency};
use crate::trove::TroveTuple;
use std::fmt;

/// A required atom nothing on the label path provides
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Unresolved {
    pub class: DepClass,
    pub dep: Dependency,
    /// `None` for atoms of the initial request
    pub required_by: Option<TroveTuple>,
}

/// Several candidates tie on every criterion; the caller picks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity {
    pub class: DepClass,
    pub dep: Dependency,
    pub candidates: Vec<TroveTuple>,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.dep)?;
        if let Some(by) = &self.required_by {
            write!(f, " (required by {})", by)?;
        }
        Ok(())
    }
}

impl fmt::Display for Ambiguity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.candidates.iter().map(ToString::to_string).collect();
        write!(f, "{}: {} is provided equally well by {}", self.class, self.dep, names.join(", "))
    }
}
