// src/dependencies/mod.rs

//! Dependency algebra
//!
//! A [`DependencySet`] maps each [`DepClass`] to a set of [`Dependency`]
//! atoms. Atoms carry `flag → sense` maps. The same type is used for trove
//! provides/requires and for flavors.
//!
//! ```ignore
//! use conary_core::dependencies::DependencySet;
//!
//! let provides = DependencySet::parse("soname: libssl.so(SSL_1 SSL_2)")?;
//! let requires = DependencySet::parse("soname: libssl.so(SSL_1)")?;
//! assert!(provides.satisfies(&requires));
//! ```

mod atom;
mod classes;
mod set;

pub use atom::{Dependency, Sense};
pub use classes::{DepClass, FlagPolicy};
pub use set::{flavor_score, DependencySet, MergeType};
