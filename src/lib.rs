// src/lib.rs

//! Conary core
//!
//! Repository store, dependency resolver and changeset engine of the
//! Conary package manager.
//!
//! # Architecture
//!
//! - Troves: named, versioned, flavored sets of files and sub-troves
//! - Versions: branch plus revision plus one timestamp per label, with
//!   shadows and branches as first-class lineage
//! - Changesets: the single unit of transport, commit and rollback
//! - Repository: immutable committed rows in SQLite plus a SHA-1 blob store
//! - Local database: installed state, pristine config contents, the
//!   rollback stack and the update journal
//! - Update engine: applies a changeset to a root with three-way config
//!   merging, tag handlers and crash recovery

pub mod changeset;
pub mod config;
pub mod dependencies;
mod error;
pub mod files;
pub mod filesystem;
pub mod finder;
pub mod flavor;
pub mod hash;
pub mod label;
pub mod local;
pub mod repository;
pub mod resolver;
pub mod source;
pub mod streams;
pub mod trove;
pub mod update;
pub mod version;

pub use changeset::ChangeSet;
pub use config::Config;
pub use dependencies::{DepClass, Dependency, DependencySet, MergeType, Sense};
pub use error::{Error, Result};
pub use files::{FileId, FileKind, FileStream, PathId};
pub use finder::{TroveFinder, VersionSpec};
pub use flavor::{Flavor, FlavorContext};
pub use hash::Sha1Digest;
pub use label::{Label, LabelParseError, LabelPath};
pub use local::LocalDatabase;
pub use repository::{CommitOptions, Repository};
pub use resolver::{Resolution, Resolver};
pub use source::{MemorySource, TroveSource};
pub use trove::{Trove, TroveTuple};
pub use update::{CancelToken, UpdateJob, UpdateOptions, apply_change_set, update_from_repository};
pub use version::{Branch, Revision, Version};
