// src/filesystem/mod.rs

//! Filesystem helpers shared by the repository and the local database
//!
//! - [`BlobStore`]: SHA-1 content-addressed storage for file contents
//! - [`path`]: mapping trove paths under an install root without escaping it

mod blob;
pub mod path;

pub use blob::BlobStore;
