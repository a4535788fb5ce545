// src/local/mod.rs

//! Client-side state
//!
//! A single directory holds everything the client knows about its root:
//!
//! ```text
//! <dir>/conarydb           SQLite: installed troves, file ownership, tags
//! <dir>/contents/          pristine contents of config files
//! <dir>/rollbacks/<n>/     repos.ccs and local.ccs of each rollback
//! <dir>/rollbacks/status   live range of the rollback stack
//! <dir>/journal/           journals of updates in flight
//! ```

mod db;
pub mod journal;
pub mod rollback;
mod schema;

pub use db::{DB_FILE, FsResult, InstalledFile, LocalDatabase};
pub use journal::{Journal, JournalRecord, RecoveryOutcome};
pub use rollback::{RollbackEntry, RollbackStack};
