// src/local/rollback.rs

//! The rollback stack
//!
//! Each entry is a numbered directory holding two change sets:
//! `repos.ccs`, the inverse of the applied change set built from pristine
//! state, and `local.ccs`, the on-disk state of touched files that had
//! drifted from pristine. `status` records the live range as
//! `first next`; entries are `first..next`.

use crate::changeset::ChangeSet;
use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const STATUS_FILE: &str = "status";
const REPOS_CS: &str = "repos.ccs";
const LOCAL_CS: &str = "local.ccs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackEntry {
    pub index: usize,
    pub repos: ChangeSet,
    pub local: ChangeSet,
}

#[derive(Debug)]
pub struct RollbackStack {
    dir: PathBuf,
    first: usize,
    next: usize,
}

impl RollbackStack {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let status = dir.join(STATUS_FILE);
        let (first, next) = match fs::read_to_string(&status) {
            Ok(text) => parse_status(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (0, 0),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            first,
            next,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.next - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.next == self.first
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.first..self.next
    }

    /// Index of the newest entry
    pub fn last_index(&self) -> Option<usize> {
        (!self.is_empty()).then(|| self.next - 1)
    }

    /// Append an entry; the status file is updated last
    pub fn push(&mut self, repos: &ChangeSet, local: &ChangeSet) -> Result<usize> {
        let index = self.next;
        let entry_dir = self.dir.join(index.to_string());
        if entry_dir.exists() {
            // leftover from a push that died before the status update
            fs::remove_dir_all(&entry_dir)?;
        }
        fs::create_dir_all(&entry_dir)?;
        repos.write_to(&entry_dir.join(REPOS_CS))?;
        local.write_to(&entry_dir.join(LOCAL_CS))?;
        self.write_status(self.first, index + 1)?;
        self.next = index + 1;
        info!("pushed rollback {}", index);
        Ok(index)
    }

    pub fn get(&self, index: usize) -> Result<RollbackEntry> {
        if !self.indices().contains(&index) {
            return Err(Error::NotFound(format!("rollback {}", index)));
        }
        let entry_dir = self.dir.join(index.to_string());
        Ok(RollbackEntry {
            index,
            repos: ChangeSet::read_from(&entry_dir.join(REPOS_CS))?,
            local: ChangeSet::read_from(&entry_dir.join(LOCAL_CS))?,
        })
    }

    pub fn last(&self) -> Result<Option<RollbackEntry>> {
        self.last_index().map(|i| self.get(i)).transpose()
    }

    /// Drop the newest entry, which must be `index`
    pub fn pop(&mut self, index: usize) -> Result<()> {
        if self.last_index() != Some(index) {
            return Err(Error::Integrity(format!(
                "rollback {} is not the newest entry ({:?})",
                index,
                self.last_index()
            )));
        }
        self.write_status(self.first, index)?;
        self.next = index;
        fs::remove_dir_all(self.dir.join(index.to_string()))?;
        debug!("popped rollback {}", index);
        Ok(())
    }

    /// Delete the oldest entries until at most `limit` remain; 0 keeps all
    pub fn trim(&mut self, limit: usize) -> Result<usize> {
        if limit == 0 || self.len() <= limit {
            return Ok(0);
        }
        let drop = self.len() - limit;
        let new_first = self.first + drop;
        self.write_status(new_first, self.next)?;
        for index in self.first..new_first {
            let entry_dir = self.dir.join(index.to_string());
            if entry_dir.exists() {
                fs::remove_dir_all(entry_dir)?;
            }
        }
        self.first = new_first;
        info!("trimmed {} rollback(s)", drop);
        Ok(drop)
    }

    fn write_status(&self, first: usize, next: usize) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        writeln!(tmp, "{} {}", first, next)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(STATUS_FILE)).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

fn parse_status(text: &str) -> Result<(usize, usize)> {
    let bad = || Error::ParseError(format!("bad rollback status '{}'", text.trim()));
    let mut parts = text.split_whitespace();
    let first: usize = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let next: usize = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if next < first {
        return Err(bad());
    }
    Ok((first, next))
}
