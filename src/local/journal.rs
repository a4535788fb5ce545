// src/local/journal.rs

//! Append-only update journal for crash recovery
//!
//! Every destructive filesystem step of an update is preceded by a record
//! here, and every path about to be removed or overwritten is first saved
//! into the journal's backup directory (a hard link where possible).
//! Each record is one line, `{crc32_hex}|{json}\n`; phase barriers fsync.
//!
//! On the next run, [`recover`] finishes an update whose manifest was
//! committed and undoes one whose manifest was not.

use super::LocalDatabase;
use crate::error::{Error, Result};
use crate::update::FsOp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JournalRecord {
    Begin {
        tx_uuid: String,
        root: PathBuf,
        description: String,
        timestamp: DateTime<Utc>,
    },
    Plan {
        operations: Vec<FsOp>,
    },
    /// Pre-image of `path` saved at `backup_path`
    Backup {
        path: PathBuf,
        backup_path: PathBuf,
    },
    Removed {
        path: PathBuf,
        /// Permissions of a removed directory
        dir_mode: Option<u32>,
    },
    /// `path` now holds new contents
    Restored {
        path: PathBuf,
    },
    RollbackPushed {
        index: usize,
    },
    DbCommitted,
    Done {
        duration_ms: u64,
        success: bool,
    },
}

/// What [`recover`] did with one journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The manifest was committed; only bookkeeping was left
    Completed(String),
    /// The filesystem was put back to its pre-update state
    RolledBack(String),
}

pub struct Journal {
    path: PathBuf,
    backup_dir: PathBuf,
    file: File,
    tx_uuid: String,
    backups: usize,
}

impl Journal {
    pub fn create(journal_dir: &Path, tx_uuid: &str) -> Result<Self> {
        fs::create_dir_all(journal_dir)?;
        let path = journal_dir.join(format!("tx-{}.journal", tx_uuid));
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        let backup_dir = journal_dir.join(format!("tx-{}", tx_uuid));
        fs::create_dir_all(&backup_dir)?;
        Ok(Self {
            path,
            backup_dir,
            file,
            tx_uuid: tx_uuid.to_string(),
            backups: 0,
        })
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let tx_uuid = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("tx-"))
            .ok_or_else(|| Error::IoError(format!("invalid journal file name {}", path.display())))?
            .to_string();
        let backup_dir = path.with_file_name(format!("tx-{}", tx_uuid));
        let backups = fs::read_dir(&backup_dir).map(|d| d.count()).unwrap_or(0);
        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            path,
            backup_dir,
            file,
            tx_uuid,
            backups,
        })
    }

    pub fn tx_uuid(&self) -> &str {
        &self.tx_uuid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record (no fsync)
    pub fn write(&mut self, record: &JournalRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| Error::IoError(format!("failed to serialize journal record: {}", e)))?;
        let crc = crc32fast::hash(json.as_bytes());
        writeln!(self.file, "{:08x}|{}", crc, json)?;
        Ok(())
    }

    /// Append a record and fsync
    pub fn write_barrier(&mut self, record: &JournalRecord) -> Result<()> {
        self.write(record)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Read every valid record; reading stops at the first corrupt line
    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let Some((crc, json)) = line.split_once('|') else {
                log::warn!("Malformed journal line {}: missing delimiter", line_num + 1);
                break;
            };
            let expected = u32::from_str_radix(crc, 16).ok();
            let actual = crc32fast::hash(json.as_bytes());
            if expected != Some(actual) {
                log::warn!("CRC mismatch at journal line {}, ignoring the rest", line_num + 1);
                break;
            }
            let record = serde_json::from_str(json).map_err(|e| {
                Error::IoError(format!("failed to parse journal record at line {}: {}", line_num + 1, e))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Save the current contents of `path` before it is removed or replaced
    ///
    /// Regular files and symlinks are hard linked into the backup directory
    /// (copied when `copy` is set or linking fails). Directories and absent
    /// paths need no backup. Returns the backup location.
    pub fn backup(&mut self, path: &Path, copy: bool) -> Result<Option<PathBuf>> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Ok(None);
        }
        self.backups += 1;
        let backup_path = self.backup_dir.join(self.backups.to_string());
        let linked = !copy && fs::hard_link(path, &backup_path).is_ok();
        if !linked {
            if meta.file_type().is_symlink() {
                std::os::unix::fs::symlink(fs::read_link(path)?, &backup_path)?;
            } else {
                fs::copy(path, &backup_path)?;
            }
        }
        self.write_barrier(&JournalRecord::Backup {
            path: path.to_path_buf(),
            backup_path: backup_path.clone(),
        })?;
        Ok(Some(backup_path))
    }

    /// Put every journaled path back the way the backups recorded it
    pub fn undo(&mut self) -> Result<()> {
        let records = self.read_all()?;
        undo_records(&records)?;
        Ok(())
    }

    /// Successful end: write `Done` and drop journal and backups
    pub fn finish(mut self, duration_ms: u64, success: bool) -> Result<()> {
        self.write_barrier(&JournalRecord::Done { duration_ms, success })?;
        if self.backup_dir.exists() {
            fs::remove_dir_all(&self.backup_dir)?;
        }
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

fn undo_records(records: &[JournalRecord]) -> Result<()> {
    for record in records.iter().rev() {
        match record {
            JournalRecord::Restored { path } => {
                match fs::symlink_metadata(path) {
                    Ok(meta) if meta.is_dir() => {
                        // only directories we created are empty here
                        let _ = fs::remove_dir(path);
                    }
                    Ok(_) => fs::remove_file(path)?,
                    Err(_) => {}
                }
            }
            JournalRecord::Removed { path, dir_mode: Some(mode) } => {
                fs::create_dir_all(path)?;
                fs::set_permissions(path, fs::Permissions::from_mode(*mode))?;
            }
            JournalRecord::Backup { path, backup_path } => {
                if let Ok(meta) = fs::symlink_metadata(path) {
                    if meta.is_dir() {
                        fs::remove_dir_all(path)?;
                    } else {
                        fs::remove_file(path)?;
                    }
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(backup_path, path)?;
                debug!("restored {} from backup", path.display());
            }
            _ => {}
        }
    }
    Ok(())
}

/// Journals with no `Done` record
pub fn find_incomplete_journals(journal_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut journals = Vec::new();
    let entries = match fs::read_dir(journal_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(journals),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "journal") {
            continue;
        }
        let journal = Journal::open(path.clone())?;
        let records = journal.read_all()?;
        if !records.iter().any(|r| matches!(r, JournalRecord::Done { .. })) {
            journals.push(path);
        }
    }
    journals.sort();
    Ok(journals)
}

/// Resolve interrupted updates left behind in `db`'s journal directory
///
/// A journal that reached `DbCommitted` is completed. Anything earlier is
/// undone from the backups, and a rollback entry it pushed is popped, so
/// the system is back in its pre-update state.
pub fn recover(db: &mut LocalDatabase) -> Result<Vec<RecoveryOutcome>> {
    let mut outcomes = Vec::new();
    for path in find_incomplete_journals(&db.journal_dir())? {
        let journal = Journal::open(path)?;
        let records = journal.read_all()?;
        let tx = journal.tx_uuid().to_string();

        if records.iter().any(|r| matches!(r, JournalRecord::DbCommitted)) {
            info!("completing interrupted update {}", tx);
            journal.finish(0, true)?;
            outcomes.push(RecoveryOutcome::Completed(tx));
            continue;
        }

        warn!("rolling back interrupted update {}", tx);
        undo_records(&records)?;
        let pushed = records.iter().find_map(|r| match r {
            JournalRecord::RollbackPushed { index } => Some(*index),
            _ => None,
        });
        if let Some(index) = pushed
            && db.rollbacks().last_index() == Some(index)
        {
            db.rollbacks_mut().pop(index)?;
        }
        journal.finish(0, false)?;
        outcomes.push(RecoveryOutcome::RolledBack(tx));
    }
    Ok(outcomes)
}
