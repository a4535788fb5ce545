// src/local/schema.rs

//! Local database schema and migrations
//!
//! `Instances` holds the pristine frozen trove for everything installed.
//! `DBTroveFiles` is the ownership table: one row per path on disk, so a
//! path can never be owned twice.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

pub const SCHEMA_VERSION: i32 = 1;

fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;
    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

pub fn migrate(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current >= SCHEMA_VERSION {
        debug!("Local database schema is up to date (version {})", current);
        return Ok(());
    }
    for version in (current + 1)..=SCHEMA_VERSION {
        info!("Applying local database migration to version {}", version);
        if version == 1 {
            migrate_v1(conn)?;
        }
        set_schema_version(conn, version)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE Instances (
            instanceId INTEGER PRIMARY KEY AUTOINCREMENT,
            troveName TEXT NOT NULL,
            version TEXT NOT NULL,
            frozenVersion TEXT NOT NULL,
            flavor TEXT NOT NULL,
            pristine BLOB NOT NULL,
            pinned INTEGER NOT NULL DEFAULT 0,
            installedAt TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(troveName, version, flavor)
        );
        CREATE INDEX InstancesNameIdx ON Instances(troveName);

        CREATE TABLE FileStreams (
            fileId BLOB PRIMARY KEY,
            stream BLOB NOT NULL
        );

        CREATE TABLE DBTroveFiles (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId) ON DELETE CASCADE,
            pathId BLOB NOT NULL,
            path TEXT NOT NULL UNIQUE,
            fileId BLOB NOT NULL,
            fileVersion TEXT NOT NULL
        );
        CREATE INDEX DBTroveFilesInstanceIdx ON DBTroveFiles(instanceId);
        CREATE INDEX DBTroveFilesPathIdIdx ON DBTroveFiles(pathId);

        CREATE TABLE FileTags (
            path TEXT NOT NULL REFERENCES DBTroveFiles(path) ON DELETE CASCADE,
            tag TEXT NOT NULL,
            PRIMARY KEY(path, tag)
        );
        CREATE INDEX FileTagsTagIdx ON FileTags(tag);

        -- files the user removed; their rows stay owned but are not restored
        CREATE TABLE UserRemovals (
            path TEXT PRIMARY KEY REFERENCES DBTroveFiles(path) ON DELETE CASCADE
        );

        -- config files whose on-disk contents differ from the pristine copy
        CREATE TABLE ConfigOverlay (
            path TEXT PRIMARY KEY REFERENCES DBTroveFiles(path) ON DELETE CASCADE,
            sha1 BLOB NOT NULL
        );

        CREATE TABLE LinkGroups (
            linkGroup BLOB NOT NULL,
            path TEXT NOT NULL UNIQUE REFERENCES DBTroveFiles(path) ON DELETE CASCADE
        );
        CREATE INDEX LinkGroupsIdx ON LinkGroups(linkGroup);
        ",
    )?;
    Ok(())
}
