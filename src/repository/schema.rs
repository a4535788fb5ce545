// src/repository/schema.rs

//! Repository store schema and migrations
//!
//! Rows are append-only outside of [`super::Repository::gc`]. Versions are
//! stored by string form; the timestamps that order them live on `Nodes`.

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
        debug!("Repository schema is up to date (version {})", current);
        return Ok(());
    }
    for version in (current + 1)..=SCHEMA_VERSION {
        info!("Applying repository migration to version {}", version);
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
        CREATE TABLE Items (
            itemId INTEGER PRIMARY KEY AUTOINCREMENT,
            item TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Versions (
            versionId INTEGER PRIMARY KEY AUTOINCREMENT,
            version TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Flavors (
            flavorId INTEGER PRIMARY KEY AUTOINCREMENT,
            flavor TEXT NOT NULL UNIQUE
        );

        -- one row per flag of each flavor atom; flag '' for a bare atom
        CREATE TABLE FlavorMap (
            flavorId INTEGER NOT NULL REFERENCES Flavors(flavorId),
            base TEXT NOT NULL,
            flag TEXT NOT NULL
        );
        CREATE INDEX FlavorMapIdx ON FlavorMap(flavorId);

        CREATE TABLE Branches (
            branchId INTEGER PRIMARY KEY AUTOINCREMENT,
            branch TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Labels (
            labelId INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL UNIQUE
        );

        -- trailing label of each branch an item lives on
        CREATE TABLE LabelMap (
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            labelId INTEGER NOT NULL REFERENCES Labels(labelId),
            branchId INTEGER NOT NULL REFERENCES Branches(branchId),
            UNIQUE(itemId, labelId, branchId)
        );

        CREATE TABLE Nodes (
            nodeId INTEGER PRIMARY KEY AUTOINCREMENT,
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            branchId INTEGER NOT NULL REFERENCES Branches(branchId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId),
            timeStamps TEXT NOT NULL,
            finalTimestamp INTEGER NOT NULL,
            UNIQUE(itemId, versionId)
        );
        CREATE INDEX NodesBranchIdx ON Nodes(itemId, branchId);

        CREATE TABLE Instances (
            instanceId INTEGER PRIMARY KEY AUTOINCREMENT,
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId),
            flavorId INTEGER NOT NULL REFERENCES Flavors(flavorId),
            isPresent INTEGER NOT NULL DEFAULT 1,
            isRedirect INTEGER NOT NULL DEFAULT 0,
            changeLog BLOB,
            troveInfo BLOB,
            UNIQUE(itemId, versionId, flavorId)
        );

        CREATE TABLE FileStreams (
            streamId INTEGER PRIMARY KEY AUTOINCREMENT,
            fileId BLOB NOT NULL UNIQUE,
            stream BLOB NOT NULL,
            sha1 BLOB
        );

        CREATE TABLE TroveFiles (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            streamId INTEGER NOT NULL REFERENCES FileStreams(streamId),
            fileVersion TEXT NOT NULL,
            pathId BLOB NOT NULL,
            path TEXT NOT NULL,
            UNIQUE(instanceId, pathId)
        );
        CREATE INDEX TroveFilesStreamIdx ON TroveFiles(streamId);

        CREATE TABLE Dependencies (
            depId INTEGER PRIMARY KEY AUTOINCREMENT,
            class INTEGER NOT NULL,
            name TEXT NOT NULL,
            flag TEXT NOT NULL,
            UNIQUE(class, name, flag)
        );

        CREATE TABLE Provides (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            depId INTEGER NOT NULL REFERENCES Dependencies(depId),
            depNum INTEGER NOT NULL,
            depCount INTEGER NOT NULL
        );
        CREATE INDEX ProvidesDepIdx ON Provides(depId);
        CREATE INDEX ProvidesInstanceIdx ON Provides(instanceId);

        CREATE TABLE Requires (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            depId INTEGER NOT NULL REFERENCES Dependencies(depId),
            depNum INTEGER NOT NULL,
            depCount INTEGER NOT NULL
        );
        CREATE INDEX RequiresInstanceIdx ON Requires(instanceId);

        CREATE TABLE TroveTroves (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            includedId INTEGER NOT NULL REFERENCES Instances(instanceId),
            byDefault INTEGER NOT NULL,
            UNIQUE(instanceId, includedId)
        );

        CREATE TABLE Latest (
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            branchId INTEGER NOT NULL REFERENCES Branches(branchId),
            flavorId INTEGER NOT NULL REFERENCES Flavors(flavorId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId),
            PRIMARY KEY(itemId, branchId, flavorId)
        );

        CREATE TABLE BlobRefs (
            sha1 BLOB PRIMARY KEY,
            refCount INTEGER NOT NULL
        );

        -- touched first in every commit transaction
        CREATE TABLE CommitLock (
            lockCount INTEGER NOT NULL
        );
        INSERT INTO CommitLock (lockCount) VALUES (0);

        CREATE TABLE PGPKeys (
            keyId INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT NOT NULL UNIQUE,
            pgpKey BLOB NOT NULL
        );

        CREATE TABLE PGPFingerprints (
            keyId INTEGER NOT NULL REFERENCES PGPKeys(keyId),
            fingerprint TEXT NOT NULL UNIQUE
        );
        ",
    )?;
    Ok(())
}
