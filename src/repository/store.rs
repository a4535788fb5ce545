// src/repository/store.rs

//! Row-level helpers shared by commit, query and changeset assembly
//!
//! Every function takes a plain `&Connection` so it works inside a
//! transaction as well as on the bare connection.

use crate::dependencies::{DepClass, Dependency, DependencySet, Sense};
use crate::error::{Error, Result};
use crate::files::{FileId, FileStream, PathId};
use crate::flavor::Flavor;
use crate::hash::Sha1Digest;
use crate::streams::StreamSet;
use crate::trove::{ChangeLog, Trove, TroveInfo, TroveTuple};
use crate::version::Version;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;

/// Dependency tables keyed by instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DepTable {
    Provides,
    Requires,
}

impl DepTable {
    fn name(self) -> &'static str {
        match self {
            DepTable::Provides => "Provides",
            DepTable::Requires => "Requires",
        }
    }
}

/// Identity lookups for the small string-keyed tables
#[derive(Debug, Clone, Copy)]
pub(crate) enum Named {
    Item,
    Version,
    Flavor,
    Branch,
    Label,
}

impl Named {
    fn columns(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Named::Item => ("Items", "itemId", "item"),
            Named::Version => ("Versions", "versionId", "version"),
            Named::Flavor => ("Flavors", "flavorId", "flavor"),
            Named::Branch => ("Branches", "branchId", "branch"),
            Named::Label => ("Labels", "labelId", "label"),
        }
    }
}

pub(crate) fn lookup(conn: &Connection, kind: Named, value: &str) -> Result<Option<i64>> {
    let (table, id, col) = kind.columns();
    let sql = format!("SELECT {} FROM {} WHERE {} = ?1", id, table, col);
    Ok(conn.query_row(&sql, [value], |row| row.get(0)).optional()?)
}

pub(crate) fn get_or_insert(conn: &Connection, kind: Named, value: &str) -> Result<i64> {
    if let Some(id) = lookup(conn, kind, value)? {
        return Ok(id);
    }
    let (table, _, col) = kind.columns();
    conn.execute(&format!("INSERT INTO {} ({}) VALUES (?1)", table, col), [value])?;
    Ok(conn.last_insert_rowid())
}

/// Instance id and presence flag for a tuple
pub(crate) fn instance_id(conn: &Connection, tuple: &TroveTuple) -> Result<Option<(i64, bool)>> {
    let row = conn
        .query_row(
            "SELECT instanceId, isPresent FROM Instances
             JOIN Items USING (itemId)
             JOIN Versions USING (versionId)
             JOIN Flavors USING (flavorId)
             WHERE item = ?1 AND version = ?2 AND flavor = ?3",
            params![tuple.name, tuple.version.as_string(), tuple.flavor.freeze()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn thaw_node_version(version: &str, stamps: &str) -> Result<Version> {
    Version::thaw(&format!("{}:{}", stamps, version))
}

pub(crate) fn instance_tuple(conn: &Connection, instance_id: i64) -> Result<TroveTuple> {
    let (name, version, flavor, stamps): (String, String, String, String) = conn.query_row(
        "SELECT item, version, flavor, timeStamps FROM Instances
         JOIN Items USING (itemId)
         JOIN Versions USING (versionId)
         JOIN Flavors USING (flavorId)
         JOIN Nodes ON Nodes.itemId = Instances.itemId AND Nodes.versionId = Instances.versionId
         WHERE instanceId = ?1",
        [instance_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )?;
    Ok(TroveTuple::new(
        name,
        thaw_node_version(&version, &stamps)?,
        Flavor::thaw(&flavor)?,
    ))
}

pub(crate) fn insert_deps(conn: &Connection, table: DepTable, instance_id: i64, deps: &DependencySet) -> Result<()> {
    let sql = format!(
        "INSERT INTO {} (instanceId, depId, depNum, depCount) VALUES (?1, ?2, ?3, ?4)",
        table.name()
    );
    for (dep_num, (class, dep)) in deps.iter().enumerate() {
        let count = dep.flags.len() as i64;
        let flags: Vec<String> = if dep.flags.is_empty() {
            vec![String::new()]
        } else {
            dep.flags.iter().map(|(f, s)| format!("{}{}", s.prefix(), f)).collect()
        };
        for flag in flags {
            let dep_id = dependency_id(conn, class, &dep.name, &flag)?;
            conn.execute(&sql, params![instance_id, dep_id, dep_num as i64, count])?;
        }
    }
    Ok(())
}

fn dependency_id(conn: &Connection, class: DepClass, name: &str, flag: &str) -> Result<i64> {
    let existing = conn
        .query_row(
            "SELECT depId FROM Dependencies WHERE class = ?1 AND name = ?2 AND flag = ?3",
            params![class.tag(), name, flag],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO Dependencies (class, name, flag) VALUES (?1, ?2, ?3)",
        params![class.tag(), name, flag],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_deps(conn: &Connection, table: DepTable, instance_id: i64) -> Result<DependencySet> {
    let sql = format!(
        "SELECT depNum, depCount, class, name, flag FROM {} JOIN Dependencies USING (depId)
         WHERE instanceId = ?1 ORDER BY depNum",
        table.name()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([instance_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, u8>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut atoms: BTreeMap<i64, (DepClass, Dependency, i64)> = BTreeMap::new();
    for row in rows {
        let (num, count, class, name, flag) = row?;
        let (_, dep, _) = atoms
            .entry(num)
            .or_insert_with(|| (DepClass::from_tag(class), Dependency::new(name), count));
        if !flag.is_empty() {
            let (sense, flag) = Sense::split_flag(&flag);
            dep.flags.insert(flag.to_string(), sense);
        }
    }

    let mut set = DependencySet::new();
    for (class, dep, count) in atoms.into_values() {
        if dep.flags.len() as i64 != count {
            return Err(Error::Integrity(format!(
                "dependency {} has {} flag rows, expected {}",
                dep.name,
                dep.flags.len(),
                count
            )));
        }
        set.add(class, dep);
    }
    Ok(set)
}

/// Insert a stream unless its fileId is already stored; returns the row id
/// and whether a new row was written
pub(crate) fn insert_stream(conn: &Connection, stream: &FileStream) -> Result<(i64, bool)> {
    let file_id = stream.file_id();
    if let Some((id, _)) = stream_by_file_id(conn, &file_id)? {
        return Ok((id, false));
    }
    let sha1 = stream.contents_sha1();
    conn.execute(
        "INSERT INTO FileStreams (fileId, stream, sha1) VALUES (?1, ?2, ?3)",
        params![
            file_id.as_bytes().as_slice(),
            stream.freeze(),
            sha1.as_ref().map(|s| s.as_bytes().to_vec())
        ],
    )?;
    let id = conn.last_insert_rowid();
    if let Some(sha1) = sha1 {
        conn.execute(
            "INSERT INTO BlobRefs (sha1, refCount) VALUES (?1, 1)
             ON CONFLICT(sha1) DO UPDATE SET refCount = refCount + 1",
            [sha1.as_bytes().as_slice()],
        )?;
    }
    Ok((id, true))
}

pub(crate) fn stream_by_file_id(conn: &Connection, file_id: &FileId) -> Result<Option<(i64, FileStream)>> {
    let row: Option<(i64, Vec<u8>)> = conn
        .query_row(
            "SELECT streamId, stream FROM FileStreams WHERE fileId = ?1",
            [file_id.as_bytes().as_slice()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((id, data)) => Ok(Some((id, FileStream::thaw(&data)?))),
        None => Ok(None),
    }
}

#[cfg(test)]
pub(crate) fn blob_refcount(conn: &Connection, sha1: &Sha1Digest) -> Result<i64> {
    let count: Option<i64> = conn
        .query_row(
            "SELECT refCount FROM BlobRefs WHERE sha1 = ?1",
            [sha1.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}

/// Write the instance row and everything hanging off it except
/// `TroveTroves`, which needs every instance of the commit first
pub(crate) fn insert_trove(
    conn: &Connection,
    trove: &Trove,
    present: bool,
    streams: &BTreeMap<PathId, i64>,
) -> Result<i64> {
    let version = trove.version();
    let item_id = get_or_insert(conn, Named::Item, trove.name())?;
    let version_id = get_or_insert(conn, Named::Version, &version.as_string())?;
    let flavor_id = flavor_id(conn, trove.flavor())?;
    let branch_id = get_or_insert(conn, Named::Branch, &version.branch().to_string())?;
    let label_id = get_or_insert(conn, Named::Label, &version.trailing_label().to_string())?;

    conn.execute(
        "INSERT OR IGNORE INTO LabelMap (itemId, labelId, branchId) VALUES (?1, ?2, ?3)",
        params![item_id, label_id, branch_id],
    )?;

    let stamps: Vec<String> = version.timestamps().iter().map(|t| t.to_string()).collect();
    let existing_node: Option<String> = conn
        .query_row(
            "SELECT timeStamps FROM Nodes WHERE itemId = ?1 AND versionId = ?2",
            params![item_id, version_id],
            |row| row.get(0),
        )
        .optional()?;
    match existing_node {
        // another flavor of the same version; its timestamps must agree
        Some(recorded) if recorded != stamps.join(",") => {
            return Err(Error::Integrity(format!(
                "{} was committed before with timestamps {}",
                trove.tuple(),
                recorded
            )));
        }
        Some(_) => {}
        None => {
            conn.execute(
                "INSERT INTO Nodes (itemId, branchId, versionId, timeStamps, finalTimestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    item_id,
                    branch_id,
                    version_id,
                    stamps.join(","),
                    version.trailing_timestamp().unwrap_or(0)
                ],
            )?;
        }
    }

    let change_log = trove.change_log().to_streams().freeze();
    conn.execute(
        "INSERT INTO Instances (itemId, versionId, flavorId, isPresent, isRedirect, changeLog, troveInfo)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item_id,
            version_id,
            flavor_id,
            present,
            trove.info().is_redirect(),
            change_log,
            trove.info().freeze()
        ],
    )?;
    let instance_id = conn.last_insert_rowid();

    for (path_id, entry) in trove.files() {
        let stream_id = streams
            .get(path_id)
            .ok_or_else(|| Error::TroveMissing(format!("file stream for {} in {}", entry.path, trove.tuple())))?;
        conn.execute(
            "INSERT INTO TroveFiles (instanceId, streamId, fileVersion, pathId, path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                instance_id,
                stream_id,
                entry.version.freeze(),
                path_id.0.as_slice(),
                entry.path
            ],
        )?;
    }

    insert_deps(conn, DepTable::Provides, instance_id, trove.provides())?;
    insert_deps(conn, DepTable::Requires, instance_id, trove.requires())?;
    refresh_latest(conn, item_id, branch_id, flavor_id)?;
    Ok(instance_id)
}

pub(crate) fn flavor_id(conn: &Connection, flavor: &Flavor) -> Result<i64> {
    let frozen = flavor.freeze();
    if let Some(id) = lookup(conn, Named::Flavor, &frozen)? {
        return Ok(id);
    }
    let id = get_or_insert(conn, Named::Flavor, &frozen)?;
    for (_, dep) in flavor.deps().iter() {
        let flags: Vec<String> = if dep.flags.is_empty() {
            vec![String::new()]
        } else {
            dep.flags.iter().map(|(f, s)| format!("{}{}", s.prefix(), f)).collect()
        };
        for flag in flags {
            conn.execute(
                "INSERT INTO FlavorMap (flavorId, base, flag) VALUES (?1, ?2, ?3)",
                params![id, dep.name, flag],
            )?;
        }
    }
    Ok(id)
}

/// Recompute the `Latest` row for one (item, branch, flavor)
pub(crate) fn refresh_latest(conn: &Connection, item_id: i64, branch_id: i64, flavor_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM Latest WHERE itemId = ?1 AND branchId = ?2 AND flavorId = ?3",
        params![item_id, branch_id, flavor_id],
    )?;
    conn.execute(
        "INSERT INTO Latest (itemId, branchId, flavorId, versionId)
         SELECT Instances.itemId, Nodes.branchId, Instances.flavorId, Instances.versionId
         FROM Instances
         JOIN Nodes ON Nodes.itemId = Instances.itemId AND Nodes.versionId = Instances.versionId
         WHERE Instances.itemId = ?1 AND Nodes.branchId = ?2 AND Instances.flavorId = ?3
           AND Instances.isPresent = 1
         ORDER BY Nodes.finalTimestamp DESC, Nodes.timeStamps DESC
         LIMIT 1",
        params![item_id, branch_id, flavor_id],
    )?;
    Ok(())
}

pub(crate) fn insert_trove_refs(conn: &Connection, parent_id: i64, trove: &Trove) -> Result<()> {
    for (tuple, by_default) in trove.troves() {
        let (included, _) = instance_id(conn, tuple)?
            .ok_or_else(|| Error::TroveMissing(format!("{} (included by {})", tuple, trove.tuple())))?;
        conn.execute(
            "INSERT INTO TroveTroves (instanceId, includedId, byDefault) VALUES (?1, ?2, ?3)",
            params![parent_id, included, by_default],
        )?;
    }
    Ok(())
}

/// Rebuild a trove from its rows
pub(crate) fn load_trove(conn: &Connection, instance_id: i64) -> Result<Trove> {
    let tuple = instance_tuple(conn, instance_id)?;
    let (change_log, info): (Option<Vec<u8>>, Option<Vec<u8>>) = conn.query_row(
        "SELECT changeLog, troveInfo FROM Instances WHERE instanceId = ?1",
        [instance_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let mut trove = Trove::new(tuple.name, tuple.version, tuple.flavor);
    trove.set_provides(load_deps(conn, DepTable::Provides, instance_id)?);
    trove.set_requires(load_deps(conn, DepTable::Requires, instance_id)?);
    if let Some(data) = change_log {
        let set = StreamSet::thaw(ChangeLog::schema(), &data)?;
        trove.set_change_log(ChangeLog::from_streams(&set));
    }
    if let Some(data) = info {
        *trove.info_mut() = TroveInfo::thaw(&data)?;
    }

    let mut stmt = conn.prepare(
        "SELECT pathId, path, fileId, fileVersion FROM TroveFiles
         JOIN FileStreams USING (streamId) WHERE instanceId = ?1",
    )?;
    let files = stmt.query_map([instance_id], |row| {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    for row in files {
        let (path_id, path, file_id, version) = row?;
        trove.add_file(
            PathId::from_slice(&path_id)?,
            path,
            FileId::from_slice(&file_id)?,
            Version::thaw(&version)?,
        );
    }

    let mut stmt = conn.prepare("SELECT includedId, byDefault FROM TroveTroves WHERE instanceId = ?1")?;
    let refs = stmt
        .query_map([instance_id], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (included, by_default) in refs {
        trove.add_trove(instance_tuple(conn, included)?, by_default);
    }
    Ok(trove)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn test_deps_round_trip_through_rows() {
        let conn = conn();
        conn.execute_batch(
            "INSERT INTO Items (item) VALUES ('x');
             INSERT INTO Versions (version) VALUES ('/a@b:c/1-1-1');
             INSERT INTO Flavors (flavor) VALUES ('');
             INSERT INTO Instances (itemId, versionId, flavorId) VALUES (1, 1, 1);",
        )
        .unwrap();
        let deps = DependencySet::parse(
            "soname: ELF64/libc.so.6(GLIBC_2.4 x86_64)\ntrove: x\nuse: ~!debug ssl",
        )
        .unwrap();
        insert_deps(&conn, DepTable::Provides, 1, &deps).unwrap();
        assert_eq!(load_deps(&conn, DepTable::Provides, 1).unwrap(), deps);
        assert!(load_deps(&conn, DepTable::Requires, 1).unwrap().is_empty());
    }

    #[test]
    fn test_insert_stream_dedups_and_counts_blobs() {
        let conn = conn();
        let a = FileStream::regular(b"same", 0o644);
        let mut b = FileStream::regular(b"same", 0o755);
        b.set_owner("daemon");
        let (id1, new1) = insert_stream(&conn, &a).unwrap();
        let (id2, new2) = insert_stream(&conn, &a).unwrap();
        assert_eq!((id1, new1, new2), (id2, true, false));
        insert_stream(&conn, &b).unwrap();
        assert_eq!(blob_refcount(&conn, &a.contents_sha1().unwrap()).unwrap(), 2);
        let (_, back) = stream_by_file_id(&conn, &a.file_id()).unwrap().unwrap();
        assert_eq!(back, a);
    }
}
