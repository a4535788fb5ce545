// src/local/db.rs

//! The installed-system database

use super::rollback::RollbackStack;
use super::schema;
use crate::changeset::{ChangeSet, FileChange, FileContents, PreState};
use crate::dependencies::{DepClass, Dependency};
use crate::error::{Error, Result};
use crate::files::{FileId, FileKind, FileStream, PathId};
use crate::filesystem::BlobStore;
use crate::filesystem::path::under_root;
use crate::flavor::Flavor;
use crate::hash::Sha1Digest;
use crate::source::TroveSource;
use crate::trove::{Trove, TroveTuple};
use crate::version::Version;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DB_FILE: &str = "conarydb";
const CONTENTS_DIR: &str = "contents";
const ROLLBACK_DIR: &str = "rollbacks";
const JOURNAL_DIR: &str = "journal";

/// One owned path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFile {
    pub tuple: TroveTuple,
    pub path_id: PathId,
    pub path: String,
    pub file_id: FileId,
    pub version: Version,
    pub stream: FileStream,
}

/// What the filesystem side of an update learned, for [`LocalDatabase::commit`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsResult {
    /// Config paths whose disk contents now differ from pristine; `None` clears
    pub overlays: BTreeMap<String, Option<Sha1Digest>>,
    /// Tags for new rows; paths not listed use their stream tags
    pub tags: BTreeMap<String, BTreeSet<String>>,
    /// New rows the user had removed and that stayed removed
    pub user_removed: BTreeSet<String>,
}

pub struct LocalDatabase {
    dir: PathBuf,
    root: PathBuf,
    conn: Connection,
    blobs: BlobStore,
    rollbacks: RollbackStack,
}

const FILE_COLUMNS: &str = "i.troveName, i.frozenVersion, i.flavor, f.pathId, f.path, f.fileId, f.fileVersion, s.stream
     FROM DBTroveFiles f
     JOIN Instances i ON i.instanceId = f.instanceId
     JOIN FileStreams s ON s.fileId = f.fileId";

type RawFile = (String, String, String, Vec<u8>, String, Vec<u8>, String, Vec<u8>);

fn raw_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawFile> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_file(raw: RawFile) -> Result<InstalledFile> {
    let (name, version, flavor, path_id, path, file_id, file_version, stream) = raw;
    Ok(InstalledFile {
        tuple: TroveTuple::new(name, Version::thaw(&version)?, Flavor::thaw(&flavor)?),
        path_id: PathId::from_slice(&path_id)?,
        path,
        file_id: FileId::from_slice(&file_id)?,
        version: Version::thaw(&file_version)?,
        stream: FileStream::thaw(&stream)?,
    })
}

fn instance_id(conn: &Connection, tuple: &TroveTuple) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT instanceId FROM Instances WHERE troveName = ?1 AND version = ?2 AND flavor = ?3",
            params![tuple.name, tuple.version.as_string(), tuple.flavor.freeze()],
            |row| row.get(0),
        )
        .optional()?)
}

fn load_trove(conn: &Connection, tuple: &TroveTuple) -> Result<Option<Trove>> {
    let frozen: Option<Vec<u8>> = conn
        .query_row(
            "SELECT pristine FROM Instances WHERE troveName = ?1 AND version = ?2 AND flavor = ?3",
            params![tuple.name, tuple.version.as_string(), tuple.flavor.freeze()],
            |row| row.get(0),
        )
        .optional()?;
    frozen.map(|f| Trove::thaw(&f)).transpose()
}

fn load_stream(conn: &Connection, file_id: &FileId) -> Result<Option<FileStream>> {
    let frozen: Option<Vec<u8>> = conn
        .query_row(
            "SELECT stream FROM FileStreams WHERE fileId = ?1",
            [file_id.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    frozen.map(|f| FileStream::thaw(&f)).transpose()
}

impl LocalDatabase {
    /// Open (creating when absent) the database in `dir` managing `root`
    pub fn open(dir: impl AsRef<Path>, root: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| Error::InitError(format!("cannot create {}: {}", dir.display(), e)))?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::migrate(&conn)?;
        debug!("opened local database {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            root: root.as_ref().to_path_buf(),
            conn,
            blobs: BlobStore::new(dir.join(CONTENTS_DIR))?,
            rollbacks: RollbackStack::open(&dir.join(ROLLBACK_DIR))?,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.dir.join(JOURNAL_DIR)
    }

    pub fn rollbacks(&self) -> &RollbackStack {
        &self.rollbacks
    }

    pub fn rollbacks_mut(&mut self) -> &mut RollbackStack {
        &mut self.rollbacks
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.len()
    }

    pub fn trim_rollbacks(&mut self, limit: usize) -> Result<usize> {
        self.rollbacks.trim(limit)
    }

    /// Undo the most recent update; see [`crate::update::rollback_one`]
    pub fn rollback_one(&mut self) -> Result<crate::update::UpdateJob> {
        crate::update::rollback_one(self, &crate::update::UpdateOptions::default())
    }

    pub fn has(&self, tuple: &TroveTuple) -> Result<bool> {
        Ok(instance_id(&self.conn, tuple)?.is_some())
    }

    /// The pristine trove as installed
    pub fn get_trove(&self, tuple: &TroveTuple) -> Result<Option<Trove>> {
        load_trove(&self.conn, tuple)
    }

    fn tuples(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<TroveTuple>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut tuples = rows
            .into_iter()
            .map(|(name, version, flavor)| Ok(TroveTuple::new(name, Version::thaw(&version)?, Flavor::thaw(&flavor)?)))
            .collect::<Result<Vec<_>>>()?;
        tuples.sort();
        Ok(tuples)
    }

    pub fn installed(&self) -> Result<Vec<TroveTuple>> {
        self.tuples("SELECT troveName, frozenVersion, flavor FROM Instances", params![])
    }

    pub fn installed_named(&self, name: &str) -> Result<Vec<TroveTuple>> {
        self.tuples(
            "SELECT troveName, frozenVersion, flavor FROM Instances WHERE troveName = ?1",
            params![name],
        )
    }

    /// Installed troves matching `name` and an optional version spec
    pub fn find(&self, name: &str, version_spec: Option<&str>) -> Result<Vec<TroveTuple>> {
        crate::finder::find_installed(self, name, version_spec)
    }

    pub fn set_pinned(&mut self, tuple: &TroveTuple, pinned: bool) -> Result<()> {
        let id = instance_id(&self.conn, tuple)?.ok_or_else(|| Error::TroveNotFound(tuple.to_string()))?;
        self.conn
            .execute("UPDATE Instances SET pinned = ?1 WHERE instanceId = ?2", params![pinned, id])?;
        Ok(())
    }

    pub fn is_pinned(&self, tuple: &TroveTuple) -> Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT pinned FROM Instances WHERE troveName = ?1 AND version = ?2 AND flavor = ?3",
                params![tuple.name, tuple.version.as_string(), tuple.flavor.freeze()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(false))
    }

    /// Paths carrying `tag`, sorted
    pub fn iter_files_with_tag(&self, tag: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT path FROM FileTags WHERE tag = ?1 ORDER BY path")?;
        let paths = stmt
            .query_map([tag], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    pub fn tags_of(&self, path: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare("SELECT tag FROM FileTags WHERE path = ?1")?;
        let tags = stmt
            .query_map([path], |row| row.get(0))?
            .collect::<std::result::Result<BTreeSet<String>, _>>()?;
        Ok(tags)
    }

    pub fn owner_of(&self, path: &str) -> Result<Option<TroveTuple>> {
        Ok(self.file_info(path)?.map(|f| f.tuple))
    }

    pub fn file_info(&self, path: &str) -> Result<Option<InstalledFile>> {
        let sql = format!("SELECT {} WHERE f.path = ?1", FILE_COLUMNS);
        let raw = self.conn.query_row(&sql, [path], raw_file).optional()?;
        raw.map(decode_file).transpose()
    }

    pub fn file_by_path_id(&self, path_id: &PathId) -> Result<Option<InstalledFile>> {
        let sql = format!("SELECT {} WHERE f.pathId = ?1 ORDER BY f.path LIMIT 1", FILE_COLUMNS);
        let raw = self.conn.query_row(&sql, [path_id.0.as_slice()], raw_file).optional()?;
        raw.map(decode_file).transpose()
    }

    fn query_files(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<InstalledFile>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, raw_file)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raws.into_iter().map(decode_file).collect()
    }

    /// Paths currently owned by `tuple`, by path
    pub fn files_of(&self, tuple: &TroveTuple) -> Result<Vec<InstalledFile>> {
        let Some(id) = instance_id(&self.conn, tuple)? else {
            return Ok(Vec::new());
        };
        let sql = format!("SELECT {} WHERE f.instanceId = ?1 ORDER BY f.path", FILE_COLUMNS);
        self.query_files(&sql, params![id])
    }

    pub fn all_files(&self) -> Result<Vec<InstalledFile>> {
        let sql = format!("SELECT {} ORDER BY f.path", FILE_COLUMNS);
        self.query_files(&sql, params![])
    }

    pub fn link_group_members(&self, group: &[u8]) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM LinkGroups WHERE linkGroup = ?1 ORDER BY path")?;
        let paths = stmt
            .query_map([group], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(paths)
    }

    pub fn is_user_removed(&self, path: &str) -> Result<bool> {
        Ok(self
            .conn
            .query_row("SELECT 1 FROM UserRemovals WHERE path = ?1", [path], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Remove an owned file from disk and remember that the user wants it gone
    pub fn remove_files_local(&mut self, path: &str) -> Result<()> {
        let info = self
            .file_info(path)?
            .ok_or_else(|| Error::NotFound(format!("{} is not owned by any trove", path)))?;
        let disk = under_root(&self.root, path)?;
        info.stream.remove(&disk)?;
        self.conn
            .execute("INSERT OR IGNORE INTO UserRemovals (path) VALUES (?1)", [path])?;
        info!("removed {} (owned by {})", path, info.tuple);
        Ok(())
    }

    pub fn overlay(&self, path: &str) -> Result<Option<Sha1Digest>> {
        let sha: Option<Vec<u8>> = self
            .conn
            .query_row("SELECT sha1 FROM ConfigOverlay WHERE path = ?1", [path], |row| row.get(0))
            .optional()?;
        Ok(sha.map(|s| Sha1Digest::from_slice(&s)).transpose()?)
    }

    pub fn stream(&self, file_id: &FileId) -> Result<Option<FileStream>> {
        load_stream(&self.conn, file_id)
    }

    /// Pristine contents of a config or initial-contents file
    pub fn pristine_contents(&self, stream: &FileStream) -> Result<Option<Vec<u8>>> {
        match stream.contents_sha1() {
            Some(sha1) if self.blobs.exists(&sha1) => self.blobs.retrieve(&sha1).map(Some),
            _ => Ok(None),
        }
    }

    pub fn store_pristine(&self, contents: &[u8]) -> Result<Sha1Digest> {
        self.blobs.store(contents)
    }

    /// Files whose disk state drifted from the stored stream
    ///
    /// Each drifted file becomes a full file change carrying the on-disk
    /// stream and, for regular files, its contents. Missing and
    /// user-removed files are left out.
    pub fn local_changes(&self, only: Option<&BTreeSet<PathId>>) -> Result<ChangeSet> {
        let mut cs = ChangeSet::new();
        for file in self.all_files()? {
            if only.is_some_and(|set| !set.contains(&file.path_id)) {
                continue;
            }
            if self.is_user_removed(&file.path)? {
                continue;
            }
            let disk = under_root(&self.root, &file.path)?;
            if fs::symlink_metadata(&disk).is_err() {
                continue;
            }
            let on_disk = FileStream::from_path(&disk)?;
            if on_disk.same_metadata(&file.stream) {
                continue;
            }
            debug!("{} drifted from its stored stream", file.path);
            cs.add_file(
                file.path_id,
                FileChange {
                    old_file_id: Some(file.file_id),
                    new_file_id: on_disk.file_id(),
                    stream: on_disk.freeze(),
                },
            )?;
            if on_disk.kind() == FileKind::Regular {
                cs.add_contents(file.path_id, FileContents::File(fs::read(&disk)?))?;
            }
        }
        Ok(cs)
    }

    /// Record an applied change set
    ///
    /// Everything happens in one SQL transaction: erased and replaced
    /// instances go (taking their rows with them), new instances come in
    /// with a row per file. A path already owned elsewhere moves to the
    /// new owner.
    pub fn commit(&mut self, cs: &ChangeSet, result: &FsResult) -> Result<()> {
        let tx = self.conn.transaction()?;

        for tuple in cs.erasures() {
            match instance_id(&tx, tuple)? {
                Some(id) => {
                    tx.execute("DELETE FROM Instances WHERE instanceId = ?1", [id])?;
                    debug!("erased {}", tuple);
                }
                None => return Err(Error::TroveMissing(tuple.to_string())),
            }
        }

        for tcs in cs.troves() {
            let old = match tcs.old_tuple() {
                Some(old_tuple) => {
                    let trove =
                        load_trove(&tx, &old_tuple)?.ok_or_else(|| Error::TroveMissing(old_tuple.to_string()))?;
                    Some(trove)
                }
                None => None,
            };
            let new = tcs.apply(old.as_ref())?;
            insert_trove(&tx, cs, old.as_ref(), &new, result)?;
        }

        for (path, sha1) in &result.overlays {
            match sha1 {
                Some(sha1) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO ConfigOverlay (path, sha1)
                         SELECT path, ?2 FROM DBTroveFiles WHERE path = ?1",
                        params![path, sha1.as_bytes().as_slice()],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM ConfigOverlay WHERE path = ?1", [path])?;
                }
            }
        }

        tx.commit()?;
        info!("committed {} trove(s), {} erasure(s)", cs.trove_count(), cs.erasures().count());
        Ok(())
    }
}

fn insert_trove(
    tx: &Transaction<'_>,
    cs: &ChangeSet,
    old: Option<&Trove>,
    new: &Trove,
    result: &FsResult,
) -> Result<()> {
    let mut old_streams: HashMap<PathId, FileStream> = HashMap::new();
    if let Some(old) = old {
        for (path_id, entry) in old.files() {
            if let Some(stream) = load_stream(tx, &entry.file_id)? {
                old_streams.insert(*path_id, stream);
            }
        }
        if let Some(id) = instance_id(tx, &old.tuple())? {
            tx.execute("DELETE FROM Instances WHERE instanceId = ?1", [id])?;
        }
    }

    let tuple = new.tuple();
    tx.execute(
        "INSERT INTO Instances (troveName, version, frozenVersion, flavor, pristine)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            tuple.name,
            tuple.version.as_string(),
            tuple.version.freeze(),
            tuple.flavor.freeze(),
            new.freeze()
        ],
    )?;
    let id = tx.last_insert_rowid();

    for (path_id, entry) in new.files() {
        let stream = match cs.file(path_id) {
            Some(change) if change.new_file_id == entry.file_id => change.new_stream(old_streams.get(path_id))?,
            _ => match old_streams.get(path_id).filter(|s| s.file_id() == entry.file_id) {
                Some(stream) => stream.clone(),
                None => load_stream(tx, &entry.file_id)?.ok_or_else(|| {
                    Error::TroveMissing(format!("file stream {} for {}", entry.file_id, entry.path))
                })?,
            },
        };

        tx.execute(
            "INSERT OR IGNORE INTO FileStreams (fileId, stream) VALUES (?1, ?2)",
            params![entry.file_id.as_bytes().as_slice(), stream.freeze()],
        )?;
        tx.execute("DELETE FROM DBTroveFiles WHERE path = ?1", [&entry.path])?;
        tx.execute(
            "INSERT INTO DBTroveFiles (instanceId, pathId, path, fileId, fileVersion)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                path_id.0.as_slice(),
                entry.path,
                entry.file_id.as_bytes().as_slice(),
                entry.version.freeze()
            ],
        )?;

        let tags = result.tags.get(&entry.path).cloned().unwrap_or_else(|| stream.tags());
        for tag in tags {
            tx.execute("INSERT INTO FileTags (path, tag) VALUES (?1, ?2)", params![entry.path, tag])?;
        }
        if let Some(group) = stream.link_group() {
            tx.execute(
                "INSERT INTO LinkGroups (linkGroup, path) VALUES (?1, ?2)",
                params![group, entry.path],
            )?;
        }
        if result.user_removed.contains(&entry.path) {
            tx.execute("INSERT INTO UserRemovals (path) VALUES (?1)", [&entry.path])?;
        }
    }
    debug!("recorded {} with {} file(s)", tuple, new.file_count());
    Ok(())
}

impl PreState for LocalDatabase {
    fn trove(&self, tuple: &TroveTuple) -> Result<Option<Trove>> {
        self.get_trove(tuple)
    }

    fn file_stream(&self, _path_id: &PathId, file_id: &FileId) -> Result<Option<FileStream>> {
        self.stream(file_id)
    }

    /// Disk contents when they still match the stream, else the pristine blob
    fn file_contents(&self, path_id: &PathId, stream: &FileStream) -> Result<Option<Vec<u8>>> {
        if let Some(file) = self.file_by_path_id(path_id)? {
            let disk = under_root(&self.root, &file.path)?;
            if let Ok(bytes) = fs::read(&disk)
                && Some(Sha1Digest::of(&bytes)) == stream.contents_sha1()
            {
                return Ok(Some(bytes));
            }
        }
        self.pristine_contents(stream)
    }
}

impl TroveSource for LocalDatabase {
    fn get_trove(&self, tuple: &TroveTuple) -> Result<Option<Trove>> {
        LocalDatabase::get_trove(self, tuple)
    }

    fn has_trove(&self, tuple: &TroveTuple) -> Result<bool> {
        self.has(tuple)
    }

    fn versions_of(&self, name: &str) -> Result<Vec<TroveTuple>> {
        self.installed_named(name)
    }

    fn providers(&self, class: DepClass, dep: &Dependency) -> Result<Vec<TroveTuple>> {
        let mut found = Vec::new();
        for tuple in self.installed()? {
            if let Some(trove) = self.get_trove(&tuple)?
                && trove.provides().satisfies_atom(class, dep)
            {
                found.push(tuple);
            }
        }
        Ok(found)
    }

    fn get_file_stream(&self, file_id: &FileId) -> Result<Option<FileStream>> {
        self.stream(file_id)
    }

    fn get_file_contents(&self, sha1: &Sha1Digest) -> Result<Option<Vec<u8>>> {
        if !self.blobs.exists(sha1) {
            return Ok(None);
        }
        self.blobs.retrieve(sha1).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::tests::{trove_cs, version};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> LocalDatabase {
        fs::create_dir_all(tmp.path().join("root")).unwrap();
        LocalDatabase::open(tmp.path().join("db"), tmp.path().join("root")).unwrap()
    }

    #[test]
    fn test_commit_install_and_query() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(&tmp);
        let v = version("/local@rpl:devel/1.0-1-1", 100);
        let (trove, cs) = trove_cs("foo:runtime", &v, &[("/usr/bin/foo", b"foo"), ("/usr/lib/libfoo.so", b"lib")]);

        db.commit(&cs, &FsResult::default()).unwrap();
        assert!(db.has(&trove.tuple()).unwrap());
        assert_eq!(db.installed().unwrap(), vec![trove.tuple()]);
        assert_eq!(db.get_trove(&trove.tuple()).unwrap().unwrap(), trove);
        assert_eq!(db.owner_of("/usr/bin/foo").unwrap(), Some(trove.tuple()));
        assert_eq!(db.files_of(&trove.tuple()).unwrap().len(), 2);
        assert_eq!(db.owner_of("/nope").unwrap(), None);
    }

    #[test]
    fn test_commit_transfers_ownership() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(&tmp);
        let v = version("/local@rpl:devel/1.0-1-1", 100);
        let (a, cs_a) = trove_cs("a:runtime", &v, &[("/usr/bin/x", b"a")]);
        let (b, cs_b) = trove_cs("b:runtime", &v, &[("/usr/bin/x", b"b")]);
        db.commit(&cs_a, &FsResult::default()).unwrap();
        db.commit(&cs_b, &FsResult::default()).unwrap();

        assert_eq!(db.owner_of("/usr/bin/x").unwrap(), Some(b.tuple()));
        assert!(db.files_of(&a.tuple()).unwrap().is_empty());
        // the pristine trove still lists the file
        assert_eq!(db.get_trove(&a.tuple()).unwrap().unwrap().file_count(), 1);
    }

    #[test]
    fn test_erasure_drops_rows_and_tags() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(&tmp);
        let v = version("/local@rpl:devel/1.0-1-1", 100);
        let (a, cs) = trove_cs("a:lib", &v, &[("/usr/lib/liba.so.1", b"elf")]);
        let mut result = FsResult::default();
        result
            .tags
            .insert("/usr/lib/liba.so.1".to_string(), ["shlib".to_string()].into_iter().collect());
        db.commit(&cs, &result).unwrap();
        assert_eq!(db.iter_files_with_tag("shlib").unwrap(), vec!["/usr/lib/liba.so.1".to_string()]);

        let mut erase = ChangeSet::new();
        erase.add_erasure(a.tuple());
        db.commit(&erase, &FsResult::default()).unwrap();
        assert!(!db.has(&a.tuple()).unwrap());
        assert!(db.iter_files_with_tag("shlib").unwrap().is_empty());

        assert!(matches!(db.commit(&erase, &FsResult::default()), Err(Error::TroveMissing(_))));
    }

    #[test]
    fn test_remove_files_local_records_removal() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(&tmp);
        let v = version("/local@rpl:devel/1.0-1-1", 100);
        let (_, cs) = trove_cs("a:runtime", &v, &[("/etc/motd", b"hi")]);
        db.commit(&cs, &FsResult::default()).unwrap();
        let disk = tmp.path().join("root/etc/motd");
        fs::create_dir_all(disk.parent().unwrap()).unwrap();
        fs::write(&disk, b"hi").unwrap();

        db.remove_files_local("/etc/motd").unwrap();
        assert!(!disk.exists());
        assert!(db.is_user_removed("/etc/motd").unwrap());
        assert!(db.remove_files_local("/etc/other").is_err());
    }

    #[test]
    fn test_local_changes_report_drift() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(&tmp);
        let v = version("/local@rpl:devel/1.0-1-1", 100);
        let (_, cs) = trove_cs("a:runtime", &v, &[("/etc/a", b"one"), ("/etc/b", b"two")]);
        db.commit(&cs, &FsResult::default()).unwrap();

        let etc = tmp.path().join("root/etc");
        fs::create_dir_all(&etc).unwrap();
        FileStream::regular(b"one", 0o644)
            .restore(&etc.join("a"), Some(&mut &b"one"[..]))
            .unwrap();
        fs::write(etc.join("b"), b"edited").unwrap();
        fs::set_permissions(etc.join("b"), fs::Permissions::from_mode(0o644)).unwrap();

        let local = db.local_changes(None).unwrap();
        let changed: Vec<_> = local.files().map(|(p, _)| *p).collect();
        assert_eq!(changed, vec![PathId::for_path("/etc/b")]);
        assert_eq!(local.resolve_contents(&PathId::for_path("/etc/b")), Some(&b"edited"[..]));
    }

    #[test]
    fn test_pinning() {
        let tmp = TempDir::new().unwrap();
        let mut db = open(&tmp);
        let v = version("/local@rpl:devel/1.0-1-1", 100);
        let (a, cs) = trove_cs("a:runtime", &v, &[]);
        db.commit(&cs, &FsResult::default()).unwrap();
        assert!(!db.is_pinned(&a.tuple()).unwrap());
        db.set_pinned(&a.tuple(), true).unwrap();
        assert!(db.is_pinned(&a.tuple()).unwrap());
    }
}
