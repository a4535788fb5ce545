// src/repository/mod.rs

//! Repository store
//!
//! A repository directory holds the trove database (`repo.db`) and the
//! content blob store (`contents/`). Committed rows are immutable; hiding
//! an instance is logical and [`Repository::gc`] reclaims what nothing
//! live references.
//!
//! There is one writer per repository. Each commit runs in an immediate
//! transaction whose first statement bumps `CommitLock`, so a second
//! writer blocks on the backend instead of interleaving.

mod csbuild;
pub mod protocol;
mod query;
pub mod schema;
mod store;

pub use csbuild::{ChangeSetJob, ChangeSetOptions, ChangeSetResult};
pub use protocol::{AccessHook, ContentRef, Request, Response, RepositoryServer};
pub use query::{QueryMap, VersionFlavorMap};

use crate::changeset::{ChangeSet, FileContents};
use crate::dependencies::{DepClass, Dependency};
use crate::error::{Error, Result};
use crate::files::{FileId, FileStream, PathId};
use crate::filesystem::BlobStore;
use crate::hash::Sha1Digest;
use crate::source::TroveSource;
use crate::trove::{Trove, TroveTuple};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const DB_FILE: &str = "repo.db";
const CONTENTS_DIR: &str = "contents";

/// Flags for [`Repository::commit_change_set`]
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOptions {
    /// Keep trove digests as sent instead of recomputing them
    pub mirror: bool,
    /// Commit the instances hidden (isPresent = 0)
    pub hidden: bool,
}

/// What a GC pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub instances: usize,
    pub streams: usize,
    pub blobs: usize,
}

pub struct Repository {
    root: PathBuf,
    conn: Connection,
    blobs: BlobStore,
}

impl Repository {
    /// Create a repository directory, or open the existing one in it
    pub fn init<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| Error::InitError(format!("cannot create {}: {}", root.display(), e)))?;
        let repo = Self::connect(root)?;
        info!("Initialized repository at {}", root.display());
        Ok(repo)
    }

    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if !root.join(DB_FILE).exists() {
            return Err(Error::DatabaseNotFound(root.join(DB_FILE).display().to_string()));
        }
        Self::connect(root)
    }

    fn connect(root: &Path) -> Result<Self> {
        let conn = Connection::open(root.join(DB_FILE))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::migrate(&conn)?;
        Ok(Self {
            root: root.to_path_buf(),
            conn,
            blobs: BlobStore::new(root.join(CONTENTS_DIR))?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Commit every trove of `cs`; returns the committed tuples in order
    pub fn commit_change_set(&mut self, cs: &ChangeSet, options: CommitOptions) -> Result<Vec<TroveTuple>> {
        with_retry(|| self.commit_once(cs, options))
    }

    fn commit_once(&mut self, cs: &ChangeSet, options: CommitOptions) -> Result<Vec<TroveTuple>> {
        if cs.erasures().next().is_some() {
            return Err(Error::Integrity("a repository commit cannot erase troves".to_string()));
        }

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("UPDATE CommitLock SET lockCount = lockCount + 1", [])?;

        // Build every new trove first so sub-trove references can point
        // inside this same commit
        let mut pending: Vec<Trove> = Vec::new();
        for tcs in cs.troves() {
            let old = match tcs.old_tuple() {
                Some(old_tuple) => {
                    let (id, _) = store::instance_id(&tx, &old_tuple)?
                        .ok_or_else(|| Error::TroveMissing(old_tuple.to_string()))?;
                    Some(store::load_trove(&tx, id)?)
                }
                None => None,
            };
            let mut trove = tcs.apply(old.as_ref())?;
            validate_new_trove(&tx, &trove)?;
            if options.mirror {
                trove.verify_digests()?;
            } else {
                trove.compute_digests();
            }
            pending.push(trove);
        }

        let mut committed = Vec::with_capacity(pending.len());
        let mut instances = Vec::with_capacity(pending.len());
        for trove in &pending {
            let streams = store_files(&tx, &self.blobs, cs, trove)?;
            let id = store::insert_trove(&tx, trove, !options.hidden, &streams)?;
            debug!("Committed {} as instance {}", trove.tuple(), id);
            instances.push(id);
            committed.push(trove.tuple());
        }
        for (trove, id) in pending.iter().zip(&instances) {
            store::insert_trove_refs(&tx, *id, trove)?;
        }

        tx.commit()?;
        info!("Committed {} trove(s)", committed.len());
        Ok(committed)
    }

    pub fn has_trove(&self, tuple: &TroveTuple) -> Result<bool> {
        Ok(matches!(store::instance_id(&self.conn, tuple)?, Some((_, true))))
    }

    /// A present trove by tuple
    pub fn get_trove(&self, tuple: &TroveTuple) -> Result<Option<Trove>> {
        match store::instance_id(&self.conn, tuple)? {
            Some((id, true)) => Ok(Some(store::load_trove(&self.conn, id)?)),
            _ => Ok(None),
        }
    }

    pub fn get_file_stream(&self, file_id: &FileId) -> Result<Option<FileStream>> {
        Ok(store::stream_by_file_id(&self.conn, file_id)?.map(|(_, s)| s))
    }

    /// Contents of a regular file stream
    pub fn get_file_contents(&self, file_id: &FileId) -> Result<Vec<u8>> {
        let stream = self
            .get_file_stream(file_id)?
            .ok_or_else(|| Error::TroveNotFound(format!("file stream {}", file_id)))?;
        let sha1 = stream
            .contents_sha1()
            .ok_or_else(|| Error::NotFound(format!("file {} has no contents", file_id)))?;
        self.blobs.retrieve(&sha1)
    }

    /// Hide or unhide an instance; `Latest` follows in the same transaction
    pub fn set_present(&mut self, tuple: &TroveTuple, present: bool) -> Result<()> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("UPDATE CommitLock SET lockCount = lockCount + 1", [])?;
        let (id, _) = store::instance_id(&tx, tuple)?.ok_or_else(|| Error::TroveNotFound(tuple.to_string()))?;
        tx.execute(
            "UPDATE Instances SET isPresent = ?1 WHERE instanceId = ?2",
            params![present, id],
        )?;
        let (item, branch, flavor): (i64, i64, i64) = tx.query_row(
            "SELECT Instances.itemId, Nodes.branchId, Instances.flavorId FROM Instances
             JOIN Nodes ON Nodes.itemId = Instances.itemId AND Nodes.versionId = Instances.versionId
             WHERE instanceId = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        store::refresh_latest(&tx, item, branch, flavor)?;
        tx.commit()?;
        debug!("Set {} present={}", tuple, present);
        Ok(())
    }

    /// Remove hidden instances nothing includes, then orphaned streams,
    /// then blobs whose reference count dropped to zero
    pub fn gc(&mut self) -> Result<GcStats> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("UPDATE CommitLock SET lockCount = lockCount + 1", [])?;
        let mut stats = GcStats::default();

        let doomed: Vec<i64> = tx
            .prepare(
                "SELECT instanceId FROM Instances WHERE isPresent = 0
                 AND instanceId NOT IN (
                     SELECT includedId FROM TroveTroves
                     JOIN Instances AS Parent ON Parent.instanceId = TroveTroves.instanceId
                     WHERE Parent.isPresent = 1)",
            )?
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        for id in &doomed {
            for table in ["TroveFiles", "Provides", "Requires", "TroveTroves"] {
                tx.execute(&format!("DELETE FROM {} WHERE instanceId = ?1", table), [id])?;
            }
            tx.execute("DELETE FROM TroveTroves WHERE includedId = ?1", [id])?;
            tx.execute("DELETE FROM Instances WHERE instanceId = ?1", [id])?;
        }
        stats.instances = doomed.len();
        tx.execute(
            "DELETE FROM Nodes WHERE NOT EXISTS (
                 SELECT 1 FROM Instances
                 WHERE Instances.itemId = Nodes.itemId AND Instances.versionId = Nodes.versionId)",
            [],
        )?;

        let orphans: Vec<(i64, Option<Vec<u8>>)> = tx
            .prepare(
                "SELECT streamId, sha1 FROM FileStreams
                 WHERE streamId NOT IN (SELECT streamId FROM TroveFiles)",
            )?
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        for (stream_id, sha1) in &orphans {
            if let Some(sha1) = sha1 {
                tx.execute("UPDATE BlobRefs SET refCount = refCount - 1 WHERE sha1 = ?1", [sha1])?;
            }
            tx.execute("DELETE FROM FileStreams WHERE streamId = ?1", [stream_id])?;
        }
        stats.streams = orphans.len();

        let dead: Vec<Vec<u8>> = tx
            .prepare("SELECT sha1 FROM BlobRefs WHERE refCount <= 0")?
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        tx.execute("DELETE FROM BlobRefs WHERE refCount <= 0", [])?;

        // files left by a commit that never reached the database; the
        // commit lock keeps a concurrent writer from adding blobs here
        let known: HashSet<Vec<u8>> = tx
            .prepare("SELECT sha1 FROM BlobRefs")?
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        let dead_set: HashSet<&[u8]> = dead.iter().map(Vec::as_slice).collect();
        for digest in self.blobs.digests()? {
            let key = &digest.as_bytes()[..];
            if !known.contains(key) && !dead_set.contains(key) && self.blobs.remove(&digest)? {
                stats.blobs += 1;
            }
        }
        tx.commit()?;

        // blob files go only once the rows that counted them are gone
        for sha1 in &dead {
            if self.blobs.remove(&Sha1Digest::from_slice(sha1)?)? {
                stats.blobs += 1;
            }
        }
        info!(
            "GC removed {} instance(s), {} stream(s), {} blob(s)",
            stats.instances, stats.streams, stats.blobs
        );
        Ok(stats)
    }

    pub fn add_pgp_key(&mut self, fingerprint: &str, key: &[u8], subkeys: &[&str]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO PGPKeys (fingerprint, pgpKey) VALUES (?1, ?2)",
            params![fingerprint, key],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                Error::AlreadyExists(format!("key {}", fingerprint))
            }
            other => other.into(),
        })?;
        let key_id = tx.last_insert_rowid();
        for fp in std::iter::once(&fingerprint).chain(subkeys) {
            tx.execute(
                "INSERT INTO PGPFingerprints (keyId, fingerprint) VALUES (?1, ?2)",
                params![key_id, fp],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Key material for a primary or subkey fingerprint
    pub fn get_pgp_key(&self, fingerprint: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT pgpKey FROM PGPKeys JOIN PGPFingerprints USING (keyId)
                 WHERE PGPFingerprints.fingerprint = ?1",
                [fingerprint],
                |row| row.get(0),
            )
            .optional()?)
    }
}

/// Make sure every file of `trove` has a stored stream and contents
fn store_files(conn: &Connection, blobs: &BlobStore, cs: &ChangeSet, trove: &Trove) -> Result<BTreeMap<PathId, i64>> {
    let mut ids = BTreeMap::new();
    for (path_id, entry) in trove.files() {
        if let Some((id, _)) = store::stream_by_file_id(conn, &entry.file_id)? {
            ids.insert(*path_id, id);
            continue;
        }
        let change = cs
            .file(path_id)
            .filter(|c| c.new_file_id == entry.file_id)
            .ok_or_else(|| Error::TroveMissing(format!("file stream {} for {}", entry.file_id, entry.path)))?;
        let old = match change.old_file_id {
            Some(old_id) => Some(
                store::stream_by_file_id(conn, &old_id)?
                    .map(|(_, s)| s)
                    .ok_or_else(|| Error::TroveMissing(format!("file stream {}", old_id)))?,
            ),
            None => None,
        };
        let stream = change.new_stream(old.as_ref())?;
        store_contents(blobs, cs, path_id, &stream, old.as_ref())?;
        let (id, _) = store::insert_stream(conn, &stream)?;
        ids.insert(*path_id, id);
    }
    Ok(ids)
}

fn store_contents(
    blobs: &BlobStore,
    cs: &ChangeSet,
    path_id: &PathId,
    stream: &FileStream,
    old: Option<&FileStream>,
) -> Result<()> {
    let Some(sha1) = stream.contents_sha1() else {
        return Ok(());
    };
    let bytes = match cs.contents(path_id) {
        Some(FileContents::Diff(diff)) => {
            let base_sha1 = old
                .and_then(FileStream::contents_sha1)
                .ok_or_else(|| Error::Integrity(format!("diff contents for {} without a base", path_id)))?;
            let base = blobs.retrieve(&base_sha1)?;
            Some(crate::update::patch::apply_strict(&base, diff)?)
        }
        Some(_) => cs.resolve_contents(path_id).map(<[u8]>::to_vec),
        None => None,
    };
    match bytes {
        Some(bytes) => {
            let actual = Sha1Digest::of(&bytes);
            if actual != sha1 {
                return Err(Error::Integrity(format!(
                    "contents for {} hash to {} but the stream says {}",
                    path_id, actual, sha1
                )));
            }
            blobs.store(&bytes)?;
            Ok(())
        }
        None if blobs.exists(&sha1) => Ok(()),
        None => Err(Error::TroveMissing(format!("contents {} for pathId {}", sha1, path_id))),
    }
}

/// Commit-time checks on a fully built trove
fn validate_new_trove(conn: &Connection, trove: &Trove) -> Result<()> {
    let tuple = trove.tuple();
    if store::instance_id(conn, &tuple)?.is_some() {
        return Err(Error::AlreadyExists(tuple.to_string()));
    }
    if !trove.version().has_timestamps() {
        return Err(Error::Integrity(format!("{} has no timestamps", tuple)));
    }
    trove.verify_self_provide()?;
    if let Some(dep) = trove
        .requires()
        .class_atoms(DepClass::Trove)
        .find(|d| d.name.ends_with(":source"))
    {
        return Err(Error::Integrity(format!(
            "{} requires source trove {}",
            tuple, dep.name
        )));
    }
    Ok(())
}

/// Run `op`, retrying once when the backend reports busy or locked
pub(crate) fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(e) if e.is_transient() => {
            warn!("Backend busy ({}), retrying once", e);
            std::thread::sleep(Duration::from_millis(100));
            op().map_err(|e| if e.is_transient() { Error::Backend(e.to_string()) } else { e })
        }
        other => other,
    }
}

impl TroveSource for Repository {
    fn get_trove(&self, tuple: &TroveTuple) -> Result<Option<Trove>> {
        Repository::get_trove(self, tuple)
    }

    fn has_trove(&self, tuple: &TroveTuple) -> Result<bool> {
        Repository::has_trove(self, tuple)
    }

    fn versions_of(&self, name: &str) -> Result<Vec<TroveTuple>> {
        query::versions_of(&self.conn, name)
    }

    fn providers(&self, class: DepClass, dep: &Dependency) -> Result<Vec<TroveTuple>> {
        query::providers(&self.conn, class, dep)
    }

    fn get_file_stream(&self, file_id: &FileId) -> Result<Option<FileStream>> {
        Repository::get_file_stream(self, file_id)
    }

    fn get_file_contents(&self, sha1: &Sha1Digest) -> Result<Option<Vec<u8>>> {
        if !self.blobs.exists(sha1) {
            return Ok(None);
        }
        self.blobs.retrieve(sha1).map(Some)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dependencies::{DependencySet, Sense};
    use crate::flavor::Flavor;
    use crate::version::Version;
    use tempfile::TempDir;

    pub(crate) fn version(s: &str, ts: u32) -> Version {
        Version::parse(s).unwrap().stamped(ts).unwrap()
    }

    /// A trove with regular files, and the absolute change set carrying it
    pub(crate) fn trove_cs(name: &str, ver: &Version, files: &[(&str, &[u8])]) -> (Trove, ChangeSet) {
        let mut trove = Trove::new(name, ver.clone(), Flavor::empty());
        let mut cs = ChangeSet::new();
        for (path, data) in files {
            let stream = FileStream::regular(data, 0o644);
            let path_id = PathId::for_path(path);
            trove.add_file(path_id, *path, stream.file_id(), ver.clone());
            cs.add_file_stream(path_id, None, &stream).unwrap();
            cs.add_contents(path_id, FileContents::File(data.to_vec())).unwrap();
        }
        cs.add_trove(trove.diff(None)).unwrap();
        (trove, cs)
    }

    #[test]
    fn test_commit_and_get_trove() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 1000);
        let (mut trove, cs) = trove_cs("foo:runtime", &v, &[("/usr/bin/foo", b"#!/bin/sh\n")]);

        let committed = repo.commit_change_set(&cs, CommitOptions::default()).unwrap();
        assert_eq!(committed, vec![trove.tuple()]);

        let back = repo.get_trove(&trove.tuple()).unwrap().unwrap();
        trove.compute_digests();
        assert_eq!(back.freeze(), trove.freeze());
        back.verify_digests().unwrap();

        let (_, entry) = back.files().next().unwrap();
        assert_eq!(repo.get_file_contents(&entry.file_id).unwrap(), b"#!/bin/sh\n");
    }

    #[test]
    fn test_duplicate_commit_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 1000);
        let (_, cs) = trove_cs("foo:runtime", &v, &[]);
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();
        let err = repo.commit_change_set(&cs, CommitOptions::default()).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_empty_trove_round_trips() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/0.1-1-1", 50);
        let (trove, cs) = trove_cs("empty:data", &v, &[]);
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();
        let back = repo.get_trove(&trove.tuple()).unwrap().unwrap();
        assert_eq!(back.file_count(), 0);
        assert_eq!(back.tuple(), trove.tuple());
        assert_eq!(back.version().timestamps(), &[50]);
    }

    #[test]
    fn test_missing_sub_trove_is_trove_missing() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 1000);
        let mut group = Trove::new("group-base", v.clone(), Flavor::empty());
        group.add_trove(TroveTuple::new("absent:runtime", v, Flavor::empty()), true);
        let mut cs = ChangeSet::new();
        cs.add_trove(group.diff(None)).unwrap();
        let err = repo.commit_change_set(&cs, CommitOptions::default()).unwrap_err();
        assert!(matches!(err, Error::TroveMissing(_)));
        assert!(!repo.has_trove(&group.tuple()).unwrap());
    }

    #[test]
    fn test_group_and_member_in_one_commit() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 1000);
        let (member, mut cs) = trove_cs("bash:runtime", &v, &[("/bin/bash", b"elf")]);
        let mut group = Trove::new("group-core", v, Flavor::empty());
        group.add_trove(member.tuple(), true);
        cs.add_trove(group.diff(None)).unwrap();
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();
        let back = repo.get_trove(&group.tuple()).unwrap().unwrap();
        assert_eq!(back.troves().collect::<Vec<_>>(), vec![(&member.tuple(), true)]);
    }

    #[test]
    fn test_group_refs_committed_after_members() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 1000);
        let (bash, cs) = trove_cs("bash:runtime", &v, &[]);
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();
        let (doc, cs) = trove_cs("bash:doc", &v, &[]);
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let mut group = Trove::new("group-shell", v, Flavor::empty());
        group.add_trove(bash.tuple(), true);
        group.add_trove(doc.tuple(), false);
        let mut cs = ChangeSet::new();
        cs.add_trove(group.diff(None)).unwrap();
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let back = repo.get_trove(&group.tuple()).unwrap().unwrap();
        let mut refs: Vec<_> = back.troves().map(|(t, d)| (t.clone(), d)).collect();
        refs.sort();
        assert_eq!(refs, vec![(doc.tuple(), false), (bash.tuple(), true)]);
        // members themselves include nothing
        assert_eq!(repo.get_trove(&bash.tuple()).unwrap().unwrap().troves().count(), 0);
    }

    #[test]
    fn test_hidden_then_gc() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 1000);
        let (trove, cs) = trove_cs("tmp:runtime", &v, &[("/tmp/x", b"only here")]);
        repo.commit_change_set(&cs, CommitOptions { mirror: false, hidden: true }).unwrap();
        assert!(!repo.has_trove(&trove.tuple()).unwrap());

        let sha1 = Sha1Digest::of(b"only here");
        assert!(repo.blobs().exists(&sha1));
        let stats = repo.gc().unwrap();
        assert_eq!(stats, GcStats { instances: 1, streams: 1, blobs: 1 });
        assert!(!repo.blobs().exists(&sha1));
    }

    #[test]
    fn test_shared_blob_survives_gc() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 1000);
        let (keep, cs1) = trove_cs("keep:runtime", &v, &[("/a", b"shared")]);
        repo.commit_change_set(&cs1, CommitOptions::default()).unwrap();

        let mut other = Trove::new("drop:runtime", v.clone(), Flavor::empty());
        let mut stream = FileStream::regular(b"shared", 0o600);
        stream.set_owner("daemon");
        other.add_file(PathId::for_path("/b"), "/b", stream.file_id(), v);
        let mut cs2 = ChangeSet::new();
        cs2.add_file_stream(PathId::for_path("/b"), None, &stream).unwrap();
        cs2.add_trove(other.diff(None)).unwrap();
        repo.commit_change_set(&cs2, CommitOptions::default()).unwrap();

        repo.set_present(&other.tuple(), false).unwrap();
        let stats = repo.gc().unwrap();
        assert_eq!(stats.blobs, 0);
        assert!(repo.has_trove(&keep.tuple()).unwrap());
        assert!(repo.blobs().exists(&Sha1Digest::of(b"shared")));
    }

    #[test]
    fn test_source_trove_not_a_dependency_target() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 1000);
        let mut trove = Trove::new("foo:runtime", v, Flavor::empty());
        trove.requires_mut().add(DepClass::Trove, Dependency::new("foo:source"));
        let mut cs = ChangeSet::new();
        cs.add_trove(trove.diff(None)).unwrap();
        assert!(matches!(
            repo.commit_change_set(&cs, CommitOptions::default()),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_providers_group_flags_per_atom() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/2.7-1-1", 1000);
        let mut libc = Trove::new("glibc:lib", v.clone(), Flavor::empty());
        let mut provides = DependencySet::new();
        provides.add(
            DepClass::Soname,
            Dependency::new("ELF64/libc.so.6")
                .with_flag("GLIBC_2.4", Sense::Required)
                .with_flag("x86_64", Sense::Required),
        );
        provides.add(DepClass::Soname, Dependency::new("ELF64/libm.so.6").with_flag("GLIBC_2.9", Sense::Required));
        provides.add(DepClass::Trove, Dependency::new("glibc:lib"));
        libc.set_provides(provides);
        let mut cs = ChangeSet::new();
        cs.add_trove(libc.diff(None)).unwrap();
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let ok = Dependency::new("ELF64/libc.so.6").with_flag("GLIBC_2.4", Sense::Required);
        assert_eq!(repo.providers(DepClass::Soname, &ok).unwrap(), vec![libc.tuple()]);
        // the flag exists, but on a different atom
        let split = Dependency::new("ELF64/libc.so.6").with_flag("GLIBC_2.9", Sense::Required);
        assert!(repo.providers(DepClass::Soname, &split).unwrap().is_empty());
    }

    #[test]
    fn test_open_missing_repository() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            Repository::open(tmp.path().join("nope")),
            Err(Error::DatabaseNotFound(_))
        ));
    }

    #[test]
    fn test_pgp_keys() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        repo.add_pgp_key("ABCD", b"key", &["EF01"]).unwrap();
        assert_eq!(repo.get_pgp_key("EF01").unwrap(), Some(b"key".to_vec()));
        assert!(matches!(repo.add_pgp_key("ABCD", b"key", &[]), Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_with_retry_passes_through() {
        let mut calls = 0;
        let out: Result<u32> = with_retry(|| {
            calls += 1;
            Err(Error::NotFound("x".to_string()))
        });
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }
}
