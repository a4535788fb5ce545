// src/update/mod.rs

//! Filesystem update engine
//!
//! [`apply_change_set`] takes a change set against a [`LocalDatabase`] and
//! its root through these phases:
//!
//! 1. plan and conflict check (nothing on disk changes)
//! 2. handler-preremove and files-preremove tag handlers
//! 3. removals, reverse lexicographic
//! 4. restores in pathId order, then hard links
//! 5. handler-update, files-update and files-remove tag handlers
//! 6. rollback push, then the database commit
//!
//! Every destructive step is journaled first, so an interrupted update is
//! finished or undone by the next one to run.

pub mod patch;
mod plan;
mod resolve;
pub mod taghandler;

pub use resolve::{missing_requirements, resolve_change_set, stage_change_set, update_from_repository};

pub use taghandler::{
    Action, DataSource, ExternalHandler, HandlerContext, ShlibHandler, TagDescription, TagHandler, TagRegistry,
    TaggedFile, Target,
};

use crate::changeset::ChangeSet;
use crate::error::{Error, Result};
use crate::files::{FileKind, PathId};
use crate::filesystem::path::under_root;
use crate::hash::Sha1Digest;
use crate::local::journal::{self, Journal, JournalRecord};
use crate::local::LocalDatabase;
use crate::trove::TroveTuple;
use fs2::FileExt;
use plan::{Contents, Plan};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Cursor, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LOCK_FILE: &str = "update.lock";

/// Shared flag a caller sets to stop an update
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Take over paths owned by other troves and replace conflicting files
    pub replace_files: bool,
    /// Fail instead of writing `.conflicts` files when a merge has rejects
    pub strict_merge: bool,
    /// Plan only
    pub test: bool,
    pub cancel: Option<CancelToken>,
    /// Tag descriptions directory; defaults to `<root>/etc/conary/tags`
    pub tag_dir: Option<PathBuf>,
    /// Glob patterns of trove names that must not be touched
    pub pins: Vec<String>,
    /// Rollback stack cap; 0 keeps everything
    pub keep_rollbacks: usize,
}

impl UpdateOptions {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Update,
    /// Applying a rollback entry: no merging, no pins, no new rollback
    Rollback,
}

/// One filesystem operation, in execution order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum FsOp {
    Remove {
        path: String,
    },
    Restore {
        path: String,
    },
    /// Config file written with local changes merged in
    Merge {
        path: String,
        conflicts: bool,
    },
    /// Contents stay, metadata is reapplied
    Metadata {
        path: String,
    },
    Link {
        path: String,
        target: String,
    },
    Tag {
        tag: String,
        target: Target,
        action: Action,
        files: usize,
    },
}

/// What an update did (or, in test mode, would do)
#[derive(Debug, Clone, Default)]
pub struct UpdateJob {
    ops: Vec<FsOp>,
    pub installed: Vec<TroveTuple>,
    pub removed: Vec<TroveTuple>,
    /// Paths that got a `.conflicts` file next to them
    pub conflicts: Vec<String>,
    /// Rollback entry pushed for this update
    pub rollback: Option<usize>,
    /// Disk reads made to resolve shared contents
    pub ptr_reads: usize,
}

impl UpdateJob {
    fn from_plan(plan: &Plan) -> Self {
        let mut ops = Vec::new();
        for removal in &plan.removals {
            ops.push(FsOp::Remove {
                path: removal.path.clone(),
            });
        }
        for restore in &plan.restores {
            let path = restore.path.clone();
            ops.push(if restore.merged {
                FsOp::Merge {
                    path,
                    conflicts: restore.conflicts.is_some(),
                }
            } else if restore.contents == Contents::Keep {
                FsOp::Metadata { path }
            } else {
                FsOp::Restore { path }
            });
        }
        for link in &plan.links {
            ops.push(FsOp::Link {
                path: link.path.clone(),
                target: link.target.clone(),
            });
        }
        Self {
            ops,
            installed: plan.installed.clone(),
            removed: plan.removed.clone(),
            ..Self::default()
        }
    }

    pub fn fs_ops(&self) -> &[FsOp] {
        &self.ops
    }

    pub fn is_noop(&self) -> bool {
        self.ops.is_empty() && self.installed.is_empty() && self.removed.is_empty()
    }
}

/// Apply `cs` to the database's root
pub fn apply_change_set(db: &mut LocalDatabase, cs: &ChangeSet, opts: &UpdateOptions) -> Result<UpdateJob> {
    let _lock = lock_updates(db)?;
    apply(db, cs, None, opts, Mode::Update)
}

/// Undo the most recent update and drop its rollback entry
///
/// The repository half is applied first, then the local half puts back
/// the on-disk state of files that had drifted from pristine.
pub fn rollback_one(db: &mut LocalDatabase, opts: &UpdateOptions) -> Result<UpdateJob> {
    let _lock = lock_updates(db)?;
    for outcome in journal::recover(db)? {
        info!("recovered {:?}", outcome);
    }
    let entry = db
        .rollbacks()
        .last()?
        .ok_or_else(|| Error::NotFound("no rollback to apply".to_string()))?;
    info!("applying rollback {}", entry.index);
    let mut job = apply(db, &entry.repos, Some(&entry.local), opts, Mode::Rollback)?;
    if !opts.test {
        db.rollbacks_mut().pop(entry.index)?;
    }
    job.rollback = Some(entry.index);
    Ok(job)
}

fn apply(
    db: &mut LocalDatabase,
    cs: &ChangeSet,
    local: Option<&ChangeSet>,
    opts: &UpdateOptions,
    mode: Mode,
) -> Result<UpdateJob> {
    let started = Instant::now();
    for outcome in journal::recover(db)? {
        info!("recovered {:?}", outcome);
    }

    let registry = TagRegistry::load(db.root(), opts.tag_dir.as_deref())?;
    let mut plan = plan::plan(db, cs, opts, mode, &registry)?;
    if opts.cancelled() {
        return Err(Error::Cancelled);
    }
    let mut job = UpdateJob::from_plan(&plan);
    if plan.is_noop() && local.is_none_or(ChangeSet::is_empty) {
        info!("nothing to do");
        return Ok(job);
    }
    if opts.test {
        return Ok(job);
    }

    let rollback = match mode {
        Mode::Update => Some((plan.effective.invert(&*db)?, db.local_changes(Some(&plan.touched))?)),
        Mode::Rollback => None,
    };

    let tx = uuid::Uuid::new_v4().to_string();
    let mut journal = Journal::create(&db.journal_dir(), &tx)?;
    journal.write_barrier(&JournalRecord::Begin {
        tx_uuid: tx.clone(),
        root: db.root().to_path_buf(),
        description: describe(&plan),
        timestamp: chrono::Utc::now(),
    })?;
    journal.write_barrier(&JournalRecord::Plan {
        operations: job.ops.clone(),
    })?;

    let mut exec = Executor {
        journal: &mut journal,
        opts,
        registry: &registry,
        job: &mut job,
        committed: false,
    };
    let result = exec.run(db, &mut plan, local, rollback.as_ref());
    let committed = exec.committed;
    let elapsed = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => journal.finish(elapsed, true)?,
        Err(e) if committed => {
            warn!("update {} failed after commit: {}", tx, e);
            journal.finish(elapsed, false)?;
            return Err(e);
        }
        Err(e) => {
            warn!("update {} failed, undoing: {}", tx, e);
            if let Err(undo) = journal.undo() {
                warn!("undo of {} incomplete: {}", tx, undo);
                return Err(e);
            }
            if let Some(index) = job.rollback
                && db.rollbacks().last_index() == Some(index)
            {
                db.rollbacks_mut().pop(index)?;
            }
            journal.finish(elapsed, false)?;
            return Err(e);
        }
    }

    if mode == Mode::Update && opts.keep_rollbacks > 0 {
        db.trim_rollbacks(opts.keep_rollbacks)?;
    }
    info!(
        "update done: {} installed, {} removed, {} ms",
        job.installed.len(),
        job.removed.len(),
        elapsed
    );
    Ok(job)
}

/// Exclusive lock on the database directory for the length of an update
fn lock_updates(db: &LocalDatabase) -> Result<File> {
    const MAX_RETRIES: u32 = 5;
    let file = File::create(db.dir().join(LOCK_FILE))?;
    for attempt in 0..MAX_RETRIES {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(e) if attempt + 1 == MAX_RETRIES => {
                return Err(Error::IoError(format!(
                    "another update holds {}: {}",
                    db.dir().join(LOCK_FILE).display(),
                    e
                )));
            }
            Err(_) => std::thread::sleep(Duration::from_millis(100 * (1 << attempt))),
        }
    }
    Ok(file)
}

fn describe(plan: &Plan) -> String {
    let names: Vec<String> = plan.installed.iter().map(ToString::to_string).collect();
    let gone: Vec<String> = plan.removed.iter().map(ToString::to_string).collect();
    format!("install [{}] remove [{}]", names.join(", "), gone.join(", "))
}

struct Executor<'a> {
    journal: &'a mut Journal,
    opts: &'a UpdateOptions,
    registry: &'a TagRegistry,
    job: &'a mut UpdateJob,
    committed: bool,
}

impl Executor<'_> {
    fn run(
        &mut self,
        db: &mut LocalDatabase,
        plan: &mut Plan,
        local: Option<&ChangeSet>,
        rollback: Option<&(ChangeSet, ChangeSet)>,
    ) -> Result<()> {
        let root = db.root().to_path_buf();
        let ctx = HandlerContext::new(&root);
        let changed: Vec<&str> = plan
            .removals
            .iter()
            .map(|r| r.path.as_str())
            .collect();
        let batches = self.handler_batches(db, plan, self.registry, &changed, &BTreeSet::new())?;
        self.run_tags(&ctx, self.registry, Target::Handler, Action::PreRemove, &batches);
        let batches = tag_batches(plan.removals.iter().map(|r| (&r.path, &r.tags)));
        self.run_tags(&ctx, self.registry, Target::Files, Action::PreRemove, &batches);
        self.check_cancel()?;

        info!("removing {} path(s)", plan.removals.len());
        for removal in &plan.removals {
            let dir_mode = match fs::symlink_metadata(&removal.disk) {
                Ok(meta) if meta.is_dir() => Some(meta.permissions().mode() & 0o7777),
                Ok(_) => None,
                Err(_) => {
                    debug!("{} is already gone", removal.path);
                    continue;
                }
            };
            self.journal.backup(&removal.disk, false)?;
            self.journal.write_barrier(&JournalRecord::Removed {
                path: removal.disk.clone(),
                dir_mode,
            })?;
            if removal.stream.remove(&removal.disk)? {
                debug!("removed {}", removal.path);
            }
        }
        self.check_cancel()?;

        info!("restoring {} file(s)", plan.restores.len());
        let mut written: BTreeMap<PathId, PathBuf> = BTreeMap::new();
        let mut ptr_cache: BTreeMap<PathId, Vec<u8>> = BTreeMap::new();
        for restore in &plan.restores {
            if restore.clear_dir {
                let mode = fs::symlink_metadata(&restore.disk)?.permissions().mode() & 0o7777;
                self.journal.write_barrier(&JournalRecord::Removed {
                    path: restore.disk.clone(),
                    dir_mode: Some(mode),
                })?;
                fs::remove_dir(&restore.disk)?;
            } else if restore.existed {
                self.journal.backup(&restore.disk, false)?;
            }

            let bytes = match &restore.contents {
                Contents::None => None,
                Contents::Bytes(bytes) => Some(bytes.clone()),
                Contents::Ptr(target) => {
                    Some(self.ptr_contents(&plan.effective, &written, &mut ptr_cache, restore.path_id, *target)?)
                }
                Contents::Keep => Some(fs::read(&restore.disk)?),
            };
            let mut stream = restore.stream.clone();
            if restore.contents == Contents::Keep
                && let Some(bytes) = &bytes
            {
                stream.set_contents(bytes.len() as u64, Sha1Digest::of(bytes));
            }

            let kept_dir = stream.kind() == FileKind::Directory && restore.existed && !restore.clear_dir;
            if !kept_dir {
                self.journal.write_barrier(&JournalRecord::Restored {
                    path: restore.disk.clone(),
                })?;
            }
            if restore.contents == Contents::Keep && stream.kind() == FileKind::Regular {
                stream.restore_metadata(&restore.disk)?;
            } else {
                let mut reader = bytes.as_deref().map(Cursor::new);
                stream.restore(&restore.disk, reader.as_mut().map(|r| r as &mut dyn Read))?;
            }
            written.insert(restore.path_id, restore.disk.clone());
            debug!("restored {}", restore.path);

            if let Some(conflicts) = &restore.conflicts {
                let side = conflicts_path(&restore.disk);
                self.journal.backup(&side, false)?;
                self.journal.write_barrier(&JournalRecord::Restored { path: side.clone() })?;
                fs::write(&side, conflicts)?;
                self.job.conflicts.push(restore.path.clone());
            }

            let flags = restore.head.flags();
            if flags.is_config() || flags.is_initial_contents() {
                let pristine = match (&restore.pristine, &restore.contents) {
                    (Some(p), _) => Some(p.as_slice()),
                    (None, Contents::Bytes(_) | Contents::Ptr(_)) => bytes.as_deref(),
                    _ => None,
                };
                if let Some(pristine) = pristine {
                    db.store_pristine(pristine)?;
                }
            }
        }

        for link in &plan.links {
            self.journal.backup(&link.disk, false)?;
            self.journal.write_barrier(&JournalRecord::Restored {
                path: link.disk.clone(),
            })?;
            make_link(&link.target_disk, &link.disk)?;
            debug!("linked {} to {}", link.path, link.target);
        }

        if let Some(local) = local {
            self.overlay_local(db, plan, local, &written)?;
        }

        let removed_paths: BTreeSet<&str> = plan.removals.iter().map(|r| r.path.as_str()).collect();
        let changed: Vec<&str> = plan
            .restores
            .iter()
            .map(|r| r.path.as_str())
            .chain(plan.links.iter().map(|l| l.path.as_str()))
            .collect();
        let post = TagRegistry::load(&root, self.opts.tag_dir.as_deref())?;
        let batches = self.handler_batches(db, plan, &post, &changed, &removed_paths)?;
        self.run_tags(&ctx, &post, Target::Handler, Action::Update, &batches);
        let batches = tag_batches(
            plan.restores
                .iter()
                .map(|r| (&r.path, &r.tags))
                .chain(plan.links.iter().map(|l| (&l.path, &l.tags))),
        );
        self.run_tags(&ctx, &post, Target::Files, Action::Update, &batches);
        let batches = tag_batches(plan.removals.iter().map(|r| (&r.path, &r.tags)));
        self.run_tags(&ctx, &post, Target::Files, Action::Remove, &batches);

        if let Some((repos, local)) = rollback {
            let index = db.rollbacks_mut().push(repos, local)?;
            self.job.rollback = Some(index);
            self.journal.write_barrier(&JournalRecord::RollbackPushed { index })?;
        }

        db.commit(&plan.effective, &plan.fs)?;
        self.committed = true;
        self.journal.write_barrier(&JournalRecord::DbCommitted)?;
        Ok(())
    }

    fn check_cancel(&self) -> Result<()> {
        if self.opts.cancelled() {
            info!("update cancelled");
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Contents shared with the file restored for `target`
    fn ptr_contents(
        &mut self,
        cs: &ChangeSet,
        written: &BTreeMap<PathId, PathBuf>,
        cache: &mut BTreeMap<PathId, Vec<u8>>,
        path_id: PathId,
        target: PathId,
    ) -> Result<Vec<u8>> {
        if let Some(bytes) = cache.get(&target) {
            return Ok(bytes.clone());
        }
        if let Some(disk) = written.get(&target) {
            let bytes = fs::read(disk)?;
            self.job.ptr_reads += 1;
            cache.insert(target, bytes.clone());
            return Ok(bytes);
        }
        cs.resolve_contents(&path_id)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::NotFound(format!("shared contents for {}", path_id)))
    }

    /// Write back the drifted files a rollback entry saved
    fn overlay_local(
        &mut self,
        db: &LocalDatabase,
        plan: &mut Plan,
        local: &ChangeSet,
        written: &BTreeMap<PathId, PathBuf>,
    ) -> Result<()> {
        let restored: BTreeMap<PathId, &str> = plan.restores.iter().map(|r| (r.path_id, r.path.as_str())).collect();
        for (path_id, change) in local.files() {
            let path = match restored.get(path_id) {
                Some(path) => path.to_string(),
                None => match db.file_by_path_id(path_id)? {
                    Some(file) => file.path,
                    None => {
                        warn!("no path for locally changed file {}", path_id);
                        continue;
                    }
                },
            };
            let disk = written
                .get(path_id)
                .cloned()
                .map_or_else(|| under_root(db.root(), &path), Ok)?;
            let stream = change.new_stream(None)?;
            let contents = local.resolve_contents(path_id);
            if stream.kind() == FileKind::Regular && contents.is_none() {
                warn!("local changes to {} carry no contents", path);
                continue;
            }
            self.journal.backup(&disk, false)?;
            self.journal.write_barrier(&JournalRecord::Restored { path: disk.clone() })?;
            let mut reader = contents.map(Cursor::new);
            stream.restore(&disk, reader.as_mut().map(|r| r as &mut dyn Read))?;
            debug!("put back local changes to {}", path);
            if stream.is_config() || plan.fs.overlays.contains_key(&path) {
                plan.fs.overlays.insert(path, stream.contents_sha1());
            }
        }
        Ok(())
    }

    /// Every file carrying a tag whose handler or description just changed
    fn handler_batches(
        &self,
        db: &LocalDatabase,
        plan: &Plan,
        registry: &TagRegistry,
        changed: &[&str],
        removed: &BTreeSet<&str>,
    ) -> Result<BTreeMap<String, Vec<TaggedFile>>> {
        let mut batches = BTreeMap::new();
        for desc in registry.descriptions() {
            let desc_path = format!("/{}/{}", taghandler::TAG_DIR, desc.tag);
            let program = desc.file.as_deref().map(|f| format!("/{}", f.trim_start_matches('/')));
            if !changed
                .iter()
                .any(|p| *p == desc_path || program.as_deref() == Some(*p))
            {
                continue;
            }
            let mut paths: BTreeSet<String> = db
                .iter_files_with_tag(&desc.tag)?
                .into_iter()
                .filter(|p| !removed.contains(p.as_str()))
                .collect();
            paths.extend(
                plan.fs
                    .tags
                    .iter()
                    .filter(|(_, tags)| tags.contains(&desc.tag))
                    .map(|(p, _)| p.clone()),
            );
            let files = paths
                .into_iter()
                .map(|p| {
                    let tags = plan.fs.tags.get(&p).cloned().unwrap_or_default();
                    TaggedFile::new(p, tags)
                })
                .collect();
            batches.insert(desc.tag.clone(), files);
        }
        Ok(batches)
    }

    fn run_tags(
        &mut self,
        ctx: &HandlerContext<'_>,
        registry: &TagRegistry,
        target: Target,
        action: Action,
        batches: &BTreeMap<String, Vec<TaggedFile>>,
    ) {
        if batches.is_empty() {
            return;
        }
        for tag in registry.run(ctx, target, action, batches) {
            let files = batches.get(&tag).map_or(0, Vec::len);
            self.job.ops.push(FsOp::Tag {
                tag,
                target,
                action,
                files,
            });
        }
    }
}

/// Files grouped per tag, each listed with all its tags
fn tag_batches<'a>(
    files: impl Iterator<Item = (&'a String, &'a BTreeSet<String>)>,
) -> BTreeMap<String, Vec<TaggedFile>> {
    let mut batches: BTreeMap<String, Vec<TaggedFile>> = BTreeMap::new();
    for (path, tags) in files {
        for tag in tags {
            batches
                .entry(tag.clone())
                .or_default()
                .push(TaggedFile::new(path.clone(), tags.clone()));
        }
    }
    batches
}

fn conflicts_path(disk: &Path) -> PathBuf {
    let mut name = disk.as_os_str().to_os_string();
    name.push(".conflicts");
    PathBuf::from(name)
}

/// Hard link `path` to `target`, copying across devices
fn make_link(target: &Path, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            return Err(Error::FileConflict(format!("{} is a directory", path.display())));
        }
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    match fs::hard_link(target, path) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!("{} is on another device, copying", path.display());
            fs::copy(target, path)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::FileContents;
    use crate::files::FileStream;
    use crate::repository::tests::{trove_cs, version};
    use crate::trove::Trove;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        db: LocalDatabase,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let db = LocalDatabase::open(tmp.path().join("db"), &root).unwrap();
        Fixture { _tmp: tmp, root, db }
    }

    fn opts() -> UpdateOptions {
        UpdateOptions::default()
    }

    #[test]
    fn test_install_writes_files() {
        let mut fx = fixture();
        let (_, cs) = trove_cs("foo", &version("/a@b:c/1.0-1-1", 1000), &[("/usr/bin/foo", b"foo\n")]);
        let job = apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
        assert_eq!(fs::read(fx.root.join("usr/bin/foo")).unwrap(), b"foo\n");
        assert_eq!(job.installed.len(), 1);
        assert_eq!(
            job.fs_ops(),
            &[FsOp::Restore {
                path: "/usr/bin/foo".to_string()
            }]
        );
        assert_eq!(job.rollback, Some(0));
        assert_eq!(fx.db.installed().unwrap().len(), 1);
        assert!(journal::find_incomplete_journals(&fx.db.journal_dir()).unwrap().is_empty());
    }

    #[test]
    fn test_reapply_is_noop() {
        let mut fx = fixture();
        let (_, cs) = trove_cs("foo", &version("/a@b:c/1.0-1-1", 1000), &[("/usr/bin/foo", b"foo\n")]);
        apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
        let again = apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
        assert!(again.is_noop());
        assert_eq!(again.rollback, None);
        assert_eq!(fx.db.rollback_count(), 1);
    }

    #[test]
    fn test_test_mode_touches_nothing() {
        let mut fx = fixture();
        let (_, cs) = trove_cs("foo", &version("/a@b:c/1.0-1-1", 1000), &[("/usr/bin/foo", b"foo\n")]);
        let job = apply_change_set(
            &mut fx.db,
            &cs,
            &UpdateOptions {
                test: true,
                ..opts()
            },
        )
        .unwrap();
        assert_eq!(job.fs_ops().len(), 1);
        assert!(!fx.root.join("usr/bin/foo").exists());
        assert!(fx.db.installed().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_before_writes() {
        let mut fx = fixture();
        let (_, cs) = trove_cs("foo", &version("/a@b:c/1.0-1-1", 1000), &[("/usr/bin/foo", b"foo\n")]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = apply_change_set(
            &mut fx.db,
            &cs,
            &UpdateOptions {
                cancel: Some(cancel),
                ..opts()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!fx.root.join("usr/bin/foo").exists());
        assert_eq!(fx.db.rollback_count(), 0);
    }

    #[test]
    fn test_erase_removes_files_and_empty_dirs() {
        let mut fx = fixture();
        let v = version("/a@b:c/1.0-1-1", 1000);
        let (trove, cs) = trove_cs("foo", &v, &[("/opt/foo/a", b"a\n"), ("/opt/foo/b", b"b\n")]);
        apply_change_set(&mut fx.db, &cs, &opts()).unwrap();

        let mut erase = ChangeSet::new();
        erase.add_erasure(trove.tuple());
        let job = apply_change_set(&mut fx.db, &erase, &opts()).unwrap();
        assert_eq!(
            job.fs_ops(),
            &[
                FsOp::Remove {
                    path: "/opt/foo/b".to_string()
                },
                FsOp::Remove {
                    path: "/opt/foo/a".to_string()
                },
            ]
        );
        assert!(!fx.root.join("opt/foo/a").exists());
        assert!(fx.db.installed().unwrap().is_empty());
    }

    #[test]
    fn test_other_owner_conflicts() {
        let mut fx = fixture();
        let (_, a) = trove_cs("a", &version("/a@b:c/1.0-1-1", 1000), &[("/usr/bin/x", b"a\n")]);
        let (b_trove, b) = trove_cs("b", &version("/a@b:c/1.0-1-1", 1000), &[("/usr/bin/x", b"b\n")]);
        apply_change_set(&mut fx.db, &a, &opts()).unwrap();

        let err = apply_change_set(&mut fx.db, &b, &opts()).unwrap_err();
        assert!(matches!(err, Error::FileConflict(_)));
        assert_eq!(fs::read(fx.root.join("usr/bin/x")).unwrap(), b"a\n");

        apply_change_set(
            &mut fx.db,
            &b,
            &UpdateOptions {
                replace_files: true,
                ..opts()
            },
        )
        .unwrap();
        assert_eq!(fx.db.owner_of("/usr/bin/x").unwrap(), Some(b_trove.tuple()));
        assert_eq!(fs::read(fx.root.join("usr/bin/x")).unwrap(), b"b\n");
    }

    #[test]
    fn test_non_empty_directory_conflicts() {
        let mut fx = fixture();
        fs::create_dir_all(fx.root.join("srv/data")).unwrap();
        fs::write(fx.root.join("srv/data/keep"), b"mine").unwrap();
        let (_, cs) = trove_cs("foo", &version("/a@b:c/1.0-1-1", 1000), &[("/srv/data", b"file\n")]);
        let err = apply_change_set(&mut fx.db, &cs, &opts()).unwrap_err();
        assert!(matches!(err, Error::FileConflict(_)));
        assert!(fx.root.join("srv/data/keep").exists());
    }

    #[test]
    fn test_empty_directory_is_replaced() {
        let mut fx = fixture();
        fs::create_dir_all(fx.root.join("srv/data")).unwrap();
        let (_, cs) = trove_cs("foo", &version("/a@b:c/1.0-1-1", 1000), &[("/srv/data", b"file\n")]);
        apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
        assert_eq!(fs::read(fx.root.join("srv/data")).unwrap(), b"file\n");
    }

    #[test]
    fn test_failed_restore_is_undone() {
        let mut fx = fixture();
        let v1 = version("/a@b:c/1.0-1-1", 1000);
        let (t1, cs1) = trove_cs("foo", &v1, &[("/etc/a", b"one\n")]);
        apply_change_set(&mut fx.db, &cs1, &opts()).unwrap();

        // a second file whose contents do not hash to its stream
        let v2 = version("/a@b:c/2.0-1-1", 2000);
        let (t2, full) = trove_cs("foo", &v2, &[("/etc/a", b"two\n"), ("/etc/b", b"bee\n")]);
        let mut cs = ChangeSet::new();
        cs.add_trove(t2.diff(Some(&t1))).unwrap();
        for (pid, change) in full.files() {
            cs.add_file(*pid, change.clone()).unwrap();
        }
        let good = PathId::for_path("/etc/a");
        cs.add_contents(good, full.contents(&good).unwrap().clone()).unwrap();
        cs.add_contents(PathId::for_path("/etc/b"), FileContents::File(b"not bee\n".to_vec()))
            .unwrap();

        assert!(apply_change_set(&mut fx.db, &cs, &opts()).is_err());
        assert_eq!(fs::read(fx.root.join("etc/a")).unwrap(), b"one\n");
        assert!(!fx.root.join("etc/b").exists());
        assert_eq!(fx.db.installed().unwrap(), vec![t1.tuple()]);
        assert_eq!(fx.db.rollback_count(), 1);
    }

    #[test]
    fn test_hard_link_group_is_linked() {
        let mut fx = fixture();
        let v = version("/a@b:c/1.0-1-1", 1000);
        let mut trove = Trove::new("links", v.clone(), crate::flavor::Flavor::empty());
        let mut cs = ChangeSet::new();
        for path in ["/bin/one", "/bin/two"] {
            let mut stream = FileStream::regular(b"same\n", 0o755);
            stream.set_link_group(&[7u8; 16]);
            let pid = PathId::for_path(path);
            trove.add_file(pid, path, stream.file_id(), v.clone());
            cs.add_file_stream(pid, None, &stream).unwrap();
            cs.add_contents(pid, FileContents::File(b"same\n".to_vec())).unwrap();
        }
        cs.add_trove(trove.diff(None)).unwrap();

        let job = apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
        assert_eq!(job.fs_ops().iter().filter(|op| matches!(op, FsOp::Link { .. })).count(), 1);
        let one = fs::metadata(fx.root.join("bin/one")).unwrap();
        let two = fs::metadata(fx.root.join("bin/two")).unwrap();
        assert_eq!(one.ino(), two.ino());
    }
}
