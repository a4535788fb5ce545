// src/update/plan.rs

//! Planning an update
//!
//! For every file a change set touches, the planner looks at three
//! states: the pristine base (old version), the head (new version) and
//! what is actually on disk. Conflicts are raised here, before anything
//! on disk is touched, and every decision lands in a [`Plan`] the
//! executor runs in order.

use super::patch::{self, render_failed, unified_diff};
use super::taghandler::TagRegistry;
use super::{Mode, UpdateOptions};
use crate::changeset::{ChangeSet, FileContents};
use crate::error::{Error, Result};
use crate::files::{FileKind, FileStream, PathId};
use crate::filesystem::path::{check_parents, under_root};
use crate::hash::Sha1Digest;
use crate::local::{FsResult, InstalledFile, LocalDatabase};
use crate::trove::{FileEntry, Trove, TroveTuple};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where the bytes of a restored regular file come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Contents {
    /// Not a regular file
    None,
    Bytes(Vec<u8>),
    /// Same bytes as the file restored for another pathId
    Ptr(PathId),
    /// Contents on disk stay; only metadata is applied
    Keep,
}

#[derive(Debug, Clone)]
pub(crate) struct Restore {
    pub path: String,
    pub path_id: PathId,
    pub disk: PathBuf,
    /// The stream written to disk; differs from the head stream after a merge
    pub stream: FileStream,
    pub head: FileStream,
    pub contents: Contents,
    pub merged: bool,
    /// Failed hunks, written next to the file as `<path>.conflicts`
    pub conflicts: Option<Vec<u8>>,
    /// Head contents to keep as the next merge base, when not the written bytes
    pub pristine: Option<Vec<u8>>,
    /// Replace whatever directory sits at the path
    pub clear_dir: bool,
    pub existed: bool,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Removal {
    pub path: String,
    pub path_id: PathId,
    pub disk: PathBuf,
    pub stream: FileStream,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub path: String,
    pub path_id: PathId,
    pub disk: PathBuf,
    pub target: String,
    pub target_disk: PathBuf,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// The part of the change set that is not already in place
    pub effective: ChangeSet,
    pub installed: Vec<TroveTuple>,
    pub removed: Vec<TroveTuple>,
    /// Reverse lexicographic by path
    pub removals: Vec<Removal>,
    /// pathId order
    pub restores: Vec<Restore>,
    pub links: Vec<Link>,
    pub fs: FsResult,
    /// Existing pathIds whose disk state a rollback must capture
    pub touched: BTreeSet<PathId>,
}

impl Plan {
    /// Nothing to install, erase, or write
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty()
            && self.removed.is_empty()
            && self.removals.is_empty()
            && self.restores.is_empty()
            && self.links.is_empty()
    }
}

struct Planner<'a> {
    db: &'a LocalDatabase,
    cs: &'a ChangeSet,
    opts: &'a UpdateOptions,
    mode: Mode,
    registry: &'a TagRegistry,
    pins: Vec<glob::Pattern>,
    plan: Plan,
    departing_troves: BTreeSet<TroveTuple>,
    departing: BTreeMap<String, InstalledFile>,
    claimed: BTreeMap<String, TroveTuple>,
    seeds: BTreeMap<Vec<u8>, (String, PathBuf)>,
}

pub(crate) fn plan(
    db: &LocalDatabase,
    cs: &ChangeSet,
    opts: &UpdateOptions,
    mode: Mode,
    registry: &TagRegistry,
) -> Result<Plan> {
    let pins = opts
        .pins
        .iter()
        .map(|p| glob::Pattern::new(p).map_err(|e| Error::Config(format!("bad pin pattern '{}': {}", p, e))))
        .collect::<Result<Vec<_>>>()?;
    let planner = Planner {
        db,
        cs,
        opts,
        mode,
        registry,
        pins,
        plan: Plan::default(),
        departing_troves: BTreeSet::new(),
        departing: BTreeMap::new(),
        claimed: BTreeMap::new(),
        seeds: BTreeMap::new(),
    };
    planner.run()
}

impl Planner<'_> {
    fn run(mut self) -> Result<Plan> {
        for (path_id, change) in self.cs.files() {
            self.plan.effective.add_file(*path_id, change.clone())?;
            if let Some(contents) = self.cs.contents(path_id) {
                self.plan.effective.add_contents(*path_id, contents.clone())?;
            }
        }

        let updates = self.collect_troves()?;
        for tuple in self.departing_troves.clone() {
            for file in self.db.files_of(&tuple)? {
                self.departing.insert(file.path.clone(), file);
            }
        }

        let mut candidates = Vec::new();
        for (old, new) in &updates {
            for (path_id, entry) in new.files() {
                if let Some(restore) = self.plan_file(old.as_ref(), new, path_id, entry)? {
                    candidates.push(restore);
                }
            }
        }
        candidates.sort_by_key(|r| r.path_id);
        self.assign_links(candidates);

        let new_paths: BTreeSet<&str> = updates
            .iter()
            .flat_map(|(_, new)| new.files().map(|(_, e)| e.path.as_str()))
            .collect();
        let mut removals = Vec::new();
        for (path, row) in &self.departing {
            if new_paths.contains(path.as_str()) || self.db.is_user_removed(path)? {
                continue;
            }
            let disk = under_root(self.db.root(), path)?;
            removals.push(Removal {
                path: path.clone(),
                path_id: row.path_id,
                disk,
                stream: row.stream.clone(),
                tags: self.db.tags_of(path)?,
            });
        }
        removals.sort_by(|a, b| b.path.cmp(&a.path));
        self.plan.removals = removals;

        let touched: Vec<PathId> = self
            .plan
            .removals
            .iter()
            .map(|r| r.path_id)
            .chain(self.plan.restores.iter().filter(|r| r.existed).map(|r| r.path_id))
            .chain(self.plan.links.iter().map(|l| l.path_id))
            .collect();
        self.plan.touched.extend(touched);

        info!(
            "planned {} removal(s), {} restore(s), {} link(s)",
            self.plan.removals.len(),
            self.plan.restores.len(),
            self.plan.links.len()
        );
        Ok(self.plan)
    }

    fn is_pinned(&self, tuple: &TroveTuple) -> Result<bool> {
        if self.mode == Mode::Rollback {
            return Ok(false);
        }
        Ok(self.db.is_pinned(tuple)? || self.pins.iter().any(|p| p.matches(&tuple.name)))
    }

    fn collect_troves(&mut self) -> Result<Vec<(Option<Trove>, Trove)>> {
        let mut updates = Vec::new();
        for tcs in self.cs.troves() {
            let new_tuple = tcs.new_tuple();
            if self.db.has(&new_tuple)? {
                debug!("{} is already installed", new_tuple);
                continue;
            }
            let old = match tcs.old_tuple() {
                Some(old_tuple) => {
                    let trove = self
                        .db
                        .get_trove(&old_tuple)?
                        .ok_or_else(|| Error::TroveMissing(format!("{} is not installed", old_tuple)))?;
                    if self.is_pinned(&old_tuple)? {
                        return Err(Error::PermissionDenied(format!("{} is pinned", old_tuple)));
                    }
                    self.departing_troves.insert(old_tuple.clone());
                    self.plan.removed.push(old_tuple);
                    Some(trove)
                }
                None => None,
            };
            let new = tcs.apply(old.as_ref())?;
            self.plan.effective.add_trove(tcs.clone())?;
            self.plan.installed.push(new_tuple);
            updates.push((old, new));
        }

        for tuple in self.cs.erasures() {
            if !self.db.has(tuple)? {
                debug!("{} is not installed, nothing to erase", tuple);
                continue;
            }
            if self.is_pinned(tuple)? {
                return Err(Error::PermissionDenied(format!("{} is pinned", tuple)));
            }
            self.plan.effective.add_erasure(tuple.clone());
            self.departing_troves.insert(tuple.clone());
            self.plan.removed.push(tuple.clone());
        }
        Ok(updates)
    }

    fn replacing(&self) -> bool {
        self.opts.replace_files || self.mode == Mode::Rollback
    }

    fn head_stream(&self, path_id: &PathId, entry: &FileEntry, old_stream: Option<&FileStream>) -> Result<FileStream> {
        match self.cs.file(path_id) {
            Some(change) if change.new_file_id == entry.file_id => change.new_stream(old_stream),
            _ => self
                .db
                .stream(&entry.file_id)?
                .ok_or_else(|| Error::TroveMissing(format!("file stream {} for {}", entry.file_id, entry.path))),
        }
    }

    fn plan_file(
        &mut self,
        old: Option<&Trove>,
        new: &Trove,
        path_id: &PathId,
        entry: &FileEntry,
    ) -> Result<Option<Restore>> {
        let root = self.db.root();
        let path = entry.path.as_str();
        let disk = under_root(root, path)?;
        let old_entry = old.and_then(|o| o.file(path_id));
        let old_stream = match old_entry {
            Some(e) => self.db.stream(&e.file_id)?,
            None => None,
        };

        if let Some(previous) = self.claimed.insert(path.to_string(), new.tuple())
            && !self.replacing()
        {
            return Err(Error::FileConflict(format!(
                "{} is claimed by both {} and {}",
                path,
                previous,
                new.tuple()
            )));
        }

        let unchanged = old_entry.is_some_and(|e| e.file_id == entry.file_id && e.path == entry.path);
        let head = match (&old_stream, unchanged) {
            (Some(stream), true) => stream.clone(),
            _ => self.head_stream(path_id, entry, old_stream.as_ref())?,
        };
        let tags = self.registry.tags_for(path, &head);
        self.plan.fs.tags.insert(path.to_string(), tags.clone());

        let departing_row = self.departing.contains_key(path);
        if departing_row && self.db.is_user_removed(path)? {
            debug!("{} was removed by the user, leaving it out", path);
            self.plan.fs.user_removed.insert(path.to_string());
            return Ok(None);
        }

        let owner = self.db.owner_of(path)?;
        if let Some(owner) = &owner
            && !self.departing_troves.contains(owner)
        {
            let transient = head.flags().is_transient()
                && self
                    .db
                    .file_info(path)?
                    .is_some_and(|f| f.stream.flags().is_transient());
            if !(self.replacing() || transient) {
                return Err(Error::FileConflict(format!("{} is owned by {}", path, owner)));
            }
            info!("{} moves from {} to {}", path, owner, new.tuple());
        }

        check_parents(root, &disk)?;
        let on_disk = match fs::symlink_metadata(&disk) {
            Ok(_) => Some(FileStream::from_path(&disk)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let mut clear_dir = false;
        if let Some(current) = &on_disk
            && current.kind() != head.kind()
        {
            if current.kind() == FileKind::Directory {
                if !dir_is_empty(&disk)? && !self.replacing() {
                    return Err(Error::FileConflict(format!("{} would replace a non-empty directory", path)));
                }
                clear_dir = true;
            } else {
                let sanctioned = departing_row && old_stream.as_ref().is_some_and(|s| s.kind() == current.kind());
                if !(sanctioned || self.replacing()) {
                    return Err(Error::FileConflict(format!(
                        "{} would change type from {} to {}",
                        path,
                        current.kind(),
                        head.kind()
                    )));
                }
            }
        }

        if !clear_dir && on_disk.as_ref().is_some_and(|d| d.same_metadata(&head)) {
            debug!("{} is already in place", path);
            if let Some(group) = head.link_group() {
                self.seeds
                    .entry(group.to_vec())
                    .or_insert_with(|| (path.to_string(), disk.clone()));
            }
            self.plan.fs.overlays.insert(path.to_string(), None);
            return Ok(None);
        }

        let mut restore = Restore {
            path: path.to_string(),
            path_id: *path_id,
            disk,
            stream: head.clone(),
            head: head.clone(),
            contents: Contents::None,
            merged: false,
            conflicts: None,
            pristine: None,
            clear_dir,
            existed: on_disk.is_some(),
            tags,
        };
        if head.kind() != FileKind::Regular {
            return Ok(Some(restore));
        }

        let current = on_disk.as_ref().filter(|d| d.kind() == FileKind::Regular);
        if let Some(current) = current
            && head.flags().is_initial_contents()
        {
            debug!("{} has initial contents only, keeping the file on disk", path);
            if current.perms() == head.perms() {
                return Ok(None);
            }
            restore.contents = Contents::Keep;
            return Ok(Some(restore));
        }

        let base = old_stream.as_ref().filter(|s| s.kind() == FileKind::Regular);
        if let (Some(current), Some(base)) = (current, base)
            && self.mode == Mode::Update
            && head.is_config()
            && current.contents_sha1() != base.contents_sha1()
            && current.contents_sha1() != head.contents_sha1()
        {
            return self.plan_config(restore, base, current).map(Some);
        }

        restore.contents = self.head_contents(&restore.path, path_id, &head, base, current)?;
        // the bytes are already there; only metadata changes
        if current.is_some_and(|c| c.contents_sha1() == head.contents_sha1())
            && matches!(restore.contents, Contents::Bytes(_) | Contents::Ptr(_))
        {
            restore.contents = Contents::Keep;
        }
        self.plan.fs.overlays.insert(path.to_string(), None);
        Ok(Some(restore))
    }

    /// Head contents for a file restored as the repository ships it
    fn head_contents(
        &self,
        path: &str,
        path_id: &PathId,
        head: &FileStream,
        base: Option<&FileStream>,
        current: Option<&FileStream>,
    ) -> Result<Contents> {
        match self.cs.contents(path_id) {
            Some(FileContents::File(bytes)) => Ok(Contents::Bytes(bytes.clone())),
            Some(FileContents::Ptr(target)) => Ok(Contents::Ptr(*target)),
            Some(FileContents::Diff(diff)) => {
                let base = base.ok_or_else(|| Error::Integrity(format!("diff for {} has no base file", path)))?;
                let pristine = self.base_contents(path, base, current)?;
                let result = patch::patch(&pristine, diff)?;
                if !result.is_clean() {
                    return Err(Error::Integrity(format!(
                        "{} hunk(s) of the diff for {} do not apply to the pristine contents",
                        result.failed.len(),
                        path
                    )));
                }
                Ok(Contents::Bytes(result.contents))
            }
            Some(FileContents::Placeholder) | None => {
                if let Some(bytes) = self.db.pristine_contents(head)? {
                    return Ok(Contents::Bytes(bytes));
                }
                if current.is_some_and(|c| c.contents_sha1() == head.contents_sha1()) || self.mode == Mode::Rollback {
                    return Ok(Contents::Keep);
                }
                Err(Error::NotFound(format!("no contents for {}", path)))
            }
        }
    }

    /// The pristine copy of `base`, or the disk copy when it is still pristine
    fn base_contents(&self, path: &str, base: &FileStream, current: Option<&FileStream>) -> Result<Vec<u8>> {
        if let Some(bytes) = self.db.pristine_contents(base)? {
            return Ok(bytes);
        }
        if current.is_some_and(|c| c.contents_sha1() == base.contents_sha1()) {
            return Ok(fs::read(under_root(self.db.root(), path)?)?);
        }
        Err(Error::TroveMissing(format!("pristine contents of {}", path)))
    }

    /// A config file with local edits
    fn plan_config(&mut self, mut restore: Restore, base: &FileStream, current: &FileStream) -> Result<Restore> {
        let path = restore.path.clone();
        let head = restore.head.clone();

        if base.contents_sha1() == head.contents_sha1() {
            debug!("{} keeps its local changes", path);
            self.plan.fs.overlays.insert(path, current.contents_sha1());
            restore.contents = Contents::Keep;
            return Ok(restore);
        }

        let head_bytes = match self.cs.contents(&restore.path_id) {
            Some(FileContents::Diff(_)) | Some(FileContents::Placeholder) | None => {
                match self.head_contents(&path, &restore.path_id, &head, Some(base), Some(current))? {
                    Contents::Bytes(bytes) => bytes,
                    _ => return Err(Error::NotFound(format!("no contents for {}", path))),
                }
            }
            Some(_) => self
                .cs
                .resolve_contents(&restore.path_id)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| Error::NotFound(format!("no contents for {}", path)))?,
        };
        let local = fs::read(&restore.disk)?;
        let pristine = self.db.pristine_contents(base)?;

        let merged = match (
            pristine.as_deref().map(std::str::from_utf8),
            std::str::from_utf8(&local),
        ) {
            (Some(Ok(base_text)), Ok(local_text)) => {
                let local_diff = unified_diff(base_text, local_text);
                let result = patch::patch(&head_bytes, &local_diff)?;
                if !result.is_clean() {
                    if self.opts.strict_merge {
                        return Err(Error::MergeConflict(format!(
                            "{} hunk(s) of local changes to {} do not apply",
                            result.failed.len(),
                            path
                        )));
                    }
                    warn!(
                        "{} hunk(s) of local changes to {} conflict; see {}.conflicts",
                        result.failed.len(),
                        path,
                        path
                    );
                    restore.conflicts = Some(render_failed(&result.failed, &path, &path));
                }
                result.contents
            }
            _ => {
                warn!("cannot merge local changes to {}, replacing them", path);
                head_bytes.clone()
            }
        };

        if merged == head_bytes {
            self.plan.fs.overlays.insert(path, None);
        } else {
            let sha1 = Sha1Digest::of(&merged);
            restore.stream.set_contents(merged.len() as u64, sha1);
            self.plan.fs.overlays.insert(path, Some(sha1));
        }
        restore.merged = true;
        restore.pristine = Some(head_bytes);
        restore.contents = Contents::Bytes(merged);
        Ok(restore)
    }

    /// Turn later members of a hard-link group into links
    ///
    /// Members whose bytes stay on disk seed their group before any
    /// member that has to be written, so the existing inode is the one
    /// the group ends up sharing.
    fn assign_links(&mut self, candidates: Vec<Restore>) {
        let mut groups = std::mem::take(&mut self.seeds);
        for restore in &candidates {
            if let Some(group) = link_group(restore)
                && restore.contents == Contents::Keep
            {
                groups
                    .entry(group)
                    .or_insert_with(|| (restore.path.clone(), restore.disk.clone()));
            }
        }
        for restore in candidates {
            let Some(group) = link_group(&restore) else {
                self.plan.restores.push(restore);
                continue;
            };
            match groups.get(&group) {
                Some((_, target_disk))
                    if restore.contents == Contents::Keep && same_inode(&restore.disk, target_disk) =>
                {
                    self.plan.restores.push(restore);
                }
                Some((target, target_disk)) => self.plan.links.push(Link {
                    path: restore.path,
                    path_id: restore.path_id,
                    disk: restore.disk,
                    target: target.clone(),
                    target_disk: target_disk.clone(),
                    tags: restore.tags,
                }),
                None => {
                    groups.insert(group, (restore.path.clone(), restore.disk.clone()));
                    self.plan.restores.push(restore);
                }
            }
        }
    }
}

/// The hard-link group a restore takes part in
///
/// Kept config and initial-contents files may hold local bytes and are
/// never linked.
fn link_group(restore: &Restore) -> Option<Vec<u8>> {
    let group = restore.head.link_group()?;
    let flags = restore.head.flags();
    match restore.contents {
        Contents::Bytes(_) | Contents::Ptr(_) => Some(group.to_vec()),
        Contents::Keep if !(flags.is_config() || flags.is_initial_contents()) => Some(group.to_vec()),
        _ => None,
    }
}

fn same_inode(a: &Path, b: &Path) -> bool {
    match (fs::symlink_metadata(a), fs::symlink_metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

fn dir_is_empty(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}
