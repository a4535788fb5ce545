// src/repository/csbuild.rs

//! Change set assembly from the store
//!
//! A job names one trove transition: install (`old` absent), update, or
//! erase (`new` absent). Sub-trove changes of groups either recurse into
//! further jobs or come back to the caller in `troves_needed`.

use super::Repository;
use crate::changeset::{ChangeSet, FileContents};
use crate::error::{Error, Result};
use crate::files::{FileId, FileStream, PathId};
use crate::flavor::Flavor;
use crate::trove::{Trove, TroveTuple};
use crate::update::CancelToken;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetJob {
    pub name: String,
    pub old: Option<(Version, Flavor)>,
    pub new: Option<(Version, Flavor)>,
}

impl ChangeSetJob {
    pub fn install(tuple: &TroveTuple) -> Self {
        Self {
            name: tuple.name.clone(),
            old: None,
            new: Some((tuple.version.clone(), tuple.flavor.clone())),
        }
    }

    pub fn update(old: &TroveTuple, new: &TroveTuple) -> Self {
        Self {
            name: new.name.clone(),
            old: Some((old.version.clone(), old.flavor.clone())),
            new: Some((new.version.clone(), new.flavor.clone())),
        }
    }

    pub fn erase(tuple: &TroveTuple) -> Self {
        Self {
            name: tuple.name.clone(),
            old: Some((tuple.version.clone(), tuple.flavor.clone())),
            new: None,
        }
    }

    pub fn is_erase(&self) -> bool {
        self.new.is_none()
    }

    pub fn old_tuple(&self) -> Option<TroveTuple> {
        self.old
            .as_ref()
            .map(|(v, f)| TroveTuple::new(self.name.clone(), v.clone(), f.clone()))
    }

    pub fn new_tuple(&self) -> Option<TroveTuple> {
        self.new
            .as_ref()
            .map(|(v, f)| TroveTuple::new(self.name.clone(), v.clone(), f.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct ChangeSetOptions {
    /// Follow sub-trove changes of groups and packages
    pub recurse: bool,
    pub with_files: bool,
    pub with_file_contents: bool,
    /// Leave out files flagged auto-source
    pub exclude_auto_source: bool,
    /// Checked before each trove is assembled
    pub cancel: Option<CancelToken>,
}

impl Default for ChangeSetOptions {
    fn default() -> Self {
        Self {
            recurse: true,
            with_files: true,
            with_file_contents: true,
            exclude_auto_source: false,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSetResult {
    pub change_set: ChangeSet,
    /// Sub-trove jobs left out because `recurse` was off
    pub troves_needed: Vec<ChangeSetJob>,
    /// Troves the change set erases
    pub removed: Vec<TroveTuple>,
    /// Files whose streams the change set does not carry
    pub files_needed: Vec<(PathId, FileId)>,
}

impl Repository {
    pub fn create_change_set(&self, jobs: &[ChangeSetJob], options: ChangeSetOptions) -> Result<ChangeSetResult> {
        let mut result = ChangeSetResult::default();
        let mut queue: VecDeque<ChangeSetJob> = jobs.iter().cloned().collect();
        let mut seen: BTreeSet<(Option<TroveTuple>, Option<TroveTuple>)> = BTreeSet::new();

        while let Some(job) = queue.pop_front() {
            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                debug!("change set build cancelled with {} job(s) left", queue.len() + 1);
                return Err(Error::Cancelled);
            }
            if !seen.insert((job.old_tuple(), job.new_tuple())) {
                continue;
            }
            let old = match job.old_tuple() {
                Some(tuple) => Some(
                    self.get_trove(&tuple)?
                        .ok_or_else(|| Error::TroveNotFound(tuple.to_string()))?,
                ),
                None => None,
            };

            let Some(new_tuple) = job.new_tuple() else {
                // erase; `old` is always set for an erase job
                let Some(old) = old else {
                    continue;
                };
                for (sub, _) in old.troves() {
                    let sub_job = ChangeSetJob::erase(sub);
                    if options.recurse {
                        queue.push_back(sub_job);
                    } else {
                        result.troves_needed.push(sub_job);
                    }
                }
                result.change_set.add_erasure(old.tuple());
                result.removed.push(old.tuple());
                continue;
            };

            let new = self
                .get_trove(&new_tuple)?
                .ok_or_else(|| Error::TroveNotFound(new_tuple.to_string()))?;
            let tcs = new.diff(old.as_ref());

            for sub_job in sub_trove_jobs(old.as_ref(), &new) {
                if options.recurse {
                    queue.push_back(sub_job);
                } else {
                    result.troves_needed.push(sub_job);
                }
            }

            let touched: Vec<(PathId, FileId)> = tcs.touched_files().map(|(id, e)| (*id, e.file_id)).collect();
            for (path_id, file_id) in touched {
                if !options.with_files {
                    result.files_needed.push((path_id, file_id));
                    continue;
                }
                self.add_file_to(&mut result, old.as_ref(), path_id, file_id, &options)?;
            }

            debug!("Change set {} -> {}", job.old_tuple().map(|t| t.to_string()).unwrap_or_default(), new_tuple);
            result.change_set.add_trove(tcs)?;
        }
        Ok(result)
    }

    fn add_file_to(
        &self,
        result: &mut ChangeSetResult,
        old: Option<&Trove>,
        path_id: PathId,
        file_id: FileId,
        options: &ChangeSetOptions,
    ) -> Result<()> {
        let stream = self
            .get_file_stream(&file_id)?
            .ok_or_else(|| Error::TroveMissing(format!("file stream {}", file_id)))?;
        if options.exclude_auto_source && stream.flags().is_auto_source() {
            result.files_needed.push((path_id, file_id));
            return Ok(());
        }
        let old_stream = match old.and_then(|t| t.file(&path_id)) {
            Some(entry) if entry.file_id != file_id => self.get_file_stream(&entry.file_id)?,
            _ => None,
        };
        let cs = &mut result.change_set;
        // several troves of one job list may share a file
        if cs.file(&path_id).is_some() {
            return Ok(());
        }
        cs.add_file_stream(path_id, old_stream.as_ref(), &stream)?;

        if !options.with_file_contents {
            return Ok(());
        }
        let Some(sha1) = stream.contents_sha1() else {
            return Ok(());
        };
        if old_stream.as_ref().and_then(FileStream::contents_sha1) == Some(sha1) {
            return Ok(());
        }
        let bytes = self.blobs().retrieve(&sha1)?;
        let contents = match old_stream.as_ref() {
            Some(prev) if stream.is_config() => match self.config_diff(prev, &bytes)? {
                Some(diff) => FileContents::Diff(diff),
                None => FileContents::File(bytes),
            },
            _ => FileContents::File(bytes),
        };
        cs.add_contents(path_id, contents)
    }

    /// Unified diff from the old config contents, when both sides are text
    fn config_diff(&self, old: &FileStream, new: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(old_sha1) = old.contents_sha1() else {
            return Ok(None);
        };
        let old_bytes = self.blobs().retrieve(&old_sha1)?;
        let (Ok(before), Ok(after)) = (std::str::from_utf8(&old_bytes), std::str::from_utf8(new)) else {
            return Ok(None);
        };
        Ok(Some(crate::update::patch::unified_diff(before, after)))
    }
}

/// Jobs for the sub-trove references that changed between `old` and `new`
///
/// Added and removed references with the same name pair up as updates;
/// a same-flavor partner is preferred.
fn sub_trove_jobs(old: Option<&Trove>, new: &Trove) -> Vec<ChangeSetJob> {
    let before: BTreeSet<&TroveTuple> = old.map(|o| o.troves().map(|(t, _)| t).collect()).unwrap_or_default();
    let after: BTreeSet<&TroveTuple> = new.troves().map(|(t, _)| t).collect();
    let mut removed: Vec<&TroveTuple> = before.difference(&after).copied().collect();
    let mut jobs = Vec::new();

    for added in after.difference(&before) {
        let partner = removed
            .iter()
            .position(|r| r.name == added.name && r.flavor == added.flavor)
            .or_else(|| removed.iter().position(|r| r.name == added.name));
        match partner {
            Some(i) => {
                let gone = removed.remove(i);
                jobs.push(ChangeSetJob::update(gone, added));
            }
            None => jobs.push(ChangeSetJob::install(added)),
        }
    }
    jobs.extend(removed.into_iter().map(ChangeSetJob::erase));
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileFlags;
    use crate::repository::CommitOptions;
    use crate::repository::tests::{trove_cs, version};
    use tempfile::TempDir;

    fn config_stream(data: &[u8]) -> FileStream {
        let mut s = FileStream::regular(data, 0o644);
        s.set_flags(FileFlags(FileFlags::CONFIG));
        s
    }

    #[test]
    fn test_absolute_change_set_for_install() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (trove, cs) = trove_cs("foo:runtime", &v, &[("/usr/bin/foo", b"binary")]);
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let out = repo
            .create_change_set(&[ChangeSetJob::install(&trove.tuple())], ChangeSetOptions::default())
            .unwrap();
        assert!(out.change_set.is_absolute());
        let path_id = PathId::for_path("/usr/bin/foo");
        assert_eq!(out.change_set.resolve_contents(&path_id), Some(&b"binary"[..]));
        assert!(out.files_needed.is_empty());
    }

    #[test]
    fn test_missing_trove_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let job = ChangeSetJob::install(&TroveTuple::new("ghost", v, Flavor::empty()));
        assert!(matches!(
            repo.create_change_set(&[job], ChangeSetOptions::default()),
            Err(Error::TroveNotFound(_))
        ));
    }

    #[test]
    fn test_relative_config_change_carries_diff() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v1 = version("/repo@rpl:devel/1.0-1-1", 100);
        let v2 = version("/repo@rpl:devel/1.0-2-1", 200);
        let conf = PathId::for_path("/etc/foo.conf");

        let old_stream = config_stream(b"a\nb\nc\n");
        let mut old = Trove::new("foo:config", v1.clone(), Flavor::empty());
        old.add_file(conf, "/etc/foo.conf", old_stream.file_id(), v1);
        let mut cs1 = ChangeSet::new();
        cs1.add_file_stream(conf, None, &old_stream).unwrap();
        cs1.add_contents(conf, FileContents::File(b"a\nb\nc\n".to_vec())).unwrap();
        cs1.add_trove(old.diff(None)).unwrap();
        repo.commit_change_set(&cs1, CommitOptions::default()).unwrap();

        let new_stream = config_stream(b"a\nB\nc\n");
        let mut new = old.clone();
        new.set_version(v2.clone());
        new.add_file(conf, "/etc/foo.conf", new_stream.file_id(), v2);
        let mut cs2 = ChangeSet::new();
        cs2.add_file_stream(conf, Some(&old_stream), &new_stream).unwrap();
        cs2.add_contents(conf, FileContents::File(b"a\nB\nc\n".to_vec())).unwrap();
        cs2.add_trove(new.diff(Some(&old))).unwrap();
        repo.commit_change_set(&cs2, CommitOptions::default()).unwrap();

        let job = ChangeSetJob::update(&old.tuple(), &new.tuple());
        let out = repo.create_change_set(&[job], ChangeSetOptions::default()).unwrap();
        assert!(!out.change_set.is_absolute());
        match out.change_set.contents(&conf) {
            Some(FileContents::Diff(diff)) => {
                let text = String::from_utf8(diff.clone()).unwrap();
                assert!(text.contains("-b\n+B\n"));
            }
            other => panic!("expected a diff, got {:?}", other),
        }
    }

    #[test]
    fn test_group_recursion_and_troves_needed() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (member, mut cs) = trove_cs("bash:runtime", &v, &[("/bin/bash", b"elf")]);
        let mut group = Trove::new("group-core", v, Flavor::empty());
        group.add_trove(member.tuple(), true);
        cs.add_trove(group.diff(None)).unwrap();
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let jobs = [ChangeSetJob::install(&group.tuple())];
        let deep = repo.create_change_set(&jobs, ChangeSetOptions::default()).unwrap();
        assert_eq!(deep.change_set.trove_count(), 2);
        assert!(deep.troves_needed.is_empty());

        let shallow = repo
            .create_change_set(&jobs, ChangeSetOptions { recurse: false, ..Default::default() })
            .unwrap();
        assert_eq!(shallow.change_set.trove_count(), 1);
        assert_eq!(shallow.troves_needed, vec![ChangeSetJob::install(&member.tuple())]);
    }

    #[test]
    fn test_cancelled_build_stops() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (trove, cs) = trove_cs("foo:runtime", &v, &[("/usr/bin/foo", b"binary")]);
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let cancel = CancelToken::new();
        let options = ChangeSetOptions {
            cancel: Some(cancel.clone()),
            ..Default::default()
        };
        let jobs = [ChangeSetJob::install(&trove.tuple())];
        assert!(repo.create_change_set(&jobs, options.clone()).is_ok());
        cancel.cancel();
        assert!(matches!(repo.create_change_set(&jobs, options), Err(Error::Cancelled)));
    }

    #[test]
    fn test_erase_and_without_files() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (trove, cs) = trove_cs("foo:runtime", &v, &[("/usr/bin/foo", b"binary")]);
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let out = repo
            .create_change_set(&[ChangeSetJob::erase(&trove.tuple())], ChangeSetOptions::default())
            .unwrap();
        assert_eq!(out.removed, vec![trove.tuple()]);
        assert_eq!(out.change_set.erasures().count(), 1);

        let bare = repo
            .create_change_set(
                &[ChangeSetJob::install(&trove.tuple())],
                ChangeSetOptions { with_files: false, ..Default::default() },
            )
            .unwrap();
        assert_eq!(bare.files_needed.len(), 1);
        assert_eq!(bare.change_set.files().count(), 0);
    }

    #[test]
    fn test_sub_trove_jobs_pair_by_name() {
        let v1 = version("/repo@rpl:devel/1-1-1", 1);
        let v2 = version("/repo@rpl:devel/2-1-1", 2);
        let mut old = Trove::new("group-a", v1.clone(), Flavor::empty());
        old.add_trove(TroveTuple::new("x:runtime", v1.clone(), Flavor::empty()), true);
        old.add_trove(TroveTuple::new("gone:runtime", v1.clone(), Flavor::empty()), true);
        let mut new = Trove::new("group-a", v2.clone(), Flavor::empty());
        new.add_trove(TroveTuple::new("x:runtime", v2.clone(), Flavor::empty()), true);

        let jobs = sub_trove_jobs(Some(&old), &new);
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().any(|j| j.name == "x:runtime" && j.old.is_some() && j.new.is_some()));
        assert!(jobs.iter().any(|j| j.name == "gone:runtime" && j.is_erase()));
    }
}
