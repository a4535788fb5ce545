// tests/repository.rs

//! Committing to a repository and building change sets back out of it.

mod common;

use common::{Fixture, Pkg};
use conary_core::changeset::{ChangeSetReader, EntryType};
use conary_core::repository::{ChangeSetJob, ChangeSetOptions};
use conary_core::{ChangeSet, CommitOptions, Repository, TroveSource, UpdateOptions, apply_change_set};
use tempfile::TempDir;

fn entry_counts(cs: &ChangeSet) -> (usize, usize) {
    let mut files = 0;
    let mut ptrs = 0;
    for entry in ChangeSetReader::from_bytes(cs.to_bytes()).unwrap() {
        match entry.unwrap().kind {
            EntryType::FileContents => files += 1,
            EntryType::FileContentsPtr => ptrs += 1,
            _ => {}
        }
    }
    (files, ptrs)
}

#[test]
fn test_identical_contents_are_shipped_once() {
    let tmp = TempDir::new().unwrap();
    let mut repo = Repository::init(tmp.path().join("repo")).unwrap();
    let pkg = Pkg::new("dup:runtime", "/repo@rpl:devel/1.0-1-1", 1000)
        .file("/usr/lib/one.so", b"\x7fELF same bytes")
        .file("/usr/lib/two.so", b"\x7fELF same bytes");
    repo.commit_change_set(&pkg.install_cs(), CommitOptions::default()).unwrap();

    let built = repo
        .create_change_set(&[ChangeSetJob::install(&pkg.tuple())], ChangeSetOptions::default())
        .unwrap();
    assert_eq!(entry_counts(&built.change_set), (1, 1));

    let mut fx = Fixture::new();
    let cs = ChangeSet::from_bytes(&built.change_set.to_bytes()).unwrap();
    apply_change_set(&mut fx.db, &cs, &UpdateOptions::default()).unwrap();
    let one = std::fs::metadata(fx.path("/usr/lib/one.so")).unwrap();
    let two = std::fs::metadata(fx.path("/usr/lib/two.so")).unwrap();
    assert_eq!(one.len(), two.len());
    assert_eq!(fx.read("/usr/lib/one.so"), fx.read("/usr/lib/two.so"));
}

#[test]
fn test_empty_trove_round_trips() {
    let tmp = TempDir::new().unwrap();
    let mut repo = Repository::init(tmp.path().join("repo")).unwrap();
    let pkg = Pkg::new("empty:runtime", "/repo@rpl:devel/1.0-1-1", 1000);

    let on_disk = tmp.path().join("empty.ccs");
    pkg.install_cs().write_to(&on_disk).unwrap();
    let cs = ChangeSet::read_from(&on_disk).unwrap();
    repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

    let back = repo.get_trove(&pkg.tuple()).unwrap().unwrap();
    assert_eq!(back.file_count(), 0);
    assert_eq!(back.tuple(), pkg.tuple());

    let built = repo
        .create_change_set(&[ChangeSetJob::install(&pkg.tuple())], ChangeSetOptions::default())
        .unwrap();
    let mut fx = Fixture::new();
    apply_change_set(&mut fx.db, &built.change_set, &UpdateOptions::default()).unwrap();
    assert_eq!(fx.db.installed().unwrap(), vec![pkg.tuple()]);
}

#[test]
fn test_hidden_commit_and_gc() {
    let tmp = TempDir::new().unwrap();
    let mut repo = Repository::init(tmp.path().join("repo")).unwrap();
    let old = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/usr/bin/app", b"old\n");
    let new = Pkg::new("app:runtime", "/repo@rpl:devel/2.0-1-1", 2000).file("/usr/bin/app", b"new\n");
    repo.commit_change_set(&old.install_cs(), CommitOptions::default()).unwrap();
    repo.commit_change_set(
        &new.install_cs(),
        CommitOptions {
            hidden: true,
            ..CommitOptions::default()
        },
    )
    .unwrap();

    // hidden instances are not offered
    assert_eq!(repo.versions_of("app:runtime").unwrap(), vec![old.tuple()]);

    repo.set_present(&old.tuple(), false).unwrap();
    let stats = repo.gc().unwrap();
    assert_eq!(stats.instances, 2);
    assert!(stats.blobs >= 2);
    assert!(!repo.has_trove(&old.tuple()).unwrap());
}

#[test]
fn test_reopen_sees_committed_troves() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("repo");
    let pkg = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/usr/bin/app", b"app\n");
    {
        let mut repo = Repository::init(&dir).unwrap();
        repo.commit_change_set(&pkg.install_cs(), CommitOptions::default()).unwrap();
    }
    let repo = Repository::open(&dir).unwrap();
    assert!(repo.has_trove(&pkg.tuple()).unwrap());
    let trove = repo.get_trove(&pkg.tuple()).unwrap().unwrap();
    let (_, entry) = trove.files().next().unwrap();
    assert_eq!(repo.get_file_contents(&entry.file_id).unwrap(), b"app\n");
}

#[test]
fn test_gc_sweeps_unreferenced_blobs() {
    let tmp = TempDir::new().unwrap();
    let mut repo = Repository::init(tmp.path().join("repo")).unwrap();
    let pkg = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/usr/bin/app", b"live\n");
    repo.commit_change_set(&pkg.install_cs(), CommitOptions::default()).unwrap();
    let stray = repo.blobs().store(b"left behind by an interrupted commit").unwrap();

    let stats = repo.gc().unwrap();
    assert_eq!(stats.instances, 0);
    assert_eq!(stats.blobs, 1);
    assert!(!repo.blobs().exists(&stray));

    let trove = repo.get_trove(&pkg.tuple()).unwrap().unwrap();
    let (_, entry) = trove.files().next().unwrap();
    assert_eq!(repo.get_file_contents(&entry.file_id).unwrap(), b"live\n");
}
