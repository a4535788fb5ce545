// tests/update.rs

//! Applying change sets to a root: config merging, file ownership,
//! rollback, idempotence and hard links.

mod common;

use common::{Fixture, Pkg, edit_line, lines};
use conary_core::update::{Action, FsOp, Target};
use conary_core::{ChangeSet, Error, FileStream, UpdateOptions, apply_change_set};
use std::os::unix::fs::MetadataExt;

fn opts() -> UpdateOptions {
    UpdateOptions::default()
}

#[test]
fn test_config_merge_with_conflict() {
    let mut fx = Fixture::new();
    let base = lines(10);
    let v1 = Pkg::new("app:config", "/repo@rpl:devel/1.0-1-1", 1000).config("/etc/app.conf", base.as_bytes());
    apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();

    let local = edit_line(&base, 5, "line 5 edited locally");
    std::fs::write(fx.path("/etc/app.conf"), &local).unwrap();

    let repo = edit_line(&base, 5, "line 5 from the repository");
    let v2 = Pkg::new("app:config", "/repo@rpl:devel/2.0-1-1", 2000).config("/etc/app.conf", repo.as_bytes());
    let job = apply_change_set(&mut fx.db, &v2.update_cs(&v1), &opts()).unwrap();

    assert_eq!(job.conflicts, vec!["/etc/app.conf".to_string()]);
    assert!(job.fs_ops().contains(&FsOp::Merge {
        path: "/etc/app.conf".to_string(),
        conflicts: true,
    }));
    let merged = String::from_utf8(fx.read("/etc/app.conf")).unwrap();
    assert_eq!(merged.lines().nth(4), Some("line 5 from the repository"));
    let rejects = String::from_utf8(fx.read("/etc/app.conf.conflicts")).unwrap();
    assert!(rejects.contains("+line 5 edited locally"));
    assert_eq!(fx.db.installed().unwrap(), vec![v2.tuple()]);
}

#[test]
fn test_config_merge_keeps_local_edits() {
    let mut fx = Fixture::new();
    let base = lines(10);
    let v1 = Pkg::new("app:config", "/repo@rpl:devel/1.0-1-1", 1000).config("/etc/app.conf", base.as_bytes());
    apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();

    let local = edit_line(&base, 2, "local setting");
    std::fs::write(fx.path("/etc/app.conf"), &local).unwrap();

    let repo = edit_line(&base, 9, "new default");
    let v2 = Pkg::new("app:config", "/repo@rpl:devel/2.0-1-1", 2000).config("/etc/app.conf", repo.as_bytes());
    let job = apply_change_set(&mut fx.db, &v2.update_cs(&v1), &opts()).unwrap();

    assert!(job.conflicts.is_empty());
    let merged = String::from_utf8(fx.read("/etc/app.conf")).unwrap();
    assert_eq!(merged.lines().nth(1), Some("local setting"));
    assert_eq!(merged.lines().nth(8), Some("new default"));
    assert!(!fx.path("/etc/app.conf.conflicts").exists());
}

#[test]
fn test_strict_merge_fails_without_writing() {
    let mut fx = Fixture::new();
    let base = lines(10);
    let v1 = Pkg::new("app:config", "/repo@rpl:devel/1.0-1-1", 1000).config("/etc/app.conf", base.as_bytes());
    apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();
    let local = edit_line(&base, 5, "mine");
    std::fs::write(fx.path("/etc/app.conf"), &local).unwrap();

    let v2 = Pkg::new("app:config", "/repo@rpl:devel/2.0-1-1", 2000)
        .config("/etc/app.conf", edit_line(&base, 5, "theirs").as_bytes());
    let strict = UpdateOptions {
        strict_merge: true,
        ..opts()
    };
    let err = apply_change_set(&mut fx.db, &v2.update_cs(&v1), &strict).unwrap_err();
    assert!(matches!(err, Error::MergeConflict(_)));
    assert_eq!(fx.read("/etc/app.conf"), local.as_bytes());
    assert_eq!(fx.db.installed().unwrap(), vec![v1.tuple()]);
}

#[test]
fn test_config_with_empty_diff_is_not_restored() {
    let mut fx = Fixture::new();
    let text = lines(4);
    let v1 = Pkg::new("app:config", "/repo@rpl:devel/1.0-1-1", 1000).config("/etc/app.conf", text.as_bytes());
    apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();
    let inode = std::fs::metadata(fx.path("/etc/app.conf")).unwrap().ino();

    // same bytes, new permissions
    let mut stream = v1.streams.values().next().unwrap().clone();
    stream.set_perms(0o600);
    let v2 = Pkg::new("app:config", "/repo@rpl:devel/1.0-1-2", 2000).stream("/etc/app.conf", stream, None);
    let mut cs = v2.update_cs(&v1);
    let pid = conary_core::PathId::for_path("/etc/app.conf");
    cs.add_contents(pid, conary_core::changeset::FileContents::Diff(Vec::new())).unwrap();

    let job = apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
    assert_eq!(
        job.fs_ops(),
        &[FsOp::Metadata {
            path: "/etc/app.conf".to_string()
        }]
    );
    let meta = std::fs::metadata(fx.path("/etc/app.conf")).unwrap();
    assert_eq!(meta.ino(), inode);
    assert_eq!(meta.mode() & 0o777, 0o600);
    assert_eq!(fx.read("/etc/app.conf"), text.as_bytes());
}

#[test]
fn test_file_conflict_and_replace_files() {
    let mut fx = Fixture::new();
    let a = Pkg::new("a:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/usr/bin/x", b"from a\n");
    let b = Pkg::new("b:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/usr/bin/x", b"from b\n");
    apply_change_set(&mut fx.db, &a.install_cs(), &opts()).unwrap();

    let err = apply_change_set(&mut fx.db, &b.install_cs(), &opts()).unwrap_err();
    assert!(matches!(err, Error::FileConflict(_)));
    assert_eq!(fx.db.owner_of("/usr/bin/x").unwrap(), Some(a.tuple()));
    assert_eq!(fx.db.installed().unwrap(), vec![a.tuple()]);

    let replace = UpdateOptions {
        replace_files: true,
        ..opts()
    };
    apply_change_set(&mut fx.db, &b.install_cs(), &replace).unwrap();
    assert_eq!(fx.db.owner_of("/usr/bin/x").unwrap(), Some(b.tuple()));
    assert_eq!(fx.read("/usr/bin/x"), b"from b\n");
    let mut installed = fx.db.installed().unwrap();
    installed.sort();
    assert_eq!(installed, vec![a.tuple(), b.tuple()]);
}

#[test]
fn test_rollback_restores_exact_bytes() {
    let mut fx = Fixture::new();
    let v1 = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000)
        .file("/etc/conf", b"version one\n")
        .file("/usr/bin/app", b"binary one\n");
    apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();

    let v2 = Pkg::new("app:runtime", "/repo@rpl:devel/2.0-1-1", 2000)
        .file("/etc/conf", b"version two\n")
        .file("/usr/bin/app", b"binary one\n")
        .file("/usr/share/app/new", b"added\n");
    apply_change_set(&mut fx.db, &v2.update_cs(&v1), &opts()).unwrap();
    assert_eq!(fx.read("/etc/conf"), b"version two\n");
    assert_eq!(fx.db.rollback_count(), 2);

    fx.db.rollback_one().unwrap();
    assert_eq!(fx.read("/etc/conf"), b"version one\n");
    assert_eq!(fx.read("/usr/bin/app"), b"binary one\n");
    assert!(!fx.path("/usr/share/app/new").exists());
    assert_eq!(fx.db.installed().unwrap(), vec![v1.tuple()]);
    assert_eq!(fx.db.rollback_count(), 1);
}

#[test]
fn test_rollback_restores_locally_edited_config() {
    let mut fx = Fixture::new();
    let base = lines(10);
    let v1 = Pkg::new("app:config", "/repo@rpl:devel/1.0-1-1", 1000).config("/etc/app.conf", base.as_bytes());
    apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();
    let local = edit_line(&base, 2, "tuned");
    std::fs::write(fx.path("/etc/app.conf"), &local).unwrap();

    let v2 = Pkg::new("app:config", "/repo@rpl:devel/2.0-1-1", 2000)
        .config("/etc/app.conf", edit_line(&base, 9, "upstream").as_bytes());
    apply_change_set(&mut fx.db, &v2.update_cs(&v1), &opts()).unwrap();
    assert_ne!(fx.read("/etc/app.conf"), local.as_bytes());

    fx.db.rollback_one().unwrap();
    assert_eq!(fx.read("/etc/app.conf"), local.as_bytes());
    assert_eq!(fx.db.installed().unwrap(), vec![v1.tuple()]);
}

#[test]
fn test_reapplying_is_a_no_op() {
    let mut fx = Fixture::new();
    let pkg = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/usr/bin/app", b"app\n");
    let cs = pkg.install_cs();
    apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
    let before = std::fs::metadata(fx.path("/usr/bin/app")).unwrap();

    let job = apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
    assert!(job.is_noop());
    assert!(job.fs_ops().is_empty());
    assert_eq!(job.rollback, None);
    assert_eq!(fx.db.rollback_count(), 1);
    let after = std::fs::metadata(fx.path("/usr/bin/app")).unwrap();
    assert_eq!(before.ino(), after.ino());
}

#[test]
fn test_empty_change_set_is_a_no_op() {
    let mut fx = Fixture::new();
    let job = apply_change_set(&mut fx.db, &ChangeSet::new(), &opts()).unwrap();
    assert!(job.is_noop());
    assert_eq!(fx.db.rollback_count(), 0);
}

#[test]
fn test_hard_links_survive_unrelated_update() {
    let mut fx = Fixture::new();
    let linked = |data: &[u8]| {
        let mut stream = conary_core::FileStream::regular(data, 0o755);
        stream.set_link_group(&[3u8; 16]);
        stream
    };
    let v1 = Pkg::new("tools:runtime", "/repo@rpl:devel/1.0-1-1", 1000)
        .stream("/bin/gzip", linked(b"gz\n"), Some(b"gz\n"))
        .stream("/bin/gunzip", linked(b"gz\n"), Some(b"gz\n"))
        .file("/etc/tools", b"one\n");
    apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();
    let ino = |fx: &Fixture, p: &str| std::fs::metadata(fx.path(p)).unwrap().ino();
    assert_eq!(ino(&fx, "/bin/gzip"), ino(&fx, "/bin/gunzip"));

    let v2 = Pkg::new("tools:runtime", "/repo@rpl:devel/2.0-1-1", 2000)
        .stream("/bin/gzip", linked(b"gz\n"), Some(b"gz\n"))
        .stream("/bin/gunzip", linked(b"gz\n"), Some(b"gz\n"))
        .file("/etc/tools", b"two\n");
    apply_change_set(&mut fx.db, &v2.update_cs(&v1), &opts()).unwrap();
    assert_eq!(ino(&fx, "/bin/gzip"), ino(&fx, "/bin/gunzip"));
    assert_eq!(fx.read("/etc/tools"), b"two\n");
}

#[test]
fn test_hard_links_survive_permission_change_over_the_wire() {
    let mut fx = Fixture::new();
    let linked = |perms: u16| {
        let mut stream = conary_core::FileStream::regular(b"tool\n", perms);
        stream.set_link_group(&[5u8; 16]);
        stream
    };
    let v1 = Pkg::new("tools:runtime", "/repo@rpl:devel/1.0-1-1", 1000)
        .stream("/bin/one", linked(0o644), Some(b"tool\n"))
        .stream("/bin/two", linked(0o644), Some(b"tool\n"));
    let cs = ChangeSet::from_bytes(&v1.install_cs().to_bytes()).unwrap();
    apply_change_set(&mut fx.db, &cs, &opts()).unwrap();
    let meta = |fx: &Fixture, p: &str| std::fs::metadata(fx.path(p)).unwrap();
    let before = meta(&fx, "/bin/one").ino();
    assert_eq!(before, meta(&fx, "/bin/two").ino());

    // same bytes, new mode; the second member travels as a pointer
    let v2 = Pkg::new("tools:runtime", "/repo@rpl:devel/2.0-1-1", 2000)
        .stream("/bin/one", linked(0o755), Some(b"tool\n"))
        .stream("/bin/two", linked(0o755), Some(b"tool\n"));
    let cs = ChangeSet::from_bytes(&v2.update_cs(&v1).to_bytes()).unwrap();
    let job = apply_change_set(&mut fx.db, &cs, &opts()).unwrap();

    assert!(
        job.fs_ops()
            .iter()
            .all(|op| !matches!(op, FsOp::Restore { .. } | FsOp::Link { .. }))
    );
    assert_eq!(meta(&fx, "/bin/one").ino(), before);
    assert_eq!(meta(&fx, "/bin/two").ino(), before);
    assert_eq!(meta(&fx, "/bin/two").mode() & 0o7777, 0o755);
}

#[test]
fn test_missing_link_member_links_to_kept_member() {
    let mut fx = Fixture::new();
    let linked = |perms: u16| {
        let mut stream = conary_core::FileStream::regular(b"tool\n", perms);
        stream.set_link_group(&[6u8; 16]);
        stream
    };
    let v1 = Pkg::new("tools:runtime", "/repo@rpl:devel/1.0-1-1", 1000)
        .stream("/bin/one", linked(0o644), Some(b"tool\n"))
        .stream("/bin/two", linked(0o644), Some(b"tool\n"));
    apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();
    std::fs::remove_file(fx.path("/bin/two")).unwrap();

    let v2 = Pkg::new("tools:runtime", "/repo@rpl:devel/2.0-1-1", 2000)
        .stream("/bin/one", linked(0o755), Some(b"tool\n"))
        .stream("/bin/two", linked(0o755), Some(b"tool\n"));
    let job = apply_change_set(&mut fx.db, &v2.update_cs(&v1), &opts()).unwrap();

    assert!(job.fs_ops().contains(&FsOp::Link {
        path: "/bin/two".to_string(),
        target: "/bin/one".to_string(),
    }));
    let ino = |p: &str| std::fs::metadata(fx.path(p)).unwrap().ino();
    assert_eq!(ino("/bin/one"), ino("/bin/two"));
}

#[test]
fn test_shared_contents_read_once() {
    let mut fx = Fixture::new();
    let pkg = Pkg::new("docs:doc", "/repo@rpl:devel/1.0-1-1", 1000)
        .file("/usr/share/doc/a", b"same text\n")
        .file("/usr/share/doc/b", b"same text\n")
        .file("/usr/share/doc/c", b"same text\n");

    // the container writer turns repeated contents into pointers
    let cs = ChangeSet::from_bytes(&pkg.install_cs().to_bytes()).unwrap();
    let job = apply_change_set(&mut fx.db, &cs, &opts()).unwrap();

    assert_eq!(job.ptr_reads, 1);
    for path in ["/usr/share/doc/a", "/usr/share/doc/b", "/usr/share/doc/c"] {
        assert_eq!(fx.read(path), b"same text\n");
    }
}

#[test]
fn test_erase_leaves_user_removed_paths_alone() {
    let mut fx = Fixture::new();
    let pkg = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000)
        .file("/usr/bin/app", b"app\n")
        .file("/usr/bin/helper", b"helper\n");
    apply_change_set(&mut fx.db, &pkg.install_cs(), &opts()).unwrap();
    std::fs::remove_file(fx.path("/usr/bin/helper")).unwrap();
    fx.db.remove_files_local("/usr/bin/helper").unwrap();

    let mut erase = ChangeSet::new();
    erase.add_erasure(pkg.tuple());
    let job = apply_change_set(&mut fx.db, &erase, &opts()).unwrap();
    assert_eq!(
        job.fs_ops(),
        &[FsOp::Remove {
            path: "/usr/bin/app".to_string()
        }]
    );
    assert!(fx.db.installed().unwrap().is_empty());
}

const LOG_DESC_V1: &str = "file /usr/libexec/loghandler
implements handler preremove
implements handler update
implements files preremove
implements files update
implements files remove
";

/// A handler script that appends `<who> <args>` to `/tag.log`
fn log_handler(who: &str) -> Vec<u8> {
    format!("#!/bin/sh\necho \"{} $*\" >> \"$CONARY_ROOT/tag.log\"\n", who).into_bytes()
}

fn tagged(data: &[u8], tag: &str) -> FileStream {
    let mut stream = FileStream::regular(data, 0o644);
    stream.add_tag(tag);
    stream
}

fn tag_log(fx: &Fixture) -> Vec<String> {
    String::from_utf8(fx.read("/tag.log"))
        .unwrap()
        .lines()
        .map(String::from)
        .collect()
}

fn tag_ops(ops: &[FsOp]) -> Vec<(Target, Action)> {
    ops.iter()
        .filter_map(|op| match op {
            FsOp::Tag { target, action, .. } => Some((*target, *action)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_tag_handlers_run_in_phase_order() {
    let mut fx = Fixture::new();
    let old = log_handler("old");
    let v1 = Pkg::new("tools:runtime", "/repo@rpl:devel/1.0-1-1", 1000)
        .file("/etc/conary/tags/log", LOG_DESC_V1.as_bytes())
        .stream("/usr/libexec/loghandler", FileStream::regular(&old, 0o755), Some(&old))
        .stream("/usr/share/a", tagged(b"a\n", "log"), Some(b"a\n"));
    let job = apply_change_set(&mut fx.db, &v1.install_cs(), &opts()).unwrap();

    // a fresh install brings the handler in, then feeds it the new files
    assert_eq!(
        tag_ops(job.fs_ops()),
        vec![(Target::Handler, Action::Update), (Target::Files, Action::Update)]
    );
    assert_eq!(tag_log(&fx), vec!["old update handler /usr/share/a", "old update files /usr/share/a"]);
    std::fs::remove_file(fx.path("/tag.log")).unwrap();

    // v2 moves the handler program, drops /usr/share/a and adds /usr/share/b
    let new = log_handler("new");
    let desc_v2 = LOG_DESC_V1.replace("/usr/libexec/loghandler", "/usr/libexec/loghandler2");
    let v2 = Pkg::new("tools:runtime", "/repo@rpl:devel/2.0-1-1", 2000)
        .file("/etc/conary/tags/log", desc_v2.as_bytes())
        .stream("/usr/libexec/loghandler2", FileStream::regular(&new, 0o755), Some(&new))
        .stream("/usr/share/b", tagged(b"b\n", "log"), Some(b"b\n"));
    let cs = ChangeSet::from_bytes(&v2.update_cs(&v1).to_bytes()).unwrap();
    let job = apply_change_set(&mut fx.db, &cs, &opts()).unwrap();

    assert_eq!(
        tag_ops(job.fs_ops()),
        vec![
            (Target::Handler, Action::PreRemove),
            (Target::Files, Action::PreRemove),
            (Target::Handler, Action::Update),
            (Target::Files, Action::Update),
            (Target::Files, Action::Remove),
        ]
    );
    let log = tag_log(&fx);
    let phases: Vec<String> = log
        .iter()
        .map(|line| line.split_whitespace().take(3).collect::<Vec<_>>().join(" "))
        .collect();
    // the outgoing program sees the preremove phases, its replacement the rest
    assert_eq!(
        phases,
        vec![
            "old preremove handler",
            "old preremove files",
            "new update handler",
            "new update files",
            "new remove files",
        ]
    );
    assert_eq!(log[1], "old preremove files /usr/share/a");
    assert!(log[2].ends_with(" /usr/share/b"));
    assert!(!log[2].contains("/usr/share/a"));
    assert_eq!(log[3], "new update files /usr/share/b");
    assert_eq!(log[4], "new remove files /usr/share/a");
    assert!(!fx.path("/usr/libexec/loghandler").exists());
    assert!(!fx.path("/usr/share/a").exists());
}

