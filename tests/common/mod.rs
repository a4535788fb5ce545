// tests/common/mod.rs

//! Shared fixtures for integration tests: an install root with its local
//! database, and a small builder for troves and the change sets that
//! install or update them.

#![allow(dead_code)]

use conary_core::changeset::FileContents;
use conary_core::files::FileFlags;
use conary_core::{ChangeSet, FileStream, Flavor, LocalDatabase, PathId, Trove, Version};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;

/// A root directory and the local database describing it
///
/// Keep the struct alive; dropping it removes the directories.
pub struct Fixture {
    pub tmp: TempDir,
    pub root: PathBuf,
    pub db: LocalDatabase,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let db = LocalDatabase::open(tmp.path().join("conarydb"), &root).unwrap();
        Self { tmp, root, db }
    }

    /// Host path of a trove path
    pub fn path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    pub fn read(&self, path: &str) -> Vec<u8> {
        std::fs::read(self.path(path)).unwrap()
    }
}

pub fn version(s: &str, ts: u32) -> Version {
    Version::parse(s).unwrap().stamped(ts).unwrap()
}

/// A trove together with the streams and contents of its files
#[derive(Clone)]
pub struct Pkg {
    pub trove: Trove,
    pub streams: BTreeMap<PathId, FileStream>,
    pub contents: BTreeMap<PathId, Vec<u8>>,
}

impl Pkg {
    pub fn new(name: &str, ver: &str, ts: u32) -> Self {
        Self {
            trove: Trove::new(name, version(ver, ts), Flavor::empty()),
            streams: BTreeMap::new(),
            contents: BTreeMap::new(),
        }
    }

    pub fn with_flavor(mut self, flavor: &str) -> Self {
        let v = self.trove.version().clone();
        let name = self.trove.name().to_string();
        self.trove = Trove::new(name, v, Flavor::parse(flavor).unwrap());
        self
    }

    /// Add a file with a prepared stream; contents are taken from `data`
    pub fn stream(mut self, path: &str, stream: FileStream, data: Option<&[u8]>) -> Self {
        let path_id = PathId::for_path(path);
        let v = self.trove.version().clone();
        self.trove.add_file(path_id, path, stream.file_id(), v);
        self.streams.insert(path_id, stream);
        if let Some(data) = data {
            self.contents.insert(path_id, data.to_vec());
        }
        self
    }

    pub fn file(self, path: &str, data: &[u8]) -> Self {
        self.stream(path, FileStream::regular(data, 0o644), Some(data))
    }

    pub fn config(self, path: &str, data: &[u8]) -> Self {
        let mut stream = FileStream::regular(data, 0o644);
        stream.set_flags(FileFlags::default().with(FileFlags::CONFIG));
        self.stream(path, stream, Some(data))
    }

    pub fn tuple(&self) -> conary_core::TroveTuple {
        self.trove.tuple()
    }

    /// Absolute change set installing this trove
    pub fn install_cs(&self) -> ChangeSet {
        let mut cs = ChangeSet::new();
        for (path_id, stream) in &self.streams {
            cs.add_file_stream(*path_id, None, stream).unwrap();
            if let Some(data) = self.contents.get(path_id) {
                cs.add_contents(*path_id, FileContents::File(data.clone())).unwrap();
            }
        }
        cs.add_trove(self.trove.diff(None)).unwrap();
        cs
    }

    /// Relative change set from `old` to this trove; unchanged files are
    /// left out
    pub fn update_cs(&self, old: &Pkg) -> ChangeSet {
        let mut cs = ChangeSet::new();
        for (path_id, stream) in &self.streams {
            let before = old.streams.get(path_id);
            if before.is_some_and(|b| b.file_id() == stream.file_id()) {
                continue;
            }
            cs.add_file_stream(*path_id, before, stream).unwrap();
            if let Some(data) = self.contents.get(path_id) {
                cs.add_contents(*path_id, FileContents::File(data.clone())).unwrap();
            }
        }
        cs.add_trove(self.trove.diff(Some(&old.trove))).unwrap();
        cs
    }
}

/// `count` numbered lines of text
pub fn lines(count: usize) -> String {
    (1..=count).map(|i| format!("line {}\n", i)).collect()
}

/// `text` with line `n` (1-based) replaced
pub fn edit_line(text: &str, n: usize, with: &str) -> String {
    text.lines()
        .enumerate()
        .map(|(i, l)| if i + 1 == n { format!("{}\n", with) } else { format!("{}\n", l) })
        .collect()
}
