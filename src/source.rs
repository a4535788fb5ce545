// src/source.rs

//! Trove sources
//!
//! The resolver and the finder only need a few queries from whatever holds
//! troves: the repository store, the local database, or an in-memory
//! universe built by a test. [`TroveSource`] is that seam.

use crate::dependencies::{DepClass, Dependency};
use crate::error::Result;
use crate::files::{FileId, FileStream};
use crate::hash::Sha1Digest;
use crate::trove::{Trove, TroveTuple};
use std::collections::{BTreeMap, HashMap};

pub trait TroveSource {
    fn get_trove(&self, tuple: &TroveTuple) -> Result<Option<Trove>>;

    fn has_trove(&self, tuple: &TroveTuple) -> Result<bool> {
        Ok(self.get_trove(tuple)?.is_some())
    }

    /// Every visible instance of `name`, in tuple order
    fn versions_of(&self, name: &str) -> Result<Vec<TroveTuple>>;

    /// Instances whose provides satisfy `dep` of `class`
    fn providers(&self, class: DepClass, dep: &Dependency) -> Result<Vec<TroveTuple>>;

    fn get_file_stream(&self, file_id: &FileId) -> Result<Option<FileStream>>;

    fn get_file_contents(&self, sha1: &Sha1Digest) -> Result<Option<Vec<u8>>>;
}

/// A trove universe held entirely in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    troves: BTreeMap<TroveTuple, Trove>,
    streams: HashMap<FileId, FileStream>,
    contents: HashMap<Sha1Digest, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_trove(&mut self, trove: Trove) {
        self.troves.insert(trove.tuple(), trove);
    }

    pub fn add_file(&mut self, stream: FileStream, contents: Option<Vec<u8>>) {
        if let (Some(sha1), Some(bytes)) = (stream.contents_sha1(), contents) {
            self.contents.insert(sha1, bytes);
        }
        self.streams.insert(stream.file_id(), stream);
    }

    pub fn len(&self) -> usize {
        self.troves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.troves.is_empty()
    }
}

impl TroveSource for MemorySource {
    fn get_trove(&self, tuple: &TroveTuple) -> Result<Option<Trove>> {
        Ok(self.troves.get(tuple).cloned())
    }

    fn versions_of(&self, name: &str) -> Result<Vec<TroveTuple>> {
        Ok(self.troves.keys().filter(|t| t.name == name).cloned().collect())
    }

    fn providers(&self, class: DepClass, dep: &Dependency) -> Result<Vec<TroveTuple>> {
        Ok(self
            .troves
            .values()
            .filter(|t| t.provides().satisfies_atom(class, dep))
            .map(Trove::tuple)
            .collect())
    }

    fn get_file_stream(&self, file_id: &FileId) -> Result<Option<FileStream>> {
        Ok(self.streams.get(file_id).cloned())
    }

    fn get_file_contents(&self, sha1: &Sha1Digest) -> Result<Option<Vec<u8>>> {
        Ok(self.contents.get(sha1).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::Sense;
    use crate::flavor::Flavor;
    use crate::version::Version;

    #[test]
    fn test_memory_source_providers() {
        let v = Version::parse("/a@b:c/1.0-1-1").unwrap().stamped(5).unwrap();
        let mut lib = Trove::new("libfoo:lib", v.clone(), Flavor::empty());
        lib.provides_mut()
            .add(DepClass::Soname, Dependency::new("ELF64/libfoo.so.1").with_flag("x86_64", Sense::Required));
        let mut src = MemorySource::new();
        src.add_trove(lib.clone());
        src.add_trove(Trove::new("other:runtime", v, Flavor::empty()));

        let want = Dependency::new("ELF64/libfoo.so.1").with_flag("x86_64", Sense::Required);
        assert_eq!(src.providers(DepClass::Soname, &want).unwrap(), vec![lib.tuple()]);
        let self_provide = Dependency::new("libfoo:lib");
        assert_eq!(src.providers(DepClass::Trove, &self_provide).unwrap().len(), 1);
        assert_eq!(src.versions_of("other:runtime").unwrap().len(), 1);
        assert!(src.has_trove(&lib.tuple()).unwrap());
    }

    #[test]
    fn test_memory_source_files() {
        let stream = FileStream::regular(b"data", 0o644);
        let mut src = MemorySource::new();
        src.add_file(stream.clone(), Some(b"data".to_vec()));
        assert_eq!(src.get_file_stream(&stream.file_id()).unwrap(), Some(stream.clone()));
        let sha1 = stream.contents_sha1().unwrap();
        assert_eq!(src.get_file_contents(&sha1).unwrap(), Some(b"data".to_vec()));
    }
}
