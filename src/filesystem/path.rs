// src/filesystem/path.rs

//! Trove path handling
//!
//! Trove file paths are absolute (`/etc/motd`) and come from change sets
//! that may have been built anywhere. Before touching disk they are
//! mapped under the install root, and anything that could climb out of
//! that root is rejected.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Normalise a trove path into a root-relative one
///
/// ```
/// use conary_core::filesystem::path::sanitize_path;
/// use std::path::PathBuf;
///
/// assert_eq!(sanitize_path("/usr/bin/foo").unwrap(), PathBuf::from("usr/bin/foo"));
/// assert!(sanitize_path("/usr/../../etc/passwd").is_err());
/// ```
pub fn sanitize_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(Error::PathTraversal(path.display().to_string()));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(Error::InvalidPath(format!("'{}' names no file", path.display())));
    }
    Ok(normalized)
}

/// Place a trove path under `root`
pub fn under_root(root: &Path, trove_path: &str) -> Result<PathBuf> {
    Ok(root.join(sanitize_path(trove_path)?))
}

/// Map an on-disk path back to the trove path it was installed from
pub fn trove_path(root: &Path, disk_path: &Path) -> Option<String> {
    let rel = disk_path.strip_prefix(root).ok()?;
    Some(format!("/{}", rel.to_string_lossy()))
}

/// Refuse to write through a symlinked parent directory inside `root`
///
/// The final component itself may be a symlink (it is about to be
/// replaced); it is the directories above it that must be real.
pub fn check_parents(root: &Path, target: &Path) -> Result<()> {
    let Ok(rel) = target.strip_prefix(root) else {
        return Err(Error::PathTraversal(target.display().to_string()));
    };
    let mut current = root.to_path_buf();
    let mut components = rel.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                // a symlink that stays inside root is fine
                let resolved = std::fs::canonicalize(&current)?;
                let canon_root = std::fs::canonicalize(root)?;
                if !resolved.starts_with(&canon_root) {
                    return Err(Error::PathTraversal(format!(
                        "{} leaves {} through a symlink",
                        target.display(),
                        root.display()
                    )));
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
