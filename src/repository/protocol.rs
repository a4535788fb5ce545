// src/repository/protocol.rs

//! Request/response boundary of the repository
//!
//! Requests and responses are plain serde enums so any transport that can
//! move JSON can carry them. Change sets travel out of band: the server
//! writes them under its staging directory and answers with a `file://`
//! URL, and commits name a URL the same way.

use super::{ChangeSetJob, ChangeSetOptions, CommitOptions, QueryMap, Repository, VersionFlavorMap};
use crate::changeset::ChangeSet;
use crate::error::{Error, Result};
use crate::files::{FileId, PathId};
use crate::label::Label;
use crate::trove::TroveTuple;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Contents at or below this size are returned in band
pub const INLINE_CONTENTS_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Request {
    GetTroveVersionList {
        label: Option<Label>,
        names: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    GetTroveLeavesByLabel {
        query: QueryMap,
        best_flavor: bool,
    },
    #[serde(rename_all = "camelCase")]
    GetTroveLeavesByBranch {
        query: QueryMap,
        best_flavor: bool,
    },
    #[serde(rename_all = "camelCase")]
    GetTroveVersionFlavors {
        query: QueryMap,
        best_flavor: bool,
    },
    GetFileContents {
        files: Vec<(FileId, Version)>,
    },
    #[serde(rename_all = "camelCase")]
    GetChangeSet {
        jobs: Vec<ChangeSetJob>,
        recurse: bool,
        with_files: bool,
        with_file_contents: bool,
        exclude_auto_source: bool,
    },
    CommitChangeSet {
        url: String,
        mirror: bool,
        hidden: bool,
    },
    AddUser {
        user: String,
        password: String,
    },
    #[serde(rename_all = "camelCase")]
    AddAcl {
        role: String,
        trove_pattern: String,
        label: Option<String>,
        write: bool,
    },
    #[serde(rename_all = "camelCase")]
    ChangePassword {
        user: String,
        new_password: String,
    },
    AddEntitlementKey {
        group: String,
        key: String,
    },
}

impl Request {
    /// Identity operations live outside the store and go to the hook
    pub fn is_identity_op(&self) -> bool {
        matches!(
            self,
            Request::AddUser { .. }
                | Request::AddAcl { .. }
                | Request::ChangePassword { .. }
                | Request::AddEntitlementKey { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Request::CommitChangeSet { .. }) || self.is_identity_op()
    }

    fn method(&self) -> &'static str {
        match self {
            Request::GetTroveVersionList { .. } => "getTroveVersionList",
            Request::GetTroveLeavesByLabel { .. } => "getTroveLeavesByLabel",
            Request::GetTroveLeavesByBranch { .. } => "getTroveLeavesByBranch",
            Request::GetTroveVersionFlavors { .. } => "getTroveVersionFlavors",
            Request::GetFileContents { .. } => "getFileContents",
            Request::GetChangeSet { .. } => "getChangeSet",
            Request::CommitChangeSet { .. } => "commitChangeSet",
            Request::AddUser { .. } => "addUser",
            Request::AddAcl { .. } => "addAcl",
            Request::ChangePassword { .. } => "changePassword",
            Request::AddEntitlementKey { .. } => "addEntitlementKey",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentRef {
    InBand(Vec<u8>),
    /// Path of the blob on the server's filesystem
    Blob(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "camelCase")]
pub enum Response {
    Versions(VersionFlavorMap),
    Contents(Vec<ContentRef>),
    #[serde(rename_all = "camelCase")]
    ChangeSet {
        url: String,
        size: u64,
        troves_needed: Vec<ChangeSetJob>,
        removed: Vec<TroveTuple>,
        files_needed: Vec<(PathId, FileId)>,
    },
    Committed(Vec<TroveTuple>),
    Ok,
    Error {
        kind: String,
        message: String,
    },
}

impl Response {
    fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::TroveNotFound(_) => "TroveNotFound",
            Error::TroveMissing(_) => "TroveMissing",
            Error::VersionParse(_) => "VersionParseError",
            Error::FlavorParse(_) => "FlavorParseError",
            Error::Integrity(_) | Error::ChecksumMismatch { .. } => "IntegrityError",
            Error::PermissionDenied(_) => "PermissionDenied",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::Backend(_) | Error::Database(_) => "BackendError",
            Error::OpenPgp(_) => "OpenPGPError",
            _ => "InternalError",
        };
        Response::Error {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}

/// Authorisation seam for callers the store knows nothing about
pub trait AccessHook {
    fn allow(&self, request: &Request) -> bool;

    /// Carry out an identity operation; the store has no user tables
    fn identity(&mut self, request: &Request) -> Result<()> {
        Err(Error::PermissionDenied(format!("{} is not handled here", request.method())))
    }
}

/// Reads and commits for everyone, no identity operations
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenAccess;

impl AccessHook for OpenAccess {
    fn allow(&self, request: &Request) -> bool {
        !request.is_identity_op()
    }
}

/// Reads only
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOnly;

impl AccessHook for ReadOnly {
    fn allow(&self, request: &Request) -> bool {
        !request.is_write()
    }
}

pub struct RepositoryServer {
    repo: Repository,
    hook: Box<dyn AccessHook>,
    staging: PathBuf,
}

impl RepositoryServer {
    pub fn new(repo: Repository, hook: Box<dyn AccessHook>, staging: impl Into<PathBuf>) -> Result<Self> {
        let staging = staging.into();
        std::fs::create_dir_all(&staging)?;
        Ok(Self { repo, hook, staging })
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn handle(&mut self, request: Request) -> Response {
        debug!("Handling {}", request.method());
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                warn!("Request failed: {}", e);
                Response::from_error(&e)
            }
        }
    }

    /// JSON in, JSON out
    pub fn handle_json(&mut self, body: &str) -> String {
        let response = match serde_json::from_str::<Request>(body) {
            Ok(request) => self.handle(request),
            Err(e) => Response::Error {
                kind: "ParseError".to_string(),
                message: e.to_string(),
            },
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"result":"error","value":{{"kind":"InternalError","message":"{}"}}}}"#, e)
        })
    }

    fn dispatch(&mut self, request: Request) -> Result<Response> {
        if request.is_identity_op() {
            if !self.hook.allow(&request) {
                return Err(Error::PermissionDenied(request.method().to_string()));
            }
            self.hook.identity(&request)?;
            return Ok(Response::Ok);
        }
        if !self.hook.allow(&request) {
            return Err(Error::PermissionDenied(request.method().to_string()));
        }

        match request {
            Request::GetTroveVersionList { label, names } => {
                Ok(Response::Versions(self.repo.get_trove_version_list(label.as_ref(), &names)?))
            }
            Request::GetTroveLeavesByLabel { query, best_flavor } => {
                Ok(Response::Versions(self.repo.get_trove_leaves_by_label(&query, best_flavor)?))
            }
            Request::GetTroveLeavesByBranch { query, best_flavor } => {
                Ok(Response::Versions(self.repo.get_trove_leaves_by_branch(&query, best_flavor)?))
            }
            Request::GetTroveVersionFlavors { query, best_flavor } => {
                Ok(Response::Versions(self.repo.get_trove_version_flavors(&query, best_flavor)?))
            }
            Request::GetFileContents { files } => {
                let mut out = Vec::with_capacity(files.len());
                for (file_id, _version) in &files {
                    out.push(self.content_ref(file_id)?);
                }
                Ok(Response::Contents(out))
            }
            Request::GetChangeSet {
                jobs,
                recurse,
                with_files,
                with_file_contents,
                exclude_auto_source,
            } => {
                let options = ChangeSetOptions {
                    recurse,
                    with_files,
                    with_file_contents,
                    exclude_auto_source,
                    cancel: None,
                };
                let result = self.repo.create_change_set(&jobs, options)?;
                let path = self.staging.join(format!("{}.ccs", uuid::Uuid::new_v4()));
                let size = result.change_set.write_to(&path)?;
                info!("Staged change set {} ({} bytes)", path.display(), size);
                Ok(Response::ChangeSet {
                    url: format!("file://{}", path.display()),
                    size,
                    troves_needed: result.troves_needed,
                    removed: result.removed,
                    files_needed: result.files_needed,
                })
            }
            Request::CommitChangeSet { url, mirror, hidden } => {
                let path = url_path(&url)?;
                let cs = ChangeSet::read_from(&path)?;
                let committed = self.repo.commit_change_set(&cs, CommitOptions { mirror, hidden })?;
                Ok(Response::Committed(committed))
            }
            // identity operations returned above
            _ => Err(Error::PermissionDenied(String::from("identity operation"))),
        }
    }

    fn content_ref(&self, file_id: &FileId) -> Result<ContentRef> {
        let stream = self
            .repo
            .get_file_stream(file_id)?
            .ok_or_else(|| Error::TroveNotFound(format!("file stream {}", file_id)))?;
        let sha1 = stream
            .contents_sha1()
            .ok_or_else(|| Error::NotFound(format!("file {} has no contents", file_id)))?;
        let small = stream.size().is_some_and(|s| s as usize <= INLINE_CONTENTS_LIMIT);
        if small {
            Ok(ContentRef::InBand(self.repo.blobs().retrieve(&sha1)?))
        } else {
            let path = self.repo.blobs().path_for(&sha1);
            if !path.exists() {
                return Err(Error::TroveMissing(format!("contents {}", sha1)));
            }
            Ok(ContentRef::Blob(path))
        }
    }
}

/// Local path named by a `file://` URL or a bare path
fn url_path(url: &str) -> Result<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Ok(PathBuf::from(rest));
    }
    if url.contains("://") {
        return Err(Error::InvalidPath(format!("unsupported change set URL {}", url)));
    }
    Ok(Path::new(url).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::tests::{trove_cs, version};
    use tempfile::TempDir;

    fn server(tmp: &TempDir, hook: Box<dyn AccessHook>) -> RepositoryServer {
        let repo = Repository::init(tmp.path().join("repo")).unwrap();
        RepositoryServer::new(repo, hook, tmp.path().join("staging")).unwrap()
    }

    #[test]
    fn test_commit_by_url_then_fetch_change_set() {
        let tmp = TempDir::new().unwrap();
        let mut srv = server(&tmp, Box::new(OpenAccess));
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (trove, cs) = trove_cs("foo:runtime", &v, &[("/usr/bin/foo", b"binary")]);
        let upload = tmp.path().join("upload.ccs");
        cs.write_to(&upload).unwrap();

        let resp = srv.handle(Request::CommitChangeSet {
            url: format!("file://{}", upload.display()),
            mirror: false,
            hidden: false,
        });
        assert_eq!(resp, Response::Committed(vec![trove.tuple()]));

        let resp = srv.handle(Request::GetChangeSet {
            jobs: vec![ChangeSetJob::install(&trove.tuple())],
            recurse: true,
            with_files: true,
            with_file_contents: true,
            exclude_auto_source: false,
        });
        let Response::ChangeSet { url, size, .. } = resp else {
            panic!("unexpected {:?}", resp);
        };
        assert!(size > 0);
        let fetched = ChangeSet::read_from(&url_path(&url).unwrap()).unwrap();
        assert_eq!(fetched.trove_count(), 1);
    }

    #[test]
    fn test_file_contents_in_band() {
        let tmp = TempDir::new().unwrap();
        let mut srv = server(&tmp, Box::new(OpenAccess));
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (trove, cs) = trove_cs("foo:runtime", &v, &[("/etc/motd", b"hello\n")]);
        srv.repo.commit_change_set(&cs, CommitOptions::default()).unwrap();
        let (_, entry) = trove.files().next().unwrap();
        let resp = srv.handle(Request::GetFileContents { files: vec![(entry.file_id, v)] });
        assert_eq!(resp, Response::Contents(vec![ContentRef::InBand(b"hello\n".to_vec())]));
    }

    #[test]
    fn test_identity_ops_denied_without_hook() {
        let tmp = TempDir::new().unwrap();
        let mut srv = server(&tmp, Box::new(OpenAccess));
        let resp = srv.handle(Request::AddUser { user: "u".into(), password: "p".into() });
        assert!(matches!(resp, Response::Error { ref kind, .. } if kind == "PermissionDenied"));
    }

    #[test]
    fn test_read_only_rejects_commit() {
        let tmp = TempDir::new().unwrap();
        let mut srv = server(&tmp, Box::new(ReadOnly));
        let resp = srv.handle(Request::CommitChangeSet {
            url: "/nowhere.ccs".into(),
            mirror: false,
            hidden: false,
        });
        assert!(matches!(resp, Response::Error { ref kind, .. } if kind == "PermissionDenied"));
    }

    #[test]
    fn test_handle_json_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut srv = server(&tmp, Box::new(OpenAccess));
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (_, cs) = trove_cs("bar:runtime", &v, &[]);
        srv.repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let body = serde_json::to_string(&Request::GetTroveVersionList {
            label: None,
            names: vec!["bar:runtime".into()],
        })
        .unwrap();
        let reply: Response = serde_json::from_str(&srv.handle_json(&body)).unwrap();
        let Response::Versions(map) = reply else {
            panic!("unexpected {:?}", reply);
        };
        assert_eq!(map["bar:runtime"].len(), 1);

        let garbage: Response = serde_json::from_str(&srv.handle_json("{nope")).unwrap();
        assert!(matches!(garbage, Response::Error { ref kind, .. } if kind == "ParseError"));
    }

    #[test]
    fn test_unsupported_url_scheme() {
        assert!(matches!(url_path("http://x/y.ccs"), Err(Error::InvalidPath(_))));
        assert_eq!(url_path("file:///tmp/a.ccs").unwrap(), PathBuf::from("/tmp/a.ccs"));
    }
}
