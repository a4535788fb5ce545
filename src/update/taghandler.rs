// src/update/taghandler.rs

//! Tag handlers
//!
//! Files carry tags (`shlib`, `user-info`, anything a packager invents).
//! A tag description file under `/etc/conary/tags/<tag>` names the program
//! that handles the tag, how it wants to be told about files, and which
//! update actions it implements. The update engine batches tagged files
//! per tag and invokes the handler once per (target, action) pair as
//!
//! ```text
//! handler <update|preremove|remove> <files|handler> [files...]
//! ```
//!
//! Handler failures are logged and never undo the update.

use crate::error::{Error, Result};
use crate::files::FileStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Default timeout for a handler invocation (30 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where tag descriptions live, relative to the install root
pub const TAG_DIR: &str = "etc/conary/tags";

const SHLIB_TAG: &str = "shlib";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// File paths as command-line arguments
    Args,
    /// One path per line on stdin
    Stdin,
    /// A line of space-separated tags, then a line with the path, per file
    MultiTag,
}

impl DataSource {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "args" => Ok(Self::Args),
            "stdin" => Ok(Self::Stdin),
            "multitag" => Ok(Self::MultiTag),
            other => Err(Error::ParseError(format!("unknown tag datasource '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Update,
    PreRemove,
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Update => "update",
            Action::PreRemove => "preremove",
            Action::Remove => "remove",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// Tagged files changed
    Files,
    /// The handler itself changed
    Handler,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Target::Files => "files",
            Target::Handler => "handler",
        })
    }
}

/// A file handed to a handler, with every tag it carries
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TaggedFile {
    pub path: String,
    pub tags: BTreeSet<String>,
}

impl TaggedFile {
    pub fn new(path: impl Into<String>, tags: BTreeSet<String>) -> Self {
        Self {
            path: path.into(),
            tags,
        }
    }
}

/// A parsed tag description file
#[derive(Debug, Clone)]
pub struct TagDescription {
    pub tag: String,
    pub file: Option<String>,
    pub name: String,
    pub description: String,
    pub datasource: DataSource,
    implements: BTreeSet<(Target, Action)>,
    filters: Vec<(bool, glob::Pattern)>,
}

impl TagDescription {
    /// Parse `key value` lines; `#` starts a comment
    pub fn parse(tag: &str, text: &str) -> Result<Self> {
        let mut desc = TagDescription {
            tag: tag.to_string(),
            file: None,
            name: tag.to_string(),
            description: String::new(),
            datasource: DataSource::Args,
            implements: BTreeSet::new(),
            filters: Vec::new(),
        };

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let value = value.trim();
            let bad = |what: &str| {
                Error::ParseError(format!("tag {} line {}: {}", tag, lineno + 1, what))
            };
            match key {
                "file" => desc.file = Some(value.to_string()),
                "name" => desc.name = value.to_string(),
                "description" => desc.description = value.to_string(),
                "datasource" => desc.datasource = DataSource::parse(value)?,
                "implements" => {
                    let mut words = value.split_whitespace();
                    let target = match words.next() {
                        Some("files") => Target::Files,
                        Some("handler") => Target::Handler,
                        _ => return Err(bad("implements needs files or handler")),
                    };
                    let action = match words.next() {
                        Some("update") => Action::Update,
                        Some("preremove") => Action::PreRemove,
                        Some("remove") => Action::Remove,
                        _ => return Err(bad("implements needs update, preremove or remove")),
                    };
                    desc.implements.insert((target, action));
                }
                "include" | "exclude" => {
                    let pattern = glob::Pattern::new(value).map_err(|e| bad(&e.to_string()))?;
                    desc.filters.push((key == "include", pattern));
                }
                other => return Err(bad(&format!("unknown key '{}'", other))),
            }
        }

        if desc.implements.is_empty() {
            desc.implements.insert((Target::Files, Action::Update));
        }
        Ok(desc)
    }

    pub fn implements(&self, target: Target, action: Action) -> bool {
        self.implements.contains(&(target, action))
    }

    /// Whether the filters claim `path`; the first matching filter decides
    pub fn matches(&self, path: &str) -> bool {
        self.filters
            .iter()
            .find(|(_, pattern)| pattern.matches(path))
            .is_some_and(|(include, _)| *include)
    }
}

/// What a handler invocation gets to know about its surroundings
#[derive(Debug, Clone)]
pub struct HandlerContext<'a> {
    pub root: &'a Path,
    pub timeout: Duration,
    pub dry_run: bool,
}

impl<'a> HandlerContext<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self {
            root,
            timeout: DEFAULT_TIMEOUT,
            dry_run: false,
        }
    }
}

pub trait TagHandler {
    /// The tag this handler serves
    fn kind(&self) -> &str;

    fn datasource(&self) -> DataSource;

    fn implements(&self, target: Target, action: Action) -> bool;

    /// Key that groups tags served by the same program
    fn program(&self) -> Option<&str> {
        None
    }

    fn run(&self, ctx: &HandlerContext<'_>, target: Target, action: Action, files: &[TaggedFile]) -> Result<()>;
}

/// A handler program installed in the root
pub struct ExternalHandler {
    desc: TagDescription,
    file: String,
}

impl ExternalHandler {
    pub fn new(desc: TagDescription) -> Result<Self> {
        let file = desc
            .file
            .clone()
            .ok_or_else(|| Error::TagHandler(format!("tag {} names no handler file", desc.tag)))?;
        Ok(Self { desc, file })
    }

    /// The handler runs from the root it was installed into; it learns
    /// that root from `CONARY_ROOT`
    fn command(&self, root: &Path, args: &[String]) -> Command {
        let program = root.join(self.file.trim_start_matches('/'));
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(root).env("CONARY_ROOT", root);
        cmd
    }
}

impl TagHandler for ExternalHandler {
    fn kind(&self) -> &str {
        &self.desc.tag
    }

    fn datasource(&self) -> DataSource {
        self.desc.datasource
    }

    fn implements(&self, target: Target, action: Action) -> bool {
        self.desc.implements(target, action)
    }

    fn program(&self) -> Option<&str> {
        Some(&self.file)
    }

    fn run(&self, ctx: &HandlerContext<'_>, target: Target, action: Action, files: &[TaggedFile]) -> Result<()> {
        let mut files = files.to_vec();
        files.sort();

        let mut args = vec![action.to_string(), target.to_string()];
        let mut input = String::new();
        match self.desc.datasource {
            DataSource::Args => args.extend(files.iter().map(|f| f.path.clone())),
            DataSource::Stdin => {
                for f in &files {
                    input.push_str(&f.path);
                    input.push('\n');
                }
            }
            DataSource::MultiTag => {
                for f in &files {
                    let tags: Vec<&str> = f.tags.iter().map(String::as_str).collect();
                    input.push_str(&tags.join(" "));
                    input.push('\n');
                    input.push_str(&f.path);
                    input.push('\n');
                }
            }
        }

        if ctx.dry_run {
            info!("would run {} {}", self.file, args.join(" "));
            return Ok(());
        }
        debug!("running tag handler {} {:?}", self.file, args);

        let mut child = self
            .command(ctx.root, &args)
            .env("CONARY_TAG", &self.desc.tag)
            .stdin(if input.is_empty() { Stdio::null() } else { Stdio::piped() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::TagHandler(format!("failed to spawn '{}': {}", self.file, e)))?;

        // pipes are serviced on their own threads so a chatty handler
        // cannot stall on a full pipe while we wait on it
        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.into_bytes();
            thread::spawn(move || match stdin.write_all(&input) {
                Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            })
        });
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        match child.wait_timeout(ctx.timeout)? {
            Some(status) => {
                if let Some(Ok(Err(e))) = writer.map(JoinHandle::join) {
                    warn!("[{}] writing the file list failed: {}", self.desc.tag, e);
                }
                let stdout = collect(stdout);
                for line in String::from_utf8_lossy(&stdout).lines() {
                    debug!("[{}] {}", self.desc.tag, line);
                }
                let stderr = collect(stderr);
                let stderr = String::from_utf8_lossy(&stderr);
                for line in stderr.lines() {
                    warn!("[{}] {}", self.desc.tag, line);
                }
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::TagHandler(format!(
                        "handler '{}' failed with exit code {}: {}",
                        self.file,
                        status.code().unwrap_or(-1),
                        stderr.trim()
                    )))
                }
            }
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::TagHandler(format!(
                    "handler '{}' timed out after {} seconds",
                    self.file,
                    ctx.timeout.as_secs()
                )))
            }
        }
    }
}

/// Read a child pipe to the end on a separate thread
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(pipe: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    pipe.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Built-in handler for shared libraries: refresh the linker cache
pub struct ShlibHandler;

impl ShlibHandler {
    fn ldconfig() -> Option<PathBuf> {
        ["/sbin/ldconfig", "/usr/sbin/ldconfig"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }
}

impl TagHandler for ShlibHandler {
    fn kind(&self) -> &str {
        SHLIB_TAG
    }

    fn datasource(&self) -> DataSource {
        DataSource::Args
    }

    fn implements(&self, target: Target, action: Action) -> bool {
        target == Target::Files && matches!(action, Action::Update | Action::Remove)
    }

    fn run(&self, ctx: &HandlerContext<'_>, _target: Target, _action: Action, files: &[TaggedFile]) -> Result<()> {
        let Some(ldconfig) = Self::ldconfig() else {
            debug!("no ldconfig found, skipping shlib update for {} files", files.len());
            return Ok(());
        };
        if ctx.dry_run {
            info!("would run {}", ldconfig.display());
            return Ok(());
        }
        let mut cmd = Command::new(&ldconfig);
        if ctx.root != Path::new("/") {
            if !crate::files::is_root() {
                debug!("not root, skipping ldconfig for {}", ctx.root.display());
                return Ok(());
            }
            cmd.arg("-r").arg(ctx.root);
        }
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::TagHandler(format!("failed to spawn ldconfig: {}", e)))?;
        match child.wait_timeout(ctx.timeout)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(Error::TagHandler(format!(
                "ldconfig failed with exit code {}",
                status.code().unwrap_or(-1)
            ))),
            None => {
                let _ = child.kill();
                let _ = child.wait();
                Err(Error::TagHandler("ldconfig timed out".to_string()))
            }
        }
    }
}

/// Tag handlers known for one root
pub struct TagRegistry {
    descriptions: BTreeMap<String, TagDescription>,
    handlers: BTreeMap<String, Box<dyn TagHandler>>,
}

impl Default for TagRegistry {
    fn default() -> Self {
        let mut handlers: BTreeMap<String, Box<dyn TagHandler>> = BTreeMap::new();
        handlers.insert(SHLIB_TAG.to_string(), Box::new(ShlibHandler));
        Self {
            descriptions: BTreeMap::new(),
            handlers,
        }
    }
}

impl TagRegistry {
    /// Load every description under `dir` (default `<root>/etc/conary/tags`)
    ///
    /// A description that fails to parse is skipped with a warning.
    pub fn load(root: &Path, dir: Option<&Path>) -> Result<Self> {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| root.join(TAG_DIR));
        let mut registry = Self::default();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(registry),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        names.sort();

        for path in names {
            let Some(tag) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            let text = fs::read_to_string(&path)?;
            match TagDescription::parse(&tag, &text) {
                Ok(desc) => registry.add_description(desc),
                Err(e) => warn!("ignoring tag description {}: {}", path.display(), e),
            }
        }
        debug!("loaded {} tag descriptions from {}", registry.descriptions.len(), dir.display());
        Ok(registry)
    }

    pub fn add_description(&mut self, desc: TagDescription) {
        if desc.file.is_some() {
            match ExternalHandler::new(desc.clone()) {
                Ok(handler) => {
                    self.handlers.insert(desc.tag.clone(), Box::new(handler));
                }
                Err(e) => warn!("{}", e),
            }
        }
        self.descriptions.insert(desc.tag.clone(), desc);
    }

    pub fn add_handler(&mut self, handler: Box<dyn TagHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn handler(&self, tag: &str) -> Option<&dyn TagHandler> {
        self.handlers.get(tag).map(|h| h.as_ref())
    }

    pub fn description(&self, tag: &str) -> Option<&TagDescription> {
        self.descriptions.get(tag)
    }

    pub fn descriptions(&self) -> impl Iterator<Item = &TagDescription> {
        self.descriptions.values()
    }

    /// Stream tags plus the tags whose filters claim `path`
    pub fn tags_for(&self, path: &str, stream: &FileStream) -> BTreeSet<String> {
        let mut tags = stream.tags();
        for desc in self.descriptions.values() {
            if desc.matches(path) {
                tags.insert(desc.tag.clone());
            }
        }
        tags
    }

    /// Invoke handlers for one (target, action) pair
    ///
    /// `batches` maps a tag to the files it applies to. Tags that share a
    /// MultiTag program are delivered in one invocation. Returns the tags
    /// whose handler ran; failures are logged.
    pub fn run(
        &self,
        ctx: &HandlerContext<'_>,
        target: Target,
        action: Action,
        batches: &BTreeMap<String, Vec<TaggedFile>>,
    ) -> Vec<String> {
        let mut ran = Vec::new();
        let mut multitag: BTreeMap<&str, (Vec<String>, BTreeMap<String, TaggedFile>)> = BTreeMap::new();

        for (tag, files) in batches {
            if files.is_empty() && target == Target::Files {
                continue;
            }
            let Some(handler) = self.handler(tag) else {
                debug!("no handler for tag {}", tag);
                continue;
            };
            if !handler.implements(target, action) {
                continue;
            }
            if let (DataSource::MultiTag, Some(program)) = (handler.datasource(), handler.program()) {
                let (tags, merged) = multitag.entry(program).or_default();
                tags.push(tag.clone());
                for f in files {
                    merged
                        .entry(f.path.clone())
                        .or_insert_with(|| TaggedFile::new(f.path.clone(), BTreeSet::new()))
                        .tags
                        .insert(tag.clone());
                }
                continue;
            }
            info!("running {} {} handler for tag {} ({} files)", target, action, tag, files.len());
            if let Err(e) = handler.run(ctx, target, action, files) {
                warn!("tag handler for {} failed: {}", tag, e);
            }
            ran.push(tag.clone());
        }

        for (program, (tags, merged)) in multitag {
            let Some(handler) = tags.first().and_then(|t| self.handler(t)) else {
                continue;
            };
            let files: Vec<TaggedFile> = merged.into_values().collect();
            info!("running {} {} handler {} for tags {}", target, action, program, tags.join(" "));
            if let Err(e) = handler.run(ctx, target, action, &files) {
                warn!("tag handler {} failed: {}", program, e);
            }
            ran.extend(tags);
        }
        ran.sort();
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn tagged(path: &str, tags: &[&str]) -> TaggedFile {
        TaggedFile::new(path, tags.iter().map(|t| t.to_string()).collect())
    }

    fn install_handler(root: &Path, tag: &str, datasource: &str) -> PathBuf {
        let script = root.join("usr/libexec/conary/tags").join(tag);
        fs::create_dir_all(script.parent().unwrap()).unwrap();
        let log = root.join(format!("{}.log", tag));
        fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> {}\ncat >> {}\n", log.display(), log.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let dir = root.join(TAG_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(tag),
            format!(
                "file /usr/libexec/conary/tags/{}\nname {}\ndatasource {}\nimplements files update\nimplements files remove\n",
                tag, tag, datasource
            ),
        )
        .unwrap();
        log
    }

    #[test]
    fn test_parse_description() {
        let desc = TagDescription::parse(
            "info",
            "# comment\nfile /usr/libexec/conary/tags/info\nname info\ndescription User info\n\
             datasource multitag\nimplements files update\nimplements handler preremove\n\
             exclude /etc/skip/*\ninclude /etc/*\n",
        )
        .unwrap();
        assert_eq!(desc.file.as_deref(), Some("/usr/libexec/conary/tags/info"));
        assert_eq!(desc.datasource, DataSource::MultiTag);
        assert!(desc.implements(Target::Files, Action::Update));
        assert!(desc.implements(Target::Handler, Action::PreRemove));
        assert!(!desc.implements(Target::Files, Action::Remove));
        assert!(desc.matches("/etc/passwd"));
        assert!(!desc.matches("/etc/skip/x"));
        assert!(!desc.matches("/usr/bin/x"));
    }

    #[test]
    fn test_parse_rejects_unknown_keys() {
        assert!(TagDescription::parse("x", "color blue\n").is_err());
        assert!(TagDescription::parse("x", "datasource carrier-pigeon\n").is_err());
        assert!(TagDescription::parse("x", "implements files explode\n").is_err());
    }

    #[test]
    fn test_registry_has_builtin_shlib() {
        let tmp = TempDir::new().unwrap();
        let registry = TagRegistry::load(tmp.path(), None).unwrap();
        let shlib = registry.handler("shlib").unwrap();
        assert!(shlib.implements(Target::Files, Action::Update));
        assert!(!shlib.implements(Target::Handler, Action::Update));
    }

    #[test]
    fn test_args_handler_receives_sorted_files() {
        let tmp = TempDir::new().unwrap();
        let log = install_handler(tmp.path(), "fonts", "args");
        let registry = TagRegistry::load(tmp.path(), None).unwrap();
        let ctx = HandlerContext::new(tmp.path());

        let mut batches = BTreeMap::new();
        batches.insert(
            "fonts".to_string(),
            vec![tagged("/usr/share/fonts/b.ttf", &["fonts"]), tagged("/usr/share/fonts/a.ttf", &["fonts"])],
        );
        let ran = registry.run(&ctx, Target::Files, Action::Update, &batches);
        assert_eq!(ran, vec!["fonts".to_string()]);
        let out = fs::read_to_string(log).unwrap();
        assert_eq!(out.trim(), "update files /usr/share/fonts/a.ttf /usr/share/fonts/b.ttf");
    }

    #[test]
    fn test_stdin_and_multitag_protocols() {
        let tmp = TempDir::new().unwrap();
        let stdin_log = install_handler(tmp.path(), "icons", "stdin");
        let multi_log = install_handler(tmp.path(), "info", "multitag");
        let registry = TagRegistry::load(tmp.path(), None).unwrap();
        let ctx = HandlerContext::new(tmp.path());

        let mut batches = BTreeMap::new();
        batches.insert("icons".to_string(), vec![tagged("/a", &["icons"]), tagged("/b", &["icons"])]);
        batches.insert("info".to_string(), vec![tagged("/etc/x", &["info"])]);
        registry.run(&ctx, Target::Files, Action::Remove, &batches);

        assert_eq!(fs::read_to_string(stdin_log).unwrap(), "remove files\n/a\n/b\n");
        assert_eq!(fs::read_to_string(multi_log).unwrap(), "remove files\ninfo\n/etc/x\n");
    }

    #[test]
    fn test_unimplemented_action_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let log = install_handler(tmp.path(), "fonts", "args");
        let registry = TagRegistry::load(tmp.path(), None).unwrap();
        let ctx = HandlerContext::new(tmp.path());

        let mut batches = BTreeMap::new();
        batches.insert("fonts".to_string(), vec![tagged("/a", &["fonts"])]);
        assert!(registry.run(&ctx, Target::Files, Action::PreRemove, &batches).is_empty());
        assert!(!log.exists());
    }

    #[test]
    fn test_failing_handler_only_warns() {
        let tmp = TempDir::new().unwrap();
        install_handler(tmp.path(), "bad", "args");
        let script = tmp.path().join("usr/libexec/conary/tags/bad");
        fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
        let registry = TagRegistry::load(tmp.path(), None).unwrap();
        let ctx = HandlerContext::new(tmp.path());

        let handler = registry.handler("bad").unwrap();
        let err = handler.run(&ctx, Target::Files, Action::Update, &[tagged("/a", &["bad"])]);
        assert!(matches!(err, Err(Error::TagHandler(_))));

        let mut batches = BTreeMap::new();
        batches.insert("bad".to_string(), vec![tagged("/a", &["bad"])]);
        assert_eq!(registry.run(&ctx, Target::Files, Action::Update, &batches), vec!["bad".to_string()]);
    }

    #[test]
    fn test_chatty_handler_with_long_file_list_succeeds() {
        let tmp = TempDir::new().unwrap();
        install_handler(tmp.path(), "chatty", "stdin");
        let script = tmp.path().join("usr/libexec/conary/tags/chatty");
        // output well past a pipe buffer on both streams before reading stdin
        fs::write(
            &script,
            "#!/bin/sh\nhead -c 300000 /dev/zero\nhead -c 300000 /dev/zero >&2\ncat >/dev/null\nexit 0\n",
        )
        .unwrap();
        let registry = TagRegistry::load(tmp.path(), None).unwrap();
        let mut ctx = HandlerContext::new(tmp.path());
        ctx.timeout = Duration::from_secs(20);

        let files: Vec<TaggedFile> = (0..20_000)
            .map(|i| tagged(&format!("/usr/share/chatty/file-{:05}", i), &["chatty"]))
            .collect();
        let started = std::time::Instant::now();
        let handler = registry.handler("chatty").unwrap();
        handler.run(&ctx, Target::Files, Action::Update, &files).unwrap();
        assert!(started.elapsed() < ctx.timeout);
    }

    #[test]
    fn test_tags_for_merges_filters() {
        let mut registry = TagRegistry::default();
        registry.add_description(TagDescription::parse("doc", "include /usr/share/doc/*\n").unwrap());
        let mut stream = FileStream::regular(b"x", 0o644);
        stream.add_tag("manual");
        let tags = registry.tags_for("/usr/share/doc/README", &stream);
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["doc".to_string(), "manual".to_string()]);
    }
}
