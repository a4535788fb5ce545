// src/config.rs

//! Client configuration
//!
//! Loaded from TOML; keys use the historical camelCase option names.
//!
//! ```toml
//! installLabel = ["conary.example.com@rpl:devel", "contrib.example.com@rpl:devel"]
//! flavor = ["is: x86_64", "is: x86"]
//! pinTroves = ["kernel*"]
//! localRollbacks = 20
//!
//! [repositoryMap]
//! "conary.example.com" = "https://conary.example.com/conary/"
//! ```

use crate::error::{Error, Result};
use crate::flavor::{Flavor, FlavorContext};
use crate::label::{Label, LabelPath};
use crate::resolver::Resolver;
use crate::source::TroveSource;
use crate::update::UpdateOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default location of the local database directory
pub const DEFAULT_DB_PATH: &str = "/var/lib/conarydb";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    /// Label or repository host → server URL
    pub repository_map: BTreeMap<String, String>,
    pub build_label: Option<String>,
    /// Default label path, highest precedence first
    pub install_label: Vec<String>,
    /// Default flavor preferences, tried in order
    pub flavor: Vec<String>,
    pub trust_threshold: u32,
    /// Fingerprint of the signing key
    pub signature_key: Option<String>,
    /// Troves the update engine must not touch
    pub pin_troves: Vec<String>,
    /// Troves never considered for resolution
    pub exclude_troves: Vec<String>,
    pub root: PathBuf,
    pub tmp_dir: PathBuf,
    pub auto_resolve: bool,
    /// Rollback stack cap; 0 keeps every entry
    pub local_rollbacks: usize,
    pub db_path: PathBuf,
    pub max_resolve_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository_map: BTreeMap::new(),
            build_label: None,
            install_label: Vec::new(),
            flavor: Vec::new(),
            trust_threshold: 0,
            signature_key: None,
            pin_troves: Vec::new(),
            exclude_troves: Vec::new(),
            root: PathBuf::from("/"),
            tmp_dir: PathBuf::from("/var/tmp"),
            auto_resolve: false,
            local_rollbacks: 0,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            max_resolve_depth: crate::resolver::DEFAULT_MAX_DEPTH,
        }
    }
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for label in self.install_label.iter().chain(self.build_label.iter()) {
            Label::parse(label).map_err(|e| Error::Config(format!("invalid label '{}': {}", label, e)))?;
        }
        for flavor in &self.flavor {
            Flavor::parse(flavor).map_err(|e| Error::Config(format!("invalid flavor '{}': {}", flavor, e)))?;
        }
        for pattern in self.pin_troves.iter().chain(&self.exclude_troves) {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::Config(format!("invalid trove pattern '{}': {}", pattern, e)))?;
        }
        check_no_symlinks(&self.tmp_dir)?;
        Ok(())
    }

    pub fn install_label_path(&self) -> Result<LabelPath> {
        let labels = self
            .install_label
            .iter()
            .map(|l| Label::parse(l))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(LabelPath::from_labels(labels))
    }

    pub fn flavor_context(&self) -> Result<FlavorContext> {
        FlavorContext::parse_stack(&self.flavor)
    }

    /// Server URL for `label`: an entry for the full label wins over one
    /// for its host
    pub fn repository_url(&self, label: &Label) -> Option<&str> {
        self.repository_map
            .get(&label.to_string())
            .or_else(|| self.repository_map.get(&label.host))
            .map(String::as_str)
    }

    pub fn is_pinned(&self, name: &str) -> bool {
        matches_any(&self.pin_troves, name)
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        matches_any(&self.exclude_troves, name)
    }

    /// Exclusion patterns for the resolver
    pub fn exclude_patterns(&self) -> Vec<glob::Pattern> {
        self.exclude_troves
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect()
    }

    /// Resolver over `source` on the install label path, honouring the
    /// configured exclusions and depth cap
    pub fn resolver<'a, S: TroveSource + ?Sized>(&self, source: &'a S) -> Result<Resolver<'a, S>> {
        Ok(Resolver::new(source, self.install_label_path()?, self.flavor_context()?)
            .with_exclude(self.exclude_patterns())
            .with_max_depth(self.max_resolve_depth))
    }

    /// Create `tmpDir` if needed and return it; the symlink check is
    /// repeated since the tree may have changed after loading
    pub fn staging_dir(&self) -> Result<PathBuf> {
        check_no_symlinks(&self.tmp_dir)?;
        std::fs::create_dir_all(&self.tmp_dir)?;
        Ok(self.tmp_dir.clone())
    }

    /// Update options carrying the configured pins and rollback cap
    pub fn update_options(&self) -> UpdateOptions {
        UpdateOptions {
            pins: self.pin_troves.clone(),
            keep_rollbacks: self.local_rollbacks,
            ..UpdateOptions::default()
        }
    }
}

fn matches_any(patterns: &[String], name: &str) -> bool {
    patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .any(|p| p.matches(name))
}

/// Reject a path that is, or passes through, a symbolic link
fn check_no_symlinks(path: &Path) -> Result<()> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::Config(format!(
                    "tmpDir {} contains the symlink {}",
                    path.display(),
                    current.display()
                )));
            }
            Ok(_) => {}
            // the rest does not exist yet and will be created as directories
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/conarydb"));
        assert_eq!(config.max_resolve_depth, 10);
        assert_eq!(config.local_rollbacks, 0);
        assert!(!config.auto_resolve);
        assert!(config.install_label_path().unwrap().is_empty());
    }

    #[test]
    fn test_camel_case_keys() {
        let config = Config::from_toml_str(
            r#"
            installLabel = ["repo.example.com@rpl:devel", "other.example.com@rpl:qa"]
            flavor = ["is: x86_64", "is: x86"]
            pinTroves = ["kernel*"]
            excludeTroves = ["*:debuginfo"]
            autoResolve = true
            localRollbacks = 5
            maxResolveDepth = 3

            [repositoryMap]
            "repo.example.com" = "https://repo.example.com/conary/"
            "other.example.com@rpl:qa" = "https://qa.example.com/"
            "#,
        )
        .unwrap();

        let path = config.install_label_path().unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(config.flavor_context().unwrap().stack().len(), 2);
        assert!(config.auto_resolve);
        assert_eq!(config.max_resolve_depth, 3);
        assert!(config.is_pinned("kernel:runtime"));
        assert!(!config.is_pinned("bash:runtime"));
        assert!(config.is_excluded("bash:debuginfo"));

        let devel = Label::parse("repo.example.com@rpl:devel").unwrap();
        let qa = Label::parse("other.example.com@rpl:qa").unwrap();
        let unmapped = Label::parse("other.example.com@rpl:devel").unwrap();
        assert_eq!(config.repository_url(&devel), Some("https://repo.example.com/conary/"));
        assert_eq!(config.repository_url(&qa), Some("https://qa.example.com/"));
        assert_eq!(config.repository_url(&unmapped), None);

        let opts = config.update_options();
        assert_eq!(opts.pins, vec!["kernel*".to_string()]);
        assert_eq!(opts.keep_rollbacks, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_toml_str(r#"installLabel = ["not a label"]"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_toml_str(r#"flavor = ["is: x86("]"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_toml_str(r#"localRollbacks = "many""#),
            Err(Error::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_tmp_dir_symlink_rejected() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let mut config = Config {
            tmp_dir: real.join("staging"),
            ..Config::default()
        };
        config.validate().unwrap();

        config.tmp_dir = link.join("staging");
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_reports_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("conaryrc.toml");
        std::fs::write(&path, "buildLabel = \"repo@rpl:\"").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("conaryrc.toml"));

        std::fs::write(&path, "buildLabel = \"repo@rpl:devel\"").unwrap();
        assert_eq!(Config::load(&path).unwrap().build_label.as_deref(), Some("repo@rpl:devel"));
    }

    #[test]
    fn test_staging_dir_created_and_rechecked() {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            tmp_dir: tmp.path().join("var/tmp/conary"),
            ..Config::default()
        };
        assert_eq!(config.staging_dir().unwrap(), tmp.path().join("var/tmp/conary"));
        assert!(tmp.path().join("var/tmp/conary").is_dir());

        // swapped for a symlink after the configuration was validated
        std::fs::remove_dir_all(tmp.path().join("var/tmp")).unwrap();
        std::fs::create_dir(tmp.path().join("elsewhere")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("elsewhere"), tmp.path().join("var/tmp")).unwrap();
        assert!(matches!(config.staging_dir(), Err(Error::Config(_))));
    }
}
