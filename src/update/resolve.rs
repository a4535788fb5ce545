// src/update/resolve.rs

//! Dependency closure for updates from a repository
//!
//! Before a change set is applied, the requirements of the troves it
//! installs are checked against what the system will provide afterwards:
//! the new troves themselves plus every installed trove that stays. With
//! `autoResolve` the missing atoms are resolved on the install label path
//! and the troves chosen for them are folded into the change set;
//! without it, or when resolution comes back short, the update fails with
//! [`Error::DependencyFailure`] before anything is written.

use super::{UpdateJob, apply_change_set};
use crate::changeset::ChangeSet;
use crate::config::Config;
use crate::dependencies::DependencySet;
use crate::error::{Error, Result};
use crate::local::LocalDatabase;
use crate::repository::{ChangeSetJob, ChangeSetOptions, Repository};
use crate::source::TroveSource;
use crate::trove::{Trove, TroveTuple};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

/// Requirements of the troves `cs` installs that nothing left on the
/// system after `cs` would provide
pub fn missing_requirements(db: &LocalDatabase, cs: &ChangeSet) -> Result<DependencySet> {
    let mut departing: BTreeSet<TroveTuple> = cs.erasures().cloned().collect();
    let mut incoming: Vec<Trove> = Vec::new();
    for tcs in cs.troves() {
        let old = match tcs.old_tuple() {
            Some(tuple) => {
                let trove = db
                    .get_trove(&tuple)?
                    .ok_or_else(|| Error::TroveMissing(format!("{} is not installed", tuple)))?;
                departing.insert(tuple);
                Some(trove)
            }
            None => None,
        };
        incoming.push(tcs.apply(old.as_ref())?);
    }

    let mut missing = DependencySet::new();
    for trove in &incoming {
        for (class, dep) in trove.requires().iter() {
            if incoming.iter().any(|t| t.provides().satisfies_atom(class, dep)) {
                continue;
            }
            let staying = db
                .providers(class, dep)?
                .into_iter()
                .any(|tuple| !departing.contains(&tuple));
            if !staying {
                debug!("{} requires {}: {}, which nothing provides", trove.tuple(), class, dep);
                missing.add(class, dep.clone());
            }
        }
    }
    Ok(missing)
}

/// Fold whatever the update in `cs` still needs into it
///
/// Returns the troves added; an empty list means `cs` was already
/// complete.
pub fn resolve_change_set(
    repo: &Repository,
    db: &LocalDatabase,
    config: &Config,
    cs: &mut ChangeSet,
) -> Result<Vec<TroveTuple>> {
    let missing = missing_requirements(db, cs)?;
    if missing.is_empty() {
        return Ok(Vec::new());
    }
    if !config.auto_resolve {
        return Err(unresolved(&missing, "autoResolve is off"));
    }

    let resolution = config
        .resolver(repo)?
        .with_affinity(db.installed()?)
        .resolve(&missing)?
        .require_complete()?;
    let present: BTreeSet<TroveTuple> = cs.troves().map(|tcs| tcs.new_tuple()).collect();
    let added: Vec<TroveTuple> = resolution
        .chosen
        .into_iter()
        .filter(|tuple| !present.contains(tuple))
        .collect();
    let mut jobs = Vec::new();
    for tuple in &added {
        if !db.has(tuple)? {
            jobs.push(job_for(db, tuple)?);
        }
    }
    info!("dependency resolution adds {} trove(s)", jobs.len());
    let extra = repo.create_change_set(&jobs, ChangeSetOptions::default())?;
    cs.merge(extra.change_set)?;

    // requirements past maxResolveDepth are not followed
    let left = missing_requirements(db, cs)?;
    if !left.is_empty() {
        return Err(unresolved(&left, "beyond maxResolveDepth"));
    }
    Ok(added)
}

fn unresolved(missing: &DependencySet, why: &str) -> Error {
    let atoms: Vec<String> = missing.iter().map(|(class, dep)| format!("{}: {}", class, dep)).collect();
    Error::DependencyFailure(format!("unresolved requirements: {} ({})", atoms.join("; "), why))
}

/// Install `tuple`, or update the installed trove of the same name to it
fn job_for(db: &LocalDatabase, tuple: &TroveTuple) -> Result<ChangeSetJob> {
    let installed = db.installed_named(&tuple.name)?;
    let old = installed
        .iter()
        .find(|t| t.flavor == tuple.flavor)
        .or_else(|| installed.first());
    Ok(match old {
        Some(old) => ChangeSetJob::update(old, tuple),
        None => ChangeSetJob::install(tuple),
    })
}

/// Write `cs` under `dir` and read it back the way a downloaded change
/// set is read; the staged file is gone when this returns
pub fn stage_change_set(cs: &ChangeSet, dir: &Path) -> Result<ChangeSet> {
    let staged = tempfile::Builder::new().prefix("cs-").suffix(".ccs").tempfile_in(dir)?;
    let size = cs.write_to(staged.path())?;
    debug!("staged change set at {} ({} bytes)", staged.path().display(), size);
    ChangeSet::read_from(staged.path())
}

/// Bring `tuples` from `repo` onto the system with their requirements
///
/// Troves already installed are skipped; a trove whose name is installed
/// is updated in place.
pub fn update_from_repository(
    repo: &Repository,
    db: &mut LocalDatabase,
    config: &Config,
    tuples: &[TroveTuple],
) -> Result<UpdateJob> {
    let mut jobs = Vec::new();
    for tuple in tuples {
        if db.has(tuple)? {
            debug!("{} is already installed", tuple);
            continue;
        }
        jobs.push(job_for(db, tuple)?);
    }
    let mut cs = repo.create_change_set(&jobs, ChangeSetOptions::default())?.change_set;
    let added = resolve_change_set(repo, db, config, &mut cs)?;
    for tuple in &added {
        info!("adding {} for dependencies", tuple);
    }
    if cs.is_empty() {
        info!("nothing to update");
        return Ok(UpdateJob::default());
    }
    let staged = stage_change_set(&cs, &config.staging_dir()?)?;
    apply_change_set(db, &staged, &config.update_options())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependencies::{DepClass, Dependency};
    use crate::repository::CommitOptions;
    use crate::repository::tests::{trove_cs, version};
    use tempfile::TempDir;

    fn db_in(tmp: &TempDir) -> LocalDatabase {
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        LocalDatabase::open(tmp.path().join("db"), &root).unwrap()
    }

    #[test]
    fn test_missing_requirements_skips_what_the_change_set_provides() {
        let tmp = TempDir::new().unwrap();
        let db = db_in(&tmp);
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (mut app, _) = trove_cs("app:runtime", &v, &[]);
        app.requires_mut().add(DepClass::Trove, Dependency::new("lib:runtime"));
        app.requires_mut().add(DepClass::Trove, Dependency::new("app:runtime"));
        let mut cs = ChangeSet::new();
        cs.add_trove(app.diff(None)).unwrap();

        let missing = missing_requirements(&db, &cs).unwrap();
        assert_eq!(missing.len(), 1);
        assert!(missing.contains(DepClass::Trove, "lib:runtime"));
    }

    #[test]
    fn test_staging_round_trips_through_a_file() {
        let tmp = TempDir::new().unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (trove, cs) = trove_cs("foo:runtime", &v, &[("/usr/bin/foo", b"foo\n")]);
        let staged = stage_change_set(&cs, tmp.path()).unwrap();
        assert_eq!(staged.troves().map(|t| t.new_tuple()).collect::<Vec<_>>(), vec![trove.tuple()]);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_complete_change_set_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let db = db_in(&tmp);
        let mut repo = Repository::init(tmp.path().join("repo")).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        let (_, mut cs) = trove_cs("foo:runtime", &v, &[("/usr/bin/foo", b"foo\n")]);
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();

        let added = resolve_change_set(&repo, &db, &Config::default(), &mut cs).unwrap();
        assert!(added.is_empty());
    }
}
