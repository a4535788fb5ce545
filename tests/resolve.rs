// tests/resolve.rs

//! Shadows, flavor preference and dependency resolution against a
//! repository, and finding troves by version spec.

mod common;

use common::{Fixture, Pkg};
use conary_core::{
    CommitOptions, Config, DepClass, Dependency, DependencySet, Error, FlavorContext, Label, LabelPath, Repository,
    Resolver, TroveFinder, Version, update_from_repository,
};
use tempfile::TempDir;

fn repo_with(pkgs: &[&Pkg]) -> (TempDir, Repository) {
    let tmp = TempDir::new().unwrap();
    let mut repo = Repository::init(tmp.path().join("repo")).unwrap();
    for pkg in pkgs {
        repo.commit_change_set(&pkg.install_cs(), CommitOptions::default()).unwrap();
    }
    (tmp, repo)
}

fn trove_dep(name: &str) -> DependencySet {
    DependencySet::new().with(DepClass::Trove, Dependency::new(name))
}

#[test]
fn test_shadow_creation() {
    let original = Version::parse("/a@b:c/1.0-1-1").unwrap().stamped(1000).unwrap();
    let shadow = original.create_shadow(&Label::parse("d@e:f").unwrap()).unwrap();

    assert_eq!(shadow.as_string(), "/a@b:c//d@e:f/1.0-1-1");
    assert!(shadow.trailing_timestamp().unwrap() > original.trailing_timestamp().unwrap());
    assert!(shadow.is_shadow());
    assert_eq!(Version::parse(&shadow.as_string()).unwrap(), shadow.without_timestamps());
    assert_eq!(Version::thaw(&shadow.freeze()).unwrap(), shadow);
    assert_eq!(shadow.parent_version().unwrap(), original);

    let pkg = Pkg::new("foo", "/a@b:c/1.0-1-1", 1000);
    let mut shadowed = pkg.trove.clone();
    shadowed.set_version(shadow.clone());
    assert_eq!(shadowed.provides(), pkg.trove.provides());
    assert!(shadowed.provides().contains(DepClass::Trove, "foo"));
}

#[test]
fn test_shadowed_trove_is_found_on_its_label() {
    let base = Pkg::new("foo:runtime", "/a@b:c/1.0-1-1", 1000).file("/usr/bin/foo", b"foo\n");
    let mut shadowed = base.clone();
    let shadow = base.trove.version().create_shadow_at(&Label::parse("d@e:f").unwrap(), 2000).unwrap();
    shadowed.trove.set_version(shadow.clone());
    let (_tmp, repo) = repo_with(&[&base, &shadowed]);

    let path = LabelPath::parse("d@e:f a@b:c").unwrap();
    let finder = TroveFinder::new(&repo, path, FlavorContext::default());
    let found = finder.find("foo:runtime", None, None).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].version, shadow);

    let on_parent = finder.find("foo:runtime", Some("a@b:c"), None).unwrap();
    assert_eq!(on_parent[0].version, *base.trove.version());
}

#[test]
fn test_prefer_not_preference_picks_disallowed_build() {
    let with_foo = Pkg::new("lib:runtime", "/repo@rpl:devel/1.0-1-1", 1000).with_flavor("foo");
    let without_foo = Pkg::new("lib:runtime", "/repo@rpl:devel/1.0-1-1", 1000).with_flavor("!foo");
    let (_tmp, repo) = repo_with(&[&with_foo, &without_foo]);

    let pref = FlavorContext::parse_stack(&["use: ~!foo, is: x86(sse2)"]).unwrap();
    assert_eq!(pref.score(with_foo.trove.flavor()), None);
    assert!(pref.score(without_foo.trove.flavor()).is_some());

    let resolver = Resolver::new(&repo, LabelPath::parse("repo@rpl:devel").unwrap(), pref);
    let resolution = resolver.resolve(&trove_dep("lib:runtime")).unwrap();
    assert!(resolution.is_complete());
    assert_eq!(
        resolution.candidates(DepClass::Trove, &Dependency::new("lib:runtime")),
        Some(&[without_foo.tuple()][..])
    );
}

#[test]
fn test_requirements_are_followed() {
    let mut app = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000);
    app.trove.requires_mut().add(DepClass::Trove, Dependency::new("lib:runtime"));
    let lib = Pkg::new("lib:runtime", "/repo@rpl:devel/1.0-1-1", 1000);
    let (_tmp, repo) = repo_with(&[&lib, &app]);

    let resolver = Resolver::new(&repo, LabelPath::parse("repo@rpl:devel").unwrap(), FlavorContext::default());
    let resolution = resolver.resolve(&trove_dep("app:runtime")).unwrap();
    assert!(resolution.is_complete());
    assert!(resolution.chosen.contains(&app.tuple()));
    assert!(resolution.chosen.contains(&lib.tuple()));
}

#[test]
fn test_unresolved_and_excluded() {
    let lib = Pkg::new("lib:runtime", "/repo@rpl:devel/1.0-1-1", 1000);
    let (_tmp, repo) = repo_with(&[&lib]);
    let config = Config::from_toml_str(
        r#"
        installLabel = ["repo@rpl:devel"]
        excludeTroves = ["lib:*"]
        "#,
    )
    .unwrap();

    let resolver = Resolver::new(&repo, config.install_label_path().unwrap(), config.flavor_context().unwrap())
        .with_exclude(config.exclude_patterns());
    let resolution = resolver.resolve(&trove_dep("lib:runtime")).unwrap();
    assert_eq!(resolution.unresolved.len(), 1);
    assert!(matches!(resolution.require_complete(), Err(Error::DependencyFailure(_))));
}

#[test]
fn test_find_by_revision_and_upstream() {
    let one = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000);
    let two = Pkg::new("app:runtime", "/repo@rpl:devel/2.0-1-1", 2000);
    let (_tmp, repo) = repo_with(&[&one, &two]);
    let finder = TroveFinder::new(&repo, LabelPath::parse("repo@rpl:devel").unwrap(), FlavorContext::default());

    assert_eq!(finder.find_spec("app:runtime").unwrap(), vec![two.tuple()]);
    assert_eq!(finder.find_spec("app:runtime=1.0").unwrap(), vec![one.tuple()]);
    assert_eq!(finder.find_spec("app:runtime=1.0-1-1").unwrap(), vec![one.tuple()]);
    assert_eq!(
        finder.find_spec("app:runtime=/repo@rpl:devel/1.0-1-1").unwrap(),
        vec![one.tuple()]
    );
    assert!(matches!(
        finder.find_spec("app:runtime=repo@rpl:qa"),
        Err(Error::TroveNotFound(_))
    ));
}

/// app needs lib, lib needs base; all three carry a file
fn dependency_chain(config_toml: &str) -> (Fixture, TempDir, Repository, Config, [Pkg; 3]) {
    let mut app = Pkg::new("app:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/usr/bin/app", b"app\n");
    app.trove.requires_mut().add(DepClass::Trove, Dependency::new("lib:runtime"));
    let mut lib = Pkg::new("lib:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/usr/lib/libx.so", b"lib\n");
    lib.trove.requires_mut().add(DepClass::Trove, Dependency::new("base:runtime"));
    let base = Pkg::new("base:runtime", "/repo@rpl:devel/1.0-1-1", 1000).file("/etc/base", b"base\n");
    let (repo_tmp, repo) = repo_with(&[&base, &lib, &app]);

    let fixture = Fixture::new();
    let mut config = Config::from_toml_str(config_toml).unwrap();
    config.tmp_dir = fixture.tmp.path().join("staging");
    (fixture, repo_tmp, repo, config, [app, lib, base])
}

#[test]
fn test_update_without_auto_resolve_refuses_missing_requirements() {
    let (mut fx, _repo_tmp, repo, config, [app, ..]) = dependency_chain(
        r#"
        installLabel = ["repo@rpl:devel"]
        "#,
    );

    let err = update_from_repository(&repo, &mut fx.db, &config, &[app.tuple()]).unwrap_err();
    assert!(matches!(&err, Error::DependencyFailure(msg) if msg.contains("lib:runtime")));
    assert!(fx.db.installed().unwrap().is_empty());
    assert!(!fx.path("/usr/bin/app").exists());
}

#[test]
fn test_update_with_auto_resolve_installs_requirements() {
    let (mut fx, _repo_tmp, repo, config, [app, lib, base]) = dependency_chain(
        r#"
        installLabel = ["repo@rpl:devel"]
        autoResolve = true
        "#,
    );

    let job = update_from_repository(&repo, &mut fx.db, &config, &[app.tuple()]).unwrap();
    assert_eq!(job.installed.len(), 3);
    for pkg in [&app, &lib, &base] {
        assert!(fx.db.has(&pkg.tuple()).unwrap());
    }
    assert_eq!(fx.read("/usr/lib/libx.so"), b"lib\n");
    assert_eq!(fx.read("/etc/base"), b"base\n");
    // staged change sets are cleaned up
    assert_eq!(std::fs::read_dir(&config.tmp_dir).unwrap().count(), 0);

    // a second run has nothing to do
    let again = update_from_repository(&repo, &mut fx.db, &config, &[app.tuple()]).unwrap();
    assert!(again.installed.is_empty());
}

#[test]
fn test_auto_resolve_honours_excluded_troves() {
    let (mut fx, _repo_tmp, repo, config, [app, ..]) = dependency_chain(
        r#"
        installLabel = ["repo@rpl:devel"]
        autoResolve = true
        excludeTroves = ["base:*"]
        "#,
    );

    let err = update_from_repository(&repo, &mut fx.db, &config, &[app.tuple()]).unwrap_err();
    assert!(matches!(&err, Error::DependencyFailure(msg) if msg.contains("base:runtime")));
    assert!(fx.db.installed().unwrap().is_empty());
}

#[test]
fn test_auto_resolve_stops_at_max_depth() {
    let (mut fx, _repo_tmp, repo, config, [app, ..]) = dependency_chain(
        r#"
        installLabel = ["repo@rpl:devel"]
        autoResolve = true
        maxResolveDepth = 0
        "#,
    );

    let err = update_from_repository(&repo, &mut fx.db, &config, &[app.tuple()]).unwrap_err();
    assert!(matches!(&err, Error::DependencyFailure(msg) if msg.contains("maxResolveDepth")));
    assert!(fx.db.installed().unwrap().is_empty());
}

#[test]
fn test_installed_provider_satisfies_requirement() {
    let (mut fx, _repo_tmp, repo, config, [app, lib, base]) = dependency_chain(
        r#"
        installLabel = ["repo@rpl:devel"]
        "#,
    );
    conary_core::apply_change_set(&mut fx.db, &base.install_cs(), &Default::default()).unwrap();
    conary_core::apply_change_set(&mut fx.db, &lib.install_cs(), &Default::default()).unwrap();

    let job = update_from_repository(&repo, &mut fx.db, &config, &[app.tuple()]).unwrap();
    assert_eq!(job.installed, vec![app.tuple()]);
}
