// src/repository/query.rs

//! Read-side queries: provider lookup and the version/leaf maps served
//! over the wire

use super::Repository;
use super::store;
use crate::dependencies::{DepClass, Dependency};
use crate::error::Result;
use crate::flavor::{Flavor, FlavorContext};
use crate::label::Label;
use crate::trove::TroveTuple;
use crate::version::{Branch, Version};
use rusqlite::types::Value;
use rusqlite::{Connection, Params, params_from_iter};
use std::collections::BTreeMap;

/// `name → constraint → flavors`; `None` flavors means any flavor
pub type QueryMap = BTreeMap<String, BTreeMap<String, Option<Vec<Flavor>>>>;

/// `name → frozen version → flavors`
pub type VersionFlavorMap = BTreeMap<String, BTreeMap<String, Vec<Flavor>>>;

fn tuples<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<TroveTuple>> {
    let ids: Vec<i64> = conn
        .prepare(sql)?
        .query_map(params, |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;
    let mut out = ids
        .into_iter()
        .map(|id| store::instance_tuple(conn, id))
        .collect::<Result<Vec<_>>>()?;
    out.sort();
    Ok(out)
}

pub(crate) fn versions_of(conn: &Connection, name: &str) -> Result<Vec<TroveTuple>> {
    tuples(
        conn,
        "SELECT instanceId FROM Instances JOIN Items ON Items.itemId = Instances.itemId
         WHERE Items.item = ?1 AND Instances.isPresent = 1",
        [name],
    )
}

/// Present instances with one provided atom covering every required flag
/// of `dep`
///
/// Rows of one atom share a `depNum`, so counting matched flag rows per
/// (instance, depNum) stops two different atoms from adding up to a match.
pub(crate) fn providers(conn: &Connection, class: DepClass, dep: &Dependency) -> Result<Vec<TroveTuple>> {
    let required: Vec<&str> = dep.required_flags().collect();
    let mut values = vec![Value::Integer(i64::from(class.tag()))];
    let mut sql = String::from(
        "SELECT DISTINCT instanceId FROM (
            SELECT Provides.instanceId AS instanceId FROM Provides
            JOIN Dependencies ON Dependencies.depId = Provides.depId
            JOIN Instances ON Instances.instanceId = Provides.instanceId
            WHERE Instances.isPresent = 1 AND Dependencies.class = ?",
    );
    if !class.just_one() {
        sql.push_str(" AND Dependencies.name = ?");
        values.push(Value::Text(dep.name.clone()));
    }
    if !required.is_empty() {
        let marks = vec!["?"; required.len() * 3].join(", ");
        sql.push_str(&format!(" AND Dependencies.flag IN ({})", marks));
        for flag in &required {
            values.push(Value::Text(flag.to_string()));
            values.push(Value::Text(format!("~{}", flag)));
            values.push(Value::Text(format!("~!{}", flag)));
        }
    }
    sql.push_str(" GROUP BY Provides.instanceId, Provides.depNum");
    if !required.is_empty() {
        sql.push_str(" HAVING COUNT(*) = ?");
        values.push(Value::Integer(required.len() as i64));
    }
    sql.push(')');
    tuples(conn, &sql, params_from_iter(values))
}

fn latest_on_label(conn: &Connection, name: &str, label: &Label) -> Result<Vec<TroveTuple>> {
    let all = tuples(
        conn,
        "SELECT Instances.instanceId FROM Latest
         JOIN Items ON Items.itemId = Latest.itemId
         JOIN LabelMap ON LabelMap.itemId = Latest.itemId AND LabelMap.branchId = Latest.branchId
         JOIN Labels ON Labels.labelId = LabelMap.labelId
         JOIN Instances ON Instances.itemId = Latest.itemId
              AND Instances.versionId = Latest.versionId
              AND Instances.flavorId = Latest.flavorId
         WHERE Items.item = ?1 AND Labels.label = ?2",
        rusqlite::params![name, label.to_string()],
    )?;
    // several branches may end on the same label; keep one leaf per flavor
    let mut leaves: BTreeMap<String, TroveTuple> = BTreeMap::new();
    for tuple in all {
        let key = tuple.flavor.freeze();
        match leaves.get(&key) {
            Some(existing) if !tuple.version.is_after(&existing.version) => {}
            _ => {
                leaves.insert(key, tuple);
            }
        }
    }
    Ok(leaves.into_values().collect())
}

fn latest_on_branch(conn: &Connection, name: &str, branch: &Branch) -> Result<Vec<TroveTuple>> {
    tuples(
        conn,
        "SELECT Instances.instanceId FROM Latest
         JOIN Items ON Items.itemId = Latest.itemId
         JOIN Branches ON Branches.branchId = Latest.branchId
         JOIN Instances ON Instances.itemId = Latest.itemId
              AND Instances.versionId = Latest.versionId
              AND Instances.flavorId = Latest.flavorId
         WHERE Items.item = ?1 AND Branches.branch = ?2",
        rusqlite::params![name, branch.to_string()],
    )
}

fn with_version(conn: &Connection, name: &str, version: &Version) -> Result<Vec<TroveTuple>> {
    tuples(
        conn,
        "SELECT instanceId FROM Instances
         JOIN Items ON Items.itemId = Instances.itemId
         JOIN Versions ON Versions.versionId = Instances.versionId
         WHERE Items.item = ?1 AND Versions.version = ?2 AND Instances.isPresent = 1",
        rusqlite::params![name, version.as_string()],
    )
}

fn all_instances(conn: &Connection, name: Option<&str>) -> Result<Vec<TroveTuple>> {
    match name {
        Some(name) => versions_of(conn, name),
        None => tuples(conn, "SELECT instanceId FROM Instances WHERE isPresent = 1", []),
    }
}

/// Narrow `candidates` by the requested flavors
///
/// Without `best`, anything some requested flavor accepts is kept. With
/// `best`, each requested flavor contributes its single best candidate:
/// highest score, then latest version.
fn pick_flavors(candidates: Vec<TroveTuple>, flavors: Option<&Vec<Flavor>>, best: bool) -> Vec<TroveTuple> {
    let Some(flavors) = flavors else {
        return candidates;
    };
    if !best {
        return candidates
            .into_iter()
            .filter(|t| flavors.iter().any(|f| f.score(&t.flavor).is_some()))
            .collect();
    }
    let mut chosen: Vec<TroveTuple> = Vec::new();
    for pref in flavors {
        let ctx = FlavorContext::single(pref.clone());
        let mut best_one: Option<(i32, &TroveTuple)> = None;
        for cand in &candidates {
            let Some((_, score)) = ctx.score(&cand.flavor) else {
                continue;
            };
            let better = match best_one {
                None => true,
                Some((s, cur)) => score > s || (score == s && cand.version.is_after(&cur.version)),
            };
            if better {
                best_one = Some((score, cand));
            }
        }
        if let Some((_, t)) = best_one
            && !chosen.contains(t)
        {
            chosen.push(t.clone());
        }
    }
    chosen
}

fn insert_all(out: &mut VersionFlavorMap, tuples: Vec<TroveTuple>) {
    for t in tuples {
        out.entry(t.name.clone())
            .or_default()
            .entry(t.version.freeze())
            .or_default()
            .push(t.flavor);
    }
}

impl Repository {
    /// Every present version of `names` (all names when empty), optionally
    /// only those whose trailing label is `label`
    pub fn get_trove_version_list(&self, label: Option<&Label>, names: &[String]) -> Result<VersionFlavorMap> {
        let mut found = Vec::new();
        if names.is_empty() {
            found.extend(all_instances(self.conn(), None)?);
        } else {
            for name in names {
                found.extend(all_instances(self.conn(), Some(name))?);
            }
        }
        if let Some(label) = label {
            found.retain(|t| t.version.trailing_label() == label);
        }
        let mut out = VersionFlavorMap::new();
        insert_all(&mut out, found);
        Ok(out)
    }

    /// Leaves of every branch ending on each label constraint
    pub fn get_trove_leaves_by_label(&self, query: &QueryMap, best_flavor: bool) -> Result<VersionFlavorMap> {
        let mut out = VersionFlavorMap::new();
        for (name, constraints) in query {
            for (label, flavors) in constraints {
                let label = Label::parse(label)?;
                let leaves = latest_on_label(self.conn(), name, &label)?;
                insert_all(&mut out, pick_flavors(leaves, flavors.as_ref(), best_flavor));
            }
        }
        Ok(out)
    }

    pub fn get_trove_leaves_by_branch(&self, query: &QueryMap, best_flavor: bool) -> Result<VersionFlavorMap> {
        let mut out = VersionFlavorMap::new();
        for (name, constraints) in query {
            for (branch, flavors) in constraints {
                let branch = Branch::parse(branch)?;
                let leaves = latest_on_branch(self.conn(), name, &branch)?;
                insert_all(&mut out, pick_flavors(leaves, flavors.as_ref(), best_flavor));
            }
        }
        Ok(out)
    }

    /// Flavors available for exact versions
    pub fn get_trove_version_flavors(&self, query: &QueryMap, best_flavor: bool) -> Result<VersionFlavorMap> {
        let mut out = VersionFlavorMap::new();
        for (name, constraints) in query {
            for (version, flavors) in constraints {
                let version = Version::thaw(version)?;
                let found = with_version(self.conn(), name, &version)?;
                insert_all(&mut out, pick_flavors(found, flavors.as_ref(), best_flavor));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangeSet;
    use crate::repository::CommitOptions;
    use crate::repository::tests::version;
    use crate::trove::Trove;
    use tempfile::TempDir;

    fn commit(repo: &mut Repository, name: &str, ver: &Version, flavor: &str) -> TroveTuple {
        let trove = Trove::new(name, ver.clone(), Flavor::parse(flavor).unwrap());
        let mut cs = ChangeSet::new();
        cs.add_trove(trove.diff(None)).unwrap();
        repo.commit_change_set(&cs, CommitOptions::default()).unwrap();
        trove.tuple()
    }

    fn query(name: &str, constraint: &str, flavors: Option<Vec<&str>>) -> QueryMap {
        let flavors = flavors.map(|fs| fs.into_iter().map(|f| Flavor::parse(f).unwrap()).collect());
        let mut inner = BTreeMap::new();
        inner.insert(constraint.to_string(), flavors);
        let mut q = QueryMap::new();
        q.insert(name.to_string(), inner);
        q
    }

    #[test]
    fn test_leaves_by_label_follow_latest() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v1 = version("/repo@rpl:devel/1.0-1-1", 100);
        let v2 = version("/repo@rpl:devel/1.1-1-1", 200);
        commit(&mut repo, "foo:runtime", &v1, "is: x86");
        let newest = commit(&mut repo, "foo:runtime", &v2, "is: x86");

        let got = repo
            .get_trove_leaves_by_label(&query("foo:runtime", "repo@rpl:devel", None), false)
            .unwrap();
        let versions: Vec<&String> = got["foo:runtime"].keys().collect();
        assert_eq!(versions, vec![&newest.version.freeze()]);

        repo.set_present(&newest, false).unwrap();
        let got = repo
            .get_trove_leaves_by_label(&query("foo:runtime", "repo@rpl:devel", None), false)
            .unwrap();
        assert!(got["foo:runtime"].contains_key(&v1.freeze()));
    }

    #[test]
    fn test_best_flavor_picks_highest_score() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v = version("/repo@rpl:devel/1.0-1-1", 100);
        commit(&mut repo, "bar:lib", &v, "is: x86");
        let sse = commit(&mut repo, "bar:lib", &v, "is: x86(sse2)");
        commit(&mut repo, "bar:lib", &v, "is: x86_64");

        let q = query("bar:lib", &v.freeze(), Some(vec!["is: x86(~sse2)"]));
        let all = repo.get_trove_version_flavors(&q, false).unwrap();
        assert_eq!(all["bar:lib"][&v.freeze()].len(), 2);

        let best = repo.get_trove_version_flavors(&q, true).unwrap();
        assert_eq!(best["bar:lib"][&v.freeze()], vec![sse.flavor]);
    }

    #[test]
    fn test_leaves_by_branch_and_version_list() {
        let tmp = TempDir::new().unwrap();
        let mut repo = Repository::init(tmp.path()).unwrap();
        let v1 = version("/repo@rpl:devel/1.0-1-1", 100);
        let shadow = v1.create_shadow_at(&Label::parse("local@corp:branch").unwrap(), 150).unwrap();
        commit(&mut repo, "baz:runtime", &v1, "");
        commit(&mut repo, "baz:runtime", &shadow, "");

        let q = query("baz:runtime", &shadow.branch().to_string(), None);
        let got = repo.get_trove_leaves_by_branch(&q, false).unwrap();
        assert!(got["baz:runtime"].contains_key(&shadow.freeze()));
        assert_eq!(got["baz:runtime"].len(), 1);

        let label = Label::parse("repo@rpl:devel").unwrap();
        let list = repo
            .get_trove_version_list(Some(&label), &["baz:runtime".to_string()])
            .unwrap();
        assert_eq!(list["baz:runtime"].len(), 1);
        let everything = repo.get_trove_version_list(None, &[]).unwrap();
        assert_eq!(everything["baz:runtime"].len(), 2);
    }
}
