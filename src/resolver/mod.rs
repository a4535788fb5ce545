// src/resolver/mod.rs

//! Dependency resolution
//!
//! Given a set of required atoms, find troves on a label path whose
//! provides satisfy them, then keep going through the requirements of
//! every trove picked until nothing new is needed or the depth limit is
//! reached. Cycles end naturally: an atom some chosen trove already
//! provides is settled without another lookup.
//!
//! Candidates for an atom are ranked per trove name by
//!
//! 1. flavor score against the preference stack (incompatible flavors drop out)
//! 2. version timestamp, newest first
//! 3. how many of the candidate's own requirements nothing can satisfy
//! 4. label path precedence
//!
//! Atoms nothing provides are returned, not raised; the caller decides
//! whether a partial answer is good enough.

mod conflict;
mod plan;

pub use conflict::{Ambiguity, Unresolved};
pub use plan::{Resolution, Solution};

use crate::dependencies::{DepClass, Dependency, DependencySet};
use crate::error::{Error, Result};
use crate::flavor::FlavorContext;
use crate::label::LabelPath;
use crate::source::TroveSource;
use crate::trove::{Trove, TroveTuple};
use crate::update::CancelToken;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Default recursion limit for requirements of chosen troves
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// A candidate with everything it is ranked by
struct Ranked {
    tuple: TroveTuple,
    trove: Trove,
    pref_index: usize,
    score: i32,
    unresolved: usize,
    precedence: usize,
}

impl Ranked {
    /// `Less` means `self` is the better candidate
    fn rank(&self, other: &Ranked) -> Ordering {
        self.pref_index
            .cmp(&other.pref_index)
            .then(other.score.cmp(&self.score))
            .then(other.tuple.version.cmp_timestamps(&self.tuple.version))
            .then(self.unresolved.cmp(&other.unresolved))
            .then(self.precedence.cmp(&other.precedence))
    }
}

/// Dependency resolver over any [`TroveSource`]
pub struct Resolver<'a, S: TroveSource + ?Sized> {
    source: &'a S,
    label_path: LabelPath,
    flavor: FlavorContext,
    affinity: Vec<TroveTuple>,
    exclude: Vec<glob::Pattern>,
    max_depth: usize,
    cancel: Option<CancelToken>,
}

impl<'a, S: TroveSource + ?Sized> Resolver<'a, S> {
    pub fn new(source: &'a S, label_path: LabelPath, flavor: FlavorContext) -> Self {
        Self {
            source,
            label_path,
            flavor,
            affinity: Vec::new(),
            exclude: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            cancel: None,
        }
    }

    /// Installed troves whose flavors bias the choice for the same name
    pub fn with_affinity(mut self, affinity: Vec<TroveTuple>) -> Self {
        self.affinity = affinity;
        self
    }

    /// Trove names never considered
    pub fn with_exclude(mut self, patterns: Vec<glob::Pattern>) -> Self {
        self.exclude = patterns;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Resolve `required` and the requirements of everything chosen for it
    pub fn resolve(&self, required: &DependencySet) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        let mut chosen: BTreeMap<TroveTuple, Trove> = BTreeMap::new();
        let mut seen: HashSet<(DepClass, Dependency)> = HashSet::new();
        let mut queue: VecDeque<(DepClass, Dependency, Option<TroveTuple>, usize)> = required
            .iter()
            .map(|(class, dep)| (class, dep.clone(), None, 0))
            .collect();

        while let Some((class, dep, required_by, depth)) = queue.pop_front() {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(Error::Cancelled);
            }
            if !seen.insert((class, dep.clone())) {
                continue;
            }

            if let Some(tuple) = chosen
                .iter()
                .find(|(_, t)| t.provides().satisfies_atom(class, &dep))
                .map(|(tuple, _)| tuple.clone())
            {
                debug!("{}: {} already provided by {}", class, dep, tuple);
                resolution.solutions.push(Solution {
                    class,
                    dep,
                    candidates: vec![tuple],
                });
                continue;
            }

            let winners = self.rank_candidates(class, &dep, &mut resolution)?;
            let Some(best) = winners.first() else {
                debug!("nothing provides {}: {}", class, dep);
                resolution.unresolved.push(Unresolved {
                    class,
                    dep,
                    required_by,
                });
                continue;
            };

            let tied: Vec<TroveTuple> = winners
                .iter()
                .take_while(|w| w.rank(best) == Ordering::Equal)
                .map(|w| w.tuple.clone())
                .collect();
            if tied.len() > 1 {
                resolution.ambiguous.push(Ambiguity {
                    class,
                    dep: dep.clone(),
                    candidates: tied,
                });
            }

            let first = best.tuple.clone();
            if !chosen.contains_key(&first) {
                debug!("{}: {} resolved to {}", class, dep, first);
                if depth < self.max_depth {
                    for (req_class, req) in best.trove.requires().iter() {
                        queue.push_back((req_class, req.clone(), Some(first.clone()), depth + 1));
                    }
                }
                resolution.chosen.insert(first.clone());
                chosen.insert(first, best.trove.clone());
            }
            resolution.solutions.push(Solution {
                class,
                dep,
                candidates: winners.into_iter().map(|w| w.tuple).collect(),
            });
        }

        info!(
            "resolved {} requirement(s): {} trove(s) chosen, {} unresolved",
            resolution.solutions.len(),
            resolution.chosen.len(),
            resolution.unresolved.len()
        );
        Ok(resolution)
    }

    /// Best candidate per trove name, best first
    fn rank_candidates(&self, class: DepClass, dep: &Dependency, resolution: &mut Resolution) -> Result<Vec<Ranked>> {
        let mut by_name: BTreeMap<String, Vec<Ranked>> = BTreeMap::new();
        for tuple in self.source.providers(class, dep)? {
            if self.exclude.iter().any(|p| p.matches(&tuple.name)) {
                continue;
            }
            let Some(precedence) = self.precedence(&tuple) else {
                continue;
            };
            let ctx = match self.affinity.iter().find(|a| a.name == tuple.name) {
                Some(installed) => self.flavor.with_affinity(&installed.flavor)?,
                None => self.flavor.clone(),
            };
            let Some((pref_index, score)) = ctx.score(&tuple.flavor) else {
                debug!("{} flavor is incompatible", tuple);
                continue;
            };
            let Some(trove) = self.source.get_trove(&tuple)? else {
                continue;
            };
            // providers() is trusted for lookup only
            if !trove.provides().satisfies_atom(class, dep) {
                continue;
            }
            let unresolved = self.unresolvable_requires(&trove)?;
            by_name.entry(tuple.name.clone()).or_default().push(Ranked {
                tuple,
                trove,
                pref_index,
                score,
                unresolved,
                precedence,
            });
        }

        let mut winners = Vec::new();
        for (_, mut group) in by_name {
            group.sort_by(|a, b| a.rank(b).then(a.tuple.cmp(&b.tuple)));
            let tied: Vec<TroveTuple> = group
                .iter()
                .take_while(|c| c.rank(&group[0]) == Ordering::Equal)
                .map(|c| c.tuple.clone())
                .collect();
            if tied.len() > 1 {
                resolution.ambiguous.push(Ambiguity {
                    class,
                    dep: dep.clone(),
                    candidates: tied,
                });
            }
            if let Some(best) = group.into_iter().next() {
                winners.push(best);
            }
        }
        winners.sort_by(|a, b| a.rank(b).then(a.tuple.cmp(&b.tuple)));
        Ok(winners)
    }

    /// Position on the label path of the best label the version sits on;
    /// `None` when it is off the path
    fn precedence(&self, tuple: &TroveTuple) -> Option<usize> {
        if self.label_path.is_empty() {
            return Some(0);
        }
        tuple
            .version
            .branch()
            .labels()
            .filter_map(|l| self.label_path.precedence(l))
            .min()
    }

    fn unresolvable_requires(&self, trove: &Trove) -> Result<usize> {
        let mut count = 0;
        for (class, req) in trove.requires().iter() {
            if trove.provides().satisfies_atom(class, req) {
                continue;
            }
            let reachable = self
                .source
                .providers(class, req)?
                .iter()
                .any(|t| self.precedence(t).is_some());
            if !reachable {
                count += 1;
            }
        }
        Ok(count)
    }
}
