//! Hybrid Bayes trees and multifrontal elimination.
//!
//! Cliques live in an arena indexed by [`CliqueId`]; parents and children are
//! ids, so incremental updates can detach and re-attach subtrees without
//! shared ownership. Slots of removed cliques are left empty and never
//! reused, which keeps ids of untouched cliques stable across updates.

use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::engine::conditional::HybridConditional;
use crate::engine::eliminate::EliminationConfig;
use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::factor_graph::{HybridFactorGraph, KeyDomains};
use crate::engine::hybrid_factor::HybridFactor;
use crate::engine::junction_tree::{eliminate_multifrontal, EliminatedClique};
use crate::engine::keys::{Assignment, HybridValues, Key};
use crate::engine::ordering::Ordering;

/// Stable index of a clique in a [`HybridBayesTree`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct CliqueId(pub u32);

impl CliqueId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CliqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clique#{}", self.0)
    }
}

/// Frontal keys, their joint conditional and the factors needed to redo the
/// elimination locally.
#[derive(Debug, Clone)]
pub struct BayesTreeClique {
    frontals: Vec<Key>,
    separator: Vec<Key>,
    conditional: HybridConditional,
    parent: Option<CliqueId>,
    children: Vec<CliqueId>,
    originals: Vec<HybridFactor>,
    separator_factor: Option<HybridFactor>,
}

impl BayesTreeClique {
    pub fn frontals(&self) -> &[Key] {
        &self.frontals
    }

    pub fn separator(&self) -> &[Key] {
        &self.separator
    }

    pub fn conditional(&self) -> &HybridConditional {
        &self.conditional
    }

    pub fn parent(&self) -> Option<CliqueId> {
        self.parent
    }

    pub fn children(&self) -> &[CliqueId] {
        &self.children
    }

    /// Input factors absorbed by this clique.
    pub fn original_factors(&self) -> &[HybridFactor] {
        &self.originals
    }

    /// The factor this clique passed to its parent, if any.
    pub fn separator_factor(&self) -> Option<&HybridFactor> {
        self.separator_factor.as_ref()
    }

    pub(crate) fn separator_factor_owned(&self) -> Option<HybridFactor> {
        self.separator_factor.clone()
    }

    pub(crate) fn set_parent(&mut self, parent: Option<CliqueId>) {
        self.parent = parent;
    }

    pub(crate) fn add_child(&mut self, child: CliqueId) {
        self.children.push(child);
    }
}

/// A forest of cliques produced by multifrontal elimination.
#[derive(Debug, Clone)]
pub struct HybridBayesTree {
    cliques: Vec<Option<BayesTreeClique>>,
    roots: Vec<CliqueId>,
    frontal_index: FxHashMap<Key, CliqueId>,
    /// Elimination rank of every eliminated key.
    positions: FxHashMap<Key, usize>,
    next_position: usize,
    domains: KeyDomains,
    /// Factors over un-eliminated keys only.
    outer_factors: Vec<HybridFactor>,
    config: EliminationConfig,
}

impl HybridBayesTree {
    fn empty(domains: KeyDomains, config: EliminationConfig) -> Self {
        Self {
            cliques: Vec::new(),
            roots: Vec::new(),
            frontal_index: FxHashMap::default(),
            positions: FxHashMap::default(),
            next_position: 0,
            domains,
            outer_factors: Vec::new(),
            config,
        }
    }

    /// Number of live cliques.
    pub fn size(&self) -> usize {
        self.cliques.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn roots(&self) -> &[CliqueId] {
        &self.roots
    }

    pub fn clique(&self, id: CliqueId) -> Option<&BayesTreeClique> {
        self.cliques.get(id.index()).and_then(Option::as_ref)
    }

    pub fn cliques(&self) -> impl Iterator<Item = (CliqueId, &BayesTreeClique)> {
        self.cliques
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (CliqueId(i as u32), c)))
    }

    /// The clique holding `key` as a frontal variable.
    pub fn clique_of(&self, key: Key) -> Option<CliqueId> {
        self.frontal_index.get(&key).copied()
    }

    /// Eliminated keys in elimination order.
    pub fn eliminated_keys(&self) -> Vec<Key> {
        let mut keys: Vec<(usize, Key)> = self.positions.iter().map(|(&k, &p)| (p, k)).collect();
        keys.sort_unstable();
        keys.into_iter().map(|(_, k)| k).collect()
    }

    pub fn config(&self) -> &EliminationConfig {
        &self.config
    }

    pub(crate) fn domains(&self) -> &KeyDomains {
        &self.domains
    }

    pub(crate) fn position(&self, key: Key) -> Option<usize> {
        self.positions.get(&key).copied()
    }

    pub(crate) fn clique_mut(&mut self, id: CliqueId) -> HybridResult<&mut BayesTreeClique> {
        self.cliques
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| HybridError::Internal(format!("{} is not a live clique", id)))
    }

    pub(crate) fn live(&self, id: CliqueId) -> HybridResult<&BayesTreeClique> {
        self.clique(id)
            .ok_or_else(|| HybridError::Internal(format!("{} is not a live clique", id)))
    }

    /// Sum of clique conditional log densities.
    pub fn log_evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.cliques()
            .map(|(_, clique)| clique.conditional.log_evaluate(values))
            .sum()
    }

    /// Product of clique conditionals.
    pub fn evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.log_evaluate(values).map(f64::exp)
    }

    /// Most probable continuous values for the given modes.
    pub fn optimize(&self, assignment: &Assignment) -> HybridResult<HybridValues> {
        self.optimize_from(HybridValues::from_parts(FxHashMap::default(), assignment.clone()))
    }

    /// Top-down back-substitution starting from `values` (which must hold any
    /// un-eliminated separator values).
    pub fn optimize_from(&self, mut values: HybridValues) -> HybridResult<HybridValues> {
        let mut stack: Vec<CliqueId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let clique = self.live(id)?;
            for (key, value) in clique.conditional.solve(&values)? {
                values.insert_continuous(key, value);
            }
            stack.extend(clique.children.iter().rev().copied());
        }
        Ok(values)
    }

    /// The graph left over the un-eliminated keys: root separator factors plus
    /// input factors that never touched an eliminated key.
    pub fn remaining_factors(&self) -> HybridFactorGraph {
        let mut factors = self.outer_factors.clone();
        for &root in &self.roots {
            if let Some(factor) = self.clique(root).and_then(|c| c.separator_factor.clone()) {
                factors.push(factor);
            }
        }
        HybridFactorGraph::with_domains(factors, self.domains.clone())
    }

    /// Checks that every separator is covered by the parent's scope, every
    /// eliminated key is frontal in exactly one clique, and parent/child
    /// links agree.
    pub fn satisfies_running_intersection(&self) -> bool {
        let mut frontal_seen: FxHashSet<Key> = FxHashSet::default();
        for (id, clique) in self.cliques() {
            if !clique.frontals.iter().all(|&k| frontal_seen.insert(k)) {
                return false;
            }
            match clique.parent {
                Some(parent_id) => {
                    let Some(parent) = self.clique(parent_id) else {
                        return false;
                    };
                    if !parent.children.contains(&id) {
                        return false;
                    }
                    let covered = clique.separator.iter().all(|k| {
                        parent.frontals.contains(k) || parent.separator.contains(k)
                    });
                    if !covered {
                        return false;
                    }
                }
                None => {
                    if !self.roots.contains(&id) {
                        return false;
                    }
                }
            }
            if clique
                .children
                .iter()
                .any(|&c| self.clique(c).map_or(true, |child| child.parent != Some(id)))
            {
                return false;
            }
        }
        frontal_seen.len() == self.positions.len()
    }

    /// Adds eliminated cliques (children before parents) and returns the ids
    /// assigned to them. Links among the new cliques are set; links to
    /// existing cliques are left to the caller.
    pub(crate) fn insert_cliques(
        &mut self,
        eliminated: Vec<EliminatedClique>,
        order: &[Key],
    ) -> HybridResult<Vec<CliqueId>> {
        let base = self.cliques.len();
        let ids: Vec<CliqueId> = (0..eliminated.len())
            .map(|i| {
                u32::try_from(base + i)
                    .map(CliqueId)
                    .map_err(|_| HybridError::Internal("clique arena overflow".into()))
            })
            .collect::<HybridResult<_>>()?;

        for (clique, &id) in eliminated.into_iter().zip(ids.iter()) {
            for &key in &clique.frontals {
                self.frontal_index.insert(key, id);
            }
            let parent = clique.parent.map(|p| ids[p]);
            if parent.is_none() {
                self.roots.push(id);
            }
            self.cliques.push(Some(BayesTreeClique {
                frontals: clique.frontals,
                separator: clique.separator,
                conditional: clique.conditional,
                parent,
                children: clique.children.iter().map(|&c| ids[c]).collect(),
                originals: clique.originals,
                separator_factor: clique.separator_factor,
            }));
        }

        for &key in order {
            self.positions.insert(key, self.next_position);
            self.next_position += 1;
        }
        Ok(ids)
    }

    /// Removes cliques from the arena, the frontal index and the roots.
    pub(crate) fn remove_cliques(&mut self, ids: &FxHashSet<CliqueId>) {
        for &id in ids {
            if let Some(clique) = self.cliques.get_mut(id.index()).and_then(Option::take) {
                for key in &clique.frontals {
                    self.frontal_index.remove(key);
                }
            }
        }
        self.roots.retain(|r| !ids.contains(r));
    }

    pub(crate) fn set_domains(&mut self, domains: KeyDomains) {
        self.domains = domains;
    }

    pub(crate) fn add_outer_factors(&mut self, factors: Vec<HybridFactor>) {
        self.outer_factors.extend(factors);
    }

    pub(crate) fn demote_root(&mut self, id: CliqueId) {
        self.roots.retain(|&r| r != id);
    }
}

impl HybridFactorGraph {
    /// Eliminates the ordering's keys clique by clique with the default
    /// configuration.
    ///
    /// Returns the Bayes tree and, for a partial ordering, the graph left
    /// over the un-eliminated keys.
    pub fn eliminate_multifrontal(
        &self,
        ordering: &Ordering,
    ) -> HybridResult<(HybridBayesTree, Option<HybridFactorGraph>)> {
        self.eliminate_multifrontal_with_config(ordering, &EliminationConfig::default())
    }

    pub fn eliminate_multifrontal_with_config(
        &self,
        ordering: &Ordering,
        config: &EliminationConfig,
    ) -> HybridResult<(HybridBayesTree, Option<HybridFactorGraph>)> {
        let config = config.validate()?;
        let order = ordering.resolve(self)?;
        let result = eliminate_multifrontal(
            self.factors().to_vec(),
            Vec::new(),
            &order,
            self.domains(),
            &config,
        )?;

        let mut tree = HybridBayesTree::empty(self.domains().clone(), config);
        // Outer factors are kept without their root separator factors, which
        // stay on the root cliques.
        let root_count = result
            .cliques
            .iter()
            .filter(|c| c.parent.is_none() && c.separator_factor.is_some())
            .count();
        let mut outer = result.remaining;
        outer.truncate(outer.len() - root_count);
        tree.add_outer_factors(outer);
        tree.insert_cliques(result.cliques, &order)?;

        let partial = self.keys().len() > order.len();
        let remaining_graph = partial.then(|| tree.remaining_factors());
        Ok((tree, remaining_graph))
    }
}
