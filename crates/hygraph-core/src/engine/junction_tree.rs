//! Symbolic elimination tree, clique formation and the numeric multifrontal
//! pass.
//!
//! ## Symbolic pass
//!
//! Every factor is assigned to its earliest-eliminated key. Processing keys
//! in order, the scope of `v` is the union of its assigned factors and its
//! children's separators; `sep(v)` is that scope without `v`, and the parent
//! of `v` is the earliest-eliminated key of `sep(v)`. Keys outside the
//! ordering are never eliminated and only ever appear in separators.
//!
//! ## Cliques
//!
//! `v` joins the clique of its only child `c` when both have the same kind
//! and `sep(c) = {v} ∪ sep(v)`. Cliques are numbered in creation order, which
//! puts every child before its parent.
//!
//! ## Numeric pass
//!
//! Cliques are grouped by height (leaves at 0). A clique only reads its own
//! factors and its children's separator factors, so each level runs as one
//! fork/join on the rayon pool.

use std::collections::BTreeSet;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::engine::conditional::HybridConditional;
use crate::engine::eliminate::{eliminate_frontals, EliminationConfig, EliminationResult};
use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::factor_graph::KeyDomains;
use crate::engine::hybrid_factor::HybridFactor;
use crate::engine::keys::Key;

#[derive(Debug, Clone)]
pub(crate) struct SymbolicClique {
    pub(crate) frontals: Vec<Key>,
    pub(crate) separator: Vec<Key>,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    /// Indices of the input factors absorbed by this clique.
    pub(crate) factors: Vec<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct JunctionTree {
    /// Children before parents.
    pub(crate) cliques: Vec<SymbolicClique>,
    /// Input factors that involve no eliminated key.
    pub(crate) outer_factors: Vec<usize>,
}

impl JunctionTree {
    pub(crate) fn build(order: &[Key], scopes: &[Vec<Key>], domains: &KeyDomains) -> HybridResult<Self> {
        let position: FxHashMap<Key, usize> =
            order.iter().enumerate().map(|(p, &k)| (k, p)).collect();
        let n = order.len();

        let mut assigned: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut outer_factors = Vec::new();
        for (index, scope) in scopes.iter().enumerate() {
            match scope.iter().filter_map(|k| position.get(k)).min() {
                Some(&p) => assigned[p].push(index),
                None => outer_factors.push(index),
            }
        }

        // Elimination tree over variables.
        let mut separators: Vec<Vec<Key>> = vec![Vec::new(); n];
        let mut var_children: Vec<Vec<usize>> = vec![Vec::new(); n];
        for p in 0..n {
            let v = order[p];
            let mut scope: BTreeSet<Key> = BTreeSet::new();
            for &f in &assigned[p] {
                scope.extend(scopes[f].iter().copied());
            }
            for &c in &var_children[p] {
                scope.extend(separators[c].iter().copied());
            }
            scope.remove(&v);
            if let Some(stale) = scope.iter().find(|k| position.get(k).map_or(false, |&q| q < p)) {
                return Err(HybridError::Internal(format!(
                    "{} reappears after its elimination",
                    stale
                )));
            }
            if let Some(&q) = scope.iter().filter_map(|k| position.get(k)).min() {
                var_children[q].push(p);
            }
            separators[p] = scope.into_iter().collect();
        }

        let mut clique_of: Vec<Option<usize>> = vec![None; n];
        let mut cliques: Vec<SymbolicClique> = Vec::new();
        for p in 0..n {
            let v = order[p];
            let kind = domains.kind(v);
            let merge_into = match var_children[p].as_slice() {
                [c] if domains.kind(order[*c]) == kind
                    && separators[*c].len() == separators[p].len() + 1 =>
                {
                    clique_of[*c]
                }
                _ => None,
            };

            let id = match merge_into {
                Some(id) => {
                    let clique = &mut cliques[id];
                    clique.frontals.push(v);
                    clique.separator = separators[p].clone();
                    clique.factors.extend(assigned[p].iter().copied());
                    id
                }
                None => {
                    let id = cliques.len();
                    let children: Vec<usize> = var_children[p]
                        .iter()
                        .filter_map(|&c| clique_of[c])
                        .collect();
                    for &child in &children {
                        cliques[child].parent = Some(id);
                    }
                    cliques.push(SymbolicClique {
                        frontals: vec![v],
                        separator: separators[p].clone(),
                        parent: None,
                        children,
                        factors: assigned[p].clone(),
                    });
                    id
                }
            };
            clique_of[p] = Some(id);
        }

        Ok(Self {
            cliques,
            outer_factors,
        })
    }

    /// Clique ids grouped by height, leaves first.
    pub(crate) fn levels(&self) -> Vec<Vec<usize>> {
        let mut height = vec![0usize; self.cliques.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();
        for (id, clique) in self.cliques.iter().enumerate() {
            height[id] = clique
                .children
                .iter()
                .map(|&c| height[c] + 1)
                .max()
                .unwrap_or(0);
            if levels.len() <= height[id] {
                levels.resize_with(height[id] + 1, Vec::new);
            }
            levels[height[id]].push(id);
        }
        levels
    }
}

/// One numerically eliminated clique.
#[derive(Debug, Clone)]
pub(crate) struct EliminatedClique {
    pub(crate) frontals: Vec<Key>,
    pub(crate) separator: Vec<Key>,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) conditional: HybridConditional,
    pub(crate) originals: Vec<HybridFactor>,
    pub(crate) separator_factor: Option<HybridFactor>,
}

#[derive(Debug, Clone)]
pub(crate) struct MultifrontalResult {
    /// Children before parents.
    pub(crate) cliques: Vec<EliminatedClique>,
    /// Root separator factors and factors over un-eliminated keys only.
    pub(crate) remaining: Vec<HybridFactor>,
}

/// Multifrontal elimination of `originals` plus `messages` along `order`.
///
/// Messages are separator factors of cliques outside this elimination; they
/// take part in elimination but are not recorded as clique originals.
pub(crate) fn eliminate_multifrontal(
    originals: Vec<HybridFactor>,
    messages: Vec<HybridFactor>,
    order: &[Key],
    domains: &KeyDomains,
    config: &EliminationConfig,
) -> HybridResult<MultifrontalResult> {
    let original_count = originals.len();
    let factors: Vec<HybridFactor> = originals.into_iter().chain(messages).collect();
    let scopes: Vec<Vec<Key>> = factors.iter().map(HybridFactor::keys).collect();
    let tree = JunctionTree::build(order, &scopes, domains)?;
    let levels = tree.levels();

    let mut results: Vec<Option<EliminationResult>> = vec![None; tree.cliques.len()];
    for level in &levels {
        let done = &results;
        let job = |id: usize| -> HybridResult<EliminationResult> {
            let clique = &tree.cliques[id];
            let mut inputs: Vec<HybridFactor> =
                clique.factors.iter().map(|&f| factors[f].clone()).collect();
            for &child in &clique.children {
                let result = done[child].as_ref().ok_or_else(|| {
                    HybridError::Internal(format!("clique {} eliminated before child {}", id, child))
                })?;
                inputs.extend(result.remaining.iter().cloned());
            }
            eliminate_frontals(&inputs, &clique.frontals, domains, config)
        };
        let eliminated = run_level(level, config.parallel, job)?;
        for (&id, result) in level.iter().zip(eliminated) {
            results[id] = Some(result);
        }
    }

    let mut cliques = Vec::with_capacity(tree.cliques.len());
    let mut remaining: Vec<HybridFactor> =
        tree.outer_factors.iter().map(|&f| factors[f].clone()).collect();
    for (symbolic, result) in tree.cliques.into_iter().zip(results) {
        let result = result.ok_or_else(|| HybridError::Internal("clique left uneliminated".into()))?;
        if symbolic.parent.is_none() {
            remaining.extend(result.remaining.iter().cloned());
        }
        cliques.push(EliminatedClique {
            originals: symbolic
                .factors
                .iter()
                .filter(|&&f| f < original_count)
                .map(|&f| factors[f].clone())
                .collect(),
            frontals: symbolic.frontals,
            separator: symbolic.separator,
            parent: symbolic.parent,
            children: symbolic.children,
            conditional: result.conditional,
            separator_factor: result.remaining,
        });
    }

    #[cfg(feature = "tracing")]
    tracing::info!(
        "multifrontal elimination: {} keys in {} cliques over {} levels",
        order.len(),
        cliques.len(),
        levels.len()
    );

    Ok(MultifrontalResult { cliques, remaining })
}

#[cfg(feature = "parallel")]
fn run_level<F>(level: &[usize], parallel: bool, job: F) -> HybridResult<Vec<EliminationResult>>
where
    F: Fn(usize) -> HybridResult<EliminationResult> + Sync + Send,
{
    if parallel && level.len() > 1 {
        level.par_iter().map(|&id| job(id)).collect()
    } else {
        level.iter().map(|&id| job(id)).collect()
    }
}

#[cfg(not(feature = "parallel"))]
fn run_level<F>(level: &[usize], _parallel: bool, job: F) -> HybridResult<Vec<EliminationResult>>
where
    F: Fn(usize) -> HybridResult<EliminationResult>,
{
    level.iter().map(|&id| job(id)).collect()
}
