//! Incremental updates of a hybrid Bayes tree.
//!
//! New factors invalidate the cliques whose frontal or separator keys they
//! touch, plus every ancestor of those cliques. That top of the tree is
//! detached and turned back into factors: the original factors of the
//! affected cliques, the new factors, and the separator factors cached on the
//! unaffected children ("orphans"). Re-eliminating those with the multifrontal engine
//! yields replacement cliques, and each orphan is re-attached under the new
//! clique holding its earliest-eliminated separator key.
//!
//! All numeric work happens before the tree is touched, so a failed update
//! leaves it exactly as it was.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::engine::bayes_tree::{CliqueId, HybridBayesTree};
use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::factor_graph::HybridFactorGraph;
use crate::engine::hybrid_factor::HybridFactor;
use crate::engine::junction_tree::eliminate_multifrontal;
use crate::engine::keys::{Key, KeyKind};

impl HybridBayesTree {
    /// Folds `new_factors` into the tree, re-eliminating only the cliques
    /// they affect.
    ///
    /// Keys never seen before are eliminated; keys the tree left
    /// un-eliminated stay that way. Fails with [`HybridError::DomainMismatch`]
    /// or [`HybridError::Structural`] when the new factors disagree with the
    /// tree's keys, and with any elimination error; in every failure case the
    /// tree is unchanged.
    pub fn update(&mut self, new_factors: &HybridFactorGraph) -> HybridResult<()> {
        if new_factors.is_empty() {
            return Ok(());
        }

        let mut domains = self.domains().clone();
        for factor in new_factors {
            domains.admit(factor)?;
        }

        let new_keys: BTreeSet<Key> = new_factors
            .keys()
            .into_iter()
            .filter(|&k| !self.domains().contains(k))
            .collect();

        let affected = self.affected_cliques(new_factors)?;
        let mut affected_ids: Vec<CliqueId> = affected.iter().copied().collect();
        affected_ids.sort_unstable();
        let orphans: Vec<CliqueId> = affected_ids
            .iter()
            .filter_map(|&id| self.clique(id))
            .flat_map(|clique| clique.children().iter().copied())
            .filter(|child| !affected.contains(child))
            .collect();

        // Factors over un-eliminated keys only bypass the subproblem.
        let (outer, touching): (Vec<HybridFactor>, Vec<HybridFactor>) =
            new_factors.iter().cloned().partition(|factor| {
                factor
                    .keys()
                    .iter()
                    .all(|&k| self.position(k).is_none() && !new_keys.contains(&k))
            });

        let mut originals: Vec<HybridFactor> = Vec::new();
        let mut frontals: Vec<Key> = Vec::new();
        for &id in &affected_ids {
            let clique = self.live(id)?;
            originals.extend(clique.original_factors().iter().cloned());
            frontals.extend(clique.frontals().iter().copied());
        }
        originals.extend(touching);

        let mut messages = Vec::with_capacity(orphans.len());
        let mut orphan_separator_keys: FxHashSet<Key> = FxHashSet::default();
        for &orphan in &orphans {
            let clique = self.live(orphan)?;
            orphan_separator_keys.extend(clique.separator().iter().copied());
            messages.extend(clique.separator_factor_owned());
        }

        frontals.extend(new_keys.iter().copied());
        frontals.sort_by_key(|&k| {
            (
                domains.kind(k) == Some(KeyKind::Discrete),
                orphan_separator_keys.contains(&k),
                self.position(k).unwrap_or(usize::MAX),
                k,
            )
        });

        let config = *self.config();
        let result = eliminate_multifrontal(originals, messages, &frontals, &domains, &config)?;

        // Where each orphan goes, as indices into the new cliques.
        let mut local_clique_of: FxHashMap<Key, usize> = FxHashMap::default();
        for (index, clique) in result.cliques.iter().enumerate() {
            for &key in &clique.frontals {
                local_clique_of.insert(key, index);
            }
        }
        let rank: FxHashMap<Key, usize> =
            frontals.iter().enumerate().map(|(p, &k)| (k, p)).collect();
        let mut attachments = Vec::with_capacity(orphans.len());
        for &orphan in &orphans {
            let separator = self.live(orphan)?.separator();
            let target = separator
                .iter()
                .filter_map(|k| rank.get(k).map(|&r| (r, *k)))
                .min()
                .and_then(|(_, k)| local_clique_of.get(&k).copied())
                .ok_or_else(|| {
                    HybridError::Internal(format!(
                        "{} has no re-eliminated separator key",
                        orphan
                    ))
                })?;
            attachments.push((orphan, target));
        }

        // Subproblem outer factors come first in the remaining list; the
        // root separator factors after them belong to the new roots.
        let root_count = result
            .cliques
            .iter()
            .filter(|c| c.parent.is_none() && c.separator_factor.is_some())
            .count();
        let mut subproblem_outer = result.remaining;
        subproblem_outer.truncate(subproblem_outer.len() - root_count);

        #[cfg(feature = "tracing")]
        tracing::info!(
            "isam update: {} new factors, re-eliminated {} of {} cliques into {}, {} orphans",
            new_factors.len(),
            affected.len(),
            self.size(),
            result.cliques.len(),
            orphans.len()
        );

        self.set_domains(domains);
        self.remove_cliques(&affected);
        let ids = self.insert_cliques(result.cliques, &frontals)?;
        for (orphan, target) in attachments {
            let parent = ids[target];
            self.clique_mut(orphan)?.set_parent(Some(parent));
            self.clique_mut(parent)?.add_child(orphan);
            self.demote_root(orphan);
        }
        self.add_outer_factors(outer);
        self.add_outer_factors(subproblem_outer);
        Ok(())
    }

    /// Cliques whose frontal or separator keys meet `new_factors`, plus all
    /// of their ancestors.
    fn affected_cliques(&self, new_factors: &HybridFactorGraph) -> HybridResult<FxHashSet<CliqueId>> {
        let touched: FxHashSet<Key> = new_factors.keys().into_iter().collect();
        let mut seeds: Vec<CliqueId> = touched.iter().filter_map(|&k| self.clique_of(k)).collect();
        seeds.extend(
            self.cliques()
                .filter(|(_, clique)| clique.separator().iter().any(|k| touched.contains(k)))
                .map(|(id, _)| id),
        );

        let mut affected: FxHashSet<CliqueId> = FxHashSet::default();
        for seed in seeds {
            let mut cursor = Some(seed);
            while let Some(id) = cursor {
                if !affected.insert(id) {
                    break;
                }
                cursor = self.live(id)?.parent();
            }
        }
        Ok(affected)
    }
}
