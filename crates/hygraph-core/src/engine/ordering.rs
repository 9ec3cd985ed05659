//! Elimination orderings.
//!
//! An [`Ordering`] is a sequence of keys plus an optional set of keys pinned
//! to be eliminated last (typically the discrete modes). It may cover every
//! key of a graph (full elimination) or a subset (partial elimination).

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::FxHashSet;

use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::factor_graph::{HybridFactorGraph, KeyDomains};
use crate::engine::keys::Key;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ordering {
    keys: Vec<Key>,
    last: Vec<Key>,
}

impl Ordering {
    pub fn new<I: IntoIterator<Item = Key>>(keys: I) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            last: Vec::new(),
        }
    }

    /// Pins `keys` to the end of the ordering, in the given order. Pinned keys
    /// missing from the ordering are appended.
    pub fn with_last<I: IntoIterator<Item = Key>>(mut self, keys: I) -> Self {
        self.last.extend(keys);
        self
    }

    /// Appends keys after the current ones.
    pub fn then<I: IntoIterator<Item = Key>>(mut self, keys: I) -> Self {
        self.keys.extend(keys);
        self
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn constrained_last(&self) -> &[Key] {
        &self.last
    }

    /// Continuous keys in key order, then discrete keys in key order.
    pub fn natural(graph: &HybridFactorGraph) -> Self {
        Self::new(graph.continuous_keys())
            .then(graph.discrete_keys().into_iter().map(|dk| dk.key))
    }

    /// Greedy minimum-degree ordering over the variable adjacency graph.
    pub fn min_degree(graph: &HybridFactorGraph) -> Self {
        Self::min_degree_constrained_last(graph, &[])
    }

    /// Minimum-degree ordering of the unconstrained keys, followed by a
    /// minimum-degree ordering of `last` on the graph left after eliminating
    /// the others. Ties break by key.
    pub fn min_degree_constrained_last(graph: &HybridFactorGraph, last: &[Key]) -> Self {
        let last: BTreeSet<Key> = last.iter().copied().collect();
        let mut adjacency: BTreeMap<Key, BTreeSet<Key>> = BTreeMap::new();
        for factor in graph {
            let keys = factor.keys();
            for &key in &keys {
                adjacency
                    .entry(key)
                    .or_default()
                    .extend(keys.iter().copied().filter(|&k| k != key));
            }
        }

        let mut order = Vec::with_capacity(adjacency.len());
        loop {
            let free_left = adjacency.keys().any(|k| !last.contains(k));
            let pick = adjacency
                .iter()
                .filter(|(k, _)| !free_left || !last.contains(k))
                .min_by_key(|(k, neighbors)| (neighbors.len(), **k))
                .map(|(k, _)| *k);
            let Some(key) = pick else { break };

            let neighbors = adjacency.remove(&key).unwrap_or_default();
            for n in &neighbors {
                if let Some(set) = adjacency.get_mut(n) {
                    set.remove(&key);
                    set.extend(neighbors.iter().copied().filter(|m| m != n));
                }
            }
            order.push(key);
        }
        Self::new(order)
    }

    /// Continuous keys by minimum degree, then discrete keys.
    pub fn discrete_last(graph: &HybridFactorGraph) -> Self {
        let discrete: Vec<Key> = graph.discrete_keys().into_iter().map(|dk| dk.key).collect();
        Self::min_degree_constrained_last(graph, &discrete)
    }

    /// Nested-dissection ordering of a chain: the middle key of every range is
    /// eliminated after both halves, deepest level first.
    ///
    /// For a chain this yields a balanced elimination tree.
    pub fn binary(keys: &[Key]) -> Self {
        let mut depths = vec![0usize; keys.len()];
        let mut ranges = vec![(0usize, keys.len(), 0usize)];
        while let Some((lo, hi, depth)) = ranges.pop() {
            if lo >= hi {
                continue;
            }
            let mid = (lo + hi) / 2;
            depths[mid] = depth;
            ranges.push((lo, mid, depth + 1));
            ranges.push((mid + 1, hi, depth + 1));
        }
        let mut positions: Vec<usize> = (0..keys.len()).collect();
        positions.sort_by_key(|&p| (std::cmp::Reverse(depths[p]), p));
        Self::new(positions.into_iter().map(|p| keys[p]))
    }

    /// Resolves the elimination sequence against a graph.
    ///
    /// Fails with [`HybridError::Structural`] if a key is unknown to the graph
    /// or listed twice.
    pub fn resolve(&self, graph: &HybridFactorGraph) -> HybridResult<Vec<Key>> {
        self.resolve_in(graph.domains())
    }

    pub(crate) fn resolve_in(&self, domains: &KeyDomains) -> HybridResult<Vec<Key>> {
        let pinned: FxHashSet<Key> = self.last.iter().copied().collect();
        let mut pinned_seen: FxHashSet<Key> = FxHashSet::default();
        for &key in self.keys.iter().filter(|k| pinned.contains(k)) {
            if !pinned_seen.insert(key) {
                return Err(HybridError::Structural(format!(
                    "ordering lists {} more than once",
                    key
                )));
            }
        }

        let mut seen: FxHashSet<Key> = FxHashSet::default();
        let mut resolved = Vec::with_capacity(self.keys.len() + self.last.len());

        for &key in self.keys.iter().filter(|k| !pinned.contains(k)).chain(self.last.iter()) {
            if !domains.contains(key) {
                return Err(HybridError::Structural(format!(
                    "ordering references {} which is not in the graph",
                    key
                )));
            }
            if !seen.insert(key) {
                return Err(HybridError::Structural(format!(
                    "ordering lists {} more than once",
                    key
                )));
            }
            resolved.push(key);
        }
        Ok(resolved)
    }
}

impl FromIterator<Key> for Ordering {
    fn from_iter<I: IntoIterator<Item = Key>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::keys::DiscreteKey;
    use nalgebra::{DMatrix, DVector};

    fn x(i: u64) -> Key {
        Key::symbol('x', i)
    }

    fn chain(n: u64) -> HybridFactorGraph {
        let mut graph = HybridFactorGraph::new();
        let one = || DMatrix::identity(1, 1);
        graph
            .add_continuous_factor(&[x(0)], vec![one()], DVector::zeros(1))
            .expect("prior");
        for i in 0..n - 1 {
            graph
                .add_continuous_factor(&[x(i), x(i + 1)], vec![one(), -one()], DVector::zeros(1))
                .expect("between");
        }
        graph
    }

    #[test]
    fn binary_ordering_is_deepest_level_first() {
        let keys: Vec<Key> = (0..7).map(x).collect();
        let ordering = Ordering::binary(&keys);
        let expected: Vec<Key> = [0, 2, 4, 6, 1, 5, 3].into_iter().map(x).collect();
        assert_eq!(ordering.keys(), expected.as_slice());
    }

    #[test]
    fn resolve_moves_pinned_keys_last() {
        let graph = chain(3);
        let ordering = Ordering::new([x(0), x(1), x(2)]).with_last([x(0)]);
        assert_eq!(ordering.resolve(&graph).expect("resolve"), vec![x(1), x(2), x(0)]);
    }

    #[test]
    fn resolve_rejects_unknown_and_duplicate_keys() {
        let graph = chain(2);
        assert!(matches!(
            Ordering::new([x(0), x(9)]).resolve(&graph),
            Err(HybridError::Structural(_))
        ));
        assert!(matches!(
            Ordering::new([x(0), x(0)]).resolve(&graph),
            Err(HybridError::Structural(_))
        ));
    }

    #[test]
    fn resolve_rejects_pinned_key_listed_twice() {
        let graph = chain(3);
        let ordering = Ordering::new([x(0), x(0)]).with_last([x(0), x(1)]);
        assert!(matches!(
            ordering.resolve(&graph),
            Err(HybridError::Structural(_))
        ));
    }

    #[test]
    fn min_degree_starts_at_chain_ends() {
        let graph = chain(4);
        let ordering = Ordering::min_degree(&graph);
        assert_eq!(ordering.keys().len(), 4);
        assert_eq!(ordering.keys()[0], x(0));
    }

    #[test]
    fn discrete_last_pins_modes() {
        let mut graph = chain(2);
        let mode = DiscreteKey::new(Key::symbol('c', 0), 2);
        graph.add_discrete_factor(&[mode], vec![1.0, 1.0]).expect("table");
        let ordering = Ordering::discrete_last(&graph);
        assert_eq!(ordering.keys().last(), Some(&mode.key));
        assert_eq!(Ordering::natural(&graph).keys().last(), Some(&mode.key));
    }
}
