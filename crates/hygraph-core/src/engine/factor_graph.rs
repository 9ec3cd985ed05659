//! The hybrid factor graph container.
//!
//! A [`HybridFactorGraph`] is an ordered list of [`HybridFactor`]s plus a
//! registry of every key's kind, cardinality (discrete) or dimension
//! (continuous). Additions that disagree with the registry are rejected, so
//! elimination never has to re-check scope consistency.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use rustc_hash::FxHashMap;

use crate::engine::decision_tree::DecisionTree;
use crate::engine::discrete::DiscreteFactor;
use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::gaussian::JacobianFactor;
use crate::engine::hybrid_factor::{HybridFactor, MixtureFactor};
use crate::engine::keys::{DiscreteKey, HybridValues, Key, KeyKind};

/// Kind, cardinality and dimension of every key seen so far.
#[derive(Debug, Clone, Default)]
pub(crate) struct KeyDomains {
    // (kind, dimension or cardinality)
    entries: FxHashMap<Key, (KeyKind, usize)>,
}

impl KeyDomains {
    pub(crate) fn kind(&self, key: Key) -> Option<KeyKind> {
        self.entries.get(&key).map(|&(kind, _)| kind)
    }

    pub(crate) fn discrete_key(&self, key: Key) -> Option<DiscreteKey> {
        match self.entries.get(&key) {
            Some(&(KeyKind::Discrete, cardinality)) => Some(DiscreteKey::new(key, cardinality)),
            _ => None,
        }
    }

    pub(crate) fn dim(&self, key: Key) -> Option<usize> {
        match self.entries.get(&key) {
            Some(&(KeyKind::Continuous, dim)) => Some(dim),
            _ => None,
        }
    }

    pub(crate) fn contains(&self, key: Key) -> bool {
        self.entries.contains_key(&key)
    }

    /// Checks `factor` against the registry and records its keys.
    ///
    /// Nothing is recorded when the check fails.
    pub(crate) fn admit(&mut self, factor: &HybridFactor) -> HybridResult<()> {
        let mut staged: Vec<(Key, KeyKind, usize)> = factor
            .continuous_dims()
            .into_iter()
            .map(|(key, dim)| (key, KeyKind::Continuous, dim))
            .collect();
        staged.extend(
            factor
                .discrete_keys()
                .iter()
                .map(|dk| (dk.key, KeyKind::Discrete, dk.cardinality)),
        );

        for (pos, &(key, kind, size)) in staged.iter().enumerate() {
            let known = self.entries.get(&key).copied();
            let earlier = staged[..pos]
                .iter()
                .find(|(k, _, _)| *k == key)
                .map(|&(_, k, s)| (k, s));
            for (existing_kind, existing_size) in known.into_iter().chain(earlier) {
                check_compatible(key, existing_kind, existing_size, kind, size)?;
            }
        }

        for (key, kind, size) in staged {
            self.entries.insert(key, (kind, size));
        }
        Ok(())
    }
}

fn check_compatible(
    key: Key,
    existing_kind: KeyKind,
    existing_size: usize,
    kind: KeyKind,
    size: usize,
) -> HybridResult<()> {
    if existing_kind != kind {
        return Err(HybridError::Structural(format!(
            "key {} is used as both a continuous and a discrete variable",
            key
        )));
    }
    if existing_size == size {
        return Ok(());
    }
    match kind {
        KeyKind::Discrete => Err(HybridError::DomainMismatch(format!(
            "discrete key {} declared with cardinality {} and {}",
            key, existing_size, size
        ))),
        KeyKind::Continuous => Err(HybridError::Structural(format!(
            "continuous key {} has dimension {} and {}",
            key, existing_size, size
        ))),
    }
}

/// An ordered collection of hybrid factors.
#[derive(Debug, Clone, Default)]
pub struct HybridFactorGraph {
    factors: Vec<HybridFactor>,
    domains: KeyDomains,
}

impl HybridFactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from factors, validating each addition.
    pub fn from_factors<I>(factors: I) -> HybridResult<Self>
    where
        I: IntoIterator<Item = HybridFactor>,
    {
        let mut graph = Self::new();
        for factor in factors {
            graph.add(factor)?;
        }
        Ok(graph)
    }

    /// Appends a factor and returns its index.
    pub fn add(&mut self, factor: impl Into<HybridFactor>) -> HybridResult<usize> {
        let factor = factor.into();
        self.domains.admit(&factor)?;
        self.factors.push(factor);
        Ok(self.factors.len() - 1)
    }

    /// Adds a table listed row-major over `keys`.
    pub fn add_discrete_factor(&mut self, keys: &[DiscreteKey], table: Vec<f64>) -> HybridResult<usize> {
        self.add(DiscreteFactor::new(keys, table)?)
    }

    /// Adds `½‖Σ A_k x_k − b‖²` with one block per key.
    pub fn add_continuous_factor(
        &mut self,
        keys: &[Key],
        blocks: Vec<DMatrix<f64>>,
        rhs: DVector<f64>,
    ) -> HybridResult<usize> {
        if keys.len() != blocks.len() {
            return Err(HybridError::Validation(format!(
                "{} keys but {} jacobian blocks",
                keys.len(),
                blocks.len()
            )));
        }
        let terms = keys.iter().copied().zip(blocks).collect();
        self.add(JacobianFactor::new(terms, rhs)?)
    }

    /// Adds a mixture with one Jacobian factor per assignment of `discrete_keys`.
    pub fn add_mixture_factor(
        &mut self,
        continuous_keys: &[Key],
        discrete_keys: &[DiscreteKey],
        components: DecisionTree<JacobianFactor>,
    ) -> HybridResult<usize> {
        self.add(MixtureFactor::new(continuous_keys, discrete_keys, components)?)
    }

    pub(crate) fn domains(&self) -> &KeyDomains {
        &self.domains
    }

    pub(crate) fn with_domains(factors: Vec<HybridFactor>, domains: KeyDomains) -> Self {
        Self { factors, domains }
    }

    /// Removes and returns every factor involving `key`.
    pub fn extract_involving(&mut self, key: Key) -> Vec<HybridFactor> {
        self.extract_where(|factor| factor.involves(key))
    }

    /// Removes and returns every factor matching `predicate`, keeping the
    /// relative order of the rest.
    pub fn extract_where<P>(&mut self, mut predicate: P) -> Vec<HybridFactor>
    where
        P: FnMut(&HybridFactor) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.factors).into_iter().partition(|f| predicate(f));
        self.factors = kept;
        taken
    }

    /// Sorted union of all factor scopes.
    pub fn keys(&self) -> Vec<Key> {
        let keys: BTreeSet<Key> = self.factors.iter().flat_map(HybridFactor::keys).collect();
        keys.into_iter().collect()
    }

    pub fn continuous_keys(&self) -> Vec<Key> {
        let keys: BTreeSet<Key> = self
            .factors
            .iter()
            .flat_map(|f| f.continuous_keys().iter().copied())
            .collect();
        keys.into_iter().collect()
    }

    pub fn discrete_keys(&self) -> Vec<DiscreteKey> {
        let keys: BTreeSet<DiscreteKey> = self
            .factors
            .iter()
            .flat_map(|f| f.discrete_keys().iter().copied())
            .collect();
        keys.into_iter().collect()
    }

    pub fn kind(&self, key: Key) -> Option<KeyKind> {
        self.domains.kind(key)
    }

    pub fn dim(&self, key: Key) -> Option<usize> {
        self.domains.dim(key)
    }

    pub fn cardinality(&self, key: Key) -> Option<usize> {
        self.domains.discrete_key(key).map(|dk| dk.cardinality)
    }

    /// Sum of factor errors (negative log of the unnormalized joint).
    pub fn error(&self, values: &HybridValues) -> HybridResult<f64> {
        self.factors.iter().map(|f| f.error(values)).sum()
    }

    /// Product of factor values.
    pub fn evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.factors
            .iter()
            .try_fold(1.0, |acc, f| Ok(acc * f.evaluate(values)?))
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HybridFactor> {
        self.factors.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HybridFactor> {
        self.factors.iter()
    }

    pub fn factors(&self) -> &[HybridFactor] {
        &self.factors
    }
}

impl<'a> IntoIterator for &'a HybridFactorGraph {
    type Item = &'a HybridFactor;
    type IntoIter = std::slice::Iter<'a, HybridFactor>;

    fn into_iter(self) -> Self::IntoIter {
        self.factors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(i: u64) -> Key {
        Key::symbol('x', i)
    }

    fn c(i: u64) -> Key {
        Key::symbol('c', i)
    }

    fn eye(n: usize) -> DMatrix<f64> {
        DMatrix::identity(n, n)
    }

    #[test]
    fn add_returns_indices_and_tracks_scope() {
        let mut graph = HybridFactorGraph::new();
        assert_eq!(
            graph
                .add_continuous_factor(&[x(0)], vec![eye(2)], DVector::zeros(2))
                .expect("prior"),
            0
        );
        assert_eq!(
            graph
                .add_discrete_factor(&[DiscreteKey::new(c(1), 3)], vec![1.0, 2.0, 3.0])
                .expect("table"),
            1
        );
        assert_eq!(graph.keys(), vec![c(1), x(0)]);
        assert_eq!(graph.dim(x(0)), Some(2));
        assert_eq!(graph.cardinality(c(1)), Some(3));
        assert_eq!(graph.kind(c(1)), Some(KeyKind::Discrete));
    }

    #[test]
    fn inconsistent_additions_are_rejected() {
        let mut graph = HybridFactorGraph::new();
        graph
            .add_discrete_factor(&[DiscreteKey::new(c(1), 2)], vec![1.0, 1.0])
            .expect("table");
        graph
            .add_continuous_factor(&[x(0)], vec![eye(2)], DVector::zeros(2))
            .expect("prior");

        assert!(matches!(
            graph.add_discrete_factor(&[DiscreteKey::new(c(1), 3)], vec![1.0; 3]),
            Err(HybridError::DomainMismatch(_))
        ));
        assert!(matches!(
            graph.add_continuous_factor(&[x(0)], vec![eye(3)], DVector::zeros(3)),
            Err(HybridError::Structural(_))
        ));
        assert!(matches!(
            graph.add_continuous_factor(&[c(1)], vec![eye(1)], DVector::zeros(1)),
            Err(HybridError::Structural(_))
        ));
        assert!(matches!(
            graph.add_continuous_factor(&[x(0), x(1)], vec![eye(2)], DVector::zeros(2)),
            Err(HybridError::Validation(_))
        ));
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn extract_involving_removes_touching_factors() {
        let mut graph = HybridFactorGraph::new();
        graph
            .add_continuous_factor(&[x(0)], vec![eye(1)], DVector::zeros(1))
            .expect("prior");
        graph
            .add_continuous_factor(&[x(0), x(1)], vec![eye(1), -eye(1)], DVector::zeros(1))
            .expect("between");
        graph
            .add_continuous_factor(&[x(2)], vec![eye(1)], DVector::zeros(1))
            .expect("other");

        let pulled = graph.extract_involving(x(0));
        assert_eq!(pulled.len(), 2);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.keys(), vec![x(2)]);
    }

    #[test]
    fn graph_error_sums_factor_errors() {
        let mut graph = HybridFactorGraph::new();
        graph
            .add_continuous_factor(&[x(0)], vec![eye(1)], DVector::from_element(1, 1.0))
            .expect("prior");
        graph
            .add_discrete_factor(&[DiscreteKey::new(c(0), 2)], vec![0.25, 0.75])
            .expect("table");
        let mut values = HybridValues::new();
        values.insert_continuous(x(0), DVector::from_element(1, 3.0));
        values.insert_discrete(c(0), 0);

        let error = graph.error(&values).expect("error");
        assert!((error - (2.0 + 4f64.ln())).abs() < 1e-12);
        let value = graph.evaluate(&values).expect("value");
        assert!((value - 0.25 * (-2.0f64).exp()).abs() < 1e-12);
    }
}
