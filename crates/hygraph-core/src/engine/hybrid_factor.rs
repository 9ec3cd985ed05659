//! Mixture factors and the closed set of hybrid factor variants.

use std::collections::BTreeSet;

use crate::engine::conditional::{GaussianMixture, HybridConditional};
use crate::engine::decision_tree::DecisionTree;
use crate::engine::discrete::DiscreteFactor;
use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::gaussian::{format_keys, JacobianFactor};
use crate::engine::keys::{merge_discrete_keys, Assignment, DiscreteKey, HybridValues, Key};

/// A continuous factor whose form is selected by discrete modes: one
/// [`JacobianFactor`] per joint assignment of the discrete keys, all over the
/// same continuous keys.
#[derive(Debug, Clone, PartialEq)]
pub struct MixtureFactor {
    continuous_keys: Vec<Key>,
    discrete_keys: Vec<DiscreteKey>,
    components: DecisionTree<JacobianFactor>,
}

impl MixtureFactor {
    /// Wraps a tree of components.
    ///
    /// The tree may branch on a subset of `discrete_keys` only, and every
    /// component must cover exactly `continuous_keys` with consistent
    /// dimensions.
    pub fn new(
        continuous_keys: &[Key],
        discrete_keys: &[DiscreteKey],
        components: DecisionTree<JacobianFactor>,
    ) -> HybridResult<Self> {
        components.validate_shape()?;
        let discrete_keys = merge_discrete_keys(discrete_keys, &[])?;
        let branched = merge_discrete_keys(&discrete_keys, &components.discrete_keys())?;
        if branched.len() != discrete_keys.len() {
            return Err(HybridError::Structural(
                "mixture components branch on keys outside the declared discrete keys".into(),
            ));
        }

        let expected: BTreeSet<Key> = continuous_keys.iter().copied().collect();
        if expected.len() != continuous_keys.len() {
            return Err(HybridError::Structural(format!(
                "mixture lists a continuous key twice in {}",
                format_keys(continuous_keys)
            )));
        }
        let leaves = components.leaves();
        let Some(&reference) = leaves.first() else {
            return Err(HybridError::Structural("mixture has no components".into()));
        };
        for leaf in &leaves {
            let keys: BTreeSet<Key> = leaf.keys().iter().copied().collect();
            if keys != expected {
                return Err(HybridError::Structural(format!(
                    "mixture component over {} does not match continuous keys {}",
                    format_keys(leaf.keys()),
                    format_keys(continuous_keys)
                )));
            }
            for &key in continuous_keys {
                if leaf.dim(key) != reference.dim(key) {
                    return Err(HybridError::Structural(format!(
                        "mixture components disagree on the dimension of {}",
                        key
                    )));
                }
            }
        }

        Ok(Self {
            continuous_keys: continuous_keys.to_vec(),
            discrete_keys,
            components,
        })
    }

    /// Builds a mixture from one component per assignment, listed row-major
    /// over `discrete_keys`.
    pub fn from_factors(
        continuous_keys: &[Key],
        discrete_keys: &[DiscreteKey],
        factors: Vec<JacobianFactor>,
    ) -> HybridResult<Self> {
        let components = DecisionTree::from_values(discrete_keys, factors)?;
        Self::new(continuous_keys, discrete_keys, components)
    }

    pub fn continuous_keys(&self) -> &[Key] {
        &self.continuous_keys
    }

    pub fn discrete_keys(&self) -> &[DiscreteKey] {
        &self.discrete_keys
    }

    pub fn components(&self) -> &DecisionTree<JacobianFactor> {
        &self.components
    }

    pub fn dim(&self, key: Key) -> Option<usize> {
        self.components.leaves().first().and_then(|leaf| leaf.dim(key))
    }

    /// The component selected by `assignment`.
    pub fn select(&self, assignment: &Assignment) -> HybridResult<&JacobianFactor> {
        self.components.evaluate(assignment)
    }

    pub fn error(&self, values: &HybridValues) -> HybridResult<f64> {
        self.select(&values.discrete)?.error(values)
    }
}

/// Each component is the factor form of the matching conditional, so the
/// mixture evaluates to the mixture density.
impl From<GaussianMixture> for MixtureFactor {
    fn from(mixture: GaussianMixture) -> Self {
        let continuous_keys = mixture
            .frontals()
            .iter()
            .chain(mixture.continuous_parents())
            .copied()
            .collect();
        Self {
            continuous_keys,
            discrete_keys: mixture.discrete_parents().to_vec(),
            components: mixture
                .conditionals()
                .map(|conditional| JacobianFactor::from(conditional.clone())),
        }
    }
}

/// Any factor of a hybrid graph.
#[derive(Debug, Clone, PartialEq)]
pub enum HybridFactor {
    /// Potential table over discrete keys.
    Discrete(DiscreteFactor),
    /// Linear Gaussian factor over continuous keys.
    Continuous(JacobianFactor),
    /// Gaussian components indexed by discrete modes.
    Mixture(MixtureFactor),
}

impl HybridFactor {
    pub fn continuous_keys(&self) -> &[Key] {
        match self {
            HybridFactor::Discrete(_) => &[],
            HybridFactor::Continuous(f) => f.keys(),
            HybridFactor::Mixture(m) => m.continuous_keys(),
        }
    }

    pub fn discrete_keys(&self) -> &[DiscreteKey] {
        match self {
            HybridFactor::Discrete(f) => f.keys(),
            HybridFactor::Continuous(_) => &[],
            HybridFactor::Mixture(m) => m.discrete_keys(),
        }
    }

    /// Continuous keys followed by discrete keys.
    pub fn keys(&self) -> Vec<Key> {
        self.continuous_keys()
            .iter()
            .copied()
            .chain(self.discrete_keys().iter().map(|dk| dk.key))
            .collect()
    }

    pub fn involves(&self, key: Key) -> bool {
        self.continuous_keys().contains(&key) || self.discrete_keys().iter().any(|dk| dk.key == key)
    }

    /// `(key, dimension)` of every continuous key.
    pub fn continuous_dims(&self) -> Vec<(Key, usize)> {
        match self {
            HybridFactor::Discrete(_) => Vec::new(),
            HybridFactor::Continuous(f) => f.blocks().map(|(k, b)| (k, b.ncols())).collect(),
            HybridFactor::Mixture(m) => m
                .continuous_keys()
                .iter()
                .filter_map(|&k| m.dim(k).map(|d| (k, d)))
                .collect(),
        }
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, HybridFactor::Discrete(_))
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, HybridFactor::Continuous(_))
    }

    pub fn is_mixture(&self) -> bool {
        matches!(self, HybridFactor::Mixture(_))
    }

    /// Negative log of the factor value (`+∞` for a zero table entry).
    pub fn error(&self, values: &HybridValues) -> HybridResult<f64> {
        match self {
            HybridFactor::Discrete(f) => Ok(-f.evaluate(&values.discrete)?.ln()),
            HybridFactor::Continuous(f) => f.error(values),
            HybridFactor::Mixture(m) => m.error(values),
        }
    }

    pub fn evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        match self {
            HybridFactor::Discrete(f) => f.evaluate(&values.discrete),
            HybridFactor::Continuous(f) => f.evaluate(values),
            HybridFactor::Mixture(m) => m.error(values).map(|e| (-e).exp()),
        }
    }
}

impl From<DiscreteFactor> for HybridFactor {
    fn from(factor: DiscreteFactor) -> Self {
        HybridFactor::Discrete(factor)
    }
}

impl From<JacobianFactor> for HybridFactor {
    fn from(factor: JacobianFactor) -> Self {
        HybridFactor::Continuous(factor)
    }
}

impl From<MixtureFactor> for HybridFactor {
    fn from(factor: MixtureFactor) -> Self {
        HybridFactor::Mixture(factor)
    }
}

/// Feeds an eliminated conditional back into a graph.
impl From<HybridConditional> for HybridFactor {
    fn from(conditional: HybridConditional) -> Self {
        match conditional {
            HybridConditional::Gaussian(c) => HybridFactor::Continuous(c.into()),
            HybridConditional::Mixture(m) => HybridFactor::Mixture(m.into()),
            HybridConditional::Discrete(d) => HybridFactor::Discrete(d.into()),
        }
    }
}
