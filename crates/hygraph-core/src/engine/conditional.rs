//! Conditionals produced by elimination.

use nalgebra::DVector;

use crate::engine::decision_tree::DecisionTree;
use crate::engine::discrete::DiscreteConditional;
use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::gaussian::GaussianConditional;
use crate::engine::keys::{merge_discrete_keys, Assignment, DiscreteKey, HybridValues, Key};

/// Gaussian conditionals indexed by discrete parents.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    frontals: Vec<Key>,
    continuous_parents: Vec<Key>,
    discrete_parents: Vec<DiscreteKey>,
    conditionals: DecisionTree<GaussianConditional>,
}

impl GaussianMixture {
    /// All leaves must share frontal and continuous parent keys.
    pub fn new(
        discrete_parents: &[DiscreteKey],
        conditionals: DecisionTree<GaussianConditional>,
    ) -> HybridResult<Self> {
        conditionals.validate_shape()?;
        let discrete_parents = merge_discrete_keys(discrete_parents, &conditionals.discrete_keys())?;
        let leaves = conditionals.leaves();
        let Some(reference) = leaves.first() else {
            return Err(HybridError::Structural(
                "gaussian mixture has no components".into(),
            ));
        };
        let frontals = reference.frontal_keys();
        let continuous_parents = reference.parent_keys();
        if leaves
            .iter()
            .any(|c| c.frontal_keys() != frontals || c.parent_keys() != continuous_parents)
        {
            return Err(HybridError::Structural(
                "gaussian mixture components disagree on their keys".into(),
            ));
        }
        Ok(Self {
            frontals,
            continuous_parents,
            discrete_parents,
            conditionals,
        })
    }

    pub fn frontals(&self) -> &[Key] {
        &self.frontals
    }

    pub fn continuous_parents(&self) -> &[Key] {
        &self.continuous_parents
    }

    pub fn discrete_parents(&self) -> &[DiscreteKey] {
        &self.discrete_parents
    }

    pub fn conditionals(&self) -> &DecisionTree<GaussianConditional> {
        &self.conditionals
    }

    pub fn select(&self, assignment: &Assignment) -> HybridResult<&GaussianConditional> {
        self.conditionals.evaluate(assignment)
    }

    pub fn log_evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.select(&values.discrete)?.log_evaluate(values)
    }

    pub fn evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.log_evaluate(values).map(f64::exp)
    }
}

/// Any conditional of a hybrid Bayes net or Bayes tree clique.
#[derive(Debug, Clone, PartialEq)]
pub enum HybridConditional {
    /// `p(x_F | x_S)`
    Gaussian(GaussianConditional),
    /// `p(x_F | x_S, m)`
    Mixture(GaussianMixture),
    /// `P(m_F | m_S)`
    Discrete(DiscreteConditional),
}

impl HybridConditional {
    pub fn frontal_keys(&self) -> Vec<Key> {
        match self {
            HybridConditional::Gaussian(c) => c.frontal_keys(),
            HybridConditional::Mixture(m) => m.frontals().to_vec(),
            HybridConditional::Discrete(d) => d.frontals().iter().map(|dk| dk.key).collect(),
        }
    }

    pub fn continuous_parents(&self) -> Vec<Key> {
        match self {
            HybridConditional::Gaussian(c) => c.parent_keys(),
            HybridConditional::Mixture(m) => m.continuous_parents().to_vec(),
            HybridConditional::Discrete(_) => Vec::new(),
        }
    }

    pub fn discrete_parents(&self) -> Vec<DiscreteKey> {
        match self {
            HybridConditional::Gaussian(_) => Vec::new(),
            HybridConditional::Mixture(m) => m.discrete_parents().to_vec(),
            HybridConditional::Discrete(d) => d.parents().to_vec(),
        }
    }

    pub fn is_continuous(&self) -> bool {
        matches!(self, HybridConditional::Gaussian(_))
    }

    pub fn is_hybrid(&self) -> bool {
        matches!(self, HybridConditional::Mixture(_))
    }

    pub fn is_discrete(&self) -> bool {
        matches!(self, HybridConditional::Discrete(_))
    }

    pub fn as_gaussian(&self) -> Option<&GaussianConditional> {
        match self {
            HybridConditional::Gaussian(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_mixture(&self) -> Option<&GaussianMixture> {
        match self {
            HybridConditional::Mixture(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_discrete(&self) -> Option<&DiscreteConditional> {
        match self {
            HybridConditional::Discrete(d) => Some(d),
            _ => None,
        }
    }

    pub fn log_evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        match self {
            HybridConditional::Gaussian(c) => c.log_evaluate(values),
            HybridConditional::Mixture(m) => m.log_evaluate(values),
            HybridConditional::Discrete(d) => d.evaluate(&values.discrete).map(f64::ln),
        }
    }

    /// Density (continuous) or probability (discrete) of the frontal values
    /// given the parent values.
    pub fn evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        match self {
            HybridConditional::Discrete(d) => d.evaluate(&values.discrete),
            _ => self.log_evaluate(values).map(f64::exp),
        }
    }

    /// Back-substitutes the continuous frontals; discrete conditionals solve
    /// nothing.
    pub(crate) fn solve(&self, values: &HybridValues) -> HybridResult<Vec<(Key, DVector<f64>)>> {
        match self {
            HybridConditional::Gaussian(c) => c.solve(values),
            HybridConditional::Mixture(m) => m.select(&values.discrete)?.solve(values),
            HybridConditional::Discrete(_) => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::gaussian::{eliminate_gaussian, JacobianFactor};
    use nalgebra::DMatrix;

    fn x(i: u64) -> Key {
        Key::symbol('x', i)
    }

    fn conditional_with_mean(mean: f64) -> GaussianConditional {
        let prior = JacobianFactor::unary(
            x(0),
            DMatrix::from_element(1, 1, 1.0),
            DVector::from_element(1, mean),
        )
        .expect("prior");
        eliminate_gaussian(&[&prior], &[x(0)], 1e-9).expect("eliminate").0
    }

    #[test]
    fn mixture_selects_conditional_by_mode() {
        let mode = DiscreteKey::new(Key::symbol('c', 0), 2);
        let tree = DecisionTree::from_values(
            &[mode],
            vec![conditional_with_mean(0.0), conditional_with_mean(5.0)],
        )
        .expect("tree");
        let conditional = HybridConditional::Mixture(GaussianMixture::new(&[mode], tree).expect("mixture"));

        assert_eq!(conditional.frontal_keys(), vec![x(0)]);
        assert_eq!(conditional.discrete_parents(), vec![mode]);

        let mut values = HybridValues::new();
        values.insert_continuous(x(0), DVector::from_element(1, 5.0));
        values.insert_discrete(mode.key, 1);
        let peak = (2.0 * std::f64::consts::PI).sqrt().recip();
        assert!((conditional.evaluate(&values).expect("density") - peak).abs() < 1e-12);

        let solved = conditional.solve(&values).expect("solve");
        assert!((solved[0].1[0] - 5.0).abs() < 1e-12);

        values.discrete = Assignment::new();
        assert!(matches!(
            conditional.evaluate(&values),
            Err(HybridError::OutOfScope(_))
        ));
    }
}
