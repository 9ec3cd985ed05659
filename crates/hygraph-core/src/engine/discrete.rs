//! Discrete factors (potential tables) and discrete conditionals.

use crate::engine::decision_tree::DecisionTree;
use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::keys::{
    assignment_count, assignments, merge_discrete_keys, Assignment, DiscreteKey, Key,
};

/// A non-negative potential table over a set of discrete keys.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscreteFactor {
    keys: Vec<DiscreteKey>,
    table: DecisionTree<f64>,
}

impl DiscreteFactor {
    /// Builds a table from entries listed row-major over `keys` (first key
    /// varies slowest).
    pub fn new(keys: &[DiscreteKey], values: Vec<f64>) -> HybridResult<Self> {
        validate_potentials(&values)?;
        let table = DecisionTree::from_values(keys, values)?;
        Ok(Self {
            keys: merge_discrete_keys(keys, &[])?,
            table,
        })
    }

    /// Parses a whitespace separated table, e.g. `"1 2 3 4"`.
    pub fn from_spec(keys: &[DiscreteKey], spec: &str) -> HybridResult<Self> {
        let values = spec
            .split_whitespace()
            .map(|token| {
                token.parse::<f64>().map_err(|_| {
                    HybridError::Validation(format!("invalid table entry '{}'", token))
                })
            })
            .collect::<HybridResult<Vec<f64>>>()?;
        Self::new(keys, values)
    }

    /// Wraps an existing tree; the tree may be constant in some of `keys`.
    pub fn from_tree(keys: &[DiscreteKey], table: DecisionTree<f64>) -> HybridResult<Self> {
        table.validate_shape()?;
        let keys = merge_discrete_keys(keys, &[])?;
        let tree_keys = table.discrete_keys();
        let merged = merge_discrete_keys(&keys, &tree_keys)?;
        if merged.len() != keys.len() {
            return Err(HybridError::Structural(
                "discrete table branches on keys outside its declared scope".into(),
            ));
        }
        let leaves: Vec<f64> = table.leaves().into_iter().copied().collect();
        validate_potentials(&leaves)?;
        Ok(Self { keys, table })
    }

    /// A factor with no keys and the given constant potential.
    pub fn constant(value: f64) -> HybridResult<Self> {
        validate_potentials(&[value])?;
        Ok(Self {
            keys: Vec::new(),
            table: DecisionTree::leaf(value),
        })
    }

    pub fn keys(&self) -> &[DiscreteKey] {
        &self.keys
    }

    pub fn involves(&self, key: Key) -> bool {
        self.keys.iter().any(|dk| dk.key == key)
    }

    pub fn table(&self) -> &DecisionTree<f64> {
        &self.table
    }

    pub fn evaluate(&self, assignment: &Assignment) -> HybridResult<f64> {
        self.table.evaluate(assignment).copied()
    }

    /// Pointwise product over the union of both scopes.
    pub fn multiply(&self, other: &DiscreteFactor) -> HybridResult<DiscreteFactor> {
        Ok(DiscreteFactor {
            keys: merge_discrete_keys(&self.keys, &other.keys)?,
            table: self.table.combine(&other.table, |a, b| a * b)?,
        })
    }

    /// Sums the given keys out of the table.
    pub fn sum_out(&self, keys: &[DiscreteKey]) -> HybridResult<DiscreteFactor> {
        let mut table = self.table.clone();
        for dk in keys {
            table = table.reduce(*dk, |a, b| a + b)?;
        }
        let remaining = self
            .keys
            .iter()
            .copied()
            .filter(|dk| !keys.iter().any(|k| k.key == dk.key))
            .collect();
        Ok(DiscreteFactor {
            keys: remaining,
            table,
        })
    }

    pub fn max_value(&self) -> f64 {
        self.table
            .leaves()
            .into_iter()
            .copied()
            .fold(0.0_f64, f64::max)
    }

    /// Rescales the table so its largest entry is 1 (tables that are all
    /// zero are returned unchanged).
    pub fn normalized_to_max(&self) -> DiscreteFactor {
        let max = self.max_value();
        if max <= 0.0 {
            return self.clone();
        }
        DiscreteFactor {
            keys: self.keys.clone(),
            table: self.table.map(|v| v / max),
        }
    }
}

/// `P(frontals | parents)` as a decision tree of probabilities.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscreteConditional {
    frontals: Vec<DiscreteKey>,
    parents: Vec<DiscreteKey>,
    table: DecisionTree<f64>,
}

impl DiscreteConditional {
    /// Splits a joint table into `P(frontals | rest)` and the marginal over
    /// the rest.
    ///
    /// Where the marginal is zero the conditional is uniform over the
    /// frontal domain.
    pub fn from_joint(
        joint: &DiscreteFactor,
        frontals: &[DiscreteKey],
    ) -> HybridResult<(DiscreteConditional, DiscreteFactor)> {
        let frontals = merge_discrete_keys(frontals, &[])?;
        merge_discrete_keys(joint.keys(), &frontals)?;

        let marginal = joint.sum_out(&frontals)?;
        let frontal_domain = assignment_count(&frontals)?;
        let uniform = 1.0 / frontal_domain as f64;
        let table = joint.table.combine(&marginal.table, |&j, &m| {
            if m > 0.0 {
                j / m
            } else {
                uniform
            }
        })?;

        let conditional = DiscreteConditional {
            parents: marginal.keys().to_vec(),
            frontals,
            table,
        };
        Ok((conditional, marginal))
    }

    pub fn frontals(&self) -> &[DiscreteKey] {
        &self.frontals
    }

    pub fn parents(&self) -> &[DiscreteKey] {
        &self.parents
    }

    pub fn table(&self) -> &DecisionTree<f64> {
        &self.table
    }

    /// Probability of the frontal values in `assignment` given its parent values.
    pub fn evaluate(&self, assignment: &Assignment) -> HybridResult<f64> {
        for dk in self.frontals.iter().chain(self.parents.iter()) {
            assignment.value_of(*dk)?;
        }
        self.table.evaluate(assignment).copied()
    }

    /// Most probable frontal assignment given parent values.
    pub fn argmax(&self, parent_values: &Assignment) -> HybridResult<Assignment> {
        let mut best: Option<(f64, Assignment)> = None;
        for frontal in assignments(&self.frontals) {
            let mut full = parent_values.restricted_to(&self.parents);
            for (key, value) in frontal.iter() {
                full.insert(key, value);
            }
            let p = self.evaluate(&full)?;
            if best.as_ref().map_or(true, |(best_p, _)| p > *best_p) {
                best = Some((p, frontal));
            }
        }
        best.map(|(_, a)| a)
            .ok_or_else(|| HybridError::Internal("discrete conditional has no frontal values".into()))
    }
}

/// The conditional's probability table as a potential over frontals and
/// parents.
impl From<DiscreteConditional> for DiscreteFactor {
    fn from(conditional: DiscreteConditional) -> Self {
        let mut keys = conditional.frontals;
        keys.extend(conditional.parents);
        keys.sort_unstable();
        DiscreteFactor {
            keys,
            table: conditional.table,
        }
    }
}

fn validate_potentials(values: &[f64]) -> HybridResult<()> {
    if let Some(bad) = values.iter().find(|v| !v.is_finite() || **v < 0.0) {
        return Err(HybridError::Validation(format!(
            "discrete potentials must be finite and >= 0, got {}",
            bad
        )));
    }
    Ok(())
}
