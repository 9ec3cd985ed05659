//! Hybrid Bayes nets and sequential elimination.

use rustc_hash::FxHashMap;

use crate::engine::conditional::HybridConditional;
use crate::engine::eliminate::{eliminate_frontals, EliminationConfig, FactorPool};
use crate::engine::errors::HybridResult;
use crate::engine::factor_graph::HybridFactorGraph;
use crate::engine::keys::{Assignment, HybridValues};
use crate::engine::ordering::Ordering;

/// Conditionals in elimination order. Read in reverse they form a
/// generative order: every conditional's parents are frontal in a later
/// conditional or were left un-eliminated.
#[derive(Debug, Clone, Default)]
pub struct HybridBayesNet {
    conditionals: Vec<HybridConditional>,
}

impl HybridBayesNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conditional: HybridConditional) {
        self.conditionals.push(conditional);
    }

    pub fn len(&self) -> usize {
        self.conditionals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditionals.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HybridConditional> {
        self.conditionals.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HybridConditional> {
        self.conditionals.iter()
    }

    /// Sum of conditional log densities.
    pub fn log_evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.conditionals.iter().map(|c| c.log_evaluate(values)).sum()
    }

    /// Product of conditionals; for a full elimination this is the normalized
    /// joint density.
    pub fn evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.log_evaluate(values).map(f64::exp)
    }

    /// Most probable continuous values for the given modes.
    pub fn optimize(&self, assignment: &Assignment) -> HybridResult<HybridValues> {
        self.optimize_from(HybridValues::from_parts(FxHashMap::default(), assignment.clone()))
    }

    /// Back-substitution in reverse elimination order, starting from `values`
    /// (which must hold any un-eliminated separator values).
    pub fn optimize_from(&self, mut values: HybridValues) -> HybridResult<HybridValues> {
        for conditional in self.conditionals.iter().rev() {
            for (key, value) in conditional.solve(&values)? {
                values.insert_continuous(key, value);
            }
        }
        Ok(values)
    }
}

impl<'a> IntoIterator for &'a HybridBayesNet {
    type Item = &'a HybridConditional;
    type IntoIter = std::slice::Iter<'a, HybridConditional>;

    fn into_iter(self) -> Self::IntoIter {
        self.conditionals.iter()
    }
}

impl HybridFactorGraph {
    /// Eliminates the ordering's keys one at a time with the default
    /// configuration.
    ///
    /// Returns the Bayes net and, for a partial ordering, the graph left
    /// over the un-eliminated keys.
    pub fn eliminate_sequential(
        &self,
        ordering: &Ordering,
    ) -> HybridResult<(HybridBayesNet, Option<HybridFactorGraph>)> {
        self.eliminate_sequential_with_config(ordering, &EliminationConfig::default())
    }

    pub fn eliminate_sequential_with_config(
        &self,
        ordering: &Ordering,
        config: &EliminationConfig,
    ) -> HybridResult<(HybridBayesNet, Option<HybridFactorGraph>)> {
        let config = config.validate()?;
        let order = ordering.resolve(self)?;

        let mut pool = FactorPool::new(self.factors().iter().cloned());
        let mut net = HybridBayesNet::new();
        for &key in &order {
            let pulled = pool.pull(key);
            let result = eliminate_frontals(&pulled, &[key], self.domains(), &config)?;
            net.push(result.conditional);
            if let Some(remaining) = result.remaining {
                pool.insert(remaining);
            }
        }

        let partial = self.keys().len() > order.len();
        let remaining = partial
            .then(|| HybridFactorGraph::with_domains(pool.into_remaining(), self.domains().clone()));

        #[cfg(feature = "tracing")]
        tracing::info!(
            "sequential elimination: {} conditionals, {} remaining factors",
            net.len(),
            remaining.as_ref().map_or(0, HybridFactorGraph::len)
        );

        Ok((net, remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::keys::Key;
    use nalgebra::{DMatrix, DVector};

    fn x(i: u64) -> Key {
        Key::symbol('x', i)
    }

    fn eye() -> DMatrix<f64> {
        DMatrix::identity(3, 3)
    }

    fn two_variable_chain() -> HybridFactorGraph {
        let mut graph = HybridFactorGraph::new();
        graph
            .add_continuous_factor(&[x(0)], vec![eye()], DVector::zeros(3))
            .expect("prior");
        graph
            .add_continuous_factor(&[x(0), x(1)], vec![eye(), -eye()], DVector::zeros(3))
            .expect("between");
        graph
    }

    #[test]
    fn partial_elimination_leaves_one_factor() {
        let graph = two_variable_chain();
        let (net, remaining) = graph
            .eliminate_sequential(&Ordering::new([x(0)]))
            .expect("eliminate");
        assert_eq!(net.len(), 1);
        let remaining = remaining.expect("partial elimination leaves a graph");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining.keys(), vec![x(1)]);
    }

    #[test]
    fn full_elimination_optimizes_to_least_squares() {
        let mut graph = two_variable_chain();
        graph
            .add_continuous_factor(&[x(1)], vec![eye()], DVector::from_element(3, 3.0))
            .expect("measurement");
        let (net, remaining) = graph
            .eliminate_sequential(&Ordering::new([x(0), x(1)]))
            .expect("eliminate");
        assert!(remaining.is_none());

        let solution = net.optimize(&Assignment::new()).expect("optimize");
        // Stationarity: x0 = x1 / 2 and 1.5 x1 = 3.
        let x1 = solution.vector(x(1)).expect("x1");
        let x0 = solution.vector(x(0)).expect("x0");
        assert!((x1[0] - 2.0).abs() < 1e-9);
        assert!((x0[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bayes_net_is_normalized_joint() {
        let graph = two_variable_chain();
        let (net, _) = graph
            .eliminate_sequential(&Ordering::new([x(0), x(1)]))
            .expect("eliminate");
        // Product of conditionals differs from the factor product by a
        // constant.
        let mut offsets = Vec::new();
        for point in [0.0, 0.5, -1.5] {
            let mut values = HybridValues::new();
            values.insert_continuous(x(0), DVector::from_element(3, point));
            values.insert_continuous(x(1), DVector::from_element(3, 2.0 * point - 1.0));
            offsets.push(net.log_evaluate(&values).unwrap() + graph.error(&values).unwrap());
        }
        assert!(offsets.windows(2).all(|w| (w[0] - w[1]).abs() < 1e-9));
    }

    #[test]
    fn unconstrained_variable_fails_without_partial_result() {
        let mut graph = two_variable_chain();
        graph
            .add_continuous_factor(
                &[x(2)],
                vec![DMatrix::from_row_slice(1, 3, &[1.0, 0.0, 0.0])],
                DVector::zeros(1),
            )
            .expect("underdetermined");
        assert!(matches!(
            graph.eliminate_sequential(&Ordering::new([x(0), x(1), x(2)])),
            Err(crate::engine::errors::HybridError::NumericalRank(_))
        ));
    }
}
