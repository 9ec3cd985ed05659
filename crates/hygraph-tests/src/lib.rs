//! Shared fixtures for the hygraph integration tests and benchmarks.

use hygraph_core::{
    DecisionTree, DiscreteFactor, DiscreteKey, HybridFactor, HybridFactorGraph, HybridResult,
    HybridValues, JacobianFactor, Key, MixtureFactor,
};
use nalgebra::{DMatrix, DVector};

/// Continuous key `x<i>`.
pub fn x(i: u64) -> Key {
    Key::symbol('x', i)
}

/// Binary mode key `c<i>`.
pub fn c(i: u64) -> DiscreteKey {
    DiscreteKey::new(Key::symbol('c', i), 2)
}

pub fn eye(n: usize) -> DMatrix<f64> {
    DMatrix::identity(n, n)
}

/// Prior on x0, a between factor to x1 and a two-mode measurement of x1
/// (at 0 or at 1 in every coordinate), all 3-dimensional. With
/// `mode_prior = Some([p0, p1])` a table on c1 is added.
pub fn gated_measurement_graph(mode_prior: Option<[f64; 2]>) -> HybridResult<HybridFactorGraph> {
    let mut graph = HybridFactorGraph::new();
    graph.add_continuous_factor(&[x(0)], vec![eye(3)], DVector::zeros(3))?;
    graph.add_continuous_factor(&[x(0), x(1)], vec![eye(3), -eye(3)], DVector::zeros(3))?;
    let components = DecisionTree::from_values(
        &[c(1)],
        vec![
            JacobianFactor::unary(x(1), eye(3), DVector::zeros(3))?,
            JacobianFactor::unary(x(1), eye(3), DVector::from_element(3, 1.0))?,
        ],
    )?;
    graph.add_mixture_factor(&[x(1)], &[c(1)], components)?;
    if let Some(prior) = mode_prior {
        graph.add_discrete_factor(&[c(1)], prior.to_vec())?;
    }
    Ok(graph)
}

/// Factors added by step `t` (t >= 1) of a switching chain: a between
/// factor from x<t> to x<t+1> whose offset (0 or 1) is selected by c<t>, and
/// for t > 1 a transition table on (c<t-1>, c<t>).
pub fn switching_segment(t: u64) -> HybridResult<Vec<HybridFactor>> {
    let one = eye(1);
    let mode = c(t);
    let mixture = MixtureFactor::from_factors(
        &[x(t), x(t + 1)],
        &[mode],
        vec![
            JacobianFactor::binary(x(t), one.clone(), x(t + 1), -one.clone(), DVector::zeros(1))?,
            JacobianFactor::binary(
                x(t),
                one.clone(),
                x(t + 1),
                -one.clone(),
                DVector::from_element(1, 1.0),
            )?,
        ],
    )?;
    let mut factors = vec![mixture.into()];
    if t > 1 {
        factors.push(DiscreteFactor::from_spec(&[c(t - 1), mode], "1 2 2 3")?.into());
    }
    Ok(factors)
}

/// A chain x1..x<n> of 1-dimensional states with a prior on x1 and a
/// switching between factor per step, gated by modes c1..c<n-1>.
pub fn switching_chain(n: u64) -> HybridResult<HybridFactorGraph> {
    let mut graph = HybridFactorGraph::new();
    graph.add_continuous_factor(&[x(1)], vec![eye(1)], DVector::zeros(1))?;
    for t in 1..n {
        for factor in switching_segment(t)? {
            graph.add(factor)?;
        }
    }
    Ok(graph)
}

/// Continuous keys x1..x<n>.
pub fn chain_states(n: u64) -> Vec<Key> {
    (1..=n).map(x).collect()
}

/// Mode keys c1..c<n-1>.
pub fn chain_modes(n: u64) -> Vec<DiscreteKey> {
    (1..n).map(c).collect()
}

/// Deterministic, non-trivial continuous values for `keys`.
pub fn sample_values(keys: &[Key], dim: usize) -> HybridValues {
    let mut values = HybridValues::new();
    for (i, &key) in keys.iter().enumerate() {
        let base = 0.37 * i as f64 - 0.5;
        values.insert_continuous(key, DVector::from_fn(dim, |r, _| base + 0.11 * r as f64));
    }
    values
}
