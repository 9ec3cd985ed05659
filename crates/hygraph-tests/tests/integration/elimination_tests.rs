//! Sequential and multifrontal elimination end to end.

use hygraph_core::{
    assignments, Assignment, DecisionTree, DiscreteKey, EliminationConfig, HybridError,
    HybridFactor, HybridFactorGraph, JacobianFactor, Ordering, SelectorPolicy,
};
use hygraph_tests::{
    c, chain_modes, chain_states, eye, gated_measurement_graph, sample_values, switching_chain, x,
};
use nalgebra::DVector;

fn mode_posterior_without_prior() -> f64 {
    1.0 / (1.0 + (-0.5f64).exp())
}

fn two_variable_graph() -> HybridFactorGraph {
    let mut graph = HybridFactorGraph::new();
    graph
        .add_continuous_factor(&[x(0)], vec![eye(3)], DVector::zeros(3))
        .unwrap();
    graph
        .add_continuous_factor(&[x(0), x(1)], vec![eye(3), -eye(3)], DVector::zeros(3))
        .unwrap();
    graph
}

#[test]
fn sequential_mode_posterior_matches_closed_form() {
    let graph = gated_measurement_graph(None).unwrap();
    let (net, remaining) = graph
        .eliminate_sequential(&Ordering::discrete_last(&graph))
        .unwrap();
    assert!(remaining.is_none());
    assert_eq!(net.len(), 3);

    let last = net.get(net.len() - 1).unwrap();
    let p0 = last
        .as_discrete()
        .expect("modes are eliminated last")
        .evaluate(&Assignment::new().with(c(1).key, 0))
        .unwrap();
    assert!((p0 - mode_posterior_without_prior()).abs() < 1e-9);
    assert!((p0 - 0.6225).abs() < 1e-4);
}

#[test]
fn multifrontal_mode_posterior_matches_closed_form() {
    let graph = gated_measurement_graph(None).unwrap();
    let (tree, _) = graph
        .eliminate_multifrontal(&Ordering::discrete_last(&graph))
        .unwrap();
    let root = tree.clique(tree.roots()[0]).unwrap();
    let p0 = root
        .conditional()
        .as_discrete()
        .unwrap()
        .evaluate(&Assignment::new().with(c(1).key, 0))
        .unwrap();
    assert!((p0 - mode_posterior_without_prior()).abs() < 1e-9);
}

#[test]
fn mode_prior_shifts_posterior_and_tree_has_three_cliques() {
    let graph = gated_measurement_graph(Some([2.0, 8.0])).unwrap();
    let (tree, remaining) = graph
        .eliminate_multifrontal(&Ordering::discrete_last(&graph))
        .unwrap();
    assert!(remaining.is_none());
    assert_eq!(tree.size(), 3);

    let root = tree.clique(tree.roots()[0]).unwrap();
    let p0 = root
        .conditional()
        .as_discrete()
        .unwrap()
        .evaluate(&Assignment::new().with(c(1).key, 0))
        .unwrap();
    let w = (-0.5f64).exp();
    assert!((p0 - 2.0 / (2.0 + 8.0 * w)).abs() < 1e-9);
}

#[test]
fn partial_elimination_of_two_variables() {
    let graph = two_variable_graph();
    let ordering = Ordering::new([x(0)]);

    let (net, remaining) = graph.eliminate_sequential(&ordering).unwrap();
    assert_eq!(net.len(), 1);
    assert_eq!(remaining.unwrap().len(), 1);

    let (tree, remaining) = graph.eliminate_multifrontal(&ordering).unwrap();
    assert_eq!(tree.size(), 1);
    let remaining = remaining.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining.keys(), vec![x(1)]);
}

#[test]
fn factorization_identity_holds_for_switching_chain() {
    let n = 5;
    let graph = switching_chain(n).unwrap();
    let modes = chain_modes(n);
    let ordering = Ordering::new(chain_states(n)).then(modes.iter().map(|dk| dk.key));
    let (net, _) = graph.eliminate_sequential(&ordering).unwrap();
    let (tree, _) = graph.eliminate_multifrontal(&ordering).unwrap();

    let mut net_offsets = Vec::new();
    let mut tree_offsets = Vec::new();
    for (i, assignment) in assignments(&modes).enumerate() {
        let mut values = sample_values(&chain_states(n), 1);
        for v in values.continuous.values_mut() {
            v[0] += 0.05 * i as f64;
        }
        values.discrete = assignment;
        let error = graph.error(&values).unwrap();
        net_offsets.push(net.log_evaluate(&values).unwrap() + error);
        tree_offsets.push(tree.log_evaluate(&values).unwrap() + error);
    }
    assert!(net_offsets.windows(2).all(|w| (w[0] - w[1]).abs() < 1e-8));
    assert!(tree_offsets.windows(2).all(|w| (w[0] - w[1]).abs() < 1e-8));
    assert!((net_offsets[0] - tree_offsets[0]).abs() < 1e-8);
}

#[test]
fn unknown_ordering_key_is_structural() {
    let graph = two_variable_graph();
    let err = graph
        .eliminate_sequential(&Ordering::new([x(0), x(5)]))
        .unwrap_err();
    assert!(matches!(err, HybridError::Structural(_)));
}

#[test]
fn conflicting_cardinality_is_rejected() {
    let mut graph = gated_measurement_graph(None).unwrap();
    let err = graph
        .add_discrete_factor(&[DiscreteKey::new(c(1).key, 3)], vec![1.0, 1.0, 1.0])
        .unwrap_err();
    assert!(matches!(err, HybridError::DomainMismatch(_)));
    assert_eq!(graph.len(), 3);
}

#[test]
fn evaluating_without_a_mode_is_out_of_scope() {
    let graph = gated_measurement_graph(None).unwrap();
    let values = sample_values(&[x(0), x(1)], 3);
    assert!(matches!(graph.error(&values), Err(HybridError::OutOfScope(_))));
}

#[test]
fn selector_before_gated_variable_follows_policy() {
    let graph = gated_measurement_graph(None).unwrap();
    let ordering = Ordering::new([c(1).key, x(0), x(1)]);

    let reject = EliminationConfig {
        selector_policy: SelectorPolicy::Reject,
        ..EliminationConfig::default()
    };
    assert!(matches!(
        graph.eliminate_sequential_with_config(&ordering, &reject),
        Err(HybridError::Structural(_))
    ));

    let accept = EliminationConfig {
        selector_policy: SelectorPolicy::Accept,
        ..EliminationConfig::default()
    };
    let (net, remaining) = graph
        .eliminate_sequential_with_config(&ordering, &accept)
        .unwrap();
    assert!(remaining.is_none());
    assert_eq!(net.len(), 3);
}

#[test]
fn invalid_config_is_rejected() {
    let graph = two_variable_graph();
    let config = EliminationConfig {
        rank_tolerance: f64::NAN,
        ..EliminationConfig::default()
    };
    assert!(matches!(
        graph.eliminate_multifrontal_with_config(&Ordering::natural(&graph), &config),
        Err(HybridError::Validation(_))
    ));
}

#[test]
fn optimize_selects_component_by_mode() {
    let graph = gated_measurement_graph(None).unwrap();
    let (net, _) = graph
        .eliminate_sequential(&Ordering::discrete_last(&graph))
        .unwrap();
    let at_zero = net.optimize(&Assignment::new().with(c(1).key, 0)).unwrap();
    let at_one = net.optimize(&Assignment::new().with(c(1).key, 1)).unwrap();
    assert!(at_zero.vector(x(1)).unwrap().amax() < 1e-9);
    // Stationarity: x1 = 2 x0 and 2 x1 - x0 = 1.
    assert!((at_one.vector(x(1)).unwrap()[0] - 2.0 / 3.0).abs() < 1e-9);
    assert!((at_one.vector(x(0)).unwrap()[0] - 1.0 / 3.0).abs() < 1e-9);
}

#[test]
fn eliminated_conditionals_rebuild_the_same_net() {
    let graph = gated_measurement_graph(Some([2.0, 8.0])).unwrap();
    let ordering = Ordering::discrete_last(&graph);
    let (net, _) = graph.eliminate_sequential(&ordering).unwrap();
    assert!(net.iter().any(|conditional| conditional.is_hybrid()));

    let rebuilt =
        HybridFactorGraph::from_factors(net.iter().cloned().map(HybridFactor::from)).unwrap();
    assert_eq!(rebuilt.len(), net.len());
    let (again, remaining) = rebuilt.eliminate_sequential(&ordering).unwrap();
    assert!(remaining.is_none());

    for assignment in assignments(&[c(1)]) {
        let mut values = sample_values(&[x(0), x(1)], 3);
        values.discrete = assignment.clone();
        let expected = net.log_evaluate(&values).unwrap();
        assert!((rebuilt.error(&values).unwrap() + expected).abs() < 1e-9);
        assert!((again.log_evaluate(&values).unwrap() - expected).abs() < 1e-9);
    }
}

#[test]
fn empty_mixture_tree_is_structural() {
    let mut graph = two_variable_graph();
    let components: DecisionTree<JacobianFactor> = DecisionTree::Choice {
        label: c(1),
        branches: Vec::new(),
    };
    assert!(matches!(
        graph.add_mixture_factor(&[x(1)], &[c(1)], components),
        Err(HybridError::Structural(_))
    ));
    assert_eq!(graph.len(), 2);
}
