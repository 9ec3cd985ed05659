//! Incremental updates against batch elimination.

use hygraph_core::{
    assignments, DiscreteKey, HybridBayesTree, HybridError, HybridFactorGraph, Key, Ordering,
};
use hygraph_tests::{
    c, chain_modes, chain_states, sample_values, switching_chain, switching_segment, x,
};

fn balanced_ordering(n: u64) -> Ordering {
    let modes: Vec<Key> = chain_modes(n).iter().map(|dk| dk.key).collect();
    Ordering::binary(&chain_states(n)).then(Ordering::binary(&modes).keys().iter().copied())
}

fn segment_graph(t: u64) -> HybridFactorGraph {
    HybridFactorGraph::from_factors(switching_segment(t).unwrap()).unwrap()
}

fn assert_matches_batch(tree: &HybridBayesTree, n: u64, tolerance: f64) {
    let graph = switching_chain(n).unwrap();
    let (batch, _) = graph.eliminate_multifrontal(&balanced_ordering(n)).unwrap();
    for assignment in assignments(&chain_modes(n)) {
        let mut values = sample_values(&chain_states(n), 1);
        values.discrete = assignment.clone();
        let incremental = tree.log_evaluate(&values).unwrap();
        let scratch = batch.log_evaluate(&values).unwrap();
        assert!(
            (incremental - scratch).abs() < tolerance,
            "{} vs {} at {}",
            incremental,
            scratch,
            assignment
        );
    }
}

#[test]
fn appending_a_segment_matches_batch_elimination() {
    let graph = switching_chain(11).unwrap();
    let (mut tree, _) = graph.eliminate_multifrontal(&balanced_ordering(11)).unwrap();

    tree.update(&segment_graph(11)).unwrap();
    assert!(tree.satisfies_running_intersection());
    assert!(tree.clique_of(x(12)).is_some());
    assert!(tree.clique_of(c(11).key).is_some());
    assert_matches_batch(&tree, 12, 1e-6);
}

#[test]
fn repeated_updates_track_batch_elimination() {
    let graph = switching_chain(3).unwrap();
    let (mut tree, _) = graph.eliminate_multifrontal(&balanced_ordering(3)).unwrap();
    for t in 3..7 {
        tree.update(&segment_graph(t)).unwrap();
        assert!(tree.satisfies_running_intersection());
        assert_matches_batch(&tree, t + 1, 1e-6);
    }
}

#[test]
fn empty_update_is_a_no_op() {
    let graph = switching_chain(4).unwrap();
    let (mut tree, _) = graph.eliminate_multifrontal(&balanced_ordering(4)).unwrap();
    let size = tree.size();
    tree.update(&HybridFactorGraph::new()).unwrap();
    assert_eq!(tree.size(), size);
}

#[test]
fn mismatched_cardinality_leaves_tree_untouched() {
    let graph = switching_chain(4).unwrap();
    let (mut tree, _) = graph.eliminate_multifrontal(&balanced_ordering(4)).unwrap();
    let size = tree.size();

    let mut bad = HybridFactorGraph::new();
    bad.add_discrete_factor(&[DiscreteKey::new(c(1).key, 3)], vec![1.0, 2.0, 3.0])
        .unwrap();
    assert!(matches!(tree.update(&bad), Err(HybridError::DomainMismatch(_))));
    assert_eq!(tree.size(), size);
    assert_matches_batch(&tree, 4, 1e-9);
}
