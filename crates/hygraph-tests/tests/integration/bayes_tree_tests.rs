//! Bayes trees of switching chains.

use std::collections::BTreeSet;

use hygraph_core::{assignments, Assignment, EliminationConfig, Key, Ordering};
use hygraph_tests::{chain_modes, chain_states, sample_values, switching_chain};

const N: u64 = 12;

fn mode_keys(n: u64) -> Vec<Key> {
    chain_modes(n).iter().map(|dk| dk.key).collect()
}

/// Nested dissection over the states, then over the modes.
fn balanced_ordering(n: u64) -> Ordering {
    let modes = Ordering::binary(&mode_keys(n));
    Ordering::binary(&chain_states(n)).then(modes.keys().iter().copied())
}

#[test]
fn balanced_full_elimination_covers_every_key_once() {
    let graph = switching_chain(N).unwrap();
    let (tree, remaining) = graph.eliminate_multifrontal(&balanced_ordering(N)).unwrap();
    assert!(remaining.is_none());
    assert!(tree.satisfies_running_intersection());
    assert_eq!(tree.eliminated_keys().len(), graph.keys().len());
    for key in graph.keys() {
        let id = tree.clique_of(key).expect("every key is frontal somewhere");
        assert!(tree.clique(id).unwrap().frontals().contains(&key));
    }
    let frontal_total: usize = tree.cliques().map(|(_, c)| c.frontals().len()).sum();
    assert_eq!(frontal_total, graph.keys().len());
}

#[test]
fn balanced_partial_elimination_leaves_the_modes() {
    let graph = switching_chain(N).unwrap();
    let (tree, remaining) = graph
        .eliminate_multifrontal(&Ordering::binary(&chain_states(N)))
        .unwrap();
    let remaining = remaining.expect("modes are left");
    let modes: BTreeSet<Key> = mode_keys(N).into_iter().collect();
    assert_eq!(remaining.keys().into_iter().collect::<BTreeSet<_>>(), modes);

    let mut covered = BTreeSet::new();
    for &root in tree.roots() {
        let separator = tree.clique(root).unwrap().separator();
        assert!(separator.iter().all(|k| modes.contains(k)));
        covered.extend(separator.iter().copied());
    }
    assert_eq!(covered, modes);
    assert_eq!(tree.remaining_factors().len(), remaining.len());
}

#[test]
fn tree_matches_sequential_net() {
    let n = 6;
    let graph = switching_chain(n).unwrap();
    let ordering = balanced_ordering(n);
    let (tree, _) = graph.eliminate_multifrontal(&ordering).unwrap();
    let (net, _) = graph.eliminate_sequential(&ordering).unwrap();

    for assignment in assignments(&chain_modes(n)) {
        let mut values = sample_values(&chain_states(n), 1);
        values.discrete = assignment.clone();
        let a = tree.log_evaluate(&values).unwrap();
        let b = net.log_evaluate(&values).unwrap();
        assert!((a - b).abs() < 1e-8, "{} vs {} at {}", a, b, assignment);

        let from_tree = tree.optimize(&assignment).unwrap();
        let from_net = net.optimize(&assignment).unwrap();
        for key in chain_states(n) {
            let diff = from_tree.vector(key).unwrap() - from_net.vector(key).unwrap();
            assert!(diff.amax() < 1e-9);
        }
    }
}

#[test]
fn parallel_and_serial_elimination_agree() {
    let graph = switching_chain(8).unwrap();
    let ordering = balanced_ordering(8);
    let serial = EliminationConfig {
        parallel: false,
        ..EliminationConfig::default()
    };
    let (a, _) = graph.eliminate_multifrontal(&ordering).unwrap();
    let (b, _) = graph
        .eliminate_multifrontal_with_config(&ordering, &serial)
        .unwrap();
    assert_eq!(a.size(), b.size());

    let modes = chain_modes(8);
    let assignment: Assignment = modes
        .iter()
        .enumerate()
        .map(|(i, dk)| (dk.key, i % 2))
        .collect();
    let mut values = sample_values(&chain_states(8), 1);
    values.discrete = assignment;
    let diff = a.log_evaluate(&values).unwrap() - b.log_evaluate(&values).unwrap();
    assert!(diff.abs() < 1e-12);
}
