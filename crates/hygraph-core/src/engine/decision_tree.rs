//! Decision trees over discrete assignments.
//!
//! A [`DecisionTree<T>`] is a function from joint assignments of a set of
//! [`DiscreteKey`]s to leaf values of type `T`. It is the indexing structure
//! behind discrete tables, mixture factors and mixture conditionals.
//!
//! ## Canonical form
//!
//! Every root-to-leaf path visits its labels in strictly increasing [`Key`]
//! order. All constructors and combinators preserve this, so each key lives
//! on one canonical level and two trees built from the same function over
//! the same key set have the same shape regardless of construction order.
//! Merging identical subtrees ([`DecisionTree::prune`]) is an optimization
//! only; equality ([`PartialEq`], [`DecisionTree::equals_by`]) always compares
//! the induced functions.

use std::collections::BTreeMap;

use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::keys::{assignment_count, merge_discrete_keys, Assignment, DiscreteKey, Key};

/// A discrete-indexed lookup tree.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecisionTree<T> {
    /// A constant value for every assignment reaching this node.
    Leaf(T),
    /// Branches on one discrete key; `branches[v]` is taken for value `v`.
    Choice {
        label: DiscreteKey,
        branches: Vec<DecisionTree<T>>,
    },
}

impl<T> DecisionTree<T> {
    pub fn leaf(value: T) -> Self {
        DecisionTree::Leaf(value)
    }

    /// Checks the invariants the constructors maintain: one branch per value
    /// of each label, strictly increasing labels along every path, and one
    /// cardinality per key.
    ///
    /// Trees assembled by hand from the public variants (or deserialized)
    /// should pass this before use; [`HybridError::Structural`] otherwise.
    pub fn validate_shape(&self) -> HybridResult<()> {
        let mut seen = BTreeMap::new();
        check_shape(self, None, &mut seen)
    }

    /// Builds a tree over `keys` by calling `f` once per joint assignment.
    pub fn from_fn<F>(keys: &[DiscreteKey], mut f: F) -> HybridResult<Self>
    where
        F: FnMut(&Assignment) -> T,
    {
        Self::try_from_fn(keys, |assignment| Ok::<T, HybridError>(f(assignment)))
    }

    /// Fallible version of [`DecisionTree::from_fn`].
    pub fn try_from_fn<E, F>(keys: &[DiscreteKey], mut f: F) -> Result<Self, E>
    where
        E: From<HybridError>,
        F: FnMut(&Assignment) -> Result<T, E>,
    {
        let keys = merge_discrete_keys(keys, &[])?;
        assignment_count(&keys)?;
        let mut assignment = Assignment::new();
        build_node(&keys, 0, &mut assignment, &mut f)
    }

    /// Looks up the leaf selected by `assignment`.
    ///
    /// Only keys on the visited path are required; extra keys are ignored.
    pub fn evaluate(&self, assignment: &Assignment) -> HybridResult<&T> {
        let mut node = self;
        loop {
            match node {
                DecisionTree::Leaf(value) => return Ok(value),
                DecisionTree::Choice { label, branches } => {
                    let value = assignment.value_of(*label)?;
                    node = branches.get(value).ok_or_else(|| {
                        HybridError::Internal(format!(
                            "decision tree node for {} has {} branches, expected {}",
                            label.key,
                            branches.len(),
                            label.cardinality
                        ))
                    })?;
                }
            }
        }
    }

    /// The sorted set of keys this tree branches on.
    pub fn discrete_keys(&self) -> Vec<DiscreteKey> {
        let mut keys = BTreeMap::new();
        self.collect_keys(&mut keys);
        keys.into_iter()
            .map(|(key, cardinality)| DiscreteKey::new(key, cardinality))
            .collect()
    }

    fn collect_keys(&self, out: &mut BTreeMap<Key, usize>) {
        if let DecisionTree::Choice { label, branches } = self {
            out.insert(label.key, label.cardinality);
            for branch in branches {
                branch.collect_keys(out);
            }
        }
    }

    pub fn leaf_count(&self) -> usize {
        match self {
            DecisionTree::Leaf(_) => 1,
            DecisionTree::Choice { branches, .. } => branches.iter().map(Self::leaf_count).sum(),
        }
    }

    /// All leaves, left to right.
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.leaf_count());
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                DecisionTree::Leaf(value) => out.push(value),
                DecisionTree::Choice { branches, .. } => stack.extend(branches.iter().rev()),
            }
        }
        out
    }

    /// Leaf-wise map preserving the tree structure.
    pub fn map<U, F>(&self, mut f: F) -> DecisionTree<U>
    where
        F: FnMut(&T) -> U,
    {
        map_node(self, &mut f)
    }

    /// Fallible leaf-wise map; stops at the first error.
    pub fn try_map<U, E, F>(&self, mut f: F) -> Result<DecisionTree<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        try_map_node(self, &mut f)
    }

    /// Leaf-wise map that also sees the (partial) assignment leading to each leaf.
    pub fn try_map_with_assignment<U, E, F>(&self, mut f: F) -> Result<DecisionTree<U>, E>
    where
        F: FnMut(&Assignment, &T) -> Result<U, E>,
    {
        let mut assignment = Assignment::new();
        try_map_assigned(self, &mut assignment, &mut f)
    }

    /// Pointwise combination over the union of both key sets.
    ///
    /// Fails with [`HybridError::DomainMismatch`] if a shared key is declared
    /// with different cardinalities, and with [`HybridError::Structural`] if
    /// either tree is malformed.
    pub fn combine<U, V, F>(&self, other: &DecisionTree<U>, mut op: F) -> HybridResult<DecisionTree<V>>
    where
        F: FnMut(&T, &U) -> V,
    {
        self.validate_shape()?;
        other.validate_shape()?;
        merge_discrete_keys(&self.discrete_keys(), &other.discrete_keys())?;
        Ok(combine_nodes(self, other, &mut op))
    }

    /// Compares the induced functions leaf by leaf.
    pub fn equals_by<U, F>(&self, other: &DecisionTree<U>, mut eq: F) -> bool
    where
        F: FnMut(&T, &U) -> bool,
    {
        match self.combine(other, |a, b| eq(a, b)) {
            Ok(flags) => flags.leaves().into_iter().all(|&same| same),
            Err(_) => false,
        }
    }
}

impl<T: Clone> DecisionTree<T> {
    /// Builds a tree from a table listed in row-major order over `keys` as
    /// given by the caller (the first key varies slowest).
    pub fn from_values(keys: &[DiscreteKey], values: Vec<T>) -> HybridResult<Self> {
        let expected = assignment_count(keys)?;
        let mut strides = vec![1usize; keys.len()];
        for pos in (0..keys.len().saturating_sub(1)).rev() {
            strides[pos] = strides[pos + 1]
                .checked_mul(keys[pos + 1].cardinality)
                .ok_or_else(|| HybridError::Validation("table size overflows usize".into()))?;
        }
        if values.len() != expected {
            return Err(HybridError::Validation(format!(
                "table over {} keys needs {} entries, got {}",
                keys.len(),
                expected,
                values.len()
            )));
        }
        for (pos, dk) in keys.iter().enumerate() {
            if keys[..pos].iter().any(|other| other.key == dk.key) {
                return Err(HybridError::Validation(format!(
                    "key {} listed twice in table",
                    dk.key
                )));
            }
        }

        Self::try_from_fn(keys, |assignment| {
            let mut index = 0;
            for (dk, stride) in keys.iter().zip(strides.iter()) {
                index += assignment.value_of(*dk)? * stride;
            }
            Ok::<T, HybridError>(values[index].clone())
        })
    }

    /// Builds a tree branching on `label` whose `v`-th branch is `branches[v]`.
    ///
    /// Branches may depend on keys ordered before `label`; the result is
    /// rebuilt in canonical order.
    pub fn choice(label: DiscreteKey, branches: Vec<DecisionTree<T>>) -> HybridResult<Self> {
        let label = label.validate()?;
        for branch in &branches {
            branch.validate_shape()?;
        }
        if branches.len() != label.cardinality {
            return Err(HybridError::Validation(format!(
                "choice on {} needs {} branches, got {}",
                label.key,
                label.cardinality,
                branches.len()
            )));
        }
        let mut keys = vec![label];
        for branch in &branches {
            keys = merge_discrete_keys(&keys, &branch.discrete_keys())?;
        }
        Self::try_from_fn(&keys, |assignment| {
            let value = assignment.value_of(label)?;
            branches[value].evaluate(assignment).cloned()
        })
    }

    /// Folds key `key` out of the tree with `op`.
    ///
    /// If the tree does not depend on `key`, the result folds `cardinality`
    /// copies of the tree, so summing out an absent key scales by its domain
    /// size.
    pub fn reduce<F>(&self, key: DiscreteKey, mut op: F) -> HybridResult<Self>
    where
        F: FnMut(&T, &T) -> T,
    {
        let key = key.validate()?;
        self.validate_shape()?;
        merge_discrete_keys(&self.discrete_keys(), &[key])?;
        Ok(reduce_node(self, key, &mut op))
    }
}

impl<T: Clone + PartialEq> DecisionTree<T> {
    /// Collapses choice nodes whose branches are all identical.
    pub fn prune(&self) -> Self {
        match self {
            DecisionTree::Leaf(_) => self.clone(),
            DecisionTree::Choice { label, branches } => {
                let pruned: Vec<DecisionTree<T>> = branches.iter().map(Self::prune).collect();
                match pruned.split_first() {
                    Some((first, rest)) if rest.iter().all(|b| same_shape(first, b)) => {
                        first.clone()
                    }
                    _ => DecisionTree::Choice {
                        label: *label,
                        branches: pruned,
                    },
                }
            }
        }
    }
}

impl<T: PartialEq> PartialEq for DecisionTree<T> {
    fn eq(&self, other: &Self) -> bool {
        self.equals_by(other, |a, b| a == b)
    }
}

fn check_shape<T>(
    node: &DecisionTree<T>,
    above: Option<Key>,
    seen: &mut BTreeMap<Key, usize>,
) -> HybridResult<()> {
    let DecisionTree::Choice { label, branches } = node else {
        return Ok(());
    };
    if label.cardinality == 0 || branches.len() != label.cardinality {
        return Err(HybridError::Structural(format!(
            "decision tree node for {} has {} branches, expected {}",
            label.key,
            branches.len(),
            label.cardinality
        )));
    }
    if above.map_or(false, |parent| label.key <= parent) {
        return Err(HybridError::Structural(format!(
            "decision tree branches on {} below a key that is not smaller",
            label.key
        )));
    }
    if *seen.entry(label.key).or_insert(label.cardinality) != label.cardinality {
        return Err(HybridError::Structural(format!(
            "decision tree uses {} with more than one cardinality",
            label.key
        )));
    }
    for branch in branches {
        check_shape(branch, Some(label.key), seen)?;
    }
    Ok(())
}

fn build_node<T, E, F>(
    keys: &[DiscreteKey],
    depth: usize,
    assignment: &mut Assignment,
    f: &mut F,
) -> Result<DecisionTree<T>, E>
where
    F: FnMut(&Assignment) -> Result<T, E>,
{
    let Some(&label) = keys.get(depth) else {
        return f(assignment).map(DecisionTree::Leaf);
    };
    let mut branches = Vec::with_capacity(label.cardinality);
    for value in 0..label.cardinality {
        assignment.insert(label.key, value);
        branches.push(build_node(keys, depth + 1, assignment, f)?);
    }
    assignment.remove(label.key);
    Ok(DecisionTree::Choice { label, branches })
}

fn map_node<T, U, F>(node: &DecisionTree<T>, f: &mut F) -> DecisionTree<U>
where
    F: FnMut(&T) -> U,
{
    match node {
        DecisionTree::Leaf(value) => DecisionTree::Leaf(f(value)),
        DecisionTree::Choice { label, branches } => DecisionTree::Choice {
            label: *label,
            branches: branches.iter().map(|b| map_node(b, f)).collect(),
        },
    }
}

fn try_map_node<T, U, E, F>(node: &DecisionTree<T>, f: &mut F) -> Result<DecisionTree<U>, E>
where
    F: FnMut(&T) -> Result<U, E>,
{
    match node {
        DecisionTree::Leaf(value) => f(value).map(DecisionTree::Leaf),
        DecisionTree::Choice { label, branches } => {
            let mut mapped = Vec::with_capacity(branches.len());
            for branch in branches {
                mapped.push(try_map_node(branch, f)?);
            }
            Ok(DecisionTree::Choice {
                label: *label,
                branches: mapped,
            })
        }
    }
}

fn try_map_assigned<T, U, E, F>(
    node: &DecisionTree<T>,
    assignment: &mut Assignment,
    f: &mut F,
) -> Result<DecisionTree<U>, E>
where
    F: FnMut(&Assignment, &T) -> Result<U, E>,
{
    match node {
        DecisionTree::Leaf(value) => f(assignment, value).map(DecisionTree::Leaf),
        DecisionTree::Choice { label, branches } => {
            let mut mapped = Vec::with_capacity(branches.len());
            for (value, branch) in branches.iter().enumerate() {
                assignment.insert(label.key, value);
                mapped.push(try_map_assigned(branch, assignment, f)?);
            }
            assignment.remove(label.key);
            Ok(DecisionTree::Choice {
                label: *label,
                branches: mapped,
            })
        }
    }
}

fn combine_nodes<T, U, V, F>(a: &DecisionTree<T>, b: &DecisionTree<U>, op: &mut F) -> DecisionTree<V>
where
    F: FnMut(&T, &U) -> V,
{
    use DecisionTree::{Choice, Leaf};

    match (a, b) {
        (Leaf(x), Leaf(y)) => Leaf(op(x, y)),
        (Choice { label, branches }, Leaf(_)) => Choice {
            label: *label,
            branches: branches.iter().map(|br| combine_nodes(br, b, op)).collect(),
        },
        (Leaf(_), Choice { label, branches }) => Choice {
            label: *label,
            branches: branches.iter().map(|br| combine_nodes(a, br, op)).collect(),
        },
        (
            Choice {
                label: la,
                branches: ba,
            },
            Choice {
                label: lb,
                branches: bb,
            },
        ) => {
            if la.key == lb.key {
                Choice {
                    label: *la,
                    branches: ba
                        .iter()
                        .zip(bb.iter())
                        .map(|(x, y)| combine_nodes(x, y, op))
                        .collect(),
                }
            } else if la.key < lb.key {
                Choice {
                    label: *la,
                    branches: ba.iter().map(|br| combine_nodes(br, b, op)).collect(),
                }
            } else {
                Choice {
                    label: *lb,
                    branches: bb.iter().map(|br| combine_nodes(a, br, op)).collect(),
                }
            }
        }
    }
}

fn reduce_node<T, F>(node: &DecisionTree<T>, key: DiscreteKey, op: &mut F) -> DecisionTree<T>
where
    T: Clone,
    F: FnMut(&T, &T) -> T,
{
    match node {
        DecisionTree::Choice { label, branches } if label.key == key.key => {
            let mut acc = branches[0].clone();
            for branch in &branches[1..] {
                acc = combine_nodes(&acc, branch, op);
            }
            acc
        }
        DecisionTree::Choice { label, branches } if label.key < key.key => DecisionTree::Choice {
            label: *label,
            branches: branches.iter().map(|b| reduce_node(b, key, op)).collect(),
        },
        // Labels below this node are all greater than `key`: the subtree is
        // constant in `key`.
        _ => {
            let mut acc = node.clone();
            for _ in 1..key.cardinality {
                acc = combine_nodes(&acc, node, op);
            }
            acc
        }
    }
}

fn same_shape<T: PartialEq>(a: &DecisionTree<T>, b: &DecisionTree<T>) -> bool {
    match (a, b) {
        (DecisionTree::Leaf(x), DecisionTree::Leaf(y)) => x == y,
        (
            DecisionTree::Choice {
                label: la,
                branches: ba,
            },
            DecisionTree::Choice {
                label: lb,
                branches: bb,
            },
        ) => la == lb && ba.iter().zip(bb.iter()).all(|(x, y)| same_shape(x, y)),
        _ => false,
    }
}
