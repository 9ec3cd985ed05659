//! Variable identifiers, discrete assignments and hybrid value sets.
//!
//! A [`Key`] names one variable, continuous or discrete. Discrete variables
//! additionally carry a cardinality through [`DiscreteKey`]. An
//! [`Assignment`] picks one value index per discrete key and is what decision
//! trees, tables and mixtures are indexed by. [`HybridValues`] bundles an
//! assignment with continuous vector values for evaluating factors.

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::DVector;
use rustc_hash::FxHashMap;

use crate::engine::errors::{HybridError, HybridResult};

const SYMBOL_SHIFT: u32 = 56;
const SYMBOL_INDEX_MASK: u64 = (1 << SYMBOL_SHIFT) - 1;

/// A unique identifier for one variable of a hybrid graph.
///
/// Keys implement Ord for stable, deterministic iteration; decision trees
/// order their levels by key.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Key(pub u64);

impl Key {
    /// Packs a character tag and an index into a key, e.g. `Key::symbol('x', 3)`.
    ///
    /// Only the low byte of `tag` and the low 56 bits of `index` are kept, so
    /// non-ASCII tags or larger indices can collide with other symbols; use
    /// [`Key::try_symbol`] to reject them.
    pub fn symbol(tag: char, index: u64) -> Self {
        Key(((tag as u64 & 0xFF) << SYMBOL_SHIFT) | (index & SYMBOL_INDEX_MASK))
    }

    /// Like [`Key::symbol`], but fails with [`HybridError::Validation`] when
    /// `tag` is not ASCII or `index` does not fit in 56 bits.
    pub fn try_symbol(tag: char, index: u64) -> HybridResult<Self> {
        if !tag.is_ascii() {
            return Err(HybridError::Validation(format!(
                "symbol tag '{}' is not ASCII",
                tag
            )));
        }
        if index > SYMBOL_INDEX_MASK {
            return Err(HybridError::Validation(format!(
                "symbol index {} does not fit in {} bits",
                index, SYMBOL_SHIFT
            )));
        }
        Ok(Self::symbol(tag, index))
    }

    /// The character tag of a symbol key, if it has one.
    pub fn tag(self) -> Option<char> {
        let byte = (self.0 >> SYMBOL_SHIFT) as u8;
        byte.is_ascii_alphabetic().then_some(byte as char)
    }

    /// The index part of a symbol key.
    pub fn index(self) -> u64 {
        self.0 & SYMBOL_INDEX_MASK
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Some(tag) => write!(f, "{}{}", tag, self.index()),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<u64> for Key {
    fn from(raw: u64) -> Self {
        Key(raw)
    }
}

/// Whether a variable is continuous (vector valued) or discrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Continuous,
    Discrete,
}

/// A discrete variable together with the size of its finite domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscreteKey {
    pub key: Key,
    pub cardinality: usize,
}

impl DiscreteKey {
    pub const fn new(key: Key, cardinality: usize) -> Self {
        Self { key, cardinality }
    }

    pub(crate) fn validate(self) -> HybridResult<Self> {
        if self.cardinality == 0 {
            return Err(HybridError::Validation(format!(
                "discrete key {} must have cardinality >= 1",
                self.key
            )));
        }
        Ok(self)
    }
}

impl From<(Key, usize)> for DiscreteKey {
    fn from((key, cardinality): (Key, usize)) -> Self {
        DiscreteKey::new(key, cardinality)
    }
}

/// Returns the sorted union of two discrete key sets.
///
/// Fails with [`HybridError::DomainMismatch`] when a key appears in both with
/// different cardinalities.
pub fn merge_discrete_keys(
    lhs: &[DiscreteKey],
    rhs: &[DiscreteKey],
) -> HybridResult<Vec<DiscreteKey>> {
    let mut merged: BTreeMap<Key, usize> = BTreeMap::new();
    for dk in lhs.iter().chain(rhs.iter()) {
        let dk = dk.validate()?;
        match merged.get(&dk.key) {
            Some(&existing) if existing != dk.cardinality => {
                return Err(HybridError::DomainMismatch(format!(
                    "discrete key {} declared with cardinality {} and {}",
                    dk.key, existing, dk.cardinality
                )));
            }
            Some(_) => {}
            None => {
                merged.insert(dk.key, dk.cardinality);
            }
        }
    }
    Ok(merged
        .into_iter()
        .map(|(key, cardinality)| DiscreteKey::new(key, cardinality))
        .collect())
}

/// Number of joint assignments over a key set.
///
/// Fails with [`HybridError::Validation`] when the count does not fit in a
/// `usize`.
pub fn assignment_count(keys: &[DiscreteKey]) -> HybridResult<usize> {
    keys.iter()
        .try_fold(1usize, |count, dk| count.checked_mul(dk.cardinality))
        .ok_or_else(|| {
            HybridError::Validation(format!(
                "joint domain of {} discrete keys overflows usize",
                keys.len()
            ))
        })
}

/// A mapping from discrete keys to selected value indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Assignment {
    values: BTreeMap<Key, usize>,
}

impl Assignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: Key, value: usize) -> Self {
        self.values.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: Key, value: usize) -> Option<usize> {
        self.values.insert(key, value)
    }

    pub fn remove(&mut self, key: Key) -> Option<usize> {
        self.values.remove(&key)
    }

    pub fn get(&self, key: Key) -> Option<usize> {
        self.values.get(&key).copied()
    }

    pub fn contains(&self, key: Key) -> bool {
        self.values.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, usize)> + '_ {
        self.values.iter().map(|(&k, &v)| (k, v))
    }

    /// Looks up the value of `dk`, checking that it lies in the key's domain.
    pub fn value_of(&self, dk: DiscreteKey) -> HybridResult<usize> {
        let value = self.get(dk.key).ok_or_else(|| {
            HybridError::OutOfScope(format!("assignment has no value for {}", dk.key))
        })?;
        if value >= dk.cardinality {
            return Err(HybridError::OutOfScope(format!(
                "value {} for {} is outside its domain of size {}",
                value, dk.key, dk.cardinality
            )));
        }
        Ok(value)
    }

    /// Restricts this assignment to the given keys.
    pub fn restricted_to(&self, keys: &[DiscreteKey]) -> Assignment {
        let mut out = Assignment::new();
        for dk in keys {
            if let Some(v) = self.get(dk.key) {
                out.insert(dk.key, v);
            }
        }
        out
    }
}

impl FromIterator<(Key, usize)> for Assignment {
    fn from_iter<I: IntoIterator<Item = (Key, usize)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
    }
}

/// Enumerates every joint assignment of a key set in row-major order (the
/// first key varies slowest).
pub fn assignments(keys: &[DiscreteKey]) -> AssignmentIter {
    AssignmentIter {
        keys: keys.to_vec(),
        counter: vec![0; keys.len()],
        done: keys.iter().any(|dk| dk.cardinality == 0),
    }
}

/// Iterator returned by [`assignments`].
#[derive(Debug, Clone)]
pub struct AssignmentIter {
    keys: Vec<DiscreteKey>,
    counter: Vec<usize>,
    done: bool,
}

impl Iterator for AssignmentIter {
    type Item = Assignment;

    fn next(&mut self) -> Option<Assignment> {
        if self.done {
            return None;
        }
        let current = self
            .keys
            .iter()
            .zip(self.counter.iter())
            .map(|(dk, &v)| (dk.key, v))
            .collect();

        self.done = true;
        for pos in (0..self.keys.len()).rev() {
            self.counter[pos] += 1;
            if self.counter[pos] < self.keys[pos].cardinality {
                self.done = false;
                break;
            }
            self.counter[pos] = 0;
        }
        Some(current)
    }
}

/// Continuous values plus a discrete assignment.
#[derive(Debug, Clone, Default)]
pub struct HybridValues {
    pub continuous: FxHashMap<Key, DVector<f64>>,
    pub discrete: Assignment,
}

impl HybridValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(continuous: FxHashMap<Key, DVector<f64>>, discrete: Assignment) -> Self {
        Self {
            continuous,
            discrete,
        }
    }

    pub fn insert_continuous(&mut self, key: Key, value: DVector<f64>) {
        self.continuous.insert(key, value);
    }

    pub fn insert_discrete(&mut self, key: Key, value: usize) {
        self.discrete.insert(key, value);
    }

    /// Returns the vector value of `key` or an out-of-scope error.
    pub fn vector(&self, key: Key) -> HybridResult<&DVector<f64>> {
        self.continuous
            .get(&key)
            .ok_or_else(|| HybridError::OutOfScope(format!("no continuous value for {}", key)))
    }
}
