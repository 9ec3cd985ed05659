//! Elimination of one frontal set from the factors that involve it.
//!
//! Both the sequential and the multifrontal engines reduce to
//! [`eliminate_frontals`]: given every factor touching a set of frontal keys
//! of one kind, produce a conditional on the frontals and (optionally) a
//! remaining factor on the separator.
//!
//! ## Continuous frontals
//!
//! Plain Jacobian factors are stacked and eliminated by block QR. When
//! mixture factors are present the same elimination runs once per joint
//! assignment of their discrete keys, giving a [`GaussianMixture`]
//! conditional and a [`MixtureFactor`] remainder. Each remainder component
//! carries the log normalizer of its assignment, so the discrete marginal
//! stays exact.
//!
//! ## Discrete frontals
//!
//! Mixtures are turned into potentials `exp(-(e_m − min e))`, where `e_m` is
//! the error of the component for mode `m` with any continuous keys
//! integrated out, multiplied with the discrete tables and normalized over
//! the frontals. Integrating out continuous keys here means a selector is
//! eliminated before a variable it gates; the result is approximate and
//! [`SelectorPolicy`] decides how that is reported.

use rustc_hash::FxHashMap;

use crate::engine::conditional::{GaussianMixture, HybridConditional};
use crate::engine::decision_tree::DecisionTree;
use crate::engine::discrete::{DiscreteConditional, DiscreteFactor};
use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::factor_graph::KeyDomains;
use crate::engine::gaussian::{eliminate_gaussian, format_keys, GaussianConditional, JacobianFactor};
use crate::engine::hybrid_factor::{HybridFactor, MixtureFactor};
use crate::engine::keys::{merge_discrete_keys, DiscreteKey, Key, KeyKind};

/// How to treat eliminating a discrete key while a mixture it selects still
/// has continuous keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectorPolicy {
    /// Integrate the continuous keys out silently.
    Accept,
    /// Integrate them out and emit a warning event.
    #[default]
    Warn,
    /// Fail with [`HybridError::Structural`].
    Reject,
}

/// Configuration for sequential and multifrontal elimination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EliminationConfig {
    /// Pivots of `R` at or below this magnitude are treated as zero.
    pub rank_tolerance: f64,
    pub selector_policy: SelectorPolicy,
    /// Eliminate independent cliques on the rayon pool (requires the
    /// `parallel` feature).
    pub parallel: bool,
}

impl Default for EliminationConfig {
    fn default() -> Self {
        Self {
            rank_tolerance: 1e-9,
            selector_policy: SelectorPolicy::Warn,
            parallel: true,
        }
    }
}

impl EliminationConfig {
    pub fn validate(self) -> HybridResult<Self> {
        if !self.rank_tolerance.is_finite() || self.rank_tolerance < 0.0 {
            return Err(HybridError::Validation(
                "eliminate: rank_tolerance must be finite and >= 0".into(),
            ));
        }
        Ok(self)
    }
}

/// Conditional on a frontal set plus the factor left on its separator.
#[derive(Debug, Clone)]
pub(crate) struct EliminationResult {
    pub(crate) conditional: HybridConditional,
    pub(crate) remaining: Option<HybridFactor>,
}

/// Eliminates `frontals` (all of one kind) from `factors`, which must be
/// every factor involving any of them.
pub(crate) fn eliminate_frontals(
    factors: &[HybridFactor],
    frontals: &[Key],
    domains: &KeyDomains,
    config: &EliminationConfig,
) -> HybridResult<EliminationResult> {
    let mut kinds = frontals.iter().map(|&key| {
        domains
            .kind(key)
            .ok_or_else(|| HybridError::Structural(format!("unknown key {}", key)))
    });
    let kind = match kinds.next() {
        Some(kind) => kind?,
        None => return Err(HybridError::Internal("empty frontal set".into())),
    };
    for other in kinds {
        if other? != kind {
            return Err(HybridError::Internal(format!(
                "frontal set {} mixes continuous and discrete keys",
                format_keys(frontals)
            )));
        }
    }

    let result = match kind {
        KeyKind::Continuous => eliminate_continuous(factors, frontals, config),
        KeyKind::Discrete => {
            let discrete = frontals
                .iter()
                .map(|&key| {
                    domains.discrete_key(key).ok_or_else(|| {
                        HybridError::Internal(format!("no cardinality recorded for {}", key))
                    })
                })
                .collect::<HybridResult<Vec<DiscreteKey>>>()?;
            eliminate_discrete(factors, &discrete, config)
        }
    }?;

    #[cfg(feature = "tracing")]
    tracing::debug!(
        "eliminated {} from {} factors (separator factor: {})",
        format_keys(frontals),
        factors.len(),
        result.remaining.is_some()
    );

    Ok(result)
}

fn eliminate_continuous(
    factors: &[HybridFactor],
    frontals: &[Key],
    config: &EliminationConfig,
) -> HybridResult<EliminationResult> {
    let mut plain: Vec<&JacobianFactor> = Vec::new();
    let mut mixtures: Vec<&MixtureFactor> = Vec::new();
    for factor in factors {
        match factor {
            HybridFactor::Continuous(f) => plain.push(f),
            HybridFactor::Mixture(m) => mixtures.push(m),
            HybridFactor::Discrete(_) => {
                return Err(HybridError::Internal(format!(
                    "discrete factor pulled while eliminating {}",
                    format_keys(frontals)
                )));
            }
        }
    }

    if mixtures.is_empty() {
        let (conditional, remaining) = eliminate_gaussian(&plain, frontals, config.rank_tolerance)?;
        let remaining = (!remaining.keys().is_empty()).then_some(HybridFactor::Continuous(remaining));
        return Ok(EliminationResult {
            conditional: HybridConditional::Gaussian(conditional),
            remaining,
        });
    }

    let mut modes: Vec<DiscreteKey> = Vec::new();
    for mixture in &mixtures {
        modes = merge_discrete_keys(&modes, mixture.discrete_keys())?;
    }

    let split: DecisionTree<(GaussianConditional, JacobianFactor)> =
        DecisionTree::try_from_fn(&modes, |assignment| {
            let mut stacked = plain.clone();
            for mixture in &mixtures {
                stacked.push(mixture.select(assignment)?);
            }
            eliminate_gaussian(&stacked, frontals, config.rank_tolerance)
        })?;

    let conditionals = split.map(|(conditional, _)| conditional.clone());
    let components = split.map(|(_, remaining)| remaining.clone());
    let separator = components
        .leaves()
        .first()
        .map(|leaf| leaf.keys().to_vec())
        .unwrap_or_default();

    Ok(EliminationResult {
        conditional: HybridConditional::Mixture(GaussianMixture::new(&modes, conditionals)?),
        // Keyless mixtures still weigh the modes and are kept.
        remaining: Some(HybridFactor::Mixture(MixtureFactor::new(
            &separator, &modes, components,
        )?)),
    })
}

fn eliminate_discrete(
    factors: &[HybridFactor],
    frontals: &[DiscreteKey],
    config: &EliminationConfig,
) -> HybridResult<EliminationResult> {
    let mut joint = DiscreteFactor::constant(1.0)?;
    for factor in factors {
        let potential = match factor {
            HybridFactor::Discrete(table) => table.clone(),
            HybridFactor::Mixture(mixture) => mixture_potential(mixture, frontals, config)?,
            HybridFactor::Continuous(_) => {
                return Err(HybridError::Internal(
                    "continuous factor pulled while eliminating a discrete key".into(),
                ));
            }
        };
        joint = joint.multiply(&potential)?.normalized_to_max();
    }

    let (conditional, marginal) = DiscreteConditional::from_joint(&joint, frontals)?;
    let remaining = (!marginal.keys().is_empty()).then_some(HybridFactor::Discrete(marginal));
    Ok(EliminationResult {
        conditional: HybridConditional::Discrete(conditional),
        remaining,
    })
}

/// `exp(-(e_m − min e))` per mode, with any continuous keys integrated out.
fn mixture_potential(
    mixture: &MixtureFactor,
    frontals: &[DiscreteKey],
    config: &EliminationConfig,
) -> HybridResult<DiscreteFactor> {
    if !mixture.continuous_keys().is_empty() {
        let selectors: Vec<Key> = frontals.iter().map(|dk| dk.key).collect();
        match config.selector_policy {
            SelectorPolicy::Reject => {
                return Err(HybridError::Structural(format!(
                    "eliminating {} before the continuous keys {} it selects",
                    format_keys(&selectors),
                    format_keys(mixture.continuous_keys())
                )));
            }
            SelectorPolicy::Warn => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "eliminating {} before the continuous keys {} it selects; the discrete marginal is approximate",
                    format_keys(&selectors),
                    format_keys(mixture.continuous_keys())
                );
            }
            SelectorPolicy::Accept => {}
        }
    }

    // Components whose information is singular cannot be integrated; the
    // approximate path then scores each mode by its least-squares error.
    let errors = match mixture
        .components()
        .try_map(|component| component.log_integral_error(config.rank_tolerance))
    {
        Err(HybridError::NumericalRank(_)) if !mixture.continuous_keys().is_empty() => mixture
            .components()
            .try_map(JacobianFactor::min_error)?,
        other => other?,
    };
    let min = errors
        .leaves()
        .into_iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    let table = errors.map(|&e| if e.is_finite() { (-(e - min)).exp() } else { 0.0 });
    DiscreteFactor::from_tree(mixture.discrete_keys(), table)
}

/// Working set of factors with a per-key index, used by sequential
/// elimination to pull every factor touching a key.
#[derive(Debug, Default)]
pub(crate) struct FactorPool {
    slots: Vec<Option<HybridFactor>>,
    index: FxHashMap<Key, Vec<usize>>,
}

impl FactorPool {
    pub(crate) fn new<I: IntoIterator<Item = HybridFactor>>(factors: I) -> Self {
        let mut pool = Self::default();
        for factor in factors {
            pool.insert(factor);
        }
        pool
    }

    pub(crate) fn insert(&mut self, factor: HybridFactor) {
        let slot = self.slots.len();
        for key in factor.keys() {
            self.index.entry(key).or_default().push(slot);
        }
        self.slots.push(Some(factor));
    }

    /// Removes every live factor involving `key`, in insertion order.
    pub(crate) fn pull(&mut self, key: Key) -> Vec<HybridFactor> {
        let slots = self.index.remove(&key).unwrap_or_default();
        slots
            .into_iter()
            .filter_map(|slot| self.slots[slot].take())
            .collect()
    }

    /// The factors never pulled, in insertion order.
    pub(crate) fn into_remaining(self) -> Vec<HybridFactor> {
        self.slots.into_iter().flatten().collect()
    }
}
