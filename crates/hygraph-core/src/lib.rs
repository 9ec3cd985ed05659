//! # Hygraph Core
//!
//! Exact elimination of factor graphs that mix continuous (Gaussian)
//! variables with discrete modes: sequential elimination into Bayes nets,
//! multifrontal elimination into Bayes trees, and incremental tree updates.

#![forbid(unsafe_code)]

pub mod engine;

// Re-export commonly used types
pub use engine::bayes_net::HybridBayesNet;
pub use engine::bayes_tree::{BayesTreeClique, CliqueId, HybridBayesTree};
pub use engine::conditional::{GaussianMixture, HybridConditional};
pub use engine::decision_tree::DecisionTree;
pub use engine::discrete::{DiscreteConditional, DiscreteFactor};
pub use engine::eliminate::{EliminationConfig, SelectorPolicy};
pub use engine::errors::{HybridError, HybridResult};
pub use engine::factor_graph::HybridFactorGraph;
pub use engine::gaussian::{eliminate_gaussian, GaussianConditional, JacobianFactor};
pub use engine::hybrid_factor::{HybridFactor, MixtureFactor};
pub use engine::keys::{assignments, Assignment, DiscreteKey, HybridValues, Key, KeyKind};
pub use engine::ordering::Ordering;
