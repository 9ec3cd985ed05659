//! The elimination engine for hybrid factor graphs.
//!
//! This module provides:
//! - **errors**: Error types shared by every operation
//! - **keys**: Keys, discrete keys, assignments and hybrid values
//! - **decision_tree**: Discrete-indexed trees behind tables and mixtures
//! - **discrete**: Discrete factors and conditionals
//! - **gaussian**: Jacobian factors, Gaussian conditionals and block QR
//! - **hybrid_factor** / **conditional**: The three factor and conditional kinds
//! - **factor_graph**: The graph container and its key registry
//! - **ordering**: Elimination orderings and heuristics
//! - **eliminate**: Elimination of one frontal set
//! - **bayes_net**: Sequential elimination
//! - **junction_tree** / **bayes_tree**: Multifrontal elimination
//! - **isam**: Incremental Bayes-tree updates

pub mod bayes_net;
pub mod bayes_tree;
pub mod conditional;
pub mod decision_tree;
pub mod discrete;
pub mod eliminate;
pub mod errors;
pub mod factor_graph;
pub mod gaussian;
pub mod hybrid_factor;
mod isam;
mod junction_tree;
pub mod keys;
pub mod ordering;
