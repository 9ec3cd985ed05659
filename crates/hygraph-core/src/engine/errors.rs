//! Error types for hybrid elimination.

use thiserror::Error;

/// Errors that can occur while building, eliminating, querying or updating
/// hybrid factor graphs.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking changes.
///
/// Every public API returns `Result<T, HybridError>`; none of these errors is
/// retried internally. Retrying (e.g. with a perturbed ordering) is left to
/// the caller. A failed elimination or update never exposes a half-built
/// Bayes net or Bayes tree.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum HybridError {
    /// Gaussian elimination hit a singular or rank-deficient frontal block,
    /// or a continuous variable had no factor constraining it.
    #[error("numerical rank error: {0}")]
    NumericalRank(String),

    /// Two trees, factors or graphs disagree on the cardinality declared for
    /// a shared discrete key.
    #[error("domain mismatch: {0}")]
    DomainMismatch(String),

    /// An assignment or value set omits a key required by a tree, factor or
    /// conditional (or gives a value outside the key's domain).
    #[error("out of scope: {0}")]
    OutOfScope(String),

    /// An ordering or update references keys inconsistently with the graph
    /// or tree (unknown keys, duplicated keys, kind or dimension conflicts).
    #[error("structural error: {0}")]
    Structural(String),

    /// Invalid configuration or malformed factor data.
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal invariant violation (programmer error, not user error).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the engine.
pub type HybridResult<T> = Result<T, HybridError>;
