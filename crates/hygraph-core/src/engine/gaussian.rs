//! Linear Gaussian factors and conditionals.
//!
//! ## Key Components
//!
//! - **JacobianFactor**: `φ(x) = exp(-E(x))` with
//!   `E(x) = ½‖Σ_k A_k x_k − b‖² + c`, i.e. a whitened (unit noise) linear
//!   measurement. The scalar `c` is zero for factors built by callers;
//!   elimination uses it to carry integration constants.
//!
//! - **GaussianConditional**: a normalized density
//!   `p(x_F | x_S) = |det R| (2π)^{-n/2} exp(-½‖R x_F + S x_S − d‖²)`
//!   with upper-triangular `R`.
//!
//! ## Elimination
//!
//! [`eliminate_gaussian`] stacks the factors as `[A_F A_S | b]`, runs a
//! Householder QR and splits the triangular result into the conditional on
//! the frontal block and a remaining factor on the separator. The remaining
//! factor's constant is chosen so that `∫ Π φ_i dx_F = exp(-E_remaining)`
//! holds exactly, which keeps mixture components correctly weighted relative
//! to each other.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::engine::errors::{HybridError, HybridResult};
use crate::engine::keys::{HybridValues, Key};

/// ln(2π)
const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// A linear factor `½‖Σ A_k x_k − b‖² + c` over continuous keys.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianFactor {
    keys: Vec<Key>,
    blocks: Vec<DMatrix<f64>>,
    rhs: DVector<f64>,
    error_offset: f64,
}

impl JacobianFactor {
    /// Builds a factor from `(key, block)` terms and a right-hand side.
    pub fn new(terms: Vec<(Key, DMatrix<f64>)>, rhs: DVector<f64>) -> HybridResult<Self> {
        let mut keys = Vec::with_capacity(terms.len());
        let mut blocks = Vec::with_capacity(terms.len());
        for (key, block) in terms {
            if keys.contains(&key) {
                return Err(HybridError::Validation(format!(
                    "key {} appears twice in a Jacobian factor",
                    key
                )));
            }
            if block.nrows() != rhs.len() {
                return Err(HybridError::Validation(format!(
                    "block for {} has {} rows but rhs has {}",
                    key,
                    block.nrows(),
                    rhs.len()
                )));
            }
            if block.ncols() == 0 {
                return Err(HybridError::Validation(format!(
                    "block for {} has no columns",
                    key
                )));
            }
            keys.push(key);
            blocks.push(block);
        }
        Ok(Self {
            keys,
            blocks,
            rhs,
            error_offset: 0.0,
        })
    }

    /// `½‖A x − b‖²` on one key.
    pub fn unary(key: Key, a: DMatrix<f64>, b: DVector<f64>) -> HybridResult<Self> {
        Self::new(vec![(key, a)], b)
    }

    /// `½‖A₁ x₁ + A₂ x₂ − b‖²`.
    pub fn binary(
        k1: Key,
        a1: DMatrix<f64>,
        k2: Key,
        a2: DMatrix<f64>,
        b: DVector<f64>,
    ) -> HybridResult<Self> {
        Self::new(vec![(k1, a1), (k2, a2)], b)
    }

    /// A factor over no keys with constant error `error`.
    pub fn constant(error: f64) -> Self {
        Self {
            keys: Vec::new(),
            blocks: Vec::new(),
            rhs: DVector::zeros(0),
            error_offset: error,
        }
    }

    pub(crate) fn with_error_offset(mut self, offset: f64) -> Self {
        self.error_offset = offset;
        self
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn involves(&self, key: Key) -> bool {
        self.keys.contains(&key)
    }

    pub fn block(&self, key: Key) -> Option<&DMatrix<f64>> {
        self.keys
            .iter()
            .position(|&k| k == key)
            .map(|pos| &self.blocks[pos])
    }

    pub fn blocks(&self) -> impl Iterator<Item = (Key, &DMatrix<f64>)> + '_ {
        self.keys.iter().copied().zip(self.blocks.iter())
    }

    pub fn dim(&self, key: Key) -> Option<usize> {
        self.block(key).map(|b| b.ncols())
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    pub fn rows(&self) -> usize {
        self.rhs.len()
    }

    pub fn error_offset(&self) -> f64 {
        self.error_offset
    }

    /// `Σ A_k x_k − b` at the given values.
    pub fn residual(&self, values: &HybridValues) -> HybridResult<DVector<f64>> {
        let mut residual = -self.rhs.clone();
        for (key, block) in self.blocks() {
            let x = values.vector(key)?;
            if x.len() != block.ncols() {
                return Err(HybridError::Validation(format!(
                    "value for {} has dimension {}, factor expects {}",
                    key,
                    x.len(),
                    block.ncols()
                )));
            }
            residual += block * x;
        }
        Ok(residual)
    }

    /// `E(x) = ½‖Σ A_k x_k − b‖² + c`.
    pub fn error(&self, values: &HybridValues) -> HybridResult<f64> {
        let residual = self.residual(values)?;
        Ok(0.5 * residual.norm_squared() + self.error_offset)
    }

    /// `exp(-E(x))`.
    pub fn evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.error(values).map(|e| (-e).exp())
    }

    /// Information matrix `AᵀA` with its column layout `(key, dim)`.
    pub fn information(&self) -> (Vec<(Key, usize)>, DMatrix<f64>) {
        let layout: Vec<(Key, usize)> = self.blocks().map(|(k, b)| (k, b.ncols())).collect();
        let a = self.stacked_jacobian();
        (layout, a.transpose() * a)
    }

    fn stacked_jacobian(&self) -> DMatrix<f64> {
        let total: usize = self.blocks.iter().map(|b| b.ncols()).sum();
        let mut a = DMatrix::zeros(self.rows(), total);
        let mut col = 0;
        for block in &self.blocks {
            copy_block(&mut a, 0, col, block);
            col += block.ncols();
        }
        a
    }

    /// Smallest error over all values of the keys (the least-squares
    /// residual), defined even when `A` is rank deficient.
    pub fn min_error(&self) -> HybridResult<f64> {
        if self.keys.is_empty() {
            return Ok(0.5 * self.rhs.norm_squared() + self.error_offset);
        }
        let a = self.stacked_jacobian();
        let x = a
            .clone()
            .svd(true, true)
            .solve(&self.rhs, 1e-12)
            .map_err(|e| HybridError::NumericalRank(format!("least squares failed: {}", e)))?;
        let residual = a * x - &self.rhs;
        Ok(0.5 * residual.norm_squared() + self.error_offset)
    }

    /// `-ln ∫ φ(x) dx` over every key of the factor.
    ///
    /// Fails with [`HybridError::NumericalRank`] when the information matrix
    /// is singular, since the integral then diverges.
    pub fn log_integral_error(&self, rank_tolerance: f64) -> HybridResult<f64> {
        if self.keys.is_empty() {
            return Ok(0.5 * self.rhs.norm_squared() + self.error_offset);
        }
        let (_, remaining) = eliminate_gaussian(&[self], &self.keys, rank_tolerance)?;
        Ok(0.5 * remaining.rhs.norm_squared() + remaining.error_offset)
    }
}

/// A Gaussian density on frontal keys given parent keys.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianConditional {
    frontals: Vec<(Key, usize)>,
    parents: Vec<(Key, usize)>,
    r: DMatrix<f64>,
    s: DMatrix<f64>,
    d: DVector<f64>,
}

impl GaussianConditional {
    pub fn frontal_keys(&self) -> Vec<Key> {
        self.frontals.iter().map(|(k, _)| *k).collect()
    }

    pub fn parent_keys(&self) -> Vec<Key> {
        self.parents.iter().map(|(k, _)| *k).collect()
    }

    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn s(&self) -> &DMatrix<f64> {
        &self.s
    }

    pub fn d(&self) -> &DVector<f64> {
        &self.d
    }

    /// `ln(|det R| (2π)^{-n/2})`
    pub fn log_normalization_constant(&self) -> f64 {
        let n = self.r.nrows();
        let log_det: f64 = (0..n).map(|i| self.r[(i, i)].abs().ln()).sum();
        log_det - 0.5 * n as f64 * LN_2PI
    }

    /// `½‖R x_F + S x_S − d‖²`
    pub fn error(&self, values: &HybridValues) -> HybridResult<f64> {
        let x_f = stack_values(values, &self.frontals)?;
        let mut residual = &self.r * x_f - &self.d;
        if !self.parents.is_empty() {
            let x_s = stack_values(values, &self.parents)?;
            residual += &self.s * x_s;
        }
        Ok(0.5 * residual.norm_squared())
    }

    pub fn log_evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        Ok(self.log_normalization_constant() - self.error(values)?)
    }

    /// Density of the frontal values given the parent values.
    pub fn evaluate(&self, values: &HybridValues) -> HybridResult<f64> {
        self.log_evaluate(values).map(f64::exp)
    }

    /// Back-substitution: `x_F = R⁻¹ (d − S x_S)`.
    pub fn solve(&self, values: &HybridValues) -> HybridResult<Vec<(Key, DVector<f64>)>> {
        let mut rhs = self.d.clone();
        if !self.parents.is_empty() {
            let x_s = stack_values(values, &self.parents)?;
            rhs -= &self.s * x_s;
        }
        let x = self.r.solve_upper_triangular(&rhs).ok_or_else(|| {
            HybridError::NumericalRank(format!(
                "conditional on {} has a singular R factor",
                format_keys(&self.frontal_keys())
            ))
        })?;

        let mut out = Vec::with_capacity(self.frontals.len());
        let mut offset = 0;
        for &(key, dim) in &self.frontals {
            out.push((key, x.rows(offset, dim).into_owned()));
            offset += dim;
        }
        Ok(out)
    }
}

/// The conditional as a factor over frontals and parents, with blocks
/// `[R | S]`, rhs `d` and offset `-ln Z`, so that `exp(-E)` equals the
/// conditional density.
impl From<GaussianConditional> for JacobianFactor {
    fn from(conditional: GaussianConditional) -> Self {
        let error_offset = -conditional.log_normalization_constant();
        let rows = conditional.d.len();
        let mut keys = Vec::with_capacity(conditional.frontals.len() + conditional.parents.len());
        let mut blocks = Vec::with_capacity(keys.capacity());
        for (layout, matrix) in [
            (&conditional.frontals, &conditional.r),
            (&conditional.parents, &conditional.s),
        ] {
            let mut col = 0;
            for &(key, dim) in layout {
                keys.push(key);
                blocks.push(sub_matrix(matrix, 0, col, rows, dim));
                col += dim;
            }
        }
        Self {
            keys,
            blocks,
            rhs: conditional.d,
            error_offset,
        }
    }
}

/// Eliminates `frontals` from the product of `factors`.
///
/// Returns the conditional `p(x_F | x_S)` and the remaining factor on the
/// separator `S` (every other key of the factors, in ascending order).
pub fn eliminate_gaussian(
    factors: &[&JacobianFactor],
    frontals: &[Key],
    rank_tolerance: f64,
) -> HybridResult<(GaussianConditional, JacobianFactor)> {
    let mut dims: FxHashMap<Key, usize> = FxHashMap::default();
    let mut separator: BTreeSet<Key> = BTreeSet::new();
    let mut total_rows = 0;
    let mut error_offset = 0.0;
    for factor in factors {
        for (key, block) in factor.blocks() {
            match dims.get(&key) {
                Some(&dim) if dim != block.ncols() => {
                    return Err(HybridError::Structural(format!(
                        "key {} has dimension {} and {} in different factors",
                        key,
                        dim,
                        block.ncols()
                    )));
                }
                Some(_) => {}
                None => {
                    dims.insert(key, block.ncols());
                }
            }
            if !frontals.contains(&key) {
                separator.insert(key);
            }
        }
        total_rows += factor.rows();
        error_offset += factor.error_offset;
    }

    let mut frontal_layout: SmallVec<[(Key, usize); 4]> = SmallVec::new();
    for &key in frontals {
        let dim = dims.get(&key).copied().ok_or_else(|| {
            HybridError::NumericalRank(format!("no factor constrains variable {}", key))
        })?;
        frontal_layout.push((key, dim));
    }
    let parent_layout: Vec<(Key, usize)> = separator.iter().map(|k| (*k, dims[k])).collect();

    let nf: usize = frontal_layout.iter().map(|(_, d)| d).sum();
    let ns: usize = parent_layout.iter().map(|(_, d)| d).sum();
    let n = nf + ns;
    if total_rows < nf {
        return Err(HybridError::NumericalRank(format!(
            "eliminating {} needs {} rows of information, factors provide {}",
            format_keys(frontals),
            nf,
            total_rows
        )));
    }

    let mut columns: FxHashMap<Key, usize> = FxHashMap::default();
    let mut col = 0;
    for &(key, dim) in frontal_layout.iter().chain(parent_layout.iter()) {
        columns.insert(key, col);
        col += dim;
    }

    let mut ab = DMatrix::zeros(total_rows, n + 1);
    let mut row = 0;
    for factor in factors {
        for (key, block) in factor.blocks() {
            copy_block(&mut ab, row, columns[&key], block);
        }
        for i in 0..factor.rows() {
            ab[(row + i, n)] = factor.rhs[i];
        }
        row += factor.rows();
    }

    let r = ab.qr().r();

    let mut log_det = 0.0;
    for i in 0..nf {
        let pivot = r[(i, i)].abs();
        if pivot <= rank_tolerance || !pivot.is_finite() {
            return Err(HybridError::NumericalRank(format!(
                "frontal block of {} is rank deficient (pivot {:.3e} at column {})",
                format_keys(frontals),
                pivot,
                i
            )));
        }
        log_det += pivot.ln();
    }

    let conditional = GaussianConditional {
        frontals: frontal_layout.to_vec(),
        parents: parent_layout.clone(),
        r: sub_matrix(&r, 0, 0, nf, nf),
        s: sub_matrix(&r, 0, nf, nf, ns),
        d: DVector::from_fn(nf, |i, _| r[(i, n)]),
    };

    let remaining_rows = r.nrows() - nf;
    let mut blocks = Vec::with_capacity(parent_layout.len());
    let mut col = nf;
    for &(key, dim) in &parent_layout {
        blocks.push((key, sub_matrix(&r, nf, col, remaining_rows, dim)));
        col += dim;
    }
    let rhs = DVector::from_fn(remaining_rows, |i, _| r[(nf + i, n)]);
    let remaining = JacobianFactor::new(blocks, rhs)?
        .with_error_offset(error_offset - 0.5 * nf as f64 * LN_2PI + log_det);

    Ok((conditional, remaining))
}

fn copy_block(target: &mut DMatrix<f64>, row: usize, col: usize, block: &DMatrix<f64>) {
    for i in 0..block.nrows() {
        for j in 0..block.ncols() {
            target[(row + i, col + j)] = block[(i, j)];
        }
    }
}

fn sub_matrix(m: &DMatrix<f64>, row: usize, col: usize, rows: usize, cols: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows, cols, |i, j| m[(row + i, col + j)])
}

fn stack_values(values: &HybridValues, layout: &[(Key, usize)]) -> HybridResult<DVector<f64>> {
    let total: usize = layout.iter().map(|(_, d)| d).sum();
    let mut out = DVector::zeros(total);
    let mut offset = 0;
    for &(key, dim) in layout {
        let x = values.vector(key)?;
        if x.len() != dim {
            return Err(HybridError::Validation(format!(
                "value for {} has dimension {}, expected {}",
                key,
                x.len(),
                dim
            )));
        }
        out.rows_mut(offset, dim).copy_from(x);
        offset += dim;
    }
    Ok(out)
}

pub(crate) fn format_keys(keys: &[Key]) -> String {
    let names: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    format!("[{}]", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(i: u64) -> Key {
        Key::symbol('x', i)
    }

    fn eye(n: usize) -> DMatrix<f64> {
        DMatrix::identity(n, n)
    }

    fn values(entries: &[(Key, &[f64])]) -> HybridValues {
        let mut v = HybridValues::new();
        for (key, data) in entries {
            v.insert_continuous(*key, DVector::from_column_slice(data));
        }
        v
    }

    #[test]
    fn prior_and_between_leave_half_information() {
        let prior = JacobianFactor::unary(x(0), eye(3), DVector::zeros(3)).expect("prior");
        let between =
            JacobianFactor::binary(x(0), eye(3), x(1), -eye(3), DVector::zeros(3)).expect("between");

        let (conditional, remaining) =
            eliminate_gaussian(&[&prior, &between], &[x(0)], 1e-9).expect("eliminate");

        assert_eq!(conditional.frontal_keys(), vec![x(0)]);
        assert_eq!(conditional.parent_keys(), vec![x(1)]);
        assert_eq!(remaining.keys(), &[x(1)]);

        let (_, info) = remaining.information();
        assert!((info - eye(3) * 0.5).amax() < 1e-12);
        for i in 0..3 {
            assert!((conditional.r()[(i, i)].abs() - 2f64.sqrt()).abs() < 1e-12);
        }
    }

    #[test]
    fn remaining_constant_is_the_exact_integral() {
        // ∫ exp(-½(x − 1)²) dx = √(2π)
        let factor = JacobianFactor::unary(
            x(0),
            DMatrix::from_element(1, 1, 1.0),
            DVector::from_element(1, 1.0),
        )
        .expect("factor");
        let error = factor.log_integral_error(1e-9).expect("integral");
        assert!(((-error).exp() - (2.0 * std::f64::consts::PI).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn elimination_factorizes_the_product() {
        let prior = JacobianFactor::unary(
            x(0),
            DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.0, 1.0]),
            DVector::from_column_slice(&[1.0, -1.0]),
        )
        .expect("prior");
        let between = JacobianFactor::binary(
            x(0),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.3, 1.0]),
            x(1),
            -eye(2),
            DVector::from_column_slice(&[0.2, 0.1]),
        )
        .expect("between");
        let (conditional, remaining) =
            eliminate_gaussian(&[&prior, &between], &[x(0)], 1e-9).expect("eliminate");

        for point in [[0.0, 0.0, 0.0, 0.0], [1.0, -2.0, 0.5, 3.0], [-0.3, 0.7, 2.0, -1.0]] {
            let v = values(&[(x(0), &point[..2]), (x(1), &point[2..])]);
            let joint = prior.error(&v).unwrap() + between.error(&v).unwrap();
            let factored = -conditional.log_evaluate(&v).unwrap() + remaining.error(&v).unwrap();
            assert!((joint - factored).abs() < 1e-10, "{} vs {}", joint, factored);
        }
    }

    #[test]
    fn conditional_as_factor_eliminates_back_to_itself() {
        let prior = JacobianFactor::unary(x(0), eye(2), DVector::from_column_slice(&[1.0, -1.0]))
            .expect("prior");
        let between = JacobianFactor::binary(
            x(0),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.3, 1.0]),
            x(1),
            -eye(2),
            DVector::from_column_slice(&[0.2, 0.1]),
        )
        .expect("between");
        let (conditional, _) =
            eliminate_gaussian(&[&prior, &between], &[x(0)], 1e-9).expect("eliminate");

        let factor = JacobianFactor::from(conditional.clone());
        assert_eq!(factor.keys(), &[x(0), x(1)]);
        let (again, remaining) = eliminate_gaussian(&[&factor], &[x(0)], 1e-9).expect("again");
        assert_eq!(again.parent_keys(), vec![x(1)]);
        assert_eq!(remaining.rows(), 0);

        for point in [[0.0, 0.0, 0.0, 0.0], [1.0, -2.0, 0.5, 3.0]] {
            let v = values(&[(x(0), &point[..2]), (x(1), &point[2..])]);
            let density = conditional.log_evaluate(&v).unwrap();
            assert!((-factor.error(&v).unwrap() - density).abs() < 1e-12);
            assert!((again.log_evaluate(&v).unwrap() - density).abs() < 1e-10);
            assert!(remaining.error(&v).unwrap().abs() < 1e-10);
        }
    }

    #[test]
    fn min_error_handles_rank_deficient_blocks() {
        let between =
            JacobianFactor::binary(x(0), eye(2), x(1), -eye(2), DVector::from_element(2, 1.0))
                .expect("between");
        assert!(between.log_integral_error(1e-9).is_err());
        assert!(between.min_error().expect("least squares").abs() < 1e-12);
    }

    #[test]
    fn rank_deficient_frontal_is_rejected() {
        // One scalar row cannot determine a 2-D variable.
        let factor = JacobianFactor::unary(
            x(0),
            DMatrix::from_row_slice(1, 2, &[1.0, 1.0]),
            DVector::from_element(1, 0.0),
        )
        .expect("factor");
        assert!(matches!(
            eliminate_gaussian(&[&factor], &[x(0)], 1e-9),
            Err(HybridError::NumericalRank(_))
        ));

        let collinear = JacobianFactor::unary(
            x(0),
            DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 2.0, 2.0]),
            DVector::zeros(2),
        )
        .expect("factor");
        assert!(matches!(
            eliminate_gaussian(&[&collinear], &[x(0)], 1e-9),
            Err(HybridError::NumericalRank(_))
        ));
    }

    #[test]
    fn solve_recovers_least_squares_mean() {
        let prior = JacobianFactor::unary(x(0), eye(2), DVector::from_column_slice(&[1.0, 2.0]))
            .expect("prior");
        let (conditional, _) = eliminate_gaussian(&[&prior], &[x(0)], 1e-9).expect("eliminate");
        let solution = conditional.solve(&HybridValues::new()).expect("solve");
        assert_eq!(solution.len(), 1);
        assert!((&solution[0].1 - DVector::from_column_slice(&[1.0, 2.0])).amax() < 1e-12);
    }

    #[test]
    fn dimension_conflicts_are_structural() {
        let a = JacobianFactor::unary(x(0), eye(2), DVector::zeros(2)).expect("a");
        let b = JacobianFactor::unary(x(0), eye(3), DVector::zeros(3)).expect("b");
        assert!(matches!(
            eliminate_gaussian(&[&a, &b], &[x(0)], 1e-9),
            Err(HybridError::Structural(_))
        ));
    }

    #[test]
    fn constructor_validates_shapes() {
        assert!(matches!(
            JacobianFactor::unary(x(0), eye(2), DVector::zeros(3)),
            Err(HybridError::Validation(_))
        ));
        assert!(matches!(
            JacobianFactor::binary(x(0), eye(2), x(0), eye(2), DVector::zeros(2)),
            Err(HybridError::Validation(_))
        ));
    }
}
