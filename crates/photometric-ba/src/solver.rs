use std::num::NonZeroUsize;

use nalgebra::{DMatrix, DVector, SVD};

/// Damping used when escalating from an undamped (`λ = 0`) solve.
const MIN_ESCALATION_LAMBDA: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error("reduced system is not positive definite after {attempts} damping attempts (lambda={lambda:e})")]
    NotPositiveDefinite { attempts: usize, lambda: f64 },
    #[error("system dimension mismatch: hessian {rows}x{cols}, gradient {len}")]
    DimensionMismatch { rows: usize, cols: usize, len: usize },
    #[error("pseudo-inverse failed: {0}")]
    PseudoInverse(&'static str),
}

#[derive(Clone, Debug)]
pub struct DampedSolution {
    /// Solution of `(H + damping) Δ = −b`.
    pub step: DVector<f64>,
    /// Damping the step was computed with.
    pub lambda: f64,
    pub attempts: usize,
}

/// Solves `H Δ = −b` with Levenberg–Marquardt damping `H_ii ← H_ii(1+λ) + λ`.
///
/// Starts at `lambda` and multiplies it by `growth` every time the damped
/// matrix fails Cholesky or yields a non-finite step.
pub fn solve_damped(
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    lambda: f64,
    growth: f64,
    max_attempts: NonZeroUsize,
) -> Result<DampedSolution, SolveError> {
    let n = b.len();
    if h.nrows() != n || h.ncols() != n {
        return Err(SolveError::DimensionMismatch {
            rows: h.nrows(),
            cols: h.ncols(),
            len: n,
        });
    }
    let symmetric = (h + h.transpose()) * 0.5;
    let rhs = -b;
    let mut lambda = lambda.max(0.0);
    for attempt in 1..=max_attempts.get() {
        let mut damped = symmetric.clone();
        if lambda > 0.0 {
            for i in 0..n {
                damped[(i, i)] = damped[(i, i)] * (1.0 + lambda) + lambda;
            }
        }
        if let Some(cholesky) = damped.cholesky() {
            let step = cholesky.solve(&rhs);
            if step.iter().all(|v| v.is_finite()) {
                return Ok(DampedSolution {
                    step,
                    lambda,
                    attempts: attempt,
                });
            }
        }
        let next = lambda.max(MIN_ESCALATION_LAMBDA) * growth;
        log::warn!("reduced system not positive definite at lambda={lambda:e}, retrying with {next:e}");
        lambda = next;
    }
    Err(SolveError::NotPositiveDefinite {
        attempts: max_attempts.get(),
        lambda,
    })
}

/// Inverse of a symmetric positive semi-definite matrix, falling back to the
/// SVD pseudo-inverse when Cholesky fails. Rows are scaled by
/// `1/√(H_ii + 10)` first to equalize magnitudes.
pub(crate) fn inverse_psd(m: &DMatrix<f64>) -> Result<DMatrix<f64>, SolveError> {
    let n = m.nrows();
    let scale = DVector::from_fn(n, |i, _| 1.0 / (m[(i, i)].max(0.0) + 10.0).sqrt());
    let scaled = DMatrix::from_fn(n, n, |r, c| scale[r] * m[(r, c)] * scale[c]);
    let inverse = match scaled.clone().cholesky() {
        Some(cholesky) => cholesky.inverse(),
        None => SVD::new(scaled, true, true)
            .pseudo_inverse(1e-12)
            .map_err(SolveError::PseudoInverse)?,
    };
    Ok(DMatrix::from_fn(n, n, |r, c| scale[r] * inverse[(r, c)] * scale[c]))
}
