use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// One landmark's share of the joint system, ready for elimination.
///
/// `segments` holds the landmark's cross blocks with the reduced variables as
/// `(row offset, rows × dim)` pairs, sparse over the intrinsics and the frames
/// the landmark touches.
#[derive(Clone, Debug)]
pub(crate) struct EliminationBlock {
    pub(crate) hessian: DMatrix<f64>,
    pub(crate) inverse: DMatrix<f64>,
    pub(crate) gradient: DVector<f64>,
    pub(crate) segments: Vec<(usize, DMatrix<f64>)>,
}

impl EliminationBlock {
    pub(crate) fn dim(&self) -> usize {
        self.gradient.len()
    }

    /// Adds `S H⁻¹ Sᵀ` and `S H⁻¹ g` into `h_sc` and `b_sc`.
    pub(crate) fn add_correction(&self, h_sc: &mut DMatrix<f64>, b_sc: &mut DVector<f64>) {
        let weighted: Vec<DMatrix<f64>> = self
            .segments
            .iter()
            .map(|(_, s)| s * &self.inverse)
            .collect();
        for ((row, _), w) in self.segments.iter().zip(&weighted) {
            for (col, s) in &self.segments {
                let mut view = h_sc.view_mut((*row, *col), (w.nrows(), s.nrows()));
                view += w * s.transpose();
            }
            let mut view = b_sc.rows_mut(*row, w.nrows());
            view += w * &self.gradient;
        }
    }

    /// `Δ = −H⁻¹ (g + Sᵀ Δtop)`.
    pub(crate) fn back_substitute(&self, top_step: &DVector<f64>) -> DVector<f64> {
        let mut rhs = self.gradient.clone();
        for (row, s) in &self.segments {
            rhs += s.transpose() * top_step.rows(*row, s.nrows());
        }
        -(&self.inverse * rhs)
    }
}

/// `(Σ S H⁻¹ Sᵀ, Σ S H⁻¹ g)` over all blocks, reduced across rayon workers.
pub(crate) fn schur_correction(blocks: &[&EliminationBlock], dim: usize) -> (DMatrix<f64>, DVector<f64>) {
    blocks
        .par_iter()
        .fold(
            || (DMatrix::zeros(dim, dim), DVector::zeros(dim)),
            |(mut h, mut b), block| {
                block.add_correction(&mut h, &mut b);
                (h, b)
            },
        )
        .reduce(
            || (DMatrix::zeros(dim, dim), DVector::zeros(dim)),
            |(h1, b1), (h2, b2)| (h1 + h2, b1 + b2),
        )
}
