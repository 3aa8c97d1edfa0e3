use nalgebra::{DMatrix, DVector};

use crate::solver::{inverse_psd, SolveError};
use crate::{Matrix8, FRAME_DIM};

/// Dense quadratic prior `δᵀ H δ + 2 bᵀ δ` over the reduced variables, at the
/// window's linearization point. Holds the information of everything that
/// has left the window.
#[derive(Clone, Debug, PartialEq)]
pub struct MarginalPrior {
    h: DMatrix<f64>,
    b: DVector<f64>,
}

impl MarginalPrior {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            h: DMatrix::zeros(dim, dim),
            b: DVector::zeros(dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.b.len()
    }

    pub fn hessian(&self) -> &DMatrix<f64> {
        &self.h
    }

    pub fn gradient(&self) -> &DVector<f64> {
        &self.b
    }

    pub fn is_zero(&self) -> bool {
        self.h.iter().all(|v| *v == 0.0) && self.b.iter().all(|v| *v == 0.0)
    }

    /// Block of frame `offset..offset + 8`.
    pub fn frame_block(&self, offset: usize) -> Matrix8 {
        self.h.fixed_view::<FRAME_DIM, FRAME_DIM>(offset, offset).into_owned()
    }

    /// Appends 8 zero rows and columns for a new frame.
    pub(crate) fn push_frame(&mut self) {
        let dim = self.dim() + FRAME_DIM;
        let mut h = DMatrix::zeros(dim, dim);
        h.view_mut((0, 0), (self.dim(), self.dim())).copy_from(&self.h);
        let mut b = DVector::zeros(dim);
        b.rows_mut(0, self.dim()).copy_from(&self.b);
        self.h = h;
        self.b = b;
    }

    pub(crate) fn fold(&mut self, h: &DMatrix<f64>, b: &DVector<f64>) {
        self.h += h;
        self.b += b;
    }

    /// Moves the expansion point by `delta`: `b ← b + H δ`.
    pub(crate) fn recenter(&mut self, delta: &DVector<f64>) {
        self.b += &self.h * delta;
    }

    /// Quadratic form at `delta` and its half-gradient.
    pub(crate) fn evaluate(&self, delta: &DVector<f64>) -> (f64, DVector<f64>) {
        let h_delta = &self.h * delta;
        let energy = delta.dot(&h_delta) + 2.0 * self.b.dot(delta);
        (energy, h_delta + &self.b)
    }

    /// Schur-eliminates rows `offset..offset + len` and removes them.
    pub(crate) fn eliminate(&mut self, offset: usize, len: usize) -> Result<(), SolveError> {
        let dim = self.dim();
        let keep: Vec<usize> = (0..dim)
            .filter(|i| *i < offset || *i >= offset + len)
            .collect();
        let elim: Vec<usize> = (offset..offset + len).collect();

        let h_kk = self.h.select_rows(&keep).select_columns(&keep);
        let h_ke = self.h.select_rows(&keep).select_columns(&elim);
        let h_ee = self.h.select_rows(&elim).select_columns(&elim);
        let b_k = self.b.select_rows(&keep);
        let b_e = self.b.select_rows(&elim);

        let h_ee_inv = inverse_psd(&h_ee)?;
        let weighted = &h_ke * h_ee_inv;
        let h = h_kk - &weighted * h_ke.transpose();
        self.h = (&h + h.transpose()) * 0.5;
        self.b = b_k - weighted * b_e;
        Ok(())
    }
}
