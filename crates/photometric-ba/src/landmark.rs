use nalgebra::{DMatrix, DVector, SMatrix, SVector, Vector3};

use crate::accumulate::{
    Epochs, FrameTable, PairAdjoints, PairMatrix, PairTable, PairVector, PassAccumulator,
    SystemLayout,
};
use crate::config::WindowConfig;
use crate::residual::{InverseDepth, InverseNormal, LandmarkModel, Observation};
use crate::schur::EliminationBlock;
use crate::state::ImageSampler;
use crate::window::WindowError;
use crate::{FrameKey, PlaneHandle, PlaneId, PointHandle, PointId, INTRINSICS_DIM};

/// Lifecycle of a landmark. A landmark only ever leaves `Good`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LandmarkStatus {
    Good,
    /// Fold into the marginalization prior at the next opportunity.
    Marginalize,
    /// Discard without keeping its information.
    Drop,
}

impl LandmarkStatus {
    pub fn can_become(self, next: LandmarkStatus) -> bool {
        self == next || self == LandmarkStatus::Good
    }
}

/// Identifies a landmark in a system or update, by backend handle and
/// frontend id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LandmarkRef {
    Point { handle: PointHandle, id: PointId },
    Plane { handle: PlaneHandle, id: PlaneId },
}

/// Sums `adjointᵀ · cross` per frame index, for the landmark's Schur segments.
fn add_frame_cross<const D: usize>(
    segments: &mut Vec<(usize, SMatrix<f64, 8, D>)>,
    idx: usize,
    cross: SMatrix<f64, 8, D>,
) {
    match segments.iter_mut().find(|(i, _)| *i == idx) {
        Some((_, existing)) => *existing += cross,
        None => segments.push((idx, cross)),
    }
}

fn to_segments<const D: usize>(
    layout: &SystemLayout,
    intrinsics: &SMatrix<f64, 4, D>,
    frames: Vec<(usize, SMatrix<f64, 8, D>)>,
) -> Vec<(usize, DMatrix<f64>)> {
    let mut segments = Vec::with_capacity(frames.len() + 1);
    segments.push((
        0,
        DMatrix::from_column_slice(INTRINSICS_DIM, D, intrinsics.as_slice()),
    ));
    for (idx, cross) in frames {
        segments.push((
            layout.frame_offset(idx),
            DMatrix::from_column_slice(8, D, cross.as_slice()),
        ));
    }
    segments
}

/// Inverse of a landmark self-Hessian, or `None` when its smallest
/// eigenvalue is not above `threshold`.
fn invert<const D: usize>(h: &SMatrix<f64, D, D>, threshold: f64) -> Option<SMatrix<f64, D, D>> {
    if !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    let dynamic = DMatrix::from_column_slice(D, D, h.as_slice());
    let smallest = dynamic.clone().symmetric_eigenvalues().min();
    if !(smallest > threshold) {
        return None;
    }
    let inverse = dynamic.cholesky()?.inverse();
    Some(SMatrix::from_column_slice(inverse.as_slice()))
}

/// One contributing residual's share of a pass, held back until the
/// landmark is known to be eliminable.
enum Pending {
    Linearized {
        host: usize,
        target: usize,
        b: PairVector,
        energy: f64,
    },
    Active {
        host: usize,
        target: usize,
        h: Box<PairMatrix>,
        b: PairVector,
        energy: f64,
    },
}

/// Backend shadow of a landmark: its host, prior, linearization point and
/// observations, plus the self-terms of the last accumulation pass.
#[derive(Clone, Debug)]
pub struct LandmarkShadow<M: LandmarkModel<D>, const D: usize> {
    id: M::Id,
    host: FrameKey,
    prior: SMatrix<f64, D, D>,
    prior_mean: SVector<f64, D>,
    linearization: SVector<f64, D>,
    current: M::State,
    delta: SVector<f64, D>,
    pub(crate) idx_in_host: usize,
    pub(crate) residuals: Vec<Observation<M, D>>,
    hll_l: SMatrix<f64, D, D>,
    hcl_l: SMatrix<f64, 4, D>,
    bl_l: SVector<f64, D>,
    hll_a: SMatrix<f64, D, D>,
    hcl_a: SMatrix<f64, 4, D>,
    bl_a: SVector<f64, D>,
    bl_sum: SVector<f64, D>,
    hli: SMatrix<f64, D, D>,
    status: LandmarkStatus,
}

/// A point landmark: an inverse depth on a host pixel.
pub type PointShadow = LandmarkShadow<InverseDepth, 1>;

/// A plane landmark: an inverse normal in host coordinates.
pub type PlaneShadow = LandmarkShadow<InverseNormal, 3>;

impl<M: LandmarkModel<D>, const D: usize> LandmarkShadow<M, D> {
    pub(crate) fn new(
        id: M::Id,
        host: FrameKey,
        state: &M::State,
        prior: SMatrix<f64, D, D>,
    ) -> Self {
        let variable = M::variable(state);
        Self {
            id,
            host,
            prior,
            prior_mean: variable,
            linearization: variable,
            current: state.clone(),
            delta: SVector::zeros(),
            idx_in_host: 0,
            residuals: Vec::new(),
            hll_l: SMatrix::zeros(),
            hcl_l: SMatrix::zeros(),
            bl_l: SVector::zeros(),
            hll_a: SMatrix::zeros(),
            hcl_a: SMatrix::zeros(),
            bl_a: SVector::zeros(),
            bl_sum: SVector::zeros(),
            hli: SMatrix::zeros(),
            status: LandmarkStatus::Good,
        }
    }

    pub fn id(&self) -> M::Id {
        self.id
    }

    pub fn host(&self) -> FrameKey {
        self.host
    }

    pub fn status(&self) -> LandmarkStatus {
        self.status
    }

    pub fn prior(&self) -> &SMatrix<f64, D, D> {
        &self.prior
    }

    pub fn current_state(&self) -> &M::State {
        &self.current
    }

    /// Landmark variable at the linearization point.
    pub fn linearization(&self) -> &SVector<f64, D> {
        &self.linearization
    }

    pub fn delta(&self) -> &SVector<f64, D> {
        &self.delta
    }

    pub fn idx_in_host(&self) -> usize {
        self.idx_in_host
    }

    pub fn residuals(&self) -> &[Observation<M, D>] {
        &self.residuals
    }

    /// Self-Hessian (linearized, active) of the last pass, without the prior.
    pub fn self_hessian(&self) -> (&SMatrix<f64, D, D>, &SMatrix<f64, D, D>) {
        (&self.hll_l, &self.hll_a)
    }

    pub fn gradient_sum(&self) -> &SVector<f64, D> {
        &self.bl_sum
    }

    /// Inverse of the total self-Hessian; zero when the landmark was skipped.
    pub fn inverse_hessian(&self) -> &SMatrix<f64, D, D> {
        &self.hli
    }

    pub fn has_good_residual(&self) -> bool {
        self.residuals.iter().any(|r| r.is_active_and_good())
    }

    pub(crate) fn set_status(&mut self, next: LandmarkStatus) -> Result<(), WindowError> {
        if !self.status.can_become(next) {
            return Err(WindowError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn update_current(&mut self, state: M::State) {
        self.delta = M::variable(&state) - self.linearization;
        self.current = state;
    }

    pub(crate) fn reset_linearization(&mut self, state: M::State) {
        self.linearization = M::variable(&state);
        self.update_current(state);
    }

    pub(crate) fn linearize_residuals<S: ImageSampler + ?Sized>(
        &mut self,
        table: &FrameTable,
        images: &S,
        config: &WindowConfig,
        epoch: u64,
    ) {
        for r in &mut self.residuals {
            let ctx = table.context(r.host_idx, r.target_idx, images, config);
            r.linearize(&self.current, &ctx, epoch);
        }
        self.hll_l = SMatrix::zeros();
        self.hcl_l = SMatrix::zeros();
        for r in self.residuals.iter().filter(|r| r.is_cached()) {
            let (_, hll, hcl) = r.hessian();
            self.hll_l += hll;
            self.hcl_l += hcl;
        }
    }

    pub(crate) fn evaluate_residuals<S: ImageSampler + ?Sized>(
        &mut self,
        table: &FrameTable,
        images: &S,
        config: &WindowConfig,
        epoch: u64,
    ) {
        for r in self.residuals.iter_mut().filter(|r| !r.is_linearized) {
            let ctx = table.context(r.host_idx, r.target_idx, images, config);
            r.evaluate(&self.current, &ctx, epoch);
        }
    }

    pub(crate) fn add_linearized_hessians(&self, pairs: &mut PairTable) {
        for r in self.residuals.iter().filter(|r| r.is_cached()) {
            pairs.add_hessian(r.host_idx, r.target_idx, &r.hessian().0);
        }
    }

    /// Takes residual `i`'s linearized contribution out of the caches.
    fn retract(&mut self, i: usize, pairs: &mut PairTable) {
        let r = &self.residuals[i];
        if r.is_cached() {
            let (h, hll, hcl) = r.hessian();
            pairs.sub_hessian(r.host_idx, r.target_idx, &h);
            self.hll_l -= hll;
            self.hcl_l -= hcl;
        }
    }

    fn restore(&mut self, i: usize, pairs: &mut PairTable) {
        let r = &self.residuals[i];
        if r.is_cached() {
            let (h, hll, hcl) = r.hessian();
            pairs.add_hessian(r.host_idx, r.target_idx, &h);
            self.hll_l += hll;
            self.hcl_l += hcl;
        }
    }

    pub(crate) fn set_residual_outlier(
        &mut self,
        target: FrameKey,
        outlier: bool,
        pairs: &mut PairTable,
    ) -> bool {
        let Some(i) = self.residuals.iter().position(|r| r.target == target) else {
            return false;
        };
        self.retract(i, pairs);
        self.residuals[i].set_frontend_outlier(outlier);
        self.restore(i, pairs);
        true
    }

    pub(crate) fn remove_residual(&mut self, target: FrameKey, pairs: &mut PairTable) -> bool {
        let Some(i) = self.residuals.iter().position(|r| r.target == target) else {
            return false;
        };
        self.retract(i, pairs);
        self.residuals.remove(i);
        true
    }

    /// Retracts every residual; used before the landmark is dropped.
    pub(crate) fn retract_all(&mut self, pairs: &mut PairTable) {
        for i in 0..self.residuals.len() {
            self.retract(i, pairs);
        }
    }

    /// One accumulation pass over this landmark's residuals. Returns the
    /// block for Schur elimination, or `None` when the self-Hessian is not
    /// above `singular_threshold`: the landmark then gets no update and adds
    /// nothing to the pass, and its cached linearized Hessians go to
    /// `acc.excluded`.
    pub(crate) fn accumulate(
        &mut self,
        acc: &mut PassAccumulator,
        table: &FrameTable,
        layout: &SystemLayout,
        epochs: &Epochs,
        singular_threshold: f64,
    ) -> Result<Option<EliminationBlock>, WindowError> {
        self.hll_a = SMatrix::zeros();
        self.hcl_a = SMatrix::zeros();
        self.bl_a = SVector::zeros();
        self.bl_l = SVector::zeros();
        let mut pending = Vec::with_capacity(self.residuals.len());
        for r in self.residuals.iter().filter(|r| r.contributes()) {
            r.check(epochs, table)?;
            let (host, target) = (r.host_idx, r.target_idx);
            if r.is_linearized {
                let corrected = r.corrected_residual(&table.step(host, target), &self.delta);
                let (b, bl, energy) = M::gradient(&r.cache, &corrected);
                self.bl_l += bl;
                pending.push(Pending::Linearized {
                    host,
                    target,
                    b,
                    energy,
                });
            } else {
                let (h, hll, hcl) = r.hessian();
                let (b, bl, energy) = M::gradient(&r.cache, M::residual(&r.cache));
                self.hll_a += hll;
                self.hcl_a += hcl;
                self.bl_a += bl;
                pending.push(Pending::Active {
                    host,
                    target,
                    h: Box::new(h),
                    b,
                    energy,
                });
            }
        }

        let hll = self.hll_a + self.hll_l + self.prior;
        let offset = M::variable(&self.current) - self.prior_mean;
        self.bl_sum = self.bl_a + self.bl_l + self.prior * offset;
        let Some(inverse) = invert(&hll, singular_threshold) else {
            self.hli = SMatrix::zeros();
            self.add_linearized_hessians(&mut acc.excluded);
            return Ok(None);
        };
        self.hli = inverse;

        for contribution in pending {
            match contribution {
                Pending::Linearized {
                    host,
                    target,
                    b,
                    energy,
                } => acc.linearized.add_gradient(host, target, &b, energy),
                Pending::Active {
                    host,
                    target,
                    h,
                    b,
                    energy,
                } => {
                    acc.active.add_hessian(host, target, &h);
                    acc.active.add_gradient(host, target, &b, energy);
                }
            }
        }
        acc.prior_energy += offset.dot(&(self.prior * offset));

        Ok(Some(EliminationBlock {
            hessian: DMatrix::from_column_slice(D, D, hll.as_slice()),
            inverse: DMatrix::from_column_slice(D, D, inverse.as_slice()),
            gradient: DVector::from_column_slice(self.bl_sum.as_slice()),
            segments: self.frame_cross(table, layout),
        }))
    }

    fn frame_cross(&self, table: &FrameTable, layout: &SystemLayout) -> Vec<(usize, DMatrix<f64>)> {
        let mut frames: Vec<(usize, SMatrix<f64, 8, D>)> = Vec::new();
        for r in self.residuals.iter().filter(|r| r.contributes()) {
            let adjoints = if r.is_linearized {
                &table.lin_adjoints
            } else {
                &table.cur_adjoints
            };
            let (h, t) = (r.host_idx, r.target_idx);
            add_frame_cross(&mut frames, h, adjoints.host(h, t).transpose() * r.cross);
            add_frame_cross(&mut frames, t, adjoints.target(h, t).transpose() * r.cross);
        }
        to_segments(layout, &(self.hcl_a + self.hcl_l), frames)
    }

    /// Full contribution of this landmark to the reduced system at the
    /// window's linearization point, with the landmark eliminated. Active
    /// residuals are fixed to the linearization point and every linearized
    /// contribution is taken out of `pairs`.
    ///
    /// `None` when the self-Hessian is not above `singular_threshold`: the
    /// cached contributions still leave `pairs`, but nothing is kept, as if
    /// the landmark had been dropped.
    pub(crate) fn marginal_contribution(
        &mut self,
        table: &FrameTable,
        layout: &SystemLayout,
        pairs: &mut PairTable,
        epochs: &Epochs,
        singular_threshold: f64,
    ) -> Result<Option<(DMatrix<f64>, DVector<f64>)>, WindowError> {
        let mut hll = self.prior;
        for r in self.residuals.iter().filter(|r| r.contributes()) {
            r.check(epochs, table)?;
            hll += r.hessian().1;
        }
        let Some(inverse) = invert(&hll, singular_threshold) else {
            self.retract_all(pairs);
            return Ok(None);
        };

        let mut local = PairTable::zeros(table.frames());
        let mut hcl = SMatrix::<f64, 4, D>::zeros();
        let mut bl = self.prior * (self.linearization - self.prior_mean);
        let mut frames: Vec<(usize, SMatrix<f64, 8, D>)> = Vec::new();
        let lin: &PairAdjoints = &table.lin_adjoints;
        for r in self.residuals.iter_mut().filter(|r| r.contributes()) {
            let (h, t) = (r.host_idx, r.target_idx);
            let (hm, _, hcl_r) = r.hessian();
            if r.is_linearized {
                pairs.sub_hessian(h, t, &hm);
            } else {
                r.fix_linearization(&table.step(h, t), &self.delta, epochs.linearization);
            }
            let (b, bl_r, _) = M::gradient(&r.cache, &r.res_to_zero);
            local.add_hessian(h, t, &hm);
            local.add_gradient(h, t, &b, 0.0);
            hcl += hcl_r;
            bl += bl_r;
            add_frame_cross(&mut frames, h, lin.host(h, t).transpose() * r.cross);
            add_frame_cross(&mut frames, t, lin.target(h, t).transpose() * r.cross);
        }
        self.hll_l = SMatrix::zeros();
        self.hcl_l = SMatrix::zeros();

        let dim = layout.dim();
        let mut h_out = DMatrix::zeros(dim, dim);
        let mut b_out = DVector::zeros(dim);
        local.stitch(lin, layout, &mut h_out, &mut b_out);

        let mut s = DMatrix::zeros(dim, D);
        for (row, segment) in to_segments(layout, &hcl, frames) {
            let mut view = s.view_mut((row, 0), (segment.nrows(), D));
            view += segment;
        }
        let weighted = &s * DMatrix::from_column_slice(D, D, inverse.as_slice());
        h_out -= &weighted * s.transpose();
        b_out -= weighted * DVector::from_column_slice(bl.as_slice());
        Ok(Some((h_out, b_out)))
    }
}

impl PointShadow {
    pub fn idepth(&self) -> f64 {
        self.current.idepth
    }
}

impl PlaneShadow {
    pub fn inverse_normal(&self) -> &Vector3<f64> {
        &self.current.inverse_normal
    }
}
