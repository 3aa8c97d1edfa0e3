use std::fmt::Debug;
use std::hash::Hash;

use nalgebra::{Matrix1, SMatrix, SVector, Vector1, Vector2, Vector4, Vector6};

use crate::accumulate::{
    plane_gradient, plane_hessian, point_gradient, point_hessian, Epochs, FrameTable, PairMatrix,
    PairVector,
};
use crate::camera::{project_pixel, project_with_jacobians, PinholeIntrinsics};
use crate::config::WindowConfig;
use crate::jacobian::{PlaneJacobian, PointJacobian};
use crate::state::{ImageSampler, PlaneState, PointState};
use crate::window::WindowError;
use crate::{
    FrameId, FrameKey, Generation, Matrix8x3, PatternVector, PlaneId, PointId, Pose, Vector8,
    PATTERN, PATTERN_LEN,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResidualStatus {
    /// Never linearized or evaluated.
    Unevaluated,
    Good,
    /// Projection left the target image or fell behind the camera.
    OutOfBounds,
    /// Energy above the outlier threshold.
    Outlier,
}

/// Which category a cache belongs to and the window epoch it was computed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CacheStamp {
    Linearized(u64),
    Evaluated(u64),
}

/// Everything a residual needs from its (host, target) pair.
pub struct PairContext<'a, S: ?Sized> {
    pub(crate) intrinsics: &'a PinholeIntrinsics,
    /// Target from host: `T_t T_h⁻¹`.
    pub(crate) relative: &'a Pose,
    pub(crate) a_rel: f64,
    pub(crate) b_rel: f64,
    pub(crate) target_id: FrameId,
    pub(crate) images: &'a S,
    pub(crate) config: &'a WindowConfig,
}

/// Relative parameter increments of one (host, target) pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RelativeStep {
    pub(crate) dc: Vector4<f64>,
    pub(crate) dxi: Vector6<f64>,
    pub(crate) dab: Vector2<f64>,
}

impl RelativeStep {
    pub(crate) fn new(dc: Vector4<f64>, relative: &Vector8) -> Self {
        Self {
            dc,
            dxi: relative.fixed_rows::<6>(0).into_owned(),
            dab: relative.fixed_rows::<2>(6).into_owned(),
        }
    }
}

fn huber_weight(r: f64, k: f64) -> f64 {
    let a = r.abs();
    if a <= k {
        1.0
    } else {
        k / a
    }
}

fn huber_energy(r: f64, k: f64) -> f64 {
    let a = r.abs();
    if a <= k {
        r * r
    } else {
        k * (2.0 * a - k)
    }
}

pub enum Evaluation<J> {
    OutOfBounds,
    Computed { jacobian: J, energy: f64 },
}

/// Landmark parametrization behind an observation: an inverse depth on a
/// host pixel (`D = 1`) or an inverse normal in host coordinates (`D = 3`).
///
/// Everything that depends on the parametrization lives here; caching,
/// categories and Schur bookkeeping are shared by [`Observation`] and
/// [`crate::landmark::LandmarkShadow`].
pub trait LandmarkModel<const D: usize>: Clone + Debug + Send + Sync + 'static {
    type Id: Copy + Debug + Eq + Hash + Send + Sync;
    type State: Clone + Debug + Send + Sync;
    type Jacobian: Clone + Debug + PartialEq + Send + Sync;
    type Residual: Clone + Debug + Send + Sync;

    fn empty_jacobian() -> Self::Jacobian;

    fn empty_residual() -> Self::Residual;

    /// The landmark variable of `state`.
    fn variable(state: &Self::State) -> SVector<f64, D>;

    fn evaluate<S: ImageSampler + ?Sized>(
        state: &Self::State,
        ctx: &PairContext<'_, S>,
    ) -> Evaluation<Self::Jacobian>;

    fn pixels(jacobian: &Self::Jacobian) -> usize;

    fn residual(jacobian: &Self::Jacobian) -> &Self::Residual;

    /// `base + sign · J (step, dl)`.
    fn shifted(
        jacobian: &Self::Jacobian,
        base: &Self::Residual,
        step: &RelativeStep,
        dl: &SVector<f64, D>,
        sign: f64,
    ) -> Self::Residual;

    /// Pose and affine rows of `Jᵀ J_l`, in relative coordinates.
    fn cross(jacobian: &Self::Jacobian) -> SMatrix<f64, 8, D>;

    /// Pair Hessian, landmark self-Hessian and intrinsics–landmark block.
    fn hessian(jacobian: &Self::Jacobian) -> (PairMatrix, SMatrix<f64, D, D>, SMatrix<f64, 4, D>);

    /// Pair gradient, landmark gradient and energy `|r|²` at residual `r`.
    fn gradient(jacobian: &Self::Jacobian, r: &Self::Residual) -> (PairVector, SVector<f64, D>, f64);
}

/// Point landmarks: one inverse depth, an 8-pixel pattern.
#[derive(Clone, Copy, Debug)]
pub struct InverseDepth;

/// Plane landmarks: an inverse normal, one residual per plane pixel.
#[derive(Clone, Copy, Debug)]
pub struct InverseNormal;

impl LandmarkModel<1> for InverseDepth {
    type Id = PointId;
    type State = PointState;
    type Jacobian = PointJacobian;
    type Residual = PatternVector;

    fn empty_jacobian() -> PointJacobian {
        PointJacobian::zeros()
    }

    fn empty_residual() -> PatternVector {
        PatternVector::zeros()
    }

    fn variable(state: &PointState) -> Vector1<f64> {
        Vector1::new(state.idepth)
    }

    fn evaluate<S: ImageSampler + ?Sized>(
        point: &PointState,
        ctx: &PairContext<'_, S>,
    ) -> Evaluation<PointJacobian> {
        if !(point.idepth.is_finite() && point.idepth > 0.0) {
            return Evaluation::OutOfBounds;
        }
        let rotation = ctx.relative.rotation.matrix();
        let translation = &ctx.relative.translation.vector;
        let Some(centre) =
            project_with_jacobians(ctx.intrinsics, rotation, translation, &point.pixel, point.idepth)
        else {
            return Evaluation::OutOfBounds;
        };

        let scale = ctx.a_rel.exp();
        let k = ctx.config.huber_threshold();
        let mut jac = PointJacobian::zeros();
        jac.jp_dxi = centre.jp_dxi;
        jac.jp_dc = centre.jp_dc;
        jac.jp_dd = centre.jp_dd;

        let mut energy = 0.0;
        for (idx, (du, dv)) in PATTERN.iter().enumerate() {
            let host_pixel = point.pixel + Vector2::new(*du, *dv);
            let Some(px) =
                project_pixel(ctx.intrinsics, rotation, translation, &host_pixel, point.idepth)
            else {
                return Evaluation::OutOfBounds;
            };
            let Some(sample) = ctx.images.sample(ctx.target_id, px.x, px.y) else {
                return Evaluation::OutOfBounds;
            };
            let reference = point.reference[idx];
            let raw = sample.value - scale * reference - ctx.b_rel;
            let w = huber_weight(raw, k).sqrt();
            energy += huber_energy(raw, k);
            jac.res[idx] = w * raw;
            jac.j_idx[0][idx] = w * sample.gradient.x;
            jac.j_idx[1][idx] = w * sample.gradient.y;
            jac.j_ab[0][idx] = -w * scale * reference;
            jac.j_ab[1][idx] = -w;
        }
        jac.compute_shorthands();
        Evaluation::Computed {
            jacobian: jac,
            energy,
        }
    }

    fn pixels(_jacobian: &PointJacobian) -> usize {
        PATTERN_LEN
    }

    fn residual(jacobian: &PointJacobian) -> &PatternVector {
        &jacobian.res
    }

    fn shifted(
        jacobian: &PointJacobian,
        base: &PatternVector,
        step: &RelativeStep,
        dl: &Vector1<f64>,
        sign: f64,
    ) -> PatternVector {
        base + jacobian.residual_change(&step.dc, &step.dxi, &step.dab, dl[0]) * sign
    }

    fn cross(jacobian: &PointJacobian) -> Vector8 {
        let j2_dd = jacobian.j_idx2 * jacobian.jp_dd;
        let mut cross = Vector8::zeros();
        cross
            .fixed_rows_mut::<6>(0)
            .copy_from(&(jacobian.jp_dxi.transpose() * j2_dd));
        cross
            .fixed_rows_mut::<2>(6)
            .copy_from(&(jacobian.jab_jidx * jacobian.jp_dd));
        cross
    }

    fn hessian(jacobian: &PointJacobian) -> (PairMatrix, Matrix1<f64>, Vector4<f64>) {
        let (h, hdd, hcd) = point_hessian(jacobian);
        (h, Matrix1::new(hdd), hcd)
    }

    fn gradient(jacobian: &PointJacobian, r: &PatternVector) -> (PairVector, Vector1<f64>, f64) {
        let (b, bd, energy) = point_gradient(jacobian, r);
        (b, Vector1::new(bd), energy)
    }
}

impl LandmarkModel<3> for InverseNormal {
    type Id = PlaneId;
    type State = PlaneState;
    type Jacobian = PlaneJacobian;
    type Residual = Vec<f64>;

    fn empty_jacobian() -> PlaneJacobian {
        PlaneJacobian::default()
    }

    fn empty_residual() -> Vec<f64> {
        Vec::new()
    }

    fn variable(state: &PlaneState) -> SVector<f64, 3> {
        state.inverse_normal
    }

    fn evaluate<S: ImageSampler + ?Sized>(
        plane: &PlaneState,
        ctx: &PairContext<'_, S>,
    ) -> Evaluation<PlaneJacobian> {
        if plane.pixels.is_empty() || !plane.inverse_normal.iter().all(|v| v.is_finite()) {
            return Evaluation::OutOfBounds;
        }
        let rotation = ctx.relative.rotation.matrix();
        let translation = &ctx.relative.translation.vector;
        let n = &plane.inverse_normal;
        let scale = ctx.a_rel.exp();
        let k = ctx.config.huber_threshold();

        let mut jac = PlaneJacobian::with_capacity(plane.pixels.len());
        let mut energy = 0.0;
        for pixel in &plane.pixels {
            let idepth = n.dot(&ctx.intrinsics.normalized(&pixel.pixel));
            if !(idepth > 0.0) {
                return Evaluation::OutOfBounds;
            }
            let Some(proj) =
                project_with_jacobians(ctx.intrinsics, rotation, translation, &pixel.pixel, idepth)
            else {
                return Evaluation::OutOfBounds;
            };
            let Some(sample) = ctx.images.sample(ctx.target_id, proj.pixel.x, proj.pixel.y) else {
                return Evaluation::OutOfBounds;
            };

            // the pixel's inverse depth depends on the intrinsics through p_n
            let mut jp_dc = proj.jp_dc;
            for (col, dpn) in proj.dpn_dc.iter().enumerate() {
                let column = jp_dc.column(col) + proj.jp_dd * n.dot(dpn);
                jp_dc.set_column(col, &column);
            }
            let jp_dn = proj.jp_dd * proj.p_n.transpose();

            let raw = sample.value - scale * pixel.intensity - ctx.b_rel;
            let w = huber_weight(raw, k).sqrt();
            energy += huber_energy(raw, k);
            jac.push(
                w * raw,
                proj.jp_dxi,
                jp_dc,
                jp_dn,
                sample.gradient * w,
                Vector2::new(-w * scale * pixel.intensity, -w),
            );
        }
        Evaluation::Computed {
            jacobian: jac,
            energy,
        }
    }

    fn pixels(jacobian: &PlaneJacobian) -> usize {
        jacobian.len()
    }

    fn residual(jacobian: &PlaneJacobian) -> &Vec<f64> {
        &jacobian.res
    }

    fn shifted(
        jacobian: &PlaneJacobian,
        base: &Vec<f64>,
        step: &RelativeStep,
        dl: &SVector<f64, 3>,
        sign: f64,
    ) -> Vec<f64> {
        let change = jacobian.residual_change(&step.dc, &step.dxi, &step.dab, dl);
        base.iter().zip(change).map(|(r, c)| r + sign * c).collect()
    }

    fn cross(jacobian: &PlaneJacobian) -> Matrix8x3 {
        let mut cross = Matrix8x3::zeros();
        for k in 0..jacobian.len() {
            let j2_dn = jacobian.j_idx2[k] * jacobian.jp_dn[k];
            let mut view = cross.fixed_view_mut::<6, 3>(0, 0);
            view += jacobian.jp_dxi[k].transpose() * j2_dn;
            let mut view = cross.fixed_view_mut::<2, 3>(6, 0);
            view += jacobian.jab_jidx[k] * jacobian.jp_dn[k];
        }
        cross
    }

    fn hessian(jacobian: &PlaneJacobian) -> (PairMatrix, SMatrix<f64, 3, 3>, SMatrix<f64, 4, 3>) {
        plane_hessian(jacobian)
    }

    fn gradient(jacobian: &PlaneJacobian, r: &Vec<f64>) -> (PairVector, SVector<f64, 3>, f64) {
        plane_gradient(jacobian, r)
    }
}

/// Backend shadow of one landmark observation in one target frame.
#[derive(Clone, Debug)]
pub struct Observation<M: LandmarkModel<D>, const D: usize> {
    target_id: FrameId,
    pub(crate) host: FrameKey,
    pub(crate) target: FrameKey,
    pub(crate) host_idx: usize,
    pub(crate) target_idx: usize,
    pub(crate) idx_in_all: usize,
    pub(crate) indexed_at: Generation,
    pub(crate) cache: M::Jacobian,
    pub(crate) res_to_zero: M::Residual,
    pub(crate) cross: SMatrix<f64, 8, D>,
    energy: f64,
    pub(crate) stamp: Option<CacheStamp>,
    pub(crate) is_linearized: bool,
    pub(crate) is_active_and_good: bool,
    status: ResidualStatus,
    frontend_outlier: bool,
}

pub type PointResidual = Observation<InverseDepth, 1>;
pub type PlaneResidual = Observation<InverseNormal, 3>;

impl<M: LandmarkModel<D>, const D: usize> Observation<M, D> {
    pub(crate) fn new(target_id: FrameId, host: FrameKey, target: FrameKey) -> Self {
        Self {
            target_id,
            host,
            target,
            host_idx: 0,
            target_idx: 0,
            idx_in_all: 0,
            indexed_at: Generation::default(),
            cache: M::empty_jacobian(),
            res_to_zero: M::empty_residual(),
            cross: SMatrix::zeros(),
            energy: 0.0,
            stamp: None,
            is_linearized: false,
            is_active_and_good: false,
            status: ResidualStatus::Unevaluated,
            frontend_outlier: false,
        }
    }

    pub fn target_id(&self) -> FrameId {
        self.target_id
    }

    pub fn target(&self) -> FrameKey {
        self.target
    }

    pub fn host_idx(&self) -> usize {
        self.host_idx
    }

    pub fn target_idx(&self) -> usize {
        self.target_idx
    }

    pub fn idx_in_all(&self) -> usize {
        self.idx_in_all
    }

    pub fn status(&self) -> ResidualStatus {
        self.status
    }

    pub fn is_linearized(&self) -> bool {
        self.is_linearized
    }

    pub fn is_active_and_good(&self) -> bool {
        self.is_active_and_good
    }

    pub fn is_frontend_outlier(&self) -> bool {
        self.frontend_outlier
    }

    /// Robust energy of the last linearization or evaluation.
    pub fn energy(&self) -> f64 {
        self.energy
    }

    pub fn jacobian(&self) -> &M::Jacobian {
        &self.cache
    }

    /// Residual at the linearization point, for the linearized category.
    pub fn res_to_zero(&self) -> &M::Residual {
        &self.res_to_zero
    }

    pub(crate) fn set_frontend_outlier(&mut self, outlier: bool) {
        self.frontend_outlier = outlier;
        self.refresh_flags();
    }

    fn refresh_flags(&mut self) {
        self.is_active_and_good = self.status == ResidualStatus::Good && !self.frontend_outlier;
    }

    /// Residual whose Jacobians can enter an accumulation pass.
    pub(crate) fn contributes(&self) -> bool {
        self.is_active_and_good && self.stamp.is_some()
    }

    /// Linearized residual whose Hessian sits in the window's pair cache.
    pub(crate) fn is_cached(&self) -> bool {
        self.is_linearized && self.contributes()
    }

    /// Fails when the cached indices or Jacobians are not from the window's
    /// current generation and epochs.
    pub(crate) fn check(&self, epochs: &Epochs, table: &FrameTable) -> Result<(), WindowError> {
        if self.indexed_at != epochs.generation
            || self.host_idx >= table.frames()
            || self.target_idx >= table.frames()
        {
            return Err(WindowError::StaleIndices {
                cached: self.indexed_at,
                current: epochs.generation,
            });
        }
        let fresh = match self.stamp {
            Some(CacheStamp::Linearized(epoch)) => {
                self.is_linearized && epoch == epochs.linearization
            }
            Some(CacheStamp::Evaluated(epoch)) => !self.is_linearized && epoch == epochs.evaluation,
            None => false,
        };
        if fresh {
            Ok(())
        } else {
            Err(WindowError::StaleJacobian {
                host: table.id(self.host_idx),
                target: table.id(self.target_idx),
            })
        }
    }

    pub(crate) fn hessian(&self) -> (PairMatrix, SMatrix<f64, D, D>, SMatrix<f64, 4, D>) {
        M::hessian(&self.cache)
    }

    fn store<S: ImageSampler + ?Sized>(&mut self, state: &M::State, ctx: &PairContext<'_, S>) {
        match M::evaluate(state, ctx) {
            Evaluation::OutOfBounds => {
                self.status = ResidualStatus::OutOfBounds;
            }
            Evaluation::Computed { jacobian, energy } => {
                let limit = ctx.config.outlier_energy_per_pixel() * M::pixels(&jacobian) as f64;
                self.status = if energy > limit {
                    ResidualStatus::Outlier
                } else {
                    ResidualStatus::Good
                };
                self.energy = energy;
                self.cross = M::cross(&jacobian);
                self.cache = jacobian;
            }
        }
        self.refresh_flags();
    }

    /// Evaluates at the window's linearization point. A good evaluation
    /// joins the linearized category; any other outcome stays active so the
    /// next refresh evaluates it again.
    pub(crate) fn linearize<S: ImageSampler + ?Sized>(
        &mut self,
        state: &M::State,
        ctx: &PairContext<'_, S>,
        epoch: u64,
    ) {
        self.store(state, ctx);
        if self.status == ResidualStatus::Good {
            self.res_to_zero = M::residual(&self.cache).clone();
            self.is_linearized = true;
            self.stamp = Some(CacheStamp::Linearized(epoch));
        } else {
            self.is_linearized = false;
            self.stamp = None;
        }
    }

    /// Evaluates at the current state for the active category.
    pub(crate) fn evaluate<S: ImageSampler + ?Sized>(
        &mut self,
        state: &M::State,
        ctx: &PairContext<'_, S>,
        epoch: u64,
    ) {
        self.store(state, ctx);
        self.is_linearized = false;
        self.stamp = Some(CacheStamp::Evaluated(epoch));
    }

    /// Re-centres an active residual on the linearization point using its
    /// current Jacobians and the increments `step`, `dl` accumulated since.
    pub(crate) fn fix_linearization(&mut self, step: &RelativeStep, dl: &SVector<f64, D>, epoch: u64) {
        self.res_to_zero = M::shifted(&self.cache, M::residual(&self.cache), step, dl, -1.0);
        self.is_linearized = true;
        self.stamp = Some(CacheStamp::Linearized(epoch));
    }

    /// First-order residual of the linearized category at `step`, `dl`.
    pub(crate) fn corrected_residual(&self, step: &RelativeStep, dl: &SVector<f64, D>) -> M::Residual {
        M::shifted(&self.cache, &self.res_to_zero, step, dl, 1.0)
    }
}
