//! The sliding window: membership, linearization passes, accumulation into
//! the reduced system, solving and marginalization.

use nalgebra::{DMatrix, DVector, Matrix1, Matrix3, Vector3, Vector4};
use rayon::prelude::*;
use slotmap::{SecondaryMap, SlotMap};

use crate::accumulate::{Epochs, FrameTable, PairTable, PassAccumulator, SystemLayout};
use crate::camera::PinholeIntrinsics;
use crate::config::WindowConfig;
use crate::frame::{FramePrior, FrameShadow};
use crate::landmark::{LandmarkRef, LandmarkShadow, LandmarkStatus, PlaneShadow, PointShadow};
use crate::marginal::MarginalPrior;
use crate::report::OptimizationReport;
use crate::residual::{LandmarkModel, PlaneResidual, PointResidual, ResidualStatus};
use crate::schur::{schur_correction, EliminationBlock};
use crate::solver::{solve_damped, DampedSolution, SolveError};
use crate::state::{FrameState, FrontendState, ImageSampler, PlaneState, PointState, StepUpdate};
use crate::{
    FrameId, FrameKey, Generation, PlaneHandle, PlaneId, PointHandle, PointId, Vector8, FRAME_DIM,
    INTRINSICS_DIM,
};

#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error("unknown frame {0:?}")]
    UnknownFrame(FrameKey),
    #[error("frame {0:?} is already in the window")]
    DuplicateFrame(FrameId),
    #[error("unknown point {0:?}")]
    UnknownPoint(PointHandle),
    #[error("unknown plane {0:?}")]
    UnknownPlane(PlaneHandle),
    #[error("landmark cannot be observed from its host frame {0:?}")]
    SelfObservation(FrameKey),
    #[error("landmark already has a residual in frame {0:?}")]
    DuplicateResidual(FrameKey),
    #[error("landmark has no residual in frame {0:?}")]
    UnknownResidual(FrameKey),
    #[error("illegal landmark transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: LandmarkStatus,
        to: LandmarkStatus,
    },
    #[error("landmark prior must be finite and non-negative")]
    InvalidPrior,
    #[error("frontend has no state for frame {0:?}")]
    MissingFrame(FrameId),
    #[error("frontend has no state for point {0:?}")]
    MissingPoint(PointId),
    #[error("frontend has no state for plane {0:?}")]
    MissingPlane(PlaneId),
    #[error("jacobian cache of residual {host:?} -> {target:?} does not match the current epoch")]
    StaleJacobian { host: FrameId, target: FrameId },
    #[error("indices computed at generation {cached:?}, window is at {current:?}")]
    StaleIndices {
        cached: Generation,
        current: Generation,
    },
    #[error(transparent)]
    Solve(#[from] SolveError),
}

/// Result of one accumulation pass: the full system over
/// `[intrinsics, frames...]` with the landmarks' Schur complement applied,
/// plus what back-substitution needs.
#[derive(Clone, Debug)]
pub struct AccumulatedSystem {
    layout: SystemLayout,
    frame_ids: Vec<FrameId>,
    hessian: DMatrix<f64>,
    gradient: DVector<f64>,
    reduced_hessian: DMatrix<f64>,
    reduced_gradient: DVector<f64>,
    eliminations: Eliminations,
    energy: f64,
    generation: Generation,
}

impl AccumulatedSystem {
    pub fn layout(&self) -> SystemLayout {
        self.layout
    }

    /// Frame ids in system order.
    pub fn frame_ids(&self) -> &[FrameId] {
        &self.frame_ids
    }

    /// Hessian over the reduced variables before landmark elimination.
    pub fn hessian(&self) -> &DMatrix<f64> {
        &self.hessian
    }

    pub fn gradient(&self) -> &DVector<f64> {
        &self.gradient
    }

    pub fn reduced_hessian(&self) -> &DMatrix<f64> {
        &self.reduced_hessian
    }

    pub fn reduced_gradient(&self) -> &DVector<f64> {
        &self.reduced_gradient
    }

    /// Total energy: residuals, landmark, frame and intrinsics priors, and the
    /// marginalization prior.
    pub fn energy(&self) -> f64 {
        self.energy
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Landmarks skipped for this pass because their self-Hessian was
    /// near-singular. They contribute nothing to the system or the energy.
    pub fn skipped_landmarks(&self) -> impl Iterator<Item = LandmarkRef> + '_ {
        self.eliminations
            .iter()
            .filter(|(_, block)| block.is_none())
            .map(|(landmark, _)| *landmark)
    }

    /// Turns a step of the reduced variables into a full update, with
    /// back-substituted landmark steps. Skipped landmarks get a zero step.
    pub fn update_from(&self, top: &DVector<f64>) -> StepUpdate {
        let mut update = StepUpdate {
            intrinsics: top.fixed_rows::<INTRINSICS_DIM>(0).into_owned(),
            ..StepUpdate::default()
        };
        for (idx, id) in self.frame_ids.iter().enumerate() {
            let offset = self.layout.frame_offset(idx);
            update
                .frames
                .push((*id, top.fixed_rows::<FRAME_DIM>(offset).into_owned()));
        }
        for (landmark, block) in &self.eliminations {
            let step = block.as_ref().map(|b| b.back_substitute(top));
            match landmark {
                LandmarkRef::Point { id, .. } => {
                    update.points.push((*id, step.map_or(0.0, |s| s[0])));
                }
                LandmarkRef::Plane { id, .. } => {
                    let step = step.map_or_else(Vector3::zeros, |s| Vector3::new(s[0], s[1], s[2]));
                    update.planes.push((*id, step));
                }
            }
        }
        update
    }

    /// The unreduced joint system with every eliminated landmark appended
    /// after the reduced variables.
    pub fn joint(&self) -> JointSystem {
        let top_dim = self.layout.dim();
        let blocks: Vec<(LandmarkRef, &EliminationBlock)> = self
            .eliminations
            .iter()
            .filter_map(|(landmark, block)| block.as_ref().map(|b| (*landmark, b)))
            .collect();
        let dim = top_dim + blocks.iter().map(|(_, b)| b.dim()).sum::<usize>();

        let mut hessian = DMatrix::zeros(dim, dim);
        let mut gradient = DVector::zeros(dim);
        hessian
            .view_mut((0, 0), (top_dim, top_dim))
            .copy_from(&self.hessian);
        gradient.rows_mut(0, top_dim).copy_from(&self.gradient);

        let mut landmarks = Vec::with_capacity(blocks.len());
        let mut offset = top_dim;
        for (landmark, block) in blocks {
            let d = block.dim();
            hessian
                .view_mut((offset, offset), (d, d))
                .copy_from(&block.hessian);
            for (row, s) in &block.segments {
                let mut view = hessian.view_mut((*row, offset), (s.nrows(), d));
                view += s;
                let mut view = hessian.view_mut((offset, *row), (d, s.nrows()));
                view += s.transpose();
            }
            gradient.rows_mut(offset, d).copy_from(&block.gradient);
            landmarks.push((landmark, offset, d));
            offset += d;
        }
        JointSystem {
            hessian,
            gradient,
            top_dim,
            landmarks,
        }
    }
}

/// Unreduced normal equations, for verification against the Schur path.
#[derive(Clone, Debug)]
pub struct JointSystem {
    pub hessian: DMatrix<f64>,
    pub gradient: DVector<f64>,
    /// Rows of the reduced variables, which come first.
    pub top_dim: usize,
    /// Each landmark with its row offset and dimension.
    pub landmarks: Vec<(LandmarkRef, usize, usize)>,
}

type Eliminations = Vec<(LandmarkRef, Option<EliminationBlock>)>;
type PointRefs<'a> = Vec<(PointHandle, &'a mut PointShadow)>;
type PlaneRefs<'a> = Vec<(PlaneHandle, &'a mut PlaneShadow)>;

fn landmarks_mut(frames: &mut SlotMap<FrameKey, FrameShadow>) -> (PointRefs<'_>, PlaneRefs<'_>) {
    let mut points = Vec::new();
    let mut planes = Vec::new();
    for (frame, shadow) in frames.iter_mut() {
        for (point, p) in shadow.points.iter_mut() {
            points.push((PointHandle { frame, point }, p));
        }
        for (plane, p) in shadow.planes.iter_mut() {
            planes.push((PlaneHandle { frame, plane }, p));
        }
    }
    (points, planes)
}

/// One parallel accumulation pass over `landmarks`.
fn accumulate_landmarks<H, M, const D: usize>(
    landmarks: Vec<(H, &mut LandmarkShadow<M, D>)>,
    landmark_ref: impl Fn(H, M::Id) -> LandmarkRef + Send + Sync,
    table: &FrameTable,
    layout: &SystemLayout,
    epochs: &Epochs,
    singular_threshold: f64,
) -> Result<(PassAccumulator, Eliminations), WindowError>
where
    H: Copy + Send,
    M: LandmarkModel<D>,
{
    let n = table.frames();
    landmarks
        .into_par_iter()
        .try_fold(
            || (PassAccumulator::new(n), Vec::new()),
            |(mut acc, mut blocks), (handle, landmark)| {
                let block =
                    landmark.accumulate(&mut acc, table, layout, epochs, singular_threshold)?;
                blocks.push((landmark_ref(handle, landmark.id()), block));
                Ok::<_, WindowError>((acc, blocks))
            },
        )
        .try_reduce(
            || (PassAccumulator::new(n), Vec::new()),
            |(a, mut blocks), (b, rest)| {
                blocks.extend(rest);
                Ok((a.merged(b), blocks))
            },
        )
}

/// Moves landmarks of one frame into the marginalization prior.
struct Folding<'a> {
    table: &'a FrameTable,
    layout: SystemLayout,
    epochs: Epochs,
    singular_threshold: f64,
    pairs: &'a mut PairTable,
    marginal: &'a mut MarginalPrior,
}

impl Folding<'_> {
    /// Folds every `Marginalize` landmark (every landmark with `all`) and
    /// removes it; `Drop` landmarks and landmarks with a singular
    /// self-Hessian are removed without keeping anything. Returns the number
    /// marginalized and dropped.
    fn fold<K, M, const D: usize>(
        &mut self,
        landmarks: &mut SlotMap<K, LandmarkShadow<M, D>>,
        all: bool,
    ) -> Result<(usize, usize), WindowError>
    where
        K: slotmap::Key,
        M: LandmarkModel<D>,
    {
        let keys: Vec<K> = landmarks
            .iter()
            .filter(|(_, l)| all || l.status() == LandmarkStatus::Marginalize)
            .map(|(k, _)| k)
            .collect();
        let mut marginalized = 0;
        let mut dropped = 0;
        for key in keys {
            let Some(landmark) = landmarks.get_mut(key) else {
                continue;
            };
            if landmark.status() == LandmarkStatus::Drop {
                landmark.retract_all(self.pairs);
                dropped += 1;
            } else {
                match landmark.marginal_contribution(
                    self.table,
                    &self.layout,
                    self.pairs,
                    &self.epochs,
                    self.singular_threshold,
                )? {
                    Some((h, b)) => {
                        self.marginal.fold(&h, &b);
                        marginalized += 1;
                    }
                    None => {
                        log::debug!(
                            "landmark {:?} has a singular self-Hessian, dropped instead of marginalized",
                            landmark.id()
                        );
                        dropped += 1;
                    }
                }
            }
            landmarks.remove(key);
        }
        Ok((marginalized, dropped))
    }
}

/// Backend window over keyframes and the landmarks they host.
///
/// All state the frontend owns (poses, brightness, depths, normals,
/// intrinsics) is read through [`FrontendState`]; the window keeps the
/// linearization point, deltas since it, the Jacobian caches and the
/// marginalization prior.
#[derive(Debug)]
pub struct Window {
    config: WindowConfig,
    frames: SlotMap<FrameKey, FrameShadow>,
    order: Vec<FrameKey>,
    intrinsics_prior_mean: PinholeIntrinsics,
    intrinsics_linearization: PinholeIntrinsics,
    intrinsics_current: PinholeIntrinsics,
    marginal: MarginalPrior,
    /// Pair Hessians of the linearized category, fixed between
    /// relinearization events.
    linearized_pairs: PairTable,
    generation: Generation,
    indexed_at: Generation,
    linearization_epoch: u64,
    evaluation_epoch: u64,
}

impl Window {
    pub fn new(config: WindowConfig, intrinsics: PinholeIntrinsics) -> Self {
        Self {
            config,
            frames: SlotMap::with_key(),
            order: Vec::new(),
            intrinsics_prior_mean: intrinsics,
            intrinsics_linearization: intrinsics,
            intrinsics_current: intrinsics,
            marginal: MarginalPrior::new(INTRINSICS_DIM),
            linearized_pairs: PairTable::zeros(0),
            generation: Generation::default(),
            indexed_at: Generation::default(),
            linearization_epoch: 0,
            evaluation_epoch: 0,
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn frame_count(&self) -> usize {
        self.order.len()
    }

    pub fn point_count(&self) -> usize {
        self.frames.values().map(|f| f.points.len()).sum()
    }

    pub fn plane_count(&self) -> usize {
        self.frames.values().map(|f| f.planes.len()).sum()
    }

    pub fn frame_key(&self, id: FrameId) -> Option<FrameKey> {
        self.frames
            .iter()
            .find(|(_, f)| f.id() == id)
            .map(|(key, _)| key)
    }

    pub fn frame(&self, key: FrameKey) -> Option<&FrameShadow> {
        self.frames.get(key)
    }

    /// Frames in window order, oldest first.
    pub fn frames(&self) -> impl Iterator<Item = (FrameKey, &FrameShadow)> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.frames.get(*key).map(|f| (*key, f)))
    }

    pub fn point(&self, handle: PointHandle) -> Option<&PointShadow> {
        self.frames.get(handle.frame)?.points.get(handle.point)
    }

    pub fn plane(&self, handle: PlaneHandle) -> Option<&PlaneShadow> {
        self.frames.get(handle.frame)?.planes.get(handle.plane)
    }

    pub fn frame_delta(&self, key: FrameKey) -> Option<&Vector8> {
        self.frames.get(key).map(|f| f.delta())
    }

    pub fn point_delta(&self, handle: PointHandle) -> Option<f64> {
        self.point(handle).map(|p| p.delta()[0])
    }

    pub fn plane_delta(&self, handle: PlaneHandle) -> Option<Vector3<f64>> {
        self.plane(handle).map(|p| *p.delta())
    }

    /// Intrinsics change since the linearization point.
    pub fn intrinsics_delta(&self) -> Vector4<f64> {
        self.intrinsics_current.as_vector() - self.intrinsics_linearization.as_vector()
    }

    pub fn frame_prior(&self, key: FrameKey) -> Option<FramePrior> {
        let frame = self.frames.get(key)?;
        let layout = SystemLayout::new(self.order.len());
        Some(FramePrior {
            diagonal: *frame.prior(),
            delta_prior: *frame.delta_prior(),
            marginal: self.marginal.frame_block(layout.frame_offset(frame.idx)),
        })
    }

    pub fn marginal_prior(&self) -> &MarginalPrior {
        &self.marginal
    }

    /// `Good` landmarks whose every residual has been evaluated and none is
    /// active; the window policy may flag them `Drop`.
    pub fn drop_candidates(&self) -> Vec<LandmarkRef> {
        fn evaluated(mut statuses: impl Iterator<Item = ResidualStatus>) -> bool {
            statuses.all(|s| s != ResidualStatus::Unevaluated)
        }
        let mut out = Vec::new();
        for (frame, shadow) in self.frames.iter() {
            for (point, p) in shadow.points.iter() {
                if p.status() == LandmarkStatus::Good
                    && !p.has_good_residual()
                    && evaluated(p.residuals().iter().map(PointResidual::status))
                {
                    out.push(LandmarkRef::Point {
                        handle: PointHandle { frame, point },
                        id: p.id(),
                    });
                }
            }
            for (plane, p) in shadow.planes.iter() {
                if p.status() == LandmarkStatus::Good
                    && !p.has_good_residual()
                    && evaluated(p.residuals().iter().map(PlaneResidual::status))
                {
                    out.push(LandmarkRef::Plane {
                        handle: PlaneHandle { frame, plane },
                        id: p.id(),
                    });
                }
            }
        }
        out
    }

    fn bump_generation(&mut self) {
        self.generation = self.generation.next();
        self.reindex();
    }

    /// Recomputes every cached index for the current generation.
    fn reindex(&mut self) {
        let generation = self.generation;
        let mut indices = SecondaryMap::new();
        for (idx, key) in self.order.iter().enumerate() {
            if let Some(frame) = self.frames.get_mut(*key) {
                frame.idx = idx;
                frame.indexed_at = generation;
                indices.insert(*key, idx);
            }
        }
        let mut idx_in_all = 0;
        for key in &self.order {
            let Some(frame) = self.frames.get_mut(*key) else {
                continue;
            };
            for (idx_in_host, (_, point)) in frame.points.iter_mut().enumerate() {
                point.idx_in_host = idx_in_host;
                for r in &mut point.residuals {
                    if let (Some(h), Some(t)) = (indices.get(r.host), indices.get(r.target)) {
                        r.host_idx = *h;
                        r.target_idx = *t;
                        r.indexed_at = generation;
                    }
                    r.idx_in_all = idx_in_all;
                    idx_in_all += 1;
                }
            }
            for (idx_in_host, (_, plane)) in frame.planes.iter_mut().enumerate() {
                plane.idx_in_host = idx_in_host;
                for r in &mut plane.residuals {
                    if let (Some(h), Some(t)) = (indices.get(r.host), indices.get(r.target)) {
                        r.host_idx = *h;
                        r.target_idx = *t;
                        r.indexed_at = generation;
                    }
                    r.idx_in_all = idx_in_all;
                    idx_in_all += 1;
                }
            }
        }
        self.indexed_at = generation;
    }

    fn epochs(&self) -> Epochs {
        Epochs {
            linearization: self.linearization_epoch,
            evaluation: self.evaluation_epoch,
            generation: self.generation,
        }
    }

    fn frame_table(&self) -> FrameTable {
        let frames: Vec<&FrameShadow> = self
            .order
            .iter()
            .filter_map(|key| self.frames.get(*key))
            .collect();
        FrameTable::new(
            self.intrinsics_current,
            self.intrinsics_delta(),
            frames.iter().map(|f| f.id()).collect(),
            &frames.iter().map(|f| *f.current_state()).collect::<Vec<_>>(),
            &frames
                .iter()
                .map(|f| *f.linearization_state())
                .collect::<Vec<_>>(),
            &frames.iter().map(|f| *f.delta()).collect::<Vec<_>>(),
        )
    }

    /// `[δc, δframe_0, δframe_1, ...]` relative to the linearization point.
    fn stacked_delta(&self) -> DVector<f64> {
        let layout = SystemLayout::new(self.order.len());
        let mut delta = DVector::zeros(layout.dim());
        delta
            .fixed_rows_mut::<INTRINSICS_DIM>(0)
            .copy_from(&self.intrinsics_delta());
        for (idx, (_, frame)) in self.frames().enumerate() {
            delta
                .fixed_rows_mut::<FRAME_DIM>(layout.frame_offset(idx))
                .copy_from(frame.delta());
        }
        delta
    }

    pub fn add_frame(&mut self, id: FrameId, state: FrameState) -> Result<FrameKey, WindowError> {
        if self.frame_key(id).is_some() {
            return Err(WindowError::DuplicateFrame(id));
        }
        let prior = if self.order.is_empty() {
            Vector8::repeat(self.config.first_frame_prior())
        } else {
            let [a, b] = self.config.affine_prior();
            let mut prior = Vector8::zeros();
            prior[6] = a;
            prior[7] = b;
            prior
        };
        let key = self.frames.insert(FrameShadow::new(id, state, prior));
        self.order.push(key);
        self.marginal.push_frame();
        self.linearized_pairs.push_frame();
        self.bump_generation();
        log::debug!("frame {} added, window holds {} frames", id.as_u64(), self.order.len());
        Ok(key)
    }

    pub fn add_point(
        &mut self,
        host: FrameKey,
        id: PointId,
        state: &PointState,
        prior: f64,
    ) -> Result<PointHandle, WindowError> {
        if !(prior.is_finite() && prior >= 0.0) {
            return Err(WindowError::InvalidPrior);
        }
        let frame = self
            .frames
            .get_mut(host)
            .ok_or(WindowError::UnknownFrame(host))?;
        let point = frame
            .points
            .insert(PointShadow::new(id, host, state, Matrix1::new(prior)));
        self.bump_generation();
        Ok(PointHandle { frame: host, point })
    }

    pub fn add_plane(
        &mut self,
        host: FrameKey,
        id: PlaneId,
        state: &PlaneState,
        prior: Matrix3<f64>,
    ) -> Result<PlaneHandle, WindowError> {
        let symmetric = (prior - prior.transpose()).amax() <= 1e-12 * (1.0 + prior.amax());
        if !prior.iter().all(|v| v.is_finite()) || !symmetric || prior.diagonal().min() < 0.0 {
            return Err(WindowError::InvalidPrior);
        }
        let frame = self
            .frames
            .get_mut(host)
            .ok_or(WindowError::UnknownFrame(host))?;
        let plane = frame.planes.insert(PlaneShadow::new(id, host, state, prior));
        self.bump_generation();
        Ok(PlaneHandle { frame: host, plane })
    }

    fn target_id(&self, host: FrameKey, target: FrameKey) -> Result<FrameId, WindowError> {
        if host == target {
            return Err(WindowError::SelfObservation(target));
        }
        self.frames
            .get(target)
            .map(|f| f.id())
            .ok_or(WindowError::UnknownFrame(target))
    }

    /// Links a new observation of `handle` in frame `target`. It takes part in
    /// accumulation from the next [`Self::refresh`] or [`Self::relinearize`].
    pub fn add_point_residual(
        &mut self,
        handle: PointHandle,
        target: FrameKey,
    ) -> Result<(), WindowError> {
        let target_id = self.target_id(handle.frame, target)?;
        let point = self
            .frames
            .get_mut(handle.frame)
            .and_then(|f| f.points.get_mut(handle.point))
            .ok_or(WindowError::UnknownPoint(handle))?;
        if point.residuals.iter().any(|r| r.target == target) {
            return Err(WindowError::DuplicateResidual(target));
        }
        point
            .residuals
            .push(PointResidual::new(target_id, handle.frame, target));
        self.bump_generation();
        Ok(())
    }

    pub fn add_plane_residual(
        &mut self,
        handle: PlaneHandle,
        target: FrameKey,
    ) -> Result<(), WindowError> {
        let target_id = self.target_id(handle.frame, target)?;
        let plane = self
            .frames
            .get_mut(handle.frame)
            .and_then(|f| f.planes.get_mut(handle.plane))
            .ok_or(WindowError::UnknownPlane(handle))?;
        if plane.residuals.iter().any(|r| r.target == target) {
            return Err(WindowError::DuplicateResidual(target));
        }
        plane
            .residuals
            .push(PlaneResidual::new(target_id, handle.frame, target));
        self.bump_generation();
        Ok(())
    }

    fn point_mut(&mut self, handle: PointHandle) -> Result<&mut PointShadow, WindowError> {
        self.frames
            .get_mut(handle.frame)
            .and_then(|f| f.points.get_mut(handle.point))
            .ok_or(WindowError::UnknownPoint(handle))
    }

    fn plane_mut(&mut self, handle: PlaneHandle) -> Result<&mut PlaneShadow, WindowError> {
        self.frames
            .get_mut(handle.frame)
            .and_then(|f| f.planes.get_mut(handle.plane))
            .ok_or(WindowError::UnknownPlane(handle))
    }

    pub fn set_point_status(
        &mut self,
        handle: PointHandle,
        status: LandmarkStatus,
    ) -> Result<(), WindowError> {
        self.point_mut(handle)?.set_status(status)
    }

    pub fn set_plane_status(
        &mut self,
        handle: PlaneHandle,
        status: LandmarkStatus,
    ) -> Result<(), WindowError> {
        self.plane_mut(handle)?.set_status(status)
    }

    /// Sets the frontend outlier flag of one observation. A linearized
    /// observation's cached contribution is removed or restored exactly.
    pub fn set_point_residual_outlier(
        &mut self,
        handle: PointHandle,
        target: FrameKey,
        outlier: bool,
    ) -> Result<(), WindowError> {
        let point = self
            .frames
            .get_mut(handle.frame)
            .and_then(|f| f.points.get_mut(handle.point))
            .ok_or(WindowError::UnknownPoint(handle))?;
        if point.set_residual_outlier(target, outlier, &mut self.linearized_pairs) {
            Ok(())
        } else {
            Err(WindowError::UnknownResidual(target))
        }
    }

    pub fn set_plane_residual_outlier(
        &mut self,
        handle: PlaneHandle,
        target: FrameKey,
        outlier: bool,
    ) -> Result<(), WindowError> {
        let plane = self
            .frames
            .get_mut(handle.frame)
            .and_then(|f| f.planes.get_mut(handle.plane))
            .ok_or(WindowError::UnknownPlane(handle))?;
        if plane.set_residual_outlier(target, outlier, &mut self.linearized_pairs) {
            Ok(())
        } else {
            Err(WindowError::UnknownResidual(target))
        }
    }

    pub fn drop_point_residual(
        &mut self,
        handle: PointHandle,
        target: FrameKey,
    ) -> Result<(), WindowError> {
        let point = self
            .frames
            .get_mut(handle.frame)
            .and_then(|f| f.points.get_mut(handle.point))
            .ok_or(WindowError::UnknownPoint(handle))?;
        if !point.remove_residual(target, &mut self.linearized_pairs) {
            return Err(WindowError::UnknownResidual(target));
        }
        self.bump_generation();
        Ok(())
    }

    pub fn drop_plane_residual(
        &mut self,
        handle: PlaneHandle,
        target: FrameKey,
    ) -> Result<(), WindowError> {
        let plane = self
            .frames
            .get_mut(handle.frame)
            .and_then(|f| f.planes.get_mut(handle.plane))
            .ok_or(WindowError::UnknownPlane(handle))?;
        if !plane.remove_residual(target, &mut self.linearized_pairs) {
            return Err(WindowError::UnknownResidual(target));
        }
        self.bump_generation();
        Ok(())
    }

    /// Removes every `Drop` landmark without keeping its information.
    pub fn drop_flagged(&mut self) -> usize {
        let mut dropped = 0;
        for frame in self.frames.values_mut() {
            frame.points.retain(|_, p| {
                if p.status() != LandmarkStatus::Drop {
                    return true;
                }
                p.retract_all(&mut self.linearized_pairs);
                dropped += 1;
                false
            });
            frame.planes.retain(|_, p| {
                if p.status() != LandmarkStatus::Drop {
                    return true;
                }
                p.retract_all(&mut self.linearized_pairs);
                dropped += 1;
                false
            });
        }
        if dropped > 0 {
            self.bump_generation();
            log::debug!("dropped {dropped} landmarks");
        }
        dropped
    }

    /// Folds every `Marginalize` landmark into the marginalization prior and
    /// removes it; one with a singular self-Hessian is dropped instead.
    /// Refreshes against the frontend first. Returns the number folded.
    pub fn marginalize_flagged<F, S>(&mut self, frontend: &F, images: &S) -> Result<usize, WindowError>
    where
        F: FrontendState + ?Sized,
        S: ImageSampler + ?Sized,
    {
        self.refresh(frontend, images)?;
        let (mut marginalized, mut dropped) = (0, 0);
        for key in self.order.clone() {
            let (folded, singular) = self.fold_hosted(key, false)?;
            marginalized += folded;
            dropped += singular;
        }
        if marginalized + dropped > 0 {
            self.bump_generation();
            log::debug!("marginalized {marginalized} landmarks, dropped {dropped} singular ones");
        }
        Ok(marginalized)
    }

    /// Folds (or with `all`, folds or drops) the landmarks hosted by `key`.
    /// Returns the number marginalized and dropped.
    fn fold_hosted(&mut self, key: FrameKey, all: bool) -> Result<(usize, usize), WindowError> {
        let table = self.frame_table();
        let layout = SystemLayout::new(table.frames());
        let epochs = self.epochs();
        let singular_threshold = self.config.singular_threshold();
        let Some(frame) = self.frames.get_mut(key) else {
            return Err(WindowError::UnknownFrame(key));
        };
        let mut folding = Folding {
            table: &table,
            layout,
            epochs,
            singular_threshold,
            pairs: &mut self.linearized_pairs,
            marginal: &mut self.marginal,
        };
        let (points_folded, points_dropped) = folding.fold(&mut frame.points, all)?;
        let (planes_folded, planes_dropped) = folding.fold(&mut frame.planes, all)?;
        Ok((points_folded + planes_folded, points_dropped + planes_dropped))
    }

    /// Removes frame `key` from the window, keeping its information in the
    /// marginalization prior. Hosted landmarks are marginalized (or dropped
    /// when flagged `Drop`); observations from other hosts in this frame are
    /// dropped.
    pub fn marginalize_frame<F, S>(
        &mut self,
        key: FrameKey,
        frontend: &F,
        images: &S,
    ) -> Result<(), WindowError>
    where
        F: FrontendState + ?Sized,
        S: ImageSampler + ?Sized,
    {
        if !self.frames.contains_key(key) {
            return Err(WindowError::UnknownFrame(key));
        }
        self.refresh(frontend, images)?;
        let (marginalized, dropped) = self.fold_hosted(key, true)?;

        let mut foreign = 0;
        for (host, frame) in self.frames.iter_mut() {
            if host == key {
                continue;
            }
            for point in frame.points.values_mut() {
                if point.remove_residual(key, &mut self.linearized_pairs) {
                    foreign += 1;
                }
            }
            for plane in frame.planes.values_mut() {
                if plane.remove_residual(key, &mut self.linearized_pairs) {
                    foreign += 1;
                }
            }
        }

        let Some(frame) = self.frames.get(key) else {
            return Err(WindowError::UnknownFrame(key));
        };
        let id = frame.id();
        let idx = frame.idx;
        let layout = SystemLayout::new(self.order.len());
        let offset = layout.frame_offset(idx);
        let mut h = DMatrix::zeros(layout.dim(), layout.dim());
        let mut b = DVector::zeros(layout.dim());
        let gradient = frame.prior_gradient_at_linearization();
        for i in 0..FRAME_DIM {
            h[(offset + i, offset + i)] = frame.prior()[i];
            b[offset + i] = gradient[i];
        }
        self.marginal.fold(&h, &b);
        self.marginal.eliminate(offset, FRAME_DIM)?;

        self.linearized_pairs.remove_frame(idx);
        self.frames.remove(key);
        self.order.retain(|k| *k != key);
        self.bump_generation();
        log::debug!(
            "frame {} marginalized: {marginalized} landmarks folded, {dropped} dropped, {foreign} foreign residuals dropped",
            id.as_u64()
        );
        Ok(())
    }

    /// Reads the current estimate of every window variable from the
    /// frontend and updates the deltas. Caches of the active category become
    /// stale until the next [`Self::refresh`].
    pub fn sync_states<F: FrontendState + ?Sized>(&mut self, frontend: &F) -> Result<(), WindowError> {
        self.intrinsics_current = frontend.intrinsics();
        for frame in self.frames.values_mut() {
            let state = frontend
                .frame(frame.id())
                .ok_or(WindowError::MissingFrame(frame.id()))?;
            frame.update_current(state);
            for point in frame.points.values_mut() {
                let state = frontend
                    .point(point.id())
                    .ok_or(WindowError::MissingPoint(point.id()))?;
                point.update_current(state);
            }
            for plane in frame.planes.values_mut() {
                let state = frontend
                    .plane(plane.id())
                    .ok_or(WindowError::MissingPlane(plane.id()))?;
                plane.update_current(state);
            }
        }
        self.evaluation_epoch += 1;
        Ok(())
    }

    fn ensure_indexed(&mut self) {
        if self.indexed_at != self.generation {
            self.reindex();
        }
    }

    /// Moves the linearization point to the current frontend state and
    /// linearizes every residual there. The marginalization prior is
    /// re-centred on the new point.
    pub fn relinearize<F, S>(&mut self, frontend: &F, images: &S) -> Result<(), WindowError>
    where
        F: FrontendState + ?Sized,
        S: ImageSampler + ?Sized,
    {
        self.sync_states(frontend)?;
        let delta = self.stacked_delta();
        self.marginal.recenter(&delta);
        self.intrinsics_linearization = self.intrinsics_current;
        for frame in self.frames.values_mut() {
            let state = *frame.current_state();
            frame.reset_linearization(state);
            for point in frame.points.values_mut() {
                let state = point.current_state().clone();
                point.reset_linearization(state);
            }
            for plane in frame.planes.values_mut() {
                let state = plane.current_state().clone();
                plane.reset_linearization(state);
            }
        }
        self.ensure_indexed();
        self.linearization_epoch += 1;

        let table = self.frame_table();
        let n = table.frames();
        let epoch = self.linearization_epoch;
        let config = &self.config;
        let (mut points, mut planes) = landmarks_mut(&mut self.frames);
        points
            .par_iter_mut()
            .for_each(|(_, p)| p.linearize_residuals(&table, images, config, epoch));
        planes
            .par_iter_mut()
            .for_each(|(_, p)| p.linearize_residuals(&table, images, config, epoch));

        let from_points = points
            .par_iter()
            .fold(
                || PairTable::zeros(n),
                |mut pairs, (_, p)| {
                    p.add_linearized_hessians(&mut pairs);
                    pairs
                },
            )
            .reduce(|| PairTable::zeros(n), PairTable::merged);
        let from_planes = planes
            .par_iter()
            .fold(
                || PairTable::zeros(n),
                |mut pairs, (_, p)| {
                    p.add_linearized_hessians(&mut pairs);
                    pairs
                },
            )
            .reduce(|| PairTable::zeros(n), PairTable::merged);
        self.linearized_pairs = from_points.merged(from_planes);
        log::trace!("relinearized at epoch {epoch}");
        Ok(())
    }

    /// Reads the current frontend state and re-evaluates every residual of
    /// the active category there.
    pub fn refresh<F, S>(&mut self, frontend: &F, images: &S) -> Result<(), WindowError>
    where
        F: FrontendState + ?Sized,
        S: ImageSampler + ?Sized,
    {
        self.sync_states(frontend)?;
        self.ensure_indexed();
        let table = self.frame_table();
        let epoch = self.evaluation_epoch;
        let config = &self.config;
        let (mut points, mut planes) = landmarks_mut(&mut self.frames);
        points
            .par_iter_mut()
            .for_each(|(_, p)| p.evaluate_residuals(&table, images, config, epoch));
        planes
            .par_iter_mut()
            .for_each(|(_, p)| p.evaluate_residuals(&table, images, config, epoch));
        Ok(())
    }

    /// One accumulation pass over all landmarks, stitched to absolute
    /// coordinates, with all priors and the Schur complement of the
    /// landmarks.
    pub fn accumulate(&mut self) -> Result<AccumulatedSystem, WindowError> {
        if self.indexed_at != self.generation {
            return Err(WindowError::StaleIndices {
                cached: self.indexed_at,
                current: self.generation,
            });
        }
        let table = self.frame_table();
        let n = table.frames();
        let layout = SystemLayout::new(n);
        let epochs = self.epochs();
        let singular = self.config.singular_threshold();

        let (points, planes) = landmarks_mut(&mut self.frames);
        let (from_points, mut eliminations) = accumulate_landmarks(
            points,
            |handle, id| LandmarkRef::Point { handle, id },
            &table,
            &layout,
            &epochs,
            singular,
        )?;
        let (from_planes, plane_blocks) = accumulate_landmarks(
            planes,
            |handle, id| LandmarkRef::Plane { handle, id },
            &table,
            &layout,
            &epochs,
            singular,
        )?;
        eliminations.extend(plane_blocks);
        let pass = from_points.merged(from_planes);

        let dim = layout.dim();
        let mut hessian = DMatrix::zeros(dim, dim);
        let mut gradient = DVector::zeros(dim);
        self.linearized_pairs
            .with_gradients(&pass.linearized)
            .without_hessians(&pass.excluded)
            .stitch(&table.lin_adjoints, &layout, &mut hessian, &mut gradient);
        pass.active
            .stitch(&table.cur_adjoints, &layout, &mut hessian, &mut gradient);
        let mut energy = pass.linearized.energy() + pass.active.energy() + pass.prior_energy;

        let intrinsics_prior = self.config.intrinsics_prior();
        let offset =
            self.intrinsics_current.as_vector() - self.intrinsics_prior_mean.as_vector();
        for i in 0..INTRINSICS_DIM {
            hessian[(i, i)] += intrinsics_prior;
            gradient[i] += intrinsics_prior * offset[i];
        }
        energy += intrinsics_prior * offset.norm_squared();

        for (idx, (_, frame)) in self.frames().enumerate() {
            let base = layout.frame_offset(idx);
            let (prior_gradient, prior_energy) = frame.prior_terms();
            for i in 0..FRAME_DIM {
                hessian[(base + i, base + i)] += frame.prior()[i];
                gradient[base + i] += prior_gradient[i];
            }
            energy += prior_energy;
        }

        let (marginal_energy, marginal_gradient) = self.marginal.evaluate(&self.stacked_delta());
        hessian += self.marginal.hessian();
        gradient += marginal_gradient;
        energy += marginal_energy;

        let blocks: Vec<&EliminationBlock> = eliminations
            .iter()
            .filter_map(|(_, block)| block.as_ref())
            .collect();
        let (h_sc, b_sc) = schur_correction(&blocks, dim);
        let reduced_hessian = &hessian - h_sc;
        let reduced_gradient = &gradient - b_sc;

        Ok(AccumulatedSystem {
            layout,
            frame_ids: (0..n).map(|idx| table.id(idx)).collect(),
            hessian,
            gradient,
            reduced_hessian,
            reduced_gradient,
            eliminations,
            energy,
            generation: self.generation,
        })
    }

    /// The unreduced joint system of a fresh accumulation pass.
    pub fn joint_system(&mut self) -> Result<JointSystem, WindowError> {
        Ok(self.accumulate()?.joint())
    }

    /// Solves the reduced system, escalating damping only if it is not
    /// positive definite, and back-substitutes the landmarks.
    pub fn solve(&self, system: &AccumulatedSystem) -> Result<StepUpdate, WindowError> {
        self.solve_with_damping(system, 0.0).map(|(update, _)| update)
    }

    pub fn solve_with_damping(
        &self,
        system: &AccumulatedSystem,
        lambda: f64,
    ) -> Result<(StepUpdate, DampedSolution), WindowError> {
        if system.generation != self.generation {
            return Err(WindowError::StaleIndices {
                cached: system.generation,
                current: self.generation,
            });
        }
        let solution = solve_damped(
            &system.reduced_hessian,
            &system.reduced_gradient,
            lambda,
            self.config.lambda_growth(),
            self.config.max_damping_attempts(),
        )?;
        Ok((system.update_from(&solution.step), solution))
    }

    /// Levenberg–Marquardt over the window. Steps are handed to `frontend`;
    /// a step that raises the energy is undone with its negation and the
    /// damping grows. Candidate and current energy are always compared at
    /// the same linearization point, which only moves to an accepted state,
    /// every `relinearize_interval` accepted steps.
    pub fn optimize<F, S>(
        &mut self,
        frontend: &mut F,
        images: &S,
        iterations: usize,
    ) -> Result<OptimizationReport, WindowError>
    where
        F: FrontendState + ?Sized,
        S: ImageSampler + ?Sized,
    {
        let growth = self.config.lambda_growth();
        let interval = self.config.relinearize_interval().get();
        let mut lambda = self.config.initial_lambda();

        self.relinearize(&*frontend, images)?;
        let mut system = self.accumulate()?;
        let mut report = OptimizationReport::started(system.energy(), lambda);
        let mut since_relinearization = 0;

        for iteration in 0..iterations {
            report.iterations = iteration + 1;
            let (update, solution) = self.solve_with_damping(&system, lambda)?;
            lambda = solution.lambda;
            if !update.is_finite() {
                log::warn!("non-finite step at iteration {iteration}, increasing damping");
                report.rejected_steps += 1;
                lambda = lambda.max(1e-6) * growth;
                continue;
            }

            frontend.apply(&update);
            self.refresh(&*frontend, images)?;
            let candidate = self.accumulate()?;
            log::trace!(
                "iteration {iteration}: energy {:.6e} -> {:.6e}, lambda {lambda:e}",
                system.energy(),
                candidate.energy()
            );

            if candidate.energy() <= system.energy() {
                report.accepted_steps += 1;
                lambda /= growth;
                since_relinearization += 1;
                if since_relinearization >= interval {
                    self.relinearize(&*frontend, images)?;
                    since_relinearization = 0;
                    system = self.accumulate()?;
                } else {
                    system = candidate;
                }
                report.final_energy = system.energy();
                if update.max_abs() < self.config.convergence_threshold() {
                    report.converged = true;
                    break;
                }
            } else {
                frontend.apply(&update.negated());
                report.rejected_steps += 1;
                lambda = lambda.max(1e-6) * growth;
                self.refresh(&*frontend, images)?;
                system = self.accumulate()?;
                report.final_energy = system.energy();
            }
        }
        report.final_lambda = lambda;
        Ok(report)
    }
}
