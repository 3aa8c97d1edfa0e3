//! Relative-coordinate pair accumulation and stitching into the absolute
//! system over `[intrinsics, frame_0, frame_1, ...]`.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix4x3, SMatrix, SVector, Vector3, Vector4};

use crate::camera::PinholeIntrinsics;
use crate::config::WindowConfig;
use crate::jacobian::{PlaneJacobian, PointJacobian};
use crate::math::se3_adjoint;
use crate::residual::{PairContext, RelativeStep};
use crate::state::{AffineBrightness, FrameState};
use crate::{FrameId, Generation, Matrix8, PatternVector, Pose, Vector8, FRAME_DIM, INTRINSICS_DIM, PAIR_DIM};

pub type PairMatrix = SMatrix<f64, PAIR_DIM, PAIR_DIM>;
pub type PairVector = SVector<f64, PAIR_DIM>;

/// Index layout of the reduced system: intrinsics first, then 8 rows per
/// frame in window order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SystemLayout {
    frames: usize,
}

impl SystemLayout {
    pub fn new(frames: usize) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn dim(&self) -> usize {
        INTRINSICS_DIM + FRAME_DIM * self.frames
    }

    pub fn frame_offset(&self, idx: usize) -> usize {
        INTRINSICS_DIM + FRAME_DIM * idx
    }
}

pub(crate) fn add_block<const R: usize, const C: usize>(
    target: &mut DMatrix<f64>,
    row: usize,
    col: usize,
    block: &SMatrix<f64, R, C>,
) {
    let mut view = target.fixed_view_mut::<R, C>(row, col);
    view += block;
}

pub(crate) fn add_segment<const R: usize>(
    target: &mut DVector<f64>,
    row: usize,
    segment: &SVector<f64, R>,
) {
    let mut view = target.fixed_rows_mut::<R>(row);
    view += segment;
}

/// Hessian, gradient and energy of all residuals of one (host, target) pair,
/// over `[c(4), ξ_rel(6), ab_rel(2)]`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PairBlock {
    pub(crate) h: PairMatrix,
    pub(crate) b: PairVector,
    pub(crate) energy: f64,
}

impl PairBlock {
    fn zeros() -> Self {
        Self {
            h: PairMatrix::zeros(),
            b: PairVector::zeros(),
            energy: 0.0,
        }
    }

    fn is_zero(&self) -> bool {
        self.energy == 0.0 && self.h.iter().all(|v| *v == 0.0) && self.b.iter().all(|v| *v == 0.0)
    }
}

/// Dense `n × n` table of pair blocks indexed by `host * n + target`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PairTable {
    frames: usize,
    blocks: Vec<PairBlock>,
}

impl PairTable {
    pub(crate) fn zeros(frames: usize) -> Self {
        Self {
            frames,
            blocks: vec![PairBlock::zeros(); frames * frames],
        }
    }

    pub(crate) fn frames(&self) -> usize {
        self.frames
    }

    pub(crate) fn block(&self, host: usize, target: usize) -> &PairBlock {
        &self.blocks[host * self.frames + target]
    }

    fn block_mut(&mut self, host: usize, target: usize) -> &mut PairBlock {
        &mut self.blocks[host * self.frames + target]
    }

    pub(crate) fn add_hessian(&mut self, host: usize, target: usize, h: &PairMatrix) {
        self.block_mut(host, target).h += h;
    }

    pub(crate) fn sub_hessian(&mut self, host: usize, target: usize, h: &PairMatrix) {
        self.block_mut(host, target).h -= h;
    }

    pub(crate) fn add_gradient(&mut self, host: usize, target: usize, b: &PairVector, energy: f64) {
        let block = self.block_mut(host, target);
        block.b += b;
        block.energy += energy;
    }

    pub(crate) fn energy(&self) -> f64 {
        self.blocks.iter().map(|b| b.energy).sum()
    }

    /// Elementwise sum; used to reduce per-worker partial tables.
    pub(crate) fn merged(mut self, other: Self) -> Self {
        debug_assert_eq!(self.frames, other.frames);
        for (mine, theirs) in self.blocks.iter_mut().zip(other.blocks) {
            mine.h += theirs.h;
            mine.b += theirs.b;
            mine.energy += theirs.energy;
        }
        self
    }

    /// Hessians of `self` with gradients and energies of `gradients`.
    pub(crate) fn with_gradients(&self, gradients: &PairTable) -> Self {
        let mut out = self.clone();
        for (mine, theirs) in out.blocks.iter_mut().zip(&gradients.blocks) {
            mine.b = theirs.b;
            mine.energy = theirs.energy;
        }
        out
    }

    /// `self` with the Hessians of `excluded` taken out.
    pub(crate) fn without_hessians(mut self, excluded: &PairTable) -> Self {
        for (mine, theirs) in self.blocks.iter_mut().zip(&excluded.blocks) {
            mine.h -= theirs.h;
        }
        self
    }

    /// Appends a frame with the highest index.
    pub(crate) fn push_frame(&mut self) {
        let n = self.frames;
        let mut grown = Self::zeros(n + 1);
        for h in 0..n {
            for t in 0..n {
                *grown.block_mut(h, t) = self.block(h, t).clone();
            }
        }
        *self = grown;
    }

    /// Removes frame `idx`; frames above it move down by one.
    pub(crate) fn remove_frame(&mut self, idx: usize) {
        let n = self.frames;
        if idx >= n {
            return;
        }
        let mut shrunk = Self::zeros(n - 1);
        let keep: Vec<usize> = (0..n).filter(|&i| i != idx).collect();
        for (new_h, &h) in keep.iter().enumerate() {
            for (new_t, &t) in keep.iter().enumerate() {
                *shrunk.block_mut(new_h, new_t) = self.block(h, t).clone();
            }
        }
        *self = shrunk;
    }

    /// Adds every pair block, mapped to absolute frame coordinates through
    /// `adjoints`, into `h_out` and `b_out`.
    pub(crate) fn stitch(
        &self,
        adjoints: &PairAdjoints,
        layout: &SystemLayout,
        h_out: &mut DMatrix<f64>,
        b_out: &mut DVector<f64>,
    ) {
        for host in 0..self.frames {
            for target in 0..self.frames {
                let block = self.block(host, target);
                if host == target || block.is_zero() {
                    continue;
                }
                let ah = adjoints.host(host, target);
                let at = adjoints.target(host, target);
                let off_h = layout.frame_offset(host);
                let off_t = layout.frame_offset(target);

                let hcc: SMatrix<f64, 4, 4> = block.h.fixed_view::<4, 4>(0, 0).into_owned();
                let hcf: SMatrix<f64, 4, 8> = block.h.fixed_view::<4, 8>(0, 4).into_owned();
                let hff: Matrix8 = block.h.fixed_view::<8, 8>(4, 4).into_owned();
                let bc: Vector4<f64> = block.b.fixed_rows::<4>(0).into_owned();
                let bf: Vector8 = block.b.fixed_rows::<8>(4).into_owned();

                add_block(h_out, 0, 0, &hcc);
                let hc_h = hcf * ah;
                let hc_t = hcf * at;
                add_block(h_out, 0, off_h, &hc_h);
                add_block(h_out, off_h, 0, &hc_h.transpose());
                add_block(h_out, 0, off_t, &hc_t);
                add_block(h_out, off_t, 0, &hc_t.transpose());

                let hff_at = hff * at;
                add_block(h_out, off_h, off_h, &(ah.transpose() * hff * ah));
                add_block(h_out, off_t, off_t, &(at.transpose() * hff_at));
                let cross = ah.transpose() * hff_at;
                add_block(h_out, off_h, off_t, &cross);
                add_block(h_out, off_t, off_h, &cross.transpose());

                add_segment(b_out, 0, &bc);
                add_segment(b_out, off_h, &(ah.transpose() * bf));
                add_segment(b_out, off_t, &(at.transpose() * bf));
            }
        }
    }
}

/// Window counters a cache must match to be accumulated.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Epochs {
    pub(crate) linearization: u64,
    pub(crate) evaluation: u64,
    pub(crate) generation: Generation,
}

/// Per-worker partial result of one accumulation pass.
#[derive(Clone, Debug)]
pub(crate) struct PassAccumulator {
    /// Gradients and energies of the linearized category; its Hessians are
    /// cached by the window between relinearization events.
    pub(crate) linearized: PairTable,
    pub(crate) active: PairTable,
    /// Cached linearized Hessians of landmarks skipped in this pass.
    pub(crate) excluded: PairTable,
    pub(crate) prior_energy: f64,
}

impl PassAccumulator {
    pub(crate) fn new(frames: usize) -> Self {
        Self {
            linearized: PairTable::zeros(frames),
            active: PairTable::zeros(frames),
            excluded: PairTable::zeros(frames),
            prior_energy: 0.0,
        }
    }

    pub(crate) fn merged(self, other: Self) -> Self {
        Self {
            linearized: self.linearized.merged(other.linearized),
            active: self.active.merged(other.active),
            excluded: self.excluded.merged(other.excluded),
            prior_energy: self.prior_energy + other.prior_energy,
        }
    }
}

/// `∂(ξ_rel, ab_rel)/∂(frame_h)` and `∂(ξ_rel, ab_rel)/∂(frame_t)`.
pub(crate) fn relative_adjoints(host: &FrameState, target: &FrameState) -> (Matrix8, Matrix8) {
    let relative = target.pose * host.pose.inverse();
    let (a_rel, _) = AffineBrightness::relative(&host.affine, &target.affine);
    let scale = a_rel.exp();

    let mut ah = Matrix8::zeros();
    ah.fixed_view_mut::<6, 6>(0, 0)
        .copy_from(&(-se3_adjoint(&relative)));
    ah[(6, 6)] = -1.0;
    ah[(7, 6)] = scale * host.affine.b;
    ah[(7, 7)] = -scale;

    let mut at = Matrix8::identity();
    at[(7, 6)] = -scale * host.affine.b;
    (ah, at)
}

#[derive(Clone, Debug)]
pub(crate) struct PairAdjoints {
    frames: usize,
    host: Vec<Matrix8>,
    target: Vec<Matrix8>,
}

impl PairAdjoints {
    pub(crate) fn compute(states: &[FrameState]) -> Self {
        let n = states.len();
        let mut host = vec![Matrix8::zeros(); n * n];
        let mut target = vec![Matrix8::zeros(); n * n];
        for h in 0..n {
            for t in 0..n {
                if h == t {
                    continue;
                }
                let (ah, at) = relative_adjoints(&states[h], &states[t]);
                host[h * n + t] = ah;
                target[h * n + t] = at;
            }
        }
        Self {
            frames: n,
            host,
            target,
        }
    }

    pub(crate) fn host(&self, host: usize, target: usize) -> &Matrix8 {
        &self.host[host * self.frames + target]
    }

    pub(crate) fn target(&self, host: usize, target: usize) -> &Matrix8 {
        &self.target[host * self.frames + target]
    }
}

struct RelativeState {
    pose: Pose,
    a_rel: f64,
    b_rel: f64,
}

/// Per-pass snapshot of the window's frames in index order: current relative
/// states for evaluation, adjoints at the linearization point and at the
/// current state, and the relative increments since the linearization point.
pub(crate) struct FrameTable {
    frames: usize,
    ids: Vec<FrameId>,
    intrinsics: PinholeIntrinsics,
    intrinsics_delta: Vector4<f64>,
    relatives: Vec<RelativeState>,
    relative_deltas: Vec<Vector8>,
    pub(crate) lin_adjoints: PairAdjoints,
    pub(crate) cur_adjoints: PairAdjoints,
}

impl FrameTable {
    pub(crate) fn new(
        intrinsics: PinholeIntrinsics,
        intrinsics_delta: Vector4<f64>,
        ids: Vec<FrameId>,
        current: &[FrameState],
        linearization: &[FrameState],
        deltas: &[Vector8],
    ) -> Self {
        let n = current.len();
        let lin_adjoints = PairAdjoints::compute(linearization);
        let cur_adjoints = PairAdjoints::compute(current);
        let mut relatives = Vec::with_capacity(n * n);
        let mut relative_deltas = Vec::with_capacity(n * n);
        for h in 0..n {
            for t in 0..n {
                let (a_rel, b_rel) =
                    AffineBrightness::relative(&current[h].affine, &current[t].affine);
                relatives.push(RelativeState {
                    pose: current[t].pose * current[h].pose.inverse(),
                    a_rel,
                    b_rel,
                });
                relative_deltas.push(if h == t {
                    Vector8::zeros()
                } else {
                    lin_adjoints.host(h, t) * deltas[h] + lin_adjoints.target(h, t) * deltas[t]
                });
            }
        }
        Self {
            frames: n,
            ids,
            intrinsics,
            intrinsics_delta,
            relatives,
            relative_deltas,
            lin_adjoints,
            cur_adjoints,
        }
    }

    pub(crate) fn frames(&self) -> usize {
        self.frames
    }

    pub(crate) fn id(&self, idx: usize) -> FrameId {
        self.ids[idx]
    }

    pub(crate) fn context<'a, S: ?Sized>(
        &'a self,
        host: usize,
        target: usize,
        images: &'a S,
        config: &'a WindowConfig,
    ) -> PairContext<'a, S> {
        let relative = &self.relatives[host * self.frames + target];
        PairContext {
            intrinsics: &self.intrinsics,
            relative: &relative.pose,
            a_rel: relative.a_rel,
            b_rel: relative.b_rel,
            target_id: self.ids[target],
            images,
            config,
        }
    }

    /// Relative increments of the pair since the linearization point.
    pub(crate) fn step(&self, host: usize, target: usize) -> RelativeStep {
        RelativeStep::new(
            self.intrinsics_delta,
            &self.relative_deltas[host * self.frames + target],
        )
    }
}

fn pose_geometry(
    jp_dc: &nalgebra::Matrix2x4<f64>,
    jp_dxi: &nalgebra::Matrix2x6<f64>,
) -> SMatrix<f64, 2, 10> {
    let mut g = SMatrix::<f64, 2, 10>::zeros();
    g.fixed_view_mut::<2, 4>(0, 0).copy_from(jp_dc);
    g.fixed_view_mut::<2, 6>(0, 4).copy_from(jp_dxi);
    g
}

fn pair_hessian(
    g: &SMatrix<f64, 2, 10>,
    j_idx2: &nalgebra::Matrix2<f64>,
    jab_jidx: &nalgebra::Matrix2<f64>,
    jab2: &nalgebra::Matrix2<f64>,
) -> PairMatrix {
    let mut h = PairMatrix::zeros();
    h.fixed_view_mut::<10, 10>(0, 0)
        .copy_from(&(g.transpose() * j_idx2 * g));
    let cross = g.transpose() * jab_jidx.transpose();
    h.fixed_view_mut::<10, 2>(0, 10).copy_from(&cross);
    h.fixed_view_mut::<2, 10>(10, 0).copy_from(&cross.transpose());
    h.fixed_view_mut::<2, 2>(10, 10).copy_from(jab2);
    h
}

/// Hessian contribution of a point residual to its pair block, with the
/// landmark's self term `hdd` and intrinsics cross `hcd`.
pub(crate) fn point_hessian(cache: &PointJacobian) -> (PairMatrix, f64, Vector4<f64>) {
    let g = pose_geometry(&cache.jp_dc, &cache.jp_dxi);
    let h = pair_hessian(&g, &cache.j_idx2, &cache.jab_jidx, &cache.jab2);
    let j2_dd = cache.j_idx2 * cache.jp_dd;
    (h, cache.jp_dd.dot(&j2_dd), cache.jp_dc.transpose() * j2_dd)
}

/// Gradient contribution of a point residual evaluated at `r`, with the
/// landmark gradient `bd` and the energy `|r|²`.
pub(crate) fn point_gradient(cache: &PointJacobian, r: &PatternVector) -> (PairVector, f64, f64) {
    let (gr, abr) = cache.projected_residual(r);
    let g = pose_geometry(&cache.jp_dc, &cache.jp_dxi);
    let mut b = PairVector::zeros();
    b.fixed_rows_mut::<10>(0).copy_from(&(g.transpose() * gr));
    b.fixed_rows_mut::<2>(10).copy_from(&abr);
    (b, cache.jp_dd.dot(&gr), r.norm_squared())
}

pub(crate) fn plane_hessian(cache: &PlaneJacobian) -> (PairMatrix, Matrix3<f64>, Matrix4x3<f64>) {
    let mut h = PairMatrix::zeros();
    let mut hnn = Matrix3::zeros();
    let mut hcn = Matrix4x3::zeros();
    for k in 0..cache.len() {
        let g = pose_geometry(&cache.jp_dc[k], &cache.jp_dxi[k]);
        h += pair_hessian(&g, &cache.j_idx2[k], &cache.jab_jidx[k], &cache.jab2[k]);
        let j2_dn = cache.j_idx2[k] * cache.jp_dn[k];
        hnn += cache.jp_dn[k].transpose() * j2_dn;
        hcn += cache.jp_dc[k].transpose() * j2_dn;
    }
    (h, hnn, hcn)
}

pub(crate) fn plane_gradient(cache: &PlaneJacobian, r: &[f64]) -> (PairVector, Vector3<f64>, f64) {
    let mut b = PairVector::zeros();
    let mut bn = Vector3::zeros();
    let mut energy = 0.0;
    for (k, rk) in r.iter().enumerate().take(cache.len()) {
        let gr = cache.j_idx[k] * *rk;
        let g = pose_geometry(&cache.jp_dc[k], &cache.jp_dxi[k]);
        let mut bk = PairVector::zeros();
        bk.fixed_rows_mut::<10>(0).copy_from(&(g.transpose() * gr));
        bk.fixed_rows_mut::<2>(10).copy_from(&(cache.j_ab[k] * *rk));
        b += bk;
        bn += cache.jp_dn[k].transpose() * gr;
        energy += rk * rk;
    }
    (b, bn, energy)
}
