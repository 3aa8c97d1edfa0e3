use nalgebra::{Vector2, Vector3, Vector4, Vector6};

use crate::camera::PinholeIntrinsics;
use crate::math::{se3_exp, se3_log};
use crate::{FrameId, PatternVector, PlaneId, PointId, Pose, Vector8};

/// Per-frame photometric parameters: an observed intensity is `e^a · I + b`
/// of the scene radiance `I`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AffineBrightness {
    pub a: f64,
    pub b: f64,
}

impl AffineBrightness {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    pub fn identity() -> Self {
        Self { a: 0.0, b: 0.0 }
    }

    /// `(a_rel, b_rel)` such that a host intensity `I_h` predicts
    /// `e^{a_rel} I_h + b_rel` in the target.
    pub fn relative(host: &Self, target: &Self) -> (f64, f64) {
        let a_rel = target.a - host.a;
        (a_rel, target.b - a_rel.exp() * host.b)
    }
}

impl Default for AffineBrightness {
    fn default() -> Self {
        Self::identity()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameState {
    /// World to camera.
    pub pose: Pose,
    pub affine: AffineBrightness,
}

impl FrameState {
    pub fn new(pose: Pose, affine: AffineBrightness) -> Self {
        Self { pose, affine }
    }

    /// Applies an 8-vector `[v, ω, Δa, Δb]` as `pose ← exp(ξ)·pose`.
    pub fn apply_delta(&self, delta: &Vector8) -> Self {
        let xi = delta.fixed_rows::<6>(0).into_owned();
        Self {
            pose: se3_exp(&xi) * self.pose,
            affine: AffineBrightness::new(self.affine.a + delta[6], self.affine.b + delta[7]),
        }
    }

    /// Inverse of [`Self::apply_delta`]: the delta taking `origin` to `self`.
    pub fn delta_from(&self, origin: &FrameState) -> Vector8 {
        let xi: Vector6<f64> = se3_log(&(self.pose * origin.pose.inverse()));
        let mut delta = Vector8::zeros();
        delta.fixed_rows_mut::<6>(0).copy_from(&xi);
        delta[6] = self.affine.a - origin.affine.a;
        delta[7] = self.affine.b - origin.affine.b;
        delta
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PointState {
    /// Host pixel of the pattern centre.
    pub pixel: Vector2<f64>,
    pub idepth: f64,
    /// Host intensities at the pattern pixels.
    pub reference: PatternVector,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlanePixel {
    pub pixel: Vector2<f64>,
    pub intensity: f64,
}

/// Plane `{X : n·X = 1}` in host camera coordinates, with the host pixels
/// it is observed through.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaneState {
    pub inverse_normal: Vector3<f64>,
    pub pixels: Vec<PlanePixel>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IntensitySample {
    pub value: f64,
    pub gradient: Vector2<f64>,
}

/// Read access to the frontend's authoritative state, plus the hook through
/// which solver steps are handed back.
pub trait FrontendState {
    fn intrinsics(&self) -> PinholeIntrinsics;
    fn frame(&self, id: FrameId) -> Option<FrameState>;
    fn point(&self, id: PointId) -> Option<PointState>;
    fn plane(&self, id: PlaneId) -> Option<PlaneState>;
    fn apply(&mut self, update: &StepUpdate);
}

/// Sub-pixel image access. `None` means the sample is not fully inside the
/// image of `frame`.
pub trait ImageSampler: Sync {
    fn sample(&self, frame: FrameId, x: f64, y: f64) -> Option<IntensitySample>;
}

/// One solver step, in the frontend's update conventions: intrinsics are
/// additive, frames follow [`FrameState::apply_delta`], inverse depths and
/// inverse normals are additive.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepUpdate {
    pub intrinsics: Vector4<f64>,
    pub frames: Vec<(FrameId, Vector8)>,
    pub points: Vec<(PointId, f64)>,
    pub planes: Vec<(PlaneId, Vector3<f64>)>,
}

impl StepUpdate {
    pub fn negated(&self) -> Self {
        Self {
            intrinsics: -self.intrinsics,
            frames: self.frames.iter().map(|(id, d)| (*id, -d)).collect(),
            points: self.points.iter().map(|(id, d)| (*id, -d)).collect(),
            planes: self.planes.iter().map(|(id, d)| (*id, -d)).collect(),
        }
    }

    /// Largest absolute component over all blocks.
    pub fn max_abs(&self) -> f64 {
        let frames = self.frames.iter().map(|(_, d)| d.amax());
        let points = self.points.iter().map(|(_, d)| d.abs());
        let planes = self.planes.iter().map(|(_, d)| d.amax());
        frames
            .chain(points)
            .chain(planes)
            .fold(self.intrinsics.amax(), f64::max)
    }

    pub fn is_finite(&self) -> bool {
        self.intrinsics.iter().all(|v| v.is_finite())
            && self.frames.iter().all(|(_, d)| d.iter().all(|v| v.is_finite()))
            && self.points.iter().all(|(_, d)| d.is_finite())
            && self.planes.iter().all(|(_, d)| d.iter().all(|v| v.is_finite()))
    }

    pub fn frame(&self, id: FrameId) -> Option<&Vector8> {
        self.frames.iter().find(|(f, _)| *f == id).map(|(_, d)| d)
    }

    pub fn point(&self, id: PointId) -> Option<f64> {
        self.points.iter().find(|(p, _)| *p == id).map(|(_, d)| *d)
    }

    pub fn plane(&self, id: PlaneId) -> Option<&Vector3<f64>> {
        self.planes.iter().find(|(p, _)| *p == id).map(|(_, d)| d)
    }
}
