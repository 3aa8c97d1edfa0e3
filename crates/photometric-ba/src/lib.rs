#![warn(clippy::all)]
//! Sliding-window photometric bundle adjustment backend.
//!
//! The crate keeps backend "shadows" of frontend frames, landmarks and
//! observations, linearizes photometric residuals, accumulates the normal
//! equations, reduces them by Schur elimination of the landmark variables and
//! folds information that leaves the window into a dense marginal prior.
//! Frontend state (poses, brightness, inverse depths, intrinsics, images) is
//! only read through [`FrontendState`] and [`ImageSampler`]; updates are handed
//! back as a [`StepUpdate`].

use nalgebra::{IsometryMatrix3, SMatrix, SVector};

mod accumulate;
mod camera;
mod config;
mod env;
mod frame;
mod jacobian;
mod landmark;
mod marginal;
mod math;
mod report;
mod residual;
mod schur;
mod solver;
mod state;
mod window;

#[cfg(test)]
mod test_helpers;

pub use accumulate::SystemLayout;
pub use camera::{IntrinsicsError, PinholeIntrinsics};
pub use config::{ConfigError, WindowConfig, WindowParams};
pub use frame::{FramePrior, FrameShadow};
pub use jacobian::{PlaneJacobian, PointJacobian};
pub use landmark::{LandmarkRef, LandmarkShadow, LandmarkStatus, PlaneShadow, PointShadow};
pub use marginal::MarginalPrior;
pub use report::OptimizationReport;
pub use residual::{
    InverseDepth, InverseNormal, LandmarkModel, Observation, PlaneResidual, PointResidual,
    ResidualStatus,
};
pub use solver::{DampedSolution, SolveError};
pub use state::{
    AffineBrightness, FrameState, FrontendState, ImageSampler, IntensitySample, PlanePixel,
    PlaneState, PointState, StepUpdate,
};
pub use window::{AccumulatedSystem, JointSystem, Window, WindowError};

/// Number of pixels in the point residual pattern.
pub const PATTERN_LEN: usize = 8;

/// Host-pixel offsets of the point residual pattern.
pub const PATTERN: [(f64, f64); PATTERN_LEN] = [
    (0.0, -2.0),
    (-1.0, -1.0),
    (1.0, -1.0),
    (-2.0, 0.0),
    (0.0, 0.0),
    (2.0, 0.0),
    (-1.0, 1.0),
    (0.0, 2.0),
];

/// Shared camera parameters: fx, fy, cx, cy.
pub const INTRINSICS_DIM: usize = 4;

/// Per-frame parameters: translation(3), rotation(3), affine a, affine b.
pub const FRAME_DIM: usize = 8;

/// Relative pair parameters: intrinsics(4), relative pose(6), relative affine(2).
pub(crate) const PAIR_DIM: usize = 12;

pub type Pose = IsometryMatrix3<f64>;
pub type Vector8 = SVector<f64, 8>;
pub type Matrix8 = SMatrix<f64, 8, 8>;
pub type Matrix8x3 = SMatrix<f64, 8, 3>;
pub type PatternVector = SVector<f64, PATTERN_LEN>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameId(u64);

impl FrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PointId(u64);

impl PointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlaneId(u64);

impl PlaneId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

slotmap::new_key_type! {
    pub struct FrameKey;
    pub struct PointKey;
    pub struct PlaneKey;
}

/// Stable reference to a point landmark: its host frame and its slot there.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PointHandle {
    pub frame: FrameKey,
    pub point: PointKey,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PlaneHandle {
    pub frame: FrameKey,
    pub plane: PlaneKey,
}

/// Window membership counter. Cached indices remember the generation they
/// were computed at and are invalid once the window has moved on.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, PartialOrd, Ord)]
pub struct Generation(u64);

impl Generation {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}
