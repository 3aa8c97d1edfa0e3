use slotmap::SlotMap;

use crate::landmark::{PlaneShadow, PointShadow};
use crate::state::FrameState;
use crate::{FrameId, Generation, Matrix8, PlaneKey, PointKey, Vector8};

/// Backend shadow of one keyframe in the window. Owns the landmarks it hosts.
#[derive(Clone, Debug)]
pub struct FrameShadow {
    frame_id: FrameId,
    pub(crate) idx: usize,
    pub(crate) indexed_at: Generation,
    /// Diagonal prior precision over `[v, ω, a, b]`.
    prior: Vector8,
    delta_prior: Vector8,
    delta: Vector8,
    linearization: FrameState,
    prior_state: FrameState,
    current: FrameState,
    pub(crate) points: SlotMap<PointKey, PointShadow>,
    pub(crate) planes: SlotMap<PlaneKey, PlaneShadow>,
}

/// Prior information currently attached to a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FramePrior {
    pub diagonal: Vector8,
    /// Current state minus the prior mean.
    pub delta_prior: Vector8,
    /// The frame's diagonal block of the marginalization prior.
    pub marginal: Matrix8,
}

impl FrameShadow {
    pub(crate) fn new(frame_id: FrameId, state: FrameState, prior: Vector8) -> Self {
        Self {
            frame_id,
            idx: 0,
            indexed_at: Generation::default(),
            prior,
            delta_prior: Vector8::zeros(),
            delta: Vector8::zeros(),
            linearization: state,
            prior_state: state,
            current: state,
            points: SlotMap::with_key(),
            planes: SlotMap::with_key(),
        }
    }

    pub fn id(&self) -> FrameId {
        self.frame_id
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn prior(&self) -> &Vector8 {
        &self.prior
    }

    pub fn delta_prior(&self) -> &Vector8 {
        &self.delta_prior
    }

    /// Current state minus the linearization point.
    pub fn delta(&self) -> &Vector8 {
        &self.delta
    }

    pub fn linearization_state(&self) -> &FrameState {
        &self.linearization
    }

    pub fn current_state(&self) -> &FrameState {
        &self.current
    }

    pub fn points(&self) -> impl Iterator<Item = (PointKey, &PointShadow)> {
        self.points.iter()
    }

    pub fn planes(&self) -> impl Iterator<Item = (PlaneKey, &PlaneShadow)> {
        self.planes.iter()
    }

    pub fn point(&self, key: PointKey) -> Option<&PointShadow> {
        self.points.get(key)
    }

    pub fn plane(&self, key: PlaneKey) -> Option<&PlaneShadow> {
        self.planes.get(key)
    }

    pub(crate) fn update_current(&mut self, state: FrameState) {
        self.current = state;
        self.delta = state.delta_from(&self.linearization);
        self.delta_prior = state.delta_from(&self.prior_state);
    }

    pub(crate) fn reset_linearization(&mut self, state: FrameState) {
        self.linearization = state;
        self.update_current(state);
    }

    /// Half-gradient and energy of the diagonal prior at the current state.
    pub(crate) fn prior_terms(&self) -> (Vector8, f64) {
        let gradient = self.prior.component_mul(&self.delta_prior);
        (gradient, gradient.dot(&self.delta_prior))
    }

    /// Half-gradient of the diagonal prior at the linearization point.
    pub(crate) fn prior_gradient_at_linearization(&self) -> Vector8 {
        self.prior
            .component_mul(&self.linearization.delta_from(&self.prior_state))
    }
}

#[cfg(test)]
mod tests {
    use super::FrameShadow;
    use crate::math::se3_exp;
    use crate::state::{AffineBrightness, FrameState};
    use crate::{FrameId, Vector8};
    use nalgebra::Vector6;

    #[test]
    fn deltas_track_linearization_and_prior() {
        let start = FrameState::new(
            se3_exp(&Vector6::new(0.1, 0.0, 0.0, 0.0, 0.0, 0.0)),
            AffineBrightness::identity(),
        );
        let mut frame = FrameShadow::new(FrameId::new(4), start, Vector8::repeat(2.0));
        let step = Vector8::from_column_slice(&[0.01, 0.0, 0.0, 0.0, 0.0, 0.0, 0.1, 0.0]);
        let moved = start.apply_delta(&step);
        frame.update_current(moved);
        assert!((frame.delta() - step).norm() < 1e-12);
        assert!((frame.delta_prior() - step).norm() < 1e-12);
        let (gradient, energy) = frame.prior_terms();
        assert!((gradient[6] - 0.2).abs() < 1e-12);
        assert!((energy - 2.0 * (0.01f64.powi(2) + 0.1f64.powi(2))).abs() < 1e-12);

        frame.reset_linearization(moved);
        assert_eq!(frame.delta(), &Vector8::zeros());
        assert!((frame.delta_prior() - step).norm() < 1e-12);
        assert!((frame.prior_gradient_at_linearization()[0] - 0.02).abs() < 1e-12);
    }
}
