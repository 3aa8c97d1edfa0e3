use approx::assert_relative_eq;
use nalgebra::{DVector, Vector2};

use super::{Window, WindowError};
use crate::config::{WindowConfig, WindowParams};
use crate::landmark::{LandmarkRef, LandmarkStatus};
use crate::residual::ResidualStatus;
use crate::state::{FrontendState, PlaneState, PointState};
use crate::test_helpers::{
    pixel_grid, test_config, three_view_truth, two_view_truth, Lcg, PointPlan, SceneWindow,
    TestFrontend, POINT_PRIOR,
};
use crate::{
    FrameId, FrameState, PinholeIntrinsics, PlaneId, PointId, StepUpdate, Vector8, FRAME_DIM,
    INTRINSICS_DIM,
};

fn max_rel_diff(a: &[f64], b: &[f64]) -> f64 {
    assert_eq!(a.len(), b.len());
    let scale = a
        .iter()
        .chain(b)
        .fold(1.0_f64, |acc, v| acc.max(v.abs()));
    let diff = a
        .iter()
        .zip(b)
        .fold(0.0_f64, |acc, (x, y)| acc.max((x - y).abs()));
    diff / scale
}

fn grid_plans(targets: &[usize]) -> Vec<PointPlan> {
    pixel_grid()
        .into_iter()
        .map(|pixel| PointPlan::new(0, pixel, targets))
        .collect()
}

fn perturbed(state: &FrameState) -> FrameState {
    state.apply_delta(&Vector8::from_column_slice(&[
        0.01, -0.005, 0.004, 0.002, -0.002, 0.001, 0.0, 0.0,
    ]))
}

/// Host plus one perturbed target, so the gradient is not zero.
fn perturbed_two_view(plans: &[PointPlan]) -> SceneWindow {
    let truth = two_view_truth();
    let estimates = vec![truth[0], perturbed(&truth[1])];
    SceneWindow::build(test_config(), &truth, Some(&estimates), plans)
}

/// `−H⁻¹ b` of the unreduced joint system.
fn joint_step(scene: &mut SceneWindow) -> (super::JointSystem, DVector<f64>) {
    let joint = scene.window.joint_system().expect("joint");
    let step = -joint
        .hessian
        .clone()
        .cholesky()
        .expect("joint system is positive definite")
        .solve(&joint.gradient);
    (joint, step)
}

fn assert_update_matches_joint(update: &StepUpdate, joint: &super::JointSystem, step: &DVector<f64>) {
    let scale = 1.0 + step.amax();
    assert!((update.intrinsics - step.fixed_rows::<INTRINSICS_DIM>(0)).amax() < 1e-6 * scale);
    for (idx, (_, delta)) in update.frames.iter().enumerate() {
        let offset = INTRINSICS_DIM + FRAME_DIM * idx;
        let expected = step.fixed_rows::<FRAME_DIM>(offset);
        assert!(
            (delta - expected).amax() < 1e-6 * scale,
            "frame {idx}: {delta:?} vs {expected:?}"
        );
    }
    for (landmark, offset, dim) in &joint.landmarks {
        match landmark {
            LandmarkRef::Point { id, .. } => {
                let delta = update.point(*id).expect("point in update");
                assert!((delta - step[*offset]).abs() < 1e-6 * scale);
            }
            LandmarkRef::Plane { id, .. } => {
                assert_eq!(*dim, 3);
                let delta = update.plane(*id).expect("plane in update");
                assert!((delta - step.fixed_rows::<3>(*offset)).amax() < 1e-6 * scale);
            }
        }
    }
}

#[test]
fn zero_residual_observation_yields_zero_update() {
    let mut scene = SceneWindow::build(
        test_config(),
        &two_view_truth(),
        None,
        &[PointPlan::new(0, [150.0, 110.0], &[1])],
    );
    scene.relinearize();
    let system = scene.window.accumulate().expect("accumulate");
    assert!(system.energy() < 1e-12, "energy {}", system.energy());
    assert!(system.gradient().amax() < 1e-6);

    let lambda = scene.window.config().initial_lambda();
    let (update, _) = scene
        .window
        .solve_with_damping(&system, lambda)
        .expect("solve");
    assert!(update.max_abs() < 1e-6, "update {update:?}");
    assert_eq!(update.points.len(), 1);
}

#[test]
fn shared_landmark_couples_frames_until_its_depth_is_certain() {
    let cross_blocks = |prior: f64| {
        let mut scene = SceneWindow::build(test_config(), &two_view_truth(), None, &[]);
        let state = scene
            .scene
            .point_state(&scene.truth[0], Vector2::new(150.0, 110.0));
        scene.frontend.points.insert(PointId::new(0), state.clone());
        let handle = scene
            .window
            .add_point(scene.frames[0], PointId::new(0), &state, prior)
            .expect("point");
        scene
            .window
            .add_point_residual(handle, scene.frames[1])
            .expect("residual");
        scene.relinearize();
        let system = scene.window.accumulate().expect("accumulate");
        let layout = system.layout();
        let (r, c) = (layout.frame_offset(0), layout.frame_offset(1));
        let full = system
            .hessian()
            .view((r, c), (FRAME_DIM, FRAME_DIM))
            .into_owned();
        let reduced = system
            .reduced_hessian()
            .view((r, c), (FRAME_DIM, FRAME_DIM))
            .into_owned();
        (full, reduced)
    };

    let (full, reduced) = cross_blocks(POINT_PRIOR);
    assert!(full.amax() > 0.0, "observation must couple host and target");
    let correction = (&full - &reduced).amax();
    assert!(correction > 1e-3 * full.amax(), "correction {correction:e}");

    let (full, reduced) = cross_blocks(1e14);
    let correction = (&full - &reduced).amax();
    assert!(full.amax() > 0.0);
    assert!(
        correction < 1e-6 * full.amax(),
        "certain depth leaves correction {correction:e}"
    );
}

#[test]
fn marginalizing_oldest_of_three_frames_keeps_its_information() {
    let grid = pixel_grid();
    let mut plans = Vec::new();
    for (i, pixel) in grid.iter().enumerate() {
        plans.push(match i % 3 {
            0 => PointPlan::new(0, *pixel, &[1, 2]),
            1 => PointPlan::new(1, *pixel, &[0, 2]),
            _ => PointPlan::new(2, *pixel, &[0, 1]),
        });
    }
    let mut scene = SceneWindow::build(test_config(), &three_view_truth(), None, &plans);
    scene.relinearize();
    let removed = scene.frames[0];
    let hosted_by_removed: Vec<_> = scene
        .points
        .iter()
        .copied()
        .filter(|h| h.frame == removed)
        .collect();

    scene
        .window
        .marginalize_frame(removed, &scene.frontend, &scene.images)
        .expect("marginalize frame");

    assert_eq!(scene.window.frame_count(), 2);
    assert!(scene.window.frame(removed).is_none());
    assert!(hosted_by_removed
        .iter()
        .all(|h| scene.window.point(*h).is_none()));
    let prior = scene.window.marginal_prior();
    assert_eq!(prior.dim(), INTRINSICS_DIM + 2 * FRAME_DIM);
    assert!(!prior.is_zero());
    assert!((prior.hessian() - prior.hessian().transpose()).amax() < 1e-6 * prior.hessian().amax());
    for key in [scene.frames[1], scene.frames[2]] {
        let frame_prior = scene.window.frame_prior(key).expect("survivor");
        assert_ne!(frame_prior.marginal, crate::Matrix8::zeros());
    }

    for (idx, (key, frame)) in scene.window.frames().enumerate() {
        assert_eq!(frame.idx(), idx);
        for (_, point) in frame.points() {
            assert_eq!(point.host(), key);
            for r in point.residuals() {
                assert_ne!(r.target(), removed);
                assert!(r.host_idx() < 2 && r.target_idx() < 2);
                assert_ne!(r.target_id(), FrameId::new(0));
            }
        }
    }

    scene.refresh();
    let system = scene.window.accumulate().expect("accumulate after removal");
    assert_eq!(system.layout().frames(), 2);
    assert_eq!(system.frame_ids(), &[FrameId::new(1), FrameId::new(2)]);
}

#[test]
fn out_of_bounds_landmark_contributes_nothing() {
    let plans = grid_plans(&[1]);
    let mut reference = SceneWindow::build(test_config(), &two_view_truth(), None, &plans);
    let mut with_oob = SceneWindow::build(test_config(), &two_view_truth(), None, &plans);
    // leaves the target image on the left
    let oob = with_oob.add_point(&PointPlan::new(0, [4.0, 120.0], &[1]));
    reference.relinearize();
    with_oob.relinearize();

    let point = with_oob.window.point(oob).expect("point");
    assert!(point
        .residuals()
        .iter()
        .all(|r| r.status() == ResidualStatus::OutOfBounds));

    let a = reference.window.accumulate().expect("accumulate");
    let b = with_oob.window.accumulate().expect("accumulate");
    assert!(max_rel_diff(a.hessian().as_slice(), b.hessian().as_slice()) < 1e-12);
    assert!(max_rel_diff(a.reduced_hessian().as_slice(), b.reduced_hessian().as_slice()) < 1e-12);
    assert!(max_rel_diff(a.gradient().as_slice(), b.gradient().as_slice()) < 1e-12);

    assert!(reference.window.drop_candidates().is_empty());
    let candidates = with_oob.window.drop_candidates();
    assert_eq!(candidates.len(), 1);
    assert!(matches!(candidates[0], LandmarkRef::Point { handle, .. } if handle == oob));
}

#[test]
fn out_of_bounds_residual_recovers_once_the_target_moves_back() {
    let truth = two_view_truth();
    let shifted = truth[1].apply_delta(&Vector8::from_column_slice(&[
        -0.2, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
    ]));
    let estimates = vec![truth[0], shifted];
    let mut scene = SceneWindow::build(
        test_config(),
        &truth,
        Some(&estimates),
        &[PointPlan::new(0, [20.0, 120.0], &[1])],
    );
    scene.relinearize();
    let residual = &scene.window.point(scene.points[0]).expect("point").residuals()[0];
    assert_eq!(residual.status(), ResidualStatus::OutOfBounds);
    assert!(!residual.is_linearized());

    scene.frontend.frames.insert(FrameId::new(1), truth[1]);
    scene.refresh();
    let residual = &scene.window.point(scene.points[0]).expect("point").residuals()[0];
    assert_eq!(residual.status(), ResidualStatus::Good);
    assert!(residual.is_active_and_good());
    assert!(!residual.is_linearized());

    let system = scene.window.accumulate().expect("accumulate");
    assert_eq!(system.skipped_landmarks().count(), 0);
    let layout = system.layout();
    let cross = system
        .hessian()
        .view((layout.frame_offset(0), layout.frame_offset(1)), (FRAME_DIM, FRAME_DIM))
        .amax();
    assert!(cross > 0.0, "recovered residual must couple host and target");
}

#[test]
fn near_singular_landmarks_are_skipped_entirely() {
    let config = || {
        WindowConfig::new(WindowParams {
            singular_threshold: 1e30,
            ..test_config().params()
        })
        .expect("config")
    };
    let truth = two_view_truth();
    let estimates = vec![truth[0], perturbed(&truth[1])];
    let plans = grid_plans(&[1]);
    let mut scene = SceneWindow::build(config(), &truth, Some(&estimates), &plans);
    let mut bare = SceneWindow::build(config(), &truth, Some(&estimates), &[]);
    scene.relinearize();
    bare.relinearize();

    let with = scene.window.accumulate().expect("accumulate");
    let without = bare.window.accumulate().expect("accumulate");
    assert_eq!(with.skipped_landmarks().count(), plans.len());
    assert!(max_rel_diff(with.hessian().as_slice(), without.hessian().as_slice()) < 1e-9);
    assert!(max_rel_diff(with.gradient().as_slice(), without.gradient().as_slice()) < 1e-9);
    assert!(
        max_rel_diff(with.reduced_hessian().as_slice(), without.reduced_hessian().as_slice()) < 1e-9
    );
    assert!(
        max_rel_diff(with.reduced_gradient().as_slice(), without.reduced_gradient().as_slice())
            < 1e-9
    );
    assert_relative_eq!(with.energy(), without.energy(), max_relative = 1e-9, epsilon = 1e-9);
    assert!(scene
        .points
        .iter()
        .all(|h| scene.window.point(*h).expect("point").inverse_hessian()[(0, 0)] == 0.0));

    let flagged = scene.points[2];
    scene
        .window
        .set_point_status(flagged, LandmarkStatus::Marginalize)
        .expect("flag");
    let folded = scene
        .window
        .marginalize_flagged(&scene.frontend, &scene.images)
        .expect("marginalize");
    assert_eq!(folded, 0);
    assert!(scene.window.point(flagged).is_none());
    assert!(scene.window.marginal_prior().is_zero());
    assert!(scene.window.accumulate().is_ok());
}

#[test]
fn accumulation_is_independent_of_landmark_order() {
    let truth = two_view_truth();
    let estimates = vec![truth[0], perturbed(&truth[1])];
    let plans = grid_plans(&[1]);
    let mut shuffled = plans.clone();
    Lcg::new(7).shuffle(&mut shuffled);
    assert_ne!(
        plans.iter().map(|p| p.pixel.x).collect::<Vec<_>>(),
        shuffled.iter().map(|p| p.pixel.x).collect::<Vec<_>>()
    );

    let mut a = SceneWindow::build(test_config(), &truth, Some(&estimates), &plans);
    let mut b = SceneWindow::build(test_config(), &truth, Some(&estimates), &shuffled);
    a.relinearize();
    b.relinearize();
    let sa = a.window.accumulate().expect("accumulate");
    let sb = b.window.accumulate().expect("accumulate");
    assert!(max_rel_diff(sa.hessian().as_slice(), sb.hessian().as_slice()) < 1e-9);
    assert!(max_rel_diff(sa.gradient().as_slice(), sb.gradient().as_slice()) < 1e-9);
    assert!(max_rel_diff(sa.reduced_hessian().as_slice(), sb.reduced_hessian().as_slice()) < 1e-9);
    assert!(max_rel_diff(sa.reduced_gradient().as_slice(), sb.reduced_gradient().as_slice()) < 1e-9);
    assert_relative_eq!(sa.energy(), sb.energy(), max_relative = 1e-9);
}

#[test]
fn schur_solution_matches_joint_solve() {
    let mut scene = perturbed_two_view(&grid_plans(&[1]));
    scene.relinearize();
    let system = scene.window.accumulate().expect("accumulate");
    assert!(system.gradient().amax() > 0.0);
    let update = scene.window.solve(&system).expect("solve");
    let (joint, step) = joint_step(&mut scene);
    assert_eq!(joint.landmarks.len(), scene.points.len());
    assert_update_matches_joint(&update, &joint, &step);
}

#[test]
fn plane_landmark_schur_matches_joint_solve() {
    let mut scene = perturbed_two_view(&grid_plans(&[1]));
    let pixels: Vec<Vector2<f64>> = (0..3)
        .flat_map(|r| (0..3).map(move |c| Vector2::new(190.0 + 8.0 * c as f64, 140.0 + 8.0 * r as f64)))
        .collect();
    let plane = scene.add_plane(0, &pixels, &[1]);
    scene.relinearize();
    assert!(scene
        .window
        .plane(plane)
        .expect("plane")
        .residuals()
        .iter()
        .all(|r| r.is_active_and_good()));

    let system = scene.window.accumulate().expect("accumulate");
    assert_eq!(system.skipped_landmarks().count(), 0);
    let update = scene.window.solve(&system).expect("solve");
    assert_eq!(update.planes.len(), 1);
    let (joint, step) = joint_step(&mut scene);
    assert!(joint.landmarks.iter().any(|(l, _, d)| matches!(l, LandmarkRef::Plane { .. }) && *d == 3));
    assert_update_matches_joint(&update, &joint, &step);
}

#[test]
fn marginalizing_a_landmark_preserves_the_reduced_system() {
    let mut scene = perturbed_two_view(&grid_plans(&[1]));
    let pixels: Vec<Vector2<f64>> = (0..3)
        .flat_map(|r| (0..3).map(move |c| Vector2::new(190.0 + 8.0 * c as f64, 140.0 + 8.0 * r as f64)))
        .collect();
    let plane = scene.add_plane(0, &pixels, &[1]);
    scene.relinearize();
    let before = scene.window.accumulate().expect("accumulate");

    scene
        .window
        .set_point_status(scene.points[4], LandmarkStatus::Marginalize)
        .expect("flag point");
    scene
        .window
        .set_plane_status(plane, LandmarkStatus::Marginalize)
        .expect("flag plane");
    let folded = scene
        .window
        .marginalize_flagged(&scene.frontend, &scene.images)
        .expect("marginalize");
    assert_eq!(folded, 2);
    assert!(scene.window.point(scene.points[4]).is_none());
    assert!(scene.window.plane(plane).is_none());
    assert!(!scene.window.marginal_prior().is_zero());

    let after = scene.window.accumulate().expect("accumulate");
    assert!(
        max_rel_diff(before.reduced_hessian().as_slice(), after.reduced_hessian().as_slice()) < 1e-8
    );
    assert!(
        max_rel_diff(before.reduced_gradient().as_slice(), after.reduced_gradient().as_slice())
            < 1e-8
    );
}

#[test]
fn outlier_flag_removes_linearized_contribution_exactly() {
    let truth = two_view_truth();
    let estimates = vec![truth[0], perturbed(&truth[1])];
    let plans = grid_plans(&[1]);
    let mut excluded_plans = plans.clone();
    excluded_plans[3].targets.clear();

    let mut scene = SceneWindow::build(test_config(), &truth, Some(&estimates), &plans);
    let mut excluded = SceneWindow::build(test_config(), &truth, Some(&estimates), &excluded_plans);
    scene.relinearize();
    excluded.relinearize();
    let baseline = scene.window.accumulate().expect("accumulate");
    let expected = excluded.window.accumulate().expect("accumulate");

    let target = scene.frames[1];
    scene
        .window
        .set_point_residual_outlier(scene.points[3], target, true)
        .expect("flag");
    let flagged = scene.window.accumulate().expect("accumulate");
    assert!(max_rel_diff(flagged.hessian().as_slice(), expected.hessian().as_slice()) < 1e-10);
    assert!(max_rel_diff(flagged.gradient().as_slice(), expected.gradient().as_slice()) < 1e-10);
    assert_relative_eq!(flagged.energy(), expected.energy(), max_relative = 1e-9, epsilon = 1e-9);

    scene
        .window
        .set_point_residual_outlier(scene.points[3], target, false)
        .expect("unflag");
    let restored = scene.window.accumulate().expect("accumulate");
    assert!(max_rel_diff(restored.hessian().as_slice(), baseline.hessian().as_slice()) < 1e-10);
}

#[test]
fn outlier_flag_excludes_active_residual() {
    let truth = two_view_truth();
    let estimates = vec![truth[0], perturbed(&truth[1])];
    let mut plans = grid_plans(&[1]);
    plans[5].targets.clear();
    let mut scene = SceneWindow::build(test_config(), &truth, Some(&estimates), &plans);
    scene.relinearize();
    let before = scene.window.accumulate().expect("accumulate");

    let target = scene.frames[1];
    scene
        .window
        .add_point_residual(scene.points[5], target)
        .expect("residual");
    scene.refresh();
    let residual = &scene.window.point(scene.points[5]).expect("point").residuals()[0];
    assert!(!residual.is_linearized());
    assert!(residual.is_active_and_good());

    let with = scene.window.accumulate().expect("accumulate");
    assert!(max_rel_diff(with.hessian().as_slice(), before.hessian().as_slice()) > 1e-6);

    scene
        .window
        .set_point_residual_outlier(scene.points[5], target, true)
        .expect("flag");
    let without = scene.window.accumulate().expect("accumulate");
    assert!(max_rel_diff(without.hessian().as_slice(), before.hessian().as_slice()) < 1e-12);
    assert!(max_rel_diff(without.gradient().as_slice(), before.gradient().as_slice()) < 1e-12);
}

#[test]
fn accumulating_after_a_state_change_without_refresh_is_stale() {
    let mut plans = grid_plans(&[1]);
    plans[2].targets.clear();
    let mut scene = SceneWindow::build(test_config(), &two_view_truth(), None, &plans);
    scene.relinearize();
    scene
        .window
        .add_point_residual(scene.points[2], scene.frames[1])
        .expect("residual");
    scene.refresh();
    assert!(scene.window.accumulate().is_ok());

    if let Some(point) = scene.frontend.points.get_mut(&PointId::new(2)) {
        point.idepth *= 1.01;
    }
    scene.window.sync_states(&scene.frontend).expect("sync");
    let err = scene.window.accumulate().expect_err("stale cache");
    assert!(
        matches!(
            err,
            WindowError::StaleJacobian { host, target }
                if host == FrameId::new(0) && target == FrameId::new(1)
        ),
        "{err}"
    );

    scene.refresh();
    assert!(scene.window.accumulate().is_ok());
}

#[test]
fn stale_indices_are_rejected() {
    let mut scene = SceneWindow::build(test_config(), &two_view_truth(), None, &grid_plans(&[1]));
    scene.relinearize();
    let system = scene.window.accumulate().expect("accumulate");
    scene.add_point(&PointPlan::new(0, [200.0, 60.0], &[1]));
    let err = scene.window.solve(&system).expect_err("system predates the new point");
    assert!(matches!(err, WindowError::StaleIndices { .. }));

    scene.window.generation = scene.window.generation.next();
    let err = scene.window.accumulate().expect_err("indices predate the generation");
    assert!(matches!(err, WindowError::StaleIndices { .. }));
    scene.refresh();
    assert!(scene.window.accumulate().is_ok());
}

#[test]
fn optimize_reduces_energy_and_pose_error() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut scene = perturbed_two_view(&grid_plans(&[1]));
    let truth = scene.truth[1];
    let error = |frontend: &dyn FrontendState| {
        let estimate = frontend.frame(FrameId::new(1)).expect("frame");
        estimate
            .delta_from(&truth)
            .fixed_rows::<6>(0)
            .norm()
    };
    let before = error(&scene.frontend);

    let report = scene
        .window
        .optimize(&mut scene.frontend, &scene.images, 10)
        .expect("optimize");
    let after = error(&scene.frontend);

    assert!(report.accepted_steps > 0, "{report:?}");
    assert!(report.final_energy < report.initial_energy, "{report:?}");
    assert!(after < 0.5 * before, "pose error {before:e} -> {after:e}");
}

/// Hands every step to `inner` scaled by `factor`.
struct Overshooting<'a> {
    inner: &'a mut TestFrontend,
    factor: f64,
}

impl FrontendState for Overshooting<'_> {
    fn intrinsics(&self) -> PinholeIntrinsics {
        self.inner.intrinsics()
    }

    fn frame(&self, id: FrameId) -> Option<FrameState> {
        self.inner.frame(id)
    }

    fn point(&self, id: PointId) -> Option<PointState> {
        self.inner.point(id)
    }

    fn plane(&self, id: PlaneId) -> Option<PlaneState> {
        self.inner.plane(id)
    }

    fn apply(&mut self, update: &StepUpdate) {
        let scaled = StepUpdate {
            intrinsics: update.intrinsics * self.factor,
            frames: update
                .frames
                .iter()
                .map(|(id, delta)| (*id, delta * self.factor))
                .collect(),
            points: update
                .points
                .iter()
                .map(|(id, delta)| (*id, delta * self.factor))
                .collect(),
            planes: update
                .planes
                .iter()
                .map(|(id, delta)| (*id, delta * self.factor))
                .collect(),
        };
        self.inner.apply(&scaled);
    }
}

#[test]
fn rejected_step_restores_state_and_linearization() {
    let config = WindowConfig::new(WindowParams {
        relinearize_interval: 1,
        ..test_config().params()
    })
    .expect("config");
    let truth = two_view_truth();
    let estimates = vec![truth[0], perturbed(&truth[1])];
    let mut scene = SceneWindow::build(config, &truth, Some(&estimates), &grid_plans(&[1]));
    let start = scene.frontend.frames[&FrameId::new(1)];

    let mut overshooting = Overshooting {
        inner: &mut scene.frontend,
        factor: 40.0,
    };
    let report = scene
        .window
        .optimize(&mut overshooting, &scene.images, 1)
        .expect("optimize");

    assert_eq!(report.accepted_steps, 0, "{report:?}");
    assert_eq!(report.rejected_steps, 1, "{report:?}");
    assert!(report.final_lambda > scene.window.config().initial_lambda());
    assert_relative_eq!(report.final_energy, report.initial_energy, max_relative = 1e-9);
    let delta = scene.window.frame_delta(scene.frames[1]).expect("frame");
    assert!(delta.amax() < 1e-12, "linearization point moved: {delta:?}");
    let restored = scene.frontend.frames[&FrameId::new(1)];
    assert!(restored.delta_from(&start).amax() < 1e-12);
}

#[test]
fn landmark_status_is_one_way_and_drop_discards() {
    let mut scene = SceneWindow::build(test_config(), &two_view_truth(), None, &grid_plans(&[1]));
    scene.relinearize();
    let handle = scene.points[0];
    scene
        .window
        .set_point_status(handle, LandmarkStatus::Drop)
        .expect("drop");
    let err = scene
        .window
        .set_point_status(handle, LandmarkStatus::Good)
        .expect_err("no way back");
    assert!(matches!(
        err,
        WindowError::InvalidTransition {
            from: LandmarkStatus::Drop,
            to: LandmarkStatus::Good
        }
    ));
    assert!(scene
        .window
        .set_point_status(handle, LandmarkStatus::Marginalize)
        .is_err());

    let count = scene.window.point_count();
    assert_eq!(scene.window.drop_flagged(), 1);
    assert_eq!(scene.window.point_count(), count - 1);
    assert!(scene.window.point(handle).is_none());
    assert!(scene.window.marginal_prior().is_zero());
}

#[test]
fn membership_errors() {
    let mut scene = SceneWindow::build(test_config(), &two_view_truth(), None, &grid_plans(&[1]));
    let handle = scene.points[0];
    let (host, target) = (scene.frames[0], scene.frames[1]);

    assert!(matches!(
        scene.window.add_point_residual(handle, host),
        Err(WindowError::SelfObservation(_))
    ));
    assert!(matches!(
        scene.window.add_point_residual(handle, target),
        Err(WindowError::DuplicateResidual(_))
    ));
    assert!(matches!(
        scene.window.add_frame(FrameId::new(1), scene.truth[1]),
        Err(WindowError::DuplicateFrame(_))
    ));
    let state = scene.frontend.points[&PointId::new(0)].clone();
    assert!(matches!(
        scene.window.add_point(host, PointId::new(99), &state, -1.0),
        Err(WindowError::InvalidPrior)
    ));

    scene
        .window
        .drop_point_residual(handle, target)
        .expect("drop residual");
    assert!(matches!(
        scene.window.set_point_residual_outlier(handle, target, true),
        Err(WindowError::UnknownResidual(_))
    ));

    scene.frontend.points.remove(&PointId::new(1));
    assert!(matches!(
        scene.window.refresh(&scene.frontend, &scene.images),
        Err(WindowError::MissingPoint(id)) if id == PointId::new(1)
    ));
}

#[test]
fn frame_priors_anchor_the_first_frame_only() {
    let scene = SceneWindow::build(test_config(), &two_view_truth(), None, &[]);
    let first = scene.window.frame_prior(scene.frames[0]).expect("first");
    let second = scene.window.frame_prior(scene.frames[1]).expect("second");
    assert_eq!(first.diagonal, Vector8::repeat(1e6));
    assert_eq!(second.diagonal.fixed_rows::<6>(0).amax(), 0.0);
    assert_eq!(second.diagonal[6], 1.0);
    assert_eq!(first.marginal, crate::Matrix8::zeros());
    assert_eq!(scene.window.frame_delta(scene.frames[1]), Some(&Vector8::zeros()));
}

#[test]
fn relinearizing_recentres_the_marginal_prior() {
    let mut plans = grid_plans(&[1]);
    plans.truncate(6);
    let mut scene = perturbed_two_view(&plans);
    scene.relinearize();
    scene
        .window
        .set_point_status(scene.points[0], LandmarkStatus::Marginalize)
        .expect("flag");
    scene
        .window
        .marginalize_flagged(&scene.frontend, &scene.images)
        .expect("marginalize");
    let hessian = scene.window.marginal_prior().hessian().clone();
    let gradient = scene.window.marginal_prior().gradient().clone();

    let step = Vector8::from_column_slice(&[0.002, 0.0, -0.001, 0.0, 0.0005, 0.0, 0.0, 0.0]);
    if let Some(frame) = scene.frontend.frames.get_mut(&FrameId::new(1)) {
        *frame = frame.apply_delta(&step);
    }
    scene.window.sync_states(&scene.frontend).expect("sync");
    let mut delta = DVector::zeros(hessian.nrows());
    delta
        .fixed_rows_mut::<FRAME_DIM>(INTRINSICS_DIM + FRAME_DIM)
        .copy_from(scene.window.frame_delta(scene.frames[1]).expect("delta"));

    scene.relinearize();
    let expected = &gradient + &hessian * &delta;
    assert_relative_eq!(
        *scene.window.marginal_prior().gradient(),
        expected,
        max_relative = 1e-10,
        epsilon = 1e-6
    );
    assert_eq!(scene.window.marginal_prior().hessian(), &hessian);
    assert_eq!(scene.window.frame_delta(scene.frames[1]), Some(&Vector8::zeros()));
}

#[test]
fn window_starts_empty() {
    let scene = crate::test_helpers::PlanarScene::new();
    let mut window = Window::new(test_config(), *scene.intrinsics());
    assert_eq!(window.frame_count(), 0);
    let system = window.accumulate().expect("empty window accumulates");
    assert_eq!(system.layout().dim(), INTRINSICS_DIM);
    assert_eq!(system.energy(), 0.0);
}
