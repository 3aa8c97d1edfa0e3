#![allow(dead_code)]

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector2, Vector3, Vector6};

use crate::math::se3_exp;
use crate::state::{
    AffineBrightness, FrameState, FrontendState, ImageSampler, IntensitySample, PlanePixel,
    PlaneState, PointState, StepUpdate,
};
use crate::{
    FrameId, FrameKey, PatternVector, PinholeIntrinsics, PlaneHandle, PlaneId, PointHandle,
    PointId, Window, WindowConfig, WindowParams, PATTERN,
};

const IMAGE_WIDTH: f64 = 320.0;
const IMAGE_HEIGHT: f64 = 240.0;
/// Border kept free for the sampler's gradient stencil.
const IMAGE_BORDER: f64 = 2.0;
const GRADIENT_STEP: f64 = 1e-3;

/// Textured world plane `Z = depth` seen by a pinhole camera.
#[derive(Clone, Debug)]
pub(crate) struct PlanarScene {
    intrinsics: PinholeIntrinsics,
    depth: f64,
}

impl PlanarScene {
    pub(crate) fn new() -> Self {
        Self {
            intrinsics: PinholeIntrinsics::try_new(300.0, 300.0, 160.0, 120.0)
                .expect("intrinsics"),
            depth: 4.0,
        }
    }

    pub(crate) fn intrinsics(&self) -> &PinholeIntrinsics {
        &self.intrinsics
    }

    fn radiance(x: f64, y: f64) -> f64 {
        128.0 + 40.0 * (5.0 * x).sin() + 35.0 * (4.0 * y).cos() + 20.0 * (3.0 * (x + y)).sin()
    }

    /// World point seen through `pixel`, if the ray hits the plane.
    fn intersect(&self, frame: &FrameState, pixel: &Vector2<f64>) -> Option<Vector3<f64>> {
        let camera_to_world = frame.pose.inverse();
        let origin = camera_to_world.translation.vector;
        let direction = camera_to_world.rotation * self.intrinsics.normalized(pixel);
        if direction.z.abs() < 1e-12 {
            return None;
        }
        let s = (self.depth - origin.z) / direction.z;
        (s > 0.0).then(|| origin + direction * s)
    }

    fn intensity(&self, frame: &FrameState, pixel: &Vector2<f64>) -> Option<f64> {
        let world = self.intersect(frame, pixel)?;
        Some(frame.affine.a.exp() * Self::radiance(world.x, world.y) + frame.affine.b)
    }

    pub(crate) fn images(&self, frames: &[(FrameId, FrameState)]) -> SceneImages {
        SceneImages {
            scene: self.clone(),
            frames: frames.iter().copied().collect(),
        }
    }

    /// Point at the true depth behind `pixel` of `host`, with its reference
    /// pattern rendered from the host.
    pub(crate) fn point_state(&self, host: &FrameState, pixel: Vector2<f64>) -> PointState {
        let world = self.intersect(host, &pixel).expect("pixel sees the plane");
        let camera = host.pose * nalgebra::Point3::from(world);
        let mut reference = PatternVector::zeros();
        for (k, (du, dv)) in PATTERN.iter().enumerate() {
            reference[k] = self
                .intensity(host, &(pixel + Vector2::new(*du, *dv)))
                .expect("pattern sees the plane");
        }
        PointState {
            pixel,
            idepth: 1.0 / camera.z,
            reference,
        }
    }

    /// The scene plane in `host` coordinates, observed through `pixels`.
    pub(crate) fn plane_state(&self, host: &FrameState, pixels: &[Vector2<f64>]) -> PlaneState {
        let normal = host.pose.rotation * Vector3::z();
        let inverse_normal = normal / (self.depth + normal.dot(&host.pose.translation.vector));
        PlaneState {
            inverse_normal,
            pixels: pixels
                .iter()
                .map(|p| PlanePixel {
                    pixel: *p,
                    intensity: self.intensity(host, p).expect("pixel sees the plane"),
                })
                .collect(),
        }
    }
}

/// Analytic renderings of a [`PlanarScene`] at fixed true frame states.
#[derive(Clone, Debug)]
pub(crate) struct SceneImages {
    scene: PlanarScene,
    frames: HashMap<FrameId, FrameState>,
}

impl ImageSampler for SceneImages {
    fn sample(&self, frame: FrameId, x: f64, y: f64) -> Option<IntensitySample> {
        let inside = |v: f64, size: f64| v >= IMAGE_BORDER && v <= size - 1.0 - IMAGE_BORDER;
        if !(inside(x, IMAGE_WIDTH) && inside(y, IMAGE_HEIGHT)) {
            return None;
        }
        let state = self.frames.get(&frame)?;
        let at = |u: f64, v: f64| self.scene.intensity(state, &Vector2::new(u, v));
        let value = at(x, y)?;
        let gx = (at(x + GRADIENT_STEP, y)? - at(x - GRADIENT_STEP, y)?) / (2.0 * GRADIENT_STEP);
        let gy = (at(x, y + GRADIENT_STEP)? - at(x, y - GRADIENT_STEP)?) / (2.0 * GRADIENT_STEP);
        Some(IntensitySample {
            value,
            gradient: Vector2::new(gx, gy),
        })
    }
}

/// Camera at the world origin looking down `+Z`.
pub(crate) fn fronto_parallel_frame(translation: [f64; 3], affine: AffineBrightness) -> FrameState {
    moved_frame(translation, [0.0; 3], affine)
}

/// World-to-camera pose `exp([translation, rotation])`.
pub(crate) fn moved_frame(
    translation: [f64; 3],
    rotation: [f64; 3],
    affine: AffineBrightness,
) -> FrameState {
    let xi = Vector6::new(
        translation[0],
        translation[1],
        translation[2],
        rotation[0],
        rotation[1],
        rotation[2],
    );
    FrameState::new(se3_exp(&xi), affine)
}

/// `HashMap`-backed frontend holding the current estimates.
#[derive(Clone, Debug)]
pub(crate) struct TestFrontend {
    pub(crate) intrinsics: PinholeIntrinsics,
    pub(crate) frames: HashMap<FrameId, FrameState>,
    pub(crate) points: HashMap<PointId, PointState>,
    pub(crate) planes: HashMap<PlaneId, PlaneState>,
}

impl TestFrontend {
    pub(crate) fn new(intrinsics: PinholeIntrinsics) -> Self {
        Self {
            intrinsics,
            frames: HashMap::new(),
            points: HashMap::new(),
            planes: HashMap::new(),
        }
    }
}

impl FrontendState for TestFrontend {
    fn intrinsics(&self) -> PinholeIntrinsics {
        self.intrinsics
    }

    fn frame(&self, id: FrameId) -> Option<FrameState> {
        self.frames.get(&id).copied()
    }

    fn point(&self, id: PointId) -> Option<PointState> {
        self.points.get(&id).cloned()
    }

    fn plane(&self, id: PlaneId) -> Option<PlaneState> {
        self.planes.get(&id).cloned()
    }

    fn apply(&mut self, update: &StepUpdate) {
        if let Ok(next) = self.intrinsics.apply_delta(&update.intrinsics) {
            self.intrinsics = next;
        }
        for (id, delta) in &update.frames {
            if let Some(state) = self.frames.get_mut(id) {
                *state = state.apply_delta(delta);
            }
        }
        for (id, delta) in &update.points {
            if let Some(state) = self.points.get_mut(id) {
                state.idepth += delta;
            }
        }
        for (id, delta) in &update.planes {
            if let Some(state) = self.planes.get_mut(id) {
                state.inverse_normal += delta;
            }
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Lcg {
    state: u64,
}

impl Lcg {
    pub(crate) fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub(crate) fn next_usize(&mut self, upper: usize) -> usize {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1);
        ((self.state >> 32) as usize) % upper
    }

    pub(crate) fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.next_usize(i + 1);
            items.swap(i, j);
        }
    }
}

/// Priors loose enough to leave the photometric terms in charge while
/// keeping every test system well conditioned.
pub(crate) fn test_config() -> WindowConfig {
    WindowConfig::new(WindowParams {
        intrinsics_prior: 1e6,
        first_frame_prior: 1e6,
        affine_prior: [1.0, 1.0],
        ..WindowParams::default()
    })
    .expect("config")
}

pub(crate) const POINT_PRIOR: f64 = 100.0;

/// Observation plan of one point: host frame index, host pixel and the
/// target frame indices it is observed in.
#[derive(Clone, Debug)]
pub(crate) struct PointPlan {
    pub(crate) host: usize,
    pub(crate) pixel: Vector2<f64>,
    pub(crate) targets: Vec<usize>,
}

impl PointPlan {
    pub(crate) fn new(host: usize, pixel: [f64; 2], targets: &[usize]) -> Self {
        Self {
            host,
            pixel: Vector2::new(pixel[0], pixel[1]),
            targets: targets.to_vec(),
        }
    }
}

/// A window over a [`PlanarScene`], with the frontend holding the
/// estimates and the images rendered from the truth.
pub(crate) struct SceneWindow {
    pub(crate) scene: PlanarScene,
    pub(crate) window: Window,
    pub(crate) frontend: TestFrontend,
    pub(crate) images: SceneImages,
    pub(crate) truth: Vec<FrameState>,
    pub(crate) frames: Vec<FrameKey>,
    pub(crate) points: Vec<PointHandle>,
    pub(crate) planes: Vec<PlaneHandle>,
}

impl SceneWindow {
    /// Frames start at `estimates` (the truth when `None`); points are
    /// created at their true depth in plan order.
    pub(crate) fn build(
        config: WindowConfig,
        truth: &[FrameState],
        estimates: Option<&[FrameState]>,
        plans: &[PointPlan],
    ) -> Self {
        let scene = PlanarScene::new();
        let estimates = estimates.unwrap_or(truth);
        let ids: Vec<FrameId> = (0..truth.len() as u64).map(FrameId::new).collect();
        let images = scene.images(
            &ids.iter()
                .copied()
                .zip(truth.iter().copied())
                .collect::<Vec<_>>(),
        );
        let mut frontend = TestFrontend::new(*scene.intrinsics());
        let mut window = Window::new(config, *scene.intrinsics());
        let mut frames = Vec::new();
        for (id, state) in ids.iter().zip(estimates) {
            frontend.frames.insert(*id, *state);
            frames.push(window.add_frame(*id, *state).expect("add frame"));
        }
        let mut this = Self {
            scene,
            window,
            frontend,
            images,
            truth: truth.to_vec(),
            frames,
            points: Vec::new(),
            planes: Vec::new(),
        };
        for plan in plans {
            this.add_point(plan);
        }
        this
    }

    pub(crate) fn add_point(&mut self, plan: &PointPlan) -> PointHandle {
        let id = PointId::new(self.points.len() as u64);
        let state = self.scene.point_state(&self.truth[plan.host], plan.pixel);
        self.frontend.points.insert(id, state.clone());
        let handle = self
            .window
            .add_point(self.frames[plan.host], id, &state, POINT_PRIOR)
            .expect("add point");
        for target in &plan.targets {
            self.window
                .add_point_residual(handle, self.frames[*target])
                .expect("add residual");
        }
        self.points.push(handle);
        handle
    }

    pub(crate) fn add_plane(&mut self, host: usize, pixels: &[Vector2<f64>], targets: &[usize]) -> PlaneHandle {
        let id = PlaneId::new(self.planes.len() as u64);
        let state = self.scene.plane_state(&self.truth[host], pixels);
        self.frontend.planes.insert(id, state.clone());
        let handle = self
            .window
            .add_plane(self.frames[host], id, &state, Matrix3::identity() * POINT_PRIOR)
            .expect("add plane");
        for target in targets {
            self.window
                .add_plane_residual(handle, self.frames[*target])
                .expect("add plane residual");
        }
        self.planes.push(handle);
        handle
    }

    pub(crate) fn relinearize(&mut self) {
        self.window
            .relinearize(&self.frontend, &self.images)
            .expect("relinearize");
    }

    pub(crate) fn refresh(&mut self) {
        self.window
            .refresh(&self.frontend, &self.images)
            .expect("refresh");
    }
}

/// A 5 × 3 grid of host pixels well inside the image.
pub(crate) fn pixel_grid() -> Vec<[f64; 2]> {
    let mut pixels = Vec::new();
    for row in 0..3 {
        for col in 0..5 {
            pixels.push([70.0 + 45.0 * col as f64, 70.0 + 50.0 * row as f64]);
        }
    }
    pixels
}

pub(crate) fn two_view_truth() -> Vec<FrameState> {
    vec![
        fronto_parallel_frame([0.0, 0.0, 0.0], AffineBrightness::identity()),
        moved_frame([-0.2, 0.05, 0.02], [0.0, 0.02, 0.0], AffineBrightness::new(0.02, 1.0)),
    ]
}

pub(crate) fn three_view_truth() -> Vec<FrameState> {
    vec![
        fronto_parallel_frame([0.0, 0.0, 0.0], AffineBrightness::identity()),
        moved_frame([-0.15, 0.03, 0.0], [0.0, 0.015, 0.0], AffineBrightness::new(0.01, 0.5)),
        moved_frame([-0.3, 0.0, 0.03], [0.01, 0.02, 0.0], AffineBrightness::new(-0.01, -0.5)),
    ]
}
