use std::num::NonZeroUsize;

use crate::env::{env_f64, env_usize};

const DEFAULT_DAMPING_ATTEMPTS: NonZeroUsize = nonzero(6);
const DEFAULT_RELINEARIZE_INTERVAL: NonZeroUsize = nonzero(4);

const fn nonzero(n: usize) -> NonZeroUsize {
    match NonZeroUsize::new(n) {
        Some(n) => n,
        None => panic!("default must be non-zero"),
    }
}

/// Unvalidated window parameters. Build a [`WindowConfig`] from them with
/// [`WindowConfig::new`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WindowParams {
    /// Huber threshold on the per-pixel photometric residual.
    pub huber_threshold: f64,
    /// A residual whose energy exceeds this times its pixel count is an outlier.
    pub outlier_energy_per_pixel: f64,
    /// Landmarks whose self-Hessian is below this are skipped for an iteration.
    pub singular_threshold: f64,
    pub initial_lambda: f64,
    pub lambda_growth: f64,
    pub max_damping_attempts: usize,
    /// Iterations between relinearization events in [`crate::Window::optimize`].
    pub relinearize_interval: usize,
    /// Diagonal prior precision on the intrinsics, around their initial value.
    pub intrinsics_prior: f64,
    /// Gauge prior precision on all 8 parameters of the first frame.
    pub first_frame_prior: f64,
    /// Prior precisions on `(a, b)` of every other frame.
    pub affine_prior: [f64; 2],
    /// Steps whose largest component is below this end the optimization.
    pub convergence_threshold: f64,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            huber_threshold: 9.0,
            outlier_energy_per_pixel: 144.0,
            singular_threshold: 1e-10,
            initial_lambda: 1e-5,
            lambda_growth: 10.0,
            max_damping_attempts: DEFAULT_DAMPING_ATTEMPTS.get(),
            relinearize_interval: DEFAULT_RELINEARIZE_INTERVAL.get(),
            intrinsics_prior: 1e14,
            first_frame_prior: 1e10,
            affine_prior: [0.0, 0.0],
            convergence_threshold: 1e-9,
        }
    }
}

impl WindowParams {
    /// Defaults overlaid with `PHOTOBA_*` environment variables. Unparsable
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        let mut params = Self::default();
        if let Some(v) = env_f64("PHOTOBA_HUBER_THRESHOLD") {
            params.huber_threshold = v;
        }
        if let Some(v) = env_f64("PHOTOBA_OUTLIER_ENERGY") {
            params.outlier_energy_per_pixel = v;
        }
        if let Some(v) = env_f64("PHOTOBA_SINGULAR_THRESHOLD") {
            params.singular_threshold = v;
        }
        if let Some(v) = env_f64("PHOTOBA_LAMBDA") {
            params.initial_lambda = v;
        }
        if let Some(v) = env_f64("PHOTOBA_LAMBDA_GROWTH") {
            params.lambda_growth = v;
        }
        if let Some(v) = env_usize("PHOTOBA_DAMPING_ATTEMPTS") {
            params.max_damping_attempts = v;
        }
        if let Some(v) = env_usize("PHOTOBA_RELINEARIZE_INTERVAL") {
            params.relinearize_interval = v;
        }
        if let Some(v) = env_f64("PHOTOBA_INTRINSICS_PRIOR") {
            params.intrinsics_prior = v;
        }
        if let Some(v) = env_f64("PHOTOBA_FIRST_FRAME_PRIOR") {
            params.first_frame_prior = v;
        }
        if let Some(v) = env_f64("PHOTOBA_AFFINE_A_PRIOR") {
            params.affine_prior[0] = v;
        }
        if let Some(v) = env_f64("PHOTOBA_AFFINE_B_PRIOR") {
            params.affine_prior[1] = v;
        }
        if let Some(v) = env_f64("PHOTOBA_CONVERGENCE") {
            params.convergence_threshold = v;
        }
        params
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WindowConfig {
    huber_threshold: f64,
    outlier_energy_per_pixel: f64,
    singular_threshold: f64,
    initial_lambda: f64,
    lambda_growth: f64,
    max_damping_attempts: NonZeroUsize,
    relinearize_interval: NonZeroUsize,
    intrinsics_prior: f64,
    first_frame_prior: f64,
    affine_prior: [f64; 2],
    convergence_threshold: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be finite and > 0 (got {value})")]
    NonPositive { name: &'static str, value: f64 },
    #[error("{name} must be finite and >= 0 (got {value})")]
    Negative { name: &'static str, value: f64 },
    #[error("lambda growth must be > 1 (got {value})")]
    LambdaGrowth { value: f64 },
    #[error("{name} must be > 0")]
    Zero { name: &'static str },
}

fn positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::Negative { name, value })
    }
}

impl WindowConfig {
    pub fn new(params: WindowParams) -> Result<Self, ConfigError> {
        let lambda_growth = params.lambda_growth;
        if !lambda_growth.is_finite() || lambda_growth <= 1.0 {
            return Err(ConfigError::LambdaGrowth {
                value: lambda_growth,
            });
        }
        Ok(Self {
            huber_threshold: positive("huber threshold", params.huber_threshold)?,
            outlier_energy_per_pixel: positive(
                "outlier energy per pixel",
                params.outlier_energy_per_pixel,
            )?,
            singular_threshold: non_negative("singular threshold", params.singular_threshold)?,
            initial_lambda: non_negative("initial lambda", params.initial_lambda)?,
            lambda_growth,
            max_damping_attempts: NonZeroUsize::new(params.max_damping_attempts).ok_or(
                ConfigError::Zero {
                    name: "damping attempts",
                },
            )?,
            relinearize_interval: NonZeroUsize::new(params.relinearize_interval).ok_or(
                ConfigError::Zero {
                    name: "relinearize interval",
                },
            )?,
            intrinsics_prior: non_negative("intrinsics prior", params.intrinsics_prior)?,
            first_frame_prior: non_negative("first frame prior", params.first_frame_prior)?,
            affine_prior: [
                non_negative("affine a prior", params.affine_prior[0])?,
                non_negative("affine b prior", params.affine_prior[1])?,
            ],
            convergence_threshold: non_negative(
                "convergence threshold",
                params.convergence_threshold,
            )?,
        })
    }

    /// Validated [`WindowParams::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(WindowParams::from_env())
    }

    pub fn params(&self) -> WindowParams {
        WindowParams {
            huber_threshold: self.huber_threshold,
            outlier_energy_per_pixel: self.outlier_energy_per_pixel,
            singular_threshold: self.singular_threshold,
            initial_lambda: self.initial_lambda,
            lambda_growth: self.lambda_growth,
            max_damping_attempts: self.max_damping_attempts.get(),
            relinearize_interval: self.relinearize_interval.get(),
            intrinsics_prior: self.intrinsics_prior,
            first_frame_prior: self.first_frame_prior,
            affine_prior: self.affine_prior,
            convergence_threshold: self.convergence_threshold,
        }
    }

    pub fn huber_threshold(&self) -> f64 {
        self.huber_threshold
    }

    pub fn outlier_energy_per_pixel(&self) -> f64 {
        self.outlier_energy_per_pixel
    }

    pub fn singular_threshold(&self) -> f64 {
        self.singular_threshold
    }

    pub fn initial_lambda(&self) -> f64 {
        self.initial_lambda
    }

    pub fn lambda_growth(&self) -> f64 {
        self.lambda_growth
    }

    pub fn max_damping_attempts(&self) -> NonZeroUsize {
        self.max_damping_attempts
    }

    pub fn relinearize_interval(&self) -> NonZeroUsize {
        self.relinearize_interval
    }

    pub fn intrinsics_prior(&self) -> f64 {
        self.intrinsics_prior
    }

    pub fn first_frame_prior(&self) -> f64 {
        self.first_frame_prior
    }

    pub fn affine_prior(&self) -> [f64; 2] {
        self.affine_prior
    }

    pub fn convergence_threshold(&self) -> f64 {
        self.convergence_threshold
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        let defaults = WindowParams::default();
        Self {
            huber_threshold: defaults.huber_threshold,
            outlier_energy_per_pixel: defaults.outlier_energy_per_pixel,
            singular_threshold: defaults.singular_threshold,
            initial_lambda: defaults.initial_lambda,
            lambda_growth: defaults.lambda_growth,
            max_damping_attempts: DEFAULT_DAMPING_ATTEMPTS,
            relinearize_interval: DEFAULT_RELINEARIZE_INTERVAL,
            intrinsics_prior: defaults.intrinsics_prior,
            first_frame_prior: defaults.first_frame_prior,
            affine_prior: defaults.affine_prior,
            convergence_threshold: defaults.convergence_threshold,
        }
    }
}
