use nalgebra::{Matrix2x3, Matrix2x4, Matrix2x6, Matrix3, Matrix3x6, Vector2, Vector3, Vector4};

use crate::math::skew;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PinholeIntrinsics {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum IntrinsicsError {
    #[error("pinhole focal lengths must be finite and > 0 (fx={fx}, fy={fy})")]
    NonPositiveFocal { fx: f64, fy: f64 },
    #[error("pinhole principal point must be finite (cx={cx}, cy={cy})")]
    NonFinitePrincipalPoint { cx: f64, cy: f64 },
}

impl PinholeIntrinsics {
    pub fn try_new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, IntrinsicsError> {
        if !(fx.is_finite() && fy.is_finite()) || fx <= 0.0 || fy <= 0.0 {
            return Err(IntrinsicsError::NonPositiveFocal { fx, fy });
        }
        if !(cx.is_finite() && cy.is_finite()) {
            return Err(IntrinsicsError::NonFinitePrincipalPoint { cx, cy });
        }
        Ok(Self { fx, fy, cx, cy })
    }

    pub fn fx(&self) -> f64 {
        self.fx
    }

    pub fn fy(&self) -> f64 {
        self.fy
    }

    pub fn cx(&self) -> f64 {
        self.cx
    }

    pub fn cy(&self) -> f64 {
        self.cy
    }

    /// Parameter vector in update order `(fx, fy, cx, cy)`.
    pub fn as_vector(&self) -> Vector4<f64> {
        Vector4::new(self.fx, self.fy, self.cx, self.cy)
    }

    /// Additive update, as applied by a frontend to a solver step.
    pub fn apply_delta(&self, delta: &Vector4<f64>) -> Result<Self, IntrinsicsError> {
        let v = self.as_vector() + delta;
        Self::try_new(v[0], v[1], v[2], v[3])
    }

    /// Back-projection of a pixel onto the `z = 1` plane.
    pub fn normalized(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
    }

    pub fn project(&self, y: &Vector3<f64>) -> Vector2<f64> {
        Vector2::new(
            self.fx * y.x / y.z + self.cx,
            self.fy * y.y / y.z + self.cy,
        )
    }

    /// Derivatives of [`Self::normalized`] with respect to `(fx, fy, cx, cy)`.
    fn normalized_derivatives(&self, p_n: &Vector3<f64>) -> [Vector3<f64>; 4] {
        [
            Vector3::new(-p_n.x / self.fx, 0.0, 0.0),
            Vector3::new(0.0, -p_n.y / self.fy, 0.0),
            Vector3::new(-1.0 / self.fx, 0.0, 0.0),
            Vector3::new(0.0, -1.0 / self.fy, 0.0),
        ]
    }
}

/// Geometric Jacobians of one host pixel projected into a target frame.
#[derive(Clone, Debug)]
pub(crate) struct Projection {
    pub(crate) pixel: Vector2<f64>,
    pub(crate) jp_dxi: Matrix2x6<f64>,
    pub(crate) jp_dc: Matrix2x4<f64>,
    pub(crate) jp_dd: Vector2<f64>,
    /// Back-projected host pixel and its intrinsics derivatives, for planes.
    pub(crate) p_n: Vector3<f64>,
    pub(crate) dpn_dc: [Vector3<f64>; 4],
}

/// Minimum camera-frame depth (in units of the inverse-depth scaled point)
/// accepted as in front of the target camera.
const MIN_PROJECTED_DEPTH: f64 = 1e-9;

/// Projects a host pixel with inverse depth `idepth` through the relative pose
/// `(rotation, translation)` of the target with respect to the host.
///
/// Uses the homogeneous form `Y = R p_n + ρ t`, which is the target-frame point
/// scaled by `ρ`. Returns `None` when the point is not in front of the target.
pub(crate) fn project_with_jacobians(
    intrinsics: &PinholeIntrinsics,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    host_pixel: &Vector2<f64>,
    idepth: f64,
) -> Option<Projection> {
    let p_n = intrinsics.normalized(host_pixel);
    let y = rotation * p_n + translation * idepth;
    if !(y.z > MIN_PROJECTED_DEPTH) || !y.iter().all(|v| v.is_finite()) {
        return None;
    }
    let inv_z = 1.0 / y.z;
    let pixel = intrinsics.project(&y);

    let d_proj = Matrix2x3::new(
        intrinsics.fx * inv_z,
        0.0,
        -intrinsics.fx * y.x * inv_z * inv_z,
        0.0,
        intrinsics.fy * inv_z,
        -intrinsics.fy * y.y * inv_z * inv_z,
    );

    let mut d_pose = Matrix3x6::zeros();
    d_pose
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(Matrix3::identity() * idepth));
    d_pose.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-skew(&y)));
    let jp_dxi = d_proj * d_pose;
    let jp_dd = d_proj * translation;

    let dpn_dc = intrinsics.normalized_derivatives(&p_n);
    let mut jp_dc = Matrix2x4::zeros();
    for (col, dpn) in dpn_dc.iter().enumerate() {
        jp_dc.set_column(col, &(d_proj * (rotation * dpn)));
    }
    // direct dependence of the projection on (fx, fy, cx, cy)
    jp_dc[(0, 0)] += y.x * inv_z;
    jp_dc[(1, 1)] += y.y * inv_z;
    jp_dc[(0, 2)] += 1.0;
    jp_dc[(1, 3)] += 1.0;

    Some(Projection {
        pixel,
        jp_dxi,
        jp_dc,
        jp_dd,
        p_n,
        dpn_dc,
    })
}

/// Pixel-only projection, used for pattern pixels sharing the centre Jacobian.
pub(crate) fn project_pixel(
    intrinsics: &PinholeIntrinsics,
    rotation: &Matrix3<f64>,
    translation: &Vector3<f64>,
    host_pixel: &Vector2<f64>,
    idepth: f64,
) -> Option<Vector2<f64>> {
    let y = rotation * intrinsics.normalized(host_pixel) + translation * idepth;
    if !(y.z > MIN_PROJECTED_DEPTH) || !y.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(intrinsics.project(&y))
}
