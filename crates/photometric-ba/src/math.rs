use nalgebra::{Matrix3, Matrix6, Rotation3, Translation3, Vector3, Vector6};

use crate::Pose;

pub(crate) fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

pub(crate) fn so3_exp(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let omega_hat = skew(omega);
    let omega_hat2 = omega_hat * omega_hat;

    if theta < 1e-12 {
        return Matrix3::identity() + omega_hat + 0.5 * omega_hat2;
    }

    let a = theta.sin() / theta;
    let b = (1.0 - theta.cos()) / (theta * theta);
    Matrix3::identity() + a * omega_hat + b * omega_hat2
}

pub(crate) fn so3_log(r: &Matrix3<f64>) -> Vector3<f64> {
    let trace = r.trace();
    let cos_theta = ((trace - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();
    let vee = Vector3::new(
        r[(2, 1)] - r[(1, 2)],
        r[(0, 2)] - r[(2, 0)],
        r[(1, 0)] - r[(0, 1)],
    );

    if theta < 1e-12 {
        return 0.5 * vee;
    }

    if (std::f64::consts::PI - theta).abs() < 1e-6 {
        let mut axis = Vector3::new(
            ((r[(0, 0)] + 1.0) * 0.5).max(0.0).sqrt(),
            ((r[(1, 1)] + 1.0) * 0.5).max(0.0).sqrt(),
            ((r[(2, 2)] + 1.0) * 0.5).max(0.0).sqrt(),
        );
        for i in 0..3 {
            if vee[i] < 0.0 {
                axis[i] = -axis[i];
            }
        }
        let norm = axis.norm();
        if norm > 1e-12 {
            return axis * (theta / norm);
        }
    }

    vee * (theta / (2.0 * theta.sin()))
}

/// Exponential map of a twist `[v, ω]`.
pub(crate) fn se3_exp(xi: &Vector6<f64>) -> Pose {
    let rho = xi.fixed_rows::<3>(0).into_owned();
    let omega = xi.fixed_rows::<3>(3).into_owned();
    let rotation = so3_exp(&omega);
    let theta = omega.norm();
    let omega_hat = skew(&omega);
    let omega_hat2 = omega_hat * omega_hat;
    let v = if theta < 1e-9 {
        Matrix3::identity() + 0.5 * omega_hat + (1.0 / 6.0) * omega_hat2
    } else {
        let theta2 = theta * theta;
        let b = (1.0 - theta.cos()) / theta2;
        let c = (theta - theta.sin()) / (theta2 * theta);
        Matrix3::identity() + b * omega_hat + c * omega_hat2
    };
    Pose::from_parts(
        Translation3::from(v * rho),
        Rotation3::from_matrix_unchecked(rotation),
    )
}

pub(crate) fn se3_log(pose: &Pose) -> Vector6<f64> {
    let omega = so3_log(pose.rotation.matrix());
    let theta = omega.norm();
    let omega_hat = skew(&omega);
    let omega_hat2 = omega_hat * omega_hat;
    let v_inv = if theta < 1e-9 {
        Matrix3::identity() - 0.5 * omega_hat + (1.0 / 12.0) * omega_hat2
    } else {
        let theta2 = theta * theta;
        let a = (1.0 / theta2) * (1.0 - (theta * theta.sin()) / (2.0 * (1.0 - theta.cos())));
        Matrix3::identity() - 0.5 * omega_hat + a * omega_hat2
    };
    let rho = v_inv * pose.translation.vector;
    Vector6::new(rho.x, rho.y, rho.z, omega.x, omega.y, omega.z)
}

/// Adjoint of `pose` acting on `[v, ω]` twists: `exp(Adj ξ) T = T exp(ξ)`.
pub(crate) fn se3_adjoint(pose: &Pose) -> Matrix6<f64> {
    let r = pose.rotation.matrix();
    let t_hat = skew(&pose.translation.vector);
    let mut adj = Matrix6::zeros();
    adj.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    adj.fixed_view_mut::<3, 3>(0, 3).copy_from(&(t_hat * r));
    adj.fixed_view_mut::<3, 3>(3, 3).copy_from(r);
    adj
}

#[cfg(test)]
mod tests {
    use super::{se3_adjoint, se3_exp, se3_log, so3_exp, so3_log};
    use nalgebra::{Vector3, Vector6};

    #[test]
    fn so3_exp_log_round_trip() {
        let omega = Vector3::new(0.2, -0.1, 0.07);
        let recovered = so3_log(&so3_exp(&omega));
        let err = (recovered - omega).norm();
        assert!(err < 1e-9, "so3 round-trip error: {err}");
    }

    #[test]
    fn se3_exp_log_round_trip() {
        let xi = Vector6::new(0.05, -0.03, 0.02, 0.1, -0.04, 0.03);
        let recovered = se3_log(&se3_exp(&xi));
        let err = (recovered - xi).norm();
        assert!(err < 1e-9, "se3 round-trip error: {err}");
    }

    #[test]
    fn so3_log_is_finite_near_pi() {
        let theta = std::f64::consts::PI - 1e-6;
        let recovered = so3_log(&so3_exp(&Vector3::new(0.0, theta, 0.0)));
        assert!(recovered.iter().all(|v| v.is_finite()));
        assert!(
            (recovered.norm() - theta).abs() < 2e-4,
            "near-pi mismatch: recovered={}, expected={theta}",
            recovered.norm()
        );
    }

    #[test]
    fn adjoint_moves_right_perturbation_to_the_left() {
        let pose = se3_exp(&Vector6::new(0.3, -0.2, 0.5, 0.1, 0.25, -0.15));
        let xi = Vector6::new(0.01, 0.02, -0.015, 0.005, -0.01, 0.02);
        let right = pose * se3_exp(&xi);
        let left = se3_exp(&(se3_adjoint(&pose) * xi)) * pose;
        let err = se3_log(&(left.inverse() * right)).norm();
        assert!(err < 1e-12, "adjoint mismatch: {err}");
    }
}
