//! SE(3) tangent-space math.
//!
//! Poses are `nalgebra::Isometry3<f64>`; tangent vectors use the
//! rotation-first ordering `[ωx, ωy, ωz, vx, vy, vz]`. `exp`/`log` are the
//! full SE(3) exponential map (rotation-translation coupling included), so
//! `exp(dt * log(v))` is the constant-twist motion the propagator and the
//! stable-pose factor rely on.

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, Vector3, Vector6};

/// Rigid transform in 3D.
pub type Pose3 = Isometry3<f64>;

/// Tangent vector `[ω, v]` of SE(3).
pub type Tangent = Vector6<f64>;

/// Below this angle the closed forms switch to their Taylor series.
const SMALL_ANGLE: f64 = 1e-9;

/// Skew-symmetric matrix of a 3-vector.
#[inline]
pub fn hat(w: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -w.z, w.y, w.z, 0.0, -w.x, -w.y, w.x, 0.0)
}

/// Coefficients of the SO(3)/SE(3) exponential:
/// `A = sinθ/θ`, `B = (1-cosθ)/θ²`, `C = (θ-sinθ)/θ³`.
fn abc(theta_sq: f64) -> (f64, f64, f64) {
    if theta_sq < SMALL_ANGLE {
        (
            1.0 - theta_sq / 6.0,
            0.5 - theta_sq / 24.0,
            1.0 / 6.0 - theta_sq / 120.0,
        )
    } else {
        let theta = theta_sq.sqrt();
        (
            theta.sin() / theta,
            (1.0 - theta.cos()) / theta_sq,
            (theta - theta.sin()) / (theta_sq * theta),
        )
    }
}

/// SE(3) exponential map.
pub fn exp(xi: &Tangent) -> Pose3 {
    let w = Vector3::new(xi[0], xi[1], xi[2]);
    let v = Vector3::new(xi[3], xi[4], xi[5]);

    let rotation = UnitQuaternion::from_scaled_axis(w);

    let theta_sq = w.norm_squared();
    let (_, b, c) = abc(theta_sq);
    let wx = hat(&w);
    let v_mat = Matrix3::identity() + wx * b + wx * wx * c;

    Pose3::from_parts(Translation3::from(v_mat * v), rotation)
}

/// SE(3) logarithm map, inverse of [`exp`].
pub fn log(pose: &Pose3) -> Tangent {
    let w = pose.rotation.scaled_axis();
    let t = pose.translation.vector;

    let theta_sq = w.norm_squared();
    let (a, b, _) = abc(theta_sq);
    let wx = hat(&w);
    // V⁻¹ = I - ½W + (1/θ²)(1 - A/(2B)) W²; the B in the denominator is
    // bounded away from zero for θ < 2π, so this form has no pole at θ = π.
    let coeff = if theta_sq < SMALL_ANGLE {
        1.0 / 12.0
    } else {
        (1.0 - a / (2.0 * b)) / theta_sq
    };
    let v_inv = Matrix3::identity() - wx * 0.5 + wx * wx * coeff;
    let v = v_inv * t;

    Tangent::new(w.x, w.y, w.z, v.x, v.y, v.z)
}

/// Relative transform `a⁻¹ · b`.
#[inline]
pub fn between(a: &Pose3, b: &Pose3) -> Pose3 {
    a.inverse() * b
}

/// Pose from intrinsic roll/pitch/yaw (applied as `Rz·Ry·Rx`) and a
/// translation, the convention the registration front-end reports in.
pub fn from_rpy_xyz(roll: f64, pitch: f64, yaw: f64, x: f64, y: f64, z: f64) -> Pose3 {
    Pose3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_euler_angles(roll, pitch, yaw),
    )
}

/// Roll/pitch/yaw of a pose, inverse of [`from_rpy_xyz`].
#[inline]
pub fn rpy(pose: &Pose3) -> (f64, f64, f64) {
    pose.rotation.euler_angles()
}

/// Apply the constant twist `v` (an SE(3) element whose log is the
/// per-second twist) to `pose` for `dt` seconds.
pub fn step(pose: &Pose3, velocity: &Pose3, dt: f64) -> Pose3 {
    pose * exp(&(log(velocity) * dt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn assert_pose_eq(a: &Pose3, b: &Pose3, eps: f64) {
        assert_relative_eq!(a.translation.vector, b.translation.vector, epsilon = eps);
        assert!(a.rotation.angle_to(&b.rotation) < eps);
    }

    #[test]
    fn test_exp_of_zero_is_identity() {
        let pose = exp(&Tangent::zeros());
        assert_pose_eq(&pose, &Pose3::identity(), 1e-12);
    }

    #[test]
    fn test_pure_translation_roundtrip() {
        let xi = Tangent::new(0.0, 0.0, 0.0, 1.0, -2.0, 0.5);
        let pose = exp(&xi);
        assert_relative_eq!(pose.translation.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(log(&pose), xi, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_log_roundtrip_general() {
        let xi = Tangent::new(0.3, -0.2, 0.5, 1.0, 2.0, -0.7);
        assert_relative_eq!(log(&exp(&xi)), xi, epsilon = 1e-9);
    }

    #[test]
    fn test_log_near_pi_rotation() {
        let xi = Tangent::new(PI - 1e-4, 0.0, 0.0, 0.2, 0.0, 0.0);
        assert_relative_eq!(log(&exp(&xi)), xi, epsilon = 1e-6);
    }

    #[test]
    fn test_screw_motion_couples_rotation_and_translation() {
        // A quarter-turn about z while "driving" along x traces a quarter
        // circle, not a straight line.
        let xi = Tangent::new(0.0, 0.0, FRAC_PI_2, 0.0, 0.0, 0.0)
            + Tangent::new(0.0, 0.0, 0.0, FRAC_PI_2, 0.0, 0.0);
        let pose = exp(&xi);
        assert_relative_eq!(pose.translation.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(pose.translation.y, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_between_roundtrip() {
        let a = from_rpy_xyz(0.1, -0.2, 0.3, 1.0, 2.0, 3.0);
        let b = from_rpy_xyz(-0.1, 0.05, 1.0, -2.0, 0.0, 1.0);
        let rel = between(&a, &b);
        assert_pose_eq(&(a * rel), &b, 1e-12);
    }

    #[test]
    fn test_rpy_roundtrip() {
        let pose = from_rpy_xyz(0.2, -0.4, 1.3, 0.0, 0.0, 0.0);
        let (r, p, y) = rpy(&pose);
        assert_relative_eq!(r, 0.2, epsilon = 1e-12);
        assert_relative_eq!(p, -0.4, epsilon = 1e-12);
        assert_relative_eq!(y, 1.3, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_twist_step() {
        let velocity = exp(&Tangent::new(0.0, 0.0, 0.0, 0.5, 0.0, 0.0));
        let mut pose = Pose3::identity();
        for _ in 0..4 {
            pose = step(&pose, &velocity, 1.0);
        }
        assert_relative_eq!(pose.translation.x, 2.0, epsilon = 1e-12);
    }
}
