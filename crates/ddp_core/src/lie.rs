//! Logarithm maps on SO(3)/SE(3) and the Jacobians of those logarithms.
//!
//! Tangent vectors of SE(3) are ordered `[linear; angular]`. All Jacobians are taken
//! with respect to a right (body-frame) perturbation `M * exp(δ)`.

use nalgebra::{Isometry3, Matrix3, Matrix6, Rotation3, Vector3, Vector6};

const SMALL_ANGLE: f64 = 1e-6;

pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rotation vector of `rotation`.
pub fn log3(rotation: &Rotation3<f64>) -> Vector3<f64> {
    rotation.scaled_axis()
}

/// Inverse right Jacobian of SO(3): `d log3(R exp(ω)) / dω` evaluated at `phi = log3(R)`.
pub fn jlog3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let t = phi.norm();
    let w = skew(phi);
    let w2 = w * w;
    let coeff = if t < SMALL_ANGLE {
        1.0 / 12.0 + t * t / 720.0
    } else {
        1.0 / (t * t) - (1.0 + t.cos()) / (2.0 * t * t.sin())
    };
    Matrix3::identity() + w * 0.5 + w2 * coeff
}

/// Left Jacobian of SO(3).
fn jl3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let t = phi.norm();
    let w = skew(phi);
    let (a, b) = if t < SMALL_ANGLE {
        (0.5 - t * t / 24.0, 1.0 / 6.0 - t * t / 120.0)
    } else {
        ((1.0 - t.cos()) / (t * t), (t - t.sin()) / (t * t * t))
    };
    Matrix3::identity() + w * a + w * w * b
}

/// Twist `[ρ; φ]` such that `exp([ρ; φ]) == placement`.
pub fn log6(placement: &Isometry3<f64>) -> Vector6<f64> {
    let rotation = placement.rotation.to_rotation_matrix();
    let phi = log3(&rotation);
    let rho = match jl3(&phi).try_inverse() {
        Some(v_inv) => v_inv * placement.translation.vector,
        None => placement.translation.vector,
    };
    let mut out = Vector6::zeros();
    out.fixed_rows_mut::<3>(0).copy_from(&rho);
    out.fixed_rows_mut::<3>(3).copy_from(&phi);
    out
}

/// Coupling block of the SE(3) left Jacobian.
fn q_block(rho: &Vector3<f64>, phi: &Vector3<f64>) -> Matrix3<f64> {
    let t = phi.norm();
    let rx = skew(rho);
    let px = skew(phi);
    let (c1, c2, c3) = if t < SMALL_ANGLE {
        (1.0 / 6.0, 1.0 / 24.0, 1.0 / 120.0)
    } else {
        let t2 = t * t;
        (
            (t - t.sin()) / (t2 * t),
            (t2 + 2.0 * t.cos() - 2.0) / (2.0 * t2 * t2),
            (2.0 * t - 3.0 * t.sin() + t * t.cos()) / (2.0 * t2 * t2 * t),
        )
    };
    let pr = px * rx;
    let rp = rx * px;
    let prp = px * rx * px;
    rx * 0.5
        + (pr + rp + prp) * c1
        + (px * pr + rp * px - prp * 3.0) * c2
        + (prp * px + px * prp) * c3
}

/// Inverse right Jacobian of SE(3) evaluated at the twist `xi = log6(M)`.
pub fn jlog6(xi: &Vector6<f64>) -> Matrix6<f64> {
    let rho: Vector3<f64> = xi.fixed_rows::<3>(0).into_owned();
    let phi: Vector3<f64> = xi.fixed_rows::<3>(3).into_owned();
    let jinv = jlog3(&phi);
    let q = q_block(&(-rho), &(-phi));
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&jinv);
    out.fixed_view_mut::<3, 3>(3, 3).copy_from(&jinv);
    out.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(-(jinv * q * jinv)));
    out
}

/// Right-multiplies `placement` by `exp(delta)` where `delta = [v; w]`.
pub fn exp6_right(placement: &Isometry3<f64>, delta: &Vector6<f64>) -> Isometry3<f64> {
    let v: Vector3<f64> = delta.fixed_rows::<3>(0).into_owned();
    let w: Vector3<f64> = delta.fixed_rows::<3>(3).into_owned();
    let step = Isometry3::new(jl3(&w) * v, w);
    placement * step
}
