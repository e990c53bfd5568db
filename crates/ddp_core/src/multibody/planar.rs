//! A planar serial arm used as a reference rigid-body engine.
//!
//! Revolute joints rotate about the world z axis, so the arm moves in the xy plane.
//! Each link carries a point mass at its distal end and gravity acts along −y. The
//! joint-space inertia is a constant diagonal (reflected rotor inertia) with viscous
//! damping, which keeps the dynamics derivatives in closed form.

use nalgebra::{DMatrix, DVector, Isometry3, Translation3, UnitQuaternion, Vector3};
use rand::{Rng, RngCore};

use super::{FrameIndex, Multibody, MultibodyData, Quantity};
use crate::error::{check_dim, Error, Result};

#[derive(Debug, Clone)]
pub struct PlanarArm {
    lengths: Vec<f64>,
    masses: Vec<f64>,
    inertias: Vec<f64>,
    damping: Vec<f64>,
    gravity: f64,
    lower_limits: Vec<f64>,
    upper_limits: Vec<f64>,
}

/// Cumulative joint angles and link-end positions for one configuration.
struct ChainPoints {
    angles: Vec<f64>,
    ends: Vec<Vector3<f64>>,
}

impl ChainPoints {
    /// Origin of joint `j`, which is the end of link `j - 1`.
    fn origin(&self, j: usize) -> Vector3<f64> {
        if j == 0 {
            Vector3::zeros()
        } else {
            self.ends[j - 1]
        }
    }
}

impl PlanarArm {
    pub fn new(lengths: Vec<f64>, masses: Vec<f64>) -> Result<Self> {
        let n = lengths.len();
        if n == 0 {
            return Err(Error::InvalidArgument(
                "a planar arm needs at least one link".into(),
            ));
        }
        check_dim("link masses", n, masses.len())?;
        if lengths.iter().chain(masses.iter()).any(|v| *v <= 0.0) {
            return Err(Error::InvalidArgument(
                "link lengths and masses must be positive".into(),
            ));
        }
        Ok(Self {
            lengths,
            masses,
            inertias: vec![1.0; n],
            damping: vec![0.1; n],
            gravity: 9.81,
            lower_limits: vec![-std::f64::consts::PI; n],
            upper_limits: vec![std::f64::consts::PI; n],
        })
    }

    /// Three links of decreasing length, handy for tests and demos.
    pub fn three_link() -> Self {
        Self {
            lengths: vec![0.5, 0.4, 0.3],
            masses: vec![1.5, 1.0, 0.5],
            inertias: vec![1.0, 0.6, 0.3],
            damping: vec![0.1; 3],
            gravity: 9.81,
            lower_limits: vec![-std::f64::consts::PI; 3],
            upper_limits: vec![std::f64::consts::PI; 3],
        }
    }

    pub fn with_joint_inertias(mut self, inertias: Vec<f64>) -> Result<Self> {
        check_dim("joint inertias", self.lengths.len(), inertias.len())?;
        if inertias.iter().any(|v| *v <= 0.0) {
            return Err(Error::InvalidArgument(
                "joint inertias must be positive".into(),
            ));
        }
        self.inertias = inertias;
        Ok(self)
    }

    pub fn with_damping(mut self, damping: Vec<f64>) -> Result<Self> {
        check_dim("joint damping", self.lengths.len(), damping.len())?;
        self.damping = damping;
        Ok(self)
    }

    pub fn with_gravity(mut self, gravity: f64) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn with_position_limits(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        let n = self.lengths.len();
        check_dim("lower position limits", n, lower.len())?;
        check_dim("upper position limits", n, upper.len())?;
        if lower.iter().zip(&upper).any(|(l, u)| l > u) {
            return Err(Error::InvalidArgument(
                "lower position limit exceeds upper limit".into(),
            ));
        }
        self.lower_limits = lower;
        self.upper_limits = upper;
        Ok(self)
    }

    pub fn lower_position_limits(&self) -> &[f64] {
        &self.lower_limits
    }

    pub fn upper_position_limits(&self) -> &[f64] {
        &self.upper_limits
    }

    fn chain(&self, q: &DVector<f64>) -> ChainPoints {
        let mut angles = Vec::with_capacity(q.len());
        let mut ends = Vec::with_capacity(q.len());
        let mut theta = 0.0;
        let mut point = Vector3::zeros();
        for (i, &length) in self.lengths.iter().enumerate() {
            theta += q[i];
            point += Vector3::new(length * theta.cos(), length * theta.sin(), 0.0);
            angles.push(theta);
            ends.push(point);
        }
        ChainPoints { angles, ends }
    }

    fn angular_rates(&self, v: &DVector<f64>) -> Vec<f64> {
        v.iter()
            .scan(0.0, |acc, vi| {
                *acc += vi;
                Some(*acc)
            })
            .collect()
    }

    fn frame_jacobian(&self, points: &ChainPoints, frame: usize) -> DMatrix<f64> {
        let n = self.lengths.len();
        let mut jac = DMatrix::zeros(6, n);
        let end = points.ends[frame];
        for j in 0..=frame {
            let arm = end - points.origin(j);
            jac[(0, j)] = -arm.y;
            jac[(1, j)] = arm.x;
            jac[(5, j)] = 1.0;
        }
        jac
    }

    fn total_mass(&self) -> f64 {
        self.masses.iter().sum()
    }

    fn write_frame_velocities(&self, data: &mut MultibodyData, points: &ChainPoints, v: &DVector<f64>) {
        let rates = self.angular_rates(v);
        for k in 0..self.lengths.len() {
            let mut twist = nalgebra::Vector6::zeros();
            for i in 0..=k {
                let (s, c) = points.angles[i].sin_cos();
                twist[0] -= self.lengths[i] * rates[i] * s;
                twist[1] += self.lengths[i] * rates[i] * c;
            }
            twist[5] = rates[k];
            data.frame_velocities[k] = twist;
        }
    }

    fn write_frame_jacobians(&self, data: &mut MultibodyData, points: &ChainPoints) {
        for k in 0..self.lengths.len() {
            data.frame_jacobians[k] = self.frame_jacobian(points, k);
        }
    }

    fn gravity_torques(&self, points: &ChainPoints) -> DVector<f64> {
        let n = self.lengths.len();
        DVector::from_fn(n, |j, _| {
            let origin = points.origin(j);
            (j..n)
                .map(|i| self.masses[i] * (points.ends[i].x - origin.x))
                .sum::<f64>()
                * self.gravity
        })
    }
}

impl Multibody for PlanarArm {
    fn nq(&self) -> usize {
        self.lengths.len()
    }

    fn nv(&self) -> usize {
        self.lengths.len()
    }

    fn nframes(&self) -> usize {
        self.lengths.len()
    }

    /// Frames are named `link_1` … `link_n` after the link whose end they mark;
    /// `end_effector` aliases the last one.
    fn frame_id(&self, name: &str) -> Option<FrameIndex> {
        let n = self.lengths.len();
        if name == "end_effector" {
            return Some(n - 1);
        }
        let index: usize = name.strip_prefix("link_")?.parse().ok()?;
        (1..=n).contains(&index).then(|| index - 1)
    }

    fn random_configuration(&self, rng: &mut dyn RngCore) -> DVector<f64> {
        DVector::from_fn(self.lengths.len(), |i, _| {
            let (lo, hi) = (self.lower_limits[i], self.upper_limits[i]);
            if lo == hi {
                lo
            } else {
                rng.gen_range(lo..hi)
            }
        })
    }

    fn forward_kinematics(&self, data: &mut MultibodyData, q: &DVector<f64>, v: &DVector<f64>) {
        let points = self.chain(q);
        self.write_frame_velocities(data, &points, v);
        data.q = q.clone();
        data.v = v.clone();
        data.stamp(Quantity::FrameVelocities, q, v);
    }

    fn update_frame_placements(&self, data: &mut MultibodyData) {
        let q = data.q.clone();
        let points = self.chain(&q);
        for k in 0..self.lengths.len() {
            let end = points.ends[k];
            data.frame_placements[k] = Isometry3::from_parts(
                Translation3::new(end.x, end.y, end.z),
                UnitQuaternion::from_axis_angle(&Vector3::z_axis(), points.angles[k]),
            );
        }
        let v = data.v.clone();
        data.stamp(Quantity::FramePlacements, &q, &v);
    }

    fn compute_joint_jacobians(&self, data: &mut MultibodyData, q: &DVector<f64>) {
        let points = self.chain(q);
        self.write_frame_jacobians(data, &points);
        let v = data.v.clone();
        data.stamp(Quantity::FrameJacobians, q, &v);
    }

    fn compute_forward_kinematics_derivatives(
        &self,
        data: &mut MultibodyData,
        q: &DVector<f64>,
        v: &DVector<f64>,
    ) {
        let n = self.lengths.len();
        let points = self.chain(q);
        let rates = self.angular_rates(v);
        self.write_frame_jacobians(data, &points);
        self.write_frame_velocities(data, &points, v);
        for k in 0..n {
            let mut dq = DMatrix::zeros(6, n);
            for m in 0..=k {
                for i in m..=k {
                    let (s, c) = points.angles[i].sin_cos();
                    dq[(0, m)] -= self.lengths[i] * rates[i] * c;
                    dq[(1, m)] -= self.lengths[i] * rates[i] * s;
                }
            }
            data.frame_velocity_dq[k] = dq;
        }
        data.q = q.clone();
        data.v = v.clone();
        data.stamp(Quantity::FrameJacobians, q, v);
        data.stamp(Quantity::FrameVelocities, q, v);
        data.stamp(Quantity::FrameVelocityDerivatives, q, v);
    }

    fn center_of_mass(&self, data: &mut MultibodyData, q: &DVector<f64>) {
        let points = self.chain(q);
        let weighted = points
            .ends
            .iter()
            .zip(&self.masses)
            .fold(Vector3::zeros(), |acc, (p, m)| acc + p * *m);
        data.com = weighted / self.total_mass();
        let v = data.v.clone();
        data.stamp(Quantity::CenterOfMass, q, &v);
    }

    fn jacobian_center_of_mass(&self, data: &mut MultibodyData, q: &DVector<f64>) {
        self.center_of_mass(data, q);
        let n = self.lengths.len();
        let points = self.chain(q);
        let mut jcom = DMatrix::zeros(3, n);
        for (k, mass) in self.masses.iter().enumerate() {
            let jac = self.frame_jacobian(&points, k);
            jcom += jac.rows(0, 3) * *mass;
        }
        data.com_jacobian = jcom / self.total_mass();
        let v = data.v.clone();
        data.stamp(Quantity::CenterOfMassJacobian, q, &v);
    }

    fn forward_dynamics(
        &self,
        data: &mut MultibodyData,
        q: &DVector<f64>,
        v: &DVector<f64>,
        tau: &DVector<f64>,
    ) -> Result<()> {
        let n = self.lengths.len();
        check_dim("joint torques", n, tau.len())?;
        let gravity = self.gravity_torques(&self.chain(q));
        data.ddq = DVector::from_fn(n, |j, _| {
            (tau[j] - self.damping[j] * v[j] - gravity[j]) / self.inertias[j]
        });
        Ok(())
    }

    fn compute_dynamics_derivatives(
        &self,
        data: &mut MultibodyData,
        q: &DVector<f64>,
        _v: &DVector<f64>,
        tau: &DVector<f64>,
    ) -> Result<()> {
        let n = self.lengths.len();
        check_dim("joint torques", n, tau.len())?;
        let points = self.chain(q);
        let mut ddq_dq = DMatrix::zeros(n, n);
        for j in 0..n {
            for m in 0..n {
                let k = j.max(m);
                let origin = points.origin(k);
                let dg: f64 = -self.gravity
                    * (k..n)
                        .map(|i| self.masses[i] * (points.ends[i].y - origin.y))
                        .sum::<f64>();
                ddq_dq[(j, m)] = -dg / self.inertias[j];
            }
        }
        data.ddq_dq = ddq_dq;
        data.ddq_dv = DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                -self.damping[i] / self.inertias[i]
            } else {
                0.0
            }
        });
        data.ddq_dtau = DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                1.0 / self.inertias[i]
            } else {
                0.0
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn new_rejects_invalid_links() {
        assert!(PlanarArm::new(vec![], vec![]).is_err());
        assert!(PlanarArm::new(vec![1.0], vec![1.0, 2.0]).is_err());
        assert!(PlanarArm::new(vec![1.0, -1.0], vec![1.0, 1.0]).is_err());
    }

    #[test]
    fn frame_ids_resolve_names() {
        let arm = PlanarArm::three_link();
        assert_eq!(arm.frame_id("link_1"), Some(0));
        assert_eq!(arm.frame_id("link_3"), Some(2));
        assert_eq!(arm.frame_id("end_effector"), Some(2));
        assert_eq!(arm.frame_id("link_4"), None);
        assert_eq!(arm.frame_id("gripper"), None);
    }

    #[test]
    fn stretched_arm_places_tip_at_total_length() {
        let arm = PlanarArm::three_link();
        let mut data = arm.create_data();
        let q = DVector::zeros(3);
        arm.forward_kinematics(&mut data, &q, &DVector::zeros(3));
        arm.update_frame_placements(&mut data);
        let tip = data.frame_placements[2].translation.vector;
        assert!(approx(tip.x, 1.2));
        assert!(approx(tip.y, 0.0));
    }

    #[test]
    fn jacobian_matches_velocity_map() {
        let arm = PlanarArm::three_link();
        let mut data = arm.create_data();
        let q = DVector::from_vec(vec![0.3, -0.7, 1.1]);
        let v = DVector::from_vec(vec![0.5, 0.2, -0.4]);
        arm.forward_kinematics(&mut data, &q, &v);
        arm.compute_joint_jacobians(&mut data, &q);
        for k in 0..3 {
            let expected = &data.frame_jacobians[k] * &v;
            for i in 0..6 {
                assert!(approx(expected[i], data.frame_velocities[k][i]));
            }
        }
    }

    #[test]
    fn hanging_arm_is_in_static_equilibrium() {
        let arm = PlanarArm::three_link();
        let mut data = arm.create_data();
        let q = DVector::from_vec(vec![-std::f64::consts::FRAC_PI_2, 0.0, 0.0]);
        let zero = DVector::zeros(3);
        arm.forward_dynamics(&mut data, &q, &zero, &zero)
            .expect("dynamics should evaluate");
        assert!(data.ddq.norm() < 1e-12);
    }

    #[test]
    fn dynamics_derivatives_match_finite_differences() {
        let arm = PlanarArm::three_link();
        let mut data = arm.create_data();
        let q = DVector::from_vec(vec![0.3, -0.7, 1.1]);
        let v = DVector::from_vec(vec![0.5, 0.2, -0.4]);
        let tau = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        arm.forward_dynamics(&mut data, &q, &v, &tau).unwrap();
        let a0 = data.ddq.clone();
        arm.compute_dynamics_derivatives(&mut data, &q, &v, &tau)
            .unwrap();
        let eps = 1e-7;
        for m in 0..3 {
            let mut qp = q.clone();
            qp[m] += eps;
            let mut scratch = arm.create_data();
            arm.forward_dynamics(&mut scratch, &qp, &v, &tau).unwrap();
            let column = (&scratch.ddq - &a0) / eps;
            for j in 0..3 {
                assert!((column[j] - data.ddq_dq[(j, m)]).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn velocity_partials_match_finite_differences() {
        let arm = PlanarArm::three_link();
        let mut data = arm.create_data();
        let q = DVector::from_vec(vec![0.3, -0.7, 1.1]);
        let v = DVector::from_vec(vec![0.5, 0.2, -0.4]);
        arm.compute_forward_kinematics_derivatives(&mut data, &q, &v);
        let eps = 1e-7;
        for m in 0..3 {
            let mut qp = q.clone();
            qp[m] += eps;
            let mut scratch = arm.create_data();
            arm.forward_kinematics(&mut scratch, &qp, &v);
            for k in 0..3 {
                let column = (scratch.frame_velocities[k] - data.frame_velocities[k]) / eps;
                for i in 0..6 {
                    assert!((column[i] - data.frame_velocity_dq[k][(i, m)]).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn stale_placements_are_reported() {
        let arm = PlanarArm::three_link();
        let mut data = arm.create_data();
        let q = DVector::from_vec(vec![0.1, 0.2, 0.3]);
        let v = DVector::zeros(3);
        arm.forward_kinematics(&mut data, &q, &v);
        arm.update_frame_placements(&mut data);
        assert!(data.require(Quantity::FramePlacements, &q, &v).is_ok());
        if cfg!(debug_assertions) {
            let other = DVector::from_vec(vec![0.1, 0.2, 0.4]);
            let err = data
                .require(Quantity::FramePlacements, &other, &v)
                .expect_err("placements should be stale");
            assert_eq!(err, Error::StaleDependency("frame placements"));
        }
    }
}
