//! Interface to the rigid-body dynamics engine.
//!
//! The engine owns the immutable kinematic tree; every evaluation context owns one
//! [`MultibodyData`] scratch object that the engine fills in place. Cost models only
//! read from the scratch object, so the caller must run the relevant engine passes
//! for the current `(q, v)` first.

pub mod planar;

pub use planar::PlanarArm;

use nalgebra::{DMatrix, DVector, Isometry3, Vector3, Vector6};
use rand::RngCore;

use crate::error::{Error, Result};

pub type FrameIndex = usize;

pub trait Multibody: Send + Sync {
    fn nq(&self) -> usize;

    fn nv(&self) -> usize;

    fn nframes(&self) -> usize;

    fn frame_id(&self, name: &str) -> Option<FrameIndex>;

    fn create_data(&self) -> MultibodyData {
        MultibodyData::new(self.nframes(), self.nv())
    }

    fn neutral_configuration(&self) -> DVector<f64> {
        DVector::zeros(self.nq())
    }

    fn random_configuration(&self, rng: &mut dyn RngCore) -> DVector<f64>;

    /// Joint placements and frame velocities for `(q, v)`.
    fn forward_kinematics(&self, data: &mut MultibodyData, q: &DVector<f64>, v: &DVector<f64>);

    /// Frame placements from the last forward-kinematics pass.
    fn update_frame_placements(&self, data: &mut MultibodyData);

    fn compute_joint_jacobians(&self, data: &mut MultibodyData, q: &DVector<f64>);

    /// Frame Jacobians plus the configuration partials of the frame velocities.
    fn compute_forward_kinematics_derivatives(
        &self,
        data: &mut MultibodyData,
        q: &DVector<f64>,
        v: &DVector<f64>,
    );

    fn center_of_mass(&self, data: &mut MultibodyData, q: &DVector<f64>);

    /// Centre of mass and its Jacobian.
    fn jacobian_center_of_mass(&self, data: &mut MultibodyData, q: &DVector<f64>);

    /// Joint accelerations produced by the torques `tau`, written to `data.ddq`.
    fn forward_dynamics(
        &self,
        data: &mut MultibodyData,
        q: &DVector<f64>,
        v: &DVector<f64>,
        tau: &DVector<f64>,
    ) -> Result<()>;

    /// Partials of the joint accelerations w.r.t. `q`, `v` and `tau`.
    fn compute_dynamics_derivatives(
        &self,
        data: &mut MultibodyData,
        q: &DVector<f64>,
        v: &DVector<f64>,
        tau: &DVector<f64>,
    ) -> Result<()>;

    fn integrate_configuration(&self, q: &DVector<f64>, dq: &DVector<f64>) -> DVector<f64> {
        q + dq
    }

    fn difference_configuration(&self, q0: &DVector<f64>, q1: &DVector<f64>) -> DVector<f64> {
        q1 - q0
    }

    fn integrate_configuration_jacobians(
        &self,
        _q: &DVector<f64>,
        _dq: &DVector<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        let eye = DMatrix::identity(self.nv(), self.nv());
        (eye.clone(), eye)
    }

    fn difference_configuration_jacobians(
        &self,
        _q0: &DVector<f64>,
        _q1: &DVector<f64>,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        let eye = DMatrix::identity(self.nv(), self.nv());
        (-eye.clone(), eye)
    }
}

/// The kinematic quantity a cost model depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    FramePlacements,
    FrameJacobians,
    FrameVelocities,
    FrameVelocityDerivatives,
    CenterOfMass,
    CenterOfMassJacobian,
}

impl Quantity {
    fn label(self) -> &'static str {
        match self {
            Quantity::FramePlacements => "frame placements",
            Quantity::FrameJacobians => "frame jacobians",
            Quantity::FrameVelocities => "frame velocities",
            Quantity::FrameVelocityDerivatives => "frame velocity derivatives",
            Quantity::CenterOfMass => "center of mass",
            Quantity::CenterOfMassJacobian => "center-of-mass jacobian",
        }
    }
}

/// Records the `(q, v)` each cached quantity was computed at.
#[derive(Debug, Clone, Default)]
pub struct Freshness {
    placements: Option<DVector<f64>>,
    jacobians: Option<DVector<f64>>,
    velocities: Option<(DVector<f64>, DVector<f64>)>,
    velocity_derivatives: Option<(DVector<f64>, DVector<f64>)>,
    com: Option<DVector<f64>>,
    com_jacobian: Option<DVector<f64>>,
}

/// Per-context scratch object filled by a [`Multibody`] engine.
#[derive(Debug, Clone)]
pub struct MultibodyData {
    /// Configuration of the last forward-kinematics pass.
    pub q: DVector<f64>,
    pub v: DVector<f64>,
    pub frame_placements: Vec<Isometry3<f64>>,
    /// World-aligned frame Jacobians, `[linear; angular]` rows, `6 x nv`.
    pub frame_jacobians: Vec<DMatrix<f64>>,
    /// World-aligned frame velocities `[linear; angular]`.
    pub frame_velocities: Vec<Vector6<f64>>,
    /// Partials of `frame_velocities` w.r.t. `q`, `6 x nv`.
    pub frame_velocity_dq: Vec<DMatrix<f64>>,
    pub com: Vector3<f64>,
    pub com_jacobian: DMatrix<f64>,
    pub ddq: DVector<f64>,
    pub ddq_dq: DMatrix<f64>,
    pub ddq_dv: DMatrix<f64>,
    pub ddq_dtau: DMatrix<f64>,
    freshness: Freshness,
}

impl MultibodyData {
    pub fn new(nframes: usize, nv: usize) -> Self {
        Self {
            q: DVector::zeros(0),
            v: DVector::zeros(0),
            frame_placements: vec![Isometry3::identity(); nframes],
            frame_jacobians: vec![DMatrix::zeros(6, nv); nframes],
            frame_velocities: vec![Vector6::zeros(); nframes],
            frame_velocity_dq: vec![DMatrix::zeros(6, nv); nframes],
            com: Vector3::zeros(),
            com_jacobian: DMatrix::zeros(3, nv),
            ddq: DVector::zeros(nv),
            ddq_dq: DMatrix::zeros(nv, nv),
            ddq_dv: DMatrix::zeros(nv, nv),
            ddq_dtau: DMatrix::zeros(nv, nv),
            freshness: Freshness::default(),
        }
    }

    /// Scratch object for models that never touch the engine.
    pub fn empty() -> Self {
        Self::new(0, 0)
    }

    /// Marks `quantity` as computed at `(q, v)`. Engines call this after each pass.
    pub fn stamp(&mut self, quantity: Quantity, q: &DVector<f64>, v: &DVector<f64>) {
        let f = &mut self.freshness;
        match quantity {
            Quantity::FramePlacements => f.placements = Some(q.clone()),
            Quantity::FrameJacobians => f.jacobians = Some(q.clone()),
            Quantity::FrameVelocities => f.velocities = Some((q.clone(), v.clone())),
            Quantity::FrameVelocityDerivatives => {
                f.velocity_derivatives = Some((q.clone(), v.clone()))
            }
            Quantity::CenterOfMass => f.com = Some(q.clone()),
            Quantity::CenterOfMassJacobian => f.com_jacobian = Some(q.clone()),
        }
    }

    /// Fails with [`Error::StaleDependency`] when `quantity` was not computed at `(q, v)`.
    ///
    /// Only enforced in debug builds; release builds trust the caller.
    pub fn require(&self, quantity: Quantity, q: &DVector<f64>, v: &DVector<f64>) -> Result<()> {
        if !cfg!(debug_assertions) {
            return Ok(());
        }
        let f = &self.freshness;
        let fresh = match quantity {
            Quantity::FramePlacements => f.placements.as_ref() == Some(q),
            Quantity::FrameJacobians => f.jacobians.as_ref() == Some(q),
            Quantity::FrameVelocities => matches_pair(&f.velocities, q, v),
            Quantity::FrameVelocityDerivatives => matches_pair(&f.velocity_derivatives, q, v),
            Quantity::CenterOfMass => f.com.as_ref() == Some(q),
            Quantity::CenterOfMassJacobian => f.com_jacobian.as_ref() == Some(q),
        };
        if fresh {
            Ok(())
        } else {
            Err(Error::StaleDependency(quantity.label()))
        }
    }

    pub fn frame(&self, frame: FrameIndex) -> Result<&Isometry3<f64>> {
        frame_entry(&self.frame_placements, frame)
    }

    /// World-aligned `6 x nv` Jacobian of `frame`.
    pub fn frame_jacobian(&self, frame: FrameIndex) -> Result<&DMatrix<f64>> {
        frame_entry(&self.frame_jacobians, frame)
    }

    pub fn frame_velocity(&self, frame: FrameIndex) -> Result<&Vector6<f64>> {
        frame_entry(&self.frame_velocities, frame)
    }

    /// Configuration partial of the velocity of `frame`.
    pub fn frame_velocity_partial(&self, frame: FrameIndex) -> Result<&DMatrix<f64>> {
        frame_entry(&self.frame_velocity_dq, frame)
    }
}

fn frame_entry<T>(items: &[T], frame: FrameIndex) -> Result<&T> {
    items
        .get(frame)
        .ok_or_else(|| Error::InvalidArgument(format!("frame index {frame} out of range")))
}

fn matches_pair(
    stamp: &Option<(DVector<f64>, DVector<f64>)>,
    q: &DVector<f64>,
    v: &DVector<f64>,
) -> bool {
    match stamp {
        Some((sq, sv)) => sq == q && sv == v,
        None => false,
    }
}
