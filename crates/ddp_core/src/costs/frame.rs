//! Costs on the placement and velocity of a named frame.
//!
//! Each model reads frame quantities from the shared multibody scratch object; see
//! the required engine passes on each type.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Isometry3, Matrix3, Vector3, Vector6};

use super::{
    activate, activate_diff, activation_diff, check_activation, check_inputs, split_state, CostData,
    CostModel,
};
use crate::activation::{ActivationModel, ActivationQuad};
use crate::error::Result;
use crate::lie::{jlog3, jlog6, log3, log6};
use crate::multibody::{FrameIndex, MultibodyData, Quantity};
use crate::traits::StateSpace;

fn dense3(m: &Matrix3<f64>) -> DMatrix<f64> {
    DMatrix::from_column_slice(3, 3, m.as_slice())
}

/// Frame Jacobian expressed in the frame itself.
fn local_jacobian(placement: &Isometry3<f64>, world: &DMatrix<f64>) -> DMatrix<f64> {
    let rt = dense3(&placement.rotation.to_rotation_matrix().matrix().transpose());
    let mut local = DMatrix::zeros(6, world.ncols());
    local.rows_mut(0, 3).copy_from(&(&rt * world.rows(0, 3)));
    local.rows_mut(3, 3).copy_from(&(&rt * world.rows(3, 3)));
    local
}

/// Fields common to the frame costs.
struct FrameCostBase {
    state: Arc<dyn StateSpace>,
    activation: Box<dyn ActivationModel>,
    frame: FrameIndex,
    nu: usize,
}

impl FrameCostBase {
    fn new(state: Arc<dyn StateSpace>, frame: FrameIndex, nu: usize, nr: usize) -> Self {
        Self {
            state,
            activation: Box::new(ActivationQuad::new(nr)),
            frame,
            nu,
        }
    }

    fn set_activation(&mut self, activation: Box<dyn ActivationModel>) -> Result<()> {
        check_activation(activation.as_ref(), self.activation.nr())?;
        self.activation = activation;
        Ok(())
    }

    fn nv(&self) -> usize {
        self.state.nv()
    }
}

macro_rules! frame_cost_accessors {
    ($ty:ident) => {
        impl $ty {
            /// Replaces the default quadratic activation.
            pub fn with_activation(mut self, activation: Box<dyn ActivationModel>) -> Result<Self> {
                self.base.set_activation(activation)?;
                Ok(self)
            }

            pub fn frame(&self) -> FrameIndex {
                self.base.frame
            }
        }
    };
}

/// Residual `p_frame − p_ref` in world coordinates.
///
/// Requires frame placements in `calc` and frame Jacobians in `calc_diff`.
pub struct CostFrameTranslation {
    base: FrameCostBase,
    reference: Vector3<f64>,
}

impl CostFrameTranslation {
    pub fn new(state: Arc<dyn StateSpace>, frame: FrameIndex, reference: Vector3<f64>, nu: usize) -> Self {
        Self {
            base: FrameCostBase::new(state, frame, nu, 3),
            reference,
        }
    }

    pub fn reference(&self) -> &Vector3<f64> {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: Vector3<f64>) {
        self.reference = reference;
    }
}

frame_cost_accessors!(CostFrameTranslation);

impl CostModel for CostFrameTranslation {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.base.state
    }

    fn nu(&self) -> usize {
        self.base.nu
    }

    fn nr(&self) -> usize {
        3
    }

    fn calc(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.base.state.as_ref(), self.base.nu, x, u)?;
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FramePlacements, &q, &v)?;
        let position = shared.frame(self.base.frame)?.translation.vector;
        data.r.copy_from(&(position - self.reference));
        activate(self.base.activation.as_ref(), data)
    }

    fn calc_diff(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, shared, x, u)?;
        }
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FrameJacobians, &q, &v)?;
        let jac = shared.frame_jacobian(self.base.frame)?;
        let nv = self.base.nv();
        data.rx.fill(0.0);
        data.rx.view_mut((0, 0), (3, nv)).copy_from(&jac.rows(0, 3));
        data.ru.fill(0.0);
        activate_diff(self.base.activation.as_ref(), data)
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        activation_diff(self.base.activation.as_ref(), data)
    }
}

/// Residual `log3(R_refᵀ R_frame)`.
///
/// Requires frame placements in `calc` and frame Jacobians in `calc_diff`.
pub struct CostFrameRotation {
    base: FrameCostBase,
    reference: Matrix3<f64>,
}

impl CostFrameRotation {
    pub fn new(state: Arc<dyn StateSpace>, frame: FrameIndex, reference: Matrix3<f64>, nu: usize) -> Self {
        Self {
            base: FrameCostBase::new(state, frame, nu, 3),
            reference,
        }
    }

    pub fn reference(&self) -> &Matrix3<f64> {
        &self.reference
    }
}

frame_cost_accessors!(CostFrameRotation);

impl CostModel for CostFrameRotation {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.base.state
    }

    fn nu(&self) -> usize {
        self.base.nu
    }

    fn nr(&self) -> usize {
        3
    }

    fn calc(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.base.state.as_ref(), self.base.nu, x, u)?;
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FramePlacements, &q, &v)?;
        let rotation = shared.frame(self.base.frame)?.rotation.to_rotation_matrix();
        let error = nalgebra::Rotation3::from_matrix_unchecked(
            self.reference.transpose() * rotation.matrix(),
        );
        data.r.copy_from(&log3(&error));
        activate(self.base.activation.as_ref(), data)
    }

    fn calc_diff(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, shared, x, u)?;
        }
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FrameJacobians, &q, &v)?;
        let placement = shared.frame(self.base.frame)?;
        let local = local_jacobian(placement, shared.frame_jacobian(self.base.frame)?);
        let phi = Vector3::new(data.r[0], data.r[1], data.r[2]);
        let jac = dense3(&jlog3(&phi)) * local.rows(3, 3);
        let nv = self.base.nv();
        data.rx.fill(0.0);
        data.rx.view_mut((0, 0), (3, nv)).copy_from(&jac);
        data.ru.fill(0.0);
        activate_diff(self.base.activation.as_ref(), data)
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        activation_diff(self.base.activation.as_ref(), data)
    }
}

/// Residual `log6(M_ref⁻¹ M_frame)`, ordered `[linear; angular]`.
///
/// Requires frame placements in `calc` and frame Jacobians in `calc_diff`.
pub struct CostFramePlacement {
    base: FrameCostBase,
    reference: Isometry3<f64>,
    reference_inv: Isometry3<f64>,
}

impl CostFramePlacement {
    pub fn new(state: Arc<dyn StateSpace>, frame: FrameIndex, reference: Isometry3<f64>, nu: usize) -> Self {
        Self {
            base: FrameCostBase::new(state, frame, nu, 6),
            reference,
            reference_inv: reference.inverse(),
        }
    }

    pub fn reference(&self) -> &Isometry3<f64> {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: Isometry3<f64>) {
        self.reference = reference;
        self.reference_inv = reference.inverse();
    }
}

frame_cost_accessors!(CostFramePlacement);

impl CostModel for CostFramePlacement {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.base.state
    }

    fn nu(&self) -> usize {
        self.base.nu
    }

    fn nr(&self) -> usize {
        6
    }

    fn calc(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.base.state.as_ref(), self.base.nu, x, u)?;
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FramePlacements, &q, &v)?;
        let error = self.reference_inv * shared.frame(self.base.frame)?;
        data.r.copy_from(&log6(&error));
        activate(self.base.activation.as_ref(), data)
    }

    fn calc_diff(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, shared, x, u)?;
        }
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FrameJacobians, &q, &v)?;
        let placement = shared.frame(self.base.frame)?;
        let local = local_jacobian(placement, shared.frame_jacobian(self.base.frame)?);
        let xi = Vector6::from_iterator(data.r.iter().cloned());
        let jlog = jlog6(&xi);
        let jlog = DMatrix::from_column_slice(6, 6, jlog.as_slice());
        let nv = self.base.nv();
        data.rx.fill(0.0);
        data.rx.view_mut((0, 0), (6, nv)).copy_from(&(jlog * local));
        data.ru.fill(0.0);
        activate_diff(self.base.activation.as_ref(), data)
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        activation_diff(self.base.activation.as_ref(), data)
    }
}

/// Residual `v_frame − v_ref` on the world-aligned spatial velocity `[linear; angular]`.
///
/// Requires forward kinematics in `calc` and forward-kinematics derivatives in
/// `calc_diff`.
pub struct CostFrameVelocity {
    base: FrameCostBase,
    reference: Vector6<f64>,
}

impl CostFrameVelocity {
    /// Penalizes any motion of the frame.
    pub fn new(state: Arc<dyn StateSpace>, frame: FrameIndex, nu: usize) -> Self {
        Self::with_reference(state, frame, Vector6::zeros(), nu)
    }

    pub fn with_reference(
        state: Arc<dyn StateSpace>,
        frame: FrameIndex,
        reference: Vector6<f64>,
        nu: usize,
    ) -> Self {
        Self {
            base: FrameCostBase::new(state, frame, nu, 6),
            reference,
        }
    }

    pub fn reference(&self) -> &Vector6<f64> {
        &self.reference
    }
}

frame_cost_accessors!(CostFrameVelocity);

impl CostModel for CostFrameVelocity {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.base.state
    }

    fn nu(&self) -> usize {
        self.base.nu
    }

    fn nr(&self) -> usize {
        6
    }

    fn calc(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.base.state.as_ref(), self.base.nu, x, u)?;
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FrameVelocities, &q, &v)?;
        let twist = shared.frame_velocity(self.base.frame)? - self.reference;
        data.r.copy_from(&twist);
        activate(self.base.activation.as_ref(), data)
    }

    fn calc_diff(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, shared, x, u)?;
        }
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FrameVelocityDerivatives, &q, &v)?;
        let nv = self.base.nv();
        data.rx.fill(0.0);
        data.rx
            .view_mut((0, 0), (6, nv))
            .copy_from(shared.frame_velocity_partial(self.base.frame)?);
        data.rx
            .view_mut((0, nv), (6, nv))
            .copy_from(shared.frame_jacobian(self.base.frame)?);
        data.ru.fill(0.0);
        activate_diff(self.base.activation.as_ref(), data)
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        activation_diff(self.base.activation.as_ref(), data)
    }
}

/// Linear part of [`CostFrameVelocity`].
pub struct CostFrameVelocityLinear {
    base: FrameCostBase,
    reference: Vector3<f64>,
}

impl CostFrameVelocityLinear {
    pub fn new(state: Arc<dyn StateSpace>, frame: FrameIndex, nu: usize) -> Self {
        Self::with_reference(state, frame, Vector3::zeros(), nu)
    }

    pub fn with_reference(
        state: Arc<dyn StateSpace>,
        frame: FrameIndex,
        reference: Vector3<f64>,
        nu: usize,
    ) -> Self {
        Self {
            base: FrameCostBase::new(state, frame, nu, 3),
            reference,
        }
    }
}

frame_cost_accessors!(CostFrameVelocityLinear);

impl CostModel for CostFrameVelocityLinear {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.base.state
    }

    fn nu(&self) -> usize {
        self.base.nu
    }

    fn nr(&self) -> usize {
        3
    }

    fn calc(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.base.state.as_ref(), self.base.nu, x, u)?;
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FrameVelocities, &q, &v)?;
        let linear = shared.frame_velocity(self.base.frame)?.fixed_rows::<3>(0) - self.reference;
        data.r.copy_from(&linear);
        activate(self.base.activation.as_ref(), data)
    }

    fn calc_diff(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, shared, x, u)?;
        }
        let (q, v) = split_state(self.base.state.as_ref(), x);
        shared.require(Quantity::FrameVelocityDerivatives, &q, &v)?;
        let nv = self.base.nv();
        data.rx.fill(0.0);
        data.rx
            .view_mut((0, 0), (3, nv))
            .copy_from(&shared.frame_velocity_partial(self.base.frame)?.rows(0, 3));
        data.rx
            .view_mut((0, nv), (3, nv))
            .copy_from(&shared.frame_jacobian(self.base.frame)?.rows(0, 3));
        data.ru.fill(0.0);
        activate_diff(self.base.activation.as_ref(), data)
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        activation_diff(self.base.activation.as_ref(), data)
    }
}
