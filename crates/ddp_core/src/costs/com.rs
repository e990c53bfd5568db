use std::sync::Arc;

use nalgebra::{DVector, Vector3};

use super::{
    activate, activate_diff, activation_diff, check_activation, check_inputs, split_state, CostData,
    CostModel,
};
use crate::activation::{ActivationModel, ActivationQuad};
use crate::error::Result;
use crate::multibody::{MultibodyData, Quantity};
use crate::traits::StateSpace;

/// Residual `c(q) − c_ref` on the centre of mass.
///
/// Requires the centre of mass in `calc` and its Jacobian in `calc_diff`.
pub struct CostCoM {
    state: Arc<dyn StateSpace>,
    activation: Box<dyn ActivationModel>,
    reference: Vector3<f64>,
    nu: usize,
}

impl CostCoM {
    pub fn new(state: Arc<dyn StateSpace>, reference: Vector3<f64>, nu: usize) -> Self {
        Self {
            state,
            activation: Box::new(ActivationQuad::new(3)),
            reference,
            nu,
        }
    }

    pub fn with_activation(mut self, activation: Box<dyn ActivationModel>) -> Result<Self> {
        check_activation(activation.as_ref(), 3)?;
        self.activation = activation;
        Ok(self)
    }

    pub fn reference(&self) -> &Vector3<f64> {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: Vector3<f64>) {
        self.reference = reference;
    }
}

impl CostModel for CostCoM {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.nu
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
        check_inputs(self.state.as_ref(), self.nu, x, u)?;
        let (q, v) = split_state(self.state.as_ref(), x);
        shared.require(Quantity::CenterOfMass, &q, &v)?;
        data.r.copy_from(&(shared.com - self.reference));
        activate(self.activation.as_ref(), data)
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
        let (q, v) = split_state(self.state.as_ref(), x);
        shared.require(Quantity::CenterOfMassJacobian, &q, &v)?;
        let nv = self.state.nv();
        data.rx.fill(0.0);
        data.rx.view_mut((0, 0), (3, nv)).copy_from(&shared.com_jacobian);
        data.ru.fill(0.0);
        activate_diff(self.activation.as_ref(), data)
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        activation_diff(self.activation.as_ref(), data)
    }
}
