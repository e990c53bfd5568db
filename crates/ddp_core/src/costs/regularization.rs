use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use super::{
    activate, activate_diff, activation_diff, check_activation, check_inputs, CostData, CostModel,
};
use crate::activation::{ActivationModel, ActivationQuad};
use crate::error::{check_dim, Result};
use crate::multibody::MultibodyData;
use crate::traits::StateSpace;

/// Residual `x ⊖ x_ref`, computed with the state's own `diff`.
pub struct CostState {
    state: Arc<dyn StateSpace>,
    activation: Box<dyn ActivationModel>,
    reference: DVector<f64>,
    nu: usize,
}

impl CostState {
    pub fn new(state: Arc<dyn StateSpace>, reference: DVector<f64>, nu: usize) -> Result<Self> {
        check_dim("state reference", state.nx(), reference.len())?;
        let ndx = state.ndx();
        Ok(Self {
            state,
            activation: Box::new(ActivationQuad::new(ndx)),
            reference,
            nu,
        })
    }

    pub fn with_activation(mut self, activation: Box<dyn ActivationModel>) -> Result<Self> {
        check_activation(activation.as_ref(), self.state.ndx())?;
        self.activation = activation;
        Ok(self)
    }

    pub fn reference(&self) -> &DVector<f64> {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: DVector<f64>) -> Result<()> {
        check_dim("state reference", self.state.nx(), reference.len())?;
        self.reference = reference;
        Ok(())
    }
}

impl CostModel for CostState {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.nu
    }

    fn nr(&self) -> usize {
        self.state.ndx()
    }

    fn calc(
        &self,
        data: &mut CostData,
        _shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.state.as_ref(), self.nu, x, u)?;
        data.r = self.state.diff(&self.reference, x);
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
        let (_, jx) = self.state.jdiff(&self.reference, x);
        data.rx = jx;
        data.ru.fill(0.0);
        activate_diff(self.activation.as_ref(), data)
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        activation_diff(self.activation.as_ref(), data)
    }
}

/// Residual `u − u_ref`; the reference defaults to zero.
pub struct CostControl {
    state: Arc<dyn StateSpace>,
    activation: Box<dyn ActivationModel>,
    reference: DVector<f64>,
}

impl CostControl {
    pub fn new(state: Arc<dyn StateSpace>, nu: usize) -> Self {
        Self {
            state,
            activation: Box::new(ActivationQuad::new(nu)),
            reference: DVector::zeros(nu),
        }
    }

    pub fn with_reference(mut self, reference: DVector<f64>) -> Result<Self> {
        check_dim("control reference", self.reference.len(), reference.len())?;
        self.reference = reference;
        Ok(self)
    }

    pub fn with_activation(mut self, activation: Box<dyn ActivationModel>) -> Result<Self> {
        check_activation(activation.as_ref(), self.reference.len())?;
        self.activation = activation;
        Ok(self)
    }
}

impl CostModel for CostControl {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.reference.len()
    }

    fn nr(&self) -> usize {
        self.reference.len()
    }

    fn calc(
        &self,
        data: &mut CostData,
        _shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.state.as_ref(), self.nu(), x, u)?;
        data.r = u - &self.reference;
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
        let nu = self.nu();
        data.rx.fill(0.0);
        data.ru = DMatrix::identity(nu, nu);
        activate_diff(self.activation.as_ref(), data)
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        activation_diff(self.activation.as_ref(), data)
    }
}
