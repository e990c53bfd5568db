//! Action models: one node of a shooting problem.
//!
//! A *differential* action model describes continuous dynamics (it returns the
//! acceleration) together with a running cost rate. An *action* model is discrete: it
//! maps `(x, u)` to the next state and a step cost, and exposes the linearization
//! `Fx, Fu` and the quadratic cost expansion the solvers consume.

pub mod euler;
pub mod fully_actuated;
pub mod lqr;

pub use euler::IntegratedActionModelEuler;
pub use fully_actuated::DifferentialActionModelFullyActuated;
pub use lqr::ActionModelLqr;

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::costs::CostData;
use crate::error::Result;
use crate::multibody::MultibodyData;
use crate::traits::StateSpace;

/// Scratch written by a discrete action model.
#[derive(Debug, Clone)]
pub struct ActionData {
    pub xnext: DVector<f64>,
    pub cost: f64,
    /// Stacked cost residual, empty when the cost is not residual-based.
    pub r: DVector<f64>,
    pub rx: DMatrix<f64>,
    pub ru: DMatrix<f64>,
    /// Gauss-Newton weights: `Lxx = Rxᵀ·diag(arr)·Rx`.
    pub arr: DVector<f64>,
    pub fx: DMatrix<f64>,
    pub fu: DMatrix<f64>,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
    pub lxx: DMatrix<f64>,
    pub lxu: DMatrix<f64>,
    pub luu: DMatrix<f64>,
    /// Data of the wrapped continuous model, for integrated models.
    pub differential: Option<Box<DifferentialActionData>>,
}

impl ActionData {
    pub fn new(nx: usize, ndx: usize, nu: usize, nr: usize) -> Self {
        Self {
            xnext: DVector::zeros(nx),
            cost: 0.0,
            r: DVector::zeros(nr),
            rx: DMatrix::zeros(nr, ndx),
            ru: DMatrix::zeros(nr, nu),
            arr: DVector::zeros(nr),
            fx: DMatrix::zeros(ndx, ndx),
            fu: DMatrix::zeros(ndx, nu),
            lx: DVector::zeros(ndx),
            lu: DVector::zeros(nu),
            lxx: DMatrix::zeros(ndx, ndx),
            lxu: DMatrix::zeros(ndx, nu),
            luu: DMatrix::zeros(nu, nu),
            differential: None,
        }
    }
}

pub trait ActionModel: Send + Sync {
    fn state(&self) -> &Arc<dyn StateSpace>;

    fn nu(&self) -> usize;

    /// Dimension of the stacked cost residual.
    fn nr(&self) -> usize;

    fn create_data(&self) -> ActionData;

    /// Writes `xnext` and `cost` (plus the residual `r`).
    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: &DVector<f64>) -> Result<()>;

    /// Writes `Fx, Fu, Lx, Lu, Lxx, Lxu, Luu`. With `recalc == false` the values from
    /// the previous `calc` on the same `(x, u)` are reused.
    fn calc_diff(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()>;

    /// Writes `arr`, the activation curvature at the residual of the last `calc`,
    /// without evaluating any derivative of the dynamics or the residual.
    fn calc_activation_diff(&self, data: &mut ActionData) -> Result<()>;
}

/// Scratch written by a differential action model.
#[derive(Debug, Clone)]
pub struct DifferentialActionData {
    /// Joint acceleration.
    pub xout: DVector<f64>,
    pub cost: f64,
    pub r: DVector<f64>,
    pub rx: DMatrix<f64>,
    pub ru: DMatrix<f64>,
    pub arr: DVector<f64>,
    /// Partials of `xout`, `nv x ndx` and `nv x nu`.
    pub fx: DMatrix<f64>,
    pub fu: DMatrix<f64>,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
    pub lxx: DMatrix<f64>,
    pub lxu: DMatrix<f64>,
    pub luu: DMatrix<f64>,
    /// Engine scratch object owned by this evaluation context.
    pub multibody: MultibodyData,
    pub costs: CostData,
}

impl DifferentialActionData {
    pub fn new(
        ndx: usize,
        nv: usize,
        nu: usize,
        nr: usize,
        multibody: MultibodyData,
        costs: CostData,
    ) -> Self {
        Self {
            xout: DVector::zeros(nv),
            cost: 0.0,
            r: DVector::zeros(nr),
            rx: DMatrix::zeros(nr, ndx),
            ru: DMatrix::zeros(nr, nu),
            arr: DVector::zeros(nr),
            fx: DMatrix::zeros(nv, ndx),
            fu: DMatrix::zeros(nv, nu),
            lx: DVector::zeros(ndx),
            lu: DVector::zeros(nu),
            lxx: DMatrix::zeros(ndx, ndx),
            lxu: DMatrix::zeros(ndx, nu),
            luu: DMatrix::zeros(nu, nu),
            multibody,
            costs,
        }
    }
}

pub trait DifferentialActionModel: Send + Sync {
    fn state(&self) -> &Arc<dyn StateSpace>;

    fn nu(&self) -> usize;

    fn nr(&self) -> usize;

    fn create_data(&self) -> DifferentialActionData;

    /// Writes the acceleration `xout` and the cost rate.
    fn calc(
        &self,
        data: &mut DifferentialActionData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()>;

    fn calc_diff(
        &self,
        data: &mut DifferentialActionData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()>;

    /// Writes `arr` from the residual of the last `calc`.
    fn calc_activation_diff(&self, data: &mut DifferentialActionData) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use nalgebra::{DVector, Vector3};

    use super::{DifferentialActionModelFullyActuated, IntegratedActionModelEuler};
    use crate::activation::ActivationWeightedQuad;
    use crate::costs::{CostControl, CostFrameTranslation, CostState, CostSum};
    use crate::multibody::{Multibody, PlanarArm};
    use crate::state::StateMultibody;
    use crate::traits::StateSpace;

    /// Reaching task for the end effector with state and control regularization.
    pub fn positioning_model(weights: [f64; 3]) -> DifferentialActionModelFullyActuated {
        let arm: Arc<dyn Multibody> = Arc::new(PlanarArm::three_link());
        let state = Arc::new(StateMultibody::new(arm.clone()));
        let state_dyn: Arc<dyn StateSpace> = state.clone();
        let nv = arm.nv();
        let frame = arm.frame_id("end_effector").expect("frame exists");

        let mut costs = CostSum::new(state_dyn.clone(), nv);
        costs
            .add_cost(
                "pos",
                Box::new(CostFrameTranslation::new(
                    state_dyn.clone(),
                    frame,
                    Vector3::new(0.5, 0.4, 0.3),
                    nv,
                )),
                weights[0],
            )
            .unwrap();
        let act = ActivationWeightedQuad::new(DVector::from_element(state_dyn.ndx(), 1.0));
        costs
            .add_cost(
                "regx",
                Box::new(
                    CostState::new(state_dyn.clone(), state_dyn.zero(), nv)
                        .unwrap()
                        .with_activation(Box::new(act))
                        .unwrap(),
                ),
                weights[1],
            )
            .unwrap();
        costs
            .add_cost("regu", Box::new(CostControl::new(state_dyn.clone(), nv)), weights[2])
            .unwrap();
        DifferentialActionModelFullyActuated::new(state, costs).unwrap()
    }

    pub fn integrated_positioning(time_step: f64, weights: [f64; 3]) -> IntegratedActionModelEuler {
        IntegratedActionModelEuler::new(Arc::new(positioning_model(weights)), time_step).unwrap()
    }
}
