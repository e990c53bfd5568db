//! Cost models: residual + activation, with Gauss-Newton quadratic expansions.
//!
//! Every leaf cost computes a residual `r(x, u)` and its Jacobians `Rx`, `Ru`, then
//! delegates the penalty shape to an [`ActivationModel`]. Derivatives use the
//! Gauss-Newton approximation `Lxx ≈ Rxᵀ·Arr·Rx` (likewise `Lxu`, `Luu`), which drops
//! the curvature of the residual itself.

pub mod com;
pub mod frame;
pub mod regularization;
pub mod sum;

pub use com::CostCoM;
pub use frame::{
    CostFramePlacement, CostFrameRotation, CostFrameTranslation, CostFrameVelocity,
    CostFrameVelocityLinear,
};
pub use regularization::{CostControl, CostState};
pub use sum::CostSum;

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::activation::{ActivationData, ActivationModel};
use crate::error::{check_dim, Result};
use crate::multibody::MultibodyData;
use crate::traits::StateSpace;

/// Scratch written by a cost model.
#[derive(Debug, Clone)]
pub struct CostData {
    pub cost: f64,
    pub r: DVector<f64>,
    pub rx: DMatrix<f64>,
    pub ru: DMatrix<f64>,
    pub lx: DVector<f64>,
    pub lu: DVector<f64>,
    pub lxx: DMatrix<f64>,
    pub lxu: DMatrix<f64>,
    pub luu: DMatrix<f64>,
    /// For a sum, holds the stacked, weight-scaled term activations.
    pub activation: ActivationData,
    /// Per-term data of a [`CostSum`], in registration order. Empty for leaf costs.
    pub terms: Vec<CostData>,
}

impl CostData {
    pub fn new(ndx: usize, nu: usize, nr: usize) -> Self {
        Self {
            cost: 0.0,
            r: DVector::zeros(nr),
            rx: DMatrix::zeros(nr, ndx),
            ru: DMatrix::zeros(nr, nu),
            lx: DVector::zeros(ndx),
            lu: DVector::zeros(nu),
            lxx: DMatrix::zeros(ndx, ndx),
            lxu: DMatrix::zeros(ndx, nu),
            luu: DMatrix::zeros(nu, nu),
            activation: ActivationData::new(nr),
            terms: Vec::new(),
        }
    }
}

/// Capability shared by every cost model.
///
/// `shared` is the evaluation context's multibody scratch object. Models that read
/// kinematic quantities from it require the caller to have refreshed them for the
/// current `x`; debug builds report a stale read as `Error::StaleDependency`.
pub trait CostModel: Send + Sync {
    fn state(&self) -> &Arc<dyn StateSpace>;

    fn nu(&self) -> usize;

    /// Residual dimension.
    fn nr(&self) -> usize;

    fn create_data(&self) -> CostData {
        CostData::new(self.state().ndx(), self.nu(), self.nr())
    }

    /// Writes `data.r` and `data.cost`.
    fn calc(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()>;

    /// Writes the residual Jacobians and the quadratic expansion. With
    /// `recalc == false` the residual from the previous `calc` on `(x, u)` is reused.
    fn calc_diff(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()>;

    /// Writes the activation gradient and curvature at the residual left in `data.r`
    /// by the last `calc`. Reads nothing from the engine.
    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()>;
}

pub(crate) fn check_inputs(
    state: &dyn StateSpace,
    nu: usize,
    x: &DVector<f64>,
    u: &DVector<f64>,
) -> Result<()> {
    check_dim("state vector", state.nx(), x.len())?;
    check_dim("control vector", nu, u.len())
}

/// Splits `x = [q; v]`.
pub(crate) fn split_state(state: &dyn StateSpace, x: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
    let nq = state.nq();
    let nv = state.nv();
    (x.rows(0, nq).into_owned(), x.rows(nq, nv).into_owned())
}

/// Runs the activation on `data.r` and stores the cost.
pub(crate) fn activate(activation: &dyn ActivationModel, data: &mut CostData) -> Result<()> {
    activation.calc(&mut data.activation, &data.r)?;
    data.cost = data.activation.a_value;
    Ok(())
}

/// Chains the activation derivatives through `data.rx`/`data.ru`.
pub(crate) fn activate_diff(activation: &dyn ActivationModel, data: &mut CostData) -> Result<()> {
    activation.calc_diff(&mut data.activation, &data.r, false)?;
    gauss_newton_expansion(data);
    Ok(())
}

pub(crate) fn activation_diff(activation: &dyn ActivationModel, data: &mut CostData) -> Result<()> {
    activation.calc_diff(&mut data.activation, &data.r, true)
}

/// Gauss-Newton blocks `(Rxᵀ·W·Rx, Rxᵀ·W·Ru, Ruᵀ·W·Ru)` with `W = diag(arr)`.
pub(crate) fn gauss_newton(
    rx: &DMatrix<f64>,
    ru: &DMatrix<f64>,
    arr: &DVector<f64>,
) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
    let weighted_rx = DMatrix::from_fn(rx.nrows(), rx.ncols(), |i, j| arr[i] * rx[(i, j)]);
    let weighted_ru = DMatrix::from_fn(ru.nrows(), ru.ncols(), |i, j| arr[i] * ru[(i, j)]);
    (
        rx.tr_mul(&weighted_rx),
        rx.tr_mul(&weighted_ru),
        ru.tr_mul(&weighted_ru),
    )
}

/// `Lx = Rxᵀ Ar`, `Lxx = Rxᵀ diag(Arr) Rx` and the matching control blocks.
pub(crate) fn gauss_newton_expansion(data: &mut CostData) {
    data.lx = data.rx.tr_mul(&data.activation.ar);
    data.lu = data.ru.tr_mul(&data.activation.ar);
    let (lxx, lxu, luu) = gauss_newton(&data.rx, &data.ru, &data.activation.arr);
    data.lxx = lxx;
    data.lxu = lxu;
    data.luu = luu;
}

/// Fails unless `activation` accepts residuals of dimension `nr`.
pub(crate) fn check_activation(activation: &dyn ActivationModel, nr: usize) -> Result<()> {
    check_dim("activation residual dimension", nr, activation.nr())
}
