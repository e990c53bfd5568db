use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use super::{ActionData, ActionModel};
use crate::costs::check_inputs;
use crate::error::{check_dim, Result};
use crate::state::StateVector;
use crate::traits::StateSpace;

/// Linear dynamics `x⁺ = Fx·x + Fu·u + f0` with the quadratic cost
/// `½xᵀLxx x + ½uᵀLuu u + xᵀLxu u + lxᵀx + luᵀu`.
///
/// The exact DDP solution of a problem built from these nodes is reached in a single
/// iteration, which makes it the reference problem for the solvers.
#[derive(Clone)]
pub struct ActionModelLqr {
    state: Arc<dyn StateSpace>,
    fx: DMatrix<f64>,
    fu: DMatrix<f64>,
    f0: DVector<f64>,
    lx: DVector<f64>,
    lu: DVector<f64>,
    lxx: DMatrix<f64>,
    lxu: DMatrix<f64>,
    luu: DMatrix<f64>,
}

impl ActionModelLqr {
    /// Identity dynamics and weights, unit gradients, and a unit drift unless
    /// `drift_free`.
    pub fn new(nx: usize, nu: usize, drift_free: bool) -> Self {
        let f0 = if drift_free {
            DVector::zeros(nx)
        } else {
            DVector::from_element(nx, 1.0)
        };
        Self {
            state: Arc::new(StateVector::new(nx)),
            fx: DMatrix::identity(nx, nx),
            fu: DMatrix::identity(nx, nu),
            f0,
            lx: DVector::from_element(nx, 1.0),
            lu: DVector::from_element(nu, 1.0),
            lxx: DMatrix::identity(nx, nx),
            lxu: DMatrix::zeros(nx, nu),
            luu: DMatrix::identity(nu, nu),
        }
    }

    pub fn with_dynamics(mut self, fx: DMatrix<f64>, fu: DMatrix<f64>, f0: DVector<f64>) -> Result<Self> {
        let nx = self.state.nx();
        check_dim("lqr fx rows", nx, fx.nrows())?;
        check_dim("lqr fx cols", nx, fx.ncols())?;
        check_dim("lqr fu rows", nx, fu.nrows())?;
        check_dim("lqr fu cols", self.nu(), fu.ncols())?;
        check_dim("lqr drift", nx, f0.len())?;
        self.fx = fx;
        self.fu = fu;
        self.f0 = f0;
        Ok(self)
    }

    pub fn with_cost(
        mut self,
        lxx: DMatrix<f64>,
        lxu: DMatrix<f64>,
        luu: DMatrix<f64>,
        lx: DVector<f64>,
        lu: DVector<f64>,
    ) -> Result<Self> {
        let (nx, nu) = (self.state.nx(), self.nu());
        check_dim("lqr lxx rows", nx, lxx.nrows())?;
        check_dim("lqr lxx cols", nx, lxx.ncols())?;
        check_dim("lqr lxu rows", nx, lxu.nrows())?;
        check_dim("lqr lxu cols", nu, lxu.ncols())?;
        check_dim("lqr luu rows", nu, luu.nrows())?;
        check_dim("lqr luu cols", nu, luu.ncols())?;
        check_dim("lqr lx", nx, lx.len())?;
        check_dim("lqr lu", nu, lu.len())?;
        self.lxx = lxx;
        self.lxu = lxu;
        self.luu = luu;
        self.lx = lx;
        self.lu = lu;
        Ok(self)
    }
}

impl ActionModel for ActionModelLqr {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.fu.ncols()
    }

    fn nr(&self) -> usize {
        0
    }

    fn create_data(&self) -> ActionData {
        let nx = self.state.nx();
        ActionData::new(nx, nx, self.nu(), 0)
    }

    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: &DVector<f64>) -> Result<()> {
        check_inputs(self.state.as_ref(), self.nu(), x, u)?;
        data.xnext = &self.fx * x + &self.fu * u + &self.f0;
        data.cost = 0.5 * x.dot(&(&self.lxx * x))
            + 0.5 * u.dot(&(&self.luu * u))
            + x.dot(&(&self.lxu * u))
            + self.lx.dot(x)
            + self.lu.dot(u);
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut ActionData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, x, u)?;
        }
        data.fx.copy_from(&self.fx);
        data.fu.copy_from(&self.fu);
        data.lx = &self.lx + &self.lxx * x + &self.lxu * u;
        data.lu = &self.lu + self.lxu.tr_mul(x) + &self.luu * u;
        data.lxx.copy_from(&self.lxx);
        data.lxu.copy_from(&self.lxu);
        data.luu.copy_from(&self.luu);
        Ok(())
    }

    fn calc_activation_diff(&self, _data: &mut ActionData) -> Result<()> {
        Ok(())
    }
}
