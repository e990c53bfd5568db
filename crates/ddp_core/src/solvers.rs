pub mod ddp;
pub mod kkt;

pub use ddp::SolverDdp;
pub use kkt::SolverKkt;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Convergence threshold on the stopping criterion.
    pub th_stop: f64,
    pub max_iter: usize,
    pub reg_init: f64,
    pub reg_min: f64,
    pub reg_max: f64,
    /// Multiplier applied when the regularization grows or shrinks.
    pub reg_factor: f64,
    /// Step lengths above this shrink the regularization.
    pub th_step_dec: f64,
    /// Step lengths at or below this grow the regularization.
    pub th_step_inc: f64,
    /// Fraction of the expected improvement a step must achieve.
    pub th_accept_step: f64,
    /// Below this expected gradient any step is accepted.
    pub th_grad: f64,
    /// Line-search step lengths, tried in order.
    pub alphas: Vec<f64>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            th_stop: 1e-9,
            max_iter: 100,
            reg_init: 1e-9,
            reg_min: 1e-9,
            reg_max: 1e9,
            reg_factor: 10.0,
            th_step_dec: 0.5,
            th_step_inc: 0.01,
            th_accept_step: 0.1,
            th_grad: 1e-12,
            alphas: (0..10).map(|i| 0.5_f64.powi(i)).collect(),
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidArgument(msg.to_string()));
        if self.alphas.is_empty() || self.alphas.iter().any(|a| !(*a > 0.0 && *a <= 1.0)) {
            return invalid("line-search step lengths must lie in (0, 1]");
        }
        if !(self.reg_min > 0.0 && self.reg_min <= self.reg_max) {
            return invalid("regularization bounds must satisfy 0 < reg_min <= reg_max");
        }
        if !(self.reg_factor > 1.0) {
            return invalid("regularization factor must exceed 1");
        }
        if !(self.th_stop >= 0.0) {
            return invalid("stopping threshold must be non-negative");
        }
        Ok(())
    }

    /// Next larger regularization, or `None` once the ceiling is reached.
    pub(crate) fn increase(&self, reg: f64) -> Option<f64> {
        if reg >= self.reg_max {
            None
        } else {
            Some((reg * self.reg_factor).min(self.reg_max))
        }
    }

    pub(crate) fn decrease(&self, reg: f64) -> f64 {
        (reg / self.reg_factor).max(self.reg_min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SolveStatus {
    Converged,
    MaxIterations,
    /// The regularization hit its ceiling.
    Diverged { regularization: f64 },
}

/// Outcome of a solve. The solver keeps the best trajectory found either way.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub status: SolveStatus,
    pub iterations: usize,
    pub cost: f64,
    pub stop: f64,
    /// Iterations in which no step length was accepted.
    pub failed_line_searches: usize,
}

impl SolveReport {
    pub fn converged(&self) -> bool {
        self.status == SolveStatus::Converged
    }

    /// Converts a diverged solve into [`Error::SolverDiverged`].
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            SolveStatus::Diverged { regularization } => {
                Err(Error::SolverDiverged { regularization })
            }
            _ => Ok(self),
        }
    }
}

/// Common surface of the trajectory solvers.
pub trait Solver {
    /// Runs iterations from the current candidate until a stopping condition.
    /// Repeated calls warm-start from the previous result.
    fn solve(&mut self) -> Result<SolveReport>;

    /// Replaces the control guess and re-simulates the state trajectory.
    fn set_candidate(&mut self, us: Vec<DVector<f64>>) -> Result<()>;

    fn xs(&self) -> &[DVector<f64>];

    fn us(&self) -> &[DVector<f64>];

    fn cost(&self) -> f64;

    fn stop(&self) -> f64;
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use nalgebra::DVector;

    use crate::actions::test_support::integrated_positioning;
    use crate::actions::ActionModel;
    use crate::problem::ShootingProblem;
    use crate::traits::StateSpace;

    pub fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// One running node reaching for `[0.5, 0.4, 0.3]` from `zero + 1`; the same model
    /// serves as terminal node.
    pub fn arm_positioning_problem() -> Arc<ShootingProblem> {
        let model: Arc<dyn ActionModel> = Arc::new(integrated_positioning(1e-3, [10.0, 0.1, 0.01]));
        let x0 = model.state().zero().add_scalar(1.0);
        Arc::new(ShootingProblem::new(x0, vec![model.clone()], model).unwrap())
    }

    pub fn max_gap(a: &[DVector<f64>], b: &[DVector<f64>]) -> f64 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).amax())
            .fold(0.0, f64::max)
    }
}
