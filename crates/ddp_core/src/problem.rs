use std::sync::Arc;

use log::trace;
use nalgebra::DVector;
use rayon::prelude::*;

use crate::actions::{ActionData, ActionModel};
use crate::error::{check_dim, Error, Result};

/// Initial state, `T` running nodes and a terminal node. All three are fixed once
/// the problem is built.
///
/// The problem only holds the (immutable, shareable) models. Evaluation scratch lives
/// in a [`ProblemData`], one data object per node.
pub struct ShootingProblem {
    x0: DVector<f64>,
    running: Vec<Arc<dyn ActionModel>>,
    terminal: Arc<dyn ActionModel>,
}

/// Per-node scratch for a [`ShootingProblem`].
pub struct ProblemData {
    pub running: Vec<ActionData>,
    pub terminal: ActionData,
}

impl ShootingProblem {
    pub fn new(
        x0: DVector<f64>,
        running: Vec<Arc<dyn ActionModel>>,
        terminal: Arc<dyn ActionModel>,
    ) -> Result<Self> {
        let state = terminal.state();
        check_dim("initial state", state.nx(), x0.len())?;
        for model in &running {
            check_dim("running node state dimension", state.nx(), model.state().nx())?;
            check_dim("running node tangent dimension", state.ndx(), model.state().ndx())?;
        }
        Ok(Self {
            x0,
            running,
            terminal,
        })
    }

    /// Number of running nodes `T`.
    pub fn horizon(&self) -> usize {
        self.running.len()
    }

    pub fn x0(&self) -> &DVector<f64> {
        &self.x0
    }

    pub fn running_models(&self) -> &[Arc<dyn ActionModel>] {
        &self.running
    }

    pub fn terminal_model(&self) -> &Arc<dyn ActionModel> {
        &self.terminal
    }

    pub fn create_data(&self) -> ProblemData {
        ProblemData {
            running: self.running.iter().map(|m| m.create_data()).collect(),
            terminal: self.terminal.create_data(),
        }
    }

    /// Zero controls for every running node.
    pub fn zero_controls(&self) -> Vec<DVector<f64>> {
        self.running.iter().map(|m| DVector::zeros(m.nu())).collect()
    }

    fn terminal_control(&self) -> DVector<f64> {
        DVector::zeros(self.terminal.nu())
    }

    /// Checks `T + 1` states and `T` controls of the right sizes.
    pub fn check_trajectory(&self, xs: &[DVector<f64>], us: &[DVector<f64>]) -> Result<()> {
        self.check_controls(us)?;
        check_dim("number of states", self.horizon() + 1, xs.len())?;
        let nx = self.x0.len();
        for x in xs {
            check_dim("trajectory state", nx, x.len())?;
        }
        Ok(())
    }

    fn check_controls(&self, us: &[DVector<f64>]) -> Result<()> {
        check_dim("number of controls", self.horizon(), us.len())?;
        for (model, u) in self.running.iter().zip(us) {
            check_dim("trajectory control", model.nu(), u.len())?;
        }
        Ok(())
    }

    /// Simulates the dynamics from `x0` under `us`. Node data keeps the evaluations.
    pub fn rollout(&self, data: &mut ProblemData, us: &[DVector<f64>]) -> Result<Vec<DVector<f64>>> {
        self.check_controls(us)?;
        let mut xs = Vec::with_capacity(self.horizon() + 1);
        xs.push(self.x0.clone());
        for ((model, node), u) in self.running.iter().zip(data.running.iter_mut()).zip(us) {
            let x = xs.last().ok_or_else(|| Error::InvalidArgument("empty rollout".into()))?;
            model.calc(node, x, u)?;
            xs.push(node.xnext.clone());
        }
        Ok(xs)
    }

    /// Total cost of the trajectory `(xs, us)`.
    pub fn calc(
        &self,
        data: &mut ProblemData,
        xs: &[DVector<f64>],
        us: &[DVector<f64>],
    ) -> Result<f64> {
        self.check_trajectory(xs, us)?;
        let mut cost = 0.0;
        for (((model, node), x), u) in self
            .running
            .iter()
            .zip(data.running.iter_mut())
            .zip(xs)
            .zip(us)
        {
            model.calc(node, x, u)?;
            cost += node.cost;
        }
        let xt = &xs[self.horizon()];
        self.terminal
            .calc(&mut data.terminal, xt, &self.terminal_control())?;
        Ok(cost + data.terminal.cost)
    }

    /// Evaluates every node and its derivatives, nodes in parallel. Returns the total
    /// cost.
    pub fn calc_diff(
        &self,
        data: &mut ProblemData,
        xs: &[DVector<f64>],
        us: &[DVector<f64>],
    ) -> Result<f64> {
        self.check_trajectory(xs, us)?;
        self.running
            .par_iter()
            .zip(data.running.par_iter_mut())
            .zip(xs.par_iter())
            .zip(us.par_iter())
            .try_for_each(|(((model, node), x), u)| model.calc_diff(node, x, u, true))?;
        let xt = &xs[self.horizon()];
        self.terminal
            .calc_diff(&mut data.terminal, xt, &self.terminal_control(), true)?;

        let cost = data.running.iter().map(|node| node.cost).sum::<f64>() + data.terminal.cost;
        trace!("problem linearized over {} nodes, cost {cost:.6e}", self.horizon());
        Ok(cost)
    }
}
