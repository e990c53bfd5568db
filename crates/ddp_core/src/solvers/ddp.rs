use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use super::{SolveReport, SolveStatus, Solver, SolverSettings};
use crate::error::{check_dim, Error, Result};
use crate::problem::{ProblemData, ShootingProblem};

/// DDP over a shooting problem.
///
/// Each iteration linearizes every node, runs a Riccati backward pass with
/// Levenberg-Marquardt style regularization on `Quu` and `Vxx`, then rolls out the
/// closed-loop policy `u = ū − α·k − K·(x ⊖ x̄)` for decreasing `α`.
pub struct SolverDdp {
    problem: Arc<ShootingProblem>,
    data: ProblemData,
    settings: SolverSettings,
    xs: Vec<DVector<f64>>,
    us: Vec<DVector<f64>>,
    vx: Vec<DVector<f64>>,
    vxx: Vec<DMatrix<f64>>,
    qu: Vec<DVector<f64>>,
    quu: Vec<DMatrix<f64>>,
    k: Vec<DVector<f64>>,
    gains: Vec<DMatrix<f64>>,
    cost: f64,
    stop: f64,
    regularization: f64,
    iter: usize,
}

/// A simulated candidate trajectory.
struct Trial {
    xs: Vec<DVector<f64>>,
    us: Vec<DVector<f64>>,
    cost: f64,
}

impl SolverDdp {
    pub fn new(problem: Arc<ShootingProblem>) -> Result<Self> {
        Self::with_settings(problem, SolverSettings::default())
    }

    pub fn with_settings(problem: Arc<ShootingProblem>, settings: SolverSettings) -> Result<Self> {
        settings.validate()?;
        let horizon = problem.horizon();
        let ndx = problem.terminal_model().state().ndx();
        let mut data = problem.create_data();
        let us = problem.zero_controls();
        let xs = problem.rollout(&mut data, &us)?;
        let cost = problem.calc(&mut data, &xs, &us)?;
        let nus: Vec<usize> = problem.running_models().iter().map(|m| m.nu()).collect();
        Ok(Self {
            data,
            xs,
            us,
            vx: vec![DVector::zeros(ndx); horizon + 1],
            vxx: vec![DMatrix::zeros(ndx, ndx); horizon + 1],
            qu: nus.iter().map(|&nu| DVector::zeros(nu)).collect(),
            quu: nus.iter().map(|&nu| DMatrix::zeros(nu, nu)).collect(),
            k: nus.iter().map(|&nu| DVector::zeros(nu)).collect(),
            gains: nus.iter().map(|&nu| DMatrix::zeros(nu, ndx)).collect(),
            cost,
            stop: f64::INFINITY,
            regularization: settings.reg_init,
            iter: 0,
            settings,
            problem,
        })
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn problem(&self) -> &Arc<ShootingProblem> {
        &self.problem
    }

    pub fn regularization(&self) -> f64 {
        self.regularization
    }

    /// Iterations run by the last solve.
    pub fn iter(&self) -> usize {
        self.iter
    }

    /// Feed-forward terms `k`.
    pub fn k(&self) -> &[DVector<f64>] {
        &self.k
    }

    /// Feedback gains `K`.
    pub fn gains(&self) -> &[DMatrix<f64>] {
        &self.gains
    }

    /// Value-function gradients `Vx` of the last backward pass.
    pub fn vx(&self) -> &[DVector<f64>] {
        &self.vx
    }

    pub fn vxx(&self) -> &[DMatrix<f64>] {
        &self.vxx
    }

    /// Riccati recursion from the terminal node. Fails with
    /// [`Error::NonPositiveDefinite`] at the first node whose regularized `Quu` has no
    /// Cholesky factor.
    fn backward_pass(&mut self) -> Result<()> {
        let horizon = self.problem.horizon();
        let reg = self.regularization;

        let terminal = &self.data.terminal;
        self.vx[horizon] = terminal.lx.clone();
        self.vxx[horizon] = terminal.lxx.clone();
        add_diagonal(&mut self.vxx[horizon], reg);

        for t in (0..horizon).rev() {
            let node = &self.data.running[t];
            let vx_next = &self.vx[t + 1];
            let vxx_next = &self.vxx[t + 1];

            let qx = &node.lx + node.fx.tr_mul(vx_next);
            let qu = &node.lu + node.fu.tr_mul(vx_next);
            let fxt_vxx = node.fx.tr_mul(vxx_next);
            let qxx = &node.lxx + &fxt_vxx * &node.fx;
            let qxu = &node.lxu + &fxt_vxx * &node.fu;
            let mut quu = &node.luu + node.fu.tr_mul(&(vxx_next * &node.fu));
            add_diagonal(&mut quu, reg);

            let chol = quu
                .clone()
                .cholesky()
                .ok_or(Error::NonPositiveDefinite { node: t })?;
            let k = chol.solve(&qu);
            let gain = chol.solve(&qxu.transpose());

            let vx = &qx - gain.tr_mul(&qu);
            let vxx = &qxx - &qxu * &gain;
            let mut vxx = (&vxx + vxx.transpose()) * 0.5;
            add_diagonal(&mut vxx, reg);
            if vx.iter().chain(vxx.iter()).any(|v| !v.is_finite()) {
                return Err(Error::NonPositiveDefinite { node: t });
            }

            self.vx[t] = vx;
            self.vxx[t] = vxx;
            self.qu[t] = qu;
            self.quu[t] = quu;
            self.k[t] = k;
            self.gains[t] = gain;
        }
        self.stop = self.qu.iter().map(|qu| qu.norm_squared()).sum();
        Ok(())
    }

    /// Linear and quadratic coefficients of the expected improvement
    /// `ΔV(α) = α·(d1 + ½α·d2)`.
    fn expected_improvement(&self) -> (f64, f64) {
        self.qu
            .iter()
            .zip(&self.quu)
            .zip(&self.k)
            .fold((0.0, 0.0), |(d1, d2), ((qu, quu), k)| {
                (d1 + qu.dot(k), d2 - k.dot(&(quu * k)))
            })
    }

    /// Closed-loop rollout of the current policy with step length `alpha`.
    fn forward_pass(&mut self, alpha: f64) -> Result<Trial> {
        let problem = &self.problem;
        let state = problem.terminal_model().state().clone();
        let horizon = problem.horizon();
        let mut xs = Vec::with_capacity(horizon + 1);
        let mut us = Vec::with_capacity(horizon);
        xs.push(problem.x0().clone());
        let mut cost = 0.0;
        for (t, (model, node)) in problem
            .running_models()
            .iter()
            .zip(self.data.running.iter_mut())
            .enumerate()
        {
            let dx = state.diff(&self.xs[t], &xs[t]);
            let u = &self.us[t] - &self.k[t] * alpha - &self.gains[t] * dx;
            model.calc(node, &xs[t], &u)?;
            cost += node.cost;
            xs.push(node.xnext.clone());
            us.push(u);
        }
        let terminal = problem.terminal_model();
        terminal.calc(&mut self.data.terminal, &xs[horizon], &DVector::zeros(terminal.nu()))?;
        cost += self.data.terminal.cost;
        Ok(Trial { xs, us, cost })
    }

    /// Tries every step length in order; returns the accepted trial and its length.
    fn line_search(&mut self, d1: f64, d2: f64) -> Option<(Trial, f64)> {
        let alphas = self.settings.alphas.clone();
        for alpha in alphas {
            let trial = match self.forward_pass(alpha) {
                Ok(trial) => trial,
                Err(err) => {
                    debug!("step length {alpha} rejected: {err}");
                    continue;
                }
            };
            let dv = self.cost - trial.cost;
            let dv_expected = alpha * (d1 + 0.5 * alpha * d2);
            if dv_expected >= 0.0
                && (d1 < self.settings.th_grad || dv > self.settings.th_accept_step * dv_expected)
            {
                return Some((trial, alpha));
            }
        }
        None
    }

    fn report(&self, status: SolveStatus, iterations: usize, failed: usize) -> SolveReport {
        SolveReport {
            status,
            iterations,
            cost: self.cost,
            stop: self.stop,
            failed_line_searches: failed,
        }
    }
}

fn add_diagonal(m: &mut DMatrix<f64>, value: f64) {
    for i in 0..m.nrows().min(m.ncols()) {
        m[(i, i)] += value;
    }
}

impl Solver for SolverDdp {
    fn solve(&mut self) -> Result<SolveReport> {
        self.regularization = self.settings.reg_init;
        let mut failed = 0;
        info!(
            "ddp: horizon {}, initial cost {:.6e}",
            self.problem.horizon(),
            self.cost
        );

        for iter in 0..self.settings.max_iter {
            self.iter = iter + 1;
            self.cost = self.problem.calc_diff(&mut self.data, &self.xs, &self.us)?;

            loop {
                match self.backward_pass() {
                    Ok(()) => break,
                    Err(Error::NonPositiveDefinite { node }) => {
                        debug!(
                            "ddp: Quu not positive definite at node {node} (reg {:.1e})",
                            self.regularization
                        );
                        match self.settings.increase(self.regularization) {
                            Some(reg) => self.regularization = reg,
                            None => {
                                warn!("ddp: regularization ceiling reached in backward pass");
                                let status = SolveStatus::Diverged {
                                    regularization: self.regularization,
                                };
                                return Ok(self.report(status, self.iter, failed));
                            }
                        }
                    }
                    Err(err) => return Err(err),
                }
            }

            let (d1, d2) = self.expected_improvement();
            let steplength = match self.line_search(d1, d2) {
                Some((trial, alpha)) => {
                    self.xs = trial.xs;
                    self.us = trial.us;
                    self.cost = trial.cost;
                    alpha
                }
                None => {
                    failed += 1;
                    warn!("ddp: iteration {}: {}", self.iter, Error::LineSearchExhausted);
                    self.settings.alphas.last().copied().unwrap_or(0.0)
                }
            };
            debug!(
                "ddp: iter {:3} cost {:.6e} stop {:.3e} reg {:.1e} step {}",
                self.iter, self.cost, self.stop, self.regularization, steplength
            );

            if self.stop < self.settings.th_stop {
                info!("ddp: converged after {} iterations", self.iter);
                return Ok(self.report(SolveStatus::Converged, self.iter, failed));
            }
            if steplength > self.settings.th_step_dec {
                self.regularization = self.settings.decrease(self.regularization);
            }
            if steplength <= self.settings.th_step_inc {
                match self.settings.increase(self.regularization) {
                    Some(reg) => self.regularization = reg,
                    None => {
                        warn!("ddp: regularization ceiling reached after failed steps");
                        let status = SolveStatus::Diverged {
                            regularization: self.regularization,
                        };
                        return Ok(self.report(status, self.iter, failed));
                    }
                }
            }
        }
        warn!("ddp: no convergence within {} iterations", self.settings.max_iter);
        Ok(self.report(SolveStatus::MaxIterations, self.iter, failed))
    }

    fn set_candidate(&mut self, us: Vec<DVector<f64>>) -> Result<()> {
        check_dim("number of controls", self.problem.horizon(), us.len())?;
        let xs = self.problem.rollout(&mut self.data, &us)?;
        self.cost = self.problem.calc(&mut self.data, &xs, &us)?;
        self.xs = xs;
        self.us = us;
        self.stop = f64::INFINITY;
        Ok(())
    }

    fn xs(&self) -> &[DVector<f64>] {
        &self.xs
    }

    fn us(&self) -> &[DVector<f64>] {
        &self.us
    }

    fn cost(&self) -> f64 {
        self.cost
    }

    fn stop(&self) -> f64 {
        self.stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionModel, ActionModelLqr};
    use crate::solvers::test_support::{arm_positioning_problem, init_logging};

    fn lqr_problem(horizon: usize) -> Arc<ShootingProblem> {
        let model: Arc<dyn ActionModel> = Arc::new(ActionModelLqr::new(3, 2, false));
        let x0 = DVector::from_vec(vec![1.0, -1.0, 0.5]);
        Arc::new(ShootingProblem::new(x0, vec![model.clone(); horizon], model).unwrap())
    }

    #[test]
    fn lqr_is_solved_in_one_step() {
        init_logging();
        let mut solver = SolverDdp::new(lqr_problem(10)).unwrap();
        let initial = solver.cost();
        let report = solver.solve().unwrap();
        assert!(report.converged());
        assert!(report.iterations <= 2, "iterations: {}", report.iterations);
        assert!(report.cost < initial);
        assert!(solver.stop() < solver.settings().th_stop);
    }

    #[test]
    fn solution_is_dynamically_feasible() {
        init_logging();
        let problem = lqr_problem(5);
        let mut solver = SolverDdp::new(problem.clone()).unwrap();
        solver.solve().unwrap();
        let mut data = problem.create_data();
        let xs = problem.rollout(&mut data, solver.us()).unwrap();
        for (a, b) in xs.iter().zip(solver.xs()) {
            assert!((a - b).amax() < 1e-12);
        }
    }

    #[test]
    fn solve_is_a_warm_restart() {
        init_logging();
        let settings = SolverSettings {
            th_stop: 1e-18,
            ..SolverSettings::default()
        };
        let mut solver = SolverDdp::with_settings(arm_positioning_problem(), settings).unwrap();
        let first = solver.solve().unwrap();
        let u0 = solver.us()[0].clone();
        let second = solver.solve().unwrap();
        assert!(second.converged());
        assert!(second.iterations <= first.iterations);
        assert!((&solver.us()[0] - &u0).amax() < 1e-7);
    }

    #[test]
    fn arm_positioning_reduces_cost() {
        init_logging();
        let mut solver = SolverDdp::new(arm_positioning_problem()).unwrap();
        let initial = solver.cost();
        let report = solver.solve().unwrap();
        assert!(report.converged(), "{report:?}");
        assert!(report.cost <= initial);
        assert_eq!(report.failed_line_searches, 0);
    }

    #[test]
    fn shared_problem_keeps_its_initial_state() {
        let problem = lqr_problem(4);
        let x0 = problem.x0().clone();
        let mut first = SolverDdp::new(problem.clone()).unwrap();
        let mut second = SolverDdp::new(problem.clone()).unwrap();
        first.solve().unwrap();
        second.solve().unwrap();
        assert_eq!(problem.x0(), &x0);
        assert_eq!(first.xs()[0], x0);
        assert_eq!(first.us(), second.us());
    }

    #[test]
    fn set_candidate_checks_lengths() {
        let mut solver = SolverDdp::new(lqr_problem(3)).unwrap();
        let err = solver.set_candidate(vec![DVector::zeros(2); 2]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert!(solver.set_candidate(vec![DVector::zeros(2); 3]).is_ok());
    }
}
