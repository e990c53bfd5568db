use std::sync::Arc;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};

use super::{SolveReport, SolveStatus, Solver, SolverSettings};
use crate::error::{check_dim, Error, Result};
use crate::problem::{ProblemData, ShootingProblem};
use crate::traits::StateSpace;

/// Dense primal-dual solver for a shooting problem.
///
/// The primal unknowns are ordered `[δx₀, δu₀, δx₁, δu₁, …, δx_T]`; the equality
/// constraints are the initial condition and the linearized dynamics of every node.
/// The cost is `O((T·(nx + nu))³)` per iteration, so this solver is meant for small
/// reference problems.
pub struct SolverKkt {
    problem: Arc<ShootingProblem>,
    data: ProblemData,
    settings: SolverSettings,
    state: Arc<dyn StateSpace>,
    xs: Vec<DVector<f64>>,
    us: Vec<DVector<f64>>,
    lambdas: Vec<DVector<f64>>,
    dxs: Vec<DVector<f64>>,
    dus: Vec<DVector<f64>>,
    /// Offsets of `δxₜ` and `δuₜ` in the primal vector.
    x_offsets: Vec<usize>,
    u_offsets: Vec<usize>,
    nprimal: usize,
    cost: f64,
    stop: f64,
    regularization: f64,
    iter: usize,
}

/// Linearization of the problem around the current trajectory.
struct KktSystem {
    hessian: DMatrix<f64>,
    gradient: DVector<f64>,
    jacobian: DMatrix<f64>,
    /// Dynamics gaps `f(xₜ, uₜ) ⊖ xₜ₊₁`, with the initial-state gap first.
    gaps: DVector<f64>,
}

impl SolverKkt {
    pub fn new(problem: Arc<ShootingProblem>) -> Result<Self> {
        Self::with_settings(problem, SolverSettings::default())
    }

    pub fn with_settings(problem: Arc<ShootingProblem>, settings: SolverSettings) -> Result<Self> {
        settings.validate()?;
        let state = problem.terminal_model().state().clone();
        let ndx = state.ndx();
        let horizon = problem.horizon();

        let mut x_offsets = Vec::with_capacity(horizon + 1);
        let mut u_offsets = Vec::with_capacity(horizon);
        let mut offset = 0;
        for model in problem.running_models() {
            x_offsets.push(offset);
            offset += ndx;
            u_offsets.push(offset);
            offset += model.nu();
        }
        x_offsets.push(offset);
        let nprimal = offset + ndx;

        let mut data = problem.create_data();
        let us = problem.zero_controls();
        let xs = problem.rollout(&mut data, &us)?;
        let cost = problem.calc(&mut data, &xs, &us)?;
        Ok(Self {
            data,
            settings: settings.clone(),
            lambdas: vec![DVector::zeros(ndx); horizon + 1],
            dxs: vec![DVector::zeros(ndx); horizon + 1],
            dus: us.clone(),
            xs,
            us,
            x_offsets,
            u_offsets,
            nprimal,
            cost,
            stop: f64::INFINITY,
            regularization: settings.reg_init,
            iter: 0,
            state,
            problem,
        })
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// Multipliers of the dynamics constraints from the last Newton step.
    pub fn lambdas(&self) -> &[DVector<f64>] {
        &self.lambdas
    }

    pub fn regularization(&self) -> f64 {
        self.regularization
    }

    pub fn iter(&self) -> usize {
        self.iter
    }

    fn assemble(&self) -> KktSystem {
        let ndx = self.state.ndx();
        let horizon = self.problem.horizon();
        let ncon = (horizon + 1) * ndx;
        let mut hessian = DMatrix::zeros(self.nprimal, self.nprimal);
        let mut gradient = DVector::zeros(self.nprimal);
        let mut jacobian = DMatrix::zeros(ncon, self.nprimal);
        let mut gaps = DVector::zeros(ncon);

        jacobian
            .view_mut((0, 0), (ndx, ndx))
            .fill_with_identity();
        gaps.rows_mut(0, ndx)
            .copy_from(&self.state.diff(&self.xs[0], self.problem.x0()));

        for (t, node) in self.data.running.iter().enumerate() {
            let (ox, ou, nu) = (self.x_offsets[t], self.u_offsets[t], node.lu.len());
            hessian.view_mut((ox, ox), (ndx, ndx)).copy_from(&node.lxx);
            hessian.view_mut((ox, ou), (ndx, nu)).copy_from(&node.lxu);
            hessian
                .view_mut((ou, ox), (nu, ndx))
                .copy_from(&node.lxu.transpose());
            hessian.view_mut((ou, ou), (nu, nu)).copy_from(&node.luu);
            gradient.rows_mut(ox, ndx).copy_from(&node.lx);
            gradient.rows_mut(ou, nu).copy_from(&node.lu);

            let row = (t + 1) * ndx;
            let ox_next = self.x_offsets[t + 1];
            jacobian
                .view_mut((row, ox_next), (ndx, ndx))
                .fill_with_identity();
            jacobian.view_mut((row, ox), (ndx, ndx)).copy_from(&(-&node.fx));
            jacobian.view_mut((row, ou), (ndx, nu)).copy_from(&(-&node.fu));
            gaps.rows_mut(row, ndx)
                .copy_from(&self.state.diff(&self.xs[t + 1], &node.xnext));
        }
        let ox = self.x_offsets[horizon];
        hessian
            .view_mut((ox, ox), (ndx, ndx))
            .copy_from(&self.data.terminal.lxx);
        gradient
            .rows_mut(ox, ndx)
            .copy_from(&self.data.terminal.lx);

        KktSystem {
            hessian,
            gradient,
            jacobian,
            gaps,
        }
    }

    /// Solves `[H + μI, Jᵀ; J, 0]·[p; λ] = [−g; c]` and returns `(p, λ)`.
    fn newton_step(&self, system: &KktSystem) -> Result<(DVector<f64>, DVector<f64>)> {
        let n = self.nprimal;
        let m = system.gaps.len();
        let mut kkt = DMatrix::zeros(n + m, n + m);
        kkt.view_mut((0, 0), (n, n)).copy_from(&system.hessian);
        for i in 0..n {
            kkt[(i, i)] += self.regularization;
        }
        kkt.view_mut((0, n), (n, m))
            .copy_from(&system.jacobian.transpose());
        kkt.view_mut((n, 0), (m, n)).copy_from(&system.jacobian);

        let mut rhs = DVector::zeros(n + m);
        rhs.rows_mut(0, n).copy_from(&(-&system.gradient));
        rhs.rows_mut(n, m).copy_from(&system.gaps);

        let solution = kkt
            .lu()
            .solve(&rhs)
            .filter(|s| s.iter().all(|v| v.is_finite()))
            .ok_or(Error::SingularSystem {
                regularization: self.regularization,
            })?;
        Ok((
            solution.rows(0, n).into_owned(),
            solution.rows(n, m).into_owned(),
        ))
    }

    /// Splits the primal step into per-node state and control directions.
    fn store_direction(&mut self, primal: &DVector<f64>, dual: &DVector<f64>) {
        let ndx = self.state.ndx();
        for (t, &ox) in self.x_offsets.iter().enumerate() {
            self.dxs[t] = primal.rows(ox, ndx).into_owned();
            self.lambdas[t] = dual.rows(t * ndx, ndx).into_owned();
        }
        for (t, &ou) in self.u_offsets.iter().enumerate() {
            let nu = self.us[t].len();
            self.dus[t] = primal.rows(ou, nu).into_owned();
        }
    }

    /// Cost plus an ℓ1 penalty on the dynamics gaps of `(xs, us)`.
    fn merit(&mut self, xs: &[DVector<f64>], us: &[DVector<f64>], weight: f64) -> Result<f64> {
        let cost = self.problem.calc(&mut self.data, xs, us)?;
        let mut infeasibility = self.state.diff(&xs[0], self.problem.x0()).lp_norm(1);
        for (t, node) in self.data.running.iter().enumerate() {
            infeasibility += self.state.diff(&xs[t + 1], &node.xnext).lp_norm(1);
        }
        Ok(cost + weight * infeasibility)
    }

    fn trial(&self, alpha: f64) -> (Vec<DVector<f64>>, Vec<DVector<f64>>) {
        let xs = self
            .xs
            .iter()
            .zip(&self.dxs)
            .map(|(x, dx)| self.state.integrate(x, &(dx * alpha)))
            .collect();
        let us = self
            .us
            .iter()
            .zip(&self.dus)
            .map(|(u, du)| u + du * alpha)
            .collect();
        (xs, us)
    }

    /// Backtracking on the merit function. Returns the accepted step length.
    fn line_search(&mut self, penalty: f64) -> Result<Option<f64>> {
        let current = self.merit(&self.xs.clone(), &self.us.clone(), penalty)?;
        let slack = 10.0 * f64::EPSILON * current.abs().max(1.0);
        for alpha in self.settings.alphas.clone() {
            let (xs, us) = self.trial(alpha);
            let merit = match self.merit(&xs, &us, penalty) {
                Ok(merit) if merit.is_finite() => merit,
                Ok(_) => continue,
                Err(err) => {
                    debug!("kkt: step length {alpha} rejected: {err}");
                    continue;
                }
            };
            if merit <= current + slack {
                self.cost = self.problem.calc(&mut self.data, &xs, &us)?;
                self.xs = xs;
                self.us = us;
                return Ok(Some(alpha));
            }
        }
        Ok(None)
    }

    fn report(&self, status: SolveStatus, failed: usize) -> SolveReport {
        SolveReport {
            status,
            iterations: self.iter,
            cost: self.cost,
            stop: self.stop,
            failed_line_searches: failed,
        }
    }

    fn diverged(&self, failed: usize) -> SolveReport {
        warn!(
            "kkt: regularization ceiling reached ({:.1e})",
            self.regularization
        );
        self.report(
            SolveStatus::Diverged {
                regularization: self.regularization,
            },
            failed,
        )
    }
}

impl Solver for SolverKkt {
    fn solve(&mut self) -> Result<SolveReport> {
        self.regularization = self.settings.reg_init;
        let mut failed = 0;
        info!(
            "kkt: {} primal unknowns, initial cost {:.6e}",
            self.nprimal, self.cost
        );

        for iter in 0..self.settings.max_iter {
            self.iter = iter + 1;
            self.cost = self.problem.calc_diff(&mut self.data, &self.xs, &self.us)?;
            let system = self.assemble();

            let (primal, dual) = loop {
                match self.newton_step(&system) {
                    Ok(step) => break step,
                    Err(err @ Error::SingularSystem { .. }) => {
                        debug!("kkt: {err}");
                        match self.settings.increase(self.regularization) {
                            Some(reg) => self.regularization = reg,
                            None => return Ok(self.diverged(failed)),
                        }
                    }
                    Err(err) => return Err(err),
                }
            };

            let stationarity = &system.gradient + system.jacobian.tr_mul(&dual);
            self.stop = stationarity.norm_squared() + system.gaps.norm_squared();
            self.store_direction(&primal, &dual);

            let penalty = 2.0 * dual.amax() + 1.0;
            let steplength = match self.line_search(penalty)? {
                Some(alpha) => alpha,
                None => {
                    failed += 1;
                    warn!("kkt: iteration {}: {}", self.iter, Error::LineSearchExhausted);
                    self.settings.alphas.last().copied().unwrap_or(0.0)
                }
            };
            debug!(
                "kkt: iter {:3} cost {:.6e} stop {:.3e} reg {:.1e} step {}",
                self.iter, self.cost, self.stop, self.regularization, steplength
            );

            if self.stop < self.settings.th_stop {
                info!("kkt: converged after {} iterations", self.iter);
                return Ok(self.report(SolveStatus::Converged, failed));
            }
            if steplength > self.settings.th_step_dec {
                self.regularization = self.settings.decrease(self.regularization);
            }
            if steplength <= self.settings.th_step_inc {
                match self.settings.increase(self.regularization) {
                    Some(reg) => self.regularization = reg,
                    None => return Ok(self.diverged(failed)),
                }
            }
        }
        warn!("kkt: no convergence within {} iterations", self.settings.max_iter);
        Ok(self.report(SolveStatus::MaxIterations, failed))
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
