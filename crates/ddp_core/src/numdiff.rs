pub mod action;
pub mod cost;

pub use action::{ActionModelNumDiff, DifferentialActionModelNumDiff};
pub use cost::{CostModelNumDiff, ReevalFn};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::traits::StateSpace;

/// Finite-difference settings. State perturbations follow the state's own chart
/// (`integrate`/`diff`), so estimates live in the same tangent coordinates as the
/// analytic derivatives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NumDiffSettings {
    pub disturbance: f64,
    /// Central instead of forward differences.
    pub centered: bool,
    /// Build `Lxx, Lxu, Luu` from the differenced residual Jacobians; zero otherwise.
    pub with_gauss_approx: bool,
}

impl Default for NumDiffSettings {
    fn default() -> Self {
        Self {
            disturbance: (2.0 * f64::EPSILON).sqrt(),
            centered: false,
            with_gauss_approx: true,
        }
    }
}

impl NumDiffSettings {
    /// Tolerance at which finite-difference and analytic derivatives are expected to
    /// agree.
    pub fn tolerance(&self) -> f64 {
        100.0 * self.disturbance
    }

    /// Denominator of the difference quotient.
    pub(crate) fn span(&self) -> f64 {
        if self.centered {
            2.0 * self.disturbance
        } else {
            self.disturbance
        }
    }

    /// `x ⊕ ±h·eᵢ` along the state chart.
    pub(crate) fn perturb_state(
        &self,
        state: &dyn StateSpace,
        x: &DVector<f64>,
        i: usize,
        sign: f64,
    ) -> DVector<f64> {
        let mut dx = DVector::zeros(state.ndx());
        dx[i] = sign * self.disturbance;
        state.integrate(x, &dx)
    }

    pub(crate) fn perturb_control(&self, u: &DVector<f64>, i: usize, sign: f64) -> DVector<f64> {
        let mut up = u.clone();
        up[i] += sign * self.disturbance;
        up
    }
}
