use std::sync::Arc;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::{ActionData, ActionModel, DifferentialActionModel};
use crate::costs::check_inputs;
use crate::error::{check_dim, Error, Result};
use crate::traits::StateSpace;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EulerSettings {
    pub time_step: f64,
    /// Multiplies the step cost and its derivatives by `time_step`. Terminal nodes
    /// built with `time_step = 1` are unaffected either way.
    pub scale_cost_by_time_step: bool,
}

impl Default for EulerSettings {
    fn default() -> Self {
        Self {
            time_step: 1e-3,
            scale_cost_by_time_step: true,
        }
    }
}

/// Explicit Euler discretization of a differential action model:
/// `x⁺ = integrate(x, Δt·[v; v̇])`.
pub struct IntegratedActionModelEuler {
    differential: Arc<dyn DifferentialActionModel>,
    settings: EulerSettings,
}

fn validate_time_step(time_step: f64) -> Result<()> {
    if time_step > 0.0 && time_step.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "time step must be positive and finite, got {time_step}"
        )))
    }
}

impl IntegratedActionModelEuler {
    pub fn new(differential: Arc<dyn DifferentialActionModel>, time_step: f64) -> Result<Self> {
        Self::with_settings(
            differential,
            EulerSettings {
                time_step,
                ..EulerSettings::default()
            },
        )
    }

    pub fn with_settings(
        differential: Arc<dyn DifferentialActionModel>,
        settings: EulerSettings,
    ) -> Result<Self> {
        validate_time_step(settings.time_step)?;
        let state = differential.state();
        check_dim("tangent dimension of a [q; v] state", 2 * state.nv(), state.ndx())?;
        debug!(
            "euler integrator: dt = {}, scaled cost = {}",
            settings.time_step, settings.scale_cost_by_time_step
        );
        Ok(Self {
            differential,
            settings,
        })
    }

    pub fn time_step(&self) -> f64 {
        self.settings.time_step
    }

    pub fn set_time_step(&mut self, time_step: f64) -> Result<()> {
        validate_time_step(time_step)?;
        self.settings.time_step = time_step;
        Ok(())
    }

    pub fn settings(&self) -> &EulerSettings {
        &self.settings
    }

    pub fn differential(&self) -> &Arc<dyn DifferentialActionModel> {
        &self.differential
    }

    fn cost_scale(&self) -> f64 {
        if self.settings.scale_cost_by_time_step {
            self.settings.time_step
        } else {
            1.0
        }
    }

    /// Tangent step `Δt·[v; v̇]`.
    fn tangent_step(&self, x: &DVector<f64>, acceleration: &DVector<f64>) -> DVector<f64> {
        let state = self.differential.state();
        let (nq, nv) = (state.nq(), state.nv());
        let dt = self.settings.time_step;
        let mut dx = DVector::zeros(2 * nv);
        dx.rows_mut(0, nv).copy_from(&(x.rows(nq, nv) * dt));
        dx.rows_mut(nv, nv).copy_from(&(acceleration * dt));
        dx
    }
}

impl ActionModel for IntegratedActionModelEuler {
    fn state(&self) -> &Arc<dyn StateSpace> {
        self.differential.state()
    }

    fn nu(&self) -> usize {
        self.differential.nu()
    }

    fn nr(&self) -> usize {
        self.differential.nr()
    }

    fn create_data(&self) -> ActionData {
        let state = self.differential.state();
        let mut data = ActionData::new(state.nx(), state.ndx(), self.nu(), self.nr());
        data.differential = Some(Box::new(self.differential.create_data()));
        data
    }

    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: &DVector<f64>) -> Result<()> {
        check_inputs(self.state().as_ref(), self.nu(), x, u)?;
        let inner = data
            .differential
            .as_deref_mut()
            .ok_or_else(|| Error::InvalidArgument("action data lacks differential data".into()))?;
        self.differential.calc(inner, x, u)?;

        let dx = self.tangent_step(x, &inner.xout);
        data.xnext = self.state().integrate(x, &dx);
        data.cost = self.cost_scale() * inner.cost;
        data.r.copy_from(&inner.r);
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
        let inner = data
            .differential
            .as_deref_mut()
            .ok_or_else(|| Error::InvalidArgument("action data lacks differential data".into()))?;
        self.differential.calc_diff(inner, x, u, false)?;

        let state = self.differential.state();
        let nv = state.nv();
        let ndx = state.ndx();
        let dt = self.settings.time_step;

        // Partials of the tangent step Δt·[v; v̇].
        let mut ddx_dx = DMatrix::zeros(ndx, ndx);
        ddx_dx
            .view_mut((0, nv), (nv, nv))
            .copy_from(&(DMatrix::<f64>::identity(nv, nv) * dt));
        ddx_dx.rows_mut(nv, nv).copy_from(&(&inner.fx * dt));
        let mut ddx_du = DMatrix::zeros(ndx, self.nu());
        ddx_du.rows_mut(nv, nv).copy_from(&(&inner.fu * dt));

        let dx = self.tangent_step(x, &inner.xout);
        let (jx, jdx) = state.jintegrate(x, &dx);
        data.fx = jx + &jdx * ddx_dx;
        data.fu = &jdx * ddx_du;

        let scale = self.cost_scale();
        data.lx = &inner.lx * scale;
        data.lu = &inner.lu * scale;
        data.lxx = &inner.lxx * scale;
        data.lxu = &inner.lxu * scale;
        data.luu = &inner.luu * scale;
        data.rx.copy_from(&inner.rx);
        data.ru.copy_from(&inner.ru);
        data.arr = &inner.arr * scale;
        Ok(())
    }

    fn calc_activation_diff(&self, data: &mut ActionData) -> Result<()> {
        let inner = data
            .differential
            .as_deref_mut()
            .ok_or_else(|| Error::InvalidArgument("action data lacks differential data".into()))?;
        self.differential.calc_activation_diff(inner)?;
        data.arr = &inner.arr * self.cost_scale();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::{integrated_positioning, positioning_model};
    use crate::costs::test_support::absmax;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn euler_step_moves_along_velocity_and_acceleration() {
        let model = integrated_positioning(1e-2, [1.0, 1.0, 1.0]);
        let mut rng = StdRng::seed_from_u64(11);
        let x = model.state().random(&mut rng);
        let u = DVector::from_fn(model.nu(), |_, _| rng.gen_range(-1.0..1.0));
        let mut data = model.create_data();
        model.calc(&mut data, &x, &u).unwrap();

        let inner = data.differential.as_ref().unwrap();
        let nv = model.state().nv();
        for i in 0..nv {
            assert!((data.xnext[i] - (x[i] + 1e-2 * x[nv + i])).abs() < 1e-14);
            assert!((data.xnext[nv + i] - (x[nv + i] + 1e-2 * inner.xout[i])).abs() < 1e-14);
        }
        assert!((data.cost - 1e-2 * inner.cost).abs() < 1e-14);
    }

    #[test]
    fn unscaled_cost_keeps_the_continuous_value() {
        let settings = EulerSettings {
            time_step: 0.05,
            scale_cost_by_time_step: false,
        };
        let model =
            IntegratedActionModelEuler::with_settings(Arc::new(positioning_model([1.0, 1.0, 1.0])), settings)
                .unwrap();
        let x = model.state().zero();
        let u = DVector::zeros(model.nu());
        let mut data = model.create_data();
        model.calc_diff(&mut data, &x, &u, true).unwrap();
        let inner = data.differential.as_ref().unwrap();
        assert_eq!(data.cost, inner.cost);
        assert!((&data.lx - &inner.lx).amax() < 1e-15);
    }

    #[test]
    fn cached_calc_diff_matches_recalc() {
        let model = integrated_positioning(1e-3, [10.0, 0.1, 0.01]);
        let mut rng = StdRng::seed_from_u64(5);
        let x = model.state().random(&mut rng);
        let u = DVector::from_fn(model.nu(), |_, _| rng.gen_range(-1.0..1.0));

        let mut cached = model.create_data();
        model.calc(&mut cached, &x, &u).unwrap();
        model.calc_diff(&mut cached, &x, &u, false).unwrap();
        let mut fresh = model.create_data();
        model.calc_diff(&mut fresh, &x, &u, true).unwrap();

        assert!(absmax(&(&cached.fx - &fresh.fx)) < 1e-14);
        assert!(absmax(&(&cached.fu - &fresh.fu)) < 1e-14);
        assert!(absmax(&(&cached.luu - &fresh.luu)) < 1e-14);
        assert!((&cached.lu - &fresh.lu).amax() < 1e-14);
    }

    #[test]
    fn rejects_non_positive_time_step() {
        let mut model = integrated_positioning(1e-3, [1.0, 1.0, 1.0]);
        assert!(matches!(
            model.set_time_step(0.0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(model.set_time_step(1.0).is_ok());
        assert_eq!(model.time_step(), 1.0);
    }
}
