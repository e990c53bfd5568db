use std::sync::Arc;

use nalgebra::DVector;

use super::{DifferentialActionData, DifferentialActionModel};
use crate::costs::{check_inputs, CostModel, CostSum};
use crate::error::{check_dim, Result};
use crate::multibody::Multibody;
use crate::state::StateMultibody;
use crate::traits::StateSpace;

/// `v̇ = M(q)⁻¹ (τ - b(q, v))` with `u = τ`, plus a weighted cost sum.
pub struct DifferentialActionModelFullyActuated {
    multibody: Arc<dyn Multibody>,
    state: Arc<dyn StateSpace>,
    costs: CostSum,
}

impl DifferentialActionModelFullyActuated {
    pub fn new(state: Arc<StateMultibody>, costs: CostSum) -> Result<Self> {
        let multibody = state.multibody().clone();
        check_dim("cost control dimension", multibody.nv(), costs.nu())?;
        check_dim("cost state dimension", state.ndx(), costs.state().ndx())?;
        Ok(Self {
            multibody,
            state,
            costs,
        })
    }

    pub fn costs(&self) -> &CostSum {
        &self.costs
    }

    pub fn costs_mut(&mut self) -> &mut CostSum {
        &mut self.costs
    }

    pub fn multibody(&self) -> &Arc<dyn Multibody> {
        &self.multibody
    }

    fn split(&self, x: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let nq = self.multibody.nq();
        (
            x.rows(0, nq).into_owned(),
            x.rows(nq, self.multibody.nv()).into_owned(),
        )
    }

    fn copy_cost_derivatives(data: &mut DifferentialActionData) {
        let costs = &data.costs;
        data.lx.copy_from(&costs.lx);
        data.lu.copy_from(&costs.lu);
        data.lxx.copy_from(&costs.lxx);
        data.lxu.copy_from(&costs.lxu);
        data.luu.copy_from(&costs.luu);
        data.rx.copy_from(&costs.rx);
        data.ru.copy_from(&costs.ru);
        data.arr.copy_from(&costs.activation.arr);
    }
}

impl DifferentialActionModel for DifferentialActionModelFullyActuated {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.multibody.nv()
    }

    fn nr(&self) -> usize {
        self.costs.nr()
    }

    fn create_data(&self) -> DifferentialActionData {
        DifferentialActionData::new(
            self.state.ndx(),
            self.multibody.nv(),
            self.nu(),
            self.nr(),
            self.multibody.create_data(),
            self.costs.create_data(),
        )
    }

    fn calc(
        &self,
        data: &mut DifferentialActionData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.state.as_ref(), self.nu(), x, u)?;
        let (q, v) = self.split(x);
        let mb = &mut data.multibody;
        self.multibody.forward_kinematics(mb, &q, &v);
        self.multibody.update_frame_placements(mb);
        self.multibody.center_of_mass(mb, &q);
        self.multibody.forward_dynamics(mb, &q, &v, u)?;
        data.xout.copy_from(&mb.ddq);

        self.costs.calc(&mut data.costs, &data.multibody, x, u)?;
        data.cost = data.costs.cost;
        data.r.copy_from(&data.costs.r);
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut DifferentialActionData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, x, u)?;
        }
        let (q, v) = self.split(x);
        let nv = self.multibody.nv();
        let mb = &mut data.multibody;
        self.multibody.compute_joint_jacobians(mb, &q);
        self.multibody.compute_forward_kinematics_derivatives(mb, &q, &v);
        self.multibody.jacobian_center_of_mass(mb, &q);
        self.multibody.compute_dynamics_derivatives(mb, &q, &v, u)?;
        data.fx.columns_mut(0, nv).copy_from(&mb.ddq_dq);
        data.fx.columns_mut(nv, nv).copy_from(&mb.ddq_dv);
        data.fu.copy_from(&mb.ddq_dtau);

        self.costs
            .calc_diff(&mut data.costs, &data.multibody, x, u, false)?;
        Self::copy_cost_derivatives(data);
        Ok(())
    }

    fn calc_activation_diff(&self, data: &mut DifferentialActionData) -> Result<()> {
        self.costs.calc_activation_diff(&mut data.costs)?;
        data.arr.copy_from(&data.costs.activation.arr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::positioning_model;
    use crate::costs::test_support::absmax;
    use crate::error::Error;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn acceleration_matches_engine() {
        let model = positioning_model([1.0, 0.1, 0.01]);
        let mut rng = StdRng::seed_from_u64(3);
        let x = model.state().random(&mut rng);
        let u = DVector::from_fn(model.nu(), |_, _| rng.gen_range(-1.0..1.0));
        let mut data = model.create_data();
        model.calc(&mut data, &x, &u).unwrap();

        let (q, v) = model.split(&x);
        let mut mb = model.multibody().create_data();
        model.multibody().forward_dynamics(&mut mb, &q, &v, &u).unwrap();
        assert!((&data.xout - &mb.ddq).amax() < 1e-14);
        assert!(data.cost > 0.0);
        assert_eq!(data.r.len(), model.nr());
    }

    #[test]
    fn cached_calc_diff_matches_recalc() {
        let model = positioning_model([10.0, 0.1, 0.01]);
        let mut rng = StdRng::seed_from_u64(8);
        let x = model.state().random(&mut rng);
        let u = DVector::from_fn(model.nu(), |_, _| rng.gen_range(-1.0..1.0));

        let mut cached = model.create_data();
        model.calc(&mut cached, &x, &u).unwrap();
        model.calc_diff(&mut cached, &x, &u, false).unwrap();
        let mut fresh = model.create_data();
        model.calc_diff(&mut fresh, &x, &u, true).unwrap();

        assert_eq!(cached.cost, fresh.cost);
        assert!(absmax(&(&cached.fx - &fresh.fx)) < 1e-14);
        assert!(absmax(&(&cached.fu - &fresh.fu)) < 1e-14);
        assert!(absmax(&(&cached.lxx - &fresh.lxx)) < 1e-14);
        assert!((&cached.lx - &fresh.lx).amax() < 1e-14);
    }

    #[test]
    fn rejects_mismatched_inputs() {
        let model = positioning_model([1.0, 1.0, 1.0]);
        let mut data = model.create_data();
        let x = model.state().zero();
        let u = DVector::zeros(model.nu() + 1);
        assert!(matches!(
            model.calc(&mut data, &x, &u),
            Err(Error::DimensionMismatch { .. })
        ));
    }
}
