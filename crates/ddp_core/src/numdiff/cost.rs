use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use super::NumDiffSettings;
use crate::costs::{gauss_newton, CostData, CostModel};
use crate::error::Result;
use crate::multibody::{Multibody, MultibodyData};
use crate::traits::StateSpace;

/// Side-effecting recomputation run on the multibody scratch object before every
/// perturbed evaluation, e.g. forward kinematics at the perturbed state.
pub type ReevalFn =
    Box<dyn Fn(&dyn Multibody, &mut MultibodyData, &DVector<f64>, &DVector<f64>) + Send + Sync>;

/// Finite-difference derivatives of a wrapped cost model.
///
/// Perturbed evaluations run on a private copy of the shared multibody data, so the
/// caller's scratch object is left untouched. The engine quantities a perturbed
/// `calc` reads must be refreshed by the reeval callbacks.
pub struct CostModelNumDiff {
    model: Arc<dyn CostModel>,
    settings: NumDiffSettings,
    multibody: Option<Arc<dyn Multibody>>,
    reevals: Vec<ReevalFn>,
}

impl CostModelNumDiff {
    pub fn new(model: Arc<dyn CostModel>) -> Self {
        Self {
            model,
            settings: NumDiffSettings::default(),
            multibody: None,
            reevals: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: NumDiffSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_reevals(mut self, multibody: Arc<dyn Multibody>, reevals: Vec<ReevalFn>) -> Self {
        self.multibody = Some(multibody);
        self.reevals = reevals;
        self
    }

    pub fn settings(&self) -> &NumDiffSettings {
        &self.settings
    }

    pub fn model(&self) -> &Arc<dyn CostModel> {
        &self.model
    }

    fn reeval(&self, scratch: &mut MultibodyData, x: &DVector<f64>, u: &DVector<f64>) {
        if let Some(multibody) = &self.multibody {
            for reeval in &self.reevals {
                reeval(multibody.as_ref(), scratch, x, u);
            }
        }
    }

    /// Cost and residual at `(x, u)` on the scratch copy.
    fn perturbed_cost(
        &self,
        perturbed: &mut CostData,
        scratch: &mut MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<(f64, DVector<f64>)> {
        self.reeval(scratch, x, u);
        self.model.calc(perturbed, scratch, x, u)?;
        Ok((perturbed.cost, perturbed.r.clone()))
    }
}

impl CostModel for CostModelNumDiff {
    fn state(&self) -> &Arc<dyn StateSpace> {
        self.model.state()
    }

    fn nu(&self) -> usize {
        self.model.nu()
    }

    fn nr(&self) -> usize {
        self.model.nr()
    }

    fn create_data(&self) -> CostData {
        self.model.create_data()
    }

    fn calc(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        self.model.calc(data, shared, x, u)
    }

    fn calc_diff(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, shared, x, u)?;
        }
        let state = self.model.state();
        let settings = &self.settings;
        let span = settings.span();
        let nominal = (data.cost, data.r.clone());

        // Activation curvature at the nominal residual, for the Gauss-Newton blocks.
        self.model.calc_activation_diff(data)?;

        let mut scratch = shared.clone();
        let mut perturbed = self.model.create_data();

        for i in 0..state.ndx() {
            let xp = settings.perturb_state(state.as_ref(), x, i, 1.0);
            let (cp, rp) = self.perturbed_cost(&mut perturbed, &mut scratch, &xp, u)?;
            let (cm, rm) = if settings.centered {
                let xm = settings.perturb_state(state.as_ref(), x, i, -1.0);
                self.perturbed_cost(&mut perturbed, &mut scratch, &xm, u)?
            } else {
                nominal.clone()
            };
            data.lx[i] = (cp - cm) / span;
            data.rx.set_column(i, &((rp - rm) / span));
        }
        for i in 0..self.model.nu() {
            let up = settings.perturb_control(u, i, 1.0);
            let (cp, rp) = self.perturbed_cost(&mut perturbed, &mut scratch, x, &up)?;
            let (cm, rm) = if settings.centered {
                let um = settings.perturb_control(u, i, -1.0);
                self.perturbed_cost(&mut perturbed, &mut scratch, x, &um)?
            } else {
                nominal.clone()
            };
            data.lu[i] = (cp - cm) / span;
            data.ru.set_column(i, &((rp - rm) / span));
        }

        if settings.with_gauss_approx && self.model.nr() > 0 {
            let (lxx, lxu, luu) = gauss_newton(&data.rx, &data.ru, &data.activation.arr);
            data.lxx = lxx;
            data.lxu = lxu;
            data.luu = luu;
        } else {
            let (ndx, nu) = (state.ndx(), self.model.nu());
            data.lxx = DMatrix::zeros(ndx, ndx);
            data.lxu = DMatrix::zeros(ndx, nu);
            data.luu = DMatrix::zeros(nu, nu);
        }
        Ok(())
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        self.model.calc_activation_diff(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{ActivationInequality, ActivationWeightedQuad};
    use crate::costs::test_support::{absmax, ArmFixture};
    use crate::costs::{
        CostCoM, CostControl, CostFramePlacement, CostFrameRotation, CostFrameTranslation,
        CostFrameVelocity, CostFrameVelocityLinear, CostState, CostSum,
    };
    use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3, Vector6};

    fn split(multibody: &dyn Multibody, x: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let nq = multibody.nq();
        (
            x.rows(0, nq).into_owned(),
            x.rows(nq, multibody.nv()).into_owned(),
        )
    }

    fn kinematics_reevals() -> Vec<ReevalFn> {
        vec![
            Box::new(
                |mb: &dyn Multibody, data: &mut MultibodyData, x: &DVector<f64>, _u: &DVector<f64>| {
                    let (q, v) = split(mb, x);
                    mb.forward_kinematics(data, &q, &v);
                    mb.update_frame_placements(data);
                },
            ),
            Box::new(
                |mb: &dyn Multibody, data: &mut MultibodyData, x: &DVector<f64>, _u: &DVector<f64>| {
                    let (q, _) = split(mb, x);
                    mb.center_of_mass(data, &q);
                },
            ),
        ]
    }

    /// Compares the analytic derivatives of `cost` against the finite-difference wrapper.
    fn check_against_numdiff(fx: &ArmFixture, cost: Arc<dyn CostModel>) -> CostData {
        let shared = fx.refreshed_data();
        let numdiff = CostModelNumDiff::new(cost.clone())
            .with_reevals(fx.arm.clone(), kinematics_reevals());
        let tol = numdiff.settings().tolerance();

        let mut analytic = cost.create_data();
        cost.calc_diff(&mut analytic, &shared, &fx.x, &fx.u, true).unwrap();
        let mut numeric = numdiff.create_data();
        numdiff
            .calc_diff(&mut numeric, &shared, &fx.x, &fx.u, true)
            .unwrap();

        assert_eq!(analytic.cost, numeric.cost);
        assert!((&analytic.lx - &numeric.lx).amax() < tol, "lx");
        if !numeric.lu.is_empty() {
            assert!((&analytic.lu - &numeric.lu).amax() < tol, "lu");
        }
        assert!(absmax(&(&analytic.rx - &numeric.rx)) < tol, "rx");
        assert!(absmax(&(&analytic.ru - &numeric.ru)) < tol, "ru");
        assert!(absmax(&(&analytic.lxx - &numeric.lxx)) < tol, "lxx");
        assert!(absmax(&(&analytic.lxu - &numeric.lxu)) < tol, "lxu");
        assert!(absmax(&(&analytic.luu - &numeric.luu)) < tol, "luu");
        analytic
    }

    fn end_effector(fx: &ArmFixture) -> usize {
        fx.arm.frame_id("end_effector").unwrap()
    }

    #[test]
    fn frame_translation_matches_numdiff() {
        let fx = ArmFixture::new(1);
        let cost = CostFrameTranslation::new(
            fx.state.clone(),
            end_effector(&fx),
            Vector3::new(0.5, 0.4, 0.3),
            3,
        );
        check_against_numdiff(&fx, Arc::new(cost));
    }

    #[test]
    fn frame_rotation_matches_numdiff() {
        let fx = ArmFixture::new(2);
        let frame = fx.arm.frame_id("link_2").unwrap();
        let current = fx.refreshed_data().frame_placements[frame].rotation;
        let reference = (current * UnitQuaternion::from_euler_angles(0.1, -0.2, 0.7))
            .to_rotation_matrix()
            .into_inner();
        let cost = CostFrameRotation::new(fx.state.clone(), frame, reference, 3);
        check_against_numdiff(&fx, Arc::new(cost));
    }

    #[test]
    fn frame_placement_matches_numdiff() {
        let fx = ArmFixture::new(3);
        let frame = end_effector(&fx);
        let offset = Isometry3::from_parts(
            Translation3::new(0.3, 0.2, 0.1),
            UnitQuaternion::from_euler_angles(0.3, 0.1, -0.4),
        );
        let reference = fx.refreshed_data().frame_placements[frame] * offset;
        let cost = CostFramePlacement::new(fx.state.clone(), frame, reference, 3);
        check_against_numdiff(&fx, Arc::new(cost));
    }

    #[test]
    fn frame_velocity_matches_numdiff() {
        let fx = ArmFixture::new(4);
        let reference = Vector6::new(0.1, -0.2, 0.0, 0.0, 0.0, 0.3);
        let cost =
            CostFrameVelocity::with_reference(fx.state.clone(), end_effector(&fx), reference, 3);
        check_against_numdiff(&fx, Arc::new(cost));
    }

    #[test]
    fn frame_linear_velocity_matches_numdiff() {
        let fx = ArmFixture::new(5);
        let frame = fx.arm.frame_id("link_3").unwrap();
        let cost = CostFrameVelocityLinear::new(fx.state.clone(), frame, 3);
        check_against_numdiff(&fx, Arc::new(cost));
    }

    #[test]
    fn center_of_mass_matches_numdiff() {
        let fx = ArmFixture::new(6);
        let cost = CostCoM::new(fx.state.clone(), Vector3::new(0.1, 0.2, 0.0), 3);
        check_against_numdiff(&fx, Arc::new(cost));
    }

    #[test]
    fn state_regularization_matches_numdiff() {
        let fx = ArmFixture::new(7);
        let weights = DVector::from_vec(vec![1.0, 2.0, 3.0, 0.5, 0.25, 0.1]);
        let cost = CostState::new(fx.state.clone(), fx.state.zero(), 3)
            .unwrap()
            .with_activation(Box::new(ActivationWeightedQuad::new(weights)))
            .unwrap();
        check_against_numdiff(&fx, Arc::new(cost));
    }

    #[test]
    fn control_regularization_matches_numdiff() {
        let fx = ArmFixture::new(8);
        let cost = CostControl::new(fx.state.clone(), 3)
            .with_reference(DVector::from_vec(vec![0.2, -0.1, 0.0]))
            .unwrap();
        check_against_numdiff(&fx, Arc::new(cost));
    }

    fn inequality_state_cost(fx: &ArmFixture, beta: Option<f64>, upper_v: f64) -> CostState {
        let ndx = fx.state.ndx();
        let nv = fx.state.nv();
        let lower = DVector::from_fn(ndx, |i, _| if i < nv { -0.5 } else { f64::NEG_INFINITY });
        let upper = DVector::from_fn(ndx, |i, _| if i < nv { 0.5 } else { upper_v });
        CostState::new(fx.state.clone(), fx.state.zero(), 3)
            .unwrap()
            .with_activation(Box::new(ActivationInequality::new(lower, upper, beta).unwrap()))
            .unwrap()
    }

    #[test]
    fn inequality_state_cost_matches_numdiff() {
        for beta in [Some(1.0), None] {
            let fx = ArmFixture::new(9);
            let cost = inequality_state_cost(&fx, beta, 0.2);
            let data = check_against_numdiff(&fx, Arc::new(cost));
            assert!(data.lx.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn inequality_state_cost_is_flat_inside_bounds() {
        let mut fx = ArmFixture::new(10);
        let cost = inequality_state_cost(&fx, Some(1.0), f64::INFINITY);
        let nv = fx.state.nv();

        fx.x = DVector::from_fn(2 * nv, |i, _| if i < nv { 0.25 } else { 5.0 });
        let shared = fx.refreshed_data();
        let mut data = cost.create_data();
        cost.calc_diff(&mut data, &shared, &fx.x, &fx.u, true).unwrap();
        assert_eq!(data.cost, 0.0);
        assert!(data.lx.iter().all(|&v| v == 0.0));

        fx.x = DVector::from_fn(2 * nv, |i, _| if i < nv { 1.0 } else { 5.0 });
        let shared = fx.refreshed_data();
        cost.calc_diff(&mut data, &shared, &fx.x, &fx.u, true).unwrap();
        assert!(data.cost > 0.0);
        for i in 0..nv {
            assert!(data.lx[i] > 0.0);
            assert_eq!(data.lx[nv + i], 0.0);
        }
    }

    #[test]
    fn weighted_sum_matches_numdiff() {
        let fx = ArmFixture::new(12);
        let mut sum = CostSum::new(fx.state.clone(), 3);
        sum.add_cost(
            "pos",
            Box::new(CostFrameTranslation::new(
                fx.state.clone(),
                end_effector(&fx),
                Vector3::new(0.5, 0.4, 0.3),
                3,
            )),
            10.0,
        )
        .unwrap();
        sum.add_cost(
            "regx",
            Box::new(CostState::new(fx.state.clone(), fx.state.zero(), 3).unwrap()),
            0.1,
        )
        .unwrap();
        sum.add_cost("regu", Box::new(CostControl::new(fx.state.clone(), 3)), 0.01)
            .unwrap();
        check_against_numdiff(&fx, Arc::new(sum));
    }

    #[test]
    fn needs_only_the_quantities_calc_reads() {
        let fx = ArmFixture::new(15);
        let mut shared = fx.arm.create_data();
        fx.arm.forward_kinematics(&mut shared, &fx.q(), &fx.v());
        fx.arm.update_frame_placements(&mut shared);

        let cost: Arc<dyn CostModel> = Arc::new(CostFrameTranslation::new(
            fx.state.clone(),
            end_effector(&fx),
            Vector3::new(0.5, 0.4, 0.3),
            3,
        ));
        let numdiff =
            CostModelNumDiff::new(cost.clone()).with_reevals(fx.arm.clone(), kinematics_reevals());
        let mut numeric = numdiff.create_data();
        numdiff
            .calc_diff(&mut numeric, &shared, &fx.x, &fx.u, true)
            .unwrap();

        let mut analytic = cost.create_data();
        cost.calc_diff(&mut analytic, &fx.refreshed_data(), &fx.x, &fx.u, true)
            .unwrap();
        assert!((&analytic.lx - &numeric.lx).amax() < numdiff.settings().tolerance());
        assert_eq!(analytic.activation.arr, numeric.activation.arr);
    }

    #[test]
    fn centered_differences_agree_with_forward_ones() {
        let fx = ArmFixture::new(13);
        let shared = fx.refreshed_data();
        let cost: Arc<dyn CostModel> = Arc::new(CostFrameTranslation::new(
            fx.state.clone(),
            end_effector(&fx),
            Vector3::zeros(),
            3,
        ));
        let settings = NumDiffSettings {
            centered: true,
            ..NumDiffSettings::default()
        };
        let forward =
            CostModelNumDiff::new(cost.clone()).with_reevals(fx.arm.clone(), kinematics_reevals());
        let centered = CostModelNumDiff::new(cost)
            .with_settings(settings)
            .with_reevals(fx.arm.clone(), kinematics_reevals());

        let mut a = forward.create_data();
        forward.calc_diff(&mut a, &shared, &fx.x, &fx.u, true).unwrap();
        let mut b = centered.create_data();
        centered.calc_diff(&mut b, &shared, &fx.x, &fx.u, true).unwrap();
        assert!((&a.lx - &b.lx).amax() < settings.tolerance());
    }

    #[test]
    fn without_gauss_approx_hessians_are_zero() {
        let fx = ArmFixture::new(14);
        let shared = fx.refreshed_data();
        let settings = NumDiffSettings {
            with_gauss_approx: false,
            ..NumDiffSettings::default()
        };
        let numdiff = CostModelNumDiff::new(Arc::new(CostControl::new(fx.state.clone(), 3)))
            .with_settings(settings);
        let mut data = numdiff.create_data();
        numdiff
            .calc_diff(&mut data, &shared, &fx.x, &fx.u, true)
            .unwrap();
        assert_eq!(absmax(&data.luu), 0.0);
        assert!((&data.lu - &fx.u).amax() < settings.tolerance());
    }
}
