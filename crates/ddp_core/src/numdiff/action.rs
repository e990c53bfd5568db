use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use super::NumDiffSettings;
use crate::actions::{
    ActionData, ActionModel, DifferentialActionData, DifferentialActionModel,
};
use crate::costs::gauss_newton;
use crate::error::Result;
use crate::traits::StateSpace;

/// Outputs of one perturbed evaluation: the propagated quantity, the cost and the residual.
type Sample = (DVector<f64>, f64, DVector<f64>);

/// Difference quotients for one tangent direction.
struct Column {
    f: DVector<f64>,
    l: f64,
    r: DVector<f64>,
}

/// `(plus ⊖ minus) / span`, where `delta` measures the gap between two outputs.
fn quotient(
    plus: &Sample,
    minus: &Sample,
    span: f64,
    delta: &dyn Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64>,
) -> Column {
    Column {
        f: delta(&minus.0, &plus.0) / span,
        l: (plus.1 - minus.1) / span,
        r: (&plus.2 - &minus.2) / span,
    }
}

/// Jacobians shared by the discrete and the continuous wrappers.
struct Estimate {
    fx: DMatrix<f64>,
    fu: DMatrix<f64>,
    lx: DVector<f64>,
    lu: DVector<f64>,
    rx: DMatrix<f64>,
    ru: DMatrix<f64>,
}

/// Differences `sample` along every state and control direction around `nominal`.
#[allow(clippy::too_many_arguments)]
fn estimate(
    settings: &NumDiffSettings,
    state: &dyn StateSpace,
    nu: usize,
    nominal: &Sample,
    x: &DVector<f64>,
    u: &DVector<f64>,
    sample: &mut dyn FnMut(&DVector<f64>, &DVector<f64>) -> Result<Sample>,
    delta: &dyn Fn(&DVector<f64>, &DVector<f64>) -> DVector<f64>,
) -> Result<Estimate> {
    let (ndx, nf, nr) = (state.ndx(), delta(&nominal.0, &nominal.0).len(), nominal.2.len());
    let span = settings.span();
    let mut out = Estimate {
        fx: DMatrix::zeros(nf, ndx),
        fu: DMatrix::zeros(nf, nu),
        lx: DVector::zeros(ndx),
        lu: DVector::zeros(nu),
        rx: DMatrix::zeros(nr, ndx),
        ru: DMatrix::zeros(nr, nu),
    };
    for i in 0..ndx {
        let plus = sample(&settings.perturb_state(state, x, i, 1.0), u)?;
        let minus = if settings.centered {
            sample(&settings.perturb_state(state, x, i, -1.0), u)?
        } else {
            nominal.clone()
        };
        let col = quotient(&plus, &minus, span, delta);
        out.fx.set_column(i, &col.f);
        out.lx[i] = col.l;
        out.rx.set_column(i, &col.r);
    }
    for i in 0..nu {
        let plus = sample(x, &settings.perturb_control(u, i, 1.0))?;
        let minus = if settings.centered {
            sample(x, &settings.perturb_control(u, i, -1.0))?
        } else {
            nominal.clone()
        };
        let col = quotient(&plus, &minus, span, delta);
        out.fu.set_column(i, &col.f);
        out.lu[i] = col.l;
        out.ru.set_column(i, &col.r);
    }
    Ok(out)
}

/// Second-order blocks for the wrapped model's residual, or zeros without one.
fn hessians(
    settings: &NumDiffSettings,
    est: &Estimate,
    arr: &DVector<f64>,
) -> (DMatrix<f64>, DMatrix<f64>, DMatrix<f64>) {
    if settings.with_gauss_approx && !arr.is_empty() {
        gauss_newton(&est.rx, &est.ru, arr)
    } else {
        let (ndx, nu) = (est.lx.len(), est.lu.len());
        (
            DMatrix::zeros(ndx, ndx),
            DMatrix::zeros(ndx, nu),
            DMatrix::zeros(nu, nu),
        )
    }
}

/// Finite-difference derivatives of a discrete action model.
///
/// `Fx` is differenced through the state chart, `(x⁺(x ⊕ h·eᵢ) ⊖ x⁺(x)) / h`.
pub struct ActionModelNumDiff {
    model: Arc<dyn ActionModel>,
    settings: NumDiffSettings,
}

impl ActionModelNumDiff {
    pub fn new(model: Arc<dyn ActionModel>) -> Self {
        Self {
            model,
            settings: NumDiffSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: NumDiffSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &NumDiffSettings {
        &self.settings
    }

    pub fn model(&self) -> &Arc<dyn ActionModel> {
        &self.model
    }
}

impl ActionModel for ActionModelNumDiff {
    fn state(&self) -> &Arc<dyn StateSpace> {
        self.model.state()
    }

    fn nu(&self) -> usize {
        self.model.nu()
    }

    fn nr(&self) -> usize {
        self.model.nr()
    }

    fn create_data(&self) -> ActionData {
        self.model.create_data()
    }

    fn calc(&self, data: &mut ActionData, x: &DVector<f64>, u: &DVector<f64>) -> Result<()> {
        self.model.calc(data, x, u)
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
        let state = self.model.state().clone();
        let nominal = (data.xnext.clone(), data.cost, data.r.clone());

        self.model.calc_activation_diff(data)?;
        let arr = data.arr.clone();
        let mut perturbed = self.model.create_data();

        let model = &self.model;
        let mut sample = |xp: &DVector<f64>, up: &DVector<f64>| -> Result<Sample> {
            model.calc(&mut perturbed, xp, up)?;
            Ok((perturbed.xnext.clone(), perturbed.cost, perturbed.r.clone()))
        };
        let chart = state.clone();
        let delta = move |from: &DVector<f64>, to: &DVector<f64>| chart.diff(from, to);
        let est = estimate(
            &self.settings,
            state.as_ref(),
            self.nu(),
            &nominal,
            x,
            u,
            &mut sample,
            &delta,
        )?;

        let (lxx, lxu, luu) = hessians(&self.settings, &est, &arr);
        data.fx = est.fx;
        data.fu = est.fu;
        data.lx = est.lx;
        data.lu = est.lu;
        data.rx = est.rx;
        data.ru = est.ru;
        data.lxx = lxx;
        data.lxu = lxu;
        data.luu = luu;
        Ok(())
    }

    fn calc_activation_diff(&self, data: &mut ActionData) -> Result<()> {
        self.model.calc_activation_diff(data)
    }
}

/// Finite-difference derivatives of a differential action model.
pub struct DifferentialActionModelNumDiff {
    model: Arc<dyn DifferentialActionModel>,
    settings: NumDiffSettings,
}

impl DifferentialActionModelNumDiff {
    pub fn new(model: Arc<dyn DifferentialActionModel>) -> Self {
        Self {
            model,
            settings: NumDiffSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: NumDiffSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &NumDiffSettings {
        &self.settings
    }
}

impl DifferentialActionModel for DifferentialActionModelNumDiff {
    fn state(&self) -> &Arc<dyn StateSpace> {
        self.model.state()
    }

    fn nu(&self) -> usize {
        self.model.nu()
    }

    fn nr(&self) -> usize {
        self.model.nr()
    }

    fn create_data(&self) -> DifferentialActionData {
        self.model.create_data()
    }

    fn calc(
        &self,
        data: &mut DifferentialActionData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        self.model.calc(data, x, u)
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
        let state = self.model.state().clone();
        let nominal = (data.xout.clone(), data.cost, data.r.clone());

        self.model.calc_activation_diff(data)?;
        let arr = data.arr.clone();
        let mut perturbed = self.model.create_data();

        let model = &self.model;
        let mut sample = |xp: &DVector<f64>, up: &DVector<f64>| -> Result<Sample> {
            model.calc(&mut perturbed, xp, up)?;
            Ok((perturbed.xout.clone(), perturbed.cost, perturbed.r.clone()))
        };
        // The acceleration lives in a vector space.
        let delta = |from: &DVector<f64>, to: &DVector<f64>| to - from;
        let est = estimate(
            &self.settings,
            state.as_ref(),
            self.nu(),
            &nominal,
            x,
            u,
            &mut sample,
            &delta,
        )?;

        let (lxx, lxu, luu) = hessians(&self.settings, &est, &arr);
        data.fx = est.fx;
        data.fu = est.fu;
        data.lx = est.lx;
        data.lu = est.lu;
        data.rx = est.rx;
        data.ru = est.ru;
        data.lxx = lxx;
        data.lxu = lxu;
        data.luu = luu;
        Ok(())
    }

    fn calc_activation_diff(&self, data: &mut DifferentialActionData) -> Result<()> {
        self.model.calc_activation_diff(data)
    }
}
