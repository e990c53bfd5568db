//! Element-wise penalty shapes applied to residual vectors.
//!
//! An activation turns a residual `r` into a scalar `a(r)` together with its gradient
//! `Ar` and a diagonal Hessian `Arr` (stored as a vector).

use std::fmt::Debug;

use nalgebra::DVector;

use crate::error::{check_dim, Error, Result};

/// Scratch written by an activation model.
#[derive(Debug, Clone)]
pub struct ActivationData {
    pub a_value: f64,
    pub ar: DVector<f64>,
    /// Diagonal of the Hessian.
    pub arr: DVector<f64>,
    cache: DVector<f64>,
}

impl ActivationData {
    pub fn new(nr: usize) -> Self {
        Self {
            a_value: 0.0,
            ar: DVector::zeros(nr),
            arr: DVector::zeros(nr),
            cache: DVector::zeros(nr),
        }
    }
}

pub trait ActivationModel: Debug + Send + Sync {
    /// Residual dimension the activation accepts.
    fn nr(&self) -> usize;

    fn create_data(&self) -> ActivationData {
        ActivationData::new(self.nr())
    }

    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> Result<()>;

    /// Writes `Ar` and `Arr`. With `recalc == false` the values cached by the last
    /// `calc` on the same `r` are reused.
    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>, recalc: bool) -> Result<()>;
}

/// `a(r) = ½‖r‖²`.
#[derive(Debug, Clone)]
pub struct ActivationQuad {
    nr: usize,
}

impl ActivationQuad {
    pub fn new(nr: usize) -> Self {
        Self { nr }
    }
}

impl ActivationModel for ActivationQuad {
    fn nr(&self) -> usize {
        self.nr
    }

    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> Result<()> {
        check_dim("quadratic activation residual", self.nr, r.len())?;
        data.a_value = 0.5 * r.norm_squared();
        Ok(())
    }

    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>, recalc: bool) -> Result<()> {
        if recalc {
            self.calc(data, r)?;
        }
        check_dim("quadratic activation residual", self.nr, r.len())?;
        data.ar.copy_from(r);
        data.arr.fill(1.0);
        Ok(())
    }
}

/// `a(r) = ½ Σ wᵢ rᵢ²` with fixed per-element weights.
#[derive(Debug, Clone)]
pub struct ActivationWeightedQuad {
    weights: DVector<f64>,
}

impl ActivationWeightedQuad {
    pub fn new(weights: DVector<f64>) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// Replacing the weights may not change the residual dimension.
    pub fn set_weights(&mut self, weights: DVector<f64>) -> Result<()> {
        check_dim("activation weights", self.weights.len(), weights.len())?;
        self.weights = weights;
        Ok(())
    }
}

impl ActivationModel for ActivationWeightedQuad {
    fn nr(&self) -> usize {
        self.weights.len()
    }

    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> Result<()> {
        check_dim("activation weights", r.len(), self.weights.len())?;
        data.a_value = 0.5 * r.component_mul(r).dot(&self.weights);
        Ok(())
    }

    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>, recalc: bool) -> Result<()> {
        if recalc {
            self.calc(data, r)?;
        }
        check_dim("activation weights", r.len(), self.weights.len())?;
        data.ar = self.weights.component_mul(r);
        data.arr.copy_from(&self.weights);
        Ok(())
    }
}

/// `a(r) = Σ √(1 + rᵢ²)`, a robust penalty that grows linearly away from zero.
#[derive(Debug, Clone)]
pub struct ActivationSmoothAbs {
    nr: usize,
}

impl ActivationSmoothAbs {
    pub fn new(nr: usize) -> Self {
        Self { nr }
    }
}

impl ActivationModel for ActivationSmoothAbs {
    fn nr(&self) -> usize {
        self.nr
    }

    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> Result<()> {
        check_dim("smooth-abs activation residual", self.nr, r.len())?;
        data.cache = r.map(|ri| (1.0 + ri * ri).sqrt());
        data.a_value = data.cache.sum();
        Ok(())
    }

    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>, recalc: bool) -> Result<()> {
        if recalc {
            self.calc(data, r)?;
        }
        check_dim("smooth-abs activation residual", self.nr, r.len())?;
        data.ar = r.component_div(&data.cache);
        data.arr = data.cache.map(|s| 1.0 / (s * s * s));
        Ok(())
    }
}

/// Zero inside the box `lower ≤ r ≤ upper`, positive and increasing outside it.
///
/// The penalty on a bound violation `d > 0` is `d²/2` for the hard variant. The
/// smoothed variant is the Huber shape: `d²/(2β)` up to `d = β`, then the matching
/// line `d − β/2`. Its gradient grows linearly from the boundary, so any violation
/// yields a nonzero gradient. A non-finite bound disables its side.
#[derive(Debug, Clone)]
pub struct ActivationInequality {
    lower: DVector<f64>,
    upper: DVector<f64>,
    beta: Option<f64>,
}

impl ActivationInequality {
    pub fn new(lower: DVector<f64>, upper: DVector<f64>, beta: Option<f64>) -> Result<Self> {
        check_dim("inequality bounds", lower.len(), upper.len())?;
        if lower.iter().zip(upper.iter()).any(|(l, u)| l > u) {
            return Err(Error::InvalidArgument(
                "inequality lower bound exceeds upper bound".into(),
            ));
        }
        if let Some(beta) = beta {
            if !(beta > 0.0 && beta.is_finite()) {
                return Err(Error::InvalidArgument(format!(
                    "smoothing parameter beta must be positive and finite, got {beta}"
                )));
            }
        }
        Ok(Self { lower, upper, beta })
    }

    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    pub fn beta(&self) -> Option<f64> {
        self.beta
    }

    /// Signed violation of element `i`: negative below the box, positive above, zero inside.
    fn violation(&self, i: usize, ri: f64) -> f64 {
        let (lo, hi) = (self.lower[i], self.upper[i]);
        if lo.is_finite() && ri < lo {
            ri - lo
        } else if hi.is_finite() && ri > hi {
            ri - hi
        } else {
            0.0
        }
    }

    /// Penalty and its first two derivatives for a violation magnitude `d ≥ 0`.
    fn penalty(&self, d: f64) -> (f64, f64, f64) {
        match self.beta {
            None => (0.5 * d * d, d, 1.0),
            Some(beta) if d <= beta => (0.5 * d * d / beta, d / beta, 1.0 / beta),
            Some(beta) => (d - 0.5 * beta, 1.0, 0.0),
        }
    }
}

impl ActivationModel for ActivationInequality {
    fn nr(&self) -> usize {
        self.lower.len()
    }

    fn calc(&self, data: &mut ActivationData, r: &DVector<f64>) -> Result<()> {
        check_dim("inequality activation residual", self.nr(), r.len())?;
        data.a_value = 0.0;
        for (i, &ri) in r.iter().enumerate() {
            let signed = self.violation(i, ri);
            data.cache[i] = signed;
            if signed != 0.0 {
                data.a_value += self.penalty(signed.abs()).0;
            }
        }
        Ok(())
    }

    fn calc_diff(&self, data: &mut ActivationData, r: &DVector<f64>, recalc: bool) -> Result<()> {
        if recalc {
            self.calc(data, r)?;
        }
        check_dim("inequality activation residual", self.nr(), r.len())?;
        for i in 0..r.len() {
            let signed = data.cache[i];
            if signed == 0.0 {
                data.ar[i] = 0.0;
                data.arr[i] = 0.0;
            } else {
                let (_, d1, d2) = self.penalty(signed.abs());
                data.ar[i] = d1 * signed.signum();
                data.arr[i] = d2;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-6;

    fn residual() -> DVector<f64> {
        DVector::from_vec(vec![0.9, -0.2, 1.7, -1.3, 0.05])
    }

    /// Checks `Ar` against central differences of `a` and `Arr` against central
    /// differences of `Ar`.
    fn assert_derivatives_consistent(model: &dyn ActivationModel, r: &DVector<f64>) {
        let mut data = model.create_data();
        model.calc_diff(&mut data, r, true).expect("calc_diff");
        let mut scratch = model.create_data();
        for i in 0..r.len() {
            let mut rp = r.clone();
            let mut rm = r.clone();
            rp[i] += EPS;
            rm[i] -= EPS;
            model.calc_diff(&mut scratch, &rp, true).unwrap();
            let (ap, arp) = (scratch.a_value, scratch.ar[i]);
            model.calc_diff(&mut scratch, &rm, true).unwrap();
            let (am, arm) = (scratch.a_value, scratch.ar[i]);
            let grad = (ap - am) / (2.0 * EPS);
            let hess = (arp - arm) / (2.0 * EPS);
            assert!(
                (grad - data.ar[i]).abs() < 100.0 * EPS,
                "gradient {i}: fd {grad} vs analytic {}",
                data.ar[i]
            );
            assert!(
                (hess - data.arr[i]).abs() < 100.0 * EPS,
                "hessian {i}: fd {hess} vs analytic {}",
                data.arr[i]
            );
        }
    }

    #[test]
    fn quadratic_derivatives_are_consistent() {
        let model = ActivationQuad::new(5);
        assert_derivatives_consistent(&model, &residual());
        let mut data = model.create_data();
        model.calc(&mut data, &residual()).unwrap();
        assert!((data.a_value - 0.5 * residual().norm_squared()).abs() < 1e-15);
    }

    #[test]
    fn weighted_quadratic_derivatives_are_consistent() {
        let weights = DVector::from_vec(vec![2.0, 0.5, 1.0, 3.0, 0.1]);
        let model = ActivationWeightedQuad::new(weights.clone());
        assert_derivatives_consistent(&model, &residual());
        let mut data = model.create_data();
        model.calc_diff(&mut data, &residual(), true).unwrap();
        assert_eq!(data.arr, weights);
    }

    #[test]
    fn weighted_quadratic_rejects_wrong_length() {
        let model = ActivationWeightedQuad::new(DVector::from_vec(vec![1.0, 2.0]));
        let mut data = model.create_data();
        let err = model
            .calc(&mut data, &residual())
            .expect_err("expected mismatch");
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        let mut model = model;
        assert!(model.set_weights(DVector::from_vec(vec![1.0])).is_err());
    }

    #[test]
    fn smooth_abs_derivatives_are_consistent() {
        let model = ActivationSmoothAbs::new(5);
        assert_derivatives_consistent(&model, &residual());
        let big = DVector::from_vec(vec![1e6, -1e6, 0.0, 1e-9, 3.0]);
        let mut data = model.create_data();
        model.calc_diff(&mut data, &big, true).unwrap();
        assert!(data.ar.iter().all(|v| v.is_finite()));
        assert!(data.arr.iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn inequality_derivatives_are_consistent_for_both_variants() {
        let lower = DVector::from_element(5, -0.5);
        let upper = DVector::from_element(5, 0.5);
        for beta in [None, Some(1.0), Some(0.3)] {
            let model = ActivationInequality::new(lower.clone(), upper.clone(), beta).unwrap();
            assert_derivatives_consistent(&model, &residual());
        }
    }

    #[test]
    fn inequality_is_flat_inside_and_active_outside() {
        let lower = DVector::from_element(4, 0.3);
        let upper = DVector::from_element(4, 0.7);
        let r = DVector::from_vec(vec![0.5, 0.3, 0.1, 0.95]);
        for beta in [None, Some(1.0)] {
            let model = ActivationInequality::new(lower.clone(), upper.clone(), beta).unwrap();
            let mut data = model.create_data();
            model.calc_diff(&mut data, &r, true).unwrap();
            assert_eq!(data.ar[0], 0.0);
            assert_eq!(data.ar[1], 0.0);
            assert!(data.ar[2] < 0.0);
            assert!(data.ar[3] > 0.0);
            assert!(data.a_value > 0.0);
        }
    }

    #[test]
    fn inequality_ignores_infinite_bounds() {
        let lower = DVector::from_vec(vec![f64::NEG_INFINITY, 0.0, -1.0]);
        let upper = DVector::from_vec(vec![1.0, f64::INFINITY, f64::INFINITY]);
        let r = DVector::from_vec(vec![-1e9, 1e9, 2.0]);
        for beta in [None, Some(0.5)] {
            let model = ActivationInequality::new(lower.clone(), upper.clone(), beta).unwrap();
            let mut data = model.create_data();
            model.calc_diff(&mut data, &r, true).unwrap();
            assert_eq!(data.a_value, 0.0);
            assert!(data.ar.iter().all(|v| *v == 0.0));
            assert!(data.arr.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn inequality_rejects_crossed_bounds_and_bad_beta() {
        let lower = DVector::from_vec(vec![1.0]);
        let upper = DVector::from_vec(vec![0.0]);
        assert!(ActivationInequality::new(lower, upper, None).is_err());
        let lower = DVector::from_vec(vec![0.0]);
        let upper = DVector::from_vec(vec![1.0]);
        assert!(ActivationInequality::new(lower, upper, Some(0.0)).is_err());
    }

    #[test]
    fn inequality_gradient_survives_tiny_violations() {
        let lower = DVector::from_vec(vec![0.0, 0.0]);
        let upper = DVector::from_vec(vec![1.0, 1.0]);
        let r = DVector::from_vec(vec![-1e-170, 1.0 + 3e-16]);
        for beta in [None, Some(1.0)] {
            let model = ActivationInequality::new(lower.clone(), upper.clone(), beta).unwrap();
            let mut data = model.create_data();
            model.calc_diff(&mut data, &r, true).unwrap();
            assert!(data.ar[0] < 0.0, "beta {beta:?}: {}", data.ar);
            assert!(data.ar[1] > 0.0, "beta {beta:?}: {}", data.ar);
            assert!(data.arr.iter().all(|v| *v > 0.0));
        }
    }

    #[test]
    fn calc_then_cached_diff_matches_fresh_diff() {
        let inequality = ActivationInequality::new(
            DVector::from_element(5, -0.5),
            DVector::from_element(5, 0.5),
            Some(0.6),
        )
        .unwrap();
        let smooth_abs = ActivationSmoothAbs::new(5);
        let models: [&dyn ActivationModel; 2] = [&smooth_abs, &inequality];
        let r = residual();
        for model in models {
            let mut cached = model.create_data();
            model.calc(&mut cached, &r).unwrap();
            model.calc_diff(&mut cached, &r, false).unwrap();
            let mut fresh = model.create_data();
            model.calc_diff(&mut fresh, &r, true).unwrap();
            assert_eq!(cached.ar, fresh.ar);
            assert_eq!(cached.arr, fresh.arr);
            assert_eq!(cached.a_value, fresh.a_value);
        }
    }
}
