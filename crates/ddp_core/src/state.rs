use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use rand::{Rng, RngCore};

use crate::multibody::Multibody;
use crate::traits::StateSpace;

/// Flat Euclidean state: `diff` is subtraction and `integrate` is addition.
#[derive(Debug, Clone)]
pub struct StateVector {
    nx: usize,
}

impl StateVector {
    pub fn new(nx: usize) -> Self {
        Self { nx }
    }
}

impl StateSpace for StateVector {
    fn nx(&self) -> usize {
        self.nx
    }

    fn ndx(&self) -> usize {
        self.nx
    }

    fn nq(&self) -> usize {
        self.nx
    }

    fn nv(&self) -> usize {
        0
    }

    fn zero(&self) -> DVector<f64> {
        DVector::zeros(self.nx)
    }

    fn random(&self, rng: &mut dyn RngCore) -> DVector<f64> {
        DVector::from_fn(self.nx, |_, _| rng.gen_range(-1.0..1.0))
    }

    fn diff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DVector<f64> {
        x1 - x0
    }

    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64> {
        x + dx
    }

    fn jdiff(&self, _x0: &DVector<f64>, _x1: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let eye = DMatrix::identity(self.nx, self.nx);
        (-eye.clone(), eye)
    }

    fn jintegrate(&self, _x: &DVector<f64>, _dx: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let eye = DMatrix::identity(self.nx, self.nx);
        (eye.clone(), eye)
    }
}

/// State `x = [q; v]` of an articulated body.
///
/// The configuration part is handled by the multibody engine (which knows the joint
/// manifolds); the velocity part is always Euclidean.
#[derive(Clone)]
pub struct StateMultibody {
    multibody: Arc<dyn Multibody>,
}

impl StateMultibody {
    pub fn new(multibody: Arc<dyn Multibody>) -> Self {
        Self { multibody }
    }

    pub fn multibody(&self) -> &Arc<dyn Multibody> {
        &self.multibody
    }

    /// Splits a state into its configuration and velocity parts.
    pub fn split(&self, x: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let nq = self.multibody.nq();
        let nv = self.multibody.nv();
        (x.rows(0, nq).into_owned(), x.rows(nq, nv).into_owned())
    }
}

impl StateSpace for StateMultibody {
    fn nx(&self) -> usize {
        self.multibody.nq() + self.multibody.nv()
    }

    fn ndx(&self) -> usize {
        2 * self.multibody.nv()
    }

    fn nq(&self) -> usize {
        self.multibody.nq()
    }

    fn nv(&self) -> usize {
        self.multibody.nv()
    }

    fn zero(&self) -> DVector<f64> {
        let q = self.multibody.neutral_configuration();
        let mut x = DVector::zeros(self.nx());
        x.rows_mut(0, q.len()).copy_from(&q);
        x
    }

    fn random(&self, rng: &mut dyn RngCore) -> DVector<f64> {
        let q = self.multibody.random_configuration(rng);
        let nq = q.len();
        let mut x = DVector::zeros(self.nx());
        x.rows_mut(0, nq).copy_from(&q);
        for i in nq..x.len() {
            x[i] = rng.gen_range(-1.0..1.0);
        }
        x
    }

    fn diff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DVector<f64> {
        let (q0, v0) = self.split(x0);
        let (q1, v1) = self.split(x1);
        let nv = self.multibody.nv();
        let mut dx = DVector::zeros(2 * nv);
        dx.rows_mut(0, nv)
            .copy_from(&self.multibody.difference_configuration(&q0, &q1));
        dx.rows_mut(nv, nv).copy_from(&(v1 - v0));
        dx
    }

    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64> {
        let (q, v) = self.split(x);
        let nq = self.multibody.nq();
        let nv = self.multibody.nv();
        let dq = dx.rows(0, nv).into_owned();
        let mut out = DVector::zeros(self.nx());
        out.rows_mut(0, nq)
            .copy_from(&self.multibody.integrate_configuration(&q, &dq));
        out.rows_mut(nq, nv).copy_from(&(v + dx.rows(nv, nv)));
        out
    }

    fn jdiff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let (q0, _) = self.split(x0);
        let (q1, _) = self.split(x1);
        let nv = self.multibody.nv();
        let (jq0, jq1) = self.multibody.difference_configuration_jacobians(&q0, &q1);
        let mut j0 = DMatrix::zeros(2 * nv, 2 * nv);
        let mut j1 = DMatrix::zeros(2 * nv, 2 * nv);
        j0.view_mut((0, 0), (nv, nv)).copy_from(&jq0);
        j1.view_mut((0, 0), (nv, nv)).copy_from(&jq1);
        for i in 0..nv {
            j0[(nv + i, nv + i)] = -1.0;
            j1[(nv + i, nv + i)] = 1.0;
        }
        (j0, j1)
    }

    fn jintegrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let (q, _) = self.split(x);
        let nv = self.multibody.nv();
        let dq = dx.rows(0, nv).into_owned();
        let (jq, jdq) = self.multibody.integrate_configuration_jacobians(&q, &dq);
        let mut jx = DMatrix::zeros(2 * nv, 2 * nv);
        let mut jdx = DMatrix::zeros(2 * nv, 2 * nv);
        jx.view_mut((0, 0), (nv, nv)).copy_from(&jq);
        jdx.view_mut((0, 0), (nv, nv)).copy_from(&jdq);
        for i in 0..nv {
            jx[(nv + i, nv + i)] = 1.0;
            jdx[(nv + i, nv + i)] = 1.0;
        }
        (jx, jdx)
    }
}
