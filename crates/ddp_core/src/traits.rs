use nalgebra::{DMatrix, DVector};
use rand::RngCore;

/// The state representation a shooting problem evolves on.
///
/// States live in a space of dimension `nx` whose tangent space has dimension `ndx`.
/// Every model that compares or perturbs states goes through `diff`/`integrate`
/// rather than plain vector arithmetic, so non-flat configuration spaces are respected.
pub trait StateSpace: Send + Sync {
    /// Dimension of the state vector.
    fn nx(&self) -> usize;

    /// Dimension of the tangent space.
    fn ndx(&self) -> usize;

    /// Dimension of the configuration part of the state.
    fn nq(&self) -> usize;

    /// Dimension of the velocity part of the state.
    fn nv(&self) -> usize;

    fn zero(&self) -> DVector<f64>;

    fn random(&self, rng: &mut dyn RngCore) -> DVector<f64>;

    /// Tangent vector `dx` such that `integrate(x0, dx) == x1`.
    fn diff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> DVector<f64>;

    fn integrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> DVector<f64>;

    /// Jacobians of `diff(x0, x1)` w.r.t. `x0` and `x1`, in that order.
    fn jdiff(&self, x0: &DVector<f64>, x1: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>);

    /// Jacobians of `integrate(x, dx)` w.r.t. `x` and `dx`, in that order.
    fn jintegrate(&self, x: &DVector<f64>, dx: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>);
}
