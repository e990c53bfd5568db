//! `ddp_core` builds and solves finite-horizon optimal control problems for articulated
//! robots with differential dynamic programming.
//!
//! Key components:
//! - **Traits**: `StateSpace` (state manifold with `diff`/`integrate`), `Multibody`
//!   (rigid-body dynamics engine behind a per-context scratch object).
//! - **Activations and costs**: residual-based cost terms with Gauss-Newton expansions,
//!   aggregated in a named, weighted `CostSum`.
//! - **Actions**: continuous forward dynamics, their explicit Euler discretization and
//!   a linear-quadratic reference model.
//! - **Numdiff**: finite-difference wrappers that validate analytic derivatives.
//! - **Solvers**: the DDP solver and a dense KKT solver used as its reference.
pub mod actions;
pub mod activation;
pub mod costs;
pub mod error;
pub mod lie;
pub mod multibody;
pub mod numdiff;
pub mod problem;
pub mod solvers;
pub mod state;
pub mod traits;

pub use error::{Error, Result};
pub use problem::{ProblemData, ShootingProblem};
pub use solvers::{SolveReport, SolveStatus, Solver, SolverDdp, SolverKkt, SolverSettings};
