use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("dimension mismatch in {what}: expected {expected}, got {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("a cost named \"{0}\" is already registered")]
    DuplicateName(String),

    #[error("no cost named \"{0}\" is registered")]
    UnknownName(String),

    /// A kinematic quantity was read before the caller refreshed it for the current state.
    #[error("stale dependency: {0} was not computed for the current configuration")]
    StaleDependency(&'static str),

    #[error("Quu is not positive definite at node {node}")]
    NonPositiveDefinite { node: usize },

    #[error("KKT system is singular at regularization {regularization:e}")]
    SingularSystem { regularization: f64 },

    #[error("line search exhausted every step length without sufficient decrease")]
    LineSearchExhausted,

    #[error("solver diverged: regularization reached {regularization:e}")]
    SolverDiverged { regularization: f64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fails with [`Error::DimensionMismatch`] unless `found == expected`.
pub(crate) fn check_dim(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(Error::DimensionMismatch {
            what,
            expected,
            found,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_dim_reports_both_sizes() {
        assert!(check_dim("weights", 3, 3).is_ok());
        let err = check_dim("weights", 3, 4).expect_err("expected mismatch");
        let message = format!("{err}");
        assert!(message.contains("weights"));
        assert!(message.contains("expected 3, got 4"));
    }
}
