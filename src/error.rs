use thiserror::Error;

/// Ways a single Gaussian fit can fail.
///
/// Every variant is local to one fit call: nothing is retained, and the
/// caller decides whether to retry with another initial guess, skip the
/// scan, or abort a batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    /// The field carries no usable signal (empty, non-finite, or all zero).
    #[error("degenerate input: {0}")]
    DegenerateInput(String),

    /// The iteration budget ran out before the solver tolerances were met.
    #[error("fit did not converge after {iterations} iterations (cost {cost:.3e})")]
    DidNotConverge { iterations: usize, cost: f64 },

    /// JᵀJ became rank-deficient, so some parameters are not constrained by the data.
    #[error("singular Jacobian: parameters are not constrained by the data")]
    SingularJacobian,
}
