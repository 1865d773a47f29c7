//! Levenberg-Marquardt refinement of a 2D Gaussian.
//!
//! Minimizes `Σ (f(x, y) - field[x, y])²` over every grid point, varying all
//! parameters of [`GaussianParameters`] at once. The grid is the field's
//! integer index grid (`x` = row, `y` = column); converting the result to
//! physical units is left to the caller (see [`GaussianParameters::to_physical`]).
//!
//! ## Algorithm
//!
//! 1. Accumulate the normal equations `JᵀJ` and `Jᵀr` from the analytic
//!    Jacobian (6 parameters, or 7 when a correlation is being fitted).
//! 2. Reject the problem if the column-normalized `JᵀJ` is rank-deficient.
//! 3. Solve `(JᵀJ + λ·diag(JᵀJ)) δ = Jᵀr` by Cholesky; accept the step if
//!    it lowers the cost (and relax λ), otherwise stiffen λ and retry.
//! 4. Stop when the step or the relative cost decrease falls below tolerance,
//!    when the residual vanishes, or when no damping yields a descent.
//!
//! Everything runs in f64 with no randomness, so identical inputs give
//! bit-identical results.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::FitError;
use crate::estimate::validate_field;
use crate::fit::GaussianFit;
use crate::gaussian::GaussianParameters;
use crate::IntensityField;

// Parameter vector layout
const AMP: usize = 0;
const CX: usize = 1;
const CY: usize = 2;
const SX: usize = 3;
const SY: usize = 4;
const BASE: usize = 5;
const RHO: usize = 6;

/// |ρ| is kept strictly inside (-1, 1).
const MAX_CORRELATION: f64 = 0.99;

/// Configuration for the Levenberg-Marquardt refiner.
#[derive(Debug, Clone)]
pub struct RefineConfig {
    /// Maximum number of Jacobian evaluations. Bounding this is also how a
    /// batch driver caps the time spent on one scan.
    /// Default: 200
    pub max_iterations: usize,

    /// Converged when `‖δ‖ ≤ x_tolerance · (‖p‖ + x_tolerance)`.
    /// Default: 1e-10
    pub x_tolerance: f64,

    /// Converged when an accepted step lowers the cost by at most this
    /// fraction.
    /// Default: 1e-12
    pub f_tolerance: f64,

    /// `JᵀJ` is treated as singular when the smallest singular value of its
    /// column-normalized form is at most this.
    /// Default: 1e-12
    pub singular_tolerance: f64,

    /// Initial damping factor λ.
    /// Default: 1e-3
    pub initial_lambda: f64,

    /// λ multiplier after a rejected step.
    /// Default: 10.0
    pub lambda_up: f64,

    /// λ multiplier after an accepted step.
    /// Default: 0.1
    pub lambda_down: f64,

    /// Damping beyond which no descent direction exists; the current point
    /// is then a stationary point.
    /// Default: 1e16
    pub max_lambda: f64,

    /// Smallest sigma the solver may step to.
    /// Default: 1e-6
    pub sigma_floor: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            x_tolerance: 1e-10,
            f_tolerance: 1e-12,
            singular_tolerance: 1e-12,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1e16,
            sigma_floor: 1e-6,
        }
    }
}

/// Refine `initial` against `field` by nonlinear least squares.
///
/// The elliptical model is fitted when `initial.correlation` is a nonzero
/// `Some`; otherwise the axis-aligned model is fitted and the result has no
/// correlation. The field is only read.
///
/// # Errors
///
/// * [`FitError::DegenerateInput`] for an empty or non-finite field, fewer
///   samples than parameters, or an unusable initial guess
/// * [`FitError::SingularJacobian`] when the data cannot constrain every
///   parameter (e.g. a perfectly flat field)
/// * [`FitError::DidNotConverge`] when `max_iterations` is exhausted
pub fn refine(
    field: &IntensityField,
    initial: &GaussianParameters,
    config: &RefineConfig,
) -> Result<GaussianFit, FitError> {
    validate_field(field)?;
    validate_initial(initial)?;

    let correlated = initial.is_correlated();
    let np = if correlated { 7 } else { 6 };
    let n = field.len();
    if n < np {
        return Err(FitError::DegenerateInput(format!(
            "{n} samples cannot constrain {np} parameters"
        )));
    }

    let mut params = pack(initial, correlated);
    constrain(&mut params, correlated, config);
    let mut cost = compute_cost(field, &unpack(&params, correlated));
    let mut lambda = config.initial_lambda;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..config.max_iterations {
        iterations = iter + 1;

        let current = unpack(&params, correlated);
        let (jtj, jtr) = normal_equations(field, &current, np);

        if is_singular(&jtj, config.singular_tolerance) {
            debug!("Gaussian refine: singular normal equations at iteration {}, aborting", iterations);
            return Err(FitError::SingularJacobian);
        }

        if cost == 0.0 {
            converged = true;
            break;
        }

        // Inner loop: stiffen λ until a step lowers the cost
        loop {
            let mut damped = jtj.clone();
            for i in 0..np {
                damped[(i, i)] += lambda * jtj[(i, i)];
            }

            let Some(chol) = damped.cholesky() else {
                lambda *= config.lambda_up;
                if lambda > config.max_lambda {
                    converged = true;
                    break;
                }
                continue;
            };
            let delta = chol.solve(&jtr);

            let mut trial = &params + &delta;
            constrain(&mut trial, correlated, config);
            let trial_cost = compute_cost(field, &unpack(&trial, correlated));

            if trial_cost.is_finite() && trial_cost < cost {
                let step = (&trial - &params).norm();
                let decrease = (cost - trial_cost) / cost;
                let scale = params.norm();

                params = trial;
                cost = trial_cost;
                lambda = (lambda * config.lambda_down).max(f64::MIN_POSITIVE);

                if step <= config.x_tolerance * (scale + config.x_tolerance)
                    || decrease <= config.f_tolerance
                {
                    converged = true;
                }
                break;
            }

            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                // No damping produces a descent: stationary point
                converged = true;
                break;
            }
        }

        if converged {
            break;
        }
    }

    if !converged {
        debug!(
            "Gaussian refine: no convergence after {} iterations, cost {:.3e}",
            iterations, cost
        );
        return Err(FitError::DidNotConverge { iterations, cost });
    }

    let params = unpack(&params, correlated);
    debug!(
        "Gaussian refine: converged in {} iterations, cost {:.3e}, center ({:.4}, {:.4}), sigma ({:.4}, {:.4})",
        iterations, cost, params.center_x, params.center_y, params.sigma_x, params.sigma_y
    );

    Ok(GaussianFit {
        params,
        iterations,
        cost,
        rms_residual: (cost / n as f64).sqrt(),
    })
}

// ── Internal helpers ────────────────────────────────────────────────────────

fn validate_initial(p: &GaussianParameters) -> Result<(), FitError> {
    let values = [
        p.amplitude,
        p.center_x,
        p.center_y,
        p.sigma_x,
        p.sigma_y,
        p.baseline,
        p.correlation.unwrap_or(0.0),
    ];
    if values.iter().any(|v| !v.is_finite()) {
        return Err(FitError::DegenerateInput(format!(
            "initial guess has non-finite parameters: {p:?}"
        )));
    }
    if p.sigma_x <= 0.0 || p.sigma_y <= 0.0 {
        return Err(FitError::DegenerateInput(format!(
            "initial guess has non-positive sigma ({}, {})",
            p.sigma_x, p.sigma_y
        )));
    }
    if p.correlation.is_some_and(|rho| rho.abs() >= 1.0) {
        return Err(FitError::DegenerateInput(
            "initial correlation must lie in (-1, 1)".into(),
        ));
    }
    Ok(())
}

fn pack(p: &GaussianParameters, correlated: bool) -> DVector<f64> {
    let mut v = DVector::zeros(if correlated { 7 } else { 6 });
    v[AMP] = p.amplitude;
    v[CX] = p.center_x;
    v[CY] = p.center_y;
    v[SX] = p.sigma_x;
    v[SY] = p.sigma_y;
    v[BASE] = p.baseline;
    if correlated {
        v[RHO] = p.correlation.unwrap_or(0.0);
    }
    v
}

fn unpack(v: &DVector<f64>, correlated: bool) -> GaussianParameters {
    GaussianParameters {
        amplitude: v[AMP],
        center_x: v[CX],
        center_y: v[CY],
        sigma_x: v[SX],
        sigma_y: v[SY],
        baseline: v[BASE],
        correlation: correlated.then(|| v[RHO]),
    }
}

fn constrain(v: &mut DVector<f64>, correlated: bool, config: &RefineConfig) {
    v[SX] = v[SX].max(config.sigma_floor);
    v[SY] = v[SY].max(config.sigma_floor);
    if correlated {
        v[RHO] = v[RHO].clamp(-MAX_CORRELATION, MAX_CORRELATION);
    }
}

/// Sum of squared residuals over the index grid.
fn compute_cost(field: &IntensityField, p: &GaussianParameters) -> f64 {
    let mut cost = 0.0;
    for (j, col) in field.column_iter().enumerate() {
        for (i, &z) in col.iter().enumerate() {
            let r = z - p.evaluate(i as f64, j as f64);
            cost += r * r;
        }
    }
    cost
}

/// Partial derivatives of the model with respect to each packed parameter.
#[inline]
fn jacobian_row(p: &GaussianParameters, x: f64, y: f64, row: &mut [f64]) {
    let rho = p.correlation.unwrap_or(0.0);
    let k = 1.0 / (1.0 - rho * rho);
    let u = (x - p.center_x) / p.sigma_x;
    let v = (y - p.center_y) / p.sigma_y;
    let q = k * (u * u + v * v - 2.0 * rho * u * v);
    let e = (-0.5 * q).exp();
    let ae = p.amplitude * e * k;
    let du = u - rho * v;
    let dv = v - rho * u;

    row[AMP] = e;
    row[CX] = ae * du / p.sigma_x;
    row[CY] = ae * dv / p.sigma_y;
    row[SX] = ae * u * du / p.sigma_x;
    row[SY] = ae * v * dv / p.sigma_y;
    row[BASE] = 1.0;
    if row.len() > RHO {
        row[RHO] = p.amplitude * e * k * (u * v - rho * q);
    }
}

/// Build `JᵀJ` and `Jᵀr` (r = data - model) without materializing J.
/// Only the upper triangle is accumulated, then mirrored.
fn normal_equations(
    field: &IntensityField,
    p: &GaussianParameters,
    np: usize,
) -> (DMatrix<f64>, DVector<f64>) {
    let mut jtj = DMatrix::<f64>::zeros(np, np);
    let mut jtr = DVector::<f64>::zeros(np);
    let mut row = vec![0.0; np];

    for (j, col) in field.column_iter().enumerate() {
        let y = j as f64;
        for (i, &z) in col.iter().enumerate() {
            let x = i as f64;
            let r = z - p.evaluate(x, y);
            jacobian_row(p, x, y, &mut row);
            for a in 0..np {
                jtr[a] += row[a] * r;
                for b in a..np {
                    jtj[(a, b)] += row[a] * row[b];
                }
            }
        }
    }

    for a in 1..np {
        for b in 0..a {
            jtj[(a, b)] = jtj[(b, a)];
        }
    }

    (jtj, jtr)
}

/// Rank test on the column-normalized normal matrix, so parameters of very
/// different magnitude do not mask (or fake) a rank deficiency.
fn is_singular(jtj: &DMatrix<f64>, tolerance: f64) -> bool {
    let diag = jtj.diagonal();
    let max_diag = diag.max();
    if max_diag.is_nan() || max_diag <= 0.0 || diag.iter().any(|&d| d <= max_diag * tolerance) {
        return true;
    }

    let inv_sqrt = diag.map(|d| 1.0 / d.sqrt());
    let normalized = DMatrix::from_fn(jtj.nrows(), jtj.ncols(), |a, b| {
        jtj[(a, b)] * inv_sqrt[a] * inv_sqrt[b]
    });
    let sv = normalized.singular_values();
    let (min_sv, max_sv) = (sv.min(), sv.max());
    !min_sv.is_finite() || min_sv <= tolerance * max_sv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::{estimate_initial, EstimateConfig};

    fn scenario() -> (GaussianParameters, IntensityField) {
        let truth = GaussianParameters::new(10.0, 25.0, 20.0, 4.0, 6.0, 1.0);
        let field = truth.model().sample(50, 50);
        (truth, field)
    }

    fn assert_recovered(fit: &GaussianParameters, truth: &GaussianParameters) {
        let rel = |a: f64, b: f64| ((a - b) / b).abs();
        assert!(rel(fit.center_x, truth.center_x) < 1e-6, "center_x {}", fit.center_x);
        assert!(rel(fit.center_y, truth.center_y) < 1e-6, "center_y {}", fit.center_y);
        assert!(rel(fit.sigma_x, truth.sigma_x) < 1e-4, "sigma_x {}", fit.sigma_x);
        assert!(rel(fit.sigma_y, truth.sigma_y) < 1e-4, "sigma_y {}", fit.sigma_y);
        assert!(rel(fit.amplitude, truth.amplitude) < 1e-6, "amplitude {}", fit.amplitude);
        assert!((fit.baseline - truth.baseline).abs() < 1e-6, "baseline {}", fit.baseline);
    }

    #[test]
    fn test_refine_concrete_scenario() {
        let (truth, field) = scenario();
        let initial = estimate_initial(&field, &EstimateConfig::default()).unwrap();
        let fit = refine(&field, &initial, &RefineConfig::default()).unwrap();
        assert_recovered(&fit.params, &truth);
        assert_eq!(fit.params.correlation, None);
        assert!(fit.rms_residual < 1e-8, "rms = {}", fit.rms_residual);
    }

    #[test]
    fn test_refine_from_rough_guess() {
        let (truth, field) = scenario();
        let initial = GaussianParameters::new(6.0, 22.0, 23.0, 2.5, 9.0, 0.0);
        let fit = refine(&field, &initial, &RefineConfig::default()).unwrap();
        assert_recovered(&fit.params, &truth);
    }

    #[test]
    fn test_refine_negative_amplitude_kept() {
        let truth = GaussianParameters::new(-4.0, 12.0, 14.0, 2.0, 3.0, 5.0);
        let field = truth.model().sample(30, 30);
        let initial = GaussianParameters::new(-3.0, 13.0, 13.0, 2.5, 2.5, 4.5);
        let fit = refine(&field, &initial, &RefineConfig::default()).unwrap();
        assert_recovered(&fit.params, &truth);
        assert!(fit.params.amplitude < 0.0);
    }

    #[test]
    fn test_refine_correlated() {
        let truth = GaussianParameters::new(8.0, 20.0, 22.0, 5.0, 3.0, 0.5).with_correlation(0.4);
        let field = truth.model().sample(48, 48);
        let config = EstimateConfig {
            with_correlation: true,
            ..Default::default()
        };
        let initial = estimate_initial(&field, &config).unwrap();
        assert!(initial.is_correlated());

        let fit = refine(&field, &initial, &RefineConfig::default()).unwrap();
        assert_recovered(&fit.params, &truth);
        let rho = fit.params.correlation.unwrap();
        assert!((rho - 0.4).abs() < 1e-6, "rho = {rho}");
    }

    #[test]
    fn test_flat_field_is_singular() {
        let field = IntensityField::from_element(20, 20, 3.0);
        let initial = estimate_initial(&field, &EstimateConfig::default()).unwrap();
        let err = refine(&field, &initial, &RefineConfig::default()).unwrap_err();
        assert_eq!(err, FitError::SingularJacobian);
    }

    #[test]
    fn test_iteration_budget_exhausted() {
        let (_, field) = scenario();
        let initial = GaussianParameters::new(6.0, 22.0, 23.0, 2.5, 9.0, 0.0);
        let config = RefineConfig {
            max_iterations: 1,
            ..Default::default()
        };
        match refine(&field, &initial, &config) {
            Err(FitError::DidNotConverge { iterations, cost }) => {
                assert_eq!(iterations, 1);
                assert!(cost > 0.0);
            }
            other => panic!("expected DidNotConverge, got {other:?}"),
        }

        let config = RefineConfig {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(matches!(
            refine(&field, &initial, &config),
            Err(FitError::DidNotConverge { iterations: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_bad_initial_guess() {
        let (_, field) = scenario();
        let mut initial = GaussianParameters::new(10.0, 25.0, 20.0, 4.0, 6.0, 1.0);
        initial.sigma_y = 0.0;
        assert!(matches!(
            refine(&field, &initial, &RefineConfig::default()),
            Err(FitError::DegenerateInput(_))
        ));

        let initial = GaussianParameters::new(10.0, f64::NAN, 20.0, 4.0, 6.0, 1.0);
        assert!(matches!(
            refine(&field, &initial, &RefineConfig::default()),
            Err(FitError::DegenerateInput(_))
        ));
    }

    #[test]
    fn test_too_few_samples() {
        let field = IntensityField::from_element(1, 5, 1.0);
        let initial = GaussianParameters::new(1.0, 0.0, 2.0, 1.0, 1.0, 0.0);
        assert!(matches!(
            refine(&field, &initial, &RefineConfig::default()),
            Err(FitError::DegenerateInput(_))
        ));
    }

    #[test]
    fn test_input_not_mutated() {
        let (_, field) = scenario();
        let copy = field.clone();
        let initial = estimate_initial(&field, &EstimateConfig::default()).unwrap();
        let _ = refine(&field, &initial, &RefineConfig::default()).unwrap();
        assert_eq!(field, copy);
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let p = GaussianParameters::new(3.0, 4.0, 5.0, 1.7, 2.3, 0.4).with_correlation(-0.3);
        let (x, y) = (5.1, 3.7);
        let mut row = vec![0.0; 7];
        jacobian_row(&p, x, y, &mut row);

        let h = 1e-6;
        let base = pack(&p, true);
        for k in 0..7 {
            let mut plus = base.clone();
            let mut minus = base.clone();
            plus[k] += h;
            minus[k] -= h;
            let fd = (unpack(&plus, true).evaluate(x, y) - unpack(&minus, true).evaluate(x, y))
                / (2.0 * h);
            assert!(
                (fd - row[k]).abs() < 1e-6,
                "param {k}: analytic {} vs numeric {fd}",
                row[k]
            );
        }
    }
}
