//! Moment-based initial guess for a 2D Gaussian.
//!
//! The estimate is computed directly from the field without iterating:
//! 1. Baseline from the raw minimum (or a percentile, see [`BaselineEstimate`])
//! 2. Amplitude as `max - baseline`
//! 3. Centers from the first moments of the row and column marginals of
//!    `field - baseline`
//! 4. Sigmas from the second moments of the same marginals, floored so the
//!    solver never starts from a zero-width peak
//!
//! Inverted peaks (dips) degrade the moments; normalize polarity first, see
//! [`crate::alignment::fit_with_polarity`].

use crate::error::FitError;
use crate::gaussian::GaussianParameters;
use crate::IntensityField;

/// How to estimate the constant offset under the peak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaselineEstimate {
    /// Raw minimum of the field. Noise-sensitive, but matches the lab's
    /// historical reductions.
    Minimum,
    /// The given percentile (0-100) of the field values, e.g. `5.0`. Values
    /// outside the range clamp to it; NaN and infinities are rejected.
    Percentile(f64),
}

/// Configuration for the initial-guess estimator.
#[derive(Debug, Clone)]
pub struct EstimateConfig {
    /// Baseline estimator.
    /// Default: [`BaselineEstimate::Minimum`]
    pub baseline: BaselineEstimate,

    /// Smallest sigma (in index units) the estimate may return.
    /// Default: 1e-3
    pub sigma_floor: f64,

    /// Seed a correlation coefficient from the mixed second moment, which
    /// selects the elliptical model in the refiner.
    /// Default: false
    pub with_correlation: bool,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            baseline: BaselineEstimate::Minimum,
            sigma_floor: 1e-3,
            with_correlation: false,
        }
    }
}

/// Largest |ρ| the estimator will seed.
const MAX_SEED_CORRELATION: f64 = 0.9;

/// Estimate Gaussian parameters from image moments.
///
/// Fails only with [`FitError::DegenerateInput`]: an empty field, a field
/// with non-finite values, a field whose sum is zero, or a non-finite
/// baseline percentile.
pub fn estimate_initial(
    field: &IntensityField,
    config: &EstimateConfig,
) -> Result<GaussianParameters, FitError> {
    validate_field(field)?;

    let total: f64 = field.iter().sum();
    if total == 0.0 {
        return Err(FitError::DegenerateInput(
            "field sums to zero; no signal to locate".into(),
        ));
    }

    let baseline = match config.baseline {
        BaselineEstimate::Minimum => field.min(),
        BaselineEstimate::Percentile(p) if !p.is_finite() => {
            return Err(FitError::DegenerateInput(format!(
                "baseline percentile must be finite, got {p}"
            )));
        }
        BaselineEstimate::Percentile(p) => percentile(field.as_slice(), p),
    };
    let amplitude = field.max() - baseline;

    // Weight by the signal above baseline. A flat field leaves no positive
    // mass, in which case the raw values are used so the moments stay finite.
    let above = field.map(|v| (v - baseline).max(0.0));
    let weights = if above.sum() > 0.0 { above } else { field.clone() };
    let moments = Moments::of(&weights);

    let correlation = if config.with_correlation && moments.sigma_x > 0.0 && moments.sigma_y > 0.0
    {
        let rho = moments.cov_xy / (moments.sigma_x * moments.sigma_y);
        Some(rho.clamp(-MAX_SEED_CORRELATION, MAX_SEED_CORRELATION))
    } else {
        None
    };

    Ok(GaussianParameters {
        amplitude,
        center_x: moments.center_x,
        center_y: moments.center_y,
        sigma_x: moments.sigma_x.max(config.sigma_floor),
        sigma_y: moments.sigma_y.max(config.sigma_floor),
        baseline,
        correlation,
    })
}

/// Reject fields no fit can be run on.
pub(crate) fn validate_field(field: &IntensityField) -> Result<(), FitError> {
    if field.is_empty() {
        return Err(FitError::DegenerateInput("field is empty".into()));
    }
    if let Some(idx) = field.iter().position(|v| !v.is_finite()) {
        let (row, col) = (idx % field.nrows(), idx / field.nrows());
        return Err(FitError::DegenerateInput(format!(
            "non-finite value at ({row}, {col})"
        )));
    }
    Ok(())
}

/// Intensity-weighted moments of the row/column marginals.
struct Moments {
    center_x: f64,
    center_y: f64,
    sigma_x: f64,
    sigma_y: f64,
    cov_xy: f64,
}

impl Moments {
    fn of(weights: &IntensityField) -> Self {
        let total = weights.sum();
        // Marginals: row sums run along x, column sums along y
        let row_marginal: Vec<f64> = weights.row_iter().map(|r| r.sum()).collect();
        let col_marginal: Vec<f64> = weights.column_iter().map(|c| c.sum()).collect();

        let center_x = first_moment(&row_marginal, total);
        let center_y = first_moment(&col_marginal, total);
        let sigma_x = second_moment(&row_marginal, center_x, total).sqrt();
        let sigma_y = second_moment(&col_marginal, center_y, total).sqrt();

        let mut cross = 0.0;
        for (j, col) in weights.column_iter().enumerate() {
            let dy = j as f64 - center_y;
            for (i, &w) in col.iter().enumerate() {
                cross += w * (i as f64 - center_x) * dy;
            }
        }

        Self {
            center_x,
            center_y,
            sigma_x,
            sigma_y,
            cov_xy: cross / total,
        }
    }
}

fn first_moment(marginal: &[f64], total: f64) -> f64 {
    marginal
        .iter()
        .enumerate()
        .map(|(i, &m)| i as f64 * m)
        .sum::<f64>()
        / total
}

/// Variance about `center`. Mixed-sign weights can make the sum negative,
/// so the magnitude is taken.
fn second_moment(marginal: &[f64], center: f64, total: f64) -> f64 {
    let var = marginal
        .iter()
        .enumerate()
        .map(|(i, &m)| m * (i as f64 - center).powi(2))
        .sum::<f64>()
        / total;
    var.abs()
}

/// Nearest-rank percentile; `p` in [0, 100].
fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let frac = p.clamp(0.0, 100.0) / 100.0;
    let idx = (frac * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
