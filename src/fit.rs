//! One-call Gaussian fit: moment estimate followed by LM refinement.

use tracing::debug;

use crate::error::FitError;
use crate::estimate::{estimate_initial, EstimateConfig};
use crate::gaussian::{GaussianModel, GaussianParameters};
use crate::refine::{refine, RefineConfig};
use crate::IntensityField;

/// Configuration for [`fit_gaussian`].
#[derive(Debug, Clone, Default)]
pub struct FitConfig {
    /// Initial-guess settings. Set `estimate.with_correlation` to fit the
    /// elliptical model.
    pub estimate: EstimateConfig,
    /// Solver settings.
    pub refine: RefineConfig,
}

/// Result of a successful refinement.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianFit {
    /// Best-fit parameters in index units.
    pub params: GaussianParameters,
    /// Jacobian evaluations used.
    pub iterations: usize,
    /// Final sum of squared residuals.
    pub cost: f64,
    /// `sqrt(cost / N)` over the N grid points.
    pub rms_residual: f64,
}

impl GaussianFit {
    pub fn model(&self) -> GaussianModel {
        self.params.model()
    }
}

/// Estimate an initial guess from moments, then refine it.
///
/// Errors from either stage are returned unchanged; see
/// [`estimate_initial`] and [`refine`].
///
/// The moment estimate weights by signal above the minimum, so it assumes a
/// peak. A dip (a field falling below its background) seeds the solver on
/// the wrong feature and typically fails with
/// [`FitError::SingularJacobian`]; fit dips with
/// [`fit_with_polarity`](crate::alignment::fit_with_polarity) and
/// [`Polarity::Dip`](crate::alignment::Polarity::Dip).
pub fn fit_gaussian(field: &IntensityField, config: &FitConfig) -> Result<GaussianFit, FitError> {
    let initial = estimate_initial(field, &config.estimate)?;
    debug!(
        "Gaussian fit: initial guess A={:.4} center=({:.3}, {:.3}) sigma=({:.3}, {:.3}) B={:.4}",
        initial.amplitude,
        initial.center_x,
        initial.center_y,
        initial.sigma_x,
        initial.sigma_y,
        initial.baseline
    );
    refine(field, &initial, &config.refine)
}
