//! 2D Gaussian parameter record and the model function bound to it.
//!
//! The model is
//!
//! ```text
//! f(x, y) = B + A · exp(-q / 2)
//! q       = (u² + v² - 2ρ·u·v) / (1 - ρ²),   u = (x - x₀)/σx,  v = (y - y₀)/σy
//! ```
//!
//! With ρ = 0 (or no correlation at all) this is the axis-aligned Gaussian
//! `B + A · exp(-((x-x₀)²/2σx² + (y-y₀)²/2σy²))`.
//!
//! Coordinates follow the array layout of an [`IntensityField`]: `x` is the
//! row index (first axis) and `y` is the column index (second axis).

use rkyv::{Archive, Deserialize, Serialize};

use crate::axis::AxisScale;
use crate::IntensityField;

/// Conversion factor from standard deviation to full width at half maximum,
/// `2·sqrt(2·ln 2)`.
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Parameters of a 2D Gaussian surface.
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
pub struct GaussianParameters {
    /// Peak height above `baseline`. Negative for dips; the sign is never clamped.
    pub amplitude: f64,
    /// Centroid along the row axis.
    pub center_x: f64,
    /// Centroid along the column axis.
    pub center_y: f64,
    /// Standard deviation along the row axis. Always > 0.
    pub sigma_x: f64,
    /// Standard deviation along the column axis. Always > 0.
    pub sigma_y: f64,
    /// Constant offset.
    pub baseline: f64,
    /// Correlation coefficient ρ of the elliptical variant, in (-1, 1).
    /// `None` (or `Some(0.0)`) selects the axis-aligned model.
    ///
    /// ρ enters in the bivariate-normal form `(u² + v² - 2ρuv) / (1 - ρ²)`, as
    /// in Igor's Gauss2D, not as a bare `2ρ·dx·dy/(σx·σy)` term added to the
    /// exponent. Coefficients fitted with the bare form are not interchangeable.
    pub correlation: Option<f64>,
}

impl GaussianParameters {
    /// Axis-aligned parameters.
    pub fn new(
        amplitude: f64,
        center_x: f64,
        center_y: f64,
        sigma_x: f64,
        sigma_y: f64,
        baseline: f64,
    ) -> Self {
        Self {
            amplitude,
            center_x,
            center_y,
            sigma_x,
            sigma_y,
            baseline,
            correlation: None,
        }
    }

    /// Same parameters with a correlation term.
    pub fn with_correlation(mut self, rho: f64) -> Self {
        self.correlation = Some(rho);
        self
    }

    /// Import the coefficient wave written by the lab control program's
    /// Gauss2D fit: `{z0, a0, x0, sigx, y0, sigy, corr}`.
    ///
    /// The correlation entry is optional; a zero correlation yields the
    /// axis-aligned model. Returns `None` for fewer than six coefficients.
    pub fn from_igor_coefficients(coef: &[f64]) -> Option<Self> {
        if coef.len() < 6 {
            return None;
        }
        let params = Self::new(coef[1], coef[2], coef[4], coef[3].abs(), coef[5].abs(), coef[0]);
        Some(match coef.get(6) {
            Some(&rho) if rho != 0.0 => params.with_correlation(rho),
            _ => params,
        })
    }

    /// `true` when the elliptical (cross-term) model is selected.
    pub fn is_correlated(&self) -> bool {
        self.correlation.is_some_and(|rho| rho != 0.0)
    }

    /// Full width at half maximum along the row axis.
    pub fn fwhm_x(&self) -> f64 {
        FWHM_PER_SIGMA * self.sigma_x
    }

    /// Full width at half maximum along the column axis.
    pub fn fwhm_y(&self) -> f64 {
        FWHM_PER_SIGMA * self.sigma_y
    }

    /// Evaluate the model at `(x, y)`.
    #[inline]
    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        let u = (x - self.center_x) / self.sigma_x;
        let v = (y - self.center_y) / self.sigma_y;
        let q = match self.correlation {
            Some(rho) if rho != 0.0 => (u * u + v * v - 2.0 * rho * u * v) / (1.0 - rho * rho),
            _ => u * u + v * v,
        };
        self.baseline + self.amplitude * (-0.5 * q).exp()
    }

    /// Convert index-space parameters to physical units.
    ///
    /// Centers map through `origin + step·index`; sigmas scale by `|step|`.
    /// When exactly one axis runs backwards the correlation changes sign.
    pub fn to_physical(&self, x_axis: &AxisScale, y_axis: &AxisScale) -> Self {
        let flip = (x_axis.step < 0.0) != (y_axis.step < 0.0);
        Self {
            amplitude: self.amplitude,
            center_x: x_axis.value_at(self.center_x),
            center_y: y_axis.value_at(self.center_y),
            sigma_x: self.sigma_x * x_axis.step.abs(),
            sigma_y: self.sigma_y * y_axis.step.abs(),
            baseline: self.baseline,
            correlation: self.correlation.map(|rho| if flip { -rho } else { rho }),
        }
    }

    /// The model function bound to these parameters.
    pub fn model(&self) -> GaussianModel {
        GaussianModel { params: *self }
    }
}

/// A fitted Gaussian surface, for overlay and residual computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianModel {
    params: GaussianParameters,
}

impl GaussianModel {
    pub fn params(&self) -> &GaussianParameters {
        &self.params
    }

    #[inline]
    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        self.params.evaluate(x, y)
    }

    /// Sample the surface on the integer index grid of a `rows × cols` field.
    pub fn sample(&self, rows: usize, cols: usize) -> IntensityField {
        IntensityField::from_fn(rows, cols, |i, j| self.evaluate(i as f64, j as f64))
    }

    /// Sample the surface on explicit coordinate vectors (`x` per row, `y` per column).
    pub fn sample_on(&self, x: &[f64], y: &[f64]) -> IntensityField {
        IntensityField::from_fn(x.len(), y.len(), |i, j| self.evaluate(x[i], y[j]))
    }

    /// `field - model`, evaluated on the field's index grid.
    pub fn residuals(&self, field: &IntensityField) -> IntensityField {
        IntensityField::from_fn(field.nrows(), field.ncols(), |i, j| {
            field[(i, j)] - self.evaluate(i as f64, j as f64)
        })
    }

    /// Borrow the model as a plain closure.
    pub fn as_fn(&self) -> impl Fn(f64, f64) -> f64 + '_ {
        move |x, y| self.evaluate(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_value_and_fwhm() {
        let p = GaussianParameters::new(10.0, 25.0, 20.0, 4.0, 6.0, 1.0);
        assert!((p.evaluate(25.0, 20.0) - 11.0).abs() < 1e-12);

        // Half maximum sits FWHM/2 from the center
        let half = p.evaluate(25.0 + p.fwhm_x() / 2.0, 20.0) - p.baseline;
        assert!((half - 5.0).abs() < 1e-9, "half max = {half}");
        let half = p.evaluate(25.0, 20.0 + p.fwhm_y() / 2.0) - p.baseline;
        assert!((half - 5.0).abs() < 1e-9, "half max = {half}");
    }

    #[test]
    fn test_zero_correlation_matches_axis_aligned() {
        let p = GaussianParameters::new(3.0, 4.0, 5.0, 1.5, 2.5, -0.2);
        let pc = p.with_correlation(0.0);
        assert!(!pc.is_correlated());
        for (x, y) in [(0.0, 0.0), (4.0, 5.0), (6.3, 2.1)] {
            assert_eq!(p.evaluate(x, y), pc.evaluate(x, y));
        }
    }

    #[test]
    fn test_correlated_model_is_tilted() {
        let p = GaussianParameters::new(1.0, 0.0, 0.0, 2.0, 2.0, 0.0).with_correlation(0.5);
        // Positive correlation stretches the surface along the x = y diagonal
        assert!(p.evaluate(1.0, 1.0) > p.evaluate(1.0, -1.0));
    }

    #[test]
    fn test_correlated_model_uses_bivariate_normal_form() {
        let (a, x0, y0, sx, sy, b, rho) = (4.0, 1.0, -2.0, 1.5, 0.8, 0.5, -0.6);
        let p = GaussianParameters::new(a, x0, y0, sx, sy, b).with_correlation(rho);
        for (x, y) in [(1.0, -2.0), (2.2, -1.1), (-0.5, -3.0), (3.0, 0.4)] {
            let (u, v) = ((x - x0) / sx, (y - y0) / sy);
            let expected =
                b + a * (-(u * u + v * v - 2.0 * rho * u * v) / (2.0 * (1.0 - rho * rho))).exp();
            assert!((p.evaluate(x, y) - expected).abs() < 1e-12);
        }

        // A bare cross term gives a different surface off the axes
        let (u, v) = ((2.2 - x0) / sx, (-1.1 - y0) / sy);
        let bare = b + a * (-0.5 * (u * u + v * v) + rho * u * v).exp();
        assert!((p.evaluate(2.2, -1.1) - bare).abs() > 1e-3);
    }

    #[test]
    fn test_igor_coefficient_order() {
        let p = GaussianParameters::from_igor_coefficients(&[0.5, 7.0, 12.0, 3.0, 14.0, 4.0, 0.0])
            .unwrap();
        assert_eq!(p.baseline, 0.5);
        assert_eq!(p.amplitude, 7.0);
        assert_eq!(p.center_x, 12.0);
        assert_eq!(p.sigma_x, 3.0);
        assert_eq!(p.center_y, 14.0);
        assert_eq!(p.sigma_y, 4.0);
        assert_eq!(p.correlation, None);

        assert!(GaussianParameters::from_igor_coefficients(&[1.0, 2.0, 3.0]).is_none());
    }

    #[test]
    fn test_to_physical() {
        let p = GaussianParameters::new(-2.0, 10.0, 4.0, 2.0, 3.0, 0.0).with_correlation(0.3);
        let x_axis = AxisScale::new(-500.0, 20.0);
        let y_axis = AxisScale::new(100.0, -10.0);
        let phys = p.to_physical(&x_axis, &y_axis);
        assert_eq!(phys.amplitude, -2.0);
        assert!((phys.center_x - (-300.0)).abs() < 1e-12);
        assert!((phys.center_y - 60.0).abs() < 1e-12);
        assert!((phys.sigma_x - 40.0).abs() < 1e-12);
        assert!((phys.sigma_y - 30.0).abs() < 1e-12);
        assert_eq!(phys.correlation, Some(-0.3));
    }

    #[test]
    fn test_model_sample_and_residuals() {
        let p = GaussianParameters::new(5.0, 3.0, 4.0, 1.0, 1.5, 2.0);
        let model = p.model();
        let surface = model.sample(8, 9);
        assert_eq!(surface.shape(), (8, 9));
        assert_eq!(surface[(3, 4)], 7.0);

        let resid = model.residuals(&surface);
        assert!(resid.iter().all(|&r| r == 0.0));

        let f = model.as_fn();
        assert_eq!(f(3.0, 4.0), surface[(3, 4)]);

        let on_axes = model.sample_on(&[3.0, 100.0], &[4.0]);
        assert_eq!(on_axes[(0, 0)], 7.0);
        assert!((on_axes[(1, 0)] - 2.0).abs() < 1e-12);
    }
}
