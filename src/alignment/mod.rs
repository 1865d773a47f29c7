//! Tip-alignment scans: loading, polarity-aware fitting and physical units.
//!
//! A scan directory (`.../scan_40/`) holds one map per scanned variable,
//! named `alignment_scan_<var>.itx`, plus the acquisition parameters
//! (`parameters.itx`). The usual variables are the lock-in amplitude (`fr`)
//! and phase (`ftheta`); some sets also record the photodiode signal
//! (`psd`, reported as `y_psd`). The tip sits where the amplitude peaks and
//! where the phase dips, so the phase channel is fitted as an inverted peak
//! and every other channel as a peak.

pub mod series;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, info};

use crate::axis::AxisScale;
use crate::error::FitError;
use crate::fit::{fit_gaussian, FitConfig, GaussianFit};
use crate::gaussian::GaussianParameters;
use crate::params::ScanParameters;
use crate::wave::{load_itx, Wave};
use crate::IntensityField;

pub use series::{AlignmentRecord, AlignmentSeries, ChannelSummary};

/// Lock-in amplitude channel.
pub const AMPLITUDE: &str = "fr";
/// Lock-in phase channel.
pub const PHASE: &str = "ftheta";
/// Parameter table inside a scan directory.
pub const PARAMETERS_FILE: &str = "parameters.itx";

const SCAN_FILE_PREFIX: &str = "alignment_scan_";

/// Sign of the feature being fitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Feature rises above the background.
    Peak,
    /// Feature falls below the background.
    Dip,
}

impl Polarity {
    /// Polarity of a scanned variable: the phase dips, everything else peaks.
    pub fn of_channel(channel: &str) -> Self {
        if channel == PHASE {
            Polarity::Dip
        } else {
            Polarity::Peak
        }
    }
}

/// Fit a peak or a dip.
///
/// A dip is negated and shifted so its minimum is zero, fitted as a peak,
/// then mapped back: the returned amplitude is negative and the baseline is
/// in the input's units. Centers and sigmas are unaffected by the
/// transform.
pub fn fit_with_polarity(
    field: &IntensityField,
    polarity: Polarity,
    config: &FitConfig,
) -> Result<GaussianFit, FitError> {
    match polarity {
        Polarity::Peak => fit_gaussian(field, config),
        Polarity::Dip => {
            let negated = -field;
            let offset = negated.min();
            let shifted = negated.add_scalar(-offset);
            let mut fit = fit_gaussian(&shifted, config)?;
            fit.params.baseline = -(fit.params.baseline + offset);
            fit.params.amplitude = -fit.params.amplitude;
            Ok(fit)
        }
    }
}

/// Channel variable of a scan map file.
///
/// `alignment_scan_fr.itx` -> `fr`, `alignment_scan_psd.itx` -> `y_psd`.
/// Fit output waves (names containing `fit`) are not channels.
pub fn channel_from_file_name(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".itx")?;
    if !stem.starts_with(SCAN_FILE_PREFIX) || stem.contains("fit") {
        return None;
    }
    let (_, var) = stem.rsplit_once('_')?;
    Some(match var {
        "psd" => "y_psd".to_string(),
        _ => var.to_string(),
    })
}

/// One channel of a scan: the sampled map and its axis scaling.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanChannel {
    pub data: IntensityField,
    pub x_scale: AxisScale,
    pub y_scale: AxisScale,
}

/// Fit of one channel, in both coordinate systems.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFit {
    /// Fit on the index grid of [`ScanChannel::data`]. Its model is the one
    /// to compare against the map (`index.model().residuals(&channel.data)`).
    pub index: GaussianFit,
    /// `index.params` in the wave's physical units. Evaluate it on
    /// physical coordinates only, e.g. `sample_on(&x_values, &y_values)`.
    pub physical: GaussianParameters,
}

impl ScanChannel {
    pub fn new(data: IntensityField, x_scale: AxisScale, y_scale: AxisScale) -> Self {
        Self {
            data,
            x_scale,
            y_scale,
        }
    }

    /// Take a numeric wave with its scaling.
    pub fn from_wave(wave: Wave) -> Result<Self> {
        let (x_scale, y_scale) = (wave.x_scale, wave.y_scale);
        Ok(Self::new(wave.into_numeric()?, x_scale, y_scale))
    }

    /// Physical coordinates of every row.
    pub fn x_values(&self) -> Vec<f64> {
        self.x_scale.values(self.data.nrows())
    }

    /// Physical coordinates of every column.
    pub fn y_values(&self) -> Vec<f64> {
        self.y_scale.values(self.data.ncols())
    }

    /// Fit in index space and convert the result to physical units.
    pub fn fit(&self, polarity: Polarity, config: &FitConfig) -> Result<ChannelFit, FitError> {
        let index = fit_with_polarity(&self.data, polarity, config)?;
        let physical = index.params.to_physical(&self.x_scale, &self.y_scale);
        Ok(ChannelFit { index, physical })
    }
}

/// Per-channel fits of one scan, in physical units.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct AlignmentFit {
    pub channels: BTreeMap<String, GaussianParameters>,
}

impl AlignmentFit {
    pub fn channel(&self, name: &str) -> Option<&GaussianParameters> {
        self.channels.get(name)
    }

    pub fn amplitude(&self) -> Option<&GaussianParameters> {
        self.channel(AMPLITUDE)
    }

    pub fn phase(&self) -> Option<&GaussianParameters> {
        self.channel(PHASE)
    }
}

/// A loaded alignment scan.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentScan {
    /// Scan number, from a `scan_<n>` directory name.
    pub id: Option<u32>,
    /// Maps keyed by scanned variable.
    pub channels: BTreeMap<String, ScanChannel>,
    pub params: ScanParameters,
}

impl AlignmentScan {
    /// A scan with no channels yet; add them with [`Self::with_channel`].
    pub fn new(params: ScanParameters) -> Self {
        Self {
            id: None,
            channels: BTreeMap::new(),
            params,
        }
    }

    pub fn with_channel(mut self, name: impl Into<String>, channel: ScanChannel) -> Self {
        self.channels.insert(name.into(), channel);
        self
    }

    pub fn channel(&self, name: &str) -> Option<&ScanChannel> {
        self.channels.get(name)
    }

    /// Load every `alignment_scan_<var>.itx` map and the parameters of a
    /// scan directory. A directory without any map is an error.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let params = ScanParameters::load(dir.join(PARAMETERS_FILE))?;
        let mut scan = Self::new(params);
        scan.id = scan_id_from_dir(dir);

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list scan directory: {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(channel_from_file_name)
            else {
                continue;
            };
            let channel = ScanChannel::from_wave(load_itx(&path)?)
                .with_context(|| format!("Bad '{}' map in {}", name, dir.display()))?;
            scan.channels.insert(name, channel);
        }
        anyhow::ensure!(
            !scan.channels.is_empty(),
            "No alignment_scan_*.itx maps in {}",
            dir.display()
        );

        info!(
            "Loaded alignment scan {} (channels: {:?})",
            dir.display(),
            scan.channels.keys().collect::<Vec<_>>()
        );
        Ok(scan)
    }

    /// Piezo drive voltage.
    pub fn voltage(&self) -> Option<f64> {
        self.params.number("voltage")
    }

    /// Initial stage position.
    pub fn position(&self) -> Option<f64> {
        self.params.number("init_pos_a")
    }

    /// Alignment set the scan belongs to. Older scans did not record one
    /// and count as set 0.
    pub fn set(&self) -> i64 {
        self.params.integer("alignment_set").unwrap_or(0)
    }

    pub fn time_stamp(&self) -> Option<&str> {
        self.params.text("time_stamp")
    }

    /// Scan size, ×1000 from the recorded value.
    pub fn scan_size(&self) -> Option<f64> {
        self.params.number("scan_size").map(|v| 1000.0 * v)
    }

    /// Scan step, ×1000 from the recorded value.
    pub fn scan_step(&self) -> Option<f64> {
        self.params.number("scan_step").map(|v| 1000.0 * v)
    }

    /// Fit every channel with its polarity (see [`Polarity::of_channel`]).
    /// The first failing channel aborts the scan.
    pub fn fit(&self, config: &FitConfig) -> Result<AlignmentFit, FitError> {
        let mut fit = AlignmentFit::default();
        for (name, channel) in &self.channels {
            let result = channel.fit(Polarity::of_channel(name), config)?;
            debug!(
                "Alignment fit '{}': center ({:.4}, {:.4}), fwhm ({:.4}, {:.4})",
                name,
                result.physical.center_x,
                result.physical.center_y,
                result.physical.fwhm_x(),
                result.physical.fwhm_y()
            );
            fit.channels.insert(name.clone(), result.physical);
        }
        Ok(fit)
    }
}

/// `scan_40` -> 40.
pub fn scan_id_from_dir(dir: &Path) -> Option<u32> {
    let name = dir.file_name()?.to_str()?;
    let (_, n) = name.rsplit_once('_')?;
    n.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_dip_fit_recovers_negative_amplitude() {
        let peak = GaussianParameters::new(3.0, 14.0, 17.0, 2.5, 3.5, 0.0);
        let dip = GaussianParameters::new(-3.0, 14.0, 17.0, 2.5, 3.5, 7.0);
        let field = dip.model().sample(32, 36);

        let fit = fit_with_polarity(&field, Polarity::Dip, &FitConfig::default()).unwrap();
        let p = fit.params;
        assert!(approx(p.amplitude, -3.0, 1e-6), "amplitude = {}", p.amplitude);
        assert!(approx(p.baseline, 7.0, 1e-6), "baseline = {}", p.baseline);
        assert!(approx(p.center_x, peak.center_x, 1e-6));
        assert!(approx(p.center_y, peak.center_y, 1e-6));
        assert!(approx(p.sigma_x, peak.sigma_x, 1e-4));
        assert!(approx(p.sigma_y, peak.sigma_y, 1e-4));

        // The fitted model reproduces the data in its input units
        assert!(fit.model().residuals(&field).amax() < 1e-6);
    }

    #[test]
    fn test_channel_fit_in_physical_units() {
        let truth = GaussianParameters::new(2.0, 10.0, 12.0, 3.0, 2.0, 0.1);
        let channel = ScanChannel::new(
            truth.model().sample(24, 24),
            AxisScale::new(-1.0, 0.1),
            AxisScale::new(2.0, 0.05),
        );
        let fit = channel.fit(Polarity::Peak, &FitConfig::default()).unwrap();
        assert!(approx(fit.physical.center_x, 0.0, 1e-6));
        assert!(approx(fit.physical.center_y, 2.6, 1e-6));
        assert!(approx(fit.physical.sigma_x, 0.3, 1e-5));
        assert!(approx(fit.physical.sigma_y, 0.1, 1e-5));
    }

    #[test]
    fn test_channel_fit_models_match_their_grids() {
        let truth = GaussianParameters::new(-1.5, 9.0, 11.0, 2.0, 2.5, 4.0);
        let channel = ScanChannel::new(
            truth.model().sample(20, 22),
            AxisScale::new(5.0, -0.2),
            AxisScale::new(-3.0, 0.5),
        );
        let fit = channel.fit(Polarity::Dip, &FitConfig::default()).unwrap();

        // Index-space model against the raw map
        assert!(fit.index.model().residuals(&channel.data).amax() < 1e-6);

        // Physical model against the map's physical coordinates
        let on_axes = fit
            .physical
            .model()
            .sample_on(&channel.x_values(), &channel.y_values());
        assert!((on_axes - &channel.data).amax() < 1e-6);
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(channel_from_file_name("alignment_scan_fr.itx").as_deref(), Some("fr"));
        assert_eq!(
            channel_from_file_name("alignment_scan_ftheta.itx").as_deref(),
            Some("ftheta")
        );
        assert_eq!(
            channel_from_file_name("alignment_scan_psd.itx").as_deref(),
            Some("y_psd")
        );
        assert_eq!(channel_from_file_name("alignment_scan_fr_fit.itx"), None);
        assert_eq!(channel_from_file_name("alignment_scan_fr.ibw"), None);
        assert_eq!(channel_from_file_name("parameters.itx"), None);

        assert_eq!(Polarity::of_channel(PHASE), Polarity::Dip);
        assert_eq!(Polarity::of_channel(AMPLITUDE), Polarity::Peak);
        assert_eq!(Polarity::of_channel("y_psd"), Polarity::Peak);
    }

    #[test]
    fn test_scan_metadata() {
        use crate::params::ParamValue;

        let channel = ScanChannel::new(
            IntensityField::zeros(2, 2),
            AxisScale::default(),
            AxisScale::default(),
        );
        let mut params = ScanParameters::default();
        params.insert("voltage", ParamValue::Number(1.5));
        params.insert("scan_size", ParamValue::Number(0.002));
        params.insert("scan_step", ParamValue::Missing);
        let scan = AlignmentScan::new(params)
            .with_channel(AMPLITUDE, channel.clone())
            .with_channel(PHASE, channel);

        assert_eq!(scan.channels.len(), 2);
        assert!(scan.channel(AMPLITUDE).is_some());
        assert_eq!(scan.voltage(), Some(1.5));
        assert_eq!(scan.set(), 0);
        assert_eq!(scan.scan_size(), Some(2.0));
        assert_eq!(scan.scan_step(), None);
        assert_eq!(scan.position(), None);
    }

    #[test]
    fn test_scan_fit_covers_every_channel() {
        let peak = GaussianParameters::new(2.0, 8.0, 9.0, 2.0, 2.0, 0.0);
        let dip = GaussianParameters::new(-5.0, 8.5, 9.5, 2.0, 2.0, 30.0);
        let scale = AxisScale::default();
        let scan = AlignmentScan::new(ScanParameters::default())
            .with_channel(AMPLITUDE, ScanChannel::new(peak.model().sample(18, 18), scale, scale))
            .with_channel(PHASE, ScanChannel::new(dip.model().sample(18, 18), scale, scale))
            .with_channel("y_psd", ScanChannel::new(peak.model().sample(18, 18), scale, scale));

        let fit = scan.fit(&FitConfig::default()).unwrap();
        assert_eq!(fit.channels.len(), 3);
        assert!(approx(fit.amplitude().unwrap().amplitude, 2.0, 1e-6));
        assert!(approx(fit.phase().unwrap().amplitude, -5.0, 1e-6));
        assert!(approx(fit.channel("y_psd").unwrap().center_x, 8.0, 1e-6));
    }

    #[test]
    fn test_scan_id_from_dir() {
        assert_eq!(scan_id_from_dir(Path::new("/data/alignment_scans/scan_40")), Some(40));
        assert_eq!(scan_id_from_dir(Path::new("scan_7")), Some(7));
        assert_eq!(scan_id_from_dir(Path::new("/data/notes")), None);
    }
}
