//! Tip-approach experiments: contact detection, binning and spectral axes.
//!
//! An experiment records one sample per approach step: piezo step,
//! displacement, tunnel current, conductance and the photodiode force
//! signals (`force_y`, `force_x`), plus an optical spectrum per step. These
//! are held as named columns of a [`TraceTable`], with the spectra as one
//! matrix row per step.
//!
//! The snap-to-contact (StoC) step is where the vertical force trace drops
//! fastest, i.e. the minimum of its gradient.

use std::collections::BTreeMap;
use std::ops::Range;

use anyhow::{anyhow, Result};
use nalgebra::DMatrix;
use tracing::debug;

/// Speed of light in vacuum, m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;
/// Planck constant, J·s.
pub const PLANCK: f64 = 6.626_070_15e-34;
/// Elementary charge, C.
pub const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;

/// Gradient of uniformly spaced samples.
///
/// Central differences `(f[i+1] - f[i-1]) / 2` inside, one-sided
/// differences at both ends. Fewer than two samples give an empty vector.
pub fn gradient(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return Vec::new();
    }
    (0..n)
        .map(|i| match i {
            0 => values[1] - values[0],
            i if i == n - 1 => values[n - 1] - values[n - 2],
            i => (values[i + 1] - values[i - 1]) / 2.0,
        })
        .collect()
}

/// Snap-to-contact index of a force trace: the first position of the
/// steepest drop. `None` for fewer than two samples or an all-NaN gradient.
pub fn snap_to_contact(force: &[f64]) -> Option<usize> {
    let grad = gradient(force);
    let stoc = grad
        .iter()
        .enumerate()
        .filter(|(_, g)| !g.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &g)| match best {
            Some((_, b)) if b <= g => best,
            _ => Some((i, g)),
        })
        .map(|(i, _)| i);
    debug!("Snap to contact at {:?} of {} samples", stoc, force.len());
    stoc
}

/// Equal-length traces of an experiment, keyed by column name, with
/// optional spectra (one row per trace sample).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceTable {
    columns: BTreeMap<String, Vec<f64>>,
    spectra: Option<DMatrix<f64>>,
}

impl TraceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a column. Its length must match the table's.
    pub fn with_column(mut self, name: impl Into<String>, values: Vec<f64>) -> Result<Self> {
        let name = name.into();
        if let Some(len) = self.len_excluding(&name) {
            anyhow::ensure!(
                values.len() == len,
                "column '{}' has {} samples, table has {}",
                name,
                values.len(),
                len
            );
        }
        self.columns.insert(name, values);
        Ok(self)
    }

    /// Attach spectra, one row per sample.
    pub fn with_spectra(mut self, spectra: DMatrix<f64>) -> Result<Self> {
        if let Some(len) = self.columns.values().next().map(Vec::len) {
            anyhow::ensure!(
                spectra.nrows() == len,
                "spectra have {} rows, table has {} samples",
                spectra.nrows(),
                len
            );
        }
        self.spectra = Some(spectra);
        Ok(self)
    }

    /// Number of samples per trace.
    pub fn len(&self) -> usize {
        self.columns
            .values()
            .next()
            .map(Vec::len)
            .or_else(|| self.spectra.as_ref().map(|s| s.nrows()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn spectra(&self) -> Option<&DMatrix<f64>> {
        self.spectra.as_ref()
    }

    /// Snap-to-contact index of a force column.
    pub fn snap_to_contact(&self, force_column: &str) -> Result<Option<usize>> {
        Ok(snap_to_contact(self.require(force_column)?))
    }

    /// All traces reordered by ascending `key`. Equal keys keep their order.
    pub fn sorted_by(&self, key: &str) -> Result<Self> {
        let keys = self.require(key)?;
        let mut order: Vec<usize> = (0..keys.len()).collect();
        order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));

        let columns = self
            .columns
            .iter()
            .map(|(name, values)| (name.clone(), order.iter().map(|&i| values[i]).collect()))
            .collect();
        let spectra = self.spectra.as_ref().map(|s| s.select_rows(&order));
        Ok(Self { columns, spectra })
    }

    /// Average every trace over bins of the `param` column.
    ///
    /// `edges` are strictly increasing; sample `k` falls in bin `i` when
    /// `edges[i] <= param[k] < edges[i + 1]`. Samples outside the edges (or
    /// NaN) are ignored. Bins that receive no sample are dropped from the
    /// result.
    pub fn binned(&self, param: &str, edges: &[f64]) -> Result<BinnedTraces> {
        let values = self.require(param)?;
        anyhow::ensure!(edges.len() >= 2, "need at least two bin edges, got {}", edges.len());
        anyhow::ensure!(
            edges.windows(2).all(|w| w[0] < w[1]),
            "bin edges must be strictly increasing"
        );

        let n_bins = edges.len() - 1;
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_bins];
        for (k, &v) in values.iter().enumerate() {
            let bin = edges.partition_point(|&e| e <= v);
            if (1..=n_bins).contains(&bin) {
                members[bin - 1].push(k);
            }
        }
        let kept: Vec<usize> = (0..n_bins).filter(|&b| !members[b].is_empty()).collect();
        if kept.len() < n_bins {
            debug!("Dropped {} empty bins of {}", n_bins - kept.len(), n_bins);
        }

        let mean = |trace: &[f64], bin: usize| {
            members[bin].iter().map(|&k| trace[k]).sum::<f64>() / members[bin].len() as f64
        };
        let columns = self
            .columns
            .iter()
            .map(|(name, trace)| (name.clone(), kept.iter().map(|&b| mean(trace.as_slice(), b)).collect()))
            .collect();
        let spectra = self.spectra.as_ref().map(|s| {
            DMatrix::from_fn(kept.len(), s.ncols(), |r, c| {
                let bin = &members[kept[r]];
                bin.iter().map(|&k| s[(k, c)]).sum::<f64>() / bin.len() as f64
            })
        });

        Ok(BinnedTraces {
            bin_centers: kept.iter().map(|&b| 0.5 * (edges[b] + edges[b + 1])).collect(),
            binned_param: kept.iter().map(|&b| mean(values, b)).collect(),
            counts: kept.iter().map(|&b| members[b].len()).collect(),
            columns,
            spectra,
        })
    }

    // ── Internal helpers ──

    fn require(&self, name: &str) -> Result<&[f64]> {
        self.column(name)
            .ok_or_else(|| anyhow!("no column '{}' in trace table", name))
    }

    /// Sample count set by columns other than `name`, or by the spectra.
    fn len_excluding(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .find(|(k, _)| k.as_str() != name)
            .map(|(_, v)| v.len())
            .or_else(|| self.spectra.as_ref().map(|s| s.nrows()))
    }
}

/// Per-bin averages of a [`TraceTable`]; only bins with samples are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct BinnedTraces {
    /// Midpoint of each kept bin's edges.
    pub bin_centers: Vec<f64>,
    /// Mean of the binning parameter inside each bin.
    pub binned_param: Vec<f64>,
    /// Samples per bin.
    pub counts: Vec<usize>,
    /// Mean of every column inside each bin.
    pub columns: BTreeMap<String, Vec<f64>>,
    /// Mean spectrum per bin.
    pub spectra: Option<DMatrix<f64>>,
}

impl BinnedTraces {
    pub fn len(&self) -> usize {
        self.bin_centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bin_centers.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }
}

/// Index of the sample nearest `wavelength` in an ascending axis. Ties go
/// to the shorter wavelength; values past either end clamp to it.
pub fn wavelength_to_index(wavelengths: &[f64], wavelength: f64) -> Option<usize> {
    let n = wavelengths.len();
    if n == 0 {
        return None;
    }
    let i = wavelengths.partition_point(|&w| w <= wavelength);
    Some(match i {
        0 => 0,
        i if i == n => n - 1,
        i if (wavelength - wavelengths[i]).abs() < (wavelength - wavelengths[i - 1]).abs() => i,
        i => i - 1,
    })
}

/// Index range covering `[low, high]` of an ascending axis, for cropping
/// spectra to a band (e.g. 500-900 nm).
pub fn wavelength_band(wavelengths: &[f64], low: f64, high: f64) -> Option<Range<usize>> {
    let start = wavelength_to_index(wavelengths, low)?;
    let end = wavelength_to_index(wavelengths, high)?;
    Some(start..end.max(start))
}

/// Optical frequency (Hz) of a vacuum wavelength in metres.
pub fn frequency_from_wavelength(wavelength: f64) -> f64 {
    SPEED_OF_LIGHT / wavelength
}

/// Photon energy (eV) of a vacuum wavelength in metres.
pub fn photon_energy_ev(wavelength: f64) -> f64 {
    PLANCK / ELEMENTARY_CHARGE * frequency_from_wavelength(wavelength)
}

/// Energy axis (eV) of a wavelength axis in metres.
pub fn energy_axis(wavelengths: &[f64]) -> Vec<f64> {
    wavelengths.iter().map(|&w| photon_energy_ev(w)).collect()
}
