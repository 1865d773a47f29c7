//! Aggregation of fitted scans across an alignment set.
//!
//! An alignment set is a sequence of scans taken while stepping the drive
//! voltage; the series collects one [`AlignmentRecord`] per scan, keyed by
//! scan number, and exposes per-channel columns for plotting the tip drift
//! against voltage or stage position.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Result;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{info, warn};

use super::{AlignmentFit, AlignmentScan, PARAMETERS_FILE};
use crate::fit::FitConfig;
use crate::params::ScanParameters;

/// Fit result and drive state of one scan.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct AlignmentRecord {
    pub voltage: Option<f64>,
    pub position: Option<f64>,
    pub fit: AlignmentFit,
}

impl AlignmentRecord {
    /// Fit a scan and capture its drive state.
    pub fn from_scan(
        scan: &AlignmentScan,
        config: &FitConfig,
    ) -> Result<Self, crate::error::FitError> {
        Ok(Self {
            voltage: scan.voltage(),
            position: scan.position(),
            fit: scan.fit(config)?,
        })
    }
}

/// Column view of one channel across the series, in scan order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSummary {
    pub scan_ids: Vec<u32>,
    pub amplitudes: Vec<f64>,
    pub x0: Vec<f64>,
    pub x_fwhm: Vec<f64>,
    pub y0: Vec<f64>,
    pub y_fwhm: Vec<f64>,
}

/// Fitted scans of an alignment set, ordered by scan number.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct AlignmentSeries {
    records: BTreeMap<u32, AlignmentRecord>,
}

impl AlignmentSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load, fit and collect every scan of `set` found in the subdirectories
    /// of `dir`.
    ///
    /// Scans without a recorded set count as set 0. Scans that cannot be
    /// read or fitted are logged and skipped, so one bad scan does not
    /// abort the set.
    pub fn from_directory(dir: impl AsRef<Path>, set: i64, config: &FitConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let mut scan_dirs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                scan_dirs.push(path);
            }
        }
        scan_dirs.sort();

        let mut series = Self::new();
        for scan_dir in scan_dirs {
            let Some(id) = super::scan_id_from_dir(&scan_dir) else {
                continue;
            };
            // Check the set before loading the maps
            let scan_set = match ScanParameters::load(scan_dir.join(PARAMETERS_FILE)) {
                Ok(params) => params.integer("alignment_set").unwrap_or(0),
                Err(e) => {
                    warn!("Skipping {}: {:#}", scan_dir.display(), e);
                    continue;
                }
            };
            if scan_set != set {
                continue;
            }

            let scan = match AlignmentScan::load(&scan_dir) {
                Ok(scan) => scan,
                Err(e) => {
                    warn!("Skipping {}: {:#}", scan_dir.display(), e);
                    continue;
                }
            };
            match AlignmentRecord::from_scan(&scan, config) {
                Ok(record) => {
                    series.insert(id, record);
                }
                Err(e) => warn!("Skipping scan {}: {}", id, e),
            }
        }

        info!(
            "Collected {} scans of alignment set {} from {}",
            series.len(),
            set,
            dir.display()
        );
        Ok(series)
    }

    /// Insert a record, returning any previous record for the same scan.
    pub fn insert(&mut self, scan_id: u32, record: AlignmentRecord) -> Option<AlignmentRecord> {
        self.records.insert(scan_id, record)
    }

    pub fn get(&self, scan_id: u32) -> Option<&AlignmentRecord> {
        self.records.get(&scan_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in ascending scan order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &AlignmentRecord)> {
        self.records.iter().map(|(id, r)| (*id, r))
    }

    /// Every channel fitted in at least one scan.
    pub fn channels(&self) -> BTreeSet<String> {
        self.records
            .values()
            .flat_map(|r| r.fit.channels.keys().cloned())
            .collect()
    }

    /// Amplitude, center and FWHM columns of one channel. Scans that did
    /// not record the channel are left out.
    pub fn channel_summary(&self, channel: &str) -> ChannelSummary {
        let mut summary = ChannelSummary::default();
        for (id, record) in self.iter() {
            let Some(p) = record.fit.channel(channel) else {
                continue;
            };
            summary.scan_ids.push(id);
            summary.amplitudes.push(p.amplitude);
            summary.x0.push(p.center_x);
            summary.x_fwhm.push(p.fwhm_x());
            summary.y0.push(p.center_y);
            summary.y_fwhm.push(p.fwhm_y());
        }
        summary
    }

    /// `(scan id, voltage)` for scans with a recorded voltage.
    pub fn voltages(&self) -> Vec<(u32, f64)> {
        self.iter()
            .filter_map(|(id, r)| r.voltage.map(|v| (id, v)))
            .collect()
    }

    /// `(scan id, 1000 · (position - min position))` for scans with a
    /// recorded position.
    pub fn relative_positions(&self) -> Vec<(u32, f64)> {
        let positions: Vec<(u32, f64)> = self
            .iter()
            .filter_map(|(id, r)| r.position.map(|p| (id, p)))
            .collect();
        let min = positions
            .iter()
            .map(|(_, p)| *p)
            .fold(f64::INFINITY, f64::min);
        positions
            .into_iter()
            .map(|(id, p)| (id, 1000.0 * (p - min)))
            .collect()
    }

    /// Serialize the series with rkyv.
    pub fn to_rkyv_bytes(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    /// Save the series to a file using rkyv.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path, &bytes)?;
        info!("Saved alignment series to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Deserialize a series from rkyv bytes of any alignment.
    pub fn from_rkyv_bytes(bytes: &[u8]) -> Result<Self> {
        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))
    }

    /// Load a series from an rkyv file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let series = Self::from_rkyv_bytes(&bytes)?;
        info!("Loaded alignment series: {} scans", series.len());
        Ok(series)
    }
}
