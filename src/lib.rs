//! # tipalign
//!
//! **2D Gaussian centroid fitting** for scanning-probe tip-alignment scans.
//!
//! An alignment scan rasters the tip over a small area and records a lock-in
//! amplitude map and a phase map. The tip position shows up as a roughly
//! Gaussian peak (amplitude) or dip (phase); fitting both locates the tip
//! and measures the spot size, and a series of scans tracks the tip as the
//! drive voltage is stepped.
//!
//! ## Features
//!
//! - **Moment estimate**: closed-form initial guess from marginal moments
//! - **Levenberg-Marquardt refinement**: analytic Jacobian, axis-aligned or
//!   correlated (elliptical) model, typed failures
//! - **Igor text waves**: reads the `.itx` maps and parameter tables the scan
//!   controller writes
//! - **Alignment series**: every `alignment_scan_<var>` map of a scan fitted
//!   with its polarity, aggregated by scan number, saved with
//!   [rkyv](https://docs.rs/rkyv)
//! - **Tip experiments**: snap-to-contact detection, parameter binning of
//!   force/spectra traces, wavelength and photon-energy conversions
//!
//! ## Example
//!
//! ```
//! use tipalign::{fit_gaussian, FitConfig, GaussianParameters};
//!
//! let truth = GaussianParameters::new(10.0, 25.0, 20.0, 4.0, 6.0, 1.0);
//! let field = truth.model().sample(50, 50);
//!
//! let fit = fit_gaussian(&field, &FitConfig::default()).unwrap();
//! assert!((fit.params.center_x - 25.0).abs() < 1e-6);
//! println!("FWHM: {:.3} x {:.3}", fit.params.fwhm_x(), fit.params.fwhm_y());
//! ```
//!
//! Loading and fitting a scan directory:
//!
//! ```no_run
//! use tipalign::{AlignmentScan, FitConfig};
//!
//! let scan = AlignmentScan::load("data/alignment_scans/scan_40").unwrap();
//! let fit = scan.fit(&FitConfig::default()).unwrap();
//! for (channel, p) in &fit.channels {
//!     println!("{channel}: ({:.3}, {:.3})", p.center_x, p.center_y);
//! }
//! ```
//!
//! ## Coordinates
//!
//! Fields are `nalgebra` matrices. `x` runs along rows (first index) and `y`
//! along columns. Fits are done in index units; [`GaussianParameters::to_physical`]
//! applies a wave's axis scaling.

pub mod alignment;
pub mod axis;
mod error;
pub mod estimate;
pub mod fit;
mod gaussian;
pub mod params;
pub mod refine;
pub mod tip_experiment;
pub mod wave;

pub use alignment::{
    channel_from_file_name, fit_with_polarity, AlignmentFit, AlignmentRecord, AlignmentScan,
    AlignmentSeries, ChannelFit, ChannelSummary, Polarity, ScanChannel,
};
pub use axis::AxisScale;
pub use error::FitError;
pub use estimate::{estimate_initial, BaselineEstimate, EstimateConfig};
pub use fit::{fit_gaussian, FitConfig, GaussianFit};
pub use gaussian::*;
pub use params::{ParamValue, ParameterError, ScanParameters};
pub use refine::{refine, RefineConfig};
pub use tip_experiment::{snap_to_contact, BinnedTraces, TraceTable};
pub use wave::{load_itx, parse_itx, Wave, WaveData};

/// A sampled 2D intensity map (row = x, column = y).
pub type IntensityField = nalgebra::DMatrix<f64>;
