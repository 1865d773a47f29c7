//! Per-scan acquisition parameters (`parameters.itx`).
//!
//! The controller stores them as a two-column text wave of `key, value`
//! pairs. Values are typed by key: `time_stamp` is kept as text, the
//! alignment flags are integers and everything else is a number.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tracing::warn;

use crate::wave::{load_itx, Wave};

/// Keys stored as integers.
const INTEGER_KEYS: [&str; 3] = ["alignment_set", "electronic_alignment", "force_alignment"];

/// Keys stored verbatim.
const TEXT_KEYS: [&str; 1] = ["time_stamp"];

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Number(f64),
    Integer(i64),
    Text(String),
    /// Recorded as `NaN` by the controller.
    Missing,
}

/// Lookup failure for a required parameter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("parameter '{0}' is not present")]
    NotPresent(String),
    #[error("parameter '{0}' was recorded as NaN")]
    Missing(String),
    #[error("parameter '{key}' is not a {expected}")]
    WrongType { key: String, expected: &'static str },
}

/// Acquisition parameters of one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanParameters {
    values: BTreeMap<String, ParamValue>,
}

impl ScanParameters {
    /// Read `parameters.itx`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let wave = load_itx(path)?;
        Self::from_text_wave(&wave)
            .with_context(|| format!("Failed to read parameters from {}", path.display()))
    }

    /// Build from a `key, value` text wave.
    pub fn from_text_wave(wave: &Wave) -> Result<Self> {
        let Some(table) = wave.text() else {
            bail!("parameter wave '{}' is not a text wave", wave.name);
        };
        if table.ncols() < 2 {
            bail!(
                "parameter wave '{}' needs 2 columns, found {}",
                wave.name,
                table.ncols()
            );
        }

        let mut params = Self::default();
        for row in 0..table.nrows() {
            let key = table[(row, 0)].trim();
            if key.is_empty() {
                continue;
            }
            let value = parse_value(key, table[(row, 1)].trim())?;
            if value == ParamValue::Missing {
                warn!("Scan parameter '{}' is NaN, treating as missing", key);
            }
            params.values.insert(key.to_string(), value);
        }
        Ok(params)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ParamValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Numeric value; integers are widened.
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            ParamValue::Number(v) => Some(*v),
            ParamValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            ParamValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            ParamValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Numeric value or `default` when absent or missing.
    pub fn number_or(&self, key: &str, default: f64) -> f64 {
        self.number(key).unwrap_or(default)
    }

    /// Numeric value, with the reason when there is none.
    pub fn require_number(&self, key: &str) -> Result<f64, ParameterError> {
        match self.values.get(key) {
            None => Err(ParameterError::NotPresent(key.to_string())),
            Some(ParamValue::Missing) => Err(ParameterError::Missing(key.to_string())),
            Some(ParamValue::Number(v)) => Ok(*v),
            Some(ParamValue::Integer(v)) => Ok(*v as f64),
            Some(ParamValue::Text(_)) => Err(ParameterError::WrongType {
                key: key.to_string(),
                expected: "number",
            }),
        }
    }
}

fn parse_value(key: &str, raw: &str) -> Result<ParamValue> {
    if TEXT_KEYS.contains(&key) {
        return Ok(ParamValue::Text(raw.to_string()));
    }
    if raw.eq_ignore_ascii_case("nan") {
        return Ok(ParamValue::Missing);
    }
    if INTEGER_KEYS.contains(&key) {
        // Flags are sometimes written as "1.0"
        let v = raw
            .parse::<i64>()
            .or_else(|_| raw.parse::<f64>().map(|f| f as i64))
            .with_context(|| format!("parameter '{key}': '{raw}' is not an integer"))?;
        return Ok(ParamValue::Integer(v));
    }
    let v = raw
        .parse::<f64>()
        .with_context(|| format!("parameter '{key}': '{raw}' is not a number"))?;
    Ok(ParamValue::Number(v))
}
