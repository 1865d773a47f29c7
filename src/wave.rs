//! Reader for Igor text waves (`.itx`), the format the scan controller writes.
//!
//! A file looks like
//!
//! ```text
//! IGOR
//! WAVES/D/N=(3,2)	alignment_scan_fr
//! BEGIN
//! 	0.1	0.2
//! 	0.3	0.4
//! 	0.5	0.6
//! END
//! X SetScale/P x -0.5,0.25,"", alignment_scan_fr; SetScale/P y 1,0.5,"", alignment_scan_fr
//! ```
//!
//! The text is tokenized on tabs and line breaks. Values between `BEGIN` and
//! `END` are listed row by row. Text waves (`WAVES/T`) hold double-quoted
//! strings. Only the first wave of a file is read.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use nalgebra::DMatrix;
use tracing::debug;

use crate::axis::AxisScale;

/// Payload of a wave.
#[derive(Debug, Clone, PartialEq)]
pub enum WaveData {
    /// Numeric samples; a 1D wave is an `n × 1` matrix.
    Numeric(DMatrix<f64>),
    /// Strings with their quotes removed.
    Text(DMatrix<String>),
}

/// One wave read from an `.itx` file.
#[derive(Debug, Clone, PartialEq)]
pub struct Wave {
    pub name: String,
    pub data: WaveData,
    /// Scaling of the first (row) dimension.
    pub x_scale: AxisScale,
    /// Scaling of the second (column) dimension.
    pub y_scale: AxisScale,
}

impl Wave {
    /// `(rows, cols)` of the payload.
    pub fn shape(&self) -> (usize, usize) {
        match &self.data {
            WaveData::Numeric(m) => m.shape(),
            WaveData::Text(m) => m.shape(),
        }
    }

    pub fn numeric(&self) -> Option<&DMatrix<f64>> {
        match &self.data {
            WaveData::Numeric(m) => Some(m),
            WaveData::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&DMatrix<String>> {
        match &self.data {
            WaveData::Text(m) => Some(m),
            WaveData::Numeric(_) => None,
        }
    }

    /// Take the numeric payload, failing for text waves.
    pub fn into_numeric(self) -> Result<DMatrix<f64>> {
        match self.data {
            WaveData::Numeric(m) => Ok(m),
            WaveData::Text(_) => bail!("wave '{}' is a text wave, expected numeric", self.name),
        }
    }

    /// Physical coordinates of every row.
    pub fn x_values(&self) -> Vec<f64> {
        self.x_scale.values(self.shape().0)
    }

    /// Physical coordinates of every column.
    pub fn y_values(&self) -> Vec<f64> {
        self.y_scale.values(self.shape().1)
    }
}

/// Read and parse an `.itx` file.
pub fn load_itx(path: impl AsRef<Path>) -> Result<Wave> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read wave file: {}", path.display()))?;
    let wave =
        parse_itx(&text).with_context(|| format!("Failed to parse wave file: {}", path.display()))?;
    debug!(
        "Loaded wave '{}' {:?} from {}",
        wave.name,
        wave.shape(),
        path.display()
    );
    Ok(wave)
}

/// Parse the contents of an `.itx` file.
pub fn parse_itx(text: &str) -> Result<Wave> {
    let tokens: Vec<&str> = text
        .split(['\t', '\r', '\n'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    let header_idx = tokens
        .iter()
        .position(|t| t.starts_with("WAVES"))
        .ok_or_else(|| anyhow!("no WAVES declaration"))?;
    let header = tokens[header_idx];
    let is_text = header_flags(header).any(|f| f == "T");
    let dims = header_flags(header)
        .find_map(|f| f.strip_prefix("N="))
        .map(parse_dims)
        .transpose()?;

    // The name follows the declaration, either in the same token or the next
    let name = match header.split_once(char::is_whitespace) {
        Some((_, name)) => name.trim().to_string(),
        None => tokens
            .get(header_idx + 1)
            .filter(|t| **t != "BEGIN")
            .map(|t| t.to_string())
            .unwrap_or_default(),
    };

    let begin = tokens[header_idx..]
        .iter()
        .position(|t| *t == "BEGIN")
        .map(|i| i + header_idx)
        .ok_or_else(|| anyhow!("no BEGIN marker"))?;
    let end = tokens[begin..]
        .iter()
        .position(|t| *t == "END")
        .map(|i| i + begin)
        .ok_or_else(|| anyhow!("no END marker"))?;
    let values = &tokens[begin + 1..end];

    let (rows, cols) = dims.unwrap_or((values.len(), 1));
    anyhow::ensure!(
        values.len() == rows * cols,
        "wave '{}' declares {}x{} values but contains {}",
        name,
        rows,
        cols,
        values.len()
    );

    let data = if is_text {
        let strings: Vec<String> = values.iter().map(|v| unquote(v).to_string()).collect();
        WaveData::Text(DMatrix::from_row_slice(rows, cols, &strings))
    } else {
        let numbers = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                parse_number(v).with_context(|| {
                    format!("bad value '{}' at row {}, column {}", v, i / cols, i % cols)
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        WaveData::Numeric(DMatrix::from_row_slice(rows, cols, &numbers))
    };

    let trailer = &tokens[end + 1..];
    Ok(Wave {
        name,
        data,
        x_scale: find_scale(trailer, 'x')?.unwrap_or_default(),
        y_scale: find_scale(trailer, 'y')?.unwrap_or_default(),
    })
}

// ── Internal helpers ────────────────────────────────────────────────────────

/// Flags of a `WAVES/D/N=(3,2) name` declaration: `["D", "N=(3,2)"]`.
fn header_flags(header: &str) -> impl Iterator<Item = &str> {
    header
        .split(char::is_whitespace)
        .next()
        .unwrap_or("")
        .split('/')
        .skip(1)
}

/// `N=(rows,cols)` or `N=rows`.
fn parse_dims(decl: &str) -> Result<(usize, usize)> {
    let inner = decl.trim_start_matches('(').trim_end_matches(')');
    let dims = inner
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .with_context(|| format!("bad dimension in N={decl}"))
        })
        .collect::<Result<Vec<_>>>()?;
    match dims.as_slice() {
        [n] => Ok((*n, 1)),
        [rows, cols] => Ok((*rows, *cols)),
        _ => bail!("unsupported dimensionality N={decl}"),
    }
}

/// Igor writes NaN and ±INF literally.
fn parse_number(token: &str) -> Result<f64> {
    match token {
        "NaN" | "nan" => Ok(f64::NAN),
        "INF" | "inf" => Ok(f64::INFINITY),
        "-INF" | "-inf" => Ok(f64::NEG_INFINITY),
        _ => Ok(token.parse::<f64>()?),
    }
}

fn unquote(token: &str) -> &str {
    token
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(token)
}

/// Look for `SetScale/P <axis> origin,step,...` in the trailing commands.
/// The last matching command wins.
fn find_scale(tokens: &[&str], axis: char) -> Result<Option<AxisScale>> {
    let pattern = format!("SetScale/P {axis} ");
    for token in tokens.iter().rev() {
        let Some(pos) = token.find(&pattern) else {
            continue;
        };
        let args: Vec<&str> = token[pos + pattern.len()..].splitn(3, ',').collect();
        if args.len() < 2 {
            bail!("malformed scaling command: {token}");
        }
        let origin = parse_number(args[0].trim())
            .with_context(|| format!("bad {axis} origin in: {token}"))?;
        let step = parse_number(args[1].trim())
            .with_context(|| format!("bad {axis} step in: {token}"))?;
        return Ok(Some(AxisScale::new(origin, step)));
    }
    Ok(None)
}
