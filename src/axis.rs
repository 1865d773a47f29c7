//! Linear axis scaling of a sampled wave (origin + uniform step).

use rkyv::{Archive, Deserialize, Serialize};

/// Maps array indices to physical coordinates: `value = origin + step · index`.
///
/// The default scale is the identity (origin 0, step 1), i.e. index space.
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
pub struct AxisScale {
    pub origin: f64,
    pub step: f64,
}

impl Default for AxisScale {
    fn default() -> Self {
        Self {
            origin: 0.0,
            step: 1.0,
        }
    }
}

impl AxisScale {
    pub fn new(origin: f64, step: f64) -> Self {
        Self { origin, step }
    }

    /// Recover the scale from an evenly spaced coordinate vector.
    /// Needs at least two samples.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        match values {
            [first, second, ..] => Some(Self::new(*first, second - first)),
            _ => None,
        }
    }

    /// Physical coordinate of a (possibly fractional) index.
    #[inline]
    pub fn value_at(&self, index: f64) -> f64 {
        self.origin + self.step * index
    }

    /// Coordinates of the first `n` samples.
    pub fn values(&self, n: usize) -> Vec<f64> {
        (0..n).map(|i| self.value_at(i as f64)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_default() {
        let axis = AxisScale::default();
        assert_eq!(axis.value_at(3.5), 3.5);
        assert_eq!(axis.values(3), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_from_values() {
        let axis = AxisScale::from_values(&[-1.0, -0.75, -0.5]).unwrap();
        assert_eq!(axis, AxisScale::new(-1.0, 0.25));
        assert!(AxisScale::from_values(&[1.0]).is_none());
    }
}
