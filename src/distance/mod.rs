//! Distance metric calculations

use crate::error::{Error, Result};

pub mod scalar;

/// Distance metric types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceMetric {
    /// L2 / Euclidean distance: sqrt(sum((a - b)^2))
    #[default]
    L2,
    /// L1 / Manhattan distance: sum(|a - b|)
    L1,
    /// Cosine distance: 1 - (a · b) / (||a|| * ||b||)
    Cosine,
}

impl DistanceMetric {
    /// Parse distance metric from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            "l1" | "manhattan" => Ok(DistanceMetric::L1),
            "cosine" => Ok(DistanceMetric::Cosine),
            _ => Err(Error::InvalidConfig(format!(
                "Unknown distance metric '{}' (expected l2, l1 or cosine)",
                s
            ))),
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::L1 => "l1",
            DistanceMetric::Cosine => "cosine",
        }
    }

    /// Stable tag used in serialized indexes
    pub fn to_tag(self) -> u8 {
        match self {
            DistanceMetric::L2 => 0,
            DistanceMetric::L1 => 1,
            DistanceMetric::Cosine => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(DistanceMetric::L2),
            1 => Ok(DistanceMetric::L1),
            2 => Ok(DistanceMetric::Cosine),
            _ => Err(Error::Corrupt(format!("Unknown metric tag {}", tag))),
        }
    }
}

/// Calculate distance between two vectors of equal length
#[inline]
pub fn distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    match metric {
        DistanceMetric::L2 => scalar::l2(a, b),
        DistanceMetric::L1 => scalar::l1(a, b),
        DistanceMetric::Cosine => scalar::cosine(a, b),
    }
}

/// Checked variant for inputs that have not been validated yet
pub fn checked_distance(a: &[f32], b: &[f32], metric: DistanceMetric) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(distance(a, b, metric))
}
