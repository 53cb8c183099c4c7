//! Distance kernels using simsimd
//!
//! simsimd provides SIMD-optimized distance calculations with automatic
//! CPU feature detection (AVX512, AVX2, SSE, NEON). It returns `None` when
//! the slices differ in length, in which case the portable loops are used.

use simsimd::SpatialSimilarity;

/// Euclidean (L2) distance
#[inline]
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    match f32::sqeuclidean(a, b) {
        Some(d) => (d as f32).sqrt(),
        None => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

/// Squared L2 distance, used for centroid assignment
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    match f32::sqeuclidean(a, b) {
        Some(d) => d as f32,
        None => a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum(),
    }
}

/// Manhattan (L1) distance
///
/// simsimd doesn't have L1, so implement manually
#[inline]
pub fn l1(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// Cosine distance: 1 - (a · b) / (||a|| * ||b||)
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    // simsimd::cosine() returns cosine distance (1 - similarity) directly
    match f32::cosine(a, b) {
        Some(d) => d as f32,
        None => {
            let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
            for (x, y) in a.iter().zip(b.iter()) {
                dot += x * y;
                na += x * x;
                nb += y * y;
            }
            if na == 0.0 || nb == 0.0 {
                return 1.0;
            }
            1.0 - dot / (na.sqrt() * nb.sqrt())
        }
    }
}
