//! Distance and similarity kernels.
//!
//! Search scores are natural similarities, higher is better: cosine and dot
//! pass through, Euclidean and Manhattan distances convert via `1/(1+d)`.
//! The [0,1] per-source mapping applied before fusion lives in
//! `engram-fusion`.

use engram_types::DistanceMetric;

#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[must_use]
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[must_use]
pub fn manhattan(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
}

/// Higher-is-better similarity under `metric`.
///
/// Cosine assumes L2-normalized inputs (enforced on the write path), so it
/// reduces to the dot product.
#[must_use]
pub fn similarity(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Dot => dot(a, b),
        DistanceMetric::Euclidean => 1.0 / (1.0 + euclidean(a, b)),
        DistanceMetric::Manhattan => 1.0 / (1.0 + manhattan(a, b)),
    }
}

/// Distance (lower is better) under `metric`, used by index construction.
#[must_use]
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine | DistanceMetric::Dot => 1.0 - dot(a, b),
        DistanceMetric::Euclidean => euclidean(a, b),
        DistanceMetric::Manhattan => manhattan(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_orthogonal_unit_vectors() {
        let a = [1.0, 0.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0, 0.0];
        assert_eq!(similarity(DistanceMetric::Cosine, &a, &b), 0.0);
        assert_eq!(similarity(DistanceMetric::Cosine, &a, &a), 1.0);
    }

    #[test]
    fn diagonal_scores_match_the_knn_scenario() {
        // v3 = (e0 + e1)/√2 against e0 scores ≈ 0.707.
        let inv = std::f32::consts::FRAC_1_SQRT_2;
        let e0 = [1.0, 0.0];
        let v3 = [inv, inv];
        let s = similarity(DistanceMetric::Cosine, &e0, &v3);
        assert!((s - inv).abs() < 1e-6, "got {s}");
    }

    #[test]
    fn euclidean_similarity_inverts_distance() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert_eq!(euclidean(&a, &b), 5.0);
        assert_eq!(similarity(DistanceMetric::Euclidean, &a, &b), 1.0 / 6.0);
    }

    #[test]
    fn manhattan_sums_absolute_components() {
        let a = [1.0, -1.0];
        let b = [0.0, 1.0];
        assert_eq!(manhattan(&a, &b), 3.0);
    }
}
