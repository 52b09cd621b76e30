//! Per-source score normalization to [0, 1].
//!
//! Cosine: `(1 + raw)/2`. Dot: cosine mapping when inputs are normalized,
//! sigmoid otherwise. Euclidean and Manhattan distances: `1/(1 + d)`.

use engram_types::DistanceMetric;

#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[must_use]
pub fn cosine_unit(raw: f32) -> f32 {
    ((1.0 + raw) / 2.0).clamp(0.0, 1.0)
}

#[must_use]
pub fn dot_unit(raw: f32, inputs_normalized: bool) -> f32 {
    if inputs_normalized {
        cosine_unit(raw)
    } else {
        sigmoid(raw)
    }
}

#[must_use]
pub fn distance_unit(distance: f32) -> f32 {
    (1.0 / (1.0 + distance.max(0.0))).clamp(0.0, 1.0)
}

/// Map a store similarity (natural, higher-is-better) to [0, 1].
///
/// The store already inverts Euclidean/Manhattan distances into
/// `1/(1+d)`, so those pass through.
#[must_use]
pub fn unit_score(metric: DistanceMetric, similarity: f32) -> f32 {
    match metric {
        DistanceMetric::Cosine => cosine_unit(similarity),
        // Stored vectors are L2-normalized on the write path.
        DistanceMetric::Dot => dot_unit(similarity, true),
        DistanceMetric::Euclidean | DistanceMetric::Manhattan => similarity.clamp(0.0, 1.0),
    }
}
