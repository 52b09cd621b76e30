//! Distance metric selector for kNN search.

use serde::{Deserialize, Serialize};

/// Supported vector distance metrics.
///
/// Cosine is exact only on L2-normalized inputs, which the store enforces on
/// its write path. Euclidean and Manhattan distances are converted to
/// higher-is-better similarities by `1/(1+d)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    Dot,
    Manhattan,
}

impl DistanceMetric {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "euclidean",
            Self::Dot => "dot",
            Self::Manhattan => "manhattan",
        }
    }
}
