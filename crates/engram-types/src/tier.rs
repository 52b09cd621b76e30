//! Compression tier table.
//!
//! Five tiers ordered hottest to coldest. Transitions are strictly forward
//! (toward colder tiers); the ordering is canonical and load-bearing for the
//! manager's invariants.

use serde::{Deserialize, Serialize};

/// Number of product-quantization subvectors at `D = 1536`.
pub const PQ_SUBVECTORS: usize = 96;

/// Storage codec backing a tier.
///
/// `Int8` is not a tier default; it is the configurable alternative for the
/// Warm tier (4× reduction instead of f16's 2×, at a small recall cost).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorCodec {
    F32,
    F16,
    Int8,
    Pq8,
    Pq4,
    Binary1,
}

/// Lifecycle tier of a stored vector, hottest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionTier {
    Hot,
    Warm,
    Cool,
    Cold,
    Frozen,
}

impl CompressionTier {
    /// All tiers in canonical (hottest-first) order.
    pub const ALL: [Self; 5] = [Self::Hot, Self::Warm, Self::Cool, Self::Cold, Self::Frozen];

    /// Position in the canonical order; larger means colder.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Hot => 0,
            Self::Warm => 1,
            Self::Cool => 2,
            Self::Cold => 3,
            Self::Frozen => 4,
        }
    }

    /// Codec used by this tier.
    #[must_use]
    pub fn codec(self) -> VectorCodec {
        match self {
            Self::Hot => VectorCodec::F32,
            Self::Warm => VectorCodec::F16,
            Self::Cool => VectorCodec::Pq8,
            Self::Cold => VectorCodec::Pq4,
            Self::Frozen => VectorCodec::Binary1,
        }
    }

    /// Stored payload bytes per vector of dimension `dim`.
    #[must_use]
    pub fn bytes_per_vector(self, dim: usize) -> usize {
        match self {
            Self::Hot => dim * 4,
            Self::Warm => dim * 2,
            Self::Cool => PQ_SUBVECTORS,
            Self::Cold => PQ_SUBVECTORS / 2,
            Self::Frozen => dim.div_ceil(8),
        }
    }

    /// Heat window `[min, max)` that keeps a vector in this tier.
    #[must_use]
    pub fn heat_window(self) -> (f32, f32) {
        match self {
            Self::Hot => (0.7, 1.0),
            Self::Warm => (0.4, 0.7),
            Self::Cool => (0.2, 0.4),
            Self::Cold => (0.05, 0.2),
            Self::Frozen => (0.0, 0.05),
        }
    }

    /// Heat score below which the scheduler migrates one tier colder.
    #[inline]
    #[must_use]
    pub fn min_heat_score(self) -> f32 {
        self.heat_window().0
    }

    /// Max tolerated mean per-component reconstruction error.
    #[must_use]
    pub fn max_reconstruction_error(self) -> f32 {
        match self {
            Self::Hot => 0.0,
            Self::Warm => 1e-3,
            Self::Cool => 0.05,
            Self::Cold => 0.15,
            Self::Frozen => 0.5,
        }
    }

    /// Next colder tier, or `None` from `Frozen`.
    #[must_use]
    pub fn next_colder(self) -> Option<Self> {
        match self {
            Self::Hot => Some(Self::Warm),
            Self::Warm => Some(Self::Cool),
            Self::Cool => Some(Self::Cold),
            Self::Cold => Some(Self::Frozen),
            Self::Frozen => None,
        }
    }

    /// Whether a transition from `self` to `target` moves strictly colder.
    #[inline]
    #[must_use]
    pub fn is_forward_to(self, target: Self) -> bool {
        target.index() > self.index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_is_strictly_colder() {
        for window in CompressionTier::ALL.windows(2) {
            assert!(window[0].is_forward_to(window[1]));
            assert!(!window[1].is_forward_to(window[0]));
            assert_eq!(window[0].next_colder(), Some(window[1]));
        }
        assert_eq!(CompressionTier::Frozen.next_colder(), None);
    }

    #[test]
    fn heat_windows_tile_the_unit_interval() {
        let mut upper = 1.0f32;
        for tier in CompressionTier::ALL {
            let (lo, hi) = tier.heat_window();
            assert!(lo < hi, "{tier:?} window inverted");
            assert!((hi - upper).abs() < f32::EPSILON, "{tier:?} gap below {upper}");
            upper = lo;
        }
        assert_eq!(upper, 0.0);
    }

    #[test]
    fn bytes_per_vector_at_default_dim() {
        assert_eq!(CompressionTier::Hot.bytes_per_vector(1536), 6144);
        assert_eq!(CompressionTier::Warm.bytes_per_vector(1536), 3072);
        assert_eq!(CompressionTier::Cool.bytes_per_vector(1536), 96);
        assert_eq!(CompressionTier::Cold.bytes_per_vector(1536), 48);
        assert_eq!(CompressionTier::Frozen.bytes_per_vector(1536), 192);
    }

    #[test]
    fn reconstruction_error_grows_colder() {
        let mut prev = -1.0f32;
        for tier in CompressionTier::ALL {
            assert!(tier.max_reconstruction_error() > prev);
            prev = tier.max_reconstruction_error();
        }
    }
}
