//! Tier-aware payload codec.
//!
//! Owns the trained PQ codebooks (referenced by integer index from stored
//! payloads) and encodes/decodes every tier representation. Implements the
//! store's [`PayloadCodec`] so reads always come back as float32.

use std::path::Path;

use engram_error::{EngramError, Result};
use engram_types::{CompressionConfig, CompressionTier, VectorCodec};
use engram_vector::{PayloadCodec, StoredPayload, decode_f32};
use parking_lot::RwLock;
use tracing::warn;

use crate::binary;
use crate::f16;
use crate::int8::{Int8Mode, Int8Quantizer};
use crate::pq::{CENTROIDS_PQ4, CENTROIDS_PQ8, PqCodebook};

pub struct TierCodecs {
    dim: usize,
    config: CompressionConfig,
    int8: Int8Quantizer,
    pq8: RwLock<Vec<PqCodebook>>,
    pq4: RwLock<Vec<PqCodebook>>,
}

impl TierCodecs {
    #[must_use]
    pub fn new(dim: usize, config: CompressionConfig) -> Self {
        let int8 = Int8Quantizer::new(Int8Mode::Symmetric, config.int8_max_relative_error);
        Self {
            dim,
            config,
            int8,
            pq8: RwLock::new(Vec::new()),
            pq4: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Codec a tier resolves to under the current configuration.
    #[must_use]
    pub fn codec_for_tier(&self, tier: CompressionTier) -> VectorCodec {
        match tier {
            CompressionTier::Warm if self.config.warm_int8 => VectorCodec::Int8,
            other => other.codec(),
        }
    }

    /// Whether encoding to `tier` is currently possible.
    #[must_use]
    pub fn is_ready(&self, tier: CompressionTier) -> bool {
        match tier {
            CompressionTier::Cool => !self.pq8.read().is_empty(),
            CompressionTier::Cold => !self.pq4.read().is_empty(),
            _ => true,
        }
    }

    /// Register a trained codebook, returning its integer identity.
    pub fn install_codebook(&self, codebook: PqCodebook) -> Result<u32> {
        let books = match codebook.num_centroids {
            CENTROIDS_PQ8 => &self.pq8,
            CENTROIDS_PQ4 => &self.pq4,
            other => {
                return Err(EngramError::Internal(format!(
                    "unsupported centroid count {other}"
                )));
            }
        };
        let mut books = books.write();
        books.push(codebook);
        Ok((books.len() - 1) as u32)
    }

    /// Load previously persisted codebooks from `dir`; missing files are
    /// fine (the manager trains on demand).
    pub fn load_codebooks(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0usize;
        for centroids in [CENTROIDS_PQ8, CENTROIDS_PQ4] {
            for index in 0.. {
                let path = PqCodebook::file_path(dir, centroids, index);
                if !engram_fs::is_file(&path) {
                    break;
                }
                match PqCodebook::load(dir, centroids, index) {
                    Ok(codebook) => {
                        let _ = self.install_codebook(codebook)?;
                        loaded += 1;
                    }
                    Err(err) => {
                        warn!(
                            target: "engram.compress::codec",
                            path = %path.display(),
                            error = %err,
                            "skipping unreadable codebook"
                        );
                        break;
                    }
                }
            }
        }
        Ok(loaded)
    }

    fn latest_book_index(&self, tier: CompressionTier) -> Option<u32> {
        let books = match tier {
            CompressionTier::Cool => self.pq8.read(),
            CompressionTier::Cold => self.pq4.read(),
            _ => return None,
        };
        books.len().checked_sub(1).map(|i| i as u32)
    }

    fn not_trained(&self, tier: CompressionTier, have: usize) -> EngramError {
        EngramError::CodecNotTrained {
            tier,
            have,
            need: self.config.min_training_size,
        }
    }

    /// Encode a float32 vector for `tier`.
    pub fn encode_for_tier(&self, tier: CompressionTier, vector: &[f32]) -> Result<StoredPayload> {
        if vector.len() != self.dim {
            return Err(EngramError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        match self.codec_for_tier(tier) {
            VectorCodec::F32 => Ok(StoredPayload::from_f32(vector)),
            VectorCodec::F16 => Ok(StoredPayload {
                codec: VectorCodec::F16,
                bytes: f16::encode(vector),
                codebook: None,
            }),
            VectorCodec::Int8 => Ok(StoredPayload {
                codec: VectorCodec::Int8,
                bytes: self.int8.encode(vector),
                codebook: None,
            }),
            VectorCodec::Pq8 => {
                let books = self.pq8.read();
                let index = books.len().checked_sub(1).ok_or_else(|| self.not_trained(tier, 0))?;
                Ok(StoredPayload {
                    codec: VectorCodec::Pq8,
                    bytes: books[index].encode(vector)?,
                    codebook: Some(index as u32),
                })
            }
            VectorCodec::Pq4 => {
                let books = self.pq4.read();
                let index = books.len().checked_sub(1).ok_or_else(|| self.not_trained(tier, 0))?;
                Ok(StoredPayload {
                    codec: VectorCodec::Pq4,
                    bytes: books[index].encode(vector)?,
                    codebook: Some(index as u32),
                })
            }
            VectorCodec::Binary1 => Ok(StoredPayload {
                codec: VectorCodec::Binary1,
                bytes: binary::encode(vector),
                codebook: None,
            }),
        }
    }

    #[must_use]
    pub fn latest_codebook_for(&self, tier: CompressionTier) -> Option<u32> {
        self.latest_book_index(tier)
    }

    fn decode_pq(
        &self,
        books: &RwLock<Vec<PqCodebook>>,
        tier: CompressionTier,
        payload: &StoredPayload,
    ) -> Result<Vec<f32>> {
        let books = books.read();
        let index = payload
            .codebook
            .ok_or_else(|| self.not_trained(tier, 0))? as usize;
        let book = books.get(index).ok_or_else(|| self.not_trained(tier, 0))?;
        book.decode(&payload.bytes)
    }
}

impl PayloadCodec for TierCodecs {
    fn decode(&self, payload: &StoredPayload, dim: usize) -> Result<Vec<f32>> {
        match payload.codec {
            VectorCodec::F32 => decode_f32(&payload.bytes, dim),
            VectorCodec::F16 => f16::decode(&payload.bytes, dim).ok_or(EngramError::DimensionMismatch {
                expected: dim * 2,
                actual: payload.bytes.len(),
            }),
            VectorCodec::Int8 => self.int8.decode(&payload.bytes, dim),
            VectorCodec::Pq8 => self.decode_pq(&self.pq8, CompressionTier::Cool, payload),
            VectorCodec::Pq4 => self.decode_pq(&self.pq4, CompressionTier::Cold, payload),
            VectorCodec::Binary1 => {
                binary::decode(&payload.bytes, dim).ok_or(EngramError::DimensionMismatch {
                    expected: dim.div_ceil(8),
                    actual: payload.bytes.len(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_types::CompressionConfig;

    fn sample(n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let raw: Vec<f32> = (0..dim)
                    .map(|j| (((i * 29 + j * 13) % 83) as f32 / 83.0) - 0.5)
                    .collect();
                engram_vector::l2_normalize(&raw).unwrap()
            })
            .collect()
    }

    #[test]
    fn warm_defaults_to_f16_and_flips_to_int8_by_config() {
        let plain = TierCodecs::new(32, CompressionConfig::default());
        assert_eq!(plain.codec_for_tier(CompressionTier::Warm), VectorCodec::F16);

        let mut config = CompressionConfig::default();
        config.warm_int8 = true;
        let alt = TierCodecs::new(32, config);
        assert_eq!(alt.codec_for_tier(CompressionTier::Warm), VectorCodec::Int8);
    }

    #[test]
    fn warm_round_trip_is_within_bound() {
        let codecs = TierCodecs::new(32, CompressionConfig::default());
        let v = &sample(1, 32)[0];
        let payload = codecs.encode_for_tier(CompressionTier::Warm, v).unwrap();
        assert_eq!(payload.bytes.len(), 64);
        let back = codecs.decode(&payload, 32).unwrap();
        let mean_err: f32 =
            v.iter().zip(back.iter()).map(|(a, b)| (a - b).abs()).sum::<f32>() / 32.0;
        assert!(mean_err <= CompressionTier::Warm.max_reconstruction_error());
    }

    #[test]
    fn pq_encode_without_codebook_is_codec_not_trained() {
        let codecs = TierCodecs::new(32, CompressionConfig::default());
        let v = &sample(1, 32)[0];
        assert!(matches!(
            codecs.encode_for_tier(CompressionTier::Cool, v).unwrap_err(),
            EngramError::CodecNotTrained { .. }
        ));
        assert!(!codecs.is_ready(CompressionTier::Cool));
    }

    #[test]
    fn installed_codebook_enables_pq_round_trip() {
        let codecs = TierCodecs::new(32, CompressionConfig::default());
        let data = sample(300, 32);
        let book = PqCodebook::train(&data, 32, 8, CENTROIDS_PQ8, 8, 3).unwrap();
        let index = codecs.install_codebook(book).unwrap();
        assert_eq!(index, 0);

        let payload = codecs.encode_for_tier(CompressionTier::Cool, &data[5]).unwrap();
        assert_eq!(payload.codebook, Some(0));
        let back = codecs.decode(&payload, 32).unwrap();
        let mean_err: f32 = data[5]
            .iter()
            .zip(back.iter())
            .map(|(a, b)| (a - b).abs())
            .sum::<f32>()
            / 32.0;
        assert!(mean_err <= CompressionTier::Cool.max_reconstruction_error());
    }

    #[test]
    fn frozen_round_trip_is_unit_norm() {
        let codecs = TierCodecs::new(32, CompressionConfig::default());
        let v = &sample(1, 32)[0];
        let payload = codecs.encode_for_tier(CompressionTier::Frozen, v).unwrap();
        assert_eq!(payload.bytes.len(), 4);
        let back = codecs.decode(&payload, 32).unwrap();
        assert!((engram_vector::l2_norm(&back) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn codebooks_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let codecs = TierCodecs::new(32, CompressionConfig::default());
        let data = sample(128, 32);
        let book = PqCodebook::train(&data, 32, 8, CENTROIDS_PQ4, 6, 5).unwrap();
        book.save(dir.path(), 0).unwrap();

        assert_eq!(codecs.load_codebooks(dir.path()).unwrap(), 1);
        assert!(codecs.is_ready(CompressionTier::Cold));
    }
}
