//! Product quantization codebooks (PQ8 / PQ4).
//!
//! Each vector splits into `num_subvectors` equal slices; a per-slice
//! k-means codebook of 256 (PQ8) or 16 (PQ4) centroids turns every slice
//! into one code. Codebooks are trained from a stored-vector sample, are
//! referenced by integer index from compressed payloads, and persist as
//! checksummed `.cb` files.

use std::path::{Path, PathBuf};

use engram_error::{EngramError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

const MAGIC: &[u8; 4] = b"EGCB";
const VERSION: u32 = 1;

/// PQ8 centroid count.
pub const CENTROIDS_PQ8: usize = 256;
/// PQ4 centroid count.
pub const CENTROIDS_PQ4: usize = 16;

/// A trained product-quantization codebook.
#[derive(Debug, Clone, PartialEq)]
pub struct PqCodebook {
    pub num_subvectors: usize,
    pub subvector_dim: usize,
    pub num_centroids: usize,
    /// Flattened `[subvector][centroid][component]`.
    centroids: Vec<f32>,
}

impl PqCodebook {
    /// Train from a sample. `num_centroids` must be 16 or 256 and the
    /// dimension must divide evenly into subvectors.
    pub fn train(
        sample: &[Vec<f32>],
        dim: usize,
        num_subvectors: usize,
        num_centroids: usize,
        iterations: u32,
        seed: u64,
    ) -> Result<Self> {
        if num_centroids != CENTROIDS_PQ4 && num_centroids != CENTROIDS_PQ8 {
            return Err(EngramError::Internal(format!(
                "unsupported centroid count {num_centroids}"
            )));
        }
        if num_subvectors == 0 || dim % num_subvectors != 0 {
            return Err(EngramError::DimensionMismatch {
                expected: num_subvectors,
                actual: dim,
            });
        }
        if sample.is_empty() {
            return Err(EngramError::Internal("empty training sample".to_string()));
        }
        let subvector_dim = dim / num_subvectors;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut centroids = Vec::with_capacity(num_subvectors * num_centroids * subvector_dim);

        for sub in 0..num_subvectors {
            let offset = sub * subvector_dim;
            let slices: Vec<&[f32]> = sample
                .iter()
                .map(|v| &v[offset..offset + subvector_dim])
                .collect();
            let trained = kmeans(&slices, num_centroids, subvector_dim, iterations, &mut rng);
            centroids.extend_from_slice(&trained);
        }

        info!(
            target: "engram.compress::pq",
            num_subvectors,
            num_centroids,
            sample = sample.len(),
            "codebook trained"
        );
        Ok(Self {
            num_subvectors,
            subvector_dim,
            num_centroids,
            centroids,
        })
    }

    #[inline]
    fn centroid(&self, sub: usize, code: usize) -> &[f32] {
        let start = (sub * self.num_centroids + code) * self.subvector_dim;
        &self.centroids[start..start + self.subvector_dim]
    }

    fn nearest_code(&self, sub: usize, slice: &[f32]) -> usize {
        let mut best = 0usize;
        let mut best_dist = f32::INFINITY;
        for code in 0..self.num_centroids {
            let centroid = self.centroid(sub, code);
            let dist: f32 = slice
                .iter()
                .zip(centroid.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            if dist < best_dist {
                best_dist = dist;
                best = code;
            }
        }
        best
    }

    /// Encode to packed codes: one byte per code for PQ8, two codes per
    /// byte (low nibble first) for PQ4.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        let dim = self.num_subvectors * self.subvector_dim;
        if vector.len() != dim {
            return Err(EngramError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            });
        }
        let codes: Vec<usize> = (0..self.num_subvectors)
            .map(|sub| {
                let offset = sub * self.subvector_dim;
                self.nearest_code(sub, &vector[offset..offset + self.subvector_dim])
            })
            .collect();

        if self.num_centroids == CENTROIDS_PQ8 {
            Ok(codes.into_iter().map(|c| c as u8).collect())
        } else {
            let mut out = vec![0u8; self.num_subvectors.div_ceil(2)];
            for (i, code) in codes.into_iter().enumerate() {
                let nibble = (code as u8) & 0x0F;
                if i % 2 == 0 {
                    out[i / 2] |= nibble;
                } else {
                    out[i / 2] |= nibble << 4;
                }
            }
            Ok(out)
        }
    }

    /// Decode packed codes back to an approximate vector.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let expected = if self.num_centroids == CENTROIDS_PQ8 {
            self.num_subvectors
        } else {
            self.num_subvectors.div_ceil(2)
        };
        if bytes.len() != expected {
            return Err(EngramError::DimensionMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let mut out = Vec::with_capacity(self.num_subvectors * self.subvector_dim);
        for sub in 0..self.num_subvectors {
            let code = if self.num_centroids == CENTROIDS_PQ8 {
                bytes[sub] as usize
            } else {
                let byte = bytes[sub / 2];
                if sub % 2 == 0 {
                    (byte & 0x0F) as usize
                } else {
                    (byte >> 4) as usize
                }
            };
            out.extend_from_slice(self.centroid(sub, code));
        }
        Ok(out)
    }

    /// Mean per-component reconstruction error over a sample.
    pub fn reconstruction_error(&self, sample: &[Vec<f32>]) -> Result<f32> {
        if sample.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0f64;
        let mut components = 0usize;
        for vector in sample {
            let decoded = self.decode(&self.encode(vector)?)?;
            for (a, b) in vector.iter().zip(decoded.iter()) {
                total += f64::from((a - b).abs());
            }
            components += vector.len();
        }
        Ok((total / components.max(1) as f64) as f32)
    }

    // ── Persistence ──

    /// `codebooks/pq{8,4}_{index}.cb`
    #[must_use]
    pub fn file_path(dir: &Path, num_centroids: usize, index: usize) -> PathBuf {
        let kind = if num_centroids == CENTROIDS_PQ8 { 8 } else { 4 };
        dir.join(format!("pq{kind}_{index}.cb"))
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.centroids.len() * 4);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.num_subvectors as u32).to_le_bytes());
        out.extend_from_slice(&(self.subvector_dim as u32).to_le_bytes());
        out.extend_from_slice(&(self.num_centroids as u32).to_le_bytes());
        for &value in &self.centroids {
            out.extend_from_slice(&value.to_le_bytes());
        }
        let crc = crc32c::crc32c(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn from_bytes(path: &Path, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 24 {
            return Err(EngramError::CorruptRecord {
                path: path.to_path_buf(),
                detail: "codebook file shorter than header".to_string(),
            });
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed = crc32c::crc32c(body);
        if stored != computed {
            return Err(EngramError::ChecksumMismatch {
                path: path.to_path_buf(),
                stored,
                computed,
            });
        }
        if &body[0..4] != MAGIC {
            return Err(EngramError::CorruptRecord {
                path: path.to_path_buf(),
                detail: "bad magic".to_string(),
            });
        }
        let version = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
        if version != VERSION {
            return Err(EngramError::VersionMismatch {
                path: path.to_path_buf(),
                supported: VERSION,
                found: version,
            });
        }
        let num_subvectors = u32::from_le_bytes([body[8], body[9], body[10], body[11]]) as usize;
        let subvector_dim = u32::from_le_bytes([body[12], body[13], body[14], body[15]]) as usize;
        let num_centroids = u32::from_le_bytes([body[16], body[17], body[18], body[19]]) as usize;
        let expected = num_subvectors * subvector_dim * num_centroids * 4;
        let data = &body[20..];
        if data.len() != expected {
            return Err(EngramError::CorruptRecord {
                path: path.to_path_buf(),
                detail: format!("centroid payload {} != expected {expected}", data.len()),
            });
        }
        let centroids = data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            num_subvectors,
            subvector_dim,
            num_centroids,
            centroids,
        })
    }

    pub fn save(&self, dir: &Path, index: usize) -> Result<PathBuf> {
        engram_fs::create_dir_all(dir)?;
        let path = Self::file_path(dir, self.num_centroids, index);
        engram_fs::write_atomic(&path, &self.to_bytes())?;
        Ok(path)
    }

    pub fn load(dir: &Path, num_centroids: usize, index: usize) -> Result<Self> {
        let path = Self::file_path(dir, num_centroids, index);
        let bytes = engram_fs::read(&path)?;
        Self::from_bytes(&path, &bytes)
    }
}

fn kmeans(
    points: &[&[f32]],
    k: usize,
    dim: usize,
    iterations: u32,
    rng: &mut StdRng,
) -> Vec<f32> {
    let mut centroids = vec![0.0f32; k * dim];
    // Seed from random sample points (repeating when the sample is small).
    for c in 0..k {
        let pick = rng.gen_range(0..points.len());
        centroids[c * dim..(c + 1) * dim].copy_from_slice(points[pick]);
    }

    let mut assignment = vec![0usize; points.len()];
    for _ in 0..iterations {
        // Assign.
        for (p, point) in points.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f32::INFINITY;
            for c in 0..k {
                let centroid = &centroids[c * dim..(c + 1) * dim];
                let dist: f32 = point
                    .iter()
                    .zip(centroid.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            assignment[p] = best;
        }
        // Update.
        let mut sums = vec![0.0f32; k * dim];
        let mut counts = vec![0usize; k];
        for (p, point) in points.iter().enumerate() {
            let c = assignment[p];
            counts[c] += 1;
            for (j, &x) in point.iter().enumerate() {
                sums[c * dim + j] += x;
            }
        }
        for c in 0..k {
            if counts[c] == 0 {
                // Reseed an empty cluster from a random point.
                let pick = rng.gen_range(0..points.len());
                centroids[c * dim..(c + 1) * dim].copy_from_slice(points[pick]);
            } else {
                for j in 0..dim {
                    centroids[c * dim + j] = sums[c * dim + j] / counts[c] as f32;
                }
            }
        }
    }
    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let raw: Vec<f32> = (0..dim)
                    .map(|j| (((i * 31 + j * 17) % 101) as f32 / 101.0) - 0.5)
                    .collect();
                engram_vector::l2_normalize(&raw).unwrap()
            })
            .collect()
    }

    #[test]
    fn pq8_code_size_is_one_byte_per_subvector() {
        let data = sample(300, 32);
        let cb = PqCodebook::train(&data, 32, 8, CENTROIDS_PQ8, 6, 1).unwrap();
        let codes = cb.encode(&data[0]).unwrap();
        assert_eq!(codes.len(), 8);
    }

    #[test]
    fn pq4_packs_two_codes_per_byte() {
        let data = sample(300, 32);
        let cb = PqCodebook::train(&data, 32, 8, CENTROIDS_PQ4, 6, 1).unwrap();
        let codes = cb.encode(&data[0]).unwrap();
        assert_eq!(codes.len(), 4);
        let decoded = cb.decode(&codes).unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn training_error_is_within_cool_bound() {
        let data = sample(400, 32);
        let cb = PqCodebook::train(&data, 32, 8, CENTROIDS_PQ8, 10, 42).unwrap();
        let err = cb.reconstruction_error(&data).unwrap();
        assert!(
            err <= engram_types::CompressionTier::Cool.max_reconstruction_error(),
            "PQ8 error {err} over Cool bound"
        );
    }

    #[test]
    fn indivisible_dimension_is_rejected() {
        let data = sample(10, 30);
        assert!(matches!(
            PqCodebook::train(&data, 30, 8, CENTROIDS_PQ8, 4, 0).unwrap_err(),
            EngramError::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn persistence_round_trips_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(64, 16);
        let cb = PqCodebook::train(&data, 16, 4, CENTROIDS_PQ4, 4, 9).unwrap();
        cb.save(dir.path(), 0).unwrap();
        let loaded = PqCodebook::load(dir.path(), CENTROIDS_PQ4, 0).unwrap();
        assert_eq!(loaded, cb);
    }

    #[test]
    fn corrupted_codebook_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample(64, 16);
        let cb = PqCodebook::train(&data, 16, 4, CENTROIDS_PQ4, 4, 9).unwrap();
        let path = cb.save(dir.path(), 0).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert!(matches!(
            PqCodebook::from_bytes(&path, &bytes).unwrap_err(),
            EngramError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn deterministic_training_with_same_seed() {
        let data = sample(128, 16);
        let a = PqCodebook::train(&data, 16, 4, CENTROIDS_PQ4, 5, 7).unwrap();
        let b = PqCodebook::train(&data, 16, 4, CENTROIDS_PQ4, 5, 7).unwrap();
        assert_eq!(a, b);
    }
}
