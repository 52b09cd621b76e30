//! Weight persistence and checkpoint rotation.
//!
//! Layer files are `gnn/layer{K}.weights`:
//!
//! ```text
//! magic "EGNW" | version u32 | dim_in u32 | dim_out u32 | crc32 u32
//! weights f32×(dim_in·dim_out) | bias f32×dim_out
//! ```
//!
//! The CRC covers the payload and is computed before the atomic rename.
//! Checkpoints rotate as `gnn/checkpoints/layer{K}_{N}.ckpt`, keeping the
//! configured last N.

use std::path::{Path, PathBuf};

use engram_error::{EngramError, Result};
use tracing::debug;

use crate::layer::{Activation, DenseLayer};

const MAGIC: &[u8; 4] = b"EGNW";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

/// `layer{index}.weights` under `dir`.
#[must_use]
pub fn layer_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("layer{index}.weights"))
}

fn checkpoint_dir(dir: &Path) -> PathBuf {
    dir.join("checkpoints")
}

fn encode(layer: &DenseLayer) -> Vec<u8> {
    let mut payload = Vec::with_capacity((layer.weights.len() + layer.bias.len()) * 4);
    for &w in layer.weights.iter().chain(layer.bias.iter()) {
        payload.extend_from_slice(&w.to_le_bytes());
    }
    let crc = crc32c::crc32c(&payload);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(layer.dim_in as u32).to_le_bytes());
    out.extend_from_slice(&(layer.dim_out as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);
    out
}

fn decode(
    path: &Path,
    bytes: &[u8],
    expected_in: usize,
    expected_out: usize,
    activation: Activation,
) -> Result<DenseLayer> {
    if bytes.len() < HEADER_LEN {
        return Err(EngramError::CorruptRecord {
            path: path.to_path_buf(),
            detail: "weight file shorter than header".to_string(),
        });
    }
    if &bytes[0..4] != MAGIC {
        return Err(EngramError::CorruptRecord {
            path: path.to_path_buf(),
            detail: "bad magic".to_string(),
        });
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(EngramError::VersionMismatch {
            path: path.to_path_buf(),
            supported: VERSION,
            found: version,
        });
    }
    let dim_in = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let dim_out = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]) as usize;
    if dim_in != expected_in || dim_out != expected_out {
        return Err(EngramError::DimensionMismatch {
            expected: expected_in * expected_out,
            actual: dim_in * dim_out,
        });
    }
    let stored = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let payload = &bytes[HEADER_LEN..];
    let computed = crc32c::crc32c(payload);
    if stored != computed {
        return Err(EngramError::ChecksumMismatch {
            path: path.to_path_buf(),
            stored,
            computed,
        });
    }
    let expected_len = (dim_in * dim_out + dim_out) * 4;
    if payload.len() != expected_len {
        return Err(EngramError::CorruptRecord {
            path: path.to_path_buf(),
            detail: format!("payload {} != expected {expected_len}", payload.len()),
        });
    }
    let floats: Vec<f32> = payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let (weights, bias) = floats.split_at(dim_in * dim_out);
    Ok(DenseLayer {
        dim_in,
        dim_out,
        weights: weights.to_vec(),
        bias: bias.to_vec(),
        activation,
    })
}

/// Atomically persist one layer.
pub fn save_layer(dir: &Path, index: usize, layer: &DenseLayer) -> Result<PathBuf> {
    engram_fs::create_dir_all(dir)?;
    let path = layer_path(dir, index);
    engram_fs::write_atomic(&path, &encode(layer))?;
    Ok(path)
}

/// Load one layer, verifying shape and checksum.
pub fn load_layer(
    dir: &Path,
    index: usize,
    expected_in: usize,
    expected_out: usize,
    activation: Activation,
) -> Result<DenseLayer> {
    let path = layer_path(dir, index);
    let bytes = engram_fs::read(&path)?;
    decode(&path, &bytes, expected_in, expected_out, activation)
}

/// Existing checkpoint ordinals for `layer{index}`, ascending.
pub fn checkpoint_ordinals(dir: &Path, index: usize) -> Result<Vec<u64>> {
    let ckpt_dir = checkpoint_dir(dir);
    if !ckpt_dir.is_dir() {
        return Ok(Vec::new());
    }
    let prefix = format!("layer{index}_");
    let entries = std::fs::read_dir(&ckpt_dir).map_err(|e| EngramError::io(&ckpt_dir, e))?;
    let mut ordinals = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngramError::io(&ckpt_dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(rest) = name.strip_prefix(&prefix).and_then(|r| r.strip_suffix(".ckpt")) {
            if let Ok(ordinal) = rest.parse::<u64>() {
                ordinals.push(ordinal);
            }
        }
    }
    ordinals.sort_unstable();
    Ok(ordinals)
}

fn checkpoint_path(dir: &Path, index: usize, ordinal: u64) -> PathBuf {
    checkpoint_dir(dir).join(format!("layer{index}_{ordinal}.ckpt"))
}

/// Write the next numbered checkpoint and prune beyond `keep`.
pub fn checkpoint_layer(dir: &Path, index: usize, layer: &DenseLayer, keep: usize) -> Result<u64> {
    let ckpt_dir = checkpoint_dir(dir);
    engram_fs::create_dir_all(&ckpt_dir)?;
    let ordinals = checkpoint_ordinals(dir, index)?;
    let next = ordinals.last().map_or(1, |last| last + 1);
    engram_fs::write_atomic(&checkpoint_path(dir, index, next), &encode(layer))?;

    let total = ordinals.len() + 1;
    if total > keep {
        for stale in &ordinals[..total - keep] {
            engram_fs::remove_file(&checkpoint_path(dir, index, *stale))?;
        }
    }
    debug!(
        target: "engram.gnn::weights",
        index,
        ordinal = next,
        kept = keep.min(total),
        "layer checkpoint rotated"
    );
    Ok(next)
}

/// Load a specific checkpoint (or the newest when `ordinal` is None).
pub fn load_checkpoint(
    dir: &Path,
    index: usize,
    ordinal: Option<u64>,
    expected_in: usize,
    expected_out: usize,
    activation: Activation,
) -> Result<DenseLayer> {
    let ordinal = match ordinal {
        Some(n) => n,
        None => *checkpoint_ordinals(dir, index)?
            .last()
            .ok_or_else(|| EngramError::CheckpointError(format!("no checkpoints for layer{index}")))?,
    };
    let path = checkpoint_path(dir, index, ordinal);
    let bytes = engram_fs::read(&path)?;
    decode(&path, &bytes, expected_in, expected_out, activation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn layer(seed: u64) -> DenseLayer {
        let mut rng = StdRng::seed_from_u64(seed);
        DenseLayer::xavier(6, 4, Activation::Relu, &mut rng)
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let original = layer(1);
        save_layer(dir.path(), 1, &original).unwrap();
        let loaded = load_layer(dir.path(), 1, 6, 4, Activation::Relu).unwrap();
        assert_eq!(loaded.weights, original.weights);
        assert_eq!(loaded.bias, original.bias);
    }

    #[test]
    fn corrupted_file_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_layer(dir.path(), 1, &layer(2)).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            load_layer(dir.path(), 1, 6, 4, Activation::Relu).unwrap_err(),
            EngramError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save_layer(dir.path(), 1, &layer(3)).unwrap();
        assert!(matches!(
            load_layer(dir.path(), 1, 4, 6, Activation::Relu).unwrap_err(),
            EngramError::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn checkpoints_rotate_keeping_last_n() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..5 {
            let ordinal = checkpoint_layer(dir.path(), 2, &layer(round), 3).unwrap();
            assert_eq!(ordinal, round + 1);
        }
        let ordinals = checkpoint_ordinals(dir.path(), 2).unwrap();
        assert_eq!(ordinals, vec![3, 4, 5]);
    }

    #[test]
    fn latest_checkpoint_loads_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let first = layer(10);
        let second = layer(11);
        checkpoint_layer(dir.path(), 1, &first, 5).unwrap();
        checkpoint_layer(dir.path(), 1, &second, 5).unwrap();
        let restored = load_checkpoint(dir.path(), 1, None, 6, 4, Activation::Relu).unwrap();
        assert_eq!(restored.weights, second.weights);
        let pinned = load_checkpoint(dir.path(), 1, Some(1), 6, 4, Activation::Relu).unwrap();
        assert_eq!(pinned.weights, first.weights);
    }

    #[test]
    fn missing_checkpoint_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_checkpoint(dir.path(), 9, None, 6, 4, Activation::Relu).unwrap_err(),
            EngramError::CheckpointError(_)
        ));
    }
}
