//! Per-vector int8 quantization.
//!
//! Symmetric by default: `scale = max(|x|)/127`, `offset = 0`, codes
//! `q = round(x/scale)`. An asymmetric mode stores the component mean as a
//! shared offset. The payload is `scale (f32 le) | offset (f32 le) | codes`.

use engram_error::{EngramError, Result};

/// Payload bytes ahead of the codes: scale + offset.
pub const HEADER_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Int8Mode {
    #[default]
    Symmetric,
    /// Offset = mean of components.
    MeanCentered,
}

/// Stateless int8 codec with a quality gate.
#[derive(Debug, Clone, Copy)]
pub struct Int8Quantizer {
    pub mode: Int8Mode,
    /// Acceptance threshold for `mean(|x − x̂|) / mean(|x|)`.
    pub max_relative_error: f32,
}

impl Default for Int8Quantizer {
    fn default() -> Self {
        Self {
            mode: Int8Mode::Symmetric,
            max_relative_error: 0.02,
        }
    }
}

impl Int8Quantizer {
    #[must_use]
    pub fn new(mode: Int8Mode, max_relative_error: f32) -> Self {
        Self {
            mode,
            max_relative_error,
        }
    }

    /// Quantize. A zero vector quantizes to zero codes with scale 1.
    #[must_use]
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let offset = match self.mode {
            Int8Mode::Symmetric => 0.0,
            Int8Mode::MeanCentered => {
                vector.iter().sum::<f32>() / vector.len().max(1) as f32
            }
        };
        let peak = vector
            .iter()
            .map(|x| (x - offset).abs())
            .fold(0.0f32, f32::max);
        let scale = if peak == 0.0 { 1.0 } else { peak / 127.0 };

        let mut out = Vec::with_capacity(HEADER_BYTES + vector.len());
        out.extend_from_slice(&scale.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        for &x in vector {
            let q = ((x - offset) / scale).round().clamp(-127.0, 127.0) as i8;
            out.push(q as u8);
        }
        out
    }

    /// Dequantize: `x ≈ q·scale + offset`.
    pub fn decode(&self, bytes: &[u8], dim: usize) -> Result<Vec<f32>> {
        if bytes.len() != HEADER_BYTES + dim {
            return Err(EngramError::DimensionMismatch {
                expected: HEADER_BYTES + dim,
                actual: bytes.len(),
            });
        }
        let scale = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let offset = f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(bytes[HEADER_BYTES..]
            .iter()
            .map(|&b| f32::from(b as i8).mul_add(scale, offset))
            .collect())
    }

    /// Relative reconstruction error `mean(|x − x̂|) / mean(|x|)`.
    pub fn relative_error(&self, vector: &[f32]) -> Result<f32> {
        let decoded = self.decode(&self.encode(vector), vector.len())?;
        let mean_abs = vector.iter().map(|x| x.abs()).sum::<f32>() / vector.len().max(1) as f32;
        if mean_abs == 0.0 {
            return Ok(0.0);
        }
        let mean_err = vector
            .iter()
            .zip(decoded.iter())
            .map(|(x, y)| (x - y).abs())
            .sum::<f32>()
            / vector.len().max(1) as f32;
        Ok(mean_err / mean_abs)
    }

    /// Validate quality on a sample; rejects when the mean relative error
    /// over the sample exceeds the acceptance threshold.
    pub fn validate(&self, sample: &[Vec<f32>]) -> Result<f32> {
        if sample.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0f32;
        for vector in sample {
            total += self.relative_error(vector)?;
        }
        let mean = total / sample.len() as f32;
        if mean > self.max_relative_error {
            return Err(EngramError::ReconstructionQuality {
                id: engram_types::VectorId::from("int8-validation"),
                error: mean,
                bound: self.max_relative_error,
            });
        }
        Ok(mean)
    }
}
