//! Write-path vector validation.
//!
//! All stored vectors are finite and L2-normalized to within
//! [`engram_types::NORMALIZATION_TOLERANCE`]; violations produce typed
//! errors at the boundary that observed them.

use engram_error::{EngramError, Result};
use engram_types::VectorId;

/// Euclidean norm.
#[must_use]
pub fn l2_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Normalize to unit length. Fails with `ZeroVector` on an all-zero input.
pub fn l2_normalize(vector: &[f32]) -> Result<Vec<f32>> {
    let norm = l2_norm(vector);
    if norm == 0.0 || !norm.is_finite() {
        return Err(EngramError::ZeroVector);
    }
    Ok(vector.iter().map(|x| x / norm).collect())
}

/// Check the vector has exactly `expected` components.
pub fn ensure_dim(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() == expected {
        Ok(())
    } else {
        Err(EngramError::DimensionMismatch {
            expected,
            actual: vector.len(),
        })
    }
}

/// Check every component is finite.
pub fn ensure_finite(id: &VectorId, vector: &[f32]) -> Result<()> {
    match vector.iter().position(|x| !x.is_finite()) {
        None => Ok(()),
        Some(index) => Err(EngramError::NonFiniteValue {
            id: id.clone(),
            index,
        }),
    }
}

/// Check `|‖v‖₂ − 1| ≤ tolerance`.
pub fn ensure_normalized(id: &VectorId, vector: &[f32], tolerance: f32) -> Result<()> {
    let norm = l2_norm(vector);
    if (norm - 1.0).abs() <= tolerance {
        Ok(())
    } else {
        Err(EngramError::NotNormalized {
            id: id.clone(),
            norm,
        })
    }
}

/// Full write-path gauntlet for a query or stored vector.
pub fn ensure_query(id: &VectorId, vector: &[f32], dim: usize, tolerance: f32) -> Result<()> {
    ensure_dim(vector, dim)?;
    ensure_finite(id, vector)?;
    ensure_normalized(id, vector, tolerance)
}
