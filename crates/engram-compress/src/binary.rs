//! 1-bit binary codec for the Frozen tier.
//!
//! Keeps only component signs, packed LSB-first. Decoding yields ±1/√dim so
//! the reconstruction is unit-norm by construction.

/// Pack signs into `ceil(dim/8)` bytes; bit set ⇔ component > 0.
#[must_use]
pub fn encode(vector: &[f32]) -> Vec<u8> {
    let mut out = vec![0u8; vector.len().div_ceil(8)];
    for (i, &x) in vector.iter().enumerate() {
        if x > 0.0 {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpack to a unit-norm sign vector.
#[must_use]
pub fn decode(bytes: &[u8], dim: usize) -> Option<Vec<f32>> {
    if bytes.len() != dim.div_ceil(8) {
        return None;
    }
    let magnitude = 1.0 / (dim as f32).sqrt();
    Some(
        (0..dim)
            .map(|i| {
                if bytes[i / 8] & (1 << (i % 8)) != 0 {
                    magnitude
                } else {
                    -magnitude
                }
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_vector::l2_norm;

    #[test]
    fn packs_to_ceil_of_dim_over_8() {
        assert_eq!(encode(&[1.0; 8]).len(), 1);
        assert_eq!(encode(&[1.0; 9]).len(), 2);
        assert_eq!(encode(&[1.0; 1536]).len(), 192);
    }

    #[test]
    fn signs_survive_the_round_trip() {
        let v = vec![0.3f32, -0.1, 0.0, 0.9, -0.4];
        let back = decode(&encode(&v), 5).unwrap();
        for (orig, rec) in v.iter().zip(back.iter()) {
            if *orig > 0.0 {
                assert!(*rec > 0.0);
            } else {
                // Zero decodes negative; only strict positives set bits.
                assert!(*rec < 0.0);
            }
        }
    }

    #[test]
    fn reconstruction_is_unit_norm() {
        let v: Vec<f32> = (0..100).map(|i| if i % 3 == 0 { 0.5 } else { -0.5 }).collect();
        let back = decode(&encode(&v), 100).unwrap();
        assert!((l2_norm(&back) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(decode(&[0u8; 2], 100).is_none());
    }
}
