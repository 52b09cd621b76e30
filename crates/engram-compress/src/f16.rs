//! IEEE 754 binary16 conversion.
//!
//! Round-to-nearest-even on the narrowing path. Unit-normalized embedding
//! components sit in [-1, 1] where half precision resolves ~5e-4, well
//! inside the Warm tier's declared bound.

/// Narrow an f32 to half-precision bits.
#[must_use]
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let mant = bits & 0x007F_FFFF;

    if exp == 0xFF {
        // Inf / NaN; keep a quiet-NaN payload bit.
        let nan = if mant != 0 { 0x0200 } else { 0 };
        return sign | 0x7C00 | nan;
    }

    let unbiased = exp - 127;
    let half_exp = unbiased + 15;

    if half_exp >= 0x1F {
        return sign | 0x7C00; // overflow → ±Inf
    }
    if half_exp <= 0 {
        if half_exp < -10 {
            return sign; // underflow → ±0
        }
        // Subnormal half: shift in the implicit leading one.
        let full_mant = mant | 0x0080_0000;
        let shift = (14 - half_exp) as u32;
        let half_mant = (full_mant >> shift) as u16;
        let round_bit = 1u32 << (shift - 1);
        if full_mant & round_bit != 0 {
            return sign | (half_mant + 1);
        }
        return sign | half_mant;
    }

    let half = sign | ((half_exp as u16) << 10) | ((mant >> 13) as u16);
    // Round to nearest even; a carry ripples into the exponent correctly.
    let round = mant & 0x1000 != 0;
    let sticky = mant & 0x0FFF != 0;
    let lsb = mant & 0x2000 != 0;
    if round && (sticky || lsb) { half + 1 } else { half }
}

/// Widen half-precision bits back to f32.
#[must_use]
pub fn f16_bits_to_f32(half: u16) -> f32 {
    let sign = u32::from(half & 0x8000) << 16;
    let exp = u32::from(half >> 10) & 0x1F;
    let mant = u32::from(half & 0x03FF);

    let bits = if exp == 0 {
        if mant == 0 {
            sign
        } else {
            // Subnormal half: renormalize.
            let mut e = 127 - 15 + 1;
            let mut m = mant;
            while m & 0x0400 == 0 {
                m <<= 1;
                e -= 1;
            }
            sign | ((e as u32) << 23) | ((m & 0x03FF) << 13)
        }
    } else if exp == 0x1F {
        sign | 0x7F80_0000 | (mant << 13)
    } else {
        sign | ((exp + 127 - 15) << 23) | (mant << 13)
    };
    f32::from_bits(bits)
}

/// Encode a vector as packed little-endian f16.
#[must_use]
pub fn encode(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 2);
    for &x in vector {
        out.extend_from_slice(&f32_to_f16_bits(x).to_le_bytes());
    }
    out
}

/// Decode packed f16 bytes; `dim` is the expected component count.
#[must_use]
pub fn decode(bytes: &[u8], dim: usize) -> Option<Vec<f32>> {
    if bytes.len() != dim * 2 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|c| f16_bits_to_f32(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
    )
}
