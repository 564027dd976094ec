//! Scalar dequantizers
//!
//! One function pair per packed format: an infallible per-block expansion in the
//! format's canonical value order, and a validated row-level wrapper. These are
//! the reference semantics for the fused kernels: the portable fallback path is
//! built on the block functions, and the SIMD kernels are tested against them.

use super::scales::{get_scale_min_k4, iq4_xs_scale, unpack_q3_scales, KVALUES_IQ4NL};
use super::{
    read_f16, IQ4XS_BLOCK_BYTES, Q2K_BLOCK_BYTES, Q3K_BLOCK_BYTES, Q4K_BLOCK_BYTES,
    Q5K_BLOCK_BYTES, Q6K_BLOCK_BYTES, Q8K_BLOCK_BYTES, Q8K_QS, QK_K,
};
use crate::error::{AcelerarError, Result};

fn check_row(name: &str, data: &[u8], block_bytes: usize, out: &[f32]) -> Result<usize> {
    if !data.len().is_multiple_of(block_bytes) {
        return Err(AcelerarError::InvalidShape {
            reason: format!(
                "{name} data length {} is not a multiple of block size {block_bytes}",
                data.len()
            ),
        });
    }
    let nb = data.len() / block_bytes;
    if out.len() != nb * QK_K {
        return Err(AcelerarError::InvalidShape {
            reason: format!(
                "output length {} doesn't match {} blocks ({} values)",
                out.len(),
                nb,
                nb * QK_K
            ),
        });
    }
    Ok(nb)
}

/// Expand one packed `Q2_K` block.
pub(crate) fn dequantize_block_q2_k(block: &[u8; Q2K_BLOCK_BYTES], out: &mut [f32; QK_K]) {
    let scales = &block[0..16];
    let d = read_f16(&block[80..82]);
    let min = read_f16(&block[82..84]);

    let mut y = out.iter_mut();
    let mut is = 0;
    // Two 32-byte halves of qs, four 2-bit planes each.
    for q in block[16..80].chunks_exact(32) {
        for shift in [0u8, 2, 4, 6] {
            for half in q.chunks_exact(16) {
                let sc = scales[is];
                is += 1;
                let dl = d * f32::from(sc & 0xF);
                let ml = min * f32::from(sc >> 4);
                for &qb in half {
                    *y.next().unwrap() = dl * f32::from((qb >> shift) & 3) - ml;
                }
            }
        }
    }
}

/// Expand one packed `Q3_K` block.
pub(crate) fn dequantize_block_q3_k(block: &[u8; Q3K_BLOCK_BYTES], out: &mut [f32; QK_K]) {
    let hm = &block[0..32];
    let d_all = read_f16(&block[108..110]);
    let scales = unpack_q3_scales(block[96..108].try_into().expect("12-byte scale field"));

    let mut y = out.iter_mut();
    let mut is = 0;
    let mut mask = 1u8;
    // A set high-mask bit means the value keeps its +4; clear means subtract it.
    for q in block[32..96].chunks_exact(32) {
        for shift in [0u8, 2, 4, 6] {
            for (half, hm_half) in q.chunks_exact(16).zip(hm.chunks_exact(16)) {
                let dl = d_all * f32::from(scales[is]);
                is += 1;
                for (&qb, &hb) in half.iter().zip(hm_half) {
                    let lo = i32::from((qb >> shift) & 3);
                    let v = lo - if hb & mask != 0 { 0 } else { 4 };
                    *y.next().unwrap() = dl * v as f32;
                }
            }
            mask <<= 1;
        }
    }
}

/// Expand one packed `Q4_K` block.
pub(crate) fn dequantize_block_q4_k(block: &[u8; Q4K_BLOCK_BYTES], out: &mut [f32; QK_K]) {
    let d = read_f16(&block[0..2]);
    let dmin = read_f16(&block[2..4]);
    let scales: &[u8; 12] = block[4..16].try_into().expect("12-byte scale field");

    let mut y = out.iter_mut();
    // Each 32-byte group of qs holds 64 values: 32 low nibbles then 32 high.
    for (j, q) in block[16..144].chunks_exact(32).enumerate() {
        let (sc1, m1) = get_scale_min_k4(2 * j, scales);
        let (sc2, m2) = get_scale_min_k4(2 * j + 1, scales);
        let d1 = d * f32::from(sc1);
        let ml1 = dmin * f32::from(m1);
        let d2 = d * f32::from(sc2);
        let ml2 = dmin * f32::from(m2);
        for &qb in q {
            *y.next().unwrap() = d1 * f32::from(qb & 0xF) - ml1;
        }
        for &qb in q {
            *y.next().unwrap() = d2 * f32::from(qb >> 4) - ml2;
        }
    }
}

/// Expand one packed `Q5_K` block.
pub(crate) fn dequantize_block_q5_k(block: &[u8; Q5K_BLOCK_BYTES], out: &mut [f32; QK_K]) {
    let d = read_f16(&block[0..2]);
    let dmin = read_f16(&block[2..4]);
    let scales: &[u8; 12] = block[4..16].try_into().expect("12-byte scale field");
    let qh = &block[16..48];

    let mut y = out.iter_mut();
    let mut u1 = 1u8;
    let mut u2 = 2u8;
    for (j, ql) in block[48..176].chunks_exact(32).enumerate() {
        let (sc1, m1) = get_scale_min_k4(2 * j, scales);
        let (sc2, m2) = get_scale_min_k4(2 * j + 1, scales);
        let d1 = d * f32::from(sc1);
        let ml1 = dmin * f32::from(m1);
        let d2 = d * f32::from(sc2);
        let ml2 = dmin * f32::from(m2);
        for (&lb, &hb) in ql.iter().zip(qh) {
            let hi = if hb & u1 != 0 { 16 } else { 0 };
            *y.next().unwrap() = d1 * f32::from((lb & 0xF) + hi) - ml1;
        }
        for (&lb, &hb) in ql.iter().zip(qh) {
            let hi = if hb & u2 != 0 { 16 } else { 0 };
            *y.next().unwrap() = d2 * f32::from((lb >> 4) + hi) - ml2;
        }
        u1 <<= 2;
        u2 <<= 2;
    }
}

/// Expand one packed `Q6_K` block.
pub(crate) fn dequantize_block_q6_k(block: &[u8; Q6K_BLOCK_BYTES], out: &mut [f32; QK_K]) {
    let d = read_f16(&block[208..210]);

    for n in 0..2 {
        let ql = &block[64 * n..64 * n + 64];
        let qh = &block[128 + 32 * n..128 + 32 * n + 32];
        let sc = &block[192 + 8 * n..192 + 8 * n + 8];
        let y = &mut out[128 * n..128 * (n + 1)];

        for l in 0..32 {
            let is = l / 16;
            let q1 = i32::from((ql[l] & 0xF) | ((qh[l] & 3) << 4)) - 32;
            let q2 = i32::from((ql[l + 32] & 0xF) | (((qh[l] >> 2) & 3) << 4)) - 32;
            let q3 = i32::from((ql[l] >> 4) | (((qh[l] >> 4) & 3) << 4)) - 32;
            let q4 = i32::from((ql[l + 32] >> 4) | (((qh[l] >> 6) & 3) << 4)) - 32;
            y[l] = d * f32::from(sc[is] as i8) * q1 as f32;
            y[l + 32] = d * f32::from(sc[is + 2] as i8) * q2 as f32;
            y[l + 64] = d * f32::from(sc[is + 4] as i8) * q3 as f32;
            y[l + 96] = d * f32::from(sc[is + 6] as i8) * q4 as f32;
        }
    }
}

/// Expand one packed `IQ4_XS` block.
pub(crate) fn dequantize_block_iq4_xs(block: &[u8; IQ4XS_BLOCK_BYTES], out: &mut [f32; QK_K]) {
    let d = read_f16(&block[0..2]);
    let scales_h = u16::from_le_bytes([block[2], block[3]]);
    let scales_l: &[u8; 4] = block[4..8].try_into().expect("4-byte scale field");

    // Each 16-byte group of qs holds 32 values: 16 low nibbles then 16 high.
    for (ib, qs) in block[8..136].chunks_exact(16).enumerate() {
        let dl = d * iq4_xs_scale(ib, scales_l, scales_h) as f32;
        let y = &mut out[32 * ib..32 * (ib + 1)];
        for j in 0..16 {
            y[j] = dl * f32::from(KVALUES_IQ4NL[(qs[j] & 0xF) as usize]);
            y[j + 16] = dl * f32::from(KVALUES_IQ4NL[(qs[j] >> 4) as usize]);
        }
    }
}

/// Expand one packed `Q8_K` activation block.
pub(crate) fn dequantize_block_q8_k(block: &[u8; Q8K_BLOCK_BYTES], out: &mut [f32; QK_K]) {
    let d = f32::from_le_bytes(block[0..4].try_into().expect("f32 scale"));
    for (dst, q) in out.iter_mut().zip(&block[Q8K_QS..Q8K_QS + QK_K]) {
        *dst = d * f32::from(*q as i8);
    }
}

macro_rules! row_dequantizer {
    ($(#[$doc:meta])* $name:ident, $label:literal, $block_bytes:path, $block_fn:ident) => {
        $(#[$doc])*
        ///
        /// # Errors
        ///
        /// Returns an error if `data` is not whole blocks or `out` has the wrong
        /// length for the block count.
        pub fn $name(data: &[u8], out: &mut [f32]) -> Result<()> {
            check_row($label, data, $block_bytes, out)?;
            for (block, y) in data
                .chunks_exact($block_bytes)
                .zip(out.chunks_exact_mut(QK_K))
            {
                $block_fn(
                    block.try_into().expect("whole block"),
                    y.try_into().expect("256-value chunk"),
                );
            }
            Ok(())
        }
    };
}

row_dequantizer!(
    /// Dequantize a row of packed `Q2_K` blocks
    dequantize_row_q2_k, "Q2_K", Q2K_BLOCK_BYTES, dequantize_block_q2_k
);
row_dequantizer!(
    /// Dequantize a row of packed `Q3_K` blocks
    dequantize_row_q3_k, "Q3_K", Q3K_BLOCK_BYTES, dequantize_block_q3_k
);
row_dequantizer!(
    /// Dequantize a row of packed `Q4_K` blocks
    dequantize_row_q4_k, "Q4_K", Q4K_BLOCK_BYTES, dequantize_block_q4_k
);
row_dequantizer!(
    /// Dequantize a row of packed `Q5_K` blocks
    dequantize_row_q5_k, "Q5_K", Q5K_BLOCK_BYTES, dequantize_block_q5_k
);
row_dequantizer!(
    /// Dequantize a row of packed `Q6_K` blocks
    dequantize_row_q6_k, "Q6_K", Q6K_BLOCK_BYTES, dequantize_block_q6_k
);
row_dequantizer!(
    /// Dequantize a row of packed `IQ4_XS` blocks
    dequantize_row_iq4_xs, "IQ4_XS", IQ4XS_BLOCK_BYTES, dequantize_block_iq4_xs
);
row_dequantizer!(
    /// Dequantize a row of packed `Q8_K` activation blocks
    dequantize_row_q8_k, "Q8_K", Q8K_BLOCK_BYTES, dequantize_block_q8_k
);

/// Dequantize one row of the given weight type
///
/// Dispatch helper over the per-format row dequantizers.
///
/// # Errors
///
/// Returns an error if `data` is not whole blocks of the type or `out` has the
/// wrong length.
pub fn dequantize_row(
    weight_type: super::WeightType,
    data: &[u8],
    out: &mut [f32],
) -> Result<()> {
    use super::WeightType;
    match weight_type {
        WeightType::Q2K => dequantize_row_q2_k(data, out),
        WeightType::Q3K => dequantize_row_q3_k(data, out),
        WeightType::Q4K => dequantize_row_q4_k(data, out),
        WeightType::Q5K => dequantize_row_q5_k(data, out),
        WeightType::Q6K => dequantize_row_q6_k(data, out),
        WeightType::Iq4Xs => dequantize_row_iq4_xs(data, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantize::quantize_row_q8_k;

    #[test]
    fn test_dequantize_rejects_partial_blocks() {
        let mut out = [0.0f32; QK_K];
        assert!(dequantize_row_q2_k(&[0u8; 50], &mut out).is_err());
        assert!(dequantize_row_q4_k(&[0u8; 100], &mut out).is_err());
        assert!(dequantize_row_q6_k(&[0u8; Q6K_BLOCK_BYTES], &mut out[..100]).is_err());
    }

    #[test]
    fn test_q2_k_single_subblock() {
        let mut block = vec![0u8; Q2K_BLOCK_BYTES];
        // Sub-block 0: scale 3, min 2. d = 1.0, dmin = 0.5.
        block[0] = 0x23;
        block[80..82].copy_from_slice(&0x3C00u16.to_le_bytes());
        block[82..84].copy_from_slice(&0x3800u16.to_le_bytes());
        // First 16 values use the low 2 bits of qs[0..16].
        block[16] = 0b10; // value 2

        let mut out = [0.0f32; QK_K];
        dequantize_row_q2_k(&block, &mut out).unwrap();
        assert_eq!(out[0], 1.0 * 3.0 * 2.0 - 0.5 * 2.0);
        assert_eq!(out[1], -0.5 * 2.0); // quant 0, min still applies
        assert_eq!(out[16], 0.0); // sub-block 1 has scale 0, min 0
    }

    #[test]
    fn test_q3_k_hmask_polarity() {
        let mut block = vec![0u8; Q3K_BLOCK_BYTES];
        block[108..110].copy_from_slice(&0x3C00u16.to_le_bytes()); // d = 1.0
        // Scale entry 0 = 33 -> signed scale 1 (low nibble 1, high bits 0b10).
        block[96] = 0x01;
        block[104] = 0x02;

        let mut out = [0.0f32; QK_K];
        dequantize_row_q3_k(&block, &mut out).unwrap();
        // hmask bit clear: value = 0 - 4.
        assert_eq!(out[0], -4.0);

        // hmask bit set for value 0: the +4 stays.
        block[0] = 1;
        dequantize_row_q3_k(&block, &mut out).unwrap();
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn test_q4_k_nibble_order() {
        let mut block = vec![0u8; Q4K_BLOCK_BYTES];
        block[0..2].copy_from_slice(&0x3C00u16.to_le_bytes()); // d = 1.0
        block[4] = 1; // scale of sub-block 0 = 1 (min 0)
        block[16] = 0x5A; // low nibble 10, high nibble 5

        let mut out = [0.0f32; QK_K];
        dequantize_row_q4_k(&block, &mut out).unwrap();
        assert_eq!(out[0], 10.0); // low nibble, sub-block 0
        assert_eq!(out[32], 0.0); // high nibble lands in sub-block 1, scale 0
    }

    #[test]
    fn test_q5_k_high_bit() {
        let mut block = vec![0u8; Q5K_BLOCK_BYTES];
        block[0..2].copy_from_slice(&0x3C00u16.to_le_bytes()); // d = 1.0
        block[4] = 1; // scale 0 = 1
        block[16] = 0x01; // qh bit 0 of value 0
        let mut out = [0.0f32; QK_K];
        dequantize_row_q5_k(&block, &mut out).unwrap();
        assert_eq!(out[0], 16.0); // low nibble 0 + high bit
    }

    #[test]
    fn test_q6_k_uniform_block() {
        // ql = 0x11, qh = 0, scales = 1, d = 1 -> every value is 1 - 32 = -31.
        let mut block = vec![0u8; Q6K_BLOCK_BYTES];
        block[..128].fill(0x11);
        for b in &mut block[192..208] {
            *b = 1;
        }
        block[208..210].copy_from_slice(&0x3C00u16.to_le_bytes());

        let mut out = [0.0f32; QK_K];
        dequantize_row_q6_k(&block, &mut out).unwrap();
        assert!(out.iter().all(|v| *v == -31.0));
    }

    #[test]
    fn test_q6_k_signed_scale() {
        let mut block = vec![0u8; Q6K_BLOCK_BYTES];
        block[192] = (-2i8) as u8;
        block[208..210].copy_from_slice(&0x3C00u16.to_le_bytes());
        let mut out = [0.0f32; QK_K];
        dequantize_row_q6_k(&block, &mut out).unwrap();
        // quant 0 -> value -32, scale -2 -> +64.
        assert_eq!(out[0], 64.0);
    }

    #[test]
    fn test_iq4_xs_codebook_lookup() {
        let mut block = vec![0u8; IQ4XS_BLOCK_BYTES];
        block[0..2].copy_from_slice(&0x3C00u16.to_le_bytes()); // d = 1.0
        // Sub-block 0 scale = 33 - 32 = 1; others stay at -32.
        block[4] = 0x01;
        block[2..4].copy_from_slice(&2u16.to_le_bytes());
        block[8] = 0x80; // value 0 -> index 0, value 16 -> index 8

        let mut out = [0.0f32; QK_K];
        dequantize_row_iq4_xs(&block, &mut out).unwrap();
        assert_eq!(out[0], f32::from(KVALUES_IQ4NL[0]));
        assert_eq!(out[16], f32::from(KVALUES_IQ4NL[8]));
        // Sub-block 1: scale -32, index 0 everywhere.
        assert_eq!(out[32], -32.0 * f32::from(KVALUES_IQ4NL[0]));
    }

    #[test]
    fn test_q8_k_roundtrip_through_producer() {
        let values: Vec<f32> = (0..256).map(|i| (i as f32 - 128.0) / 16.0).collect();
        let mut packed = vec![0u8; Q8K_BLOCK_BYTES];
        quantize_row_q8_k(&values, &mut packed).unwrap();

        let mut out = [0.0f32; QK_K];
        dequantize_row_q8_k(&packed, &mut out).unwrap();
        let d = f32::from_le_bytes(packed[0..4].try_into().unwrap());
        for (orig, deq) in values.iter().zip(out.iter()) {
            assert!((orig - deq).abs() <= d.abs() * 0.5 + 1e-6);
        }
    }
}
