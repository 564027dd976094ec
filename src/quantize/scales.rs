//! Sub-block scale decoders
//!
//! Every K-quant weight block carries 16 sub-block scale entries packed into a
//! handful of bytes. The transforms here are bit-exact contracts shared with the
//! packed formats' producers; the SIMD kernels build their 16-bit scale lanes on
//! top of them. Keeping them scalar and isolated makes them testable against
//! naive bit-level references, which is where packing bugs are cheapest to find.

/// The 16-entry non-uniform codebook for `IQ4_XS` values
pub const KVALUES_IQ4NL: [i8; 16] = [
    -127, -104, -83, -65, -49, -35, -22, -10, 1, 13, 25, 38, 53, 69, 89, 113,
];

/// Unpack the 12-byte `Q4_K`/`Q5_K` scale field into four 32-bit words
///
/// The field holds 16 six-bit entries: scales for sub-blocks 0..8 followed by mins
/// for sub-blocks 0..8. Interpreting the field as three little-endian 32-bit words
/// `a0, a1, a2`, the output words are:
///
/// ```text
/// out[0] = a0                       & 0x3f3f3f3f      // scales 0..4
/// out[1] = (a2      & 0x0f0f0f0f) | ((a0 >> 2) & 0x30303030)  // scales 4..8
/// out[2] = a1                       & 0x3f3f3f3f      // mins 0..4
/// out[3] = ((a2>>4) & 0x0f0f0f0f) | ((a1 >> 2) & 0x30303030)  // mins 4..8
/// ```
///
/// so the 16 bytes of the result, read in order, are the 16 six-bit entries.
#[inline]
#[must_use]
pub fn make_q4_scales(scales: &[u8; 12]) -> [u32; 4] {
    let a0 = u32::from_le_bytes([scales[0], scales[1], scales[2], scales[3]]);
    let a1 = u32::from_le_bytes([scales[4], scales[5], scales[6], scales[7]]);
    let a2 = u32::from_le_bytes([scales[8], scales[9], scales[10], scales[11]]);
    [
        a0 & 0x3f3f_3f3f,
        (a2 & 0x0f0f_0f0f) | ((a0 >> 2) & 0x3030_3030),
        a1 & 0x3f3f_3f3f,
        ((a2 >> 4) & 0x0f0f_0f0f) | ((a1 >> 2) & 0x3030_3030),
    ]
}

/// Extract the 6-bit (scale, min) pair for sub-block `j` of a `Q4_K`/`Q5_K` block
///
/// Scalar equivalent of [`make_q4_scales`] for one entry; `j` is in `0..8`.
#[inline]
#[must_use]
pub fn get_scale_min_k4(j: usize, scales: &[u8; 12]) -> (u8, u8) {
    debug_assert!(j < 8);
    if j < 4 {
        (scales[j] & 63, scales[j + 4] & 63)
    } else {
        (
            (scales[j + 4] & 0xF) | ((scales[j - 4] >> 6) << 4),
            (scales[j + 4] >> 4) | ((scales[j] >> 6) << 4),
        )
    }
}

/// Unpack the 12-byte `Q3_K` scale field into four 32-bit words of 6-bit entries
///
/// The 16 bytes of the result, read in order, are the 16 sub-block scales still
/// biased by 32; subtract 32 from each byte (as `i8`) to get the signed scale.
/// The bias is applied exactly once - the quant values themselves carry the
/// separate constant-4 offset that the kernels fold in through `bsums`.
#[inline]
#[must_use]
pub fn make_q3_scales(scales: &[u8; 12]) -> [u32; 4] {
    let a0 = u32::from_le_bytes([scales[0], scales[1], scales[2], scales[3]]);
    let a1 = u32::from_le_bytes([scales[4], scales[5], scales[6], scales[7]]);
    let a2 = u32::from_le_bytes([scales[8], scales[9], scales[10], scales[11]]);
    [
        (a0 & 0x0f0f_0f0f) | ((a2 << 4) & 0x3030_3030),
        (a1 & 0x0f0f_0f0f) | ((a2 << 2) & 0x3030_3030),
        ((a0 >> 4) & 0x0f0f_0f0f) | (a2 & 0x3030_3030),
        ((a1 >> 4) & 0x0f0f_0f0f) | ((a2 >> 2) & 0x3030_3030),
    ]
}

/// The 16 signed `Q3_K` sub-block scales (bias 32 removed)
#[inline]
#[must_use]
pub fn unpack_q3_scales(scales: &[u8; 12]) -> [i8; 16] {
    let words = make_q3_scales(scales);
    let mut out = [0i8; 16];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = (words[i / 4].to_le_bytes()[i % 4]).wrapping_sub(32) as i8;
    }
    out
}

/// The signed 6-bit scale for sub-block `ib` (`0..8`) of an `IQ4_XS` block
///
/// Low four bits come from the `scales_l` nibble array, high two bits from the
/// `scales_h` word; the packed value is biased by 32.
#[inline]
#[must_use]
pub fn iq4_xs_scale(ib: usize, scales_l: &[u8; 4], scales_h: u16) -> i32 {
    debug_assert!(ib < 8);
    let ls = ((scales_l[ib / 2] >> (4 * (ib % 2))) & 0xF) as i32
        | ((i32::from(scales_h >> (2 * ib)) & 3) << 4);
    ls - 32
}
