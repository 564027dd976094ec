//! Block-quantized weight and activation formats
//!
//! Describes the packed byte layouts the kernels consume and implements the
//! activation-side producer:
//! - `Q2_K`: 2-bit K-quantization (super-block size 256, per-sub-block scale and min)
//! - `Q3_K`: 3-bit K-quantization (6-bit sub-block scales, bias 32)
//! - `Q4_K`: 4-bit K-quantization (6-bit packed scale/min pairs)
//! - `Q5_K`: 5-bit K-quantization (Q4_K scales plus a separate high-bit mask)
//! - `Q6_K`: 6-bit K-quantization (signed 8-bit sub-block scales)
//! - `IQ4_XS`: 4-bit non-linear quantization through a 16-entry codebook
//! - `Q8_K`: 8-bit activation blocks with precomputed 16-value sub-sums
//!
//! ## `Q8_K` format
//!
//! Activations are quantized in blocks of 256 values:
//! - 1 float32 scale factor `d`
//! - 256 signed 8-bit quantized values `qs`
//! - 16 precomputed 16-bit sums `bsums`, one per run of 16 consecutive quants
//!
//! `bsums` lets the dot-product kernels absorb the per-sub-block minimum of the
//! dmin-bearing weight formats without touching the quants a second time.
//! [`quantize_row_q8_k`] is the authority for this field: kernels assume it is
//! consistent with `qs` and never recompute it.
//!
//! ## Weight block layouts
//!
//! All weight formats pack 256 values per block. Byte offsets within one block are
//! fixed external contracts (little-endian `f16`/`u16`/`i16` fields):
//!
//! | Type | Layout | Bytes |
//! |---|---|---|
//! | `Q2_K` | scales\[16\], qs\[64\], d:f16, dmin:f16 | 84 |
//! | `Q3_K` | hmask\[32\], qs\[64\], scales\[12\], d:f16 | 110 |
//! | `Q4_K` | d:f16, dmin:f16, scales\[12\], qs\[128\] | 144 |
//! | `Q5_K` | d:f16, dmin:f16, scales\[12\], qh\[32\], qs\[128\] | 176 |
//! | `Q6_K` | ql\[128\], qh\[64\], scales\[16\]:i8, d:f16 | 210 |
//! | `IQ4_XS` | d:f16, scales_h:u16, scales_l\[4\], qs\[128\] | 136 |

use crate::error::{AcelerarError, Result};

pub mod dequant;
pub mod scales;

/// Number of values in one quantization block (weight or activation)
pub const QK_K: usize = 256;

/// Bytes in one packed `Q2_K` weight block
pub const Q2K_BLOCK_BYTES: usize = 84;
/// Bytes in one packed `Q3_K` weight block
pub const Q3K_BLOCK_BYTES: usize = 110;
/// Bytes in one packed `Q4_K` weight block
pub const Q4K_BLOCK_BYTES: usize = 144;
/// Bytes in one packed `Q5_K` weight block
pub const Q5K_BLOCK_BYTES: usize = 176;
/// Bytes in one packed `Q6_K` weight block
pub const Q6K_BLOCK_BYTES: usize = 210;
/// Bytes in one packed `IQ4_XS` weight block
pub const IQ4XS_BLOCK_BYTES: usize = 136;
/// Bytes in one packed `Q8_K` activation block (d:f32, qs\[256\], bsums\[16\]:i16)
pub const Q8K_BLOCK_BYTES: usize = 4 + QK_K + 2 * (QK_K / 16);

/// Byte offset of `qs` within a `Q8_K` block
pub(crate) const Q8K_QS: usize = 4;
/// Byte offset of `bsums` within a `Q8_K` block
pub(crate) const Q8K_BSUMS: usize = 4 + QK_K;

/// Pre-computed f16 to f32 lookup table (65536 entries = 256KB)
///
/// Eliminates per-block f16 conversion overhead in hot paths. The table is
/// initialized once on first access and is immutable thereafter.
static F16_TO_F32_LUT: std::sync::LazyLock<Box<[f32; 65536]>> = std::sync::LazyLock::new(|| {
    let mut lut = Box::new([0.0f32; 65536]);
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = half::f16::from_bits(i as u16).to_f32();
    }
    lut
});

/// Convert raw f16 bits (little-endian) to f32 through the lookup table
#[inline]
#[must_use]
pub fn f16_to_f32(bits: u16) -> f32 {
    F16_TO_F32_LUT[bits as usize]
}

/// Read an f16 value from the first two bytes of `bytes` and widen it to f32
#[inline]
pub(crate) fn read_f16(bytes: &[u8]) -> f32 {
    f16_to_f32(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Weight quantization formats supported by the mat-mul kernels
///
/// The discriminants are the raw on-disk type ids used by GGUF tensors, which is
/// what callers hand to [`crate::mul_mat`] as the opaque `weight_type` integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum WeightType {
    /// 2-bit K-quantization
    Q2K = 10,
    /// 3-bit K-quantization
    Q3K = 11,
    /// 4-bit K-quantization
    Q4K = 12,
    /// 5-bit K-quantization
    Q5K = 13,
    /// 6-bit K-quantization
    Q6K = 14,
    /// 4-bit non-linear quantization
    Iq4Xs = 23,
}

impl WeightType {
    /// All supported weight types, in raw-id order
    pub const ALL: [WeightType; 6] = [
        WeightType::Q2K,
        WeightType::Q3K,
        WeightType::Q4K,
        WeightType::Q5K,
        WeightType::Q6K,
        WeightType::Iq4Xs,
    ];

    /// Resolve a raw type id to a weight type, or `None` if unsupported
    #[must_use]
    pub fn from_raw(type_id: i32) -> Option<Self> {
        match type_id {
            10 => Some(WeightType::Q2K),
            11 => Some(WeightType::Q3K),
            12 => Some(WeightType::Q4K),
            13 => Some(WeightType::Q5K),
            14 => Some(WeightType::Q6K),
            23 => Some(WeightType::Iq4Xs),
            _ => None,
        }
    }

    /// The raw on-disk type id for this weight type
    #[must_use]
    pub fn raw_id(self) -> i32 {
        self as i32
    }

    /// Bytes in one packed 256-value block of this type
    #[must_use]
    pub fn block_bytes(self) -> usize {
        match self {
            WeightType::Q2K => Q2K_BLOCK_BYTES,
            WeightType::Q3K => Q3K_BLOCK_BYTES,
            WeightType::Q4K => Q4K_BLOCK_BYTES,
            WeightType::Q5K => Q5K_BLOCK_BYTES,
            WeightType::Q6K => Q6K_BLOCK_BYTES,
            WeightType::Iq4Xs => IQ4XS_BLOCK_BYTES,
        }
    }
}

impl std::fmt::Display for WeightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightType::Q2K => write!(f, "Q2_K"),
            WeightType::Q3K => write!(f, "Q3_K"),
            WeightType::Q4K => write!(f, "Q4_K"),
            WeightType::Q5K => write!(f, "Q5_K"),
            WeightType::Q6K => write!(f, "Q6_K"),
            WeightType::Iq4Xs => write!(f, "IQ4_XS"),
        }
    }
}

/// Byte size of one weight row of `k` values in the given format
///
/// `k` must be a multiple of [`QK_K`]; rows are contiguous runs of packed blocks
/// with no padding between them.
#[must_use]
pub fn row_size(weight_type: WeightType, k: usize) -> usize {
    debug_assert!(k.is_multiple_of(QK_K));
    (k / QK_K) * weight_type.block_bytes()
}

/// Byte size of one `Q8_K` activation column of `k` values
#[must_use]
pub fn q8_k_row_size(k: usize) -> usize {
    debug_assert!(k.is_multiple_of(QK_K));
    (k / QK_K) * Q8K_BLOCK_BYTES
}

/// Quantize a row of activations into packed `Q8_K` blocks
///
/// Each 256-value block gets a scale `d = max_signed / 127` (where `max_signed` is
/// the value of largest magnitude, sign included), signed 8-bit quants, and the 16
/// precomputed `bsums`. An all-zero block is encoded as `d = 0`, all quants zero,
/// all `bsums` zero.
///
/// # Errors
///
/// Returns an error if `values.len()` is not a multiple of 256 or `out` is not
/// exactly [`q8_k_row_size`] bytes for that length.
pub fn quantize_row_q8_k(values: &[f32], out: &mut [u8]) -> Result<()> {
    if !values.len().is_multiple_of(QK_K) {
        return Err(AcelerarError::InvalidShape {
            reason: format!(
                "activation length {} is not a multiple of block size {}",
                values.len(),
                QK_K
            ),
        });
    }
    let nb = values.len() / QK_K;
    if out.len() != nb * Q8K_BLOCK_BYTES {
        return Err(AcelerarError::InvalidShape {
            reason: format!(
                "Q8_K output length {} doesn't match {} blocks ({} bytes)",
                out.len(),
                nb,
                nb * Q8K_BLOCK_BYTES
            ),
        });
    }

    for (x, block) in values
        .chunks_exact(QK_K)
        .zip(out.chunks_exact_mut(Q8K_BLOCK_BYTES))
    {
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in x {
            if v.abs() > amax {
                amax = v.abs();
                max = v;
            }
        }
        if amax == 0.0 {
            block.fill(0);
            continue;
        }

        // Signed inverse scale: the extreme value maps to exactly -127.
        let iscale = -127.0f32 / max;
        let mut quants = [0i8; QK_K];
        for (q, &v) in quants.iter_mut().zip(x) {
            *q = ((iscale * v).round() as i32).min(127) as i8;
        }

        block[0..4].copy_from_slice(&(1.0 / iscale).to_le_bytes());
        for (dst, q) in block[Q8K_QS..Q8K_QS + QK_K].iter_mut().zip(&quants) {
            *dst = *q as u8;
        }
        for (j, chunk) in quants.chunks_exact(16).enumerate() {
            let sum: i16 = chunk.iter().map(|q| i16::from(*q)).sum();
            block[Q8K_BSUMS + 2 * j..Q8K_BSUMS + 2 * j + 2].copy_from_slice(&sum.to_le_bytes());
        }
    }

    Ok(())
}

/// SIMD backend detected at runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SimdBackend {
    /// AVX2 + FMA (256-bit)
    Avx2,
    /// Scalar fallback
    #[default]
    Scalar,
}

impl std::fmt::Display for SimdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimdBackend::Avx2 => write!(f, "AVX2"),
            SimdBackend::Scalar => write!(f, "Scalar"),
        }
    }
}

/// Detect the SIMD backend the mat-mul kernels will dispatch to
#[must_use]
pub fn detect_simd_backend() -> SimdBackend {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return SimdBackend::Avx2;
        }
    }
    SimdBackend::Scalar
}
