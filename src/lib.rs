//! # Acelerar
//!
//! Fused dequantize-and-multiply CPU kernels for K-quantized transformer weights.
//!
//! Acelerar (Spanish: "to accelerate, to speed up") multiplies a weight matrix stored
//! in a block-quantized integer format (Q2_K, Q3_K, Q4_K, Q5_K, Q6_K or IQ4_XS) by an
//! activation matrix stored in the 8-bit Q8_K block format, producing a dense f32
//! result. The kernels target the prompt-processing regime: several activation columns
//! are multiplied against the same weight row in lockstep, so the per-block unpacking
//! of weight quants and sub-block scales is amortized across columns.
//!
//! ## Features
//!
//! - **Fused kernels**: dequantization never materializes an f32 weight buffer;
//!   quants and scales stay in registers from load to accumulate
//! - **Tiled over columns**: each weight-type kernel is instantiated at tile widths
//!   1, 2, 4 and 8, and a greedy dispatcher consumes the column count widest-first
//! - **AVX2 inner loops**: 256-bit integer fused-multiply-add (`maddubs`/`madd`)
//!   with runtime detection and a portable scalar fallback
//! - **Worker-band parallelism**: the entry point partitions output rows across an
//!   externally orchestrated worker set; a rayon convenience driver is included
//!
//! ## Example
//!
//! ```rust
//! use acelerar::quantize::{self, WeightType};
//!
//! let k = 256;
//! let (nx, ny) = (4, 2);
//!
//! // One row of zero-filled Q4_K weight blocks per output row.
//! let a = vec![0u8; nx * quantize::row_size(WeightType::Q4K, k)];
//!
//! // Quantize activations into Q8_K columns.
//! let mut b = vec![0u8; ny * quantize::q8_k_row_size(k)];
//! let x = vec![0.25f32; k];
//! for col in b.chunks_exact_mut(quantize::q8_k_row_size(k)) {
//!     quantize::quantize_row_q8_k(&x, col).unwrap();
//! }
//!
//! let mut c = vec![0.0f32; nx * ny];
//! acelerar::mul_mat_checked(nx, ny, k, WeightType::Q4K.raw_id(), &a, &b, &mut c, nx)
//!     .unwrap();
//! assert!(c.iter().all(|v| *v == 0.0));
//! ```
//!
//! ## Data contract
//!
//! Weight rows are contiguous runs of packed 256-value blocks whose byte layouts are
//! fixed external contracts (see [`quantize`]). Activation columns are Q8_K blocks
//! whose `bsums` field is produced by [`quantize::quantize_row_q8_k`] - the kernels
//! consume `bsums` as-is and never recompute it from the quants.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Kernel code indexes packed byte layouts heavily; keep the casts readable.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

pub mod error;
pub mod mulmat;
pub mod quantize;

// Re-exports for convenience
pub use error::{AcelerarError, Result};
pub use mulmat::{mul_mat, mul_mat_checked, mul_mat_parallel};
pub use quantize::{SimdBackend, WeightType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
