//! Portable fallback kernels
//!
//! Width-1 kernels built on the scalar block dequantizers, used when AVX2 is not
//! available. One weight block is expanded to f32 on the stack and dotted against
//! the matching activation block; no heap allocation, no SIMD.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::too_many_arguments)]

use crate::quantize::dequant::{
    dequantize_block_iq4_xs, dequantize_block_q2_k, dequantize_block_q3_k, dequantize_block_q4_k,
    dequantize_block_q5_k, dequantize_block_q6_k,
};
use crate::quantize::{
    IQ4XS_BLOCK_BYTES, Q2K_BLOCK_BYTES, Q3K_BLOCK_BYTES, Q4K_BLOCK_BYTES, Q5K_BLOCK_BYTES,
    Q6K_BLOCK_BYTES, Q8K_BLOCK_BYTES, Q8K_QS, QK_K,
};

/// Shared row walk: dequantize each weight block and dot it against one column.
#[inline]
unsafe fn mul_mat_one<const BLOCK_BYTES: usize>(
    dequant_block: fn(&[u8; BLOCK_BYTES], &mut [f32; QK_K]),
    k: usize,
    c: *mut f32,
    vx: *const u8,
    bx: usize,
    vy: *const u8,
    nrc_x: usize,
) {
    debug_assert!(k.is_multiple_of(QK_K));
    let nb = k / QK_K;

    let mut w = [0.0f32; QK_K];

    for ix in 0..nrc_x {
        let row = vx.add(ix * bx);
        let mut acc = 0.0f32;

        for i in 0..nb {
            dequant_block(&*row.add(i * BLOCK_BYTES).cast::<[u8; BLOCK_BYTES]>(), &mut w);

            let yblk = vy.add(i * Q8K_BLOCK_BYTES);
            let d8 = yblk.cast::<f32>().read_unaligned();
            let qs = yblk.add(Q8K_QS);

            let mut sum = 0.0f32;
            for (j, wj) in w.iter().enumerate() {
                sum += wj * f32::from(qs.add(j).cast::<i8>().read());
            }
            acc += d8 * sum;
        }

        *c.add(ix) = acc;
    }
}

macro_rules! scalar_kernel {
    ($name:ident, $block_bytes:expr, $block_fn:ident) => {
        /// Width-1 portable kernel for this weight type.
        pub(crate) unsafe fn $name(
            k: usize,
            c: *mut f32,
            _stride_c: usize,
            vx: *const u8,
            bx: usize,
            vy: *const u8,
            _by: usize,
            nrc_x: usize,
        ) {
            mul_mat_one::<{ $block_bytes }>($block_fn, k, c, vx, bx, vy, nrc_x);
        }
    };
}

scalar_kernel!(mul_mat_q2_k_1, Q2K_BLOCK_BYTES, dequantize_block_q2_k);
scalar_kernel!(mul_mat_q3_k_1, Q3K_BLOCK_BYTES, dequantize_block_q3_k);
scalar_kernel!(mul_mat_q4_k_1, Q4K_BLOCK_BYTES, dequantize_block_q4_k);
scalar_kernel!(mul_mat_q5_k_1, Q5K_BLOCK_BYTES, dequantize_block_q5_k);
scalar_kernel!(mul_mat_q6_k_1, Q6K_BLOCK_BYTES, dequantize_block_q6_k);
scalar_kernel!(mul_mat_iq4_xs_1, IQ4XS_BLOCK_BYTES, dequantize_block_iq4_xs);
