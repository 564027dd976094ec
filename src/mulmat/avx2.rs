//! AVX2 micro-kernels
//!
//! One fused dequantize-and-dot kernel per weight type, instantiated at tile
//! widths `NRC_Y` in {1, 2, 4, 8}. Each call computes, for every weight row in the
//! band, the dot products of that row against `NRC_Y` activation columns, so the
//! unpack of weight quants and sub-block scales is paid once per row-block and
//! reused across columns.
//!
//! The inner loops keep everything in 256-bit integer lanes: `maddubs` multiplies
//! 8-bit weight quants (unsigned) against 8-bit activation quants (signed) into
//! 16-bit partial sums, `madd` folds in the 16-bit sub-block scales into 32-bit
//! lanes, and only the per-block scale product `d_weight * d_act` touches floats.
//! Sub-block minimums of the dmin-bearing formats are absorbed through the
//! activation `bsums` without revisiting the quants.
//!
//! # Safety
//!
//! Everything here requires AVX2 + FMA and raw pointers with the strides the
//! entry point computed; callers go through the dispatcher in the parent module.

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::too_many_arguments)]
// SIMD intrinsics take i8/i32 immediates; the bit patterns are what matters.
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

#[allow(clippy::wildcard_imports)]
use std::arch::x86_64::*;

use crate::quantize::scales::{make_q3_scales, make_q4_scales, KVALUES_IQ4NL};
use crate::quantize::{
    f16_to_f32, IQ4XS_BLOCK_BYTES, Q2K_BLOCK_BYTES, Q3K_BLOCK_BYTES, Q4K_BLOCK_BYTES,
    Q5K_BLOCK_BYTES, Q6K_BLOCK_BYTES, Q8K_BLOCK_BYTES, Q8K_BSUMS, Q8K_QS, QK_K,
};

// Byte offsets within one packed block of each weight format.
const Q2K_SCALES: usize = 0;
const Q2K_QS: usize = 16;
const Q2K_D: usize = 80;
const Q2K_DMIN: usize = 82;

const Q3K_HMASK: usize = 0;
const Q3K_QS: usize = 32;
const Q3K_SCALES: usize = 96;
const Q3K_D: usize = 108;

const Q4K_D: usize = 0;
const Q4K_DMIN: usize = 2;
const Q4K_SCALES: usize = 4;
const Q4K_QS: usize = 16;

const Q5K_D: usize = 0;
const Q5K_DMIN: usize = 2;
const Q5K_SCALES: usize = 4;
const Q5K_QH: usize = 16;
const Q5K_QS: usize = 48;

const Q6K_QL: usize = 0;
const Q6K_QH: usize = 128;
const Q6K_SCALES: usize = 192;
const Q6K_D: usize = 208;

const IQ4XS_D: usize = 0;
const IQ4XS_SCALES_H: usize = 2;
const IQ4XS_SCALES_L: usize = 4;
const IQ4XS_QS: usize = 8;

/// Broadcast table for 16-value sub-blocks: row `i` repeats the 16-bit scale
/// word `2i` across the low 128 bits and word `2i+1` across the high 128 bits.
static SCALE_SHUFFLE_16: [u8; 128] = [
    0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2, 3, 2,
    3, 4, 5, 4, 5, 4, 5, 4, 5, 4, 5, 4, 5, 4, 5, 4, 5, 6, 7, 6, 7, 6, 7, 6, 7, 6, 7, 6, 7, 6, 7,
    6, 7, 8, 9, 8, 9, 8, 9, 8, 9, 8, 9, 8, 9, 8, 9, 8, 9, 10, 11, 10, 11, 10, 11, 10, 11, 10, 11,
    10, 11, 10, 11, 10, 11, 12, 13, 12, 13, 12, 13, 12, 13, 12, 13, 12, 13, 12, 13, 12, 13, 14,
    15, 14, 15, 14, 15, 14, 15, 14, 15, 14, 15, 14, 15, 14, 15,
];

/// Interleave order turning the nibble-split IQ4_XS scale bytes sequential.
static IQ4_SCALE_SHUFFLE: [u8; 16] = [0, 4, 1, 5, 2, 6, 3, 7, 0, 4, 1, 5, 2, 6, 3, 7];

#[target_feature(enable = "avx2")]
#[inline]
unsafe fn scale_shuffle_16(i: usize) -> __m256i {
    debug_assert!(i < 4);
    _mm256_loadu_si256(SCALE_SHUFFLE_16.as_ptr().add(32 * i).cast())
}

/// Broadcast of the 16-bit scale word `i` across all 16-bit positions, for
/// 32-value sub-blocks.
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn scale_shuffle_8(i: usize) -> __m256i {
    _mm256_set1_epi16(((2 * i) | ((2 * i + 1) << 8)) as i16)
}

#[target_feature(enable = "avx2")]
#[inline]
unsafe fn set_m128i(hi: __m128i, lo: __m128i) -> __m256i {
    _mm256_insertf128_si256(_mm256_castsi128_si256(lo), hi, 1)
}

#[target_feature(enable = "avx2")]
#[inline]
unsafe fn hsum_f32_4(x: __m128) -> f32 {
    let x = _mm_add_ps(x, _mm_movehl_ps(x, x));
    let x = _mm_add_ss(x, _mm_movehdup_ps(x));
    _mm_cvtss_f32(x)
}

#[target_feature(enable = "avx2")]
#[inline]
unsafe fn hsum_f32_8(x: __m256) -> f32 {
    hsum_f32_4(_mm_add_ps(
        _mm256_castps256_ps128(x),
        _mm256_extractf128_ps(x, 1),
    ))
}

#[inline]
unsafe fn read_u16(p: *const u8) -> u16 {
    p.cast::<u16>().read_unaligned()
}

/// Borrowed view over `NRC_Y` Q8_K activation columns.
///
/// Holds one base pointer per column plus the shared byte stride; lookups are
/// indexed by (column, block, 32-byte group).
struct Q8<const NRC_Y: usize> {
    y: [*const u8; NRC_Y],
}

impl<const NRC_Y: usize> Q8<NRC_Y> {
    #[inline]
    unsafe fn new(vy: *const u8, by: usize) -> Self {
        let mut y = [vy; NRC_Y];
        for (iy, p) in y.iter_mut().enumerate() {
            *p = vy.add(iy * by);
        }
        Self { y }
    }

    #[target_feature(enable = "avx2")]
    #[inline]
    unsafe fn load_quants(&self, iy: usize, i: usize, j: usize) -> __m256i {
        _mm256_loadu_si256(
            self.y[iy]
                .add(i * Q8K_BLOCK_BYTES + Q8K_QS + 32 * j)
                .cast(),
        )
    }

    #[target_feature(enable = "avx2")]
    #[inline]
    unsafe fn load_bsums(&self, iy: usize, i: usize) -> __m256i {
        _mm256_loadu_si256(self.y[iy].add(i * Q8K_BLOCK_BYTES + Q8K_BSUMS).cast())
    }

    #[inline]
    unsafe fn scale(&self, iy: usize, i: usize) -> f32 {
        self.y[iy].add(i * Q8K_BLOCK_BYTES).cast::<f32>().read_unaligned()
    }
}

/// Q2_K x Q8_K, `NRC_Y` columns per call.
///
/// For `NRC_Y <= 2` the second 2-bit plane of each pair is consumed un-shifted
/// (as the value x4) into a separate accumulator, compensated by the 0.25 factor
/// at reduce time; the min correction shares the first accumulator.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn mul_mat_q2_k_q8_k<const NRC_Y: usize>(
    k: usize,
    c: *mut f32,
    stride_c: usize,
    vx: *const u8,
    bx: usize,
    vy: *const u8,
    by: usize,
    nrc_x: usize,
) {
    debug_assert!(k.is_multiple_of(QK_K));
    let nb = k / QK_K;
    let k_nrc = if NRC_Y <= 2 { 2 * NRC_Y } else { NRC_Y };

    let m3 = _mm256_set1_epi8(3);
    let mc = _mm256_set1_epi8(12);
    let m4 = _mm_set1_epi8(0xF);

    let q8 = Q8::<NRC_Y>::new(vy, by);

    let mut scales = [_mm256_setzero_si256(); 2];
    let mut sumi = [_mm256_setzero_si256(); 8];
    let mut accd = [_mm256_setzero_ps(); 8];

    for ix in 0..nrc_x {
        for acc in accd.iter_mut().take(k_nrc) {
            *acc = _mm256_setzero_ps();
        }
        let row = vx.add(ix * bx);

        for i in 0..nb {
            let x = row.add(i * Q2K_BLOCK_BYTES);
            let mut q2 = x.add(Q2K_QS);

            let d2 = f16_to_f32(read_u16(x.add(Q2K_D)));
            let c2 = -f16_to_f32(read_u16(x.add(Q2K_DMIN)));

            let mins_and_scales = _mm_loadu_si128(x.add(Q2K_SCALES).cast());
            let scales8 = _mm_and_si128(mins_and_scales, m4);
            let mins8 = _mm_and_si128(_mm_srli_epi16(mins_and_scales, 4), m4);
            let mins = _mm256_cvtepi8_epi16(mins8);

            for iy in 0..NRC_Y {
                let prod = _mm256_madd_epi16(mins, q8.load_bsums(iy, i));
                let acc = if NRC_Y <= 2 { 2 * iy } else { iy };
                accd[acc] = _mm256_fmadd_ps(
                    _mm256_set1_ps(c2 * q8.scale(iy, i)),
                    _mm256_cvtepi32_ps(prod),
                    accd[acc],
                );
            }

            let all_scales = _mm256_cvtepi8_epi16(scales8);
            let l_scales = _mm256_extracti128_si256(all_scales, 0);
            let h_scales = _mm256_extracti128_si256(all_scales, 1);
            scales[0] = set_m128i(l_scales, l_scales);
            scales[1] = set_m128i(h_scales, h_scales);

            for s in sumi.iter_mut().take(k_nrc) {
                *s = _mm256_setzero_si256();
            }

            for j in 0..QK_K / 128 {
                let mut q2bits = _mm256_loadu_si256(q2.cast());
                q2 = q2.add(32);

                for l in 0..2 {
                    let scales_0 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(2 * l));
                    let scales_1 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(2 * l + 1));

                    let q2_0 = _mm256_and_si256(q2bits, m3);
                    let q2_1 = if NRC_Y <= 2 {
                        _mm256_and_si256(q2bits, mc)
                    } else {
                        _mm256_and_si256(_mm256_srli_epi16(q2bits, 2), m3)
                    };

                    for iy in 0..NRC_Y {
                        let p0 = _mm256_maddubs_epi16(q2_0, q8.load_quants(iy, i, 4 * j + 2 * l));
                        let p1 =
                            _mm256_maddubs_epi16(q2_1, q8.load_quants(iy, i, 4 * j + 2 * l + 1));

                        if NRC_Y <= 2 {
                            sumi[2 * iy] =
                                _mm256_add_epi32(sumi[2 * iy], _mm256_madd_epi16(scales_0, p0));
                            sumi[2 * iy + 1] =
                                _mm256_add_epi32(sumi[2 * iy + 1], _mm256_madd_epi16(scales_1, p1));
                        } else {
                            sumi[iy] = _mm256_add_epi32(
                                sumi[iy],
                                _mm256_add_epi32(
                                    _mm256_madd_epi16(scales_0, p0),
                                    _mm256_madd_epi16(scales_1, p1),
                                ),
                            );
                        }
                    }

                    q2bits = _mm256_srli_epi16(q2bits, 4);
                }
            }

            for iy in 0..NRC_Y {
                let vd = _mm256_set1_ps(d2 * q8.scale(iy, i));
                if NRC_Y <= 2 {
                    accd[2 * iy] =
                        _mm256_fmadd_ps(vd, _mm256_cvtepi32_ps(sumi[2 * iy]), accd[2 * iy]);
                    accd[2 * iy + 1] =
                        _mm256_fmadd_ps(vd, _mm256_cvtepi32_ps(sumi[2 * iy + 1]), accd[2 * iy + 1]);
                } else {
                    accd[iy] = _mm256_fmadd_ps(vd, _mm256_cvtepi32_ps(sumi[iy]), accd[iy]);
                }
            }
        }

        for iy in 0..NRC_Y {
            let out = c.add(ix + iy * stride_c);
            if NRC_Y <= 2 {
                *out = hsum_f32_8(accd[2 * iy]) + 0.25 * hsum_f32_8(accd[2 * iy + 1]);
            } else {
                *out = hsum_f32_8(accd[iy]);
            }
        }
    }
}

/// Q3_K x Q8_K, `NRC_Y` columns per call.
///
/// Quants are consumed as the unsigned value `low2 | hbit<<2`; the representation's
/// constant -4 is folded in at reduce time through the scale-times-bsums accumulator.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn mul_mat_q3_k_q8_k<const NRC_Y: usize>(
    k: usize,
    c: *mut f32,
    stride_c: usize,
    vx: *const u8,
    bx: usize,
    vy: *const u8,
    by: usize,
    nrc_x: usize,
) {
    debug_assert!(k.is_multiple_of(QK_K));
    let nb = k / QK_K;

    let q8 = Q8::<NRC_Y>::new(vy, by);

    let m3l = _mm256_set1_epi8(0x03);
    let m32 = _mm_set1_epi8(32);
    let hml = _mm256_set1_epi8(0x04);

    let mut scales = [_mm256_setzero_si256(); 2];
    let mut hbits = [_mm256_setzero_si256(); 2];
    let mut vd = [_mm256_setzero_ps(); 8];

    for ix in 0..nrc_x {
        let row = vx.add(ix * bx);

        let mut accd = [_mm256_setzero_ps(); 8];
        let mut accm = [_mm256_setzero_ps(); 8];

        for i in 0..nb {
            let x = row.add(i * Q3K_BLOCK_BYTES);
            let d3 = f16_to_f32(read_u16(x.add(Q3K_D)));
            let mut q3 = x.add(Q3K_QS);

            {
                let words = make_q3_scales(&*x.add(Q3K_SCALES).cast::<[u8; 12]>());
                let scales128 = _mm_sub_epi8(_mm_loadu_si128(words.as_ptr().cast()), m32);
                let all_scales = _mm256_cvtepi8_epi16(scales128);
                for iy in 0..NRC_Y {
                    vd[iy] = _mm256_set1_ps(d3 * q8.scale(iy, i));
                    let prod = _mm256_madd_epi16(all_scales, q8.load_bsums(iy, i));
                    accm[iy] = _mm256_fmadd_ps(vd[iy], _mm256_cvtepi32_ps(prod), accm[iy]);
                }
                let l_scales = _mm256_extracti128_si256(all_scales, 0);
                let h_scales = _mm256_extracti128_si256(all_scales, 1);
                scales[0] = set_m128i(l_scales, l_scales);
                scales[1] = set_m128i(h_scales, h_scales);
            }

            hbits[0] = _mm256_loadu_si256(x.add(Q3K_HMASK).cast());
            hbits[1] = _mm256_srli_epi16(hbits[0], 4);

            let mut sumi = [_mm256_setzero_si256(); 8];

            for j in 0..QK_K / 128 {
                let scales_0 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(0));
                let scales_1 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(1));
                let scales_2 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(2));
                let scales_3 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(3));

                let q3bits = _mm256_loadu_si256(q3.cast());
                q3 = q3.add(32);

                let q3h_0 = _mm256_and_si256(_mm256_slli_epi16(hbits[j], 2), hml);
                let q3h_1 = _mm256_and_si256(_mm256_slli_epi16(hbits[j], 1), hml);
                let q3h_2 = _mm256_and_si256(hbits[j], hml);
                let q3h_3 = _mm256_and_si256(_mm256_srli_epi16(hbits[j], 1), hml);

                let q3_0 = _mm256_or_si256(_mm256_and_si256(q3bits, m3l), q3h_0);
                let q3_1 =
                    _mm256_or_si256(_mm256_and_si256(_mm256_srli_epi16(q3bits, 2), m3l), q3h_1);
                let q3_2 =
                    _mm256_or_si256(_mm256_and_si256(_mm256_srli_epi16(q3bits, 4), m3l), q3h_2);
                let q3_3 =
                    _mm256_or_si256(_mm256_and_si256(_mm256_srli_epi16(q3bits, 6), m3l), q3h_3);

                for iy in 0..NRC_Y {
                    let p16_0 = _mm256_maddubs_epi16(q3_0, q8.load_quants(iy, i, 4 * j));
                    let p16_1 = _mm256_maddubs_epi16(q3_1, q8.load_quants(iy, i, 4 * j + 1));
                    let p16_2 = _mm256_maddubs_epi16(q3_2, q8.load_quants(iy, i, 4 * j + 2));
                    let p16_3 = _mm256_maddubs_epi16(q3_3, q8.load_quants(iy, i, 4 * j + 3));

                    let p16_0 = _mm256_madd_epi16(scales_0, p16_0);
                    let p16_1 = _mm256_madd_epi16(scales_1, p16_1);
                    let p16_2 = _mm256_madd_epi16(scales_2, p16_2);
                    let p16_3 = _mm256_madd_epi16(scales_3, p16_3);

                    sumi[iy] = _mm256_add_epi32(sumi[iy], _mm256_add_epi32(p16_0, p16_1));
                    sumi[iy] = _mm256_add_epi32(sumi[iy], _mm256_add_epi32(p16_2, p16_3));
                }
            }

            for iy in 0..NRC_Y {
                accd[iy] = _mm256_fmadd_ps(vd[iy], _mm256_cvtepi32_ps(sumi[iy]), accd[iy]);
            }
        }

        for iy in 0..NRC_Y {
            *c.add(ix + iy * stride_c) = hsum_f32_8(accd[iy]) - 4.0 * hsum_f32_8(accm[iy]);
        }
    }
}

/// Q4_K x Q8_K, `NRC_Y` columns per call.
///
/// For `NRC_Y <= 2` the high nibbles are consumed un-shifted (as the value x16)
/// into a separate accumulator, compensated by the 0.0625 factor at reduce time.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn mul_mat_q4_k_q8_k<const NRC_Y: usize>(
    k: usize,
    c: *mut f32,
    stride_c: usize,
    vx: *const u8,
    bx: usize,
    vy: *const u8,
    by: usize,
    nrc_x: usize,
) {
    debug_assert!(k.is_multiple_of(QK_K));
    let nb = k / QK_K;
    let k_nrc = if NRC_Y <= 2 { 2 * NRC_Y } else { NRC_Y };

    let q8 = Q8::<NRC_Y>::new(vy, by);

    let ml = _mm256_set1_epi8(0x0F);
    let mh = _mm256_set1_epi8(-16);

    let mut accm = [_mm_setzero_ps(); 8];
    let mut sumi = [_mm256_setzero_si256(); 8];
    let mut accd = [_mm256_setzero_ps(); 8];

    for ix in 0..nrc_x {
        for iy in 0..NRC_Y {
            accm[iy] = _mm_setzero_ps();
            if NRC_Y <= 2 {
                accd[2 * iy] = _mm256_setzero_ps();
                accd[2 * iy + 1] = _mm256_setzero_ps();
            } else {
                accd[iy] = _mm256_setzero_ps();
            }
        }

        let row = vx.add(ix * bx);

        for i in 0..nb {
            let x = row.add(i * Q4K_BLOCK_BYTES);
            let d = f16_to_f32(read_u16(x.add(Q4K_D)));
            let cmin = -f16_to_f32(read_u16(x.add(Q4K_DMIN)));
            let mut q4 = x.add(Q4K_QS);

            let utmp = make_q4_scales(&*x.add(Q4K_SCALES).cast::<[u8; 12]>());
            let mins_and_scales = _mm256_cvtepu8_epi16(_mm_loadu_si128(utmp.as_ptr().cast()));
            let mins = _mm256_extracti128_si256(mins_and_scales, 1);
            let sc128 = _mm256_extracti128_si256(mins_and_scales, 0);
            let scales = set_m128i(sc128, sc128);

            for iy in 0..NRC_Y {
                let q8sums = q8.load_bsums(iy, i);
                let q8s = _mm_hadd_epi16(
                    _mm256_extracti128_si256(q8sums, 0),
                    _mm256_extracti128_si256(q8sums, 1),
                );
                let prod = _mm_madd_epi16(mins, q8s);
                accm[iy] = _mm_fmadd_ps(
                    _mm_set1_ps(cmin * q8.scale(iy, i)),
                    _mm_cvtepi32_ps(prod),
                    accm[iy],
                );
            }

            for s in sumi.iter_mut().take(k_nrc) {
                *s = _mm256_setzero_si256();
            }

            for j in 0..QK_K / 64 {
                let scales_l = _mm256_shuffle_epi8(scales, scale_shuffle_8(2 * j));
                let scales_h = _mm256_shuffle_epi8(scales, scale_shuffle_8(2 * j + 1));

                let q4bits = _mm256_loadu_si256(q4.cast());
                q4 = q4.add(32);
                let q4l = _mm256_and_si256(q4bits, ml);
                let q4h = if NRC_Y <= 2 {
                    _mm256_and_si256(q4bits, mh)
                } else {
                    _mm256_and_si256(_mm256_srli_epi16(q4bits, 4), ml)
                };

                for iy in 0..NRC_Y {
                    let q8l = q8.load_quants(iy, i, 2 * j);
                    let q8h = q8.load_quants(iy, i, 2 * j + 1);
                    if NRC_Y <= 2 {
                        sumi[2 * iy] = _mm256_add_epi32(
                            sumi[2 * iy],
                            _mm256_madd_epi16(scales_l, _mm256_maddubs_epi16(q4l, q8l)),
                        );
                        sumi[2 * iy + 1] = _mm256_add_epi32(
                            sumi[2 * iy + 1],
                            _mm256_madd_epi16(scales_h, _mm256_maddubs_epi16(q4h, q8h)),
                        );
                    } else {
                        let pl = _mm256_madd_epi16(scales_l, _mm256_maddubs_epi16(q4l, q8l));
                        let ph = _mm256_madd_epi16(scales_h, _mm256_maddubs_epi16(q4h, q8h));
                        sumi[iy] = _mm256_add_epi32(sumi[iy], _mm256_add_epi32(pl, ph));
                    }
                }
            }

            for iy in 0..NRC_Y {
                let vd = _mm256_set1_ps(d * q8.scale(iy, i));
                if NRC_Y <= 2 {
                    accd[2 * iy] =
                        _mm256_fmadd_ps(vd, _mm256_cvtepi32_ps(sumi[2 * iy]), accd[2 * iy]);
                    accd[2 * iy + 1] =
                        _mm256_fmadd_ps(vd, _mm256_cvtepi32_ps(sumi[2 * iy + 1]), accd[2 * iy + 1]);
                } else {
                    accd[iy] = _mm256_fmadd_ps(vd, _mm256_cvtepi32_ps(sumi[iy]), accd[iy]);
                }
            }
        }

        for iy in 0..NRC_Y {
            let out = c.add(ix + iy * stride_c);
            if NRC_Y <= 2 {
                *out = hsum_f32_8(accd[2 * iy])
                    + 0.0625 * hsum_f32_8(accd[2 * iy + 1])
                    + hsum_f32_4(accm[iy]);
            } else {
                let d128 = _mm_add_ps(
                    _mm256_castps256_ps128(accd[iy]),
                    _mm256_extractf128_ps(accd[iy], 1),
                );
                *out = hsum_f32_4(_mm_add_ps(d128, accm[iy]));
            }
        }
    }
}

/// Q5_K x Q8_K, `NRC_Y` columns per call.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn mul_mat_q5_k_q8_k<const NRC_Y: usize>(
    k: usize,
    c: *mut f32,
    stride_c: usize,
    vx: *const u8,
    bx: usize,
    vy: *const u8,
    by: usize,
    nrc_x: usize,
) {
    debug_assert!(k.is_multiple_of(QK_K));
    let nb = k / QK_K;

    let q8 = Q8::<NRC_Y>::new(vy, by);

    let ml = _mm256_set1_epi8(0x0F);
    let mh = _mm256_set1_epi8(0x10);

    for ix in 0..nrc_x {
        let mut accm = [_mm_setzero_ps(); 8];
        let mut accd = [_mm256_setzero_ps(); 8];

        let row = vx.add(ix * bx);

        for i in 0..nb {
            let x = row.add(i * Q5K_BLOCK_BYTES);
            let d = f16_to_f32(read_u16(x.add(Q5K_D)));
            let cmin = -f16_to_f32(read_u16(x.add(Q5K_DMIN)));
            let mut q5 = x.add(Q5K_QS);

            let utmp = make_q4_scales(&*x.add(Q5K_SCALES).cast::<[u8; 12]>());
            let mins_and_scales = _mm256_cvtepu8_epi16(_mm_loadu_si128(utmp.as_ptr().cast()));
            let mins = _mm256_extracti128_si256(mins_and_scales, 1);
            let sc128 = _mm256_extracti128_si256(mins_and_scales, 0);
            let scales = set_m128i(sc128, sc128);

            for iy in 0..NRC_Y {
                let q8sums = q8.load_bsums(iy, i);
                let q8s = _mm_hadd_epi16(
                    _mm256_extracti128_si256(q8sums, 0),
                    _mm256_extracti128_si256(q8sums, 1),
                );
                let prod = _mm_madd_epi16(mins, q8s);
                accm[iy] = _mm_fmadd_ps(
                    _mm_set1_ps(cmin * q8.scale(iy, i)),
                    _mm_cvtepi32_ps(prod),
                    accm[iy],
                );
            }

            let mut hbits = [_mm256_setzero_si256(); 2];
            hbits[0] = _mm256_loadu_si256(x.add(Q5K_QH).cast());
            hbits[1] = _mm256_srli_epi16(hbits[0], 4);

            let mut sumi = [_mm256_setzero_si256(); 8];

            for j in 0..QK_K / 128 {
                let scales_1 = _mm256_shuffle_epi8(scales, scale_shuffle_8(4 * j));
                let scales_2 = _mm256_shuffle_epi8(scales, scale_shuffle_8(4 * j + 1));
                let scales_3 = _mm256_shuffle_epi8(scales, scale_shuffle_8(4 * j + 2));
                let scales_4 = _mm256_shuffle_epi8(scales, scale_shuffle_8(4 * j + 3));

                let q5h_1 = _mm256_and_si256(_mm256_slli_epi16(hbits[j], 4), mh);
                let q5h_2 = _mm256_and_si256(_mm256_slli_epi16(hbits[j], 3), mh);
                let q5h_3 = _mm256_and_si256(_mm256_slli_epi16(hbits[j], 2), mh);
                let q5h_4 = _mm256_and_si256(_mm256_slli_epi16(hbits[j], 1), mh);

                let q5bits = _mm256_loadu_si256(q5.cast());
                q5 = q5.add(32);
                let q5_1 = _mm256_add_epi8(_mm256_and_si256(q5bits, ml), q5h_1);
                let q5_2 = _mm256_add_epi8(
                    _mm256_and_si256(_mm256_srli_epi16(q5bits, 4), ml),
                    q5h_2,
                );

                let q5bits = _mm256_loadu_si256(q5.cast());
                q5 = q5.add(32);
                let q5_3 = _mm256_add_epi8(_mm256_and_si256(q5bits, ml), q5h_3);
                let q5_4 = _mm256_add_epi8(
                    _mm256_and_si256(_mm256_srli_epi16(q5bits, 4), ml),
                    q5h_4,
                );

                for iy in 0..NRC_Y {
                    let p1 = _mm256_madd_epi16(
                        scales_1,
                        _mm256_maddubs_epi16(q5_1, q8.load_quants(iy, i, 4 * j)),
                    );
                    let p2 = _mm256_madd_epi16(
                        scales_2,
                        _mm256_maddubs_epi16(q5_2, q8.load_quants(iy, i, 4 * j + 1)),
                    );
                    let p3 = _mm256_madd_epi16(
                        scales_3,
                        _mm256_maddubs_epi16(q5_3, q8.load_quants(iy, i, 4 * j + 2)),
                    );
                    let p4 = _mm256_madd_epi16(
                        scales_4,
                        _mm256_maddubs_epi16(q5_4, q8.load_quants(iy, i, 4 * j + 3)),
                    );
                    sumi[iy] = _mm256_add_epi32(sumi[iy], _mm256_add_epi32(p1, p3));
                    sumi[iy] = _mm256_add_epi32(sumi[iy], _mm256_add_epi32(p2, p4));
                }
            }

            for iy in 0..NRC_Y {
                let vd = _mm256_set1_ps(d * q8.scale(iy, i));
                accd[iy] = _mm256_fmadd_ps(vd, _mm256_cvtepi32_ps(sumi[iy]), accd[iy]);
            }
        }

        for iy in 0..NRC_Y {
            let d128 = _mm_add_ps(
                _mm256_castps256_ps128(accd[iy]),
                _mm256_extractf128_ps(accd[iy], 1),
            );
            *c.add(ix + iy * stride_c) = hsum_f32_4(_mm_add_ps(d128, accm[iy]));
        }
    }
}

/// Q6_K x Q8_K, `NRC_Y` columns per call.
///
/// Quants are consumed as the unsigned value `low4 | hi2<<4`; the -32 offset is
/// folded in at reduce time through the scale-times-bsums accumulator.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn mul_mat_q6_k_q8_k<const NRC_Y: usize>(
    k: usize,
    c: *mut f32,
    stride_c: usize,
    vx: *const u8,
    bx: usize,
    vy: *const u8,
    by: usize,
    nrc_x: usize,
) {
    debug_assert!(k.is_multiple_of(QK_K));
    let nb = k / QK_K;

    let m4 = _mm256_set1_epi8(0xF);
    let mh = _mm256_set1_epi8(0x30);

    let q8 = Q8::<NRC_Y>::new(vy, by);

    let mut scales = [_mm256_setzero_si256(); 2];
    let mut vd = [_mm256_setzero_ps(); 8];

    for ix in 0..nrc_x {
        let row = vx.add(ix * bx);

        let mut accm = [_mm256_setzero_ps(); 8];
        let mut accd = [_mm256_setzero_ps(); 8];

        for i in 0..nb {
            let x = row.add(i * Q6K_BLOCK_BYTES);
            let d6 = f16_to_f32(read_u16(x.add(Q6K_D)));
            let mut q4 = x.add(Q6K_QL);
            let mut qh = x.add(Q6K_QH);

            let scales8 = _mm_loadu_si128(x.add(Q6K_SCALES).cast());
            let scales16 = _mm256_cvtepi8_epi16(scales8);
            let l_scales = _mm256_castsi256_si128(scales16);
            let h_scales = _mm256_extractf128_si256(scales16, 1);
            scales[0] = set_m128i(l_scales, l_scales);
            scales[1] = set_m128i(h_scales, h_scales);

            for iy in 0..NRC_Y {
                vd[iy] = _mm256_set1_ps(d6 * q8.scale(iy, i));
                let prod = _mm256_madd_epi16(scales16, q8.load_bsums(iy, i));
                accm[iy] = _mm256_fmadd_ps(vd[iy], _mm256_cvtepi32_ps(prod), accm[iy]);
            }

            let mut sumi = [_mm256_setzero_si256(); 8];

            for j in 0..QK_K / 128 {
                let scale_0 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(0));
                let scale_1 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(1));
                let scale_2 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(2));
                let scale_3 = _mm256_shuffle_epi8(scales[j], scale_shuffle_16(3));

                let q4bits1 = _mm256_loadu_si256(q4.cast());
                q4 = q4.add(32);
                let q4bits2 = _mm256_loadu_si256(q4.cast());
                q4 = q4.add(32);
                let q4bits_h = _mm256_loadu_si256(qh.cast());
                qh = qh.add(32);

                let q4h_0 = _mm256_and_si256(_mm256_slli_epi16(q4bits_h, 4), mh);
                let q4h_1 = _mm256_and_si256(_mm256_slli_epi16(q4bits_h, 2), mh);
                let q4h_2 = _mm256_and_si256(q4bits_h, mh);
                let q4h_3 = _mm256_and_si256(_mm256_srli_epi16(q4bits_h, 2), mh);

                let q6_0 = _mm256_or_si256(_mm256_and_si256(q4bits1, m4), q4h_0);
                let q6_1 = _mm256_or_si256(_mm256_and_si256(q4bits2, m4), q4h_1);
                let q6_2 =
                    _mm256_or_si256(_mm256_and_si256(_mm256_srli_epi16(q4bits1, 4), m4), q4h_2);
                let q6_3 =
                    _mm256_or_si256(_mm256_and_si256(_mm256_srli_epi16(q4bits2, 4), m4), q4h_3);

                for iy in 0..NRC_Y {
                    let p16_0 = _mm256_maddubs_epi16(q6_0, q8.load_quants(iy, i, 4 * j));
                    let p16_1 = _mm256_maddubs_epi16(q6_1, q8.load_quants(iy, i, 4 * j + 1));
                    let p16_2 = _mm256_maddubs_epi16(q6_2, q8.load_quants(iy, i, 4 * j + 2));
                    let p16_3 = _mm256_maddubs_epi16(q6_3, q8.load_quants(iy, i, 4 * j + 3));

                    let p16_0 = _mm256_madd_epi16(scale_0, p16_0);
                    let p16_1 = _mm256_madd_epi16(scale_1, p16_1);
                    let p16_2 = _mm256_madd_epi16(scale_2, p16_2);
                    let p16_3 = _mm256_madd_epi16(scale_3, p16_3);

                    sumi[iy] = _mm256_add_epi32(
                        sumi[iy],
                        _mm256_add_epi32(
                            _mm256_add_epi32(p16_0, p16_1),
                            _mm256_add_epi32(p16_2, p16_3),
                        ),
                    );
                }
            }

            for iy in 0..NRC_Y {
                accd[iy] = _mm256_fmadd_ps(vd[iy], _mm256_cvtepi32_ps(sumi[iy]), accd[iy]);
            }
        }

        for iy in 0..NRC_Y {
            *c.add(ix + iy * stride_c) = hsum_f32_8(accd[iy]) - 32.0 * hsum_f32_8(accm[iy]);
        }
    }
}

/// Expand 16 packed nibbles into a 256-bit lane: low nibbles in the low half,
/// high nibbles in the high half.
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn iq4_unpack(qs: *const u8, m4: __m256i) -> __m256i {
    let aux128 = _mm_loadu_si128(qs.cast());
    let aux256 = set_m128i(_mm_srli_epi16(aux128, 4), aux128);
    _mm256_and_si256(m4, aux256)
}

/// `maddubs` for signed-by-signed operands: absorb the sign of `x` into `y` so the
/// unsigned-by-signed multiply preserves the signed product.
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn maddubs_signed(x: __m256i, y: __m256i) -> __m256i {
    let ux = _mm256_sign_epi8(x, x);
    let sy = _mm256_sign_epi8(y, x);
    _mm256_maddubs_epi16(ux, sy)
}

/// IQ4_XS x Q8_K, `NRC_Y` columns per call.
///
/// Weight quants go through the 16-entry codebook, so the 8-bit multiply works on
/// signed values (-127..113) via [`maddubs_signed`]. No correction accumulator.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn mul_mat_iq4_xs_q8_k<const NRC_Y: usize>(
    k: usize,
    c: *mut f32,
    stride_c: usize,
    vx: *const u8,
    bx: usize,
    vy: *const u8,
    by: usize,
    nrc_x: usize,
) {
    debug_assert!(k.is_multiple_of(QK_K));
    let nb = k / QK_K;

    let values128 = _mm_loadu_si128(KVALUES_IQ4NL.as_ptr().cast());
    let values = set_m128i(values128, values128);

    let hshift = _mm_set_epi32(12, 8, 4, 0);
    let lshift = _mm_set_epi32(4, 0, 4, 0);
    let hmask = _mm_set1_epi16(0x03);
    let lmask = _mm_set1_epi8(0xF);
    let lshuffle = _mm_loadu_si128(IQ4_SCALE_SHUFFLE.as_ptr().cast());
    let m32 = _mm_set1_epi16(-32);
    let m4 = _mm256_set1_epi8(0xF);

    let q8 = Q8::<NRC_Y>::new(vy, by);

    for ix in 0..nrc_x {
        let row = vx.add(ix * bx);

        let mut accum = [_mm256_setzero_ps(); 8];

        for ibl in 0..nb {
            let x = row.add(ibl * IQ4XS_BLOCK_BYTES);
            let mut qs = x.add(IQ4XS_QS);

            let scales_h = u32::from(read_u16(x.add(IQ4XS_SCALES_H)));
            let tmp32 = scales_h | (scales_h << 14);
            let sh = _mm_slli_epi16(
                _mm_and_si128(
                    _mm_srlv_epi32(_mm_set1_epi32(tmp32 as i32), hshift),
                    hmask,
                ),
                4,
            );
            let scales_l = x.add(IQ4XS_SCALES_L).cast::<u32>().read_unaligned();
            let sl = _mm_and_si128(
                _mm_srlv_epi32(_mm_set1_epi32(scales_l as i32), lshift),
                lmask,
            );
            let scales128 = _mm_add_epi16(
                _mm_or_si128(sh, _mm_cvtepi8_epi16(_mm_shuffle_epi8(sl, lshuffle))),
                m32,
            );
            let scales = set_m128i(scales128, scales128);

            let mut sumi = [_mm256_setzero_si256(); 8];

            for j in 0..QK_K / 64 {
                let q4b_1 = _mm256_shuffle_epi8(values, iq4_unpack(qs, m4));
                qs = qs.add(16);
                let q4b_2 = _mm256_shuffle_epi8(values, iq4_unpack(qs, m4));
                qs = qs.add(16);

                let scales_1 = _mm256_shuffle_epi8(scales, scale_shuffle_8(2 * j));
                let scales_2 = _mm256_shuffle_epi8(scales, scale_shuffle_8(2 * j + 1));

                for iy in 0..NRC_Y {
                    let p16_1 = maddubs_signed(q4b_1, q8.load_quants(iy, ibl, 2 * j));
                    let p16_2 = maddubs_signed(q4b_2, q8.load_quants(iy, ibl, 2 * j + 1));
                    let p_1 = _mm256_madd_epi16(p16_1, scales_1);
                    let p_2 = _mm256_madd_epi16(p16_2, scales_2);
                    sumi[iy] = _mm256_add_epi32(_mm256_add_epi32(p_1, p_2), sumi[iy]);
                }
            }

            for iy in 0..NRC_Y {
                let vd = _mm256_set1_ps(
                    f16_to_f32(read_u16(x.add(IQ4XS_D))) * q8.scale(iy, ibl),
                );
                accum[iy] = _mm256_fmadd_ps(vd, _mm256_cvtepi32_ps(sumi[iy]), accum[iy]);
            }
        }

        for iy in 0..NRC_Y {
            *c.add(ix + iy * stride_c) = hsum_f32_8(accum[iy]);
        }
    }
}
