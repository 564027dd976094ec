//! Block-quantized matrix multiplication
//!
//! Entry points for multiplying a K-quantized weight matrix by Q8_K activation
//! columns into dense f32:
//! - [`mul_mat`] - raw worker-band entry point (returns `false` on unknown type)
//! - [`mul_mat_checked`] - validated single-call wrapper
//! - [`mul_mat_parallel`] - rayon fan-out over disjoint row bands
//!
//! The result layout is column-major-ish: element `(ix, iy)` lives at
//! `c[ix + iy * stride_c]`, so one activation column's outputs are strided.
//!
//! A greedy tile dispatcher consumes the column count widest-first (8, 4, 2, 1)
//! with the widest micro-kernel available, maximizing weight-block reuse per
//! activation fetch. On x86_64 with AVX2 the kernels come from [`self::avx2`];
//! everywhere else a portable width-1 fallback is used.

// Kernel plumbing carries the full (k, c, stride, a, b, strides, band) argument
// set through every layer; splitting it into structs would obscure the contract.
#![allow(clippy::too_many_arguments)]

use crate::error::{AcelerarError, Result};
use crate::quantize::{self, WeightType, QK_K};
use rayon::prelude::*;

#[cfg(target_arch = "x86_64")]
pub(crate) mod avx2;
pub(crate) mod scalar;

/// A micro-kernel computing one row band against a fixed number of columns.
///
/// Arguments: `(k, c, stride_c, vx, bx, vy, by, nrc_x)` - inner dimension,
/// result base and element stride, weight base and row byte stride, activation
/// base and column byte stride, number of weight rows.
pub(crate) type KernelFn =
    unsafe fn(usize, *mut f32, usize, *const u8, usize, *const u8, usize, usize);

/// Kernel pointers for tile widths 1, 2, 4 and 8, in that order.
type KernelSet = [Option<KernelFn>; 4];

#[cfg(target_arch = "x86_64")]
fn avx2_kernels(weight_type: WeightType) -> KernelSet {
    macro_rules! widths {
        ($f:ident) => {
            [
                Some(avx2::$f::<1> as KernelFn),
                Some(avx2::$f::<2> as KernelFn),
                Some(avx2::$f::<4> as KernelFn),
                Some(avx2::$f::<8> as KernelFn),
            ]
        };
    }
    match weight_type {
        WeightType::Q2K => widths!(mul_mat_q2_k_q8_k),
        WeightType::Q3K => widths!(mul_mat_q3_k_q8_k),
        WeightType::Q4K => widths!(mul_mat_q4_k_q8_k),
        WeightType::Q5K => widths!(mul_mat_q5_k_q8_k),
        WeightType::Q6K => widths!(mul_mat_q6_k_q8_k),
        WeightType::Iq4Xs => widths!(mul_mat_iq4_xs_q8_k),
    }
}

fn scalar_kernels(weight_type: WeightType) -> KernelSet {
    let f: KernelFn = match weight_type {
        WeightType::Q2K => scalar::mul_mat_q2_k_1,
        WeightType::Q3K => scalar::mul_mat_q3_k_1,
        WeightType::Q4K => scalar::mul_mat_q4_k_1,
        WeightType::Q5K => scalar::mul_mat_q5_k_1,
        WeightType::Q6K => scalar::mul_mat_q6_k_1,
        WeightType::Iq4Xs => scalar::mul_mat_iq4_xs_1,
    };
    [Some(f), None, None, None]
}

fn resolve_kernels(weight_type: WeightType) -> KernelSet {
    #[cfg(target_arch = "x86_64")]
    {
        if quantize::detect_simd_backend() == quantize::SimdBackend::Avx2 {
            return avx2_kernels(weight_type);
        }
    }
    scalar_kernels(weight_type)
}

/// Greedy tile dispatcher: consume `nrc_y` columns in chunks of 8, 4, 2, 1,
/// using the widest kernel present. The order is mandatory - it minimizes
/// dispatch calls and maximizes weight reuse per activation fetch, and any
/// decomposition of `nrc_y` must produce the same tiles it does.
unsafe fn mul_mat_nx_m(
    k: usize,
    c: *mut f32,
    stride_c: usize,
    vx: *const u8,
    bx: usize,
    vy: *const u8,
    by: usize,
    nrc_x: usize,
    nrc_y: usize,
    kernels: &KernelSet,
) {
    let mut c = c;
    let mut vy = vy;
    let mut nrc_y = nrc_y;

    for (slot, step) in [(3usize, 8usize), (2, 4), (1, 2), (0, 1)] {
        let Some(kernel) = kernels[slot] else {
            continue;
        };
        if nrc_y < step {
            continue;
        }
        let n_step = nrc_y / step;
        for t in 0..n_step {
            unsafe {
                kernel(
                    k,
                    c.add(step * t * stride_c),
                    stride_c,
                    vx,
                    bx,
                    vy.add(step * t * by),
                    by,
                    nrc_x,
                );
            }
        }
        nrc_y -= step * n_step;
        if nrc_y == 0 {
            return;
        }
        c = unsafe { c.add(step * n_step * stride_c) };
        vy = unsafe { vy.add(step * n_step * by) };
    }
}

/// Resolve one worker's contiguous row band and hand it to the dispatcher.
unsafe fn mul_mat_band(
    weight_type: WeightType,
    nx: usize,
    ny: usize,
    k: usize,
    a: *const u8,
    b: *const u8,
    c: *mut f32,
    stride_c: usize,
    worker_index: usize,
    worker_count: usize,
) {
    let row_bytes = quantize::row_size(weight_type, k);
    let col_bytes = quantize::q8_k_row_size(k);

    let mut nrc_x = nx.div_ceil(worker_count);
    let first_x = worker_index * nrc_x;
    if first_x >= nx {
        return;
    }
    if first_x + nrc_x > nx {
        nrc_x = nx - first_x;
    }

    let kernels = resolve_kernels(weight_type);
    unsafe {
        mul_mat_nx_m(
            k,
            c.add(first_x),
            stride_c,
            a.add(first_x * row_bytes),
            row_bytes,
            b,
            col_bytes,
            nrc_x,
            ny,
            &kernels,
        );
    }
}

/// Multiply one worker's row band of a quantized weight matrix by Q8_K columns
///
/// - `nx`, `ny`: rows and columns of the result
/// - `k`: inner dimension, a multiple of 256
/// - `weight_type`: raw type id ([`WeightType::from_raw`]); unknown ids return
///   `false` and leave `c` untouched
/// - `a`: `nx` weight rows of [`quantize::row_size`] bytes each
/// - `b`: `ny` activation columns of [`quantize::q8_k_row_size`] bytes each
/// - `c`: result, element `(ix, iy)` at `c[ix + iy * stride_c]`
/// - `(worker_index, worker_count)`: this call computes rows
///   `[worker_index * ceil(nx / worker_count), ...)` clamped to `nx`; the set of
///   calls for one multiplication must form a non-overlapping partition
///
/// Re-entrant: no locks, no allocation, no global state. Contract violations
/// (bad `k`, bad worker pair, undersized slices) are debug assertions, not
/// runtime errors - use [`mul_mat_checked`] for validated inputs.
#[allow(clippy::too_many_arguments)]
pub fn mul_mat(
    nx: usize,
    ny: usize,
    k: usize,
    weight_type: i32,
    a: &[u8],
    b: &[u8],
    c: &mut [f32],
    stride_c: usize,
    worker_index: usize,
    worker_count: usize,
) -> bool {
    let Some(wt) = WeightType::from_raw(weight_type) else {
        return false;
    };

    debug_assert!(k.is_multiple_of(QK_K));
    debug_assert!(worker_count > 0);
    debug_assert!(worker_index < worker_count);
    debug_assert!(a.len() >= nx * quantize::row_size(wt, k));
    debug_assert!(b.len() >= ny * quantize::q8_k_row_size(k));
    debug_assert!(ny == 0 || c.len() >= (ny - 1) * stride_c + nx);

    if nx == 0 || ny == 0 {
        return true;
    }

    unsafe {
        mul_mat_band(
            wt,
            nx,
            ny,
            k,
            a.as_ptr(),
            b.as_ptr(),
            c.as_mut_ptr(),
            stride_c,
            worker_index,
            worker_count,
        );
    }
    true
}

fn validate_args(
    wt: WeightType,
    nx: usize,
    ny: usize,
    k: usize,
    a: &[u8],
    b: &[u8],
    c: &[f32],
    stride_c: usize,
) -> Result<()> {
    if !k.is_multiple_of(QK_K) {
        return Err(AcelerarError::InvalidShape {
            reason: format!("inner dimension {k} is not a multiple of block size {QK_K}"),
        });
    }
    if stride_c < nx {
        return Err(AcelerarError::InvalidShape {
            reason: format!("result stride {stride_c} is smaller than row count {nx}"),
        });
    }
    let a_bytes = nx * quantize::row_size(wt, k);
    if a.len() < a_bytes {
        return Err(AcelerarError::InvalidShape {
            reason: format!(
                "{wt} weight data too small: need {a_bytes} bytes for {nx}x{k}, have {}",
                a.len()
            ),
        });
    }
    let b_bytes = ny * quantize::q8_k_row_size(k);
    if b.len() < b_bytes {
        return Err(AcelerarError::InvalidShape {
            reason: format!(
                "Q8_K activation data too small: need {b_bytes} bytes for {k}x{ny}, have {}",
                b.len()
            ),
        });
    }
    let c_len = if ny == 0 { 0 } else { (ny - 1) * stride_c + nx };
    if c.len() < c_len {
        return Err(AcelerarError::InvalidShape {
            reason: format!(
                "result buffer too small: need {c_len} elements for {nx}x{ny}, have {}",
                c.len()
            ),
        });
    }
    Ok(())
}

/// Validated single-call multiplication (whole matrix, one worker)
///
/// Same computation as [`mul_mat`] with `(worker_index, worker_count) = (0, 1)`,
/// but every precondition is checked and reported instead of debug-asserted.
///
/// # Errors
///
/// Returns [`AcelerarError::UnsupportedWeightType`] for an unknown type id and
/// [`AcelerarError::InvalidShape`] when `k` is not a multiple of 256 or any
/// buffer is too small for the requested shape.
#[allow(clippy::too_many_arguments)]
pub fn mul_mat_checked(
    nx: usize,
    ny: usize,
    k: usize,
    weight_type: i32,
    a: &[u8],
    b: &[u8],
    c: &mut [f32],
    stride_c: usize,
) -> Result<()> {
    let wt = WeightType::from_raw(weight_type).ok_or(AcelerarError::UnsupportedWeightType {
        type_id: weight_type,
    })?;
    validate_args(wt, nx, ny, k, a, b, c, stride_c)?;
    if nx == 0 || ny == 0 {
        return Ok(());
    }
    unsafe {
        mul_mat_band(wt, nx, ny, k, a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), stride_c, 0, 1);
    }
    Ok(())
}

/// Result base pointer shared across rayon workers.
///
/// Safety: the worker bands write disjoint row ranges of `c` by construction
/// (each band is `[worker_index * ceil(nx / n), ...)`), so concurrent use never
/// aliases a written element.
#[derive(Clone, Copy)]
struct SendPtr(*mut f32);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Parallel multiplication: fan the row bands out over the rayon thread pool
///
/// Equivalent to calling [`mul_mat`] once per `(worker_index, worker_count)`
/// pair with `worker_count = min(threads, nx)`. Band boundaries depend on the
/// worker count, so the result can differ from the single-worker output in the
/// last bit - the partial-sum order within each band is still deterministic.
///
/// # Errors
///
/// Same conditions as [`mul_mat_checked`].
#[allow(clippy::too_many_arguments)]
pub fn mul_mat_parallel(
    nx: usize,
    ny: usize,
    k: usize,
    weight_type: i32,
    a: &[u8],
    b: &[u8],
    c: &mut [f32],
    stride_c: usize,
) -> Result<()> {
    let wt = WeightType::from_raw(weight_type).ok_or(AcelerarError::UnsupportedWeightType {
        type_id: weight_type,
    })?;
    validate_args(wt, nx, ny, k, a, b, c, stride_c)?;
    if nx == 0 || ny == 0 {
        return Ok(());
    }

    let workers = rayon::current_num_threads().max(1).min(nx);
    let c_base = SendPtr(c.as_mut_ptr());

    (0..workers).into_par_iter().for_each(|worker_index| {
        let c_base = c_base;
        unsafe {
            mul_mat_band(
                wt,
                nx,
                ny,
                k,
                a.as_ptr(),
                b.as_ptr(),
                c_base.0,
                stride_c,
                worker_index,
                workers,
            );
        }
    });
    Ok(())
}
