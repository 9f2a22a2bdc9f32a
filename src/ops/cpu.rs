//! Parallel CPU kernels for dense matrices.
//!
//! # CPU Kernels
//!
//! These are the only places in the crate that fan work out across threads.
//! Every kernel partitions its *output* by rows, so each output element is
//! written by exactly one worker and the result never depends on the thread
//! count or on scheduling.
//!
//! ## Implemented Kernels
//!
//! - `matmul`: row-parallel `A × B`
//! - `gather`: row-parallel rectangular copy used by slicing
//! - `scatter_add`: the adjoint of `gather`, used by slice backward rules
//!
//! Shape checks live in [`crate::tensors::Matrix`]; kernels assume valid input.

use rayon::prelude::*;

use crate::tensors::Matrix;

/// Multiplies `a` (m×k) by `b` (k×n).
///
/// Rows of the output are computed in parallel with `rayon`; the inner
/// accumulation order is fixed, so results are bitwise reproducible.
pub(crate) fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
    let (m, k) = a.shape();
    let n = b.cols();

    let a_data = a.data();
    let b_data = b.data();
    let mut out = vec![0.0; m * n];

    if n > 0 {
        out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            let a_row = &a_data[i * k..(i + 1) * k];
            for (j, cell) in row.iter_mut().enumerate() {
                let mut sum = 0.0;
                for (l, &a_il) in a_row.iter().enumerate() {
                    sum += a_il * b_data[l * n + j];
                }
                *cell = sum;
            }
        });
    }

    Matrix::from_raw(m, n, out)
}

/// Copies the sub-matrix selected by `rows` × `cols` out of `src`.
///
/// Index lists may be empty (zero-sized result), repeat, or run backwards.
pub(crate) fn gather(src: &Matrix, rows: &[usize], cols: &[usize]) -> Matrix {
    let width = cols.len();
    let src_cols = src.cols();
    let src_data = src.data();
    let mut out = vec![0.0; rows.len() * width];

    if width > 0 {
        out.par_chunks_mut(width)
            .zip(rows.par_iter())
            .for_each(|(dst, &r)| {
                let base = r * src_cols;
                for (cell, &c) in dst.iter_mut().zip(cols) {
                    *cell = src_data[base + c];
                }
            });
    }

    Matrix::from_raw(rows.len(), width, out)
}

/// Adds `grad` (shaped `rows.len()` × `cols.len()`) into the region of `dst`
/// selected by `rows` × `cols`.
///
/// Runs sequentially: a selection may name the same source cell twice, and
/// those contributions must both land.
pub(crate) fn scatter_add(dst: &mut Matrix, rows: &[usize], cols: &[usize], grad: &Matrix) {
    let dst_cols = dst.cols();
    let width = cols.len();
    let grad_data = grad.data();
    let dst_data = dst.data_mut();

    for (i, &r) in rows.iter().enumerate() {
        for (j, &c) in cols.iter().enumerate() {
            dst_data[r * dst_cols + c] += grad_data[i * width + j];
        }
    }
}
