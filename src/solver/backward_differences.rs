extern crate nalgebra as na;

use na::{DMatrix, DVector};

use crate::solver::coefficients::MAX_ORDER;

/// Number of rows of the backward-difference matrix: the state itself, one
/// difference per order, plus two scratch rows used by the error estimate at
/// order + 1.
pub const NUM_ROWS: usize = MAX_ORDER + 3;

/// Lagrange interpolation matrix for a step-size change by `step_size_ratio`.
///
/// The (i, j)-th entry (1-based, `1 <= i, j <= order`) is
///
/// ```text
/// M[i][j] = (0 - ratio*i)(1 - ratio*i)...((j-1) - ratio*i) / j!
/// ```
///
/// built as a running product along each row; entries outside the leading
/// `order x order` block are zero so higher differences are dropped by the
/// transform.
fn interpolation_matrix(order: usize, step_size_ratio: f64) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(MAX_ORDER, MAX_ORDER);
    for i in 1..=order {
        let mut cumprod = 1.0;
        for j in 1..=order {
            cumprod *= ((j as f64 - 1.0) - step_size_ratio * i as f64) / j as f64;
            m[(i - 1, j - 1)] = cumprod;
        }
    }
    m
}

/// Rebuilds the backward-difference history for a new step size.
///
/// Row 0 (the current state) is kept, rows 1..=MAX_ORDER are replaced by
/// `M(order, 1) * M(order, ratio) * rows`, and the two scratch rows are
/// zeroed. With `ratio = 1` the transform is the identity on the first
/// `order` differences since the signed binomial matrix `M(order, 1)` is an
/// involution.
///
/// Returns a new matrix; the input history is never mutated, so a rejected
/// attempt can be retried from the previous history.
pub fn interpolate(
    backward_differences: &DMatrix<f64>,
    order: usize,
    step_size_ratio: f64,
) -> DMatrix<f64> {
    let num_odes = backward_differences.ncols();
    let m_ratio = interpolation_matrix(order, step_size_ratio);
    let m_unit = interpolation_matrix(order, 1.0);
    let interpolated = m_unit * (m_ratio * backward_differences.rows(1, MAX_ORDER));

    let mut result = DMatrix::zeros(NUM_ROWS, num_odes);
    result.row_mut(0).copy_from(&backward_differences.row(0));
    result.rows_mut(1, MAX_ORDER).copy_from(&interpolated);
    result
}

/// Folds an accepted corrector result into the history.
///
/// ```text
/// new[order+2] = nbd - old[order+1]
/// new[order+1] = nbd
/// new[k]       = new[k+1] + old[k]   for k = order .. 1
/// new[0]       = next_state
/// ```
///
/// Rows above `order + 2` are carried over unchanged. Returns a new matrix.
pub fn update(
    backward_differences: &DMatrix<f64>,
    next_backward_difference: &DVector<f64>,
    next_state_vec: &DVector<f64>,
    order: usize,
) -> DMatrix<f64> {
    let mut result = backward_differences.clone();
    let old_row = backward_differences.row(order + 1).transpose();
    result
        .row_mut(order + 2)
        .copy_from(&(next_backward_difference - old_row).transpose());
    result
        .row_mut(order + 1)
        .copy_from(&next_backward_difference.transpose());
    for k in (1..=order).rev() {
        let row = result.row(k + 1) + backward_differences.row(k);
        result.row_mut(k).copy_from(&row);
    }
    result.row_mut(0).copy_from(&next_state_vec.transpose());
    result
}
