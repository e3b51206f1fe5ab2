extern crate nalgebra as na;

use na::{DMatrix, DVector};

use crate::solver::coefficients::RECIPROCAL_SUMS;
use crate::solver::common::norm;

/// Outcome of one corrector solve. Non-convergence is a normal result that
/// drives the caller's retry policy, never an error.
#[derive(Debug, Clone)]
pub struct NewtonResult {
    pub converged: bool,
    pub next_backward_difference: DVector<f64>,
    pub next_state_vec: DVector<f64>,
    /// Number of right-hand-side evaluations performed; the caller charges
    /// these to the diagnostics counter.
    pub num_iters: u64,
}

/// QR factorization of the Newton system matrix `I - h * c * J`.
///
/// The pair `(unitary, upper)` is cached in the iterand so rejected attempts
/// can re-use it when it has not been invalidated.
pub fn newton_qr(
    jacobian_mat: &DMatrix<f64>,
    newton_coefficient: f64,
    step_size: f64,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let n = jacobian_mat.nrows();
    let newton_matrix = DMatrix::identity(n, n) - step_size * newton_coefficient * jacobian_mat;
    newton_matrix.qr().unpack()
}

/// Modified Newton iteration for the corrector equation of one BDF step.
///
/// The predictor is the sum of the backward differences up to the current
/// order; each iteration evaluates the right-hand side at the predicted
/// state, forms the corrector residual
///
/// ```text
/// rhs = c*h*f(t + h, y) - c * sum(RECIPROCAL_SUMS[k] * bd[k], k = 1..order) - d
/// ```
///
/// and solves the linear system with the cached factorization (triangular
/// back-substitution after applying the transposed unitary factor).
///
/// Convergence is declared when the increment vanishes exactly or, once two
/// consecutive increments give a contraction rate below 1, when the
/// extrapolated remaining error `rate / (1 - rate) * ||delta||` falls under
/// `tol`. Divergence (rate >= 1), non-finite values and a singular triangular
/// solve all terminate the iteration as non-converged; shrinking the step
/// size drives `I - h*c*J` towards the identity, so the caller's retry policy
/// also recovers from a degenerate factorization.
pub fn newton<F>(
    backward_differences: &DMatrix<f64>,
    max_num_iters: usize,
    newton_coefficient: f64,
    ode_fn: &F,
    order: usize,
    step_size: f64,
    time: f64,
    tol: f64,
    unitary: &DMatrix<f64>,
    upper: &DMatrix<f64>,
) -> NewtonResult
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    let num_odes = backward_differences.ncols();

    let mut initial_guess = DVector::zeros(num_odes);
    for k in 0..=order {
        initial_guess += backward_differences.row(k).transpose();
    }

    let mut rhs_constant_term = DVector::zeros(num_odes);
    for k in 1..=order {
        rhs_constant_term += RECIPROCAL_SUMS[k] * backward_differences.row(k).transpose();
    }
    rhs_constant_term *= newton_coefficient;

    let next_time = time + step_size;
    let mut next_backward_difference = DVector::zeros(num_odes);
    let mut next_state_vec = initial_guess;
    let mut prev_delta_norm: Option<f64> = None;
    let mut converged = false;
    let mut num_iters: u64 = 0;

    for _ in 0..max_num_iters {
        let f = ode_fn(next_time, &next_state_vec);
        num_iters += 1;
        if !f.iter().all(|x| x.is_finite()) {
            break;
        }
        let rhs =
            newton_coefficient * step_size * f - &rhs_constant_term - &next_backward_difference;
        let projected = unitary.transpose() * rhs;
        let delta = match upper.solve_upper_triangular(&projected) {
            Some(delta) => delta,
            None => break,
        };
        if !delta.iter().all(|x| x.is_finite()) {
            break;
        }

        next_backward_difference += &delta;
        next_state_vec += &delta;

        let delta_norm = norm(&delta);
        if delta_norm == 0.0 {
            converged = true;
            break;
        }
        if let Some(prev) = prev_delta_norm {
            let rate = delta_norm / prev;
            if rate >= 1.0 {
                break;
            }
            if rate / (1.0 - rate) * delta_norm < tol {
                converged = true;
                break;
            }
        }
        prev_delta_norm = Some(delta_norm);
    }

    NewtonResult {
        converged,
        next_backward_difference,
        next_state_vec,
        num_iters,
    }
}
