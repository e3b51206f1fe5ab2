extern crate nalgebra as na;

use na::DVector;

use crate::solver::common::{norm, tolerance_scale};

/// Highest A(alpha)-stable BDF order. BDF formulas exist up to order 6 but
/// order 6 is not zero-stable enough for step-size control, so the solver
/// adapts within 1..=5.
pub const MAX_ORDER: usize = 5;

/// `RECIPROCAL_SUMS[k] = sum(1/i for i in 1..=k)`, index 0 is a sentinel and
/// must never be read.
pub const RECIPROCAL_SUMS: [f64; MAX_ORDER + 1] = [
    f64::NAN,
    1.0,
    3.0 / 2.0,
    11.0 / 6.0,
    25.0 / 12.0,
    137.0 / 60.0,
];

/// Order-indexed coefficient tables derived once per run from the base BDF
/// coefficient vector (kappa).
///
/// `newton[k]` scales the linearized corrector system `I - h * newton[k] * J`
/// at order `k`; `error[k]` scales the backward difference of order `k+1`
/// into a local truncation error estimate. Index 0 of both tables is a
/// sentinel.
#[derive(Debug, Clone)]
pub struct Coefficients {
    pub newton: [f64; MAX_ORDER + 1],
    pub error: [f64; MAX_ORDER + 1],
}

impl Coefficients {
    /// Derives the tables from the base BDF coefficients:
    ///
    /// ```text
    /// newton[k] = 1 / ((1 - kappa[k]) * RECIPROCAL_SUMS[k])
    /// error[k]  = kappa[k] * RECIPROCAL_SUMS[k] + 1/(k + 1)
    /// ```
    ///
    /// Pure arithmetic; a `kappa[k]` of exactly 1 for a usable order is a
    /// configuration precondition violation and is rejected by the solver
    /// before this is called.
    pub fn new(bdf_coefficients: &[f64; MAX_ORDER + 1]) -> Self {
        let mut newton = [f64::NAN; MAX_ORDER + 1];
        let mut error = [f64::NAN; MAX_ORDER + 1];
        for k in 1..=MAX_ORDER {
            newton[k] = 1.0 / ((1.0 - bdf_coefficients[k]) * RECIPROCAL_SUMS[k]);
            error[k] = bdf_coefficients[k] * RECIPROCAL_SUMS[k] + 1.0 / (k as f64 + 1.0);
        }
        Coefficients { newton, error }
    }
}

/// Heuristic first step size, from the local truncation error of an order-one
/// step: `err(h) = error_coefficient * y'' * h^2`, with the second derivative
/// estimated by a forward difference of the right-hand side over `epsilon`.
/// The largest `h` with `norm(err(h) / tol) <= 1` is `1/sqrt(norm)`, damped
/// by the safety factor and clamped to `[1e-12, 1]`.
pub fn first_step_size<F>(
    atol: f64,
    first_order_error_coefficient: f64,
    initial_state: &DVector<f64>,
    initial_time: f64,
    first_derivative: &DVector<f64>,
    ode_fn: &F,
    rtol: f64,
    safety_factor: f64,
) -> f64
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
{
    const EPSILON: f64 = 1e-12;
    const MIN_STEP_SIZE: f64 = 1e-12;
    const MAX_STEP_SIZE: f64 = 1.0;

    let next_time = initial_time + EPSILON;
    let next_state = initial_state + EPSILON * first_derivative;
    let second_derivative = (ode_fn(next_time, &next_state) - first_derivative) / EPSILON;

    let tol = tolerance_scale(rtol, atol, initial_state);
    let error_norm = norm(
        &(first_order_error_coefficient * second_derivative).component_div(&tol),
    );
    if error_norm <= 0.0 || !error_norm.is_finite() {
        return MAX_STEP_SIZE;
    }
    (safety_factor / error_norm.sqrt()).clamp(MIN_STEP_SIZE, MAX_STEP_SIZE)
}
