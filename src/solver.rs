/// Core state machine of the adaptive-order BDF solver for stiff IVPs.
///
/// Example: stiff exponential decay
/// ```
/// use bdf_ivp::solver::bdf::BDF;
/// use nalgebra::{DMatrix, DVector};
///
/// let ode_fn = |_t: f64, y: &DVector<f64>| -5.0 * y;
/// let jacobian_fn = |_t: f64, _y: &DVector<f64>| DMatrix::from_element(1, 1, -5.0);
/// let y0 = DVector::from_vec(vec![1.0]);
/// let results = BDF::new()
///     .solve(ode_fn, jacobian_fn, 0.0, &y0, &[1.0])
///     .unwrap();
/// assert!((results.states[(0, 0)] - (-5.0f64).exp()).abs() < 1e-3);
/// ```
pub mod bdf;
/// Front-end over the solver: owned problem callbacks, status strings,
/// CSV export and a rayon-parallel batch entry point.
pub mod bdf_api;
/// Backward-difference history transforms: step-size interpolation and the
/// post-step update.
pub mod backward_differences;
/// Order-indexed coefficient tables and the first-step-size heuristic.
pub mod coefficients;
/// Norms, tolerance scaling, step-size formula and input validation shared
/// across the solver.
pub mod common;
/// Modified Newton corrector with a cached QR factorization.
pub mod newton;
