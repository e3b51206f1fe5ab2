extern crate nalgebra as na;

use na::DVector;

use log::warn;
use num_traits::Float;
use std::error::Error;
use std::fmt::Debug;

/// Plain Euclidean norm. All weighting in the solver enters through the
/// tolerance vector, so no RMS rescaling is applied here.
pub fn norm(vector: &DVector<f64>) -> f64 {
    vector.norm()
}

/// Scaled tolerance vector `atol + rtol * |y|`, evaluated elementwise.
///
/// Both the Newton convergence threshold and the local error ratio are
/// measured against this vector.
pub fn tolerance_scale(rtol: f64, atol: f64, y: &DVector<f64>) -> DVector<f64> {
    y.map(|y_i| atol + rtol * y_i.abs())
}

/// Ratio of the estimated local truncation error to the tolerance.
///
/// The backward difference of order `k+1` scaled by the error coefficient of
/// order `k` estimates the local error of a step taken at order `k`. The step
/// is acceptable iff the returned ratio is below 1.
pub fn error_ratio(
    backward_difference: &DVector<f64>,
    error_coefficient: f64,
    tol: &DVector<f64>,
) -> f64 {
    norm(&(error_coefficient * backward_difference).component_div(tol))
}

/// Proposed step size after a step at `order` produced `error_ratio`.
///
/// `step * clamp(safety * error_ratio^(-1/(order+1)), min_factor, max_factor)`.
/// An error ratio of zero maps to the maximum growth factor through the clamp.
pub fn next_step_size(
    step_size: f64,
    order: usize,
    error_ratio: f64,
    safety_factor: f64,
    min_step_size_factor: f64,
    max_step_size_factor: f64,
) -> f64 {
    let factor = safety_factor * error_ratio.powf(-1.0 / (order as f64 + 1.0));
    step_size * factor.clamp(min_step_size_factor, max_step_size_factor)
}

/// Validates scalar tolerances before the integration loop starts.
///
/// A too-small `rtol` is bumped to `100 * EPS` with a warning, a negative
/// `atol` is a configuration error.
pub fn validate_tol(rtol: f64, atol: f64) -> Result<(f64, f64), Box<dyn Error>> {
    if !rtol.is_finite() || rtol <= 0.0 {
        return Err("`rtol` must be positive and finite.".into());
    }
    let rtol = if rtol < 100.0 * f64::EPSILON {
        warn!(
            "`rtol` is too small, setting rtol = {:e}",
            100.0 * f64::EPSILON
        );
        100.0 * f64::EPSILON
    } else {
        rtol
    };
    if !atol.is_finite() || atol < 0.0 {
        return Err("`atol` must be non-negative and finite.".into());
    }
    Ok((rtol, atol))
}

/// Checks the invariant `0 < min_step_size_factor < 1 < max_step_size_factor`.
pub fn validate_step_size_factors(
    min_step_size_factor: f64,
    max_step_size_factor: f64,
) -> Result<(), Box<dyn Error>> {
    if !(min_step_size_factor > 0.0 && min_step_size_factor < 1.0) {
        return Err("`min_step_size_factor` must lie in (0, 1).".into());
    }
    if !(max_step_size_factor > 1.0) {
        return Err("`max_step_size_factor` must be greater than 1.".into());
    }
    Ok(())
}

pub fn validate_first_step(first_step: f64) -> Result<f64, Box<dyn Error>> {
    if !first_step.is_finite() || first_step <= 0.0 {
        return Err("`first_step_size` must be positive and finite.".into());
    }
    Ok(first_step)
}

/// Solution times must be sorted ascending and must not precede the initial
/// time. Violations are rejected here, before the loop starts, rather than
/// detected inside the core.
pub fn validate_solution_times(
    initial_time: f64,
    solution_times: &[f64],
) -> Result<(), Box<dyn Error>> {
    if let Some(&first) = solution_times.first() {
        if first < initial_time {
            return Err("`solution_times` must not start before the initial time.".into());
        }
    }
    if solution_times.windows(2).any(|w| w[1] < w[0]) {
        return Err("`solution_times` must be sorted in ascending order.".into());
    }
    if solution_times.iter().any(|t| !t.is_finite()) {
        return Err("`solution_times` must be finite.".into());
    }
    Ok(())
}

/// All components of the initial state must be finite.
pub fn check_initial_state<T>(y0: &[T]) -> Result<(), Box<dyn Error>>
where
    T: Float + Debug,
{
    if y0.is_empty() {
        return Err("the initial state must not be empty.".into());
    }
    if y0.iter().any(|x| !x.is_finite()) {
        return Err("all components of the initial state must be finite.".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_norm_is_euclidean() {
        let v = DVector::from_vec(vec![3.0, 4.0]);
        assert_relative_eq!(norm(&v), 5.0, epsilon = 1e-14);
    }

    #[test]
    fn test_tolerance_scale() {
        let y = DVector::from_vec(vec![-2.0, 0.5]);
        let tol = tolerance_scale(1e-3, 1e-6, &y);
        assert_relative_eq!(tol[0], 1e-6 + 2e-3, epsilon = 1e-15);
        assert_relative_eq!(tol[1], 1e-6 + 5e-4, epsilon = 1e-15);
    }

    #[test]
    fn test_error_ratio_scalar() {
        let d = DVector::from_vec(vec![2e-6]);
        let tol = DVector::from_vec(vec![1e-6]);
        // |0.5 * 2e-6 / 1e-6| = 1
        assert_relative_eq!(error_ratio(&d, 0.5, &tol), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_next_step_size_clamps_growth() {
        // tiny error ratio: the raw factor explodes, the clamp caps it
        let h = next_step_size(0.1, 2, 1e-12, 0.9, 0.1, 10.0);
        assert_relative_eq!(h, 1.0, epsilon = 1e-12);
        // huge error ratio: the clamp floors the shrink
        let h = next_step_size(0.1, 2, 1e12, 0.9, 0.1, 10.0);
        assert_relative_eq!(h, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn test_next_step_size_moderate_ratio() {
        // factor = 0.9 * 4^(-1/2) = 0.45 at order 1
        let h = next_step_size(1.0, 1, 4.0, 0.9, 0.1, 10.0);
        assert_relative_eq!(h, 0.45, epsilon = 1e-12);
    }

    #[test]
    fn test_validate_tol_rejects_bad_values() {
        assert!(validate_tol(-1.0, 1e-6).is_err());
        assert!(validate_tol(1e-3, -1e-6).is_err());
        assert!(validate_tol(f64::NAN, 1e-6).is_err());
        let (rtol, _) = validate_tol(1e-300, 1e-6).unwrap();
        assert_eq!(rtol, 100.0 * f64::EPSILON);
    }

    #[test]
    fn test_validate_step_size_factors() {
        assert!(validate_step_size_factors(0.1, 10.0).is_ok());
        assert!(validate_step_size_factors(1.5, 10.0).is_err());
        assert!(validate_step_size_factors(0.1, 0.5).is_err());
        assert!(validate_step_size_factors(0.0, 10.0).is_err());
    }

    #[test]
    fn test_validate_solution_times() {
        assert!(validate_solution_times(0.0, &[0.0, 0.5, 1.0]).is_ok());
        assert!(validate_solution_times(0.0, &[0.5, 0.4]).is_err());
        assert!(validate_solution_times(1.0, &[0.5]).is_err());
        assert!(validate_solution_times(0.0, &[]).is_ok());
    }

    #[test]
    fn test_check_initial_state() {
        assert!(check_initial_state(&[1.0, 2.0]).is_ok());
        assert!(check_initial_state(&[1.0, f64::NAN]).is_err());
        assert!(check_initial_state::<f64>(&[]).is_err());
    }
}
