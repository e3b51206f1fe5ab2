//! # Adaptive-order BDF integrator for stiff ODE systems
//!
//! Solves initial value problems
//!
//! ```text
//! dy/dt = f(t, y), y(t0) = y0
//! ```
//!
//! with Backward Differentiation Formulas of orders 1-5, adapting both the
//! order and the step size to a user-specified error tolerance.
//!
//! ## Backward-difference representation
//!
//! The solution history is held as a matrix of backward differences:
//! row 0 is the current state, row k the k-th difference scaled to the
//! current step size. The predictor is the sum of rows 0..=order; the
//! difference of order `order + 1` yields the local truncation error
//! estimate.
//!
//! ## Corrector
//!
//! Each step solves the implicit corrector equation with a modified Newton
//! iteration against the cached QR factorization of
//!
//! ```text
//! I - h * c_k * J,   c_k = 1 / ((1 - kappa_k) * sum(1/i, i=1..k))
//! ```
//!
//! where `J` is the Jacobian of the right-hand side. The factorization and
//! the Jacobian persist across rejected attempts to amortize their cost.
//!
//! ## Step control
//!
//! One step attempt (`maybe_step`) interpolates the history to a pending
//! step size, refactorizes the Newton matrix, runs the corrector and then
//! either
//! - shrinks the step (corrector failed with a fresh Jacobian),
//! - schedules a Jacobian refresh (corrector failed with a stale one),
//! - rejects the step and shrinks (converged but error ratio >= 1), or
//! - accepts: advances time, folds the corrector result into the history
//!   and, after enough equal-sized steps, reconsiders the order against its
//!   neighbors and proposes a new step size.
//!
//! The step driver retries attempts until one is accepted, clamping the last
//! sub-step so the solver lands exactly on each requested output time.
//!
//! ## References
//!
//! - Byrne, G.D., Hindmarsh, A.C. "A Polyalgorithm for the Numerical
//!   Solution of ODEs"
//! - Shampine, L.F., Reichelt, M.W. "The MATLAB ODE Suite"
//! - Hairer, E., Wanner, G. "Solving Ordinary Differential Equations II:
//!   Stiff Problems"

extern crate nalgebra as na;

use na::{DMatrix, DVector};

use log::{debug, info, warn};
use std::error::Error;

use crate::solver::backward_differences::{self, NUM_ROWS};
use crate::solver::coefficients::{Coefficients, MAX_ORDER, first_step_size};
use crate::solver::common::{
    check_initial_state, error_ratio, next_step_size, norm, tolerance_scale, validate_first_step,
    validate_solution_times, validate_step_size_factors, validate_tol,
};
use crate::solver::newton::{newton, newton_qr};

pub const STATUS_RUNNING: i32 = 0;
pub const STATUS_STEP_BUDGET_EXHAUSTED: i32 = -1;

/// Cumulative work counters and the trajectory status code.
///
/// Counters never decrease. `status` is 0 while running (and on success) and
/// negative on a fatal condition; fatal conditions are reported here, never
/// as errors, so partially filled results stay usable.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub num_jacobian_evaluations: u64,
    pub num_matrix_factorizations: u64,
    pub num_ode_fn_evaluations: u64,
    pub status: i32,
}

/// Warm-start record: everything needed to resume integration with the same
/// configuration. Replaced wholesale on every accepted step, order change or
/// step-size change; never partially mutated.
#[derive(Debug, Clone)]
pub struct SolverInternalState {
    /// `(MAX_ORDER + 3) x num_odes` backward-difference matrix, row 0 is the
    /// current state estimate.
    pub backward_differences: DMatrix<f64>,
    pub order: usize,
    pub step_size: f64,
}

/// Transient per-attempt state. Replaced wholesale on every step attempt;
/// the Jacobian and its factorization deliberately survive rejected attempts
/// when nothing invalidated them.
#[derive(Debug, Clone)]
pub(crate) struct Iterand {
    pub jacobian_mat: DMatrix<f64>,
    pub jacobian_is_up_to_date: bool,
    pub new_step_size: f64,
    pub num_steps: u64,
    pub num_steps_same_size: u64,
    pub should_update_jacobian: bool,
    pub should_update_step_size: bool,
    pub time: f64,
    pub unitary: DMatrix<f64>,
    pub upper: DMatrix<f64>,
}

impl Iterand {
    fn initial(time: f64, state: &SolverInternalState) -> Self {
        let num_odes = state.backward_differences.ncols();
        Iterand {
            jacobian_mat: DMatrix::zeros(num_odes, num_odes),
            jacobian_is_up_to_date: false,
            new_step_size: state.step_size,
            num_steps: 0,
            num_steps_same_size: 0,
            should_update_jacobian: true,
            should_update_step_size: false,
            time,
            unitary: DMatrix::zeros(num_odes, num_odes),
            upper: DMatrix::zeros(num_odes, num_odes),
        }
    }
}

/// Final output of a solve call.
///
/// `times` and `states` are sized to the requested output times and
/// zero-initialized; on a fatal stop the slots not yet reached keep their
/// zeros and `diagnostics.status` tells why. `solver_internal_state` can be
/// fed to [`BDF::resume`] to continue the trajectory.
#[derive(Debug, Clone)]
pub struct Results {
    pub times: DVector<f64>,
    /// One row per requested output time.
    pub states: DMatrix<f64>,
    pub diagnostics: Diagnostics,
    pub solver_internal_state: SolverInternalState,
}

/// Configuration of the BDF solver. Construct with [`BDF::new`] (the
/// defaults suit most stiff problems) and adjust fields as needed; the
/// configuration is validated when a solve starts.
#[derive(Debug, Clone)]
pub struct BDF {
    pub rtol: f64,
    pub atol: f64,
    /// Initial step size; selected automatically from the local curvature
    /// when `None`.
    pub first_step_size: Option<f64>,
    pub safety_factor: f64,
    pub min_step_size_factor: f64,
    pub max_step_size_factor: f64,
    /// Total step-attempt budget for one solve call, `None` = unbounded.
    /// With an unbounded budget the retry loop has no termination guard: a
    /// problem whose error ratio cannot be pushed below 1 will spin.
    pub max_num_steps: Option<u64>,
    pub max_order: usize,
    pub max_num_newton_iters: usize,
    pub newton_tol_factor: f64,
    pub newton_step_size_factor: f64,
    /// Base BDF coefficients (kappa), indexed by order, entry 0 unused.
    pub bdf_coefficients: [f64; MAX_ORDER + 1],
    /// Keep the cached Jacobian across accepted steps and refresh it only
    /// when the corrector fails against it, instead of re-evaluating it for
    /// every step.
    pub evaluate_jacobian_lazily: bool,
}

impl Default for BDF {
    fn default() -> Self {
        BDF {
            rtol: 1e-3,
            atol: 1e-6,
            first_step_size: None,
            safety_factor: 0.9,
            min_step_size_factor: 0.1,
            max_step_size_factor: 10.0,
            max_num_steps: None,
            max_order: MAX_ORDER,
            max_num_newton_iters: 4,
            newton_tol_factor: 0.1,
            newton_step_size_factor: 0.5,
            bdf_coefficients: [0.0, 0.1850, -1.0 / 9.0, -0.0823, -0.0415, 0.0],
            evaluate_jacobian_lazily: false,
        }
    }
}

impl BDF {
    pub fn new() -> Self {
        Default::default()
    }

    /// Integrates `dy/dt = ode_fn(t, y)` from `(initial_time, initial_state)`
    /// through every requested solution time.
    ///
    /// `solution_times` must be sorted ascending and must not precede
    /// `initial_time`. Configuration errors are returned as `Err` before any
    /// stepping happens; runtime trouble (step budget exhaustion) is reported
    /// through `Results::diagnostics.status` instead.
    pub fn solve<F, J>(
        &self,
        ode_fn: F,
        jacobian_fn: J,
        initial_time: f64,
        initial_state: &DVector<f64>,
        solution_times: &[f64],
    ) -> Result<Results, Box<dyn Error>>
    where
        F: Fn(f64, &DVector<f64>) -> DVector<f64>,
        J: Fn(f64, &DVector<f64>) -> DMatrix<f64>,
    {
        self.validate()?;
        check_initial_state(initial_state.as_slice())?;
        validate_solution_times(initial_time, solution_times)?;
        let (rtol, atol) = validate_tol(self.rtol, self.atol)?;
        let mut params = self.clone();
        params.rtol = rtol;
        params.atol = atol;

        let coefficients = Coefficients::new(&params.bdf_coefficients);
        let state =
            params.initialize_internal_state(&ode_fn, initial_time, initial_state, &coefficients)?;
        info!(
            "BDF solve: {} equations, {} output times, rtol = {:e}, atol = {:e}, first step = {:e}",
            initial_state.len(),
            solution_times.len(),
            params.rtol,
            params.atol,
            state.step_size
        );
        Ok(params.run(&ode_fn, &jacobian_fn, initial_time, state, solution_times))
    }

    /// Resumes a trajectory from the internal state returned by a previous
    /// call, warm-starting the backward-difference history, order and step
    /// size. `initial_time` must be the time at which that state was
    /// recorded (the last output time reached).
    pub fn resume<F, J>(
        &self,
        ode_fn: F,
        jacobian_fn: J,
        initial_time: f64,
        solver_internal_state: SolverInternalState,
        solution_times: &[f64],
    ) -> Result<Results, Box<dyn Error>>
    where
        F: Fn(f64, &DVector<f64>) -> DVector<f64>,
        J: Fn(f64, &DVector<f64>) -> DMatrix<f64>,
    {
        self.validate()?;
        validate_solution_times(initial_time, solution_times)?;
        let (rtol, atol) = validate_tol(self.rtol, self.atol)?;
        if solver_internal_state.backward_differences.nrows() != NUM_ROWS {
            return Err("`solver_internal_state` has a malformed backward-difference matrix.".into());
        }
        if !(1..=self.max_order).contains(&solver_internal_state.order) {
            return Err("`solver_internal_state.order` is outside 1..=max_order.".into());
        }
        if !solver_internal_state.step_size.is_finite() || solver_internal_state.step_size <= 0.0 {
            return Err("`solver_internal_state.step_size` must be positive and finite.".into());
        }
        let mut params = self.clone();
        params.rtol = rtol;
        params.atol = atol;
        info!(
            "BDF resume at t = {} with order {} and step size {:e}",
            initial_time, solver_internal_state.order, solver_internal_state.step_size
        );
        Ok(params.run(
            &ode_fn,
            &jacobian_fn,
            initial_time,
            solver_internal_state,
            solution_times,
        ))
    }

    fn run<F, J>(
        &self,
        ode_fn: &F,
        jacobian_fn: &J,
        initial_time: f64,
        state: SolverInternalState,
        solution_times: &[f64],
    ) -> Results
    where
        F: Fn(f64, &DVector<f64>) -> DVector<f64>,
        J: Fn(f64, &DVector<f64>) -> DMatrix<f64>,
    {
        let coefficients = Coefficients::new(&self.bdf_coefficients);
        let stepper = Stepper {
            params: self,
            coefficients: &coefficients,
            ode_fn,
            jacobian_fn,
        };
        let results = stepper.advance(initial_time, state, solution_times);
        info!(
            "BDF finished with status {}: {} rhs evaluations, {} jacobian evaluations, {} factorizations",
            results.diagnostics.status,
            results.diagnostics.num_ode_fn_evaluations,
            results.diagnostics.num_jacobian_evaluations,
            results.diagnostics.num_matrix_factorizations
        );
        results
    }

    /// First backward-difference history: row 0 is the initial state, row 1
    /// the first derivative scaled by the (possibly heuristic) first step
    /// size; integration starts at order 1.
    fn initialize_internal_state<F>(
        &self,
        ode_fn: &F,
        initial_time: f64,
        initial_state: &DVector<f64>,
        coefficients: &Coefficients,
    ) -> Result<SolverInternalState, Box<dyn Error>>
    where
        F: Fn(f64, &DVector<f64>) -> DVector<f64>,
    {
        let first_derivative = ode_fn(initial_time, initial_state);
        if !first_derivative.iter().all(|x| x.is_finite()) {
            return Err("the right-hand side is not finite at the initial state.".into());
        }
        let step_size = match self.first_step_size {
            Some(h) => validate_first_step(h)?,
            None => first_step_size(
                self.atol,
                coefficients.error[1],
                initial_state,
                initial_time,
                &first_derivative,
                ode_fn,
                self.rtol,
                self.safety_factor,
            ),
        };
        let mut bd = DMatrix::zeros(NUM_ROWS, initial_state.len());
        bd.row_mut(0).copy_from(&initial_state.transpose());
        bd.row_mut(1)
            .copy_from(&(step_size * &first_derivative).transpose());
        Ok(SolverInternalState {
            backward_differences: bd,
            order: 1,
            step_size,
        })
    }

    fn validate(&self) -> Result<(), Box<dyn Error>> {
        validate_step_size_factors(self.min_step_size_factor, self.max_step_size_factor)?;
        if !self.safety_factor.is_finite() || self.safety_factor <= 0.0 {
            return Err("`safety_factor` must be positive and finite.".into());
        }
        if self.max_order < 1 || self.max_order > MAX_ORDER {
            return Err("`max_order` must lie in 1..=5.".into());
        }
        if self.max_num_newton_iters == 0 {
            return Err("`max_num_newton_iters` must be at least 1.".into());
        }
        if !(self.newton_tol_factor > 0.0) {
            return Err("`newton_tol_factor` must be positive.".into());
        }
        if !(self.newton_step_size_factor > 0.0 && self.newton_step_size_factor < 1.0) {
            return Err("`newton_step_size_factor` must lie in (0, 1).".into());
        }
        for k in 1..=self.max_order {
            if self.bdf_coefficients[k] == 1.0 {
                return Err("`bdf_coefficients` entry equal to 1 makes the Newton coefficient degenerate.".into());
            }
        }
        Ok(())
    }
}

/// Order selection after an accepted step.
///
/// Examines order - 1 and order + 1 (clamped to `[1, max_order]`) left to
/// right against the updated history and adopts a neighbor only on a strict
/// improvement of its error ratio, so an order - 1 win survives a tie with
/// order + 1. The step controller relies on this left-to-right overwrite;
/// it is not a global argmin.
pub(crate) fn select_order(
    order: usize,
    max_order: usize,
    current_error_ratio: f64,
    backward_differences: &DMatrix<f64>,
    error_coefficients: &[f64; MAX_ORDER + 1],
    tol: &DVector<f64>,
) -> (usize, f64) {
    let mut new_order = order;
    let mut new_error_ratio = current_error_ratio;
    for offset in [-1i64, 1] {
        let proposed_order = (order as i64 + offset).clamp(1, max_order as i64) as usize;
        let proposed_error_ratio = error_ratio(
            &backward_differences.row(proposed_order + 1).transpose(),
            error_coefficients[proposed_order],
            tol,
        );
        if proposed_error_ratio < new_error_ratio {
            new_order = proposed_order;
            new_error_ratio = proposed_error_ratio;
        }
    }
    (new_order, new_error_ratio)
}

/// One integration run: borrows the validated configuration, the coefficient
/// tables and the user callbacks, and threads the three value records
/// (diagnostics, iterand, internal state) through the attempt/step/output
/// loops by move, never by partial mutation.
struct Stepper<'a, F, J> {
    params: &'a BDF,
    coefficients: &'a Coefficients,
    ode_fn: &'a F,
    jacobian_fn: &'a J,
}

impl<'a, F, J> Stepper<'a, F, J>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64>,
    J: Fn(f64, &DVector<f64>) -> DMatrix<f64>,
{
    /// Output driver: advances through every requested solution time in
    /// order, recording the state once the solver time reaches each target
    /// exactly. Stops recording as soon as the status turns fatal.
    fn advance(
        &self,
        initial_time: f64,
        mut state: SolverInternalState,
        solution_times: &[f64],
    ) -> Results {
        let num_times = solution_times.len();
        let num_odes = state.backward_differences.ncols();
        let mut times = DVector::zeros(num_times);
        let mut states = DMatrix::zeros(num_times, num_odes);
        let mut diagnostics = Diagnostics::default();
        let mut iterand = Iterand::initial(initial_time, &state);

        for (n, &target) in solution_times.iter().enumerate() {
            while iterand.time < target && diagnostics.status == STATUS_RUNNING {
                (diagnostics, iterand, state) = self.step(target, diagnostics, iterand, state);
            }
            if diagnostics.status != STATUS_RUNNING {
                warn!(
                    "integration stopped with status {} at t = {}, {} of {} output times reached",
                    diagnostics.status, iterand.time, n, num_times
                );
                break;
            }
            times[n] = target;
            states.row_mut(n).copy_from(&state.backward_differences.row(0));
            debug!(
                "solution recorded at t = {} (order {}, step size {:e})",
                target, state.order, state.step_size
            );
        }

        Results {
            times,
            states,
            diagnostics,
            solver_internal_state: state,
        }
    }

    /// Step driver: clamps the pending step so it cannot overshoot the
    /// target, re-evaluates the Jacobian unless lazy reuse is enabled, then
    /// retries attempts until one is accepted or the status turns fatal.
    fn step(
        &self,
        next_time: f64,
        mut diagnostics: Diagnostics,
        mut iterand: Iterand,
        mut state: SolverInternalState,
    ) -> (Diagnostics, Iterand, SolverInternalState) {
        let distance_to_next_time = next_time - iterand.time;
        if iterand.new_step_size > distance_to_next_time {
            // the final sub-step lands exactly on the requested time
            iterand.new_step_size = distance_to_next_time;
            iterand.should_update_step_size = true;
        }

        // in lazy mode the cached Jacobian is kept across steps; a refresh
        // happens only through the controller's deferred-update path, which
        // a corrector failure against the cached matrix triggers
        if !self.params.evaluate_jacobian_lazily {
            let current_state = state.backward_differences.row(0).transpose();
            iterand.jacobian_mat = (self.jacobian_fn)(iterand.time, &current_state);
            diagnostics.num_jacobian_evaluations += 1;
            iterand.jacobian_is_up_to_date = true;
            iterand.should_update_jacobian = false;
        }

        loop {
            let (accepted, d, i, s) = self.maybe_step(diagnostics, iterand, state);
            diagnostics = d;
            iterand = i;
            state = s;
            if accepted || diagnostics.status != STATUS_RUNNING {
                break;
            }
            debug!(
                "attempt rejected at t = {}, retrying with step size {:e}",
                iterand.time, iterand.new_step_size
            );
        }
        (diagnostics, iterand, state)
    }

    /// Step controller: one attempt at a step. Returns whether the attempt
    /// was accepted together with the replaced diagnostics, iterand and
    /// internal state.
    fn maybe_step(
        &self,
        mut diagnostics: Diagnostics,
        mut iterand: Iterand,
        mut state: SolverInternalState,
    ) -> (bool, Diagnostics, Iterand, SolverInternalState) {
        if let Some(max_num_steps) = self.params.max_num_steps {
            if iterand.num_steps >= max_num_steps {
                diagnostics.status = STATUS_STEP_BUDGET_EXHAUSTED;
                return (false, diagnostics, iterand, state);
            }
        }

        // a pending refresh: either the first attempt of a lazy run or a
        // previous attempt that failed against a stale Jacobian
        if iterand.should_update_jacobian {
            let current_state = state.backward_differences.row(0).transpose();
            iterand.jacobian_mat = (self.jacobian_fn)(iterand.time, &current_state);
            diagnostics.num_jacobian_evaluations += 1;
            iterand.jacobian_is_up_to_date = true;
            iterand.should_update_jacobian = false;
        }

        if iterand.should_update_step_size {
            state.backward_differences = backward_differences::interpolate(
                &state.backward_differences,
                state.order,
                iterand.new_step_size / state.step_size,
            );
            state.step_size = iterand.new_step_size;
            iterand.num_steps_same_size = 0;
            iterand.should_update_step_size = false;
        }

        let order = state.order;
        let (unitary, upper) = newton_qr(
            &iterand.jacobian_mat,
            self.coefficients.newton[order],
            state.step_size,
        );
        iterand.unitary = unitary;
        iterand.upper = upper;
        diagnostics.num_matrix_factorizations += 1;

        let current_state = state.backward_differences.row(0).transpose();
        let tol = tolerance_scale(self.params.rtol, self.params.atol, &current_state);
        let newton_tol = self.params.newton_tol_factor * norm(&tol);

        let result = newton(
            &state.backward_differences,
            self.params.max_num_newton_iters,
            self.coefficients.newton[order],
            self.ode_fn,
            order,
            state.step_size,
            iterand.time,
            newton_tol,
            &iterand.unitary,
            &iterand.upper,
        );
        iterand.num_steps += 1;
        diagnostics.num_ode_fn_evaluations += result.num_iters;

        if !result.converged {
            if iterand.jacobian_is_up_to_date {
                // the Jacobian is fresh, so the step itself is too large
                iterand.new_step_size = state.step_size * self.params.newton_step_size_factor;
                iterand.should_update_step_size = true;
            } else {
                iterand.should_update_jacobian = true;
            }
            return (false, diagnostics, iterand, state);
        }

        let mut step_error_ratio = error_ratio(
            &result.next_backward_difference,
            self.coefficients.error[order],
            &tol,
        );
        if !(step_error_ratio < 1.0) {
            iterand.new_step_size = next_step_size(
                state.step_size,
                order,
                step_error_ratio,
                self.params.safety_factor,
                self.params.min_step_size_factor,
                self.params.max_step_size_factor,
            );
            iterand.should_update_step_size = true;
            return (false, diagnostics, iterand, state);
        }

        iterand.time += state.step_size;
        state.backward_differences = backward_differences::update(
            &state.backward_differences,
            &result.next_backward_difference,
            &result.next_state_vec,
            order,
        );
        iterand.jacobian_is_up_to_date = false;
        iterand.num_steps_same_size += 1;

        // the order and step size are reconsidered only after strictly more
        // than order + 1 steps of the same size, to keep the order from
        // being throttled
        if iterand.num_steps_same_size > order as u64 + 1 {
            let (new_order, new_error_ratio) = select_order(
                order,
                self.params.max_order,
                step_error_ratio,
                &state.backward_differences,
                &self.coefficients.error,
                &tol,
            );
            state.order = new_order;
            step_error_ratio = new_error_ratio;
            iterand.new_step_size = next_step_size(
                state.step_size,
                state.order,
                step_error_ratio,
                self.params.safety_factor,
                self.params.min_step_size_factor,
                self.params.max_step_size_factor,
            );
            iterand.should_update_step_size = true;
        }

        (true, diagnostics, iterand, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn decay_ode(_t: f64, y: &DVector<f64>) -> DVector<f64> {
        -y
    }

    fn decay_jacobian(_t: f64, _y: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_element(1, 1, -1.0)
    }

    #[test]
    fn test_diagnostics_monotone_and_strictly_increasing_per_step() {
        let params = BDF::new();
        let coefficients = Coefficients::new(&params.bdf_coefficients);
        let mut state = params
            .initialize_internal_state(
                &decay_ode,
                0.0,
                &DVector::from_vec(vec![1.0]),
                &coefficients,
            )
            .unwrap();
        let stepper = Stepper {
            params: &params,
            coefficients: &coefficients,
            ode_fn: &decay_ode,
            jacobian_fn: &decay_jacobian,
        };

        let mut diagnostics = Diagnostics::default();
        let mut iterand = Iterand::initial(0.0, &state);
        let mut previous = diagnostics.clone();
        for _ in 0..5 {
            (diagnostics, iterand, state) = stepper.step(1e9, diagnostics, iterand, state);
            assert!(diagnostics.num_ode_fn_evaluations > previous.num_ode_fn_evaluations);
            assert!(diagnostics.num_matrix_factorizations > previous.num_matrix_factorizations);
            assert!(diagnostics.num_jacobian_evaluations >= previous.num_jacobian_evaluations);
            assert_eq!(diagnostics.status, STATUS_RUNNING);
            previous = diagnostics.clone();
        }
        assert!(diagnostics.num_jacobian_evaluations >= 1);
        assert!(iterand.time > 0.0);
        assert!(state.step_size > 0.0);
    }

    #[test]
    fn test_step_budget_turns_status_fatal_without_work() {
        let mut params = BDF::new();
        params.max_num_steps = Some(0);
        let coefficients = Coefficients::new(&params.bdf_coefficients);
        let state = params
            .initialize_internal_state(
                &decay_ode,
                0.0,
                &DVector::from_vec(vec![1.0]),
                &coefficients,
            )
            .unwrap();
        let stepper = Stepper {
            params: &params,
            coefficients: &coefficients,
            ode_fn: &decay_ode,
            jacobian_fn: &decay_jacobian,
        };
        let diagnostics = Diagnostics::default();
        let iterand = Iterand::initial(0.0, &state);
        let (accepted, diagnostics, iterand, _state) =
            stepper.maybe_step(diagnostics, iterand, state);
        assert!(!accepted);
        assert_eq!(diagnostics.status, STATUS_STEP_BUDGET_EXHAUSTED);
        // the fatal check happens before any numeric work
        assert_eq!(diagnostics.num_matrix_factorizations, 0);
        assert_eq!(diagnostics.num_ode_fn_evaluations, 0);
        assert_eq!(iterand.num_steps, 0);
    }

    #[test]
    fn test_stale_jacobian_failure_schedules_refresh_in_lazy_mode() {
        // lazy mode with a stale (zero) cached Jacobian on y' = -1000y:
        // the corrector diverges, so the controller must ask for a refresh
        // instead of shrinking the step, and the retried attempt must
        // evaluate the Jacobian and succeed
        let mut params = BDF::new();
        params.evaluate_jacobian_lazily = true;
        params.rtol = 0.5;
        params.atol = 1.0;
        let ode_fn = |_t: f64, y: &DVector<f64>| -1000.0 * y;
        let jacobian_fn = |_t: f64, _y: &DVector<f64>| DMatrix::from_element(1, 1, -1000.0);
        let coefficients = Coefficients::new(&params.bdf_coefficients);

        let h = 1e-3;
        let mut bd = DMatrix::zeros(NUM_ROWS, 1);
        bd[(0, 0)] = 1.0;
        bd[(1, 0)] = -1000.0 * h;
        let state = SolverInternalState {
            backward_differences: bd,
            order: 1,
            step_size: h,
        };
        let stepper = Stepper {
            params: &params,
            coefficients: &coefficients,
            ode_fn: &ode_fn,
            jacobian_fn: &jacobian_fn,
        };

        let mut iterand = Iterand::initial(0.0, &state);
        // the zero matrix in the fresh iterand stands in for a Jacobian
        // cached many steps ago
        iterand.should_update_jacobian = false;
        let diagnostics = Diagnostics::default();

        let (accepted, diagnostics, iterand, state) =
            stepper.maybe_step(diagnostics, iterand, state);
        assert!(!accepted);
        assert!(iterand.should_update_jacobian);
        assert!(!iterand.should_update_step_size);
        assert_eq!(diagnostics.num_jacobian_evaluations, 0);

        let (accepted, diagnostics, iterand, _state) =
            stepper.maybe_step(diagnostics, iterand, state);
        assert!(accepted);
        assert_eq!(diagnostics.num_jacobian_evaluations, 1);
        assert!(!iterand.should_update_jacobian);
    }

    #[test]
    fn test_select_order_tie_prefers_lower_neighbor() {
        // rows 3 (order 2 candidate) and 5 (order 4 candidate) tie below the
        // current ratio: the earlier order - 1 candidate must win
        let mut bd = DMatrix::zeros(NUM_ROWS, 1);
        bd[(3, 0)] = 0.3;
        bd[(5, 0)] = 0.3;
        let error_coefficients = [f64::NAN, 1.0, 1.0, 1.0, 1.0, 1.0];
        let tol = DVector::from_element(1, 1.0);
        let (order, ratio) = select_order(3, 5, 0.5, &bd, &error_coefficients, &tol);
        assert_eq!(order, 2);
        assert_relative_eq!(ratio, 0.3, epsilon = 1e-14);
    }

    #[test]
    fn test_select_order_strictly_lower_higher_neighbor_wins() {
        let mut bd = DMatrix::zeros(NUM_ROWS, 1);
        bd[(3, 0)] = 0.3;
        bd[(5, 0)] = 0.2;
        let error_coefficients = [f64::NAN, 1.0, 1.0, 1.0, 1.0, 1.0];
        let tol = DVector::from_element(1, 1.0);
        let (order, ratio) = select_order(3, 5, 0.5, &bd, &error_coefficients, &tol);
        assert_eq!(order, 4);
        assert_relative_eq!(ratio, 0.2, epsilon = 1e-14);
    }

    #[test]
    fn test_select_order_keeps_current_when_neighbors_are_worse() {
        let mut bd = DMatrix::zeros(NUM_ROWS, 1);
        bd[(3, 0)] = 2.0;
        bd[(5, 0)] = 3.0;
        let error_coefficients = [f64::NAN, 1.0, 1.0, 1.0, 1.0, 1.0];
        let tol = DVector::from_element(1, 1.0);
        let (order, ratio) = select_order(3, 5, 0.5, &bd, &error_coefficients, &tol);
        assert_eq!(order, 3);
        assert_relative_eq!(ratio, 0.5, epsilon = 1e-14);
    }

    #[test]
    fn test_select_order_respects_max_order_bound() {
        // at order = max_order the +1 candidate clamps back to max_order
        let mut bd = DMatrix::zeros(NUM_ROWS, 1);
        bd[(3, 0)] = 10.0;
        let error_coefficients = [f64::NAN, 1.0, 1.0, 1.0, 1.0, 1.0];
        let tol = DVector::from_element(1, 1.0);
        let (order, _) = select_order(2, 2, 0.5, &bd, &error_coefficients, &tol);
        assert!(order >= 1 && order <= 2);
    }

    #[test]
    fn test_validate_rejects_degenerate_configuration() {
        let mut params = BDF::new();
        params.bdf_coefficients[2] = 1.0;
        assert!(params.validate().is_err());

        let mut params = BDF::new();
        params.max_order = 6;
        assert!(params.validate().is_err());

        let mut params = BDF::new();
        params.min_step_size_factor = 1.5;
        assert!(params.validate().is_err());

        assert!(BDF::new().validate().is_ok());
    }
}
