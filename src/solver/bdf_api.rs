//! Convenience front-end over the core solver: owns the problem callbacks,
//! runs the integration, keeps a scipy-style status string and offers result
//! export. For batch workloads [`solve_batch`] fans independent initial
//! states out over a rayon thread pool.

use crate::solver::bdf::{BDF, Results, STATUS_RUNNING, SolverInternalState};
extern crate nalgebra as na;
use na::{DMatrix, DVector};

use csv::Writer;
use log::info;
use rayon::prelude::*;
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode};
use std::error::Error;
use std::time::Instant;

pub type OdeFunction = Box<dyn Fn(f64, &DVector<f64>) -> DVector<f64> + Send + Sync>;
pub type JacobianFunction = Box<dyn Fn(f64, &DVector<f64>) -> DMatrix<f64> + Send + Sync>;

/// Owns one initial value problem and its solver configuration.
///
/// `status` follows the scipy convention: "created" before [`ODEsolver::solve`]
/// is called, then "finished" or "failed"; on failure `message` says why and
/// the results hold the portion of the trajectory that was completed.
pub struct ODEsolver {
    ode_fn: OdeFunction,
    jacobian_fn: JacobianFunction,
    /// Component names, used as column titles by [`ODEsolver::save_result`].
    values: Vec<String>,
    arg: String,
    t0: f64,
    y0: DVector<f64>,
    solution_times: Vec<f64>,

    pub solver_instance: BDF,
    /// "debug"/"info"/"warn"/"error" to log to the terminal, "off" or `None`
    /// to keep quiet.
    pub loglevel: Option<String>,
    status: String,
    message: Option<String>,

    t_result: DVector<f64>,
    y_result: DMatrix<f64>,
    internal_state: Option<SolverInternalState>,
}

impl ODEsolver {
    pub fn new(
        ode_fn: OdeFunction,
        jacobian_fn: JacobianFunction,
        values: Vec<String>,
        arg: String,
        t0: f64,
        y0: DVector<f64>,
        solution_times: Vec<f64>,
    ) -> Self {
        ODEsolver {
            ode_fn,
            jacobian_fn,
            values,
            arg,
            t0,
            y0,
            solution_times,
            solver_instance: BDF::new(),
            loglevel: Some("info".to_string()),
            status: "created".to_string(),
            message: None,
            t_result: DVector::zeros(1),
            y_result: DMatrix::zeros(1, 1),
            internal_state: None,
        }
    }

    /// Replaces the default solver configuration before solving.
    pub fn set_solver_params(&mut self, params: BDF) {
        self.solver_instance = params;
    }

    /// Installs a terminal logger at the configured level. Returns quietly
    /// when the level is "off"/`None` or when a logger is already installed,
    /// so repeated solver runs in one process stay safe.
    fn init_logger(&self) {
        let level = match self.loglevel.as_deref() {
            None | Some("off") | Some("none") => return,
            Some("debug") => LevelFilter::Debug,
            Some("warn") => LevelFilter::Warn,
            Some("error") => LevelFilter::Error,
            _ => LevelFilter::Info,
        };
        let _ = CombinedLogger::init(vec![TermLogger::new(
            level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )]);
    }

    /// Runs the integration through every requested solution time.
    ///
    /// Configuration errors are returned as `Err`; a runtime stop (step
    /// budget exhausted) leaves `Ok` with `status() == "failed"` and the
    /// partial results available through [`ODEsolver::get_result`].
    pub fn solve(&mut self) -> Result<(), Box<dyn Error>> {
        self.init_logger();
        let start = Instant::now();
        let results = self.solver_instance.solve(
            &self.ode_fn,
            &self.jacobian_fn,
            self.t0,
            &self.y0,
            &self.solution_times,
        )?;
        let duration = start.elapsed();
        info!(
            "integration of {} took {} milliseconds",
            self.arg,
            duration.as_millis()
        );
        self.absorb(results);
        Ok(())
    }

    /// Continues the trajectory from where the last solve left off, through
    /// a further batch of solution times.
    pub fn resume(&mut self, solution_times: Vec<f64>) -> Result<(), Box<dyn Error>> {
        let state = self
            .internal_state
            .take()
            .ok_or("nothing to resume: call solve() first.")?;
        let initial_time = if self.t_result.len() > 0 {
            self.t_result[self.t_result.len() - 1]
        } else {
            self.t0
        };
        let results = self.solver_instance.resume(
            &self.ode_fn,
            &self.jacobian_fn,
            initial_time,
            state,
            &solution_times,
        )?;
        self.solution_times = solution_times;
        self.absorb(results);
        Ok(())
    }

    fn absorb(&mut self, results: Results) {
        if results.diagnostics.status == STATUS_RUNNING {
            self.status = "finished".to_string();
            self.message = None;
        } else {
            self.status = "failed".to_string();
            self.message = Some(format!(
                "integration stopped with status {}",
                results.diagnostics.status
            ));
        }
        self.t_result = results.times;
        self.y_result = results.states;
        self.internal_state = Some(results.solver_internal_state);
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn get_result(&self) -> (DVector<f64>, DMatrix<f64>) {
        (self.t_result.clone(), self.y_result.clone())
    }

    /// Writes the trajectory as CSV: a header of the argument name and the
    /// component names, then one row per solution time.
    pub fn save_result(&self, path: &str) -> Result<(), Box<dyn Error>> {
        let mut wtr = Writer::from_path(path)?;

        let mut header = vec![self.arg.clone()];
        header.extend(self.values.iter().cloned());
        wtr.write_record(&header)?;

        for (i, t) in self.t_result.iter().enumerate() {
            let mut record = vec![t.to_string()];
            record.extend(self.y_result.row(i).iter().map(|&x| x.to_string()));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        info!("result saved to {}", path);
        Ok(())
    }
}

/// Solves the same ODE system from many initial states in parallel.
///
/// Each initial state gets an independent trajectory with its own
/// diagnostics; the results come back in input order. The first
/// configuration error aborts the whole batch.
pub fn solve_batch<F, J>(
    params: &BDF,
    ode_fn: &F,
    jacobian_fn: &J,
    initial_time: f64,
    initial_states: &[DVector<f64>],
    solution_times: &[f64],
) -> Result<Vec<Results>, Box<dyn Error>>
where
    F: Fn(f64, &DVector<f64>) -> DVector<f64> + Sync,
    J: Fn(f64, &DVector<f64>) -> DMatrix<f64> + Sync,
{
    let results: Result<Vec<Results>, String> = initial_states
        .par_iter()
        .map(|y0| {
            params
                .solve(ode_fn, jacobian_fn, initial_time, y0, solution_times)
                .map_err(|e| e.to_string())
        })
        .collect();
    results.map_err(|e| e.into())
}
