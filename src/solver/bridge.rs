//! Solve driver shared by every backend.
//!
//! `BridgeSolver` owns a `DeviceSession` and runs one linear solve through
//! the fixed pipeline: validate, fold in wells, convert, upload, factor,
//! iterate, download. Numerical failures end up in the returned
//! `SolverResult`; only structural and device problems are errors.

use std::time::Instant;

use tracing::{debug, info, info_span};

use crate::convert::convert_matrix;
use crate::error::{BridgeError, Result};
use crate::sparse::{BlockedMatrix, MatrixDims};
use crate::stats::PhaseTimings;

use super::bicgstab::bicgstab;
use super::cpu::CpuDevice;
use super::device::{DeviceCounters, KrylovDevice};
use super::gpu::WgpuDevice;
use super::preconditioner::BlockIlu0;
use super::session::{DeviceSession, SessionState};
use super::wells::WellContributions;
use super::{SolveStatus, SolverConfig, SolverResult};

pub type CpuBackend = BridgeSolver<CpuDevice>;
pub type WgpuBackend = BridgeSolver<WgpuDevice>;

pub struct BridgeSolver<D: KrylovDevice> {
    config: SolverConfig,
    session: DeviceSession<D>,
    last_timings: PhaseTimings,
}

impl<D: KrylovDevice> BridgeSolver<D> {
    /// Validate `config` and acquire the device.
    pub fn new(config: SolverConfig) -> Result<Self> {
        config.validate()?;
        let session = DeviceSession::open()?;
        Ok(Self {
            config,
            session,
            last_timings: PhaseTimings::default(),
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn counters(&self) -> DeviceCounters {
        self.session.counters()
    }

    /// Phase timings of the most recent solve.
    pub fn last_timings(&self) -> PhaseTimings {
        self.last_timings
    }

    pub fn initialize(&mut self, dims: MatrixDims) -> Result<SessionState> {
        if self.session.initialize(dims)? {
            info!(
                backend = D::NAME,
                nb = dims.nb,
                nnzb = dims.nnzb,
                block_size = dims.block_size,
                max_iterations = self.config.max_iterations,
                tolerance = self.config.tolerance,
                "initialized linear solver"
            );
        }
        Ok(self.session.state())
    }

    pub fn dispose(&mut self) {
        self.session.dispose();
    }

    /// Solve `matrix * x = rhs (+ wells)`, overwriting `x`.
    pub fn solve(
        &mut self,
        matrix: &BlockedMatrix,
        rhs: &[f64],
        wells: Option<&WellContributions>,
        x: &mut [f64],
    ) -> Result<SolverResult> {
        let span = info_span!(
            "linear_solve",
            backend = D::NAME,
            nb = matrix.nb,
            block_size = matrix.block_size
        );
        let _enter = span.enter();

        debug!("converting");
        let convert_start = Instant::now();
        matrix.validate()?;
        let n = matrix.n();
        if rhs.len() != n || x.len() != n {
            return Err(BridgeError::Structural(format!(
                "system has {n} rows but rhs has {} and x has {}",
                rhs.len(),
                x.len()
            )));
        }
        if n == 0 {
            self.last_timings = PhaseTimings::default();
            return Ok(SolverResult::new(SolveStatus::RelativeTolerance, 0, 0.0, 0.0, 0.0));
        }

        self.initialize(matrix.dims())?;
        let mut timings = PhaseTimings::default();
        let (device, res) = self.session.parts()?;

        res.system_values.copy_from_slice(&matrix.values);
        res.rhs_host.copy_from_slice(rhs);
        if let Some(wells) = wells {
            wells.apply(matrix, &mut res.system_values, &mut res.rhs_host)?;
        }
        convert_matrix(matrix, &res.system_values, &mut res.staging)?;
        timings.convert = convert_start.elapsed();

        let upload_start = Instant::now();
        device.write_matrix(&mut res.matrix, &res.staging);
        device.upload_vec(&res.rhs_host, &res.rhs);
        device.fill_zero(&res.x);
        timings.upload = upload_start.elapsed();

        let precond_start = Instant::now();
        let (ilu, factors) = match res.precond.take() {
            Some((ilu, factors)) if ilu.matches_structure(matrix) => (ilu, factors),
            _ => {
                let ilu = BlockIlu0::analyze(matrix);
                debug!(
                    lower_levels = ilu.lower_levels.count(),
                    upper_levels = ilu.upper_levels.count(),
                    "analyzed ILU(0) sparsity pattern"
                );
                let factors = device.alloc_factors(&ilu)?;
                (ilu, factors)
            }
        };
        let (ilu, factors) = res.precond.insert((ilu, factors));
        if let Err(pivot) = ilu.factorize(&res.system_values) {
            timings.preconditioner = precond_start.elapsed();
            self.last_timings = timings;
            debug!("{pivot}");
            x.fill(0.0);
            let norm0 = res.rhs_host.iter().map(|v| v * v).sum::<f64>().sqrt();
            let result = SolverResult::new(SolveStatus::NumericalFault, 0, 0.0, norm0, norm0);
            log_summary::<D>(&self.config, &result);
            return Ok(result);
        }
        device.write_factors(factors, ilu);
        let factors: &D::Factors = factors;
        timings.preconditioner = precond_start.elapsed();

        debug!("solving");
        let krylov_start = Instant::now();
        let outcome = bicgstab(
            device,
            &res.matrix,
            &res.rhs,
            &res.x,
            |dev, input, output| dev.apply_preconditioner(factors, input, output),
            &res.workspace,
            &self.config,
        )?;
        timings.krylov = krylov_start.elapsed();

        let download_start = Instant::now();
        device.download_vec(&res.x, x)?;
        timings.download = download_start.elapsed();
        debug!(status = ?outcome.status, "done");

        let result = SolverResult::new(
            outcome.status,
            outcome.iterations,
            timings.krylov.as_secs_f64(),
            outcome.initial_norm,
            outcome.final_norm,
        );
        log_summary::<D>(&self.config, &result);
        if self.config.verbosity >= 3 {
            info!(
                convert = timings.convert.as_secs_f64(),
                upload = timings.upload.as_secs_f64(),
                preconditioner = timings.preconditioner.as_secs_f64(),
                krylov = timings.krylov.as_secs_f64(),
                download = timings.download.as_secs_f64(),
                "phase timings (s)"
            );
        }
        self.last_timings = timings;
        Ok(result)
    }
}

fn log_summary<D: KrylovDevice>(config: &SolverConfig, result: &SolverResult) {
    if config.verbosity < 1 {
        return;
    }
    info!(
        converged = result.converged,
        status = ?result.status,
        iterations = result.iterations,
        reduction = result.reduction,
        conv_rate = result.conv_rate,
        elapsed = result.elapsed,
        time_per_iteration = result.elapsed / result.iterations.max(1) as f64,
        "{} solver finished",
        D::NAME
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = SolverConfig {
            tolerance: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            CpuBackend::new(config),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_rhs_length_mismatch() {
        let mut solver = CpuBackend::new(SolverConfig::default()).unwrap();
        let m = BlockedMatrix::from_scalar_triplets(2, &[(0, 0, 1.0), (1, 1, 1.0)]).unwrap();
        let mut x = vec![0.0; 2];
        let err = solver.solve(&m, &[1.0], None, &mut x).unwrap_err();
        assert!(matches!(err, BridgeError::Structural(_)));
        // Rejected before any allocation.
        assert_eq!(solver.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_empty_system() {
        let mut solver = CpuBackend::new(SolverConfig::default()).unwrap();
        let m = BlockedMatrix::new(0, 3);
        let result = solver.solve(&m, &[], None, &mut []).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_singular_pivot_reports_fault_and_zero_solution() {
        let mut solver = CpuBackend::new(SolverConfig::default()).unwrap();
        let m = BlockedMatrix::from_scalar_triplets(2, &[(0, 1, 1.0), (1, 0, 1.0)]).unwrap();
        let mut x = vec![7.0; 2];
        let result = solver.solve(&m, &[1.0, 2.0], None, &mut x).unwrap();
        assert_eq!(result.status, SolveStatus::NumericalFault);
        assert!(!result.converged);
        assert_eq!(result.iterations, 0);
        assert_abs_diff_eq!(result.reduction, 1.0, epsilon = 1e-15);
        assert_eq!(x, vec![0.0, 0.0]);
    }

    #[test]
    fn test_preconditioner_structure_reused() {
        let mut solver = CpuBackend::new(SolverConfig::default()).unwrap();
        let mut m = BlockedMatrix::from_scalar_triplets(
            2,
            &[(0, 0, 2.0), (0, 1, -1.0), (1, 0, -1.0), (1, 1, 2.0)],
        )
        .unwrap();
        let mut x = vec![0.0; 2];
        solver.solve(&m, &[1.0, 1.0], None, &mut x).unwrap();
        m.values[0] = 4.0;
        solver.solve(&m, &[3.0, 1.0], None, &mut x).unwrap();
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-12);
    }
}
