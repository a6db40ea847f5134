//! Linear system solvers.

pub mod backend;
pub mod bicgstab;
pub mod bridge;
pub mod cpu;
pub mod device;
pub mod gpu;
pub mod gpu_shaders;
pub mod preconditioner;
pub mod session;
pub mod wells;

pub use backend::{create_backend, BackendKind, SolverBackend};
pub use bridge::{BridgeSolver, CpuBackend, WgpuBackend};
pub use session::SessionState;
pub use wells::WellContributions;

use crate::error::{BridgeError, Result};

/// Parameters read once when a backend is constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    /// 0 = quiet, 1 = per-solve summary, 2 = per-iteration residuals,
    /// 3 = phase timings.
    pub verbosity: u32,
    pub max_iterations: usize,
    /// Relative residual reduction that counts as converged.
    pub tolerance: f64,
    pub absolute_tolerance: f64,
    /// Relative residual growth at which the iteration is abandoned.
    pub divergence_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            max_iterations: 200,
            tolerance: 1e-2,
            absolute_tolerance: 1e-15,
            divergence_tolerance: 1e3,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(BridgeError::Config("max_iterations must be positive".into()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(BridgeError::Config(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        if !(self.absolute_tolerance.is_finite() && self.absolute_tolerance >= 0.0) {
            return Err(BridgeError::Config(format!(
                "absolute_tolerance must be non-negative, got {}",
                self.absolute_tolerance
            )));
        }
        if !(self.divergence_tolerance > 1.0) {
            return Err(BridgeError::Config(format!(
                "divergence_tolerance must exceed 1, got {}",
                self.divergence_tolerance
            )));
        }
        Ok(())
    }
}

/// Why the Krylov iteration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// `||r|| / ||b|| <= tolerance`.
    RelativeTolerance,
    /// `||r|| <= absolute_tolerance` before the relative criterion was met.
    AbsoluteTolerance,
    /// `||r|| / ||b|| >= divergence_tolerance`.
    Diverged,
    MaxIterations,
    /// Non-finite residual, BiCGStab breakdown, or a singular ILU pivot.
    NumericalFault,
}

impl SolveStatus {
    /// Only relative-tolerance termination is reported as converged.
    pub fn is_converged(self) -> bool {
        self == SolveStatus::RelativeTolerance
    }
}

/// Diagnostics of one linear solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverResult {
    pub converged: bool,
    pub iterations: usize,
    /// Wall time of the Krylov iteration in seconds.
    pub elapsed: f64,
    /// Final over initial residual norm.
    pub reduction: f64,
    /// `reduction^(1/iterations)`, 1.0 when no iteration ran.
    pub conv_rate: f64,
    pub status: SolveStatus,
}

impl SolverResult {
    pub fn new(
        status: SolveStatus,
        iterations: usize,
        elapsed: f64,
        initial_norm: f64,
        final_norm: f64,
    ) -> Self {
        let reduction = if initial_norm > 0.0 {
            final_norm / initial_norm
        } else {
            0.0
        };
        let conv_rate = if iterations == 0 {
            1.0
        } else {
            reduction.powf(1.0 / iterations as f64)
        };
        Self {
            converged: status.is_converged(),
            iterations,
            elapsed,
            reduction,
            conv_rate,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn default_config_is_valid() {
        SolverConfig::default().validate().unwrap();
    }

    #[test]
    fn config_rejects_bad_values() {
        let bad = [
            SolverConfig { max_iterations: 0, ..Default::default() },
            SolverConfig { tolerance: 0.0, ..Default::default() },
            SolverConfig { tolerance: f64::NAN, ..Default::default() },
            SolverConfig { absolute_tolerance: -1.0, ..Default::default() },
            SolverConfig { divergence_tolerance: 0.5, ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(BridgeError::Config(_))), "{cfg:?}");
        }
    }

    #[test]
    fn result_rate_and_reduction() {
        let res = SolverResult::new(SolveStatus::RelativeTolerance, 4, 0.5, 2.0, 2e-4);
        assert!(res.converged);
        assert_abs_diff_eq!(res.reduction, 1e-4, epsilon = 1e-18);
        assert_abs_diff_eq!(res.conv_rate, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn result_zero_iterations_rate_is_one() {
        let res = SolverResult::new(SolveStatus::NumericalFault, 0, 0.0, 3.0, 3.0);
        assert!(!res.converged);
        assert_eq!(res.conv_rate, 1.0);
        assert_eq!(res.reduction, 1.0);
    }

    #[test]
    fn only_relative_tolerance_counts_as_converged() {
        assert!(SolveStatus::RelativeTolerance.is_converged());
        assert!(!SolveStatus::AbsoluteTolerance.is_converged());
        assert!(!SolveStatus::Diverged.is_converged());
        assert!(!SolveStatus::MaxIterations.is_converged());
        assert!(!SolveStatus::NumericalFault.is_converged());
    }
}
