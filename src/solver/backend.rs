//! Backend abstraction seen by the simulator.
//!
//! Callers hold a `Box<dyn SolverBackend>` chosen once at configuration time
//! and never name a concrete device type.

use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, Result};
use crate::sparse::{BlockedMatrix, MatrixDims};
use crate::stats::PhaseTimings;

use super::bridge::BridgeSolver;
use super::cpu::CpuDevice;
use super::device::{DeviceCounters, KrylovDevice};
use super::gpu::WgpuDevice;
use super::session::SessionState;
use super::wells::WellContributions;
use super::{SolverConfig, SolverResult};

/// Contract shared by every linear solver backend.
pub trait SolverBackend: Send {
    fn name(&self) -> &'static str;

    fn state(&self) -> SessionState;

    /// Allocate host staging and device storage for `dims`. Same dimensions
    /// reuse the existing buffers; different ones reallocate.
    fn initialize(&mut self, dims: MatrixDims) -> Result<SessionState>;

    /// Solve `matrix * x = rhs`, with optional well terms folded in first.
    /// `x` is overwritten with the solution.
    fn solve(
        &mut self,
        matrix: &BlockedMatrix,
        rhs: &[f64],
        wells: Option<&WellContributions>,
        x: &mut [f64],
    ) -> Result<SolverResult>;

    /// Like `solve`, but returns a freshly allocated solution vector.
    fn solve_owned(
        &mut self,
        matrix: &BlockedMatrix,
        rhs: &[f64],
        wells: Option<&WellContributions>,
    ) -> Result<(Vec<f64>, SolverResult)> {
        let mut x = vec![0.0; matrix.n()];
        let result = self.solve(matrix, rhs, wells, &mut x)?;
        Ok((x, result))
    }

    /// Release the device context and all buffers. Idempotent.
    fn dispose(&mut self);

    fn counters(&self) -> DeviceCounters {
        DeviceCounters::default()
    }

    fn last_timings(&self) -> PhaseTimings {
        PhaseTimings::default()
    }
}

impl<D: KrylovDevice> SolverBackend for BridgeSolver<D> {
    fn name(&self) -> &'static str {
        D::NAME
    }

    fn state(&self) -> SessionState {
        BridgeSolver::state(self)
    }

    fn initialize(&mut self, dims: MatrixDims) -> Result<SessionState> {
        BridgeSolver::initialize(self, dims)
    }

    fn solve(
        &mut self,
        matrix: &BlockedMatrix,
        rhs: &[f64],
        wells: Option<&WellContributions>,
        x: &mut [f64],
    ) -> Result<SolverResult> {
        BridgeSolver::solve(self, matrix, rhs, wells, x)
    }

    fn dispose(&mut self) {
        BridgeSolver::dispose(self)
    }

    fn counters(&self) -> DeviceCounters {
        BridgeSolver::counters(self)
    }

    fn last_timings(&self) -> PhaseTimings {
        BridgeSolver::last_timings(self)
    }
}

/// Backends this build can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cpu,
    Wgpu,
}

/// Vendor accelerator libraries the simulator may ask for by name.
const VENDOR_BACKENDS: [&str; 5] = ["cusparse", "rocsparse", "rocalution", "opencl", "amgcl"];

impl FromStr for BackendKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "cpu" => Ok(BackendKind::Cpu),
            "wgpu" | "gpu" => Ok(BackendKind::Wgpu),
            vendor if VENDOR_BACKENDS.contains(&vendor) => Err(BridgeError::Config(format!(
                "backend '{vendor}' is not available in this build (use cpu or wgpu)"
            ))),
            _ => Err(BridgeError::Config(format!("unknown backend '{s}'"))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => f.write_str(CpuDevice::NAME),
            BackendKind::Wgpu => f.write_str(WgpuDevice::NAME),
        }
    }
}

/// Construct the backend selected at configuration time. Fails here, not at
/// the first solve, when the configuration is invalid or the device is
/// unavailable.
pub fn create_backend(kind: BackendKind, config: SolverConfig) -> Result<Box<dyn SolverBackend>> {
    Ok(match kind {
        BackendKind::Cpu => Box::new(BridgeSolver::<CpuDevice>::new(config)?),
        BackendKind::Wgpu => Box::new(BridgeSolver::<WgpuDevice>::new(config)?),
    })
}
