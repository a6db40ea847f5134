//! Low-level device abstraction the Krylov engine is written against.
//!
//! A device owns its execution context (a wgpu device and queue, or nothing
//! for the host fallback) and knows how to allocate vectors, matrices and ILU
//! factor storage and run the handful of kernels BiCGStab needs. Values cross
//! the boundary as f64; a device may store them at lower precision.

use crate::convert::{BlockOrder, HostStaging};
use crate::error::Result;
use crate::sparse::MatrixDims;

use super::preconditioner::BlockIlu0;

/// Work counters reported by devices that track them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub dispatches: u32,
    pub readbacks: u32,
}

pub trait KrylovDevice: Sized + Send {
    type Buffer: Send;
    type Matrix: Send;
    type Factors: Send;

    /// Backend name used in logs and by the backend selector.
    const NAME: &'static str;
    /// Element order inside blocks this device consumes.
    const BLOCK_ORDER: BlockOrder;

    /// Acquire the device context.
    fn open() -> Result<Self>;

    /// Drain outstanding work and release the context.
    fn release(self) -> Result<()>;

    /// Create a new zero-initialized vector of `n` scalars.
    fn new_buffer(&self, n: usize) -> Result<Self::Buffer>;

    fn alloc_matrix(&self, dims: MatrixDims) -> Result<Self::Matrix>;

    /// Upload structure and values from staging already in `BLOCK_ORDER`.
    fn write_matrix(&self, matrix: &mut Self::Matrix, staging: &HostStaging);

    /// Allocate factor storage and structural data (level schedules) for the
    /// sparsity pattern analyzed in `ilu`.
    fn alloc_factors(&self, ilu: &BlockIlu0) -> Result<Self::Factors>;

    /// Upload freshly computed factor values.
    fn write_factors(&self, factors: &mut Self::Factors, ilu: &BlockIlu0);

    /// output = (LU)⁻¹ input
    fn apply_preconditioner(
        &self,
        factors: &Self::Factors,
        input: &Self::Buffer,
        output: &Self::Buffer,
    );

    /// y = A * x
    fn spmv(&self, a: &Self::Matrix, x: &Self::Buffer, y: &Self::Buffer);

    /// Dot product, accumulated in f64.
    fn dot(&self, x: &Self::Buffer, y: &Self::Buffer) -> Result<f64>;

    /// y = alpha * x + y
    fn axpy(&self, alpha: f64, x: &Self::Buffer, y: &Self::Buffer);

    /// dst = src
    fn copy(&self, src: &Self::Buffer, dst: &Self::Buffer);

    /// x = alpha * x
    fn scale(&self, alpha: f64, x: &Self::Buffer);

    fn fill_zero(&self, x: &Self::Buffer);

    fn upload_vec(&self, data: &[f64], buffer: &Self::Buffer);

    fn download_vec(&self, buffer: &Self::Buffer, out: &mut [f64]) -> Result<()>;

    fn counters(&self) -> DeviceCounters {
        DeviceCounters::default()
    }
}
