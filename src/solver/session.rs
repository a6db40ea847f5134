//! Device context and buffer ownership for one solver instance.
//!
//! The session holds the device and every buffer sized to the current matrix.
//! Buffers are reused while `(nb, block_size, nnzb)` is unchanged and
//! reallocated when it changes. Disposal drops buffers before the device is
//! released and happens exactly once, either explicitly or on `Drop`.

use tracing::{debug, info, warn};

use crate::convert::{alloc_zeroed, HostStaging};
use crate::error::{BridgeError, Result};
use crate::sparse::MatrixDims;

use super::bicgstab::KrylovWorkspace;
use super::device::{DeviceCounters, KrylovDevice};
use super::preconditioner::BlockIlu0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Disposed,
}

/// Everything allocated for one set of matrix dimensions.
pub(crate) struct Resources<D: KrylovDevice> {
    pub dims: MatrixDims,
    pub staging: HostStaging,
    /// Row-major matrix values with well terms folded in.
    pub system_values: Vec<f64>,
    pub rhs_host: Vec<f64>,
    pub matrix: D::Matrix,
    pub rhs: D::Buffer,
    pub x: D::Buffer,
    pub workspace: KrylovWorkspace<D>,
    /// ILU(0) analysis and device factor storage, kept while the sparsity
    /// pattern is unchanged.
    pub precond: Option<(BlockIlu0, D::Factors)>,
}

pub struct DeviceSession<D: KrylovDevice> {
    device: Option<D>,
    resources: Option<Resources<D>>,
    state: SessionState,
}

impl<D: KrylovDevice> DeviceSession<D> {
    /// Acquire the device context. Fails when the backend is unavailable.
    pub fn open() -> Result<Self> {
        let device = D::open()?;
        debug!(backend = D::NAME, "device context acquired");
        Ok(Self {
            device: Some(device),
            resources: None,
            state: SessionState::Uninitialized,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn dims(&self) -> Option<MatrixDims> {
        self.resources.as_ref().map(|r| r.dims)
    }

    /// Size the session for `dims`, reopening the device after a dispose.
    /// Returns true when buffers were (re)allocated.
    pub fn initialize(&mut self, dims: MatrixDims) -> Result<bool> {
        if self.dims() == Some(dims) {
            return Ok(false);
        }
        let device = match self.device.take() {
            Some(device) => device,
            None => {
                debug!(backend = D::NAME, "reopening device context");
                D::open()?
            }
        };
        let device = self.device.insert(device);

        if let Some(old) = self.resources.take() {
            debug!(old = ?old.dims, new = ?dims, "matrix dimensions changed, reallocating");
        }
        self.state = SessionState::Uninitialized;

        let n = dims.n();
        self.resources = Some(Resources {
            dims,
            staging: HostStaging::allocate(dims, D::BLOCK_ORDER)?,
            system_values: alloc_zeroed(dims.nnz())?,
            rhs_host: alloc_zeroed(n)?,
            matrix: device.alloc_matrix(dims)?,
            rhs: device.new_buffer(n)?,
            x: device.new_buffer(n)?,
            workspace: KrylovWorkspace::allocate(device, n)?,
            precond: None,
        });
        self.state = SessionState::Initialized;
        Ok(true)
    }

    /// The device and the buffers of the current dimensions.
    pub(crate) fn parts(&mut self) -> Result<(&D, &mut Resources<D>)> {
        match (&self.device, &mut self.resources) {
            (Some(device), Some(resources)) => Ok((device, resources)),
            _ => Err(BridgeError::Backend(
                "solver session has no allocated resources".into(),
            )),
        }
    }

    pub fn counters(&self) -> DeviceCounters {
        self.device
            .as_ref()
            .map(|d| d.counters())
            .unwrap_or_default()
    }

    /// Release buffers and the device context. Idempotent; teardown faults
    /// are logged and swallowed.
    pub fn dispose(&mut self) {
        self.resources = None;
        if let Some(device) = self.device.take() {
            match device.release() {
                Ok(()) => info!(backend = D::NAME, "solver session disposed"),
                Err(e) => warn!(backend = D::NAME, "device teardown failed: {e}"),
            }
        }
        self.state = SessionState::Disposed;
    }
}

impl<D: KrylovDevice> Drop for DeviceSession<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
