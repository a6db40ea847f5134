//! Host fallback device.
//!
//! Keeps everything in f64 on the host and parallelizes the block SpMV and
//! vector updates with rayon. Dot products are plain sequential sums so two
//! runs of the same system are bitwise identical.

use std::cell::RefCell;

use rayon::prelude::*;

use crate::convert::{alloc_zeroed, BlockOrder, HostStaging};
use crate::error::Result;
use crate::sparse::{BlockedMatrix, MatrixDims};

use super::device::KrylovDevice;
use super::preconditioner::BlockIlu0;

pub struct CpuDevice;

pub struct CpuBuffer(RefCell<Vec<f64>>);

impl CpuBuffer {
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct CpuMatrix(BlockedMatrix);

pub struct CpuFactors {
    ilu: BlockIlu0,
}

/// y = A * x with one rayon task per block row.
fn par_block_spmv(a: &BlockedMatrix, x: &[f64], y: &mut [f64]) {
    let bs = a.block_size;
    y.par_chunks_mut(bs).enumerate().for_each(|(brow, y_blk)| {
        y_blk.fill(0.0);
        for idx in a.row_pointers[brow]..a.row_pointers[brow + 1] {
            let col = a.col_indices[idx];
            let x_blk = &x[col * bs..(col + 1) * bs];
            let block = a.block(idx);
            for (r, y_r) in y_blk.iter_mut().enumerate() {
                *y_r += block[r * bs..(r + 1) * bs]
                    .iter()
                    .zip(x_blk)
                    .map(|(a, b)| a * b)
                    .sum::<f64>();
            }
        }
    });
}

impl KrylovDevice for CpuDevice {
    type Buffer = CpuBuffer;
    type Matrix = CpuMatrix;
    type Factors = CpuFactors;

    const NAME: &'static str = "cpu";
    const BLOCK_ORDER: BlockOrder = BlockOrder::RowMajor;

    fn open() -> Result<Self> {
        Ok(CpuDevice)
    }

    fn release(self) -> Result<()> {
        Ok(())
    }

    fn new_buffer(&self, n: usize) -> Result<CpuBuffer> {
        Ok(CpuBuffer(RefCell::new(alloc_zeroed(n)?)))
    }

    fn alloc_matrix(&self, dims: MatrixDims) -> Result<CpuMatrix> {
        Ok(CpuMatrix(BlockedMatrix {
            nb: dims.nb,
            block_size: dims.block_size,
            row_pointers: alloc_zeroed(dims.nb + 1)?,
            col_indices: alloc_zeroed(dims.nnzb)?,
            values: alloc_zeroed(dims.nnz())?,
        }))
    }

    fn write_matrix(&self, matrix: &mut CpuMatrix, staging: &HostStaging) {
        let m = &mut matrix.0;
        for (dst, &src) in m.row_pointers.iter_mut().zip(&staging.row_pointers) {
            *dst = src as usize;
        }
        for (dst, &src) in m.col_indices.iter_mut().zip(&staging.col_indices) {
            *dst = src as usize;
        }
        m.values.copy_from_slice(&staging.values);
    }

    fn alloc_factors(&self, ilu: &BlockIlu0) -> Result<CpuFactors> {
        Ok(CpuFactors { ilu: ilu.clone() })
    }

    fn write_factors(&self, factors: &mut CpuFactors, ilu: &BlockIlu0) {
        factors.ilu.values.copy_from_slice(&ilu.values);
    }

    fn apply_preconditioner(&self, factors: &CpuFactors, input: &CpuBuffer, output: &CpuBuffer) {
        factors.ilu.apply(&input.0.borrow(), &mut output.0.borrow_mut());
    }

    fn spmv(&self, a: &CpuMatrix, x: &CpuBuffer, y: &CpuBuffer) {
        par_block_spmv(&a.0, &x.0.borrow(), &mut y.0.borrow_mut());
    }

    fn dot(&self, x: &CpuBuffer, y: &CpuBuffer) -> Result<f64> {
        let x = x.0.borrow();
        let y = y.0.borrow();
        Ok(x.iter().zip(y.iter()).map(|(a, b)| a * b).sum())
    }

    fn axpy(&self, alpha: f64, x: &CpuBuffer, y: &CpuBuffer) {
        let x = x.0.borrow();
        let mut y = y.0.borrow_mut();
        y.par_iter_mut()
            .zip(x.par_iter())
            .for_each(|(y, x)| *y += alpha * x);
    }

    fn copy(&self, src: &CpuBuffer, dst: &CpuBuffer) {
        dst.0.borrow_mut().copy_from_slice(&src.0.borrow());
    }

    fn scale(&self, alpha: f64, x: &CpuBuffer) {
        x.0.borrow_mut().par_iter_mut().for_each(|v| *v *= alpha);
    }

    fn fill_zero(&self, x: &CpuBuffer) {
        x.0.borrow_mut().fill(0.0);
    }

    fn upload_vec(&self, data: &[f64], buffer: &CpuBuffer) {
        buffer.0.borrow_mut().copy_from_slice(data);
    }

    fn download_vec(&self, buffer: &CpuBuffer, out: &mut [f64]) -> Result<()> {
        out.copy_from_slice(&buffer.0.borrow());
        Ok(())
    }
}
