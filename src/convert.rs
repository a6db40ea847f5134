//! Conversion of a `BlockedMatrix` into backend-native staging arrays.
//!
//! Structure (row pointers, column indices) is copied verbatim into 32-bit
//! index arrays. Block values are either copied or transposed block by block,
//! depending on whether the backend stores its blocks row-major or
//! column-major. This is the only place where values are rearranged.

use crate::error::{BridgeError, Result};
use crate::sparse::{BlockedMatrix, MatrixDims};

/// Element order inside each dense block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrder {
    RowMajor,
    ColumnMajor,
}

/// Permutation between row-major and column-major storage of a square block.
///
/// `table[k]` is the source offset that lands at offset `k`. Transposing is an
/// involution, so the same table converts in both directions; for 3x3 blocks
/// it is `[0, 3, 6, 1, 4, 7, 2, 5, 8]`.
pub fn transpose_table(block_size: usize) -> Vec<usize> {
    (0..block_size * block_size)
        .map(|k| (k % block_size) * block_size + k / block_size)
        .collect()
}

/// Copy `src` into `dst`, converting every block from `from` to `to` order.
pub fn reorder_blocks(
    src: &[f64],
    dst: &mut [f64],
    block_size: usize,
    from: BlockOrder,
    to: BlockOrder,
) {
    assert_eq!(src.len(), dst.len(), "block value length mismatch");
    if from == to {
        dst.copy_from_slice(src);
        return;
    }
    let table = transpose_table(block_size);
    let block_len = table.len();
    for (dst_blk, src_blk) in dst
        .chunks_exact_mut(block_len)
        .zip(src.chunks_exact(block_len))
    {
        for (d, &s) in dst_blk.iter_mut().zip(&table) {
            *d = src_blk[s];
        }
    }
}

/// Host-side arrays in the layout a backend uploads to its device.
#[derive(Debug, Clone)]
pub struct HostStaging {
    pub order: BlockOrder,
    pub block_size: usize,
    pub row_pointers: Vec<u32>,
    pub col_indices: Vec<u32>,
    pub values: Vec<f64>,
}

impl HostStaging {
    /// Allocate staging sized for `dims`.
    pub fn allocate(dims: MatrixDims, order: BlockOrder) -> Result<Self> {
        if dims.nnzb > u32::MAX as usize || dims.n() > u32::MAX as usize {
            return Err(BridgeError::Structural(format!(
                "matrix with {} blocks and {} rows exceeds 32-bit device indexing",
                dims.nnzb,
                dims.n()
            )));
        }
        Ok(Self {
            order,
            block_size: dims.block_size,
            row_pointers: alloc_zeroed(dims.nb + 1)?,
            col_indices: alloc_zeroed(dims.nnzb)?,
            values: alloc_zeroed(dims.nnz())?,
        })
    }

    pub fn dims(&self) -> MatrixDims {
        MatrixDims {
            nb: self.row_pointers.len() - 1,
            block_size: self.block_size,
            nnzb: self.col_indices.len(),
        }
    }
}

/// Allocate a zeroed vector, reporting allocation failure instead of aborting.
pub(crate) fn alloc_zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| {
        BridgeError::Backend(format!("failed to allocate {len} host elements: {e}"))
    })?;
    v.resize(len, T::default());
    Ok(v)
}

/// Fill `staging` from the structure of `matrix` and the row-major block
/// `values` (the matrix values, possibly with external terms folded in).
pub fn convert_matrix(
    matrix: &BlockedMatrix,
    values: &[f64],
    staging: &mut HostStaging,
) -> Result<()> {
    matrix.validate()?;
    if staging.dims() != matrix.dims() {
        return Err(BridgeError::Structural(format!(
            "matrix dimensions {:?} differ from staging dimensions {:?}",
            matrix.dims(),
            staging.dims()
        )));
    }
    if values.len() != matrix.values.len() {
        return Err(BridgeError::Structural(format!(
            "expected {} block values, got {}",
            matrix.values.len(),
            values.len()
        )));
    }

    for (dst, &src) in staging.row_pointers.iter_mut().zip(&matrix.row_pointers) {
        *dst = src as u32;
    }
    for (dst, &src) in staging.col_indices.iter_mut().zip(&matrix.col_indices) {
        *dst = src as u32;
    }
    reorder_blocks(
        values,
        &mut staging.values,
        matrix.block_size,
        BlockOrder::RowMajor,
        staging.order,
    );
    Ok(())
}
