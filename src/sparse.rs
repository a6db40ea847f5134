//! Block Compressed Sparse Row (BCSR) matrix.
//!
//! The backend-independent representation of the linear system assembled at
//! every Newton iteration. Every nonzero is a dense `block_size x block_size`
//! block stored row-major; one block row per grid cell.

use crate::error::{BridgeError, Result};

/// Largest supported block size (one row per conserved component).
pub const MAX_BLOCK_SIZE: usize = 6;

/// Dimensions that decide whether session buffers can be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixDims {
    pub nb: usize,
    pub block_size: usize,
    pub nnzb: usize,
}

impl MatrixDims {
    /// Number of scalar rows.
    pub fn n(&self) -> usize {
        self.nb * self.block_size
    }

    /// Number of scalar values stored for the matrix.
    pub fn nnz(&self) -> usize {
        self.nnzb * self.block_size * self.block_size
    }
}

/// Square block sparse matrix in BCSR format.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockedMatrix {
    /// Number of block rows (and block columns).
    pub nb: usize,
    pub block_size: usize,
    /// `row_pointers[i]..row_pointers[i + 1]` indexes the blocks of block row i.
    pub row_pointers: Vec<usize>,
    /// Block column of each nonzero block, ascending within a row.
    pub col_indices: Vec<usize>,
    /// `nnzb * block_size²` scalars, row-major inside each block.
    pub values: Vec<f64>,
}

impl BlockedMatrix {
    /// Create a matrix with no nonzero blocks.
    pub fn new(nb: usize, block_size: usize) -> Self {
        Self {
            nb,
            block_size,
            row_pointers: vec![0; nb + 1],
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Number of nonzero blocks.
    pub fn nnzb(&self) -> usize {
        self.col_indices.len()
    }

    /// Number of scalar rows.
    pub fn n(&self) -> usize {
        self.nb * self.block_size
    }

    pub fn block_len(&self) -> usize {
        self.block_size * self.block_size
    }

    pub fn dims(&self) -> MatrixDims {
        MatrixDims {
            nb: self.nb,
            block_size: self.block_size,
            nnzb: self.nnzb(),
        }
    }

    /// Dense values of the block stored at position `idx`.
    pub fn block(&self, idx: usize) -> &[f64] {
        let len = self.block_len();
        &self.values[idx * len..(idx + 1) * len]
    }

    /// Position of block (row, col) in `col_indices`/`values`, if present.
    pub fn find_block(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.row_pointers[row];
        let end = self.row_pointers[row + 1];
        self.col_indices[start..end]
            .binary_search(&col)
            .ok()
            .map(|offset| start + offset)
    }

    /// For each block row, the position of the first block at or right of the
    /// diagonal. Equals the diagonal block's position when it is stored.
    pub fn diagonal_block_positions(&self) -> Vec<usize> {
        (0..self.nb)
            .map(|i| {
                let start = self.row_pointers[i];
                let end = self.row_pointers[i + 1];
                start + self.col_indices[start..end].partition_point(|&c| c < i)
            })
            .collect()
    }

    /// Check the BCSR invariants. A violation is a programming error of the
    /// assembler, reported as `BridgeError::Structural`.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(BridgeError::Structural(format!(
                "block size {} outside supported range 1..={MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.row_pointers.len() != self.nb + 1 {
            return Err(BridgeError::Structural(format!(
                "row pointer count mismatch: expected {}, got {}",
                self.nb + 1,
                self.row_pointers.len()
            )));
        }
        if self.row_pointers[0] != 0 {
            return Err(BridgeError::Structural(format!(
                "first row pointer must be 0, got {}",
                self.row_pointers[0]
            )));
        }
        let nnzb = self.nnzb();
        if self.row_pointers[self.nb] != nnzb {
            return Err(BridgeError::Structural(format!(
                "last row pointer {} does not match {} column indices",
                self.row_pointers[self.nb], nnzb
            )));
        }
        if self.values.len() != nnzb * self.block_len() {
            return Err(BridgeError::Structural(format!(
                "value count mismatch: expected {} for {} blocks of size {}, got {}",
                nnzb * self.block_len(),
                nnzb,
                self.block_size,
                self.values.len()
            )));
        }
        for (row, w) in self.row_pointers.windows(2).enumerate() {
            if w[1] < w[0] {
                return Err(BridgeError::Structural(format!(
                    "row pointers decrease at block row {row}"
                )));
            }
            if w[1] > nnzb {
                return Err(BridgeError::Structural(format!(
                    "row pointer {} of block row {row} exceeds {nnzb} blocks",
                    w[1]
                )));
            }
        }
        for row in 0..self.nb {
            let start = self.row_pointers[row];
            let end = self.row_pointers[row + 1];
            let mut prev: Option<usize> = None;
            for &col in &self.col_indices[start..end] {
                if col >= self.nb {
                    return Err(BridgeError::Structural(format!(
                        "column index {col} out of range in block row {row} (nb = {})",
                        self.nb
                    )));
                }
                if prev.is_some_and(|p| p >= col) {
                    return Err(BridgeError::Structural(format!(
                        "column indices of block row {row} are not strictly ascending"
                    )));
                }
                prev = Some(col);
            }
        }
        Ok(())
    }

    /// Build a matrix from (block row, block column, row-major block) triplets.
    /// Duplicate positions are summed.
    pub fn from_block_triplets(
        nb: usize,
        block_size: usize,
        triplets: &[(usize, usize, Vec<f64>)],
    ) -> Result<Self> {
        let block_len = block_size * block_size;
        for (row, col, block) in triplets {
            if *row >= nb || *col >= nb {
                return Err(BridgeError::Structural(format!(
                    "block ({row}, {col}) outside {nb}x{nb} block matrix"
                )));
            }
            if block.len() != block_len {
                return Err(BridgeError::Structural(format!(
                    "block ({row}, {col}) has {} values, expected {block_len}",
                    block.len()
                )));
            }
        }

        let mut order: Vec<usize> = (0..triplets.len()).collect();
        order.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut matrix = Self::new(nb, block_size);
        let mut last: Option<(usize, usize)> = None;
        for &i in &order {
            let (row, col, ref block) = triplets[i];
            if last == Some((row, col)) {
                let base = matrix.values.len() - block_len;
                for (dst, src) in matrix.values[base..].iter_mut().zip(block) {
                    *dst += src;
                }
                continue;
            }
            matrix.col_indices.push(col);
            matrix.values.extend_from_slice(block);
            matrix.row_pointers[row + 1] += 1;
            last = Some((row, col));
        }
        for i in 1..=nb {
            matrix.row_pointers[i] += matrix.row_pointers[i - 1];
        }
        Ok(matrix)
    }

    /// Scalar (block size 1) matrix from (row, col, value) triplets.
    pub fn from_scalar_triplets(n: usize, triplets: &[(usize, usize, f64)]) -> Result<Self> {
        let blocks: Vec<(usize, usize, Vec<f64>)> =
            triplets.iter().map(|&(r, c, v)| (r, c, vec![v])).collect();
        Self::from_block_triplets(n, 1, &blocks)
    }

    /// Sparse matrix-vector multiply: y = A * x
    pub fn spmv(&self, x: &[f64]) -> Vec<f64> {
        let mut y = vec![0.0; self.n()];
        self.spmv_into(x, &mut y);
        y
    }

    /// Sparse matrix-vector multiply into an existing buffer.
    pub fn spmv_into(&self, x: &[f64], y: &mut [f64]) {
        assert_eq!(x.len(), self.n(), "spmv dimension mismatch");
        assert_eq!(y.len(), self.n(), "spmv dimension mismatch");
        let bs = self.block_size;
        for brow in 0..self.nb {
            let y_blk = &mut y[brow * bs..(brow + 1) * bs];
            y_blk.fill(0.0);
            for idx in self.row_pointers[brow]..self.row_pointers[brow + 1] {
                let x_blk = &x[self.col_indices[idx] * bs..(self.col_indices[idx] + 1) * bs];
                let block = self.block(idx);
                for (r, y_r) in y_blk.iter_mut().enumerate() {
                    *y_r += block[r * bs..(r + 1) * bs]
                        .iter()
                        .zip(x_blk)
                        .map(|(a, b)| a * b)
                        .sum::<f64>();
                }
            }
        }
    }

    /// Expand to a dense scalar matrix. For testing and small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let n = self.n();
        let bs = self.block_size;
        let mut dense = vec![vec![0.0; n]; n];
        for brow in 0..self.nb {
            for idx in self.row_pointers[brow]..self.row_pointers[brow + 1] {
                let bcol = self.col_indices[idx];
                let block = self.block(idx);
                for r in 0..bs {
                    for c in 0..bs {
                        dense[brow * bs + r][bcol * bs + c] = block[r * bs + c];
                    }
                }
            }
        }
        dense
    }
}
