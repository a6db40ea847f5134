//! Synthetic block systems for the CLI and tests.
//!
//! `laplacian_3d` mimics the shape of a fully implicit reservoir Jacobian: a
//! 7-point stencil on a structured grid with one block row per cell and
//! `block_size` coupled equations per cell. Inter-equation coupling is
//! deliberately non-symmetric.

use crate::sparse::BlockedMatrix;

/// Identity with `nb` blocks of size `block_size`.
pub fn identity(nb: usize, block_size: usize) -> BlockedMatrix {
    let bl = block_size * block_size;
    let mut values = vec![0.0; nb * bl];
    for blk in values.chunks_exact_mut(bl) {
        for d in 0..block_size {
            blk[d * block_size + d] = 1.0;
        }
    }
    BlockedMatrix {
        nb,
        block_size,
        row_pointers: (0..=nb).collect(),
        col_indices: (0..nb).collect(),
        values,
    }
}

/// Scalar tridiagonal `[-1, 2, -1]`.
pub fn tridiagonal(n: usize) -> BlockedMatrix {
    let mut row_pointers = Vec::with_capacity(n + 1);
    let mut col_indices = Vec::with_capacity(3 * n);
    let mut values = Vec::with_capacity(3 * n);
    row_pointers.push(0);
    for i in 0..n {
        if i > 0 {
            col_indices.push(i - 1);
            values.push(-1.0);
        }
        col_indices.push(i);
        values.push(2.0);
        if i + 1 < n {
            col_indices.push(i + 1);
            values.push(-1.0);
        }
        row_pointers.push(col_indices.len());
    }
    BlockedMatrix {
        nb: n,
        block_size: 1,
        row_pointers,
        col_indices,
        values,
    }
}

/// Diagonal block of a cell: strong diagonal, weak asymmetric coupling.
fn cell_block(block_size: usize) -> Vec<f64> {
    let mut blk = vec![0.0; block_size * block_size];
    for r in 0..block_size {
        for c in 0..block_size {
            blk[r * block_size + c] = if r == c {
                7.0
            } else {
                0.1 / block_size as f64 * (1.0 + 0.5 * (r as f64 - c as f64))
            };
        }
    }
    blk
}

/// Off-diagonal block towards a neighbor cell.
fn flux_block(block_size: usize) -> Vec<f64> {
    let mut blk = vec![0.0; block_size * block_size];
    for r in 0..block_size {
        for c in 0..block_size {
            blk[r * block_size + c] = if r == c { -1.0 } else { 0.01 * (r as f64 - c as f64) };
        }
    }
    blk
}

/// Block 7-point operator on an `nx * ny * nz` grid, cells ordered x fastest.
/// Block diagonally dominant, so ILU(0) exists and BiCGStab converges.
pub fn laplacian_3d(nx: usize, ny: usize, nz: usize, block_size: usize) -> BlockedMatrix {
    let nb = nx * ny * nz;
    let bl = block_size * block_size;
    let cell = cell_block(block_size);
    let flux = flux_block(block_size);
    let idx = |i: usize, j: usize, k: usize| i + nx * (j + ny * k);

    let mut row_pointers = Vec::with_capacity(nb + 1);
    let mut col_indices = Vec::with_capacity(7 * nb);
    let mut values = Vec::with_capacity(7 * nb * bl);
    row_pointers.push(0);

    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let row = idx(i, j, k);
                // Ascending column order: -z, -y, -x, self, +x, +y, +z
                let mut neighbors = Vec::with_capacity(7);
                if k > 0 {
                    neighbors.push(idx(i, j, k - 1));
                }
                if j > 0 {
                    neighbors.push(idx(i, j - 1, k));
                }
                if i > 0 {
                    neighbors.push(idx(i - 1, j, k));
                }
                neighbors.push(row);
                if i + 1 < nx {
                    neighbors.push(idx(i + 1, j, k));
                }
                if j + 1 < ny {
                    neighbors.push(idx(i, j + 1, k));
                }
                if k + 1 < nz {
                    neighbors.push(idx(i, j, k + 1));
                }
                for col in neighbors {
                    col_indices.push(col);
                    values.extend_from_slice(if col == row { &cell } else { &flux });
                }
                row_pointers.push(col_indices.len());
            }
        }
    }

    BlockedMatrix {
        nb,
        block_size,
        row_pointers,
        col_indices,
        values,
    }
}

/// Deterministically perturb diagonal blocks the way successive Newton
/// iterations change the Jacobian without touching its sparsity pattern.
pub fn perturb(matrix: &mut BlockedMatrix, step: usize) {
    let bs = matrix.block_size;
    let bl = matrix.block_len();
    for (row, pos) in matrix.diagonal_block_positions().into_iter().enumerate() {
        if pos >= matrix.row_pointers[row + 1] || matrix.col_indices[pos] != row {
            continue;
        }
        let shift = 0.05 * (((row + step) % 7) as f64 / 7.0);
        for d in 0..bs {
            matrix.values[pos * bl + d * bs + d] *= 1.0 + shift;
        }
    }
}

/// Right-hand side whose exact solution is all ones.
pub fn rhs_for_ones(matrix: &BlockedMatrix) -> Vec<f64> {
    matrix.spmv(&vec![1.0; matrix.n()])
}
