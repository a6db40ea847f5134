//! Block ILU(0) preconditioner.
//!
//! Factors A ≈ L·U on the sparsity pattern of A: no fill-in outside the
//! existing blocks. L is block unit lower triangular, U block upper
//! triangular. The factors share one value array laid out like the matrix:
//! strictly lower blocks hold L, strictly upper blocks hold U, and diagonal
//! blocks hold the *inverse* of U's diagonal so the apply never divides.
//!
//! The analysis phase (diagonal positions and level schedules) depends on the
//! structure only and is reused while the sparsity pattern is unchanged; the
//! numeric factorization runs on every solve.

use crate::sparse::{BlockedMatrix, MAX_BLOCK_SIZE};
use thiserror::Error;

/// Pivots with magnitude below this are treated as singular.
const PIVOT_EPS: f64 = 1e-30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("singular or non-finite diagonal block in block row {row}")]
pub struct SingularPivot {
    pub row: usize,
}

/// Block rows grouped so that each row depends only on rows of earlier levels.
/// Rows of one level can be eliminated in parallel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Levels {
    /// Block rows ordered level by level.
    pub rows: Vec<u32>,
    /// `offsets[l]..offsets[l + 1]` indexes the rows of level `l`.
    pub offsets: Vec<u32>,
}

impl Levels {
    fn from_level_of(level_of: &[usize]) -> Self {
        let n_levels = level_of.iter().max().map_or(0, |&m| m + 1);
        let mut offsets = vec![0u32; n_levels + 1];
        for &l in level_of {
            offsets[l + 1] += 1;
        }
        for l in 1..=n_levels {
            offsets[l] += offsets[l - 1];
        }
        let mut next = offsets.clone();
        let mut rows = vec![0u32; level_of.len()];
        for (row, &l) in level_of.iter().enumerate() {
            rows[next[l] as usize] = row as u32;
            next[l] += 1;
        }
        Self { rows, offsets }
    }

    pub fn count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn level(&self, l: usize) -> &[u32] {
        &self.rows[self.offsets[l] as usize..self.offsets[l + 1] as usize]
    }
}

#[derive(Debug, Clone)]
pub struct BlockIlu0 {
    pub nb: usize,
    pub block_size: usize,
    pub row_pointers: Vec<usize>,
    pub col_indices: Vec<usize>,
    /// Index of the first block at or right of the diagonal in each row. When
    /// the matrix is well formed this is the diagonal block itself.
    pub diag_positions: Vec<usize>,
    pub values: Vec<f64>,
    /// Dependency levels of the forward (L) sweep.
    pub lower_levels: Levels,
    /// Dependency levels of the backward (U) sweep.
    pub upper_levels: Levels,
}

impl BlockIlu0 {
    /// Symbolic phase: locate diagonals and build the level schedules.
    pub fn analyze(matrix: &BlockedMatrix) -> Self {
        let nb = matrix.nb;
        let rp = &matrix.row_pointers;
        let ci = &matrix.col_indices;

        let diag_positions = matrix.diagonal_block_positions();

        let mut lower = vec![0usize; nb];
        for i in 0..nb {
            lower[i] = ci[rp[i]..diag_positions[i]]
                .iter()
                .map(|&k| lower[k] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut upper = vec![0usize; nb];
        for i in (0..nb).rev() {
            let d = diag_positions[i];
            let first = if d < rp[i + 1] && ci[d] == i { d + 1 } else { d };
            upper[i] = ci[first..rp[i + 1]]
                .iter()
                .map(|&j| upper[j] + 1)
                .max()
                .unwrap_or(0);
        }

        Self {
            nb,
            block_size: matrix.block_size,
            row_pointers: rp.clone(),
            col_indices: ci.clone(),
            diag_positions,
            values: vec![0.0; matrix.values.len()],
            lower_levels: Levels::from_level_of(&lower),
            upper_levels: Levels::from_level_of(&upper),
        }
    }

    /// Whether the analysis is still valid for `matrix`.
    pub fn matches_structure(&self, matrix: &BlockedMatrix) -> bool {
        self.block_size == matrix.block_size
            && self.row_pointers == matrix.row_pointers
            && self.col_indices == matrix.col_indices
    }

    /// Numeric phase: factor the row-major block `values` of the analyzed
    /// matrix. Previous factor values are discarded.
    pub fn factorize(&mut self, values: &[f64]) -> Result<(), SingularPivot> {
        let bs = self.block_size;
        let bl = bs * bs;
        self.values.copy_from_slice(values);

        let mut l_ik = [0.0; MAX_BLOCK_SIZE * MAX_BLOCK_SIZE];
        let mut prod = [0.0; MAX_BLOCK_SIZE * MAX_BLOCK_SIZE];
        let mut inv = [0.0; MAX_BLOCK_SIZE * MAX_BLOCK_SIZE];

        for i in 0..self.nb {
            let end = self.row_pointers[i + 1];
            let diag = self.diag_positions[i];
            if diag == end || self.col_indices[diag] != i {
                return Err(SingularPivot { row: i });
            }

            for kk in self.row_pointers[i]..diag {
                let k = self.col_indices[kk];
                let dk = self.diag_positions[k];

                // L_ik = A_ik * inv(U_kk)
                block_mul(
                    &self.values[kk * bl..(kk + 1) * bl],
                    &self.values[dk * bl..(dk + 1) * bl],
                    &mut l_ik[..bl],
                    bs,
                );
                self.values[kk * bl..(kk + 1) * bl].copy_from_slice(&l_ik[..bl]);

                // A_ij -= L_ik * U_kj for every j > k present in both rows
                let mut pos = kk + 1;
                for jj in dk + 1..self.row_pointers[k + 1] {
                    let j = self.col_indices[jj];
                    while pos < end && self.col_indices[pos] < j {
                        pos += 1;
                    }
                    if pos == end {
                        break;
                    }
                    if self.col_indices[pos] == j {
                        block_mul(
                            &l_ik[..bl],
                            &self.values[jj * bl..(jj + 1) * bl],
                            &mut prod[..bl],
                            bs,
                        );
                        for (a, p) in self.values[pos * bl..(pos + 1) * bl].iter_mut().zip(&prod) {
                            *a -= p;
                        }
                    }
                }
            }

            let d = &mut self.values[diag * bl..(diag + 1) * bl];
            if !invert_block(d, &mut inv[..bl], bs) {
                return Err(SingularPivot { row: i });
            }
            d.copy_from_slice(&inv[..bl]);
        }
        Ok(())
    }

    /// z = (LU)⁻¹ r, sequential forward and backward block sweeps.
    pub fn apply(&self, r: &[f64], z: &mut [f64]) {
        let bs = self.block_size;
        let bl = bs * bs;
        let mut acc_buf = [0.0; MAX_BLOCK_SIZE];

        for i in 0..self.nb {
            let acc = &mut acc_buf[..bs];
            acc.copy_from_slice(&r[i * bs..(i + 1) * bs]);
            for kk in self.row_pointers[i]..self.diag_positions[i] {
                let k = self.col_indices[kk];
                block_matvec_sub(
                    &self.values[kk * bl..(kk + 1) * bl],
                    &z[k * bs..(k + 1) * bs],
                    acc,
                    bs,
                );
            }
            z[i * bs..(i + 1) * bs].copy_from_slice(acc);
        }

        for i in (0..self.nb).rev() {
            let acc = &mut acc_buf[..bs];
            acc.copy_from_slice(&z[i * bs..(i + 1) * bs]);
            let diag = self.diag_positions[i];
            for jj in diag + 1..self.row_pointers[i + 1] {
                let j = self.col_indices[jj];
                block_matvec_sub(
                    &self.values[jj * bl..(jj + 1) * bl],
                    &z[j * bs..(j + 1) * bs],
                    acc,
                    bs,
                );
            }
            let d_inv = &self.values[diag * bl..(diag + 1) * bl];
            for row in 0..bs {
                z[i * bs + row] = d_inv[row * bs..(row + 1) * bs]
                    .iter()
                    .zip(acc.iter())
                    .map(|(a, b)| a * b)
                    .sum();
            }
        }
    }
}

/// out = a * b for row-major `bs x bs` blocks.
fn block_mul(a: &[f64], b: &[f64], out: &mut [f64], bs: usize) {
    for r in 0..bs {
        for c in 0..bs {
            out[r * bs + c] = (0..bs).map(|k| a[r * bs + k] * b[k * bs + c]).sum();
        }
    }
}

/// acc -= a * x
fn block_matvec_sub(a: &[f64], x: &[f64], acc: &mut [f64], bs: usize) {
    for (r, acc_r) in acc.iter_mut().enumerate() {
        *acc_r -= a[r * bs..(r + 1) * bs]
            .iter()
            .zip(x)
            .map(|(a, b)| a * b)
            .sum::<f64>();
    }
}

/// Gauss-Jordan inversion with partial pivoting. `a` is destroyed.
/// Returns false for a singular or non-finite block.
fn invert_block(a: &mut [f64], inv: &mut [f64], bs: usize) -> bool {
    if a.iter().any(|v| !v.is_finite()) {
        return false;
    }
    inv.fill(0.0);
    for i in 0..bs {
        inv[i * bs + i] = 1.0;
    }

    for col in 0..bs {
        let mut best_row = col;
        let mut best_val = a[col * bs + col].abs();
        for row in (col + 1)..bs {
            let v = a[row * bs + col].abs();
            if v > best_val {
                best_val = v;
                best_row = row;
            }
        }
        if best_val < PIVOT_EPS {
            return false;
        }
        if best_row != col {
            for j in 0..bs {
                a.swap(col * bs + j, best_row * bs + j);
                inv.swap(col * bs + j, best_row * bs + j);
            }
        }

        let pivot = a[col * bs + col];
        for j in 0..bs {
            a[col * bs + j] /= pivot;
            inv[col * bs + j] /= pivot;
        }
        for row in 0..bs {
            if row == col {
                continue;
            }
            let factor = a[row * bs + col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..bs {
                a[row * bs + j] -= factor * a[col * bs + j];
                inv[row * bs + j] -= factor * inv[col * bs + j];
            }
        }
    }
    inv.iter().all(|v| v.is_finite())
}
