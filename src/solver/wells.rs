//! Well contributions folded into the linear system before conversion.
//!
//! The well model is an external component; the solver only sees its terms as
//! dense blocks added onto existing matrix positions and scalar additions to
//! the right-hand side.

use crate::error::{BridgeError, Result};
use crate::sparse::BlockedMatrix;

#[derive(Debug, Clone, Default)]
pub struct WellContributions {
    block_size: usize,
    blocks: Vec<(usize, usize, Vec<f64>)>,
    rhs: Vec<(usize, f64)>,
}

impl WellContributions {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    /// Add a row-major `block_size x block_size` block at block (row, col).
    pub fn add_block(&mut self, row: usize, col: usize, block: &[f64]) -> Result<()> {
        if block.len() != self.block_size * self.block_size {
            return Err(BridgeError::Structural(format!(
                "well block has {} values, expected {}",
                block.len(),
                self.block_size * self.block_size
            )));
        }
        self.blocks.push((row, col, block.to_vec()));
        Ok(())
    }

    /// Add `value` to scalar rhs entry `index`.
    pub fn add_rhs(&mut self, index: usize, value: f64) {
        self.rhs.push((index, value));
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.rhs.is_empty()
    }

    /// Add the contributions onto a copy of the matrix values and the rhs.
    /// Nothing is modified unless every target exists.
    pub(crate) fn apply(
        &self,
        matrix: &BlockedMatrix,
        values: &mut [f64],
        rhs: &mut [f64],
    ) -> Result<()> {
        if self.block_size != matrix.block_size {
            return Err(BridgeError::Structural(format!(
                "well block size {} differs from matrix block size {}",
                self.block_size, matrix.block_size
            )));
        }

        let mut positions = Vec::with_capacity(self.blocks.len());
        for (row, col, _) in &self.blocks {
            let pos = (*row < matrix.nb)
                .then(|| matrix.find_block(*row, *col))
                .flatten()
                .ok_or_else(|| {
                    BridgeError::Structural(format!(
                        "well block ({row}, {col}) is outside the matrix sparsity pattern"
                    ))
                })?;
            positions.push(pos);
        }
        if let Some((index, _)) = self.rhs.iter().find(|(i, _)| *i >= rhs.len()) {
            return Err(BridgeError::Structural(format!(
                "well rhs index {index} out of range for system of size {}",
                rhs.len()
            )));
        }

        let bl = matrix.block_len();
        for (pos, (_, _, block)) in positions.into_iter().zip(&self.blocks) {
            for (dst, src) in values[pos * bl..(pos + 1) * bl].iter_mut().zip(block) {
                *dst += src;
            }
        }
        for &(index, value) in &self.rhs {
            rhs[index] += value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diag2() -> BlockedMatrix {
        BlockedMatrix::from_block_triplets(
            2,
            2,
            &[
                (0, 0, vec![1.0, 0.0, 0.0, 1.0]),
                (1, 1, vec![1.0, 0.0, 0.0, 1.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_apply_adds_blocks_and_rhs() {
        let m = diag2();
        let mut wells = WellContributions::new(2);
        wells.add_block(1, 1, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        wells.add_block(1, 1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        wells.add_rhs(3, -0.5);
        let mut values = m.values.clone();
        let mut rhs = vec![1.0; 4];
        wells.apply(&m, &mut values, &mut rhs).unwrap();
        assert_eq!(&values[4..], &[3.0, 2.0, 3.0, 5.0]);
        assert_eq!(rhs, vec![1.0, 1.0, 1.0, 0.5]);
        // Caller's matrix untouched.
        assert_eq!(m.block(1), &[1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_block_outside_pattern_is_structural() {
        let m = diag2();
        let mut wells = WellContributions::new(2);
        wells.add_block(0, 1, &[1.0; 4]).unwrap();
        let mut values = m.values.clone();
        let mut rhs = vec![0.0; 4];
        let err = wells.apply(&m, &mut values, &mut rhs).unwrap_err();
        assert!(matches!(err, BridgeError::Structural(_)));
        assert_eq!(values, m.values);
    }

    #[test]
    fn test_out_of_range_targets_rejected() {
        let m = diag2();
        let mut wells = WellContributions::new(2);
        wells.add_block(5, 5, &[1.0; 4]).unwrap();
        assert!(wells.apply(&m, &mut m.values.clone(), &mut [0.0; 4]).is_err());

        let mut wells = WellContributions::new(2);
        wells.add_rhs(4, 1.0);
        assert!(wells.apply(&m, &mut m.values.clone(), &mut [0.0; 4]).is_err());
    }

    #[test]
    fn test_wrong_block_length() {
        let mut wells = WellContributions::new(3);
        assert!(wells.add_block(0, 0, &[1.0; 4]).is_err());
        assert!(wells.is_empty());
    }
}
