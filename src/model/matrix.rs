//! Variance structures for the random effects.
//!
//! Omega (etas) and Sigma (epsilons) are block-diagonal matrices assembled
//! from lower-triangle blocks. Blocks are stored row-major as entered; the
//! assembled matrix is available as an `nalgebra::DMatrix` for hosts that
//! consume the numeric structure.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// One lower-triangle block: `values` holds rows `[a11, a21, a22, a31, ...]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceBlock {
    pub dim: usize,
    pub values: Vec<f64>,
}

impl VarianceBlock {
    /// Build a block from a lower triangle in row-major order.
    pub fn from_lower_triangle(values: Vec<f64>) -> Result<Self, ModelError> {
        let dim = triangle_dim(values.len()).ok_or_else(|| {
            ModelError::invalid_matrix(format!(
                "{} values do not form a lower triangle",
                values.len()
            ))
        })?;
        let block = VarianceBlock { dim, values };
        block.validate()?;
        Ok(block)
    }

    /// Diagonal-only block.
    pub fn diagonal(diag: Vec<f64>) -> Result<Self, ModelError> {
        let dim = diag.len();
        let mut values = vec![0.0; dim * (dim + 1) / 2];
        for (i, v) in diag.into_iter().enumerate() {
            values[i * (i + 1) / 2 + i] = v;
        }
        let block = VarianceBlock { dim, values };
        block.validate()?;
        Ok(block)
    }

    fn validate(&self) -> Result<(), ModelError> {
        for i in 0..self.dim {
            let d = self.values[i * (i + 1) / 2 + i];
            if d < 0.0 {
                return Err(ModelError::invalid_matrix(format!(
                    "negative variance {} on the diagonal",
                    d
                )));
            }
        }
        Ok(())
    }

    /// Element at (row, col) of the symmetric block.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let (r, c) = if row >= col { (row, col) } else { (col, row) };
        self.values[r * (r + 1) / 2 + c]
    }
}

fn triangle_dim(len: usize) -> Option<usize> {
    let mut dim = 0;
    loop {
        let need = dim * (dim + 1) / 2;
        if need == len {
            return if dim == 0 && len != 0 { None } else { Some(dim) };
        }
        if need > len {
            return None;
        }
        dim += 1;
    }
}

/// Block-diagonal variance matrix (Omega or Sigma).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VarianceMatrix {
    blocks: Vec<VarianceBlock>,
}

pub type Omega = VarianceMatrix;
pub type Sigma = VarianceMatrix;

impl VarianceMatrix {
    pub fn new() -> Self {
        VarianceMatrix { blocks: Vec::new() }
    }

    pub fn diag(values: Vec<f64>) -> Result<Self, ModelError> {
        Ok(VarianceMatrix {
            blocks: vec![VarianceBlock::diagonal(values)?],
        })
    }

    pub fn block(lower_triangle: Vec<f64>) -> Result<Self, ModelError> {
        Ok(VarianceMatrix {
            blocks: vec![VarianceBlock::from_lower_triangle(lower_triangle)?],
        })
    }

    /// Append another block on the diagonal.
    pub fn append(mut self, block: VarianceBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// Total dimension across blocks.
    pub fn dim(&self) -> usize {
        self.blocks.iter().map(|b| b.dim).sum()
    }

    pub fn blocks(&self) -> &[VarianceBlock] {
        &self.blocks
    }

    /// Assemble the full symmetric matrix.
    pub fn as_dmatrix(&self) -> DMatrix<f64> {
        let n = self.dim();
        let mut m = DMatrix::zeros(n, n);
        let mut offset = 0;
        for block in &self.blocks {
            for r in 0..block.dim {
                for c in 0..=r {
                    let v = block.get(r, c);
                    m[(offset + r, offset + c)] = v;
                    m[(offset + c, offset + r)] = v;
                }
            }
            offset += block.dim;
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_length_must_be_triangular() {
        assert!(VarianceBlock::from_lower_triangle(vec![0.1, 0.0, 0.2]).is_ok());
        assert!(VarianceBlock::from_lower_triangle(vec![0.1, 0.0]).is_err());
    }

    #[test]
    fn negative_diagonal_is_rejected() {
        let err = VarianceBlock::diagonal(vec![0.1, -0.2]).unwrap_err();
        assert!(matches!(err, ModelError::InvalidMatrix { .. }));
    }

    #[test]
    fn block_diagonal_assembly() {
        let omega = VarianceMatrix::block(vec![0.1, 0.01, 0.2])
            .unwrap()
            .append(VarianceBlock::diagonal(vec![0.3]).unwrap());
        assert_eq!(omega.dim(), 3);
        let m = omega.as_dmatrix();
        assert_eq!(m[(0, 0)], 0.1);
        assert_eq!(m[(1, 0)], 0.01);
        assert_eq!(m[(0, 1)], 0.01);
        assert_eq!(m[(1, 1)], 0.2);
        assert_eq!(m[(2, 2)], 0.3);
        assert_eq!(m[(2, 0)], 0.0);
    }
}
