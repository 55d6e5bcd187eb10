use super::csr::CsrMatrix;
use crate::error::KrylovError;
use crate::traits::{Matrix, Scalar};

/// Row count of the padded ELL arrays is rounded up to a multiple of this.
pub const ELL_ROW_ALIGNMENT: usize = 32;

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// ELLPACK format: every row stores `items_per_row` slots.
///
/// Slot `item` of `row` lives at `item * internal_rows + row` (column-major),
/// so consecutive rows read consecutive memory. Padding slots hold a zero
/// value and column 0. A stored value of exactly zero is treated as padding
/// by the product kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct EllMatrix<T> {
    rows: usize,
    cols: usize,
    nnz: usize,
    pub(crate) items_per_row: usize,
    pub(crate) internal_rows: usize,
    pub(crate) coords: Vec<usize>,
    pub(crate) elements: Vec<T>,
}

impl<T: Scalar> EllMatrix<T> {
    /// Converts a CSR matrix using its longest row as the ELL width.
    pub fn from_csr(csr: &CsrMatrix<T>) -> Self {
        let (rows, cols) = csr.dims();
        let items_per_row = csr.max_row_len();
        let internal_rows = align_up(rows.max(1), ELL_ROW_ALIGNMENT);
        let mut coords = vec![0usize; items_per_row * internal_rows];
        let mut elements = vec![T::zero(); items_per_row * internal_rows];
        for row in 0..rows {
            for (item, idx) in (csr.row_ptr[row]..csr.row_ptr[row + 1]).enumerate() {
                let offset = item * internal_rows + row;
                coords[offset] = csr.col_indices[idx];
                elements[offset] = csr.values[idx];
            }
        }
        EllMatrix {
            rows,
            cols,
            nnz: csr.nnz(),
            items_per_row,
            internal_rows,
            coords,
            elements,
        }
    }

    /// Assembles padded arrays holding `nnz` stored entries. Stored zeros
    /// count; padding slots do not.
    pub(crate) fn from_parts(
        rows: usize,
        cols: usize,
        nnz: usize,
        items_per_row: usize,
        internal_rows: usize,
        coords: Vec<usize>,
        elements: Vec<T>,
    ) -> Result<Self, KrylovError> {
        if internal_rows < rows || coords.len() != items_per_row * internal_rows {
            return Err(KrylovError::InvalidFormat(
                "ELL arrays must hold items_per_row * internal_rows slots".to_string(),
            ));
        }
        if elements.len() != coords.len() || coords.iter().any(|&c| c >= cols.max(1)) {
            return Err(KrylovError::InvalidFormat(
                "ELL coordinates out of bounds or mismatched with elements".to_string(),
            ));
        }
        if nnz > items_per_row * rows {
            return Err(KrylovError::InvalidFormat(format!(
                "{} stored entries do not fit {} rows of width {}",
                nnz, rows, items_per_row
            )));
        }
        Ok(EllMatrix {
            rows,
            cols,
            nnz,
            items_per_row,
            internal_rows,
            coords,
            elements,
        })
    }

    pub fn items_per_row(&self) -> usize {
        self.items_per_row
    }

    pub fn internal_rows(&self) -> usize {
        self.internal_rows
    }

    pub fn coords(&self) -> &[usize] {
        &self.coords
    }

    pub fn elements(&self) -> &[T] {
        &self.elements
    }

    #[inline]
    pub fn row_dot(&self, row: usize, x: &[T]) -> T {
        let mut sum = T::zero();
        for item in 0..self.items_per_row {
            let offset = item * self.internal_rows + row;
            let value = self.elements[offset];
            if value != T::zero() {
                sum = sum + value * x[self.coords[offset]];
            }
        }
        sum
    }

    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if row >= self.rows {
            return None;
        }
        (0..self.items_per_row)
            .map(|item| item * self.internal_rows + row)
            .find(|&o| self.elements[o] != T::zero() && self.coords[o] == col)
            .map(|o| self.elements[o])
    }
}

impl<T: Scalar> Matrix for EllMatrix<T> {
    type Value = T;

    fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn nnz(&self) -> usize {
        self.nnz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse_matrix::Triplet;

    #[test]
    fn ell_layout_is_column_major() {
        let csr = CsrMatrix::from_triplets(
            3,
            3,
            vec![
                Triplet::new(0, 0, 1.0),
                Triplet::new(0, 2, 2.0),
                Triplet::new(1, 1, 3.0),
                Triplet::new(2, 0, 4.0),
                Triplet::new(2, 2, 5.0),
            ],
        )
        .unwrap();
        let ell = EllMatrix::from_csr(&csr);
        assert_eq!(ell.items_per_row(), 2);
        assert_eq!(ell.internal_rows(), ELL_ROW_ALIGNMENT);
        let ir = ell.internal_rows();
        assert_eq!(ell.elements()[0], 1.0);
        assert_eq!(ell.elements()[ir], 2.0);
        assert_eq!(ell.elements()[ir + 1], 0.0);
        assert_eq!(ell.get(2, 2), Some(5.0));
        assert_eq!(ell.row_dot(2, &[1.0, 1.0, 1.0]), 9.0);
    }

    #[test]
    fn explicit_zero_is_indistinguishable_from_padding() {
        let csr = CsrMatrix::from_csr(1, 2, vec![0, 2], vec![0, 1], vec![1.0, 0.0]).unwrap();
        let ell = EllMatrix::from_csr(&csr);
        assert_eq!(ell.get(0, 1), None);
        assert_eq!(ell.row_dot(0, &[2.0, 7.0]), 2.0);
    }
}
