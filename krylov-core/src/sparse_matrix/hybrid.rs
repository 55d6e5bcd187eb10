use super::csr::CsrMatrix;
use super::ell::{align_up, EllMatrix, ELL_ROW_ALIGNMENT};
use crate::error::KrylovError;
use crate::traits::{Matrix, Scalar};

/// Share of rows that must fit completely into the ELL part when the width
/// is chosen automatically.
pub const HYB_ELL_ROW_FRACTION: f64 = 0.8;

/// Hybrid format: the first `ell_width` entries of each row live in an ELL
/// block, the rest of longer rows in a CSR remainder.
#[derive(Debug, Clone, PartialEq)]
pub struct HybMatrix<T> {
    pub(crate) ell: EllMatrix<T>,
    pub(crate) csr: CsrMatrix<T>,
}

impl<T: Scalar> HybMatrix<T> {
    /// Converts a CSR matrix with an ELL width covering at least
    /// [`HYB_ELL_ROW_FRACTION`] of the rows.
    pub fn from_csr(csr: &CsrMatrix<T>) -> Result<Self, KrylovError> {
        let rows = csr.rows();
        let max_len = csr.max_row_len();
        let mut histogram = vec![0usize; max_len + 1];
        for row in 0..rows {
            histogram[csr.row_len(row)] += 1;
        }
        let needed = (HYB_ELL_ROW_FRACTION * rows as f64).ceil() as usize;
        let mut covered = 0usize;
        let mut width = max_len;
        for (len, count) in histogram.iter().enumerate() {
            covered += count;
            if covered >= needed {
                width = len;
                break;
            }
        }
        Self::from_csr_with_width(csr, width)
    }

    /// Converts a CSR matrix using an explicit ELL width.
    pub fn from_csr_with_width(csr: &CsrMatrix<T>, ell_width: usize) -> Result<Self, KrylovError> {
        let (rows, cols) = csr.dims();
        let internal_rows = align_up(rows.max(1), ELL_ROW_ALIGNMENT);
        let mut coords = vec![0usize; ell_width * internal_rows];
        let mut elements = vec![T::zero(); ell_width * internal_rows];
        let mut row_ptr = Vec::with_capacity(rows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);

        for row in 0..rows {
            for (item, idx) in (csr.row_ptr[row]..csr.row_ptr[row + 1]).enumerate() {
                if item < ell_width {
                    let offset = item * internal_rows + row;
                    coords[offset] = csr.col_indices[idx];
                    elements[offset] = csr.values[idx];
                } else {
                    col_indices.push(csr.col_indices[idx]);
                    values.push(csr.values[idx]);
                }
            }
            row_ptr.push(values.len());
        }

        let ell_nnz = csr.nnz() - values.len();
        let ell = EllMatrix::from_parts(
            rows,
            cols,
            ell_nnz,
            ell_width,
            internal_rows,
            coords,
            elements,
        )?;
        let csr = CsrMatrix::from_csr(rows, cols, row_ptr, col_indices, values)?;
        Ok(HybMatrix { ell, csr })
    }

    pub fn ell_part(&self) -> &EllMatrix<T> {
        &self.ell
    }

    pub fn csr_part(&self) -> &CsrMatrix<T> {
        &self.csr
    }

    #[inline]
    pub fn row_dot(&self, row: usize, x: &[T]) -> T {
        self.ell.row_dot(row, x) + self.csr.row_dot(row, x)
    }
}

impl<T: Scalar> Matrix for HybMatrix<T> {
    type Value = T;

    fn dims(&self) -> (usize, usize) {
        self.ell.dims()
    }

    fn nnz(&self) -> usize {
        self.ell.nnz() + self.csr.nnz()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse_matrix::Triplet;

    #[test]
    fn explicit_zeros_count_as_stored_entries() {
        // Row 0 stores an explicit zero in the ELL part, row 1 overflows.
        let csr = CsrMatrix::from_csr(
            2,
            3,
            vec![0, 2, 5],
            vec![0, 1, 0, 1, 2],
            vec![1.0, 0.0, 2.0, 3.0, 0.0],
        )
        .unwrap();
        let hyb = HybMatrix::from_csr_with_width(&csr, 2).unwrap();
        assert_eq!(hyb.ell_part().nnz(), 4);
        assert_eq!(hyb.csr_part().nnz(), 1);
        assert_eq!(hyb.nnz(), csr.nnz());
        assert_eq!(hyb.row_dot(0, &[1.0, 1.0, 1.0]), 1.0);
    }

    #[test]
    fn long_rows_overflow_into_csr() {
        // Rows 0..4 hold one entry, row 4 holds five.
        let mut triplets: Vec<_> = (0..4).map(|r| Triplet::new(r, r, 2.0)).collect();
        triplets.extend((0..5).map(|c| Triplet::new(4, c, 1.0)));
        let csr = CsrMatrix::from_triplets(5, 5, triplets).unwrap();

        let hyb = HybMatrix::from_csr(&csr).unwrap();
        assert_eq!(hyb.ell_part().items_per_row(), 1);
        assert_eq!(hyb.csr_part().nnz(), 4);
        assert_eq!(hyb.nnz(), csr.nnz());

        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        for row in 0..5 {
            assert_eq!(hyb.row_dot(row, &x), csr.row_dot(row, &x));
        }
    }

    #[test]
    fn zero_width_is_pure_csr() {
        let csr = CsrMatrix::<f32>::identity(3);
        let hyb = HybMatrix::from_csr_with_width(&csr, 0).unwrap();
        assert_eq!(hyb.ell_part().items_per_row(), 0);
        assert_eq!(hyb.csr_part().nnz(), 3);
    }
}
