use super::csr::CsrMatrix;
use crate::error::KrylovError;
use crate::traits::{Matrix, Scalar};

/// Default block height C.
pub const DEFAULT_ROWS_PER_BLOCK: usize = 32;

/// SELL-C-σ: rows are grouped into blocks of `rows_per_block` (C) rows,
/// each block padded only to its own longest row.
///
/// With a sorting window σ > 1, rows inside each window of σ rows are
/// reordered by decreasing length before blocking; `row_order` maps a
/// storage slot back to the original row so products stay in row order.
/// Within a block, column `c` of slot `s` lives at
/// `block_start[b] + c * rows_per_block + (s % rows_per_block)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlicedEllMatrix<T> {
    rows: usize,
    cols: usize,
    nnz: usize,
    pub(crate) rows_per_block: usize,
    sigma: usize,
    pub(crate) columns_per_block: Vec<usize>,
    pub(crate) block_start: Vec<usize>,
    pub(crate) row_order: Vec<usize>,
    slot_of_row: Vec<usize>,
    pub(crate) coords: Vec<usize>,
    pub(crate) elements: Vec<T>,
}

impl<T: Scalar> SlicedEllMatrix<T> {
    /// Converts a CSR matrix into blocks of `rows_per_block` rows, sorting
    /// rows by length inside windows of `sigma` rows (`sigma == 1` keeps the
    /// natural order).
    pub fn from_csr(
        csr: &CsrMatrix<T>,
        rows_per_block: usize,
        sigma: usize,
    ) -> Result<Self, KrylovError> {
        if rows_per_block == 0 || sigma == 0 {
            return Err(KrylovError::InvalidFormat(
                "SELL-C-sigma needs positive block height and sorting window".to_string(),
            ));
        }
        let (rows, cols) = csr.dims();

        let mut row_order: Vec<usize> = (0..rows).collect();
        if sigma > 1 {
            for window in row_order.chunks_mut(sigma) {
                window.sort_by_key(|&r| std::cmp::Reverse(csr.row_len(r)));
            }
        }
        let mut slot_of_row = vec![0usize; rows];
        for (slot, &row) in row_order.iter().enumerate() {
            slot_of_row[row] = slot;
        }

        let blocks = rows.div_ceil(rows_per_block);
        let mut columns_per_block = Vec::with_capacity(blocks);
        let mut block_start = Vec::with_capacity(blocks + 1);
        let mut total = 0usize;
        for slots in row_order.chunks(rows_per_block) {
            let width = slots.iter().map(|&r| csr.row_len(r)).max().unwrap_or(0);
            block_start.push(total);
            columns_per_block.push(width);
            total += width * rows_per_block;
        }
        block_start.push(total);

        let mut coords = vec![0usize; total];
        let mut elements = vec![T::zero(); total];
        for (slot, &row) in row_order.iter().enumerate() {
            let block = slot / rows_per_block;
            let within = slot % rows_per_block;
            for (c, idx) in (csr.row_ptr[row]..csr.row_ptr[row + 1]).enumerate() {
                let offset = block_start[block] + c * rows_per_block + within;
                coords[offset] = csr.col_indices[idx];
                elements[offset] = csr.values[idx];
            }
        }

        Ok(SlicedEllMatrix {
            rows,
            cols,
            nnz: csr.nnz(),
            rows_per_block,
            sigma,
            columns_per_block,
            block_start,
            row_order,
            slot_of_row,
            coords,
            elements,
        })
    }

    pub fn rows_per_block(&self) -> usize {
        self.rows_per_block
    }

    pub fn sigma(&self) -> usize {
        self.sigma
    }

    pub fn blocks(&self) -> usize {
        self.columns_per_block.len()
    }

    pub fn columns_per_block(&self) -> &[usize] {
        &self.columns_per_block
    }

    /// Offsets of each block into the coordinate/element arrays, with a
    /// final entry holding the total length.
    pub fn block_start(&self) -> &[usize] {
        &self.block_start
    }

    pub fn row_order(&self) -> &[usize] {
        &self.row_order
    }

    /// Product of original row `row` with `x`.
    #[inline]
    pub fn row_dot(&self, row: usize, x: &[T]) -> T {
        let slot = self.slot_of_row[row];
        let block = slot / self.rows_per_block;
        let base = self.block_start[block] + slot % self.rows_per_block;
        let mut sum = T::zero();
        for c in 0..self.columns_per_block[block] {
            let offset = base + c * self.rows_per_block;
            sum = sum + self.elements[offset] * x[self.coords[offset]];
        }
        sum
    }
}

impl<T: Scalar> Matrix for SlicedEllMatrix<T> {
    type Value = T;

    fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn nnz(&self) -> usize {
        self.nnz
    }
}
