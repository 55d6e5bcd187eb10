use crate::error::KrylovError;
use crate::traits::{Matrix, Scalar};

/// A single `(row, col, value)` entry used to assemble sparse matrices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triplet<T> {
    pub row: usize,
    pub col: usize,
    pub value: T,
}

impl<T> Triplet<T> {
    pub fn new(row: usize, col: usize, value: T) -> Self {
        Triplet { row, col, value }
    }
}

/// Compressed Sparse Row matrix on the host.
///
/// Every other storage format is built from this one.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    rows: usize,
    cols: usize,
    /// `rows + 1` monotonically non-decreasing offsets into `col_indices`/`values`.
    pub(crate) row_ptr: Vec<usize>,
    pub(crate) col_indices: Vec<usize>,
    pub(crate) values: Vec<T>,
}

impl<T: Scalar> CsrMatrix<T> {
    /// Creates an empty matrix with given dimensions.
    pub fn new(rows: usize, cols: usize) -> Self {
        CsrMatrix {
            rows,
            cols,
            row_ptr: vec![0; rows + 1],
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn identity(n: usize) -> Self {
        CsrMatrix {
            rows: n,
            cols: n,
            row_ptr: (0..=n).collect(),
            col_indices: (0..n).collect(),
            values: vec![T::one(); n],
        }
    }

    /// Assembles a matrix from unordered triplets. Duplicate coordinates are summed.
    pub fn from_triplets(
        rows: usize,
        cols: usize,
        mut triplets: Vec<Triplet<T>>,
    ) -> Result<Self, KrylovError> {
        if let Some(t) = triplets.iter().find(|t| t.row >= rows || t.col >= cols) {
            return Err(KrylovError::InvalidDimensions(format!(
                "Triplet ({}, {}) out of bounds for {}x{} matrix",
                t.row, t.col, rows, cols
            )));
        }
        triplets.sort_unstable_by_key(|t| (t.row, t.col));

        let mut row_ptr = vec![0usize; rows + 1];
        let mut col_indices: Vec<usize> = Vec::with_capacity(triplets.len());
        let mut values: Vec<T> = Vec::with_capacity(triplets.len());
        let mut last: Option<(usize, usize)> = None;
        for t in triplets {
            if last == Some((t.row, t.col)) {
                if let Some(v) = values.last_mut() {
                    *v = *v + t.value;
                }
                continue;
            }
            last = Some((t.row, t.col));
            row_ptr[t.row + 1] += 1;
            col_indices.push(t.col);
            values.push(t.value);
        }
        for i in 1..=rows {
            row_ptr[i] += row_ptr[i - 1];
        }

        Ok(CsrMatrix {
            rows,
            cols,
            row_ptr,
            col_indices,
            values,
        })
    }

    /// Creates a matrix from raw CSR components after validating them.
    pub fn from_csr(
        rows: usize,
        cols: usize,
        row_ptr: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<T>,
    ) -> Result<Self, KrylovError> {
        if row_ptr.len() != rows + 1 {
            return Err(KrylovError::InvalidDimensions(
                "row_ptr length must be rows + 1".to_string(),
            ));
        }
        if values.len() != col_indices.len() {
            return Err(KrylovError::InvalidDimensions(
                "values and col_indices must have the same length".to_string(),
            ));
        }
        if row_ptr.first() != Some(&0) || row_ptr.last() != Some(&values.len()) {
            return Err(KrylovError::InvalidDimensions(
                "row_ptr must start at 0 and end at the number of stored values".to_string(),
            ));
        }
        if row_ptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(KrylovError::InvalidFormat(
                "row_ptr must be non-decreasing".to_string(),
            ));
        }
        if col_indices.iter().any(|&c| c >= cols) {
            return Err(KrylovError::InvalidDimensions(
                "Column index out of bounds".to_string(),
            ));
        }

        Ok(CsrMatrix {
            rows,
            cols,
            row_ptr,
            col_indices,
            values,
        })
    }

    /// Creates a matrix from a dense row-major representation, skipping zeros.
    pub fn from_dense(dense: &[Vec<T>]) -> Result<Self, KrylovError> {
        let rows = dense.len();
        let cols = dense.first().map_or(0, |row| row.len());
        let mut row_ptr = Vec::with_capacity(rows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);
        for row in dense {
            if row.len() != cols {
                return Err(KrylovError::InvalidDimensions(
                    "Input dense matrix must be rectangular".to_string(),
                ));
            }
            for (c, &v) in row.iter().enumerate() {
                if v != T::zero() {
                    col_indices.push(c);
                    values.push(v);
                }
            }
            row_ptr.push(values.len());
        }
        Self::from_csr(rows, cols, row_ptr, col_indices, values)
    }

    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Number of entries stored in `row`.
    pub fn row_len(&self, row: usize) -> usize {
        self.row_ptr[row + 1] - self.row_ptr[row]
    }

    /// Length of the longest row.
    pub fn max_row_len(&self) -> usize {
        (0..self.rows).map(|r| self.row_len(r)).max().unwrap_or(0)
    }

    /// Gets the value at a specific row and column, `None` if not stored.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        (self.row_ptr[row]..self.row_ptr[row + 1])
            .find(|&i| self.col_indices[i] == col)
            .map(|i| self.values[i])
    }

    /// Sum of the products of `row`'s entries with `x`.
    #[inline]
    pub fn row_dot(&self, row: usize, x: &[T]) -> T {
        let mut sum = T::zero();
        for i in self.row_ptr[row]..self.row_ptr[row + 1] {
            sum = sum + self.values[i] * x[self.col_indices[i]];
        }
        sum
    }

    /// Reference product `y = A x`, one row at a time.
    pub fn spmv(&self, x: &[T], y: &mut [T]) -> Result<(), KrylovError> {
        if x.len() != self.cols || y.len() != self.rows {
            return Err(KrylovError::InvalidDimensions(format!(
                "spmv with {}x{} matrix needs x of length {} and y of length {} (got {} and {})",
                self.rows,
                self.cols,
                self.cols,
                self.rows,
                x.len(),
                y.len()
            )));
        }
        for (row, out) in y.iter_mut().enumerate() {
            *out = self.row_dot(row, x);
        }
        Ok(())
    }

    /// Main diagonal; entries that are not stored read as zero.
    pub fn diagonal(&self) -> Vec<T> {
        let n = self.rows.min(self.cols);
        (0..n).map(|i| self.get(i, i).unwrap_or_else(T::zero)).collect()
    }

    /// Iterates over the stored entries in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = Triplet<T>> + '_ {
        (0..self.rows).flat_map(move |row| {
            (self.row_ptr[row]..self.row_ptr[row + 1])
                .map(move |i| Triplet::new(row, self.col_indices[i], self.values[i]))
        })
    }
}

impl<T: Scalar> Matrix for CsrMatrix<T> {
    type Value = T;

    fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn nnz(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> CsrMatrix<f64> {
        // [ 1.0, 0.0, 2.0, 0.0 ]
        // [ 0.0, 3.0, 0.0, 4.0 ]
        // [ 0.0, 0.0, 5.0, 0.0 ]
        CsrMatrix::from_csr(
            3,
            4,
            vec![0, 2, 4, 5],
            vec![0, 2, 1, 3, 2],
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
        )
        .unwrap()
    }

    #[test]
    fn test_from_csr_valid() {
        let matrix = example();
        assert_eq!(matrix.dims(), (3, 4));
        assert_eq!(matrix.nnz(), 5);
        assert_eq!(matrix.max_row_len(), 2);
    }

    #[test]
    fn test_from_csr_invalid_row_ptr_len() {
        let matrix = CsrMatrix::<f64>::from_csr(3, 4, vec![0, 1], vec![0], vec![1.0]);
        match matrix {
            Err(KrylovError::InvalidDimensions(msg)) => assert!(msg.contains("row_ptr length")),
            other => panic!("Expected InvalidDimensions error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_csr_decreasing_row_ptr() {
        let matrix = CsrMatrix::<f64>::from_csr(2, 2, vec![0, 2, 1], vec![0], vec![1.0]);
        assert!(matrix.is_err());
        let matrix = CsrMatrix::<f64>::from_csr(3, 2, vec![0, 1, 0, 1], vec![0], vec![1.0]);
        match matrix {
            Err(KrylovError::InvalidFormat(msg)) => assert!(msg.contains("non-decreasing")),
            other => panic!("Expected InvalidFormat error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_csr_invalid_col_index() {
        let matrix = CsrMatrix::<f32>::from_csr(2, 3, vec![0, 1, 2], vec![0, 3], vec![1.0, 2.0]);
        match matrix {
            Err(KrylovError::InvalidDimensions(msg)) => {
                assert!(msg.contains("Column index out of bounds"))
            }
            other => panic!("Expected InvalidDimensions error, got {:?}", other),
        }
    }

    #[test]
    fn test_get_and_diagonal() {
        let matrix = example();
        assert_eq!(matrix.get(0, 2), Some(2.0));
        assert_eq!(matrix.get(1, 0), None);
        assert_eq!(matrix.get(5, 0), None);
        assert_eq!(matrix.diagonal(), vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_from_triplets_sums_duplicates() {
        let triplets = vec![
            Triplet::new(1, 1, 2.0),
            Triplet::new(0, 0, 1.0),
            Triplet::new(1, 1, 3.0),
            Triplet::new(0, 1, -1.0),
        ];
        let matrix = CsrMatrix::from_triplets(2, 2, triplets).unwrap();
        assert_eq!(matrix.nnz(), 3);
        assert_eq!(matrix.row_ptr(), &[0, 2, 3]);
        assert_eq!(matrix.get(1, 1), Some(5.0));
        assert!(CsrMatrix::from_triplets(2, 2, vec![Triplet::new(2, 0, 1.0)]).is_err());
    }

    #[test]
    fn test_from_dense_and_spmv() {
        let dense = vec![vec![4.0, -1.0, 0.0], vec![-1.0, 4.0, -1.0], vec![0.0, -1.0, 4.0]];
        let matrix = CsrMatrix::from_dense(&dense).unwrap();
        assert_eq!(matrix.nnz(), 7);
        let mut y = vec![0.0; 3];
        matrix.spmv(&[1.0, 2.0, 3.0], &mut y).unwrap();
        assert_eq!(y, vec![2.0, 4.0, 10.0]);
        assert!(matrix.spmv(&[1.0], &mut y).is_err());
    }

    #[test]
    fn test_iter_row_major() {
        let entries: Vec<_> = example().iter().map(|t| (t.row, t.col)).collect();
        assert_eq!(entries, vec![(0, 0), (0, 2), (1, 1), (1, 3), (2, 2)]);
    }
}
