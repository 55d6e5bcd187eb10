use super::csr::CsrMatrix;
use crate::error::KrylovError;
use crate::traits::{Matrix, Scalar};

/// Default number of element groups, matching the COO launch width.
pub const DEFAULT_COO_GROUPS: usize = 64;

/// Coordinate format with entries sorted row-major and split into groups.
///
/// Group `g` owns elements `group_boundaries[g]..group_boundaries[g + 1]`.
/// Boundaries are chosen by element count, so a row may span several groups;
/// the product kernels merge such rows in a second phase.
#[derive(Debug, Clone, PartialEq)]
pub struct CooMatrix<T> {
    rows: usize,
    cols: usize,
    pub(crate) row_indices: Vec<usize>,
    pub(crate) col_indices: Vec<usize>,
    pub(crate) values: Vec<T>,
    pub(crate) group_boundaries: Vec<usize>,
}

/// Outcome of scanning the elements of one group.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct GroupScan<T> {
    /// Rows that begin and end inside the group, with their final values.
    pub(crate) closed: Vec<(usize, T)>,
    /// Partial sums of rows shared with a neighbouring group (at most two).
    pub(crate) open: Vec<(usize, T)>,
}

/// A row assembled from the open segments of one or more groups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct MergedRow<T> {
    pub(crate) row: usize,
    pub(crate) value: T,
    /// Last group holding a piece of the row; its partial reductions receive the row.
    pub(crate) owner: usize,
}

impl<T: Scalar> CooMatrix<T> {
    /// Converts a CSR matrix, splitting its entries into `groups` groups of
    /// (nearly) equal size.
    pub fn from_csr(csr: &CsrMatrix<T>, groups: usize) -> Result<Self, KrylovError> {
        if groups == 0 {
            return Err(KrylovError::InvalidFormat(
                "COO matrix needs at least one group".to_string(),
            ));
        }
        let nnz = csr.nnz();
        let mut row_indices = Vec::with_capacity(nnz);
        for row in 0..csr.rows() {
            row_indices.extend(std::iter::repeat(row).take(csr.row_len(row)));
        }
        let group_boundaries = (0..=groups).map(|g| g * nnz / groups).collect();
        Self::from_parts(
            csr.rows(),
            csr.cols(),
            row_indices,
            csr.col_indices.clone(),
            csr.values.clone(),
            group_boundaries,
        )
    }

    /// Builds a matrix from raw parts. Entries must be sorted by `(row, col)`
    /// and the boundaries must be non-decreasing from 0 to `nnz`.
    pub fn from_parts(
        rows: usize,
        cols: usize,
        row_indices: Vec<usize>,
        col_indices: Vec<usize>,
        values: Vec<T>,
        group_boundaries: Vec<usize>,
    ) -> Result<Self, KrylovError> {
        let nnz = values.len();
        if row_indices.len() != nnz || col_indices.len() != nnz {
            return Err(KrylovError::InvalidDimensions(
                "COO index and value arrays must have the same length".to_string(),
            ));
        }
        if row_indices.iter().any(|&r| r >= rows) || col_indices.iter().any(|&c| c >= cols) {
            return Err(KrylovError::InvalidDimensions(
                "COO index out of bounds".to_string(),
            ));
        }
        let sorted = row_indices
            .windows(2)
            .zip(col_indices.windows(2))
            .all(|(r, c)| (r[0], c[0]) < (r[1], c[1]));
        if !sorted {
            return Err(KrylovError::InvalidFormat(
                "COO entries must be sorted row-major without duplicates".to_string(),
            ));
        }
        if group_boundaries.len() < 2
            || group_boundaries.first() != Some(&0)
            || group_boundaries.last() != Some(&nnz)
            || group_boundaries.windows(2).any(|w| w[0] > w[1])
        {
            return Err(KrylovError::InvalidFormat(
                "COO group boundaries must be non-decreasing from 0 to nnz".to_string(),
            ));
        }
        Ok(CooMatrix {
            rows,
            cols,
            row_indices,
            col_indices,
            values,
            group_boundaries,
        })
    }

    pub fn groups(&self) -> usize {
        self.group_boundaries.len() - 1
    }

    pub fn group_boundaries(&self) -> &[usize] {
        &self.group_boundaries
    }

    pub fn row_indices(&self) -> &[usize] {
        &self.row_indices
    }

    pub fn col_indices(&self) -> &[usize] {
        &self.col_indices
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    /// Segmented reduction of one group's products with `x`.
    ///
    /// A row's sum is emitted when the next element's row differs or the
    /// element is the last of the group. Sums of rows continuing from the
    /// previous group or into the next one are emitted as open.
    pub(crate) fn scan_group(&self, group: usize, x: &[T]) -> GroupScan<T> {
        let start = self.group_boundaries[group];
        let end = self.group_boundaries[group + 1];
        let mut scan = GroupScan {
            closed: Vec::new(),
            open: Vec::new(),
        };
        if start == end {
            return scan;
        }
        let nnz = self.values.len();
        let first_row = self.row_indices[start];
        let open_left = start > 0 && self.row_indices[start - 1] == first_row;
        let open_right = end < nnz && self.row_indices[end] == self.row_indices[end - 1];

        let mut sum = T::zero();
        for idx in start..end {
            let row = self.row_indices[idx];
            sum = sum + self.values[idx] * x[self.col_indices[idx]];
            let last_of_group = idx + 1 == end;
            if last_of_group || self.row_indices[idx + 1] != row {
                let continues = (open_left && row == first_row) || (open_right && last_of_group);
                if continues {
                    scan.open.push((row, sum));
                } else {
                    scan.closed.push((row, sum));
                }
                sum = T::zero();
            }
        }
        scan
    }
}

/// Second phase of the COO product: joins the open segments of adjacent
/// groups that share a boundary row.
pub(crate) fn merge_open_segments<T: Scalar>(scans: &[GroupScan<T>]) -> Vec<MergedRow<T>> {
    let mut merged: Vec<MergedRow<T>> = Vec::new();
    for (group, scan) in scans.iter().enumerate() {
        for &(row, value) in &scan.open {
            match merged.last_mut() {
                Some(last) if last.row == row => {
                    last.value = last.value + value;
                    last.owner = group;
                }
                _ => merged.push(MergedRow {
                    row,
                    value,
                    owner: group,
                }),
            }
        }
    }
    merged
}

impl<T: Scalar> Matrix for CooMatrix<T> {
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

    /// One long row (row 1) spread across three groups.
    fn long_row_matrix() -> CooMatrix<f64> {
        CooMatrix::from_parts(
            3,
            6,
            vec![0, 1, 1, 1, 1, 1, 1, 2],
            vec![0, 0, 1, 2, 3, 4, 5, 5],
            vec![1.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0],
            vec![0, 2, 4, 6, 8],
        )
        .unwrap()
    }

    #[test]
    fn group_scan_marks_open_segments() {
        let coo = long_row_matrix();
        let x = vec![1.0; 6];
        let first = coo.scan_group(0, &x);
        assert_eq!(first.closed, vec![(0, 1.0)]);
        assert_eq!(first.open, vec![(1, 1.0)]);
        let middle = coo.scan_group(1, &x);
        assert!(middle.closed.is_empty());
        assert_eq!(middle.open, vec![(1, 5.0)]);
        let last = coo.scan_group(3, &x);
        assert_eq!(last.closed, vec![(2, 7.0)]);
        assert!(last.open.is_empty());
    }

    #[test]
    fn merge_joins_rows_across_groups() {
        let coo = long_row_matrix();
        let x = vec![1.0; 6];
        let scans: Vec<_> = (0..coo.groups()).map(|g| coo.scan_group(g, &x)).collect();
        let merged = merge_open_segments(&scans);
        assert_eq!(
            merged,
            vec![MergedRow {
                row: 1,
                value: 21.0,
                owner: 3
            }]
        );
    }

    #[test]
    fn from_csr_splits_evenly() {
        let csr = CsrMatrix::<f64>::identity(10);
        let coo = CooMatrix::from_csr(&csr, 4).unwrap();
        assert_eq!(coo.group_boundaries(), &[0, 2, 5, 7, 10]);
        assert_eq!(coo.row_indices(), (0..10).collect::<Vec<_>>().as_slice());
        assert!(CooMatrix::from_csr(&csr, 0).is_err());
    }

    #[test]
    fn from_parts_rejects_unsorted_entries() {
        let result = CooMatrix::<f64>::from_parts(
            2,
            2,
            vec![1, 0],
            vec![0, 0],
            vec![1.0, 2.0],
            vec![0, 2],
        );
        assert!(matches!(result, Err(KrylovError::InvalidFormat(_))));
    }
}
