//! Sparse storage formats.
//!
//! [`CsrMatrix`] is the assembly format; the other four are built from it.
//! [`SparseMatrix`] wraps any of them so that solver drivers and backends
//! dispatch on the format with a single `match`.

mod coo;
mod csr;
mod ell;
pub mod gpu;
mod hybrid;
mod sliced_ell;

pub(crate) use coo::{merge_open_segments, GroupScan, MergedRow};
pub use coo::{CooMatrix, DEFAULT_COO_GROUPS};
pub use csr::{CsrMatrix, Triplet};
pub use ell::{EllMatrix, ELL_ROW_ALIGNMENT};
pub use gpu::SparseMatrixGpu;
pub use hybrid::{HybMatrix, HYB_ELL_ROW_FRACTION};
pub use sliced_ell::{SlicedEllMatrix, DEFAULT_ROWS_PER_BLOCK};

use crate::error::KrylovError;
use crate::traits::{Matrix, Scalar};
use serde::{Deserialize, Serialize};

/// Storage format selector used when converting from CSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SparseFormat {
    Csr,
    /// Coordinate format split into `groups` element groups.
    Coo { groups: usize },
    Ell,
    /// SELL-C-σ with block height `rows_per_block` and sorting window `sigma`.
    SlicedEll { rows_per_block: usize, sigma: usize },
    Hybrid,
}

impl SparseFormat {
    /// Every format with its default parameters.
    pub const ALL: [SparseFormat; 5] = [
        SparseFormat::Csr,
        SparseFormat::Coo {
            groups: DEFAULT_COO_GROUPS,
        },
        SparseFormat::Ell,
        SparseFormat::SlicedEll {
            rows_per_block: DEFAULT_ROWS_PER_BLOCK,
            sigma: 1,
        },
        SparseFormat::Hybrid,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SparseFormat::Csr => "csr",
            SparseFormat::Coo { .. } => "coo",
            SparseFormat::Ell => "ell",
            SparseFormat::SlicedEll { .. } => "sell-c-sigma",
            SparseFormat::Hybrid => "hyb",
        }
    }
}

/// A sparse matrix in one of the five supported storage formats.
#[derive(Debug, Clone, PartialEq)]
pub enum SparseMatrix<T> {
    Csr(CsrMatrix<T>),
    Coo(CooMatrix<T>),
    Ell(EllMatrix<T>),
    SlicedEll(SlicedEllMatrix<T>),
    Hybrid(HybMatrix<T>),
}

impl<T: Scalar> SparseMatrix<T> {
    /// Converts a CSR matrix into the requested storage format.
    pub fn from_csr(csr: CsrMatrix<T>, format: SparseFormat) -> Result<Self, KrylovError> {
        Ok(match format {
            SparseFormat::Csr => SparseMatrix::Csr(csr),
            SparseFormat::Coo { groups } => SparseMatrix::Coo(CooMatrix::from_csr(&csr, groups)?),
            SparseFormat::Ell => SparseMatrix::Ell(EllMatrix::from_csr(&csr)),
            SparseFormat::SlicedEll {
                rows_per_block,
                sigma,
            } => SparseMatrix::SlicedEll(SlicedEllMatrix::from_csr(&csr, rows_per_block, sigma)?),
            SparseFormat::Hybrid => SparseMatrix::Hybrid(HybMatrix::from_csr(&csr)?),
        })
    }

    pub fn format(&self) -> SparseFormat {
        match self {
            SparseMatrix::Csr(_) => SparseFormat::Csr,
            SparseMatrix::Coo(m) => SparseFormat::Coo { groups: m.groups() },
            SparseMatrix::Ell(_) => SparseFormat::Ell,
            SparseMatrix::SlicedEll(m) => SparseFormat::SlicedEll {
                rows_per_block: m.rows_per_block(),
                sigma: m.sigma(),
            },
            SparseMatrix::Hybrid(_) => SparseFormat::Hybrid,
        }
    }

    /// Product of `row` with `x` for the row-addressable formats; `None` for COO.
    #[inline]
    pub(crate) fn row_dot(&self, row: usize, x: &[T]) -> Option<T> {
        match self {
            SparseMatrix::Csr(m) => Some(m.row_dot(row, x)),
            SparseMatrix::Coo(_) => None,
            SparseMatrix::Ell(m) => Some(m.row_dot(row, x)),
            SparseMatrix::SlicedEll(m) => Some(m.row_dot(row, x)),
            SparseMatrix::Hybrid(m) => Some(m.row_dot(row, x)),
        }
    }

    /// Main diagonal; missing entries read as zero.
    pub fn diagonal(&self) -> Vec<T> {
        let (rows, cols) = self.dims();
        let n = rows.min(cols);
        let mut diag = vec![T::zero(); n];
        match self {
            SparseMatrix::Csr(m) => return m.diagonal(),
            SparseMatrix::Coo(m) => {
                for ((&r, &c), &v) in m.row_indices.iter().zip(&m.col_indices).zip(&m.values) {
                    if r == c {
                        diag[r] = v;
                    }
                }
            }
            SparseMatrix::Ell(m) => {
                for (i, d) in diag.iter_mut().enumerate() {
                    *d = m.get(i, i).unwrap_or_else(T::zero);
                }
            }
            SparseMatrix::SlicedEll(m) => {
                for (slot, &row) in m.row_order.iter().enumerate() {
                    let block = slot / m.rows_per_block;
                    let base = m.block_start[block] + slot % m.rows_per_block;
                    for c in 0..m.columns_per_block[block] {
                        let offset = base + c * m.rows_per_block;
                        if row < n && m.coords[offset] == row && m.elements[offset] != T::zero() {
                            diag[row] = m.elements[offset];
                        }
                    }
                }
            }
            SparseMatrix::Hybrid(m) => {
                for (i, d) in diag.iter_mut().enumerate() {
                    *d = m.ell.get(i, i).or_else(|| m.csr.get(i, i)).unwrap_or_else(T::zero);
                }
            }
        }
        diag
    }
}

impl<T: Scalar> Matrix for SparseMatrix<T> {
    type Value = T;

    fn dims(&self) -> (usize, usize) {
        match self {
            SparseMatrix::Csr(m) => m.dims(),
            SparseMatrix::Coo(m) => m.dims(),
            SparseMatrix::Ell(m) => m.dims(),
            SparseMatrix::SlicedEll(m) => m.dims(),
            SparseMatrix::Hybrid(m) => m.dims(),
        }
    }

    fn nnz(&self) -> usize {
        match self {
            SparseMatrix::Csr(m) => m.nnz(),
            SparseMatrix::Coo(m) => m.nnz(),
            SparseMatrix::Ell(m) => m.nnz(),
            SparseMatrix::SlicedEll(m) => m.nnz(),
            SparseMatrix::Hybrid(m) => m.nnz(),
        }
    }
}

impl<T> From<CsrMatrix<T>> for SparseMatrix<T> {
    fn from(csr: CsrMatrix<T>) -> Self {
        SparseMatrix::Csr(csr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tridiagonal(n: usize) -> CsrMatrix<f64> {
        let mut triplets = Vec::new();
        for i in 0..n {
            triplets.push(Triplet::new(i, i, 2.0 + i as f64));
            if i > 0 {
                triplets.push(Triplet::new(i, i - 1, -1.0));
            }
            if i + 1 < n {
                triplets.push(Triplet::new(i, i + 1, -1.0));
            }
        }
        CsrMatrix::from_triplets(n, n, triplets).unwrap()
    }

    #[test]
    fn conversions_preserve_shape_and_diagonal() {
        let csr = tridiagonal(7);
        let expected = csr.diagonal();
        for format in [
            SparseFormat::Csr,
            SparseFormat::Coo { groups: 3 },
            SparseFormat::Ell,
            SparseFormat::SlicedEll {
                rows_per_block: 2,
                sigma: 4,
            },
            SparseFormat::Hybrid,
        ] {
            let matrix = SparseMatrix::from_csr(csr.clone(), format).unwrap();
            assert_eq!(matrix.dims(), (7, 7), "{}", format.name());
            assert_eq!(matrix.nnz(), csr.nnz(), "{}", format.name());
            assert_eq!(matrix.diagonal(), expected, "{}", format.name());
        }
    }

    #[test]
    fn format_round_trips_through_selector() {
        let matrix =
            SparseMatrix::from_csr(tridiagonal(4), SparseFormat::Coo { groups: 2 }).unwrap();
        assert_eq!(matrix.format(), SparseFormat::Coo { groups: 2 });
        assert_eq!(matrix.format().name(), "coo");
    }
}
