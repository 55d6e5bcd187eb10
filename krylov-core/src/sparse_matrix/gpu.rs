//! Device-resident sparse matrices.
//!
//! Every format is uploaded as flat `u32` index and `f32` value buffers.
//! Layouts are packed so that no fused kernel binds more than eight storage
//! buffers.

use super::{SparseFormat, SparseMatrix};
use crate::context::GpuContext;
use crate::error::KrylovError;
use crate::traits::Matrix;
use std::sync::Arc;

/// Marker for an absent carry slot in the COO merge phase.
pub(crate) const COO_NO_ROW: u32 = u32::MAX;

/// Host-side packed arrays for one matrix, ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PackedMatrix {
    Csr {
        row_ptr: Vec<u32>,
        col_indices: Vec<u32>,
        values: Vec<f32>,
    },
    Coo {
        /// Interleaved `(row, col)` pairs.
        coords: Vec<u32>,
        values: Vec<f32>,
        group_bounds: Vec<u32>,
    },
    Ell {
        items_per_row: u32,
        internal_rows: u32,
        coords: Vec<u32>,
        values: Vec<f32>,
    },
    SlicedEll {
        rows_per_block: u32,
        /// `(columns, start)` per block.
        block_info: Vec<u32>,
        row_order: Vec<u32>,
        coords: Vec<u32>,
        values: Vec<f32>,
    },
    Hybrid {
        items_per_row: u32,
        internal_rows: u32,
        /// ELL coordinates followed by the CSR column indices.
        indices: Vec<u32>,
        /// ELL elements followed by the CSR values.
        values: Vec<f32>,
        csr_row_ptr: Vec<u32>,
    },
}

fn to_u32(values: &[usize]) -> Result<Vec<u32>, KrylovError> {
    values
        .iter()
        .map(|&v| {
            u32::try_from(v).map_err(|_| {
                KrylovError::UnsupportedOperation(format!(
                    "Index {} does not fit the 32-bit device index type",
                    v
                ))
            })
        })
        .collect()
}

impl PackedMatrix {
    pub(crate) fn pack(matrix: &SparseMatrix<f32>) -> Result<Self, KrylovError> {
        Ok(match matrix {
            SparseMatrix::Csr(m) => PackedMatrix::Csr {
                row_ptr: to_u32(&m.row_ptr)?,
                col_indices: to_u32(&m.col_indices)?,
                values: m.values.clone(),
            },
            SparseMatrix::Coo(m) => {
                let mut coords = Vec::with_capacity(2 * m.values.len());
                for (&r, &c) in m.row_indices.iter().zip(&m.col_indices) {
                    coords.push(r);
                    coords.push(c);
                }
                PackedMatrix::Coo {
                    coords: to_u32(&coords)?,
                    values: m.values.clone(),
                    group_bounds: to_u32(&m.group_boundaries)?,
                }
            }
            SparseMatrix::Ell(m) => PackedMatrix::Ell {
                items_per_row: m.items_per_row as u32,
                internal_rows: m.internal_rows as u32,
                coords: to_u32(&m.coords)?,
                values: m.elements.clone(),
            },
            SparseMatrix::SlicedEll(m) => {
                let mut block_info = Vec::with_capacity(2 * m.columns_per_block.len());
                for (b, &columns) in m.columns_per_block.iter().enumerate() {
                    block_info.push(columns);
                    block_info.push(m.block_start[b]);
                }
                PackedMatrix::SlicedEll {
                    rows_per_block: m.rows_per_block as u32,
                    block_info: to_u32(&block_info)?,
                    row_order: to_u32(&m.row_order)?,
                    coords: to_u32(&m.coords)?,
                    values: m.elements.clone(),
                }
            }
            SparseMatrix::Hybrid(m) => {
                let mut indices = to_u32(&m.ell.coords)?;
                indices.extend(to_u32(&m.csr.col_indices)?);
                let mut values = m.ell.elements.clone();
                values.extend_from_slice(&m.csr.values);
                PackedMatrix::Hybrid {
                    items_per_row: m.ell.items_per_row as u32,
                    internal_rows: m.ell.internal_rows as u32,
                    indices,
                    values,
                    csr_row_ptr: to_u32(&m.csr.row_ptr)?,
                }
            }
        })
    }
}

/// Buffers of an uploaded matrix, per format.
#[derive(Debug)]
pub(crate) enum GpuStorage {
    Csr {
        row_ptr: wgpu::Buffer,
        col_indices: wgpu::Buffer,
        values: wgpu::Buffer,
    },
    Coo {
        groups: u32,
        coords: wgpu::Buffer,
        values: wgpu::Buffer,
        group_bounds: wgpu::Buffer,
        /// Two `(row, value bits)` slots per group, rewritten by every product.
        carries: wgpu::Buffer,
    },
    Ell {
        items_per_row: u32,
        internal_rows: u32,
        coords: wgpu::Buffer,
        values: wgpu::Buffer,
    },
    SlicedEll {
        rows_per_block: u32,
        blocks: u32,
        block_info: wgpu::Buffer,
        row_order: wgpu::Buffer,
        coords: wgpu::Buffer,
        values: wgpu::Buffer,
    },
    Hybrid {
        items_per_row: u32,
        internal_rows: u32,
        ell_len: u32,
        indices: wgpu::Buffer,
        values: wgpu::Buffer,
        csr_row_ptr: wgpu::Buffer,
    },
}

/// A sparse matrix resident on the GPU in one of the five storage formats.
#[derive(Debug)]
pub struct SparseMatrixGpu {
    rows: usize,
    cols: usize,
    nnz: usize,
    format: SparseFormat,
    pub(crate) storage: GpuStorage,
    pub(crate) context: Arc<GpuContext>,
}

/// Words per element of index arrays the shaders read as `vec2<u32>`.
const PAIR_WORDS: usize = 2;

/// Storage buffers must hold at least one element of the bound array type;
/// default padding up to `min_len` keeps empty arrays bindable.
fn bindable<T: Copy + Default>(data: &[T], min_len: usize) -> Vec<T> {
    let mut padded = data.to_vec();
    if padded.len() < min_len {
        padded.resize(min_len, T::default());
    }
    padded
}

impl SparseMatrixGpu {
    pub(crate) fn upload(
        context: Arc<GpuContext>,
        label: &str,
        matrix: &SparseMatrix<f32>,
    ) -> Result<Self, KrylovError> {
        let (rows, cols) = matrix.dims();
        if u32::try_from(rows.max(cols)).is_err() {
            return Err(KrylovError::UnsupportedOperation(format!(
                "Matrix '{}' with {} rows is too large for 32-bit device indices",
                label, rows
            )));
        }
        let storage_usage = wgpu::BufferUsages::STORAGE;
        let index_buffer = |suffix: &str, data: &[u32], min_len: usize| {
            context.create_gpu_buffer_with_data(
                &format!("{} {}", label, suffix),
                bytemuck::cast_slice(&bindable(data, min_len)),
                storage_usage,
            )
        };
        let value_buffer = |suffix: &str, data: &[f32]| {
            context.create_gpu_buffer_with_data(
                &format!("{} {}", label, suffix),
                bytemuck::cast_slice(&bindable(data, 1)),
                storage_usage,
            )
        };

        let storage = match PackedMatrix::pack(matrix)? {
            PackedMatrix::Csr {
                row_ptr,
                col_indices,
                values,
            } => GpuStorage::Csr {
                row_ptr: index_buffer("row_ptr", &row_ptr, 1),
                col_indices: index_buffer("col_indices", &col_indices, 1),
                values: value_buffer("values", &values),
            },
            PackedMatrix::Coo {
                coords,
                values,
                group_bounds,
            } => {
                let groups = group_bounds.len().saturating_sub(1) as u32;
                let carries = context.create_empty_buffer(
                    &format!("{} carries", label),
                    (4 * groups.max(1) as usize * std::mem::size_of::<u32>()) as u64,
                    storage_usage,
                );
                GpuStorage::Coo {
                    groups,
                    coords: index_buffer("coords", &coords, PAIR_WORDS),
                    values: value_buffer("values", &values),
                    group_bounds: index_buffer("group_bounds", &group_bounds, 1),
                    carries,
                }
            }
            PackedMatrix::Ell {
                items_per_row,
                internal_rows,
                coords,
                values,
            } => GpuStorage::Ell {
                items_per_row,
                internal_rows,
                coords: index_buffer("coords", &coords, 1),
                values: value_buffer("values", &values),
            },
            PackedMatrix::SlicedEll {
                rows_per_block,
                block_info,
                row_order,
                coords,
                values,
            } => GpuStorage::SlicedEll {
                rows_per_block,
                blocks: (block_info.len() / 2) as u32,
                block_info: index_buffer("block_info", &block_info, PAIR_WORDS),
                row_order: index_buffer("row_order", &row_order, 1),
                coords: index_buffer("coords", &coords, 1),
                values: value_buffer("values", &values),
            },
            PackedMatrix::Hybrid {
                items_per_row,
                internal_rows,
                indices,
                values,
                csr_row_ptr,
            } => GpuStorage::Hybrid {
                items_per_row,
                internal_rows,
                ell_len: items_per_row * internal_rows,
                indices: index_buffer("indices", &indices, 1),
                values: value_buffer("values", &values),
                csr_row_ptr: index_buffer("csr_row_ptr", &csr_row_ptr, 1),
            },
        };

        log::debug!(
            "Uploaded {} matrix '{}' ({}x{}, nnz {})",
            matrix.format().name(),
            label,
            rows,
            cols,
            matrix.nnz()
        );
        Ok(Self {
            rows,
            cols,
            nnz: matrix.nnz(),
            format: matrix.format(),
            storage,
            context,
        })
    }

    pub fn format(&self) -> SparseFormat {
        self.format
    }
}

impl Matrix for SparseMatrixGpu {
    type Value = f32;

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
    use crate::sparse_matrix::{CsrMatrix, Triplet};

    fn sample() -> CsrMatrix<f32> {
        CsrMatrix::from_triplets(
            3,
            3,
            vec![
                Triplet::new(0, 0, 1.0),
                Triplet::new(0, 2, 2.0),
                Triplet::new(1, 1, 3.0),
                Triplet::new(2, 0, 4.0),
                Triplet::new(2, 1, 5.0),
                Triplet::new(2, 2, 6.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn coo_coordinates_are_interleaved() {
        let m = SparseMatrix::from_csr(sample(), SparseFormat::Coo { groups: 2 }).unwrap();
        match PackedMatrix::pack(&m).unwrap() {
            PackedMatrix::Coo {
                coords,
                group_bounds,
                ..
            } => {
                assert_eq!(coords, vec![0, 0, 0, 2, 1, 1, 2, 0, 2, 1, 2, 2]);
                assert_eq!(group_bounds, vec![0, 3, 6]);
            }
            other => panic!("unexpected packing {:?}", other),
        }
    }

    #[test]
    fn empty_coo_coordinates_are_padded_to_one_pair() {
        let m = SparseMatrix::from_csr(CsrMatrix::<f32>::new(3, 3), SparseFormat::Coo { groups: 2 })
            .unwrap();
        match PackedMatrix::pack(&m).unwrap() {
            PackedMatrix::Coo { coords, values, .. } => {
                assert!(coords.is_empty());
                assert_eq!(bindable(&coords, PAIR_WORDS), vec![0, 0]);
                assert_eq!(bindable(&values, 1), vec![0.0]);
            }
            other => panic!("unexpected packing {:?}", other),
        }
        assert_eq!(bindable(&[7u32, 8, 9], PAIR_WORDS), vec![7, 8, 9]);
    }

    #[test]
    fn hybrid_concatenates_ell_and_csr_parts() {
        let m = SparseMatrix::Hybrid(
            crate::sparse_matrix::HybMatrix::from_csr_with_width(&sample(), 1).unwrap(),
        );
        match PackedMatrix::pack(&m).unwrap() {
            PackedMatrix::Hybrid {
                items_per_row,
                internal_rows,
                indices,
                values,
                csr_row_ptr,
            } => {
                let ell_len = (items_per_row * internal_rows) as usize;
                assert_eq!(indices.len(), ell_len + 3);
                assert_eq!(&indices[ell_len..], &[2, 1, 2]);
                assert_eq!(&values[ell_len..], &[2.0, 5.0, 6.0]);
                assert_eq!(csr_row_ptr, vec![0, 1, 1, 3]);
            }
            other => panic!("unexpected packing {:?}", other),
        }
    }

    #[test]
    fn sliced_ell_block_info_pairs_width_and_start() {
        let m = SparseMatrix::from_csr(
            sample(),
            SparseFormat::SlicedEll {
                rows_per_block: 2,
                sigma: 1,
            },
        )
        .unwrap();
        match PackedMatrix::pack(&m).unwrap() {
            PackedMatrix::SlicedEll {
                block_info,
                row_order,
                ..
            } => {
                assert_eq!(block_info, vec![2, 0, 3, 4]);
                assert_eq!(row_order, vec![0, 1, 2]);
            }
            other => panic!("unexpected packing {:?}", other),
        }
    }
}
