use super::{check_len, submit, Clear, Pass, COO_MERGE, COO_PROD, CSR_PROD, ELL_PROD, HYB_PROD, SLICED_ELL_PROD};
use crate::context::GpuContext;
use crate::error::KrylovError;
use crate::sparse_matrix::gpu::GpuStorage;
use crate::sparse_matrix::SparseMatrixGpu;
use crate::traits::Matrix;
use crate::vector::GpuVector;
use bytemuck::{Pod, Zeroable};

/// Parameter block shared by all fused product kernels. The meaning of
/// `extent`, `per_group` and `format` depends on the storage format (see
/// each shader's `Params`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ProdParams {
    extent: u32,
    per_group: u32,
    chunk_size: u32,
    r0_offset: u32,
    with_r0: u32,
    format: [u32; 3],
}

/// Fused product `Ap = A p`.
///
/// Partials of `<Ap,Ap>` go to chunk 1 and `<p,Ap>` to chunk 2 of
/// `inner_prod_buffer`; with `r0star`, partials of `<r0star,Ap>` are written
/// at `r0_offset`. One partial per work group.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn internal_prod(
    context: &GpuContext,
    a: &SparseMatrixGpu,
    p: &GpuVector,
    ap: &mut GpuVector,
    r0star: Option<&GpuVector>,
    inner_prod_buffer: &mut GpuVector,
    chunk_size: usize,
    r0_offset: usize,
    work_groups: usize,
) -> Result<(), KrylovError> {
    let (rows, cols) = a.dims();
    check_len("p", p.size(), cols)?;
    check_len("Ap", ap.size(), rows)?;
    check_len("inner product buffer", inner_prod_buffer.size(), 3 * chunk_size)?;
    if let Some(r0) = r0star {
        check_len("r0star", r0.size(), rows)?;
        check_len("inner product buffer", inner_prod_buffer.size(), r0_offset + chunk_size)?;
    }

    // Without r0star, p is bound in its place; the shader never reads it.
    let r0_buffer = r0star.unwrap_or(p).inner();
    let with_r0 = r0star.is_some() as u32;
    let rows_per_group = rows.div_ceil(work_groups).max(1);
    let mut params = ProdParams {
        extent: rows as u32,
        per_group: rows_per_group as u32,
        chunk_size: chunk_size as u32,
        r0_offset: r0_offset as u32,
        with_r0,
        format: [0; 3],
    };

    let (pass, merge, clears) = match &a.storage {
        GpuStorage::Csr {
            row_ptr,
            col_indices,
            values,
        } => {
            let buffers = vec![
                row_ptr,
                col_indices,
                values,
                p.inner(),
                r0_buffer,
                ap.inner(),
                inner_prod_buffer.inner(),
            ];
            let pass = Pass::new(context, &CSR_PROD, &params, buffers, work_groups).await?;
            (pass, None, Vec::new())
        }
        GpuStorage::Ell {
            items_per_row,
            internal_rows,
            coords,
            values,
        } => {
            params.format = [*items_per_row, *internal_rows, 0];
            let buffers = vec![
                coords,
                values,
                p.inner(),
                r0_buffer,
                ap.inner(),
                inner_prod_buffer.inner(),
            ];
            let pass = Pass::new(context, &ELL_PROD, &params, buffers, work_groups).await?;
            (pass, None, Vec::new())
        }
        GpuStorage::SlicedEll {
            rows_per_block,
            blocks,
            block_info,
            row_order,
            coords,
            values,
        } => {
            params.per_group = (*blocks as usize).div_ceil(work_groups).max(1) as u32;
            params.format = [*rows_per_block, *blocks, 0];
            let buffers = vec![
                block_info,
                row_order,
                coords,
                values,
                p.inner(),
                r0_buffer,
                ap.inner(),
                inner_prod_buffer.inner(),
            ];
            let pass = Pass::new(context, &SLICED_ELL_PROD, &params, buffers, work_groups).await?;
            (pass, None, Vec::new())
        }
        GpuStorage::Hybrid {
            items_per_row,
            internal_rows,
            ell_len,
            indices,
            values,
            csr_row_ptr,
        } => {
            params.format = [*items_per_row, *internal_rows, *ell_len];
            let buffers = vec![
                indices,
                values,
                csr_row_ptr,
                p.inner(),
                r0_buffer,
                ap.inner(),
                inner_prod_buffer.inner(),
            ];
            let pass = Pass::new(context, &HYB_PROD, &params, buffers, work_groups).await?;
            (pass, None, Vec::new())
        }
        GpuStorage::Coo {
            groups,
            coords,
            values,
            group_bounds,
            carries,
        } => {
            let groups = *groups as usize;
            if groups > chunk_size {
                return Err(KrylovError::UnsupportedOperation(format!(
                    "COO matrix with {} groups cannot report into chunks of {}",
                    groups, chunk_size
                )));
            }
            params.extent = a.nnz() as u32;
            params.per_group = groups as u32;
            let buffers = vec![
                coords,
                values,
                group_bounds,
                p.inner(),
                r0_buffer,
                ap.inner(),
                inner_prod_buffer.inner(),
                carries,
            ];
            let pass = Pass::new(context, &COO_PROD, &params, buffers, groups).await?;
            let merge_buffers = vec![
                carries,
                p.inner(),
                r0_buffer,
                ap.inner(),
                inner_prod_buffer.inner(),
            ];
            let merge = Pass::new(context, &COO_MERGE, &params, merge_buffers, 1).await?;

            // Rows without entries and idle group slots must read as zero.
            let mut clears = vec![
                Clear {
                    buffer: ap.inner(),
                    offset_elems: 0,
                    len_elems: None,
                },
                Clear {
                    buffer: inner_prod_buffer.inner(),
                    offset_elems: chunk_size,
                    len_elems: Some(2 * chunk_size),
                },
            ];
            if r0star.is_some() {
                clears.push(Clear {
                    buffer: inner_prod_buffer.inner(),
                    offset_elems: r0_offset,
                    len_elems: Some(chunk_size),
                });
            }
            (pass, Some(merge), clears)
        }
    };

    let mut passes = vec![pass];
    passes.extend(merge);
    log::trace!("GPU prod: {} rows, format {}", rows, a.format().name());
    submit(context, "prod", &clears, &passes).await
}
