use super::{
    check_len, elementwise_groups, launch, submit, Pass, GMRES_GS_STAGE1, GMRES_GS_STAGE2,
    GMRES_NORMALIZE_VK, GMRES_UPDATE_RESULT,
};
use crate::backend::{check_basis_index, check_update_count};
use crate::context::GpuContext;
use crate::error::KrylovError;
use crate::launch::KrylovBasis;
use crate::vector::GpuVector;
use bytemuck::{Pod, Zeroable};

/// Basis vectors handled by one Gram-Schmidt launch.
pub(crate) const GRAM_SCHMIDT_BATCH: usize = 7;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct NormalizeParams {
    size: u32,
    rows_per_group: u32,
    chunk_size: u32,
    vk_offset: u32,
    r_offset: u32,
    chunk_offset: u32,
    _padding: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GramSchmidtParams {
    size: u32,
    rows_per_group: u32,
    chunk_size: u32,
    internal_size: u32,
    k: u32,
    k_base: u32,
    batch: u32,
    krylov_dim: u32,
    write_norm: u32,
    _padding: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UpdateResultParams {
    size: u32,
    internal_size: u32,
    k: u32,
    _padding: u32,
}

/// Batches `(k_base, batch)` covering basis vectors `0..k`.
fn batches(k: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..k)
        .step_by(GRAM_SCHMIDT_BATCH)
        .map(move |base| (base, GRAM_SCHMIDT_BATCH.min(k - base)))
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn internal_normalize_vk(
    context: &GpuContext,
    basis: &mut KrylovBasis<GpuVector>,
    k: usize,
    residual: &GpuVector,
    r_matrix: &mut GpuVector,
    r_offset: usize,
    inner_prod_buffer: &GpuVector,
    r_dot_vk: &mut GpuVector,
    chunk_size: usize,
    chunk_offset: usize,
    work_groups: usize,
) -> Result<(), KrylovError> {
    check_basis_index(basis, k)?;
    check_len("residual", residual.size(), basis.size)?;
    check_len("R", r_matrix.size(), r_offset + 1)?;
    check_len("inner product buffer", inner_prod_buffer.size(), 2 * chunk_size)?;
    check_len("<r,v_k> buffer", r_dot_vk.size(), chunk_offset + chunk_size)?;
    let params = NormalizeParams {
        size: basis.size as u32,
        rows_per_group: basis.size.div_ceil(work_groups).max(1) as u32,
        chunk_size: chunk_size as u32,
        vk_offset: basis.offset(k) as u32,
        r_offset: r_offset as u32,
        chunk_offset: chunk_offset as u32,
        _padding: [0; 2],
    };
    let buffers = vec![
        basis.vectors.inner(),
        residual.inner(),
        r_matrix.inner(),
        inner_prod_buffer.inner(),
        r_dot_vk.inner(),
    ];
    launch(context, &GMRES_NORMALIZE_VK, &params, buffers, work_groups).await
}

pub(crate) async fn internal_gram_schmidt_stage1(
    context: &GpuContext,
    basis: &KrylovBasis<GpuVector>,
    k: usize,
    vi_in_vk: &mut GpuVector,
    chunk_size: usize,
    work_groups: usize,
) -> Result<(), KrylovError> {
    check_basis_index(basis, k)?;
    check_len("<v_i,v_k> buffer", vi_in_vk.size(), k * chunk_size)?;
    let mut passes = Vec::new();
    for (k_base, batch) in batches(k) {
        let params = GramSchmidtParams {
            size: basis.size as u32,
            rows_per_group: basis.size.div_ceil(work_groups).max(1) as u32,
            chunk_size: chunk_size as u32,
            internal_size: basis.internal_size as u32,
            k: k as u32,
            k_base: k_base as u32,
            batch: batch as u32,
            krylov_dim: basis.krylov_dim as u32,
            write_norm: 0,
            _padding: [0; 3],
        };
        let buffers = vec![basis.vectors.inner(), vi_in_vk.inner()];
        passes.push(Pass::new(context, &GMRES_GS_STAGE1, &params, buffers, work_groups).await?);
    }
    submit(context, "gmres_gs_stage1", &[], &passes).await
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn internal_gram_schmidt_stage2(
    context: &GpuContext,
    basis: &mut KrylovBasis<GpuVector>,
    k: usize,
    vi_in_vk: &GpuVector,
    r_matrix: &mut GpuVector,
    inner_prod_buffer: &mut GpuVector,
    chunk_size: usize,
    work_groups: usize,
) -> Result<(), KrylovError> {
    check_basis_index(basis, k)?;
    check_len("<v_i,v_k> buffer", vi_in_vk.size(), k * chunk_size)?;
    check_len("R", r_matrix.size(), basis.krylov_dim * basis.krylov_dim)?;
    check_len("inner product buffer", inner_prod_buffer.size(), 2 * chunk_size)?;
    let mut passes = Vec::new();
    for (k_base, batch) in batches(k) {
        let params = GramSchmidtParams {
            size: basis.size as u32,
            rows_per_group: basis.size.div_ceil(work_groups).max(1) as u32,
            chunk_size: chunk_size as u32,
            internal_size: basis.internal_size as u32,
            k: k as u32,
            k_base: k_base as u32,
            batch: batch as u32,
            krylov_dim: basis.krylov_dim as u32,
            write_norm: (k_base + batch == k) as u32,
            _padding: [0; 3],
        };
        let buffers = vec![
            basis.vectors.inner(),
            vi_in_vk.inner(),
            r_matrix.inner(),
            inner_prod_buffer.inner(),
        ];
        passes.push(Pass::new(context, &GMRES_GS_STAGE2, &params, buffers, work_groups).await?);
    }
    submit(context, "gmres_gs_stage2", &[], &passes).await
}

pub(crate) async fn internal_update_result(
    context: &GpuContext,
    result: &mut GpuVector,
    residual: &GpuVector,
    basis: &KrylovBasis<GpuVector>,
    coefficients: &GpuVector,
    k: usize,
) -> Result<(), KrylovError> {
    check_update_count(basis, k)?;
    check_len("result", result.size(), basis.size)?;
    check_len("residual", residual.size(), basis.size)?;
    check_len("coefficients", coefficients.size(), k)?;
    let params = UpdateResultParams {
        size: basis.size as u32,
        internal_size: basis.internal_size as u32,
        k: k as u32,
        _padding: 0,
    };
    let buffers = vec![
        result.inner(),
        residual.inner(),
        basis.vectors.inner(),
        coefficients.inner(),
    ];
    let groups = elementwise_groups(basis.size);
    launch(context, &GMRES_UPDATE_RESULT, &params, buffers, groups).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_all_previous_vectors() {
        assert_eq!(batches(0).count(), 0);
        assert_eq!(batches(7).collect::<Vec<_>>(), vec![(0, 7)]);
        assert_eq!(batches(16).collect::<Vec<_>>(), vec![(0, 7), (7, 7), (14, 2)]);
    }
}
