use super::{check_len, launch, BICGSTAB_UPDATE_S, BICGSTAB_VECTOR_UPDATE, CG_VECTOR_UPDATE};
use crate::context::GpuContext;
use crate::error::KrylovError;
use crate::vector::GpuVector;
use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CgUpdateParams {
    alpha: f32,
    beta: f32,
    size: u32,
    rows_per_group: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct UpdateSParams {
    size: u32,
    rows_per_group: u32,
    chunk_size: u32,
    s_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BicgstabUpdateParams {
    alpha: f32,
    omega: f32,
    beta: f32,
    size: u32,
    rows_per_group: u32,
    _padding: [u32; 3],
}

fn check_sizes(kernel: &str, size: usize, vectors: &[(&str, &GpuVector)]) -> Result<(), KrylovError> {
    for (name, v) in vectors {
        if v.size() != size {
            return Err(KrylovError::InvalidDimensions(format!(
                "{}: '{}' has {} elements, expected {}",
                kernel,
                name,
                v.size(),
                size
            )));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn internal_cg_update(
    context: &GpuContext,
    result: &mut GpuVector,
    alpha: f32,
    p: &mut GpuVector,
    r: &mut GpuVector,
    ap: &GpuVector,
    beta: f32,
    inner_prod_buffer: &mut GpuVector,
    chunk_size: usize,
    work_groups: usize,
) -> Result<(), KrylovError> {
    let size = result.size();
    check_sizes("cg_vector_update", size, &[("p", &*p), ("r", &*r), ("Ap", ap)])?;
    check_len("inner product buffer", inner_prod_buffer.size(), chunk_size)?;
    let params = CgUpdateParams {
        alpha,
        beta,
        size: size as u32,
        rows_per_group: size.div_ceil(work_groups).max(1) as u32,
    };
    let buffers = vec![
        result.inner(),
        p.inner(),
        r.inner(),
        ap.inner(),
        inner_prod_buffer.inner(),
    ];
    launch(context, &CG_VECTOR_UPDATE, &params, buffers, work_groups).await
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn internal_bicgstab_update_s(
    context: &GpuContext,
    s: &mut GpuVector,
    r: &GpuVector,
    ap: &GpuVector,
    inner_prod_buffer: &mut GpuVector,
    chunk_size: usize,
    s_offset: usize,
    work_groups: usize,
) -> Result<(), KrylovError> {
    let size = s.size();
    check_sizes("bicgstab_update_s", size, &[("r", r), ("Ap", ap)])?;
    check_len("inner product buffer", inner_prod_buffer.size(), 4 * chunk_size)?;
    check_len("inner product buffer", inner_prod_buffer.size(), s_offset + chunk_size)?;
    if s_offset < chunk_size || (s_offset < 4 * chunk_size && s_offset + chunk_size > 3 * chunk_size) {
        return Err(KrylovError::InvalidDimensions(format!(
            "<s,s> offset {} overlaps the chunks alpha is reduced from",
            s_offset
        )));
    }
    let params = UpdateSParams {
        size: size as u32,
        rows_per_group: size.div_ceil(work_groups).max(1) as u32,
        chunk_size: chunk_size as u32,
        s_offset: s_offset as u32,
    };
    let buffers = vec![s.inner(), r.inner(), ap.inner(), inner_prod_buffer.inner()];
    launch(context, &BICGSTAB_UPDATE_S, &params, buffers, work_groups).await
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn internal_bicgstab_vector_update(
    context: &GpuContext,
    result: &mut GpuVector,
    alpha: f32,
    p: &mut GpuVector,
    omega: f32,
    s: &GpuVector,
    residual: &mut GpuVector,
    as_vec: &GpuVector,
    beta: f32,
    ap: &GpuVector,
    r0star: &GpuVector,
    inner_prod_buffer: &mut GpuVector,
    chunk_size: usize,
    work_groups: usize,
) -> Result<(), KrylovError> {
    let size = result.size();
    check_sizes(
        "bicgstab_vector_update",
        size,
        &[
            ("p", &*p),
            ("s", s),
            ("residual", &*residual),
            ("As", as_vec),
            ("Ap", ap),
            ("r0star", r0star),
        ],
    )?;
    check_len("inner product buffer", inner_prod_buffer.size(), chunk_size)?;
    let params = BicgstabUpdateParams {
        alpha,
        omega,
        beta,
        size: size as u32,
        rows_per_group: size.div_ceil(work_groups).max(1) as u32,
        _padding: [0; 3],
    };
    let buffers = vec![
        result.inner(),
        p.inner(),
        s.inner(),
        residual.inner(),
        as_vec.inner(),
        ap.inner(),
        r0star.inner(),
        inner_prod_buffer.inner(),
    ];
    launch(context, &BICGSTAB_VECTOR_UPDATE, &params, buffers, work_groups).await
}
