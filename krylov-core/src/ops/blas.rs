use super::{elementwise_groups, launch, AXPY, DOT_PARTIAL, ELEMENTWISE_MUL, SCALE};
use crate::context::GpuContext;
use crate::error::KrylovError;
use crate::vector::GpuVector;
use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ElementwiseParams {
    alpha: f32,
    size: u32,
    _padding: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DotParams {
    size: u32,
    rows_per_group: u32,
    _padding: [u32; 2],
}

fn check_same_size(op: &str, x: &GpuVector, y: &GpuVector) -> Result<(), KrylovError> {
    if x.size() != y.size() {
        return Err(KrylovError::InvalidDimensions(format!(
            "Vector sizes for {} mismatch: {} != {}",
            op,
            x.size(),
            y.size()
        )));
    }
    Ok(())
}

/// `y = alpha * x + y`
pub(crate) async fn internal_axpy(
    context: &GpuContext,
    alpha: f32,
    x: &GpuVector,
    y: &mut GpuVector,
) -> Result<(), KrylovError> {
    check_same_size("axpy", x, y)?;
    let params = ElementwiseParams {
        alpha,
        size: x.size() as u32,
        _padding: [0; 2],
    };
    let groups = elementwise_groups(x.size());
    launch(context, &AXPY, &params, vec![x.inner(), y.inner()], groups).await
}

/// `x = alpha * x`
pub(crate) async fn internal_scale(
    context: &GpuContext,
    alpha: f32,
    x: &mut GpuVector,
) -> Result<(), KrylovError> {
    let params = ElementwiseParams {
        alpha,
        size: x.size() as u32,
        _padding: [0; 2],
    };
    let groups = elementwise_groups(x.size());
    launch(context, &SCALE, &params, vec![x.inner()], groups).await
}

/// `y[i] *= x[i]`
pub(crate) async fn internal_elementwise_mul(
    context: &GpuContext,
    x: &GpuVector,
    y: &mut GpuVector,
) -> Result<(), KrylovError> {
    check_same_size("elementwise_mul", x, y)?;
    let params = ElementwiseParams {
        alpha: 1.0,
        size: x.size() as u32,
        _padding: [0; 2],
    };
    let groups = elementwise_groups(x.size());
    launch(context, &ELEMENTWISE_MUL, &params, vec![x.inner(), y.inner()], groups).await
}

/// `<x,y>`: group partials on the device, summed on the host.
pub(crate) async fn internal_dot(
    context: &GpuContext,
    x: &GpuVector,
    y: &GpuVector,
    work_groups: usize,
) -> Result<f32, KrylovError> {
    check_same_size("dot", x, y)?;
    let partials = context.create_empty_buffer(
        "dot partials",
        (work_groups * std::mem::size_of::<f32>()) as u64,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
    );
    let params = DotParams {
        size: x.size() as u32,
        rows_per_group: x.size().div_ceil(work_groups).max(1) as u32,
        _padding: [0; 2],
    };
    launch(
        context,
        &DOT_PARTIAL,
        &params,
        vec![x.inner(), y.inner(), &partials],
        work_groups,
    )
    .await?;
    let host: Vec<f32> = context.read_buffer_range(&partials, 0, work_groups).await?;
    Ok(host.iter().sum())
}
