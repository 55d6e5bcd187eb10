// GPU kernel launches. Each public function here validates its operands,
// builds the kernel's parameter block and submits one or more compute passes
// inside an error scope.

mod blas;
mod gmres;
mod prod;
mod update;

pub(crate) use blas::{internal_axpy, internal_dot, internal_elementwise_mul, internal_scale};
pub(crate) use gmres::{
    internal_gram_schmidt_stage1, internal_gram_schmidt_stage2, internal_normalize_vk,
    internal_update_result,
};
pub(crate) use prod::internal_prod;
pub(crate) use update::{internal_bicgstab_update_s, internal_bicgstab_vector_update, internal_cg_update};

use crate::context::GpuContext;
use crate::error::KrylovError;
use bytemuck::Pod;
use std::sync::Arc;

/// Work-group size every shader is compiled with.
pub(crate) const WORKGROUP_SIZE: usize = 128;
/// Largest dispatch along one dimension guaranteed by the default limits.
const MAX_DISPATCH: usize = 65_535;

/// A WGSL compute shader with entry point `main`.
#[derive(Debug)]
pub(crate) struct Kernel {
    pub(crate) name: &'static str,
    pub(crate) source: &'static str,
}

macro_rules! kernel {
    ($name:ident, $file:literal) => {
        pub(crate) const $name: Kernel = Kernel {
            name: $file,
            source: include_str!(concat!("../shaders/", $file, ".wgsl")),
        };
    };
}

kernel!(CSR_PROD, "csr_prod");
kernel!(COO_PROD, "coo_prod");
kernel!(COO_MERGE, "coo_merge");
kernel!(ELL_PROD, "ell_prod");
kernel!(SLICED_ELL_PROD, "sliced_ell_prod");
kernel!(HYB_PROD, "hyb_prod");
kernel!(CG_VECTOR_UPDATE, "cg_vector_update");
kernel!(BICGSTAB_UPDATE_S, "bicgstab_update_s");
kernel!(BICGSTAB_VECTOR_UPDATE, "bicgstab_vector_update");
kernel!(GMRES_NORMALIZE_VK, "gmres_normalize_vk");
kernel!(GMRES_GS_STAGE1, "gmres_gs_stage1");
kernel!(GMRES_GS_STAGE2, "gmres_gs_stage2");
kernel!(GMRES_UPDATE_RESULT, "gmres_update_result");
kernel!(AXPY, "axpy");
kernel!(SCALE, "scale");
kernel!(ELEMENTWISE_MUL, "elementwise_mul");
kernel!(DOT_PARTIAL, "dot_partial");

/// One compute pass: a compiled pipeline, its parameter block and the storage
/// buffers bound at bindings `1..`.
pub(crate) struct Pass<'a> {
    name: &'static str,
    pipeline: Arc<wgpu::ComputePipeline>,
    params: wgpu::Buffer,
    buffers: Vec<&'a wgpu::Buffer>,
    workgroups: u32,
}

impl<'a> Pass<'a> {
    pub(crate) async fn new<P: Pod>(
        context: &GpuContext,
        kernel: &Kernel,
        params: &P,
        buffers: Vec<&'a wgpu::Buffer>,
        workgroups: usize,
    ) -> Result<Self, KrylovError> {
        if workgroups > MAX_DISPATCH {
            return Err(KrylovError::UnsupportedOperation(format!(
                "Kernel '{}' needs {} work groups, at most {} are supported",
                kernel.name, workgroups, MAX_DISPATCH
            )));
        }
        let pipeline = context.pipeline(kernel.name, kernel.source).await?;
        let params = context.create_params_buffer(&format!("{} params", kernel.name), params);
        Ok(Self {
            name: kernel.name,
            pipeline,
            params,
            buffers,
            workgroups: workgroups as u32,
        })
    }
}

/// A byte range of a buffer reset to zero before the passes run.
pub(crate) struct Clear<'a> {
    pub(crate) buffer: &'a wgpu::Buffer,
    pub(crate) offset_elems: usize,
    pub(crate) len_elems: Option<usize>,
}

/// Encodes `clears` followed by `passes` into one command buffer and submits it.
pub(crate) async fn submit(
    context: &GpuContext,
    label: &str,
    clears: &[Clear<'_>],
    passes: &[Pass<'_>],
) -> Result<(), KrylovError> {
    let word = std::mem::size_of::<f32>() as u64;
    context
        .submit_scoped(label, |encoder| {
            for clear in clears {
                encoder.clear_buffer(
                    clear.buffer,
                    clear.offset_elems as u64 * word,
                    clear.len_elems.map(|len| len as u64 * word),
                );
            }
            for pass in passes {
                let layout = pass.pipeline.get_bind_group_layout(0);
                let mut entries = Vec::with_capacity(pass.buffers.len() + 1);
                entries.push(wgpu::BindGroupEntry {
                    binding: 0,
                    resource: pass.params.as_entire_binding(),
                });
                for (i, buffer) in pass.buffers.iter().enumerate() {
                    entries.push(wgpu::BindGroupEntry {
                        binding: i as u32 + 1,
                        resource: buffer.as_entire_binding(),
                    });
                }
                let bind_group = context.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(pass.name),
                    layout: &layout,
                    entries: &entries,
                });
                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(pass.name),
                    timestamp_writes: None,
                });
                compute_pass.set_pipeline(&pass.pipeline);
                compute_pass.set_bind_group(0, &bind_group, &[]);
                compute_pass.dispatch_workgroups(pass.workgroups, 1, 1);
            }
        })
        .await
}

/// Submits a single pass.
pub(crate) async fn launch<P: Pod>(
    context: &GpuContext,
    kernel: &Kernel,
    params: &P,
    buffers: Vec<&wgpu::Buffer>,
    workgroups: usize,
) -> Result<(), KrylovError> {
    let pass = Pass::new(context, kernel, params, buffers, workgroups).await?;
    submit(context, kernel.name, &[], &[pass]).await
}

/// Work groups needed to give each of `size` elements its own invocation.
pub(crate) fn elementwise_groups(size: usize) -> usize {
    size.div_ceil(WORKGROUP_SIZE)
}

pub(crate) fn check_len(what: &str, len: usize, needed: usize) -> Result<(), KrylovError> {
    if len < needed {
        return Err(KrylovError::InvalidDimensions(format!(
            "{} has length {}, {} needed",
            what, len, needed
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernels_declare_main_entry_point() {
        for kernel in [
            CSR_PROD,
            COO_PROD,
            COO_MERGE,
            ELL_PROD,
            SLICED_ELL_PROD,
            HYB_PROD,
            CG_VECTOR_UPDATE,
            BICGSTAB_UPDATE_S,
            BICGSTAB_VECTOR_UPDATE,
            GMRES_NORMALIZE_VK,
            GMRES_GS_STAGE1,
            GMRES_GS_STAGE2,
            GMRES_UPDATE_RESULT,
            AXPY,
            SCALE,
            ELEMENTWISE_MUL,
            DOT_PARTIAL,
        ] {
            assert!(kernel.source.contains("fn main("), "{}", kernel.name);
            let storage_bindings = kernel.source.matches("var<storage").count();
            assert!(storage_bindings <= 8, "{} binds {}", kernel.name, storage_bindings);
        }
    }

    #[test]
    fn elementwise_groups_round_up() {
        assert_eq!(elementwise_groups(0), 0);
        assert_eq!(elementwise_groups(128), 1);
        assert_eq!(elementwise_groups(129), 2);
    }
}
