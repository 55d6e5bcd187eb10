use crate::backend::{Backend, Placement};
use crate::context::GpuContext;
use crate::error::KrylovError;
use crate::launch::{InnerProductBuffer, KrylovBasis, LaunchConfig, DEFAULT_WORK_GROUPS};
use crate::ops::{self, WORKGROUP_SIZE};
use crate::sparse_matrix::{SparseMatrix, SparseMatrixGpu};
use crate::vector::GpuVector;
use serde::{Deserialize, Serialize};
use std::{mem, sync::Arc};

/// Represents a GPU execution device, holding the WGPU context.
///
/// Values are stored as `f32`. Kernels are compiled on first use and cached
/// for the lifetime of the device.
#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub(crate) context: Arc<GpuContext>,
    work_groups: usize,
}

impl GpuDevice {
    /// Creates a new GpuDevice, initializing the underlying WGPU context asynchronously.
    pub async fn new() -> Result<Self, KrylovError> {
        Self::with_work_groups(DEFAULT_WORK_GROUPS).await
    }

    /// Creates a device whose fused kernels run on `work_groups` groups; this
    /// is also the chunk size of every inner-product buffer used with it.
    pub async fn with_work_groups(work_groups: usize) -> Result<Self, KrylovError> {
        LaunchConfig::new(work_groups, WORKGROUP_SIZE)?;
        let context = GpuContext::new().await?;
        log::info!("GpuDevice created with {} work groups", work_groups);
        Ok(Self {
            context: Arc::new(context),
            work_groups,
        })
    }

    /// Blocking variant of [`GpuDevice::new`].
    #[cfg(feature = "native")]
    pub fn new_blocking() -> Result<Self, KrylovError> {
        pollster::block_on(Self::new())
    }

    // --- Resource Creation ---

    /// Creates a GpuVector initialized with data from a CPU slice.
    pub fn create_vector(&self, label: &str, data: &[f32]) -> Result<GpuVector, KrylovError> {
        let size = data.len();
        check_index_range(label, size)?;
        let usage = vector_usage();
        let buffer = if data.is_empty() {
            self.context.create_empty_buffer(label, mem::size_of::<f32>() as u64, usage)
        } else {
            self.context
                .create_gpu_buffer_with_data(label, bytemuck::cast_slice(data), usage)
        };
        Ok(GpuVector::new_internal(
            buffer,
            size,
            String::from(label),
            Arc::clone(&self.context),
        ))
    }

    /// Creates a zero-filled GpuVector with a specified size.
    pub fn create_empty_vector(&self, label: &str, size: usize) -> Result<GpuVector, KrylovError> {
        check_index_range(label, size)?;
        let byte_size = (size.max(1) * mem::size_of::<f32>()) as u64;
        let buffer = self.context.create_empty_buffer(label, byte_size, vector_usage());
        Ok(GpuVector::new_internal(
            buffer,
            size,
            String::from(label),
            Arc::clone(&self.context),
        ))
    }

    /// Uploads a host matrix, keeping its storage format.
    pub fn upload_matrix(
        &self,
        label: &str,
        matrix: &SparseMatrix<f32>,
    ) -> Result<SparseMatrixGpu, KrylovError> {
        SparseMatrixGpu::upload(Arc::clone(&self.context), label, matrix)
    }

    fn check_chunk(&self, buffer: &InnerProductBuffer<GpuVector>) -> Result<(), KrylovError> {
        if buffer.chunk_size != self.work_groups {
            return Err(KrylovError::InvalidDimensions(format!(
                "Inner product buffer chunk size {} does not match {} work groups",
                buffer.chunk_size, self.work_groups
            )));
        }
        Ok(())
    }

    // --- Utility ---

    /// Returns the current GPU transfer statistics (bytes_to_gpu, bytes_from_gpu).
    pub fn get_transfer_stats(&self) -> TransferStats {
        let (bytes_to_gpu, bytes_from_gpu) = self.context.get_transfer_stats();
        TransferStats {
            bytes_to_gpu,
            bytes_from_gpu,
        }
    }

    /// Resets the GPU transfer statistics counters to zero.
    pub fn reset_transfer_stats(&self) {
        self.context.reset_transfer_stats();
    }
}

fn vector_usage() -> wgpu::BufferUsages {
    wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST
}

fn check_index_range(label: &str, size: usize) -> Result<(), KrylovError> {
    if u32::try_from(size).is_err() {
        return Err(KrylovError::UnsupportedOperation(format!(
            "Vector '{}' with {} elements exceeds 32-bit device indexing",
            label, size
        )));
    }
    Ok(())
}

/// Bytes moved between host and device since creation or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub bytes_to_gpu: u64,
    pub bytes_from_gpu: u64,
}

#[allow(clippy::too_many_arguments)]
impl Backend for GpuDevice {
    type Scalar = f32;
    type Vector = GpuVector;
    type Matrix = SparseMatrixGpu;

    fn placement(&self) -> Placement {
        Placement::Gpu
    }

    fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            work_groups: self.work_groups,
            local_size: WORKGROUP_SIZE,
        }
    }

    fn zeros(&self, label: &str, size: usize) -> Result<GpuVector, KrylovError> {
        self.create_empty_vector(label, size)
    }

    fn from_slice(&self, label: &str, data: &[f32]) -> Result<GpuVector, KrylovError> {
        self.create_vector(label, data)
    }

    async fn to_host(&self, v: &GpuVector) -> Result<Vec<f32>, KrylovError> {
        v.read_contents().await
    }

    async fn read_range(&self, v: &GpuVector, start: usize, len: usize) -> Result<Vec<f32>, KrylovError> {
        if start + len > v.size() {
            return Err(KrylovError::InvalidDimensions(format!(
                "Range {}..{} exceeds vector '{}' of length {}",
                start,
                start + len,
                v.label(),
                v.size()
            )));
        }
        self.context.read_buffer_range(v.inner(), start, len).await
    }

    async fn write_range(&self, v: &mut GpuVector, start: usize, data: &[f32]) -> Result<(), KrylovError> {
        if start + data.len() > v.size() {
            return Err(KrylovError::InvalidDimensions(format!(
                "Write of {} elements at {} exceeds vector '{}' of length {}",
                data.len(),
                start,
                v.label(),
                v.size()
            )));
        }
        self.context.write_buffer(v.inner(), start, data).await
    }

    async fn fill_zero(&self, v: &mut GpuVector) -> Result<(), KrylovError> {
        v.fill_zero().await
    }

    async fn copy(&self, src: &GpuVector, dst: &mut GpuVector) -> Result<(), KrylovError> {
        dst.clone_from(src).await
    }

    async fn copy_range(
        &self,
        src: &GpuVector,
        src_start: usize,
        dst: &mut GpuVector,
        dst_start: usize,
        len: usize,
    ) -> Result<(), KrylovError> {
        dst.copy_range_from(dst_start, src, src_start, len).await
    }

    async fn finish(&self) -> Result<(), KrylovError> {
        self.context.finish()
    }

    async fn inner_prod(&self, x: &GpuVector, y: &GpuVector) -> Result<f32, KrylovError> {
        ops::internal_dot(&self.context, x, y, self.work_groups).await
    }

    async fn axpy(&self, alpha: f32, x: &GpuVector, y: &mut GpuVector) -> Result<(), KrylovError> {
        ops::internal_axpy(&self.context, alpha, x, y).await
    }

    async fn scale(&self, alpha: f32, x: &mut GpuVector) -> Result<(), KrylovError> {
        ops::internal_scale(&self.context, alpha, x).await
    }

    async fn elementwise_mul_assign(&self, x: &GpuVector, y: &mut GpuVector) -> Result<(), KrylovError> {
        ops::internal_elementwise_mul(&self.context, x, y).await
    }

    async fn spmv(&self, a: &SparseMatrixGpu, x: &GpuVector, y: &mut GpuVector) -> Result<(), KrylovError> {
        let mut scratch = self.create_empty_vector("spmv scratch", 3 * self.work_groups)?;
        ops::internal_prod(
            &self.context,
            a,
            x,
            y,
            None,
            &mut scratch,
            self.work_groups,
            0,
            self.work_groups,
        )
        .await
    }

    async fn prod(
        &self,
        a: &SparseMatrixGpu,
        p: &GpuVector,
        ap: &mut GpuVector,
        buffer: &mut InnerProductBuffer<GpuVector>,
    ) -> Result<(), KrylovError> {
        self.check_chunk(buffer)?;
        ops::internal_prod(
            &self.context,
            a,
            p,
            ap,
            None,
            &mut buffer.data,
            buffer.chunk_size,
            0,
            self.work_groups,
        )
        .await
    }

    async fn prod_with_r0(
        &self,
        a: &SparseMatrixGpu,
        p: &GpuVector,
        ap: &mut GpuVector,
        r0star: &GpuVector,
        buffer: &mut InnerProductBuffer<GpuVector>,
        r0_offset: usize,
    ) -> Result<(), KrylovError> {
        self.check_chunk(buffer)?;
        ops::internal_prod(
            &self.context,
            a,
            p,
            ap,
            Some(r0star),
            &mut buffer.data,
            buffer.chunk_size,
            r0_offset,
            self.work_groups,
        )
        .await
    }

    async fn cg_vector_update(
        &self,
        result: &mut GpuVector,
        alpha: f32,
        p: &mut GpuVector,
        r: &mut GpuVector,
        ap: &GpuVector,
        beta: f32,
        buffer: &mut InnerProductBuffer<GpuVector>,
    ) -> Result<(), KrylovError> {
        self.check_chunk(buffer)?;
        ops::internal_cg_update(
            &self.context,
            result,
            alpha,
            p,
            r,
            ap,
            beta,
            &mut buffer.data,
            buffer.chunk_size,
            self.work_groups,
        )
        .await
    }

    async fn bicgstab_update_s(
        &self,
        s: &mut GpuVector,
        r: &GpuVector,
        ap: &GpuVector,
        buffer: &mut InnerProductBuffer<GpuVector>,
        s_offset: usize,
    ) -> Result<(), KrylovError> {
        self.check_chunk(buffer)?;
        ops::internal_bicgstab_update_s(
            &self.context,
            s,
            r,
            ap,
            &mut buffer.data,
            buffer.chunk_size,
            s_offset,
            self.work_groups,
        )
        .await
    }

    async fn bicgstab_vector_update(
        &self,
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
        buffer: &mut InnerProductBuffer<GpuVector>,
    ) -> Result<(), KrylovError> {
        self.check_chunk(buffer)?;
        ops::internal_bicgstab_vector_update(
            &self.context,
            result,
            alpha,
            p,
            omega,
            s,
            residual,
            as_vec,
            beta,
            ap,
            r0star,
            &mut buffer.data,
            buffer.chunk_size,
            self.work_groups,
        )
        .await
    }

    async fn gmres_normalize_vk(
        &self,
        basis: &mut KrylovBasis<GpuVector>,
        k: usize,
        residual: &GpuVector,
        r_matrix: &mut GpuVector,
        r_offset: usize,
        buffer: &InnerProductBuffer<GpuVector>,
        r_dot_vk: &mut GpuVector,
        chunk_offset: usize,
    ) -> Result<(), KrylovError> {
        self.check_chunk(buffer)?;
        ops::internal_normalize_vk(
            &self.context,
            basis,
            k,
            residual,
            r_matrix,
            r_offset,
            &buffer.data,
            r_dot_vk,
            buffer.chunk_size,
            chunk_offset,
            self.work_groups,
        )
        .await
    }

    async fn gmres_gram_schmidt_stage1(
        &self,
        basis: &KrylovBasis<GpuVector>,
        k: usize,
        vi_in_vk: &mut GpuVector,
    ) -> Result<(), KrylovError> {
        ops::internal_gram_schmidt_stage1(
            &self.context,
            basis,
            k,
            vi_in_vk,
            self.work_groups,
            self.work_groups,
        )
        .await
    }

    async fn gmres_gram_schmidt_stage2(
        &self,
        basis: &mut KrylovBasis<GpuVector>,
        k: usize,
        vi_in_vk: &GpuVector,
        r_matrix: &mut GpuVector,
        buffer: &mut InnerProductBuffer<GpuVector>,
    ) -> Result<(), KrylovError> {
        self.check_chunk(buffer)?;
        ops::internal_gram_schmidt_stage2(
            &self.context,
            basis,
            k,
            vi_in_vk,
            r_matrix,
            &mut buffer.data,
            buffer.chunk_size,
            self.work_groups,
        )
        .await
    }

    async fn gmres_update_result(
        &self,
        result: &mut GpuVector,
        residual: &GpuVector,
        basis: &KrylovBasis<GpuVector>,
        coefficients: &GpuVector,
        k: usize,
    ) -> Result<(), KrylovError> {
        ops::internal_update_result(&self.context, result, residual, basis, coefficients, k).await
    }
}
