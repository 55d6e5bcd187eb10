//! The capability interface every execution target implements.
//!
//! Solver drivers are written once against [`Backend`]. Each backend
//! supplies buffer handling and launch mechanics for the same set of fused
//! kernels; the kernel numerics are identical across backends.

use crate::error::KrylovError;
use crate::launch::{InnerProductBuffer, KrylovBasis, LaunchConfig};
use crate::traits::{Matrix, Scalar, Vector};
use crate::vector::VectorView;
use serde::{Deserialize, Serialize};

/// Where the operands of a backend live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    Host,
    Gpu,
}

#[allow(async_fn_in_trait, clippy::too_many_arguments)]
pub trait Backend {
    type Scalar: Scalar;
    type Vector: Vector<Value = Self::Scalar>;
    type Matrix: Matrix<Value = Self::Scalar>;

    fn placement(&self) -> Placement;

    fn launch_config(&self) -> LaunchConfig;

    // --- Buffers and transfers ---

    fn zeros(&self, label: &str, size: usize) -> Result<Self::Vector, KrylovError>;

    fn from_slice(&self, label: &str, data: &[Self::Scalar]) -> Result<Self::Vector, KrylovError>;

    /// Uploads a (possibly strided) host view as a contiguous vector.
    fn from_view(
        &self,
        label: &str,
        view: VectorView<'_, Self::Scalar>,
    ) -> Result<Self::Vector, KrylovError> {
        self.from_slice(label, &view.to_vec())
    }

    async fn to_host(&self, v: &Self::Vector) -> Result<Vec<Self::Scalar>, KrylovError>;

    async fn read_range(
        &self,
        v: &Self::Vector,
        start: usize,
        len: usize,
    ) -> Result<Vec<Self::Scalar>, KrylovError>;

    async fn write_range(
        &self,
        v: &mut Self::Vector,
        start: usize,
        data: &[Self::Scalar],
    ) -> Result<(), KrylovError>;

    async fn fill_zero(&self, v: &mut Self::Vector) -> Result<(), KrylovError>;

    async fn copy(&self, src: &Self::Vector, dst: &mut Self::Vector) -> Result<(), KrylovError>;

    async fn copy_range(
        &self,
        src: &Self::Vector,
        src_start: usize,
        dst: &mut Self::Vector,
        dst_start: usize,
        len: usize,
    ) -> Result<(), KrylovError>;

    /// Waits until all queued work is complete.
    async fn finish(&self) -> Result<(), KrylovError>;

    // --- Vector primitives ---

    async fn inner_prod(&self, x: &Self::Vector, y: &Self::Vector)
        -> Result<Self::Scalar, KrylovError>;

    async fn norm_2(&self, x: &Self::Vector) -> Result<Self::Scalar, KrylovError> {
        Ok(num_traits::Float::sqrt(self.inner_prod(x, x).await?))
    }

    /// `y += alpha * x`
    async fn axpy(
        &self,
        alpha: Self::Scalar,
        x: &Self::Vector,
        y: &mut Self::Vector,
    ) -> Result<(), KrylovError>;

    /// `x *= alpha`
    async fn scale(&self, alpha: Self::Scalar, x: &mut Self::Vector) -> Result<(), KrylovError>;

    /// `y[i] *= x[i]`
    async fn elementwise_mul_assign(
        &self,
        x: &Self::Vector,
        y: &mut Self::Vector,
    ) -> Result<(), KrylovError>;

    /// Plain `y = A x`.
    async fn spmv(
        &self,
        a: &Self::Matrix,
        x: &Self::Vector,
        y: &mut Self::Vector,
    ) -> Result<(), KrylovError>;

    // --- Fused kernels ---

    /// `Ap = A p`, writing partials of `<Ap,Ap>` into chunk 1 and `<p,Ap>`
    /// into chunk 2. Chunk 0 is left untouched.
    async fn prod(
        &self,
        a: &Self::Matrix,
        p: &Self::Vector,
        ap: &mut Self::Vector,
        buffer: &mut InnerProductBuffer<Self::Vector>,
    ) -> Result<(), KrylovError>;

    /// As [`Backend::prod`], additionally writing partials of `<r0star,Ap>`
    /// at `r0_offset`.
    async fn prod_with_r0(
        &self,
        a: &Self::Matrix,
        p: &Self::Vector,
        ap: &mut Self::Vector,
        r0star: &Self::Vector,
        buffer: &mut InnerProductBuffer<Self::Vector>,
        r0_offset: usize,
    ) -> Result<(), KrylovError>;

    /// `result += alpha p; r -= alpha Ap; p = r + beta p`, writing partials
    /// of `<r,r>` into chunk 0.
    async fn cg_vector_update(
        &self,
        result: &mut Self::Vector,
        alpha: Self::Scalar,
        p: &mut Self::Vector,
        r: &mut Self::Vector,
        ap: &Self::Vector,
        beta: Self::Scalar,
        buffer: &mut InnerProductBuffer<Self::Vector>,
    ) -> Result<(), KrylovError>;

    /// Reduces `alpha = <r,r0star> / <Ap,r0star>` from chunks 0 and 3, sets
    /// `s = r - alpha Ap` and writes partials of `<s,s>` at `s_offset`.
    async fn bicgstab_update_s(
        &self,
        s: &mut Self::Vector,
        r: &Self::Vector,
        ap: &Self::Vector,
        buffer: &mut InnerProductBuffer<Self::Vector>,
        s_offset: usize,
    ) -> Result<(), KrylovError>;

    /// `result += alpha p + omega s; residual = s - omega As;
    /// p = residual + beta (p - omega Ap)`, writing partials of
    /// `<residual,r0star>` into chunk 0.
    async fn bicgstab_vector_update(
        &self,
        result: &mut Self::Vector,
        alpha: Self::Scalar,
        p: &mut Self::Vector,
        omega: Self::Scalar,
        s: &Self::Vector,
        residual: &mut Self::Vector,
        as_vec: &Self::Vector,
        beta: Self::Scalar,
        ap: &Self::Vector,
        r0star: &Self::Vector,
        buffer: &mut InnerProductBuffer<Self::Vector>,
    ) -> Result<(), KrylovError>;

    /// Normalizes basis vector `k` with the norm reduced from chunk 1 of
    /// `buffer`, stores the norm at `r_matrix[r_offset]` and writes partials
    /// of `<residual, v_k>` into `r_dot_vk[chunk_offset..]`.
    async fn gmres_normalize_vk(
        &self,
        basis: &mut KrylovBasis<Self::Vector>,
        k: usize,
        residual: &Self::Vector,
        r_matrix: &mut Self::Vector,
        r_offset: usize,
        buffer: &InnerProductBuffer<Self::Vector>,
        r_dot_vk: &mut Self::Vector,
        chunk_offset: usize,
    ) -> Result<(), KrylovError>;

    /// Partials of `<v_i, v_k>` for all `i < k`, in batches of at most
    /// seven vectors, into chunk `i` of `vi_in_vk`.
    async fn gmres_gram_schmidt_stage1(
        &self,
        basis: &KrylovBasis<Self::Vector>,
        k: usize,
        vi_in_vk: &mut Self::Vector,
    ) -> Result<(), KrylovError>;

    /// Completes the `<v_i, v_k>` reductions, stores them in column `k` of
    /// the R matrix, applies `v_k -= sum_i <v_i,v_k> v_i` and writes partials
    /// of `<v_k,v_k>` into chunk 1 of `buffer`.
    async fn gmres_gram_schmidt_stage2(
        &self,
        basis: &mut KrylovBasis<Self::Vector>,
        k: usize,
        vi_in_vk: &Self::Vector,
        r_matrix: &mut Self::Vector,
        buffer: &mut InnerProductBuffer<Self::Vector>,
    ) -> Result<(), KrylovError>;

    /// `result += c[0] residual + sum_{j=1}^{k-1} c[j] v_{j-1}`.
    async fn gmres_update_result(
        &self,
        result: &mut Self::Vector,
        residual: &Self::Vector,
        basis: &KrylovBasis<Self::Vector>,
        coefficients: &Self::Vector,
        k: usize,
    ) -> Result<(), KrylovError>;
}

/// Checks that a product `A p -> Ap` is dimensionally valid.
pub(crate) fn check_prod_dims<M: Matrix, V: Vector>(
    a: &M,
    p: &V,
    ap: &V,
) -> Result<(), KrylovError> {
    let (rows, cols) = a.dims();
    if p.len() < cols || ap.len() < rows {
        return Err(KrylovError::InvalidDimensions(format!(
            "Product with {}x{} matrix needs p of length {} and Ap of length {} (got {} and {})",
            rows,
            cols,
            cols,
            rows,
            p.len(),
            ap.len()
        )));
    }
    Ok(())
}

/// Ensures basis vector `k` exists.
pub(crate) fn check_basis_index<V: Vector>(
    basis: &KrylovBasis<V>,
    k: usize,
) -> Result<(), KrylovError> {
    if k >= basis.krylov_dim {
        return Err(KrylovError::InvalidDimensions(format!(
            "Basis index {} out of range for Krylov dimension {}",
            k, basis.krylov_dim
        )));
    }
    Ok(())
}

/// Ensures a result update with `k` coefficients reads only stored basis
/// vectors: coefficient 0 scales the residual, coefficient `j` scales `v_{j-1}`.
pub(crate) fn check_update_count<V: Vector>(
    basis: &KrylovBasis<V>,
    k: usize,
) -> Result<(), KrylovError> {
    if k > basis.krylov_dim + 1 {
        return Err(KrylovError::InvalidDimensions(format!(
            "Result update with {} coefficients exceeds Krylov dimension {}",
            k, basis.krylov_dim
        )));
    }
    Ok(())
}

/// Ensures `buffer` has room for `chunks` chunks.
pub(crate) fn check_chunks<V: Vector>(
    buffer: &InnerProductBuffer<V>,
    chunks: usize,
) -> Result<(), KrylovError> {
    if buffer.data.len() < buffer.chunk_size * chunks {
        return Err(KrylovError::InvalidDimensions(format!(
            "Inner product buffer holds {} elements, {} chunks of {} needed",
            buffer.data.len(),
            chunks,
            buffer.chunk_size
        )));
    }
    Ok(())
}
