//! Multithreaded host backend.
//!
//! Groups are emulated with rayon tasks: group `g` owns a contiguous block of
//! `ceil(n / work_groups)` rows, accumulates into `local_size` lanes and
//! reduces them by halving, exactly like one GPU work group. Each fused
//! kernel therefore produces the same per-group partials as the device.

mod gmres;
mod prod;
mod update;

use crate::backend::{
    check_basis_index, check_chunks, check_prod_dims, check_update_count, Backend, Placement,
};
use crate::error::KrylovError;
use crate::launch::{sum_chunk, tree_reduce, InnerProductBuffer, KrylovBasis, LaunchConfig};
use crate::sparse_matrix::SparseMatrix;
use crate::traits::{Matrix, Scalar};
use log::trace;
use rayon::prelude::*;
use std::marker::PhantomData;

#[derive(Debug, Clone, Copy)]
pub struct HostBackend<T> {
    config: LaunchConfig,
    _marker: PhantomData<T>,
}

impl<T: Scalar> Default for HostBackend<T> {
    fn default() -> Self {
        Self {
            config: LaunchConfig::default(),
            _marker: PhantomData,
        }
    }
}

impl<T: Scalar> HostBackend<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LaunchConfig) -> Result<Self, KrylovError> {
        config.validate()?;
        Ok(Self {
            config,
            _marker: PhantomData,
        })
    }

    /// Group-wise partial sums of `f(i)` over `0..n`.
    fn group_partials<F>(&self, n: usize, f: F) -> Vec<T>
    where
        F: Fn(usize) -> T + Sync,
    {
        let rows_per_group = self.config.rows_per_group(n);
        let local = self.config.local_size;
        let groups = n.div_ceil(rows_per_group);
        (0..groups)
            .into_par_iter()
            .map(|g| {
                let mut lanes = vec![[T::zero(); 1]; local];
                let end = ((g + 1) * rows_per_group).min(n);
                for i in g * rows_per_group..end {
                    let lane = &mut lanes[(i - g * rows_per_group) % local];
                    lane[0] = lane[0] + f(i);
                }
                tree_reduce(&mut lanes)[0]
            })
            .collect()
    }
}

/// Writes group partials into `data[offset..offset + chunk]`, zeroing the
/// slots of groups that did not run. Groups beyond the chunk fold onto
/// `g % chunk`.
pub(crate) fn scatter_partials<T: Scalar>(
    data: &mut [T],
    offset: usize,
    chunk: usize,
    partials: impl IntoIterator<Item = T>,
) {
    let region = &mut data[offset..offset + chunk];
    region.fill(T::zero());
    for (g, value) in partials.into_iter().enumerate() {
        let slot = &mut region[g % chunk];
        *slot = *slot + value;
    }
}

fn check_len<T>(what: &str, v: &[T], needed: usize) -> Result<(), KrylovError> {
    if v.len() < needed {
        return Err(KrylovError::InvalidDimensions(format!(
            "{} has length {}, {} needed",
            what,
            v.len(),
            needed
        )));
    }
    Ok(())
}

fn check_same_len<T>(what: &str, a: &[T], b: &[T]) -> Result<(), KrylovError> {
    if a.len() != b.len() {
        return Err(KrylovError::InvalidDimensions(format!(
            "{}: vector lengths {} and {} differ",
            what,
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

fn check_range<T>(v: &[T], start: usize, len: usize) -> Result<(), KrylovError> {
    if start + len > v.len() {
        return Err(KrylovError::InvalidDimensions(format!(
            "Range {}..{} exceeds vector length {}",
            start,
            start + len,
            v.len()
        )));
    }
    Ok(())
}

impl<T: Scalar> Backend for HostBackend<T> {
    type Scalar = T;
    type Vector = Vec<T>;
    type Matrix = SparseMatrix<T>;

    fn placement(&self) -> Placement {
        Placement::Host
    }

    fn launch_config(&self) -> LaunchConfig {
        self.config
    }

    fn zeros(&self, _label: &str, size: usize) -> Result<Vec<T>, KrylovError> {
        Ok(vec![T::zero(); size])
    }

    fn from_slice(&self, _label: &str, data: &[T]) -> Result<Vec<T>, KrylovError> {
        Ok(data.to_vec())
    }

    async fn to_host(&self, v: &Vec<T>) -> Result<Vec<T>, KrylovError> {
        Ok(v.clone())
    }

    async fn read_range(&self, v: &Vec<T>, start: usize, len: usize) -> Result<Vec<T>, KrylovError> {
        check_range(v, start, len)?;
        Ok(v[start..start + len].to_vec())
    }

    async fn write_range(&self, v: &mut Vec<T>, start: usize, data: &[T]) -> Result<(), KrylovError> {
        check_range(v, start, data.len())?;
        v[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    async fn fill_zero(&self, v: &mut Vec<T>) -> Result<(), KrylovError> {
        v.fill(T::zero());
        Ok(())
    }

    async fn copy(&self, src: &Vec<T>, dst: &mut Vec<T>) -> Result<(), KrylovError> {
        check_same_len("copy", src, dst)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    async fn copy_range(
        &self,
        src: &Vec<T>,
        src_start: usize,
        dst: &mut Vec<T>,
        dst_start: usize,
        len: usize,
    ) -> Result<(), KrylovError> {
        check_range(src, src_start, len)?;
        check_range(dst, dst_start, len)?;
        dst[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
        Ok(())
    }

    async fn finish(&self) -> Result<(), KrylovError> {
        Ok(())
    }

    async fn inner_prod(&self, x: &Vec<T>, y: &Vec<T>) -> Result<T, KrylovError> {
        check_same_len("inner_prod", x, y)?;
        let partials = self.group_partials(x.len(), |i| x[i] * y[i]);
        Ok(partials.iter().fold(T::zero(), |acc, &v| acc + v))
    }

    async fn axpy(&self, alpha: T, x: &Vec<T>, y: &mut Vec<T>) -> Result<(), KrylovError> {
        check_same_len("axpy", x, y)?;
        y.par_iter_mut()
            .zip(x.par_iter())
            .for_each(|(yi, &xi)| *yi = *yi + alpha * xi);
        Ok(())
    }

    async fn scale(&self, alpha: T, x: &mut Vec<T>) -> Result<(), KrylovError> {
        x.par_iter_mut().for_each(|xi| *xi = *xi * alpha);
        Ok(())
    }

    async fn elementwise_mul_assign(&self, x: &Vec<T>, y: &mut Vec<T>) -> Result<(), KrylovError> {
        check_same_len("elementwise_mul_assign", x, y)?;
        y.par_iter_mut()
            .zip(x.par_iter())
            .for_each(|(yi, &xi)| *yi = *yi * xi);
        Ok(())
    }

    async fn spmv(&self, a: &SparseMatrix<T>, x: &Vec<T>, y: &mut Vec<T>) -> Result<(), KrylovError> {
        check_prod_dims(a, x, y)?;
        self.fused_product(a, x, y, None);
        Ok(())
    }

    async fn prod(
        &self,
        a: &SparseMatrix<T>,
        p: &Vec<T>,
        ap: &mut Vec<T>,
        buffer: &mut InnerProductBuffer<Vec<T>>,
    ) -> Result<(), KrylovError> {
        check_prod_dims(a, p, ap)?;
        check_chunks(buffer, 3)?;
        trace!("host prod: {} rows, format {}", a.rows(), a.format().name());
        let partials = self.fused_product(a, p, ap, None);
        let chunk = buffer.chunk_size;
        scatter_partials(&mut buffer.data, chunk, chunk, partials.iter().map(|q| q[0]));
        scatter_partials(&mut buffer.data, 2 * chunk, chunk, partials.iter().map(|q| q[1]));
        Ok(())
    }

    async fn prod_with_r0(
        &self,
        a: &SparseMatrix<T>,
        p: &Vec<T>,
        ap: &mut Vec<T>,
        r0star: &Vec<T>,
        buffer: &mut InnerProductBuffer<Vec<T>>,
        r0_offset: usize,
    ) -> Result<(), KrylovError> {
        check_prod_dims(a, p, ap)?;
        check_len("r0star", r0star, a.rows())?;
        check_chunks(buffer, 3)?;
        let chunk = buffer.chunk_size;
        check_range(&buffer.data, r0_offset, chunk)?;
        let partials = self.fused_product(a, p, ap, Some(r0star));
        scatter_partials(&mut buffer.data, chunk, chunk, partials.iter().map(|q| q[0]));
        scatter_partials(&mut buffer.data, 2 * chunk, chunk, partials.iter().map(|q| q[1]));
        scatter_partials(&mut buffer.data, r0_offset, chunk, partials.iter().map(|q| q[2]));
        Ok(())
    }

    async fn cg_vector_update(
        &self,
        result: &mut Vec<T>,
        alpha: T,
        p: &mut Vec<T>,
        r: &mut Vec<T>,
        ap: &Vec<T>,
        beta: T,
        buffer: &mut InnerProductBuffer<Vec<T>>,
    ) -> Result<(), KrylovError> {
        check_same_len("cg_vector_update", result, p)?;
        check_same_len("cg_vector_update", p, r)?;
        check_same_len("cg_vector_update", r, ap)?;
        check_chunks(buffer, 1)?;
        let partials = self.cg_update(result, alpha, p, r, ap, beta);
        let chunk = buffer.chunk_size;
        scatter_partials(&mut buffer.data, 0, chunk, partials);
        Ok(())
    }

    async fn bicgstab_update_s(
        &self,
        s: &mut Vec<T>,
        r: &Vec<T>,
        ap: &Vec<T>,
        buffer: &mut InnerProductBuffer<Vec<T>>,
        s_offset: usize,
    ) -> Result<(), KrylovError> {
        check_same_len("bicgstab_update_s", s, r)?;
        check_same_len("bicgstab_update_s", r, ap)?;
        check_chunks(buffer, 4)?;
        let chunk = buffer.chunk_size;
        check_range(&buffer.data, s_offset, chunk)?;
        let alpha = sum_chunk(&buffer.data, 0, chunk) / sum_chunk(&buffer.data, 3 * chunk, chunk);
        let partials = self.update_s(s, r, ap, alpha);
        scatter_partials(&mut buffer.data, s_offset, chunk, partials);
        Ok(())
    }

    async fn bicgstab_vector_update(
        &self,
        result: &mut Vec<T>,
        alpha: T,
        p: &mut Vec<T>,
        omega: T,
        s: &Vec<T>,
        residual: &mut Vec<T>,
        as_vec: &Vec<T>,
        beta: T,
        ap: &Vec<T>,
        r0star: &Vec<T>,
        buffer: &mut InnerProductBuffer<Vec<T>>,
    ) -> Result<(), KrylovError> {
        let n = result.len();
        for (what, v) in [
            ("p", &**p),
            ("s", &**s),
            ("residual", &**residual),
            ("As", &**as_vec),
            ("Ap", &**ap),
            ("r0star", &**r0star),
        ] {
            if v.len() != n {
                return Err(KrylovError::InvalidDimensions(format!(
                    "bicgstab_vector_update: {} has length {}, expected {}",
                    what,
                    v.len(),
                    n
                )));
            }
        }
        check_chunks(buffer, 1)?;
        let partials = self.bicgstab_update(
            result, alpha, p, omega, s, residual, as_vec, beta, ap, r0star,
        );
        let chunk = buffer.chunk_size;
        scatter_partials(&mut buffer.data, 0, chunk, partials);
        Ok(())
    }

    async fn gmres_normalize_vk(
        &self,
        basis: &mut KrylovBasis<Vec<T>>,
        k: usize,
        residual: &Vec<T>,
        r_matrix: &mut Vec<T>,
        r_offset: usize,
        buffer: &InnerProductBuffer<Vec<T>>,
        r_dot_vk: &mut Vec<T>,
        chunk_offset: usize,
    ) -> Result<(), KrylovError> {
        check_basis_index(basis, k)?;
        check_chunks(buffer, 2)?;
        check_len("residual", residual, basis.size)?;
        check_range(r_matrix, r_offset, 1)?;
        check_range(r_dot_vk, chunk_offset, buffer.chunk_size)?;
        self.normalize_vk(basis, k, residual, r_matrix, r_offset, buffer, r_dot_vk, chunk_offset);
        Ok(())
    }

    async fn gmres_gram_schmidt_stage1(
        &self,
        basis: &KrylovBasis<Vec<T>>,
        k: usize,
        vi_in_vk: &mut Vec<T>,
    ) -> Result<(), KrylovError> {
        check_basis_index(basis, k)?;
        check_len("vi_in_vk", vi_in_vk, k * self.config.chunk_size())?;
        self.gram_schmidt_stage1(basis, k, vi_in_vk);
        Ok(())
    }

    async fn gmres_gram_schmidt_stage2(
        &self,
        basis: &mut KrylovBasis<Vec<T>>,
        k: usize,
        vi_in_vk: &Vec<T>,
        r_matrix: &mut Vec<T>,
        buffer: &mut InnerProductBuffer<Vec<T>>,
    ) -> Result<(), KrylovError> {
        check_basis_index(basis, k)?;
        check_chunks(buffer, 2)?;
        check_len("vi_in_vk", vi_in_vk, k * self.config.chunk_size())?;
        check_len("R", r_matrix, basis.krylov_dim * basis.krylov_dim)?;
        self.gram_schmidt_stage2(basis, k, vi_in_vk, r_matrix, buffer);
        Ok(())
    }

    async fn gmres_update_result(
        &self,
        result: &mut Vec<T>,
        residual: &Vec<T>,
        basis: &KrylovBasis<Vec<T>>,
        coefficients: &Vec<T>,
        k: usize,
    ) -> Result<(), KrylovError> {
        check_update_count(basis, k)?;
        check_len("result", result, basis.size)?;
        check_len("residual", residual, basis.size)?;
        check_len("coefficients", coefficients, k)?;
        self.update_result(result, residual, basis, coefficients, k);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse_matrix::{CsrMatrix, SparseFormat, Triplet};
    use pollster::block_on;

    pub(super) fn small_backend() -> HostBackend<f64> {
        HostBackend::with_config(LaunchConfig::new(4, 4).unwrap()).unwrap()
    }

    pub(super) fn random_matrix(n: usize, seed: u64) -> CsrMatrix<f64> {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut triplets = Vec::new();
        for i in 0..n {
            triplets.push(Triplet::new(i, i, 4.0 + rng.f64()));
            for _ in 0..rng.usize(0..4) {
                triplets.push(Triplet::new(i, rng.usize(0..n), rng.f64() - 0.5));
            }
        }
        CsrMatrix::from_triplets(n, n, triplets).unwrap()
    }

    pub(super) fn all_formats() -> [SparseFormat; 5] {
        [
            SparseFormat::Csr,
            SparseFormat::Coo { groups: 3 },
            SparseFormat::Ell,
            SparseFormat::SlicedEll {
                rows_per_block: 4,
                sigma: 8,
            },
            SparseFormat::Hybrid,
        ]
    }

    #[test]
    fn rejects_invalid_launch_config() {
        assert!(HostBackend::<f32>::with_config(LaunchConfig {
            work_groups: 8,
            local_size: 3
        })
        .is_err());
    }

    #[test]
    fn inner_prod_matches_serial_sum() {
        let backend = small_backend();
        let x: Vec<f64> = (0..37).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = (0..37).map(|i| 1.0 - i as f64 * 0.1).collect();
        let expected: f64 = x.iter().zip(&y).map(|(a, b)| a * b).sum();
        let dot = block_on(backend.inner_prod(&x, &y)).unwrap();
        assert!((dot - expected).abs() < 1e-10);
        assert!(block_on(backend.inner_prod(&x, &y[..3].to_vec())).is_err());
    }

    #[test]
    fn vector_primitives() {
        let backend = small_backend();
        let x = vec![1.0, 2.0, 3.0];
        let mut y = vec![1.0, 1.0, 1.0];
        block_on(backend.axpy(2.0, &x, &mut y)).unwrap();
        assert_eq!(y, vec![3.0, 5.0, 7.0]);
        block_on(backend.scale(0.5, &mut y)).unwrap();
        assert_eq!(y, vec![1.5, 2.5, 3.5]);
        block_on(backend.elementwise_mul_assign(&x, &mut y)).unwrap();
        assert_eq!(y, vec![1.5, 5.0, 10.5]);
        let mut z = vec![0.0; 5];
        block_on(backend.copy_range(&x, 1, &mut z, 3, 2)).unwrap();
        assert_eq!(z, vec![0.0, 0.0, 0.0, 2.0, 3.0]);
        assert!(block_on(backend.copy_range(&x, 2, &mut z, 0, 2)).is_err());
    }

    #[test]
    fn scatter_zeroes_idle_groups() {
        let mut data = vec![9.0f64; 8];
        scatter_partials(&mut data, 4, 4, [1.0, 2.0]);
        assert_eq!(data, vec![9.0, 9.0, 9.0, 9.0, 1.0, 2.0, 0.0, 0.0]);
        scatter_partials(&mut data, 0, 2, [1.0, 2.0, 3.0]);
        assert_eq!(&data[..2], &[4.0, 2.0]);
    }
}
