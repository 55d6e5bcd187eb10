use super::{scatter_partials, HostBackend};
use crate::launch::{sum_chunk, tree_reduce, InnerProductBuffer, KrylovBasis};
use crate::traits::Scalar;
use rayon::prelude::*;

impl<T: Scalar> HostBackend<T> {
    /// Group partials of `<x,y>` over `0..x.len()`.
    fn dot_partials(&self, x: &[T], y: &[T]) -> Vec<T> {
        self.group_partials(x.len(), |i| x[i] * y[i])
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn normalize_vk(
        &self,
        basis: &mut KrylovBasis<Vec<T>>,
        k: usize,
        residual: &[T],
        r_matrix: &mut [T],
        r_offset: usize,
        buffer: &InnerProductBuffer<Vec<T>>,
        r_dot_vk: &mut [T],
        chunk_offset: usize,
    ) {
        let chunk = buffer.chunk_size;
        let norm = sum_chunk(&buffer.data, buffer.chunk_offset(1), chunk).sqrt();
        let start = basis.offset(k);
        let size = basis.size;
        let vk = &mut basis.vectors[start..start + size];
        vk.par_iter_mut().for_each(|v| *v = *v / norm);
        let partials = self.dot_partials(&residual[..size], vk);
        scatter_partials(r_dot_vk, chunk_offset, chunk, partials);
        r_matrix[r_offset] = norm;
    }

    pub(super) fn gram_schmidt_stage1(&self, basis: &KrylovBasis<Vec<T>>, k: usize, vi_in_vk: &mut [T]) {
        let chunk = self.config.chunk_size();
        let size = basis.size;
        let vk = &basis.vectors[basis.offset(k)..basis.offset(k) + size];
        for i in 0..k {
            let vi = &basis.vectors[basis.offset(i)..basis.offset(i) + size];
            let partials = self.dot_partials(vi, vk);
            scatter_partials(vi_in_vk, i * chunk, chunk, partials);
        }
    }

    pub(super) fn gram_schmidt_stage2(
        &self,
        basis: &mut KrylovBasis<Vec<T>>,
        k: usize,
        vi_in_vk: &[T],
        r_matrix: &mut [T],
        buffer: &mut InnerProductBuffer<Vec<T>>,
    ) {
        let chunk = self.config.chunk_size();
        let krylov_dim = basis.krylov_dim;
        let size = basis.size;
        let internal = basis.internal_size;
        let coefficients: Vec<T> = (0..k).map(|i| sum_chunk(vi_in_vk, i * chunk, chunk)).collect();
        for (i, &h) in coefficients.iter().enumerate() {
            r_matrix[i + k * krylov_dim] = h;
        }

        let rows_per_group = self.config.rows_per_group(size);
        let local = self.config.local_size;
        let (head, tail) = basis.vectors.split_at_mut(k * internal);
        let head = &*head;
        let partials: Vec<T> = tail[..size]
            .par_chunks_mut(rows_per_group)
            .enumerate()
            .map(|(g, block)| {
                let mut lanes = vec![[T::zero(); 1]; local];
                for (offset, v) in block.iter_mut().enumerate() {
                    let row = g * rows_per_group + offset;
                    let mut acc = *v;
                    for (i, &h) in coefficients.iter().enumerate() {
                        acc = acc - h * head[i * internal + row];
                    }
                    *v = acc;
                    let lane = &mut lanes[offset % local];
                    lane[0] = lane[0] + acc * acc;
                }
                tree_reduce(&mut lanes)[0]
            })
            .collect();
        let offset = buffer.chunk_offset(1);
        let buffer_chunk = buffer.chunk_size;
        scatter_partials(&mut buffer.data, offset, buffer_chunk, partials);
    }

    pub(super) fn update_result(
        &self,
        result: &mut [T],
        residual: &[T],
        basis: &KrylovBasis<Vec<T>>,
        coefficients: &[T],
        k: usize,
    ) {
        if k == 0 {
            return;
        }
        let internal = basis.internal_size;
        let size = basis.size;
        let rows_per_group = self.config.rows_per_group(size);
        result[..size]
            .par_chunks_mut(rows_per_group)
            .enumerate()
            .for_each(|(g, block)| {
                for (offset, x) in block.iter_mut().enumerate() {
                    let row = g * rows_per_group + offset;
                    let mut acc = coefficients[0] * residual[row];
                    for j in 1..k {
                        acc = acc + coefficients[j] * basis.vectors[(j - 1) * internal + row];
                    }
                    *x = *x + acc;
                }
            });
    }
}
