use super::HostBackend;
use crate::launch::tree_reduce;
use crate::traits::Scalar;
use rayon::prelude::*;

impl<T: Scalar> HostBackend<T> {
    /// Fused CG update; returns group partials of `<r,r>` for the new residual.
    pub(super) fn cg_update(
        &self,
        result: &mut [T],
        alpha: T,
        p: &mut [T],
        r: &mut [T],
        ap: &[T],
        beta: T,
    ) -> Vec<T> {
        let rows_per_group = self.config.rows_per_group(result.len());
        let local = self.config.local_size;
        result
            .par_chunks_mut(rows_per_group)
            .zip(p.par_chunks_mut(rows_per_group))
            .zip(r.par_chunks_mut(rows_per_group))
            .zip(ap.par_chunks(rows_per_group))
            .map(|(((x, p), r), ap)| {
                let mut lanes = vec![[T::zero(); 1]; local];
                for i in 0..x.len() {
                    x[i] = x[i] + alpha * p[i];
                    r[i] = r[i] - alpha * ap[i];
                    p[i] = r[i] + beta * p[i];
                    let lane = &mut lanes[i % local];
                    lane[0] = lane[0] + r[i] * r[i];
                }
                tree_reduce(&mut lanes)[0]
            })
            .collect()
    }

    /// `s = r - alpha Ap`; returns group partials of `<s,s>`.
    pub(super) fn update_s(&self, s: &mut [T], r: &[T], ap: &[T], alpha: T) -> Vec<T> {
        let rows_per_group = self.config.rows_per_group(s.len());
        let local = self.config.local_size;
        s.par_chunks_mut(rows_per_group)
            .zip(r.par_chunks(rows_per_group))
            .zip(ap.par_chunks(rows_per_group))
            .map(|((s, r), ap)| {
                let mut lanes = vec![[T::zero(); 1]; local];
                for i in 0..s.len() {
                    s[i] = r[i] - alpha * ap[i];
                    let lane = &mut lanes[i % local];
                    lane[0] = lane[0] + s[i] * s[i];
                }
                tree_reduce(&mut lanes)[0]
            })
            .collect()
    }

    /// Fused BiCGStab update; returns group partials of `<residual,r0star>`.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn bicgstab_update(
        &self,
        result: &mut [T],
        alpha: T,
        p: &mut [T],
        omega: T,
        s: &[T],
        residual: &mut [T],
        as_vec: &[T],
        beta: T,
        ap: &[T],
        r0star: &[T],
    ) -> Vec<T> {
        let rows_per_group = self.config.rows_per_group(result.len());
        let local = self.config.local_size;
        result
            .par_chunks_mut(rows_per_group)
            .zip(p.par_chunks_mut(rows_per_group))
            .zip(residual.par_chunks_mut(rows_per_group))
            .enumerate()
            .map(|(g, ((x, p), residual))| {
                let base = g * rows_per_group;
                let mut lanes = vec![[T::zero(); 1]; local];
                for i in 0..x.len() {
                    let row = base + i;
                    x[i] = x[i] + alpha * p[i] + omega * s[row];
                    residual[i] = s[row] - omega * as_vec[row];
                    p[i] = residual[i] + beta * (p[i] - omega * ap[row]);
                    let lane = &mut lanes[i % local];
                    lane[0] = lane[0] + residual[i] * r0star[row];
                }
                tree_reduce(&mut lanes)[0]
            })
            .collect()
    }
}
