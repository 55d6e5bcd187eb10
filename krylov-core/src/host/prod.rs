use super::HostBackend;
use crate::launch::tree_reduce;
use crate::sparse_matrix::{merge_open_segments, CooMatrix, GroupScan, SparseMatrix};
use crate::traits::{Matrix, Scalar};
use rayon::prelude::*;

/// Per-group partials of `<Ap,Ap>`, `<p,Ap>` and `<r0star,Ap>`.
pub(super) type ProdPartials<T> = [T; 3];

#[inline]
fn accumulate<T: Scalar>(lane: &mut ProdPartials<T>, row: usize, value: T, p: &[T], r0: Option<&[T]>) {
    lane[0] = lane[0] + value * value;
    if let Some(&pi) = p.get(row) {
        lane[1] = lane[1] + pi * value;
    }
    if let Some(r0) = r0 {
        lane[2] = lane[2] + r0[row] * value;
    }
}

impl<T: Scalar> HostBackend<T> {
    /// Computes `Ap = A p` and the per-group inner-product partials in one
    /// pass over the matrix.
    pub(super) fn fused_product(
        &self,
        a: &SparseMatrix<T>,
        p: &[T],
        ap: &mut [T],
        r0: Option<&[T]>,
    ) -> Vec<ProdPartials<T>> {
        match a {
            SparseMatrix::Coo(m) => self.coo_product(m, p, ap, r0),
            _ => self.row_product(a, p, ap, r0),
        }
    }

    fn row_product(
        &self,
        a: &SparseMatrix<T>,
        p: &[T],
        ap: &mut [T],
        r0: Option<&[T]>,
    ) -> Vec<ProdPartials<T>> {
        let rows = a.rows();
        let rows_per_group = self.config.rows_per_group(rows);
        let local = self.config.local_size;
        ap[..rows]
            .par_chunks_mut(rows_per_group)
            .enumerate()
            .map(|(g, block)| {
                let mut lanes = vec![[T::zero(); 3]; local];
                for (offset, y) in block.iter_mut().enumerate() {
                    let row = g * rows_per_group + offset;
                    let value = a.row_dot(row, p).unwrap_or_else(T::zero);
                    *y = value;
                    accumulate(&mut lanes[offset % local], row, value, p, r0);
                }
                tree_reduce(&mut lanes)
            })
            .collect()
    }

    /// Two-phase segmented product. Phase one reduces each group's
    /// elements and finalizes every row that starts and ends inside the
    /// group; phase two merges rows split across group boundaries and
    /// credits their partials to the last group of the run.
    fn coo_product(
        &self,
        m: &CooMatrix<T>,
        p: &[T],
        ap: &mut [T],
        r0: Option<&[T]>,
    ) -> Vec<ProdPartials<T>> {
        let local = self.config.local_size;
        let scans: Vec<GroupScan<T>> = (0..m.groups())
            .into_par_iter()
            .map(|g| m.scan_group(g, p))
            .collect();

        ap[..m.rows()].fill(T::zero());
        let mut partials = Vec::with_capacity(scans.len());
        for scan in &scans {
            let mut lanes = vec![[T::zero(); 3]; local];
            for (i, &(row, value)) in scan.closed.iter().enumerate() {
                ap[row] = value;
                accumulate(&mut lanes[i % local], row, value, p, r0);
            }
            partials.push(tree_reduce(&mut lanes));
        }

        for merged in merge_open_segments(&scans) {
            ap[merged.row] = merged.value;
            let mut contribution = [T::zero(); 3];
            accumulate(&mut contribution, merged.row, merged.value, p, r0);
            let owner = &mut partials[merged.owner];
            for q in 0..3 {
                owner[q] = owner[q] + contribution[q];
            }
        }
        partials
    }
}
