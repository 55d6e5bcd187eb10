//! Launch geometry and the scratch buffers shared by the fused kernels.

use crate::error::KrylovError;
use crate::traits::{Scalar, Vector};
use serde::{Deserialize, Serialize};

/// Default number of cooperating groups, which is also the chunk size of
/// every inner-product buffer.
pub const DEFAULT_WORK_GROUPS: usize = 128;
/// Default number of units per group.
pub const DEFAULT_LOCAL_SIZE: usize = 128;
/// Basis vectors are padded to a multiple of this many elements.
pub const BASIS_ALIGNMENT: usize = 128;

/// Kernel launch geometry. Both values are performance knobs; results only
/// differ by floating point reduction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Number of groups. Each fused kernel writes one partial per group.
    pub work_groups: usize,
    /// Units per group; must be a power of two for the halving reduction.
    pub local_size: usize,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            work_groups: DEFAULT_WORK_GROUPS,
            local_size: DEFAULT_LOCAL_SIZE,
        }
    }
}

impl LaunchConfig {
    pub fn new(work_groups: usize, local_size: usize) -> Result<Self, KrylovError> {
        let config = Self {
            work_groups,
            local_size,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), KrylovError> {
        if self.work_groups == 0 {
            return Err(KrylovError::UnsupportedOperation(
                "Launch needs at least one work group".to_string(),
            ));
        }
        if !self.local_size.is_power_of_two() {
            return Err(KrylovError::UnsupportedOperation(format!(
                "Local size {} is not a power of two",
                self.local_size
            )));
        }
        Ok(())
    }

    /// Chunk size of inner-product buffers filled by this launch geometry.
    pub fn chunk_size(&self) -> usize {
        self.work_groups
    }

    pub fn global_size(&self) -> usize {
        self.work_groups * self.local_size
    }

    /// Length of the contiguous block of rows handed to each group when `n`
    /// rows are split over the groups.
    pub(crate) fn rows_per_group(&self, n: usize) -> usize {
        n.div_ceil(self.work_groups).max(1)
    }
}

/// Chunk indices of the inner-product buffer regions used by the solvers.
///
/// Chunks 1 and 2 are always written by the fused product; the product run
/// on `s` in BiCGStab reuses them for `<As,As>` and `<s,As>`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLayout;

impl ChunkLayout {
    /// `<r,r>` in CG, `<r,r0star>` in BiCGStab. Written by the vector update.
    pub const RESIDUAL: usize = 0;
    pub const AP_AP: usize = 1;
    pub const P_AP: usize = 2;
    pub const AP_R0: usize = 3;
    pub const AS_R0: usize = 4;
    pub const S_S: usize = 5;

    pub const CG_CHUNKS: usize = 3;
    pub const BICGSTAB_CHUNKS: usize = 6;
    pub const GMRES_CHUNKS: usize = 3;
}

/// Scratch vector of `num_chunks * chunk_size` partial sums.
///
/// Chunk `c` occupies `[c * chunk_size, (c + 1) * chunk_size)`; a fused
/// kernel writes one partial per group into each chunk it produces.
#[derive(Debug)]
pub struct InnerProductBuffer<V> {
    pub data: V,
    pub chunk_size: usize,
    pub num_chunks: usize,
}

impl<V: Vector> InnerProductBuffer<V> {
    pub fn new(data: V, chunk_size: usize, num_chunks: usize) -> Result<Self, KrylovError> {
        if data.len() < chunk_size * num_chunks {
            return Err(KrylovError::InvalidDimensions(format!(
                "Inner product buffer of length {} cannot hold {} chunks of {}",
                data.len(),
                num_chunks,
                chunk_size
            )));
        }
        Ok(Self {
            data,
            chunk_size,
            num_chunks,
        })
    }

    /// Element offset of chunk `index`.
    pub fn chunk_offset(&self, index: usize) -> usize {
        index * self.chunk_size
    }
}

/// Flat storage for up to `krylov_dim` basis vectors of length `size`, each
/// padded to `internal_size` elements. Vector `k` starts at `k * internal_size`.
#[derive(Debug)]
pub struct KrylovBasis<V> {
    pub vectors: V,
    pub size: usize,
    pub internal_size: usize,
    pub krylov_dim: usize,
}

impl<V: Vector> KrylovBasis<V> {
    pub fn new(vectors: V, size: usize, krylov_dim: usize) -> Result<Self, KrylovError> {
        let internal_size = Self::internal_size_for(size);
        if vectors.len() < internal_size * krylov_dim {
            return Err(KrylovError::InvalidDimensions(format!(
                "Krylov basis storage of length {} cannot hold {} vectors of {}",
                vectors.len(),
                krylov_dim,
                internal_size
            )));
        }
        Ok(Self {
            vectors,
            size,
            internal_size,
            krylov_dim,
        })
    }

    pub fn internal_size_for(size: usize) -> usize {
        size.div_ceil(BASIS_ALIGNMENT).max(1) * BASIS_ALIGNMENT
    }

    /// Element offset of basis vector `k`.
    pub fn offset(&self, k: usize) -> usize {
        k * self.internal_size
    }
}

/// Group-local reduction by repeated halving of the active lanes.
///
/// `lanes.len()` must be a power of two. Each lane carries `N` independent
/// accumulators reduced together.
pub fn tree_reduce<T: Scalar, const N: usize>(lanes: &mut [[T; N]]) -> [T; N] {
    let mut stride = lanes.len() / 2;
    while stride > 0 {
        for i in 0..stride {
            for q in 0..N {
                lanes[i][q] = lanes[i][q] + lanes[i + stride][q];
            }
        }
        stride /= 2;
    }
    lanes.first().copied().unwrap_or([T::zero(); N])
}

/// Second reduction stage: sums the `chunk_size` partials starting at `offset`.
pub fn sum_chunk<T: Scalar>(buffer: &[T], offset: usize, chunk_size: usize) -> T {
    buffer[offset..offset + chunk_size]
        .iter()
        .fold(T::zero(), |acc, &v| acc + v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_config_validation() {
        assert!(LaunchConfig::new(64, 128).is_ok());
        assert!(LaunchConfig::new(0, 128).is_err());
        assert!(LaunchConfig::new(64, 96).is_err());
        let config = LaunchConfig::default();
        assert_eq!(config.chunk_size(), 128);
        assert_eq!(config.global_size(), 128 * 128);
        assert_eq!(config.rows_per_group(1000), 8);
        assert_eq!(config.rows_per_group(3), 1);
    }

    #[test]
    fn tree_reduce_sums_all_lanes() {
        let mut lanes: Vec<[f64; 2]> = (0..8).map(|i| [i as f64, 1.0]).collect();
        assert_eq!(tree_reduce(&mut lanes), [28.0, 8.0]);
    }

    #[test]
    fn sum_chunk_reads_one_region() {
        let buffer: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(sum_chunk(&buffer, 4, 4), 4.0 + 5.0 + 6.0 + 7.0);
    }

    #[test]
    fn basis_pads_vectors() {
        assert_eq!(KrylovBasis::<Vec<f64>>::internal_size_for(5), 128);
        assert_eq!(KrylovBasis::<Vec<f64>>::internal_size_for(129), 256);
        let basis = KrylovBasis::new(vec![0.0f64; 256 * 3], 129, 3).unwrap();
        assert_eq!(basis.offset(2), 512);
        assert!(KrylovBasis::new(vec![0.0f64; 10], 129, 3).is_err());
    }

    #[test]
    fn inner_product_buffer_checks_length() {
        let buffer = InnerProductBuffer::new(vec![0.0f64; 384], 128, 3).unwrap();
        assert_eq!(buffer.chunk_offset(2), 256);
        assert!(InnerProductBuffer::new(vec![0.0f64; 383], 128, 3).is_err());
    }
}
