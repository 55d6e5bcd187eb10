//! Preconditioners applied as `v <- M^-1 v`.

use num_traits::Zero;
use krylov_core::{Backend, KrylovError, Scalar, SparseMatrix};
use log::debug;

#[allow(async_fn_in_trait)]
pub trait Preconditioner<B: Backend> {
    /// Identity preconditioners let the drivers take the pipelined path.
    fn is_identity(&self) -> bool {
        false
    }

    async fn apply(&self, backend: &B, v: &mut B::Vector) -> Result<(), KrylovError>;
}

/// The identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreconditioner;

impl<B: Backend> Preconditioner<B> for NoPreconditioner {
    fn is_identity(&self) -> bool {
        true
    }

    async fn apply(&self, _backend: &B, _v: &mut B::Vector) -> Result<(), KrylovError> {
        Ok(())
    }
}

/// Diagonal scaling by the inverse of the main diagonal. Near-zero diagonal
/// entries scale their component to zero.
#[derive(Debug)]
pub struct JacobiPreconditioner<V> {
    inv_diag: V,
}

impl<V> JacobiPreconditioner<V> {
    pub fn from_diagonal<B>(backend: &B, diagonal: &[B::Scalar]) -> Result<Self, KrylovError>
    where
        B: Backend<Vector = V>,
    {
        let inv: Vec<B::Scalar> = diagonal.iter().map(|&d| invert(d)).collect();
        let zeros = inv.iter().filter(|v| **v == B::Scalar::zero()).count();
        if zeros > 0 {
            debug!("Jacobi preconditioner: {} near-zero diagonal entries", zeros);
        }
        Ok(Self {
            inv_diag: backend.from_slice("jacobi_inv_diag", &inv)?,
        })
    }

    /// Builds the preconditioner from the host copy of the system matrix.
    pub fn from_matrix<B>(backend: &B, matrix: &SparseMatrix<B::Scalar>) -> Result<Self, KrylovError>
    where
        B: Backend<Vector = V>,
    {
        Self::from_diagonal(backend, &matrix.diagonal())
    }
}

fn invert<T: Scalar>(d: T) -> T {
    if d.abs() <= T::epsilon() {
        T::zero()
    } else {
        T::one() / d
    }
}

impl<B: Backend> Preconditioner<B> for JacobiPreconditioner<B::Vector> {
    async fn apply(&self, backend: &B, v: &mut B::Vector) -> Result<(), KrylovError> {
        backend.elementwise_mul_assign(&self.inv_diag, v).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krylov_core::{CsrMatrix, HostBackend};
    use pollster::block_on;

    #[test]
    fn jacobi_scales_by_inverse_diagonal() {
        let backend = HostBackend::<f64>::new();
        let a = CsrMatrix::from_dense(&[
            vec![4.0, 1.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.5],
        ])
        .unwrap();
        let precond = JacobiPreconditioner::from_matrix(&backend, &a.into()).unwrap();
        let mut v = vec![2.0, 3.0, 1.0];
        block_on(precond.apply(&backend, &mut v)).unwrap();
        assert_eq!(v, vec![0.5, 0.0, 2.0]);
    }

    #[test]
    fn identity_leaves_vector_untouched() {
        let backend = HostBackend::<f32>::new();
        let mut v = vec![1.0f32, -2.0];
        assert!(Preconditioner::<HostBackend<f32>>::is_identity(&NoPreconditioner));
        block_on(NoPreconditioner.apply(&backend, &mut v)).unwrap();
        assert_eq!(v, vec![1.0, -2.0]);
    }
}
