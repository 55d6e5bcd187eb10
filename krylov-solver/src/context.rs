//! Runtime backend selection.

use crate::algorithms::{SolveAlgorithm, SolveResult};
use crate::preconditioner::JacobiPreconditioner;
use krylov_core::{GpuDevice, HostBackend, KrylovError, Placement, SparseMatrix};
use log::info;

/// Where a solve runs. Callers hand over host data; the context moves it to
/// the selected backend and routes the call there.
#[derive(Debug, Clone)]
pub enum Context {
    Host(HostBackend<f32>),
    Gpu(GpuDevice),
}

impl Context {
    pub fn host() -> Self {
        Context::Host(HostBackend::new())
    }

    pub async fn gpu() -> Result<Self, KrylovError> {
        Ok(Context::Gpu(GpuDevice::new().await?))
    }

    pub async fn new(placement: Placement) -> Result<Self, KrylovError> {
        match placement {
            Placement::Host => Ok(Self::host()),
            Placement::Gpu => Self::gpu().await,
        }
    }

    /// Picks the GPU when an adapter is available, the host otherwise.
    pub async fn best_available() -> Self {
        match Self::gpu().await {
            Ok(context) => context,
            Err(e) => {
                info!("No GPU backend available ({}), using the host backend", e);
                Self::host()
            }
        }
    }

    /// Blocking variant of [`Context::best_available`].
    #[cfg(feature = "native")]
    pub fn best_available_blocking() -> Self {
        pollster::block_on(Self::best_available())
    }

    pub fn placement(&self) -> Placement {
        match self {
            Context::Host(_) => Placement::Host,
            Context::Gpu(_) => Placement::Gpu,
        }
    }

    pub async fn solve<A>(
        &self,
        algorithm: &A,
        a: &SparseMatrix<f32>,
        b: &[f32],
    ) -> Result<SolveResult<f32>, KrylovError>
    where
        A: SolveAlgorithm<HostBackend<f32>> + SolveAlgorithm<GpuDevice>,
    {
        match self {
            Context::Host(backend) => {
                SolveAlgorithm::<HostBackend<f32>>::solve(algorithm, backend, a, b).await
            }
            Context::Gpu(device) => {
                let a_gpu = device.upload_matrix("system_matrix", a)?;
                SolveAlgorithm::<GpuDevice>::solve(algorithm, device, &a_gpu, b).await
            }
        }
    }

    /// Solves with a Jacobi preconditioner built from the diagonal of `a`.
    pub async fn solve_jacobi<A>(
        &self,
        algorithm: &A,
        a: &SparseMatrix<f32>,
        b: &[f32],
    ) -> Result<SolveResult<f32>, KrylovError>
    where
        A: SolveAlgorithm<HostBackend<f32>> + SolveAlgorithm<GpuDevice>,
    {
        match self {
            Context::Host(backend) => {
                let precond = JacobiPreconditioner::from_matrix(backend, a)?;
                SolveAlgorithm::<HostBackend<f32>>::solve_preconditioned(
                    algorithm, backend, a, b, &precond,
                )
                .await
            }
            Context::Gpu(device) => {
                let a_gpu = device.upload_matrix("system_matrix", a)?;
                let precond = JacobiPreconditioner::from_matrix(device, a)?;
                SolveAlgorithm::<GpuDevice>::solve_preconditioned(
                    algorithm, device, &a_gpu, b, &precond,
                )
                .await
            }
        }
    }
}
