use crate::preconditioner::{NoPreconditioner, Preconditioner};
use krylov_core::{sum_chunk, Backend, InnerProductBuffer, KrylovError, Matrix, Scalar};
use serde::{Deserialize, Serialize};

// --- Result Types ---

/// Why a solver run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The relative residual dropped below the tolerance.
    Converged,
    /// The iteration budget ran out first.
    MaxIterations,
    /// A reduced scalar became non-finite (division by a vanishing inner product).
    Breakdown,
}

/// What a solver run achieved. Returned next to the solution instead of
/// being written back into the tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOutcome {
    pub iterations: usize,
    /// Last estimate of `||b - A x|| / ||b||`.
    pub relative_error: f64,
    pub termination: Termination,
}

impl SolverOutcome {
    pub fn converged(&self) -> bool {
        self.termination == Termination::Converged
    }

    pub(crate) fn zero_rhs() -> Self {
        Self {
            iterations: 0,
            relative_error: 0.0,
            termination: Termination::Converged,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveResult<T> {
    pub x: Vec<T>,
    pub outcome: SolverOutcome,
}

impl<T: Scalar> SolveResult<T> {
    pub(crate) fn zero(n: usize) -> Self {
        Self {
            x: vec![T::zero(); n],
            outcome: SolverOutcome::zero_rhs(),
        }
    }
}

// --- Algorithm Trait Definition ---

/// A Krylov solver configured by an immutable tag, runnable on any [`Backend`].
#[allow(async_fn_in_trait)]
pub trait SolveAlgorithm<B: Backend> {
    /// Solves `A x = b` with a zero initial guess.
    async fn solve(
        &self,
        backend: &B,
        a: &B::Matrix,
        b: &[B::Scalar],
    ) -> Result<SolveResult<B::Scalar>, KrylovError> {
        self.solve_preconditioned(backend, a, b, &NoPreconditioner)
            .await
    }

    /// Solves `A x = b` using `precond` as an approximate inverse of `A`.
    async fn solve_preconditioned<P: Preconditioner<B>>(
        &self,
        backend: &B,
        a: &B::Matrix,
        b: &[B::Scalar],
        precond: &P,
    ) -> Result<SolveResult<B::Scalar>, KrylovError>;

    fn validate_inputs(&self, a: &B::Matrix, b: &[B::Scalar]) -> Result<(), KrylovError> {
        let (rows, cols) = a.dims();
        if !a.is_square() {
            return Err(KrylovError::InvalidDimensions(format!(
                "Matrix A must be square (dims: {}x{})",
                rows, cols
            )));
        }
        if rows != b.len() {
            return Err(KrylovError::InvalidDimensions(format!(
                "Matrix A rows ({}) must match RHS vector b length ({})",
                rows,
                b.len()
            )));
        }
        Ok(())
    }
}

// --- Algorithm Implementations ---

pub mod bicgstab;
pub mod cg;
pub mod gmres;

// --- Tag Definitions ---
// Tags are plain configuration values; solvers never write to them.

/// Conjugate Gradient configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgTag {
    tolerance: f64,
    max_iterations: usize,
}

impl Default for CgTag {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 300,
        }
    }
}

impl CgTag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }
}

/// BiConjugate Gradient Stabilized configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiCgStabTag {
    tolerance: f64,
    max_iterations: usize,
}

impl Default for BiCgStabTag {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 400,
        }
    }
}

impl BiCgStabTag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(tolerance: f64, max_iterations: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }
}

/// How GMRES builds its orthonormal basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GmresVariant {
    /// Composes Householder reflectors ("A Simpler GMRES"); supports preconditioning.
    #[default]
    Householder,
    /// Explicit basis with fused classical Gram-Schmidt kernels.
    Pipelined,
}

/// Restarted GMRES configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmresTag {
    tolerance: f64,
    max_iterations: usize,
    krylov_dim: usize,
    variant: GmresVariant,
}

impl Default for GmresTag {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 300,
            krylov_dim: 20,
            variant: GmresVariant::default(),
        }
    }
}

impl GmresTag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(tolerance: f64, max_iterations: usize, krylov_dim: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
            krylov_dim,
            variant: GmresVariant::default(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_krylov_dim(mut self, krylov_dim: usize) -> Self {
        self.krylov_dim = krylov_dim;
        self
    }

    pub fn with_variant(mut self, variant: GmresVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn krylov_dim(&self) -> usize {
        self.krylov_dim
    }

    pub fn variant(&self) -> GmresVariant {
        self.variant
    }

    /// Number of restarts after the first cycle. An evenly dividing
    /// iteration budget would leave the last restart unused, so it is dropped.
    pub fn max_restarts(&self) -> usize {
        let ret = self.max_iterations.checked_div(self.krylov_dim).unwrap_or(0);
        if ret > 0 && ret * self.krylov_dim == self.max_iterations {
            ret - 1
        } else {
            ret
        }
    }
}

// --- Shared driver helpers ---

/// Second reduction stage on the host: sums of the first `chunks` chunks.
pub(crate) async fn reduce_chunks<B: Backend>(
    backend: &B,
    buffer: &InnerProductBuffer<B::Vector>,
    chunks: usize,
) -> Result<Vec<f64>, KrylovError> {
    let chunk = buffer.chunk_size;
    let partials = backend.read_range(&buffer.data, 0, chunks * chunk).await?;
    Ok((0..chunks)
        .map(|c| sum_chunk(&partials, c * chunk, chunk).as_f64())
        .collect())
}

pub(crate) fn host_norm_squared<T: Scalar>(v: &[T]) -> f64 {
    v.iter().map(|&x| x.as_f64() * x.as_f64()).sum()
}

pub(crate) fn cast<T: Scalar>(value: f64) -> T {
    <T as Scalar>::from_f64(value)
}

/// Downloads the first `n` entries of the solution vector.
pub(crate) async fn download<B: Backend>(
    backend: &B,
    x: &B::Vector,
    n: usize,
) -> Result<Vec<B::Scalar>, KrylovError> {
    backend.finish().await?;
    backend.read_range(x, 0, n).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_count_drops_unused_final_cycle() {
        assert_eq!(GmresTag::default().max_restarts(), 14);
        assert_eq!(GmresTag::with_params(1e-8, 310, 20).max_restarts(), 15);
        assert_eq!(GmresTag::with_params(1e-8, 10, 20).max_restarts(), 0);
        assert_eq!(GmresTag::with_params(1e-8, 20, 20).max_restarts(), 0);
        assert_eq!(GmresTag::default().with_krylov_dim(0).max_restarts(), 0);
    }

    #[test]
    fn tag_defaults() {
        let cg = CgTag::default();
        assert_eq!((cg.tolerance(), cg.max_iterations()), (1e-8, 300));
        let bicgstab = BiCgStabTag::default();
        assert_eq!((bicgstab.tolerance(), bicgstab.max_iterations()), (1e-8, 400));
        let gmres = GmresTag::default();
        assert_eq!(gmres.krylov_dim(), 20);
        assert_eq!(gmres.variant(), GmresVariant::Householder);
    }

    #[test]
    fn tags_deserialize_with_defaults() {
        let tag: GmresTag =
            serde_json::from_str(r#"{ "krylov_dim": 5, "variant": "Pipelined" }"#).unwrap();
        assert_eq!(tag.krylov_dim(), 5);
        assert_eq!(tag.max_iterations(), 300);
        assert_eq!(tag.variant(), GmresVariant::Pipelined);
    }
}
