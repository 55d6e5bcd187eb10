//! `krylov-solver`: pipelined Krylov subspace solvers on top of `krylov-core`.
//!
//! Solvers are configured with immutable tags ([`CgTag`], [`BiCgStabTag`],
//! [`GmresTag`]) and run on any [`Backend`]; the outcome of a run comes back
//! in [`SolveResult`] next to the solution.

pub mod algorithms;
pub mod context;
pub mod preconditioner;

pub use algorithms::{
    BiCgStabTag, CgTag, GmresTag, GmresVariant, SolveAlgorithm, SolveResult, SolverOutcome,
    Termination,
};
pub use context::Context;
pub use preconditioner::{JacobiPreconditioner, NoPreconditioner, Preconditioner};

// Re-export from krylov_core
pub use krylov_core::{
    Backend, CsrMatrix, GpuDevice, HostBackend, KrylovError, LaunchConfig, Matrix, Placement,
    SparseFormat, SparseMatrix, SparseMatrixGpu, Triplet, Vector,
};
