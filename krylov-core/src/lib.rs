//! # Krylov Core Library
//!
//! Vectors, sparse storage formats and the fused linear-algebra kernels
//! that pipelined Krylov solvers are built from, for a multithreaded host
//! backend and a wgpu compute backend.

pub mod backend;
mod context;
pub mod device;
pub mod error;
pub mod host;
pub mod launch;
mod ops;
pub mod sparse_matrix;
pub mod traits;
pub mod vector;

pub use backend::{Backend, Placement};
pub use device::{GpuDevice, TransferStats};
pub use error::KrylovError;
pub use host::HostBackend;
pub use launch::{
    sum_chunk, tree_reduce, ChunkLayout, InnerProductBuffer, KrylovBasis, LaunchConfig,
    DEFAULT_LOCAL_SIZE, DEFAULT_WORK_GROUPS,
};
pub use sparse_matrix::{
    CooMatrix, CsrMatrix, EllMatrix, HybMatrix, SlicedEllMatrix, SparseFormat, SparseMatrix,
    SparseMatrixGpu, Triplet,
};
pub use traits::{Matrix, Scalar, Vector};
pub use vector::{GpuVector, VectorView};
