use thiserror::Error;

#[derive(Error, Debug)]
pub enum KrylovError {
    #[error("WGPU initialization failed: {0}")]
    WgpuInitError(String),

    #[error("WGPU error: {0}")]
    WgpuError(String),

    #[error("Shader compilation error: {0}")]
    ShaderError(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid sparse matrix data: {0}")]
    InvalidFormat(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A kernel launch or device-memory operation failed on the backend.
    /// Results computed by the failing call must not be trusted.
    #[error("Execution of kernel '{kernel}' failed: {reason}")]
    ExecutionFailed { kernel: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KrylovError {
    pub(crate) fn execution(kernel: &str, reason: impl std::fmt::Display) -> Self {
        Self::ExecutionFailed {
            kernel: kernel.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` when the error originates from a failed backend launch
    /// rather than from invalid input.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::ExecutionFailed { .. } | Self::WgpuError(_) | Self::ShaderError(_)
        )
    }
}
