// Error taxonomy for the execution pipeline and image management

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// Malformed request, rejected before any container exists
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Static policy checker denied the submitted code
    #[error("Code rejected by policy: {0}")]
    PolicyRejected(String),

    /// Install layer or custom image build failed
    #[error("Build failed: {0}")]
    BuildFailure(String),

    /// Base image could not be pulled
    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),

    /// Container could not be created or started
    #[error("Container failed to start: {0}")]
    StartFailure(String),

    #[error("Execution timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Harness exited without a parseable report
    #[error("Harness crashed: {0}")]
    RuntimeCrash(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Image in use: {0}")]
    ImageInUse(String),

    /// Container runtime API error outside a classified phase
    #[error("Docker error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Stable tag used in responses and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Validation(_) => "validation_error",
            SandboxError::PolicyRejected(_) => "policy_rejected",
            SandboxError::BuildFailure(_) => "build_failure",
            SandboxError::ImageUnavailable(_) => "image_unavailable",
            SandboxError::StartFailure(_) => "start_failure",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::RuntimeCrash(_) => "runtime_crash",
            SandboxError::ImageNotFound(_) => "image_not_found",
            SandboxError::ImageInUse(_) => "image_in_use",
            SandboxError::Runtime(_) | SandboxError::Io(_) | SandboxError::Internal(_) => {
                "internal_fault"
            }
        }
    }

    /// Errors raised before any container is created; these never produce a report.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SandboxError::Validation(_)
                | SandboxError::PolicyRejected(_)
                | SandboxError::ImageNotFound(_)
                | SandboxError::ImageInUse(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
