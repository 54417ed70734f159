//! Error taxonomy shared by the sandbox, package, file and environment layers.

use thiserror::Error;

use crate::container::ContainerError;

pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Input rejected before any engine call.
    #[error("{0}")]
    Validation(String),

    /// Command rejected by the deny-list.
    #[error("Command blocked for security reasons: {reason}")]
    CommandBlocked { reason: String },

    #[error("Environment not found: {0}")]
    EnvironmentNotFound(i64),

    /// Operation not valid for the environment's current state.
    #[error("{0}")]
    State(String),

    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The engine has no such container, so the record has drifted.
    #[error("Container not found at the engine: {0}")]
    ContainerNotFound(String),

    /// The engine itself failed or is unreachable.
    #[error("Container engine error: {0}")]
    Engine(ContainerError),

    /// A shell-level operation ran but reported failure.
    #[error("{0}")]
    OperationFailed(String),

    #[error("Registry error: {0:#}")]
    Registry(#[from] anyhow::Error),
}

impl From<ContainerError> for SandboxError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::Timeout { seconds, .. } => SandboxError::Timeout { seconds },
            ContainerError::ContainerNotFound(id) => SandboxError::ContainerNotFound(id),
            ContainerError::InvalidInput(message) => SandboxError::Validation(message),
            other => SandboxError::Engine(other),
        }
    }
}

impl SandboxError {
    /// Errors caused by the caller's input or the record's state (4xx-equivalent).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SandboxError::Validation(_)
                | SandboxError::CommandBlocked { .. }
                | SandboxError::EnvironmentNotFound(_)
                | SandboxError::State(_)
                | SandboxError::OperationFailed(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout { .. })
    }

    /// Short machine-readable kind, used in CLI/JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Validation(_) => "validation",
            SandboxError::CommandBlocked { .. } => "blocked",
            SandboxError::EnvironmentNotFound(_) => "not_found",
            SandboxError::State(_) => "state",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::ContainerNotFound(_) => "container_not_found",
            SandboxError::Engine(_) => "engine",
            SandboxError::OperationFailed(_) => "operation_failed",
            SandboxError::Registry(_) => "registry",
        }
    }
}
