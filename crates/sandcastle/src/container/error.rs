//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors reported by the container engine or by the CLI wrapper around it.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("failed to parse container output: {0}")]
    ParseError(String),

    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether the engine reported the target object as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ContainerError::ContainerNotFound(_)
                | ContainerError::VolumeNotFound(_)
                | ContainerError::ImageNotFound(_)
        )
    }

    /// Classify a failed CLI invocation from its stderr.
    ///
    /// Docker and podman report missing objects with slightly different
    /// wording; both are folded into the typed not-found variants.
    pub(crate) fn from_stderr(command: &str, target: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("no such container")
            || lower.contains("no container with name or id")
        {
            return ContainerError::ContainerNotFound(target.to_string());
        }
        if lower.contains("no such volume") || lower.contains("no volume with name") {
            return ContainerError::VolumeNotFound(target.to_string());
        }
        if lower.contains("no such image") || lower.contains("manifest unknown") {
            return ContainerError::ImageNotFound(target.to_string());
        }
        ContainerError::CommandFailed {
            command: command.to_string(),
            message: stderr.trim().to_string(),
        }
    }
}
