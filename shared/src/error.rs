//! Error taxonomy shared by the stores and the supervisor.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Sub-kind of an OS-level launch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnFailureKind {
    /// The child could not be placed in its own process group / session.
    /// Reported so the caller can retry; never fatal to the supervisor.
    ProcessGroupSetup,
    /// Any other error reported by the operating system.
    Os,
    Other,
}

impl std::fmt::Display for SpawnFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SpawnFailureKind::ProcessGroupSetup => "process group setup",
            SpawnFailureKind::Os => "os",
            SpawnFailureKind::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Strategy not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("Failed to spawn strategy process ({kind}): {message}")]
    SpawnFailed {
        kind: SpawnFailureKind,
        message: String,
    },

    #[error("Termination timed out: {0}")]
    TerminationTimeout(String),

    #[error("Secret store could not be decrypted: {0}")]
    CorruptSecretStore(String),

    #[error("Recovery mismatch: {0}")]
    RecoveryMismatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SupervisorError {
    pub fn spawn(kind: SpawnFailureKind, message: impl Into<String>) -> Self {
        SupervisorError::SpawnFailed {
            kind,
            message: message.into(),
        }
    }

    /// Whether the caller may simply try the same operation again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SupervisorError::DependencyNotReady(_)
                | SupervisorError::TerminationTimeout(_)
                | SupervisorError::CorruptSecretStore(_)
                | SupervisorError::RecoveryMismatch(_)
                | SupervisorError::SpawnFailed {
                    kind: SpawnFailureKind::ProcessGroupSetup,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_group_failure_is_recoverable() {
        let err = SupervisorError::spawn(SpawnFailureKind::ProcessGroupSetup, "setpgid: EPERM");
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("process group setup"));

        let err = SupervisorError::spawn(SpawnFailureKind::Os, "ENOENT");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn not_found_is_final() {
        assert!(!SupervisorError::NotFound("x".into()).is_recoverable());
    }
}
