//! Error taxonomy shared by the controller and the agent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable error class carried in every `error` result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Operation attempted on a session with no live environment.
    NotRunning,
    /// Command rejected by the allowlist.
    CommandNotAllowed,
    InvalidPackageName,
    /// Wall-clock timeout exceeded.
    Timeout,
    /// Environment did not answer, or answered with garbage.
    ChannelUnreachable,
    /// Provisioning or termination failed.
    EnvironmentFault,
    PathConfinementViolation,
    /// Agent is draining and no longer accepts work.
    ShuttingDown,
    /// Command ran but exited non-zero.
    CommandFailed,
    /// Malformed action envelope or missing parameters.
    InvalidRequest,
    /// File could not be read or written.
    FileAccess,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("No environment is running for session '{0}'")]
    NotRunning(String),

    #[error("Command '{command}' is not allowed. Allowed commands: {}", .allowed.join(", "))]
    CommandNotAllowed { command: String, allowed: Vec<String> },

    #[error("Command rejected: {0}")]
    CommandRejected(String),

    #[error("Invalid package name: {0}")]
    InvalidPackageName(String),

    #[error("Command timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Environment unreachable: {0}")]
    ChannelUnreachable(String),

    #[error("Environment fault: {0}")]
    EnvironmentFault(String),

    #[error("Path rejected: {0}")]
    PathConfinement(String),

    #[error("Agent is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    FileAccess(String),

    /// Error reported by a remote agent in its `{detail, error_kind}` body.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::NotRunning(_) => ErrorKind::NotRunning,
            SandboxError::CommandNotAllowed { .. } | SandboxError::CommandRejected(_) => {
                ErrorKind::CommandNotAllowed
            }
            SandboxError::InvalidPackageName(_) => ErrorKind::InvalidPackageName,
            SandboxError::Timeout(_) => ErrorKind::Timeout,
            SandboxError::ChannelUnreachable(_) => ErrorKind::ChannelUnreachable,
            SandboxError::EnvironmentFault(_) => ErrorKind::EnvironmentFault,
            SandboxError::PathConfinement(_) => ErrorKind::PathConfinementViolation,
            SandboxError::ShuttingDown => ErrorKind::ShuttingDown,
            SandboxError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SandboxError::FileAccess(_) => ErrorKind::FileAccess,
            SandboxError::Remote { kind, .. } => *kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
