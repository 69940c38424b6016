use std::fmt;
use thiserror::Error;

/// Failure categories derived from a restic invocation's exit behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Another process holds the repository lock
    RepoLocked,
    /// Remote storage unreachable or misconfigured
    ConnectionFailed,
    /// Repository content failed integrity verification
    CheckFailed,
    /// Failure shape not recognised by any rule
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RepoLocked => "repo_locked",
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::CheckFailed => "check_failed",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by restic commands
#[derive(Debug, Error)]
pub enum ResticError {
    #[error("repository is already locked")]
    RepoLocked,

    #[error("connection to repository failed")]
    ConnectionFailed,

    #[error("repository failed integrity check")]
    CheckFailed,

    #[error("restic command failed: {0}")]
    Unknown(String),

    #[error("restic command cancelled")]
    Cancelled,

    #[error("failed to decode `{command}` output")]
    Decode {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ResticError {
    pub(crate) fn from_kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        match kind {
            ErrorKind::RepoLocked => ResticError::RepoLocked,
            ErrorKind::ConnectionFailed => ResticError::ConnectionFailed,
            ErrorKind::CheckFailed => ResticError::CheckFailed,
            ErrorKind::Unknown => ResticError::Unknown(detail.into()),
        }
    }

    /// Classification of this error, `None` for cancellation and decode failures
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ResticError::RepoLocked => Some(ErrorKind::RepoLocked),
            ResticError::ConnectionFailed => Some(ErrorKind::ConnectionFailed),
            ResticError::CheckFailed => Some(ErrorKind::CheckFailed),
            ResticError::Unknown(_) => Some(ErrorKind::Unknown),
            ResticError::Cancelled | ResticError::Decode { .. } => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ResticError::Cancelled)
    }
}
