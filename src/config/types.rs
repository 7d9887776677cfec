/// Core types and error definitions for the sandbox
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::policy::canonicalize::CanonicalizeError;

/// Outcome of a single access decision.
///
/// `show_violation` only matters for denials: a suppressed denial fails the
/// call without printing or logging anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    pub show_violation: bool,
}

impl Verdict {
    pub const ALLOW: Verdict = Verdict {
        allowed: true,
        show_violation: true,
    };

    pub const DENY: Verdict = Verdict {
        allowed: false,
        show_violation: true,
    };

    /// Allowed, but flagged as a known side effect rather than a normal grant.
    pub const ALLOW_SILENT: Verdict = Verdict {
        allowed: true,
        show_violation: false,
    };

    pub fn is_visible_denial(&self) -> bool {
        !self.allowed && self.show_violation
    }
}

/// Reason a log or registry file failed its safety check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TamperReason {
    Symlink,
    Hardlinked,
    NotRegular,
    WorldWritable,
    BadOwnership,
    NotPermittedByPolicy,
}

impl std::fmt::Display for TamperReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TamperReason::Symlink => write!(f, "symlink"),
            TamperReason::Hardlinked => write!(f, "hardlinked"),
            TamperReason::NotRegular => write!(f, "not regular"),
            TamperReason::WorldWritable => write!(f, "world write"),
            TamperReason::BadOwnership => write!(f, "bad owner/group"),
            TamperReason::NotPermittedByPolicy => write!(f, "not allowed via SANDBOX_WRITE"),
        }
    }
}

/// Custom error types for the sandbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A policy variable is absent or unusable. Recovered by treating the
    /// category as empty.
    #[error("Sandbox error : {0}")]
    PolicyFailure(String),

    #[error("Access denied: {operation} {path}")]
    AccessDenied { operation: String, path: String },

    /// A log or registry file is not safe to write through.
    #[error("File in security violation ({reason}): {}", path.display())]
    TamperingDetected { path: PathBuf, reason: TamperReason },

    #[error("Canonicalization error: {0}")]
    Canonicalize(#[from] CanonicalizeError),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by the locked-file utilities
#[derive(Error, Debug)]
pub enum LockError {
    #[error("{} is not a regular file", path.display())]
    NotRegular { path: PathBuf },

    #[error("Permission denied opening {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("flock on {} failed: {source}", path.display())]
    Flock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Filesystem error: {0}")]
    FilesystemError(#[from] std::io::Error),
}

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visible_denial_requires_both_flags() {
        assert!(Verdict::DENY.is_visible_denial());
        assert!(!Verdict::ALLOW.is_visible_denial());
        assert!(!Verdict::ALLOW_SILENT.is_visible_denial());
        let silent_deny = Verdict {
            allowed: false,
            show_violation: false,
        };
        assert!(!silent_deny.is_visible_denial());
    }

    #[test]
    fn tampering_message_names_reason_and_path() {
        let err = SandboxError::TamperingDetected {
            path: PathBuf::from("/tmp/sandbox.log"),
            reason: TamperReason::Symlink,
        };
        assert_eq!(
            err.to_string(),
            "File in security violation (symlink): /tmp/sandbox.log"
        );
    }
}
