#![forbid(unsafe_code)]
//! Error types for Lamina.
//!
//! Defines `LaminaError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings so request completion callbacks can
//! surface conventional POSIX codes to callers.

use thiserror::Error;

/// Unified error type for all Lamina operations.
#[derive(Debug, Error)]
pub enum LaminaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("nothing to copy")]
    NothingToCopy,

    #[error("lost exclusive lock")]
    LostExclusiveLock,

    #[error("object map is not initialized")]
    ObjectMapUnavailable,

    #[error("unknown snapshot {0}")]
    InvalidSnapshot(u64),

    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("backend error {errno}: {detail}")]
    Backend { errno: i32, detail: String },
}

impl LaminaError {
    /// Build a backend error from a raw errno code.
    #[must_use]
    pub fn from_errno(errno: i32, detail: impl Into<String>) -> Self {
        Self::Backend {
            errno,
            detail: detail.into(),
        }
    }

    /// True if this is a backend error carrying the given errno.
    #[must_use]
    pub fn is_errno(&self, errno: i32) -> bool {
        matches!(self, Self::Backend { errno: e, .. } if *e == errno)
    }

    /// Convert this error into a POSIX errno suitable for completion
    /// callbacks (returned negated by convention at the call site).
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Cancelled => libc::ECANCELED,
            Self::NothingToCopy | Self::InvalidSnapshot(_) => libc::ENOENT,
            Self::LostExclusiveLock => libc::EROFS,
            Self::ObjectMapUnavailable => libc::EINVAL,
            Self::Inconsistent(_) => libc::EIO,
            Self::Backend { errno, .. } => *errno,
        }
    }
}

/// Result alias using `LaminaError`.
pub type Result<T> = std::result::Result<T, LaminaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mappings() {
        assert_eq!(LaminaError::NothingToCopy.to_errno(), libc::ENOENT);
        assert_eq!(LaminaError::Cancelled.to_errno(), libc::ECANCELED);
        assert_eq!(LaminaError::LostExclusiveLock.to_errno(), libc::EROFS);
        assert_eq!(LaminaError::ObjectMapUnavailable.to_errno(), libc::EINVAL);
        assert_eq!(
            LaminaError::from_errno(libc::ERANGE, "snapc assertion").to_errno(),
            libc::ERANGE
        );
    }

    #[test]
    fn errno_predicate() {
        let err = LaminaError::from_errno(libc::ENOENT, "no such object");
        assert!(err.is_errno(libc::ENOENT));
        assert!(!err.is_errno(libc::ERANGE));
        assert!(!LaminaError::NothingToCopy.is_errno(libc::ENOENT));
    }
}
