#![forbid(unsafe_code)]
//! Error types for SiltFS.
//!
//! `SfsError` is the single user-facing error type; crate-internal errors
//! (like `TypeError` in `sfs-types`) convert into `SfsError` at their
//! respective crate boundaries. This crate deliberately depends on no other
//! SiltFS crate so that every layer can return it without cycles.
//!
//! Every variant maps to exactly one POSIX errno via [`SfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` (or the wrapped raw OS error) |
//! | `Format` | `EINVAL` |
//! | `ReadOnlyFilesystem` | `EROFS` |
//! | `FileNotWritable` | `EBADF` |
//! | `FileTooLarge` | `EFBIG` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |

use thiserror::Error;

/// Unified error type for all SiltFS operations.
#[derive(Debug, Error)]
pub enum SfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structurally invalid request against the storage layer (bad geometry,
    /// out-of-range block, size mismatch).
    #[error("invalid format: {0}")]
    Format(String),

    /// Write or create requested against a read-only filesystem.
    #[error("read-only filesystem")]
    ReadOnlyFilesystem,

    /// Write attempted on a handle opened without the write flag.
    #[error("file not opened for writing")]
    FileNotWritable,

    /// Target size exceeds the addressable block range of the file's mapping.
    #[error("file too large for block mapping")]
    FileTooLarge,

    /// Malformed argument (unknown seek whence, out-of-range seek offset).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No free blocks available.
    #[error("no space left on device")]
    NoSpace,

    /// No such inode or other named object.
    #[error("not found: {0}")]
    NotFound(String),
}

impl SfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive — every variant has an explicit arm.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Format(_) => libc::EINVAL,
            Self::ReadOnlyFilesystem => libc::EROFS,
            Self::FileNotWritable => libc::EBADF,
            Self::FileTooLarge => libc::EFBIG,
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
        }
    }
}

/// Result alias using `SfsError`.
pub type Result<T> = std::result::Result<T, SfsError>;
