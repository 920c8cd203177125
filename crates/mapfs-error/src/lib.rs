#![forbid(unsafe_code)]
//! Error types for mapfs.
//!
//! Defines `MapFsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for FUSE response codes.

use mapfs_types::LayoutError;
use thiserror::Error;

/// Unified error type for all mapfs operations.
#[derive(Debug, Error)]
pub enum MapFsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("entry exists")]
    Exists,

    #[error("name too long")]
    NameTooLong,

    #[error("no space left in region")]
    NoSpace,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("corrupt region at offset {offset}: {detail}")]
    Corrupt { offset: u64, detail: String },

    #[error("bad region layout: {0}")]
    Layout(#[from] LayoutError),
}

impl MapFsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Exists => libc::EEXIST,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NoSpace => libc::ENOSPC,
            Self::InvalidArgument(_) => libc::EINVAL,
            // A stored offset that escapes the region means the image is
            // bad; nothing here can repair it.
            Self::Corrupt { .. } | Self::Layout(_) => libc::EFAULT,
        }
    }
}

/// Result alias using `MapFsError`.
pub type Result<T> = std::result::Result<T, MapFsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_posix_codes() {
        assert_eq!(MapFsError::NotFound("/a".into()).to_errno(), libc::ENOENT);
        assert_eq!(MapFsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(MapFsError::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(MapFsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(MapFsError::Exists.to_errno(), libc::EEXIST);
        assert_eq!(MapFsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(MapFsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(
            MapFsError::InvalidArgument("negative offset").to_errno(),
            libc::EINVAL
        );
        assert_eq!(
            MapFsError::Corrupt {
                offset: 0,
                detail: "bad magic".into()
            }
            .to_errno(),
            libc::EFAULT
        );
    }

    #[test]
    fn layout_errors_convert_and_map_to_efault() {
        let layout = LayoutError::OutOfBounds {
            offset: 100,
            len: 8,
            region: 64,
        };
        let err = MapFsError::from(layout);
        assert_eq!(err.to_errno(), libc::EFAULT);
    }
}
