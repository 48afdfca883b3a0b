//! Error taxonomy for the block-backup subsystem (spec.md §7).

use thiserror::Error;

/// Distinguishes which side of a copy an I/O error came from, so callers can
/// dispatch `on_source_error` vs `on_target_error` (spec.md §4.E, §7).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoSide {
    Read,
    Write,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("bitmap is read-only")]
    ReadOnly,

    #[error("bitmap is inconsistent and must be removed before use")]
    Inconsistent,

    #[error("node has no medium / is not inserted")]
    NotInserted,

    #[error("source read failed: {0}")]
    IoRead(#[source] std::io::Error),

    #[error("target write failed: {0}")]
    IoWrite(#[source] std::io::Error),

    #[error("target is out of space")]
    EnoSpc,

    #[error("copy did not complete within the configured timeout")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("permission denied: region not covered by access bitmap")]
    PermissionDenied,

    #[error("snapshot invalidated by earlier copy-before-write failure: {0}")]
    SnapshotPoisoned(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Maps an I/O error observed on a given side of a copy into the
    /// corresponding domain variant, picking out ENOSPC on the write side so
    /// callers can apply `EnospcStop` policy (spec.md §7).
    pub fn from_io(side: IoSide, err: std::io::Error) -> Self {
        if side == IoSide::Write && err.raw_os_error() == Some(libc::ENOSPC) {
            return Error::EnoSpc;
        }
        match side {
            IoSide::Read => Error::IoRead(err),
            IoSide::Write => Error::IoWrite(err),
        }
    }

    /// Whether this error originated on the read (source) side, used to pick
    /// `on_source_error` vs `on_target_error` in the backup job loop.
    pub fn io_side(&self) -> Option<IoSide> {
        match self {
            Error::IoRead(_) => Some(IoSide::Read),
            Error::IoWrite(_) | Error::EnoSpc => Some(IoSide::Write),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
