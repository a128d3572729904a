//! Error types for the worker pool and transfer I/O classification.
//!
//! Copy errors are categorized so a worker can tell a medium that went away
//! (a recoverable condition when the destination was auto-allocated) from a
//! plain I/O failure:
//! - MediaGone: the file system under the path vanished or went read-only
//! - Fatal: anything else; the item ends in `Failed`

use std::fmt;
use std::io;

use crate::workshop::ClientId;

/// Category of a transfer I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The medium backing the path is no longer usable (unplugged, unmounted).
    MediaGone,
    /// Permanent failure for this attempt.
    Fatal,
}

/// Which end of a transfer an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSide {
    Source,
    Destination,
}

impl fmt::Display for TransferSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferSide::Source => write!(f, "source"),
            TransferSide::Destination => write!(f, "destination"),
        }
    }
}

/// An I/O error raised while moving one chunk.
#[derive(Debug)]
pub struct TransferFailure {
    pub side: TransferSide,
    pub error: io::Error,
}

impl TransferFailure {
    pub fn on_source(error: io::Error) -> Self {
        Self {
            side: TransferSide::Source,
            error,
        }
    }

    pub fn on_destination(error: io::Error) -> Self {
        Self {
            side: TransferSide::Destination,
            error,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        categorize_io_error(&self.error)
    }
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.side, self.error)
    }
}

impl std::error::Error for TransferFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Categorize an IO error raised by a transfer primitive.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    if let Some(code) = err.raw_os_error() {
        if code == libc::ENODEV
            || code == libc::ENXIO
            || code == libc::EIO
            || code == libc::ENOENT
            || code == libc::EROFS
            || code == libc::ESTALE
        {
            return ErrorCategory::MediaGone;
        }
        return ErrorCategory::Fatal;
    }

    match err.kind() {
        io::ErrorKind::NotFound => ErrorCategory::MediaGone,
        _ => ErrorCategory::Fatal,
    }
}

/// Failures reported by the worker pool itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkshopError {
    AlreadyInitialized,
    NotInitialized,
    ShutDown,
    /// `submit` was called for a client that still has items in flight.
    ClientExists(ClientId),
    UnknownClient(ClientId),
    /// Every 8-bit tag is held by an outstanding item.
    TagsExhausted,
}

impl fmt::Display for WorkshopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkshopError::AlreadyInitialized => write!(f, "workshop already initialized"),
            WorkshopError::NotInitialized => write!(f, "workshop not initialized"),
            WorkshopError::ShutDown => write!(f, "workshop has been shut down"),
            WorkshopError::ClientExists(id) => {
                write!(f, "client {id} already has outstanding items")
            }
            WorkshopError::UnknownClient(id) => write!(f, "client {id} is not registered"),
            WorkshopError::TagsExhausted => write!(f, "no free work item tag"),
        }
    }
}

impl std::error::Error for WorkshopError {}
