//! Chunked transfer primitives, one per work item kind.
//!
//! Every session writes into staged output next to its destination and only
//! moves it into place on `commit`; dropping a session removes whatever it
//! wrote.

mod dir;
mod file;
mod staging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::TransferFailure;

pub use staging::PARTIAL_SUFFIX;

/// Result of one `copy_chunk` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// Moved this many bytes; call again.
    Copied(u64),
    /// Nothing left to move.
    Complete,
}

/// One in-progress transfer. Each call moves at most `buf.len()` bytes so the
/// caller can check for control signals in between.
pub trait ChunkCopy: Send {
    fn copy_chunk(&mut self, buf: &mut [u8]) -> Result<Chunk, TransferFailure>;

    /// Promote the staged output to the final destination.
    fn commit(self: Box<Self>) -> Result<(), TransferFailure>;
}

/// What a work item moves. Fixed at construction.
#[derive(Debug, Clone)]
pub enum TransferKind {
    DirToDir { source: PathBuf },
    BufferToFile { data: Arc<[u8]> },
    PathToFile { source: PathBuf },
}

impl TransferKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransferKind::DirToDir { .. } => "dir",
            TransferKind::BufferToFile { .. } => "buffer",
            TransferKind::PathToFile { .. } => "file",
        }
    }

    /// Source path, for the kinds that have one.
    pub fn source_path(&self) -> Option<&Path> {
        match self {
            TransferKind::DirToDir { source } | TransferKind::PathToFile { source } => {
                Some(source)
            }
            TransferKind::BufferToFile { .. } => None,
        }
    }

    pub(crate) fn open_session(
        &self,
        destination: &Path,
    ) -> Result<Box<dyn ChunkCopy>, TransferFailure> {
        Ok(match self {
            TransferKind::DirToDir { source } => {
                Box::new(dir::DirSession::open(source, destination)?)
            }
            TransferKind::BufferToFile { data } => {
                Box::new(file::BufferSession::open(Arc::clone(data), destination)?)
            }
            TransferKind::PathToFile { source } => {
                Box::new(file::FileSession::open(source, destination)?)
            }
        })
    }
}
