//! Contract of the storage manager that owns the log media.

use std::path::PathBuf;

use eyre::Result;

use crate::signal::{MediaPriority, MediaType};

/// A destination directory handed out by the storage manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub directory: PathBuf,
    pub priority: MediaPriority,
}

/// Allocates and validates storage media for auto-destination work items.
///
/// Media change notifications travel the other way: the embedder turns them
/// into [`StorageEvent`](crate::signal::StorageEvent)s and hands them to
/// [`Workshop::on_storage_event`](crate::workshop::Workshop::on_storage_event).
pub trait StorageManager: Send + Sync {
    /// Pick a directory for output of `class`, preferring `media_type`
    /// (`MediaType::UNSET` for any) and never the medium the source lives on.
    fn allocate_destination(
        &self,
        media_type: MediaType,
        class: &str,
        source_priority: MediaPriority,
    ) -> Result<Allocation>;

    /// Whether the medium `priority` of `media_type` is still usable.
    fn check_media_priority(&self, media_type: MediaType, priority: MediaPriority) -> bool;
}
