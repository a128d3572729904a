//! One source -> destination transfer and its state machine.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, Context, Result};

use crate::errors::{ErrorCategory, TransferFailure, TransferSide};
use crate::signal::{ControlSignal, MediaPriority, MediaType};
use crate::storage::StorageManager;
use crate::transfer::{Chunk, ChunkCopy, TransferKind};

/// Lifecycle of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ItemState {
    #[default]
    Wait,
    OnGoing,
    /// Stopped before doing anything useful (pool shutdown).
    NoWorkload,
    SrcVanish,
    /// A caller-supplied destination vanished.
    DestVanish,
    /// An auto-allocated destination vanished; may be resubmitted.
    CommonDestVanish,
    /// The storage manager switched media; may be resubmitted.
    CommonDestChange,
    Clean,
    Cancelled,
    Failed,
    Done,
}

impl ItemState {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Wait | Self::OnGoing)
    }

    /// Terminal for this attempt only; the owner may re-prepare and resubmit.
    pub const fn is_resubmittable(&self) -> bool {
        matches!(self, Self::CommonDestVanish | Self::CommonDestChange)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::OnGoing => "ongoing",
            Self::NoWorkload => "no-workload",
            Self::SrcVanish => "src-vanish",
            Self::DestVanish => "dest-vanish",
            Self::CommonDestVanish => "common-dest-vanish",
            Self::CommonDestChange => "common-dest-change",
            Self::Clean => "clean",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an auto-destination item asks the storage manager to put its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoDestination {
    /// Preferred media family; `MediaType::UNSET` lets the manager choose.
    pub media_type: MediaType,
    /// Storage class (e.g. "modem", "ap") the manager files the output under.
    pub class: String,
    /// File or directory name created inside the allocated directory.
    pub name: PathBuf,
}

impl AutoDestination {
    pub fn new(class: impl Into<String>, name: impl Into<PathBuf>) -> Self {
        Self {
            media_type: MediaType::UNSET,
            class: class.into(),
            name: name.into(),
        }
    }

    pub fn on_media(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }
}

pub struct WorkItem {
    kind: TransferKind,
    state: ItemState,
    destination: Option<PathBuf>,
    auto_destination: Option<AutoDestination>,
    source_priority: MediaPriority,
    destination_priority: MediaPriority,
    tag: Option<u8>,
    remove_source: bool,
    bytes_transferred: u64,
    resubmits: u8,
    session: Option<Box<dyn ChunkCopy>>,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("kind", &self.kind.name())
            .field("state", &self.state)
            .field("tag", &self.tag)
            .field("destination", &self.destination)
            .field("auto", &self.auto_destination.is_some())
            .field("src_prio", &self.source_priority)
            .field("dst_prio", &self.destination_priority)
            .finish()
    }
}

impl WorkItem {
    fn with_kind(kind: TransferKind, destination: Option<PathBuf>) -> Self {
        Self {
            kind,
            state: ItemState::Wait,
            destination,
            auto_destination: None,
            source_priority: MediaPriority::UNSET,
            destination_priority: MediaPriority::UNSET,
            tag: None,
            remove_source: false,
            bytes_transferred: 0,
            resubmits: 0,
            session: None,
        }
    }

    pub fn path_to_file(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::with_kind(
            TransferKind::PathToFile {
                source: source.into(),
            },
            Some(destination.into()),
        )
    }

    pub fn buffer_to_file(data: impl Into<Arc<[u8]>>, destination: impl Into<PathBuf>) -> Self {
        Self::with_kind(
            TransferKind::BufferToFile { data: data.into() },
            Some(destination.into()),
        )
    }

    pub fn dir_to_dir(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::with_kind(
            TransferKind::DirToDir {
                source: source.into(),
            },
            Some(destination.into()),
        )
    }

    pub fn path_to_storage(source: impl Into<PathBuf>, auto: AutoDestination) -> Self {
        let mut item = Self::with_kind(
            TransferKind::PathToFile {
                source: source.into(),
            },
            None,
        );
        item.auto_destination = Some(auto);
        item
    }

    pub fn buffer_to_storage(data: impl Into<Arc<[u8]>>, auto: AutoDestination) -> Self {
        let mut item = Self::with_kind(TransferKind::BufferToFile { data: data.into() }, None);
        item.auto_destination = Some(auto);
        item
    }

    pub fn dir_to_storage(source: impl Into<PathBuf>, auto: AutoDestination) -> Self {
        let mut item = Self::with_kind(
            TransferKind::DirToDir {
                source: source.into(),
            },
            None,
        );
        item.auto_destination = Some(auto);
        item
    }

    pub fn with_source_priority(mut self, priority: MediaPriority) -> Self {
        self.source_priority = priority;
        self
    }

    /// Priority of a caller-supplied destination. Auto destinations get
    /// theirs from the storage manager in `prepare()`.
    pub fn with_destination_priority(mut self, priority: MediaPriority) -> Self {
        self.destination_priority = priority;
        self
    }

    /// Remove the source once the transfer is done (move instead of copy).
    pub fn remove_source_on_done(mut self) -> Self {
        self.remove_source = true;
        self
    }

    pub fn state(&self) -> ItemState {
        self.state
    }

    pub fn tag(&self) -> Option<u8> {
        self.tag
    }

    pub fn kind(&self) -> &TransferKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    pub fn is_auto_destination(&self) -> bool {
        self.auto_destination.is_some()
    }

    pub fn source_priority(&self) -> MediaPriority {
        self.source_priority
    }

    pub fn destination_priority(&self) -> MediaPriority {
        self.destination_priority
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn resubmits(&self) -> u8 {
        self.resubmits
    }

    pub(crate) fn set_tag(&mut self, tag: u8) {
        self.tag = Some(tag);
    }

    pub(crate) fn set_state(&mut self, state: ItemState) {
        self.state = state;
    }

    pub fn check_source(&self) -> Result<()> {
        let Some(source) = self.kind.source_path() else {
            return Ok(());
        };
        let meta = fs::metadata(source)
            .wrap_err_with(|| format!("source {} is not accessible", source.display()))?;
        match &self.kind {
            TransferKind::DirToDir { .. } if !meta.is_dir() => {
                bail!("source {} is not a directory", source.display())
            }
            TransferKind::PathToFile { .. } if !meta.is_file() => {
                bail!("source {} is not a regular file", source.display())
            }
            _ => Ok(()),
        }
    }

    pub fn check_destination(&self) -> Result<()> {
        let Some(destination) = self.destination.as_deref() else {
            bail!("destination has not been allocated");
        };
        if let Some(source) = self.kind.source_path() {
            if destination == source {
                bail!("source and destination are both {}", source.display());
            }
            if matches!(self.kind, TransferKind::DirToDir { .. })
                && destination.starts_with(source)
            {
                bail!(
                    "destination {} lies inside source {}",
                    destination.display(),
                    source.display()
                );
            }
        }
        if destination.is_dir() {
            bail!("destination {} is an existing directory", destination.display());
        }
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                let meta = fs::metadata(parent).wrap_err_with(|| {
                    format!("destination directory {} is not accessible", parent.display())
                })?;
                if !meta.is_dir() {
                    bail!("{} is not a directory", parent.display());
                }
            }
        }
        Ok(())
    }

    /// Allocate the destination of an auto-destination item. A no-op for
    /// items with a caller-supplied destination.
    pub fn prepare(&mut self, storage: &dyn StorageManager) -> Result<()> {
        let Some(auto) = self.auto_destination.as_ref() else {
            return Ok(());
        };
        let allocation = storage
            .allocate_destination(auto.media_type, &auto.class, self.source_priority)
            .wrap_err_with(|| format!("no storage for class {}", auto.class))?;
        self.destination = Some(allocation.directory.join(&auto.name));
        self.destination_priority = allocation.priority;
        log::debug!(
            "allocated {} on media {}",
            allocation.directory.display(),
            allocation.priority
        );
        Ok(())
    }

    /// Interpret one control signal. Returns whether the transfer should keep
    /// going; when it returns false the item is left in a terminal state.
    pub fn inspect(&mut self, signal: ControlSignal) -> bool {
        match signal {
            ControlSignal::None | ControlSignal::NewItem => true,
            ControlSignal::Stop => {
                self.state = ItemState::NoWorkload;
                false
            }
            ControlSignal::Clean => {
                self.state = ItemState::Clean;
                false
            }
            ControlSignal::Cancel { tag } => {
                if self.tag != Some(tag) {
                    return true;
                }
                self.state = ItemState::Cancelled;
                false
            }
            ControlSignal::Vanish(priority) => {
                if priority.is_unset() {
                    return true;
                }
                if priority == self.source_priority {
                    self.state = ItemState::SrcVanish;
                    false
                } else if priority == self.destination_priority {
                    self.mark_destination_vanished();
                    false
                } else {
                    true
                }
            }
            ControlSignal::CommonDestChange(priority) => {
                // Fixed destinations do not follow the storage manager.
                if self.auto_destination.is_none() || priority == self.destination_priority {
                    return true;
                }
                self.state = ItemState::CommonDestChange;
                false
            }
        }
    }

    fn mark_destination_vanished(&mut self) {
        if self.auto_destination.is_some() {
            self.state = ItemState::CommonDestVanish;
            self.destination = None;
        } else {
            self.state = ItemState::DestVanish;
        }
    }

    /// Move the data in chunks of at most `buffer.len()` bytes, draining
    /// `control` before every chunk. Always leaves the item in a terminal
    /// state.
    pub fn run(&mut self, control: &mut dyn FnMut() -> ControlSignal, buffer: &mut [u8]) {
        if buffer.is_empty() {
            log::warn!("refusing to run {} item with an empty buffer", self.kind.name());
            self.state = ItemState::Failed;
            return;
        }
        self.state = ItemState::OnGoing;

        if !self.poll_control(control) {
            return;
        }
        if self.session.is_none() {
            let Some(destination) = self.destination.clone() else {
                log::warn!("{} item has no destination", self.kind.name());
                self.state = ItemState::Failed;
                return;
            };
            match self.kind.open_session(&destination) {
                Ok(session) => self.session = Some(session),
                Err(failure) => {
                    self.fail_with(failure);
                    return;
                }
            }
        }

        loop {
            let Some(session) = self.session.as_mut() else {
                self.state = ItemState::Failed;
                return;
            };
            match session.copy_chunk(buffer) {
                Ok(Chunk::Copied(n)) => self.bytes_transferred += n,
                Ok(Chunk::Complete) => {
                    self.state = ItemState::Done;
                    return;
                }
                Err(failure) => {
                    self.fail_with(failure);
                    return;
                }
            }
            if !self.poll_control(control) {
                return;
            }
        }
    }

    fn poll_control(&mut self, control: &mut dyn FnMut() -> ControlSignal) -> bool {
        loop {
            let signal = control();
            if signal.is_none() {
                return true;
            }
            if !self.inspect(signal) {
                log::debug!(
                    "{} item tag {:?} stopped by {:?} -> {}",
                    self.kind.name(),
                    self.tag,
                    signal,
                    self.state
                );
                return false;
            }
        }
    }

    fn fail_with(&mut self, failure: TransferFailure) {
        match (failure.category(), failure.side) {
            (ErrorCategory::MediaGone, TransferSide::Source) => {
                self.state = ItemState::SrcVanish;
            }
            (ErrorCategory::MediaGone, TransferSide::Destination) => {
                self.mark_destination_vanished();
            }
            (ErrorCategory::Fatal, _) => self.state = ItemState::Failed,
        }
        log::warn!(
            "{} item tag {:?} ended {}: {failure}",
            self.kind.name(),
            self.tag,
            self.state
        );
    }

    /// Close the transfer. A Done item has its output moved into place; if
    /// that fails the item becomes Failed. Other states just drop the staged
    /// output.
    pub fn finish(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if self.state != ItemState::Done {
            return;
        }
        if let Err(failure) = session.commit() {
            log::warn!("could not commit {} item output: {failure}", self.kind.name());
            self.state = ItemState::Failed;
            self.bytes_transferred = 0;
        }
    }

    /// Remove partial output of an abandoned transfer.
    pub fn discard_result(&mut self) {
        if self.session.take().is_some() {
            log::debug!(
                "discarded partial {} output ({} bytes)",
                self.kind.name(),
                self.bytes_transferred
            );
        }
    }

    /// After a successful move-mode transfer, delete the source.
    pub fn complete_move(&self) -> Result<()> {
        if !self.remove_source || self.state != ItemState::Done {
            return Ok(());
        }
        match &self.kind {
            TransferKind::PathToFile { source } => fs::remove_file(source)
                .wrap_err_with(|| format!("failed to remove {}", source.display())),
            TransferKind::DirToDir { source } => fs::remove_dir_all(source)
                .wrap_err_with(|| format!("failed to remove {}", source.display())),
            TransferKind::BufferToFile { .. } => Ok(()),
        }
    }

    /// Put the item back to Wait for another attempt after its destination
    /// vanished or changed.
    pub(crate) fn reset_for_resubmit(&mut self) {
        self.session = None;
        self.state = ItemState::Wait;
        self.bytes_transferred = 0;
        self.resubmits = self.resubmits.saturating_add(1);
        if self.auto_destination.is_some() {
            self.destination = None;
            self.destination_priority = MediaPriority::UNSET;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Allocation;
    use std::collections::VecDeque;

    const INTERNAL_2: MediaPriority = MediaPriority::new(MediaType::INTERNAL, 2);
    const EXTERNAL_1: MediaPriority = MediaPriority::new(MediaType::EXTERNAL, 1);

    struct FixedStorage {
        root: PathBuf,
        priority: MediaPriority,
    }

    impl StorageManager for FixedStorage {
        fn allocate_destination(
            &self,
            _media_type: MediaType,
            class: &str,
            _source_priority: MediaPriority,
        ) -> Result<Allocation> {
            let directory = self.root.join(class);
            fs::create_dir_all(&directory)?;
            Ok(Allocation {
                directory,
                priority: self.priority,
            })
        }

        fn check_media_priority(&self, _media_type: MediaType, priority: MediaPriority) -> bool {
            priority == self.priority
        }
    }

    fn fixed_item() -> WorkItem {
        WorkItem::path_to_file("/data/log/a.log", "/sdcard/log/a.log")
            .with_source_priority(INTERNAL_2)
            .with_destination_priority(EXTERNAL_1)
    }

    fn auto_item() -> WorkItem {
        let auto = AutoDestination::new("modem", "a.log");
        let mut item =
            WorkItem::path_to_storage("/data/log/a.log", auto).with_source_priority(INTERNAL_2);
        item.destination = Some(PathBuf::from("/sdcard/modem/a.log"));
        item.destination_priority = EXTERNAL_1;
        item
    }

    fn scripted(signals: Vec<ControlSignal>) -> impl FnMut() -> ControlSignal {
        let mut queue: VecDeque<ControlSignal> = signals.into();
        move || queue.pop_front().unwrap_or(ControlSignal::None)
    }

    #[test]
    fn none_never_changes_any_state() {
        let states = [
            ItemState::Wait,
            ItemState::OnGoing,
            ItemState::NoWorkload,
            ItemState::SrcVanish,
            ItemState::DestVanish,
            ItemState::CommonDestVanish,
            ItemState::CommonDestChange,
            ItemState::Clean,
            ItemState::Cancelled,
            ItemState::Failed,
            ItemState::Done,
        ];
        for state in states {
            let mut item = fixed_item();
            item.set_state(state);
            assert!(item.inspect(ControlSignal::None));
            assert_eq!(item.state(), state);
        }
    }

    #[test]
    fn stop_and_clean_end_the_transfer() {
        let mut item = fixed_item();
        assert!(!item.inspect(ControlSignal::Stop));
        assert_eq!(item.state(), ItemState::NoWorkload);

        let mut item = fixed_item();
        assert!(!item.inspect(ControlSignal::Clean));
        assert_eq!(item.state(), ItemState::Clean);
    }

    #[test]
    fn vanish_of_source_media() {
        let mut item = fixed_item();
        assert!(!item.inspect(ControlSignal::Vanish(INTERNAL_2)));
        assert_eq!(item.state(), ItemState::SrcVanish);
    }

    #[test]
    fn vanish_of_auto_destination_clears_it() {
        let mut item = auto_item();
        assert!(!item.inspect(ControlSignal::Vanish(EXTERNAL_1)));
        assert_eq!(item.state(), ItemState::CommonDestVanish);
        assert!(item.destination().is_none());
    }

    #[test]
    fn vanish_of_fixed_destination() {
        let mut item = fixed_item();
        assert!(!item.inspect(ControlSignal::Vanish(EXTERNAL_1)));
        assert_eq!(item.state(), ItemState::DestVanish);
        assert!(item.destination().is_some());
    }

    #[test]
    fn vanish_of_unrelated_media_is_ignored() {
        let mut item = fixed_item();
        item.set_state(ItemState::OnGoing);
        let other = MediaPriority::new(MediaType::EXTERNAL, 2);
        assert!(item.inspect(ControlSignal::Vanish(other)));
        assert!(item.inspect(ControlSignal::Vanish(MediaPriority::UNSET)));
        assert_eq!(item.state(), ItemState::OnGoing);
    }

    #[test]
    fn cancel_matches_tag_exactly() {
        let mut five = fixed_item();
        five.set_tag(5);
        let mut seven = fixed_item();
        seven.set_tag(7);
        seven.set_state(ItemState::OnGoing);

        let cancel = ControlSignal::Cancel { tag: 5 };
        assert!(!five.inspect(cancel));
        assert_eq!(five.state(), ItemState::Cancelled);
        assert!(seven.inspect(cancel));
        assert_eq!(seven.state(), ItemState::OnGoing);

        let mut untagged = fixed_item();
        assert!(untagged.inspect(cancel));
    }

    #[test]
    fn common_dest_change_only_moves_auto_items() {
        let moved = MediaPriority::new(MediaType::EXTERNAL, 2);

        let mut auto = auto_item();
        assert!(auto.inspect(ControlSignal::CommonDestChange(EXTERNAL_1)));
        assert!(!auto.inspect(ControlSignal::CommonDestChange(moved)));
        assert_eq!(auto.state(), ItemState::CommonDestChange);

        let mut fixed = fixed_item();
        assert!(fixed.inspect(ControlSignal::CommonDestChange(moved)));
        assert_eq!(fixed.state(), ItemState::Wait);
    }

    #[test]
    fn run_moves_a_file_in_chunks_and_finish_commits() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let src = temp.path().join("a.log");
        let dst = temp.path().join("out/a.log");
        fs::create_dir_all(temp.path().join("out"))?;
        fs::write(&src, vec![5u8; 3000])?;

        let mut item = WorkItem::path_to_file(&src, &dst).remove_source_on_done();
        item.check_source()?;
        item.check_destination()?;

        let mut polls = 0;
        let mut control = || {
            polls += 1;
            ControlSignal::None
        };
        let mut buf = vec![0u8; 1000];
        item.run(&mut control, &mut buf);
        assert_eq!(item.state(), ItemState::Done);
        assert_eq!(item.bytes_transferred(), 3000);
        assert!(polls >= 4);
        assert!(!dst.exists());

        item.finish();
        assert_eq!(item.state(), ItemState::Done);
        assert_eq!(fs::read(&dst)?.len(), 3000);
        item.complete_move()?;
        assert!(!src.exists());
        Ok(())
    }

    #[test]
    fn cancel_mid_run_discards_output() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let dst = temp.path().join("dump.bin");
        let mut item = WorkItem::buffer_to_file(vec![1u8; 4096], &dst);
        item.set_tag(3);

        let mut control = scripted(vec![
            ControlSignal::None,
            ControlSignal::None,
            ControlSignal::Cancel { tag: 9 },
            ControlSignal::Cancel { tag: 3 },
        ]);
        let mut buf = vec![0u8; 512];
        item.run(&mut control, &mut buf);
        assert_eq!(item.state(), ItemState::Cancelled);
        assert!(item.bytes_transferred() > 0 && item.bytes_transferred() < 4096);

        item.discard_result();
        item.finish();
        assert!(!dst.exists());
        assert_eq!(fs::read_dir(temp.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn missing_source_during_run_is_src_vanish() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut item = WorkItem::path_to_file(temp.path().join("gone.log"), temp.path().join("x"));
        let mut control = scripted(Vec::new());
        let mut buf = vec![0u8; 64];
        item.run(&mut control, &mut buf);
        assert_eq!(item.state(), ItemState::SrcVanish);
        Ok(())
    }

    #[test]
    fn prepare_allocates_and_resubmit_resets() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let storage = FixedStorage {
            root: temp.path().to_path_buf(),
            priority: EXTERNAL_1,
        };
        let mut item =
            WorkItem::buffer_to_storage(vec![0u8; 8], AutoDestination::new("modem", "m.bin"));
        assert!(item.check_destination().is_err());

        item.prepare(&storage)?;
        assert_eq!(item.destination(), Some(temp.path().join("modem/m.bin").as_path()));
        assert_eq!(item.destination_priority(), EXTERNAL_1);
        item.check_destination()?;

        item.set_state(ItemState::CommonDestChange);
        item.reset_for_resubmit();
        assert_eq!(item.state(), ItemState::Wait);
        assert_eq!(item.resubmits(), 1);
        assert!(item.destination().is_none());
        assert!(item.destination_priority().is_unset());
        Ok(())
    }

    #[test]
    fn identical_source_and_destination_rejected() {
        let item = WorkItem::path_to_file("/tmp/same.log", "/tmp/same.log");
        assert!(item.check_destination().is_err());

        let nested = WorkItem::dir_to_dir("/tmp/logs", "/tmp/logs/copy");
        assert!(nested.check_destination().is_err());
    }
}
