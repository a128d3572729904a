#![allow(dead_code)]

use std::fs;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{bail, Result};
use mlc_core::notifier::wait_readable;
use mlc_core::{
    Allocation, AutoDestination, EventLoop, Interest, MediaPriority, MediaType, Readiness,
    StorageManager, WorkItem, Workshop, WorkshopConfig,
};
use parking_lot::{Condvar, Mutex};

pub const INTERNAL_1: MediaPriority = MediaPriority::new(MediaType::INTERNAL, 1);
pub const EXTERNAL_1: MediaPriority = MediaPriority::new(MediaType::EXTERNAL, 1);
pub const EXTERNAL_2: MediaPriority = MediaPriority::new(MediaType::EXTERNAL, 2);

/// Allocations for this class wait until [`TestStorage::release`].
pub const HOLD_CLASS: &str = "hold";

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Medium {
    priority: MediaPriority,
    root: PathBuf,
    active: bool,
}

struct StorageState {
    media: Vec<Medium>,
    current: MediaPriority,
    holding: bool,
}

/// Storage manager over plain directories. Each medium is a directory
/// under the scratch root; one of them is "current".
pub struct TestStorage {
    state: Mutex<StorageState>,
    gate: Condvar,
}

impl TestStorage {
    pub fn new(scratch: &Path, priorities: &[MediaPriority]) -> Result<Arc<Self>> {
        let mut media = Vec::with_capacity(priorities.len());
        for priority in priorities {
            let root = scratch.join(format!("media-{}-{}", priority.media_type.0, priority.rank));
            fs::create_dir_all(&root)?;
            media.push(Medium {
                priority: *priority,
                root,
                active: true,
            });
        }
        let current = priorities.first().copied().unwrap_or(MediaPriority::UNSET);
        Ok(Arc::new(Self {
            state: Mutex::new(StorageState {
                media,
                current,
                holding: false,
            }),
            gate: Condvar::new(),
        }))
    }

    pub fn root_of(&self, priority: MediaPriority) -> PathBuf {
        let state = self.state.lock();
        state
            .media
            .iter()
            .find(|medium| medium.priority == priority)
            .map(|medium| medium.root.clone())
            .unwrap_or_default()
    }

    pub fn switch_to(&self, priority: MediaPriority) {
        self.state.lock().current = priority;
    }

    pub fn deactivate(&self, priority: MediaPriority) {
        let mut state = self.state.lock();
        for medium in state.media.iter_mut().filter(|m| m.priority == priority) {
            medium.active = false;
        }
    }

    pub fn hold(&self) {
        self.state.lock().holding = true;
    }

    pub fn release(&self) {
        self.state.lock().holding = false;
        self.gate.notify_all();
    }
}

impl StorageManager for TestStorage {
    fn allocate_destination(
        &self,
        media_type: MediaType,
        class: &str,
        source_priority: MediaPriority,
    ) -> Result<Allocation> {
        let mut state = self.state.lock();
        if class == HOLD_CLASS {
            while state.holding {
                self.gate.wait(&mut state);
            }
        }

        let usable = |medium: &&Medium| {
            medium.active
                && medium.priority != source_priority
                && (media_type == MediaType::UNSET || medium.priority.media_type == media_type)
        };
        let chosen = state
            .media
            .iter()
            .filter(usable)
            .find(|medium| medium.priority == state.current)
            .or_else(|| state.media.iter().find(usable));
        let Some(medium) = chosen else {
            bail!("no usable medium for class {class}");
        };

        let directory = medium.root.join(class);
        fs::create_dir_all(&directory)?;
        Ok(Allocation {
            directory,
            priority: medium.priority,
        })
    }

    fn check_media_priority(&self, _media_type: MediaType, priority: MediaPriority) -> bool {
        self.state
            .lock()
            .media
            .iter()
            .any(|medium| medium.active && medium.priority == priority)
    }
}

/// Event loop that only remembers what was registered; tests drive
/// completions with [`pump_until`].
#[derive(Default)]
pub struct RecordingLoop {
    pub registered: Mutex<Vec<RawFd>>,
}

impl EventLoop for RecordingLoop {
    fn register(&self, fd: RawFd, interest: Interest) -> Result<()> {
        assert_eq!(interest, Interest::Readable);
        self.registered.lock().push(fd);
        Ok(())
    }

    fn unregister(&self, fd: RawFd) -> Result<()> {
        self.registered.lock().retain(|&held| held != fd);
        Ok(())
    }
}

pub fn start_workshop(
    workers: usize,
    storage: Arc<TestStorage>,
) -> Result<(Arc<Workshop>, Arc<RecordingLoop>)> {
    let config = WorkshopConfig {
        workers,
        buffer_size: Some(8 * 1024),
        ..WorkshopConfig::default()
    };
    start_workshop_with(config, storage)
}

pub fn start_workshop_with(
    config: WorkshopConfig,
    storage: Arc<TestStorage>,
) -> Result<(Arc<Workshop>, Arc<RecordingLoop>)> {
    let workshop = Workshop::new(config, storage)?;
    let event_loop = Arc::new(RecordingLoop::default());
    workshop.initialize(event_loop.clone())?;
    Ok((workshop, event_loop))
}

/// Poll the completion descriptor and dispatch until `done` holds.
pub fn pump_until(workshop: &Workshop, mut done: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        if Instant::now() > deadline {
            bail!("timed out waiting for completions");
        }
        if wait_readable(workshop.descriptor(), 20)? {
            workshop.process(Readiness::readable());
        }
    }
    Ok(())
}

/// An item that parks its worker inside storage allocation until
/// [`TestStorage::release`] is called.
pub fn blocker() -> WorkItem {
    WorkItem::buffer_to_storage(vec![0u8; 16], AutoDestination::new(HOLD_CLASS, "blocker.bin"))
}
