//! Fixed pool of transfer workers.
//!
//! Every worker owns a mailbox that carries both the jobs dispatched to it
//! and broadcast control signals, in the order they were issued. A Cancel
//! or Vanish sent after an item was queued therefore sits behind that item
//! in the mailbox of the one worker that will run it. Finished items come
//! back through the completed queue and the event loop is woken through the
//! [`CompletionNotifier`] descriptor.

mod worker;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use eyre::{Context, Result};
use parking_lot::Mutex;

use crate::buffer::BufferSizer;
use crate::config::WorkshopConfig;
use crate::errors::WorkshopError;
use crate::event_loop::{EventLoop, Interest, Readiness};
use crate::notifier::CompletionNotifier;
use crate::signal::{ControlSignal, StorageEvent};
use crate::storage::StorageManager;
use crate::transfer_queue::TransferQueue;
use crate::work_item::WorkItem;

use worker::Worker;

/// Opaque handle naming one submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Invoked once per finished item, on the thread that calls
/// [`Workshop::process`]. Never invoked concurrently.
pub type CompletionCallback = Box<dyn FnMut(ClientId, WorkItem) + Send>;

type SharedCallback = Arc<Mutex<CompletionCallback>>;

const MAX_TAG: u8 = u8::MAX;

pub(crate) struct Job {
    pub(crate) client: ClientId,
    pub(crate) item: Box<WorkItem>,
}

/// One message in a worker mailbox.
pub(crate) enum Mail {
    Job(Job),
    Signal(ControlSignal),
}

type Mailbox = Arc<TransferQueue<Mail>>;

/// State the worker threads share with the pool.
pub(crate) struct Shared {
    pub(crate) completed: TransferQueue<Job>,
    pub(crate) notifier: CompletionNotifier,
    pub(crate) storage: Arc<dyn StorageManager>,
}

struct ClientEntry {
    outstanding: usize,
    callback: Option<SharedCallback>,
    tags: Vec<u8>,
}

struct ClientTable {
    entries: HashMap<ClientId, ClientEntry>,
    next_tag: u8,
}

impl ClientTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_tag: 1,
        }
    }

    /// Hand out `count` tags not held by any outstanding item. Tag 0 is
    /// never used; the cursor rotates so freed tags are not reused at once.
    fn allocate_tags(&mut self, count: usize) -> Option<Vec<u8>> {
        let in_use: HashSet<u8> = self
            .entries
            .values()
            .flat_map(|entry| entry.tags.iter().copied())
            .collect();
        if in_use.len() + count > MAX_TAG as usize {
            return None;
        }

        let mut tags = Vec::with_capacity(count);
        let mut cursor = self.next_tag;
        for _ in 0..MAX_TAG {
            if tags.len() == count {
                break;
            }
            if !in_use.contains(&cursor) {
                tags.push(cursor);
            }
            cursor = if cursor == MAX_TAG { 1 } else { cursor + 1 };
        }
        if tags.len() < count {
            return None;
        }
        self.next_tag = cursor;
        Some(tags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    ShutDown,
}

struct PoolState {
    phase: Phase,
    mailboxes: Vec<Mailbox>,
    threads: Vec<JoinHandle<()>>,
    event_loop: Option<Arc<dyn EventLoop>>,
}

impl PoolState {
    fn check_running(&self) -> Result<(), WorkshopError> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::Idle => Err(WorkshopError::NotInitialized),
            Phase::ShutDown => Err(WorkshopError::ShutDown),
        }
    }
}

/// The worker pool. Lock order is `clients` before `state`.
pub struct Workshop {
    config: WorkshopConfig,
    shared: Arc<Shared>,
    state: Mutex<PoolState>,
    clients: Mutex<ClientTable>,
    next_worker: AtomicUsize,
    next_client: AtomicU64,
    // Serialises completion draining so callbacks never overlap.
    dispatch: Mutex<()>,
}

impl Workshop {
    pub fn new(config: WorkshopConfig, storage: Arc<dyn StorageManager>) -> Result<Arc<Self>> {
        let notifier = CompletionNotifier::new().wrap_err("failed to create completion pipe")?;
        Ok(Arc::new(Self {
            config,
            shared: Arc::new(Shared {
                completed: TransferQueue::new(),
                notifier,
                storage,
            }),
            state: Mutex::new(PoolState {
                phase: Phase::Idle,
                mailboxes: Vec::new(),
                threads: Vec::new(),
                event_loop: None,
            }),
            clients: Mutex::new(ClientTable::new()),
            next_worker: AtomicUsize::new(0),
            next_client: AtomicU64::new(1),
            dispatch: Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &WorkshopConfig {
        &self.config
    }

    /// Descriptor that turns readable when completions are waiting.
    pub fn descriptor(&self) -> RawFd {
        self.shared.notifier.as_raw_fd()
    }

    pub fn new_client(&self) -> ClientId {
        ClientId(self.next_client.fetch_add(1, Ordering::Relaxed))
    }

    /// Start the worker threads and register the completion descriptor.
    /// Fails if the pool is already running or has been shut down.
    pub fn initialize(&self, event_loop: Arc<dyn EventLoop>) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Idle => {}
            Phase::Running => return Err(WorkshopError::AlreadyInitialized.into()),
            Phase::ShutDown => return Err(WorkshopError::ShutDown.into()),
        }

        let workers = self.config.workers.max(1);
        let buffer_size = BufferSizer::new().worker_buffer_size(self.config.buffer_size, workers);

        event_loop
            .register(self.descriptor(), Interest::Readable)
            .wrap_err("failed to register completion descriptor")?;

        let mut mailboxes = Vec::with_capacity(workers);
        let mut threads = Vec::with_capacity(workers);
        for idx in 0..workers {
            let mailbox = Arc::new(TransferQueue::new());
            let worker = Worker {
                idx,
                mailbox: Arc::clone(&mailbox),
                shared: Arc::clone(&self.shared),
                buffer: vec![0u8; buffer_size],
                backlog: VecDeque::new(),
            };
            let spawned = thread::Builder::new()
                .name(format!("mlc-worker-{idx}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => {
                    mailboxes.push(mailbox);
                    threads.push(handle);
                }
                Err(err) => {
                    stop_workers(&mailboxes, threads);
                    if let Err(unreg) = event_loop.unregister(self.descriptor()) {
                        log::warn!("failed to unregister completion descriptor: {unreg:#}");
                    }
                    return Err(err).wrap_err_with(|| format!("failed to spawn worker {idx}"));
                }
            }
        }

        log::info!("workshop started: {workers} workers, {buffer_size} byte buffers");
        state.mailboxes = mailboxes;
        state.threads = threads;
        state.event_loop = Some(event_loop);
        state.phase = Phase::Running;
        Ok(())
    }

    /// Register `client` and queue its items. Items are tagged here and
    /// spread round-robin over the workers.
    pub fn submit(
        &self,
        client: ClientId,
        callback: CompletionCallback,
        items: Vec<WorkItem>,
    ) -> Result<(), WorkshopError> {
        let mut clients = self.clients.lock();
        if clients.entries.contains_key(&client) {
            return Err(WorkshopError::ClientExists(client));
        }
        let state = self.state.lock();
        state.check_running()?;

        if items.is_empty() {
            log::debug!("client {client} submitted no items");
            return Ok(());
        }

        let tags = clients
            .allocate_tags(items.len())
            .ok_or(WorkshopError::TagsExhausted)?;
        clients.entries.insert(
            client,
            ClientEntry {
                outstanding: items.len(),
                callback: Some(Arc::new(Mutex::new(callback))),
                tags: tags.clone(),
            },
        );

        log::debug!("client {client} submitted {} items", items.len());
        for (mut item, tag) in items.into_iter().zip(tags) {
            item.set_tag(tag);
            self.dispatch_item(&state, client, item);
        }
        Ok(())
    }

    /// Queue one more item for a client that still has items outstanding.
    pub fn add_item(&self, client: ClientId, mut item: WorkItem) -> Result<(), WorkshopError> {
        let mut clients = self.clients.lock();
        let state = self.state.lock();
        state.check_running()?;
        if !clients.entries.contains_key(&client) {
            return Err(WorkshopError::UnknownClient(client));
        }

        let tag = clients
            .allocate_tags(1)
            .and_then(|tags| tags.first().copied())
            .ok_or(WorkshopError::TagsExhausted)?;
        if let Some(entry) = clients.entries.get_mut(&client) {
            entry.outstanding += 1;
            entry.tags.push(tag);
        }

        item.set_tag(tag);
        self.dispatch_item(&state, client, item);
        Ok(())
    }

    fn dispatch_item(&self, state: &PoolState, client: ClientId, item: WorkItem) {
        let slot = self.next_worker.fetch_add(1, Ordering::Relaxed) % state.mailboxes.len();
        state.mailboxes[slot].push(Mail::Job(Job {
            client,
            item: Box::new(item),
        }));
    }

    /// Ask every worker to cancel each item `client` still owns. Returns
    /// without waiting; cancelled items come back through the callback.
    pub fn cancel(&self, client: ClientId) -> Result<(), WorkshopError> {
        let clients = self.clients.lock();
        let entry = clients
            .entries
            .get(&client)
            .ok_or(WorkshopError::UnknownClient(client))?;
        let state = self.state.lock();
        state.check_running()?;

        log::debug!("cancelling {} items of client {client}", entry.tags.len());
        for &tag in &entry.tags {
            let signal = ControlSignal::Cancel { tag };
            for mailbox in &state.mailboxes {
                mailbox.push(Mail::Signal(signal));
            }
        }
        Ok(())
    }

    /// Forget the callback of `client`. Its items keep running; their
    /// completions are dropped.
    pub fn detach(&self, client: ClientId) {
        if let Some(entry) = self.clients.lock().entries.get_mut(&client) {
            entry.callback = None;
        }
    }

    pub fn outstanding(&self, client: ClientId) -> usize {
        self.clients
            .lock()
            .entries
            .get(&client)
            .map_or(0, |entry| entry.outstanding)
    }

    /// Deliver `signal` to every worker.
    pub fn broadcast(&self, signal: ControlSignal) {
        let state = self.state.lock();
        if state.phase != Phase::Running {
            log::debug!("workshop not running; dropping {signal:?}");
            return;
        }
        for mailbox in &state.mailboxes {
            mailbox.push(Mail::Signal(signal));
        }
    }

    pub fn on_storage_event(&self, event: StorageEvent) {
        log::info!("storage event: {event:?}");
        self.broadcast(event.into_signal());
    }

    /// Readiness handler for [`descriptor`](Self::descriptor).
    pub fn process(&self, events: Readiness) {
        self.on_completion_event(events);
    }

    /// Drain the completed queue and hand each item to its client.
    pub fn on_completion_event(&self, events: Readiness) {
        if events.error || events.hangup {
            log::warn!("completion descriptor reported {events:?}");
        }
        let _dispatching = self.dispatch.lock();
        // Acknowledge before draining: anything finishing later wakes the loop again.
        self.shared.notifier.acknowledge();

        while let Some(job) = self.shared.completed.pop(false) {
            self.deliver(job);
        }
    }

    fn deliver(&self, job: Job) {
        let Job { client, item } = job;
        let tag = item.tag();

        let callback = {
            let clients = self.clients.lock();
            match clients.entries.get(&client) {
                Some(entry) => entry.callback.clone(),
                None => {
                    log::debug!("dropping stray completion for client {client} (tag {tag:?})");
                    return;
                }
            }
        };

        match callback {
            Some(callback) => {
                let mut callback = callback.lock();
                (*callback)(client, *item);
            }
            None => log::debug!(
                "client {client} detached; dropping {} item in state {}",
                item.kind_name(),
                item.state()
            ),
        }

        let mut clients = self.clients.lock();
        let emptied = match clients.entries.get_mut(&client) {
            Some(entry) => {
                if let Some(tag) = tag {
                    if let Some(pos) = entry.tags.iter().position(|&held| held == tag) {
                        entry.tags.swap_remove(pos);
                    }
                }
                entry.outstanding = entry.outstanding.saturating_sub(1);
                entry.outstanding == 0
            }
            None => false,
        };
        if emptied {
            clients.entries.remove(&client);
            log::debug!("client {client} has no outstanding items");
        }
    }

    /// Stop and join every worker, then drop whatever is still queued.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        let (mailboxes, threads, event_loop) = {
            let mut state = self.state.lock();
            let was_running = state.phase == Phase::Running;
            state.phase = Phase::ShutDown;
            if !was_running {
                return;
            }
            (
                std::mem::take(&mut state.mailboxes),
                std::mem::take(&mut state.threads),
                state.event_loop.take(),
            )
        };

        log::info!("workshop shutting down {} workers", threads.len());
        stop_workers(&mailboxes, threads);

        let (mut queued, mut signals) = (0usize, 0usize);
        for mail in mailboxes.iter().flat_map(|mailbox| mailbox.drain()) {
            match mail {
                Mail::Job(_) => queued += 1,
                Mail::Signal(_) => signals += 1,
            }
        }
        let completed = self.shared.completed.drain().len();
        if queued + completed > 0 {
            log::warn!("dropped {queued} queued and {completed} undelivered items at shutdown");
        }
        log::debug!("dropped {signals} queued control signals");

        self.clients.lock().entries.clear();
        if let Some(event_loop) = event_loop {
            if let Err(err) = event_loop.unregister(self.descriptor()) {
                log::warn!("failed to unregister completion descriptor: {err:#}");
            }
        }
    }
}

impl Drop for Workshop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop_workers(mailboxes: &[Mailbox], threads: Vec<JoinHandle<()>>) {
    for mailbox in mailboxes {
        mailbox.push(Mail::Signal(ControlSignal::Stop));
    }
    for handle in threads {
        let name = handle.thread().name().unwrap_or("mlc-worker").to_string();
        if let Err(err) = handle.join() {
            log::error!("{name} panicked: {err:?}");
        }
    }
}
