//! Groups work items into one operation with a single aggregate outcome.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use eyre::{bail, Result};
use parking_lot::{Condvar, Mutex};

use crate::storage::StorageManager;
use crate::work_item::{ItemState, WorkItem};
use crate::workshop::{ClientId, CompletionCallback, Workshop};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Success,
    Failure,
    Cancelled,
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransactionOutcome::Success => "SUCCESS",
            TransactionOutcome::Failure => "FAILURE",
            TransactionOutcome::Cancelled => "CANCELLED",
        };
        f.write_str(text)
    }
}

/// Per-transaction counters, handed to the reporter with the outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionSummary {
    /// Items accepted by `add` and submitted.
    pub items: usize,
    pub done: usize,
    pub failed: usize,
    pub resubmitted: usize,
    /// Bytes moved by Done and Failed items.
    pub bytes: u64,
}

pub type Reporter = Box<dyn FnOnce(TransactionOutcome, TransactionSummary) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Building,
    Executing,
    Reported,
}

struct Inner {
    phase: Phase,
    items: Vec<WorkItem>,
    outstanding: usize,
    summary: TransactionSummary,
    outcome: Option<TransactionOutcome>,
    reporter: Option<Reporter>,
}

impl Inner {
    /// Move to Reported and hand back the reporter; the caller runs it
    /// after releasing the lock.
    fn conclude(&mut self, outcome: TransactionOutcome) -> Option<Reporter> {
        self.phase = Phase::Reported;
        self.outcome = Some(outcome);
        self.reporter.take()
    }
}

struct Progress {
    inner: Mutex<Inner>,
    finished: Condvar,
}

impl Progress {
    fn report(
        &self,
        reporter: Option<Reporter>,
        outcome: TransactionOutcome,
        summary: TransactionSummary,
    ) {
        log::info!(
            "transaction {outcome}: {} items, {} done, {} failed, {} resubmitted, {} bytes",
            summary.items,
            summary.done,
            summary.failed,
            summary.resubmitted,
            summary.bytes
        );
        self.finished.notify_all();
        if let Some(reporter) = reporter {
            reporter(outcome, summary);
        }
    }
}

/// Everything the completion callback needs; it outlives the
/// [`Transaction`] handle if that is dropped early.
struct Completion {
    progress: Arc<Progress>,
    workshop: Weak<Workshop>,
    storage: Arc<dyn StorageManager>,
    max_resubmits: u8,
}

pub struct Transaction {
    workshop: Arc<Workshop>,
    storage: Arc<dyn StorageManager>,
    client: ClientId,
    progress: Arc<Progress>,
}

impl Transaction {
    pub fn new(
        workshop: Arc<Workshop>,
        storage: Arc<dyn StorageManager>,
        reporter: impl FnOnce(TransactionOutcome, TransactionSummary) + Send + 'static,
    ) -> Self {
        let client = workshop.new_client();
        Self {
            workshop,
            storage,
            client,
            progress: Arc::new(Progress {
                inner: Mutex::new(Inner {
                    phase: Phase::Building,
                    items: Vec::new(),
                    outstanding: 0,
                    summary: TransactionSummary::default(),
                    outcome: None,
                    reporter: Some(Box::new(reporter)),
                }),
                finished: Condvar::new(),
            }),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Prepare and validate `items`, keeping the ones that pass. Returns how
    /// many were kept.
    pub fn add(&self, items: Vec<WorkItem>) -> usize {
        let mut inner = self.progress.inner.lock();
        if inner.phase != Phase::Building {
            log::warn!(
                "transaction {} already started; ignoring {} items",
                self.client,
                items.len()
            );
            return 0;
        }

        let mut kept = 0;
        for mut item in items {
            match admit(&mut item, self.storage.as_ref()) {
                Ok(()) => {
                    inner.items.push(item);
                    kept += 1;
                }
                Err(err) => log::warn!("dropping {} item: {err:#}", item.kind_name()),
            }
        }
        kept
    }

    /// Submit the accepted items. With nothing to run the transaction
    /// reports FAILURE straight away.
    pub fn execute(&self) -> Result<()> {
        let mut inner = self.progress.inner.lock();
        if inner.phase != Phase::Building {
            bail!("transaction {} already started", self.client);
        }

        let items = std::mem::take(&mut inner.items);
        if items.is_empty() {
            log::warn!("transaction {} has no valid items", self.client);
            let reporter = inner.conclude(TransactionOutcome::Failure);
            let summary = inner.summary;
            drop(inner);
            self.progress.report(reporter, TransactionOutcome::Failure, summary);
            return Ok(());
        }

        inner.phase = Phase::Executing;
        inner.outstanding = items.len();
        inner.summary.items = items.len();

        let completion = Completion {
            progress: Arc::clone(&self.progress),
            workshop: Arc::downgrade(&self.workshop),
            storage: Arc::clone(&self.storage),
            max_resubmits: self.workshop.config().max_resubmits,
        };
        let callback: CompletionCallback =
            Box::new(move |client, item| completion.on_item_done(client, item));

        // Completions are only drained by `Workshop::process`, which takes
        // this lock before touching the counters.
        if let Err(err) = self.workshop.submit(self.client, callback, items) {
            let reporter = inner.conclude(TransactionOutcome::Failure);
            let summary = inner.summary;
            drop(inner);
            self.progress.report(reporter, TransactionOutcome::Failure, summary);
            return Err(err.into());
        }
        log::debug!("transaction {} executing {} items", self.client, inner.outstanding);
        Ok(())
    }

    /// Cancel a running transaction and report CANCELLED. Returns false if
    /// it was not executing.
    pub fn cancel(&self) -> bool {
        let mut inner = self.progress.inner.lock();
        if inner.phase != Phase::Executing {
            return false;
        }
        let reporter = inner.conclude(TransactionOutcome::Cancelled);
        let summary = inner.summary;
        drop(inner);

        if let Err(err) = self.workshop.cancel(self.client) {
            log::debug!("cancel of {}: {err}", self.client);
        }
        self.progress.report(reporter, TransactionOutcome::Cancelled, summary);
        true
    }

    pub fn outcome(&self) -> Option<TransactionOutcome> {
        self.progress.inner.lock().outcome
    }

    pub fn summary(&self) -> TransactionSummary {
        self.progress.inner.lock().summary
    }

    /// Items submitted and not yet returned, resubmissions included.
    pub fn outstanding(&self) -> usize {
        self.progress.inner.lock().outstanding
    }

    /// Block until the outcome is known or `timeout` passes. Someone else
    /// must keep driving [`Workshop::process`].
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransactionOutcome> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.progress.inner.lock();
        while inner.outcome.is_none() {
            if self.progress.finished.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.outcome
    }
}

impl Completion {
    fn on_item_done(&self, client: ClientId, item: WorkItem) {
        let mut inner = self.progress.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if inner.phase != Phase::Executing {
            log::debug!(
                "transaction {client} already {:?}; {} item ended {}",
                inner.outcome,
                item.kind_name(),
                item.state()
            );
            return;
        }

        match item.state() {
            ItemState::Done => {
                inner.summary.done += 1;
                inner.summary.bytes += item.bytes_transferred();
                if let Err(err) = item.complete_move() {
                    log::warn!("{err:#}");
                }
            }
            ItemState::Failed => {
                inner.summary.failed += 1;
                inner.summary.bytes += item.bytes_transferred();
            }
            ItemState::SrcVanish | ItemState::DestVanish => {
                log::warn!("{} item ended {}", item.kind_name(), item.state());
                inner.summary.failed += 1;
            }
            state if state.is_resubmittable() => {
                let kind = item.kind_name();
                // Counted as outstanding before add_item so the total never
                // touches zero across the hand-off.
                inner.outstanding += 1;
                match self.resubmit(client, item) {
                    Ok(()) => inner.summary.resubmitted += 1,
                    Err(err) => {
                        log::warn!("could not resubmit {kind} item: {err:#}");
                        inner.outstanding -= 1;
                        inner.summary.failed += 1;
                    }
                }
            }
            other => {
                log::error!("{} item returned in non-final state {other}", item.kind_name());
                inner.summary.failed += 1;
            }
        }

        if inner.outstanding > 0 {
            return;
        }
        let outcome = if inner.summary.failed == 0 {
            TransactionOutcome::Success
        } else {
            TransactionOutcome::Failure
        };
        let reporter = inner.conclude(outcome);
        let summary = inner.summary;
        drop(inner);
        self.progress.report(reporter, outcome, summary);
    }

    fn resubmit(&self, client: ClientId, mut item: WorkItem) -> Result<()> {
        if !item.is_auto_destination() {
            bail!("{} on a fixed destination", item.state());
        }
        if item.resubmits() >= self.max_resubmits {
            bail!("resubmitted {} times already", item.resubmits());
        }
        let Some(workshop) = self.workshop.upgrade() else {
            bail!("workshop is gone");
        };

        item.reset_for_resubmit();
        admit(&mut item, self.storage.as_ref())?;
        workshop.add_item(client, item)?;
        Ok(())
    }
}

/// Allocate an auto destination if needed, then check both ends.
fn admit(item: &mut WorkItem, storage: &dyn StorageManager) -> Result<()> {
    if item.is_auto_destination() && item.destination().is_none() {
        item.prepare(storage)?;
    }
    item.check_source()?;
    item.check_destination()?;

    let destination = item.destination_priority();
    if destination.is_unset() {
        return Ok(());
    }
    if destination == item.source_priority() {
        bail!("source and destination share medium {destination}");
    }
    if !storage.check_media_priority(destination.media_type, destination) {
        bail!("destination medium {destination} is not usable");
    }
    Ok(())
}
