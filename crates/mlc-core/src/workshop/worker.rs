use std::collections::VecDeque;
use std::sync::Arc;

use crate::signal::ControlSignal;
use crate::transfer_queue::TransferQueue;
use crate::work_item::{ItemState, WorkItem};

use super::{Job, Mail, Shared};

/// One pool thread. Owns its mailbox consumer side and its transfer buffer.
pub(super) struct Worker {
    pub(super) idx: usize,
    pub(super) mailbox: Arc<TransferQueue<Mail>>,
    pub(super) shared: Arc<Shared>,
    pub(super) buffer: Vec<u8>,
    /// Mail pulled off the mailbox mid-transfer from the next queued job
    /// onwards; replayed before the mailbox is read again.
    pub(super) backlog: VecDeque<Mail>,
}

impl Worker {
    pub(super) fn run(mut self) {
        log::debug!("[w{}] started", self.idx);
        loop {
            let mail = match self.backlog.pop_front() {
                Some(mail) => mail,
                None => match self.mailbox.pop(true) {
                    Some(mail) => mail,
                    None => continue,
                },
            };
            match mail {
                Mail::Job(job) => {
                    if !self.take_job(job) {
                        break;
                    }
                }
                Mail::Signal(ControlSignal::Stop) => break,
                Mail::Signal(other) => log::trace!("[w{}] idle, ignoring {:?}", self.idx, other),
            }
        }

        let abandoned = self
            .backlog
            .iter()
            .filter(|mail| matches!(mail, Mail::Job(_)))
            .count();
        if abandoned > 0 {
            log::warn!("[w{}] exiting with {abandoned} queued items", self.idx);
        }
        log::debug!("[w{}] exiting", self.idx);
    }

    /// Run `job` to a terminal state and hand it to the completed queue.
    /// Returns false once a Stop has been consumed.
    fn take_job(&mut self, mut job: Job) -> bool {
        let keep_running = self.execute(&mut job.item);
        log::debug!(
            "[w{}] {} item tag {:?} -> {} ({} bytes)",
            self.idx,
            job.item.kind_name(),
            job.item.tag(),
            job.item.state(),
            job.item.bytes_transferred()
        );

        self.complete(job);
        keep_running
    }

    fn execute(&mut self, item: &mut WorkItem) -> bool {
        if let Err(err) = item.check_source() {
            log::warn!("[w{}] {err:#}", self.idx);
            item.set_state(ItemState::SrcVanish);
            return true;
        }
        if item.is_auto_destination() && item.destination().is_none() {
            if let Err(err) = item.prepare(self.shared.storage.as_ref()) {
                log::warn!("[w{}] {err:#}", self.idx);
                item.set_state(ItemState::Failed);
                return true;
            }
        }
        if let Err(err) = item.check_destination() {
            log::warn!("[w{}] {err:#}", self.idx);
            let state = if item.is_auto_destination() {
                ItemState::CommonDestVanish
            } else {
                ItemState::DestVanish
            };
            item.set_state(state);
            return true;
        }

        let mut deferring = false;
        let mut deferred: Vec<Mail> = Vec::new();
        let mut saw_stop = false;
        {
            let backlog = &mut self.backlog;
            let mailbox = &self.mailbox;
            let mut control = || {
                let Some(mail) = backlog.pop_front().or_else(|| mailbox.pop(false)) else {
                    return ControlSignal::None;
                };
                // From the next queued job on, mail belongs to that job too.
                let signal = match mail {
                    Mail::Job(job) => {
                        deferring = true;
                        deferred.push(Mail::Job(job));
                        return ControlSignal::NewItem;
                    }
                    Mail::Signal(signal) => signal,
                };
                if deferring {
                    deferred.push(Mail::Signal(signal));
                }
                if signal == ControlSignal::Stop {
                    saw_stop = true;
                }
                signal
            };
            item.run(&mut control, &mut self.buffer);
        }

        if !item.state().is_terminal() {
            log::error!("[w{}] run returned in state {}", self.idx, item.state());
            item.set_state(ItemState::Failed);
        }
        if item.state() != ItemState::Done {
            item.discard_result();
        }
        item.finish();

        for mail in deferred.into_iter().rev() {
            self.backlog.push_front(mail);
        }
        !saw_stop
    }

    fn complete(&self, job: Job) {
        self.shared.completed.push(job);
        self.shared.notifier.notify();
    }
}
