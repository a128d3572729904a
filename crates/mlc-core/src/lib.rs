pub mod buffer;
pub mod config;
pub mod errors;
pub mod event_loop;
pub mod notifier;
pub mod signal;
pub mod storage;
pub mod transaction;
pub mod transfer;
pub mod transfer_queue;
pub mod work_item;
pub mod workshop;

pub use config::WorkshopConfig;
pub use errors::WorkshopError;
pub use event_loop::{EventLoop, Interest, NoEventLoop, Readiness};
pub use signal::{ControlSignal, MediaPriority, MediaType, StorageEvent};
pub use storage::{Allocation, StorageManager};
pub use transaction::{Transaction, TransactionOutcome, TransactionSummary};
pub use transfer_queue::TransferQueue;
pub use work_item::{AutoDestination, ItemState, WorkItem};
pub use workshop::{ClientId, CompletionCallback, Workshop};
