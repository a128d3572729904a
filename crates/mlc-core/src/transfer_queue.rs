//! Unbounded FIFO shared between submitters, workers and the completion
//! handler.
//!
//! The list always ends in an empty sentinel node. Producers only touch the
//! tail lock and consumers only touch the head lock, so a push and a pop can
//! run at the same time; the head lock also backs the condition variable
//! that blocked consumers sleep on.

use parking_lot::{Condvar, Mutex};
use std::ptr;

struct Node<T> {
    data: Option<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            data: None,
            next: ptr::null_mut(),
        }))
    }
}

pub struct TransferQueue<T> {
    head: Mutex<*mut Node<T>>,
    tail: Mutex<*mut Node<T>>,
    data_cond: Condvar,
}

// SAFETY: nodes are only reached through the head/tail pointers, each of
// which is guarded by its own mutex; values are moved in and out whole.
unsafe impl<T: Send> Send for TransferQueue<T> {}
unsafe impl<T: Send> Sync for TransferQueue<T> {}

impl<T> TransferQueue<T> {
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        Self {
            head: Mutex::new(sentinel),
            tail: Mutex::new(sentinel),
            data_cond: Condvar::new(),
        }
    }

    /// Append `item`, handing ownership to the queue, and wake one blocked
    /// consumer.
    pub fn push(&self, item: T) {
        let new_sentinel = Node::sentinel();
        {
            let mut tail = self.tail.lock();
            // SAFETY: `*tail` is the live sentinel; consumers never touch the
            // sentinel because they stop when head == tail, which they read
            // under this same lock.
            unsafe {
                (**tail).data = Some(item);
                (**tail).next = new_sentinel;
            }
            *tail = new_sentinel;
        }
        // Taking the head lock orders this wakeup after any consumer that
        // saw the queue empty has started waiting.
        let _head = self.head.lock();
        self.data_cond.notify_one();
    }

    /// Pop the oldest item. With `block` set the caller sleeps until an item
    /// arrives; otherwise `None` means the queue was empty.
    pub fn pop(&self, block: bool) -> Option<T> {
        let mut head = self.head.lock();
        loop {
            if *head != self.tail_ptr() {
                // SAFETY: head != tail, so the head node is fully published
                // (its data and next were written before tail moved past it)
                // and only this consumer, holding the head lock, may take it.
                let mut node = unsafe { Box::from_raw(*head) };
                *head = node.next;
                return node.data.take();
            }
            if !block {
                return None;
            }
            self.data_cond.wait(&mut head);
        }
    }

    /// Advisory snapshot; another thread may push or pop right after.
    pub fn is_empty(&self) -> bool {
        let head = self.head.lock();
        *head == self.tail_ptr()
    }

    /// Swap in an empty list and hand back everything that was queued, oldest
    /// first.
    pub fn drain(&self) -> Vec<T> {
        let fresh = Node::sentinel();
        let (mut cursor, old_tail) = {
            let mut head = self.head.lock();
            let mut tail = self.tail.lock();
            let old = (*head, *tail);
            *head = fresh;
            *tail = fresh;
            old
        };

        let mut items = Vec::new();
        // SAFETY: the detached chain is unreachable from the queue now, so
        // this thread owns every node from the old head up to the old tail.
        unsafe {
            while cursor != old_tail {
                let mut node = Box::from_raw(cursor);
                cursor = node.next;
                if let Some(data) = node.data.take() {
                    items.push(data);
                }
            }
            drop(Box::from_raw(old_tail));
        }
        items
    }

    fn tail_ptr(&self) -> *mut Node<T> {
        *self.tail.lock()
    }
}

impl<T> Default for TransferQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TransferQueue<T> {
    fn drop(&mut self) {
        let mut cursor = *self.head.get_mut();
        while !cursor.is_null() {
            // SAFETY: `&mut self` rules out concurrent access; every node in
            // the chain, sentinel included, was allocated by `Node::sentinel`.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pops_in_push_order_across_threads() {
        let queue = Arc::new(TransferQueue::new());
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for name in ["a", "b", "c"] {
                    queue.push(name.to_string());
                }
            })
        };

        let popped: Vec<String> = (0..3).filter_map(|_| queue.pop(true)).collect();
        producer.join().unwrap();

        assert_eq!(popped, vec!["a", "b", "c"]);
        assert!(queue.is_empty());
        assert!(queue.pop(false).is_none());
    }

    #[test]
    fn non_blocking_pop_on_empty_returns_none() {
        let queue: TransferQueue<u32> = TransferQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(false), None);
        queue.push(9);
        assert!(!queue.is_empty());
        assert_eq!(queue.pop(false), Some(9));
    }

    #[test]
    fn blocked_consumer_wakes_on_push() {
        let queue = Arc::new(TransferQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop(true))
        };
        thread::sleep(Duration::from_millis(50));
        queue.push(42u64);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn many_producers_one_consumer_loses_nothing() {
        const PRODUCERS: u64 = 8;
        const PER_PRODUCER: u64 = 2_000;

        let queue = Arc::new(TransferQueue::new());
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push((p, i));
                }
            }));
        }

        let mut last_seen = vec![None::<u64>; PRODUCERS as usize];
        for _ in 0..PRODUCERS * PER_PRODUCER {
            let (p, i) = queue.pop(true).unwrap();
            // per-producer order holds even with interleaving
            if let Some(prev) = last_seen[p as usize] {
                assert!(i > prev);
            }
            last_seen[p as usize] = Some(i);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(queue.is_empty());
        assert!(last_seen.iter().all(|v| *v == Some(PER_PRODUCER - 1)));
    }

    #[test]
    fn drain_returns_contents_and_leaves_queue_usable() {
        let queue = TransferQueue::new();
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.drain(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());

        queue.push(7);
        assert_eq!(queue.pop(true), Some(7));
    }

    #[test]
    fn dropping_a_non_empty_queue_drops_items() {
        let marker = Arc::new(());
        {
            let queue = TransferQueue::new();
            queue.push(Arc::clone(&marker));
            queue.push(Arc::clone(&marker));
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
