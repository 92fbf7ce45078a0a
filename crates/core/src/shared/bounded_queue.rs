use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Bounded stage-to-stage queue with a drop-oldest overflow policy.
///
/// `push` never blocks: when the queue is full the oldest queued items are
/// evicted and counted so the caller can account for them. Consumers use
/// `pop_timeout` so they can observe a stop flag between waits. The queue
/// keeps both channel ends alive, so it never disconnects.
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Enqueues `item`, evicting the oldest entries while the queue is full.
    ///
    /// Returns how many items were dropped. Concurrent producers can force
    /// more than one eviction per push.
    pub fn push(&self, item: T) -> usize {
        let mut pending = item;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return evicted,
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    // A concurrent consumer may have emptied a slot already;
                    // in that case the retry succeeds without evicting.
                    if self.rx.try_recv().is_ok() {
                        evicted += 1;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return evicted + 1,
            }
        }
    }

    /// Waits up to `timeout` for the next item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Clone for DropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
        }
    }
}
