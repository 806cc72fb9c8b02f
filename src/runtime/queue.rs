//! Pending-message queue feeding the multiplexed read.
//!
//! Reader tasks append; a single consumer pops oldest-first. The list is
//! guarded by a plain mutex (never held across an await) and consumers are
//! woken through `Notify`, which keeps a permit when nobody is waiting, so
//! a push between the consumer's emptiness check and its wait is not lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tracing::warn;

/// Unbounded FIFO with an async wakeup.
#[derive(Debug)]
pub struct PendingQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Notify,
    /// Queue length at which a warning is logged.
    warn_threshold: usize,
    /// Set while the queue is above the threshold, so each crossing logs once.
    above_threshold: AtomicBool,
}

impl<T> PendingQueue<T> {
    /// Create an empty queue that warns once its length reaches `warn_threshold`.
    pub fn new(warn_threshold: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            warn_threshold,
            above_threshold: AtomicBool::new(false),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake the consumer.
    pub fn push(&self, item: T) {
        let len = {
            let mut items = self.items();
            items.push_back(item);
            items.len()
        };

        if len >= self.warn_threshold && !self.above_threshold.swap(true, Ordering::Relaxed) {
            warn!(
                pending = len,
                threshold = self.warn_threshold,
                "Message queue is growing faster than it is consumed"
            );
        }

        self.ready.notify_one();
    }

    /// Remove the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let mut items = self.items();
        let item = items.pop_front();
        if items.len() < self.warn_threshold {
            self.above_threshold.store(false, Ordering::Relaxed);
        }
        item
    }

    /// Wait for and remove the oldest item.
    ///
    /// Items already queued are still handed out after shutdown has been
    /// signaled; `None` is returned only once the queue is empty and
    /// `shutdown` reads `true` (or its sender is gone).
    pub async fn pop(&self, shutdown: &mut watch::Receiver<bool>) -> Option<T> {
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if *shutdown.borrow_and_update() {
                return None;
            }

            tokio::select! {
                () = self.ready.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return self.try_pop();
                    }
                }
            }
        }
    }

    /// Drop every queued item. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut items = self.items();
        let dropped = items.len();
        items.clear();
        self.above_threshold.store(false, Ordering::Relaxed);
        dropped
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items().len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}
