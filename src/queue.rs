//! In-memory delivery queue.
//!
//! FIFO by admission order. Items requeued with a delay sit in a timer heap
//! and are appended at the tail once due. The store stays the source of
//! truth; the queue is rebuilt from it on startup with [`DeliveryQueue::rehydrate`].

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::error::Result;
use crate::model::work::{State, WorkId, WorkItem};
use crate::store::Store;

#[derive(Default)]
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<WorkItem>,
    delayed: BinaryHeap<Delayed>,
    queued: HashSet<WorkId>,
    seq: u64,
    closed: bool,
}

struct Delayed {
    due: Instant,
    seq: u64,
    item: WorkItem,
}

// Min-heap on (due, seq).
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl Inner {
    /// Move every due delayed item to the tail, earliest first.
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(d) = self.delayed.pop() {
                self.ready.push_back(d.item);
            }
        }
    }
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item at the tail.
    ///
    /// Returns `false` if the queue is closed or the id is already queued.
    pub fn enqueue(&self, item: WorkItem) -> bool {
        {
            let mut inner = self.lock();
            if inner.closed || !inner.queued.insert(item.id) {
                return false;
            }
            inner.ready.push_back(item);
        }
        self.notify.notify_one();
        true
    }

    /// Make `item` eligible again after `delay`; it joins the tail when due.
    pub fn requeue(&self, item: WorkItem, delay: Duration) -> bool {
        if delay.is_zero() {
            return self.enqueue(item);
        }
        {
            let mut inner = self.lock();
            if inner.closed || !inner.queued.insert(item.id) {
                return false;
            }
            inner.seq += 1;
            let seq = inner.seq;
            inner.delayed.push(Delayed {
                due: Instant::now() + delay,
                seq,
                item,
            });
        }
        // A sleeping consumer may need to shorten its timer.
        self.notify.notify_waiters();
        true
    }

    /// Wait for the next eligible item. Returns `None` once closed.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut inner = self.lock();
                if inner.closed {
                    return None;
                }
                inner.promote_due(Instant::now());
                if let Some(item) = inner.ready.pop_front() {
                    inner.queued.remove(&item.id);
                    return Some(item);
                }
                inner.delayed.peek().map(|d| d.due)
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Stop handing out items and wake every waiting consumer.
    ///
    /// Items still queued are dropped; their state is already persisted.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Ready plus delayed items.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.ready.len() + inner.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue every deliverable item from the store, oldest first.
    ///
    /// Run after [`Store::recover_in_flight`] so interrupted items are included.
    pub async fn rehydrate(&self, store: &Store) -> Result<usize> {
        let deliverable: Vec<State> = State::ALL
            .into_iter()
            .filter(|s| s.is_deliverable())
            .collect();
        let items = store.list(&deliverable).await?;
        let mut count = 0;
        for item in items {
            if self.enqueue(item) {
                count += 1;
            }
        }
        debug!(count, "rehydrated delivery queue");
        Ok(count)
    }
}
