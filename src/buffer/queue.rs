use super::error::BufferError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Outcome of [`WaitingQueue::dequeue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeued<T> {
    Item(T),
    /// The producer completed the queue and every buffered item was drained.
    Completed,
}

struct QueueState<T> {
    items: VecDeque<T>,
    completed: bool,
}

/// Unbounded FIFO hand-off between pipeline stages.
///
/// One producer enqueues and eventually calls [`complete`](Self::complete);
/// any number of consumers suspend in [`dequeue`](Self::dequeue) until an item
/// arrives. Each item is delivered to exactly one consumer.
pub struct WaitingQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    waiters: AtomicUsize,
    enqueued: AtomicU64,
}

impl<T> WaitingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                completed: false,
            }),
            notify: Notify::new(),
            waiters: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Appends an item and wakes one suspended consumer. Never suspends.
    pub fn enqueue(&self, item: T) -> Result<(), BufferError> {
        {
            let mut state = self.state.lock();
            if state.completed {
                return Err(BufferError::QueueCompleted);
            }
            state.items.push_back(item);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Takes the next item, suspending while the queue is empty and not completed.
    pub async fn dequeue(&self) -> Dequeued<T> {
        loop {
            // Register interest before inspecting the state so an enqueue
            // racing with the check below still wakes this consumer.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.poll_state() {
                return outcome;
            }

            let _waiting = WaiterGuard::new(&self.waiters);
            notified.await;
        }
    }

    /// Non-suspending dequeue. `None` means nothing is buffered right now.
    pub fn try_dequeue(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Marks the queue completed and wakes every suspended consumer.
    ///
    /// Returns `false` when the queue was already completed.
    pub fn complete(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.completed {
                return false;
            }
            state.completed = true;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_consumer_waiting(&self) -> bool {
        self.waiting_consumers() > 0
    }

    pub fn waiting_consumers(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of items ever enqueued.
    pub fn total_enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    fn poll_state(&self) -> Option<Dequeued<T>> {
        let mut state = self.state.lock();
        if let Some(item) = state.items.pop_front() {
            Some(Dequeued::Item(item))
        } else if state.completed {
            Some(Dequeued::Completed)
        } else {
            None
        }
    }
}

impl<T> Default for WaitingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for WaitingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WaitingQueue")
            .field("len", &state.items.len())
            .field("completed", &state.completed)
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish()
    }
}

struct WaiterGuard<'a> {
    waiters: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
    fn new(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::AcqRel);
        Self { waiters }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}
