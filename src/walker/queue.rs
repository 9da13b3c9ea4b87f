//! Bounded queues and outstanding-work tracking
//!
//! Two kinds of queues move work between threads:
//!
//! - [`WorkQueue`]: a bounded MPMC channel (leaves, records, import
//!   entries). Senders block when it is full but poll the shutdown flag
//!   while they wait, so a cancelled producer returns within one poll
//!   interval. The queue closes when the last sender is dropped.
//! - A `crossbeam_deque::Injector` for tree tasks (directories, purge
//!   tasks), paired with a [`PendingWork`] counter. Queue emptiness is not
//!   a termination signal there, since a task in flight may still push
//!   children; the counter reaching zero is.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use crossbeam_deque::{Injector, Steal};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How often blocked senders and idle receivers re-check the shutdown flag
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Statistics for a work queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Total items enqueued
    pub enqueued: AtomicU64,

    /// Total items dequeued
    pub dequeued: AtomicU64,

    /// Number of times a sender found the queue full
    pub backpressure_events: AtomicU64,
}

impl QueueStats {
    /// Get backpressure event count
    pub fn backpressure_count(&self) -> u64 {
        self.backpressure_events.load(Ordering::Relaxed)
    }
}

/// Bounded queue; split into its two halves before use
pub struct WorkQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    stats: Arc<QueueStats>,
}

impl<T> WorkQueue<T> {
    /// Create a new queue with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Get queue statistics
    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    /// Consume the queue into a sender and a receiver
    ///
    /// No hidden handle survives, so dropping every clone of the returned
    /// sender closes the queue.
    pub fn split(self) -> (WorkQueueSender<T>, WorkQueueReceiver<T>) {
        (
            WorkQueueSender {
                sender: self.sender,
                stats: Arc::clone(&self.stats),
            },
            WorkQueueReceiver {
                receiver: self.receiver,
                stats: self.stats,
            },
        )
    }
}

/// Result of a cancellable send
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Shutdown was requested while waiting for room
    Cancelled,
    /// All receivers are gone
    Closed,
}

/// Result of a polling receive
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome<T> {
    Item(T),
    /// Nothing arrived within the poll interval
    Idle,
    /// All senders are gone and the queue is empty
    Closed,
}

/// Handle for sending items to the queue
pub struct WorkQueueSender<T> {
    sender: Sender<T>,
    stats: Arc<QueueStats>,
}

impl<T> Clone for WorkQueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> WorkQueueSender<T> {
    /// Send an item, blocking while the queue is full
    pub fn send(&self, item: T) -> SendOutcome {
        match self.sender.send(item) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Sent
            }
            Err(_) => SendOutcome::Closed,
        }
    }

    /// Send an item, giving up if `shutdown` is set while the queue is full
    pub fn send_polling(&self, item: T, shutdown: &AtomicBool) -> SendOutcome {
        let mut item = item;
        let mut waited = false;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return SendOutcome::Cancelled;
            }
            match self.sender.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => {
                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    return SendOutcome::Sent;
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if !waited {
                        self.stats.backpressure_events.fetch_add(1, Ordering::Relaxed);
                        waited = true;
                    }
                    item = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return SendOutcome::Closed,
            }
        }
    }
}

/// Handle for receiving items from the queue
pub struct WorkQueueReceiver<T> {
    receiver: Receiver<T>,
    stats: Arc<QueueStats>,
}

impl<T> Clone for WorkQueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<T> WorkQueueReceiver<T> {
    /// Receive an item, blocking until one arrives or the queue closes
    pub fn recv(&self) -> Option<T> {
        let item = self.receiver.recv().ok()?;
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Receive with the standard poll interval
    pub fn recv_polling(&self) -> RecvOutcome<T> {
        match self.receiver.recv_timeout(POLL_INTERVAL) {
            Ok(item) => {
                self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
                RecvOutcome::Item(item)
            }
            Err(RecvTimeoutError::Timeout) => RecvOutcome::Idle,
            Err(RecvTimeoutError::Disconnected) => RecvOutcome::Closed,
        }
    }

    /// Get current queue length
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Outstanding-work counter for injector-fed pools
///
/// Incremented before a task becomes visible to other threads and
/// decremented after the task (and the enqueueing of its children) is
/// done, so it can only reach zero once no task exists anywhere.
#[derive(Debug, Clone, Default)]
pub struct PendingWork {
    count: Arc<AtomicU64>,
}

impl PendingWork {
    pub fn new(initial: u64) -> Self {
        Self {
            count: Arc::new(AtomicU64::new(initial)),
        }
    }

    /// Register `n` new tasks
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    /// Retire one task
    pub fn complete(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// True once every registered task has been retired
    pub fn is_done(&self) -> bool {
        self.get() == 0
    }

    /// RAII guard that retires one task when dropped
    pub fn guard(&self) -> WorkGuard<'_> {
        WorkGuard { pending: self }
    }
}

/// RAII guard for an in-flight task
pub struct WorkGuard<'a> {
    pending: &'a PendingWork,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.pending.complete();
    }
}

/// Pop one task from an injector, retrying on contention
pub fn steal<T>(injector: &Injector<T>) -> Option<T> {
    loop {
        match injector.steal() {
            Steal::Success(task) => return Some(task),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}
