//! Ordered work queues connecting the pipeline stages.
//!
//! A queue hands out items in batches. Every delivered item stays in flight
//! (and counted in [`WorkQueue::depth`]) until it is acked, nacked or released,
//! which is what lets upstream stages throttle on downstream depth.

pub mod memory;

pub use memory::MemoryQueue;

use std::future::Future;

use tokio::sync::watch;

use crate::errors::Result;

/// An item handed to a worker.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    /// Queue-local handle used to ack/nack/release this delivery.
    pub tag: u64,
    pub item: T,
    /// Counted redeliveries so far (0 on first delivery).
    pub attempts: u32,
}

pub trait WorkQueue<T>: Send + Sync {
    /// Append `item`, waiting while the queue is at capacity.
    fn enqueue(&self, item: T) -> impl Future<Output = Result<()>> + Send;

    /// Wait for work and take up to `max` items.
    ///
    /// Returns an empty batch once the queue is closed.
    fn dequeue_batch(&self, max: usize) -> impl Future<Output = Result<Vec<Delivery<T>>>> + Send;

    /// Mark a delivery done.
    fn ack(&self, tag: u64) -> Result<()>;

    /// Requeue a failed delivery; counts as an attempt.
    fn nack(&self, tag: u64) -> Result<()>;

    /// Requeue without counting an attempt (lock contention, shutdown).
    fn release(&self, tag: u64) -> Result<()>;

    /// Pending plus in-flight items.
    fn depth(&self) -> usize;

    /// Follow [`depth`](Self::depth) as it changes.
    fn watch_depth(&self) -> watch::Receiver<usize>;

    /// Stop handing out work and refuse new items.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
