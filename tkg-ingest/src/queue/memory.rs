//! In-process [`WorkQueue`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::{watch, Notify};
use tracing::trace;

use crate::errors::{PipelineError, Result};

use super::{Delivery, WorkQueue};

struct State<T> {
    pending: VecDeque<Delivery<T>>,
    in_flight: HashMap<u64, Delivery<T>>,
    next_tag: u64,
    closed: bool,
}

impl<T> State<T> {
    fn depth(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }
}

/// FIFO queue with bounded pending capacity.
///
/// Items are cloned on delivery so a nacked item can be handed out again.
///
/// Requeued items go to the back. Capacity applies to new items only, so a
/// worker can always hand back what it took.
pub struct MemoryQueue<T> {
    name: String,
    capacity: usize,
    state: Mutex<State<T>>,
    item_ready: Notify,
    space_ready: Notify,
    depth_tx: watch::Sender<usize>,
}

impl<T> MemoryQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (depth_tx, _) = watch::channel(0);
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            state: Mutex::new(State {
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
                next_tag: 0,
                closed: false,
            }),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            depth_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> Result<MutexGuard<'_, State<T>>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::Queue(format!("{}: state lock poisoned", self.name)))
    }

    fn publish(&self, state: &State<T>) {
        self.depth_tx.send_replace(state.depth());
    }

    fn requeue(&self, tag: u64, counted: bool) -> Result<()> {
        let mut state = self.lock()?;
        let mut delivery = state
            .in_flight
            .remove(&tag)
            .ok_or_else(|| PipelineError::Queue(format!("{}: unknown delivery {tag}", self.name)))?;
        if counted {
            delivery.attempts += 1;
        }
        trace!(queue = %self.name, tag, attempts = delivery.attempts, counted, "requeued");
        state.pending.push_back(delivery);
        drop(state);
        self.item_ready.notify_waiters();
        Ok(())
    }
}

impl<T: Clone + Send> WorkQueue<T> for MemoryQueue<T> {
    async fn enqueue(&self, item: T) -> Result<()> {
        let mut item = Some(item);
        loop {
            let space = self.space_ready.notified();
            {
                let mut state = self.lock()?;
                if state.closed {
                    return Err(PipelineError::Queue(format!("{}: queue closed", self.name)));
                }
                if state.pending.len() < self.capacity {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    if let Some(item) = item.take() {
                        state.pending.push_back(Delivery {
                            tag,
                            item,
                            attempts: 0,
                        });
                    }
                    self.publish(&state);
                    drop(state);
                    self.item_ready.notify_waiters();
                    return Ok(());
                }
            }
            trace!(queue = %self.name, "queue full, waiting for space");
            space.await;
        }
    }

    async fn dequeue_batch(&self, max: usize) -> Result<Vec<Delivery<T>>> {
        let max = max.max(1);
        loop {
            let ready = self.item_ready.notified();
            {
                let mut state = self.lock()?;
                if state.closed {
                    return Ok(Vec::new());
                }
                if !state.pending.is_empty() {
                    let take = max.min(state.pending.len());
                    let batch: Vec<Delivery<T>> = state.pending.drain(..take).collect();
                    // The queue keeps its own copy until the delivery is settled.
                    for delivery in &batch {
                        state.in_flight.insert(delivery.tag, delivery.clone());
                    }
                    drop(state);
                    self.space_ready.notify_waiters();
                    return Ok(batch);
                }
            }
            ready.await;
        }
    }

    fn ack(&self, tag: u64) -> Result<()> {
        let mut state = self.lock()?;
        if state.in_flight.remove(&tag).is_none() {
            return Err(PipelineError::Queue(format!(
                "{}: unknown delivery {tag}",
                self.name
            )));
        }
        self.publish(&state);
        Ok(())
    }

    fn nack(&self, tag: u64) -> Result<()> {
        self.requeue(tag, true)
    }

    fn release(&self, tag: u64) -> Result<()> {
        self.requeue(tag, false)
    }

    fn depth(&self) -> usize {
        *self.depth_tx.borrow()
    }

    fn watch_depth(&self) -> watch::Receiver<usize> {
        self.depth_tx.subscribe()
    }

    fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.closed = true;
        }
        self.item_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.lock().map(|s| s.closed).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_batches_and_depth() {
        let q = MemoryQueue::new("test", 10);
        for i in 0..5 {
            q.enqueue(i).await.unwrap();
        }
        assert_eq!(q.depth(), 5);

        let batch = q.dequeue_batch(3).await.unwrap();
        let items: Vec<i32> = batch.iter().map(|d| d.item).collect();
        assert_eq!(items, vec![0, 1, 2]);
        assert_eq!(q.depth(), 5, "in-flight items still count");

        for d in &batch {
            q.ack(d.tag).unwrap();
        }
        assert_eq!(q.depth(), 2);
        assert!(q.ack(batch[0].tag).is_err(), "double ack is rejected");
    }

    #[tokio::test]
    async fn nack_counts_attempts_release_does_not() {
        let q = MemoryQueue::new("test", 10);
        q.enqueue("a").await.unwrap();

        let d = q.dequeue_batch(1).await.unwrap().remove(0);
        q.nack(d.tag).unwrap();
        let d = q.dequeue_batch(1).await.unwrap().remove(0);
        assert_eq!(d.attempts, 1);

        q.release(d.tag).unwrap();
        let d = q.dequeue_batch(1).await.unwrap().remove(0);
        assert_eq!(d.attempts, 1);
        assert_eq!(d.item, "a");
    }

    #[tokio::test]
    async fn enqueue_waits_for_capacity() {
        let q = Arc::new(MemoryQueue::new("test", 1));
        q.enqueue(1).await.unwrap();

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.enqueue(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "second enqueue must wait");

        let d = q.dequeue_batch(1).await.unwrap();
        assert_eq!(d[0].item, 1);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer resumes")
            .unwrap()
            .unwrap();
        assert_eq!(q.depth(), 2);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue_and_close() {
        let q = Arc::new(MemoryQueue::<u8>::new("test", 4));
        let consumer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue_batch(4).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.enqueue(7).await.unwrap();
        let batch = consumer.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);

        let waiting = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue_batch(4).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert!(waiting.await.unwrap().unwrap().is_empty());
        assert!(q.enqueue(8).await.is_err());
        assert!(q.is_closed());
    }

    #[tokio::test]
    async fn watch_depth_follows_changes() {
        let q = MemoryQueue::new("test", 4);
        let mut rx = q.watch_depth();
        q.enqueue(1).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), 1);

        let d = q.dequeue_batch(1).await.unwrap();
        q.ack(d[0].tag).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 0);
    }
}
