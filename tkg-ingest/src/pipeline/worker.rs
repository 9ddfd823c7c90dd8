//! Generic stage worker pool.
//!
//! A stage is a [`StageHandler`] bolted between an input queue and an
//! optional output queue. Each worker loops: wait for the admission gate,
//! take a batch, hand it to the handler, then settle every delivery on its
//! own outcome. Outputs are enqueued downstream before the input is acked.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::errors::{PipelineError, Result};
use crate::queue::{Delivery, WorkQueue};

use super::review::ReviewLog;

/// What became of one input item.
#[derive(Debug)]
pub enum ItemOutcome<O> {
    /// Processed; forward these outputs downstream.
    Done(Vec<O>),
    /// Transient failure after in-call retries; requeue.
    Retry(PipelineError),
    /// The item needs a human; set it aside.
    Review(PipelineError),
    /// Permanent failure; report and drop from the queue.
    Failed(PipelineError),
    /// Someone else holds the item's lock; hand it back uncounted.
    Yield,
}

impl<O> ItemOutcome<O> {
    /// Route an error by its class.
    pub fn from_error(err: PipelineError) -> Self {
        match err {
            PipelineError::Contention(_) => Self::Yield,
            e if e.is_transient() => Self::Retry(e),
            e if e.needs_review() => Self::Review(e),
            e => Self::Failed(e),
        }
    }

    pub fn from_result(result: Result<Vec<O>>) -> Self {
        match result {
            Ok(outputs) => Self::Done(outputs),
            Err(e) => Self::from_error(e),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Done(_) => "done",
            Self::Retry(_) => "retried",
            Self::Review(_) => "reviewed",
            Self::Failed(_) => "failed",
            Self::Yield => "yielded",
        }
    }
}

/// Stage-specific processing of a batch.
pub trait StageHandler: Send + Sync + 'static {
    type Input: Clone + Serialize + Send + Sync + 'static;
    type Output: Send + 'static;

    const NAME: &'static str;

    /// Identifier used in logs and review entries.
    fn item_id(item: &Self::Input) -> String;

    /// Process a batch; exactly one outcome per input, in order.
    fn handle_batch(
        &self,
        items: Vec<Self::Input>,
    ) -> impl Future<Output = Vec<ItemOutcome<Self::Output>>> + Send;
}

/// Outcome counters of one stage.
#[derive(Debug, Default)]
pub struct StageStats {
    pub done: AtomicU64,
    pub retried: AtomicU64,
    pub reviewed: AtomicU64,
    pub failed: AtomicU64,
    pub yielded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSnapshot {
    pub done: u64,
    pub retried: u64,
    pub reviewed: u64,
    pub failed: u64,
    pub yielded: u64,
}

impl StageStats {
    fn record(&self, stage: &'static str, outcome: &'static str) {
        let counter = match outcome {
            "done" => &self.done,
            "retried" => &self.retried,
            "reviewed" => &self.reviewed,
            "failed" => &self.failed,
            _ => &self.yielded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tkg_stage_items_total", "stage" => stage, "outcome" => outcome)
            .increment(1);
    }

    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            done: self.done.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            reviewed: self.reviewed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            yielded: self.yielded.load(Ordering::Relaxed),
        }
    }
}

/// Pauses a stage while any downstream queue is at or above the depth limit.
#[derive(Clone)]
pub struct AdmissionGate {
    limit: usize,
    downstream: Vec<watch::Receiver<usize>>,
}

impl AdmissionGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            downstream: Vec::new(),
        }
    }

    pub fn watching(mut self, depth: watch::Receiver<usize>) -> Self {
        self.downstream.push(depth);
        self
    }

    pub fn is_open(&self) -> bool {
        self.downstream.iter().all(|rx| *rx.borrow() < self.limit)
    }

    /// Wait until every watched depth is below the limit at the same time.
    /// Returns `false` if a watched queue went away.
    pub async fn wait_open(&mut self) -> bool {
        let limit = self.limit;
        loop {
            for rx in &mut self.downstream {
                let open = rx.wait_for(|depth| *depth < limit).await.is_ok();
                if !open {
                    return false;
                }
            }
            if self.is_open() {
                return true;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub batch_size: usize,
    /// Deliveries before a retried item is reported as failed.
    pub max_deliveries: u32,
    /// Pause after a batch that handed items back.
    pub yield_backoff: Duration,
}

/// Take a permit, mapping a closed semaphore to a queue error.
pub(crate) async fn permit(semaphore: &Semaphore) -> Result<SemaphorePermit<'_>> {
    semaphore
        .acquire()
        .await
        .map_err(|_| PipelineError::Queue("stage semaphore closed".into()))
}

/// A stage's worker pool.
pub struct StageRunner<H, I, O>
where
    H: StageHandler,
{
    handler: Arc<H>,
    input: Arc<I>,
    output: Option<Arc<O>>,
    gate: AdmissionGate,
    review: Arc<ReviewLog>,
    stats: Arc<StageStats>,
    settings: WorkerSettings,
}

impl<H, I, O> Clone for StageRunner<H, I, O>
where
    H: StageHandler,
{
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
            input: Arc::clone(&self.input),
            output: self.output.clone(),
            gate: self.gate.clone(),
            review: Arc::clone(&self.review),
            stats: Arc::clone(&self.stats),
            settings: self.settings.clone(),
        }
    }
}

impl<H, I, O> StageRunner<H, I, O>
where
    H: StageHandler,
    I: WorkQueue<H::Input> + 'static,
    O: WorkQueue<H::Output> + 'static,
{
    pub fn new(
        handler: Arc<H>,
        input: Arc<I>,
        output: Option<Arc<O>>,
        gate: AdmissionGate,
        review: Arc<ReviewLog>,
        stats: Arc<StageStats>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            handler,
            input,
            output,
            gate,
            review,
            stats,
            settings,
        }
    }

    /// Start `settings.workers` tasks that run until shutdown or input close.
    pub fn spawn(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.settings.workers.max(1))
            .map(|worker| tokio::spawn(self.clone().run(worker, shutdown.clone())))
            .collect()
    }

    async fn run(mut self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(stage = H::NAME, worker, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let open = tokio::select! {
                open = self.gate.wait_open() => open,
                _ = shutdown.changed() => false,
            };
            if !open {
                break;
            }

            let batch = tokio::select! {
                batch = self.input.dequeue_batch(self.settings.batch_size) => batch,
                _ = shutdown.changed() => break,
            };
            let batch = match batch {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => batch,
                Err(e) => {
                    error!(stage = H::NAME, worker, error = %e, "dequeue failed");
                    tokio::time::sleep(self.settings.yield_backoff).await;
                    continue;
                }
            };

            if self.process(batch).await {
                tokio::time::sleep(self.settings.yield_backoff).await;
            }
        }
        debug!(stage = H::NAME, worker, "worker stopped");
    }

    /// Returns whether any item was yielded.
    async fn process(&self, batch: Vec<Delivery<H::Input>>) -> bool {
        let items: Vec<H::Input> = batch.iter().map(|d| d.item.clone()).collect();
        let mut outcomes = self.handler.handle_batch(items).await;
        if outcomes.len() != batch.len() {
            error!(
                stage = H::NAME,
                expected = batch.len(),
                got = outcomes.len(),
                "handler returned a mismatched outcome count"
            );
            outcomes.resize_with(batch.len(), || {
                ItemOutcome::Failed(PipelineError::Queue("no outcome reported".into()))
            });
        }

        let mut yielded = false;
        for (delivery, outcome) in batch.into_iter().zip(outcomes) {
            yielded |= matches!(outcome, ItemOutcome::Yield);
            let tag = delivery.tag;
            if let Err(e) = self.settle(delivery, outcome).await {
                error!(stage = H::NAME, tag, error = %e, "could not settle delivery");
            }
        }
        yielded
    }

    async fn settle(
        &self,
        delivery: Delivery<H::Input>,
        outcome: ItemOutcome<H::Output>,
    ) -> Result<()> {
        let label = outcome.label();
        let item_id = H::item_id(&delivery.item);
        let deliveries = delivery.attempts + 1;

        match outcome {
            ItemOutcome::Done(outputs) => {
                if let Some(output) = &self.output {
                    for out in outputs {
                        if let Err(e) = output.enqueue(out).await {
                            warn!(stage = H::NAME, item_id, error = %e, "downstream refused output, handing item back");
                            return self.input.release(delivery.tag);
                        }
                    }
                }
                self.stats.record(H::NAME, label);
                self.input.ack(delivery.tag)
            }
            ItemOutcome::Retry(err) if deliveries >= self.settings.max_deliveries => {
                self.review.fail(H::NAME, item_id, err.to_string(), deliveries);
                self.stats.record(H::NAME, "failed");
                self.input.ack(delivery.tag)
            }
            ItemOutcome::Retry(err) => {
                warn!(stage = H::NAME, item_id, deliveries, error = %err, "requeueing after transient failure");
                self.stats.record(H::NAME, label);
                self.input.nack(delivery.tag)
            }
            ItemOutcome::Review(err) => {
                self.review.flag(H::NAME, item_id, err.to_string(), &delivery.item);
                self.stats.record(H::NAME, label);
                self.input.ack(delivery.tag)
            }
            ItemOutcome::Failed(err) => {
                self.review.fail(H::NAME, item_id, err.to_string(), deliveries);
                self.stats.record(H::NAME, label);
                self.input.ack(delivery.tag)
            }
            ItemOutcome::Yield => {
                debug!(stage = H::NAME, item_id, "item contended, yielding");
                self.stats.record(H::NAME, label);
                self.input.release(delivery.tag)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LlmError;
    use crate::queue::MemoryQueue;
    use std::sync::atomic::AtomicUsize;

    /// Doubles numbers; odd inputs fail the way the test configures.
    struct Doubler {
        odd: fn() -> PipelineError,
        calls: AtomicUsize,
    }

    impl StageHandler for Doubler {
        type Input = u32;
        type Output = u32;
        const NAME: &'static str = "doubler";

        fn item_id(item: &u32) -> String {
            item.to_string()
        }

        async fn handle_batch(&self, items: Vec<u32>) -> Vec<ItemOutcome<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            items
                .into_iter()
                .map(|n| {
                    if n % 2 == 1 {
                        ItemOutcome::from_error((self.odd)())
                    } else {
                        ItemOutcome::Done(vec![n * 2])
                    }
                })
                .collect()
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            workers: 2,
            batch_size: 4,
            max_deliveries: 3,
            yield_backoff: Duration::from_millis(1),
        }
    }

    struct Harness {
        input: Arc<MemoryQueue<u32>>,
        output: Arc<MemoryQueue<u32>>,
        review: Arc<ReviewLog>,
        stats: Arc<StageStats>,
        shutdown: watch::Sender<bool>,
        handles: Vec<JoinHandle<()>>,
    }

    fn start(odd: fn() -> PipelineError, gate: AdmissionGate) -> Harness {
        let input = Arc::new(MemoryQueue::new("in", 100));
        let output = Arc::new(MemoryQueue::new("out", 100));
        let review = Arc::new(ReviewLog::new());
        let stats = Arc::new(StageStats::default());
        let (shutdown, rx) = watch::channel(false);
        let runner = StageRunner::new(
            Arc::new(Doubler {
                odd,
                calls: AtomicUsize::new(0),
            }),
            Arc::clone(&input),
            Some(Arc::clone(&output)),
            gate,
            Arc::clone(&review),
            Arc::clone(&stats),
            settings(),
        );
        let handles = runner.spawn(&rx);
        Harness {
            input,
            output,
            review,
            stats,
            shutdown,
            handles,
        }
    }

    async fn wait_drained(q: &MemoryQueue<u32>) {
        let mut rx = q.watch_depth();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|d| *d == 0))
            .await
            .expect("queue drains")
            .expect("queue alive");
    }

    async fn stop(h: Harness) {
        h.shutdown.send_replace(true);
        for handle in h.handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn errors_route_by_class() {
        assert!(matches!(
            ItemOutcome::<()>::from_error(PipelineError::Contention(uuid::Uuid::nil())),
            ItemOutcome::Yield
        ));
        assert!(matches!(
            ItemOutcome::<()>::from_error(PipelineError::Llm(LlmError::RateLimit)),
            ItemOutcome::Retry(_)
        ));
        assert!(matches!(
            ItemOutcome::<()>::from_error(PipelineError::Validation("x".into())),
            ItemOutcome::Review(_)
        ));
        assert!(matches!(
            ItemOutcome::<()>::from_error(PipelineError::Llm(LlmError::Authentication)),
            ItemOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn outputs_forwarded_and_reviews_isolated() {
        let h = start(|| PipelineError::Validation("odd".into()), AdmissionGate::new(10));
        for n in 0..6 {
            h.input.enqueue(n).await.unwrap();
        }
        wait_drained(&h.input).await;

        assert_eq!(h.output.depth(), 3);
        assert_eq!(h.review.review_count(), 3);
        assert_eq!(h.stats.snapshot().done, 3);
        assert_eq!(h.stats.snapshot().reviewed, 3);
        stop(h).await;
    }

    #[tokio::test]
    async fn transient_failures_are_bounded_by_deliveries() {
        let h = start(|| PipelineError::Llm(LlmError::RateLimit), AdmissionGate::new(10));
        h.input.enqueue(1).await.unwrap();
        wait_drained(&h.input).await;

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.retried, 2);
        assert_eq!(snapshot.failed, 1);
        let failures = h.review.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].deliveries, 3);
        stop(h).await;
    }

    #[tokio::test]
    async fn closed_gate_pauses_admission() {
        let (depth_tx, depth_rx) = watch::channel(5usize);
        let h = start(
            || PipelineError::Validation("odd".into()),
            AdmissionGate::new(5).watching(depth_rx),
        );
        h.input.enqueue(2).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.output.depth(), 0, "nothing admitted while downstream is full");
        assert_eq!(h.input.depth(), 1, "nothing dropped either");

        depth_tx.send_replace(4);
        wait_drained(&h.input).await;
        assert_eq!(h.output.depth(), 1);
        stop(h).await;
    }
}
