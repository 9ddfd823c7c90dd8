//! Ingestion pipeline.
//!
//! Five stages joined by bounded queues:
//!
//! 1. **Chunker**: document → ordered, bounded chunks
//! 2. **Statement extractor**: chunk → proposed statements (LLM)
//! 3. **Entity extractor**: statement → entity mentions (LLM)
//! 4. **Resolver**: mention → canonical entity; activates the statement
//! 5. **Invalidator**: entity cluster → superseded statements closed (LLM)
//!
//! Every stage runs its own worker pool and pauses while any queue
//! downstream of it is at the depth limit. A periodic sweep re-enqueues every
//! cluster with two or more active statements, so clusters that missed an
//! evaluation (crash, exhausted retries) are picked up again.

pub mod chunker;
pub mod entities;
pub mod extractor;
pub mod invalidator;
pub mod resolver;
pub mod review;
pub mod worker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{join_all, select_all};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::driver::Storage;
use crate::embedder::EmbedderClient;
use crate::errors::{PipelineError, Result};
use crate::llm_client::LlmClient;
use crate::model::{Chunk, Document, EntityMention, Statement};
use crate::queue::{MemoryQueue, WorkQueue};
use crate::types::PipelineConfig;

use chunker::Chunker;
use entities::EntityExtractor;
use extractor::StatementExtractor;
use invalidator::Invalidator;
use resolver::{MatchPolicy, Resolver};
use review::ReviewLog;
use worker::{AdmissionGate, StageHandler, StageRunner, StageSnapshot, StageStats, WorkerSettings};

const YIELD_BACKOFF: Duration = Duration::from_millis(25);

/// Counters and queue depth of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    /// Depth of the stage's input queue.
    pub queue_depth: usize,
    #[serde(flatten)]
    pub outcomes: StageSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub stages: Vec<StageReport>,
    pub review_items: usize,
    pub failures: usize,
}

#[derive(Default)]
struct Stats {
    chunker: Arc<StageStats>,
    extractor: Arc<StageStats>,
    entities: Arc<StageStats>,
    resolver: Arc<StageStats>,
    invalidator: Arc<StageStats>,
}

pub struct Pipeline<L, E, S> {
    config: PipelineConfig,
    llm: Arc<L>,
    embedder: Arc<E>,
    store: Arc<S>,
    review: Arc<ReviewLog>,
    documents: Arc<MemoryQueue<Document>>,
    chunks: Arc<MemoryQueue<Chunk>>,
    statements: Arc<MemoryQueue<Statement>>,
    mentions: Arc<MemoryQueue<EntityMention>>,
    clusters: Arc<MemoryQueue<Uuid>>,
    stats: Stats,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<L, E, S> Pipeline<L, E, S>
where
    L: LlmClient + 'static,
    E: EmbedderClient + 'static,
    S: Storage + 'static,
{
    /// Assemble a pipeline. Nothing runs until [`start`](Self::start).
    pub fn new(config: PipelineConfig, llm: Arc<L>, embedder: Arc<E>, store: Arc<S>) -> Result<Self> {
        config
            .check()
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        if embedder.dim() != config.embedding_dim {
            return Err(PipelineError::Config(format!(
                "embedder produces {} dims, TKG_EMBEDDING_DIM is {}",
                embedder.dim(),
                config.embedding_dim
            )));
        }

        let capacity = config.queue_depth_limit;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            llm,
            embedder,
            store,
            review: Arc::new(ReviewLog::new()),
            documents: Arc::new(MemoryQueue::new("documents", capacity)),
            chunks: Arc::new(MemoryQueue::new("chunks", capacity)),
            statements: Arc::new(MemoryQueue::new("statements", capacity)),
            mentions: Arc::new(MemoryQueue::new("mentions", capacity)),
            clusters: Arc::new(MemoryQueue::new("clusters", capacity)),
            stats: Stats::default(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    fn settings(&self, batch_size: usize) -> WorkerSettings {
        WorkerSettings {
            workers: self.config.workers_per_stage,
            batch_size,
            max_deliveries: self.config.max_redeliveries,
            yield_backoff: YIELD_BACKOFF,
        }
    }

    fn gate(&self, downstream: &[watch::Receiver<usize>]) -> AdmissionGate {
        downstream
            .iter()
            .cloned()
            .fold(AdmissionGate::new(self.config.queue_depth_limit), |gate, rx| {
                gate.watching(rx)
            })
    }

    /// Check storage, then spawn every stage's workers and the sweep.
    pub async fn start(&self) -> Result<()> {
        self.store
            .ping()
            .await
            .map_err(|e| PipelineError::Config(format!("storage unreachable: {e}")))?;

        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| PipelineError::Config("task list poisoned".into()))?;
        if !tasks.is_empty() {
            return Err(PipelineError::Config("pipeline already started".into()));
        }

        let cfg = &self.config;
        let retry = cfg.retry_policy();
        let shutdown = self.shutdown.subscribe();
        let depth_chunks = self.chunks.watch_depth();
        let depth_statements = self.statements.watch_depth();
        let depth_mentions = self.mentions.watch_depth();
        let depth_clusters = self.clusters.watch_depth();

        let chunker = StageRunner::new(
            Arc::new(Chunker::new(Arc::clone(&self.store), cfg.chunk_max_chars, retry.clone())),
            Arc::clone(&self.documents),
            Some(Arc::clone(&self.chunks)),
            self.gate(&[
                depth_chunks,
                depth_statements.clone(),
                depth_mentions.clone(),
                depth_clusters.clone(),
            ]),
            Arc::clone(&self.review),
            Arc::clone(&self.stats.chunker),
            self.settings(cfg.document_batch_size),
        );
        tasks.extend(chunker.spawn(&shutdown));

        let extractor = StageRunner::new(
            Arc::new(StatementExtractor::new(
                Arc::clone(&self.llm),
                Arc::clone(&self.embedder),
                Arc::clone(&self.store),
                Arc::clone(&self.review),
                cfg.llm_concurrency,
                cfg.embed_concurrency,
                retry.clone(),
                cfg.embed_statements,
            )),
            Arc::clone(&self.chunks),
            Some(Arc::clone(&self.statements)),
            self.gate(&[
                depth_statements,
                depth_mentions.clone(),
                depth_clusters.clone(),
            ]),
            Arc::clone(&self.review),
            Arc::clone(&self.stats.extractor),
            self.settings(cfg.chunk_batch_size),
        );
        tasks.extend(extractor.spawn(&shutdown));

        let entities = StageRunner::new(
            Arc::new(EntityExtractor::new(
                Arc::clone(&self.llm),
                Arc::clone(&self.store),
                cfg.llm_concurrency,
                retry.clone(),
            )),
            Arc::clone(&self.statements),
            Some(Arc::clone(&self.mentions)),
            self.gate(&[depth_mentions, depth_clusters.clone()]),
            Arc::clone(&self.review),
            Arc::clone(&self.stats.entities),
            self.settings(cfg.statement_batch_size),
        );
        tasks.extend(entities.spawn(&shutdown));

        let resolver = StageRunner::new(
            Arc::new(Resolver::new(
                Arc::clone(&self.embedder),
                Arc::clone(&self.store),
                MatchPolicy::from_config(cfg),
                cfg.embed_concurrency,
                cfg.partitions,
                retry.clone(),
            )),
            Arc::clone(&self.mentions),
            Some(Arc::clone(&self.clusters)),
            self.gate(&[depth_clusters]),
            Arc::clone(&self.review),
            Arc::clone(&self.stats.resolver),
            self.settings(cfg.mention_batch_size),
        );
        tasks.extend(resolver.spawn(&shutdown));

        let invalidator = StageRunner::<_, _, MemoryQueue<Uuid>>::new(
            Arc::new(Invalidator::new(
                Arc::clone(&self.llm),
                Arc::clone(&self.store),
                Arc::clone(&self.review),
                cfg.llm_concurrency,
                cfg.min_supersede_confidence,
                cfg.partitions,
                retry,
            )),
            Arc::clone(&self.clusters),
            None,
            AdmissionGate::new(cfg.queue_depth_limit),
            Arc::clone(&self.review),
            Arc::clone(&self.stats.invalidator),
            self.settings(cfg.partitions),
        );
        tasks.extend(invalidator.spawn(&shutdown));

        tasks.push(self.spawn_sweep());

        info!(
            workers_per_stage = cfg.workers_per_stage,
            queue_depth_limit = cfg.queue_depth_limit,
            "pipeline started"
        );
        Ok(())
    }

    fn spawn_sweep(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let clusters = Arc::clone(&self.clusters);
        let period = self.config.sweep_interval();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                match sweep(store.as_ref(), clusters.as_ref()).await {
                    Ok(n) => info!(clusters = n, "invalidation sweep enqueued clusters"),
                    Err(e) => warn!(error = %e, "invalidation sweep failed"),
                }
            }
        })
    }

    /// Queue a document for ingestion; waits while the intake queue is full.
    pub async fn submit(&self, document: Document) -> Result<()> {
        self.documents.enqueue(document).await
    }

    pub async fn submit_all(&self, documents: impl IntoIterator<Item = Document>) -> Result<usize> {
        let mut n = 0;
        for document in documents {
            self.submit(document).await?;
            n += 1;
        }
        Ok(n)
    }

    /// Enqueue every cluster with two or more active statements now.
    pub async fn sweep_now(&self) -> Result<usize> {
        sweep(self.store.as_ref(), self.clusters.as_ref()).await
    }

    /// Resolve once every queue is empty with nothing in flight.
    ///
    /// Depths are read upstream first. An item is enqueued downstream before
    /// its input is acked, so a pass that reads all zeros cannot have missed
    /// an item moving between queues.
    pub async fn wait_idle(&self) {
        let mut depths = vec![
            self.documents.watch_depth(),
            self.chunks.watch_depth(),
            self.statements.watch_depth(),
            self.mentions.watch_depth(),
            self.clusters.watch_depth(),
        ];
        loop {
            let mut idle = true;
            for rx in depths.iter_mut() {
                if *rx.borrow_and_update() != 0 {
                    idle = false;
                    break;
                }
            }
            if idle {
                return;
            }
            let changes = depths.iter_mut().map(|rx| Box::pin(rx.changed()));
            if select_all(changes).await.0.is_err() {
                return;
            }
        }
    }

    /// Stop workers after their current batch, then close queues and storage.
    ///
    /// Workers blocked on a full downstream queue are released by closing the
    /// queues once `call_timeout_secs` has passed.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.documents.close();

        let mut handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => return Err(PipelineError::Config("task list poisoned".into())),
        };
        let grace = Duration::from_secs(self.config.call_timeout_secs);
        let drained = tokio::time::timeout(grace, join_all(handles.iter_mut())).await;
        self.close_queues();
        if drained.is_err() {
            warn!(?grace, "workers still busy after grace period, queues closed");
            for handle in handles {
                if !handle.is_finished() {
                    let _ = handle.await;
                }
            }
        }

        self.store.close().await?;
        info!("pipeline stopped");
        Ok(())
    }

    fn close_queues(&self) {
        self.documents.close();
        self.chunks.close();
        self.statements.close();
        self.mentions.close();
        self.clusters.close();
    }

    pub fn stats(&self) -> PipelineSnapshot {
        let report = |stage: &'static str, depth: usize, stats: &StageStats| {
            metrics::gauge!("tkg_queue_depth", "stage" => stage).set(depth as f64);
            StageReport {
                stage,
                queue_depth: depth,
                outcomes: stats.snapshot(),
            }
        };
        PipelineSnapshot {
            stages: vec![
                report(Chunker::<S>::NAME, self.documents.depth(), &self.stats.chunker),
                report(
                    StatementExtractor::<L, E, S>::NAME,
                    self.chunks.depth(),
                    &self.stats.extractor,
                ),
                report(
                    EntityExtractor::<L, S>::NAME,
                    self.statements.depth(),
                    &self.stats.entities,
                ),
                report(Resolver::<E, S>::NAME, self.mentions.depth(), &self.stats.resolver),
                report(
                    Invalidator::<L, S>::NAME,
                    self.clusters.depth(),
                    &self.stats.invalidator,
                ),
            ],
            review_items: self.review.review_count(),
            failures: self.review.failure_count(),
        }
    }

    pub fn review_log(&self) -> &Arc<ReviewLog> {
        &self.review
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}

async fn sweep<S, Q>(store: &S, clusters: &Q) -> Result<usize>
where
    S: Storage,
    Q: WorkQueue<Uuid>,
{
    let ids = store.clusters_with_min_active(2).await?;
    for id in &ids {
        clusters.enqueue(*id).await?;
    }
    Ok(ids.len())
}
