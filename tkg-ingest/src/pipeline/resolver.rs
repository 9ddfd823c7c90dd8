//! Stage 4: entity mentions → canonical entities.
//!
//! A mention resolves, in order, to: the entity already recorded for it, an
//! entity holding the same alias key, the nearest same-type entity above the
//! merge threshold, or a newly registered entity. Registration happens under
//! a per-type lock and repeats the lookups first, so two spellings racing
//! through different partitions still end up on one entity.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::Storage;
use crate::embedder::{EmbedderClient, Embedding};
use crate::errors::{PipelineError, Result};
use crate::model::{Entity, EntityMention, EntityType};
use crate::search::{FlatIndex, SimilarityIndex};
use crate::types::{NearThresholdPolicy, PipelineConfig};
use crate::utils::keyed_lock::KeyedLocks;
use crate::utils::partition::partition_by;
use crate::utils::retry::{with_retry, RetryPolicy};
use crate::utils::text::normalize_key;

use super::worker::{permit, ItemOutcome, StageHandler};

/// Similarity thresholds for merging a mention into an existing entity.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    pub merge_threshold: f32,
    /// Width of the band below the threshold handled by `near_threshold`.
    pub review_margin: f32,
    pub near_threshold: NearThresholdPolicy,
}

impl MatchPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            merge_threshold: config.merge_threshold,
            review_margin: config.review_margin,
            near_threshold: config.near_threshold_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Decision {
    Merge(Uuid),
    Review { candidate: Uuid, score: f32 },
    Register,
}

pub struct Resolver<E, S> {
    embedder: Arc<E>,
    store: Arc<S>,
    indexes: HashMap<EntityType, Box<dyn SimilarityIndex>>,
    registration: KeyedLocks<EntityType>,
    embed_permits: Semaphore,
    policy: MatchPolicy,
    partitions: usize,
    retry: RetryPolicy,
}

impl<E: EmbedderClient, S: Storage> Resolver<E, S> {
    pub fn new(
        embedder: Arc<E>,
        store: Arc<S>,
        policy: MatchPolicy,
        embed_concurrency: usize,
        partitions: usize,
        retry: RetryPolicy,
    ) -> Self {
        let dim = embedder.dim();
        let indexes = EntityType::ALL
            .into_iter()
            .map(|t| (t, Box::new(FlatIndex::with_dim(dim)) as Box<dyn SimilarityIndex>))
            .collect();
        Self {
            embedder,
            store,
            indexes,
            registration: KeyedLocks::new(),
            embed_permits: Semaphore::new(embed_concurrency.max(1)),
            policy,
            partitions,
            retry,
        }
    }

    fn index(&self, entity_type: EntityType) -> Result<&dyn SimilarityIndex> {
        self.indexes
            .get(&entity_type)
            .map(|index| index.as_ref())
            .ok_or_else(|| PipelineError::NotFound(format!("index for {entity_type}")))
    }

    async fn embed_names(&self, mentions: &[(usize, EntityMention)]) -> Result<Vec<Embedding>> {
        let names: Vec<&str> = mentions.iter().map(|(_, m)| m.name.as_str()).collect();
        let (embedder, permits, names) = (&self.embedder, &self.embed_permits, &names);
        let vectors = with_retry(&self.retry, "embedder.entity_names", || async move {
            let _permit = permit(permits).await?;
            embedder.embed_batch(names).await
        })
        .await?;
        if vectors.len() != mentions.len() {
            return Err(PipelineError::embedder(format!(
                "expected {} embeddings, got {}",
                mentions.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    async fn decide(&self, mention: &EntityMention, embedding: &[f32]) -> Result<Decision> {
        if let Some(entity) = self
            .store
            .find_by_alias(mention.entity_type, &mention.name)
            .await?
        {
            return Ok(Decision::Merge(entity.id));
        }

        let best = self
            .index(mention.entity_type)?
            .search(embedding, 1)?
            .into_iter()
            .next();
        let MatchPolicy {
            merge_threshold,
            review_margin,
            near_threshold,
        } = self.policy;

        Ok(match best {
            Some(hit) if hit.score >= merge_threshold => Decision::Merge(hit.id),
            Some(hit) if hit.score >= merge_threshold - review_margin => match near_threshold {
                NearThresholdPolicy::Merge => Decision::Merge(hit.id),
                NearThresholdPolicy::Review => Decision::Review {
                    candidate: hit.id,
                    score: hit.score,
                },
                NearThresholdPolicy::Register => Decision::Register,
            },
            _ => Decision::Register,
        })
    }

    /// Canonical entity for a mention with no recorded resolution.
    async fn match_or_register(&self, mention: &EntityMention, embedding: Embedding) -> Result<Uuid> {
        let mut decision = self.decide(mention, &embedding).await?;
        let _guard = if decision == Decision::Register {
            let guard = self.registration.lock(&mention.entity_type).await;
            decision = self.decide(mention, &embedding).await?;
            Some(guard)
        } else {
            None
        };

        match decision {
            Decision::Merge(entity_id) => {
                if self.store.add_alias(entity_id, &mention.name).await? {
                    self.index(mention.entity_type)?.add(entity_id, embedding)?;
                    info!(entity_id = %entity_id, alias = %mention.name, "alias merged");
                }
                Ok(entity_id)
            }
            Decision::Review { candidate, score } => Err(PipelineError::Validation(format!(
                "'{}' is close to entity {candidate} (similarity {score:.3}) but below the merge threshold",
                mention.name
            ))),
            Decision::Register => {
                let entity = Entity::new(mention.name.clone(), mention.entity_type);
                self.store.register_entity(&entity).await?;
                self.index(mention.entity_type)?.add(entity.id, embedding)?;
                info!(entity_id = %entity.id, name = %entity.name, entity_type = %entity.entity_type, "entity registered");
                Ok(entity.id)
            }
        }
    }

    /// Activate the owning statement when the mention is its subject.
    async fn finish(&self, mention: &EntityMention, entity_id: Uuid) -> Result<Vec<Uuid>> {
        if !mention.is_subject {
            return Ok(Vec::new());
        }
        let activated = self
            .store
            .activate_statement(mention.statement_id, entity_id)
            .await?;
        debug!(statement_id = %mention.statement_id, entity_id = %entity_id, activated, "subject resolved");
        Ok(vec![entity_id])
    }

    async fn resolve_one(&self, mention: &EntityMention, embedding: Embedding) -> Result<Vec<Uuid>> {
        let entity_id = self.match_or_register(mention, embedding).await?;
        let recorded = self.store.record_resolution(mention.id, entity_id).await?;
        self.finish(mention, recorded).await
    }

    /// Mentions of one partition, in order.
    async fn resolve_partition(
        &self,
        work: Vec<(usize, EntityMention, Embedding)>,
    ) -> Vec<(usize, ItemOutcome<Uuid>)> {
        let mut outcomes = Vec::with_capacity(work.len());
        for (idx, mention, embedding) in work {
            let result = self.resolve_one(&mention, embedding).await;
            outcomes.push((idx, ItemOutcome::from_result(result)));
        }
        outcomes
    }
}

/// A batch-wide failure, reported once per affected mention.
fn shared_failure(err: &PipelineError) -> PipelineError {
    if err.is_transient() {
        PipelineError::embedder_transient(err.to_string())
    } else {
        PipelineError::embedder(err.to_string())
    }
}

impl<E, S> StageHandler for Resolver<E, S>
where
    E: EmbedderClient + 'static,
    S: Storage + 'static,
{
    type Input = EntityMention;
    type Output = Uuid;
    const NAME: &'static str = "resolver";

    fn item_id(item: &EntityMention) -> String {
        item.id.to_string()
    }

    async fn handle_batch(&self, items: Vec<EntityMention>) -> Vec<ItemOutcome<Uuid>> {
        let mut outcomes: Vec<Option<ItemOutcome<Uuid>>> = items.iter().map(|_| None).collect();

        let mut unresolved = Vec::new();
        for (idx, mention) in items.into_iter().enumerate() {
            match self.store.resolution_of(mention.id).await {
                Ok(Some(entity_id)) => {
                    outcomes[idx] = Some(ItemOutcome::from_result(
                        self.finish(&mention, entity_id).await,
                    ));
                }
                Ok(None) => unresolved.push((idx, mention)),
                Err(e) => outcomes[idx] = Some(ItemOutcome::from_error(e)),
            }
        }

        if !unresolved.is_empty() {
            match self.embed_names(&unresolved).await {
                Ok(vectors) => {
                    let work: Vec<_> = unresolved
                        .into_iter()
                        .zip(vectors)
                        .map(|((idx, mention), vector)| (idx, mention, vector))
                        .collect();
                    let partitions = partition_by(work, self.partitions, |(_, m, _)| {
                        (m.entity_type, normalize_key(&m.name))
                    });
                    let resolved =
                        join_all(partitions.into_iter().map(|p| self.resolve_partition(p))).await;
                    for (idx, outcome) in resolved.into_iter().flatten() {
                        outcomes[idx] = Some(outcome);
                    }
                }
                Err(e) => {
                    for (idx, _) in &unresolved {
                        outcomes[*idx] = Some(ItemOutcome::from_error(shared_failure(&e)));
                    }
                }
            }
        }

        outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| {
                    ItemOutcome::Failed(PipelineError::Queue("mention left without outcome".into()))
                })
            })
            .collect()
    }
}
