//! Stage 5: entity clusters → closed statements.
//!
//! Within a cluster, statements are walked in `(valid_from, created_at)`
//! order. Each statement is judged against the active statements before it
//! whose interval reaches its start; verdicts come back for the whole
//! candidate set in one call. A supersession closes the older statement at
//! the newer one's `valid_from`. Pairs already judged are skipped, so
//! re-running a cluster changes nothing.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::Storage;
use crate::errors::{PipelineError, Result};
use crate::llm_client::LlmClient;
use crate::model::Statement;
use crate::prompts::invalidate::{self, InvalidationVerdicts};
use crate::utils::keyed_lock::KeyedLocks;
use crate::utils::partition::partition_by;
use crate::utils::retry::{with_retry, RetryPolicy};

use super::review::ReviewLog;
use super::worker::{permit, ItemOutcome, StageHandler};

/// Earlier statements that `newer` may supersede: still open, and still
/// valid at `newer.valid_from`.
pub fn candidates_for<'a>(
    newer: &Statement,
    earlier: &'a [Statement],
    closed: &HashSet<Uuid>,
) -> Vec<&'a Statement> {
    earlier
        .iter()
        .filter(|c| !closed.contains(&c.id))
        .filter(|c| c.valid_to.map_or(true, |end| end > newer.valid_from))
        .collect()
}

pub struct Invalidator<L, S> {
    llm: Arc<L>,
    store: Arc<S>,
    review: Arc<ReviewLog>,
    clusters: KeyedLocks<Uuid>,
    llm_permits: Semaphore,
    min_confidence: f32,
    partitions: usize,
    retry: RetryPolicy,
}

impl<L: LlmClient + 'static, S: Storage + 'static> Invalidator<L, S> {
    pub fn new(
        llm: Arc<L>,
        store: Arc<S>,
        review: Arc<ReviewLog>,
        llm_concurrency: usize,
        min_confidence: f32,
        partitions: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            store,
            review,
            clusters: KeyedLocks::new(),
            llm_permits: Semaphore::new(llm_concurrency.max(1)),
            min_confidence,
            partitions,
            retry,
        }
    }

    /// Evaluate one cluster. Returns the ids of statements closed by this run.
    pub async fn invalidate_cluster(&self, entity_id: Uuid) -> Result<Vec<Uuid>> {
        let _guard = self
            .clusters
            .try_lock(&entity_id)
            .ok_or(PipelineError::Contention(entity_id))?;

        let active = self.store.active_statements(entity_id).await?;
        let mut closed = HashSet::new();
        let mut closed_now = Vec::new();

        for (pos, newer) in active.iter().enumerate() {
            if closed.contains(&newer.id) {
                continue;
            }
            let mut candidates = Vec::new();
            for candidate in candidates_for(newer, &active[..pos], &closed) {
                if !self.store.was_evaluated(newer.id, candidate.id).await? {
                    candidates.push(candidate.clone());
                }
            }
            if candidates.is_empty() {
                continue;
            }

            for id in self.judge(newer, &candidates).await? {
                closed.insert(id);
                closed_now.push(id);
            }
            let judged: Vec<Uuid> = candidates.iter().map(|c| c.id).collect();
            self.store.mark_evaluated(newer.id, &judged).await?;
        }

        debug!(entity_id = %entity_id, active = active.len(), closed = closed_now.len(), "cluster evaluated");
        Ok(closed_now)
    }

    /// Ask for verdicts on `candidates` and apply the confident ones.
    async fn judge(&self, newer: &Statement, candidates: &[Statement]) -> Result<Vec<Uuid>> {
        let messages = invalidate::messages(newer, candidates);
        let (llm, permits, msgs) = (&self.llm, &self.llm_permits, &messages);
        let response: InvalidationVerdicts =
            with_retry(&self.retry, "llm.invalidate", || async move {
                let _permit = permit(permits).await?;
                llm.generate_structured(msgs).await
            })
            .await?;

        let mut closed = Vec::new();
        for verdict in response.verdicts {
            let Some(candidate) = verdict
                .candidate
                .checked_sub(1)
                .and_then(|i| candidates.get(i))
            else {
                self.review.flag(
                    Self::NAME,
                    newer.id.to_string(),
                    format!("verdict names unknown candidate {}", verdict.candidate),
                    &verdict,
                );
                continue;
            };
            if !verdict.supersede {
                continue;
            }
            if verdict.confidence < self.min_confidence {
                self.review.flag(
                    Self::NAME,
                    candidate.id.to_string(),
                    format!(
                        "supersession by {} below confidence bound ({:.2})",
                        newer.id, verdict.confidence
                    ),
                    &json!({ "newer": newer, "candidate": candidate, "confidence": verdict.confidence }),
                );
                continue;
            }
            if self
                .store
                .close_statement(candidate.id, newer.valid_from, Some(newer.id))
                .await?
            {
                info!(
                    statement_id = %candidate.id,
                    superseded_by = %newer.id,
                    valid_to = %newer.valid_from,
                    "statement superseded"
                );
                closed.push(candidate.id);
            }
        }
        Ok(closed)
    }

    async fn run_partition(&self, work: Vec<(usize, Uuid)>) -> Vec<(usize, ItemOutcome<Uuid>)> {
        let mut outcomes = Vec::with_capacity(work.len());
        for (idx, entity_id) in work {
            let result = self.invalidate_cluster(entity_id).await;
            outcomes.push((idx, ItemOutcome::from_result(result)));
        }
        outcomes
    }
}

impl<L, S> StageHandler for Invalidator<L, S>
where
    L: LlmClient + 'static,
    S: Storage + 'static,
{
    type Input = Uuid;
    type Output = Uuid;
    const NAME: &'static str = "invalidator";

    fn item_id(item: &Uuid) -> String {
        item.to_string()
    }

    async fn handle_batch(&self, items: Vec<Uuid>) -> Vec<ItemOutcome<Uuid>> {
        let total = items.len();
        let partitions = partition_by(
            items.into_iter().enumerate().collect(),
            self.partitions,
            |(_, entity_id)| *entity_id,
        );
        let mut outcomes: Vec<Option<ItemOutcome<Uuid>>> = (0..total).map(|_| None).collect();
        for (idx, outcome) in join_all(partitions.into_iter().map(|p| self.run_partition(p)))
            .await
            .into_iter()
            .flatten()
        {
            outcomes[idx] = Some(outcome);
        }
        outcomes
            .into_iter()
            .map(|o| o.unwrap_or(ItemOutcome::Yield))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, StatementStore};
    use crate::llm_client::mock::ScriptedLlmClient;
    use crate::model::StatementStatus;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    fn year(y: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).unwrap()
    }

    async fn active(store: &MemoryDriver, entity: Uuid, text: &str, from: i32) -> Statement {
        let s = Statement::proposed(Uuid::new_v4(), 0, "Acme Corp", text, year(from), None);
        store.insert_statements(std::slice::from_ref(&s)).await.unwrap();
        store.activate_statement(s.id, entity).await.unwrap();
        store.get_statement(s.id).await.unwrap().unwrap()
    }

    fn build(llm: ScriptedLlmClient) -> (Invalidator<ScriptedLlmClient, MemoryDriver>, Arc<MemoryDriver>, Arc<ReviewLog>, Arc<ScriptedLlmClient>) {
        let store = Arc::new(MemoryDriver::new());
        let review = Arc::new(ReviewLog::new());
        let llm = Arc::new(llm);
        let retry = RetryPolicy {
            max_attempts: 2,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            call_timeout: Duration::from_secs(5),
        };
        let invalidator = Invalidator::new(Arc::clone(&llm), Arc::clone(&store), Arc::clone(&review), 2, 0.7, 4, retry);
        (invalidator, store, review, llm)
    }

    #[test]
    fn candidates_must_reach_the_newer_start() {
        let entity = Uuid::new_v4();
        let mut ended = Statement::proposed(Uuid::new_v4(), 0, "A", "A was small.", year(2010), Some(year(2015)));
        ended.entity_id = Some(entity);
        let open = Statement::proposed(Uuid::new_v4(), 0, "A", "A is based in Paris.", year(2018), None);
        let newer = Statement::proposed(Uuid::new_v4(), 0, "A", "A is based in Berlin.", year(2020), None);

        let earlier = [ended, open.clone()];
        let picked = candidates_for(&newer, &earlier, &HashSet::new());
        assert_eq!(picked.iter().map(|c| c.id).collect::<Vec<_>>(), vec![open.id]);

        let closed = HashSet::from([open.id]);
        assert!(candidates_for(&newer, &earlier, &closed).is_empty());
    }

    #[tokio::test]
    async fn newer_statement_closes_older_at_its_start() {
        let llm = ScriptedLlmClient::new().on(
            "Decide for each candidate",
            r#"{"verdicts":[{"candidate":1,"supersede":true,"confidence":0.9}]}"#,
        );
        let (invalidator, store, _, _) = build(llm);
        let entity = Uuid::new_v4();
        let old = active(&store, entity, "Acme Corp owns Beta Inc.", 2020).await;
        let new = active(&store, entity, "Acme Corp sold Beta Inc.", 2023).await;

        let closed = invalidator.invalidate_cluster(entity).await.unwrap();
        assert_eq!(closed, vec![old.id]);

        let old = store.get_statement(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, StatementStatus::Inactive);
        assert_eq!(old.valid_to, Some(year(2023)));
        assert_eq!(old.superseded_by, Some(new.id));
        assert!(store.get_statement(new.id).await.unwrap().unwrap().is_active());
    }

    #[tokio::test]
    async fn rerun_skips_judged_pairs() {
        let llm = ScriptedLlmClient::new().on(
            "Decide for each candidate",
            r#"{"verdicts":[{"candidate":1,"supersede":false,"confidence":0.9}]}"#,
        );
        let (invalidator, store, _, llm) = build(llm);
        let entity = Uuid::new_v4();
        active(&store, entity, "Acme Corp makes rockets.", 2020).await;
        active(&store, entity, "Acme Corp makes boats.", 2021).await;

        assert!(invalidator.invalidate_cluster(entity).await.unwrap().is_empty());
        assert!(invalidator.invalidate_cluster(entity).await.unwrap().is_empty());
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn low_confidence_goes_to_review() {
        let llm = ScriptedLlmClient::new().on(
            "Decide for each candidate",
            r#"{"verdicts":[{"candidate":1,"supersede":true,"confidence":0.4},{"candidate":7,"supersede":true,"confidence":0.9}]}"#,
        );
        let (invalidator, store, review, _) = build(llm);
        let entity = Uuid::new_v4();
        let old = active(&store, entity, "Acme Corp is in Ohio.", 2020).await;
        active(&store, entity, "Acme Corp is in Texas.", 2022).await;

        assert!(invalidator.invalidate_cluster(entity).await.unwrap().is_empty());
        assert!(store.get_statement(old.id).await.unwrap().unwrap().is_active());
        assert_eq!(review.review_count(), 2);
    }

    #[tokio::test]
    async fn held_cluster_yields() {
        let (invalidator, _, _, _) = build(ScriptedLlmClient::new());
        let entity = Uuid::new_v4();
        let _held = invalidator.clusters.try_lock(&entity).unwrap();
        let outcomes = invalidator.handle_batch(vec![entity]).await;
        assert!(matches!(outcomes[0], ItemOutcome::Yield));
    }
}
