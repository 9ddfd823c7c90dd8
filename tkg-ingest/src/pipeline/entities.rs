//! Stage 3: statements → entity mentions.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::driver::Storage;
use crate::errors::{PipelineError, Result};
use crate::llm_client::LlmClient;
use crate::model::{EntityMention, EntityType, Statement};
use crate::prompts::extract_entities::{self, ExtractedEntities};
use crate::utils::retry::{with_retry, RetryPolicy};
use crate::utils::text::normalize_key;

use super::worker::{permit, ItemOutcome, StageHandler};

/// Make sure exactly one mention is the subject.
///
/// When the model marked none or several, the mention whose name matches the
/// statement's subject takes the role. With no match the statement cannot be
/// attributed and is rejected.
pub fn settle_subject(statement: &Statement, mentions: &mut [EntityMention]) -> Result<()> {
    if mentions.iter().filter(|m| m.is_subject).count() == 1 {
        return Ok(());
    }
    let key = normalize_key(&statement.subject);
    let chosen = mentions
        .iter()
        .position(|m| normalize_key(&m.name) == key)
        .ok_or_else(|| {
            PipelineError::Validation(format!(
                "no mention matches subject '{}'",
                statement.subject
            ))
        })?;
    for (i, mention) in mentions.iter_mut().enumerate() {
        mention.is_subject = i == chosen;
    }
    Ok(())
}

pub struct EntityExtractor<L, S> {
    llm: Arc<L>,
    store: Arc<S>,
    llm_permits: Semaphore,
    retry: RetryPolicy,
}

impl<L: LlmClient + 'static, S: Storage + 'static> EntityExtractor<L, S> {
    pub fn new(
        llm: Arc<L>,
        store: Arc<S>,
        llm_concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            store,
            llm_permits: Semaphore::new(llm_concurrency.max(1)),
            retry,
        }
    }

    async fn extract_one(&self, statement: Statement) -> Result<Vec<EntityMention>> {
        let messages = extract_entities::messages(&statement);
        let (llm, permits, msgs) = (&self.llm, &self.llm_permits, &messages);
        let response: ExtractedEntities =
            with_retry(&self.retry, "llm.extract_entities", || async move {
                let _permit = permit(permits).await?;
                llm.generate_structured(msgs).await
            })
            .await?;

        let mut mentions = Vec::with_capacity(response.entities.len());
        for (ordinal, entity) in response.entities.iter().enumerate() {
            let name = entity.name.trim();
            if name.is_empty() {
                continue;
            }
            let entity_type = entity.entity_type.parse::<EntityType>().map_err(|e| {
                PipelineError::Validation(format!("mention '{name}' of statement {}: {e}", statement.id))
            })?;
            mentions.push(EntityMention::new(
                statement.id,
                ordinal,
                name,
                entity_type,
                entity.is_subject,
            ));
        }

        settle_subject(&statement, &mut mentions)?;

        with_retry(&self.retry, "entity_registry.record_mentions", || {
            self.store.record_mentions(&mentions)
        })
        .await?;

        debug!(statement_id = %statement.id, mentions = mentions.len(), "mentions recorded");
        Ok(mentions)
    }
}

impl<L, S> StageHandler for EntityExtractor<L, S>
where
    L: LlmClient + 'static,
    S: Storage + 'static,
{
    type Input = Statement;
    type Output = EntityMention;
    const NAME: &'static str = "entity_extractor";

    fn item_id(item: &Statement) -> String {
        item.id.to_string()
    }

    async fn handle_batch(&self, items: Vec<Statement>) -> Vec<ItemOutcome<EntityMention>> {
        join_all(items.into_iter().map(|statement| self.extract_one(statement)))
            .await
            .into_iter()
            .map(ItemOutcome::from_result)
            .collect()
    }
}
