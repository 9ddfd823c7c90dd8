//! Stage 2: chunks → proposed statements.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::driver::Storage;
use crate::embedder::EmbedderClient;
use crate::errors::{PipelineError, Result};
use crate::llm_client::LlmClient;
use crate::model::{Chunk, Statement};
use crate::prompts::extract_statements::{self, ExtractedStatement, ExtractedStatements};
use crate::utils::datetime::parse_optional_bound;
use crate::utils::retry::{with_retry, RetryPolicy};

use super::review::ReviewLog;
use super::worker::{permit, ItemOutcome, StageHandler};

/// Turn one model candidate into a proposed statement.
///
/// A missing `valid_from` falls back to the chunk's reference time.
pub fn validate_candidate(
    chunk: &Chunk,
    ordinal: usize,
    candidate: &ExtractedStatement,
) -> Result<Statement> {
    let subject = candidate.subject.trim();
    let text = candidate.text.trim();
    if subject.is_empty() || text.is_empty() {
        return Err(PipelineError::Validation(
            "statement has an empty subject or text".into(),
        ));
    }

    let valid_from = parse_optional_bound(candidate.valid_from.as_deref())
        .map_err(|raw| PipelineError::Validation(format!("unparseable valid_from '{raw}'")))?
        .unwrap_or(chunk.reference_time);
    let valid_to = parse_optional_bound(candidate.valid_to.as_deref())
        .map_err(|raw| PipelineError::Validation(format!("unparseable valid_to '{raw}'")))?;

    if let Some(end) = valid_to {
        if end < valid_from {
            return Err(PipelineError::Validation(format!(
                "valid_to {end} precedes valid_from {valid_from}"
            )));
        }
    }

    Ok(Statement::proposed(
        chunk.id, ordinal, subject, text, valid_from, valid_to,
    ))
}

pub struct StatementExtractor<L, E, S> {
    llm: Arc<L>,
    embedder: Arc<E>,
    store: Arc<S>,
    review: Arc<ReviewLog>,
    llm_permits: Semaphore,
    embed_permits: Semaphore,
    retry: RetryPolicy,
    embed_statements: bool,
}

impl<L, E, S> StatementExtractor<L, E, S>
where
    L: LlmClient + 'static,
    E: EmbedderClient + 'static,
    S: Storage + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<L>,
        embedder: Arc<E>,
        store: Arc<S>,
        review: Arc<ReviewLog>,
        llm_concurrency: usize,
        embed_concurrency: usize,
        retry: RetryPolicy,
        embed_statements: bool,
    ) -> Self {
        Self {
            llm,
            embedder,
            store,
            review,
            llm_permits: Semaphore::new(llm_concurrency.max(1)),
            embed_permits: Semaphore::new(embed_concurrency.max(1)),
            retry,
            embed_statements,
        }
    }

    async fn extract_one(&self, chunk: Chunk) -> Result<Vec<Statement>> {
        let messages = extract_statements::messages(&chunk);
        let (llm, permits, msgs) = (&self.llm, &self.llm_permits, &messages);
        let response: ExtractedStatements =
            with_retry(&self.retry, "llm.extract_statements", || async move {
                let _permit = permit(permits).await?;
                llm.generate_structured(msgs).await
            })
            .await?;

        let mut statements = Vec::with_capacity(response.statements.len());
        for (ordinal, candidate) in response.statements.iter().enumerate() {
            match validate_candidate(&chunk, ordinal, candidate) {
                Ok(statement) => statements.push(statement),
                // Siblings proceed; only the bad candidate is set aside.
                Err(e) => self.review.flag(
                    Self::NAME,
                    format!("{}#{ordinal}", chunk.id),
                    e.to_string(),
                    candidate,
                ),
            }
        }

        if self.embed_statements && !statements.is_empty() {
            self.embed(&mut statements).await?;
        }

        let inserted = with_retry(&self.retry, "statement_store.insert", || {
            self.store.insert_statements(&statements)
        })
        .await?;

        if statements.is_empty() {
            debug!(chunk_id = %chunk.id, "no statements in chunk");
        } else {
            info!(chunk_id = %chunk.id, statements = statements.len(), inserted, "statements extracted");
        }
        Ok(statements)
    }

    async fn embed(&self, statements: &mut [Statement]) -> Result<()> {
        let texts: Vec<&str> = statements.iter().map(|s| s.text.as_str()).collect();
        let (embedder, permits, texts) = (&self.embedder, &self.embed_permits, &texts);
        let vectors = with_retry(&self.retry, "embedder.statements", || async move {
            let _permit = permit(permits).await?;
            embedder.embed_batch(texts).await
        })
        .await?;
        for (statement, vector) in statements.iter_mut().zip(vectors) {
            statement.embedding = Some(vector);
        }
        Ok(())
    }
}

impl<L, E, S> StageHandler for StatementExtractor<L, E, S>
where
    L: LlmClient + 'static,
    E: EmbedderClient + 'static,
    S: Storage + 'static,
{
    type Input = Chunk;
    type Output = Statement;
    const NAME: &'static str = "statement_extractor";

    fn item_id(item: &Chunk) -> String {
        item.id.to_string()
    }

    async fn handle_batch(&self, items: Vec<Chunk>) -> Vec<ItemOutcome<Statement>> {
        join_all(items.into_iter().map(|chunk| self.extract_one(chunk)))
            .await
            .into_iter()
            .map(ItemOutcome::from_result)
            .collect()
    }
}
