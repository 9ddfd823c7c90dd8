//! Stage 1: documents → ordered, bounded chunks.
//!
//! One chunk per sentence. A sentence longer than the bound is cut at the
//! last whitespace inside the bound, or mid-word when there is none. The
//! spans tile the document exactly, so concatenating chunk texts in position
//! order gives back the original text.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info};

use crate::driver::Storage;
use crate::errors::{PipelineError, Result};
use crate::model::{Chunk, Document};
use crate::utils::retry::{with_retry, RetryPolicy};
use crate::utils::text::sentence_boundaries;

use super::worker::{ItemOutcome, StageHandler};

/// Byte spans `[start, end)` covering `text`. Each span is at most
/// `max_chars` bytes long, not counting whitespace folded onto its end.
pub fn split_spans(text: &str, max_chars: usize) -> Vec<(usize, usize)> {
    let max_chars = max_chars.max(1);
    let mut spans = Vec::new();
    let mut start = 0;
    for end in sentence_boundaries(text) {
        let mut pos = start;
        while end - pos > max_chars {
            let cut = cut_point(text, pos, max_chars);
            spans.push((pos, cut));
            pos = cut;
        }
        if end > pos {
            // Whitespace-only remainders belong to the chunk before them.
            match spans.last_mut() {
                Some(prev) if text[pos..end].trim().is_empty() => prev.1 = end,
                _ => spans.push((pos, end)),
            }
        }
        start = end;
    }
    spans
}

/// Where to end a piece starting at `pos`: just past the last whitespace
/// within `max_chars` bytes, else at the last char boundary within the bound.
fn cut_point(text: &str, pos: usize, max_chars: usize) -> usize {
    let mut limit = pos + max_chars;
    while !text.is_char_boundary(limit) {
        limit -= 1;
    }
    if limit == pos {
        // Bound smaller than one character: take the whole character.
        return text[pos..]
            .char_indices()
            .nth(1)
            .map_or(text.len(), |(i, _)| pos + i);
    }
    let window = &text[pos..limit];
    match window.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        Some((i, c)) if i > 0 => pos + i + c.len_utf8(),
        _ => limit,
    }
}

/// Build the chunk records of `document`.
pub fn chunk_document(document: &Document, max_chars: usize) -> Vec<Chunk> {
    let now = Utc::now();
    split_spans(&document.text, max_chars)
        .into_iter()
        .enumerate()
        .map(|(position, (start, end))| Chunk {
            id: Chunk::id_for(document.id, position),
            document_id: document.id,
            position,
            start,
            end,
            text: document.text[start..end].to_string(),
            reference_time: document.metadata.timestamp,
            created_at: now,
        })
        .collect()
}

pub struct Chunker<S> {
    store: Arc<S>,
    max_chars: usize,
    retry: RetryPolicy,
}

impl<S: Storage> Chunker<S> {
    pub fn new(store: Arc<S>, max_chars: usize, retry: RetryPolicy) -> Self {
        Self {
            store,
            max_chars,
            retry,
        }
    }

    async fn chunk_one(&self, document: Document) -> Result<Vec<Chunk>> {
        if document.text.trim().is_empty() {
            return Err(PipelineError::Validation(format!(
                "document {} has no text",
                document.id
            )));
        }

        let chunks = chunk_document(&document, self.max_chars);
        let inserted = with_retry(&self.retry, "chunk_store.insert_document", || {
            self.store.insert_document(&document, &chunks)
        })
        .await?;

        if !inserted {
            debug!(document_id = %document.id, "document already ingested, skipping");
            return Ok(Vec::new());
        }
        info!(
            document_id = %document.id,
            origin = %document.metadata.origin,
            chunks = chunks.len(),
            "document chunked"
        );
        Ok(chunks)
    }
}

impl<S: Storage + 'static> StageHandler for Chunker<S> {
    type Input = Document;
    type Output = Chunk;
    const NAME: &'static str = "chunker";

    fn item_id(item: &Document) -> String {
        item.id.to_string()
    }

    async fn handle_batch(&self, items: Vec<Document>) -> Vec<ItemOutcome<Chunk>> {
        // Documents are independent; their storage writes overlap.
        join_all(items.into_iter().map(|doc| self.chunk_one(doc)))
            .await
            .into_iter()
            .map(ItemOutcome::from_result)
            .collect()
    }
}
