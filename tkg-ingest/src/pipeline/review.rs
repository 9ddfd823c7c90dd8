//! Items set aside for a human and items that could not be processed.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::warn;

use crate::utils::truncate_chars;

/// Error text kept per failure report, in characters.
const MAX_ERROR_CHARS: usize = 500;

/// Something a stage refused to decide on its own.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewItem {
    pub stage: &'static str,
    /// Id of the record the flag is about (document, chunk, statement, mention).
    pub item_id: String,
    pub reason: String,
    pub payload: serde_json::Value,
    pub flagged_at: DateTime<Utc>,
}

/// An item that exhausted its deliveries or failed permanently.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub stage: &'static str,
    pub item_id: String,
    pub error: String,
    pub deliveries: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ReviewLog {
    next: AtomicU64,
    flagged: DashMap<u64, ReviewItem>,
    failures: DashMap<u64, FailureReport>,
}

impl ReviewLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag<P: Serialize>(
        &self,
        stage: &'static str,
        item_id: impl Into<String>,
        reason: impl Into<String>,
        payload: &P,
    ) {
        let item = ReviewItem {
            stage,
            item_id: item_id.into(),
            reason: reason.into(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            flagged_at: Utc::now(),
        };
        warn!(stage, item_id = %item.item_id, reason = %item.reason, "flagged for review");
        metrics::counter!("tkg_review_flags_total", "stage" => stage).increment(1);
        self.flagged.insert(self.next.fetch_add(1, Ordering::SeqCst), item);
    }

    pub fn fail(
        &self,
        stage: &'static str,
        item_id: impl Into<String>,
        error: impl Into<String>,
        deliveries: u32,
    ) {
        let error: String = error.into();
        let report = FailureReport {
            stage,
            item_id: item_id.into(),
            error: truncate_chars(&error, MAX_ERROR_CHARS),
            deliveries,
            failed_at: Utc::now(),
        };
        warn!(stage, item_id = %report.item_id, error = %report.error, deliveries, "item failed");
        self.failures
            .insert(self.next.fetch_add(1, Ordering::SeqCst), report);
    }

    /// Flagged items in the order they were raised.
    pub fn items(&self) -> Vec<ReviewItem> {
        let mut entries: Vec<(u64, ReviewItem)> = self
            .flagged
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, item)| item).collect()
    }

    pub fn failures(&self) -> Vec<FailureReport> {
        let mut entries: Vec<(u64, FailureReport)> = self
            .failures
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, report)| report).collect()
    }

    pub fn review_count(&self) -> usize {
        self.flagged.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}
