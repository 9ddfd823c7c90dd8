//! Shared utilities.
//!
//! Includes:
//! - Date/time parsing for model-supplied validity bounds
//! - String normalization and sentence boundary detection
//! - Vector similarity helpers
//! - Bounded retry with backoff and per-call timeouts
//! - Hash partitioning and per-key async locks

pub mod datetime;
pub mod keyed_lock;
pub mod partition;
pub mod retry;
pub mod similarity;
pub mod text;

pub use datetime::{parse_flexible_datetime, parse_optional_bound};
pub use keyed_lock::{KeyGuard, KeyedLocks};
pub use partition::{partition_by, partition_for};
pub use retry::{with_retry, ClientBackoff, RetryPolicy};
pub use similarity::{cosine_similarity, normalize_l2, top_k_cosine};
pub use text::{json_payload, normalize_key, normalize_whitespace, sentence_boundaries, truncate_chars};
