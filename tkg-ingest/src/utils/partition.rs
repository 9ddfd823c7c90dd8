//! Hash partitioning of work items.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Partition index for `key` among `partitions` buckets (`hash(key) mod N`).
///
/// `partitions == 0` is treated as a single partition.
pub fn partition_for<K: Hash + ?Sized>(key: &K, partitions: usize) -> usize {
    let partitions = partitions.max(1);
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

/// Split `items` into `partitions` buckets by `key_fn`, preserving the
/// relative order of items within each bucket. Empty buckets are dropped.
pub fn partition_by<T, K, F>(items: Vec<T>, partitions: usize, key_fn: F) -> Vec<Vec<T>>
where
    K: Hash,
    F: Fn(&T) -> K,
{
    let partitions = partitions.max(1);
    let mut buckets: Vec<Vec<T>> = (0..partitions).map(|_| Vec::new()).collect();
    for item in items {
        let idx = partition_for(&key_fn(&item), partitions);
        buckets[idx].push(item);
    }
    buckets.retain(|b| !b.is_empty());
    buckets
}
