//! Cosine scoring over embedding vectors.
//!
//! Degenerate inputs (empty, zero-length norm, mismatched dimensions) score
//! `0.0` rather than erroring: they can never clear a merge threshold.

use ndarray::ArrayView1;

fn norm(v: ArrayView1<'_, f32>) -> f32 {
    v.dot(&v).sqrt()
}

/// `query` scored against a candidate whose norm is already known.
fn score(query: ArrayView1<'_, f32>, query_norm: f32, candidate: &[f32]) -> f32 {
    if candidate.len() != query.len() {
        return 0.0;
    }
    let candidate = ArrayView1::from(candidate);
    let denom = query_norm * norm(candidate);
    if denom == 0.0 {
        0.0
    } else {
        (query.dot(&candidate) / denom).clamp(-1.0, 1.0)
    }
}

/// Cosine similarity in `[-1, 1]`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let a = ArrayView1::from(a);
    score(a, norm(a), b)
}

/// Unit-length copy of `v`. Zero vectors come back unchanged.
pub fn normalize_l2(v: &[f32]) -> Vec<f32> {
    let length = norm(ArrayView1::from(v));
    if length == 0.0 {
        return v.to_vec();
    }
    (&ArrayView1::from(v) / length).to_vec()
}

/// The `k` best `(position, score)` pairs for `query` among `vectors`,
/// highest score first. Ties keep insertion order.
pub fn top_k_cosine(query: &[f32], vectors: &[&[f32]], k: usize) -> Vec<(usize, f32)> {
    if k == 0 || vectors.is_empty() {
        return Vec::new();
    }
    let q = ArrayView1::from(query);
    let q_norm = norm(q);
    let mut ranked: Vec<(usize, f32)> = vectors
        .iter()
        .map(|v| score(q, q_norm, v))
        .enumerate()
        .collect();
    ranked.sort_by(|x, y| y.1.total_cmp(&x.1));
    ranked.truncate(k);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-5,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn scores_span_minus_one_to_one() {
        close(cosine_similarity(&[2.0, 0.0], &[5.0, 0.0]), 1.0);
        close(cosine_similarity(&[0.0, 3.0], &[4.0, 0.0]), 0.0);
        close(cosine_similarity(&[1.0, 1.0], &[-1.0, -1.0]), -1.0);
        // 3-4-5 triangle: (3*4 + 4*3) / 25
        close(cosine_similarity(&[3.0, 4.0], &[4.0, 3.0]), 0.96);
    }

    #[test]
    fn degenerate_inputs_score_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.5, 0.5]), 0.0);
    }

    #[test]
    fn normalized_vectors_have_unit_length() {
        let unit = normalize_l2(&[0.0, 6.0, 8.0]);
        close(unit[1], 0.6);
        close(unit[2], 0.8);
        close(norm(ArrayView1::from(unit.as_slice())), 1.0);

        assert_eq!(normalize_l2(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert!(normalize_l2(&[]).is_empty());
    }

    #[test]
    fn normalizing_keeps_direction() {
        let raw = [1.0, -2.0, 0.5];
        close(cosine_similarity(&raw, &normalize_l2(&raw)), 1.0);
    }

    #[test]
    fn top_k_ranks_best_first() {
        let acme = [0.9, 0.1];
        let acme_corp = [1.0, 0.0];
        let beta = [0.0, 1.0];
        let hits = top_k_cosine(&[1.0, 0.0], &[&beta, &acme, &acme_corp], 2);

        let positions: Vec<usize> = hits.iter().map(|(pos, _)| *pos).collect();
        assert_eq!(positions, vec![2, 1]);
        close(hits[0].1, 1.0);
    }

    #[test]
    fn top_k_skips_wrong_dimensions_and_handles_empty() {
        let short = [1.0];
        let good = [0.5, 0.5];
        let hits = top_k_cosine(&[1.0, 1.0], &[&short, &good], 5);
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits[1], (0, 0.0));

        assert!(top_k_cosine(&[1.0], &[], 3).is_empty());
        assert!(top_k_cosine(&[1.0], &[&short], 0).is_empty());
    }
}
