//! Embedding-similarity reranking

use serde::Serialize;
use std::cmp::Ordering;

/// One scored document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedDocument {
    /// Position in the request's `documents`
    pub index: usize,
    pub document: String,
    pub relevance_score: f32,
}

/// Cosine similarity of two vectors.
///
/// Zero-norm inputs and mismatched lengths score 0.0 so a substituted zero
/// embedding never produces NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_finite() { score } else { 0.0 }
}

/// Score `documents` against `query`, sort descending and keep the best
/// `top_k`.
///
/// Ties keep request order. `None` or `Some(0)` keeps everything.
pub fn rank(
    query: &[f32],
    documents: &[String],
    embeddings: &[Vec<f32>],
    top_k: Option<usize>,
) -> Vec<RankedDocument> {
    let mut ranked: Vec<RankedDocument> = documents
        .iter()
        .zip(embeddings)
        .enumerate()
        .map(|(index, (document, embedding))| RankedDocument {
            index,
            document: document.clone(),
            relevance_score: cosine_similarity(query, embedding),
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(Ordering::Equal)
    });

    if let Some(k) = top_k.filter(|&k| k > 0) {
        ranked.truncate(k);
    }

    ranked
}
