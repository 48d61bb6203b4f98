//! Relevance scoring for facts.
//!
//! A fact is scored by cosine similarity when both it and the query carry an
//! embedding of the same dimension; otherwise by keyword overlap (share of
//! query terms present in the fact). Ties break on confidence, then recency.

use std::cmp::Ordering;
use std::collections::HashSet;

use sage_protocol::KnowledgeFact;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "i",
    "in", "is", "it", "me", "my", "of", "on", "or", "the", "to", "was", "what", "when", "where",
    "which", "who", "why", "with", "you", "your",
];

pub fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .filter(|token| !STOPWORDS.contains(&token.as_str()))
        .collect()
}

pub fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

fn keyword_score(query_terms: &HashSet<String>, fact: &KnowledgeFact) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let fact_terms = terms(&fact.text);
    let hits = query_terms.intersection(&fact_terms).count();
    hits as f32 / query_terms.len() as f32
}

fn score(query_terms: &HashSet<String>, query_embedding: Option<&[f32]>, fact: &KnowledgeFact) -> f32 {
    let semantic = query_embedding
        .zip(fact.embedding.as_deref())
        .and_then(|(q, f)| cosine(q, f));
    semantic.unwrap_or_else(|| keyword_score(query_terms, fact))
}

/// Top `limit` facts with a positive score, best first.
pub fn top_k(
    query: &str,
    query_embedding: Option<&[f32]>,
    facts: Vec<KnowledgeFact>,
    limit: usize,
) -> Vec<KnowledgeFact> {
    let query_terms = terms(query);
    let mut scored: Vec<(f32, KnowledgeFact)> = facts
        .into_iter()
        .map(|fact| (score(&query_terms, query_embedding, &fact), fact))
        .filter(|(score, _)| *score > 0.0)
        .collect();

    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal))
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
    scored.truncate(limit);
    scored.into_iter().map(|(_, fact)| fact).collect()
}
