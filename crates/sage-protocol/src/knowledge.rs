//! Long-lived knowledge facts.

use crate::ids::FactId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A stored fact. The id is derived from the normalized text, so two facts
/// with equal content always share an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFact {
    pub id: FactId,
    pub text: String,
    pub source: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KnowledgeFact {
    pub fn new(text: impl Into<String>, source: impl Into<String>, confidence: f32) -> Self {
        let text = text.into().trim().to_owned();
        let now = Utc::now();
        Self {
            id: fact_id_for(&text),
            text,
            source: source.into(),
            confidence: clamp_confidence(confidence),
            embedding: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Lowercase, trim, and collapse internal whitespace.
pub fn normalize_fact_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 hex of the normalized text.
pub fn fact_id_for(text: &str) -> FactId {
    let digest = Sha256::digest(normalize_fact_text(text).as_bytes());
    FactId::from_string(hex::encode(digest))
}

pub fn clamp_confidence(confidence: f32) -> f32 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_shares_id() {
        let a = KnowledgeFact::new("The sky is  blue", "user", 0.9);
        let b = KnowledgeFact::new("the sky is blue ", "import", 0.4);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(KnowledgeFact::new("x", "user", 4.0).confidence, 1.0);
        assert_eq!(KnowledgeFact::new("y", "user", -1.0).confidence, 0.0);
        assert_eq!(KnowledgeFact::new("z", "user", f32::NAN).confidence, 0.0);
    }
}
