//! The bus wire contract: envelope, kind tags, and typed payloads.
//!
//! Every payload shape is a variant of [`EventPayload`], so subscribers match
//! on a closed enum instead of casting untyped data. [`EventKind`] is the
//! fieldless tag used as the subscription key.

use crate::ids::{CorrelationId, EventId};
use crate::knowledge::KnowledgeFact;
use crate::memory::{MemoryEntry, Role};
use crate::personality::{PersonalityTraits, TraitName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscription key for bus listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "input.received")]
    InputReceived,
    #[serde(rename = "memory.query")]
    MemoryQuery,
    #[serde(rename = "memory.result")]
    MemoryResult,
    #[serde(rename = "memory.store")]
    MemoryStore,
    #[serde(rename = "personality.query")]
    PersonalityQuery,
    #[serde(rename = "personality.result")]
    PersonalityResult,
    #[serde(rename = "personality.adjust")]
    PersonalityAdjust,
    #[serde(rename = "knowledge.query")]
    KnowledgeQuery,
    #[serde(rename = "knowledge.result")]
    KnowledgeResult,
    #[serde(rename = "knowledge.store")]
    KnowledgeStore,
    #[serde(rename = "tool.start")]
    ToolStart,
    #[serde(rename = "tool.complete")]
    ToolComplete,
    #[serde(rename = "tool.error")]
    ToolError,
    #[serde(rename = "output.chunk")]
    OutputChunk,
    #[serde(rename = "output.ready")]
    OutputReady,
    #[serde(rename = "core.started")]
    CoreStarted,
    #[serde(rename = "core.stopped")]
    CoreStopped,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputReceived => "input.received",
            Self::MemoryQuery => "memory.query",
            Self::MemoryResult => "memory.result",
            Self::MemoryStore => "memory.store",
            Self::PersonalityQuery => "personality.query",
            Self::PersonalityResult => "personality.result",
            Self::PersonalityAdjust => "personality.adjust",
            Self::KnowledgeQuery => "knowledge.query",
            Self::KnowledgeResult => "knowledge.result",
            Self::KnowledgeStore => "knowledge.store",
            Self::ToolStart => "tool.start",
            Self::ToolComplete => "tool.complete",
            Self::ToolError => "tool.error",
            Self::OutputChunk => "output.chunk",
            Self::OutputReady => "output.ready",
            Self::CoreStarted => "core.started",
            Self::CoreStopped => "core.stopped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed event data, one variant per [`EventKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    #[serde(rename = "input.received")]
    InputReceived { text: String },

    // ── Memory ──
    #[serde(rename = "memory.query")]
    MemoryQuery {
        count: usize,
        correlation_id: CorrelationId,
    },
    #[serde(rename = "memory.result")]
    MemoryResult {
        correlation_id: CorrelationId,
        entries: Vec<MemoryEntry>,
    },
    #[serde(rename = "memory.store")]
    MemoryStore { role: Role, content: String },

    // ── Personality ──
    #[serde(rename = "personality.query")]
    PersonalityQuery { correlation_id: CorrelationId },
    #[serde(rename = "personality.result")]
    PersonalityResult {
        correlation_id: CorrelationId,
        prompt: String,
        traits: PersonalityTraits,
    },
    #[serde(rename = "personality.adjust")]
    PersonalityAdjust {
        #[serde(rename = "trait")]
        trait_name: TraitName,
        delta: f32,
    },

    // ── Knowledge ──
    #[serde(rename = "knowledge.query")]
    KnowledgeQuery {
        query: String,
        correlation_id: CorrelationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    #[serde(rename = "knowledge.result")]
    KnowledgeResult {
        correlation_id: CorrelationId,
        facts: Vec<KnowledgeFact>,
    },
    #[serde(rename = "knowledge.store")]
    KnowledgeStore {
        fact: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },

    // ── Tool lifecycle ──
    #[serde(rename = "tool.start")]
    ToolStart {
        correlation_id: CorrelationId,
        tool_name: String,
        args: serde_json::Value,
    },
    #[serde(rename = "tool.complete")]
    ToolComplete {
        correlation_id: CorrelationId,
        tool_name: String,
        args: serde_json::Value,
        output: String,
        elapsed_ms: u64,
    },
    #[serde(rename = "tool.error")]
    ToolError {
        correlation_id: CorrelationId,
        tool_name: String,
        args: serde_json::Value,
        message: String,
        elapsed_ms: u64,
    },

    // ── Output ──
    #[serde(rename = "output.chunk")]
    OutputChunk { text: String, done: bool },
    #[serde(rename = "output.ready")]
    OutputReady { text: String },

    // ── Core lifecycle ──
    #[serde(rename = "core.started")]
    CoreStarted {},
    #[serde(rename = "core.stopped")]
    CoreStopped {},
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::InputReceived { .. } => EventKind::InputReceived,
            Self::MemoryQuery { .. } => EventKind::MemoryQuery,
            Self::MemoryResult { .. } => EventKind::MemoryResult,
            Self::MemoryStore { .. } => EventKind::MemoryStore,
            Self::PersonalityQuery { .. } => EventKind::PersonalityQuery,
            Self::PersonalityResult { .. } => EventKind::PersonalityResult,
            Self::PersonalityAdjust { .. } => EventKind::PersonalityAdjust,
            Self::KnowledgeQuery { .. } => EventKind::KnowledgeQuery,
            Self::KnowledgeResult { .. } => EventKind::KnowledgeResult,
            Self::KnowledgeStore { .. } => EventKind::KnowledgeStore,
            Self::ToolStart { .. } => EventKind::ToolStart,
            Self::ToolComplete { .. } => EventKind::ToolComplete,
            Self::ToolError { .. } => EventKind::ToolError,
            Self::OutputChunk { .. } => EventKind::OutputChunk,
            Self::OutputReady { .. } => EventKind::OutputReady,
            Self::CoreStarted {} => EventKind::CoreStarted,
            Self::CoreStopped {} => EventKind::CoreStopped,
        }
    }

    /// The correlation id carried by query, result, and tool payloads.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Self::MemoryQuery { correlation_id, .. }
            | Self::MemoryResult { correlation_id, .. }
            | Self::PersonalityQuery { correlation_id }
            | Self::PersonalityResult { correlation_id, .. }
            | Self::KnowledgeQuery { correlation_id, .. }
            | Self::KnowledgeResult { correlation_id, .. }
            | Self::ToolStart { correlation_id, .. }
            | Self::ToolComplete { correlation_id, .. }
            | Self::ToolError { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}

/// Envelope delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap a payload with a fresh id and the current timestamp.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            event_id: EventId::default(),
            timestamp: Utc::now(),
            kind: payload.kind(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_kind_matches_payload() {
        let event = Event::new(EventPayload::OutputReady {
            text: "hi".to_owned(),
        });
        assert_eq!(event.kind, EventKind::OutputReady);
        assert_eq!(event.kind.as_str(), "output.ready");
    }

    #[test]
    fn payload_serializes_with_dotted_kind() {
        let payload = EventPayload::MemoryQuery {
            count: 5,
            correlation_id: CorrelationId::from_string("c1"),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "memory.query");
        assert_eq!(json["data"]["count"], 5);
        assert_eq!(json["data"]["correlation_id"], "c1");
    }

    #[test]
    fn adjust_payload_uses_trait_field_name() {
        let payload = EventPayload::PersonalityAdjust {
            trait_name: TraitName::Humor,
            delta: 0.25,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["data"]["trait"], "humor");
    }

    #[test]
    fn correlation_id_is_exposed_for_results() {
        let id = CorrelationId::from_string("k1");
        let payload = EventPayload::KnowledgeResult {
            correlation_id: id.clone(),
            facts: vec![],
        };
        assert_eq!(payload.correlation_id(), Some(&id));
        assert!(
            EventPayload::InputReceived {
                text: "x".to_owned()
            }
            .correlation_id()
            .is_none()
        );
    }
}
