//! # sage-protocol: shared contract for the sage assistant core
//!
//! Defines the types every other crate agrees on: typed ids, the closed event
//! catalog carried by the bus, the conversation data model, tool types, and
//! the ports behind which model and persistence backends live.
//!
//! It has no runtime dependencies (no tokio) so adapters can depend on it
//! without pulling in the orchestration core.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (CorrelationId, SessionId, FactId, ...)
//! - [`event`]: Event envelope, EventKind tags, and the EventPayload sum type
//! - [`memory`]: Roles, memory entries, and session metadata
//! - [`knowledge`]: Knowledge facts and content normalization
//! - [`personality`]: Clamped trait vector and style flags
//! - [`tool`]: Tool definitions, invocations, and results
//! - [`model`]: Chat request/response shapes for the model backend
//! - [`ports`]: Backend boundaries (model, sessions, facts, profiles)
//! - [`error`]: KernelError, BackendError, KernelResult

pub mod error;
pub mod event;
pub mod ids;
pub mod knowledge;
pub mod memory;
pub mod model;
pub mod personality;
pub mod ports;
pub mod tool;

pub use error::{BackendError, KernelError, KernelResult};
pub use event::{Event, EventKind, EventPayload};
pub use ids::{CorrelationId, EventId, ExchangeId, FactId, SessionId, ToolRunId};
pub use knowledge::{KnowledgeFact, normalize_fact_text};
pub use memory::{MemoryEntry, Role, SessionInfo};
pub use model::{
    ChatChunkStream, ChatMessage, ChatPurpose, ChatRequest, ChatResponse, ChatRole,
    ToolCallRequest,
};
pub use personality::{PersonalityTraits, StyleFlags, TraitName};
pub use ports::{FactStore, ModelBackend, ProfileStore, SessionStore, UpsertOutcome};
pub use tool::{ToolDefinition, ToolFailure, ToolInvocation, ToolOutcome, ToolResult};
