//! Runtime boundary ports.
//!
//! These traits are the only boundary between the orchestration core and its
//! external collaborators: the model backend and the persistence backends for
//! sessions, facts, and personality profiles.
//!
//! Traits use `async-trait` for async dyn-dispatch; streaming uses a boxed
//! stream (`ChatChunkStream`).

use crate::error::{BackendError, KernelResult};
use crate::ids::{FactId, SessionId};
use crate::knowledge::KnowledgeFact;
use crate::memory::{MemoryEntry, SessionInfo};
use crate::model::{ChatChunkStream, ChatRequest, ChatResponse};
use crate::personality::PersonalityTraits;
use async_trait::async_trait;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError>;

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream, BackendError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, info: SessionInfo) -> KernelResult<()>;
    async fn close_session(&self, session_id: &SessionId) -> KernelResult<()>;
    async fn list_sessions(&self) -> KernelResult<Vec<SessionInfo>>;
    async fn append_entry(&self, entry: &MemoryEntry) -> KernelResult<()>;
    /// Most recent `limit` entries of a session, oldest first.
    async fn recent_entries(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> KernelResult<Vec<MemoryEntry>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[async_trait]
pub trait FactStore: Send + Sync {
    /// Insert a fact, or update confidence/source/embedding of the fact with
    /// the same id.
    async fn upsert(&self, fact: KnowledgeFact) -> KernelResult<UpsertOutcome>;
    async fn get(&self, id: &FactId) -> KernelResult<Option<KnowledgeFact>>;
    async fn list_all(&self) -> KernelResult<Vec<KnowledgeFact>>;
    async fn remove(&self, id: &FactId) -> KernelResult<bool>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn load(&self) -> KernelResult<Option<PersonalityTraits>>;
    async fn save(&self, traits: &PersonalityTraits) -> KernelResult<()>;
}
