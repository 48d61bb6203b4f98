//! Knowledge module: long-lived facts and relevance retrieval.
//!
//! Queries and stores arrive as bus events and are served on spawned tasks,
//! since both may call the model backend for embeddings. Lookup failures are
//! logged and answered with an empty fact list.

mod rank;
mod store;

use std::sync::Arc;

use async_trait::async_trait;
use sage_events::{BusHandle, Module, ModuleSlot};
use sage_protocol::{
    CorrelationId, EventKind, EventPayload, FactId, FactStore, KernelResult, KnowledgeFact,
    ModelBackend, UpsertOutcome,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use rank::{cosine, top_k};
pub use store::{FileFactStore, InMemoryFactStore};

pub const MODULE_NAME: &str = "knowledge";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Facts returned when a query carries no `limit`.
    pub default_limit: usize,
    /// Embed facts and queries through the model backend when one is set.
    pub use_embeddings: bool,
    /// Store "remember that …" statements from user input.
    pub capture_remember: bool,
    pub default_confidence: f32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            default_limit: 5,
            use_embeddings: false,
            capture_remember: true,
            default_confidence: 0.8,
        }
    }
}

const REMEMBER_MARKERS: &[&str] = &["remember that ", "remember: "];

/// The statement after a "remember that" / "remember:" marker, if any.
pub fn extract_remember(text: &str) -> Option<String> {
    let lowered = text.to_ascii_lowercase();
    REMEMBER_MARKERS.iter().find_map(|marker| {
        let start = lowered.find(marker)? + marker.len();
        let statement = text[start..]
            .trim()
            .trim_end_matches(['.', '!'])
            .trim();
        (!statement.is_empty()).then(|| statement.to_owned())
    })
}

struct Inner {
    slot: ModuleSlot,
    config: KnowledgeConfig,
    store: Arc<dyn FactStore>,
    backend: Option<Arc<dyn ModelBackend>>,
}

pub struct KnowledgeModule {
    inner: Arc<Inner>,
}

impl KnowledgeModule {
    pub fn new(store: Arc<dyn FactStore>, config: KnowledgeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: ModuleSlot::new(MODULE_NAME),
                config,
                store,
                backend: None,
            }),
        }
    }

    pub fn in_memory(config: KnowledgeConfig) -> Self {
        Self::new(Arc::new(InMemoryFactStore::new()), config)
    }

    /// Backend used for embeddings. Must be set before the module is shared.
    pub fn with_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.backend = Some(backend);
        }
        self
    }

    pub async fn store_fact(
        &self,
        text: &str,
        source: &str,
        confidence: f32,
    ) -> KernelResult<UpsertOutcome> {
        self.inner.store_fact(text, source, confidence).await
    }

    pub async fn search(&self, query: &str, limit: usize) -> KernelResult<Vec<KnowledgeFact>> {
        self.inner.search(query, limit).await
    }

    pub async fn list_all(&self) -> KernelResult<Vec<KnowledgeFact>> {
        self.inner.store.list_all().await
    }

    pub async fn forget(&self, id: &FactId) -> KernelResult<bool> {
        let removed = self.inner.store.remove(id).await?;
        if removed {
            info!(fact_id = %id, "fact forgotten");
        }
        Ok(removed)
    }
}

impl Inner {
    fn embedder(&self) -> Option<&Arc<dyn ModelBackend>> {
        self.backend.as_ref().filter(|_| self.config.use_embeddings)
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let backend = self.embedder()?;
        match backend.embed(text).await {
            Ok(embedding) => Some(embedding),
            Err(error) => {
                warn!(%error, "embedding failed; continuing without it");
                None
            }
        }
    }

    #[instrument(skip(self), fields(len = text.len()))]
    async fn store_fact(
        &self,
        text: &str,
        source: &str,
        confidence: f32,
    ) -> KernelResult<UpsertOutcome> {
        let mut fact = KnowledgeFact::new(text, source, confidence);
        if let Some(embedding) = self.embed(&fact.text).await {
            fact = fact.with_embedding(embedding);
        }
        let fact_id = fact.id.clone();
        let outcome = self.store.upsert(fact).await?;
        debug!(%fact_id, ?outcome, "fact stored");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &str, limit: usize) -> KernelResult<Vec<KnowledgeFact>> {
        let facts = self.store.list_all().await?;
        if facts.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let query_embedding = self.embed(query).await;
        Ok(top_k(query, query_embedding.as_deref(), facts, limit))
    }

    async fn answer_query(&self, query: String, limit: usize, correlation_id: CorrelationId) {
        let facts = match self.search(&query, limit).await {
            Ok(facts) => facts,
            Err(error) => {
                warn!(%error, %correlation_id, "knowledge lookup failed; answering empty");
                Vec::new()
            }
        };
        debug!(%correlation_id, returned = facts.len(), "knowledge query answered");
        if let Err(error) = self.slot.emit(EventPayload::KnowledgeResult {
            correlation_id,
            facts,
        }) {
            warn!(%error, "failed to emit knowledge.result");
        }
    }

    async fn store_logged(&self, text: String, source: String, confidence: f32) {
        if text.trim().is_empty() {
            debug!("ignoring empty fact");
            return;
        }
        if let Err(error) = self.store_fact(&text, &source, confidence).await {
            warn!(%error, "failed to store fact");
        }
    }
}

#[async_trait]
impl Module for KnowledgeModule {
    fn name(&self) -> &str {
        self.inner.slot.name()
    }

    async fn init(&self, bus: BusHandle) -> KernelResult<()> {
        self.inner.slot.attach(bus.clone())?;

        let inner = self.inner.clone();
        bus.subscribe(EventKind::KnowledgeQuery, move |event| {
            if let EventPayload::KnowledgeQuery {
                query,
                correlation_id,
                limit,
            } = &event.payload
            {
                let inner = inner.clone();
                let limit = limit.unwrap_or(inner.config.default_limit);
                let (query, correlation_id) = (query.clone(), correlation_id.clone());
                tokio::spawn(async move { inner.answer_query(query, limit, correlation_id).await });
            }
        })?;

        let inner = self.inner.clone();
        bus.subscribe(EventKind::KnowledgeStore, move |event| {
            if let EventPayload::KnowledgeStore {
                fact,
                source,
                confidence,
            } = &event.payload
            {
                let inner = inner.clone();
                let source = source.clone().unwrap_or_else(|| "user".to_owned());
                let confidence = confidence.unwrap_or(inner.config.default_confidence);
                let fact = fact.clone();
                tokio::spawn(async move { inner.store_logged(fact, source, confidence).await });
            }
        })?;

        if self.inner.config.capture_remember {
            let inner = self.inner.clone();
            bus.subscribe(EventKind::InputReceived, move |event| {
                if let EventPayload::InputReceived { text } = &event.payload {
                    if let Some(statement) = extract_remember(text) {
                        let inner = inner.clone();
                        let confidence = inner.config.default_confidence;
                        tokio::spawn(async move {
                            inner
                                .store_logged(statement, "user".to_owned(), confidence)
                                .await
                        });
                    }
                }
            })?;
        }

        info!(
            embeddings = self.inner.embedder().is_some(),
            "knowledge module ready"
        );
        Ok(())
    }

    async fn shutdown(&self) -> KernelResult<()> {
        self.inner.slot.detach();
        Ok(())
    }
}
