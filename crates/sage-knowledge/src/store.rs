use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use sage_protocol::{FactId, FactStore, KernelError, KernelResult, KnowledgeFact, UpsertOutcome};
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;

/// Merge `incoming` into `existing` (same content). Creation time is kept.
fn merge(existing: &mut KnowledgeFact, incoming: KnowledgeFact) {
    existing.text = incoming.text;
    existing.source = incoming.source;
    existing.confidence = incoming.confidence;
    if incoming.embedding.is_some() {
        existing.embedding = incoming.embedding;
    }
    existing.updated_at = Utc::now();
}

fn upsert_into(facts: &mut IndexMap<FactId, KnowledgeFact>, fact: KnowledgeFact) -> UpsertOutcome {
    match facts.get_mut(&fact.id) {
        Some(existing) => {
            merge(existing, fact);
            UpsertOutcome::Updated
        }
        None => {
            facts.insert(fact.id.clone(), fact);
            UpsertOutcome::Inserted
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFactStore {
    facts: RwLock<IndexMap<FactId, KnowledgeFact>>,
}

impl InMemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn upsert(&self, fact: KnowledgeFact) -> KernelResult<UpsertOutcome> {
        Ok(upsert_into(&mut self.facts.write(), fact))
    }

    async fn get(&self, id: &FactId) -> KernelResult<Option<KnowledgeFact>> {
        Ok(self.facts.read().get(id).cloned())
    }

    async fn list_all(&self) -> KernelResult<Vec<KnowledgeFact>> {
        Ok(self.facts.read().values().cloned().collect())
    }

    async fn remove(&self, id: &FactId) -> KernelResult<bool> {
        Ok(self.facts.write().shift_remove(id).is_some())
    }
}

/// Facts kept in memory and rewritten to one JSON file after every change.
#[derive(Debug)]
pub struct FileFactStore {
    path: PathBuf,
    facts: AsyncMutex<IndexMap<FactId, KnowledgeFact>>,
}

impl FileFactStore {
    pub async fn open(path: impl Into<PathBuf>) -> KernelResult<Self> {
        let path = path.into();
        let facts = Self::load(&path)
            .await
            .map_err(|error| KernelError::Storage(format!("{error:#}")))?;
        Ok(Self {
            path,
            facts: AsyncMutex::new(facts),
        })
    }

    async fn load(path: &PathBuf) -> Result<IndexMap<FactId, KnowledgeFact>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(IndexMap::new());
        }
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed reading fact file {path:?}"))?;
        let list: Vec<KnowledgeFact> = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing fact file {path:?}"))?;
        Ok(list.into_iter().map(|fact| (fact.id.clone(), fact)).collect())
    }

    async fn flush(&self, facts: &IndexMap<FactId, KnowledgeFact>) -> KernelResult<()> {
        let write = async {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create fact dir {parent:?}"))?;
            }
            let list: Vec<&KnowledgeFact> = facts.values().collect();
            let payload = serde_json::to_string_pretty(&list)?;
            fs::write(&self.path, payload)
                .await
                .with_context(|| format!("failed writing fact file {:?}", self.path))?;
            anyhow::Ok(())
        };
        write
            .await
            .map_err(|error| KernelError::Storage(format!("{error:#}")))
    }
}

#[async_trait]
impl FactStore for FileFactStore {
    async fn upsert(&self, fact: KnowledgeFact) -> KernelResult<UpsertOutcome> {
        let mut facts = self.facts.lock().await;
        let outcome = upsert_into(&mut facts, fact);
        self.flush(&facts).await?;
        Ok(outcome)
    }

    async fn get(&self, id: &FactId) -> KernelResult<Option<KnowledgeFact>> {
        Ok(self.facts.lock().await.get(id).cloned())
    }

    async fn list_all(&self) -> KernelResult<Vec<KnowledgeFact>> {
        Ok(self.facts.lock().await.values().cloned().collect())
    }

    async fn remove(&self, id: &FactId) -> KernelResult<bool> {
        let mut facts = self.facts.lock().await;
        let removed = facts.shift_remove(id).is_some();
        if removed {
            self.flush(&facts).await?;
        }
        Ok(removed)
    }
}
