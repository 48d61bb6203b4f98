use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::RwLock;
use sage_protocol::{KernelError, KernelResult, MemoryEntry, SessionId, SessionInfo, SessionStore};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<IndexMap<SessionId, (SessionInfo, Vec<MemoryEntry>)>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, info: SessionInfo) -> KernelResult<()> {
        self.sessions
            .write()
            .entry(info.session_id.clone())
            .or_insert_with(|| (info, Vec::new()));
        Ok(())
    }

    async fn close_session(&self, session_id: &SessionId) -> KernelResult<()> {
        let mut sessions = self.sessions.write();
        let (info, _) = sessions
            .get_mut(session_id)
            .ok_or_else(|| KernelError::Storage(format!("session not found: {session_id}")))?;
        info.closed_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    async fn list_sessions(&self) -> KernelResult<Vec<SessionInfo>> {
        Ok(self
            .sessions
            .read()
            .values()
            .map(|(info, _)| info.clone())
            .collect())
    }

    async fn append_entry(&self, entry: &MemoryEntry) -> KernelResult<()> {
        let mut sessions = self.sessions.write();
        let (_, entries) = sessions
            .get_mut(&entry.session_id)
            .ok_or_else(|| {
                KernelError::Storage(format!("session not found: {}", entry.session_id))
            })?;
        entries.push(entry.clone());
        Ok(())
    }

    async fn recent_entries(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> KernelResult<Vec<MemoryEntry>> {
        let sessions = self.sessions.read();
        let Some((_, entries)) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..].to_vec())
    }
}

/// Sessions as directories under `root`: `session.json` plus an append-only
/// `entries.jsonl`.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join("sessions").join(session_id.as_str())
    }

    fn info_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("session.json")
    }

    fn entries_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join("entries.jsonl")
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create session dir {parent:?}"))?;
        }
        Ok(())
    }

    async fn write_info(&self, info: &SessionInfo) -> Result<()> {
        let path = self.info_path(&info.session_id);
        Self::ensure_parent(&path).await?;
        let payload = serde_json::to_string_pretty(info)?;
        fs::write(&path, payload)
            .await
            .with_context(|| format!("failed writing session file {path:?}"))?;
        Ok(())
    }

    async fn read_info(&self, session_id: &SessionId) -> Result<SessionInfo> {
        let path = self.info_path(session_id);
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed reading session file {path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("failed parsing session file {path:?}"))
    }

    async fn append_line(&self, entry: &MemoryEntry) -> Result<()> {
        let path = self.entries_path(&entry.session_id);
        Self::ensure_parent(&path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening entry log {path:?}"))?;
        let line = serde_json::to_string(entry)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_entries(&self, session_id: &SessionId, limit: usize) -> Result<Vec<MemoryEntry>> {
        let path = self.entries_path(session_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut entries = Vec::new();

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let entry: MemoryEntry = serde_json::from_str(&line)
                .with_context(|| format!("failed parsing entry line in {path:?}"))?;
            entries.push(entry);
        }

        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    async fn scan_sessions(&self) -> Result<Vec<SessionInfo>> {
        let dir = self.root.join("sessions");
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut reader = fs::read_dir(&dir).await?;
        let mut sessions = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let id = SessionId::from_string(entry.file_name().to_string_lossy().into_owned());
            match self.read_info(&id).await {
                Ok(info) => sessions.push(info),
                Err(error) => tracing::warn!(session_id = %id, %error, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }
}

fn to_kernel_error(error: anyhow::Error) -> KernelError {
    KernelError::Storage(format!("{error:#}"))
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create_session(&self, info: SessionInfo) -> KernelResult<()> {
        self.write_info(&info).await.map_err(to_kernel_error)
    }

    async fn close_session(&self, session_id: &SessionId) -> KernelResult<()> {
        let mut info = self.read_info(session_id).await.map_err(to_kernel_error)?;
        info.closed_at.get_or_insert_with(Utc::now);
        self.write_info(&info).await.map_err(to_kernel_error)
    }

    async fn list_sessions(&self) -> KernelResult<Vec<SessionInfo>> {
        self.scan_sessions().await.map_err(to_kernel_error)
    }

    async fn append_entry(&self, entry: &MemoryEntry) -> KernelResult<()> {
        self.append_line(entry).await.map_err(to_kernel_error)
    }

    async fn recent_entries(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> KernelResult<Vec<MemoryEntry>> {
        self.read_entries(session_id, limit)
            .await
            .map_err(to_kernel_error)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use sage_protocol::Role;

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn file_store_returns_latest_entries_in_order() -> anyhow::Result<()> {
        let root = unique_test_root("sage-memory-file");
        let store = FileSessionStore::new(&root);
        let info = SessionInfo::open("test");
        let session_id = info.session_id.clone();
        store.create_session(info).await?;

        for index in 0..5 {
            store
                .append_entry(&MemoryEntry::new(
                    session_id.clone(),
                    Role::User,
                    format!("turn {index}"),
                ))
                .await?;
        }

        let recent = store.recent_entries(&session_id, 2).await?;
        let contents: Vec<_> = recent.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["turn 3", "turn 4"]);

        store.close_session(&session_id).await?;
        let sessions = store.list_sessions().await?;
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_open());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_store_rejects_entries_for_unknown_session() {
        let store = InMemorySessionStore::new();
        let entry = MemoryEntry::new(SessionId::from_string("ghost"), Role::User, "boo");
        assert!(store.append_entry(&entry).await.is_err());
        let recent = store
            .recent_entries(&SessionId::from_string("ghost"), 10)
            .await
            .unwrap();
        assert!(recent.is_empty());
    }
}
