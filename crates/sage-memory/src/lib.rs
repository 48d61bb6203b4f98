//! Conversation memory as a bus module.
//!
//! The module keeps the active session's last `max_window` turns in a FIFO
//! window and answers `memory.query` from it. Writes go to the window
//! synchronously and to the backing [`SessionStore`] through an ordered
//! persistence queue, so a query issued right after a `memory.store` always
//! sees the new turn.

mod store;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sage_events::{BusHandle, Module, ModuleSlot};
use sage_protocol::{
    CorrelationId, EventKind, EventPayload, KernelResult, MemoryEntry, Role, SessionId,
    SessionInfo, SessionStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use store::{FileSessionStore, InMemorySessionStore};

pub const MODULE_NAME: &str = "memory";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Upper bound on turns kept in the window and returned by a query.
    pub max_window: usize,
    pub session_title: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_window: 50,
            session_title: "conversation".to_owned(),
        }
    }
}

#[derive(Debug)]
enum PersistOp {
    Create(SessionInfo),
    Append(MemoryEntry),
    Close(SessionId),
}

#[derive(Default)]
struct Window {
    active: Option<SessionInfo>,
    entries: VecDeque<MemoryEntry>,
}

struct Inner {
    slot: ModuleSlot,
    config: MemoryConfig,
    store: Arc<dyn SessionStore>,
    window: Mutex<Window>,
    persist_tx: Mutex<Option<mpsc::UnboundedSender<PersistOp>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub struct MemoryModule {
    inner: Arc<Inner>,
}

impl MemoryModule {
    pub fn new(store: Arc<dyn SessionStore>, config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: ModuleSlot::new(MODULE_NAME),
                config,
                store,
                window: Mutex::new(Window::default()),
                persist_tx: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn in_memory(config: MemoryConfig) -> Self {
        Self::new(Arc::new(InMemorySessionStore::new()), config)
    }

    /// Close any active session and open a fresh one.
    pub fn start_session(&self, title: impl Into<String>) -> SessionInfo {
        self.inner.start_session(title.into())
    }

    /// Make an existing session active, reloading its tail into the window.
    pub async fn resume_session(&self, session_id: &SessionId) -> KernelResult<SessionInfo> {
        let sessions = self.inner.store.list_sessions().await?;
        let info = sessions
            .into_iter()
            .find(|info| &info.session_id == session_id)
            .ok_or_else(|| {
                sage_protocol::KernelError::Storage(format!("session not found: {session_id}"))
            })?;
        let entries = self
            .inner
            .store
            .recent_entries(session_id, self.inner.config.max_window)
            .await?;

        let mut window = self.inner.window.lock();
        if let Some(previous) = window.active.take() {
            self.inner.persist(PersistOp::Close(previous.session_id));
        }
        window.entries = entries.into();
        window.active = Some(info.clone());
        info!(session_id = %info.session_id, restored = window.entries.len(), "session resumed");
        Ok(info)
    }

    pub fn close_session(&self) -> Option<SessionInfo> {
        self.inner.close_session()
    }

    pub fn active_session(&self) -> Option<SessionInfo> {
        self.inner.window.lock().active.clone()
    }

    pub async fn list_sessions(&self) -> KernelResult<Vec<SessionInfo>> {
        self.inner.store.list_sessions().await
    }

    /// Append a turn to the active session, opening one if needed.
    pub fn store_turn(&self, role: Role, content: impl Into<String>) -> MemoryEntry {
        self.inner.store_turn(role, content.into())
    }

    /// Up to `min(count, max_window)` most recent turns of the active
    /// session, oldest first.
    pub fn recent_window(&self, count: usize) -> Vec<MemoryEntry> {
        self.inner.recent_from_window(count)
    }

    /// Up to `min(count, max_window)` most recent turns of `session_id`,
    /// oldest first. Inactive sessions are read from the store.
    pub async fn get_recent_context(
        &self,
        session_id: &SessionId,
        count: usize,
    ) -> KernelResult<Vec<MemoryEntry>> {
        let limit = count.min(self.inner.config.max_window);
        if self
            .active_session()
            .is_some_and(|active| &active.session_id == session_id)
        {
            return Ok(self.inner.recent_from_window(limit));
        }
        self.inner.store.recent_entries(session_id, limit).await
    }
}

impl Inner {
    fn persist(&self, op: PersistOp) {
        match self.persist_tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(op).is_err() {
                    warn!("memory persistence worker is gone; dropping write");
                }
            }
            None => debug!(?op, "memory module not running; write kept in window only"),
        }
    }

    fn start_session(&self, title: String) -> SessionInfo {
        let mut window = self.window.lock();
        self.open_session(&mut window, title)
    }

    fn open_session(&self, window: &mut Window, title: String) -> SessionInfo {
        let info = SessionInfo::open(title);
        if let Some(previous) = window.active.take() {
            self.persist(PersistOp::Close(previous.session_id));
        }
        window.entries.clear();
        window.active = Some(info.clone());
        self.persist(PersistOp::Create(info.clone()));
        info!(session_id = %info.session_id, title = %info.title, "session started");
        info
    }

    fn close_session(&self) -> Option<SessionInfo> {
        let mut window = self.window.lock();
        let mut info = window.active.take()?;
        window.entries.clear();
        info.closed_at = Some(chrono::Utc::now());
        self.persist(PersistOp::Close(info.session_id.clone()));
        info!(session_id = %info.session_id, "session closed");
        Some(info)
    }

    fn store_turn(&self, role: Role, content: String) -> MemoryEntry {
        let mut window = self.window.lock();
        let active = window.active.as_ref().map(|info| info.session_id.clone());
        let session_id = match active {
            Some(session_id) => session_id,
            None => {
                self.open_session(&mut window, self.config.session_title.clone())
                    .session_id
            }
        };

        let entry = MemoryEntry::new(session_id, role, content);
        window.entries.push_back(entry.clone());
        while window.entries.len() > self.config.max_window {
            window.entries.pop_front();
        }
        self.persist(PersistOp::Append(entry.clone()));
        entry
    }

    fn recent_from_window(&self, count: usize) -> Vec<MemoryEntry> {
        let window = self.window.lock();
        let take = count.min(self.config.max_window).min(window.entries.len());
        let skip = window.entries.len() - take;
        window.entries.iter().skip(skip).cloned().collect()
    }

    fn answer_query(&self, count: usize, correlation_id: CorrelationId) {
        let entries = self.recent_from_window(count);
        debug!(%correlation_id, count, returned = entries.len(), "memory query answered");
        if let Err(error) = self.slot.emit(EventPayload::MemoryResult {
            correlation_id,
            entries,
        }) {
            warn!(%error, "failed to emit memory.result");
        }
    }
}

async fn run_persistence(store: Arc<dyn SessionStore>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        let result = match &op {
            PersistOp::Create(info) => store.create_session(info.clone()).await,
            PersistOp::Append(entry) => store.append_entry(entry).await,
            PersistOp::Close(session_id) => store.close_session(session_id).await,
        };
        if let Err(error) = result {
            warn!(%error, ?op, "memory persistence failed");
        }
    }
    debug!("memory persistence worker drained");
}

#[async_trait]
impl Module for MemoryModule {
    fn name(&self) -> &str {
        self.inner.slot.name()
    }

    async fn init(&self, bus: BusHandle) -> KernelResult<()> {
        self.inner.slot.attach(bus.clone())?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.worker.lock() = Some(tokio::spawn(run_persistence(
            self.inner.store.clone(),
            rx,
        )));
        *self.inner.persist_tx.lock() = Some(tx);

        let inner = self.inner.clone();
        bus.subscribe(EventKind::MemoryQuery, move |event| {
            if let EventPayload::MemoryQuery {
                count,
                correlation_id,
            } = &event.payload
            {
                inner.answer_query(*count, correlation_id.clone());
            }
        })?;

        let inner = self.inner.clone();
        bus.subscribe(EventKind::MemoryStore, move |event| {
            if let EventPayload::MemoryStore { role, content } = &event.payload {
                inner.store_turn(*role, content.clone());
            }
        })?;

        info!(max_window = self.inner.config.max_window, "memory module ready");
        Ok(())
    }

    async fn shutdown(&self) -> KernelResult<()> {
        self.inner.slot.detach();
        self.inner.persist_tx.lock().take();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                warn!(%error, "memory persistence worker panicked");
            }
        }
        info!("memory module stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sage_events::EventBus;
    use sage_protocol::{KernelError, SessionId};

    use super::*;

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn create_session(&self, _info: SessionInfo) -> KernelResult<()> {
            Err(KernelError::Storage("disk full".to_owned()))
        }
        async fn close_session(&self, _session_id: &SessionId) -> KernelResult<()> {
            Err(KernelError::Storage("disk full".to_owned()))
        }
        async fn list_sessions(&self) -> KernelResult<Vec<SessionInfo>> {
            Err(KernelError::Storage("disk full".to_owned()))
        }
        async fn append_entry(&self, _entry: &MemoryEntry) -> KernelResult<()> {
            Err(KernelError::Storage("disk full".to_owned()))
        }
        async fn recent_entries(
            &self,
            _session_id: &SessionId,
            _limit: usize,
        ) -> KernelResult<Vec<MemoryEntry>> {
            Err(KernelError::Storage("disk full".to_owned()))
        }
    }

    fn small_window(max_window: usize) -> MemoryConfig {
        MemoryConfig {
            max_window,
            ..MemoryConfig::default()
        }
    }

    #[tokio::test]
    async fn window_evicts_oldest_turns_first() {
        let memory = MemoryModule::in_memory(small_window(3));
        for index in 0..5 {
            memory.store_turn(Role::User, format!("m{index}"));
        }
        let recent = memory.recent_window(10);
        let contents: Vec<_> = recent.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn recent_context_is_chronological_and_bounded_by_count() {
        let memory = MemoryModule::in_memory(MemoryConfig::default());
        memory.store_turn(Role::User, "hi");
        memory.store_turn(Role::Assistant, "hello");
        memory.store_turn(Role::User, "how are you");

        let recent = memory.recent_window(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].role, Role::Assistant);
        assert_eq!(recent[1].content, "how are you");
    }

    #[tokio::test]
    async fn first_store_opens_a_session_lazily() {
        let memory = MemoryModule::in_memory(MemoryConfig::default());
        assert!(memory.active_session().is_none());
        let entry = memory.store_turn(Role::User, "hi");
        let active = memory.active_session().unwrap();
        assert_eq!(entry.session_id, active.session_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_turns_share_one_session() {
        let bus = EventBus::new();
        let memory = Arc::new(MemoryModule::in_memory(MemoryConfig::default()));
        bus.register_module(memory.clone()).unwrap();
        bus.awake().await.unwrap();

        let entries: Vec<MemoryEntry> = std::thread::scope(|scope| {
            let writers: Vec<_> = (0..8)
                .map(|index| {
                    let memory = &memory;
                    scope.spawn(move || memory.store_turn(Role::User, format!("turn {index}")))
                })
                .collect();
            writers.into_iter().map(|writer| writer.join().unwrap()).collect()
        });
        bus.sleep().await.unwrap();

        let active = memory.active_session().unwrap();
        assert!(entries.iter().all(|entry| entry.session_id == active.session_id));
        assert_eq!(memory.recent_window(20).len(), 8);
        assert_eq!(memory.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_session_starts_with_empty_window() {
        let memory = MemoryModule::in_memory(MemoryConfig::default());
        memory.store_turn(Role::User, "old");
        let first = memory.active_session().unwrap();
        let second = memory.start_session("fresh");
        assert_ne!(first.session_id, second.session_id);
        assert!(memory.recent_window(10).is_empty());
        assert!(memory.close_session().is_some());
        assert!(memory.active_session().is_none());
    }

    #[tokio::test]
    async fn context_for_an_inactive_session_comes_from_the_store() {
        let bus = EventBus::new();
        let memory = Arc::new(MemoryModule::in_memory(small_window(2)));
        bus.register_module(memory.clone()).unwrap();
        bus.awake().await.unwrap();

        let first = memory.store_turn(Role::User, "a").session_id;
        memory.store_turn(Role::Assistant, "b");
        memory.store_turn(Role::User, "c");
        memory.start_session("second");
        bus.sleep().await.unwrap();

        let history = memory.get_recent_context(&first, 10).await.unwrap();
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "c"]);
        let sessions = memory.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(!sessions[0].is_open());
    }

    #[tokio::test]
    async fn query_is_answered_with_same_correlation_id() {
        let bus = EventBus::new();
        let memory = Arc::new(MemoryModule::in_memory(MemoryConfig::default()));
        bus.register_module(memory.clone()).unwrap();
        bus.awake().await.unwrap();

        let mut tap = bus.subscribe_events();
        bus.emit(EventPayload::MemoryStore {
            role: Role::User,
            content: "remember this turn".to_owned(),
        });
        let correlation_id = CorrelationId::new_uuid();
        bus.emit(EventPayload::MemoryQuery {
            count: 5,
            correlation_id: correlation_id.clone(),
        });

        let mut answered = None;
        while let Ok(event) = tap.try_recv() {
            if let EventPayload::MemoryResult {
                correlation_id: id,
                entries,
            } = event.payload
            {
                answered = Some((id, entries));
            }
        }
        let (id, entries) = answered.expect("memory.result emitted");
        assert_eq!(id, correlation_id);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "remember this turn");

        bus.sleep().await.unwrap();
    }

    #[tokio::test]
    async fn store_failures_do_not_break_queries() {
        let bus = EventBus::new();
        let memory = Arc::new(MemoryModule::new(
            Arc::new(FailingStore),
            MemoryConfig::default(),
        ));
        bus.register_module(memory.clone()).unwrap();
        bus.awake().await.unwrap();

        memory.store_turn(Role::User, "still here");
        let recent = memory.recent_window(5);
        assert_eq!(recent.len(), 1);
        assert!(memory.list_sessions().await.is_err());

        bus.sleep().await.unwrap();
    }

    #[tokio::test]
    async fn turns_reach_the_store_after_shutdown_drains() {
        let store = Arc::new(InMemorySessionStore::new());
        let bus = EventBus::new();
        let memory = Arc::new(MemoryModule::new(store.clone(), MemoryConfig::default()));
        bus.register_module(memory.clone()).unwrap();
        bus.awake().await.unwrap();

        let entry = memory.store_turn(Role::User, "persist me");
        bus.sleep().await.unwrap();

        let stored = store.recent_entries(&entry.session_id, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "persist me");
    }
}
