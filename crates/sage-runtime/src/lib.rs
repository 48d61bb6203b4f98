//! # sage-runtime: the orchestrator
//!
//! Turns each `input.received` into one exchange:
//!
//! 1. fan out `memory.query`, `personality.query` and `knowledge.query`
//!    with fresh correlation ids;
//! 2. join the three results in a [`JoinBarrier`];
//! 3. assemble the prompt and run the bounded [`ToolLoop`];
//! 4. stream the answer as `output.chunk`… then `output.ready`, and persist
//!    both turns through `memory.store`.

mod barrier;
mod config;
mod parse;
mod prompt;
mod tool_loop;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use sage_events::{BusHandle, Module, ModuleSlot};
use sage_protocol::{
    ChatMessage, ChatRequest, CorrelationId, EventKind, EventPayload, ExchangeId, KernelResult,
    ModelBackend, Role,
};
use sage_tools::ToolExecutor;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, info, info_span, warn};

pub use barrier::{
    CorrelationSet, FillOutcome, GatheredContext, JoinBarrier, SlotKind, SlotValue,
};
pub use config::{ExchangePolicy, ITERATION_CAP_MESSAGE, OrchestratorConfig};
pub use parse::{parse_fenced_tool_calls, tool_requests};
pub use prompt::{build_messages, fold_summary, system_prompt};
pub use tool_loop::{LoopOutcome, ToolLoop, render_results, summarize_results};

pub const MODULE_NAME: &str = "orchestrator";

const CONTEXT_TIMEOUT_MESSAGE: &str =
    "I couldn't gather the context for that message in time. Please try again.";

struct Inner {
    slot: ModuleSlot,
    config: OrchestratorConfig,
    backend: Arc<dyn ModelBackend>,
    executor: ToolExecutor,
    barrier: JoinBarrier,
    /// Replaced on every `init`; `shutdown` closes it.
    gate: Mutex<Arc<Semaphore>>,
    queue_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    queue_worker: Mutex<Option<JoinHandle<()>>>,
    exchanges: Mutex<JoinSet<()>>,
}

/// Bus module driving every exchange from input to output.
pub struct OrchestratorModule {
    inner: Arc<Inner>,
}

impl OrchestratorModule {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        executor: ToolExecutor,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: ModuleSlot::new(MODULE_NAME),
                config,
                backend,
                executor,
                barrier: JoinBarrier::new(),
                gate: Mutex::new(Arc::new(Semaphore::new(1))),
                queue_tx: Mutex::new(None),
                queue_worker: Mutex::new(None),
                exchanges: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Exchanges still waiting for context.
    pub fn pending_exchanges(&self) -> usize {
        self.inner.barrier.pending_len()
    }
}

impl Inner {
    fn emit(&self, payload: EventPayload) {
        if let Err(error) = self.slot.emit(payload) {
            warn!(%error, "orchestrator failed to emit");
        }
    }

    fn gate(&self) -> Arc<Semaphore> {
        self.gate.lock().clone()
    }

    fn on_input(self: &Arc<Self>, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            debug!("ignoring empty input");
            return;
        }
        match self.config.exchange_policy {
            ExchangePolicy::Concurrent => self.begin(text.to_owned(), None),
            ExchangePolicy::Reject => match self.gate().try_acquire_owned() {
                Ok(permit) => self.begin(text.to_owned(), Some(permit)),
                Err(_) => {
                    info!("exchange in progress; rejecting input");
                    self.deliver(&self.config.busy_message);
                }
            },
            ExchangePolicy::Queue => match self.queue_tx.lock().as_ref() {
                Some(tx) => {
                    if tx.send(text.to_owned()).is_err() {
                        warn!("exchange queue is closed; dropping input");
                    }
                }
                None => warn!("orchestrator not running; dropping input"),
            },
        }
    }

    /// AwaitingContext: register the exchange and fan out the three queries.
    fn begin(self: &Arc<Self>, text: String, permit: Option<OwnedSemaphorePermit>) {
        let ids = self.barrier.open(text.clone(), permit);
        debug!(exchange_id = %ids.exchange_id, "awaiting context");

        self.emit(EventPayload::MemoryQuery {
            count: self.config.history_turns,
            correlation_id: ids.memory.clone(),
        });
        self.emit(EventPayload::PersonalityQuery {
            correlation_id: ids.personality.clone(),
        });
        self.emit(EventPayload::KnowledgeQuery {
            query: text,
            correlation_id: ids.knowledge.clone(),
            limit: Some(self.config.knowledge_limit),
        });

        if self.config.context_timeout_secs > 0 {
            self.watch_context(ids.exchange_id);
        }
    }

    fn watch_context(self: &Arc<Self>, exchange_id: ExchangeId) {
        let inner = Arc::downgrade(self);
        let timeout = Duration::from_secs(self.config.context_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.barrier.abandon(&exchange_id) {
                warn!(%exchange_id, "context lookups timed out; exchange abandoned");
                inner.deliver(CONTEXT_TIMEOUT_MESSAGE);
            }
        });
    }

    fn on_result(self: &Arc<Self>, correlation_id: &CorrelationId, value: SlotValue) {
        match self.barrier.fill(correlation_id, value) {
            FillOutcome::Complete(context) => self.spawn_exchange(context),
            FillOutcome::Waiting => {}
            FillOutcome::Duplicate => debug!(%correlation_id, "duplicate context result ignored"),
            FillOutcome::Unmatched => debug!(%correlation_id, "unmatched context result ignored"),
        }
    }

    fn spawn_exchange(self: &Arc<Self>, context: GatheredContext) {
        let inner = self.clone();
        let span = info_span!("exchange", exchange_id = %context.exchange_id);
        let mut exchanges = self.exchanges.lock();
        while exchanges.try_join_next().is_some() {}
        exchanges.spawn(async move { inner.run_exchange(context).await }.instrument(span));
    }

    async fn run_exchange(&self, context: GatheredContext) {
        let GatheredContext {
            input,
            history,
            style_prompt,
            facts,
            permit,
            ..
        } = context;

        let bus = match self.slot.handle() {
            Ok(bus) => bus,
            Err(error) => {
                warn!(%error, "exchange dropped; orchestrator is not active");
                return;
            }
        };

        debug!("prompting");
        self.emit(EventPayload::MemoryStore {
            role: Role::User,
            content: input.clone(),
        });

        let tools = self.executor.registry().definitions();
        let base_system = system_prompt(&style_prompt, &facts, &tools);
        let mut messages = build_messages(base_system.clone(), &history, &input);

        let tool_loop = ToolLoop {
            backend: &self.backend,
            executor: &self.executor,
            bus: &bus,
            max_iterations: self.config.max_tool_iterations,
            model: self.config.model.clone(),
        };

        let answer = match tool_loop.run(&mut messages, &tools).await {
            Ok(LoopOutcome::Answered {
                reply, iterations: 0, ..
            }) => {
                self.deliver(&reply);
                Some(reply)
            }
            Ok(LoopOutcome::Answered {
                reply,
                iterations,
                results,
            }) => {
                debug!(iterations, "summarizing tool results");
                let summary = summarize_results(
                    &self.backend,
                    self.config.summary_model.clone(),
                    &input,
                    &results,
                )
                .await;
                let folded = fold_summary(&base_system, &summary);
                let final_messages = build_messages(folded, &history, &input);
                Some(self.finish(final_messages, reply).await)
            }
            Ok(LoopOutcome::CapReached { .. }) => {
                self.deliver(ITERATION_CAP_MESSAGE);
                Some(ITERATION_CAP_MESSAGE.to_owned())
            }
            Err(error) => {
                warn!(%error, "model backend failed");
                self.deliver(&format!("I encountered an error: {error}"));
                None
            }
        };

        if let Some(answer) = answer {
            self.emit(EventPayload::MemoryStore {
                role: Role::Assistant,
                content: answer,
            });
        }
        drop(permit);
        debug!("idle");
    }

    /// Streaming: produce the final answer over the folded prompt. The reply
    /// already in hand is the fallback.
    async fn finish(&self, messages: Vec<ChatMessage>, reply: String) -> String {
        if !self.config.stream_final_answer {
            self.deliver(&reply);
            return reply;
        }

        let mut request = ChatRequest::new(messages);
        request.model = self.config.model.clone();
        let mut stream = match self.backend.chat_stream(request).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "final answer stream failed to open; using reply");
                self.deliver(&reply);
                return reply;
            }
        };

        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) if chunk.is_empty() => {}
                Ok(chunk) => {
                    text.push_str(&chunk);
                    self.emit(EventPayload::OutputChunk {
                        text: chunk,
                        done: false,
                    });
                }
                Err(error) => {
                    warn!(%error, "final answer stream broke off");
                    break;
                }
            }
        }

        if text.is_empty() {
            self.deliver(&reply);
            return reply;
        }
        self.emit(EventPayload::OutputChunk {
            text: String::new(),
            done: true,
        });
        self.emit(EventPayload::OutputReady { text: text.clone() });
        text
    }

    /// Emit `text` as `output.chunk` pieces of `chunk_chars`, the last one
    /// marked done, then `output.ready`.
    fn deliver(&self, text: &str) {
        for (chunk, done) in split_chunks(text, self.config.chunk_chars) {
            self.emit(EventPayload::OutputChunk {
                text: chunk,
                done,
            });
        }
        self.emit(EventPayload::OutputReady {
            text: text.to_owned(),
        });
    }
}

/// Split on char boundaries. Always yields at least one chunk, and exactly
/// the last one is flagged done.
fn split_chunks(text: &str, chunk_chars: usize) -> Vec<(String, bool)> {
    let size = chunk_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return vec![(String::new(), true)];
    }
    let count = chars.len().div_ceil(size);
    chars
        .chunks(size)
        .enumerate()
        .map(|(index, piece)| (piece.iter().collect(), index + 1 == count))
        .collect()
}

async fn run_queue(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        let permit = match inner.gate().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        inner.begin(text, Some(permit));
    }
    debug!("exchange queue drained");
}

#[async_trait]
impl Module for OrchestratorModule {
    fn name(&self) -> &str {
        self.inner.slot.name()
    }

    async fn init(&self, bus: BusHandle) -> KernelResult<()> {
        self.inner.slot.attach(bus.clone())?;
        *self.inner.gate.lock() = Arc::new(Semaphore::new(1));

        if self.inner.config.exchange_policy == ExchangePolicy::Queue {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.inner.queue_worker.lock() = Some(tokio::spawn(run_queue(self.inner.clone(), rx)));
            *self.inner.queue_tx.lock() = Some(tx);
        }

        let inner = self.inner.clone();
        bus.subscribe(EventKind::InputReceived, move |event| {
            if let EventPayload::InputReceived { text } = &event.payload {
                inner.on_input(text);
            }
        })?;

        let inner = self.inner.clone();
        bus.subscribe(EventKind::MemoryResult, move |event| {
            if let EventPayload::MemoryResult {
                correlation_id,
                entries,
            } = &event.payload
            {
                inner.on_result(correlation_id, SlotValue::Memory(entries.clone()));
            }
        })?;

        let inner = self.inner.clone();
        bus.subscribe(EventKind::PersonalityResult, move |event| {
            if let EventPayload::PersonalityResult {
                correlation_id,
                prompt,
                ..
            } = &event.payload
            {
                inner.on_result(correlation_id, SlotValue::Personality(prompt.clone()));
            }
        })?;

        let inner = self.inner.clone();
        bus.subscribe(EventKind::KnowledgeResult, move |event| {
            if let EventPayload::KnowledgeResult {
                correlation_id,
                facts,
            } = &event.payload
            {
                inner.on_result(correlation_id, SlotValue::Knowledge(facts.clone()));
            }
        })?;

        info!(
            policy = ?self.inner.config.exchange_policy,
            max_tool_iterations = self.inner.config.max_tool_iterations,
            "orchestrator ready"
        );
        Ok(())
    }

    async fn shutdown(&self) -> KernelResult<()> {
        self.inner.slot.detach();
        self.inner.queue_tx.lock().take();
        self.inner.gate().close();
        let worker = self.inner.queue_worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                warn!(%error, "exchange queue worker panicked");
            }
        }

        let mut exchanges = std::mem::take(&mut *self.inner.exchanges.lock());
        let in_flight = exchanges.len();
        exchanges.abort_all();
        while exchanges.join_next().await.is_some() {}
        info!(in_flight, "orchestrator stopped");
        Ok(())
    }
}
