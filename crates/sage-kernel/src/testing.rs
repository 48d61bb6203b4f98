//! Test harness: a scripted model backend and an event recorder.
//!
//! Used by the scenario tests in this crate and available to downstream
//! crates that want to drive an [`Assistant`](crate::Assistant) without a
//! real model.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use sage_protocol::{
    BackendError, ChatChunkStream, ChatPurpose, ChatRequest, ChatResponse, Event, EventKind,
    EventPayload, ModelBackend, ToolCallRequest,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Model backend that replays a fixed script of conversation replies.
///
/// Summary requests are answered with a fixed text and never consume the
/// script. When the script runs out, `fallback` is returned.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<ChatResponse, BackendError>>>,
    fallback: ChatResponse,
    stream_text: String,
    requests: Mutex<Vec<ChatRequest>>,
    converse_calls: AtomicUsize,
    summary_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ChatResponse::text("Done."),
            stream_text: "Here is what I found.".to_owned(),
            requests: Mutex::new(Vec::new()),
            converse_calls: AtomicUsize::new(0),
            summary_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
        }
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Ok(ChatResponse::text(text)))
    }

    /// A reply asking for one tool through the structured field.
    pub fn tool_call(self, name: impl Into<String>, arguments: Value) -> Self {
        self.push(Ok(ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: None,
                name: name.into(),
                arguments,
            }],
        }))
    }

    /// A reply asking for one tool through a fenced json block.
    pub fn fenced_tool_call(self, name: &str, arguments: Value) -> Self {
        let body = serde_json::json!({ "name": name, "arguments": arguments });
        self.push(Ok(ChatResponse::text(format!(
            "Let me check.\n```json\n{body}\n```"
        ))))
    }

    pub fn fail(self, error: BackendError) -> Self {
        self.push(Err(error))
    }

    pub fn with_fallback(mut self, response: ChatResponse) -> Self {
        self.fallback = response;
        self
    }

    /// Text produced, one word per chunk, by `chat_stream`.
    pub fn with_stream_text(mut self, text: impl Into<String>) -> Self {
        self.stream_text = text.into();
        self
    }

    fn push(self, step: Result<ChatResponse, BackendError>) -> Self {
        self.script.lock().push_back(step);
        self
    }

    /// Conversation calls made through `chat`; summaries and streams are
    /// counted separately.
    pub fn converse_calls(&self) -> usize {
        self.converse_calls.load(Ordering::SeqCst)
    }

    pub fn summary_calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, BackendError> {
        let purpose = request.purpose;
        self.requests.lock().push(request);
        if purpose == ChatPurpose::Summarize {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(ChatResponse::text("Summary of tool results."));
        }
        self.converse_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();
        step.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatChunkStream, BackendError> {
        self.requests.lock().push(request);
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let words: Vec<String> = self
            .stream_text
            .split_inclusive(' ')
            .map(str::to_owned)
            .collect();
        let stream = async_stream::stream! {
            for word in words {
                yield Ok::<String, BackendError>(word);
            }
        };
        Ok(stream.boxed())
    }

    /// Letter-frequency vector; texts sharing words land close together.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let mut vector = vec![0.0_f32; 26];
        for byte in text.bytes().filter(u8::is_ascii_alphabetic) {
            vector[usize::from(byte.to_ascii_lowercase() - b'a')] += 1.0;
        }
        Ok(vector)
    }
}

/// Collects every envelope published on a bus tap.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
    task: JoinHandle<()>,
}

impl EventRecorder {
    pub fn start(mut tap: broadcast::Receiver<Event>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let task = tokio::spawn(async move {
            loop {
                match tap.recv().await {
                    Ok(event) => sink.lock().push(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event recorder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { events, task }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|event| event.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }

    /// Texts of every `output.ready` seen so far.
    pub fn outputs(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match &event.payload {
                EventPayload::OutputReady { text } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `count` events of `kind` were recorded. Returns
    /// false on timeout.
    pub async fn wait_for(&self, kind: EventKind, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count(kind) < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Let in-flight events land; used after the last awaited event.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
