use serde::{Deserialize, Serialize};

pub const ITERATION_CAP_MESSAGE: &str = "I reached the maximum number of tool iterations without \
     finishing. Please try rephrasing or narrowing the request.";

/// How an input that arrives while another exchange is running is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePolicy {
    /// Exchanges overlap freely.
    #[default]
    Concurrent,
    /// Exchanges wait their turn, first come first served.
    Queue,
    /// A busy reply is sent instead.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Turns requested from memory for each exchange.
    pub history_turns: usize,
    pub knowledge_limit: usize,
    /// Upper bound on model calls inside one tool loop.
    pub max_tool_iterations: usize,
    pub model: Option<String>,
    pub summary_model: Option<String>,
    pub stream_final_answer: bool,
    /// Characters per `output.chunk` when a reply is chunked locally.
    pub chunk_chars: usize,
    pub exchange_policy: ExchangePolicy,
    pub busy_message: String,
    /// An exchange whose context is still incomplete after this long is
    /// abandoned.
    pub context_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_turns: 10,
            knowledge_limit: 5,
            max_tool_iterations: 10,
            model: None,
            summary_model: None,
            stream_final_answer: true,
            chunk_chars: 64,
            exchange_policy: ExchangePolicy::Concurrent,
            busy_message: "I'm still working on your previous message. Please try again in a \
                           moment."
                .to_owned(),
            context_timeout_secs: 30,
        }
    }
}
