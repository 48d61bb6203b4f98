//! # sage-kernel: assembly facade
//!
//! [`KernelBuilder`] wires the event bus, the three context modules, the
//! tool registry and the orchestrator into an [`Assistant`]. The
//! [`testing`] module carries the scripted backend and event recorder the
//! scenario tests run on.

mod config;
pub mod testing;

use std::sync::Arc;

use sage_events::{EventBus, InputAdapter, OutputAdapter};
use sage_knowledge::KnowledgeModule;
use sage_memory::{InMemorySessionStore, MemoryModule};
use sage_personality::{InMemoryProfileStore, PersonalityModule};
use sage_protocol::{
    Event, EventPayload, FactStore, KernelError, KernelResult, ModelBackend, ProfileStore,
    SessionStore,
};
use sage_runtime::OrchestratorModule;
use sage_sandbox::{LocalSandboxRunner, SandboxRunner};
use sage_tools::{Tool, ToolExecutor, ToolRegistry};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument};

pub use config::SageConfig;

pub struct KernelBuilder {
    config: SageConfig,
    backend: Option<Arc<dyn ModelBackend>>,
    session_store: Option<Arc<dyn SessionStore>>,
    fact_store: Option<Arc<dyn FactStore>>,
    profile_store: Option<Arc<dyn ProfileStore>>,
    sandbox: Option<Arc<dyn SandboxRunner>>,
    tools: Vec<Arc<dyn Tool>>,
    inputs: Vec<Arc<dyn InputAdapter>>,
    outputs: Vec<Arc<dyn OutputAdapter>>,
}

impl KernelBuilder {
    pub fn new(config: SageConfig) -> Self {
        Self {
            config,
            backend: None,
            session_store: None,
            fact_store: None,
            profile_store: None,
            sandbox: None,
            tools: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn fact_store(mut self, store: Arc<dyn FactStore>) -> Self {
        self.fact_store = Some(store);
        self
    }

    pub fn profile_store(mut self, store: Arc<dyn ProfileStore>) -> Self {
        self.profile_store = Some(store);
        self
    }

    /// Runner for the `shell` tool. Defaults to a local runner built from
    /// the sandbox policy in the config.
    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxRunner>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn input(mut self, input: Arc<dyn InputAdapter>) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: Arc<dyn OutputAdapter>) -> Self {
        self.outputs.push(output);
        self
    }

    /// Fails on a missing backend and on any duplicate tool, input or
    /// output name.
    pub fn build(self) -> KernelResult<Assistant> {
        let backend = self
            .backend
            .ok_or_else(|| KernelError::InvalidState("a model backend is required".to_owned()))?;
        let config = self.config;

        let sandbox = self
            .sandbox
            .unwrap_or_else(|| Arc::new(LocalSandboxRunner::new(config.sandbox.clone())));
        let registry = Arc::new(ToolRegistry::with_builtin_tools(&config.tools, sandbox)?);
        for tool in self.tools {
            registry.register(tool)?;
        }

        let memory = Arc::new(MemoryModule::new(
            self.session_store
                .unwrap_or_else(|| Arc::new(InMemorySessionStore::new())),
            config.memory.clone(),
        ));
        let personality = Arc::new(PersonalityModule::new(
            self.profile_store
                .unwrap_or_else(|| Arc::new(InMemoryProfileStore::new())),
            config.personality.clone(),
        ));
        let knowledge = Arc::new(match self.fact_store {
            Some(store) => KnowledgeModule::new(store, config.knowledge.clone()),
            None => KnowledgeModule::in_memory(config.knowledge.clone()),
        }
        .with_backend(backend.clone()));

        let executor =
            ToolExecutor::new(registry.clone(), config.tools.clone()).with_backend(backend.clone());
        let orchestrator = Arc::new(OrchestratorModule::new(
            backend,
            executor,
            config.orchestrator.clone(),
        ));

        let bus = EventBus::new();
        bus.register_module(memory.clone())?;
        bus.register_module(personality.clone())?;
        bus.register_module(knowledge.clone())?;
        bus.register_module(orchestrator.clone())?;
        for input in self.inputs {
            bus.register_input(input)?;
        }
        for output in self.outputs {
            bus.register_output(output)?;
        }
        debug!(tools = ?registry.list(), "assistant assembled");

        Ok(Assistant {
            bus,
            memory,
            personality,
            knowledge,
            orchestrator,
            registry,
        })
    }
}

/// A fully wired assistant. Drive it with [`Assistant::submit`] or
/// [`Assistant::ask`] between [`Assistant::awake`] and [`Assistant::sleep`].
pub struct Assistant {
    bus: EventBus,
    memory: Arc<MemoryModule>,
    personality: Arc<PersonalityModule>,
    knowledge: Arc<KnowledgeModule>,
    orchestrator: Arc<OrchestratorModule>,
    registry: Arc<ToolRegistry>,
}

impl Assistant {
    pub fn builder(config: SageConfig) -> KernelBuilder {
        KernelBuilder::new(config)
    }

    #[instrument(skip(self))]
    pub async fn awake(&self) -> KernelResult<()> {
        self.bus.awake().await?;
        info!(tools = self.registry.len(), "assistant awake");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn sleep(&self) -> KernelResult<()> {
        self.bus.sleep().await?;
        info!("assistant asleep");
        Ok(())
    }

    pub fn is_awake(&self) -> bool {
        self.bus.is_awake()
    }

    /// Publish a user message as `input.received`.
    pub fn submit(&self, text: impl Into<String>) -> KernelResult<()> {
        if !self.bus.is_awake() {
            return Err(KernelError::Uninitialized("assistant".to_owned()));
        }
        self.bus.emit(EventPayload::InputReceived { text: text.into() });
        Ok(())
    }

    /// Submit `text` and wait for the next `output.ready`. Meant for callers
    /// that do not overlap exchanges.
    pub async fn ask(&self, text: impl Into<String>) -> KernelResult<String> {
        let mut tap = self.bus.subscribe_events();
        self.submit(text)?;
        loop {
            match tap.recv().await {
                Ok(event) => {
                    if let EventPayload::OutputReady { text } = event.payload {
                        return Ok(text);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "ask lagged behind the event tap");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(KernelError::BusUnavailable),
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe_events()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        self.bus.subscribe_stream()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        self.registry.clone()
    }

    pub fn memory(&self) -> &MemoryModule {
        &self.memory
    }

    pub fn personality(&self) -> &PersonalityModule {
        &self.personality
    }

    pub fn knowledge(&self) -> &KnowledgeModule {
        &self.knowledge
    }

    pub fn orchestrator(&self) -> &OrchestratorModule {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use sage_protocol::{
        BackendError, ChatResponse, ChatRole, EventKind, Role, ToolCallRequest, ToolDefinition,
        ToolFailure, TraitName,
    };
    use sage_runtime::{ExchangePolicy, ITERATION_CAP_MESSAGE};
    use sage_tools::FnTool;
    use serde_json::{Value, json};

    use super::*;
    use crate::testing::{EventRecorder, ScriptedBackend};

    const WAIT: Duration = Duration::from_secs(5);

    fn quiet_config() -> SageConfig {
        let mut config = SageConfig::default();
        config.tools.enable_shell = false;
        config.tools.enable_fs = false;
        config
    }

    async fn start(
        backend: Arc<ScriptedBackend>,
        config: SageConfig,
    ) -> Result<(Assistant, EventRecorder)> {
        let assistant = Assistant::builder(config).backend(backend).build()?;
        let recorder = EventRecorder::start(assistant.subscribe_events());
        assistant.awake().await?;
        Ok((assistant, recorder))
    }

    fn failing_tool() -> Arc<dyn Tool> {
        Arc::new(FnTool::new(
            ToolDefinition {
                name: "flaky".to_owned(),
                description: "always fails".to_owned(),
                parameters: json!({"type": "object"}),
            },
            |_args: &Value| Err(ToolFailure::Execution("service unavailable".to_owned())),
        ))
    }

    fn position(kinds: &[EventKind], kind: EventKind) -> Option<usize> {
        kinds.iter().position(|k| *k == kind)
    }

    #[tokio::test]
    async fn hello_runs_one_exchange_and_stores_both_turns() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new().reply("Hi! How can I help?"));
        let (assistant, recorder) = start(backend.clone(), quiet_config()).await?;

        assistant.submit("Hello")?;
        assert!(recorder.wait_for(EventKind::OutputReady, 1, WAIT).await);
        assert!(recorder.wait_for(EventKind::MemoryStore, 2, WAIT).await);
        recorder.settle().await;

        assert_eq!(recorder.count(EventKind::MemoryQuery), 1);
        assert_eq!(recorder.count(EventKind::PersonalityQuery), 1);
        assert_eq!(recorder.count(EventKind::KnowledgeQuery), 1);
        assert_eq!(recorder.count(EventKind::OutputReady), 1);
        assert!(recorder.count(EventKind::MemoryStore) >= 2);
        assert_eq!(recorder.outputs(), vec!["Hi! How can I help?".to_owned()]);
        assert_eq!(backend.converse_calls(), 1);

        let window = assistant.memory().recent_window(10);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].role, Role::User);
        assert_eq!(window[1].content, "Hi! How can I help?");

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn output_ready_follows_all_three_results() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new().reply("ok"));
        let (assistant, recorder) = start(backend, quiet_config()).await?;

        assistant.submit("check ordering")?;
        assert!(recorder.wait_for(EventKind::OutputReady, 1, WAIT).await);

        let kinds = recorder.kinds();
        let ready = position(&kinds, EventKind::OutputReady).unwrap();
        for result in [
            EventKind::MemoryResult,
            EventKind::PersonalityResult,
            EventKind::KnowledgeResult,
        ] {
            assert!(position(&kinds, result).unwrap() < ready, "{result} after output");
        }
        let last_chunk = kinds
            .iter()
            .rposition(|k| *k == EventKind::OutputChunk)
            .unwrap();
        assert!(last_chunk < ready);

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn calculator_round_trip_uses_two_model_calls() -> Result<()> {
        let backend = Arc::new(
            ScriptedBackend::new()
                .tool_call("calculator", json!({"operation": "add", "a": 2, "b": 3}))
                .reply("2 + 3 is 5.")
                .with_stream_text("The answer is 5."),
        );
        let (assistant, recorder) = start(backend.clone(), quiet_config()).await?;

        assistant.submit("What is 2 + 3?")?;
        assert!(recorder.wait_for(EventKind::OutputReady, 1, WAIT).await);

        assert_eq!(recorder.count(EventKind::ToolStart), 1);
        assert_eq!(recorder.count(EventKind::ToolComplete), 1);
        assert_eq!(recorder.count(EventKind::ToolError), 0);
        assert_eq!(backend.converse_calls(), 2);
        assert_eq!(backend.summary_calls(), 1);
        assert_eq!(recorder.outputs(), vec!["The answer is 5.".to_owned()]);

        let output = recorder.events().into_iter().find_map(|event| match event.payload {
            EventPayload::ToolComplete { output, .. } => Some(output),
            _ => None,
        });
        assert_eq!(output.as_deref(), Some("5"));

        let requests = backend.requests();
        let second = &requests[1];
        let tool_turn = second
            .messages
            .iter()
            .find(|message| message.role == ChatRole::Tool)
            .unwrap();
        assert_eq!(tool_turn.content, "5");
        assert_eq!(tool_turn.name.as_deref(), Some("calculator"));

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn fenced_tool_calls_are_executed() -> Result<()> {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fenced_tool_call("calculator", json!({"operation": "multiply", "a": 6, "b": 7}))
                .reply("42"),
        );
        let (assistant, recorder) = start(backend.clone(), quiet_config()).await?;

        assistant.submit("6 times 7?")?;
        assert!(recorder.wait_for(EventKind::OutputReady, 1, WAIT).await);
        assert_eq!(recorder.count(EventKind::ToolComplete), 1);
        assert_eq!(backend.converse_calls(), 2);

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn failing_tool_reports_error_and_loop_continues() -> Result<()> {
        let backend = Arc::new(
            ScriptedBackend::new()
                .tool_call("flaky", json!({}))
                .reply("The service is down right now."),
        );
        let assistant = Assistant::builder(quiet_config())
            .backend(backend.clone())
            .tool(failing_tool())
            .build()?;
        let recorder = EventRecorder::start(assistant.subscribe_events());
        assistant.awake().await?;

        assistant.submit("try the flaky service")?;
        assert!(recorder.wait_for(EventKind::OutputReady, 1, WAIT).await);

        let kinds = recorder.kinds();
        let started = position(&kinds, EventKind::ToolStart).unwrap();
        let failed = position(&kinds, EventKind::ToolError).unwrap();
        assert!(started < failed);
        assert_eq!(recorder.count(EventKind::ToolComplete), 0);
        assert_eq!(backend.converse_calls(), 2);

        let requests = backend.requests();
        let second = &requests[1];
        let tool_turn = second
            .messages
            .iter()
            .find(|message| message.role == ChatRole::Tool)
            .unwrap();
        assert!(tool_turn.content.starts_with("Error:"));

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn tool_loop_stops_at_the_iteration_cap() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new().with_fallback(ChatResponse {
            content: String::new(),
            tool_calls: vec![ToolCallRequest {
                id: Some("again".to_owned()),
                name: "datetime".to_owned(),
                arguments: json!({}),
            }],
        }));
        let mut config = quiet_config();
        config.orchestrator.max_tool_iterations = 4;
        let (assistant, recorder) = start(backend.clone(), config).await?;

        let answer = assistant.ask("never finish").await?;
        assert_eq!(answer, ITERATION_CAP_MESSAGE);
        assert_eq!(backend.converse_calls(), 4);
        assert_eq!(recorder.count(EventKind::ToolStart), 4);
        assert_eq!(backend.stream_calls(), 0);

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn backend_failure_is_reported_to_the_user() -> Result<()> {
        let backend = Arc::new(
            ScriptedBackend::new()
                .fail(BackendError::Connection("connection refused".to_owned())),
        );
        let (assistant, _recorder) = start(backend, quiet_config()).await?;

        let answer = assistant.ask("hello?").await?;
        assert!(answer.starts_with("I encountered an error:"));
        assert!(answer.contains("connection refused"));

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn later_exchanges_see_history_and_remembered_facts() -> Result<()> {
        let backend = Arc::new(
            ScriptedBackend::new()
                .reply("Noted!")
                .reply("Your cat is Miso."),
        );
        let (assistant, recorder) = start(backend.clone(), quiet_config()).await?;

        assistant.submit("Remember that my cat is named Miso.")?;
        assert!(recorder.wait_for(EventKind::MemoryStore, 2, WAIT).await);
        let deadline = tokio::time::Instant::now() + WAIT;
        while assistant.knowledge().list_all().await?.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "fact never captured");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let answer = assistant.ask("What is my cat named?").await?;
        assert_eq!(answer, "Your cat is Miso.");

        let requests = backend.requests();
        let request = &requests[1];
        assert!(request.messages[0].content.contains("my cat is named Miso"));
        let history: Vec<_> = request.messages[1..request.messages.len() - 1]
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(history, vec!["Remember that my cat is named Miso.", "Noted!"]);

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn personality_adjustments_reach_the_prompt() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new().reply("Sure thing."));
        let (assistant, _recorder) = start(backend.clone(), quiet_config()).await?;

        let before = assistant.personality().style_prompt();
        assistant.bus().emit(EventPayload::PersonalityAdjust {
            trait_name: TraitName::Formality,
            delta: 1.0,
        });
        let after = assistant.personality().style_prompt();
        assert_ne!(before, after);

        assistant.ask("hi").await?;
        assert_eq!(backend.requests()[0].messages[0].content, after_system(&after));

        assistant.sleep().await?;
        Ok(())
    }

    /// The system prompt with no facts and only the built-in tools.
    fn after_system(style: &str) -> String {
        let registry = ToolRegistry::with_builtin_tools(
            &quiet_config().tools,
            Arc::new(LocalSandboxRunner::default()),
        )
        .unwrap();
        sage_runtime::system_prompt(style, &[], &registry.definitions())
    }

    #[tokio::test]
    async fn reject_policy_answers_busy_while_an_exchange_runs() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new().reply("first answer"));
        let mut config = quiet_config();
        config.orchestrator.exchange_policy = ExchangePolicy::Reject;
        let busy = config.orchestrator.busy_message.clone();
        let (assistant, recorder) = start(backend.clone(), config).await?;

        assistant.submit("first")?;
        assistant.submit("second")?;
        assert!(recorder.wait_for(EventKind::OutputReady, 2, WAIT).await);
        recorder.settle().await;

        assert_eq!(recorder.outputs(), vec![busy, "first answer".to_owned()]);
        assert_eq!(recorder.count(EventKind::MemoryQuery), 1);
        assert_eq!(backend.converse_calls(), 1);

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn queue_policy_serializes_exchanges() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new().reply("one").reply("two"));
        let mut config = quiet_config();
        config.orchestrator.exchange_policy = ExchangePolicy::Queue;
        let (assistant, recorder) = start(backend.clone(), config).await?;

        assistant.submit("first")?;
        assistant.submit("second")?;
        assert!(recorder.wait_for(EventKind::OutputReady, 2, WAIT).await);

        assert_eq!(recorder.outputs(), vec!["one".to_owned(), "two".to_owned()]);
        let kinds = recorder.kinds();
        let first_ready = position(&kinds, EventKind::OutputReady).unwrap();
        let second_query = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == EventKind::MemoryQuery)
            .nth(1)
            .map(|(index, _)| index)
            .unwrap();
        assert!(first_ready < second_query);

        assistant.sleep().await?;
        Ok(())
    }

    #[tokio::test]
    async fn lifecycle_events_and_submit_before_awake() -> Result<()> {
        let backend = Arc::new(ScriptedBackend::new());
        let assistant = Assistant::builder(quiet_config()).backend(backend).build()?;
        let recorder = EventRecorder::start(assistant.subscribe_events());

        assert!(matches!(
            assistant.submit("too early"),
            Err(KernelError::Uninitialized(_))
        ));
        assistant.awake().await?;
        assert!(assistant.is_awake());
        assistant.sleep().await?;
        assert!(recorder.wait_for(EventKind::CoreStopped, 1, WAIT).await);

        let kinds = recorder.kinds();
        assert_eq!(kinds.first(), Some(&EventKind::CoreStarted));
        assert_eq!(kinds.last(), Some(&EventKind::CoreStopped));
        Ok(())
    }

    #[test]
    fn duplicate_tool_registration_fails_the_build() {
        let calculator = Arc::new(sage_tools::CalculatorTool::new());
        let result = Assistant::builder(quiet_config())
            .backend(Arc::new(ScriptedBackend::new()))
            .tool(calculator)
            .build();
        match result {
            Err(KernelError::DuplicateRegistration { kind, name }) => {
                assert_eq!(kind, "tool");
                assert_eq!(name, "calculator");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("duplicate tool accepted"),
        }
    }

    #[test]
    fn build_requires_a_backend() {
        assert!(matches!(
            Assistant::builder(SageConfig::default()).build(),
            Err(KernelError::InvalidState(_))
        ));
    }
}
