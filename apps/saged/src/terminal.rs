//! Line-oriented terminal input and streaming stdout output.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sage_events::{BusHandle, InputAdapter, Module, ModuleSlot, OutputAdapter};
use sage_protocol::{EventKind, EventPayload, KernelResult, TraitName};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// What a line typed at the prompt asks for.
#[derive(Debug, PartialEq)]
enum Command {
    Quit,
    Say(String),
    Remember(String),
    Adjust(TraitName, f32),
    Unknown(String),
    Empty,
}

fn parse_line(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Command::Say(line.to_owned());
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match name {
        "quit" | "exit" => Command::Quit,
        "remember" if !rest.is_empty() => Command::Remember(rest.to_owned()),
        "adjust" => {
            let mut parts = rest.split_whitespace();
            let trait_name = parts
                .next()
                .and_then(|name| TraitName::ALL.into_iter().find(|t| t.as_str() == name));
            let delta = parts.next().and_then(|delta| delta.parse::<f32>().ok());
            match (trait_name, delta) {
                (Some(trait_name), Some(delta)) => Command::Adjust(trait_name, delta),
                _ => Command::Unknown(line.to_owned()),
            }
        }
        _ => Command::Unknown(line.to_owned()),
    }
}

pub struct StdinInput {
    slot: ModuleSlot,
    quit: Arc<Notify>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StdinInput {
    /// `quit` is notified on `/quit` or end of input.
    pub fn new(quit: Arc<Notify>) -> Self {
        Self {
            slot: ModuleSlot::new("stdin"),
            quit,
            reader: Mutex::new(None),
        }
    }
}

async fn read_lines(bus: BusHandle, quit: Arc<Notify>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "failed to read stdin");
                break;
            }
        };
        let payload = match parse_line(&line) {
            Command::Quit => break,
            Command::Empty => continue,
            Command::Say(text) => EventPayload::InputReceived { text },
            Command::Remember(fact) => EventPayload::KnowledgeStore {
                fact,
                source: Some("user".to_owned()),
                confidence: None,
            },
            Command::Adjust(trait_name, delta) => {
                EventPayload::PersonalityAdjust { trait_name, delta }
            }
            Command::Unknown(line) => {
                warn!(command = %line, "unknown command; try /remember, /adjust or /quit");
                continue;
            }
        };
        if let Err(error) = bus.emit(payload) {
            warn!(%error, "bus is gone; stopping input");
            break;
        }
    }
    quit.notify_one();
}

#[async_trait]
impl Module for StdinInput {
    fn name(&self) -> &str {
        self.slot.name()
    }

    async fn init(&self, bus: BusHandle) -> KernelResult<()> {
        self.slot.attach(bus.clone())?;
        *self.reader.lock() = Some(tokio::spawn(read_lines(bus, self.quit.clone())));
        Ok(())
    }

    async fn shutdown(&self) -> KernelResult<()> {
        self.slot.detach();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        Ok(())
    }
}

impl InputAdapter for StdinInput {}

pub struct StdoutOutput {
    slot: ModuleSlot,
}

impl StdoutOutput {
    pub fn new() -> Self {
        Self {
            slot: ModuleSlot::new("stdout"),
        }
    }
}

impl Default for StdoutOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Module for StdoutOutput {
    fn name(&self) -> &str {
        self.slot.name()
    }

    async fn init(&self, bus: BusHandle) -> KernelResult<()> {
        self.slot.attach(bus.clone())?;

        bus.subscribe(EventKind::OutputChunk, |event| {
            if let EventPayload::OutputChunk { text, done } = &event.payload {
                let mut stdout = std::io::stdout().lock();
                let written = if *done {
                    writeln!(stdout, "{text}")
                } else {
                    write!(stdout, "{text}")
                };
                if let Err(error) = written.and_then(|()| stdout.flush()) {
                    warn!(%error, "failed to write to stdout");
                }
            }
        })?;

        bus.subscribe(EventKind::ToolStart, |event| {
            if let EventPayload::ToolStart { tool_name, .. } = &event.payload {
                info!(tool = %tool_name, "running tool");
            }
        })?;
        Ok(())
    }

    async fn shutdown(&self) -> KernelResult<()> {
        self.slot.detach();
        Ok(())
    }
}

impl OutputAdapter for StdoutOutput {}
