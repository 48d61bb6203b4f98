//! Typed publish/subscribe bus and module registry.
//!
//! Dispatch is synchronous: `emit` wraps the payload in an [`Event`] envelope
//! and calls every subscriber of that kind, in subscription order, before it
//! returns. Handlers that need to do I/O spawn a task and emit a new event
//! when they are done. Every envelope is also published to a lossy broadcast
//! tap for observers.

mod module;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use sage_protocol::{Event, EventKind, EventPayload, KernelError, KernelResult};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, warn};

pub use module::{InputAdapter, LifecycleState, Module, ModuleSlot, OutputAdapter};

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

const DEFAULT_TAP_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<Event>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

struct BusCore {
    subscribers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    tap: EventStreamHub,
}

impl BusCore {
    fn subscribe(&self, kind: EventKind, handler: Handler) {
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(handler);
    }

    fn dispatch(&self, payload: EventPayload) {
        let event = Event::new(payload);
        // Snapshot so handlers may emit or subscribe without deadlocking.
        let handlers = self
            .subscribers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();
        debug!(kind = %event.kind, subscribers = handlers.len(), "dispatching event");
        self.tap.publish(event.clone());
        for handler in handlers {
            handler(&event);
        }
    }
}

/// Non-owning reference to the bus handed to modules at `init`.
#[derive(Clone)]
pub struct BusHandle {
    core: Weak<BusCore>,
}

impl BusHandle {
    fn core(&self) -> KernelResult<Arc<BusCore>> {
        self.core.upgrade().ok_or(KernelError::BusUnavailable)
    }

    pub fn emit(&self, payload: EventPayload) -> KernelResult<()> {
        self.core()?.dispatch(payload);
        Ok(())
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> KernelResult<()>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.core()?.subscribe(kind, Arc::new(handler));
        Ok(())
    }

    pub fn tap(&self) -> KernelResult<broadcast::Receiver<Event>> {
        Ok(self.core()?.tap.subscribe())
    }
}

impl fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusHandle")
            .field("alive", &(self.core.strong_count() > 0))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Idle,
    Waking,
    Awake,
    Sleeping,
    Asleep,
}

/// Owner of the subscriber table and of every registered module, input and
/// output.
pub struct EventBus {
    core: Arc<BusCore>,
    modules: Mutex<IndexMap<String, Arc<dyn Module>>>,
    inputs: Mutex<IndexMap<String, Arc<dyn InputAdapter>>>,
    outputs: Mutex<IndexMap<String, Arc<dyn OutputAdapter>>>,
    state: Mutex<BusState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_tap_capacity(DEFAULT_TAP_CAPACITY)
    }

    pub fn with_tap_capacity(capacity: usize) -> Self {
        Self {
            core: Arc::new(BusCore {
                subscribers: RwLock::new(HashMap::new()),
                tap: EventStreamHub::new(capacity.max(1)),
            }),
            modules: Mutex::new(IndexMap::new()),
            inputs: Mutex::new(IndexMap::new()),
            outputs: Mutex::new(IndexMap::new()),
            state: Mutex::new(BusState::Idle),
        }
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle {
            core: Arc::downgrade(&self.core),
        }
    }

    pub fn emit(&self, payload: EventPayload) {
        self.core.dispatch(payload);
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.core.subscribe(kind, Arc::new(handler));
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.core.tap.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<Event> {
        self.core.tap.subscribe_stream()
    }

    pub fn register_module(&self, module: Arc<dyn Module>) -> KernelResult<()> {
        self.ensure_registrable()?;
        insert_unique(&self.modules, "module", module.name().to_owned(), module)
    }

    pub fn register_input(&self, input: Arc<dyn InputAdapter>) -> KernelResult<()> {
        self.ensure_registrable()?;
        insert_unique(&self.inputs, "input", input.name().to_owned(), input)
    }

    pub fn register_output(&self, output: Arc<dyn OutputAdapter>) -> KernelResult<()> {
        self.ensure_registrable()?;
        insert_unique(&self.outputs, "output", output.name().to_owned(), output)
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.lock().keys().cloned().collect()
    }

    pub fn is_awake(&self) -> bool {
        *self.state.lock() == BusState::Awake
    }

    fn ensure_registrable(&self) -> KernelResult<()> {
        match *self.state.lock() {
            BusState::Idle => Ok(()),
            state => Err(KernelError::InvalidState(format!(
                "cannot register while bus is {state:?}"
            ))),
        }
    }

    /// Initialize modules, then inputs, then outputs (registration order
    /// within each group) and emit `core.started`. No-op once awake.
    #[instrument(skip(self))]
    pub async fn awake(&self) -> KernelResult<()> {
        {
            let mut state = self.state.lock();
            if *state != BusState::Idle {
                debug!(state = ?*state, "awake ignored");
                return Ok(());
            }
            *state = BusState::Waking;
        }

        if let Err(error) = self.init_all().await {
            *self.state.lock() = BusState::Idle;
            return Err(error);
        }

        *self.state.lock() = BusState::Awake;
        info!(
            modules = self.modules.lock().len(),
            inputs = self.inputs.lock().len(),
            outputs = self.outputs.lock().len(),
            "bus awake"
        );
        self.emit(EventPayload::CoreStarted {});
        Ok(())
    }

    /// On failure, every component whose `init` ran (the failing one
    /// included) is shut down in reverse order and the subscriptions they
    /// added are dropped, so `awake` can be retried.
    async fn init_all(&self) -> KernelResult<()> {
        let modules: Vec<_> = self.modules.lock().values().cloned().collect();
        let inputs: Vec<_> = self.inputs.lock().values().cloned().collect();
        let outputs: Vec<_> = self.outputs.lock().values().cloned().collect();
        let subscribers = self.core.subscribers.read().clone();

        let mut started = Vec::new();
        let result = async {
            for module in modules {
                debug!(module = module.name(), "initializing module");
                started.push(Started::Module(module.clone()));
                module.init(self.handle()).await?;
            }
            for input in inputs {
                debug!(input = input.name(), "initializing input");
                started.push(Started::Input(input.clone()));
                input.init(self.handle()).await?;
            }
            for output in outputs {
                debug!(output = output.name(), "initializing output");
                started.push(Started::Output(output.clone()));
                output.init(self.handle()).await?;
            }
            Ok::<(), KernelError>(())
        }
        .await;

        if let Err(error) = &result {
            warn!(%error, started = started.len(), "awake failed; rolling back");
            for component in started.into_iter().rev() {
                if let Err(error) = component.shutdown().await {
                    warn!(name = component.name(), %error, "rollback shutdown failed");
                }
            }
            *self.core.subscribers.write() = subscribers;
        }
        result
    }

    /// Shut down outputs, then inputs, then modules (reverse registration
    /// order within each group) and emit `core.stopped`. No-op unless awake.
    #[instrument(skip(self))]
    pub async fn sleep(&self) -> KernelResult<()> {
        {
            let mut state = self.state.lock();
            if *state != BusState::Awake {
                debug!(state = ?*state, "sleep ignored");
                return Ok(());
            }
            *state = BusState::Sleeping;
        }

        let outputs: Vec<_> = self.outputs.lock().values().rev().cloned().collect();
        let inputs: Vec<_> = self.inputs.lock().values().rev().cloned().collect();
        let modules: Vec<_> = self.modules.lock().values().rev().cloned().collect();

        for output in outputs {
            if let Err(error) = output.shutdown().await {
                warn!(output = output.name(), %error, "output shutdown failed");
            }
        }
        for input in inputs {
            if let Err(error) = input.shutdown().await {
                warn!(input = input.name(), %error, "input shutdown failed");
            }
        }
        for module in modules {
            if let Err(error) = module.shutdown().await {
                warn!(module = module.name(), %error, "module shutdown failed");
            }
        }

        *self.state.lock() = BusState::Asleep;
        info!("bus asleep");
        self.emit(EventPayload::CoreStopped {});
        Ok(())
    }
}

enum Started {
    Module(Arc<dyn Module>),
    Input(Arc<dyn InputAdapter>),
    Output(Arc<dyn OutputAdapter>),
}

impl Started {
    fn name(&self) -> &str {
        match self {
            Self::Module(module) => module.name(),
            Self::Input(input) => input.name(),
            Self::Output(output) => output.name(),
        }
    }

    async fn shutdown(&self) -> KernelResult<()> {
        match self {
            Self::Module(module) => module.shutdown().await,
            Self::Input(input) => input.shutdown().await,
            Self::Output(output) => output.shutdown().await,
        }
    }
}

fn insert_unique<T: ?Sized>(
    registry: &Mutex<IndexMap<String, Arc<T>>>,
    kind: &'static str,
    name: String,
    value: Arc<T>,
) -> KernelResult<()> {
    let mut registry = registry.lock();
    if registry.contains_key(&name) {
        return Err(KernelError::DuplicateRegistration { kind, name });
    }
    debug!(kind, name = %name, "registered");
    registry.insert(name, value);
    Ok(())
}
