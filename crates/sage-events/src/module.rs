//! Module lifecycle: the `Module` trait and the slot that tracks its state.

use async_trait::async_trait;
use parking_lot::Mutex;
use sage_protocol::{EventPayload, KernelError, KernelResult};

use crate::BusHandle;

/// A capability unit owned by the bus.
///
/// `init` receives a non-owning [`BusHandle`] and registers listeners;
/// `shutdown` releases whatever the module holds.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;
    async fn init(&self, bus: BusHandle) -> KernelResult<()>;
    async fn shutdown(&self) -> KernelResult<()>;
}

/// Source of `input.received` events (console, socket, test driver).
pub trait InputAdapter: Module {}

/// Sink for `output.*` and `tool.*` events.
pub trait OutputAdapter: Module {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Active,
    Stopped,
}

#[derive(Debug)]
enum SlotState {
    Uninitialized,
    Active(BusHandle),
    Stopped,
}

/// Per-module lifecycle holder. Modules embed one and route every bus
/// interaction through it, so use before `init` fails with `Uninitialized`.
#[derive(Debug)]
pub struct ModuleSlot {
    name: String,
    state: Mutex<SlotState>,
}

impl ModuleSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SlotState::Uninitialized),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        match &*self.state.lock() {
            SlotState::Uninitialized => LifecycleState::Uninitialized,
            SlotState::Active(_) => LifecycleState::Active,
            SlotState::Stopped => LifecycleState::Stopped,
        }
    }

    /// Uninitialized or Stopped → Active. Attaching an active slot fails.
    pub fn attach(&self, bus: BusHandle) -> KernelResult<()> {
        let mut state = self.state.lock();
        match &*state {
            SlotState::Uninitialized | SlotState::Stopped => {
                *state = SlotState::Active(bus);
                Ok(())
            }
            _ => Err(KernelError::AlreadyInitialized(self.name.clone())),
        }
    }

    /// Active → Stopped. Returns false if the slot was not active.
    pub fn detach(&self) -> bool {
        let mut state = self.state.lock();
        if matches!(&*state, SlotState::Active(_)) {
            *state = SlotState::Stopped;
            true
        } else {
            false
        }
    }

    pub fn handle(&self) -> KernelResult<BusHandle> {
        match &*self.state.lock() {
            SlotState::Active(bus) => Ok(bus.clone()),
            _ => Err(KernelError::Uninitialized(self.name.clone())),
        }
    }

    pub fn emit(&self, payload: EventPayload) -> KernelResult<()> {
        self.handle()?.emit(payload)
    }
}
