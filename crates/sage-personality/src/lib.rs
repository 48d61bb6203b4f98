//! Personality module: a single trait vector and the style prompt built
//! from it.
//!
//! Adjustments apply immediately to the in-memory vector; the latest value is
//! handed to a background saver through a `watch` channel, so only the newest
//! profile is written when several adjustments land close together.

mod prompt;
mod store;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sage_events::{BusHandle, Module, ModuleSlot};
use sage_protocol::{
    CorrelationId, EventKind, EventPayload, KernelResult, PersonalityTraits, ProfileStore,
    StyleFlags, TraitName,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use prompt::render_style_prompt;
pub use store::{FileProfileStore, InMemoryProfileStore};

pub const MODULE_NAME: &str = "personality";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalityConfig {
    pub assistant_name: String,
    /// Used when the profile store has nothing saved.
    pub initial: PersonalityTraits,
}

impl Default for PersonalityConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Sage".to_owned(),
            initial: PersonalityTraits::default(),
        }
    }
}

struct Profile {
    traits: PersonalityTraits,
    prompt: String,
}

struct Inner {
    slot: ModuleSlot,
    config: PersonalityConfig,
    store: Arc<dyn ProfileStore>,
    profile: Mutex<Profile>,
    saver_tx: Mutex<Option<watch::Sender<PersonalityTraits>>>,
    saver: Mutex<Option<JoinHandle<()>>>,
}

pub struct PersonalityModule {
    inner: Arc<Inner>,
}

impl PersonalityModule {
    pub fn new(store: Arc<dyn ProfileStore>, config: PersonalityConfig) -> Self {
        let traits = config.initial;
        let prompt = render_style_prompt(&config.assistant_name, &traits);
        Self {
            inner: Arc::new(Inner {
                slot: ModuleSlot::new(MODULE_NAME),
                config,
                store,
                profile: Mutex::new(Profile { traits, prompt }),
                saver_tx: Mutex::new(None),
                saver: Mutex::new(None),
            }),
        }
    }

    pub fn in_memory(config: PersonalityConfig) -> Self {
        Self::new(Arc::new(InMemoryProfileStore::new()), config)
    }

    pub fn traits(&self) -> PersonalityTraits {
        self.inner.profile.lock().traits
    }

    pub fn style_prompt(&self) -> String {
        self.inner.profile.lock().prompt.clone()
    }

    /// Clamped adjustment. Returns the stored value.
    pub fn adjust(&self, name: TraitName, delta: f32) -> f32 {
        self.inner.update(|traits| traits.adjust(name, delta))
    }

    pub fn set_flags(&self, flags: StyleFlags) {
        self.inner.update(|traits| traits.set_flags(flags));
    }

    /// Back to the configured initial traits.
    pub fn reset(&self) {
        let initial = self.inner.config.initial;
        self.inner.update(|traits| *traits = initial);
    }
}

impl Inner {
    fn update<R>(&self, mutate: impl FnOnce(&mut PersonalityTraits) -> R) -> R {
        let (result, snapshot) = {
            let mut profile = self.profile.lock();
            let result = mutate(&mut profile.traits);
            profile.prompt = render_style_prompt(&self.config.assistant_name, &profile.traits);
            (result, profile.traits)
        };
        if let Some(tx) = self.saver_tx.lock().as_ref() {
            tx.send_replace(snapshot);
        }
        result
    }

    fn answer_query(&self, correlation_id: CorrelationId) {
        let (prompt, traits) = {
            let profile = self.profile.lock();
            (profile.prompt.clone(), profile.traits)
        };
        debug!(%correlation_id, "personality query answered");
        if let Err(error) = self.slot.emit(EventPayload::PersonalityResult {
            correlation_id,
            prompt,
            traits,
        }) {
            warn!(%error, "failed to emit personality.result");
        }
    }
}

async fn run_saver(store: Arc<dyn ProfileStore>, mut rx: watch::Receiver<PersonalityTraits>) {
    while rx.changed().await.is_ok() {
        let traits = *rx.borrow_and_update();
        if let Err(error) = store.save(&traits).await {
            warn!(%error, "failed to save personality profile");
        }
    }
}

#[async_trait]
impl Module for PersonalityModule {
    fn name(&self) -> &str {
        self.inner.slot.name()
    }

    async fn init(&self, bus: BusHandle) -> KernelResult<()> {
        self.inner.slot.attach(bus.clone())?;

        match self.inner.store.load().await {
            Ok(Some(saved)) => {
                let mut profile = self.inner.profile.lock();
                profile.traits = saved;
                profile.prompt = render_style_prompt(&self.inner.config.assistant_name, &saved);
                info!("personality profile restored");
            }
            Ok(None) => debug!("no saved personality profile; using initial traits"),
            Err(error) => warn!(%error, "failed to load personality profile; using initial traits"),
        }

        let (tx, rx) = watch::channel(self.inner.profile.lock().traits);
        *self.inner.saver.lock() = Some(tokio::spawn(run_saver(self.inner.store.clone(), rx)));
        *self.inner.saver_tx.lock() = Some(tx);

        let inner = self.inner.clone();
        bus.subscribe(EventKind::PersonalityQuery, move |event| {
            if let EventPayload::PersonalityQuery { correlation_id } = &event.payload {
                inner.answer_query(correlation_id.clone());
            }
        })?;

        let inner = self.inner.clone();
        bus.subscribe(EventKind::PersonalityAdjust, move |event| {
            if let EventPayload::PersonalityAdjust { trait_name, delta } = &event.payload {
                let value = inner.update(|traits| traits.adjust(*trait_name, *delta));
                info!(trait_name = %trait_name, delta, value, "personality adjusted");
            }
        })?;

        Ok(())
    }

    async fn shutdown(&self) -> KernelResult<()> {
        self.inner.slot.detach();
        self.inner.saver_tx.lock().take();
        let saver = self.inner.saver.lock().take();
        if let Some(saver) = saver {
            if let Err(error) = saver.await {
                warn!(%error, "personality saver panicked");
            }
        }
        Ok(())
    }
}
