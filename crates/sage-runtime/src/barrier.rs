//! Fan-in point for the three context lookups of an exchange.
//!
//! Each exchange owns three correlation ids. Results are routed by id into
//! slots; the result that fills the last slot removes the pending entry under
//! the same lock, so completion is observed by exactly one caller and later
//! or repeated results find nothing to fill.

use std::collections::HashMap;

use parking_lot::Mutex;
use sage_protocol::{CorrelationId, ExchangeId, KnowledgeFact, MemoryEntry};
use tokio::sync::OwnedSemaphorePermit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Memory,
    Personality,
    Knowledge,
}

#[derive(Debug)]
pub enum SlotValue {
    Memory(Vec<MemoryEntry>),
    Personality(String),
    Knowledge(Vec<KnowledgeFact>),
}

impl SlotValue {
    fn kind(&self) -> SlotKind {
        match self {
            Self::Memory(_) => SlotKind::Memory,
            Self::Personality(_) => SlotKind::Personality,
            Self::Knowledge(_) => SlotKind::Knowledge,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationSet {
    pub exchange_id: ExchangeId,
    pub memory: CorrelationId,
    pub personality: CorrelationId,
    pub knowledge: CorrelationId,
}

impl CorrelationSet {
    fn fresh() -> Self {
        Self {
            exchange_id: ExchangeId::new_uuid(),
            memory: CorrelationId::new_uuid(),
            personality: CorrelationId::new_uuid(),
            knowledge: CorrelationId::new_uuid(),
        }
    }
}

struct PendingRequest {
    input: String,
    ids: CorrelationSet,
    history: Option<Vec<MemoryEntry>>,
    style_prompt: Option<String>,
    facts: Option<Vec<KnowledgeFact>>,
    permit: Option<OwnedSemaphorePermit>,
}

/// Everything an exchange needs once its context is complete.
#[derive(Debug)]
pub struct GatheredContext {
    pub exchange_id: ExchangeId,
    pub input: String,
    pub history: Vec<MemoryEntry>,
    pub style_prompt: String,
    pub facts: Vec<KnowledgeFact>,
    /// Held for the lifetime of the exchange under the queue/reject
    /// policies.
    pub permit: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
pub enum FillOutcome {
    /// No pending exchange owns this id (late, duplicate, or foreign).
    Unmatched,
    /// The slot was already filled; the value was dropped.
    Duplicate,
    Waiting,
    Complete(GatheredContext),
}

#[derive(Default)]
struct BarrierState {
    pending: HashMap<ExchangeId, PendingRequest>,
    routes: HashMap<CorrelationId, (ExchangeId, SlotKind)>,
}

impl BarrierState {
    fn unroute(&mut self, ids: &CorrelationSet) {
        self.routes.remove(&ids.memory);
        self.routes.remove(&ids.personality);
        self.routes.remove(&ids.knowledge);
    }
}

#[derive(Default)]
pub struct JoinBarrier {
    state: Mutex<BarrierState>,
}

impl JoinBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new exchange and return its correlation ids.
    pub fn open(&self, input: String, permit: Option<OwnedSemaphorePermit>) -> CorrelationSet {
        let ids = CorrelationSet::fresh();
        let mut state = self.state.lock();
        state.routes.insert(
            ids.memory.clone(),
            (ids.exchange_id.clone(), SlotKind::Memory),
        );
        state.routes.insert(
            ids.personality.clone(),
            (ids.exchange_id.clone(), SlotKind::Personality),
        );
        state.routes.insert(
            ids.knowledge.clone(),
            (ids.exchange_id.clone(), SlotKind::Knowledge),
        );
        state.pending.insert(
            ids.exchange_id.clone(),
            PendingRequest {
                input,
                ids: ids.clone(),
                history: None,
                style_prompt: None,
                facts: None,
                permit,
            },
        );
        ids
    }

    pub fn fill(&self, correlation_id: &CorrelationId, value: SlotValue) -> FillOutcome {
        let mut state = self.state.lock();
        let Some((exchange_id, kind)) = state.routes.get(correlation_id).cloned() else {
            return FillOutcome::Unmatched;
        };
        if kind != value.kind() {
            return FillOutcome::Unmatched;
        }
        let Some(request) = state.pending.get_mut(&exchange_id) else {
            return FillOutcome::Unmatched;
        };

        let filled = match value {
            SlotValue::Memory(entries) if request.history.is_none() => {
                request.history = Some(entries);
                true
            }
            SlotValue::Personality(prompt) if request.style_prompt.is_none() => {
                request.style_prompt = Some(prompt);
                true
            }
            SlotValue::Knowledge(facts) if request.facts.is_none() => {
                request.facts = Some(facts);
                true
            }
            _ => false,
        };
        if !filled {
            return FillOutcome::Duplicate;
        }

        let complete = request.history.is_some()
            && request.style_prompt.is_some()
            && request.facts.is_some();
        if !complete {
            return FillOutcome::Waiting;
        }

        let Some(request) = state.pending.remove(&exchange_id) else {
            return FillOutcome::Unmatched;
        };
        state.unroute(&request.ids);
        FillOutcome::Complete(GatheredContext {
            exchange_id,
            input: request.input,
            history: request.history.unwrap_or_default(),
            style_prompt: request.style_prompt.unwrap_or_default(),
            facts: request.facts.unwrap_or_default(),
            permit: request.permit,
        })
    }

    /// Drop an exchange that never completed. Returns false if it already
    /// joined or was abandoned.
    pub fn abandon(&self, exchange_id: &ExchangeId) -> bool {
        let mut state = self.state.lock();
        match state.pending.remove(exchange_id) {
            Some(request) => {
                state.unroute(&request.ids);
                true
            }
            None => false,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use sage_protocol::{Role, SessionId};

    use super::*;

    fn entry(text: &str) -> MemoryEntry {
        MemoryEntry::new(SessionId::from_string("s"), Role::User, text)
    }

    #[test]
    fn completes_only_when_all_three_slots_are_filled() {
        let barrier = JoinBarrier::new();
        let ids = barrier.open("hello".to_owned(), None);

        assert!(matches!(
            barrier.fill(&ids.knowledge, SlotValue::Knowledge(vec![])),
            FillOutcome::Waiting
        ));
        assert!(matches!(
            barrier.fill(&ids.memory, SlotValue::Memory(vec![entry("earlier")])),
            FillOutcome::Waiting
        ));
        let FillOutcome::Complete(context) =
            barrier.fill(&ids.personality, SlotValue::Personality("style".to_owned()))
        else {
            panic!("expected completion on the third slot");
        };
        assert_eq!(context.input, "hello");
        assert_eq!(context.history.len(), 1);
        assert_eq!(context.style_prompt, "style");
        assert_eq!(barrier.pending_len(), 0);
    }

    #[test]
    fn late_and_duplicate_results_are_ignored() {
        let barrier = JoinBarrier::new();
        let ids = barrier.open("hi".to_owned(), None);

        barrier.fill(&ids.memory, SlotValue::Memory(vec![]));
        assert!(matches!(
            barrier.fill(&ids.memory, SlotValue::Memory(vec![entry("again")])),
            FillOutcome::Duplicate
        ));
        barrier.fill(&ids.personality, SlotValue::Personality(String::new()));
        assert!(matches!(
            barrier.fill(&ids.knowledge, SlotValue::Knowledge(vec![])),
            FillOutcome::Complete(_)
        ));
        assert!(matches!(
            barrier.fill(&ids.knowledge, SlotValue::Knowledge(vec![])),
            FillOutcome::Unmatched
        ));
    }

    #[test]
    fn mismatched_slot_kind_is_rejected() {
        let barrier = JoinBarrier::new();
        let ids = barrier.open("hi".to_owned(), None);
        assert!(matches!(
            barrier.fill(&ids.memory, SlotValue::Knowledge(vec![])),
            FillOutcome::Unmatched
        ));
        assert_eq!(barrier.pending_len(), 1);
    }

    #[test]
    fn concurrent_exchanges_join_independently() {
        let barrier = JoinBarrier::new();
        let first = barrier.open("first".to_owned(), None);
        let second = barrier.open("second".to_owned(), None);

        for ids in [&second, &first] {
            barrier.fill(&ids.memory, SlotValue::Memory(vec![]));
            barrier.fill(&ids.knowledge, SlotValue::Knowledge(vec![]));
        }
        let FillOutcome::Complete(context) =
            barrier.fill(&first.personality, SlotValue::Personality(String::new()))
        else {
            panic!("first exchange should complete");
        };
        assert_eq!(context.input, "first");
        assert_eq!(barrier.pending_len(), 1);
    }

    #[test]
    fn abandoned_exchange_cannot_complete() {
        let barrier = JoinBarrier::new();
        let ids = barrier.open("slow".to_owned(), None);
        barrier.fill(&ids.memory, SlotValue::Memory(vec![]));
        assert!(barrier.abandon(&ids.exchange_id));
        assert!(!barrier.abandon(&ids.exchange_id));
        assert!(matches!(
            barrier.fill(&ids.personality, SlotValue::Personality(String::new())),
            FillOutcome::Unmatched
        ));
    }
}
