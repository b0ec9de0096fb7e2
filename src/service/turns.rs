//! One in-flight turn per conversation.
//!
//! A slot holds the turn's cancellation token and its phase channel. Starting
//! a turn while the slot is taken is refused; cancelling empties the slot at
//! once, so a second cancel finds nothing to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::events::{ConversationEvent, EventBus};

/// Lifecycle of a turn: `Sending → StreamingThinking → StreamingAnswer →
/// Reconciling → Idle`, with `Cancelled → Idle` reachable from any
/// streaming phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Sending,
    StreamingThinking,
    StreamingAnswer,
    Reconciling,
    Cancelled,
    Idle,
}

/// Publishes phase changes of one turn to its watch channel and the event bus.
#[derive(Clone)]
pub struct PhaseReporter {
    conversation_id: String,
    turn_id: String,
    phase: Arc<watch::Sender<TurnPhase>>,
    events: EventBus,
}

impl PhaseReporter {
    pub fn set(&self, next: TurnPhase) {
        let changed = self.phase.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(conversation_id = %self.conversation_id, turn_id = %self.turn_id, ?next, "turn phase");
            self.events.publish(ConversationEvent::PhaseChanged {
                conversation_id: self.conversation_id.clone(),
                turn_id: self.turn_id.clone(),
                phase: next,
            });
        }
    }

    pub fn current(&self) -> TurnPhase {
        *self.phase.borrow()
    }
}

/// Handed to the orchestrator when a slot is acquired.
pub struct TurnTicket {
    pub turn_id: String,
    pub cancel: CancellationToken,
    pub phase: PhaseReporter,
}

struct ActiveTurn {
    turn_id: String,
    cancel: CancellationToken,
    phase: PhaseReporter,
}

#[derive(Clone)]
pub struct TurnSlots {
    active: Arc<Mutex<HashMap<String, ActiveTurn>>>,
    events: EventBus,
}

impl TurnSlots {
    pub fn new(events: EventBus) -> Self {
        Self { active: Arc::default(), events }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveTurn>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `None` while another turn holds the slot.
    pub fn try_acquire(&self, conversation_id: &str) -> Option<TurnTicket> {
        let mut active = self.lock();
        if active.contains_key(conversation_id) {
            return None;
        }

        let turn_id = Uuid::new_v4().to_string();
        let (tx, _) = watch::channel(TurnPhase::Sending);
        let phase = PhaseReporter {
            conversation_id: conversation_id.to_string(),
            turn_id: turn_id.clone(),
            phase: Arc::new(tx),
            events: self.events.clone(),
        };
        let cancel = CancellationToken::new();
        active.insert(
            conversation_id.to_string(),
            ActiveTurn { turn_id: turn_id.clone(), cancel: cancel.clone(), phase: phase.clone() },
        );
        Some(TurnTicket { turn_id, cancel, phase })
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.lock().contains_key(conversation_id)
    }

    pub fn phase(&self, conversation_id: &str) -> Option<watch::Receiver<TurnPhase>> {
        self.lock().get(conversation_id).map(|turn| turn.phase.phase.subscribe())
    }

    /// Cancels and frees the slot. Returns false when no turn was active.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let Some(turn) = self.lock().remove(conversation_id) else {
            return false;
        };
        info!(conversation_id, turn_id = %turn.turn_id, "turn cancelled");
        turn.cancel.cancel();
        turn.phase.set(TurnPhase::Cancelled);
        turn.phase.set(TurnPhase::Idle);
        true
    }

    /// Frees the slot if `turn_id` still owns it. Returns whether it did.
    pub fn release(&self, conversation_id: &str, turn_id: &str) -> bool {
        let turn = {
            let mut active = self.lock();
            let owned = active.get(conversation_id).is_some_and(|turn| turn.turn_id == turn_id);
            if owned {
                active.remove(conversation_id)
            } else {
                None
            }
        };
        match turn {
            Some(turn) => {
                turn.phase.set(TurnPhase::Idle);
                true
            }
            None => false,
        }
    }
}
