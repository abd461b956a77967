use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::ClientRequest,
};
use tokio::{
    sync::{broadcast, mpsc::UnboundedSender},
    time::Instant,
};

use crate::{timers::TimerRegistry, ClientEvent};

/// One participant of a conversation's typing set. The local composer lives
/// under its own private key so it can never be rendered as a remote typist
/// or collide with an echo of our own signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TypistKey {
    Local,
    Remote(UserId),
}

#[derive(Debug, Clone)]
struct TypingEntry {
    display_name: String,
    expires_at: Instant,
}

#[derive(Default)]
struct TypingState {
    typists: HashMap<ConversationId, HashMap<TypistKey, TypingEntry>>,
    composing: HashSet<ConversationId>,
}

/// Ephemeral typing presence. Local signalling is edge-triggered (one start
/// per empty→non-empty transition, one stop on idle/blur/clear); remote
/// signals refresh a per-sender deadline and expire on their own, bounding
/// the visible set against senders that vanish without a stop.
#[derive(Clone)]
pub(crate) struct TypingChannel {
    outbound: UnboundedSender<ClientRequest>,
    events: broadcast::Sender<ClientEvent>,
    timers: TimerRegistry<(ConversationId, TypistKey)>,
    state: Arc<Mutex<TypingState>>,
    stop_delay: Duration,
    expiry: Duration,
}

impl TypingChannel {
    pub fn new(
        outbound: UnboundedSender<ClientRequest>,
        events: broadcast::Sender<ClientEvent>,
        stop_delay: Duration,
        expiry: Duration,
    ) -> Self {
        Self {
            outbound,
            events,
            timers: TimerRegistry::new(),
            state: Arc::new(Mutex::new(TypingState::default())),
            stop_delay,
            expiry,
        }
    }

    /// Called on every compose keystroke with the current input text.
    pub fn compose_changed(&self, conversation_id: ConversationId, text: &str, display_name: &str) {
        if text.is_empty() {
            self.stop_composing(conversation_id, display_name);
            return;
        }

        let newly_started = self
            .lock_state()
            .composing
            .insert(conversation_id);
        if newly_started {
            let _ = self.outbound.send(ClientRequest::Typing {
                conversation_id,
                is_typing: true,
                display_name: display_name.to_string(),
            });
        }

        // Every keystroke pushes the automatic stop out again.
        let state = Arc::clone(&self.state);
        let outbound = self.outbound.clone();
        let name = display_name.to_string();
        self.timers.arm(
            (conversation_id, TypistKey::Local),
            self.stop_delay,
            async move {
                let was_composing = state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .composing
                    .remove(&conversation_id);
                if was_composing {
                    let _ = outbound.send(ClientRequest::Typing {
                        conversation_id,
                        is_typing: false,
                        display_name: name,
                    });
                }
            },
        );
    }

    /// Blur or clear of the compose input: an immediate stop, but only when a
    /// start is actually outstanding.
    pub fn compose_blur(&self, conversation_id: ConversationId, display_name: &str) {
        self.stop_composing(conversation_id, display_name);
    }

    fn stop_composing(&self, conversation_id: ConversationId, display_name: &str) {
        let was_composing = self
            .lock_state()
            .composing
            .remove(&conversation_id);
        if !was_composing {
            return;
        }
        self.timers.cancel(&(conversation_id, TypistKey::Local));
        let _ = self.outbound.send(ClientRequest::Typing {
            conversation_id,
            is_typing: false,
            display_name: display_name.to_string(),
        });
    }

    /// Applies a remote typing signal. A start refreshes the sender's expiry
    /// deadline; a stop removes the sender at once.
    pub fn observe(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        display_name: String,
        is_typing: bool,
    ) {
        let key = TypistKey::Remote(user_id);
        if is_typing {
            let expires_at = Instant::now() + self.expiry;
            self.lock_state()
                .typists
                .entry(conversation_id)
                .or_default()
                .insert(
                    key,
                    TypingEntry {
                        display_name,
                        expires_at,
                    },
                );

            let channel = self.clone();
            self.timers
                .arm((conversation_id, key), self.expiry, async move {
                    channel.prune(conversation_id, key);
                });
        } else {
            self.timers.cancel(&(conversation_id, key));
            self.remove_typist(conversation_id, key);
        }
        self.emit_changed(conversation_id);
    }

    fn prune(&self, conversation_id: ConversationId, key: TypistKey) {
        let now = Instant::now();
        let removed = {
            let mut state = self.lock_state();
            let Some(typists) = state.typists.get_mut(&conversation_id) else {
                return;
            };
            match typists.get(&key) {
                Some(entry) if entry.expires_at <= now => {
                    typists.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.emit_changed(conversation_id);
        }
    }

    fn remove_typist(&self, conversation_id: ConversationId, key: TypistKey) {
        let mut state = self.lock_state();
        let emptied = match state.typists.get_mut(&conversation_id) {
            Some(typists) => {
                typists.remove(&key);
                typists.is_empty()
            }
            None => false,
        };
        if emptied {
            state.typists.remove(&conversation_id);
        }
    }

    /// The visible typing set: a pure function of the recorded deadlines.
    pub fn active_typists(&self, conversation_id: ConversationId) -> Vec<String> {
        let now = Instant::now();
        let state = self.lock_state();
        let Some(typists) = state.typists.get(&conversation_id) else {
            return Vec::new();
        };
        let mut names: Vec<String> = typists
            .iter()
            .filter(|(key, entry)| **key != TypistKey::Local && entry.expires_at > now)
            .map(|(_, entry)| entry.display_name.clone())
            .collect();
        names.sort();
        names
    }

    fn emit_changed(&self, conversation_id: ConversationId) {
        let _ = self.events.send(ClientEvent::TypingChanged {
            conversation_id,
            typists: self.active_typists(conversation_id),
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
