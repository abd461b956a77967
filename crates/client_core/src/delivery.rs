use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, DeliveryStatus, MessageId, UserId},
    protocol::MessagePayload,
};

/// A server-confirmed message together with its acknowledgement state.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub delivered_to: HashMap<UserId, DateTime<Utc>>,
    pub seen_by: HashSet<UserId>,
    status: DeliveryStatus,
}

impl MessageRecord {
    fn from_payload(payload: &MessagePayload) -> Self {
        let delivered_to: HashMap<_, _> = payload
            .delivered_to
            .iter()
            .map(|receipt| (receipt.user_id, receipt.at))
            .collect();
        let seen_by: HashSet<_> = payload.seen_by.iter().copied().collect();

        let status = if seen_by.iter().any(|user| *user != payload.sender_id) {
            DeliveryStatus::Read
        } else if !delivered_to.is_empty() {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        };

        Self {
            message_id: payload.message_id,
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            body: payload.body.clone(),
            sent_at: payload.sent_at,
            delivered_to,
            seen_by,
            status,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    /// Applies the display-precedence rule: transitions only move up.
    fn promote(&mut self, status: DeliveryStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }
}

/// An optimistic send awaiting server confirmation.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub client_temp_id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub queued_at: DateTime<Utc>,
}

/// One rendered row of a conversation: confirmed messages first, unconfirmed
/// sends after them.
#[derive(Debug, Clone)]
pub enum ConversationEntry {
    Confirmed(MessageRecord),
    Pending(PendingSend),
}

/// Per-message delivery state machine. Confirmed messages live in an entity
/// table keyed by server id; optimistic sends live in a separate pending
/// table keyed by client temp id, so confirmation is a move between tables
/// rather than positional surgery on a rendered list.
#[derive(Debug, Default)]
pub(crate) struct DeliveryTracker {
    messages: HashMap<MessageId, MessageRecord>,
    pending: HashMap<String, PendingSend>,
}

impl DeliveryTracker {
    pub fn begin_send(&mut self, pending: PendingSend) {
        self.pending.insert(pending.client_temp_id.clone(), pending);
    }

    /// Replaces the optimistic entry with the confirmed message. Unknown temp
    /// ids are tolerated: the confirmed message is recorded either way, since
    /// the server is the source of truth.
    pub fn confirm_send(&mut self, client_temp_id: &str, payload: &MessagePayload) -> bool {
        let had_pending = self.pending.remove(client_temp_id).is_some();
        self.messages
            .entry(payload.message_id)
            .or_insert_with(|| MessageRecord::from_payload(payload));
        had_pending
    }

    /// Drops the optimistic entry after a transport rejection and hands the
    /// original body back for compose restoration. No retry is scheduled.
    pub fn reject_send(&mut self, client_temp_id: &str) -> Option<PendingSend> {
        self.pending.remove(client_temp_id)
    }

    pub fn insert_remote(&mut self, payload: &MessagePayload) {
        self.messages
            .entry(payload.message_id)
            .or_insert_with(|| MessageRecord::from_payload(payload));
    }

    /// Records a per-user delivery acknowledgement. Returns the new status
    /// when the message moved up, `None` for unknown ids or stale acks.
    pub fn apply_delivered(
        &mut self,
        message_id: MessageId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Option<DeliveryStatus> {
        let record = self.messages.get_mut(&message_id)?;
        record.delivered_to.entry(user_id).or_insert(at);
        record
            .promote(DeliveryStatus::Delivered)
            .then(|| record.status())
    }

    /// Marks `reader` as having seen the given messages (all messages of the
    /// conversation when the list is empty). Seen implies delivered, so a
    /// missing delivery receipt is backfilled. The sender reading their own
    /// message never promotes it.
    pub fn apply_read(
        &mut self,
        conversation_id: ConversationId,
        reader: UserId,
        message_ids: &[MessageId],
        at: DateTime<Utc>,
    ) -> Vec<(MessageId, DeliveryStatus)> {
        let targets: Vec<MessageId> = if message_ids.is_empty() {
            self.messages
                .values()
                .filter(|record| record.conversation_id == conversation_id)
                .map(|record| record.message_id)
                .collect()
        } else {
            message_ids.to_vec()
        };

        let mut changed = Vec::new();
        for message_id in targets {
            let Some(record) = self.messages.get_mut(&message_id) else {
                continue;
            };
            if record.conversation_id != conversation_id {
                continue;
            }
            record.seen_by.insert(reader);
            record.delivered_to.entry(reader).or_insert(at);
            if reader != record.sender_id && record.promote(DeliveryStatus::Read) {
                changed.push((message_id, record.status()));
            }
        }
        changed
    }

    pub fn status_of(&self, message_id: MessageId) -> Option<DeliveryStatus> {
        self.messages.get(&message_id).map(MessageRecord::status)
    }

    pub fn message(&self, message_id: MessageId) -> Option<&MessageRecord> {
        self.messages.get(&message_id)
    }

    #[cfg(test)]
    pub fn pending_send(&self, client_temp_id: &str) -> Option<&PendingSend> {
        self.pending.get(client_temp_id)
    }

    pub fn conversation_entries(&self, conversation_id: ConversationId) -> Vec<ConversationEntry> {
        let mut confirmed: Vec<&MessageRecord> = self
            .messages
            .values()
            .filter(|record| record.conversation_id == conversation_id)
            .collect();
        confirmed.sort_by_key(|record| (record.sent_at, record.message_id));

        let mut pending: Vec<&PendingSend> = self
            .pending
            .values()
            .filter(|send| send.conversation_id == conversation_id)
            .collect();
        pending.sort_by(|a, b| {
            (a.queued_at, a.client_temp_id.as_str()).cmp(&(b.queued_at, b.client_temp_id.as_str()))
        });

        confirmed
            .into_iter()
            .map(|record| ConversationEntry::Confirmed(record.clone()))
            .chain(
                pending
                    .into_iter()
                    .map(|send| ConversationEntry::Pending(send.clone())),
            )
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/delivery_tests.rs"]
mod tests;
