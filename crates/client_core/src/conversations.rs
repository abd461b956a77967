use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, MuteState, RoomId, UserId},
    protocol::{ConversationPayload, MessagePayload, ParticipantState},
};

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub room_id: Option<RoomId>,
    pub participants: Vec<ParticipantState>,
    pub last_message_id: Option<MessageId>,
}

impl ConversationRecord {
    fn from_payload(payload: ConversationPayload) -> Self {
        Self {
            conversation_id: payload.conversation_id,
            kind: payload.kind,
            room_id: payload.room_id,
            participants: payload.participants,
            last_message_id: payload.last_message_id,
        }
    }

    fn participant(&self, user_id: UserId) -> Option<&ParticipantState> {
        self.participants
            .iter()
            .find(|participant| participant.user_id == user_id)
    }

    pub fn unread_for(&self, user_id: UserId) -> u32 {
        self.participant(user_id)
            .map(|participant| participant.unread_count)
            .unwrap_or(0)
    }

    pub fn mute_for(&self, user_id: UserId) -> Option<MuteState> {
        self.participant(user_id).and_then(|p| p.mute)
    }
}

/// Locally known conversations, keyed by id. Always replaced wholesale from
/// `conversation:update` pushes; only the unread counter is mutated locally,
/// and it is reconciled on the next push.
#[derive(Debug, Default)]
pub(crate) struct ConversationDirectory {
    self_user: Option<UserId>,
    conversations: HashMap<ConversationId, ConversationRecord>,
}

impl ConversationDirectory {
    pub fn set_self_user(&mut self, user_id: UserId) {
        self.self_user = Some(user_id);
    }

    pub fn upsert(&mut self, payload: ConversationPayload) {
        let record = ConversationRecord::from_payload(payload);
        self.conversations.insert(record.conversation_id, record);
    }

    /// Applies an incoming message to the directory. Returns `false` when the
    /// conversation is unknown locally, in which case the caller refetches
    /// instead of guessing at participants.
    pub fn record_incoming(&mut self, message: &MessagePayload, suppress_unread: bool) -> bool {
        let Some(record) = self.conversations.get_mut(&message.conversation_id) else {
            return false;
        };
        record.last_message_id = Some(message.message_id);

        if !suppress_unread {
            if let Some(self_user) = self.self_user {
                if let Some(participant) = record
                    .participants
                    .iter_mut()
                    .find(|participant| participant.user_id == self_user)
                {
                    participant.unread_count += 1;
                }
            }
        }
        true
    }

    pub fn clear_unread(&mut self, conversation_id: ConversationId) {
        let Some(self_user) = self.self_user else {
            return;
        };
        if let Some(record) = self.conversations.get_mut(&conversation_id) {
            if let Some(participant) = record
                .participants
                .iter_mut()
                .find(|participant| participant.user_id == self_user)
            {
                participant.unread_count = 0;
            }
        }
    }

    pub fn unread_for(&self, conversation_id: ConversationId) -> u32 {
        let Some(self_user) = self.self_user else {
            return 0;
        };
        self.conversations
            .get(&conversation_id)
            .map(|record| record.unread_for(self_user))
            .unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        let Some(self_user) = self.self_user else {
            return 0;
        };
        self.conversations
            .values()
            .map(|record| record.unread_for(self_user))
            .sum()
    }

    pub fn is_muted(&self, conversation_id: ConversationId, now: DateTime<Utc>) -> bool {
        let Some(self_user) = self.self_user else {
            return false;
        };
        self.conversations
            .get(&conversation_id)
            .and_then(|record| record.mute_for(self_user))
            .map(|mute| mute.is_active(now))
            .unwrap_or(false)
    }

    pub fn room_for(&self, conversation_id: ConversationId) -> Option<RoomId> {
        self.conversations
            .get(&conversation_id)
            .and_then(|record| record.room_id)
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<ConversationRecord> {
        self.conversations.get(&conversation_id).cloned()
    }

    pub fn all(&self) -> Vec<ConversationRecord> {
        let mut records: Vec<_> = self.conversations.values().cloned().collect();
        records.sort_by_key(|record| record.conversation_id);
        records
    }
}
