use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        ConversationId, ConversationKind, MessageId, MuteState, NotificationId, NotificationKind,
        PostId, RoomId, UserId,
    },
    error::ApiError,
};

/// Real-time room addressed by `join-room`/`leave-room`. Conversations and
/// collaboration spaces are separate namespaces server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum RoomChannel {
    Conversation { conversation_id: ConversationId },
    Collaboration { room_id: RoomId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub user_id: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_display_name: Option<String>,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_to: Vec<DeliveryReceipt>,
    #[serde(default)]
    pub seen_by: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub user_id: UserId,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<MuteState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPayload {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    pub participants: Vec<ParticipantState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSummary {
    pub user_id: UserId,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_id: NotificationId,
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    pub actor: ActorSummary,
    /// Producer-specific bag; well-known keys are `conversation_id` and
    /// `post_id`, surfaced through the hint accessors below.
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn conversation_hint(&self) -> Option<ConversationId> {
        self.metadata
            .get("conversation_id")
            .and_then(serde_json::Value::as_i64)
            .map(ConversationId)
    }

    pub fn post_hint(&self) -> Option<PostId> {
        self.metadata
            .get("post_id")
            .and_then(serde_json::Value::as_i64)
            .map(PostId)
    }
}

/// Everything a client may push upstream over the socket. Encoded once at the
/// transport boundary; handlers never see raw frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientRequest {
    #[serde(rename = "join-room")]
    JoinRoom { room: RoomChannel },
    #[serde(rename = "leave-room")]
    LeaveRoom { room: RoomChannel },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
        display_name: String,
    },
    #[serde(rename = "message:received")]
    MessageReceived {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

/// Everything the server may push at a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "message:new")]
    MessageNew { message: MessagePayload },
    #[serde(rename = "message:sent")]
    MessageSent {
        client_temp_id: String,
        message: MessagePayload,
    },
    #[serde(rename = "message:delivered")]
    MessageDelivered {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        at: DateTime<Utc>,
    },
    #[serde(rename = "message:read")]
    MessageRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        /// Empty list means every message of the conversation.
        #[serde(default)]
        message_ids: Vec<MessageId>,
    },
    #[serde(rename = "typing")]
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        display_name: String,
        is_typing: bool,
    },
    #[serde(rename = "notification")]
    Notification { notification: NotificationPayload },
    #[serde(rename = "reaction:updated")]
    ReactionUpdated {
        post_id: PostId,
        recipient_id: UserId,
    },
    #[serde(rename = "conversation:update")]
    ConversationUpdate { conversation: ConversationPayload },
    #[serde(rename = "error")]
    Error(ApiError),
}
