use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(NotificationId);
id_newtype!(PostId);
id_newtype!(RoomId);

/// Per-message delivery state, ordered by display precedence:
/// `Read > Delivered > Sent > Sending`. Transitions only move up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "until", rename_all = "snake_case")]
pub enum MuteState {
    Indefinite,
    Until(DateTime<Utc>),
}

impl MuteState {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self {
            MuteState::Indefinite => true,
            MuteState::Until(deadline) => *deadline > now,
        }
    }
}

/// Closed set of notification producers recognized by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    ConnectionRequest,
    ConnectionAccepted,
    CommentAdded,
    ReactionAdded,
    PostReactionAdded,
    ReplyAdded,
    PostCreated,
    CollaborationRequest,
    CollaborationRequestApproved,
    CollaborationRequestDeclined,
}
