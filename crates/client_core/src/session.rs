use std::sync::Arc;

use shared::{
    domain::{ConversationId, PostId, RoomId},
    protocol::{ClientRequest, RoomChannel},
};
use tokio::sync::{mpsc::UnboundedSender, watch};

use crate::typing::TypingChannel;

/// Process-wide "what is the user looking at" state: a single-writer watch
/// for the active conversation and another for the active post. Consulted by
/// the dispatcher surfaces for alert suppression and by the engine for
/// immediate read receipts.
pub struct SessionController {
    active_conversation: watch::Sender<Option<ConversationId>>,
    active_post: watch::Sender<Option<PostId>>,
    outbound: UnboundedSender<ClientRequest>,
}

impl SessionController {
    pub(crate) fn new(outbound: UnboundedSender<ClientRequest>) -> Self {
        let (active_conversation, _) = watch::channel(None);
        let (active_post, _) = watch::channel(None);
        Self {
            active_conversation,
            active_post,
            outbound,
        }
    }

    /// Marks the conversation visible, joins its real-time room (and the
    /// backing collaboration room for group threads), and returns the guard
    /// that undoes all of it on drop.
    pub(crate) fn enter(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        room_id: Option<RoomId>,
        display_name: String,
        typing: TypingChannel,
    ) -> ConversationGuard {
        self.active_conversation.send_replace(Some(conversation_id));
        let _ = self.outbound.send(ClientRequest::JoinRoom {
            room: RoomChannel::Conversation { conversation_id },
        });
        if let Some(room_id) = room_id {
            let _ = self.outbound.send(ClientRequest::JoinRoom {
                room: RoomChannel::Collaboration { room_id },
            });
        }
        ConversationGuard {
            session: Arc::clone(self),
            conversation_id,
            room_id,
            display_name,
            typing,
        }
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        *self.active_conversation.borrow()
    }

    pub fn is_active(&self, conversation_id: ConversationId) -> bool {
        self.active_conversation() == Some(conversation_id)
    }

    pub fn watch_active_conversation(&self) -> watch::Receiver<Option<ConversationId>> {
        self.active_conversation.subscribe()
    }

    pub fn focus_post(&self, post_id: PostId) {
        self.active_post.send_replace(Some(post_id));
    }

    pub fn blur_post(&self) {
        self.active_post.send_replace(None);
    }

    pub fn active_post(&self) -> Option<PostId> {
        *self.active_post.borrow()
    }
}

/// Scoped view session. Dropping it (on navigation away, unmount, or panic
/// unwind) clears the active id unless another view took over, cancels the
/// local typing timer with a final stop signal, and leaves the rooms joined
/// on entry.
pub struct ConversationGuard {
    session: Arc<SessionController>,
    conversation_id: ConversationId,
    room_id: Option<RoomId>,
    display_name: String,
    typing: TypingChannel,
}

impl ConversationGuard {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        if self.session.active_conversation() == Some(self.conversation_id) {
            self.session.active_conversation.send_replace(None);
        }
        self.typing
            .compose_blur(self.conversation_id, &self.display_name);
        let _ = self.session.outbound.send(ClientRequest::LeaveRoom {
            room: RoomChannel::Conversation {
                conversation_id: self.conversation_id,
            },
        });
        if let Some(room_id) = self.room_id {
            let _ = self.session.outbound.send(ClientRequest::LeaveRoom {
                room: RoomChannel::Collaboration { room_id },
            });
        }
    }
}
