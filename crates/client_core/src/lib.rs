use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, DeliveryStatus, MessageId, UserId},
    protocol::{
        ClientRequest, ConversationPayload, MessagePayload, NotificationPayload, ServerEvent,
    },
};
use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Mutex,
};
use tracing::{debug, info, warn};

pub mod config;
mod conversations;
mod delivery;
mod dispatcher;
pub mod error;
mod inbox;
mod session;
mod timers;
mod transport;
mod typing;

pub use config::{load_settings, EngineSettings};
pub use conversations::ConversationRecord;
pub use delivery::{ConversationEntry, MessageRecord, PendingSend};
pub use dispatcher::DispatchedUpdate;
pub use error::GatewayError;
pub use inbox::{HttpNotificationGateway, InboxSnapshot, NotificationGateway, NotificationInbox};
pub use session::{ConversationGuard, SessionController};

use conversations::ConversationDirectory;
use delivery::DeliveryTracker;
use dispatcher::NotificationDispatcher;
use typing::TypingChannel;

/// Engine-level happenings fanned out to whichever surfaces care. Like the
/// dispatcher's updates, these are state announcements, not commands.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageReceived {
        message: MessagePayload,
    },
    MessageConfirmed {
        client_temp_id: String,
        message_id: MessageId,
    },
    DeliveryChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        status: DeliveryStatus,
    },
    /// A rejected send: the optimistic entry is gone and the compose input
    /// should be refilled with this body for manual retry.
    ComposeRestored {
        conversation_id: ConversationId,
        body: String,
    },
    TypingChanged {
        conversation_id: ConversationId,
        typists: Vec<String>,
    },
    InboxChanged {
        unread: u32,
    },
    /// A message referenced a conversation unknown locally; surfaces should
    /// refetch the conversation list rather than trust local state.
    ConversationsStale,
    Error(String),
}

struct EngineState {
    server_url: Option<String>,
    user_id: Option<UserId>,
    display_name: Option<String>,
    ws_started: bool,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SendMessageHttpRequest<'a> {
    user_id: i64,
    conversation_id: i64,
    client_temp_id: &'a str,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct LoginHttpRequest<'a> {
    username: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginHttpResponse {
    user_id: i64,
    #[serde(default)]
    display_name: Option<String>,
}

/// The real-time delivery and notification engine. One instance per
/// connected client; construction returns an `Arc` because the background
/// pumps (transport, dispatcher window, inbox sync) hold references back
/// into it.
pub struct RealtimeClient {
    http: Client,
    settings: EngineSettings,
    inner: Mutex<EngineState>,
    outbound_tx: UnboundedSender<ClientRequest>,
    outbound_rx: Mutex<Option<UnboundedReceiver<ClientRequest>>>,
    delivery: Mutex<DeliveryTracker>,
    conversations: Mutex<ConversationDirectory>,
    typing: TypingChannel,
    session: Arc<SessionController>,
    dispatcher: Arc<NotificationDispatcher>,
    inbox: Arc<NotificationInbox>,
    http_gateway: Option<Arc<HttpNotificationGateway>>,
    events: broadcast::Sender<ClientEvent>,
}

impl RealtimeClient {
    pub fn new() -> Arc<Self> {
        Self::with_settings(EngineSettings::default())
    }

    pub fn with_settings(settings: EngineSettings) -> Arc<Self> {
        let http = Client::new();
        let gateway = Arc::new(HttpNotificationGateway::new(http.clone()));
        let dyn_gateway: Arc<dyn NotificationGateway> = gateway.clone();
        Self::build(settings, http, dyn_gateway, Some(gateway))
    }

    /// Injects a notification gateway double; everything else is wired as in
    /// production.
    pub fn new_with_gateway(
        settings: EngineSettings,
        gateway: Arc<dyn NotificationGateway>,
    ) -> Arc<Self> {
        Self::build(settings, Client::new(), gateway, None)
    }

    fn build(
        settings: EngineSettings,
        http: Client,
        gateway: Arc<dyn NotificationGateway>,
        http_gateway: Option<Arc<HttpNotificationGateway>>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(settings.event_capacity);
        let session = Arc::new(SessionController::new(outbound_tx.clone()));
        let dispatcher = NotificationDispatcher::new(settings.dispatch_window, settings.event_capacity);
        let inbox = NotificationInbox::new(gateway, settings.undo_grace, events.clone());
        let typing = TypingChannel::new(
            outbound_tx.clone(),
            events.clone(),
            settings.typing_stop_delay,
            settings.typing_expiry,
        );

        let client = Arc::new(Self {
            http,
            settings,
            inner: Mutex::new(EngineState {
                server_url: None,
                user_id: None,
                display_name: None,
                ws_started: false,
            }),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            delivery: Mutex::new(DeliveryTracker::default()),
            conversations: Mutex::new(ConversationDirectory::default()),
            typing,
            session,
            dispatcher,
            inbox,
            http_gateway,
            events,
        });
        client.spawn_inbox_sync();
        client
    }

    /// Keeps the inbox reconciled with every dispatched batch. A lagged
    /// subscriber just refetches; the batch it missed only ever asked for a
    /// refetch anyway.
    fn spawn_inbox_sync(self: &Arc<Self>) {
        let mut updates = self.dispatcher.subscribe();
        let inbox = Arc::clone(&self.inbox);
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => inbox.apply_update(&update).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => inbox.refresh().await,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub async fn login(&self, server_url: &str, username: &str) -> Result<UserId> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let response: LoginHttpResponse = self
            .http
            .post(format!("{server_url}/login"))
            .json(&LoginHttpRequest { username })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("malformed login response")?;

        let user_id = UserId(response.user_id);
        let display_name = response
            .display_name
            .unwrap_or_else(|| username.to_string());
        {
            let mut inner = self.inner.lock().await;
            inner.server_url = Some(server_url.clone());
            inner.user_id = Some(user_id);
            inner.display_name = Some(display_name);
        }
        if let Some(gateway) = &self.http_gateway {
            gateway.configure(server_url, user_id);
        }
        self.conversations.lock().await.set_self_user(user_id);
        info!("logged in user_id={}", user_id.0);
        Ok(user_id)
    }

    /// Opens the websocket and starts routing decoded events. Idempotent;
    /// reconnecting after a drop is the caller's decision, not an automatic
    /// retry loop.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (server_url, user_id) = self.require_session().await?;
        {
            let mut inner = self.inner.lock().await;
            if inner.ws_started {
                return Ok(());
            }
            inner.ws_started = true;
        }

        let ws_url = transport::websocket_url(&server_url, user_id)?;
        let connection = match transport::connect(&ws_url).await {
            Ok(connection) => connection,
            Err(err) => {
                self.inner.lock().await.ws_started = false;
                return Err(err);
            }
        };

        let outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("transport already running"))?;
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        connection.spawn(outbound_rx, inbound_tx);

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                client.handle_server_event(event).await;
            }
        });
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// The coalesced notification stream consumed by the badge, inbox and
    /// toast surfaces.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<DispatchedUpdate> {
        self.dispatcher.subscribe()
    }

    pub fn inbox(&self) -> Arc<NotificationInbox> {
        Arc::clone(&self.inbox)
    }

    pub fn session(&self) -> Arc<SessionController> {
        Arc::clone(&self.session)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    async fn require_session(&self) -> Result<(String, UserId)> {
        let inner = self.inner.lock().await;
        match (&inner.server_url, inner.user_id) {
            (Some(server_url), Some(user_id)) => Ok((server_url.clone(), user_id)),
            _ => Err(anyhow!("not logged in")),
        }
    }

    async fn current_user(&self) -> Option<UserId> {
        self.inner.lock().await.user_id
    }

    async fn display_name(&self) -> String {
        self.inner
            .lock()
            .await
            .display_name
            .clone()
            .unwrap_or_default()
    }

    /// Optimistic send: the message renders immediately under a temp id and
    /// is replaced by the server-confirmed record on success. On rejection
    /// the entry is removed and the compose text handed back; no silent
    /// drop, no automatic retry.
    pub async fn send_message(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        body: &str,
    ) -> Result<MessagePayload> {
        let (server_url, user_id) = self.require_session().await?;
        let client_temp_id = format!("temp-{}", Utc::now().timestamp_millis());
        {
            let mut delivery = self.delivery.lock().await;
            delivery.begin_send(PendingSend {
                client_temp_id: client_temp_id.clone(),
                conversation_id,
                sender_id: user_id,
                body: body.to_string(),
                queued_at: Utc::now(),
            });
        }

        let response = self
            .http
            .post(format!("{server_url}/messages"))
            .json(&SendMessageHttpRequest {
                user_id: user_id.0,
                conversation_id: conversation_id.0,
                client_temp_id: &client_temp_id,
                body,
            })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.abort_send(conversation_id, &client_temp_id).await;
                return Err(err).context("message send rejected");
            }
        };
        let message: MessagePayload = match response.json().await {
            Ok(message) => message,
            Err(err) => {
                self.abort_send(conversation_id, &client_temp_id).await;
                return Err(err).context("malformed send confirmation");
            }
        };

        self.delivery
            .lock()
            .await
            .confirm_send(&client_temp_id, &message);
        let _ = self.events.send(ClientEvent::MessageConfirmed {
            client_temp_id,
            message_id: message.message_id,
        });
        Ok(message)
    }

    async fn abort_send(&self, conversation_id: ConversationId, client_temp_id: &str) {
        let rejected = self.delivery.lock().await.reject_send(client_temp_id);
        if let Some(pending) = rejected {
            let _ = self.events.send(ClientEvent::ComposeRestored {
                conversation_id,
                body: pending.body,
            });
        }
        warn!(
            "message send rejected conversation_id={} client_temp_id={client_temp_id}",
            conversation_id.0
        );
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationRecord>> {
        let (server_url, user_id) = self.require_session().await?;
        let payloads: Vec<ConversationPayload> = self
            .http
            .get(format!("{server_url}/conversations"))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut conversations = self.conversations.lock().await;
        for payload in payloads {
            conversations.upsert(payload);
        }
        Ok(conversations.all())
    }

    pub async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        let (server_url, user_id) = self.require_session().await?;
        let messages: Vec<MessagePayload> = self
            .http
            .get(format!(
                "{server_url}/conversations/{}/messages",
                conversation_id.0
            ))
            .query(&ListMessagesQuery {
                user_id: user_id.0,
                limit,
                before: before.map(|id| id.0),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut delivery = self.delivery.lock().await;
        for message in &messages {
            delivery.insert_remote(message);
        }
        Ok(messages)
    }

    pub async fn mark_conversation_read(&self, conversation_id: ConversationId) -> Result<()> {
        let (server_url, user_id) = self.require_session().await?;
        self.http
            .post(format!(
                "{server_url}/conversations/{}/read",
                conversation_id.0
            ))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?
            .error_for_status()?;
        self.conversations.lock().await.clear_unread(conversation_id);
        Ok(())
    }

    /// Makes the conversation the active one for this process: publishes the
    /// id, joins the rooms, and fires the opening read receipt. The returned
    /// guard reverses everything when the view goes away.
    pub async fn enter_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> ConversationGuard {
        let display_name = self.display_name().await;
        let room_id = self.conversations.lock().await.room_for(conversation_id);
        let guard = self.session.enter(
            conversation_id,
            room_id,
            display_name,
            self.typing.clone(),
        );

        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.mark_conversation_read(conversation_id).await {
                debug!(
                    "opening read receipt failed conversation_id={}: {err:#}",
                    conversation_id.0
                );
            }
        });
        guard
    }

    pub async fn compose_changed(&self, conversation_id: ConversationId, text: &str) {
        let display_name = self.display_name().await;
        self.typing
            .compose_changed(conversation_id, text, &display_name);
    }

    pub async fn compose_blur(&self, conversation_id: ConversationId) {
        let display_name = self.display_name().await;
        self.typing.compose_blur(conversation_id, &display_name);
    }

    pub fn active_typists(&self, conversation_id: ConversationId) -> Vec<String> {
        self.typing.active_typists(conversation_id)
    }

    pub async fn conversation_entries(
        &self,
        conversation_id: ConversationId,
    ) -> Vec<ConversationEntry> {
        self.delivery
            .lock()
            .await
            .conversation_entries(conversation_id)
    }

    pub async fn message_status(&self, message_id: MessageId) -> Option<DeliveryStatus> {
        self.delivery.lock().await.status_of(message_id)
    }

    pub async fn message_record(&self, message_id: MessageId) -> Option<MessageRecord> {
        self.delivery.lock().await.message(message_id).cloned()
    }

    pub async fn conversation(&self, conversation_id: ConversationId) -> Option<ConversationRecord> {
        self.conversations.lock().await.get(conversation_id)
    }

    pub async fn unread_conversations_total(&self) -> u32 {
        self.conversations.lock().await.total_unread()
    }

    pub async fn conversation_unread(&self, conversation_id: ConversationId) -> u32 {
        self.conversations.lock().await.unread_for(conversation_id)
    }

    /// Whether a surface should skip the toast/sound for this notification.
    /// Cosmetic only: counts and feeds update regardless of the answer.
    pub async fn should_suppress_alert(&self, notification: &NotificationPayload) -> bool {
        if self.current_user().await == Some(notification.actor.user_id) {
            return true;
        }
        if let Some(conversation_id) = notification.conversation_hint() {
            if self.session.is_active(conversation_id) {
                return true;
            }
            if self
                .conversations
                .lock()
                .await
                .is_muted(conversation_id, Utc::now())
            {
                return true;
            }
        }
        if let Some(post_id) = notification.post_hint() {
            if self.session.active_post() == Some(post_id) {
                return true;
            }
        }
        false
    }

    /// Single routing point for decoded transport events.
    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::MessageNew { message } => self.handle_incoming_message(message).await,
            ServerEvent::MessageSent {
                client_temp_id,
                message,
            } => {
                self.delivery
                    .lock()
                    .await
                    .confirm_send(&client_temp_id, &message);
                let _ = self.events.send(ClientEvent::MessageConfirmed {
                    client_temp_id,
                    message_id: message.message_id,
                });
            }
            ServerEvent::MessageDelivered {
                conversation_id,
                message_id,
                user_id,
                at,
            } => {
                let changed = self
                    .delivery
                    .lock()
                    .await
                    .apply_delivered(message_id, user_id, at);
                match changed {
                    Some(status) => {
                        let _ = self.events.send(ClientEvent::DeliveryChanged {
                            conversation_id,
                            message_id,
                            status,
                        });
                    }
                    None => debug!("delivery ack for unknown message_id={}", message_id.0),
                }
            }
            ServerEvent::MessageRead {
                conversation_id,
                reader_id,
                message_ids,
            } => {
                let changed = self.delivery.lock().await.apply_read(
                    conversation_id,
                    reader_id,
                    &message_ids,
                    Utc::now(),
                );
                for (message_id, status) in changed {
                    let _ = self.events.send(ClientEvent::DeliveryChanged {
                        conversation_id,
                        message_id,
                        status,
                    });
                }
            }
            ServerEvent::Typing {
                conversation_id,
                user_id,
                display_name,
                is_typing,
            } => {
                if self.current_user().await == Some(user_id) {
                    return;
                }
                self.typing
                    .observe(conversation_id, user_id, display_name, is_typing);
            }
            ServerEvent::Notification { notification } => {
                self.dispatcher.ingest(notification);
            }
            ServerEvent::ReactionUpdated { post_id, .. } => {
                debug!("reaction totals changed post_id={}", post_id.0);
                self.dispatcher.ingest_refresh();
            }
            ServerEvent::ConversationUpdate { conversation } => {
                self.conversations.lock().await.upsert(conversation);
            }
            ServerEvent::Error(err) => {
                warn!("server error {err}");
                let _ = self.events.send(ClientEvent::Error(err.message));
            }
        }
    }

    async fn handle_incoming_message(self: &Arc<Self>, message: MessagePayload) {
        let Some(user_id) = self.current_user().await else {
            return;
        };
        let conversation_id = message.conversation_id;
        let from_self = message.sender_id == user_id;
        let is_active = self.session.is_active(conversation_id);

        self.delivery.lock().await.insert_remote(&message);
        let known = self
            .conversations
            .lock()
            .await
            .record_incoming(&message, from_self || is_active);
        if !known {
            debug!(
                "message for unknown conversation_id={}",
                conversation_id.0
            );
            let _ = self.events.send(ClientEvent::ConversationsStale);
        }

        if !from_self {
            let _ = self.outbound_tx.send(ClientRequest::MessageReceived {
                conversation_id,
                message_id: message.message_id,
            });
            if is_active {
                // Reading is implicit while the thread is on screen.
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = client.mark_conversation_read(conversation_id).await {
                        debug!(
                            "immediate read receipt failed conversation_id={}: {err:#}",
                            conversation_id.0
                        );
                    }
                });
            }
        }
        let _ = self.events.send(ClientEvent::MessageReceived { message });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
