use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use shared::{
    domain::{NotificationId, UserId},
    protocol::NotificationPayload,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{dispatcher::DispatchedUpdate, error::GatewayError, timers::TimerRegistry, ClientEvent};

/// HTTP collaborators behind the notification feed. Everything the inbox
/// needs from the network goes through here, so tests substitute recording
/// doubles and production wires the reqwest implementation below.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>, GatewayError>;
    async fn unread_count(&self) -> Result<u32, GatewayError>;
    async fn mark_read(&self, id: NotificationId) -> Result<(), GatewayError>;
    async fn mark_all_read(&self) -> Result<(), GatewayError>;
    async fn delete(&self, id: NotificationId) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
struct Endpoint {
    server_url: String,
    user_id: UserId,
}

pub struct HttpNotificationGateway {
    http: reqwest::Client,
    endpoint: StdMutex<Option<Endpoint>>,
}

impl HttpNotificationGateway {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: StdMutex::new(None),
        }
    }

    pub fn configure(&self, server_url: impl Into<String>, user_id: UserId) {
        let mut endpoint = self.endpoint.lock().unwrap_or_else(PoisonError::into_inner);
        *endpoint = Some(Endpoint {
            server_url: server_url.into(),
            user_id,
        });
    }

    fn endpoint(&self) -> Result<Endpoint, GatewayError> {
        self.endpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(GatewayError::NotConfigured)
    }
}

#[derive(Debug, Deserialize)]
struct UnreadCountResponse {
    unread: u32,
}

#[async_trait]
impl NotificationGateway for HttpNotificationGateway {
    async fn list_notifications(&self) -> Result<Vec<NotificationPayload>, GatewayError> {
        let endpoint = self.endpoint()?;
        let notifications = self
            .http
            .get(format!("{}/notifications", endpoint.server_url))
            .query(&[("user_id", endpoint.user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(notifications)
    }

    async fn unread_count(&self) -> Result<u32, GatewayError> {
        let endpoint = self.endpoint()?;
        let response: UnreadCountResponse = self
            .http
            .get(format!("{}/notifications/unread_count", endpoint.server_url))
            .query(&[("user_id", endpoint.user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.unread)
    }

    async fn mark_read(&self, id: NotificationId) -> Result<(), GatewayError> {
        let endpoint = self.endpoint()?;
        self.http
            .post(format!(
                "{}/notifications/{}/read",
                endpoint.server_url, id.0
            ))
            .query(&[("user_id", endpoint.user_id.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<(), GatewayError> {
        let endpoint = self.endpoint()?;
        self.http
            .post(format!("{}/notifications/read_all", endpoint.server_url))
            .query(&[("user_id", endpoint.user_id.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete(&self, id: NotificationId) -> Result<(), GatewayError> {
        let endpoint = self.endpoint()?;
        self.http
            .delete(format!("{}/notifications/{}", endpoint.server_url, id.0))
            .query(&[("user_id", endpoint.user_id.0)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// What the inbox surface renders: newest-first notifications plus the badge
/// count, both reconciled against the gateway after every real mutation.
#[derive(Debug, Clone, Default)]
pub struct InboxSnapshot {
    pub notifications: Vec<NotificationPayload>,
    pub unread: u32,
}

#[derive(Debug)]
struct StagedDeletion {
    notification: NotificationPayload,
    was_unread: bool,
}

#[derive(Default)]
struct InboxState {
    entries: HashMap<NotificationId, NotificationPayload>,
    unread: u32,
    staged: HashMap<NotificationId, StagedDeletion>,
}

impl InboxState {
    fn sorted(&self) -> Vec<NotificationPayload> {
        let mut notifications: Vec<_> = self.entries.values().cloned().collect();
        notifications.sort_by(|a, b| {
            (b.created_at, b.notification_id).cmp(&(a.created_at, a.notification_id))
        });
        notifications
    }
}

/// Materialized notification list with client-staged soft deletion. A staged
/// item is gone from the rendered list immediately, but nothing touches the
/// network until the grace timer fires; `undo` inside the window restores the
/// snapshot with zero network calls.
pub struct NotificationInbox {
    gateway: Arc<dyn NotificationGateway>,
    state: Mutex<InboxState>,
    grace_timers: TimerRegistry<NotificationId>,
    grace: Duration,
    events: broadcast::Sender<ClientEvent>,
}

impl NotificationInbox {
    pub(crate) fn new(
        gateway: Arc<dyn NotificationGateway>,
        grace: Duration,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            state: Mutex::new(InboxState::default()),
            grace_timers: TimerRegistry::new(),
            grace,
            events,
        })
    }

    pub async fn snapshot(&self) -> InboxSnapshot {
        let state = self.state.lock().await;
        InboxSnapshot {
            notifications: state.sorted(),
            unread: state.unread,
        }
    }

    pub async fn unread(&self) -> u32 {
        self.state.lock().await.unread
    }

    /// Stages a deletion: the item leaves the rendered list and the count
    /// drops now, the destructive call waits out the grace period. Returns
    /// `false` when the id is unknown or already staged (repeat deletes are
    /// no-ops; at most one grace timer exists per id).
    pub async fn delete_with_undo(self: &Arc<Self>, id: NotificationId) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.staged.contains_key(&id) {
                return false;
            }
            let Some(notification) = state.entries.remove(&id) else {
                return false;
            };
            let was_unread = !notification.read;
            if was_unread {
                state.unread = state.unread.saturating_sub(1);
            }
            state.staged.insert(
                id,
                StagedDeletion {
                    notification,
                    was_unread,
                },
            );
        }

        let inbox = Arc::clone(self);
        self.grace_timers.arm(id, self.grace, async move {
            inbox.commit_deletion(id).await;
        });
        self.emit_changed().await;
        true
    }

    /// Cancels a staged deletion and reinserts the snapshot. Returns `false`
    /// when the grace period already elapsed (or nothing was staged).
    pub async fn undo(&self, id: NotificationId) -> bool {
        let restored = {
            let mut state = self.state.lock().await;
            let Some(staged) = state.staged.remove(&id) else {
                return false;
            };
            self.grace_timers.cancel(&id);
            if staged.was_unread {
                state.unread += 1;
            }
            state.entries.insert(id, staged.notification);
            true
        };
        if restored {
            self.emit_changed().await;
        }
        restored
    }

    async fn commit_deletion(self: Arc<Self>, id: NotificationId) {
        let staged = {
            let mut state = self.state.lock().await;
            state.staged.remove(&id)
        };
        if staged.is_none() {
            // Undone between the timer firing and this task running.
            return;
        }
        if let Err(err) = self.gateway.delete(id).await {
            warn!("notification delete failed id={}: {err}", id.0);
        }
        // The optimistic count is never trusted after a real deletion.
        self.refresh().await;
    }

    /// Bulk deletion bypasses the undo window: optimistic removal, parallel
    /// destructive calls, and one reconciling refetch regardless of partial
    /// failure.
    pub async fn delete_bulk(&self, ids: &[NotificationId]) {
        {
            let mut state = self.state.lock().await;
            for id in ids {
                self.grace_timers.cancel(id);
                state.staged.remove(id);
                if let Some(notification) = state.entries.remove(id) {
                    if !notification.read {
                        state.unread = state.unread.saturating_sub(1);
                    }
                }
            }
        }
        self.emit_changed().await;

        let results = join_all(ids.iter().map(|id| self.gateway.delete(*id))).await;
        let failures = results.iter().filter(|result| result.is_err()).count();
        if failures > 0 {
            warn!("bulk notification delete: {failures}/{} failed", ids.len());
        }
        self.refresh().await;
    }

    pub async fn mark_read(&self, id: NotificationId) -> bool {
        let newly_read = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match state.entries.get_mut(&id) {
                Some(notification) if !notification.read => {
                    notification.read = true;
                    state.unread = state.unread.saturating_sub(1);
                    true
                }
                _ => false,
            }
        };
        if !newly_read {
            return false;
        }
        self.emit_changed().await;

        if let Err(err) = self.gateway.mark_read(id).await {
            warn!("notification mark-read failed id={}: {err}", id.0);
            self.refresh().await;
        }
        true
    }

    pub async fn mark_all_read(&self) {
        {
            let mut state = self.state.lock().await;
            for notification in state.entries.values_mut() {
                notification.read = true;
            }
            state.unread = 0;
        }
        self.emit_changed().await;

        if let Err(err) = self.gateway.mark_all_read().await {
            warn!("notification mark-all-read failed: {err}");
            self.refresh().await;
        }
    }

    /// Canonical refetch. On failure the previous state stays in place;
    /// notification freshness is not on the critical path.
    pub async fn refresh(&self) {
        let notifications = match self.gateway.list_notifications().await {
            Ok(notifications) => notifications,
            Err(err) => {
                debug!("notification list refetch failed: {err}");
                return;
            }
        };
        let unread = match self.gateway.unread_count().await {
            Ok(unread) => unread,
            Err(err) => {
                debug!("unread count refetch failed: {err}");
                return;
            }
        };

        {
            let mut state = self.state.lock().await;
            // Items staged for deletion stay hidden even though the server
            // still reports them.
            let staged_ids: HashSet<NotificationId> = state.staged.keys().copied().collect();
            let staged_unread = state
                .staged
                .values()
                .filter(|staged| staged.was_unread)
                .count() as u32;
            state.entries = notifications
                .into_iter()
                .filter(|notification| !staged_ids.contains(&notification.notification_id))
                .map(|notification| (notification.notification_id, notification))
                .collect();
            state.unread = unread.saturating_sub(staged_unread);
        }
        self.emit_changed().await;
    }

    /// Every dispatched batch triggers the canonical refetch.
    pub async fn apply_update(&self, update: &DispatchedUpdate) {
        if update.refresh_needed || !update.notifications.is_empty() {
            self.refresh().await;
        }
    }

    async fn emit_changed(&self) {
        let unread = self.state.lock().await.unread;
        let _ = self.events.send(ClientEvent::InboxChanged { unread });
    }
}

#[cfg(test)]
#[path = "tests/inbox_tests.rs"]
mod tests;
