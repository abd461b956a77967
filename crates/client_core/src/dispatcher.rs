use std::{
    collections::HashMap,
    mem,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use shared::{domain::NotificationId, protocol::NotificationPayload};
use tokio::sync::broadcast;

/// One coalesced batch, emitted once per buffering window to every mounted
/// surface. Not an incremental diff: consumers treat it as "current best
/// known state" and refetch their canonical endpoints, since buffered
/// intermediate counts are not individually trustworthy.
#[derive(Debug, Clone)]
pub struct DispatchedUpdate {
    pub notifications: Vec<NotificationPayload>,
    pub refresh_needed: bool,
}

#[derive(Default)]
struct DispatchBuffer {
    pending: Vec<NotificationPayload>,
    index: HashMap<NotificationId, usize>,
    refresh_only: bool,
    armed: bool,
}

/// Buffers raw server pushes for a short window and releases a single
/// deduplicated `DispatchedUpdate` to all subscribers when it closes.
pub(crate) struct NotificationDispatcher {
    buffer: Mutex<DispatchBuffer>,
    updates: broadcast::Sender<DispatchedUpdate>,
    window: Duration,
}

impl NotificationDispatcher {
    pub fn new(window: Duration, capacity: usize) -> Arc<Self> {
        let (updates, _) = broadcast::channel(capacity);
        Arc::new(Self {
            buffer: Mutex::new(DispatchBuffer::default()),
            updates,
            window,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchedUpdate> {
        self.updates.subscribe()
    }

    /// Buffers one raw push. Repeated pushes for the same notification id
    /// within the window collapse in place, latest state winning.
    pub fn ingest(self: &Arc<Self>, notification: NotificationPayload) {
        let mut guard = self.lock_buffer();
        let buffer = &mut *guard;
        match buffer.index.get(&notification.notification_id) {
            Some(&position) => buffer.pending[position] = notification,
            None => {
                let position = buffer.pending.len();
                buffer.index.insert(notification.notification_id, position);
                buffer.pending.push(notification);
            }
        }
        self.arm_window(buffer);
    }

    /// Buffers a push that carries no notification payload (reaction count
    /// changes and similar), asking surfaces only to refetch.
    pub fn ingest_refresh(self: &Arc<Self>) {
        let mut guard = self.lock_buffer();
        let buffer = &mut *guard;
        buffer.refresh_only = true;
        self.arm_window(buffer);
    }

    fn arm_window(self: &Arc<Self>, buffer: &mut DispatchBuffer) {
        if buffer.armed {
            return;
        }
        buffer.armed = true;
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(dispatcher.window).await;
            dispatcher.flush();
        });
    }

    fn flush(&self) {
        let (notifications, refresh_only) = {
            let mut buffer = self.lock_buffer();
            buffer.armed = false;
            buffer.index.clear();
            (
                mem::take(&mut buffer.pending),
                mem::replace(&mut buffer.refresh_only, false),
            )
        };

        if notifications.is_empty() && !refresh_only {
            return;
        }
        let update = DispatchedUpdate {
            refresh_needed: refresh_only || !notifications.is_empty(),
            notifications,
        };
        let _ = self.updates.send(update);
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, DispatchBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
