use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::task::JoinHandle;

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Cancellable one-shot timers keyed by owner-chosen ids. Arming a key that
/// already holds a timer replaces it; the old timer never fires. Each slot
/// carries a generation so a timer that fires concurrently with a re-arm
/// cannot evict its replacement.
pub(crate) struct TimerRegistry<K> {
    slots: Arc<Mutex<HashMap<K, Slot>>>,
    generation: Arc<AtomicU64>,
    /// Cloned only by `Clone`, never by timer tasks, so `Drop` can tell the
    /// last registry handle apart from in-flight timers.
    owners: Arc<()>,
}

impl<K> Clone for TimerRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            generation: Arc::clone(&self.generation),
            owners: Arc::clone(&self.owners),
        }
    }
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            owners: Arc::new(()),
        }
    }

    /// Runs `action` once `delay` elapses, unless the key is cancelled or
    /// re-armed first.
    pub fn arm<F>(&self, key: K, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.slots);
        let slot_key = key.clone();

        let mut guard = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
                match slots.get(&slot_key) {
                    Some(slot) if slot.generation == generation => {
                        slots.remove(&slot_key);
                    }
                    _ => return,
                }
            }
            action.await;
        });
        if let Some(previous) = guard.insert(key, Slot { generation, handle }) {
            previous.handle.abort();
        }
    }

    pub fn cancel(&self, key: &K) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        match slots.remove(key) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_armed(&self, key: &K) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

impl<K> Drop for TimerRegistry<K> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.owners) > 1 {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
    }
}
