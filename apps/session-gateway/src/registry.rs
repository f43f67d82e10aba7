use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::handle::SessionHandle;
use crate::metrics::LIVE_SESSIONS;

type Slot = Arc<AsyncMutex<Option<Arc<SessionHandle>>>>;

/// Process-wide map of live session handles.
///
/// Every identifier gets its own async lock ("slot"). Anything that creates,
/// replaces or removes the handle for an id holds that slot for the whole
/// operation, so work on one id is serialized while other ids proceed
/// untouched. Reads go through a separate map and never wait on a slot.
#[derive(Default)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    live: RwLock<HashMap<String, Arc<SessionHandle>>>,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub async fn lock(&self, session_id: &str) -> SlotGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(session_id.to_string()).or_default())
        };
        let guard = Arc::clone(&slot).lock_owned().await;
        SlotGuard {
            registry: self,
            session_id: session_id.to_string(),
            slot,
            guard,
        }
    }

    /// Returns the registered handle, or registers the one built by `create`.
    /// The flag is true when `create` ran.
    pub async fn get_or_create<F>(&self, session_id: &str, create: F) -> (Arc<SessionHandle>, bool)
    where
        F: FnOnce() -> Arc<SessionHandle>,
    {
        let mut slot = self.lock(session_id).await;
        if let Some(existing) = slot.current() {
            return (existing, false);
        }
        let handle = create();
        slot.install(Arc::clone(&handle));
        (handle, true)
    }

    /// Unregisters the handle for `session_id`, if any. Idempotent.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.lock(session_id).await.take()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.live.read().get(session_id).cloned()
    }

    /// Snapshot of the registered handles, in no particular order.
    pub fn list(&self) -> std::vec::IntoIter<Arc<SessionHandle>> {
        let handles: Vec<Arc<SessionHandle>> = self.live.read().values().cloned().collect();
        handles.into_iter()
    }

    pub fn ids(&self) -> Vec<String> {
        self.live.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.live.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one identifier's registration.
pub struct SlotGuard<'a> {
    registry: &'a SessionRegistry,
    session_id: String,
    slot: Slot,
    guard: OwnedMutexGuard<Option<Arc<SessionHandle>>>,
}

impl SlotGuard<'_> {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current(&self) -> Option<Arc<SessionHandle>> {
        (*self.guard).clone()
    }

    pub fn install(&mut self, handle: Arc<SessionHandle>) {
        let mut live = self.registry.live.write();
        live.insert(self.session_id.clone(), Arc::clone(&handle));
        LIVE_SESSIONS.set(live.len() as i64);
        *self.guard = Some(handle);
    }

    pub fn take(&mut self) -> Option<Arc<SessionHandle>> {
        let taken = self.guard.take();
        if taken.is_some() {
            let mut live = self.registry.live.write();
            live.remove(&self.session_id);
            LIVE_SESSIONS.set(live.len() as i64);
        }
        taken
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            return;
        }
        // Empty slot nobody else is waiting on: the map, the guard and
        // `self.slot` are the only owners.
        let mut slots = self.registry.slots.lock();
        if Arc::strong_count(&self.slot) <= 3 {
            if let Some(existing) = slots.get(&self.session_id) {
                if Arc::ptr_eq(existing, &self.slot) {
                    slots.remove(&self.session_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_slots_are_released() {
        let registry = SessionRegistry::new();
        {
            let slot = registry.lock("alice").await;
            assert!(slot.current().is_none());
        }
        assert!(registry.slots.lock().is_empty());
        assert!(registry.remove("alice").await.is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.list().count(), 0);
    }

    #[tokio::test]
    async fn slot_serializes_same_id() {
        let registry = Arc::new(SessionRegistry::new());
        let first = registry.lock("alice").await;
        let contender = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let _slot = registry.lock("alice").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());
        // other ids are not blocked
        drop(registry.lock("bob").await);
        drop(first);
        contender.await.unwrap();
    }

    #[test]
    fn generations_increase() {
        let registry = SessionRegistry::new();
        let a = registry.next_generation();
        let b = registry.next_generation();
        assert!(b > a);
    }
}
