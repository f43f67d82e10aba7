use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::session::{SessionRecord, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Backend(String),
}

/// Durable session records keyed by session id.
///
/// Writes are last-write-wins on `last_updated`: a write carrying an older
/// timestamp than the stored record is dropped without error.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, record: SessionRecord) -> Result<(), StoreError>;

    /// Point update of the state column. Missing records are left missing and
    /// the pairing payload is cleared.
    async fn update_state(
        &self,
        session_id: &str,
        state: SessionState,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    async fn find_all(&self) -> Result<Vec<SessionRecord>, StoreError>;
}

/// In-memory adapter for tests and local runs.
#[derive(Default)]
pub struct InMemorySessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn upsert(&self, record: SessionRecord) -> Result<(), StoreError> {
        let mut guard = self.records.lock().await;
        match guard.get_mut(&record.session_id) {
            Some(existing) if existing.last_updated > record.last_updated => {}
            Some(existing) => *existing = record,
            None => {
                guard.insert(record.session_id.clone(), record);
            }
        }
        Ok(())
    }

    async fn update_state(
        &self,
        session_id: &str,
        state: SessionState,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut guard = self.records.lock().await;
        if let Some(existing) = guard.get_mut(session_id) {
            if existing.last_updated <= at {
                existing.state = state;
                existing.pairing_payload = None;
                existing.last_updated = at;
            }
        }
        Ok(())
    }

    async fn find_by_id(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.records.lock().await.get(session_id).cloned())
    }

    async fn find_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut records: Vec<SessionRecord> = self.records.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn upsert_keeps_newest_write() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        store
            .upsert(SessionRecord::new(
                "alice",
                SessionState::Connected,
                None,
                now,
            ))
            .await
            .unwrap();
        // a late write from an older event must not win
        store
            .upsert(SessionRecord::new(
                "alice",
                SessionState::QrNeeded,
                Some("old-qr".into()),
                now - Duration::milliseconds(5),
            ))
            .await
            .unwrap();
        let record = store.find_by_id("alice").await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Connected);
        assert_eq!(record.pairing_payload, None);
    }

    #[tokio::test]
    async fn update_state_is_a_point_update() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        store
            .update_state("ghost", SessionState::Disconnected, now)
            .await
            .unwrap();
        assert!(store.find_by_id("ghost").await.unwrap().is_none());

        store
            .upsert(SessionRecord::new(
                "bob",
                SessionState::QrNeeded,
                Some("XYZ".into()),
                now,
            ))
            .await
            .unwrap();
        store
            .update_state(
                "bob",
                SessionState::Disconnected,
                now + Duration::milliseconds(1),
            )
            .await
            .unwrap();
        let record = store.find_by_id("bob").await.unwrap().unwrap();
        assert_eq!(record.state, SessionState::Disconnected);
        assert_eq!(record.pairing_payload, None);
    }

    #[tokio::test]
    async fn lists_records_by_id() {
        let store = InMemorySessionStore::new();
        for id in ["carol", "alice", "bob"] {
            store
                .upsert(SessionRecord::new(id, SessionState::Init, None, Utc::now()))
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }
}
