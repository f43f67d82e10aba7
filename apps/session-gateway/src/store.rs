use std::sync::Arc;

use chrono::{DateTime, Utc};
use gateway_sdk::{InMemorySessionStore, SessionRecord, SessionState, SessionStore};
use tracing::{info, warn};

use crate::config::{AppConfig, StoreBackend};
use crate::metrics::{PERSIST_ERROR, PERSIST_SUCCESS};
use crate::store_postgres::PostgresSessionStore;
use crate::store_redis::RedisSessionStore;

/// Best-effort writer used on the state-transition path. A failed write is
/// logged and counted; in-memory state stays authoritative.
#[derive(Clone)]
pub struct RecordSync {
    store: Arc<dyn SessionStore>,
}

impl RecordSync {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub async fn upsert(&self, record: SessionRecord) {
        let session_id = record.session_id.clone();
        let state = record.state;
        match self.store.upsert(record).await {
            Ok(()) => PERSIST_SUCCESS.with_label_values(&["upsert"]).inc(),
            Err(err) => {
                PERSIST_ERROR.with_label_values(&["upsert"]).inc();
                warn!(session_id = %session_id, state = %state, error = %err, "session upsert failed");
            }
        }
    }

    pub async fn mark_disconnected(&self, session_id: &str, at: DateTime<Utc>) {
        match self
            .store
            .update_state(session_id, SessionState::Disconnected, at)
            .await
        {
            Ok(()) => PERSIST_SUCCESS.with_label_values(&["update_state"]).inc(),
            Err(err) => {
                PERSIST_ERROR.with_label_values(&["update_state"]).inc();
                warn!(session_id = %session_id, error = %err, "marking session disconnected failed");
            }
        }
    }
}

/// Picks the configured backend, falling back to memory when it cannot be
/// reached at boot.
pub async fn build_store(cfg: &AppConfig) -> Arc<dyn SessionStore> {
    match cfg.store_backend {
        StoreBackend::Postgres => {
            if let Some(url) = cfg.database_url.as_deref() {
                match PostgresSessionStore::connect(url).await {
                    Ok(store) => {
                        info!("using postgres session store");
                        return Arc::new(store);
                    }
                    Err(err) => {
                        warn!(error = %err, "postgres session store unavailable; falling back to memory")
                    }
                }
            } else {
                warn!("postgres store selected but DATABASE_URL unset; falling back to memory");
            }
        }
        StoreBackend::Redis => {
            if let Some(url) = cfg.redis_url.as_deref() {
                match RedisSessionStore::connect(url).await {
                    Ok(store) => {
                        info!("using redis session store");
                        return Arc::new(store);
                    }
                    Err(err) => {
                        warn!(error = %err, "redis session store unavailable; falling back to memory")
                    }
                }
            } else {
                warn!("redis store selected but REDIS_URL unset; falling back to memory");
            }
        }
        StoreBackend::InMemory => {}
    }
    InMemorySessionStore::new()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use gateway_sdk::StoreError;

    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn upsert(&self, _record: SessionRecord) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }

        async fn update_state(
            &self,
            _session_id: &str,
            _state: SessionState,
            _at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }

        async fn find_by_id(&self, _session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }

        async fn find_all(&self) -> Result<Vec<SessionRecord>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
    }

    #[tokio::test]
    async fn failed_writes_are_counted_not_raised() {
        let sync = RecordSync::new(Arc::new(BrokenStore));
        let before = PERSIST_ERROR.with_label_values(&["upsert"]).get();
        sync.upsert(SessionRecord::new(
            "alice",
            SessionState::Init,
            None,
            Utc::now(),
        ))
        .await;
        sync.mark_disconnected("alice", Utc::now()).await;
        assert!(PERSIST_ERROR.with_label_values(&["upsert"]).get() > before);
    }

    #[tokio::test]
    async fn memory_backend_needs_no_urls() {
        let cfg = AppConfig::from_lookup(|_| None).unwrap();
        let store = build_store(&cfg).await;
        assert!(store.find_all().await.unwrap().is_empty());
    }
}
