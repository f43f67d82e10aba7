//! The session facade: the only entry point HTTP handlers (and tests) use.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use gateway_sdk::{InitResponse, SentMessage, SessionStatus, SessionStore, SessionSummary};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{AuthProfile, ChannelClientFactory, ClientSpec, EngineOptions};
use crate::error::{SessionError, require_non_empty, validate_session_id};
use crate::handle::{HandleContext, LifecycleRequest, SessionHandle};
use crate::media::{self, MediaRequest};
use crate::metrics;
use crate::policy::LifecyclePolicy;
use crate::registry::{SessionRegistry, SlotGuard};
use crate::scheduler::{LifecycleHandler, LifecycleScheduler};
use crate::store::RecordSync;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub policy: LifecyclePolicy,
    /// Root of the persistent per-session auth data.
    pub auth_dir: PathBuf,
    pub engine: EngineOptions,
    /// Largest URL or file media the gateway will load.
    pub max_media_bytes: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            policy: LifecyclePolicy::default(),
            auth_dir: PathBuf::from(".session_auth"),
            engine: EngineOptions::default(),
            max_media_bytes: media::DEFAULT_MAX_MEDIA_BYTES,
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
    scheduler: Arc<LifecycleScheduler>,
}

pub(crate) struct ManagerInner {
    registry: SessionRegistry,
    sync: RecordSync,
    factory: Arc<dyn ChannelClientFactory>,
    options: ManagerOptions,
    lifecycle: mpsc::UnboundedSender<LifecycleRequest>,
    http: reqwest::Client,
    shutdown: CancellationToken,
}

impl SessionManager {
    /// Must be called inside a tokio runtime; the lifecycle scheduler is
    /// spawned here.
    pub fn new(
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn ChannelClientFactory>,
        options: ManagerOptions,
    ) -> Self {
        let (lifecycle, requests) = LifecycleScheduler::channel();
        let inner = Arc::new(ManagerInner {
            registry: SessionRegistry::new(),
            sync: RecordSync::new(store),
            factory,
            options,
            lifecycle,
            http: reqwest::Client::new(),
            shutdown: CancellationToken::new(),
        });
        let scheduler = LifecycleScheduler::spawn(Arc::downgrade(&inner), requests);
        Self {
            inner,
            scheduler: Arc::new(scheduler),
        }
    }

    /// Boot reconciliation: records left in a live state by a previous
    /// process are marked `DISCONNECTED`. Returns how many were rewritten.
    pub async fn start(&self) -> Result<usize, SessionError> {
        let records = self.inner.sync.store().find_all().await?;
        let mut reconciled = 0;
        for record in records.into_iter().filter(|r| r.state.is_live()) {
            let slot = self.inner.registry.lock(&record.session_id).await;
            if slot.current().is_some() {
                continue;
            }
            self.inner
                .sync
                .mark_disconnected(&record.session_id, Utc::now())
                .await;
            reconciled += 1;
        }
        info!(reconciled, "session records reconciled");
        Ok(reconciled)
    }

    /// Creates the session if it is not live yet. Does not wait for the
    /// client to connect.
    pub async fn init(&self, session_id: &str) -> Result<InitResponse, SessionError> {
        let session_id = validate_session_id(session_id)?;
        let (handle, created) = self
            .inner
            .registry
            .get_or_create(session_id, || self.inner.spawn_handle(session_id, 0))
            .await;
        if created {
            info!(session_id = %session_id, generation = handle.generation(), "session created");
        }
        Ok(InitResponse {
            session_id: session_id.to_string(),
            created,
            state: handle.state(),
        })
    }

    pub async fn restart(&self, session_id: &str) -> Result<InitResponse, SessionError> {
        let session_id = validate_session_id(session_id)?;
        let mut slot = self.inner.registry.lock(session_id).await;
        self.inner.close_slot(&mut slot).await;
        let handle = self.inner.spawn_handle(session_id, 0);
        slot.install(Arc::clone(&handle));
        info!(session_id = %session_id, generation = handle.generation(), "session restarted");
        Ok(InitResponse {
            session_id: session_id.to_string(),
            created: true,
            state: handle.state(),
        })
    }

    /// Destroys the live handle if there is one and marks the record
    /// `DISCONNECTED`. Returns whether a live handle was closed.
    pub async fn close(&self, session_id: &str) -> Result<bool, SessionError> {
        let session_id = validate_session_id(session_id)?;
        let mut slot = self.inner.registry.lock(session_id).await;
        let closed = self.inner.close_slot(&mut slot).await;
        if !closed {
            self.inner
                .sync
                .mark_disconnected(session_id, Utc::now())
                .await;
        }
        Ok(closed)
    }

    pub async fn status(&self, session_id: &str) -> Result<SessionStatus, SessionError> {
        let session_id = validate_session_id(session_id)?;
        if let Some(handle) = self.inner.registry.get(session_id) {
            return Ok(handle.status());
        }
        match self.inner.sync.store().find_by_id(session_id).await? {
            Some(record) => Ok(SessionStatus::from_record(record, false)),
            None => Err(SessionError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Durable records merged with live handles; live state wins.
    pub async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let records = self.inner.sync.store().find_all().await?;
        let mut merged: BTreeMap<String, SessionSummary> = records
            .iter()
            .map(|r| (r.session_id.clone(), SessionSummary::from_record(r, false)))
            .collect();
        for handle in self.inner.registry.list() {
            let record = handle.record();
            merged.insert(
                record.session_id.clone(),
                SessionSummary::from_record(&record, true),
            );
        }
        Ok(merged.into_values().collect())
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        phone: &str,
        text: &str,
    ) -> Result<SentMessage, SessionError> {
        let session_id = validate_session_id(session_id)?;
        let phone = require_non_empty("phone", phone)?;
        require_non_empty("message", text)?;
        let result = async {
            let handle = self.inner.ready_handle(session_id).await?;
            handle.send_text(&media::chat_id(phone), text).await
        }
        .await;
        self.inner.finish_send("text", session_id, result)
    }

    pub async fn send_media(
        &self,
        session_id: &str,
        request: MediaRequest,
    ) -> Result<SentMessage, SessionError> {
        let session_id = validate_session_id(session_id)?;
        let source = request.validate()?;
        let result = async {
            let handle = self.inner.ready_handle(session_id).await?;
            let max_bytes = self.inner.options.max_media_bytes;
            let payload = media::resolve(source, &self.inner.http, max_bytes).await?;
            let caption = request.caption.as_deref().filter(|c| !c.is_empty());
            handle
                .send_media(&media::chat_id(request.phone.trim()), payload, caption)
                .await
        }
        .await;
        self.inner.finish_send("media", session_id, result)
    }

    /// Stops lifecycle timers and closes every live session.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.scheduler.stop().await;
        let ids = self.inner.registry.ids();
        let count = ids.len();
        join_all(ids.iter().map(|id| async move {
            let mut slot = self.inner.registry.lock(id).await;
            self.inner.close_slot(&mut slot).await;
        }))
        .await;
        info!(closed = count, "session manager shut down");
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }
}

impl ManagerInner {
    fn spawn_handle(&self, session_id: &str, failures: u32) -> Arc<SessionHandle> {
        let spec = ClientSpec {
            session_id: session_id.to_string(),
            auth: AuthProfile {
                client_id: session_id.to_string(),
                data_path: self.options.auth_dir.clone(),
            },
            engine: self.options.engine.clone(),
        };
        let ctx = HandleContext {
            sync: self.sync.clone(),
            policy: self.options.policy.clone(),
            lifecycle: self.lifecycle.clone(),
        };
        metrics::SESSIONS_CREATED.inc();
        SessionHandle::spawn(
            ctx,
            self.factory.as_ref(),
            spec,
            self.registry.next_generation(),
            failures,
        )
    }

    /// Full close of whatever the slot holds: stop the driver, record
    /// `DISCONNECTED`, unregister, then tear the client down.
    async fn close_slot(&self, slot: &mut SlotGuard<'_>) -> bool {
        let Some(handle) = slot.current() else {
            return false;
        };
        let at = handle.stop().await;
        self.sync.mark_disconnected(handle.session_id(), at).await;
        slot.take();
        handle.teardown(self.options.policy.teardown_timeout).await;
        info!(
            session_id = %handle.session_id(),
            generation = handle.generation(),
            "session closed"
        );
        true
    }

    async fn ready_handle(&self, session_id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        if let Some(handle) = self.registry.get(session_id) {
            handle.ensure_ready()?;
            return Ok(handle);
        }
        match self.sync.store().find_by_id(session_id).await? {
            Some(record) => Err(SessionError::SessionNotReady {
                session_id: session_id.to_string(),
                state: record.state,
            }),
            None => Err(SessionError::SessionNotFound(session_id.to_string())),
        }
    }

    fn finish_send(
        &self,
        kind: &str,
        session_id: &str,
        result: Result<String, SessionError>,
    ) -> Result<SentMessage, SessionError> {
        let label = match &result {
            Ok(_) => "ok",
            Err(SessionError::SessionNotReady { .. } | SessionError::SessionNotFound(_)) => {
                "not_ready"
            }
            Err(_) => "failed",
        };
        metrics::MESSAGES_SENT
            .with_label_values(&[kind, label])
            .inc();
        let message_id = result?;
        debug!(session_id = %session_id, kind, message_id = %message_id, "message sent");
        Ok(SentMessage {
            session_id: session_id.to_string(),
            message_id,
        })
    }

    /// Runs a lifecycle request if the handle that raised it is still the
    /// registered one.
    async fn apply_lifecycle(&self, request: LifecycleRequest) {
        let mut slot = self.registry.lock(request.session_id()).await;
        let current = slot.current().map(|h| h.generation());
        if current != Some(request.generation()) {
            debug!(
                session_id = %request.session_id(),
                generation = request.generation(),
                current = ?current,
                "dropping stale lifecycle request"
            );
            return;
        }
        self.close_slot(&mut slot).await;
        let successor_failures = match &request {
            LifecycleRequest::Maintenance { .. } if self.options.policy.restart_on_maintenance => 0,
            LifecycleRequest::Retry { failures, .. } => {
                metrics::STARTUP_RETRIES.inc();
                *failures
            }
            _ => return,
        };
        if self.shutdown.is_cancelled() {
            warn!(session_id = %request.session_id(), "shutting down; not re-creating session");
            return;
        }
        let handle = self.spawn_handle(request.session_id(), successor_failures);
        info!(
            session_id = %request.session_id(),
            generation = handle.generation(),
            failures = successor_failures,
            "session re-created"
        );
        slot.install(handle);
    }
}

#[async_trait]
impl LifecycleHandler for ManagerInner {
    async fn handle(&self, request: LifecycleRequest) {
        self.apply_lifecycle(request).await;
    }
}

#[cfg(test)]
mod tests {
    use gateway_sdk::InMemorySessionStore;

    use super::*;
    use crate::testing::ScriptedClientFactory;

    #[tokio::test]
    async fn validation_happens_before_the_registry() {
        let factory = ScriptedClientFactory::new();
        let manager = SessionManager::new(
            InMemorySessionStore::new(),
            factory.clone(),
            ManagerOptions::default(),
        );
        assert!(matches!(
            manager.init("../x").await,
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            manager.send_message("alice", " ", "hi").await,
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            manager.send_message("alice", "521", "").await,
            Err(SessionError::Validation(_))
        ));
        assert!(matches!(
            manager
                .send_media(
                    "alice",
                    MediaRequest {
                        phone: "521".into(),
                        ..Default::default()
                    }
                )
                .await,
            Err(SessionError::MissingMediaSource)
        ));
        assert_eq!(factory.built("alice"), 0);
        assert_eq!(manager.live_sessions(), 0);
    }

    #[tokio::test]
    async fn sends_never_create_sessions() {
        let factory = ScriptedClientFactory::new();
        let manager = SessionManager::new(
            InMemorySessionStore::new(),
            factory.clone(),
            ManagerOptions::default(),
        );
        assert!(matches!(
            manager.send_message("ghost", "521", "hi").await,
            Err(SessionError::SessionNotFound(_))
        ));
        assert_eq!(factory.built("ghost"), 0);
    }
}
