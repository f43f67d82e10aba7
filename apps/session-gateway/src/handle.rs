//! One live session: the channel client it owns, the state machine that
//! reacts to the client's events, and the timers that ask the manager for
//! maintenance restarts and startup retries.
//!
//! All inputs for a handle (client events, the outcome of `initialize`,
//! timer deadlines, cancellation) are consumed by a single driver task, so
//! transitions for one session are applied strictly in arrival order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use gateway_sdk::{SessionRecord, SessionState, SessionStatus};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{
    ChannelClient, ChannelClientFactory, ClientError, ClientEvent, ClientSpec, EventSink,
    MediaPayload,
};
use crate::error::SessionError;
use crate::metrics;
use crate::policy::LifecyclePolicy;
use crate::store::RecordSync;

#[derive(Debug)]
pub(crate) enum HandleInput {
    Client(ClientEvent),
    Startup(Result<(), ClientError>),
}

/// Work a handle cannot do on its own because it needs the registry slot.
/// Each request names the generation that raised it; stale ones are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleRequest {
    Maintenance { session_id: String, generation: u64 },
    Retry { session_id: String, generation: u64, failures: u32 },
    Retire { session_id: String, generation: u64 },
}

impl LifecycleRequest {
    pub fn session_id(&self) -> &str {
        match self {
            LifecycleRequest::Maintenance { session_id, .. }
            | LifecycleRequest::Retry { session_id, .. }
            | LifecycleRequest::Retire { session_id, .. } => session_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            LifecycleRequest::Maintenance { generation, .. }
            | LifecycleRequest::Retry { generation, .. }
            | LifecycleRequest::Retire { generation, .. } => *generation,
        }
    }
}

/// Shared collaborators every handle is spawned with.
#[derive(Clone)]
pub(crate) struct HandleContext {
    pub sync: RecordSync,
    pub policy: LifecyclePolicy,
    pub lifecycle: mpsc::UnboundedSender<LifecycleRequest>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    state: SessionState,
    pairing_payload: Option<String>,
    last_updated: DateTime<Utc>,
}

pub struct SessionHandle {
    session_id: String,
    generation: u64,
    client: Arc<dyn ChannelClient>,
    snapshot: RwLock<Snapshot>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl SessionHandle {
    /// Builds the client and starts the driver. Returns before the client has
    /// finished initializing.
    pub(crate) fn spawn(
        ctx: HandleContext,
        factory: &dyn ChannelClientFactory,
        spec: ClientSpec,
        generation: u64,
        failures: u32,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = spec.session_id.clone();
        let client = factory.build(spec, EventSink::new(tx.clone()));
        let handle = Arc::new(Self {
            session_id,
            generation,
            client,
            snapshot: RwLock::new(Snapshot {
                state: SessionState::Init,
                pairing_payload: None,
                last_updated: Utc::now(),
            }),
            cancel: CancellationToken::new(),
            driver: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });
        let driver = Driver {
            handle: Arc::clone(&handle),
            inbox: rx,
            inbox_tx: tx,
            ctx,
            failures,
            starting: false,
            maintenance_at: None,
            retry_at: None,
            init_task: None,
        };
        *handle.driver.lock() = Some(tokio::spawn(driver.run()));
        handle
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.read().state
    }

    pub fn record(&self) -> SessionRecord {
        let snapshot = self.snapshot.read();
        SessionRecord::new(
            self.session_id.clone(),
            snapshot.state,
            snapshot.pairing_payload.clone(),
            snapshot.last_updated,
        )
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_record(self.record(), true)
    }

    pub fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Connected => Ok(()),
            state => Err(SessionError::SessionNotReady {
                session_id: self.session_id.clone(),
                state,
            }),
        }
    }

    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, SessionError> {
        self.ensure_ready()?;
        self.client.send_text(chat_id, text).await.map_err(|err| {
            warn!(session_id = %self.session_id, chat_id, error = %err, "text send failed");
            SessionError::SendFailure(err.to_string())
        })
    }

    pub async fn send_media(
        &self,
        chat_id: &str,
        media: MediaPayload,
        caption: Option<&str>,
    ) -> Result<String, SessionError> {
        self.ensure_ready()?;
        self.client
            .send_media(chat_id, media, caption)
            .await
            .map_err(|err| {
                warn!(session_id = %self.session_id, chat_id, error = %err, "media send failed");
                SessionError::SendFailure(err.to_string())
            })
    }

    /// Stops the driver (aborting an in-flight `initialize`) and flips the
    /// in-memory state to `DISCONNECTED`. Returns the time of that change.
    pub(crate) async fn stop(&self) -> DateTime<Utc> {
        self.cancel.cancel();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                if err.is_panic() {
                    error!(session_id = %self.session_id, "session driver panicked");
                }
            }
        }
        let mut snapshot = self.snapshot.write();
        snapshot.state = SessionState::Disconnected;
        snapshot.pairing_payload = None;
        snapshot.last_updated = Utc::now();
        snapshot.last_updated
    }

    /// Tears the client down exactly once. Failures and timeouts are logged
    /// and counted, never returned.
    pub(crate) async fn teardown(&self, timeout: Duration) -> bool {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        let outcome = tokio::time::timeout(timeout, self.client.destroy()).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!("timed out after {}ms", timeout.as_millis())),
        };
        match failure {
            None => {
                debug!(session_id = %self.session_id, generation = self.generation, "client torn down");
                true
            }
            Some(reason) => {
                metrics::TEARDOWN_FAILURES.inc();
                warn!(
                    session_id = %self.session_id,
                    generation = self.generation,
                    error = %reason,
                    "client teardown failed"
                );
                false
            }
        }
    }
}

/// What a client event does to the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Move {
        state: SessionState,
        pairing_payload: Option<String>,
    },
    /// Already there with the same payload; nothing to write.
    Unchanged,
    /// Not meaningful in the current state.
    Ignore,
}

pub(crate) fn transition(
    current: SessionState,
    current_payload: Option<&str>,
    event: &ClientEvent,
) -> Step {
    use SessionState::*;
    match (event, current) {
        (ClientEvent::Qr(payload), QrNeeded) if current_payload == Some(payload.as_str()) => {
            Step::Unchanged
        }
        (ClientEvent::Qr(payload), Init | QrNeeded) => Step::Move {
            state: QrNeeded,
            pairing_payload: Some(payload.clone()),
        },
        (ClientEvent::Qr(_), _) => Step::Ignore,
        (ClientEvent::Ready, Init | QrNeeded) => Step::Move {
            state: Connected,
            pairing_payload: None,
        },
        (ClientEvent::Ready, _) => Step::Ignore,
        (ClientEvent::AuthFailure, AuthFailed) => Step::Unchanged,
        (ClientEvent::AuthFailure, _) => Step::Move {
            state: AuthFailed,
            pairing_payload: None,
        },
        (ClientEvent::Disconnected, Disconnected) => Step::Unchanged,
        (ClientEvent::Disconnected, _) => Step::Move {
            state: Disconnected,
            pairing_payload: None,
        },
    }
}

struct Driver {
    handle: Arc<SessionHandle>,
    inbox: mpsc::UnboundedReceiver<HandleInput>,
    inbox_tx: mpsc::UnboundedSender<HandleInput>,
    ctx: HandleContext,
    /// Startup failures in a row, carried over from a retried predecessor.
    failures: u32,
    /// Set while `initialize` is in flight and the session has neither
    /// connected nor failed authentication. A disconnect does not clear it.
    starting: bool,
    maintenance_at: Option<Instant>,
    retry_at: Option<Instant>,
    init_task: Option<JoinHandle<()>>,
}

impl Driver {
    async fn run(mut self) {
        self.ctx.sync.upsert(self.handle.record()).await;
        if !self.handle.cancel.is_cancelled() {
            self.start_client();
        }
        loop {
            tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => break,
                Some(input) = self.inbox.recv() => match input {
                    HandleInput::Client(event) => self.on_event(event).await,
                    HandleInput::Startup(result) => self.on_startup(result).await,
                },
                _ = deadline(self.maintenance_at) => {
                    self.maintenance_at = None;
                    metrics::MAINTENANCE_FIRED.inc();
                    info!(session_id = %self.handle.session_id, "maintenance interval elapsed");
                    self.request(LifecycleRequest::Maintenance {
                        session_id: self.handle.session_id.clone(),
                        generation: self.handle.generation,
                    });
                }
                _ = deadline(self.retry_at) => {
                    self.retry_at = None;
                    self.request(LifecycleRequest::Retry {
                        session_id: self.handle.session_id.clone(),
                        generation: self.handle.generation,
                        failures: self.failures,
                    });
                }
            }
        }
        if let Some(task) = self.init_task.take() {
            task.abort();
        }
    }

    fn start_client(&mut self) {
        let client = Arc::clone(&self.handle.client);
        let tx = self.inbox_tx.clone();
        let session_id = self.handle.session_id.clone();
        self.starting = true;
        self.init_task = Some(tokio::spawn(async move {
            debug!(session_id = %session_id, "initializing channel client");
            let result = client.initialize().await;
            let _ = tx.send(HandleInput::Startup(result));
        }));
    }

    async fn on_event(&mut self, event: ClientEvent) {
        let (current, payload) = {
            let snapshot = self.handle.snapshot.read();
            (snapshot.state, snapshot.pairing_payload.clone())
        };
        match transition(current, payload.as_deref(), &event) {
            Step::Move {
                state,
                pairing_payload,
            } => {
                match state {
                    SessionState::Connected => {
                        self.starting = false;
                        self.failures = 0;
                        self.maintenance_at =
                            Some(Instant::now() + self.ctx.policy.maintenance_interval);
                    }
                    SessionState::Disconnected => self.maintenance_at = None,
                    SessionState::AuthFailed => self.starting = false,
                    _ => {}
                }
                self.apply(state, pairing_payload).await;
            }
            Step::Unchanged => {
                if event == ClientEvent::Disconnected {
                    self.maintenance_at = None;
                }
            }
            Step::Ignore => {
                debug!(
                    session_id = %self.handle.session_id,
                    state = %current,
                    event = ?event,
                    "ignoring client event"
                );
            }
        }
    }

    async fn on_startup(&mut self, result: Result<(), ClientError>) {
        self.init_task = None;
        let starting = std::mem::replace(&mut self.starting, false);
        let err = match result {
            Ok(()) => {
                debug!(session_id = %self.handle.session_id, "channel client initialized");
                return;
            }
            Err(err) => err,
        };
        metrics::STARTUP_FAILURES
            .with_label_values(&[err.class()])
            .inc();
        let current = self.handle.state();
        if !starting {
            warn!(
                session_id = %self.handle.session_id,
                state = %current,
                error = %err,
                "startup failure after session left startup; ignoring"
            );
            return;
        }
        self.failures += 1;
        self.maintenance_at = None;
        // a disconnect event may have beaten the startup result here
        if current != SessionState::Disconnected {
            self.apply(SessionState::Disconnected, None).await;
        }
        if err.is_transient() && self.ctx.policy.should_retry(self.failures) {
            warn!(
                session_id = %self.handle.session_id,
                failures = self.failures,
                retry_in_ms = self.ctx.policy.retry_delay.as_millis() as u64,
                error = %err,
                "channel client failed to start; retrying"
            );
            self.retry_at = Some(Instant::now() + self.ctx.policy.retry_delay);
        } else {
            error!(
                session_id = %self.handle.session_id,
                failures = self.failures,
                transient = err.is_transient(),
                error = %err,
                "channel client failed to start; giving up"
            );
            self.request(LifecycleRequest::Retire {
                session_id: self.handle.session_id.clone(),
                generation: self.handle.generation,
            });
        }
    }

    async fn apply(&mut self, state: SessionState, pairing_payload: Option<String>) {
        let record = {
            let mut snapshot = self.handle.snapshot.write();
            snapshot.state = state;
            snapshot.pairing_payload = pairing_payload;
            snapshot.last_updated = Utc::now();
            SessionRecord::new(
                self.handle.session_id.clone(),
                snapshot.state,
                snapshot.pairing_payload.clone(),
                snapshot.last_updated,
            )
        };
        metrics::STATE_TRANSITIONS
            .with_label_values(&[state.as_str()])
            .inc();
        info!(
            session_id = %self.handle.session_id,
            generation = self.handle.generation,
            state = %state,
            "session state changed"
        );
        self.ctx.sync.upsert(record).await;
    }

    fn request(&self, request: LifecycleRequest) {
        if self.ctx.lifecycle.send(request).is_err() {
            debug!(session_id = %self.handle.session_id, "lifecycle scheduler stopped; dropping request");
        }
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
