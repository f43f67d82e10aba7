//! In-process channel clients with scripted behavior, for tests and local
//! experiments without a browser.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{
    ChannelClient, ChannelClientFactory, ClientError, ClientEvent, ClientSpec, EventSink,
    MediaPayload,
};

/// How a scripted client's `initialize` call ends.
#[derive(Debug, Clone)]
pub enum StartupOutcome {
    Succeed,
    Fail(ClientError),
    /// Emits `disconnected` and then fails, the way a helper process that
    /// dies mid-startup reports itself.
    FailAfterDisconnect(ClientError),
    /// Never returns; used to observe close/restart during startup.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentItem {
    Text {
        chat_id: String,
        text: String,
    },
    Media {
        chat_id: String,
        media: MediaPayload,
        caption: Option<String>,
    },
}

pub struct ScriptedClient {
    spec: ClientSpec,
    events: EventSink,
    startup: StartupOutcome,
    fail_destroy: bool,
    fail_sends: AtomicBool,
    initialized: AtomicUsize,
    destroyed: AtomicUsize,
    sent: Mutex<Vec<SentItem>>,
}

impl ScriptedClient {
    pub fn spec(&self) -> &ClientSpec {
        &self.spec
    }

    /// Pushes an event as if the messaging network had produced it.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.events.emit(event)
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentItem> {
        self.sent.lock().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn next_message_id(&self, sent: &[SentItem]) -> String {
        format!("msg-{}-{}", self.spec.session_id, sent.len())
    }
}

#[async_trait]
impl ChannelClient for ScriptedClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        self.initialized.fetch_add(1, Ordering::SeqCst);
        match &self.startup {
            StartupOutcome::Succeed => Ok(()),
            StartupOutcome::Fail(err) => Err(err.clone()),
            StartupOutcome::FailAfterDisconnect(err) => {
                self.events.emit(ClientEvent::Disconnected);
                Err(err.clone())
            }
            StartupOutcome::Hang => std::future::pending().await,
        }
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ClientError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected("scripted send failure".into()));
        }
        let mut sent = self.sent.lock();
        sent.push(SentItem::Text {
            chat_id: chat_id.to_string(),
            text: text.to_string(),
        });
        Ok(self.next_message_id(&sent))
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: MediaPayload,
        caption: Option<&str>,
    ) -> Result<String, ClientError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected("scripted send failure".into()));
        }
        let mut sent = self.sent.lock();
        sent.push(SentItem::Media {
            chat_id: chat_id.to_string(),
            media,
            caption: caption.map(str::to_string),
        });
        Ok(self.next_message_id(&sent))
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(ClientError::Io("scripted teardown failure".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    built: HashMap<String, Vec<Arc<ScriptedClient>>>,
    startups: VecDeque<StartupOutcome>,
    default_startup: Option<StartupOutcome>,
    fail_destroy: bool,
}

/// Builds [`ScriptedClient`]s and remembers every one of them.
#[derive(Default)]
pub struct ScriptedClientFactory {
    state: Mutex<FactoryState>,
}

impl ScriptedClientFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues startup outcomes for the next clients built, in order.
    pub fn script_startups(&self, outcomes: impl IntoIterator<Item = StartupOutcome>) {
        self.state.lock().startups.extend(outcomes);
    }

    pub fn fail_next_startups(&self, count: usize, err: ClientError) {
        self.script_startups((0..count).map(|_| StartupOutcome::Fail(err.clone())));
    }

    /// Outcome for clients built once the queue is empty (default: succeed).
    pub fn set_default_startup(&self, outcome: StartupOutcome) {
        self.state.lock().default_startup = Some(outcome);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state.lock().fail_destroy = fail;
    }

    pub fn built(&self, session_id: &str) -> usize {
        self.state
            .lock()
            .built
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn clients(&self, session_id: &str) -> Vec<Arc<ScriptedClient>> {
        self.state
            .lock()
            .built
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn latest(&self, session_id: &str) -> Option<Arc<ScriptedClient>> {
        self.state
            .lock()
            .built
            .get(session_id)
            .and_then(|clients| clients.last().cloned())
    }
}

impl ChannelClientFactory for ScriptedClientFactory {
    fn build(&self, spec: ClientSpec, events: EventSink) -> Arc<dyn ChannelClient> {
        let mut state = self.state.lock();
        let startup = state
            .startups
            .pop_front()
            .or_else(|| state.default_startup.clone())
            .unwrap_or(StartupOutcome::Succeed);
        let client = Arc::new(ScriptedClient {
            spec: spec.clone(),
            events,
            startup,
            fail_destroy: state.fail_destroy,
            fail_sends: AtomicBool::new(false),
            initialized: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        });
        state
            .built
            .entry(spec.session_id)
            .or_default()
            .push(Arc::clone(&client));
        client
    }
}
