//! Contract between the lifecycle manager and the external automation client
//! that actually talks to the messaging network.
//!
//! A client is constructed synchronously and cheaply; `initialize` does the
//! slow work (launching the browser, restoring auth) and may take minutes.
//! Lifecycle events are pushed into the [`EventSink`] handed over at
//! construction time.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::handle::HandleInput;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Qr(String),
    Ready,
    AuthFailure,
    Disconnected,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to launch client: {0}")]
    LaunchFailed(String),
    #[error("Session closed: {0}")]
    SessionClosed(String),
    #[error("client rejected request: {0}")]
    Rejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
}

impl ClientError {
    /// Failures worth one automatic retry: the browser never came up, or it
    /// went away underneath the client.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::LaunchFailed(_) | ClientError::SessionClosed(_) => true,
            ClientError::Rejected(msg) | ClientError::Protocol(msg) | ClientError::Io(msg) => {
                msg.contains("Failed to launch") || msg.contains("Session closed")
            }
        }
    }

    pub fn class(&self) -> &'static str {
        if self.is_transient() {
            "transient"
        } else {
            "fatal"
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

/// Where a client pushes its lifecycle events. Events land in the same
/// ordered inbox as the startup outcome of the owning handle.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<HandleInput>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<HandleInput>) -> Self {
        Self { tx }
    }

    /// Returns false once the owning handle is gone.
    pub fn emit(&self, event: ClientEvent) -> bool {
        self.tx.send(HandleInput::Client(event)).is_ok()
    }
}

/// Persistent login material for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthProfile {
    pub client_id: String,
    pub data_path: PathBuf,
}

pub const DEFAULT_BROWSER_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-extensions",
    "--disable-background-timer-throttling",
    "--disable-renderer-backgrounding",
    "--disable-software-rasterizer",
    "--disable-dev-tools",
    "--mute-audio",
    "--hide-scrollbars",
    "--no-first-run",
    "--no-zygote",
    "--disable-infobars",
    "--disable-notifications",
    "--disable-features=site-per-process,TranslateUI,BlinkGenPropertyTrees",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub executable_path: PathBuf,
    pub headless: bool,
    pub args: Vec<String>,
    pub takeover_timeout_ms: u64,
    /// Parent of the per-launch browser profile directories.
    pub profile_root: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            executable_path: PathBuf::from("/usr/bin/chromium"),
            headless: true,
            args: DEFAULT_BROWSER_ARGS.iter().map(|a| a.to_string()).collect(),
            takeover_timeout_ms: 120_000,
            profile_root: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub session_id: String,
    pub auth: AuthProfile,
    pub engine: EngineOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
    pub filename: Option<String>,
}

#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn initialize(&self) -> Result<(), ClientError>;

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ClientError>;

    async fn send_media(
        &self,
        chat_id: &str,
        media: MediaPayload,
        caption: Option<&str>,
    ) -> Result<String, ClientError>;

    async fn destroy(&self) -> Result<(), ClientError>;
}

pub trait ChannelClientFactory: Send + Sync {
    fn build(&self, spec: ClientSpec, events: EventSink) -> Arc<dyn ChannelClient>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ClientError::LaunchFailed("chromium missing".into()).is_transient());
        assert!(ClientError::SessionClosed("target gone".into()).is_transient());
        assert!(
            ClientError::Protocol("Protocol error: Session closed. Most likely".into())
                .is_transient()
        );
        assert!(!ClientError::Rejected("bad credentials".into()).is_transient());
        assert_eq!(ClientError::Io("broken pipe".into()).class(), "fatal");
    }
}
