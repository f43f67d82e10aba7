//! Channel client backed by a helper process that drives the browser.
//!
//! One child process per session. Requests and responses are correlated by
//! id over newline-delimited JSON on the child's stdin/stdout; lines without
//! an id are lifecycle events. When the child's stdout closes, every pending
//! request fails with [`ClientError::SessionClosed`] and a `disconnected`
//! event is emitted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{
    ChannelClient, ChannelClientFactory, ClientError, ClientEvent, ClientSpec, EventSink,
    MediaPayload,
};

const DESTROY_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BridgeClientFactory {
    command: String,
    args: Vec<String>,
}

impl BridgeClientFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl ChannelClientFactory for BridgeClientFactory {
    fn build(&self, spec: ClientSpec, events: EventSink) -> Arc<dyn ChannelClient> {
        Arc::new(BridgeClient {
            command: self.command.clone(),
            args: self.args.clone(),
            spec,
            events,
            child: AsyncMutex::new(None),
            connection: Mutex::new(None),
            profile_dir: Mutex::new(None),
        })
    }
}

#[derive(Debug, Serialize)]
struct BridgeRequest<'a> {
    id: u64,
    op: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<BridgeFailure>,
}

#[derive(Debug, Deserialize)]
struct BridgeFailure {
    message: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    Qr {
        payload: String,
    },
    Ready,
    AuthFailure,
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeMessage {
    Response(BridgeResponse),
    Event(BridgeEvent),
}

type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Value, ClientError>>>>;

struct Connection {
    stdin: AsyncMutex<ChildStdin>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    async fn request(&self, op: &str, params: Value) -> Result<Value, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::SessionClosed("bridge process exited".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut line = serde_json::to_vec(&BridgeRequest { id, op, params })
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        line.push(b'\n');
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(&line).await {
                Ok(()) => stdin.flush().await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = written {
            self.pending.lock().remove(&id);
            return Err(ClientError::SessionClosed(format!(
                "writing to bridge failed: {err}"
            )));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::SessionClosed("bridge process exited".into())),
        }
    }
}

pub struct BridgeClient {
    command: String,
    args: Vec<String>,
    spec: ClientSpec,
    events: EventSink,
    child: AsyncMutex<Option<Child>>,
    connection: Mutex<Option<Arc<Connection>>>,
    profile_dir: Mutex<Option<PathBuf>>,
}

impl BridgeClient {
    fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| ClientError::Protocol("bridge not started".into()))
    }

    fn launch_profile_dir(&self) -> PathBuf {
        self.spec.engine.profile_root.join(format!(
            "browser_profile_{}_{}",
            self.spec.session_id,
            Utc::now().timestamp_millis()
        ))
    }

    async fn launch(&self) -> Result<Arc<Connection>, ClientError> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| {
            ClientError::LaunchFailed(format!("spawning {}: {err}", self.command))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ClientError::LaunchFailed("bridge stdio unavailable".into()));
        };
        *self.child.lock().await = Some(child);

        let pending: Arc<Pending> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            self.spec.session_id.clone(),
            stdout,
            Arc::clone(&pending),
            Arc::clone(&closed),
            self.events.clone(),
        ));
        let connection = Arc::new(Connection {
            stdin: AsyncMutex::new(stdin),
            pending,
            next_id: AtomicU64::new(0),
            closed,
            reader,
        });
        *self.connection.lock() = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn stop_child(&self) -> Result<(), ClientError> {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return Ok(());
        };
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        child.kill().await.map_err(ClientError::from)
    }
}

#[async_trait]
impl ChannelClient for BridgeClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        let profile_dir = self.launch_profile_dir();
        tokio::fs::create_dir_all(&profile_dir).await.map_err(|err| {
            ClientError::LaunchFailed(format!("creating {}: {err}", profile_dir.display()))
        })?;
        *self.profile_dir.lock() = Some(profile_dir.clone());
        tokio::fs::create_dir_all(&self.spec.auth.data_path)
            .await
            .map_err(|err| {
                ClientError::LaunchFailed(format!(
                    "creating {}: {err}",
                    self.spec.auth.data_path.display()
                ))
            })?;

        let connection = self.launch().await?;
        let engine = &self.spec.engine;
        let mut args = engine.args.clone();
        args.push(format!("--user-data-dir={}", profile_dir.display()));
        connection
            .request(
                "initialize",
                json!({
                    "client_id": self.spec.auth.client_id,
                    "auth_data_path": self.spec.auth.data_path.display().to_string(),
                    "profile_dir": profile_dir.display().to_string(),
                    "executable_path": engine.executable_path.display().to_string(),
                    "headless": engine.headless,
                    "args": args,
                    "takeover_timeout_ms": engine.takeover_timeout_ms,
                }),
            )
            .await
            .map(|_| ())
    }

    async fn send_text(&self, chat_id: &str, text: &str) -> Result<String, ClientError> {
        let result = self
            .connection()?
            .request("send_text", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        message_id(&result)
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: MediaPayload,
        caption: Option<&str>,
    ) -> Result<String, ClientError> {
        let result = self
            .connection()?
            .request(
                "send_media",
                json!({
                    "chat_id": chat_id,
                    "mime_type": media.mime_type,
                    "data": STANDARD.encode(&media.data),
                    "filename": media.filename,
                    "caption": caption.unwrap_or_default(),
                }),
            )
            .await?;
        message_id(&result)
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        let connection = self.connection.lock().take();
        if let Some(connection) = &connection {
            if !connection.closed.load(Ordering::SeqCst) {
                match tokio::time::timeout(DESTROY_GRACE, connection.request("destroy", json!({})))
                    .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        debug!(session_id = %self.spec.session_id, error = %err, "bridge destroy request failed")
                    }
                    Err(_) => {
                        debug!(session_id = %self.spec.session_id, "bridge destroy request timed out")
                    }
                }
            }
        }
        let stopped = self.stop_child().await;
        if let Some(connection) = connection {
            connection.reader.abort();
        }
        let profile_dir = self.profile_dir.lock().take();
        if let Some(dir) = profile_dir {
            remove_profile_dir(&self.spec.session_id, &dir).await;
        }
        stopped
    }
}

async fn remove_profile_dir(session_id: &str, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(session_id = %session_id, dir = %dir.display(), error = %err, "removing browser profile failed")
        }
    }
}

fn message_id(result: &Value) -> Result<String, ClientError> {
    result
        .get("message_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::Protocol(format!("response without message_id: {result}")))
}

fn failure_to_error(failure: BridgeFailure) -> ClientError {
    match failure.name.as_deref() {
        Some("LaunchFailed") => ClientError::LaunchFailed(failure.message),
        Some("SessionClosed") => ClientError::SessionClosed(failure.message),
        _ => ClientError::Rejected(failure.message),
    }
}

async fn read_loop(
    session_id: String,
    stdout: ChildStdout,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    events: EventSink,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "reading bridge output failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BridgeMessage>(&line) {
            Ok(BridgeMessage::Response(response)) => {
                let outcome = match response.error {
                    Some(failure) => Err(failure_to_error(failure)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                match pending.lock().remove(&response.id) {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => debug!(session_id = %session_id, id = response.id, "response for unknown request"),
                }
            }
            Ok(BridgeMessage::Event(event)) => {
                let event = match event {
                    BridgeEvent::Qr { payload } => ClientEvent::Qr(payload),
                    BridgeEvent::Ready => ClientEvent::Ready,
                    BridgeEvent::AuthFailure => ClientEvent::AuthFailure,
                    BridgeEvent::Disconnected { reason } => {
                        debug!(session_id = %session_id, reason = ?reason, "bridge reported disconnect");
                        ClientEvent::Disconnected
                    }
                };
                events.emit(event);
            }
            Err(err) => {
                debug!(session_id = %session_id, error = %err, line = %line, "unparseable bridge output")
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    let waiters: Vec<_> = pending.lock().drain().map(|(_, waiter)| waiter).collect();
    for waiter in waiters {
        let _ = waiter.send(Err(ClientError::SessionClosed(
            "bridge process exited".into(),
        )));
    }
    events.emit(ClientEvent::Disconnected);
}
