use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connectivity state of one channel session.
///
/// The serialized form doubles as the persisted column value, so the names
/// below are part of the storage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    QrNeeded,
    Connected,
    AuthFailed,
    Disconnected,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        SessionState::Init,
        SessionState::QrNeeded,
        SessionState::Connected,
        SessionState::AuthFailed,
        SessionState::Disconnected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::QrNeeded => "QR_NEEDED",
            SessionState::Connected => "CONNECTED",
            SessionState::AuthFailed => "AUTH_FAILED",
            SessionState::Disconnected => "DISCONNECTED",
        }
    }

    /// States that only make sense while a channel client is running.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Init | SessionState::QrNeeded | SessionState::Connected
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown session state: {0}")]
pub struct UnknownSessionState(pub String);

impl FromStr for SessionState {
    type Err = UnknownSessionState;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SessionState::ALL
            .into_iter()
            .find(|state| state.as_str() == value)
            .ok_or_else(|| UnknownSessionState(value.to_string()))
    }
}

/// Durable projection of a session, keyed by `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub state: SessionState,
    #[serde(default)]
    pub pairing_payload: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        state: SessionState,
        pairing_payload: Option<String>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            state,
            pairing_payload,
            last_updated,
        }
    }
}

/// Answer to a status query. `pairing_payload` is only set while the session
/// waits for a QR scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_payload: Option<String>,
    pub last_updated: DateTime<Utc>,
    /// Whether the answer came from a live handle rather than the durable record.
    pub live: bool,
}

impl SessionStatus {
    pub fn from_record(record: SessionRecord, live: bool) -> Self {
        let pairing_payload = match record.state {
            SessionState::QrNeeded => record.pairing_payload,
            _ => None,
        };
        Self {
            session_id: record.session_id,
            state: record.state,
            pairing_payload,
            last_updated: record.last_updated,
            live,
        }
    }
}

/// One row of the session listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: SessionState,
    pub last_updated: DateTime<Utc>,
    pub connected: bool,
    pub live: bool,
}

impl SessionSummary {
    pub fn from_record(record: &SessionRecord, live: bool) -> Self {
        Self {
            session_id: record.session_id.clone(),
            state: record.state,
            last_updated: record.last_updated,
            connected: record.state == SessionState::Connected,
            live,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    pub session_id: String,
    pub created: bool,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub session_id: String,
    pub message_id: String,
}
