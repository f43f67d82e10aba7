use gateway_sdk::{SessionState, StoreError};

/// Caller-facing failures of the session facade.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {session_id} is not ready (state {state})")]
    SessionNotReady {
        session_id: String,
        state: SessionState,
    },
    #[error("one of base64, url or file_path is required")]
    MissingMediaSource,
    #[error("send failed: {0}")]
    SendFailure(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Validation(_) => "validation_error",
            SessionError::SessionNotFound(_) => "session_not_found",
            SessionError::SessionNotReady { .. } => "session_not_ready",
            SessionError::MissingMediaSource => "missing_media_source",
            SessionError::SendFailure(_) => "send_failed",
            SessionError::Store(_) => "store_error",
        }
    }
}

const MAX_SESSION_ID_LEN: usize = 128;

/// Session ids name on-disk auth and profile directories, so they are kept
/// to a conservative character set.
pub fn validate_session_id(raw: &str) -> Result<&str, SessionError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(SessionError::Validation("session_id is required".into()));
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(SessionError::Validation(format!(
            "session_id longer than {MAX_SESSION_ID_LEN} characters"
        )));
    }
    if id.starts_with('.') {
        return Err(SessionError::Validation(
            "session_id must not start with '.'".into(),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(SessionError::Validation(
            "session_id may only contain letters, digits, '-', '_' and '.'".into(),
        ));
    }
    Ok(id)
}

pub fn require_non_empty<'a>(field: &str, value: &'a str) -> Result<&'a str, SessionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SessionError::Validation(format!("{field} is required")));
    }
    Ok(trimmed)
}
