//! Shared types and an asynchronous client for the session gateway API.
//!
//! The record/state types here are used both by the gateway itself (as its
//! persistence model) and by callers that talk to it over HTTP.

pub mod record_store;
pub mod session;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use record_store::{InMemorySessionStore, SessionStore, StoreError};
pub use session::{
    InitResponse, SentMessage, SessionRecord, SessionState, SessionStatus, SessionSummary,
};

#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Serialize)]
struct SessionIdBody<'a> {
    session_id: &'a str,
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    session_id: &'a str,
    phone: &'a str,
    message: &'a str,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn init_session(&self, session_id: &str) -> Result<InitResponse, GatewayError> {
        let url = format!("{}/api/sessions/init", self.base_url);
        let res = self
            .http
            .post(url)
            .json(&SessionIdBody { session_id })
            .send()
            .await?;
        decode(res).await
    }

    pub async fn restart_session(&self, session_id: &str) -> Result<InitResponse, GatewayError> {
        let url = format!("{}/api/sessions/restart", self.base_url);
        let res = self
            .http
            .post(url)
            .json(&SessionIdBody { session_id })
            .send()
            .await?;
        decode(res).await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), GatewayError> {
        let url = format!("{}/api/sessions/{}", self.base_url, session_id);
        let res = self.http.delete(url).send().await?;
        decode::<serde_json::Value>(res).await.map(|_| ())
    }

    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus, GatewayError> {
        let url = format!("{}/api/sessions/{}", self.base_url, session_id);
        let res = self.http.get(url).send().await?;
        decode(res).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, GatewayError> {
        let url = format!("{}/api/sessions", self.base_url);
        let res = self.http.get(url).send().await?;
        decode(res).await
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        phone: &str,
        message: &str,
    ) -> Result<SentMessage, GatewayError> {
        let url = format!("{}/api/messages", self.base_url);
        let res = self
            .http
            .post(url)
            .json(&SendMessageBody {
                session_id,
                phone,
                message,
            })
            .send()
            .await?;
        decode(res).await
    }
}

async fn decode<T>(res: reqwest::Response) -> Result<T, GatewayError>
where
    T: DeserializeOwned,
{
    if res.status().is_success() {
        Ok(res.json::<T>().await?)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(GatewayError::UnexpectedStatus { status, body })
    }
}
