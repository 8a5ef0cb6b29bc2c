//! HTTP client for the hospital backend's auth endpoints.

use crate::session::Token;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    /// No response arrived: connection, DNS, TLS or timeout failure.
    #[error("request failed: {0}")]
    Transport(String),
    /// The server answered with an error status.
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

/// Result of asking the backend for a fresh token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Renewed(Token),
    /// Definitive refusal; the session cannot be renewed.
    Rejected { status: u16, message: String },
    /// Nothing usable came back; worth retrying later.
    TransportFault(String),
}

impl From<Result<Token, ApiError>> for RefreshOutcome {
    fn from(result: Result<Token, ApiError>) -> Self {
        match result {
            Ok(token) => Self::Renewed(token),
            Err(ApiError::Rejected { status, message }) => Self::Rejected { status, message },
            Err(ApiError::Transport(msg)) | Err(ApiError::Decode(msg)) => {
                Self::TransportFault(msg)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Auth operations the session layer needs from the backend
pub trait AuthApi: Send + Sync {
    fn login(&self, credentials: &Credentials) -> Result<Token, ApiError>;
    fn refresh_token(&self, id_token: &str) -> RefreshOutcome;
    fn forget_password(&self, email: &str) -> Result<(), ApiError>;
}

pub struct HttpAuthApi {
    base_url: String,
    login_timeout: Duration,
    agent: ureq::Agent,
}

impl HttpAuthApi {
    pub fn new(base_url: &str, login_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            login_timeout,
            agent: ureq::Agent::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl AuthApi for HttpAuthApi {
    fn login(&self, credentials: &Credentials) -> Result<Token, ApiError> {
        let url = self.url("/login");
        debug!(%url, user = %credentials.username, "login request");

        let resp = self
            .agent
            .post(&url)
            .timeout(self.login_timeout)
            .send_json(credentials)
            .map_err(map_error)?;
        decode_token(resp)
    }

    fn refresh_token(&self, id_token: &str) -> RefreshOutcome {
        let url = self.url("/refresh");
        debug!(%url, "refresh request");

        let result = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", id_token))
            .send_json(json!({}))
            .map_err(map_error)
            .and_then(decode_token);
        result.into()
    }

    fn forget_password(&self, email: &str) -> Result<(), ApiError> {
        let url = self.url("/forget-password");
        debug!(%url, "forget-password request");

        self.agent
            .post(&url)
            .send_json(json!({ "email": email }))
            .map_err(map_error)?;
        Ok(())
    }
}

fn decode_token(resp: ureq::Response) -> Result<Token, ApiError> {
    resp.into_json::<Token>()
        .map_err(|e| ApiError::Decode(e.to_string()))
}

fn map_error(err: ureq::Error) -> ApiError {
    match err {
        ureq::Error::Status(status, resp) => {
            let body = resp.into_string().unwrap_or_default();
            ApiError::Rejected {
                status,
                message: error_message(&body),
            }
        }
        ureq::Error::Transport(t) => ApiError::Transport(t.to_string()),
    }
}

/// Pull a human-readable message out of an error body. The backend usually
/// sends `{"message": ...}`, sometimes `{"error": ...}`, sometimes text.
fn error_message(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error", "detail"] {
            if let Some(Value::String(msg)) = map.get(key) {
                return msg.clone();
            }
        }
    }
    body.trim().to_string()
}
