use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub request_id: Option<String>,
    pub message: Option<String>,
    pub body: Value,
}

impl ApiError {
    /// Builds the error for a rejected request from its raw response body.
    ///
    /// Servers are expected to answer with a JSON error object. When they do
    /// not, the body is wrapped as `{"error":{"message": <text>}}` so callers
    /// always receive the same shape.
    pub fn from_body(status: StatusCode, headers: &HeaderMap, bytes: &[u8]) -> Self {
        let request_id = headers
            .get("x-request-id")
            .or_else(|| headers.get("request-id"))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let text = String::from_utf8_lossy(bytes).to_string();
        let json = serde_json::from_slice::<Value>(bytes).ok();
        let message = extract_error_message(json.as_ref(), &text).or_else(|| {
            status
                .canonical_reason()
                .map(|reason| format!("{} {reason}", status.as_u16()))
        });
        let body = json.unwrap_or_else(|| {
            json!({ "error": { "message": message.clone().unwrap_or_default() } })
        });

        Self {
            status,
            request_id,
            message,
            body,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(msg) = &self.message {
            return write!(f, "{} {msg}", self.status.as_u16());
        }
        write!(f, "{} {}", self.status.as_u16(), self.body)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("request rejected with status {0}")]
    Status(ApiError),

    #[error("request timed out")]
    Timeout,

    #[error("aborted")]
    Aborted,

    #[error(transparent)]
    InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error(transparent)]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Error::Timeout;
        }
        Error::Transport(err)
    }
}

pub(crate) fn extract_error_message(json: Option<&Value>, fallback_text: &str) -> Option<String> {
    let json_msg = json
        .and_then(|v| v.as_object())
        .and_then(|obj| obj.get("error"))
        .and_then(|e| e.as_object())
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            json.and_then(|v| v.as_object())
                .and_then(|obj| obj.get("message"))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        });

    if json_msg.is_some() {
        return json_msg;
    }
    if json.is_some() || fallback_text.trim().is_empty() {
        return None;
    }
    Some(fallback_text.trim().to_string())
}
