use std::path::PathBuf;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatApiError {
    #[error("no credentials available for the chat service")]
    MissingCredentials,

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: &'static str },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} {message}")]
    Status { status: StatusCode, message: String },

    #[error("response chunk processing ended with an unresolved parsing error")]
    StreamDecode(#[source] serde_json::Error),

    #[error("unexpected stream frame: {0}")]
    ProtocolViolation(String),

    #[error("no data received after sending message")]
    EmptyResponse,

    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ChatApiError {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// HTTP status carried by a non-success response, if any.
    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(rename = "error")]
    value: Option<ErrorPayloadFields>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayloadFields {
    message: Option<String>,
    code: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
}

impl ErrorPayloadFields {
    fn message_with_code(&self) -> Option<String> {
        let message = self.message.as_deref().and_then(non_empty_string)?;
        let code = self
            .code
            .as_deref()
            .and_then(non_empty_string)
            .or_else(|| self.type_.as_deref().and_then(non_empty_string));

        Some(match code {
            Some(code) => format!("{message} ({code})"),
            None => message.to_owned(),
        })
    }
}

/// Turns a non-success response body into a short human readable message.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let fallback = || {
        if body.trim().is_empty() {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        } else {
            body.trim().to_string()
        }
    };

    match serde_json::from_str::<ErrorPayload>(body) {
        Ok(ErrorPayload { value: Some(fields) }) => {
            fields.message_with_code().unwrap_or_else(fallback)
        }
        _ => fallback(),
    }
}

fn non_empty_string(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
