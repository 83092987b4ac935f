use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::store::StoreError;

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Bad origin, port or other startup setting. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("origin request failed: {0}")]
    OriginFetch(#[source] reqwest::Error),

    #[error("origin did not respond within {0:?}")]
    OriginTimeout(Duration),

    #[error("origin responded with status {0}")]
    OriginStatus(StatusCode),

    #[error("origin body exceeds {limit} bytes")]
    OriginBodyTooLarge { limit: usize },

    #[error("origin body is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),

    /// Raised inside the write-back worker only; never reaches a client.
    #[error("write-back failed: {0}")]
    WriteBack(#[source] StoreError),

    #[error("coalesced origin fetch did not produce a response")]
    CoalescedFetchFailed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::OriginTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::OriginFetch(_)
            | ProxyError::OriginStatus(_)
            | ProxyError::OriginBodyTooLarge { .. }
            | ProxyError::Decode(_)
            | ProxyError::CoalescedFetchFailed => StatusCode::BAD_GATEWAY,
            ProxyError::Configuration(_)
            | ProxyError::Store(_)
            | ProxyError::WriteBack(_)
            | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-safe message. The underlying cause is only ever logged.
    pub fn public_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::GATEWAY_TIMEOUT => "origin timed out",
            StatusCode::BAD_GATEWAY => "bad gateway",
            _ => "internal server error",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        error!(error = %self, status = status.as_u16(), "request failed");
        (status, Json(json!({ "message": self.public_message() }))).into_response()
    }
}
