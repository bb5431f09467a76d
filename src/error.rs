//! Error types for the rewriting proxy.

use axum::http::StatusCode;
use thiserror::Error;

/// Everything that can stop a proxied request before a response is assembled.
///
/// The dispatcher renders each of these as the landing page with a readable
/// message; nothing below this type reaches the transport.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No URL was given")]
    MissingUrl,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Upstream(#[from] FetchError),

    #[error("Could not process the page: {0}")]
    Transform(#[from] TransformError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingUrl | ProxyError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(FetchError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Transform(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Transport failures reported by an [`crate::upstream::Upstream`].
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("TLS certificate verification failed for {url}: {reason}")]
    Tls { url: String, reason: String },

    #[error("Timed out waiting for {url}")]
    Timeout { url: String },

    #[error("Could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Could not build the upstream client: {0}")]
    Client(String),

    #[error("Upstream error for {url}: {reason}")]
    Other { url: String, reason: String },
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("HTML rewriting failed: {0}")]
    Html(String),

    #[error("Invalid attribute {name}: {reason}")]
    Attribute { name: String, reason: String },

    #[error("Rewritten document is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
