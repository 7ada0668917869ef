//! Clients for the two remote services: the content-store gateway and the
//! deal-submission API. Both ride on [`transport::AuthTransport`].

pub mod content;
pub mod deals;
pub mod transport;

use reqwest::Response;
use serde::Deserialize;

pub use content::{ContentId, ContentStore, Entry, HttpContentStore, StagedContent, Stat};
pub use deals::{ApplyOptions, DealApi, DealJobState, HttpDealApi, JobId};
pub use transport::{AuthTransport, Session};

/// Prefix of the error the gateway returns when a path component does not resolve.
pub const NO_LINK_SIGNATURE: &str = "no link named";
/// Prefix of the error the gateway's namespace API returns for a missing path.
pub const NO_FILE_SIGNATURE: &str = "file does not exist";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote error (HTTP {status}): {message}")]
    Remote { status: u16, message: String },
    #[error("no such entry: {0}")]
    NotFound(String),
    #[error("invalid address {0:?}: expected host:port")]
    InvalidAddress(String),
    #[error("token is not a valid header value")]
    InvalidToken,
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Build the error for a failed remote call, translating the not-found
    /// signature into [`ApiError::NotFound`].
    pub fn from_remote(status: u16, message: String, path: &str) -> Self {
        match classify_remote_error(&message) {
            RemoteErrorKind::NotFound => ApiError::NotFound(path.to_string()),
            RemoteErrorKind::Other => ApiError::Remote { status, message },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    NotFound,
    Other,
}

/// The only place that inspects remote error text. If the gateway changes
/// its wording, this is the function to update.
pub fn classify_remote_error(message: &str) -> RemoteErrorKind {
    let message = message.trim_start();
    if message.starts_with(NO_LINK_SIGNATURE) || message.starts_with(NO_FILE_SIGNATURE) {
        RemoteErrorKind::NotFound
    } else {
        RemoteErrorKind::Other
    }
}

#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    #[serde(rename = "Message", alias = "message", alias = "error")]
    message: String,
}

/// Pass successful responses through; turn everything else into an [`ApiError`].
pub(crate) async fn check_response(resp: Response, path: &str) -> Result<Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<RemoteErrorBody>(&body)
        .map(|b| b.message)
        .unwrap_or(body);
    Err(ApiError::from_remote(status.as_u16(), message, path))
}
