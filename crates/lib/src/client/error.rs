//! Error types for the build service client.

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

use crate::archive::ArchiveError;

/// A non-2xx response from a service.
///
/// Two `HttpError`s are equal when their status codes match, whatever the
/// message says.
#[derive(Debug, Clone, Eq)]
pub struct HttpError {
  pub code: u16,
  pub message: Option<String>,
}

impl HttpError {
  pub fn new(code: u16) -> Self {
    Self { code, message: None }
  }

  pub fn with_message(code: u16, message: impl Into<String>) -> Self {
    Self {
      code,
      message: Some(message.into()),
    }
  }
}

impl PartialEq for HttpError {
  fn eq(&self, other: &Self) -> bool {
    self.code == other.code
  }
}

impl fmt::Display for HttpError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let reason = StatusCode::from_u16(self.code)
      .ok()
      .and_then(|s| s.canonical_reason())
      .unwrap_or("");
    write!(f, "{} {}", self.code, reason)?;
    if let Some(message) = &self.message {
      write!(f, ": {}", message)?;
    }
    Ok(())
  }
}

impl std::error::Error for HttpError {}

/// Errors returned by [`super::BuildClient`].
#[derive(Debug, Error)]
pub enum ClientError {
  #[error("invalid base URL '{url}': {source}")]
  InvalidBaseUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },

  #[error("unsupported protocol scheme \"{0}\"")]
  UnsupportedScheme(String),

  #[error(transparent)]
  Http(#[from] HttpError),

  #[error("request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error("failed to decode response: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("response is missing its data")]
  MissingData,

  #[error("websocket error: {0}")]
  WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

  /// The output stream ended with anything other than a normal closure.
  #[error("build output stream closed unexpectedly ({code}): {reason}")]
  StreamClosed { code: u16, reason: String },

  #[error("no paths specified for build context")]
  NoPathsSpecified,

  #[error("failed to write archive: {0}")]
  Archive(#[from] ArchiveError),

  #[error("failed to get build context upload location: {0}")]
  UploadLocation(#[source] Box<ClientError>),

  #[error("failed to upload build context: {0}")]
  Upload(#[source] Box<ClientError>),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("output task failed: {0}")]
  Task(#[from] tokio::task::JoinError),

  /// The caller's cancellation token fired.
  #[error("operation cancelled")]
  Cancelled,
}

impl ClientError {
  /// The HTTP status code behind this error, looking through phase wrappers.
  pub fn http_status(&self) -> Option<u16> {
    match self {
      Self::Http(e) => Some(e.code),
      Self::Request(e) => e.status().map(|s| s.as_u16()),
      Self::UploadLocation(inner) | Self::Upload(inner) => inner.http_status(),
      _ => None,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }
}
