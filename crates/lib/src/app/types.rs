//! Types for the build orchestrator.
//!
//! This module defines the orchestrator configuration, its error type and
//! the per-architecture attempt record.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::client::ClientError;
use crate::definition::DefinitionError;
use crate::endpoints::EndpointError;
use crate::library::LibraryError;
use crate::sign::{SignError, SigningMethod};

/// Everything a build invocation needs.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
  /// Frontend URL override. Inferred from the destination host or the
  /// default frontend when unset.
  pub url: Option<String>,
  pub auth_token: Option<String>,
  /// Definition file path or `scheme:reference` URI.
  pub build_spec: String,
  /// `library:` reference, local file path, or `None` for an ephemeral build.
  pub destination: Option<String>,
  /// Requested architectures, built in order.
  pub archs: Vec<String>,
  /// Overwrite existing local destination files.
  pub force: bool,
  pub skip_tls_verify: bool,
  pub user_agent: Option<String>,
  /// Per-request timeout for plain service requests.
  pub timeout: Option<Duration>,
  pub signing: Option<SigningMethod>,
  /// Directory relative `%files` sources are resolved against. Defaults to
  /// the process working directory.
  pub working_dir: Option<PathBuf>,
}

/// Errors returned by [`super::App`].
#[derive(Debug, Error)]
pub enum AppError {
  #[error("no architectures requested")]
  NoArchitectures,

  #[error("build and sign ephemeral image is not supported")]
  SigningEphemeralUnsupported,

  #[error("file {} already exists", path.display())]
  FileExists { path: PathBuf },

  #[error(transparent)]
  Destination(#[from] LibraryError),

  #[error(transparent)]
  Endpoint(#[from] EndpointError),

  #[error("error initializing build client: {0}")]
  ClientInit(#[source] ClientError),

  #[error("error initializing library client: {0}")]
  LibraryInit(#[source] LibraryError),

  #[error(transparent)]
  Definition(#[from] DefinitionError),

  #[error("error uploading build context: {0}")]
  UploadContext(#[source] ClientError),

  #[error("error submitting remote build: {0}")]
  Submit(#[source] ClientError),

  #[error("error streaming remote build output: {0}")]
  Output(#[source] ClientError),

  #[error("error getting remote build status: {0}")]
  Status(#[source] ClientError),

  #[error("failed to build image")]
  BuildFailed,

  #[error("error opening file {} for writing: {source}", path.display())]
  Artifact {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("error downloading image {reference}: {source}")]
  Download {
    reference: String,
    #[source]
    source: LibraryError,
  },

  #[error("error uploading signed image {reference}: {source}")]
  Upload {
    reference: String,
    #[source]
    source: LibraryError,
  },

  #[error(transparent)]
  Sign(#[from] SignError),

  #[error("signing task failed: {0}")]
  Task(#[from] tokio::task::JoinError),

  #[error("failed to build images")]
  MultipleFailures,

  #[error("operation cancelled")]
  Cancelled,

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl AppError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, Self::Cancelled)
  }
}

/// Where an attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
  Init,
  ContextUploaded,
  Submitted,
  Streaming,
  StatusPolled,
  Signed,
  Republished,
  Succeeded,
  Failed,
}

impl AttemptState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Succeeded | Self::Failed)
  }
}

impl fmt::Display for AttemptState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Init => "init",
      Self::ContextUploaded => "context-uploaded",
      Self::Submitted => "submitted",
      Self::Streaming => "streaming",
      Self::StatusPolled => "status-polled",
      Self::Signed => "signed",
      Self::Republished => "republished",
      Self::Succeeded => "succeeded",
      Self::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// One architecture's build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildAttempt {
  pub arch: String,
  /// Set once the service accepted the build.
  pub build_id: Option<String>,
  pub output_complete: bool,
  pub image_size: i64,
  pub image_checksum: String,
  /// Library reference the service reported for the image.
  pub library_ref: Option<String>,
  /// Local file the image was written to.
  pub file: Option<PathBuf>,
  pub state: AttemptState,
}

impl BuildAttempt {
  pub fn new(arch: impl Into<String>) -> Self {
    Self {
      arch: arch.into(),
      build_id: None,
      output_complete: false,
      image_size: 0,
      image_checksum: String::new(),
      library_ref: None,
      file: None,
      state: AttemptState::Init,
    }
  }

  pub fn succeeded(&self) -> bool {
    self.state == AttemptState::Succeeded
  }

  pub(crate) fn advance(&mut self, state: AttemptState) {
    debug!(arch = %self.arch, from = %self.state, to = %state, "build attempt");
    self.state = state;
  }
}
