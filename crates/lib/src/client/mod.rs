//! Client for the remote build service.
//!
//! Covers build submission, status polling, cancellation, output streaming
//! over a websocket, and build-context upload/delete.

mod build;
mod context;
mod error;
mod output;
mod types;

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::archive::fs::DirFs;
use crate::consts::{DEFAULT_BUILD_URL, default_user_agent};

pub use self::context::{ContextArchive, write_context_archive};
pub use self::error::{ClientError, HttpError};
pub use self::types::{BuildInfo, SubmitOptions};
use self::types::{Envelope, VersionInfo};

/// Configuration for [`BuildClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
  /// Base URL of the build service. Must use `http` or `https`.
  pub base_url: String,
  /// Sent as `Authorization: Bearer <token>` when set.
  pub bearer_token: Option<String>,
  pub user_agent: Option<String>,
  /// Accept any TLS certificate, for self-hosted deployments.
  pub skip_tls_verify: bool,
  /// Per-request timeout for plain requests. Output streaming and context
  /// upload are not bounded by it.
  pub timeout: Option<Duration>,
  /// Use this HTTP client instead of building one. `skip_tls_verify` then only
  /// applies to the websocket connection.
  pub http_client: Option<reqwest::Client>,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_BUILD_URL.to_string(),
      bearer_token: None,
      user_agent: Some(default_user_agent()),
      skip_tls_verify: false,
      timeout: None,
      http_client: None,
    }
  }
}

/// Build service client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BuildClient {
  base_url: Url,
  bearer_token: Option<String>,
  user_agent: Option<String>,
  skip_tls_verify: bool,
  timeout: Option<Duration>,
  http: reqwest::Client,
}

impl BuildClient {
  /// Validate `config` and build a client.
  ///
  /// The base URL path is normalized to end with `/` so relative endpoint
  /// paths resolve beneath it.
  pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
    let mut base_url = Url::parse(&config.base_url).map_err(|source| ClientError::InvalidBaseUrl {
      url: config.base_url.clone(),
      source,
    })?;

    match base_url.scheme() {
      "http" | "https" => {}
      other => return Err(ClientError::UnsupportedScheme(other.to_string())),
    }

    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let http = match config.http_client {
      Some(client) => client,
      None => reqwest::Client::builder()
        .danger_accept_invalid_certs(config.skip_tls_verify)
        .build()?,
    };

    Ok(Self {
      base_url,
      bearer_token: config.bearer_token.filter(|t| !t.is_empty()),
      user_agent: config.user_agent.filter(|ua| !ua.is_empty()),
      skip_tls_verify: config.skip_tls_verify,
      timeout: config.timeout,
      http,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  pub(crate) fn bearer_token(&self) -> Option<&str> {
    self.bearer_token.as_deref()
  }

  pub(crate) fn user_agent(&self) -> Option<&str> {
    self.user_agent.as_deref()
  }

  pub(crate) fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
    self.base_url.join(path).map_err(|source| ClientError::InvalidBaseUrl {
      url: path.to_string(),
      source,
    })
  }

  /// A request carrying the client's authorization and user agent headers.
  pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let mut req = self.unauthenticated(method, url);
    if let Some(token) = &self.bearer_token {
      req = req.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    if let Some(timeout) = self.timeout {
      req = req.timeout(timeout);
    }
    req
  }

  /// A request with only the user agent set, for pre-authorized locations.
  pub(crate) fn unauthenticated(&self, method: Method, url: Url) -> RequestBuilder {
    let mut req = self.http.request(method, url);
    if let Some(ua) = &self.user_agent {
      req = req.header(USER_AGENT, ua);
    }
    req
  }

  /// Version string reported by the build service.
  pub async fn version(&self) -> Result<String, ClientError> {
    let url = self.endpoint("version")?;
    debug!(url = %url, "fetching service version");
    let res = self.request(Method::GET, url).send().await?;
    let info: VersionInfo = read_data(res).await?;
    Ok(info.version)
  }
}

/// Turn a non-2xx response into an [`HttpError`], keeping the service's message
/// when the body carries one.
pub(crate) async fn http_error(res: Response) -> HttpError {
  let code = res.status().as_u16();
  let message = match res.bytes().await {
    Ok(body) => serde_json::from_slice::<Envelope<serde_json::Value>>(&body)
      .ok()
      .and_then(|env| env.error)
      .map(|e| e.message)
      .filter(|m| !m.is_empty()),
    Err(_) => None,
  };
  HttpError { code, message }
}

pub(crate) async fn error_from_response(res: Response) -> ClientError {
  ClientError::Http(http_error(res).await)
}

/// Check the status and unwrap the `data` member of a response envelope.
pub(crate) async fn read_data<T: DeserializeOwned>(res: Response) -> Result<T, ClientError> {
  if !res.status().is_success() {
    return Err(error_from_response(res).await);
  }
  let body = res.bytes().await?;
  let env: Envelope<T> = serde_json::from_slice(&body)?;
  env.data.ok_or(ClientError::MissingData)
}

/// Check the status of a response whose body is irrelevant.
pub(crate) async fn check_status(res: Response) -> Result<(), ClientError> {
  if res.status().is_success() {
    Ok(())
  } else {
    Err(error_from_response(res).await)
  }
}

/// The build-service operations the orchestrator drives.
#[async_trait]
pub trait BuildService: Send + Sync {
  /// Archive and upload `paths`, returning the context digest.
  async fn upload_build_context(&self, paths: &[String]) -> Result<String, ClientError>;

  async fn delete_build_context(&self, digest: &str) -> Result<(), ClientError>;

  async fn submit(&self, definition: &[u8], opts: &SubmitOptions) -> Result<BuildInfo, ClientError>;

  /// Stream build output into `sink` until the build finishes or `cancel` fires.
  async fn output(
    &self,
    build_id: &str,
    sink: &mut (dyn Write + Send),
    cancel: &CancellationToken,
  ) -> Result<(), ClientError>;

  async fn status(&self, build_id: &str) -> Result<BuildInfo, ClientError>;

  async fn cancel(&self, build_id: &str) -> Result<(), ClientError>;
}

#[async_trait]
impl BuildService for BuildClient {
  async fn upload_build_context(&self, paths: &[String]) -> Result<String, ClientError> {
    BuildClient::upload_build_context(self, paths, DirFs::default()).await
  }

  async fn delete_build_context(&self, digest: &str) -> Result<(), ClientError> {
    BuildClient::delete_build_context(self, digest).await
  }

  async fn submit(&self, definition: &[u8], opts: &SubmitOptions) -> Result<BuildInfo, ClientError> {
    BuildClient::submit(self, definition, opts).await
  }

  async fn output(
    &self,
    build_id: &str,
    sink: &mut (dyn Write + Send),
    cancel: &CancellationToken,
  ) -> Result<(), ClientError> {
    BuildClient::output(self, build_id, sink, cancel).await
  }

  async fn status(&self, build_id: &str) -> Result<BuildInfo, ClientError> {
    BuildClient::status(self, build_id).await
  }

  async fn cancel(&self, build_id: &str) -> Result<(), ClientError> {
    BuildClient::cancel(self, build_id).await
  }
}
