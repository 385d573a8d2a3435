//! Frontend selection and service endpoint discovery.
//!
//! A frontend publishes the base URLs of the build and library services in a
//! small JSON document. Everything else is derived from it.

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::client::HttpError;
use crate::consts::{DEFAULT_FRONTEND_URL, FRONTEND_CONFIG_PATH};

#[derive(Debug, Error)]
pub enum EndpointError {
  #[error("conflicting arguments: --url host '{url_host}' does not match library reference host '{ref_host}'")]
  ConflictingArguments { url_host: String, ref_host: String },

  #[error("invalid frontend URL '{url}'")]
  InvalidUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },

  #[error("error getting configuration: {0}")]
  Http(#[from] HttpError),

  #[error("error getting configuration: {0}")]
  Request(#[from] reqwest::Error),

  #[error("error decoding configuration: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("remote server is misconfigured")]
  ServerMisconfigured,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServiceUri {
  #[serde(default)]
  pub uri: String,
}

/// Service locations published by a frontend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FrontendConfig {
  #[serde(rename = "libraryAPI", default)]
  pub library_api: ServiceUri,
  #[serde(rename = "builderAPI", default)]
  pub build_api: ServiceUri,
}

/// Pick the frontend URL.
///
/// An explicit override wins, but must name the same host as the library
/// reference when one carries a host. Otherwise the reference host is used
/// over HTTPS, and failing that the default frontend.
pub fn frontend_url(url_override: Option<&str>, ref_host: Option<&str>) -> Result<String, EndpointError> {
  let url_override = url_override.filter(|u| !u.is_empty());
  let ref_host = ref_host.filter(|h| !h.is_empty());

  match (url_override, ref_host) {
    (Some(url), None) => Ok(url.to_string()),
    (Some(url), Some(host)) => {
      let parsed = Url::parse(url).map_err(|source| EndpointError::InvalidUrl {
        url: url.to_string(),
        source,
      })?;
      let url_host = authority(&parsed);
      if url_host != host {
        return Err(EndpointError::ConflictingArguments {
          url_host,
          ref_host: host.to_string(),
        });
      }
      Ok(url.to_string())
    }
    (None, Some(host)) => Ok(format!("https://{}", host)),
    (None, None) => Ok(DEFAULT_FRONTEND_URL.to_string()),
  }
}

/// `host[:port]` of `url`.
fn authority(url: &Url) -> String {
  let host = url.host_str().unwrap_or_default();
  match url.port() {
    Some(port) => format!("{}:{}", host, port),
    None => host.to_string(),
  }
}

pub fn frontend_config_url(frontend_url: &str) -> String {
  format!("{}/{}", frontend_url.trim_end_matches('/'), FRONTEND_CONFIG_PATH)
}

/// Fetch the frontend's service configuration. Both service URIs must be set.
pub async fn frontend_config(frontend_url: &str, skip_tls_verify: bool) -> Result<FrontendConfig, EndpointError> {
  let url = frontend_config_url(frontend_url);
  debug!(url = %url, "fetching frontend configuration");

  let http = reqwest::Client::builder()
    .danger_accept_invalid_certs(skip_tls_verify)
    .build()?;
  let res = http.get(&url).send().await?;
  if !res.status().is_success() {
    return Err(HttpError::new(res.status().as_u16()).into());
  }

  let body = res.bytes().await?;
  let config: FrontendConfig = serde_json::from_slice(&body)?;
  if config.library_api.uri.is_empty() || config.build_api.uri.is_empty() {
    return Err(EndpointError::ServerMisconfigured);
  }

  debug!(build = %config.build_api.uri, library = %config.library_api.uri, "discovered service endpoints");
  Ok(config)
}
