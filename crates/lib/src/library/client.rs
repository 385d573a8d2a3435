//! HTTP client for the image library.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, RequestBuilder};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use url::Url;

use super::LibraryError;
use crate::client::http_error;
use crate::consts::default_user_agent;
use crate::util::hash::{HashingWriter, format_digest};

/// Header carrying the `sha256.<hex>` digest of an uploaded image.
pub const CHECKSUM_HEADER: &str = "X-Image-Checksum";

#[derive(Debug, Clone)]
pub struct LibraryConfig {
  pub base_url: String,
  pub bearer_token: Option<String>,
  pub user_agent: Option<String>,
  pub skip_tls_verify: bool,
}

impl LibraryConfig {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into(),
      bearer_token: None,
      user_agent: Some(default_user_agent()),
      skip_tls_verify: false,
    }
  }
}

/// Image transfer operations the orchestrator needs from a library.
#[async_trait]
pub trait ImageLibrary: Send + Sync {
  /// Stream the image at `path:tag` for `arch` into `writer`, returning the
  /// number of bytes written.
  async fn download_image(
    &self,
    writer: &mut (dyn Write + Send),
    arch: &str,
    path: &str,
    tag: &str,
  ) -> Result<u64, LibraryError>;

  /// Upload the image file at `file` under `path` with `tags`.
  async fn upload_image(&self, file: &Path, path: &str, arch: &str, tags: &[String]) -> Result<(), LibraryError>;
}

#[derive(Debug, Clone)]
pub struct LibraryClient {
  base_url: Url,
  bearer_token: Option<String>,
  user_agent: Option<String>,
  http: reqwest::Client,
}

impl LibraryClient {
  pub fn new(config: LibraryConfig) -> Result<Self, LibraryError> {
    let mut base_url = Url::parse(&config.base_url).map_err(|source| LibraryError::InvalidBaseUrl {
      url: config.base_url.clone(),
      source,
    })?;
    match base_url.scheme() {
      "http" | "https" => {}
      other => return Err(LibraryError::UnsupportedScheme(other.to_string())),
    }
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .danger_accept_invalid_certs(config.skip_tls_verify)
      .build()?;

    Ok(Self {
      base_url,
      bearer_token: config.bearer_token.filter(|t| !t.is_empty()),
      user_agent: config.user_agent.filter(|ua| !ua.is_empty()),
      http,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn endpoint(&self, path: &str) -> Result<Url, LibraryError> {
    self.base_url.join(path).map_err(|source| LibraryError::InvalidBaseUrl {
      url: path.to_string(),
      source,
    })
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let mut req = self.http.request(method, url);
    if let Some(token) = &self.bearer_token {
      req = req.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    if let Some(ua) = &self.user_agent {
      req = req.header(USER_AGENT, ua);
    }
    req
  }

  pub async fn download_image<W: Write + Send + ?Sized>(
    &self,
    writer: &mut W,
    arch: &str,
    path: &str,
    tag: &str,
  ) -> Result<u64, LibraryError> {
    let tag = if tag.is_empty() { "latest" } else { tag };
    let mut url = self.endpoint(&format!("v1/imagefile/{}:{}", path.trim_start_matches('/'), tag))?;
    url.query_pairs_mut().append_pair("arch", arch);
    debug!(url = %url, "downloading image");

    let res = self.request(Method::GET, url).send().await?;
    if !res.status().is_success() {
      return Err(http_error(res).await.into());
    }

    let mut written = 0u64;
    let mut body = res.bytes_stream();
    while let Some(chunk) = body.next().await {
      let chunk = chunk?;
      writer.write_all(&chunk)?;
      written += chunk.len() as u64;
    }
    writer.flush()?;

    info!(path, tag, arch, bytes = written, "image downloaded");
    Ok(written)
  }

  pub async fn upload_image(&self, file: &Path, path: &str, arch: &str, tags: &[String]) -> Result<(), LibraryError> {
    let (size, digest) = file_digest(file)?;

    let mut url = self.endpoint(&format!("v1/imagefile/{}", path.trim_start_matches('/')))?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("arch", arch);
      for tag in tags {
        query.append_pair("tag", tag);
      }
    }
    debug!(url = %url, size, digest = %digest, "uploading image");

    let body = tokio::fs::File::open(file).await?;
    let res = self
      .request(Method::PUT, url)
      .header(CONTENT_TYPE, "application/octet-stream")
      .header(CONTENT_LENGTH, size)
      .header(CHECKSUM_HEADER, &digest)
      .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
      .send()
      .await?;
    if !res.status().is_success() {
      return Err(http_error(res).await.into());
    }

    info!(path, arch, digest = %digest, "image uploaded");
    Ok(())
  }
}

fn file_digest(path: &Path) -> Result<(u64, String), LibraryError> {
  let mut file = std::fs::File::open(path)?;
  let mut hashing = HashingWriter::new(std::io::sink());
  let size = std::io::copy(&mut file, &mut hashing)?;
  let (_, hex_digest) = hashing.finish();
  Ok((size, format_digest(&hex_digest)))
}

#[async_trait]
impl ImageLibrary for LibraryClient {
  async fn download_image(
    &self,
    writer: &mut (dyn Write + Send),
    arch: &str,
    path: &str,
    tag: &str,
  ) -> Result<u64, LibraryError> {
    LibraryClient::download_image(self, writer, arch, path, tag).await
  }

  async fn upload_image(&self, file: &Path, path: &str, arch: &str, tags: &[String]) -> Result<(), LibraryError> {
    LibraryClient::upload_image(self, file, path, arch, tags).await
  }
}
