//! Build-context upload and deletion.
//!
//! The context is a gzipped tar of the local files a definition copies in. It
//! is spooled to a temporary file because its size must be announced before
//! the upload starts, and identified by the SHA-256 of the uncompressed tar so
//! the service can skip uploads it already holds.

use std::fs::File;
use std::io::{Seek, SeekFrom};

use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::Method;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use url::Url;

use super::types::UploadLocationRequest;
use super::{BuildClient, ClientError, check_status};
use crate::archive::fs::FileSystem;
use crate::archive::write_archive;
use crate::util::hash::{HashingWriter, format_digest};

/// A spooled, compressed build context.
#[derive(Debug)]
pub struct ContextArchive {
  /// Rewound to the start.
  pub file: File,
  /// Compressed size in bytes.
  pub size: u64,
  /// `sha256.<hex>` over the uncompressed tar stream.
  pub digest: String,
}

/// Archive `paths` from `fs` into `file` through gzip.
pub fn write_context_archive<F: FileSystem + ?Sized>(
  fs: &F,
  paths: &[String],
  file: File,
) -> Result<ContextArchive, ClientError> {
  let gz = GzEncoder::new(file, Compression::default());
  let hashing = write_archive(fs, paths, HashingWriter::new(gz))?;
  let (gz, hex_digest) = hashing.finish();

  let mut file = gz.finish()?;
  let size = file.stream_position()?;
  file.seek(SeekFrom::Start(0))?;

  Ok(ContextArchive {
    file,
    size,
    digest: format_digest(&hex_digest),
  })
}

impl BuildClient {
  /// Archive `paths` from `fs` and upload the result unless the service
  /// already has a context with the same digest. Returns the digest.
  ///
  /// Archiving runs on the blocking pool, so dropping this future while the
  /// tar is being written returns control to the caller immediately.
  pub async fn upload_build_context<F>(&self, paths: &[String], fs: F) -> Result<String, ClientError>
  where
    F: FileSystem + Send + 'static,
  {
    if paths.is_empty() {
      return Err(ClientError::NoPathsSpecified);
    }

    let owned = paths.to_vec();
    let archive = tokio::task::spawn_blocking(move || -> Result<ContextArchive, ClientError> {
      write_context_archive(&fs, &owned, tempfile::tempfile()?)
    })
    .await??;
    info!(digest = %archive.digest, size = archive.size, "build context archived");

    let location = self
      .upload_location(archive.size, &archive.digest)
      .await
      .map_err(|e| ClientError::UploadLocation(Box::new(e)))?;

    let Some(location) = location else {
      info!(digest = %archive.digest, "build context already present");
      return Ok(archive.digest);
    };

    self
      .put_build_context(location, archive.file, archive.size)
      .await
      .map_err(|e| ClientError::Upload(Box::new(e)))?;

    info!(digest = %archive.digest, "build context uploaded");
    Ok(archive.digest)
  }

  /// Remove an uploaded build context.
  pub async fn delete_build_context(&self, digest: &str) -> Result<(), ClientError> {
    let url = self.endpoint(&format!("v1/build-context/{}", digest))?;
    debug!(digest, "deleting build context");
    let res = self.request(Method::DELETE, url).send().await?;
    check_status(res).await
  }

  /// `None` when the service already holds the context.
  async fn upload_location(&self, size: u64, digest: &str) -> Result<Option<Url>, ClientError> {
    let url = self.endpoint("v1/build-context")?;
    let res = self
      .request(Method::POST, url)
      .json(&UploadLocationRequest { size, digest })
      .send()
      .await?;

    let location = res
      .headers()
      .get(LOCATION)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string)
      .filter(|l| !l.is_empty());
    check_status(res).await?;

    match location {
      Some(l) => Ok(Some(self.endpoint(&l)?)),
      None => Ok(None),
    }
  }

  /// The location is pre-authorized, so no bearer token is sent.
  async fn put_build_context(&self, location: Url, file: File, size: u64) -> Result<(), ClientError> {
    debug!(location = %location, size, "uploading build context");
    let stream = ReaderStream::new(tokio::fs::File::from_std(file));
    let res = self
      .unauthenticated(Method::PUT, location)
      .header(CONTENT_TYPE, "application/octet-stream")
      .header(CONTENT_LENGTH, size)
      .body(reqwest::Body::wrap_stream(stream))
      .send()
      .await?;
    check_status(res).await
  }
}
