//! Wire types exchanged with the build service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Status of a remote build, as returned by submit and status requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
  pub id: String,
  #[serde(default)]
  pub is_complete: bool,
  #[serde(default)]
  pub image_size: i64,
  /// `sha256.<hex>` of the built image.
  #[serde(default)]
  pub image_checksum: String,
  /// Where the image was published, e.g. `library://user/collection/image:tag`.
  #[serde(default)]
  pub library_ref: String,
  #[serde(default, rename = "libraryURL")]
  pub library_url: String,
}

impl BuildInfo {
  /// A build succeeded when it completed and produced a non-empty image.
  pub fn succeeded(&self) -> bool {
    self.is_complete && self.image_size > 0
  }
}

/// Per-submission options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
  /// Requested architecture. The service picks its default when unset.
  pub arch: Option<String>,
  /// Hostless library reference to publish to.
  pub library_ref: Option<String>,
  /// Library the builder should pull base images from.
  pub library_url: Option<String>,
  /// Digest of a previously uploaded build context.
  pub context_digest: Option<String>,
  /// Directory relative paths in the definition resolve against.
  pub working_dir: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubmitRequest<'a> {
  pub definition_raw: String,
  pub library_ref: &'a str,
  #[serde(rename = "libraryURL", skip_serializing_if = "Option::is_none")]
  pub library_url: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub builder_requirements: Option<BTreeMap<&'static str, &'a str>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub context_digest: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct UploadLocationRequest<'a> {
  pub size: u64,
  pub digest: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VersionInfo {
  pub version: String,
}

/// Response envelope: `{"data": ...}` on success, `{"error": {...}}` otherwise.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
  pub data: Option<T>,
  pub error: Option<ErrorBody>,
}

/// The error member of an envelope. Any `code` it carries is ignored in favor
/// of the HTTP status.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
  #[serde(default)]
  pub message: String,
}
