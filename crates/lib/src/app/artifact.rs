//! Downloading build artifacts and checking them against the reported checksum.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{App, AppError, until_cancelled};
use crate::client::BuildInfo;
use crate::library::split_path_tag;
use crate::util::hash::{HashingWriter, parse_digest};

/// Outcome of comparing a downloaded image with the service's checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumCheck {
  Verified,
  Mismatch { expected: String, actual: String },
  /// The service reported no checksum, or one in an unknown algorithm.
  Unchecked,
}

/// Compare `reported` (`sha256.<hex>`) with the hex digest of what was written.
pub fn verify_checksum(reported: &str, actual: &str) -> ChecksumCheck {
  match parse_digest(reported) {
    Some(expected) if expected == actual => ChecksumCheck::Verified,
    Some(expected) => ChecksumCheck::Mismatch {
      expected: expected.to_string(),
      actual: actual.to_string(),
    },
    None => ChecksumCheck::Unchecked,
  }
}

impl App {
  /// Download the image of `info` for `arch` into `path`, truncating it.
  ///
  /// A checksum mismatch is reported on the error stream but does not fail
  /// the download.
  pub(super) async fn retrieve_artifact(
    &mut self,
    info: &BuildInfo,
    path: &Path,
    arch: &str,
    cancel: &CancellationToken,
  ) -> Result<u64, AppError> {
    let file = File::create(path).map_err(|source| AppError::Artifact {
      path: path.to_path_buf(),
      source,
    })?;
    let mut writer = HashingWriter::new(file);

    let (image_path, tag) = split_path_tag(&info.library_ref);
    let written = until_cancelled(
      cancel,
      self.services.library.download_image(&mut writer, arch, &image_path, &tag),
    )
    .await?
    .map_err(|source| AppError::Download {
      reference: info.library_ref.clone(),
      source,
    })?;

    let (file, actual) = writer.finish();
    file.sync_all()?;
    info!(reference = %info.library_ref, bytes = written, path = %path.display(), "image downloaded");

    match verify_checksum(&info.image_checksum, &actual) {
      ChecksumCheck::Verified => writeln!(self.stderr, "Image checksum verified successfully.")?,
      ChecksumCheck::Mismatch { expected, actual } => {
        warn!(expected = %expected, actual = %actual, "image checksum mismatch");
        writeln!(
          self.stderr,
          "Error: image checksum mismatch (expecting {}, got {})",
          expected, actual
        )?;
      }
      ChecksumCheck::Unchecked => debug!(checksum = %info.image_checksum, "image checksum not verified"),
    }

    Ok(written)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn checksum_matches() {
    assert_eq!(verify_checksum("sha256.abc", "abc"), ChecksumCheck::Verified);
    assert_eq!(verify_checksum("SHA256.abc", "abc"), ChecksumCheck::Verified);
  }

  #[test]
  fn checksum_mismatch_names_both_sides() {
    assert_eq!(
      verify_checksum("sha256.abc", "def"),
      ChecksumCheck::Mismatch {
        expected: "abc".into(),
        actual: "def".into(),
      }
    );
  }

  #[test]
  fn unknown_or_missing_checksum_is_unchecked() {
    assert_eq!(verify_checksum("", "abc"), ChecksumCheck::Unchecked);
    assert_eq!(verify_checksum("md5.abc", "abc"), ChecksumCheck::Unchecked);
    assert_eq!(verify_checksum("abc", "abc"), ChecksumCheck::Unchecked);
  }
}
