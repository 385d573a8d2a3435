//! Hashing utilities for content-addressed build contexts and artifacts.
//!
//! Digests exchanged with the build service use the `sha256.<hex>` form rather
//! than the more common `sha256:<hex>`.

use std::io::{self, Write};

use sha2::{Digest, Sha256};

use crate::consts::DIGEST_PREFIX;

/// A writer that forwards every byte to an inner writer while hashing it.
///
/// Only bytes the inner writer accepted are hashed, so the digest always
/// matches what actually went downstream.
pub struct HashingWriter<W> {
  inner: W,
  hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
  pub fn new(inner: W) -> Self {
    Self {
      inner,
      hasher: Sha256::new(),
    }
  }

  /// Consume the writer, returning the inner writer and the lowercase hex digest.
  pub fn finish(self) -> (W, String) {
    (self.inner, hex::encode(self.hasher.finalize()))
  }
}

impl<W: Write> Write for HashingWriter<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = self.inner.write(buf)?;
    self.hasher.update(&buf[..n]);
    Ok(n)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

/// Format a hex SHA-256 as a service digest, e.g. `sha256.ab12…`.
pub fn format_digest(hex_digest: &str) -> String {
  format!("{}{}", DIGEST_PREFIX, hex_digest)
}

/// Extract the hex part of a `sha256.<hex>` digest.
///
/// The algorithm name is matched case-insensitively. Returns `None` for any
/// other algorithm or a value without a separator.
pub fn parse_digest(digest: &str) -> Option<&str> {
  let (algo, hex_digest) = digest.split_once('.')?;
  if algo.eq_ignore_ascii_case("sha256") && !hex_digest.is_empty() {
    Some(hex_digest)
  } else {
    None
  }
}

/// Hash arbitrary bytes, returning lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
  hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hashing_writer_matches_direct_hash() {
    let mut w = HashingWriter::new(Vec::new());
    w.write_all(b"hello ").unwrap();
    w.write_all(b"world").unwrap();
    let (inner, digest) = w.finish();

    assert_eq!(inner, b"hello world");
    assert_eq!(digest, hash_bytes(b"hello world"));
  }

  #[test]
  fn format_and_parse_digest() {
    let digest = format_digest("abc123");
    assert_eq!(digest, "sha256.abc123");
    assert_eq!(parse_digest(&digest), Some("abc123"));
    assert_eq!(parse_digest("SHA256.abc123"), Some("abc123"));
    assert_eq!(parse_digest("sha512.abc123"), None);
    assert_eq!(parse_digest("sha256abc"), None);
    assert_eq!(parse_digest("sha256."), None);
  }
}
