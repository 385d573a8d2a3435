//! Signature blocks embedded at the end of an image file.
//!
//! Layout: `payload | block JSON | block length (u64 LE) | MAGIC`. The digest
//! in the block covers the payload only, so re-signing replaces the block
//! instead of stacking another one on top.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::SignError;
use crate::util::hash::{HashingWriter, format_digest};

pub const MAGIC: &[u8; 8] = b"RBSIG\0\0\x01";

const TRAILER_LEN: u64 = 16;

/// Signature metadata stored with an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureBlock {
  /// `pgp` or `ed25519`.
  pub method: String,
  /// PGP fingerprint or hex public key.
  pub key_id: String,
  /// `sha256.<hex>` of the payload.
  pub digest: String,
  /// Base64 of the signature over the digest string.
  pub signature: String,
  /// Seconds since the Unix epoch.
  pub created: u64,
}

/// Length of the payload and of the block JSON, if a block is present.
fn locate(file: &mut File) -> io::Result<(u64, Option<u64>)> {
  let len = file.seek(SeekFrom::End(0))?;
  if len < TRAILER_LEN {
    return Ok((len, None));
  }

  let mut trailer = [0u8; TRAILER_LEN as usize];
  file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
  file.read_exact(&mut trailer)?;
  if &trailer[8..] != MAGIC {
    return Ok((len, None));
  }

  let mut block_len = [0u8; 8];
  block_len.copy_from_slice(&trailer[..8]);
  let block_len = u64::from_le_bytes(block_len);
  match len.checked_sub(TRAILER_LEN).and_then(|l| l.checked_sub(block_len)) {
    Some(payload) => Ok((payload, Some(block_len))),
    None => Ok((len, None)),
  }
}

/// The embedded signature of the image at `path` and the signed payload
/// length, or `None` when the image is unsigned.
pub fn read_signature(path: &Path) -> Result<Option<(SignatureBlock, u64)>, SignError> {
  let mut file = File::open(path)?;
  let (payload, Some(block_len)) = locate(&mut file)? else {
    return Ok(None);
  };

  file.seek(SeekFrom::Start(payload))?;
  let mut json = Vec::new();
  Read::by_ref(&mut file).take(block_len).read_to_end(&mut json)?;
  let block = serde_json::from_slice(&json)?;
  Ok(Some((block, payload)))
}

/// Hash the payload of `path`, have `sign` produce a block for the digest and
/// write it in place of any existing block.
pub(crate) fn embed_signature<F>(path: &Path, sign: F) -> Result<SignatureBlock, SignError>
where
  F: FnOnce(&str) -> Result<SignatureBlock, SignError>,
{
  let mut file = OpenOptions::new().read(true).write(true).open(path)?;
  let (payload, _) = locate(&mut file)?;

  file.seek(SeekFrom::Start(0))?;
  let mut hashing = HashingWriter::new(io::sink());
  io::copy(&mut Read::by_ref(&mut file).take(payload), &mut hashing)?;
  let (_, hex_digest) = hashing.finish();

  let block = sign(&format_digest(&hex_digest))?;
  let json = serde_json::to_vec(&block)?;

  file.set_len(payload)?;
  file.seek(SeekFrom::End(0))?;
  file.write_all(&json)?;
  file.write_all(&(json.len() as u64).to_le_bytes())?;
  file.write_all(MAGIC)?;
  file.sync_all()?;

  Ok(block)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::hash::hash_bytes;

  fn block(digest: &str, signature: &str) -> SignatureBlock {
    SignatureBlock {
      method: "test".into(),
      key_id: "k".into(),
      digest: digest.to_string(),
      signature: signature.to_string(),
      created: 1,
    }
  }

  #[test]
  fn unsigned_file_has_no_block() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("img");
    std::fs::write(&path, b"short").unwrap();
    assert!(read_signature(&path).unwrap().is_none());
  }

  #[test]
  fn embed_then_read() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("img");
    std::fs::write(&path, b"image payload").unwrap();

    let written = embed_signature(&path, |digest| Ok(block(digest, "sig-1"))).unwrap();
    assert_eq!(written.digest, format_digest(&hash_bytes(b"image payload")));

    let (read, payload) = read_signature(&path).unwrap().unwrap();
    assert_eq!(read, written);
    assert_eq!(payload, 13);

    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.starts_with(b"image payload"));
    assert!(bytes.ends_with(MAGIC));
  }

  #[test]
  fn resigning_replaces_block() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("img");
    std::fs::write(&path, b"image payload").unwrap();

    let first = embed_signature(&path, |digest| Ok(block(digest, "sig-1"))).unwrap();
    let len_after_first = std::fs::metadata(&path).unwrap().len();
    let second = embed_signature(&path, |digest| Ok(block(digest, "sig-2"))).unwrap();

    assert_eq!(first.digest, second.digest);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), len_after_first);
    assert_eq!(read_signature(&path).unwrap().unwrap().0.signature, "sig-2");
  }

  #[test]
  fn failed_signing_leaves_file_untouched() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("img");
    std::fs::write(&path, b"image payload").unwrap();

    let err = embed_signature(&path, |_| Err(SignError::KeyNotFound)).unwrap_err();
    assert!(matches!(err, SignError::KeyNotFound));
    assert_eq!(std::fs::read(&path).unwrap(), b"image payload");
  }
}
