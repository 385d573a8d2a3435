//! Signing with a raw Ed25519 private key.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signer, SigningKey};
use tracing::info;

use super::embed::{SignatureBlock, embed_signature};
use super::{ImageSigner, SignError, unix_now};

/// Signs with an Ed25519 key read from a PKCS#8 PEM file.
pub struct KeyFileSigner {
  key: SigningKey,
  path: PathBuf,
}

impl KeyFileSigner {
  pub fn from_file(path: &Path) -> Result<Self, SignError> {
    let pem = std::fs::read_to_string(path).map_err(|source| SignError::KeyFile {
      path: path.to_path_buf(),
      source,
    })?;
    let key = SigningKey::from_pkcs8_pem(&pem).map_err(|e| SignError::InvalidKeyFile {
      path: path.to_path_buf(),
      reason: e.to_string(),
    })?;
    Ok(Self {
      key,
      path: path.to_path_buf(),
    })
  }

  /// Hex of the public key.
  pub fn key_id(&self) -> String {
    hex::encode(self.key.verifying_key().to_bytes())
  }
}

impl ImageSigner for KeyFileSigner {
  fn sign(&self, image: &Path) -> Result<SignatureBlock, SignError> {
    let block = embed_signature(image, |digest| {
      Ok(SignatureBlock {
        method: "ed25519".to_string(),
        key_id: self.key_id(),
        digest: digest.to_string(),
        signature: STANDARD.encode(self.key.sign(digest.as_bytes()).to_bytes()),
        created: unix_now(),
      })
    })?;
    info!(image = %image.display(), key = %self.path.display(), "image signed");
    Ok(block)
  }
}
