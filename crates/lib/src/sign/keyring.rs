//! Signing with a key from an OpenPGP keyring.

use std::io::Cursor;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pgp::composed::signed_key::{PublicOrSecret, from_reader_many};
use pgp::crypto::hash::HashAlgorithm;
use pgp::ser::Serialize;
use pgp::types::{KeyTrait, SecretKeyTrait};
use pgp::{Message, SignedSecretKey};
use tracing::{debug, info};

use super::embed::{SignatureBlock, embed_signature};
use super::{ImageSigner, KeySelector, KeySummary, Prompter, SignError, unix_now};

/// Signs with a keyring key whose passphrase has been checked.
#[derive(Debug)]
pub struct PgpSigner {
  key: SignedSecretKey,
  passphrase: String,
}

/// Uppercase hex fingerprint of `key`.
pub fn fingerprint(key: &SignedSecretKey) -> String {
  hex::encode_upper(key.fingerprint())
}

/// Secret keys in `data`, binary or ASCII armored. Public-only entries are
/// skipped.
pub fn read_secret_keys(data: &[u8]) -> Result<Vec<SignedSecretKey>, SignError> {
  let (keys, _) = from_reader_many(Cursor::new(data)).map_err(SignError::KeyRead)?;
  let mut secret = Vec::new();
  for key in keys {
    match key.map_err(SignError::KeyRead)? {
      PublicOrSecret::Secret(key) => secret.push(key),
      PublicOrSecret::Public(_) => {}
    }
  }
  Ok(secret)
}

impl PgpSigner {
  /// Load `keyring`, pick a private key with `selector` and unlock it.
  ///
  /// The passphrase is only asked for when the key is protected and none was
  /// given.
  pub fn from_keyring(
    keyring: &Path,
    selector: &KeySelector,
    passphrase: Option<&str>,
    prompter: &dyn Prompter,
  ) -> Result<Self, SignError> {
    let data = std::fs::read(keyring).map_err(|source| SignError::Keyring {
      path: keyring.to_path_buf(),
      source,
    })?;
    prompter.notice(&format!("Using keyfile: {}", keyring.display()));

    let mut keys = read_secret_keys(&data)?;
    if keys.is_empty() {
      return Err(SignError::NoPrivateKeyFound);
    }

    let key = keys.swap_remove(select_key(&keys, selector, prompter)?);
    for user in &key.details.users {
      prompter.notice(&format!("Using Key: {}", user.id.id()));
    }

    if !key.is_signing_key() {
      return Err(SignError::UnsupportedKey {
        fingerprint: fingerprint(&key),
        algorithm: format!("{:?}", key.algorithm()),
      });
    }

    let passphrase = if key.primary_key.secret_params().is_encrypted() {
      match passphrase {
        Some(p) => p.to_string(),
        None => prompter.passphrase("Keyring passphrase: ")?,
      }
    } else {
      String::new()
    };
    let attempt = passphrase.clone();
    key.unlock(move || attempt, |_| Ok(())).map_err(SignError::DecryptFailed)?;

    debug!(fingerprint = %fingerprint(&key), "unlocked signing key");
    Ok(Self { key, passphrase })
  }

  pub fn fingerprint(&self) -> String {
    fingerprint(&self.key)
  }

  /// Detached binary signature over `data`.
  fn detached_signature(&self, data: &[u8]) -> Result<Vec<u8>, SignError> {
    let passphrase = self.passphrase.clone();
    let signed = Message::new_literal_bytes("", data)
      .sign(&self.key, move || passphrase, HashAlgorithm::SHA2_256)
      .map_err(SignError::Pgp)?;
    signed.into_signature().to_bytes().map_err(SignError::Pgp)
  }
}

/// Index of the key `selector` picks out of `keys`.
pub fn select_key(keys: &[SignedSecretKey], selector: &KeySelector, prompter: &dyn Prompter) -> Result<usize, SignError> {
  match selector {
    KeySelector::Fingerprint(wanted) => keys
      .iter()
      .position(|k| fingerprint(k).eq_ignore_ascii_case(wanted))
      .ok_or(SignError::KeyNotFound),
    KeySelector::Index(index) if *index < keys.len() => Ok(*index),
    KeySelector::Index(_) => Err(SignError::KeyNotFound),
    KeySelector::Interactive if keys.len() == 1 => Ok(0),
    KeySelector::Interactive => {
      let summaries: Vec<KeySummary> = keys.iter().enumerate().map(|(i, k)| KeySummary::new(i, k)).collect();
      match prompter.select_key(&summaries)? {
        index if index < keys.len() => Ok(index),
        _ => Err(SignError::IndexOutOfRange),
      }
    }
  }
}

impl ImageSigner for PgpSigner {
  fn sign(&self, image: &Path) -> Result<SignatureBlock, SignError> {
    let block = embed_signature(image, |digest| {
      Ok(SignatureBlock {
        method: "pgp".to_string(),
        key_id: self.fingerprint(),
        digest: digest.to_string(),
        signature: STANDARD.encode(self.detached_signature(digest.as_bytes())?),
        created: unix_now(),
      })
    })?;
    info!(image = %image.display(), fingerprint = %self.fingerprint(), "image signed");
    Ok(block)
  }
}
