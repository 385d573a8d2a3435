//! Image signing.
//!
//! An image is signed in place: a signature block over the SHA-256 of the
//! image is appended to the file (see [`embed`]). Keys come either from an
//! OpenPGP keyring or from an Ed25519 private key file.

pub mod embed;
mod key;
mod keyring;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ::pgp::SignedSecretKey;
use ::pgp::errors::Error as PgpError;
use ::pgp::types::KeyTrait;
use thiserror::Error;

pub use self::embed::{SignatureBlock, read_signature};
pub use self::key::KeyFileSigner;
pub use self::keyring::{PgpSigner, fingerprint, read_secret_keys, select_key};

#[derive(Debug, Error)]
pub enum SignError {
  #[error("unable to determine keyring path: neither XDG_CONFIG_HOME nor HOME set")]
  KeyringPath,

  #[error("cannot read keyring {}: {source}", path.display())]
  Keyring {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("key read: {0}")]
  KeyRead(#[source] PgpError),

  #[error("key not found")]
  KeyNotFound,

  #[error("private key not found")]
  NoPrivateKeyFound,

  #[error("index out of range")]
  IndexOutOfRange,

  #[error("key decrypt: {0}")]
  DecryptFailed(#[source] PgpError),

  #[error("key {fingerprint} cannot sign ({algorithm} keys are not signing keys)")]
  UnsupportedKey { fingerprint: String, algorithm: String },

  #[error("signing failed: {0}")]
  Pgp(#[source] PgpError),

  #[error("cannot read key file {}: {source}", path.display())]
  KeyFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid private key in {}: {reason}", path.display())]
  InvalidKeyFile { path: PathBuf, reason: String },

  /// The user could not be asked, or gave an unusable answer.
  #[error("{0}")]
  Prompt(String),

  #[error("corrupt signature block: {0}")]
  Block(#[from] serde_json::Error),

  #[error(transparent)]
  Io(#[from] io::Error),
}

/// How to pick a key out of a keyring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
  /// Full fingerprint, any case.
  Fingerprint(String),
  /// Position among the private keys.
  Index(usize),
  /// The only private key, or whichever the user picks.
  Interactive,
}

/// Signing configuration chosen on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningMethod {
  Pgp {
    /// Defaults to the user's `secring.gpg`.
    keyring: Option<PathBuf>,
    selector: KeySelector,
    passphrase: Option<String>,
  },
  KeyFile(PathBuf),
}

/// A keyring key as offered for interactive selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySummary {
  pub index: usize,
  /// Uppercase hex.
  pub fingerprint: String,
  pub user_ids: Vec<String>,
  /// Seconds since the Unix epoch.
  pub created: u64,
  /// Public key algorithm, e.g. `RSA` or `EdDSA`.
  pub algorithm: String,
}

impl KeySummary {
  pub fn new(index: usize, key: &SignedSecretKey) -> Self {
    Self {
      index,
      fingerprint: fingerprint(key),
      user_ids: key.details.users.iter().map(|u| u.id.id().to_string()).collect(),
      created: u64::try_from(key.primary_key.created_at().timestamp()).unwrap_or_default(),
      algorithm: format!("{:?}", key.algorithm()),
    }
  }
}

/// User interaction needed while preparing a signing key.
pub trait Prompter: Send + Sync {
  /// Pick one of `keys`, returning its index.
  fn select_key(&self, keys: &[KeySummary]) -> Result<usize, SignError>;

  fn passphrase(&self, prompt: &str) -> Result<String, SignError>;

  /// Progress information for the user.
  fn notice(&self, _message: &str) {}
}

/// Signs image files in place.
pub trait ImageSigner: Send + Sync {
  fn sign(&self, image: &Path) -> Result<SignatureBlock, SignError>;
}

/// Keyring to use when none is given.
pub fn keyring_path(explicit: Option<&Path>) -> Result<PathBuf, SignError> {
  if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
    return Ok(path.to_path_buf());
  }

  for var in ["XDG_CONFIG_HOME", "HOME"] {
    if let Some(dir) = std::env::var_os(var).filter(|v| !v.is_empty()) {
      return Ok(PathBuf::from(dir).join(".gnupg").join("secring.gpg"));
    }
  }

  Err(SignError::KeyringPath)
}

/// Build the signer for `method`, unlocking keys up front.
pub fn signer_for(method: &SigningMethod, prompter: &dyn Prompter) -> Result<Arc<dyn ImageSigner>, SignError> {
  match method {
    SigningMethod::Pgp {
      keyring,
      selector,
      passphrase,
    } => {
      let keyring = keyring_path(keyring.as_deref())?;
      let signer = PgpSigner::from_keyring(&keyring, selector, passphrase.as_deref(), prompter)?;
      Ok(Arc::new(signer))
    }
    SigningMethod::KeyFile(path) => Ok(Arc::new(KeyFileSigner::from_file(path)?)),
  }
}

pub(crate) fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use serial_test::serial;

  use super::*;

  struct NoPrompt;

  impl Prompter for NoPrompt {
    fn select_key(&self, _keys: &[KeySummary]) -> Result<usize, SignError> {
      Err(SignError::Prompt("not interactive".into()))
    }

    fn passphrase(&self, _prompt: &str) -> Result<String, SignError> {
      Err(SignError::Prompt("not interactive".into()))
    }
  }

  #[test]
  #[serial]
  fn keyring_path_prefers_explicit() {
    temp_env::with_vars([("XDG_CONFIG_HOME", Some("/xdg")), ("HOME", Some("/home/u"))], || {
      assert_eq!(
        keyring_path(Some(Path::new("/keys/ring.gpg"))).unwrap(),
        PathBuf::from("/keys/ring.gpg")
      );
    });
  }

  #[test]
  #[serial]
  fn keyring_path_from_xdg_then_home() {
    temp_env::with_vars([("XDG_CONFIG_HOME", Some("/xdg")), ("HOME", Some("/home/u"))], || {
      assert_eq!(keyring_path(None).unwrap(), PathBuf::from("/xdg/.gnupg/secring.gpg"));
    });
    temp_env::with_vars([("XDG_CONFIG_HOME", None::<&str>), ("HOME", Some("/home/u"))], || {
      assert_eq!(keyring_path(None).unwrap(), PathBuf::from("/home/u/.gnupg/secring.gpg"));
    });
  }

  #[test]
  #[serial]
  fn keyring_path_without_environment() {
    temp_env::with_vars([("XDG_CONFIG_HOME", None::<&str>), ("HOME", None)], || {
      let err = keyring_path(None).unwrap_err();
      assert!(matches!(err, SignError::KeyringPath));
      assert_eq!(
        err.to_string(),
        "unable to determine keyring path: neither XDG_CONFIG_HOME nor HOME set"
      );
    });
  }

  #[test]
  fn signer_for_key_file_reports_missing_file() {
    let err = signer_for(&SigningMethod::KeyFile("/nonexistent.pem".into()), &NoPrompt)
      .err()
      .unwrap();
    assert!(matches!(err, SignError::KeyFile { .. }));
  }

  #[test]
  fn signer_for_pgp_keyring() {
    let keyring = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/secring.gpg");
    let method = SigningMethod::Pgp {
      keyring: Some(keyring),
      selector: KeySelector::Index(1),
      passphrase: None,
    };
    assert!(signer_for(&method, &NoPrompt).is_ok());
  }
}
