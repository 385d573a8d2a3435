//! Image library references and the library client.

mod client;

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::client::HttpError;

pub use self::client::{ImageLibrary, LibraryClient, LibraryConfig};

const SCHEME: &str = "library";

#[derive(Debug, Error)]
pub enum LibraryError {
  #[error("malformed library reference '{reference}': {reason}")]
  MalformedLibraryRef { reference: String, reason: &'static str },

  #[error("unsupported reference scheme '{0}'")]
  UnsupportedRefScheme(String),

  #[error("invalid library URL '{url}'")]
  InvalidBaseUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },

  #[error("unsupported library URL scheme '{0}'")]
  UnsupportedScheme(String),

  #[error(transparent)]
  Http(#[from] HttpError),

  #[error("library request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error(transparent)]
  Io(#[from] io::Error),
}

/// A parsed `library:` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryRef {
  pub host: Option<String>,
  /// One to three slash-separated components: `[entity/[collection/]]container`.
  pub path: String,
  pub tags: Vec<String>,
}

impl LibraryRef {
  /// Parse `library:path`, `library:/path`, `library://path` or
  /// `library://host/path`, each with an optional `:tag[,tag...]` suffix.
  ///
  /// With `library://` the first component is a host only when four
  /// components are present.
  pub fn parse(reference: &str) -> Result<Self, LibraryError> {
    let malformed = |reason| LibraryError::MalformedLibraryRef {
      reference: reference.to_string(),
      reason,
    };

    let rest = reference
      .strip_prefix(SCHEME)
      .and_then(|r| r.strip_prefix(':'))
      .ok_or_else(|| malformed("scheme must be 'library'"))?;
    let (authority, rest) = match rest.strip_prefix("//") {
      Some(r) => (true, r),
      None => (false, rest.strip_prefix('/').unwrap_or(rest)),
    };

    let mut components: Vec<&str> = rest.split('/').collect();
    if components.len() > 4 || (!authority && components.len() > 3) {
      return Err(malformed("too many path components"));
    }
    let host = if components.len() == 4 {
      Some(components.remove(0).to_string())
    } else {
      None
    };

    let last = components.pop().unwrap_or_default();
    let (name, tags) = match last.split_once(':') {
      Some((name, tags)) => {
        let tags: Vec<String> = tags.split(',').map(str::to_string).collect();
        if tags.iter().any(String::is_empty) {
          return Err(malformed("empty tag"));
        }
        (name, tags)
      }
      None => (last, Vec::new()),
    };
    components.push(name);

    if components.iter().any(|c| c.is_empty()) || host.as_deref() == Some("") {
      return Err(malformed("empty path component"));
    }

    Ok(Self {
      host,
      path: components.join("/"),
      tags,
    })
  }

  pub fn without_host(&self) -> Self {
    Self {
      host: None,
      ..self.clone()
    }
  }

  /// The first tag, if any.
  pub fn tag(&self) -> Option<&str> {
    self.tags.first().map(String::as_str)
  }
}

impl fmt::Display for LibraryRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.host {
      Some(host) => write!(f, "{}://{}/{}", SCHEME, host, self.path)?,
      None => write!(f, "{}:{}", SCHEME, self.path)?,
    }
    if !self.tags.is_empty() {
      write!(f, ":{}", self.tags.join(","))?;
    }
    Ok(())
  }
}

/// Split a service-reported reference such as `library://user/col/img:tag`
/// into its path and tag. The tag is empty when absent.
pub fn split_path_tag(reference: &str) -> (String, String) {
  let rest = reference
    .strip_prefix("library://")
    .or_else(|| reference.strip_prefix("library:"))
    .unwrap_or(reference);
  let rest = rest.trim_start_matches('/');
  match rest.split_once(':') {
    Some((path, tag)) => (path.to_string(), tag.to_string()),
    None => (rest.to_string(), String::new()),
  }
}

/// Where a built image goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
  /// Left on the build service for a limited time.
  Ephemeral,
  /// Published to the library. `host` is the host named in the reference,
  /// kept for endpoint discovery; `reference` never carries it.
  Library { reference: LibraryRef, host: Option<String> },
  /// Downloaded to a local file.
  File(PathBuf),
}

impl Destination {
  /// Interpret an image destination argument. No argument means ephemeral.
  pub fn parse(arg: Option<&str>) -> Result<Self, LibraryError> {
    let Some(arg) = arg.filter(|a| !a.is_empty()) else {
      return Ok(Self::Ephemeral);
    };

    if arg.starts_with("library:") {
      let parsed = LibraryRef::parse(arg)?;
      return Ok(Self::Library {
        reference: parsed.without_host(),
        host: parsed.host,
      });
    }

    match uri_scheme(arg) {
      None => Ok(Self::File(PathBuf::from(arg))),
      Some("file") => {
        let path = arg
          .strip_prefix("file://")
          .or_else(|| arg.strip_prefix("file:"))
          .unwrap_or(arg);
        Ok(Self::File(PathBuf::from(path)))
      }
      Some(other) => Err(LibraryError::UnsupportedRefScheme(other.to_string())),
    }
  }
}

/// The scheme of `s` when it starts with one (`alpha *( alpha / digit / "+" / "-" / "." ) ":"`).
pub(crate) fn uri_scheme(s: &str) -> Option<&str> {
  let (scheme, _) = s.split_once(':')?;
  let mut chars = scheme.chars();
  let first = chars.next()?;
  if !first.is_ascii_alphabetic() || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
    return None;
  }
  Some(scheme)
}
