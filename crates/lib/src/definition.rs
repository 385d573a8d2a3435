//! Build definitions: where they come from and which local files they copy in.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::client::{BuildClient, ClientError, read_data};
use crate::library::uri_scheme;

/// Bootstrap sources a build spec URI may name.
pub const BOOTSTRAP_SOURCES: &[&str] = &[
  "library",
  "docker",
  "docker-archive",
  "docker-daemon",
  "oci",
  "oci-archive",
  "oras",
  "shub",
  "localimage",
  "scratch",
  "busybox",
  "debootstrap",
  "arch",
  "yum",
  "dnf",
  "zypper",
];

#[derive(Debug, Error)]
pub enum DefinitionError {
  #[error("invalid build spec '{0}': unknown bootstrap source")]
  InvalidBuildSpec(String),

  #[error("error reading def file {}: {source}", path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("def file parse error: {0}")]
  Parse(#[source] ClientError),
}

/// What to build from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSpec {
  /// A bootstrap source such as `docker://alpine:3`.
  Uri { scheme: String, reference: String },
  /// A definition file on disk.
  File(PathBuf),
}

impl BuildSpec {
  /// Classify `spec`. Anything with a known scheme is a URI, an unknown scheme
  /// followed by `://` is an error, and the rest names a file.
  pub fn parse(spec: &str) -> Result<Self, DefinitionError> {
    if let Some((scheme, reference)) = spec.split_once("://") {
      if !BOOTSTRAP_SOURCES.contains(&scheme) {
        return Err(DefinitionError::InvalidBuildSpec(spec.to_string()));
      }
      return Ok(Self::Uri {
        scheme: scheme.to_string(),
        reference: reference.to_string(),
      });
    }

    if let Some(scheme) = uri_scheme(spec)
      && BOOTSTRAP_SOURCES.contains(&scheme)
    {
      return Ok(Self::Uri {
        scheme: scheme.to_string(),
        reference: spec[scheme.len() + 1..].to_string(),
      });
    }

    Ok(Self::File(PathBuf::from(spec)))
  }

  /// The raw definition: synthesized for URIs, read from disk for files.
  pub fn definition(&self) -> Result<Vec<u8>, DefinitionError> {
    match self {
      Self::Uri { scheme, reference } => Ok(format!("bootstrap: {}\nfrom: {}\n", scheme, reference).into_bytes()),
      Self::File(path) => std::fs::read(path).map_err(|source| DefinitionError::Read {
        path: path.clone(),
        source,
      }),
    }
  }
}

/// The parts of a parsed definition the client cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Definition {
  #[serde(rename = "buildData", default)]
  pub build_data: BuildData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BuildData {
  #[serde(default)]
  pub files: Vec<FilesSection>,
}

/// One `%files` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilesSection {
  #[serde(default)]
  pub args: String,
  #[serde(default)]
  pub files: Vec<FileTransfer>,
}

impl FilesSection {
  /// The build stage the section copies from, if any.
  ///
  /// `%files from <stage>` takes its sources from an earlier stage rather
  /// than the local machine.
  pub fn stage(&self) -> Option<&str> {
    let args = self.args.split('#').next().unwrap_or_default();
    match args.split_whitespace().collect::<Vec<_>>().as_slice() {
      [first, name] if *first != "stage" => Some(*name),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FileTransfer {
  pub source: String,
  #[serde(default)]
  pub destination: String,
}

impl FileTransfer {
  /// The source as a rootless slash-separated name, resolved against `cwd`.
  /// The root directory is `"."`.
  ///
  /// A backslash is a separator only where the platform says so. Elsewhere it
  /// is an ordinary name character; glob metacharacters are matched literally
  /// by bracketing them, as in `[*]`.
  pub fn source_path(&self, cwd: &Path) -> String {
    let source = to_slash(&self.source);
    let absolute = if source.starts_with('/') {
      source
    } else {
      format!("{}/{}", to_slash(&cwd.to_string_lossy()), source)
    };

    let cleaned = clean(&absolute);
    match cleaned.trim_start_matches('/') {
      "" => ".".to_string(),
      rest => rest.to_string(),
    }
  }
}

fn to_slash(path: &str) -> String {
  if std::path::MAIN_SEPARATOR == '\\' {
    path.replace('\\', "/")
  } else {
    path.to_string()
  }
}

/// Lexically clean an absolute slash-separated path.
fn clean(path: &str) -> String {
  let mut parts: Vec<&str> = Vec::new();
  for part in path.split('/') {
    match part {
      "" | "." => {}
      ".." => {
        parts.pop();
      }
      p => parts.push(p),
    }
  }
  format!("/{}", parts.join("/"))
}

impl Definition {
  /// Local source paths of every `%files` section not tied to a build stage.
  pub fn source_paths(&self, cwd: &Path) -> Vec<String> {
    self
      .build_data
      .files
      .iter()
      .filter(|section| section.stage().is_none())
      .flat_map(|section| section.files.iter().map(|f| f.source_path(cwd)))
      .collect()
  }
}

/// Turns a raw definition into its structured form.
#[async_trait]
pub trait DefinitionParser: Send + Sync {
  async fn parse(&self, raw: &[u8]) -> Result<Definition, DefinitionError>;
}

/// Parses definitions with the build service's converter endpoint.
#[derive(Debug, Clone)]
pub struct RemoteDefinitionParser {
  client: BuildClient,
}

impl RemoteDefinitionParser {
  pub fn new(client: BuildClient) -> Self {
    Self { client }
  }
}

#[async_trait]
impl DefinitionParser for RemoteDefinitionParser {
  async fn parse(&self, raw: &[u8]) -> Result<Definition, DefinitionError> {
    let url = self.client.endpoint("v1/convert-def-file").map_err(DefinitionError::Parse)?;
    debug!(url = %url, "parsing definition");

    let res = self
      .client
      .request(Method::POST, url)
      .body(raw.to_vec())
      .send()
      .await
      .map_err(|e| DefinitionError::Parse(e.into()))?;
    read_data(res).await.map_err(DefinitionError::Parse)
  }
}
