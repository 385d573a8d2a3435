//! Multi-architecture build orchestration.
//!
//! [`App`] drives one build invocation: it uploads the build context once,
//! then for each requested architecture submits a build, streams its output,
//! checks the final status and delivers the image (left on the service,
//! published to the library, or downloaded to a local file, optionally signed
//! on the way). Architectures are built one after another. A failure for one
//! architecture does not stop the others.

mod artifact;
mod types;

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::artifact::{ChecksumCheck, verify_checksum};
pub use self::types::{AppConfig, AppError, AttemptState, BuildAttempt};
use crate::client::{BuildClient, BuildInfo, BuildService, ClientConfig, ClientError, SubmitOptions};
use crate::consts::{CLEANUP_TIMEOUT, EPHEMERAL_RETENTION_HOURS, default_user_agent};
use crate::definition::{BuildSpec, DefinitionParser, RemoteDefinitionParser};
use crate::endpoints::{frontend_config, frontend_url};
use crate::library::{Destination, ImageLibrary, LibraryClient, LibraryConfig};
use crate::sign::{ImageSigner, Prompter, SignatureBlock, signer_for};

/// The remote collaborators of a build.
#[derive(Clone)]
pub struct Services {
  pub build: Arc<dyn BuildService>,
  pub library: Arc<dyn ImageLibrary>,
  pub parser: Arc<dyn DefinitionParser>,
}

pub struct App {
  services: Services,
  spec: BuildSpec,
  destination: Destination,
  archs: Vec<String>,
  force: bool,
  working_dir: PathBuf,
  signer: Option<Arc<dyn ImageSigner>>,
  stdout: Box<dyn Write + Send>,
  stderr: Box<dyn Write + Send>,
}

impl App {
  /// Resolve the service endpoints for `config` and connect to them.
  ///
  /// The signing key is loaded and unlocked here, before any remote work, so
  /// a bad key or passphrase fails fast.
  pub async fn new(config: AppConfig, prompter: Arc<dyn Prompter>) -> Result<Self, AppError> {
    let (destination, spec) = validate(&config, config.signing.is_some())?;

    let ref_host = match &destination {
      Destination::Library { host, .. } => host.as_deref(),
      _ => None,
    };
    let frontend = frontend_url(config.url.as_deref(), ref_host)?;
    let endpoints = frontend_config(&frontend, config.skip_tls_verify).await?;
    debug!(
      frontend = %frontend,
      build = %endpoints.build_api.uri,
      library = %endpoints.library_api.uri,
      "resolved service endpoints"
    );

    let user_agent = config.user_agent.clone().or_else(|| Some(default_user_agent()));
    let build = BuildClient::new(ClientConfig {
      base_url: endpoints.build_api.uri.clone(),
      bearer_token: config.auth_token.clone(),
      user_agent: user_agent.clone(),
      skip_tls_verify: config.skip_tls_verify,
      timeout: config.timeout,
      ..ClientConfig::default()
    })
    .map_err(AppError::ClientInit)?;
    let library = LibraryClient::new(LibraryConfig {
      base_url: endpoints.library_api.uri.clone(),
      bearer_token: config.auth_token.clone(),
      user_agent,
      skip_tls_verify: config.skip_tls_verify,
    })
    .map_err(AppError::LibraryInit)?;

    let signer = match config.signing.clone() {
      Some(method) => {
        let signer = tokio::task::spawn_blocking(move || signer_for(&method, &*prompter)).await??;
        Some(signer)
      }
      None => None,
    };

    let services = Services {
      parser: Arc::new(RemoteDefinitionParser::new(build.clone())),
      build: Arc::new(build),
      library: Arc::new(library),
    };
    Self::assemble(config, destination, spec, services, signer)
  }

  /// Build an app around explicit services and an optional ready signer.
  pub fn with_services(
    config: AppConfig,
    services: Services,
    signer: Option<Arc<dyn ImageSigner>>,
  ) -> Result<Self, AppError> {
    let (destination, spec) = validate(&config, signer.is_some())?;
    Self::assemble(config, destination, spec, services, signer)
  }

  fn assemble(
    config: AppConfig,
    destination: Destination,
    spec: BuildSpec,
    services: Services,
    signer: Option<Arc<dyn ImageSigner>>,
  ) -> Result<Self, AppError> {
    let working_dir = match config.working_dir {
      Some(dir) => dir,
      None => std::env::current_dir()?,
    };
    Ok(Self {
      services,
      spec,
      destination,
      archs: config.archs,
      force: config.force,
      working_dir,
      signer,
      stdout: Box::new(io::stdout()),
      stderr: Box::new(io::stderr()),
    })
  }

  /// Send console output somewhere other than the process streams.
  pub fn with_output(mut self, stdout: Box<dyn Write + Send>, stderr: Box<dyn Write + Send>) -> Self {
    self.stdout = stdout;
    self.stderr = stderr;
    self
  }

  pub fn destination(&self) -> &Destination {
    &self.destination
  }

  /// Build every requested architecture.
  ///
  /// Returns the attempts when all of them succeeded. With one failure that
  /// failure is returned as is; with several, each is printed to the error
  /// stream and [`AppError::MultipleFailures`] is returned.
  pub async fn run(&mut self, cancel: &CancellationToken) -> Result<Vec<BuildAttempt>, AppError> {
    self.check_destination_files()?;

    if self.archs.len() > 1 {
      writeln!(
        self.stdout,
        "Performing build for following architectures: {}",
        self.archs.join(" ")
      )?;
    }

    let definition = self.spec.definition()?;
    let context = self.upload_context(&definition, cancel).await?;

    let mut attempts = Vec::with_capacity(self.archs.len());
    let mut failures = Vec::new();
    let mut cancelled = false;
    for arch in self.archs.clone() {
      if cancel.is_cancelled() {
        cancelled = true;
        break;
      }

      let mut attempt = BuildAttempt::new(&arch);
      attempt.advance(AttemptState::ContextUploaded);
      match self.build_arch(&mut attempt, &definition, context.as_deref(), cancel).await {
        Ok(()) => {
          attempt.advance(AttemptState::Succeeded);
          info!(arch = %arch, "build succeeded");
        }
        Err(AppError::Cancelled) => {
          attempt.advance(AttemptState::Failed);
          attempts.push(attempt);
          cancelled = true;
          break;
        }
        Err(e) => {
          attempt.advance(AttemptState::Failed);
          warn!(arch = %arch, error = %e, "build failed");
          failures.push((arch, e));
        }
      }
      attempts.push(attempt);
    }

    if let Some(digest) = &context {
      self.delete_context(digest).await;
    }

    if cancelled {
      return Err(AppError::Cancelled);
    }

    match failures.len() {
      0 => Ok(attempts),
      1 => Err(failures.remove(0).1),
      _ => {
        for (arch, err) in &failures {
          writeln!(self.stderr, "Build {} failed: {}", arch, err)?;
        }
        Err(AppError::MultipleFailures)
      }
    }
  }

  /// Local file for `arch`, suffixed with the architecture when several are
  /// built. `None` unless the destination is a file.
  pub fn artifact_path(&self, arch: &str) -> Option<PathBuf> {
    let Destination::File(path) = &self.destination else {
      return None;
    };
    if self.archs.len() < 2 {
      return Some(path.clone());
    }
    let mut name = path.clone().into_os_string();
    name.push(format!("-{}", arch));
    Some(PathBuf::from(name))
  }

  /// Fail before any remote work if a destination file is already taken.
  fn check_destination_files(&self) -> Result<(), AppError> {
    if self.force {
      return Ok(());
    }
    for arch in &self.archs {
      if let Some(path) = self.artifact_path(arch)
        && path.symlink_metadata().is_ok()
      {
        return Err(AppError::FileExists { path });
      }
    }
    Ok(())
  }

  /// Upload the local files the definition copies in, returning the context
  /// digest. `None` when the definition needs no local files.
  async fn upload_context(&self, definition: &[u8], cancel: &CancellationToken) -> Result<Option<String>, AppError> {
    let parsed = until_cancelled(cancel, self.services.parser.parse(definition)).await??;
    let paths = parsed.source_paths(&self.working_dir);
    if paths.is_empty() {
      debug!("definition has no local files");
      return Ok(None);
    }

    match until_cancelled(cancel, self.services.build.upload_build_context(&paths)).await? {
      Ok(digest) => {
        info!(digest = %digest, paths = paths.len(), "build context uploaded");
        Ok(Some(digest))
      }
      Err(ClientError::NoPathsSpecified) => Ok(None),
      Err(e) => Err(AppError::UploadContext(e)),
    }
  }

  /// Best-effort removal of the build context. Runs even after cancellation.
  async fn delete_context(&self, digest: &str) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, self.services.build.delete_build_context(digest)).await {
      Ok(Ok(())) => debug!(digest = %digest, "build context deleted"),
      Ok(Err(e)) => warn!(digest = %digest, error = %e, "failed to delete build context"),
      Err(_) => warn!(digest = %digest, "timed out deleting build context"),
    }
  }

  async fn build_arch(
    &mut self,
    attempt: &mut BuildAttempt,
    definition: &[u8],
    context: Option<&str>,
    cancel: &CancellationToken,
  ) -> Result<(), AppError> {
    writeln!(self.stdout, "Building for {}...", attempt.arch)?;

    // A signed image is built unpublished and uploaded once signed.
    let library_ref = match (&self.destination, &self.signer) {
      (Destination::Library { reference, .. }, None) => Some(reference.to_string()),
      _ => None,
    };
    let opts = SubmitOptions {
      arch: Some(attempt.arch.clone()),
      library_ref,
      context_digest: context.map(str::to_string),
      ..SubmitOptions::default()
    };

    let info = until_cancelled(cancel, self.services.build.submit(definition, &opts))
      .await?
      .map_err(AppError::Submit)?;
    info!(arch = %attempt.arch, build_id = %info.id, "build submitted");
    attempt.build_id = Some(info.id.clone());
    attempt.advance(AttemptState::Submitted);

    attempt.advance(AttemptState::Streaming);
    match self.services.build.output(&info.id, &mut *self.stdout, cancel).await {
      Ok(()) => attempt.output_complete = true,
      Err(ClientError::Cancelled) => return Err(AppError::Cancelled),
      Err(e) => return Err(AppError::Output(e)),
    }

    let status = until_cancelled(cancel, self.services.build.status(&info.id))
      .await?
      .map_err(AppError::Status)?;
    attempt.image_size = status.image_size;
    attempt.image_checksum = status.image_checksum.clone();
    attempt.library_ref = Some(status.library_ref.clone()).filter(|r| !r.is_empty());
    attempt.advance(AttemptState::StatusPolled);
    if !status.succeeded() {
      return Err(AppError::BuildFailed);
    }

    self.deliver(attempt, &status, cancel).await
  }

  /// Put the finished image where it was asked for.
  async fn deliver(
    &mut self,
    attempt: &mut BuildAttempt,
    status: &BuildInfo,
    cancel: &CancellationToken,
  ) -> Result<(), AppError> {
    match self.destination.clone() {
      Destination::Ephemeral => {
        writeln!(
          self.stdout,
          "Build artifact {} is available for {} hours or less",
          status.library_ref, EPHEMERAL_RETENTION_HOURS
        )?;
      }
      Destination::Library { reference, .. } => {
        if let Some(signer) = self.signer.clone() {
          let local = tempfile::Builder::new().prefix(".rbuild-").tempfile()?;
          self.retrieve_artifact(status, local.path(), &attempt.arch, cancel).await?;
          self.sign(signer, local.path()).await?;
          attempt.advance(AttemptState::Signed);

          let tags = if reference.tags.is_empty() {
            vec!["latest".to_string()]
          } else {
            reference.tags.clone()
          };
          until_cancelled(
            cancel,
            self
              .services
              .library
              .upload_image(local.path(), &reference.path, &attempt.arch, &tags),
          )
          .await?
          .map_err(|source| AppError::Upload {
            reference: reference.to_string(),
            source,
          })?;
          attempt.advance(AttemptState::Republished);
        }
        info!(arch = %attempt.arch, reference = %reference, "image published");
      }
      Destination::File(_) => {
        let Some(path) = self.artifact_path(&attempt.arch) else {
          return Ok(());
        };
        let dir = match path.parent() {
          Some(parent) if !parent.as_os_str().is_empty() => parent,
          _ => Path::new("."),
        };
        let local = tempfile::Builder::new()
          .prefix(".rbuild-")
          .tempfile_in(dir)
          .map_err(|source| AppError::Artifact {
            path: path.clone(),
            source,
          })?;

        let size = self.retrieve_artifact(status, local.path(), &attempt.arch, cancel).await?;
        if let Some(signer) = self.signer.clone() {
          self.sign(signer, local.path()).await?;
          attempt.advance(AttemptState::Signed);
        }

        make_executable(local.path())?;
        local.persist(&path).map_err(|e| AppError::Artifact {
          path: path.clone(),
          source: e.error,
        })?;
        attempt.advance(AttemptState::Republished);
        writeln!(self.stdout, "Image written to {} ({} bytes)", path.display(), size)?;
        attempt.file = Some(path);
      }
    }
    Ok(())
  }

  async fn sign(&mut self, signer: Arc<dyn ImageSigner>, path: &Path) -> Result<SignatureBlock, AppError> {
    let image = path.to_path_buf();
    let block = tokio::task::spawn_blocking(move || signer.sign(&image)).await??;
    writeln!(self.stdout, "Image signed with key {}", block.key_id)?;
    Ok(block)
  }
}

/// Check the arguments that can be rejected without contacting any service.
fn validate(config: &AppConfig, signing: bool) -> Result<(Destination, BuildSpec), AppError> {
  if config.archs.is_empty() {
    return Err(AppError::NoArchitectures);
  }
  let destination = Destination::parse(config.destination.as_deref())?;
  if signing && destination == Destination::Ephemeral {
    return Err(AppError::SigningEphemeralUnsupported);
  }
  let spec = BuildSpec::parse(&config.build_spec)?;
  Ok((destination, spec))
}

/// Await `fut` unless `cancel` fires first.
pub(crate) async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, AppError> {
  tokio::select! {
    biased;
    _ = cancel.cancelled() => Err(AppError::Cancelled),
    out = fut => Ok(out),
  }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;
  use std::sync::Mutex;

  use async_trait::async_trait;
  use tracing_test::traced_test;

  use super::*;
  use crate::definition::{BuildData, Definition, DefinitionError, FileTransfer, FilesSection};
  use crate::library::LibraryError;
  use crate::sign::SignError;
  use crate::util::hash::{format_digest, hash_bytes};
  use crate::util::object_id::ObjectIdGenerator;

  const IMAGE: &[u8] = b"SIF image bytes";

  /// A `Write` handle over a shared buffer.
  #[derive(Clone, Default)]
  struct SharedBuf(Arc<Mutex<Vec<u8>>>);

  impl SharedBuf {
    fn contents(&self) -> String {
      String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
  }

  impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  struct FakeBuild {
    ids: ObjectIdGenerator,
    /// Architectures whose builds finish without an image.
    failing: HashSet<String>,
    checksum: String,
    /// Fired from the output stream of the first build.
    cancel_during_output: Option<CancellationToken>,
    submits: Mutex<Vec<SubmitOptions>>,
    uploads: Mutex<Vec<Vec<String>>>,
    deletes: Mutex<Vec<String>>,
    archs: Mutex<Vec<(String, String)>>,
  }

  impl FakeBuild {
    fn new() -> Self {
      Self {
        ids: ObjectIdGenerator::with_parts("test-host", 42, 0),
        failing: HashSet::new(),
        checksum: format_digest(&hash_bytes(IMAGE)),
        cancel_during_output: None,
        submits: Mutex::default(),
        uploads: Mutex::default(),
        deletes: Mutex::default(),
        archs: Mutex::default(),
      }
    }

    fn failing(mut self, archs: &[&str]) -> Self {
      self.failing = archs.iter().map(|a| a.to_string()).collect();
      self
    }

    fn arch_of(&self, build_id: &str) -> String {
      let archs = self.archs.lock().unwrap();
      archs
        .iter()
        .find(|(id, _)| id == build_id)
        .map(|(_, arch)| arch.clone())
        .unwrap_or_default()
    }
  }

  #[async_trait]
  impl BuildService for FakeBuild {
    async fn upload_build_context(&self, paths: &[String]) -> Result<String, ClientError> {
      self.uploads.lock().unwrap().push(paths.to_vec());
      Ok(format_digest(&hash_bytes(paths.join("\n").as_bytes())))
    }

    async fn delete_build_context(&self, digest: &str) -> Result<(), ClientError> {
      self.deletes.lock().unwrap().push(digest.to_string());
      Ok(())
    }

    async fn submit(&self, _definition: &[u8], opts: &SubmitOptions) -> Result<BuildInfo, ClientError> {
      let id = self.ids.next_id_at(1_700_000_000);
      let arch = opts.arch.clone().unwrap_or_default();
      self.archs.lock().unwrap().push((id.clone(), arch));
      self.submits.lock().unwrap().push(opts.clone());
      Ok(BuildInfo {
        id,
        ..BuildInfo::default()
      })
    }

    async fn output(
      &self,
      build_id: &str,
      sink: &mut (dyn Write + Send),
      _cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
      if let Some(token) = &self.cancel_during_output {
        token.cancel();
        return Err(ClientError::Cancelled);
      }
      writeln!(sink, "log for {}", build_id)?;
      Ok(())
    }

    async fn status(&self, build_id: &str) -> Result<BuildInfo, ClientError> {
      let arch = self.arch_of(build_id);
      let image_size = if self.failing.contains(&arch) { 0 } else { IMAGE.len() as i64 };
      Ok(BuildInfo {
        id: build_id.to_string(),
        is_complete: true,
        image_size,
        image_checksum: self.checksum.clone(),
        library_ref: format!("library://user/ephemeral/{}:{}", build_id, arch),
        library_url: String::new(),
      })
    }

    async fn cancel(&self, _build_id: &str) -> Result<(), ClientError> {
      Ok(())
    }
  }

  #[derive(Default)]
  struct FakeLibrary {
    downloads: Mutex<Vec<(String, String, String)>>,
    /// (path, arch, tags, contents)
    uploads: Mutex<Vec<(String, String, Vec<String>, Vec<u8>)>>,
  }

  #[async_trait]
  impl ImageLibrary for FakeLibrary {
    async fn download_image(
      &self,
      writer: &mut (dyn Write + Send),
      arch: &str,
      path: &str,
      tag: &str,
    ) -> Result<u64, LibraryError> {
      self
        .downloads
        .lock()
        .unwrap()
        .push((arch.to_string(), path.to_string(), tag.to_string()));
      writer.write_all(IMAGE)?;
      Ok(IMAGE.len() as u64)
    }

    async fn upload_image(&self, file: &Path, path: &str, arch: &str, tags: &[String]) -> Result<(), LibraryError> {
      let contents = std::fs::read(file)?;
      self
        .uploads
        .lock()
        .unwrap()
        .push((path.to_string(), arch.to_string(), tags.to_vec(), contents));
      Ok(())
    }
  }

  struct FakeParser(Definition);

  #[async_trait]
  impl DefinitionParser for FakeParser {
    async fn parse(&self, _raw: &[u8]) -> Result<Definition, DefinitionError> {
      Ok(self.0.clone())
    }
  }

  /// Appends a marker instead of a real signature.
  struct MarkerSigner;

  const MARKER: &[u8] = b"|signed";

  impl ImageSigner for MarkerSigner {
    fn sign(&self, image: &Path) -> Result<SignatureBlock, SignError> {
      let mut file = std::fs::OpenOptions::new().append(true).open(image)?;
      file.write_all(MARKER)?;
      Ok(SignatureBlock {
        method: "test".into(),
        key_id: "TESTKEY".into(),
        digest: String::new(),
        signature: String::new(),
        created: 0,
      })
    }
  }

  fn definition_with_files(sources: &[&str]) -> Definition {
    Definition {
      build_data: BuildData {
        files: vec![FilesSection {
          args: String::new(),
          files: sources
            .iter()
            .map(|s| FileTransfer {
              source: s.to_string(),
              destination: String::new(),
            })
            .collect(),
        }],
      },
    }
  }

  struct Harness {
    build: Arc<FakeBuild>,
    library: Arc<FakeLibrary>,
    stdout: SharedBuf,
    stderr: SharedBuf,
    dir: tempfile::TempDir,
  }

  impl Harness {
    fn new(build: FakeBuild) -> Self {
      Self {
        build: Arc::new(build),
        library: Arc::new(FakeLibrary::default()),
        stdout: SharedBuf::default(),
        stderr: SharedBuf::default(),
        dir: tempfile::TempDir::new().unwrap(),
      }
    }

    fn config(&self, destination: Option<&str>, archs: &[&str]) -> AppConfig {
      let spec = self.dir.path().join("image.def");
      std::fs::write(&spec, "bootstrap: docker\nfrom: alpine\n").unwrap();
      AppConfig {
        build_spec: spec.to_string_lossy().into_owned(),
        destination: destination.map(str::to_string),
        archs: archs.iter().map(|a| a.to_string()).collect(),
        working_dir: Some(self.dir.path().to_path_buf()),
        ..AppConfig::default()
      }
    }

    fn app(&self, config: AppConfig, definition: Definition, signer: Option<Arc<dyn ImageSigner>>) -> App {
      let services = Services {
        build: self.build.clone(),
        library: self.library.clone(),
        parser: Arc::new(FakeParser(definition)),
      };
      App::with_services(config, services, signer)
        .unwrap()
        .with_output(Box::new(self.stdout.clone()), Box::new(self.stderr.clone()))
    }
  }

  #[tokio::test]
  async fn ephemeral_build_reports_retention() {
    let h = Harness::new(FakeBuild::new());
    let mut app = h.app(h.config(None, &["amd64"]), Definition::default(), None);

    let attempts = app.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].succeeded());
    assert!(attempts[0].output_complete);
    let id = attempts[0].build_id.clone().unwrap();

    let out = h.stdout.contents();
    assert!(!out.contains("Performing build"));
    assert!(out.contains("Building for amd64..."));
    assert!(out.contains(&format!("log for {}", id)));
    assert!(out.contains(&format!(
      "Build artifact library://user/ephemeral/{}:amd64 is available for 24 hours or less",
      id
    )));

    let submits = h.build.submits.lock().unwrap();
    assert_eq!(submits[0].arch.as_deref(), Some("amd64"));
    assert_eq!(submits[0].library_ref, None);
    assert_eq!(submits[0].context_digest, None);
    assert!(h.build.uploads.lock().unwrap().is_empty());
    assert!(h.build.deletes.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn library_destination_is_passed_to_the_service() {
    let h = Harness::new(FakeBuild::new());
    let mut app = h.app(
      h.config(Some("library://alice/default/alpine:3.19"), &["arm64"]),
      Definition::default(),
      None,
    );

    app.run(&CancellationToken::new()).await.unwrap();

    let submits = h.build.submits.lock().unwrap();
    assert_eq!(submits[0].library_ref.as_deref(), Some("library:alice/default/alpine:3.19"));
    assert!(h.library.downloads.lock().unwrap().is_empty());
    assert!(!h.stdout.contents().contains("available for"));
  }

  #[tokio::test]
  async fn multi_arch_files_get_arch_suffix() {
    let h = Harness::new(FakeBuild::new());
    let dest = h.dir.path().join("alpine.sif");
    let mut app = h.app(
      h.config(Some(dest.to_str().unwrap()), &["amd64", "arm64"]),
      Definition::default(),
      None,
    );

    let attempts = app.run(&CancellationToken::new()).await.unwrap();

    assert!(attempts.iter().all(BuildAttempt::succeeded));
    for arch in ["amd64", "arm64"] {
      let path = h.dir.path().join(format!("alpine.sif-{}", arch));
      assert_eq!(std::fs::read(&path).unwrap(), IMAGE);
    }
    assert!(!dest.exists());
    assert_eq!(
      attempts[1].file.as_deref(),
      Some(h.dir.path().join("alpine.sif-arm64").as_path())
    );

    let out = h.stdout.contents();
    assert!(out.starts_with("Performing build for following architectures: amd64 arm64\n"));
    assert!(out.find("Building for amd64...").unwrap() < out.find("Building for arm64...").unwrap());
    assert_eq!(
      h.stderr.contents().matches("Image checksum verified successfully.").count(),
      2
    );

    let downloads = h.library.downloads.lock().unwrap();
    assert_eq!(downloads[0].0, "amd64");
    assert!(downloads[0].1.starts_with("user/ephemeral/"));
    assert_eq!(downloads[0].2, "amd64");
  }

  #[tokio::test]
  async fn existing_file_fails_before_any_build() {
    let h = Harness::new(FakeBuild::new());
    let dest = h.dir.path().join("alpine.sif");
    std::fs::write(h.dir.path().join("alpine.sif-arm64"), b"old").unwrap();
    let mut app = h.app(
      h.config(Some(dest.to_str().unwrap()), &["amd64", "arm64"]),
      Definition::default(),
      None,
    );

    let err = app.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, AppError::FileExists { .. }));
    assert!(err.to_string().ends_with("alpine.sif-arm64 already exists"));
    assert!(h.build.submits.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn force_overwrites_existing_file() {
    let h = Harness::new(FakeBuild::new());
    let dest = h.dir.path().join("alpine.sif");
    std::fs::write(&dest, b"old").unwrap();
    let mut config = h.config(Some(dest.to_str().unwrap()), &["amd64"]);
    config.force = true;
    let mut app = h.app(config, Definition::default(), None);

    app.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), IMAGE);
    assert!(h.stdout.contents().contains(&format!("Image written to {} (15 bytes)", dest.display())));
  }

  #[tokio::test]
  #[traced_test]
  async fn checksum_mismatch_is_reported_but_not_fatal() {
    let mut build = FakeBuild::new();
    build.checksum = format_digest(&hash_bytes(b"something else"));
    let h = Harness::new(build);
    let dest = h.dir.path().join("alpine.sif");
    let mut app = h.app(h.config(Some(dest.to_str().unwrap()), &["amd64"]), Definition::default(), None);

    app.run(&CancellationToken::new()).await.unwrap();

    let err = h.stderr.contents();
    assert!(err.contains(&format!(
      "Error: image checksum mismatch (expecting {}, got {})",
      hash_bytes(b"something else"),
      hash_bytes(IMAGE)
    )));
    assert!(dest.exists());
    assert!(logs_contain("image checksum mismatch"));
  }

  #[tokio::test]
  async fn single_failure_is_returned_as_is() {
    let h = Harness::new(FakeBuild::new().failing(&["amd64"]));
    let mut app = h.app(h.config(None, &["amd64"]), Definition::default(), None);

    let err = app.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, AppError::BuildFailed));
    assert!(!h.stderr.contents().contains("Build amd64 failed"));
  }

  #[tokio::test]
  async fn one_failure_among_several_archs_keeps_its_identity() {
    let h = Harness::new(FakeBuild::new().failing(&["arm64"]));
    let mut app = h.app(h.config(None, &["amd64", "arm64", "ppc64le"]), Definition::default(), None);

    let err = app.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, AppError::BuildFailed));
    assert_eq!(h.build.submits.lock().unwrap().len(), 3);
  }

  #[tokio::test]
  async fn several_failures_are_summarized() {
    let h = Harness::new(FakeBuild::new().failing(&["amd64", "ppc64le"]));
    let mut app = h.app(h.config(None, &["amd64", "arm64", "ppc64le"]), Definition::default(), None);

    let err = app.run(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, AppError::MultipleFailures));
    assert_eq!(err.to_string(), "failed to build images");
    let summary = h.stderr.contents();
    assert!(summary.contains("Build amd64 failed: failed to build image\n"));
    assert!(summary.contains("Build ppc64le failed: failed to build image\n"));
    assert!(!summary.contains("Build arm64 failed"));
    assert!(h.stdout.contents().contains("Building for arm64..."));
  }

  #[tokio::test]
  async fn context_is_uploaded_once_and_deleted_once() {
    let h = Harness::new(FakeBuild::new());
    let mut app = h.app(
      h.config(None, &["amd64", "arm64"]),
      definition_with_files(&["data/input.txt", "/etc/hosts"]),
      None,
    );

    app.run(&CancellationToken::new()).await.unwrap();

    let uploads = h.build.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    let cwd = h.dir.path().to_string_lossy().trim_start_matches('/').to_string();
    assert_eq!(uploads[0], vec![format!("{}/data/input.txt", cwd), "etc/hosts".to_string()]);

    let submits = h.build.submits.lock().unwrap();
    let digest = submits[0].context_digest.clone().unwrap();
    assert!(submits.iter().all(|s| s.context_digest.as_deref() == Some(digest.as_str())));
    assert_eq!(*h.build.deletes.lock().unwrap(), vec![digest]);
  }

  #[tokio::test]
  async fn context_is_deleted_after_failures() {
    let h = Harness::new(FakeBuild::new().failing(&["amd64"]));
    let mut app = h.app(
      h.config(None, &["amd64"]),
      definition_with_files(&["/srv/app"]),
      None,
    );

    assert!(app.run(&CancellationToken::new()).await.is_err());
    assert_eq!(h.build.deletes.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn cancellation_stops_remaining_archs_and_cleans_up() {
    let cancel = CancellationToken::new();
    let mut build = FakeBuild::new();
    build.cancel_during_output = Some(cancel.clone());
    let h = Harness::new(build);
    let mut app = h.app(
      h.config(None, &["amd64", "arm64"]),
      definition_with_files(&["/srv/app"]),
      None,
    );

    let err = app.run(&cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(h.build.submits.lock().unwrap().len(), 1);
    assert_eq!(h.build.deletes.lock().unwrap().len(), 1);
    assert!(!h.stdout.contents().contains("Building for arm64"));
  }

  #[tokio::test]
  async fn cancelled_before_start_submits_nothing() {
    let h = Harness::new(FakeBuild::new());
    let mut app = h.app(h.config(None, &["amd64"]), Definition::default(), None);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = app.run(&cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(h.build.submits.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn signed_library_image_is_uploaded_after_signing() {
    let h = Harness::new(FakeBuild::new());
    let mut app = h.app(
      h.config(Some("library:alice/default/alpine:3.19,latest"), &["amd64"]),
      Definition::default(),
      Some(Arc::new(MarkerSigner)),
    );

    let attempts = app.run(&CancellationToken::new()).await.unwrap();

    assert!(attempts[0].succeeded());
    assert_eq!(h.build.submits.lock().unwrap()[0].library_ref, None);

    let uploads = h.library.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    let (path, arch, tags, contents) = &uploads[0];
    assert_eq!(path, "alice/default/alpine");
    assert_eq!(arch, "amd64");
    assert_eq!(tags, &vec!["3.19".to_string(), "latest".to_string()]);
    assert_eq!(contents, &[IMAGE, MARKER].concat());
    assert!(h.stdout.contents().contains("Image signed with key TESTKEY"));
  }

  #[tokio::test]
  async fn signed_file_is_written_signed() {
    let h = Harness::new(FakeBuild::new());
    let dest = h.dir.path().join("alpine.sif");
    let mut app = h.app(
      h.config(Some(dest.to_str().unwrap()), &["amd64"]),
      Definition::default(),
      Some(Arc::new(MarkerSigner)),
    );

    app.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), [IMAGE, MARKER].concat());
    assert!(h.library.uploads.lock().unwrap().is_empty());
  }

  #[test]
  fn signing_ephemeral_build_is_rejected() {
    let h = Harness::new(FakeBuild::new());
    let services = Services {
      build: h.build.clone(),
      library: h.library.clone(),
      parser: Arc::new(FakeParser(Definition::default())),
    };
    let err = App::with_services(h.config(None, &["amd64"]), services, Some(Arc::new(MarkerSigner)))
      .err()
      .unwrap();
    assert!(matches!(err, AppError::SigningEphemeralUnsupported));
  }

  #[test]
  fn no_architectures_is_rejected() {
    let h = Harness::new(FakeBuild::new());
    let services = Services {
      build: h.build.clone(),
      library: h.library.clone(),
      parser: Arc::new(FakeParser(Definition::default())),
    };
    let err = App::with_services(h.config(None, &[]), services, None).err().unwrap();
    assert!(matches!(err, AppError::NoArchitectures));
  }

  #[test]
  fn bad_destination_scheme_is_rejected() {
    let h = Harness::new(FakeBuild::new());
    let services = Services {
      build: h.build.clone(),
      library: h.library.clone(),
      parser: Arc::new(FakeParser(Definition::default())),
    };
    let err = App::with_services(h.config(Some("oras://registry/image"), &["amd64"]), services, None)
      .err()
      .unwrap();
    assert!(matches!(
      err,
      AppError::Destination(LibraryError::UnsupportedRefScheme(ref s)) if s == "oras"
    ));
  }
}
