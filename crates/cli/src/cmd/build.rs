//! Implementation of the `rbuild build` command.
//!
//! Submits a build for each requested architecture, streams the build log to
//! the terminal and delivers the image to a library, a local file, or leaves
//! it on the service for a limited time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use rbuild_lib::app::{App, AppConfig, BuildAttempt};
use rbuild_lib::arch::default_arch;
use rbuild_lib::library::Destination;
use rbuild_lib::sign::{KeySelector, SigningMethod};

use crate::output::{Status, format_bytes, format_duration, print_field, status};
use crate::prompts::TerminalPrompter;

pub const BUILD_EXAMPLES: &str = "\
Examples:
  Build and push to the library:
      rbuild build alpine.def library:user/project/image:tag

  Build and push to a self-hosted deployment:
      rbuild build alpine.def library://cloud.enterprise.local/user/project/image:tag

  Build a local image:
      rbuild build docker://alpine alpine_latest.sif

  Build an ephemeral image (usually deleted within 24 hours):
      rbuild build alpine.def";

#[derive(Args, Debug)]
pub struct BuildArgs {
  /// Definition file, or a bootstrap URI such as docker://alpine
  pub build_spec: String,

  /// library: reference or local file; omit for an ephemeral image
  pub image_dest: Option<String>,

  /// Access token
  #[arg(long, env = "RBUILD_AUTH_TOKEN", hide_env_values = true)]
  pub auth_token: Option<String>,

  /// Skip TLS certificate verification
  #[arg(long, env = "RBUILD_SKIP_VERIFY")]
  pub skip_verify: bool,

  /// Requested build architecture (repeatable, or comma separated) [default: host architecture]
  #[arg(long = "arch", env = "RBUILD_ARCH", value_delimiter = ',')]
  pub archs: Vec<String>,

  /// Frontend URL of the build service
  #[arg(long, env = "RBUILD_URL")]
  pub url: Option<String>,

  /// Overwrite image file if it exists
  #[arg(long, env = "RBUILD_FORCE")]
  pub force: bool,

  /// Timeout for individual service requests (e.g., "30s", "2m")
  #[arg(long, env = "RBUILD_TIMEOUT", value_parser = humantime::parse_duration)]
  pub timeout: Option<Duration>,

  /// Sign with a keyring key, chosen interactively when there are several
  #[arg(long)]
  pub sign: bool,

  /// PGP private key to use, by index among the keyring's private keys
  #[arg(short = 'k', long, env = "RBUILD_KEYIDX", conflicts_with_all = ["fingerprint", "key_file"])]
  pub keyidx: Option<usize>,

  /// Fingerprint of the PGP key to sign with
  #[arg(long, env = "RBUILD_FINGERPRINT", conflicts_with = "key_file")]
  pub fingerprint: Option<String>,

  /// Full path to the secret keyring
  #[arg(long, env = "RBUILD_KEYRING")]
  pub keyring: Option<PathBuf>,

  /// Passphrase of the signing key
  #[arg(long, env = "RBUILD_PASSPHRASE", hide_env_values = true)]
  pub passphrase: Option<String>,

  /// Ed25519 private key (PKCS#8 PEM) to sign with instead of a keyring
  #[arg(long, env = "RBUILD_KEY_FILE")]
  pub key_file: Option<PathBuf>,
}

impl BuildArgs {
  /// The signing method the flags ask for, if any.
  fn signing(&self) -> Result<Option<SigningMethod>> {
    if let Some(path) = &self.key_file {
      return Ok(Some(SigningMethod::KeyFile(path.clone())));
    }

    let selector = match (self.keyidx, &self.fingerprint) {
      (Some(index), _) => KeySelector::Index(index),
      (None, Some(fingerprint)) => KeySelector::Fingerprint(fingerprint.clone()),
      (None, None) if self.sign => KeySelector::Interactive,
      (None, None) => {
        if self.passphrase.is_some() {
          bail!("--passphrase only effective when signing enabled");
        }
        return Ok(None);
      }
    };

    Ok(Some(SigningMethod::Pgp {
      keyring: self.keyring.clone(),
      selector,
      passphrase: self.passphrase.clone(),
    }))
  }

  fn into_config(self) -> Result<AppConfig> {
    let signing = self.signing()?;
    let archs = if self.archs.is_empty() {
      vec![default_arch()]
    } else {
      self.archs.clone()
    };

    Ok(AppConfig {
      url: self.url,
      auth_token: self.auth_token,
      build_spec: self.build_spec,
      destination: self.image_dest,
      archs,
      force: self.force,
      skip_tls_verify: self.skip_verify,
      user_agent: None,
      timeout: self.timeout,
      signing,
      working_dir: None,
    })
  }
}

/// Execute the build command.
pub fn cmd_build(args: BuildArgs) -> Result<()> {
  let config = args.into_config()?;
  debug!(archs = ?config.archs, destination = ?config.destination, "build requested");

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let result = rt.block_on(async move {
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let started = Instant::now();
    let mut app = App::new(config, Arc::new(TerminalPrompter))
      .await
      .context("application init error")?;
    let attempts = app.run(&cancel).await?;

    print_summary(app.destination(), &attempts);
    status(Status::Done, format_args!("Build complete in {}", format_duration(started.elapsed())));
    Ok::<_, anyhow::Error>(())
  });
  // A cancelled run may leave context archiving on the blocking pool.
  rt.shutdown_background();
  result
}

fn print_summary(destination: &Destination, attempts: &[BuildAttempt]) {
  for attempt in attempts {
    let size = format_bytes(attempt.image_size.max(0) as u64);
    let target = match (destination, &attempt.file) {
      (_, Some(file)) => file.display().to_string(),
      (Destination::Library { reference, .. }, None) => reference.to_string(),
      _ => attempt.library_ref.clone().unwrap_or_default(),
    };
    print_field(&attempt.arch, format_args!("{} ({})", target, size));
  }
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn cancel_on_signal(token: CancellationToken) {
  let signal = shutdown_signal().await;
  status(Status::Warn, format_args!("Shutting down due to signal: {}", signal));
  token.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
  use tokio::signal::unix::{SignalKind, signal};

  let mut interrupt = match signal(SignalKind::interrupt()) {
    Ok(s) => s,
    Err(_) => return std::future::pending().await,
  };
  let mut terminate = match signal(SignalKind::terminate()) {
    Ok(s) => s,
    Err(_) => return std::future::pending().await,
  };

  tokio::select! {
    _ = interrupt.recv() => "interrupt",
    _ = terminate.recv() => "terminated",
  }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
  match tokio::signal::ctrl_c().await {
    Ok(()) => "interrupt",
    Err(_) => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use clap::Parser;

  use super::*;

  #[derive(Parser)]
  struct TestCli {
    #[command(flatten)]
    args: BuildArgs,
  }

  fn parse(args: &[&str]) -> Result<BuildArgs, clap::Error> {
    let argv = std::iter::once("rbuild").chain(args.iter().copied());
    TestCli::try_parse_from(argv).map(|c| c.args)
  }

  #[test]
  #[serial_test::serial]
  fn defaults_to_host_arch_and_no_signing() {
    temp_env::with_vars_unset(["RBUILD_ARCH", "RBUILD_PASSPHRASE", "RBUILD_KEY_FILE"], || {
      let config = parse(&["alpine.def"]).unwrap().into_config().unwrap();
      assert_eq!(config.archs, vec![default_arch()]);
      assert_eq!(config.destination, None);
      assert!(config.signing.is_none());
    });
  }

  #[test]
  #[serial_test::serial]
  fn arch_list_is_comma_separated_or_repeated() {
    temp_env::with_vars_unset(["RBUILD_ARCH"], || {
      let args = parse(&["--arch", "amd64,arm64", "--arch", "ppc64le", "alpine.def"]).unwrap();
      assert_eq!(args.archs, vec!["amd64", "arm64", "ppc64le"]);
    });
  }

  #[test]
  #[serial_test::serial]
  fn arch_from_environment() {
    temp_env::with_var("RBUILD_ARCH", Some("arm64,s390x"), || {
      let args = parse(&["alpine.def"]).unwrap();
      assert_eq!(args.archs, vec!["arm64", "s390x"]);
    });
  }

  #[test]
  #[serial_test::serial]
  fn passphrase_requires_signing() {
    temp_env::with_vars_unset(["RBUILD_KEYIDX", "RBUILD_FINGERPRINT", "RBUILD_KEY_FILE"], || {
      let err = parse(&["--passphrase", "secret", "alpine.def", "out.sif"])
        .unwrap()
        .into_config()
        .unwrap_err();
      assert_eq!(err.to_string(), "--passphrase only effective when signing enabled");
    });
  }

  #[test]
  #[serial_test::serial]
  fn keyidx_selects_pgp_key() {
    temp_env::with_vars_unset(["RBUILD_FINGERPRINT", "RBUILD_KEY_FILE", "RBUILD_KEYRING"], || {
      let config = parse(&["-k", "1", "--passphrase", "pw", "alpine.def", "out.sif"])
        .unwrap()
        .into_config()
        .unwrap();
      assert_eq!(
        config.signing,
        Some(SigningMethod::Pgp {
          keyring: None,
          selector: KeySelector::Index(1),
          passphrase: Some("pw".into()),
        })
      );
    });
  }

  #[test]
  #[serial_test::serial]
  fn sign_flag_selects_interactively() {
    temp_env::with_vars_unset(["RBUILD_KEYIDX", "RBUILD_FINGERPRINT", "RBUILD_KEY_FILE"], || {
      let config = parse(&["--sign", "alpine.def", "out.sif"]).unwrap().into_config().unwrap();
      assert!(matches!(
        config.signing,
        Some(SigningMethod::Pgp {
          selector: KeySelector::Interactive,
          ..
        })
      ));
    });
  }

  #[test]
  #[serial_test::serial]
  fn key_selectors_are_mutually_exclusive() {
    temp_env::with_vars_unset(["RBUILD_KEYIDX", "RBUILD_FINGERPRINT", "RBUILD_KEY_FILE"], || {
      assert!(parse(&["-k", "0", "--fingerprint", "ABCD", "alpine.def"]).is_err());
      assert!(parse(&["-k", "0", "--key-file", "key.pem", "alpine.def"]).is_err());
      assert!(parse(&["--fingerprint", "ABCD", "--key-file", "key.pem", "alpine.def"]).is_err());
    });
  }

  #[test]
  #[serial_test::serial]
  fn key_file_signing() {
    temp_env::with_vars_unset(["RBUILD_KEYIDX", "RBUILD_FINGERPRINT"], || {
      let config = parse(&["--key-file", "key.pem", "alpine.def", "out.sif"])
        .unwrap()
        .into_config()
        .unwrap();
      assert_eq!(config.signing, Some(SigningMethod::KeyFile("key.pem".into())));
    });
  }

  #[test]
  #[serial_test::serial]
  fn timeout_accepts_human_durations() {
    temp_env::with_vars_unset(["RBUILD_TIMEOUT"], || {
      let args = parse(&["--timeout", "2m", "alpine.def"]).unwrap();
      assert_eq!(args.timeout, Some(Duration::from_secs(120)));
    });
  }
}
