//! Submit, status and cancel requests.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use tracing::{debug, info};

use super::types::{BuildInfo, SubmitOptions, SubmitRequest};
use super::{BuildClient, ClientError, check_status, read_data};

impl BuildClient {
  /// Submit `definition` for building. Submission is not idempotent: every
  /// call starts a new remote build.
  pub async fn submit(&self, definition: &[u8], opts: &SubmitOptions) -> Result<BuildInfo, ClientError> {
    let builder_requirements = opts.arch.as_deref().map(|arch| BTreeMap::from([("arch", arch)]));

    let body = SubmitRequest {
      definition_raw: STANDARD.encode(definition),
      library_ref: opts.library_ref.as_deref().unwrap_or_default(),
      library_url: opts.library_url.as_deref(),
      builder_requirements,
      context_digest: opts.context_digest.as_deref(),
      working_dir: opts.working_dir.as_deref(),
    };

    let url = self.endpoint("v1/build")?;
    debug!(url = %url, arch = ?opts.arch, "submitting build");

    let res = self.request(Method::POST, url).json(&body).send().await?;
    let bi: BuildInfo = read_data(res).await?;

    info!(build_id = %bi.id, "build submitted");
    Ok(bi)
  }

  /// Current status of a build.
  pub async fn status(&self, build_id: &str) -> Result<BuildInfo, ClientError> {
    let url = self.endpoint(&format!("v1/build/{}", build_id))?;
    let res = self.request(Method::GET, url).send().await?;
    read_data(res).await
  }

  /// Ask the service to cancel a running build.
  pub async fn cancel(&self, build_id: &str) -> Result<(), ClientError> {
    let url = self.endpoint(&format!("v1/build/{}/_cancel", build_id))?;
    debug!(build_id, "requesting build cancellation");
    let res = self.request(Method::PUT, url).send().await?;
    check_status(res).await
  }
}
