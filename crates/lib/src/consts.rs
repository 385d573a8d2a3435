//! Well-known constants shared across the crate.

use std::time::Duration;

/// Frontend used when neither a URL override nor a host-qualified library ref is given.
pub const DEFAULT_FRONTEND_URL: &str = "https://cloud.sylabs.io";

/// Build service base URL used by [`crate::client::ClientConfig::default`].
pub const DEFAULT_BUILD_URL: &str = "https://build.sylabs.io/";

/// Path of the frontend configuration document, relative to the frontend URL.
pub const FRONTEND_CONFIG_PATH: &str = "assets/config/config.prod.json";

/// Prefix of every build-context and image digest.
pub const DIGEST_PREFIX: &str = "sha256.";

/// How long the service keeps an unpublished build artifact.
pub const EPHEMERAL_RETENTION_HOURS: u32 = 24;

/// Upper bound for requests issued after the caller's cancellation already fired.
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Product token used in the `User-Agent` header.
pub const USER_AGENT_PRODUCT: &str = "rbuild";

/// Returns the default `User-Agent` value, `rbuild/<version>`.
pub fn default_user_agent() -> String {
  format!("{}/{}", USER_AGENT_PRODUCT, env!("CARGO_PKG_VERSION"))
}
