mod build;
mod version;

pub use build::{BUILD_EXAMPLES, BuildArgs, cmd_build};
pub use version::{VersionArgs, cmd_version};
