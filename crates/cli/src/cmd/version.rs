use anyhow::Result;
use clap::Args;
use serde::Serialize;

use rbuild_lib::arch::default_arch;
use rbuild_lib::consts::USER_AGENT_PRODUCT;

use crate::output::{OutputFormat, print_field, print_json};

#[derive(Args, Debug)]
pub struct VersionArgs {
  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

#[derive(Debug, Serialize)]
struct VersionInfo {
  product: &'static str,
  version: &'static str,
  os: &'static str,
  arch: String,
}

pub fn cmd_version(args: &VersionArgs) -> Result<()> {
  let info = VersionInfo {
    product: USER_AGENT_PRODUCT,
    version: env!("CARGO_PKG_VERSION"),
    os: std::env::consts::OS,
    arch: default_arch(),
  };

  if args.output.is_json() {
    return print_json(&info);
  }

  println!("{} {}", info.product, info.version);
  print_field("OS/Arch", format_args!("{}/{}", info.os, info.arch));
  Ok(())
}
