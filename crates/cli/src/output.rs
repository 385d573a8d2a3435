//! Terminal output for rbuild.
//!
//! Status lines go to stderr so that stdout carries only the build log and
//! the final summary.

use std::fmt;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{AnsiColors, OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

/// Kind of a stderr status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Done,
  Note,
  Warn,
  Fail,
}

impl Status {
  fn symbol(self) -> &'static str {
    match self {
      Status::Done => "✓",
      Status::Note => "•",
      Status::Warn => "⚠",
      Status::Fail => "✗",
    }
  }

  fn color(self) -> AnsiColors {
    match self {
      Status::Done => AnsiColors::Green,
      Status::Note => AnsiColors::Blue,
      Status::Warn => AnsiColors::Yellow,
      Status::Fail => AnsiColors::Red,
    }
  }

  /// Warnings and failures color the message too, not just the symbol.
  fn colors_message(self) -> bool {
    matches!(self, Status::Warn | Status::Fail)
  }
}

/// Print `message` on stderr prefixed with the symbol for `status`.
pub fn status(status: Status, message: impl fmt::Display) {
  let color = status.color();
  let sym = status.symbol();
  let symbol = sym.if_supports_color(Stream::Stderr, |s| s.color(color));
  let message = message.to_string();
  if status.colors_message() {
    eprintln!("{} {}", symbol, message.if_supports_color(Stream::Stderr, |s| s.color(color)));
  } else {
    eprintln!("{} {}", symbol, message);
  }
}

/// A dimmed `label: value` line on stdout.
pub fn print_field(label: &str, value: impl fmt::Display) {
  println!("  {}: {}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()), value);
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

/// Image sizes in binary units with one decimal.
pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

  if bytes < 1024 {
    return format!("{} B", bytes);
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  format!("{:.1} {}", value, UNITS[unit])
}

/// Build times run from seconds to hours.
pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  match secs {
    0 => format!("{}ms", duration.subsec_millis()),
    1..60 => format!("{:.2}s", duration.as_secs_f64()),
    60..3600 => format!("{}m {}s", secs / 60, secs % 60),
    _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
  }
}

/// Seconds since the Unix epoch as an RFC 3339 UTC timestamp.
pub fn format_timestamp(secs: u64) -> String {
  humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs)).to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bytes_use_binary_units() {
    assert_eq!(format_bytes(15), "15 B");
    assert_eq!(format_bytes(1536), "1.5 KB");
    assert_eq!(format_bytes(52_428_800), "50.0 MB");
    assert_eq!(format_bytes(1_073_741_824), "1.0 GB");
  }

  #[test]
  fn durations_scale_with_length() {
    assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
    assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m");
  }

  #[test]
  fn timestamps_are_utc() {
    assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
    assert_eq!(format_timestamp(1_700_000_000), "2023-11-14T22:13:20Z");
  }

  #[test]
  fn only_warnings_and_failures_color_the_message() {
    assert!(!Status::Done.colors_message());
    assert!(!Status::Note.colors_message());
    assert!(Status::Warn.colors_message());
    assert!(Status::Fail.colors_message());
  }

  #[test]
  fn every_status_prints() {
    for kind in [Status::Done, Status::Note, Status::Warn, Status::Fail] {
      assert!(!kind.symbol().is_empty());
      status(kind, format_args!("{:?} line", kind));
    }
  }
}
