use std::io::{self, IsTerminal, Write};

use rbuild_lib::sign::{KeySummary, Prompter, SignError};

use crate::output::{Status, format_timestamp, status};

/// Asks for key choices and passphrases on the terminal.
pub struct TerminalPrompter;

fn ensure_interactive(what: &str) -> Result<(), SignError> {
  if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
    return Err(SignError::Prompt(format!(
      "Cannot prompt for {} in non-interactive mode. Use --keyidx, --fingerprint or --passphrase.",
      what
    )));
  }
  Ok(())
}

/// Render `keys` the way the selection prompt lists them.
pub fn key_listing(keys: &[KeySummary]) -> String {
  let mut out = String::new();
  for key in keys {
    out.push_str(&format!("{}) U: {}\n", key.index, key.user_ids.join(", ")));
    out.push_str(&format!("   C: {}\n", format_timestamp(key.created)));
    out.push_str(&format!("   F: {}\n", key.fingerprint));
    out.push_str(&format!("   L: {}\n", key.algorithm));
    out.push_str("   --------\n");
  }
  out
}

impl Prompter for TerminalPrompter {
  fn select_key(&self, keys: &[KeySummary]) -> Result<usize, SignError> {
    ensure_interactive("a signing key")?;

    let mut stderr = io::stderr();
    write!(stderr, "{}", key_listing(keys))?;
    write!(stderr, "Enter # of private key to use : ")?;
    stderr.flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    input
      .trim()
      .parse()
      .map_err(|_| SignError::Prompt(format!("invalid key number '{}'", input.trim())))
  }

  fn passphrase(&self, prompt: &str) -> Result<String, SignError> {
    ensure_interactive("a passphrase")?;
    Ok(rpassword::prompt_password(prompt)?)
  }

  fn notice(&self, message: &str) {
    status(Status::Note, message);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn lists_keys_with_index_and_fingerprint() {
    let keys = vec![KeySummary {
      index: 0,
      fingerprint: "CC098024591A47BF9C26C73971E43BDCAD0F7A31".into(),
      user_ids: vec!["Alice Example <alice@example.com>".into()],
      created: 1_700_000_000,
      algorithm: "EdDSA".into(),
    }];

    assert_eq!(
      key_listing(&keys),
      "0) U: Alice Example <alice@example.com>\n   C: 2023-11-14T22:13:20Z\n   F: \
       CC098024591A47BF9C26C73971E43BDCAD0F7A31\n   L: EdDSA\n   --------\n"
    );
  }
}
