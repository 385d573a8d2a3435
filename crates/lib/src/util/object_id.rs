//! Twelve-byte object identifiers in the format the build service hands out.
//!
//! Layout: 4-byte big-endian seconds since the epoch, 3 bytes of a hash of the
//! host name, 2 bytes of process id, 3-byte counter. Rendered as 24 hex chars.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Mints object identifiers. Each generator owns its counter, so generators in
/// different tests never interfere with each other.
#[derive(Debug)]
pub struct ObjectIdGenerator {
  machine: [u8; 3],
  pid: u16,
  counter: AtomicU32,
}

impl ObjectIdGenerator {
  /// Create a generator for this host and process with a random counter seed.
  pub fn new() -> Self {
    let host = whoami::fallible::hostname().unwrap_or_default();
    let mut seed = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut seed);
    Self::with_parts(&host, std::process::id() as u16, u32::from_be_bytes(seed))
  }

  /// Create a generator from explicit identity parts.
  pub fn with_parts(host: &str, pid: u16, seed: u32) -> Self {
    let hash = Sha256::digest(host.as_bytes());
    Self {
      machine: [hash[0], hash[1], hash[2]],
      pid,
      counter: AtomicU32::new(seed),
    }
  }

  /// Return the next identifier, stamped with the current time.
  pub fn next_id(&self) -> String {
    let secs = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs() as u32)
      .unwrap_or_default();
    self.next_id_at(secs)
  }

  /// Return the next identifier for a fixed timestamp.
  pub fn next_id_at(&self, secs: u32) -> String {
    let count = self.counter.fetch_add(1, Ordering::Relaxed);

    let mut id = [0u8; 12];
    id[..4].copy_from_slice(&secs.to_be_bytes());
    id[4..7].copy_from_slice(&self.machine);
    id[7..9].copy_from_slice(&self.pid.to_be_bytes());
    id[9..].copy_from_slice(&count.to_be_bytes()[1..]);
    hex::encode(id)
  }
}

impl Default for ObjectIdGenerator {
  fn default() -> Self {
    Self::new()
  }
}
