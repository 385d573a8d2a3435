use std::fmt;

/// CPU architectures the build service knows how to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  Amd64,
  Arm64,
  Ppc64le,
  S390x,
  Riscv64,
  I386,
}

impl Arch {
  /// Detect the current CPU architecture at runtime
  pub fn current() -> Option<Self> {
    Self::from_rust_arch(std::env::consts::ARCH)
  }

  /// Map a Rust target architecture name onto the service's naming.
  pub fn from_rust_arch(arch: &str) -> Option<Self> {
    match arch {
      "x86_64" => Some(Self::Amd64),
      "aarch64" => Some(Self::Arm64),
      "powerpc64" => Some(Self::Ppc64le),
      "s390x" => Some(Self::S390x),
      "riscv64" => Some(Self::Riscv64),
      "x86" => Some(Self::I386),
      _ => None,
    }
  }

  /// Returns the identifier the build service expects
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Amd64 => "amd64",
      Self::Arm64 => "arm64",
      Self::Ppc64le => "ppc64le",
      Self::S390x => "s390x",
      Self::Riscv64 => "riscv64",
      Self::I386 => "386",
    }
  }
}

impl fmt::Display for Arch {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// Default architecture to request when the caller names none.
///
/// Falls back to the raw Rust architecture name for targets the service has no
/// name for, so the server can reject it with a meaningful message.
pub fn default_arch() -> String {
  match Arch::current() {
    Some(arch) => arch.as_str().to_string(),
    None => std::env::consts::ARCH.to_string(),
  }
}
