//! Read-only filesystem capability used by the archiver.
//!
//! Names are rootless and slash-separated. The root is named `"."`, and no
//! name may contain empty, `.` or `..` elements. [`DirFs`] serves these names
//! from a directory on disk, [`super::memfs::MemFs`] from memory.

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use glob::Pattern;

use super::ArchiveError;

/// The type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
  File,
  Dir,
  Symlink,
  NamedPipe,
  Socket,
  BlockDevice,
  CharDevice,
  Other,
}

impl FileKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::File => "regular file",
      Self::Dir => "directory",
      Self::Symlink => "symlink",
      Self::NamedPipe => "named pipe",
      Self::Socket => "socket",
      Self::BlockDevice => "block device",
      Self::CharDevice => "character device",
      Self::Other => "irregular file",
    }
  }
}

impl fmt::Display for FileKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Metadata returned by [`FileSystem::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
  pub kind: FileKind,
  pub size: u64,
  /// Permission bits only.
  pub mode: u32,
  /// Modification time in seconds since the Unix epoch.
  pub mtime: u64,
}

/// A directory entry as listed by [`FileSystem::read_dir`].
///
/// `kind` describes the entry itself; symlinks are not followed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
  pub name: String,
  pub kind: FileKind,
}

/// The operations the archiver needs from a filesystem.
pub trait FileSystem {
  /// Metadata for `name`, following symlinks where the backing store can.
  fn stat(&self, name: &str) -> io::Result<FileInfo>;

  /// Entries of the directory `name`, sorted by name.
  fn read_dir(&self, name: &str) -> io::Result<Vec<DirEntry>>;

  /// Open `name` for reading.
  fn open(&self, name: &str) -> io::Result<Box<dyn Read + '_>>;
}

/// Whether `name` is a valid rootless, slash-separated name.
pub fn valid_path(name: &str) -> bool {
  if name == "." {
    return true;
  }
  !name.is_empty() && name.split('/').all(|elem| !elem.is_empty() && elem != "." && elem != "..")
}

/// Parent of `name`, with `"."` as the parent of top-level names.
pub fn parent_dir(name: &str) -> &str {
  match name.rfind('/') {
    Some(idx) => &name[..idx],
    None => ".",
  }
}

/// Join a directory and an entry name.
pub fn join(dir: &str, name: &str) -> String {
  if dir == "." { name.to_string() } else { format!("{}/{}", dir, name) }
}

/// Backslash is not an escape; bracket a metacharacter to match it literally.
fn has_meta(pattern: &str) -> bool {
  pattern.contains(['*', '?', '['])
}

/// Expand `pattern` against `fs`.
///
/// Patterns without metacharacters match themselves when they exist. Otherwise
/// the last element is matched against the entries of every directory that
/// matches the rest of the pattern. Unreadable directories contribute nothing.
pub fn glob<F: FileSystem + ?Sized>(fs: &F, pattern: &str) -> Result<Vec<String>, ArchiveError> {
  if !has_meta(pattern) {
    return Ok(match fs.stat(pattern) {
      Ok(_) => vec![pattern.to_string()],
      Err(_) => Vec::new(),
    });
  }

  let (dir, file) = match pattern.rfind('/') {
    Some(idx) => (&pattern[..idx], &pattern[idx + 1..]),
    None => (".", pattern),
  };
  let matcher = Pattern::new(file).map_err(|_| ArchiveError::BadPattern(pattern.to_string()))?;

  if !has_meta(dir) {
    return Ok(glob_dir(fs, dir, &matcher));
  }
  if dir == pattern {
    return Err(ArchiveError::BadPattern(pattern.to_string()));
  }

  let mut matches = Vec::new();
  for d in glob(fs, dir)? {
    matches.extend(glob_dir(fs, &d, &matcher));
  }
  Ok(matches)
}

fn glob_dir<F: FileSystem + ?Sized>(fs: &F, dir: &str, matcher: &Pattern) -> Vec<String> {
  let Ok(entries) = fs.read_dir(dir) else {
    return Vec::new();
  };
  entries
    .into_iter()
    .filter(|e| matcher.matches(&e.name))
    .map(|e| join(dir, &e.name))
    .collect()
}

/// Depth-first, pre-order list of `root` and everything beneath it.
///
/// Directories reached through a symlink are listed but not descended into.
pub fn walk<F: FileSystem + ?Sized>(fs: &F, root: &str) -> io::Result<Vec<String>> {
  let mut out = vec![root.to_string()];
  if fs.stat(root)?.kind == FileKind::Dir {
    walk_dir(fs, root, &mut out)?;
  }
  Ok(out)
}

fn walk_dir<F: FileSystem + ?Sized>(fs: &F, dir: &str, out: &mut Vec<String>) -> io::Result<()> {
  for entry in fs.read_dir(dir)? {
    let path = join(dir, &entry.name);
    out.push(path.clone());
    if entry.kind == FileKind::Dir {
      walk_dir(fs, &path, out)?;
    }
  }
  Ok(())
}

/// Serves names from a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct DirFs {
  root: PathBuf,
}

impl DirFs {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn resolve(&self, name: &str) -> io::Result<PathBuf> {
    if !valid_path(name) {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid name '{}'", name)));
    }
    Ok(if name == "." { self.root.clone() } else { self.root.join(name) })
  }
}

impl Default for DirFs {
  fn default() -> Self {
    Self::new("/")
  }
}

fn kind_of(ft: fs::FileType) -> FileKind {
  if ft.is_dir() {
    return FileKind::Dir;
  }
  if ft.is_file() {
    return FileKind::File;
  }
  if ft.is_symlink() {
    return FileKind::Symlink;
  }

  #[cfg(unix)]
  {
    use std::os::unix::fs::FileTypeExt;
    if ft.is_fifo() {
      return FileKind::NamedPipe;
    }
    if ft.is_socket() {
      return FileKind::Socket;
    }
    if ft.is_block_device() {
      return FileKind::BlockDevice;
    }
    if ft.is_char_device() {
      return FileKind::CharDevice;
    }
  }

  FileKind::Other
}

#[cfg(unix)]
fn permission_bits(meta: &fs::Metadata) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(meta: &fs::Metadata) -> u32 {
  match (meta.is_dir(), meta.permissions().readonly()) {
    (true, _) => 0o755,
    (false, true) => 0o444,
    (false, false) => 0o644,
  }
}

impl FileSystem for DirFs {
  fn stat(&self, name: &str) -> io::Result<FileInfo> {
    let meta = fs::metadata(self.resolve(name)?)?;
    let mtime = meta
      .modified()
      .ok()
      .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
      .map(|d| d.as_secs())
      .unwrap_or_default();

    Ok(FileInfo {
      kind: kind_of(meta.file_type()),
      size: meta.len(),
      mode: permission_bits(&meta),
      mtime,
    })
  }

  fn read_dir(&self, name: &str) -> io::Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(self.resolve(name)?)? {
      let entry = entry?;
      let file_name = entry.file_name().into_string().map_err(|raw| {
        io::Error::new(io::ErrorKind::InvalidData, format!("non UTF-8 file name {:?}", raw))
      })?;
      entries.push(DirEntry {
        name: file_name,
        kind: kind_of(entry.file_type()?),
      });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
  }

  fn open(&self, name: &str) -> io::Result<Box<dyn Read + '_>> {
    Ok(Box::new(fs::File::open(self.resolve(name)?)?))
  }
}
