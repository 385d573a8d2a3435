//! In-memory [`FileSystem`] for tests and callers that assemble contexts
//! without touching disk.

use std::collections::BTreeMap;
use std::io::{self, Read};

use super::fs::{DirEntry, FileInfo, FileKind, FileSystem, parent_dir, valid_path};

const MAX_LINK_DEPTH: usize = 40;

#[derive(Debug, Clone)]
enum Node {
  File(Vec<u8>),
  Dir,
  Symlink(String),
  Special(FileKind),
}

#[derive(Debug, Clone)]
struct Entry {
  node: Node,
  mode: u32,
  mtime: u64,
}

/// A map of names to file contents. Ancestors of every inserted name exist
/// implicitly as directories with mode `0o755` and mtime 0.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
  entries: BTreeMap<String, Entry>,
}

impl MemFs {
  pub fn new() -> Self {
    Self::default()
  }

  fn insert(&mut self, name: &str, node: Node, mode: u32, mtime: u64) {
    let name = name.trim_start_matches('/').to_string();
    let mut parent = parent_dir(&name).to_string();
    while parent != "." {
      self.entries.entry(parent.clone()).or_insert(Entry {
        node: Node::Dir,
        mode: 0o755,
        mtime: 0,
      });
      parent = parent_dir(&parent).to_string();
    }
    self.entries.insert(name, Entry { node, mode, mtime });
  }

  pub fn insert_file(&mut self, name: &str, data: &[u8], mtime: u64) {
    self.insert(name, Node::File(data.to_vec()), 0o644, mtime);
  }

  pub fn insert_dir(&mut self, name: &str, mtime: u64) {
    self.insert(name, Node::Dir, 0o755, mtime);
  }

  /// Insert a symlink. `target` is a name relative to the root.
  pub fn insert_symlink(&mut self, name: &str, target: &str) {
    self.insert(name, Node::Symlink(target.to_string()), 0o777, 0);
  }

  /// Insert an entry of a kind that carries no content, such as a named pipe.
  pub fn insert_special(&mut self, name: &str, kind: FileKind) {
    self.insert(name, Node::Special(kind), 0o644, 0);
  }

  fn lookup(&self, name: &str) -> io::Result<&Entry> {
    if !valid_path(name) {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid name '{}'", name)));
    }
    self
      .entries
      .get(name)
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}: file does not exist", name)))
  }

  fn follow(&self, name: &str) -> io::Result<&Entry> {
    let mut entry = self.lookup(name)?;
    for _ in 0..MAX_LINK_DEPTH {
      match &entry.node {
        Node::Symlink(target) => entry = self.lookup(target)?,
        _ => return Ok(entry),
      }
    }
    Err(io::Error::other(format!("{}: too many levels of symbolic links", name)))
  }

  fn is_dir(&self, name: &str) -> bool {
    name == "." || self.follow(name).is_ok_and(|e| matches!(e.node, Node::Dir))
  }
}

fn kind(node: &Node) -> FileKind {
  match node {
    Node::File(_) => FileKind::File,
    Node::Dir => FileKind::Dir,
    Node::Symlink(_) => FileKind::Symlink,
    Node::Special(kind) => *kind,
  }
}

impl FileSystem for MemFs {
  fn stat(&self, name: &str) -> io::Result<FileInfo> {
    if name == "." {
      return Ok(FileInfo {
        kind: FileKind::Dir,
        size: 0,
        mode: 0o755,
        mtime: 0,
      });
    }

    let entry = self.follow(name)?;
    let size = match &entry.node {
      Node::File(data) => data.len() as u64,
      _ => 0,
    };
    Ok(FileInfo {
      kind: kind(&entry.node),
      size,
      mode: entry.mode,
      mtime: entry.mtime,
    })
  }

  fn read_dir(&self, name: &str) -> io::Result<Vec<DirEntry>> {
    if !self.is_dir(name) {
      return Err(io::Error::new(io::ErrorKind::NotADirectory, format!("{}: not a directory", name)));
    }

    let dir = match self.lookup(name) {
      Ok(Entry { node: Node::Symlink(target), .. }) => target.as_str(),
      _ => name,
    };

    // BTreeMap iteration keeps the listing sorted.
    Ok(
      self
        .entries
        .iter()
        .filter(|(path, _)| path.as_str() != dir && parent_dir(path) == dir)
        .map(|(path, entry)| DirEntry {
          name: path.rsplit('/').next().unwrap_or(path).to_string(),
          kind: kind(&entry.node),
        })
        .collect(),
    )
  }

  fn open(&self, name: &str) -> io::Result<Box<dyn Read + '_>> {
    match &self.follow(name)?.node {
      Node::File(data) => Ok(Box::new(data.as_slice())),
      _ => Err(io::Error::other(format!("{}: not a regular file", name))),
    }
  }
}
