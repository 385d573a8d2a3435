//! Deterministic tar archiving of build-context files.
//!
//! The [`Archiver`] writes every name at most once, emits an entry for each
//! ancestor directory before anything beneath it, and always dereferences
//! symlinks. Calling [`Archiver::write_files`] with overlapping patterns
//! (`a/b/c`, `a/b`, `a`, `*`, `.`) therefore still yields one entry per path.

pub mod fs;
pub mod memfs;

use std::collections::HashSet;
use std::io::{self, Read, Write};

use tar::{EntryType, Header};
use thiserror::Error;
use tracing::trace;

use self::fs::{FileKind, FileSystem, glob, parent_dir, walk};

/// Errors that can occur while archiving.
#[derive(Debug, Error)]
pub enum ArchiveError {
  /// A path or pattern matched nothing.
  #[error("{0}: file does not exist")]
  NotFound(String),

  /// Named pipes, sockets and devices cannot be archived.
  #[error("{path}: unsupported file type ({kind})")]
  UnsupportedFileType { path: String, kind: FileKind },

  /// A glob pattern was malformed.
  #[error("syntax error in pattern '{0}'")]
  BadPattern(String),

  #[error("failed to archive '{path}': {source}")]
  Io {
    path: String,
    #[source]
    source: io::Error,
  },
}

impl ArchiveError {
  fn io(path: &str, source: io::Error) -> Self {
    if source.kind() == io::ErrorKind::NotFound {
      return Self::NotFound(path.to_string());
    }
    Self::Io {
      path: path.to_string(),
      source,
    }
  }
}

/// Writes files from a [`FileSystem`] into a tar stream.
pub struct Archiver<'a, F: FileSystem + ?Sized, W: Write> {
  fs: &'a F,
  builder: tar::Builder<W>,
  archived: HashSet<String>,
}

impl<'a, F: FileSystem + ?Sized, W: Write> Archiver<'a, F, W> {
  pub fn new(fs: &'a F, writer: W) -> Self {
    Self {
      fs,
      builder: tar::Builder::new(writer),
      archived: HashSet::new(),
    }
  }

  /// Archive everything matching `pattern`.
  ///
  /// Directories are archived recursively. Ancestors of each match are written
  /// first. A pattern that matches nothing is an error.
  pub fn write_files(&mut self, pattern: &str) -> Result<(), ArchiveError> {
    let matches = glob(self.fs, pattern)?;
    if matches.is_empty() {
      return Err(ArchiveError::NotFound(pattern.to_string()));
    }

    for path in matches {
      self.write_dir_all(parent_dir(&path))?;

      let info = self.fs.stat(&path).map_err(|e| ArchiveError::io(&path, e))?;
      if info.kind == FileKind::Dir {
        for p in walk(self.fs, &path).map_err(|e| ArchiveError::io(&path, e))? {
          if p != "." {
            self.write_entry(&p)?;
          }
        }
      } else {
        self.write_entry(&path)?;
      }
    }

    Ok(())
  }

  /// Names written so far.
  pub fn archived(&self) -> impl Iterator<Item = &str> {
    self.archived.iter().map(String::as_str)
  }

  /// Write the tar trailer and return the underlying writer.
  pub fn finish(self) -> Result<W, ArchiveError> {
    self.builder.into_inner().map_err(|e| ArchiveError::io(".", e))
  }

  fn write_dir_all(&mut self, path: &str) -> Result<(), ArchiveError> {
    if path == "." || self.archived.contains(path) {
      return Ok(());
    }
    self.write_dir_all(parent_dir(path))?;
    self.write_entry(path)
  }

  fn write_entry(&mut self, path: &str) -> Result<(), ArchiveError> {
    if self.archived.contains(path) {
      return Ok(());
    }

    let info = self.fs.stat(path).map_err(|e| ArchiveError::io(path, e))?;

    let mut header = Header::new_ustar();
    header.set_mode(info.mode);
    header.set_mtime(info.mtime);
    header.set_uid(0);
    header.set_gid(0);

    match info.kind {
      // Symlinks the filesystem could not resolve still go in as regular files.
      FileKind::File | FileKind::Symlink => {
        header.set_entry_type(EntryType::Regular);
        header.set_size(info.size);
        let reader = self.fs.open(path).map_err(|e| ArchiveError::io(path, e))?;
        self
          .builder
          .append_data(&mut header, path, reader.take(info.size))
          .map_err(|e| ArchiveError::io(path, e))?;
      }
      FileKind::Dir => {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        self
          .builder
          .append_data(&mut header, format!("{}/", path), io::empty())
          .map_err(|e| ArchiveError::io(path, e))?;
      }
      kind => {
        return Err(ArchiveError::UnsupportedFileType {
          path: path.to_string(),
          kind,
        });
      }
    }

    trace!(path, kind = %info.kind, "archived entry");
    self.archived.insert(path.to_string());
    Ok(())
  }
}

/// Archive `patterns` from `fs` into `writer`, returning the writer once the
/// trailer has been written.
pub fn write_archive<F: FileSystem + ?Sized, W: Write>(
  fs: &F,
  patterns: &[String],
  writer: W,
) -> Result<W, ArchiveError> {
  let mut archiver = Archiver::new(fs, writer);
  for pattern in patterns {
    archiver.write_files(pattern)?;
  }
  archiver.finish()
}
