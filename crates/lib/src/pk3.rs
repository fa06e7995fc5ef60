//! pk3 archive writing.
//!
//! pk3 files are deflate-compressed zip containers. Symlinked source files
//! become archive-native symlink entries (Unix file-mode bits, POSIX creator
//! system) whose content is the link target path, not the target's bytes.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;

use tracing::debug;
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

use crate::error::Result;

pub struct Pk3Writer {
  inner: ZipWriter<File>,
}

impl Pk3Writer {
  pub fn create(path: &Path) -> Result<Self> {
    let file = File::create(path)?;
    Ok(Pk3Writer {
      inner: ZipWriter::new(file),
    })
  }

  fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
      .compression_method(CompressionMethod::Deflated)
      .unix_permissions(0o644)
  }

  /// Add a regular file under `name`.
  pub fn add_file(&mut self, name: &str, src: &Path) -> Result<()> {
    debug!(entry = name, src = %src.display(), "adding file");
    self.inner.start_file(name, Self::file_options())?;
    let mut reader = BufReader::new(File::open(src)?);
    io::copy(&mut reader, &mut self.inner)?;
    Ok(())
  }

  /// Add a zero-length entry under `name`. Used so references to a
  /// recompressed file's original name still resolve.
  pub fn add_placeholder(&mut self, name: &str) -> Result<()> {
    debug!(entry = name, "adding placeholder");
    self.inner.start_file(name, Self::file_options())?;
    Ok(())
  }

  /// Add a symlink entry whose content is the target path.
  pub fn add_symlink(&mut self, name: &str, target: &str) -> Result<()> {
    debug!(entry = name, target, "adding symlink");
    let options = SimpleFileOptions::default()
      .compression_method(CompressionMethod::Stored)
      .unix_permissions(0o777);
    self.inner.add_symlink(name, target, options)?;
    Ok(())
  }

  /// Add a text entry under `name`.
  pub fn add_text(&mut self, name: &str, contents: &str) -> Result<()> {
    debug!(entry = name, "adding text entry");
    self.inner.start_file(name, Self::file_options())?;
    self.inner.write_all(contents.as_bytes())?;
    Ok(())
  }

  pub fn finish(self) -> Result<()> {
    self.inner.finish()?;
    Ok(())
  }
}
