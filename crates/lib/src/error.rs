//! Error types for rmbuild.
//!
//! One central error enum covers the whole pipeline. Errors raised inside
//! concurrently scheduled tasks are latched by the task graph and surfaced
//! from `drain_all`; errors during the synchronous dispatch phase propagate
//! immediately and abort the build before any task runs.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a build.
#[derive(Debug, Error)]
pub enum Error {
  /// An expected file or directory is missing or of the wrong kind.
  #[error("{message}: {path}")]
  Path { path: PathBuf, message: String },

  /// On-disk repository metadata is newer than this tool supports.
  #[error("repository version is {found}, maximum supported is {supported}")]
  VersionMismatch { found: u32, supported: u32 },

  /// A derived package's hash was read before its upstream module finished.
  /// This is an ordering violation and always fatal.
  #[error("package {package}: identity read before the upstream module finished")]
  IdentityNotReady { package: String },

  /// The external compiler exited non-zero.
  #[error("compiler {cmd} exited with code {code:?}")]
  Compiler { cmd: String, code: Option<i32> },

  /// The external compiler could not be started at all.
  #[error("failed to start compiler {cmd}: {message}")]
  CompilerSpawn { cmd: String, message: String },

  /// A symlink was encountered while relocating files into the server bundle.
  #[error("unsupported symlink while assembling the server bundle: {path}")]
  UnsupportedSymlink { path: PathBuf },

  /// Cooperative abort: another task already failed and this one stopped
  /// early at a safe point.
  #[error("build aborted")]
  Aborted,

  /// Invalid configuration value detected during dispatch.
  #[error("invalid configuration: {0}")]
  Config(String),

  /// A task awaited through the task graph failed.
  #[error("task {name} failed: {message}")]
  TaskFailed { name: String, message: String },

  /// A task was registered under a group that has already been awaited.
  /// See the task graph's register-before-wait contract.
  #[error("task {name} registered under group {group} after it was awaited")]
  GroupSealed { name: String, group: String },

  /// Raster image decode or encode failure during recompression.
  #[error("image {path}: {message}")]
  Image { path: PathBuf, message: String },

  /// Archive read or write failure.
  #[error("archive error: {0}")]
  Archive(#[from] zip::result::ZipError),

  /// A user-supplied hook callback failed.
  #[error("hook {name} failed: {message}")]
  Hook { name: String, message: String },

  /// I/O error.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl Error {
  /// Shorthand for a [`Error::Path`] with an owned message.
  pub fn path(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
    Error::Path {
      path: path.into(),
      message: message.into(),
    }
  }
}
