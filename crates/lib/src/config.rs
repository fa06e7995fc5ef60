//! Settings and hook shapes consumed by the orchestrator.
//!
//! The configuration loader itself lives outside this crate; it produces a
//! fully constructed [`Settings`] value plus a [`Hooks`] table once and
//! passes both in. The core keeps no ambient mutable state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::build::BuildContext;
use crate::error::Result;

/// How `-DRM_AUTOCVARS` is applied to the QC modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Autocvars {
  /// Every module gets the flag.
  Enable,
  /// No module gets the flag.
  Disable,
  /// The server gets the flag, and a second client variant is built with it
  /// under an alternate progs name and cvar.
  #[default]
  Compatible,
}

/// Build-wide configuration, produced once by the (external) loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// Command used to run the QuakeC compiler.
  pub qcc_cmd: String,
  /// Extra flags passed to every compiler invocation.
  pub qcc_flags: Vec<String>,
  /// Intermediate build directory; a temp directory when unset.
  pub output_dir: Option<PathBuf>,
  /// Cache directory; caching is disabled entirely when unset.
  pub cache_dir: Option<PathBuf>,
  /// Human-readable string identifying the build.
  pub comment: String,
  /// Build name suffix; defaults to the branch name (`master` maps to none).
  pub suffix: Option<String>,
  pub autocvars: Autocvars,
  /// Pool slots for concurrent tasks.
  pub threads: usize,
  /// `o_`/`c_` packages to build in addition to the default set.
  pub extra_packages: Vec<String>,
  /// Symlink package source directories instead of assembling archives.
  pub link_pk3dirs: bool,
  /// Recompress eligible raster images to JPEG inside packages.
  pub compress_gfx: bool,
  pub compress_gfx_quality: u8,
  /// Consider every eligible image, not just those under `compressdirs`.
  pub compress_gfx_all: bool,
  /// File extensions (lowercase, no dot) eligible for recompression.
  pub compress_gfx_formats: Vec<String>,
  /// Package-relative paths that must never be recompressed.
  pub compress_gfx_exclude: Vec<PathBuf>,
  pub cache_qc: bool,
  pub cache_pkg: bool,
  /// Bypass cache lookup (stores still happen, keeping the cache warm).
  pub force_rebuild: bool,
  /// Relocate loose output files into one additional server-side package.
  pub server_pkg: bool,
  /// Deployment target directories (files copied).
  pub install_dirs: Vec<PathBuf>,
  /// Deployment target directories (files symlinked).
  pub install_linkdirs: Vec<PathBuf>,
}

impl Default for Settings {
  fn default() -> Self {
    Settings {
      qcc_cmd: "rmqcc".to_string(),
      qcc_flags: Vec::new(),
      output_dir: None,
      cache_dir: None,
      comment: "custom build".to_string(),
      suffix: None,
      autocvars: Autocvars::default(),
      threads: 8,
      extra_packages: Vec::new(),
      link_pk3dirs: false,
      compress_gfx: true,
      compress_gfx_quality: 85,
      compress_gfx_all: false,
      compress_gfx_formats: vec!["tga".to_string()],
      compress_gfx_exclude: Vec::new(),
      cache_qc: true,
      cache_pkg: true,
      force_rebuild: false,
      server_pkg: false,
      install_dirs: Vec::new(),
      install_linkdirs: Vec::new(),
    }
  }
}

impl Settings {
  /// Check whether a file extension is eligible for recompression.
  pub fn gfx_format_eligible(&self, ext: &str) -> bool {
    let ext = ext.to_ascii_lowercase();
    self.compress_gfx_formats.iter().any(|f| *f == ext)
  }

  /// Check the per-path recompression denylist.
  pub fn gfx_path_excluded(&self, rel: &Path) -> bool {
    self.compress_gfx_exclude.iter().any(|p| p == rel)
  }
}

pub type BuildHook = Box<dyn Fn(&BuildContext) -> Result<()> + Send + Sync>;
pub type PackageHook = Box<dyn Fn(&BuildContext, &Path) -> Result<()> + Send + Sync>;

/// Named hook callbacks supplied by the configuration loader.
#[derive(Default)]
pub struct Hooks {
  /// Runs once after a successful drain, before deployment.
  pub post_build: Option<BuildHook>,
  /// Runs once after all deployments.
  pub post_install: Option<BuildHook>,
  /// Runs after each package archive is finished, with its path.
  pub post_build_pkg: Option<PackageHook>,
}
