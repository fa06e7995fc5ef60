//! Mod repository discovery and validation.
//!
//! A repository root carries a version stamp file, the QC source trees under
//! `qcsrc/`, loose runtime files under `modfiles/`, and one `<name>.pk3dir`
//! directory per package. Everything is discovered up front so dispatch can
//! register all tasks before any of them runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::package::{self, Package};
use crate::qcmod::{ModuleKind, QcModule};
use crate::util;

/// Version stamp file at the repository root.
pub const REPO_VERSION_FILE: &str = ".rmbuild_repoversion";

/// Highest repository format version this tool understands.
pub const MAX_REPO_VERSION: u32 = 0;

/// Version-control metadata resolved by the caller (branch, revision).
#[derive(Debug, Clone, Default)]
pub struct VcsInfo {
  pub branch: Option<String>,
  pub version: Option<String>,
}

#[derive(Debug)]
pub struct Repo {
  root: PathBuf,
  qcsrc: PathBuf,
  modfiles: PathBuf,
  packages: Vec<Arc<Package>>,
  vcs: VcsInfo,
}

impl Repo {
  /// Open and validate the repository at `root`.
  pub fn open(root: &Path, vcs: VcsInfo) -> Result<Arc<Repo>> {
    let root = util::directory(root)?.canonicalize()?;

    // A missing stamp marks a pre-versioning repository (version 0).
    let version_path = root.join(REPO_VERSION_FILE);
    let found: u32 = match fs::read_to_string(&version_path) {
      Ok(stamp) => stamp
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("malformed repository version stamp: {:?}", stamp.trim())))?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
      Err(e) => return Err(e.into()),
    };
    if found > MAX_REPO_VERSION {
      return Err(Error::VersionMismatch {
        found,
        supported: MAX_REPO_VERSION,
      });
    }

    let qcsrc = util::directory(root.join("qcsrc"))?;
    let modfiles = util::directory(root.join("modfiles"))?;

    let mut packages = Vec::new();
    for entry in fs::read_dir(&root)? {
      let entry = entry?;
      let path = entry.path();
      if !path.is_dir() || path.extension().and_then(|e| e.to_str()) != Some("pk3dir") {
        continue;
      }
      let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
        continue;
      };
      debug!(package = name, "discovered package");
      packages.push(Arc::new(package::construct(name, path.clone())));
    }
    packages.sort_by(|a, b| a.name().cmp(b.name()));

    info!(
      root = %root.display(),
      version = found,
      packages = packages.len(),
      "repository opened"
    );

    Ok(Arc::new(Repo {
      root,
      qcsrc,
      modfiles,
      packages,
      vcs,
    }))
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn modfiles(&self) -> &Path {
    &self.modfiles
  }

  pub fn packages(&self) -> &[Arc<Package>] {
    &self.packages
  }

  pub fn vcs(&self) -> &VcsInfo {
    &self.vcs
  }

  /// A source tree shared between modules (`common`, `warpzonelib`, `menu`).
  pub fn shared_tree(&self, name: &str) -> Result<PathBuf> {
    util::directory(self.qcsrc.join(name))
  }

  /// The QC module of the given kind.
  pub fn qc_module(&self, kind: ModuleKind) -> Result<QcModule> {
    QcModule::new(kind, self.qcsrc.join(kind.as_str()))
  }
}
