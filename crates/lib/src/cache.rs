//! Content-addressed build cache.
//!
//! Two artifact kinds share one cache directory:
//!
//! ```text
//! <cacheDir>/
//! ├── qc/<finalModuleName>/<hexHash>/   # compiled module output trees
//! └── pkg/<outputFileName>              # assembled package blobs
//! ```
//!
//! Package blobs are addressed by their output filename, which already
//! embeds the content hash. Misses are the normal "build it" path, not
//! errors. There is no eviction; entries persist until removed externally.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::Result;
use crate::util;

pub struct BuildCache {
  root: PathBuf,
}

impl BuildCache {
  /// Open (creating if necessary) a cache rooted at `root`.
  pub fn open(root: &Path) -> Result<Self> {
    let root = util::make_directory(root)?;
    debug!(cache = %root.display(), "cache opened");
    Ok(BuildCache { root })
  }

  fn module_dir(&self, final_name: &str, hash: &str) -> PathBuf {
    self.root.join("qc").join(final_name).join(hash)
  }

  fn package_path(&self, file_name: &str) -> PathBuf {
    self.root.join("pkg").join(file_name)
  }

  /// Copy a cached module output tree into `dest`. Returns `false` on miss.
  pub fn fetch_module(&self, final_name: &str, hash: &str, dest: &Path) -> Result<bool> {
    let entry = self.module_dir(final_name, hash);
    if !entry.is_dir() {
      return Ok(false);
    }
    info!(module = final_name, hash, "module cache hit");
    util::copy_tree(&entry, dest)?;
    Ok(true)
  }

  /// Store a compiled module output tree, replacing any previous entry for
  /// the same hash.
  pub fn store_module(&self, final_name: &str, hash: &str, src: &Path) -> Result<()> {
    let entry = self.module_dir(final_name, hash);
    if entry.is_dir() {
      fs::remove_dir_all(&entry)?;
    }
    util::make_directory(&entry)?;
    util::copy_tree(src, &entry)?;
    debug!(module = final_name, hash, "module cached");
    Ok(())
  }

  /// Copy a cached package blob into `output_dir`. Returns `false` on miss.
  pub fn fetch_package(&self, file_name: &str, output_dir: &Path) -> Result<bool> {
    let entry = self.package_path(file_name);
    if !entry.is_file() {
      return Ok(false);
    }
    info!(package = file_name, "package cache hit");
    util::copy_file(&entry, &output_dir.join(file_name))?;
    Ok(true)
  }

  /// Store an assembled package blob under its hash-embedding filename.
  pub fn store_package(&self, file_name: &str, built: &Path) -> Result<()> {
    let entry = self.package_path(file_name);
    util::copy_file(built, &entry)?;
    debug!(package = file_name, "package cached");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn module_roundtrip() {
    let temp = tempdir().unwrap();
    let cache = BuildCache::open(&temp.path().join("cache")).unwrap();

    let built = temp.path().join("built");
    fs::create_dir_all(&built).unwrap();
    fs::write(built.join("progs.dat"), b"compiled").unwrap();

    cache.store_module("rocketminsta_sv", "abc123", &built).unwrap();

    let dest = temp.path().join("dest");
    fs::create_dir_all(&dest).unwrap();
    assert!(cache.fetch_module("rocketminsta_sv", "abc123", &dest).unwrap());
    assert_eq!(fs::read(dest.join("progs.dat")).unwrap(), b"compiled");

    // Different hash is a miss.
    assert!(!cache.fetch_module("rocketminsta_sv", "other", &dest).unwrap());
  }

  #[test]
  fn store_module_replaces_stale_entry() {
    let temp = tempdir().unwrap();
    let cache = BuildCache::open(&temp.path().join("cache")).unwrap();

    let built = temp.path().join("built");
    fs::create_dir_all(&built).unwrap();
    fs::write(built.join("old.dat"), b"old").unwrap();
    cache.store_module("menu", "h", &built).unwrap();

    fs::remove_file(built.join("old.dat")).unwrap();
    fs::write(built.join("new.dat"), b"new").unwrap();
    cache.store_module("menu", "h", &built).unwrap();

    let dest = temp.path().join("dest");
    fs::create_dir_all(&dest).unwrap();
    cache.fetch_module("menu", "h", &dest).unwrap();
    assert!(!dest.join("old.dat").exists());
    assert!(dest.join("new.dat").exists());
  }

  #[test]
  fn package_roundtrip() {
    let temp = tempdir().unwrap();
    let cache = BuildCache::open(&temp.path().join("cache")).unwrap();

    let blob = temp.path().join("zzz-rm-common-deadbeef.pk3");
    fs::write(&blob, b"pk3 bytes").unwrap();
    cache.store_package("zzz-rm-common-deadbeef.pk3", &blob).unwrap();

    let out = temp.path().join("out");
    fs::create_dir_all(&out).unwrap();
    assert!(cache.fetch_package("zzz-rm-common-deadbeef.pk3", &out).unwrap());
    assert_eq!(fs::read(out.join("zzz-rm-common-deadbeef.pk3")).unwrap(), b"pk3 bytes");

    assert!(!cache.fetch_package("zzz-rm-missing.pk3", &out).unwrap());
  }
}
