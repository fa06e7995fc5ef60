//! Deterministic recursive content hashing.
//!
//! [`TreeHasher`] is a cloneable SHA-256 accumulator. For a directory it
//! hashes the entry's relative name (with a trailing `/` marker) and recurses
//! into children in sorted order; for a file it hashes the relative name and
//! the byte contents. A name filter can exclude entries (log files, generated
//! headers) so they never perturb cache keys.
//!
//! Cloning a hasher chains digests: fold the common sources into one hasher,
//! clone it, and fold a module's sources on top to get a layered hash that
//! changes when either tree changes.

use std::fs;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::util::posix_name;

/// Predicate over the relative (posix) name of a tree entry. Returning
/// `false` excludes the entry and, for directories, its whole subtree.
pub type NameFilter<'a> = &'a (dyn Fn(&str) -> bool + Sync);

/// A cloneable content-hash accumulator.
#[derive(Clone)]
pub struct TreeHasher {
  inner: Sha256,
}

impl Default for TreeHasher {
  fn default() -> Self {
    Self::new()
  }
}

impl TreeHasher {
  pub fn new() -> Self {
    TreeHasher { inner: Sha256::new() }
  }

  /// Fold raw bytes into the accumulator.
  pub fn update(&mut self, bytes: &[u8]) {
    self.inner.update(bytes);
  }

  /// Fold a file or directory tree into the accumulator. Entry names are
  /// hashed relative to `path` itself.
  pub fn fold_path(&mut self, path: &Path, filter: Option<NameFilter>) -> Result<()> {
    self.fold_path_rooted(path, path, filter)
  }

  /// Like [`fold_path`](Self::fold_path), but entry names are hashed
  /// relative to `root` (which must be an ancestor of `path`). Used when a
  /// tree's own directory name should contribute to the digest.
  pub fn fold_path_rooted(&mut self, path: &Path, root: &Path, filter: Option<NameFilter>) -> Result<()> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut name = if rel.as_os_str().is_empty() {
      ".".to_string()
    } else {
      posix_name(rel)
    };

    let is_dir = path.is_dir();
    if is_dir {
      name.push('/');
    }

    if let Some(filter) = filter
      && !filter(&name)
    {
      return Ok(());
    }

    self.inner.update(name.as_bytes());

    if is_dir {
      let mut entries: Vec<_> = fs::read_dir(path)?.collect::<std::io::Result<Vec<_>>>()?;
      entries.sort_by_key(|e| e.file_name());

      for entry in entries {
        self.fold_path_rooted(&entry.path(), root, filter)?;
      }
    } else {
      self.fold_file_contents(path)?;
    }

    Ok(())
  }

  /// Fold only a file's byte contents (no name) into the accumulator.
  pub fn fold_file_contents(&mut self, path: &Path) -> Result<()> {
    let mut file = fs::File::open(path)?;
    let mut buffer = [0u8; 8192];

    loop {
      let n = file.read(&mut buffer)?;
      if n == 0 {
        break;
      }
      self.inner.update(&buffer[..n]);
    }

    Ok(())
  }

  /// Finalize a snapshot of the accumulator as a lowercase hex digest.
  /// The accumulator itself stays usable for further folding.
  pub fn hex_digest(&self) -> String {
    hex::encode(self.inner.clone().finalize())
  }
}

/// Name filter for QC source trees: log files and the generated build
/// header never contribute to cache keys.
pub fn qc_name_filter(name: &str) -> bool {
  !name.ends_with(".log") && name != crate::build::HEADER_NAME
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[test]
  fn hashing_is_deterministic() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.txt"), "content a").unwrap();
    fs::create_dir(temp.path().join("sub")).unwrap();
    fs::write(temp.path().join("sub/b.txt"), "content b").unwrap();

    let mut h1 = TreeHasher::new();
    h1.fold_path(temp.path(), None).unwrap();
    let mut h2 = TreeHasher::new();
    h2.fold_path(temp.path(), None).unwrap();

    assert_eq!(h1.hex_digest(), h2.hex_digest());
  }

  #[test]
  fn one_byte_change_changes_digest() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("f"), "aaaa").unwrap();
    let mut h1 = TreeHasher::new();
    h1.fold_path(temp.path(), None).unwrap();

    fs::write(temp.path().join("f"), "aaab").unwrap();
    let mut h2 = TreeHasher::new();
    h2.fold_path(temp.path(), None).unwrap();

    assert_ne!(h1.hex_digest(), h2.hex_digest());
  }

  #[test]
  fn filtered_names_do_not_perturb_digest() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("src.qc"), "code").unwrap();
    let mut h1 = TreeHasher::new();
    h1.fold_path(temp.path(), Some(&qc_name_filter)).unwrap();

    fs::write(temp.path().join("compile.log"), "noise").unwrap();
    fs::write(temp.path().join(crate::build::HEADER_NAME), "#define X").unwrap();
    let mut h2 = TreeHasher::new();
    h2.fold_path(temp.path(), Some(&qc_name_filter)).unwrap();

    assert_eq!(h1.hex_digest(), h2.hex_digest());
  }

  #[test]
  fn chained_digest_layers_both_trees() {
    let temp = tempdir().unwrap();
    let base = temp.path().join("base");
    let leaf = temp.path().join("leaf");
    fs::create_dir(&base).unwrap();
    fs::create_dir(&leaf).unwrap();
    fs::write(base.join("shared.qc"), "shared").unwrap();
    fs::write(leaf.join("own.qc"), "own").unwrap();

    let mut common = TreeHasher::new();
    common.fold_path(&base, None).unwrap();

    let mut layered = common.clone();
    layered.fold_path(&leaf, None).unwrap();
    let before = layered.hex_digest();

    // Changing the leaf changes the layered digest.
    fs::write(leaf.join("own.qc"), "changed").unwrap();
    let mut layered = common.clone();
    layered.fold_path(&leaf, None).unwrap();
    assert_ne!(before, layered.hex_digest());

    // Changing the base changes it too.
    fs::write(base.join("shared.qc"), "changed").unwrap();
    let mut common = TreeHasher::new();
    common.fold_path(&base, None).unwrap();
    let mut layered = common.clone();
    layered.fold_path(&leaf, None).unwrap();
    assert_ne!(before, layered.hex_digest());
  }

  #[test]
  fn rooted_fold_includes_tree_name() {
    let temp = tempdir().unwrap();
    let a = temp.path().join("a");
    let b = temp.path().join("b");
    fs::create_dir(&a).unwrap();
    fs::create_dir(&b).unwrap();
    fs::write(a.join("f"), "same").unwrap();
    fs::write(b.join("f"), "same").unwrap();

    let mut ha = TreeHasher::new();
    ha.fold_path_rooted(&a, temp.path(), None).unwrap();
    let mut hb = TreeHasher::new();
    hb.fold_path_rooted(&b, temp.path(), None).unwrap();

    // Identical contents under different directory names hash differently.
    assert_ne!(ha.hex_digest(), hb.hex_digest());
  }
}
