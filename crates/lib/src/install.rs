//! Index-based deployment into target directories.
//!
//! Each target directory carries a persisted index (gzip-compressed,
//! newline-separated relative paths) of everything a previous deployment
//! wrote there. Deploying computes the minimal diff against the new
//! selection: stale indexed paths are removed (and their now-empty parent
//! directories pruned, deepest first), the index is rewritten *before*
//! copying so a crash mid-deploy leaves it consistent with the cleanup
//! already performed, and only files not already correct are written.
//! Unrelated files in the target are never touched.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::util;
use crate::util::hash::TreeHasher;

/// Reserved index filename inside each deployment target directory.
pub const INDEX_FILENAME: &str = ".rmbuild_index";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
  Copy,
  Link,
}

/// What one deployment actually did; `copied == 0` means the target was
/// already up to date.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub removed: usize,
  pub copied: usize,
  pub kept: usize,
}

/// Walk `root` and collect the sorted relative paths of all files and
/// symlinks.
pub fn build_index(root: &Path) -> Result<Vec<PathBuf>> {
  let root = util::directory(root)?;
  let mut index = Vec::new();

  for entry in WalkDir::new(&root) {
    let entry = entry.map_err(std::io::Error::from)?;
    let ftype = entry.file_type();
    if ftype.is_file() || ftype.is_symlink() {
      let path = entry.path();
      index.push(path.strip_prefix(&root).unwrap_or(path).to_path_buf());
    }
  }

  index.sort();
  Ok(index)
}

/// Read a target's persisted index; absent means empty.
pub fn read_index(target: &Path) -> Result<Vec<PathBuf>> {
  let path = target.join(INDEX_FILENAME);
  let file = match File::open(&path) {
    Ok(f) => f,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(e.into()),
  };

  let mut text = String::new();
  GzDecoder::new(file).read_to_string(&mut text)?;

  let mut index: Vec<PathBuf> = text
    .lines()
    .filter(|l| !l.is_empty())
    .map(PathBuf::from)
    .collect();
  index.sort();
  Ok(index)
}

/// Persist `index` as the target's deployment index.
pub fn write_index(index: &[PathBuf], target: &Path) -> Result<()> {
  let path = target.join(INDEX_FILENAME);
  let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
  for p in index {
    encoder.write_all(util::posix_name(p).as_bytes())?;
    encoder.write_all(b"\n")?;
  }
  encoder.finish()?;
  Ok(())
}

/// All ancestor directories of the indexed paths, deepest first.
fn index_directories(index: &[PathBuf]) -> Vec<PathBuf> {
  let mut dirs = BTreeSet::new();
  for p in index {
    let mut parent = p.parent();
    while let Some(d) = parent {
      if d.as_os_str().is_empty() {
        break;
      }
      dirs.insert(d.to_path_buf());
      parent = d.parent();
    }
  }
  let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
  dirs.sort_by(|a, b| b.cmp(a));
  dirs
}

/// Deploy the output tree into `target`.
///
/// `path_filter` restricts the new selection (default: all files). Files
/// already correctly present are left untouched, so re-running with an
/// identical selection performs no writes.
pub fn deploy(
  output: &Path,
  target: &Path,
  mode: InstallMode,
  path_filter: Option<&dyn Fn(&Path) -> bool>,
) -> Result<InstallReport> {
  // Resolve both roots so Link mode records absolute symlink targets;
  // a relative output root would dangle once interpreted from inside the
  // target directory.
  let output = util::directory(output)?.canonicalize()?;
  let target = util::directory(target)?.canonicalize()?;
  info!(
    target = %target.display(),
    mode = ?mode,
    "installing"
  );

  let mut selection = build_index(&output)?;
  if let Some(filter) = path_filter {
    selection.retain(|p| filter(p));
  }
  let selected: HashSet<&PathBuf> = selection.iter().collect();

  let previous = read_index(&target)?;
  let mut report = InstallReport::default();

  // Remove stale paths from the previous deployment.
  let mut removed = Vec::new();
  for p in &previous {
    if selected.contains(p) {
      continue;
    }
    let victim = target.join(p);
    debug!(path = %victim.display(), "removing stale file");
    match fs::remove_file(&victim) {
      Ok(()) => {
        report.removed += 1;
        removed.push(p.clone());
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed.push(p.clone()),
      Err(e) => warn!(path = %victim.display(), error = %e, "could not remove stale file"),
    }
  }

  // Prune directories that only housed removed paths; rmdir fails harmlessly
  // on non-empty ones.
  for d in index_directories(&removed) {
    if fs::remove_dir(target.join(&d)).is_ok() {
      debug!(dir = %d.display(), "removed empty directory");
    }
  }

  // Persist the new index before copying.
  write_index(&selection, &target)?;

  for p in &selection {
    let src = output.join(p);
    let dst = target.join(p);

    if already_correct(&src, &dst, mode)? {
      report.kept += 1;
      continue;
    }

    if dst.symlink_metadata().is_ok() {
      fs::remove_file(&dst)?;
    }
    if let Some(parent) = dst.parent() {
      fs::create_dir_all(parent)?;
    }

    match mode {
      InstallMode::Copy => util::copy_file(&src, &dst)?,
      InstallMode::Link => util::make_symlink(&src, &dst)?,
    }
    report.copied += 1;
  }

  info!(
    removed = report.removed,
    copied = report.copied,
    kept = report.kept,
    "install finished"
  );
  Ok(report)
}

fn already_correct(src: &Path, dst: &Path, mode: InstallMode) -> Result<bool> {
  let Ok(meta) = dst.symlink_metadata() else {
    return Ok(false);
  };

  match mode {
    InstallMode::Link => Ok(meta.file_type().is_symlink() && fs::read_link(dst)? == *src),
    InstallMode::Copy => {
      if meta.file_type().is_symlink() || !meta.file_type().is_file() {
        return Ok(false);
      }
      let src_meta = fs::metadata(src)?;
      if src_meta.len() != meta.len() {
        return Ok(false);
      }
      let mut a = TreeHasher::new();
      a.fold_file_contents(src)?;
      let mut b = TreeHasher::new();
      b.fold_file_contents(dst)?;
      Ok(a.hex_digest() == b.hex_digest())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
  }

  #[test]
  fn index_roundtrip_through_gzip() {
    let temp = tempdir().unwrap();
    let index = vec![PathBuf::from("a.txt"), PathBuf::from("b/c.txt")];
    write_index(&index, temp.path()).unwrap();

    assert!(temp.path().join(INDEX_FILENAME).is_file());
    assert_eq!(read_index(temp.path()).unwrap(), index);
  }

  #[test]
  fn missing_index_reads_empty() {
    let temp = tempdir().unwrap();
    assert!(read_index(temp.path()).unwrap().is_empty());
  }

  #[test]
  fn deploy_diff_removes_stale_and_adds_new() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("output");
    let target = temp.path().join("target");
    fs::create_dir_all(&output).unwrap();
    fs::create_dir_all(&target).unwrap();

    // Previous deployment: {a.txt, b/c.txt}
    write(&target, "a.txt", "old a");
    write(&target, "b/c.txt", "same c");
    write_index(&[PathBuf::from("a.txt"), PathBuf::from("b/c.txt")], &target).unwrap();

    // New selection: {b/c.txt, d.txt}
    write(&output, "b/c.txt", "same c");
    write(&output, "d.txt", "new d");

    let report = deploy(&output, &target, InstallMode::Copy, None).unwrap();

    assert!(!target.join("a.txt").exists());
    assert!(target.join("b").is_dir(), "b still houses c.txt");
    assert_eq!(fs::read_to_string(target.join("b/c.txt")).unwrap(), "same c");
    assert_eq!(fs::read_to_string(target.join("d.txt")).unwrap(), "new d");
    assert_eq!(report.removed, 1);
    assert_eq!(report.copied, 1);
    assert_eq!(report.kept, 1);

    let index = read_index(&target).unwrap();
    assert_eq!(index, vec![PathBuf::from("b/c.txt"), PathBuf::from("d.txt")]);
  }

  #[test]
  fn deploy_prunes_emptied_directories() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("output");
    let target = temp.path().join("target");
    fs::create_dir_all(&output).unwrap();
    fs::create_dir_all(&target).unwrap();

    write(&target, "sub/deep/gone.txt", "x");
    write_index(&[PathBuf::from("sub/deep/gone.txt")], &target).unwrap();

    write(&output, "kept.txt", "y");
    deploy(&output, &target, InstallMode::Copy, None).unwrap();

    assert!(!target.join("sub").exists(), "emptied directory chain pruned");
    assert!(target.join("kept.txt").is_file());
  }

  #[test]
  fn deploy_is_idempotent() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("output");
    let target = temp.path().join("target");
    fs::create_dir_all(&output).unwrap();
    fs::create_dir_all(&target).unwrap();

    write(&output, "one.txt", "1");
    write(&output, "sub/two.txt", "2");

    let first = deploy(&output, &target, InstallMode::Copy, None).unwrap();
    assert_eq!(first.copied, 2);

    let second = deploy(&output, &target, InstallMode::Copy, None).unwrap();
    assert_eq!(second.copied, 0, "no writes on identical re-deploy");
    assert_eq!(second.removed, 0);
    assert_eq!(second.kept, 2);
  }

  #[test]
  fn deploy_leaves_unrelated_files_alone() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("output");
    let target = temp.path().join("target");
    fs::create_dir_all(&output).unwrap();
    fs::create_dir_all(&target).unwrap();

    write(&target, "user_config.cfg", "mine");
    write(&output, "mod.txt", "theirs");

    deploy(&output, &target, InstallMode::Copy, None).unwrap();
    deploy(&output, &target, InstallMode::Copy, None).unwrap();

    assert_eq!(fs::read_to_string(target.join("user_config.cfg")).unwrap(), "mine");
  }

  #[test]
  fn path_filter_restricts_selection() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("output");
    let target = temp.path().join("target");
    fs::create_dir_all(&output).unwrap();
    fs::create_dir_all(&target).unwrap();

    write(&output, "keep.pk3", "k");
    write(&output, "skip.dat", "s");

    let filter = |p: &Path| p.extension().is_some_and(|e| e == "pk3");
    deploy(&output, &target, InstallMode::Copy, Some(&filter)).unwrap();

    assert!(target.join("keep.pk3").is_file());
    assert!(!target.join("skip.dat").exists());
  }

  #[test]
  #[cfg(unix)]
  fn link_mode_symlinks_into_target() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("output");
    let target = temp.path().join("target");
    fs::create_dir_all(&output).unwrap();
    fs::create_dir_all(&target).unwrap();

    write(&output, "linked.txt", "z");

    let first = deploy(&output, &target, InstallMode::Link, None).unwrap();
    assert_eq!(first.copied, 1);

    let dst = target.join("linked.txt");
    assert!(dst.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(fs::read_to_string(&dst).unwrap(), "z");

    let second = deploy(&output, &target, InstallMode::Link, None).unwrap();
    assert_eq!(second.copied, 0);
  }

  #[test]
  #[cfg(unix)]
  fn link_targets_resolve_from_a_non_canonical_output() {
    let temp = tempdir().unwrap();
    let output = temp.path().join("sub").join("output");
    let target = temp.path().join("target");
    fs::create_dir_all(&output).unwrap();
    fs::create_dir_all(&target).unwrap();

    write(&output, "one.txt", "1");

    // Deploy through a path with a `..` component; the recorded link
    // target must be the resolved absolute path, not the spelling we
    // were given.
    let crooked = temp.path().join("sub").join("..").join("sub").join("output");
    let first = deploy(&crooked, &target, InstallMode::Link, None).unwrap();
    assert_eq!(first.copied, 1);

    let dst = target.join("one.txt");
    let link = fs::read_link(&dst).unwrap();
    assert_eq!(link, output.canonicalize().unwrap().join("one.txt"));
    assert_eq!(fs::read_to_string(&dst).unwrap(), "1");

    let second = deploy(&crooked, &target, InstallMode::Link, None).unwrap();
    assert_eq!(second.copied, 0, "resolved paths keep re-deploys idempotent");
  }
}
