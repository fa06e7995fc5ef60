//! Filesystem helpers shared across the pipeline.

pub mod hash;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Validate that `path` is an existing directory.
pub fn directory(path: impl AsRef<Path>) -> Result<PathBuf> {
  let path = path.as_ref();
  if !path.is_dir() {
    return Err(Error::path(path, "not a directory"));
  }
  Ok(path.to_path_buf())
}

/// Validate that `path` is an existing regular file.
pub fn file(path: impl AsRef<Path>) -> Result<PathBuf> {
  let path = path.as_ref();
  if !path.is_file() {
    return Err(Error::path(path, "not a file"));
  }
  Ok(path.to_path_buf())
}

/// Create `path` (and parents) if missing and return it.
pub fn make_directory(path: impl AsRef<Path>) -> Result<PathBuf> {
  let path = path.as_ref();
  fs::create_dir_all(path)?;
  directory(path)
}

/// Remove every entry inside `path`, leaving the directory itself in place.
pub fn clear_directory(path: &Path) -> Result<()> {
  let path = directory(path)?;
  debug!(path = %path.display(), "clearing directory");

  for entry in fs::read_dir(&path)? {
    let entry = entry?;
    let epath = entry.path();
    if entry.file_type()?.is_dir() {
      fs::remove_dir_all(&epath)?;
    } else {
      fs::remove_file(&epath)?;
    }
  }
  Ok(())
}

/// Copy a single file, creating the destination's parent directories.
pub fn copy_file(src: &Path, dst: &Path) -> Result<()> {
  debug!(src = %src.display(), dst = %dst.display(), "copying file");
  if let Some(parent) = dst.parent() {
    fs::create_dir_all(parent)?;
  }
  fs::copy(src, dst)?;
  Ok(())
}

/// Recursively copy a directory tree, preserving symlinks as symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
  let src = directory(src)?;
  debug!(src = %src.display(), dst = %dst.display(), "copying tree");
  fs::create_dir_all(dst)?;

  for entry in fs::read_dir(&src)? {
    let entry = entry?;
    let from = entry.path();
    let to = dst.join(entry.file_name());
    let ftype = entry.file_type()?;

    if ftype.is_symlink() {
      let target = fs::read_link(&from)?;
      if to.symlink_metadata().is_ok() {
        fs::remove_file(&to)?;
      }
      make_symlink(&target, &to)?;
    } else if ftype.is_dir() {
      copy_tree(&from, &to)?;
    } else {
      fs::copy(&from, &to)?;
    }
  }
  Ok(())
}

/// Create a symlink at `link` pointing to `target`.
#[cfg(unix)]
pub fn make_symlink(target: &Path, link: &Path) -> Result<()> {
  std::os::unix::fs::symlink(target, link)?;
  Ok(())
}

#[cfg(not(unix))]
pub fn make_symlink(target: &Path, link: &Path) -> Result<()> {
  let _ = (target, link);
  Err(Error::Config("symlinks are only supported on unix targets".into()))
}

/// Render a relative path with forward slashes, as stored in archives and
/// deployment indexes.
pub fn posix_name(path: &Path) -> String {
  let parts: Vec<String> = path
    .components()
    .map(|c| c.as_os_str().to_string_lossy().into_owned())
    .collect();
  parts.join("/")
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn directory_rejects_files() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("f");
    fs::write(&file_path, "x").unwrap();

    assert!(matches!(directory(&file_path), Err(Error::Path { .. })));
    assert!(directory(temp.path()).is_ok());
  }

  #[test]
  fn clear_directory_removes_everything() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a"), "x").unwrap();
    fs::create_dir(temp.path().join("d")).unwrap();
    fs::write(temp.path().join("d/b"), "y").unwrap();

    clear_directory(temp.path()).unwrap();
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
  }

  #[test]
  fn copy_tree_preserves_structure() {
    let temp = tempdir().unwrap();
    let src = temp.path().join("src");
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("a.txt"), "a").unwrap();
    fs::write(src.join("sub/b.txt"), "b").unwrap();

    let dst = temp.path().join("dst");
    copy_tree(&src, &dst).unwrap();

    assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
    assert_eq!(fs::read_to_string(dst.join("sub/b.txt")).unwrap(), "b");
  }

  #[test]
  #[cfg(unix)]
  fn copy_tree_preserves_symlinks() {
    let temp = tempdir().unwrap();
    let src = temp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("target.txt"), "t").unwrap();
    make_symlink(Path::new("target.txt"), &src.join("link.txt")).unwrap();

    let dst = temp.path().join("dst");
    copy_tree(&src, &dst).unwrap();

    let link = dst.join("link.txt");
    assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
    assert_eq!(fs::read_link(&link).unwrap(), Path::new("target.txt"));
  }

  #[test]
  fn posix_name_uses_forward_slashes() {
    let p = Path::new("a").join("b").join("c.txt");
    assert_eq!(posix_name(&p), "a/b/c.txt");
  }
}
