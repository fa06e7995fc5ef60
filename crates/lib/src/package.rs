//! Package assembly.
//!
//! A package is a named unit assembled into one `.pk3` archive whose
//! filename embeds its content hash (`zzz-rm-<name>-<hash>.pk3`), so the
//! filename itself is the cache key. Identity comes in two flavors:
//!
//! - *Self-hashed*: the recursive content hash of the package's own source
//!   directory, with control files excluded and a fixed marker folded in so
//!   the digest cannot collide with other hash consumers.
//! - *Derived* (`csqc`, `menu`): the hash only exists after the upstream
//!   module group has finished building; reading it earlier is an error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::{debug, info};

use crate::build::BuildContext;
use crate::error::{Error, Result};
use crate::gfx;
use crate::install;
use crate::pk3::Pk3Writer;
use crate::qcmod::{self, ModuleKind};
use crate::util;
use crate::util::hash::TreeHasher;

/// Folded into every self-hashed package digest so it cannot collide with
/// module hashes computed over the same bytes.
const PKG_HASH_MARKER: &[u8] = b"rmbuild-pkg";

/// Control files that drive the build but never ship or contribute to the
/// package hash.
const CONTROL_FILES: &[&str] = &["compressdirs", "_md5sums"];

/// Where a package's identity and file list come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
  /// Hash and files from the package's own source directory.
  SelfHashed,
  /// Hash and files from the compiled client module outputs.
  Csqc,
  /// Files from the compiled menu module outputs; hash is the menu source
  /// hash.
  Menu,
}

/// A record of one finished package, kept in the build registry for the
/// deploy config script.
#[derive(Debug, Clone)]
pub struct BuiltPackage {
  pub name: String,
  pub output_file_name: String,
  pub metafile_name: String,
}

#[derive(Debug)]
pub struct Package {
  name: String,
  path: PathBuf,
  kind: PackageKind,
  identity: OnceLock<String>,
  dat_dirs: OnceLock<Vec<PathBuf>>,
}

/// Construct a package for one `<name>.pk3dir` source directory. The
/// reserved names `csqc` and `menu` select the derived variants.
pub fn construct(name: &str, path: PathBuf) -> Package {
  let kind = match name {
    "csqc" => PackageKind::Csqc,
    "menu" => PackageKind::Menu,
    _ => PackageKind::SelfHashed,
  };
  Package {
    name: name.to_string(),
    path,
    kind,
    identity: OnceLock::new(),
    dat_dirs: OnceLock::new(),
  }
}

/// A self-hashed package over an arbitrary directory (used for the server
/// bundle).
pub fn self_hashed(name: &str, path: PathBuf) -> Package {
  Package {
    name: name.to_string(),
    path,
    kind: PackageKind::SelfHashed,
    identity: OnceLock::new(),
    dat_dirs: OnceLock::new(),
  }
}

fn control_filter(name: &str) -> bool {
  !CONTROL_FILES.contains(&name)
}

impl Package {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> PackageKind {
    self.kind
  }

  /// The package's content hash. For derived packages this fails with
  /// [`Error::IdentityNotReady`] until [`resolve_identity`](Self::resolve_identity)
  /// has run; afterward it is stable across reads.
  pub fn hash_hex(&self) -> Result<String> {
    if let Some(hash) = self.identity.get() {
      return Ok(hash.clone());
    }
    match self.kind {
      PackageKind::SelfHashed => {
        let mut hasher = TreeHasher::new();
        hasher.fold_path(&self.path, Some(&control_filter))?;
        hasher.update(PKG_HASH_MARKER);
        let hash = hasher.hex_digest();
        let _ = self.identity.set(hash.clone());
        Ok(hash)
      }
      PackageKind::Csqc | PackageKind::Menu => Err(Error::IdentityNotReady {
        package: self.name.clone(),
      }),
    }
  }

  pub fn output_file_name(&self) -> Result<String> {
    Ok(format!("zzz-rm-{}-{}.pk3", self.name, self.hash_hex()?))
  }

  pub fn metafile_name(&self) -> Result<String> {
    Ok(format!("_rmbuild_metafile_{}_{}.txt", self.name, self.hash_hex()?))
  }

  fn built_record(&self) -> Result<BuiltPackage> {
    Ok(BuiltPackage {
      name: self.name.clone(),
      output_file_name: self.output_file_name()?,
      metafile_name: self.metafile_name()?,
    })
  }

  /// Resolve a derived package's identity from the finished upstream module
  /// outputs. Must only be called after the module group has completed.
  pub fn resolve_identity(&self, ctx: &BuildContext) -> Result<()> {
    match self.kind {
      PackageKind::SelfHashed => {
        self.hash_hex()?;
      }
      PackageKind::Csqc => {
        let dirs = ctx.built_modules(ModuleKind::Client);
        let mut hasher = TreeHasher::new();
        for dir in &dirs {
          let root = dir.parent().unwrap_or(dir);
          hasher.fold_path_rooted(dir, root, None)?;
        }
        let _ = self.identity.set(hasher.hex_digest());
        let _ = self.dat_dirs.set(dirs);
      }
      PackageKind::Menu => {
        let dirs = ctx.built_modules(ModuleKind::Menu);
        let _ = self.identity.set(ctx.source_hashes()?.menu.hex_digest());
        let _ = self.dat_dirs.set(dirs);
      }
    }
    Ok(())
  }

  /// The (absolute path, archive name) pairs this package ships.
  fn files(&self) -> Result<Vec<(PathBuf, String)>> {
    match self.kind {
      PackageKind::SelfHashed => {
        let mut out = Vec::new();
        for rel in install::build_index(&self.path)? {
          let name = util::posix_name(&rel);
          if !control_filter(&name) {
            continue;
          }
          out.push((self.path.join(&rel), name));
        }
        Ok(out)
      }
      PackageKind::Csqc | PackageKind::Menu => {
        let dirs = self.dat_dirs.get().ok_or_else(|| Error::IdentityNotReady {
          package: self.name.clone(),
        })?;
        let mut out = Vec::new();
        for dir in dirs {
          let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
          entries.sort();
          for path in entries {
            let installable = path
              .extension()
              .and_then(|e| e.to_str())
              .is_some_and(|e| qcmod::INSTALL_EXTENSIONS.contains(&e));
            if !installable {
              continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
            out.push((path, name));
          }
        }
        Ok(out)
      }
    }
  }

  /// Build this package. Derived variants first wait for their upstream
  /// module group and resolve their identity from its outputs.
  pub async fn build(&self, ctx: &BuildContext) -> Result<()> {
    match self.kind {
      PackageKind::SelfHashed => {}
      PackageKind::Csqc => {
        ctx.graph().await_group("qc.client").await?;
        self.resolve_identity(ctx)?;
      }
      PackageKind::Menu => {
        ctx.graph().await_group("qc.menu").await?;
        self.resolve_identity(ctx)?;
      }
    }

    if ctx.settings().link_pk3dirs && self.kind == PackageKind::SelfHashed {
      let link = ctx
        .output_dir()
        .join(format!("zzz-rm-{}-{}.pk3dir", self.name, self.hash_hex()?));
      info!(package = %self.name, link = %link.display(), "linking pk3dir");
      util::make_symlink(&self.path.canonicalize()?, &link)?;
      ctx.record_package(self.built_record()?);
      return Ok(());
    }

    self.assemble(ctx).await
  }

  pub(crate) async fn assemble(&self, ctx: &BuildContext) -> Result<()> {
    let out_name = self.output_file_name()?;
    let out_path = ctx.output_dir().join(&out_name);

    let use_cache = ctx.settings().cache_pkg && ctx.cache().is_some();
    if use_cache
      && !ctx.settings().force_rebuild
      && let Some(cache) = ctx.cache()
      && cache.fetch_package(&out_name, ctx.output_dir())?
    {
      ctx.record_package(self.built_record()?);
      return Ok(());
    }

    info!(package = %self.name, output = %out_name, "assembling package");
    let replacements = self.plan_recompression(ctx)?;

    let mut pk3 = Pk3Writer::create(&out_path)?;
    for (fpath, rpath) in self.files()? {
      ctx.abort().check()?;

      if let Some(replacement) = replacements.get(&fpath) {
        match replacement {
          Replacement::File { path, rel, alpha } => {
            pk3.add_file(rel, path)?;
            if let Some((alpha_path, alpha_rel)) = alpha {
              pk3.add_file(alpha_rel, alpha_path)?;
            }
          }
          Replacement::Symlink { rel, target } => {
            pk3.add_symlink(rel, target)?;
          }
        }
        // Existing references to the original name still resolve.
        pk3.add_placeholder(&rpath)?;
        continue;
      }

      if fpath.is_symlink() {
        pk3.add_symlink(&rpath, &symlink_target(&fpath)?)?;
      } else {
        pk3.add_file(&rpath, &fpath)?;
      }
    }

    pk3.add_text(&self.metafile_name()?, &self.metafile_contents(ctx))?;
    pk3.finish()?;
    info!(package = %self.name, "package finished");

    ctx.run_package_hook(&out_path)?;

    if use_cache && let Some(cache) = ctx.cache() {
      cache.store_package(&out_name, &out_path)?;
    }

    ctx.record_package(self.built_record()?);
    Ok(())
  }

  fn metafile_contents(&self, ctx: &BuildContext) -> String {
    format!(
      "{} {} client-side package {} ({})\nBuilt at {}\n",
      ctx.display_name(),
      ctx.version(),
      self.name,
      ctx.comment(),
      ctx.date_string(),
    )
  }

  /// Plan which images get recompressed, producing the replacement files in
  /// the build temp directory.
  fn plan_recompression(&self, ctx: &BuildContext) -> Result<HashMap<PathBuf, Replacement>> {
    let settings = ctx.settings();
    let mut plan = HashMap::new();

    if !settings.compress_gfx || self.kind != PackageKind::SelfHashed {
      return Ok(plan);
    }
    let candidates = self.gfx_candidates(ctx)?;
    if candidates.is_empty() {
      return Ok(plan);
    }

    let tdir = util::make_directory(ctx.temp_dir().join(format!("pkg_gfx_{}", self.name)))?;

    for src in candidates {
      ctx.abort().check()?;

      let rel = src.strip_prefix(&self.path).unwrap_or(&src).to_path_buf();
      let new_rel = rel.with_extension("jpg");
      let rel_name = util::posix_name(&new_rel);

      if src.is_symlink() {
        let target = PathBuf::from(symlink_target(&src)?).with_extension("jpg");
        debug!(src = %src.display(), "re-pointing image symlink");
        plan.insert(
          src.clone(),
          Replacement::Symlink {
            rel: rel_name,
            target: util::posix_name(&target),
          },
        );
      } else {
        let dest = tdir.join(&new_rel);
        let done = gfx::recompress(&src, &dest, settings.compress_gfx_quality)?;
        let alpha = done
          .alpha
          .map(|path| (path, util::posix_name(&gfx::alpha_sidecar(&new_rel))));
        plan.insert(
          src.clone(),
          Replacement::File {
            path: done.path,
            rel: rel_name,
            alpha,
          },
        );
      }
    }

    Ok(plan)
  }

  /// Images eligible for recompression: allowlisted extension, not on the
  /// per-path denylist, and (unless recompress-everything is set) living
  /// directly under a directory named in the package's `compressdirs` file.
  fn gfx_candidates(&self, ctx: &BuildContext) -> Result<Vec<PathBuf>> {
    let settings = ctx.settings();
    let eligible = |path: &Path| -> bool {
      let rel = path.strip_prefix(&self.path).unwrap_or(path);
      path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| settings.gfx_format_eligible(e))
        && !settings.gfx_path_excluded(rel)
    };

    let mut candidates = Vec::new();

    if settings.compress_gfx_all {
      for rel in install::build_index(&self.path)? {
        let abs = self.path.join(&rel);
        if eligible(&abs) {
          candidates.push(abs);
        }
      }
      return Ok(candidates);
    }

    let list_path = self.path.join("compressdirs");
    let list = match fs::read_to_string(&list_path) {
      Ok(text) => text,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(candidates),
      Err(e) => return Err(e.into()),
    };

    for line in list.lines().map(str::trim).filter(|l| !l.is_empty()) {
      let dir = util::directory(self.path.join(line))?;
      let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
      entries.sort();
      for path in entries {
        if path.is_file() && eligible(&path) {
          candidates.push(path);
        }
      }
    }

    Ok(candidates)
  }
}

enum Replacement {
  File {
    path: PathBuf,
    rel: String,
    alpha: Option<(PathBuf, String)>,
  },
  Symlink {
    rel: String,
    target: String,
  },
}

/// Render a symlink's target relative to its containing directory, the way
/// it is stored in the archive.
fn symlink_target(path: &Path) -> Result<String> {
  let resolved = path.canonicalize()?;
  let parent = match path.parent() {
    Some(p) => p.canonicalize()?,
    None => PathBuf::new(),
  };
  let rel = resolved
    .strip_prefix(&parent)
    .map(Path::to_path_buf)
    .unwrap_or(resolved);
  Ok(util::posix_name(&rel))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn derived_identity_is_not_ready_before_resolution() {
    let temp = tempdir().unwrap();
    let pkg = construct("csqc", temp.path().to_path_buf());

    assert!(matches!(pkg.hash_hex(), Err(Error::IdentityNotReady { .. })));
    assert!(matches!(pkg.output_file_name(), Err(Error::IdentityNotReady { .. })));
  }

  #[test]
  fn self_hashed_filename_is_a_pure_function_of_content() {
    let temp = tempdir().unwrap();
    for name in ["one", "two"] {
      let dir = temp.path().join(name);
      fs::create_dir_all(dir.join("gfx")).unwrap();
      fs::write(dir.join("gfx/skin.tga"), b"pixels").unwrap();
      fs::write(dir.join("readme.txt"), b"docs").unwrap();
    }

    let a = construct("common", temp.path().join("one"));
    let b = construct("common", temp.path().join("two"));
    assert_eq!(a.output_file_name().unwrap(), b.output_file_name().unwrap());

    let renamed = construct("other", temp.path().join("one"));
    assert_ne!(a.output_file_name().unwrap(), renamed.output_file_name().unwrap());
  }

  #[test]
  fn control_files_do_not_perturb_identity() {
    let temp = tempdir().unwrap();
    let dir = temp.path().join("pkg");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("data.txt"), b"x").unwrap();

    let before = construct("p", dir.clone()).hash_hex().unwrap();

    fs::write(dir.join("compressdirs"), b"gfx\n").unwrap();
    fs::write(dir.join("_md5sums"), b"sums").unwrap();
    let after = construct("p", dir).hash_hex().unwrap();

    assert_eq!(before, after);
  }

  #[test]
  fn identity_is_stable_across_reads() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("f"), b"x").unwrap();
    let pkg = construct("p", temp.path().to_path_buf());

    let first = pkg.hash_hex().unwrap();
    fs::write(temp.path().join("f"), b"changed").unwrap();
    assert_eq!(pkg.hash_hex().unwrap(), first, "identity computed once");
  }

  #[test]
  fn files_excludes_control_files() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("keep.txt"), b"k").unwrap();
    fs::write(temp.path().join("compressdirs"), b"gfx\n").unwrap();

    let pkg = construct("p", temp.path().to_path_buf());
    let names: Vec<String> = pkg.files().unwrap().into_iter().map(|(_, n)| n).collect();
    assert_eq!(names, vec!["keep.txt"]);
  }

  #[test]
  #[cfg(unix)]
  fn symlink_target_is_relative_to_parent() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("real.md3"), b"model").unwrap();
    let link = temp.path().join("alias.md3");
    util::make_symlink(Path::new("real.md3"), &link).unwrap();

    assert_eq!(symlink_target(&link).unwrap(), "real.md3");
  }
}
