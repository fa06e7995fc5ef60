//! QC module compilation.
//!
//! A module is a named source tree (`server`, `client`, `menu` under
//! `qcsrc/`) compiled as a unit by the external QuakeC compiler. Its cache
//! key is a layered content hash: the client chains onto the menu hash and
//! the server onto the shared hash, mirroring the source-sharing topology.
//! The module's own contribution follows the declared source list in
//! `progs.src` and every `#include` reachable from it.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::build::{BuildContext, HEADER_NAME};
use crate::error::{Error, Result};
use crate::util;
use crate::util::hash::TreeHasher;

/// Compiler output extensions that get installed and packaged.
pub const INSTALL_EXTENSIONS: &[&str] = &["dat", "lno"];

/// The logical module kinds, in build order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKind {
  Server,
  Client,
  Menu,
}

impl ModuleKind {
  pub const ALL: [ModuleKind; 3] = [ModuleKind::Server, ModuleKind::Client, ModuleKind::Menu];

  pub fn as_str(self) -> &'static str {
    match self {
      ModuleKind::Server => "server",
      ModuleKind::Client => "client",
      ModuleKind::Menu => "menu",
    }
  }
}

impl fmt::Display for ModuleKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Parameters for one compiler invocation.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
  pub qcc_cmd: String,
  pub qcc_flags: Vec<String>,
  /// Basename the compiler writes by convention (e.g. `progs`).
  pub dat_expected_name: String,
  /// Basename the artifact is renamed to (e.g. `rocketminsta_sv`).
  pub dat_final_name: String,
  /// Configuration variable bound to the final artifact in the deploy
  /// config script, if any.
  pub cvar: Option<String>,
}

/// One QC source tree bound to a logical kind.
#[derive(Debug, Clone)]
pub struct QcModule {
  pub kind: ModuleKind,
  pub path: PathBuf,
  /// Whether this module needs the injected build-metadata header.
  pub wants_header: bool,
}

impl QcModule {
  pub fn new(kind: ModuleKind, path: PathBuf) -> Result<Self> {
    let path = util::directory(&path)?;
    Ok(QcModule {
      kind,
      path,
      wants_header: true,
    })
  }

  /// Layered content hash of this module's sources.
  pub fn source_hash(&self, ctx: &BuildContext) -> Result<TreeHasher> {
    let hashes = ctx.source_hashes()?;
    match self.kind {
      // The menu tree is already folded into the shared menu hash.
      ModuleKind::Menu => Ok(hashes.menu.clone()),
      ModuleKind::Client => {
        let mut h = hashes.menu.clone();
        fold_include_graph(&self.path, &mut h)?;
        Ok(h)
      }
      ModuleKind::Server => {
        let mut h = hashes.shared.clone();
        fold_include_graph(&self.path, &mut h)?;
        Ok(h)
      }
    }
  }

  /// Compile this module under `config`, consulting the cache first.
  /// Returns the directory holding the compiled outputs.
  pub async fn build(&self, ctx: &BuildContext, config: &ModuleConfig) -> Result<PathBuf> {
    let build_dir = util::make_directory(ctx.temp_dir().join("qcc").join(&config.dat_final_name))?;
    let hash = self.source_hash(ctx)?.hex_digest();

    let use_cache = ctx.settings().cache_qc;
    if use_cache
      && !ctx.settings().force_rebuild
      && let Some(cache) = ctx.cache()
      && cache.fetch_module(&config.dat_final_name, &hash, &build_dir)?
    {
      return Ok(build_dir);
    }

    ctx.abort().check()?;
    info!(module = %self.kind, target = %config.dat_final_name, "compiling");

    run_compiler(&config.qcc_cmd, &self.path, &config.qcc_flags, &build_dir).await?;
    rename_outputs(&build_dir, &config.dat_expected_name, &config.dat_final_name)?;

    if use_cache && let Some(cache) = ctx.cache() {
      cache.store_module(&config.dat_final_name, &hash, &build_dir)?;
    }

    Ok(build_dir)
  }
}

/// Fold the module's declared sources and their transitive includes into
/// `hasher`. The generated header and log files are excluded; include
/// directives that do not resolve to an existing file are skipped (the
/// compiler surfaces the real error).
fn fold_include_graph(module_dir: &Path, hasher: &mut TreeHasher) -> Result<()> {
  let list_path = module_dir.join("progs.src");
  let list =
    fs::read_to_string(&list_path).map_err(|_| Error::path(&list_path, "missing module source list"))?;

  let entries: Vec<&str> = list
    .lines()
    .map(str::trim)
    .filter(|l| !l.is_empty() && !l.starts_with("//"))
    .collect();

  let mut visited = BTreeSet::new();
  // The first entry names the compiler's output file.
  for source in entries.iter().skip(1) {
    fold_source_file(&module_dir.join(source), module_dir, hasher, &mut visited)?;
  }
  Ok(())
}

fn fold_source_file(
  path: &Path,
  module_dir: &Path,
  hasher: &mut TreeHasher,
  visited: &mut BTreeSet<PathBuf>,
) -> Result<()> {
  let Ok(canon) = path.canonicalize() else {
    return Ok(());
  };
  if !visited.insert(canon.clone()) {
    return Ok(());
  }

  let file_name = canon.file_name().and_then(|n| n.to_str()).unwrap_or_default();
  if file_name == HEADER_NAME || file_name.ends_with(".log") {
    return Ok(());
  }

  let name = match canon.strip_prefix(module_dir) {
    Ok(rel) => util::posix_name(rel),
    Err(_) => file_name.to_string(),
  };

  let bytes = fs::read(&canon)?;
  hasher.update(name.as_bytes());
  hasher.update(&bytes);

  let text = String::from_utf8_lossy(&bytes);
  let parent = canon.parent().unwrap_or(module_dir).to_path_buf();
  for line in text.lines() {
    if let Some(include) = parse_include(line) {
      fold_source_file(&parent.join(include), module_dir, hasher, visited)?;
    }
  }
  Ok(())
}

/// Extract the target of an `#include "file"` directive, if any.
fn parse_include(line: &str) -> Option<&str> {
  let rest = line.trim().strip_prefix("#include")?.trim();
  let rest = rest.strip_prefix('"')?;
  let end = rest.find('"')?;
  Some(&rest[..end])
}

/// Invoke the external compiler with `[cmd, "-src", <sourceDir>] + flags`,
/// streaming merged output line-by-line into the log.
async fn run_compiler(cmd: &str, src: &Path, flags: &[String], cwd: &Path) -> Result<()> {
  debug!(cmd, src = %src.display(), cwd = %cwd.display(), "invoking compiler");

  let mut child = Command::new(cmd)
    .arg("-src")
    .arg(src)
    .args(flags)
    .current_dir(cwd)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .map_err(|e| Error::CompilerSpawn {
      cmd: cmd.to_string(),
      message: e.to_string(),
    })?;

  let stdout = child.stdout.take();
  let stderr = child.stderr.take();
  let out_task = tokio::spawn(log_lines(stdout, cmd.to_string()));
  let err_task = tokio::spawn(log_lines(stderr, cmd.to_string()));

  let status = child.wait().await?;
  let _ = out_task.await;
  let _ = err_task.await;

  if !status.success() {
    return Err(Error::Compiler {
      cmd: cmd.to_string(),
      code: status.code(),
    });
  }
  Ok(())
}

async fn log_lines<R: AsyncRead + Unpin>(reader: Option<R>, cmd: String) {
  let Some(reader) = reader else { return };
  let mut lines = BufReader::new(reader).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    let line = line.trim();
    if !line.is_empty() {
      info!("[{cmd}] {line}");
    }
  }
}

/// Rename compiler outputs whose stem matches the conventional name to the
/// configured final name, preserving extensions.
fn rename_outputs(dir: &Path, expected: &str, final_name: &str) -> Result<()> {
  if expected == final_name {
    return Ok(());
  }

  let entries: Vec<PathBuf> = fs::read_dir(dir)?
    .collect::<std::io::Result<Vec<_>>>()?
    .into_iter()
    .map(|e| e.path())
    .collect();

  for path in entries {
    if path.file_stem().and_then(|s| s.to_str()) != Some(expected) {
      continue;
    }
    let mut new_name = final_name.to_string();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
      new_name.push('.');
      new_name.push_str(ext);
    }
    let dest = dir.join(&new_name);
    if dest.exists() {
      return Err(Error::path(dest, "rename collision for compiler output"));
    }
    fs::rename(&path, &dest)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn parse_include_directives() {
    assert_eq!(parse_include("#include \"util.qh\""), Some("util.qh"));
    assert_eq!(parse_include("  #include \"../common/defs.qh\"  "), Some("../common/defs.qh"));
    assert_eq!(parse_include("#include <sys.qh>"), None);
    assert_eq!(parse_include("float x;"), None);
  }

  #[test]
  fn rename_outputs_preserves_extensions() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("progs.dat"), "d").unwrap();
    fs::write(temp.path().join("progs.lno"), "l").unwrap();
    fs::write(temp.path().join("other.dat"), "o").unwrap();

    rename_outputs(temp.path(), "progs", "rocketminsta_sv").unwrap();

    assert!(temp.path().join("rocketminsta_sv.dat").exists());
    assert!(temp.path().join("rocketminsta_sv.lno").exists());
    assert!(temp.path().join("other.dat").exists());
    assert!(!temp.path().join("progs.dat").exists());
  }

  #[test]
  fn rename_collision_is_an_error() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("progs.dat"), "d").unwrap();
    fs::write(temp.path().join("final.dat"), "existing").unwrap();

    let err = rename_outputs(temp.path(), "progs", "final").unwrap_err();
    assert!(matches!(err, Error::Path { .. }));
  }

  #[test]
  fn include_graph_hash_follows_includes() {
    let temp = tempdir().unwrap();
    let module = temp.path().join("server");
    fs::create_dir_all(&module).unwrap();
    fs::write(module.join("progs.src"), "../progs.dat\nmain.qc\n").unwrap();
    fs::write(module.join("main.qc"), "#include \"util.qh\"\nvoid main() {}\n").unwrap();
    fs::write(module.join("util.qh"), "float util;\n").unwrap();

    let mut h1 = TreeHasher::new();
    fold_include_graph(&module, &mut h1).unwrap();

    // Changing a transitively included file changes the digest.
    fs::write(module.join("util.qh"), "float util2;\n").unwrap();
    let mut h2 = TreeHasher::new();
    fold_include_graph(&module, &mut h2).unwrap();
    assert_ne!(h1.hex_digest(), h2.hex_digest());

    // A file not reachable from progs.src does not contribute.
    fs::write(module.join("unreferenced.qc"), "float nope;\n").unwrap();
    let mut h3 = TreeHasher::new();
    fold_include_graph(&module, &mut h3).unwrap();
    assert_eq!(h2.hex_digest(), h3.hex_digest());
  }

  #[test]
  fn include_cycles_terminate() {
    let temp = tempdir().unwrap();
    let module = temp.path().join("m");
    fs::create_dir_all(&module).unwrap();
    fs::write(module.join("progs.src"), "out.dat\na.qc\n").unwrap();
    fs::write(module.join("a.qc"), "#include \"b.qh\"\n").unwrap();
    fs::write(module.join("b.qh"), "#include \"a.qc\"\n").unwrap();

    let mut h = TreeHasher::new();
    fold_include_graph(&module, &mut h).unwrap();
    assert_eq!(h.hex_digest().len(), 64);
  }
}
