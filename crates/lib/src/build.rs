//! Build orchestration.
//!
//! One build is a single forward pass: hash the shared source trees,
//! generate the build-metadata header, synchronously register every task
//! with the graph (modules, packages, installation, static assets, config
//! script, optional server bundle), drain the graph, then run the post-build
//! hook. Ordering between concurrent stages is expressed through the graph's
//! named wait groups; every producer is registered before the pool drains,
//! which is what makes those waits sound.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::Local;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::cache::BuildCache;
use crate::config::{Autocvars, Hooks, Settings};
use crate::error::{Error, Result};
use crate::install::{self, InstallMode};
use crate::package::{self, BuiltPackage};
use crate::qcmod::{self, ModuleConfig, ModuleKind, QcModule};
use crate::repo::Repo;
use crate::task::{AbortFlag, TaskGraph};
use crate::util;
use crate::util::hash::{TreeHasher, qc_name_filter};

/// Generated build-metadata header, written into the common source tree.
pub const HEADER_NAME: &str = "rm_auto.qh";

/// Deploy config script at the output root; the build appends to the static
/// copy shipped in `modfiles/`.
pub const CONFIG_SCRIPT: &str = "rocketminsta.cfg";

const BASE_NAME: &str = "RocketMinsta";
const SERVER_BUNDLE_NAME: &str = "server";

/// Layered base hashes over the shared source trees. `shared` covers
/// `common` + `warpzonelib`; `menu` covers `common` + `menu`. Modules chain
/// their own include graph onto one of these.
pub struct SourceHashes {
  pub shared: TreeHasher,
  pub menu: TreeHasher,
}

/// Build-wide configuration plus mutable run state. Exactly one per build;
/// owns the task graph, temp directory and cache handle.
pub struct BuildContext {
  repo: Arc<Repo>,
  settings: Settings,
  hooks: Hooks,
  display_name: String,
  suffix: String,
  version: String,
  date_string: String,
  output_dir: PathBuf,
  // Holds the temp tree alive for the whole build.
  temp: TempDir,
  cache: Option<BuildCache>,
  graph: TaskGraph,
  abort: AbortFlag,
  module_configs: BTreeMap<ModuleKind, Vec<ModuleConfig>>,
  source_hashes: OnceLock<SourceHashes>,
  built_modules: Mutex<HashMap<ModuleKind, Vec<PathBuf>>>,
  built_packages: Mutex<Vec<BuiltPackage>>,
}

impl BuildContext {
  fn new(repo: Arc<Repo>, settings: Settings, hooks: Hooks) -> Result<BuildContext> {
    let date_string = Local::now().format("%F %T %Z").to_string().trim().to_string();

    let suffix = match &settings.suffix {
      Some(s) => s.clone(),
      None => {
        let branch = repo.vcs().branch.clone().unwrap_or_default();
        if branch == "master" { String::new() } else { branch }
      }
    };
    let display_name = if suffix.is_empty() {
      BASE_NAME.to_string()
    } else {
      format!("{BASE_NAME}-{suffix}")
    };
    let version = repo.vcs().version.clone().unwrap_or_else(|| "unknown".to_string());

    let temp = TempDir::new()?;
    let output_dir = match &settings.output_dir {
      Some(dir) => util::make_directory(dir)?,
      None => util::make_directory(temp.path().join("build"))?,
    };

    let cache = match &settings.cache_dir {
      Some(dir) => Some(BuildCache::open(dir)?),
      None => None,
    };

    let graph = TaskGraph::new(settings.threads);
    let abort = graph.abort_flag();
    let module_configs = configure_qc_modules(&settings);

    Ok(BuildContext {
      repo,
      settings,
      hooks,
      display_name,
      suffix,
      version,
      date_string,
      output_dir,
      temp,
      cache,
      graph,
      abort,
      module_configs,
      source_hashes: OnceLock::new(),
      built_modules: Mutex::new(HashMap::new()),
      built_packages: Mutex::new(Vec::new()),
    })
  }

  pub fn repo(&self) -> &Repo {
    &self.repo
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn graph(&self) -> &TaskGraph {
    &self.graph
  }

  pub fn abort(&self) -> &AbortFlag {
    &self.abort
  }

  pub fn cache(&self) -> Option<&BuildCache> {
    self.cache.as_ref()
  }

  pub fn temp_dir(&self) -> &Path {
    self.temp.path()
  }

  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }

  /// `RocketMinsta`, or `RocketMinsta-<suffix>` on a non-master branch.
  pub fn display_name(&self) -> &str {
    &self.display_name
  }

  pub fn suffix(&self) -> &str {
    &self.suffix
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn comment(&self) -> &str {
    &self.settings.comment
  }

  pub fn date_string(&self) -> &str {
    &self.date_string
  }

  /// The shared base hashes; only available once the hashing phase has run.
  pub fn source_hashes(&self) -> Result<&SourceHashes> {
    self
      .source_hashes
      .get()
      .ok_or_else(|| Error::Config("shared source hashes read before the hashing phase".into()))
  }

  /// Compiled output directories recorded so far for one module kind, in a
  /// deterministic order.
  pub fn built_modules(&self, kind: ModuleKind) -> Vec<PathBuf> {
    let registry = self.built_modules.lock().expect("module registry poisoned");
    let mut dirs = registry.get(&kind).cloned().unwrap_or_default();
    dirs.sort();
    dirs
  }

  pub fn record_module(&self, kind: ModuleKind, dir: PathBuf) {
    let mut registry = self.built_modules.lock().expect("module registry poisoned");
    registry.entry(kind).or_default().push(dir);
  }

  /// Finished packages, sorted by name for deterministic config emission.
  pub fn built_packages(&self) -> Vec<BuiltPackage> {
    let mut packages = self.built_packages.lock().expect("package registry poisoned").clone();
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    packages
  }

  pub fn record_package(&self, package: BuiltPackage) {
    self.built_packages.lock().expect("package registry poisoned").push(package);
  }

  /// Invoke the per-package hook with a finished archive's path.
  pub fn run_package_hook(&self, archive: &Path) -> Result<()> {
    if let Some(hook) = &self.hooks.post_build_pkg {
      hook(self, archive).map_err(|e| Error::Hook {
        name: "post_build_pkg".to_string(),
        message: e.to_string(),
      })?;
    }
    Ok(())
  }

  fn run_build_hook(&self, name: &str) -> Result<()> {
    let hook = match name {
      "post_build" => &self.hooks.post_build,
      "post_install" => &self.hooks.post_install,
      _ => &None,
    };
    if let Some(hook) = hook {
      hook(self).map_err(|e| Error::Hook {
        name: name.to_string(),
        message: e.to_string(),
      })?;
    }
    Ok(())
  }
}

/// Per-kind compiler configurations derived from the settings. The
/// `compatible` autocvars mode compiles the server with `-DRM_AUTOCVARS` and
/// adds a second client variant carrying the flag under an alternate progs
/// name and cvar.
fn configure_qc_modules(settings: &Settings) -> BTreeMap<ModuleKind, Vec<ModuleConfig>> {
  const AUTOCVARS_FLAG: &str = "-DRM_AUTOCVARS";

  let mut configs: BTreeMap<ModuleKind, Vec<ModuleConfig>> = BTreeMap::new();
  let mut extra_flags: HashMap<ModuleKind, Vec<String>> = HashMap::new();

  match settings.autocvars {
    Autocvars::Enable => {
      for kind in ModuleKind::ALL {
        extra_flags.entry(kind).or_default().push(AUTOCVARS_FLAG.to_string());
      }
    }
    Autocvars::Compatible => {
      extra_flags
        .entry(ModuleKind::Server)
        .or_default()
        .push(AUTOCVARS_FLAG.to_string());

      let mut flags = settings.qcc_flags.clone();
      flags.push(AUTOCVARS_FLAG.to_string());
      configs.entry(ModuleKind::Client).or_default().push(ModuleConfig {
        qcc_cmd: settings.qcc_cmd.clone(),
        qcc_flags: flags,
        dat_expected_name: "csprogs".to_string(),
        dat_final_name: "rocketminsta_cl_autocvars".to_string(),
        cvar: Some("csqc_progname_alt".to_string()),
      });
    }
    Autocvars::Disable => {}
  }

  let standard = [
    (ModuleKind::Server, "progs", "rocketminsta_sv", Some("sv_progs")),
    (ModuleKind::Client, "csprogs", "rocketminsta_cl", Some("csqc_progname")),
    (ModuleKind::Menu, "menu", "menu", None),
  ];

  for (kind, expected, final_name, cvar) in standard {
    let mut flags = settings.qcc_flags.clone();
    flags.extend(extra_flags.get(&kind).cloned().unwrap_or_default());
    configs.entry(kind).or_default().push(ModuleConfig {
      qcc_cmd: settings.qcc_cmd.clone(),
      qcc_flags: flags,
      dat_expected_name: expected.to_string(),
      dat_final_name: final_name.to_string(),
      cvar: cvar.map(String::from),
    });
  }

  configs
}

/// `c_`/`o_` packages are opt-in via the extra-packages list.
fn package_selected(name: &str, settings: &Settings) -> bool {
  let optional = name.starts_with("c_") || name.starts_with("o_");
  !optional || settings.extra_packages.iter().any(|p| p == name)
}

/// Run a complete build: hash, generate the header, dispatch everything,
/// drain the graph, fire the post-build hook. The output directory holds the
/// finished tree on success.
pub async fn build(repo: Arc<Repo>, settings: Settings, hooks: Hooks) -> Result<Arc<BuildContext>> {
  let ctx = Arc::new(BuildContext::new(repo, settings, hooks)?);
  info!(
    name = %ctx.display_name(),
    version = %ctx.version(),
    comment = %ctx.comment(),
    output = %ctx.output_dir().display(),
    "build started"
  );

  util::clear_directory(ctx.output_dir())?;

  let modules = discover_modules(&ctx)?;
  hash_shared_sources(&ctx)?;
  generate_header(&ctx, &modules)?;
  dispatch(&ctx, modules)?;

  ctx.graph().drain_all().await?;
  ctx.run_build_hook("post_build")?;

  info!(name = %ctx.display_name(), "build finished");
  Ok(ctx)
}

/// Run a build and deploy it into every configured target directory. A
/// failed build never deploys.
pub async fn run(repo: Arc<Repo>, settings: Settings, hooks: Hooks) -> Result<Arc<BuildContext>> {
  let ctx = build(repo, settings, hooks).await?;

  for target in &ctx.settings().install_dirs {
    install::deploy(ctx.output_dir(), target, InstallMode::Copy, None)?;
  }
  for target in &ctx.settings().install_linkdirs {
    install::deploy(ctx.output_dir(), target, InstallMode::Link, None)?;
  }

  ctx.run_build_hook("post_install")?;
  Ok(ctx)
}

fn discover_modules(ctx: &BuildContext) -> Result<Vec<QcModule>> {
  ModuleKind::ALL
    .into_iter()
    .map(|kind| ctx.repo().qc_module(kind))
    .collect()
}

fn hash_shared_sources(ctx: &BuildContext) -> Result<()> {
  info!("hashing the shared source trees");

  let mut shared = TreeHasher::new();
  shared.fold_path(&ctx.repo().shared_tree("common")?, Some(&qc_name_filter))?;

  let mut menu = shared.clone();
  menu.fold_path(&ctx.repo().shared_tree("menu")?, Some(&qc_name_filter))?;

  shared.fold_path(&ctx.repo().shared_tree("warpzonelib")?, Some(&qc_name_filter))?;

  let _ = ctx.source_hashes.set(SourceHashes { shared, menu });
  Ok(())
}

fn render_header(ctx: &BuildContext, package_names: &[&str]) -> Result<String> {
  let mut text = String::new();
  let _ = writeln!(text, "#define RM_BUILD_DATE \"{} ({})\"", ctx.date_string(), ctx.comment());
  let _ = writeln!(text, "#define RM_BUILD_NAME \"{}\"", ctx.display_name());
  let _ = writeln!(text, "#define RM_BUILD_VERSION \"{}\"", ctx.version());
  let _ = writeln!(text, "#define RM_BUILD_MENUSUM \"{}\"", ctx.source_hashes()?.menu.hex_digest());
  let _ = writeln!(text, "#define RM_BUILD_SUFFIX \"{}\"", ctx.suffix());
  for name in package_names {
    let _ = writeln!(text, "#define RM_SUPPORT_PKG_{name}");
  }
  Ok(text)
}

/// Write the build-metadata header into the common tree, if any module wants
/// it. Every discovered package gets a support marker, selected or not.
fn generate_header(ctx: &BuildContext, modules: &[QcModule]) -> Result<()> {
  if !modules.iter().any(|m| m.wants_header) {
    return Ok(());
  }
  info!(header = HEADER_NAME, "generating the build header");

  let names: Vec<&str> = ctx.repo().packages().iter().map(|p| p.name()).collect();
  let text = render_header(ctx, &names)?;
  fs::write(ctx.repo().shared_tree("common")?.join(HEADER_NAME), text)?;
  Ok(())
}

/// Synchronous dispatch: register every task before the pool drains. All
/// waits below reference groups whose producers are registered here first.
fn dispatch(ctx: &Arc<BuildContext>, modules: Vec<QcModule>) -> Result<()> {
  for module in modules {
    let configs = ctx.module_configs.get(&module.kind).cloned().unwrap_or_default();
    for config in configs {
      let name = format!("qc.{}.{}", module.kind, config.dat_final_name);
      let ctx2 = ctx.clone();
      let module = module.clone();
      ctx.graph().register(&name, async move {
        let out = module.build(&ctx2, &config).await?;
        ctx2.record_module(module.kind, out);
        Ok(())
      })?;
    }
  }

  for pkg in ctx.repo().packages() {
    if !package_selected(pkg.name(), ctx.settings()) {
      debug!(package = %pkg.name(), "skipping optional package");
      continue;
    }
    let name = format!("pkg.{}", pkg.name());
    let pkg = pkg.clone();
    let ctx2 = ctx.clone();
    ctx.graph().register(&name, async move { pkg.build(&ctx2).await })?;
  }

  let ctx2 = ctx.clone();
  ctx.graph().register("install.qc", async move {
    ctx2.graph().await_group("qc").await?;
    install_qc_modules(&ctx2)
  })?;

  let ctx2 = ctx.clone();
  ctx.graph().register("static", async move {
    info!("copying static files");
    util::copy_tree(ctx2.repo().modfiles(), ctx2.output_dir())
  })?;

  let ctx2 = ctx.clone();
  ctx.graph().register("cfg", async move {
    ctx2.graph().await_group("static").await?;
    ctx2.graph().await_group("pkg").await?;
    emit_deploy_config(&ctx2)
  })?;

  if ctx.settings().server_pkg {
    let ctx2 = ctx.clone();
    ctx.graph().register("bundle", async move {
      for group in ["qc", "pkg", "install", "static", "cfg"] {
        ctx2.graph().await_group(group).await?;
      }
      assemble_server_bundle(&ctx2).await
    })?;
  }

  Ok(())
}

/// Copy the compiled artifacts of every installable module into the output
/// root. The menu module only ships inside its package.
fn install_qc_modules(ctx: &BuildContext) -> Result<()> {
  info!("installing compiled modules");

  for kind in ModuleKind::ALL {
    if kind == ModuleKind::Menu {
      continue;
    }
    for dir in ctx.built_modules(kind) {
      let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
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
        let Some(file_name) = path.file_name() else { continue };
        util::copy_file(&path, &ctx.output_dir().join(file_name))?;
      }
    }
  }
  Ok(())
}

/// Append the generated section to the deploy config script: clear
/// directive, one put-package line per built package, and the cvar bindings.
fn emit_deploy_config(ctx: &BuildContext) -> Result<()> {
  info!(script = CONFIG_SCRIPT, "updating the deploy config script");

  let mut text = String::new();
  text.push_str("\n\n// The rest of this file was autogenerated by rmbuild\n\n");
  text.push_str("rm_clearpkgs\n");

  for pkg in ctx.built_packages() {
    let _ = writeln!(text, "rm_putpackage {}", pkg.metafile_name);
  }
  text.push('\n');

  for configs in ctx.module_configs.values() {
    for config in configs {
      if let Some(cvar) = &config.cvar {
        let _ = writeln!(text, "set {} {}.dat", cvar, config.dat_final_name);
      }
    }
  }
  text.push('\n');

  let mut file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(ctx.output_dir().join(CONFIG_SCRIPT))?;
  file.write_all(text.as_bytes())?;
  Ok(())
}

/// Relocate every loose (non-archive) file at the output root into a staging
/// directory and re-archive it as one more self-hashed package. Archives,
/// `.pk3dir` links and asset directories stay in place; a symlink among the
/// files being relocated cannot be represented in the bundle and is fatal.
async fn assemble_server_bundle(ctx: &BuildContext) -> Result<()> {
  info!("assembling the server-side bundle");

  let staging = util::make_directory(ctx.temp_dir().join("server_bundle"))?;

  let mut entries: Vec<PathBuf> = fs::read_dir(ctx.output_dir())?
    .collect::<std::io::Result<Vec<_>>>()?
    .into_iter()
    .map(|e| e.path())
    .collect();
  entries.sort();

  for path in entries {
    let meta = path.symlink_metadata()?;
    let ext = path.extension().and_then(|e| e.to_str());
    if matches!(ext, Some("pk3") | Some("pk3dir")) {
      continue;
    }
    if meta.file_type().is_symlink() {
      return Err(Error::UnsupportedSymlink { path });
    }
    if !meta.is_file() {
      continue;
    }
    let Some(file_name) = path.file_name() else { continue };
    util::copy_file(&path, &staging.join(file_name))?;
    fs::remove_file(&path)?;
  }

  // Always a real archive, even in link_pk3dirs mode: the staging directory
  // is gone after this function, so a link to it would dangle.
  let bundle = package::self_hashed(SERVER_BUNDLE_NAME, staging.clone());
  bundle.assemble(ctx).await?;

  fs::remove_dir_all(&staging)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn config_names(configs: &BTreeMap<ModuleKind, Vec<ModuleConfig>>, kind: ModuleKind) -> Vec<String> {
    configs
      .get(&kind)
      .map(|cfgs| cfgs.iter().map(|c| c.dat_final_name.clone()).collect())
      .unwrap_or_default()
  }

  #[test]
  fn compatible_autocvars_adds_a_client_variant() {
    let settings = Settings {
      autocvars: Autocvars::Compatible,
      ..Settings::default()
    };
    let configs = configure_qc_modules(&settings);

    assert_eq!(
      config_names(&configs, ModuleKind::Client),
      vec!["rocketminsta_cl_autocvars", "rocketminsta_cl"]
    );
    let server = &configs[&ModuleKind::Server][0];
    assert!(server.qcc_flags.iter().any(|f| f == "-DRM_AUTOCVARS"));
    let standard_client = &configs[&ModuleKind::Client][1];
    assert!(!standard_client.qcc_flags.iter().any(|f| f == "-DRM_AUTOCVARS"));
  }

  #[test]
  fn enabled_autocvars_flags_every_module() {
    let settings = Settings {
      autocvars: Autocvars::Enable,
      ..Settings::default()
    };
    let configs = configure_qc_modules(&settings);

    for kind in ModuleKind::ALL {
      assert_eq!(config_names(&configs, kind).len(), 1);
      assert!(configs[&kind][0].qcc_flags.iter().any(|f| f == "-DRM_AUTOCVARS"));
    }
  }

  #[test]
  fn disabled_autocvars_flags_nothing() {
    let settings = Settings {
      autocvars: Autocvars::Disable,
      ..Settings::default()
    };
    let configs = configure_qc_modules(&settings);

    for kind in ModuleKind::ALL {
      assert!(!configs[&kind][0].qcc_flags.iter().any(|f| f == "-DRM_AUTOCVARS"));
    }
  }

  #[test]
  fn optional_packages_require_opt_in() {
    let mut settings = Settings::default();
    assert!(package_selected("common", &settings));
    assert!(package_selected("csqc", &settings));
    assert!(!package_selected("c_experimental", &settings));
    assert!(!package_selected("o_extras", &settings));

    settings.extra_packages.push("o_extras".to_string());
    assert!(package_selected("o_extras", &settings));
    assert!(!package_selected("c_experimental", &settings));
  }

  #[test]
  fn standard_configs_bind_expected_cvars() {
    let configs = configure_qc_modules(&Settings::default());

    assert_eq!(configs[&ModuleKind::Server][0].cvar.as_deref(), Some("sv_progs"));
    let client = configs[&ModuleKind::Client].last().unwrap();
    assert_eq!(client.cvar.as_deref(), Some("csqc_progname"));
    assert!(configs[&ModuleKind::Menu][0].cvar.is_none());
  }
}
