use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;
use rmbuild_lib::{Hooks, Repo, Settings, VcsInfo};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// rmbuild - incremental build and packaging tool for RocketMinsta
#[derive(Parser)]
#[command(name = "rmbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Path to the build configuration file
  #[arg(default_value = "config.json")]
  config: PathBuf,

  /// Repository root (overrides the config file)
  #[arg(long)]
  repo: Option<PathBuf>,

  /// Bypass cache lookup for this run
  #[arg(long)]
  force_rebuild: bool,

  /// Enable verbose output
  #[arg(short, long)]
  verbose: bool,
}

#[derive(Deserialize)]
struct ConfigFile {
  #[serde(default)]
  repo_path: Option<PathBuf>,

  #[serde(flatten)]
  settings: Settings,
}

fn git_output(root: &Path, args: &[&str]) -> Option<String> {
  let output = Command::new("git").arg("-C").arg(root).args(args).output().ok()?;
  if !output.status.success() {
    return None;
  }
  let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
  if text.is_empty() { None } else { Some(text) }
}

fn vcs_info(root: &Path) -> VcsInfo {
  let info = VcsInfo {
    branch: git_output(root, &["rev-parse", "--abbrev-ref", "HEAD"]),
    version: git_output(root, &["describe", "--tags", "--long", "--dirty"]),
  };
  if info.branch.is_none() {
    warn!(root = %root.display(), "could not read git metadata; building without branch/version info");
  }
  info
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
  };
  tracing_subscriber::fmt().with_env_filter(filter).without_time().init();

  let text = fs::read_to_string(&cli.config)
    .with_context(|| format!("reading config file {}", cli.config.display()))?;
  let config: ConfigFile = serde_json::from_str(&text)
    .with_context(|| format!("parsing config file {}", cli.config.display()))?;

  let mut settings = config.settings;
  if cli.force_rebuild {
    settings.force_rebuild = true;
  }
  if settings.output_dir.is_none() && settings.install_dirs.is_empty() && settings.install_linkdirs.is_empty() {
    warn!("no output_dir and no install targets configured; build results will be discarded");
  }

  let repo_path = cli
    .repo
    .or(config.repo_path)
    .context("no repository path given (set repo_path in the config or pass --repo)")?;

  let repo = Repo::open(&repo_path, vcs_info(&repo_path))?;
  let ctx = rmbuild_lib::run(repo, settings, Hooks::default()).await?;

  info!(
    name = %ctx.display_name(),
    version = %ctx.version(),
    output = %ctx.output_dir().display(),
    "all done"
  );
  Ok(())
}
