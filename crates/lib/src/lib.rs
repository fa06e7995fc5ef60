//! Incremental build and packaging pipeline for the RocketMinsta mod.
//!
//! The pipeline compiles QC modules with an external compiler, assembles
//! compiled and static content into content-addressed `.pk3` archives, and
//! deploys the finished output tree into target directories while cleaning
//! up what earlier deployments left behind. Everything runs through one
//! [`BuildContext`] per build; [`run`] is the end-to-end entry point and
//! [`build`] stops short of deployment.

pub mod build;
pub mod cache;
pub mod config;
pub mod error;
pub mod gfx;
pub mod install;
pub mod package;
pub mod pk3;
pub mod qcmod;
pub mod repo;
pub mod task;
pub mod util;

pub use build::{BuildContext, HEADER_NAME, build, run};
pub use config::{Autocvars, Hooks, Settings};
pub use error::{Error, Result};
pub use repo::{Repo, VcsInfo};
