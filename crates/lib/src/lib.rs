//! yb - hermetic, reproducible build orchestrator.
//!
//! This crate implements the core of the `yb` tool: it reads a declarative
//! manifest (`.yourbase.yml`) describing named build targets, provisions a
//! hermetic build environment (a *biome*) for each one, makes the requested
//! toolchains available inside it (*buildpacks*), starts auxiliary service
//! containers (*resources*), and runs the target's commands in order.
//!
//! # Module map
//!
//! - [`manifest`] - on-disk manifest parsing and normalization
//! - [`paths`] - per-package, per-target cache directory resolution
//! - [`download`] - content-addressed download cache with HEAD validation
//! - [`archive`] - tar/zip/xz extraction with traversal guards
//! - [`biome`] - the polymorphic execution environment (host, container, remote)
//! - [`buildpack`] - toolchain provisioning against a biome
//! - [`resource`] - auxiliary service container lifecycle
//! - [`template`] - env value expansion (`{{ .Containers.IP "label" }}`)
//! - [`executor`] - target ordering, validation, and command dispatch

pub mod archive;
pub mod biome;
pub mod buildpack;
pub mod consts;
pub mod download;
pub mod executor;
pub mod manifest;
pub mod paths;
pub mod resource;
pub mod template;

pub use executor::{build_order, run_adhoc, run_exec, run_target, BuildError, BuildOpts, BuildReport, TargetReport};
pub use manifest::{Manifest, ManifestError, Target};
