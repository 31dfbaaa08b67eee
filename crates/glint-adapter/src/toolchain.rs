//! Toolchain description.
//!
//! A toolchain root directory carries the engine binaries, the shared
//! `core` resources, and a `toolchain.toml` describing both. The file
//! is re-read on every launch so edits take effect without restarting
//! the adapter.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AdapterError;

const MANIFEST_NAME: &str = "toolchain.toml";

/// Which engine build to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Build {
    #[default]
    Dev,
    Debug,
    Release,
}

#[derive(Debug, Clone, Deserialize)]
struct EngineSection {
    dev: Option<PathBuf>,
    debug: Option<PathBuf>,
    release: Option<PathBuf>,
}

/// One launchable configuration from the manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchTarget {
    pub id: String,
    pub name: String,
    /// Console server port the engine instance will listen on.
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    engine: EngineSection,
    /// Named resource roots, e.g. `core = "engine/core"`.
    #[serde(default)]
    maps: BTreeMap<String, PathBuf>,
    #[serde(default, rename = "target")]
    targets: Vec<LaunchTarget>,
}

/// A loaded toolchain: the root directory plus its parsed manifest.
#[derive(Debug, Clone)]
pub struct Toolchain {
    root: PathBuf,
    manifest: Manifest,
}

impl Toolchain {
    /// Read `toolchain.toml` under `root`.
    pub fn load(root: &Path) -> Result<Self, AdapterError> {
        let path = root.join(MANIFEST_NAME);
        let content = std::fs::read_to_string(&path).map_err(|err| {
            AdapterError::Toolchain(format!("cannot read {}: {err}", path.display()))
        })?;
        let manifest: Manifest = toml::from_str(&content).map_err(|err| {
            AdapterError::Toolchain(format!("cannot parse {}: {err}", path.display()))
        })?;
        tracing::debug!(root = %root.display(), targets = manifest.targets.len(), "loaded toolchain");
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the engine executable for `build`.
    pub fn engine_executable(&self, build: Build) -> Result<PathBuf, AdapterError> {
        let relative = match build {
            Build::Dev => self.manifest.engine.dev.as_ref(),
            Build::Debug => self.manifest.engine.debug.as_ref(),
            Build::Release => self.manifest.engine.release.as_ref(),
        };
        let relative = relative.ok_or_else(|| {
            AdapterError::Toolchain(format!("no {build:?} engine build in {MANIFEST_NAME}"))
        })?;
        Ok(self.root.join(relative))
    }

    /// Look up a launch target by its manifest id.
    pub fn target(&self, id: &str) -> Option<&LaunchTarget> {
        self.manifest.targets.iter().find(|t| t.id == id)
    }

    pub fn targets(&self) -> &[LaunchTarget] {
        &self.manifest.targets
    }

    /// Named resource roots as absolute paths, for source resolution.
    pub fn source_maps(&self) -> Vec<(String, PathBuf)> {
        self.manifest
            .maps
            .iter()
            .map(|(name, rel)| (name.clone(), self.root.join(rel)))
            .collect()
    }
}
