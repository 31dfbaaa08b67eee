//! Bidirectional mapping between engine resource paths and filesystem
//! paths.
//!
//! Engine source strings are project-root-relative, or `@`-prefixed
//! when they live in a mapped root such as `core`. A resource whose
//! first segment names a configured map is rebased onto that map's real
//! directory; everything else resolves against the project root.

use std::path::{Path, PathBuf};

/// Resolves resource paths against a project root and named maps.
#[derive(Debug, Clone)]
pub struct SourcePathResolver {
    project_root: PathBuf,
    /// Ordered (name, directory) pairs, e.g. `("core", <toolchain>/core)`.
    maps: Vec<(String, PathBuf)>,
}

impl SourcePathResolver {
    /// Create a resolver for the given project root.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            maps: Vec::new(),
        }
    }

    /// Register a named map, e.g. `core` onto the engine's core
    /// directory. Maps are consulted in registration order.
    pub fn add_map(&mut self, name: impl Into<String>, dir: impl Into<PathBuf>) {
        self.maps.push((name.into(), dir.into()));
    }

    /// The active project root.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Map a filesystem path to an engine resource path.
    ///
    /// Tries the project root first (project root wins when a file sits
    /// under both it and a map), then each configured map. `None` means
    /// the file is outside every known root; callers accept the
    /// breakpoint unverified rather than rejecting it.
    pub fn resource_for_file(&self, file: &Path) -> Option<String> {
        if let Ok(relative) = file.strip_prefix(&self.project_root) {
            return Some(to_resource_string(relative));
        }
        for (name, dir) in &self.maps {
            if let Ok(relative) = file.strip_prefix(dir) {
                return Some(format!("{name}/{}", to_resource_string(relative)));
            }
        }
        None
    }

    /// Map an engine source string to a filesystem path.
    ///
    /// A leading `@` marks a mapped (non-project) resource; it is
    /// stripped before resolution either way, since the map-name prefix
    /// alone decides the rebased root.
    pub fn file_for_resource(&self, source: &str) -> PathBuf {
        let resource = source.strip_prefix('@').unwrap_or(source);
        for (name, dir) in &self.maps {
            if let Some(rest) = resource.strip_prefix(name.as_str()) {
                if let Some(rest) = rest.strip_prefix('/') {
                    return dir.join(rest);
                }
            }
        }
        self.project_root.join(resource)
    }

    /// Strip the `@` marker from an engine source string, yielding the
    /// plain resource path used as a breakpoint key.
    pub fn resource_key(source: &str) -> &str {
        source.strip_prefix('@').unwrap_or(source)
    }
}

/// Render a relative path with forward slashes, the engine's separator.
fn to_resource_string(relative: &Path) -> String {
    let mut out = String::new();
    for component in relative.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}
