//! Breakpoint tracking for a debug session.
//!
//! The engine's `set_breakpoints` command replaces its entire
//! breakpoint table, so every send must carry the union across all
//! tracked files; a per-file partial update would silently drop every
//! other file's breakpoints.

use std::collections::BTreeMap;

use serde_json::Value;

/// A client-side breakpoint keyed by engine resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Session-unique, monotonically assigned id.
    pub id: i64,
    /// Engine resource path (no `@` marker).
    pub resource: String,
    /// 1-based line.
    pub line: u32,
    /// Set once the engine actually halts here, or immediately when the
    /// path resolved cleanly.
    pub verified: bool,
}

/// Manages breakpoints across resources for a debug session.
#[derive(Debug, Default)]
pub struct BreakpointManager {
    by_resource: BTreeMap<String, Vec<Breakpoint>>,
    next_id: i64,
}

impl BreakpointManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the breakpoint set for one resource.
    ///
    /// Returns the new records in request order, ids freshly assigned.
    /// `verified` reflects whether the path resolved to a known root.
    pub fn replace_resource(
        &mut self,
        resource: &str,
        lines: &[u32],
        verified: bool,
    ) -> Vec<Breakpoint> {
        let records: Vec<Breakpoint> = lines
            .iter()
            .map(|&line| {
                self.next_id += 1;
                Breakpoint {
                    id: self.next_id,
                    resource: resource.to_owned(),
                    line,
                    verified,
                }
            })
            .collect();
        if records.is_empty() {
            self.by_resource.remove(resource);
        } else {
            self.by_resource.insert(resource.to_owned(), records.clone());
        }
        records
    }

    /// Breakpoints currently tracked for a resource.
    pub fn for_resource(&self, resource: &str) -> &[Breakpoint] {
        self.by_resource.get(resource).map_or(&[], Vec::as_slice)
    }

    /// Find a breakpoint at a halt location and mark it verified.
    ///
    /// Returns the updated record so the caller can emit a
    /// breakpoint-changed event.
    pub fn mark_hit(&mut self, resource: &str, line: u32) -> Option<Breakpoint> {
        let list = self.by_resource.get_mut(resource)?;
        let bp = list.iter_mut().find(|bp| bp.line == line)?;
        bp.verified = true;
        Some(bp.clone())
    }

    /// The full engine payload: `{resource: [lines], ...}` across every
    /// tracked file.
    pub fn engine_payload(&self) -> Value {
        let mut table = serde_json::Map::new();
        for (resource, records) in &self.by_resource {
            let lines: Vec<u32> = records.iter().map(|bp| bp.line).collect();
            table.insert(resource.clone(), serde_json::json!(lines));
        }
        Value::Object(table)
    }

    /// Drop every breakpoint.
    pub fn clear(&mut self) {
        self.by_resource.clear();
    }

    /// Total number of tracked breakpoints.
    pub fn len(&self) -> usize {
        self.by_resource.values().map(Vec::len).sum()
    }

    /// Whether no breakpoints are tracked.
    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }
}
