//! Session-local lazy variable tree.
//!
//! Every scope, table and expandable evaluate result gets a node in an
//! arena keyed by an integer reference id. Children are fetched from
//! the engine only on explicit expansion; a node carries an explicit
//! `Unresolved | Pending | Resolved` state so concurrent expansions of
//! the same reference coalesce onto one round trip. A new callstack
//! invalidates the whole arena; reference ids are never reused within a
//! session.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::engine::TableValue;

/// A variable row as handed to the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// Display name.
    pub name: String,
    /// Stringified value.
    pub value: String,
    /// Engine type tag.
    pub type_tag: String,
    /// Reference id for expandable children; 0 for leaves.
    pub reference: i64,
}

/// How a node's children are fetched when first expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// Native `expand_table` path: 1-based child-index chain from a
    /// named local or upvalue of one frame.
    EngineTable {
        /// Frame level the local lives in.
        frame_level: usize,
        /// Name of the originating local/upvalue.
        local_name: String,
        /// 1-based child-index chain below that local.
        path: Vec<usize>,
    },
    /// Injected-RPC path for evaluate results, addressed by the eval
    /// result id plus a child-index chain. Kept separate from the
    /// engine-table path; the two correlation mechanisms never merge.
    EvalChild {
        /// Id assigned by the in-VM dispatcher to the evaluate result.
        eval_id: u64,
        /// 1-based child-index chain below the result.
        path: Vec<usize>,
    },
}

/// Where a record list came from, for wiring up its children.
#[derive(Debug, Clone)]
pub enum ExpandContext {
    /// Direct locals/upvalues of one frame.
    Frame {
        /// Frame level.
        level: usize,
    },
    /// Children of an engine table node.
    Table {
        /// Frame level of the originating local.
        level: usize,
        /// Name of the originating local.
        local_name: String,
        /// Path of the parent table.
        path: Vec<usize>,
    },
    /// Children of an evaluate result node.
    Eval {
        /// Eval result id.
        eval_id: u64,
        /// Path of the parent node.
        path: Vec<usize>,
    },
}

type FetchResult = Result<Vec<Variable>, String>;

#[derive(Debug)]
enum NodeState {
    Unresolved(Expansion),
    Pending {
        expansion: Expansion,
        waiters: Vec<oneshot::Sender<FetchResult>>,
    },
    Resolved(Vec<Variable>),
}

/// Outcome of asking for a node's children.
#[derive(Debug)]
pub enum FetchDecision {
    /// Children already known.
    Ready(Vec<Variable>),
    /// Caller must perform the fetch described by the expansion; the
    /// node is now pending and absorbs concurrent callers.
    Fetch(Expansion),
    /// Another caller is already fetching; await this receiver.
    Wait(oneshot::Receiver<FetchResult>),
    /// The reference is unknown or was invalidated by a newer halt.
    Unknown,
}

/// Arena of lazily resolved variable nodes.
#[derive(Debug, Default)]
pub struct VariableArena {
    nodes: HashMap<i64, NodeState>,
    next_reference: i64,
    generation: u64,
}

impl VariableArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic generation, bumped on every invalidation. Replies
    /// carrying a stale generation are discarded, never merged.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn alloc(&mut self, state: NodeState) -> i64 {
        self.next_reference += 1;
        self.nodes.insert(self.next_reference, state);
        self.next_reference
    }

    /// Insert a node whose children are already known.
    pub fn alloc_resolved(&mut self, children: Vec<Variable>) -> i64 {
        self.alloc(NodeState::Resolved(children))
    }

    /// Insert a node that fetches its children on first expansion.
    pub fn alloc_unresolved(&mut self, expansion: Expansion) -> i64 {
        self.alloc(NodeState::Unresolved(expansion))
    }

    /// Ask for a node's children, transitioning Unresolved to Pending.
    pub fn begin_fetch(&mut self, reference: i64) -> FetchDecision {
        match self.nodes.get_mut(&reference) {
            None => FetchDecision::Unknown,
            Some(NodeState::Resolved(children)) => FetchDecision::Ready(children.clone()),
            Some(state @ NodeState::Unresolved(_)) => {
                let NodeState::Unresolved(expansion) = &*state else {
                    unreachable!("matched Unresolved above");
                };
                let expansion = expansion.clone();
                *state = NodeState::Pending {
                    expansion: expansion.clone(),
                    waiters: Vec::new(),
                };
                FetchDecision::Fetch(expansion)
            }
            Some(NodeState::Pending { waiters, .. }) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                FetchDecision::Wait(rx)
            }
        }
    }

    /// Record a successful fetch and wake coalesced waiters.
    pub fn complete_fetch(&mut self, reference: i64, children: Vec<Variable>) {
        if let Some(state) = self.nodes.get_mut(&reference) {
            let prior = std::mem::replace(state, NodeState::Resolved(children.clone()));
            if let NodeState::Pending { waiters, .. } = prior {
                for tx in waiters {
                    let _ = tx.send(Ok(children.clone()));
                }
            }
        }
        // An unknown reference here means the arena was invalidated while
        // the fetch was in flight; the stale children are dropped.
    }

    /// Record a failed fetch: waiters are told, the node becomes
    /// expandable again.
    pub fn fail_fetch(&mut self, reference: i64, error: &str) {
        let Some(state) = self.nodes.get_mut(&reference) else {
            return;
        };
        if !matches!(state, NodeState::Pending { .. }) {
            return;
        }
        let NodeState::Pending { expansion, waiters } =
            std::mem::replace(state, NodeState::Resolved(Vec::new()))
        else {
            unreachable!("matched Pending above");
        };
        for tx in waiters {
            let _ = tx.send(Err(error.to_owned()));
        }
        *state = NodeState::Unresolved(expansion);
    }

    /// Drop every node. Outstanding waiters resolve to an error; their
    /// references are invalid from now on. Ids are not reused.
    pub fn invalidate_all(&mut self) {
        self.generation += 1;
        for (_, state) in self.nodes.drain() {
            if let NodeState::Pending { waiters, .. } = state {
                for tx in waiters {
                    let _ = tx.send(Err("invalidated by new callstack".to_owned()));
                }
            }
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Turn an engine record list into sorted variable rows, allocating
    /// child nodes for expandable entries.
    ///
    /// The child-index chain is built from the records' engine order
    /// (1-based), not the sorted display order. `(*temporary)` slots and
    /// C-function entries are hidden, mirroring what the engine's own
    /// console frontend shows; duplicate keys get a `(n)` suffix.
    pub fn materialize(
        &mut self,
        records: &[TableValue],
        context: &ExpandContext,
    ) -> Vec<Variable> {
        let mut rows: Vec<(SortKey, Variable)> = Vec::new();
        let mut duplicates = 0usize;

        for (index, record) in records.iter().enumerate() {
            let mut name = record.name().to_owned();
            if name == "(*temporary)" || record.value == "C function" {
                continue;
            }
            if record.key.is_some() && rows.iter().any(|(_, v)| v.name == name) {
                duplicates += 1;
                name = format!("{name}({duplicates})");
            }

            let reference = if record.is_table() {
                let expansion = match context {
                    ExpandContext::Frame { level } => Expansion::EngineTable {
                        frame_level: *level,
                        local_name: record.name().to_owned(),
                        path: Vec::new(),
                    },
                    ExpandContext::Table { level, local_name, path } => {
                        let mut child_path = path.clone();
                        child_path.push(index + 1);
                        Expansion::EngineTable {
                            frame_level: *level,
                            local_name: local_name.clone(),
                            path: child_path,
                        }
                    }
                    ExpandContext::Eval { eval_id, path } => {
                        let mut child_path = path.clone();
                        child_path.push(index + 1);
                        Expansion::EvalChild {
                            eval_id: *eval_id,
                            path: child_path,
                        }
                    }
                };
                self.alloc_unresolved(expansion)
            } else {
                0
            };

            let value = if record.is_table() {
                "{table}".to_owned()
            } else {
                record.value.clone()
            };

            rows.push((
                SortKey::for_name(&name),
                Variable {
                    name,
                    value,
                    type_tag: record.value_type.clone(),
                    reference,
                },
            ));
        }

        rows.sort_by(|(a, _), (b, _)| a.cmp(b));
        rows.into_iter().map(|(_, v)| v).collect()
    }
}

/// Display ordering: pseudo-entries last, then visibility (public,
/// `_`-private, `__`-internal), then numeric keys numerically, then
/// case-insensitive name order.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    pseudo: bool,
    visibility: u8,
    numeric: NumericKey,
    lowered: String,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum NumericKey {
    Number(i64),
    Name,
}

impl SortKey {
    fn for_name(name: &str) -> Self {
        let visibility = if name.starts_with("__") {
            2
        } else if name.starts_with('_') {
            1
        } else {
            0
        };
        Self {
            pseudo: name.starts_with('('),
            visibility,
            numeric: name
                .parse::<i64>()
                .map_or(NumericKey::Name, NumericKey::Number),
            lowered: name.to_lowercase(),
        }
    }
}
