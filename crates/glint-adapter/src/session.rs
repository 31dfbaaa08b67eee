//! Debug session state machine.
//!
//! One `DebugSession` per attach or launch. It owns the console
//! connection, the breakpoint table, the callstack cache and the lazy
//! variable arena, and translates between front-end requests and the
//! engine's native debugger vocabulary plus the injected RPC channel.
//!
//! Flow-control commands are fire and forget; the resulting state
//! change arrives later as a halted push. Every halt's callstack
//! replaces the previous one and invalidates all variable references
//! from the prior halt, so late replies are discarded rather than
//! merged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tokio::sync::mpsc;

use glint_console::{Connection, ConsoleEvent, Correlator, DEFAULT_IP};

use crate::breakpoint::{Breakpoint, BreakpointManager};
use crate::engine::{self, cmd, EngineFrame, EngineMessage, TableReply, TableValue};
use crate::error::AdapterError;
use crate::launcher::{self, LaunchSpec, LaunchedEngine};
use crate::resolve::SourcePathResolver;
use crate::rpc::RpcClient;
use crate::toolchain::{Build, Toolchain};
use crate::variables::{Expansion, ExpandContext, FetchDecision, Variable, VariableArena};

/// Bound on native `expand_table` round trips.
const EXPAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Watch evaluations that fail render as this fixed placeholder.
const WATCH_PLACEHOLDER: &str = "not available";

/// Session lifecycle. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Attached,
    Running,
    Halted,
    Disconnected,
}

/// Events the session pushes to the front-end layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The engine is reachable; breakpoints may now be configured.
    Initialized,
    /// The script VM halted.
    Stopped {
        reason: String,
        description: Option<String>,
    },
    /// A breakpoint changed, typically unverified to verified on hit.
    BreakpointChanged(Breakpoint),
    /// Engine output to surface in the debug console.
    Output { category: String, message: String },
    /// Cached variable state is no longer trustworthy.
    Invalidated,
    /// The session ended.
    Terminated,
    /// The debuggee is gone.
    Exited { code: i32 },
}

/// How to reach an already running engine.
#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub ip: String,
    pub port: u16,
    pub project_root: PathBuf,
    pub toolchain_root: Option<PathBuf>,
}

/// How to launch an engine before attaching.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub toolchain_root: PathBuf,
    pub target_id: String,
    pub build: Build,
    pub project_root: PathBuf,
    pub timeout: Duration,
    pub extra_args: Vec<String>,
}

/// One row of `stack_trace`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFrame {
    pub id: usize,
    pub name: String,
    pub path: PathBuf,
    pub line: u32,
    /// Set for frames with no function name, e.g. top-level chunks;
    /// front ends render these de-emphasized.
    pub subtle: bool,
}

/// One row of `scopes`.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub name: String,
    pub reference: i64,
}

/// Result of a successful evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    pub value: String,
    pub type_tag: String,
    /// Non-zero when the result is further expandable.
    pub reference: i64,
}

/// Evaluation contexts with distinct failure semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalContext {
    Repl,
    Hover,
    Watch,
}

/// One completion row.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionItem {
    pub label: String,
    /// Replacement text when it differs from the label.
    pub text: Option<String>,
    /// True for snippet-style insertions.
    pub snippet: bool,
}

struct Inner {
    state: SessionState,
    resolver: SourcePathResolver,
    breakpoints: BreakpointManager,
    callstack: Vec<EngineFrame>,
    arena: VariableArena,
    /// (locals, upvalues) references per frame, valid for one halt.
    scope_refs: HashMap<usize, (i64, i64)>,
}

/// A debug session. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct DebugSession {
    inner: Mutex<Inner>,
    connection: Mutex<Option<Arc<Connection>>>,
    rpc: Mutex<Option<Arc<RpcClient>>>,
    /// Matches `expand_table` replies by node index. Deliberately a
    /// separate instance from the injected-RPC correlator.
    expand: Correlator<u64, TableReply>,
    next_node_index: AtomicU64,
    engine: tokio::sync::Mutex<Option<LaunchedEngine>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl DebugSession {
    /// Create an idle session and the receiver for its events.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                resolver: SourcePathResolver::new(PathBuf::new()),
                breakpoints: BreakpointManager::new(),
                callstack: Vec::new(),
                arena: VariableArena::new(),
                scope_refs: HashMap::new(),
            }),
            connection: Mutex::new(None),
            rpc: Mutex::new(None),
            expand: Correlator::new(),
            next_node_index: AtomicU64::new(1),
            engine: tokio::sync::Mutex::new(None),
            events: events.clone(),
        });
        (session, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn conn(&self) -> Result<Arc<Connection>, AdapterError> {
        self.connection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(AdapterError::NotAttached)
    }

    fn rpc_client(&self) -> Result<Arc<RpcClient>, AdapterError> {
        self.rpc
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(AdapterError::NotAttached)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Attach to a running engine console server.
    pub async fn attach(self: &Arc<Self>, config: AttachConfig) -> Result<(), AdapterError> {
        let mut resolver = SourcePathResolver::new(config.project_root.clone());
        if let Some(root) = &config.toolchain_root {
            let toolchain = Toolchain::load(root)?;
            for (name, dir) in toolchain.source_maps() {
                resolver.add_map(name, dir);
            }
        }
        {
            let mut inner = self.lock();
            inner.state = SessionState::Connecting;
            inner.resolver = resolver;
        }

        let connection = Arc::new(Connection::connect(&config.ip, config.port).await?);
        let events = connection.subscribe();
        *self.connection.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&connection));
        *self.rpc.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Arc::new(RpcClient::new(Arc::clone(&connection))));

        let pump = Arc::clone(self);
        tokio::spawn(async move { pump.pump_console(events).await });

        // The engine may be parked in --wait-for-debugger; report_status
        // both unparks it and tells us whether it is already halted.
        connection.send_debugger_command(cmd::REPORT_STATUS, None)?;
        self.lock().state = SessionState::Attached;
        self.emit(SessionEvent::Initialized);
        tracing::info!(ip = %config.ip, port = config.port, "attached");
        Ok(())
    }

    /// Launch an engine target and attach to the port it announces.
    pub async fn launch(self: &Arc<Self>, config: LaunchConfig) -> Result<(), AdapterError> {
        let toolchain = Toolchain::load(&config.toolchain_root)?;
        let target = toolchain.target(&config.target_id).ok_or_else(|| {
            AdapterError::Launch(format!("unknown launch target '{}'", config.target_id))
        })?;
        tracing::info!(target = %target.name, "launching engine");

        let spec = LaunchSpec {
            executable: toolchain.engine_executable(config.build)?,
            toolchain_root: config.toolchain_root.clone(),
            wait_timeout: config.timeout,
            extra_args: config.extra_args.clone(),
        };
        let engine = launcher::launch(&spec).await?;
        let port = engine.port;
        *self.engine.lock().await = Some(engine);

        self.attach(AttachConfig {
            ip: DEFAULT_IP.to_owned(),
            port,
            project_root: config.project_root,
            toolchain_root: Some(config.toolchain_root),
        })
        .await
    }

    async fn pump_console(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConsoleEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ConsoleEvent::Connected => {}
                ConsoleEvent::Data { json, .. } => self.handle_engine_message(&json),
                ConsoleEvent::Disconnected { had_error } => {
                    self.handle_disconnected(had_error);
                    break;
                }
            }
        }
    }

    fn handle_engine_message(&self, json: &serde_json::Value) {
        match EngineMessage::classify(json) {
            EngineMessage::Halted {
                source,
                line,
                reason,
                error,
            } => self.handle_halted(&source, line, reason, error),
            EngineMessage::Callstack(frames) => self.handle_callstack(frames),
            EngineMessage::ExpandTable { node_index, table } => {
                self.expand.resolve(&node_index, table);
            }
            EngineMessage::RpcReply {
                request_id,
                ok,
                result,
            } => {
                if let Ok(rpc) = self.rpc_client() {
                    rpc.handle_reply(request_id, ok, result);
                }
            }
            EngineMessage::Log {
                level,
                system,
                message,
                lua_callstack,
            } => {
                let category = if level == "error" { "stderr" } else { "stdout" };
                let mut text = if system.is_empty() {
                    message
                } else {
                    format!("[{system}] {message}")
                };
                if let Some(stack) = lua_callstack {
                    text.push('\n');
                    text.push_str(&stack);
                }
                text.push('\n');
                self.emit(SessionEvent::Output {
                    category: category.to_owned(),
                    message: text,
                });
            }
            EngineMessage::Unrecognized => {
                tracing::trace!(?json, "unrecognized console payload");
            }
        }
    }

    fn handle_halted(&self, source: &str, line: u32, reason: Option<String>, error: Option<String>) {
        let resource = SourcePathResolver::resource_key(source).to_owned();
        let hit = {
            let mut inner = self.lock();
            inner.state = SessionState::Halted;
            inner.breakpoints.mark_hit(&resource, line)
        };

        let reason = match (&reason, &error, &hit) {
            (_, Some(_), _) => "exception".to_owned(),
            (Some(r), _, _) => r.clone(),
            (None, None, Some(_)) => "breakpoint".to_owned(),
            (None, None, None) => "step".to_owned(),
        };
        if let Some(bp) = hit {
            self.emit(SessionEvent::BreakpointChanged(bp));
        }
        if let Some(text) = &error {
            self.emit(SessionEvent::Output {
                category: "stderr".to_owned(),
                message: format!("{text}\n"),
            });
        }
        tracing::debug!(resource, line, reason, "halted");
        self.emit(SessionEvent::Stopped {
            reason,
            description: error,
        });
    }

    /// A new callstack replaces the cache and atomically invalidates
    /// every variable reference of the previous halt. In-flight
    /// expansions are cancelled so their callers fail instead of
    /// merging stale data.
    fn handle_callstack(&self, frames: Vec<EngineFrame>) {
        let mut inner = self.lock();
        inner.callstack = frames;
        inner.scope_refs.clear();
        inner.arena.invalidate_all();
        self.expand.cancel_all();
        if let Ok(rpc) = self.rpc_client() {
            rpc.cancel_all();
        }
    }

    fn handle_disconnected(&self, had_error: bool) {
        let was_live = {
            let mut inner = self.lock();
            let live = inner.state != SessionState::Disconnected;
            inner.state = SessionState::Disconnected;
            live
        };
        if was_live {
            tracing::info!(had_error, "console connection ended");
            self.emit(SessionEvent::Terminated);
            self.emit(SessionEvent::Exited {
                code: i32::from(had_error),
            });
        }
    }

    /// Replace the breakpoints of one file and push the union to the
    /// engine.
    ///
    /// The engine's `set_breakpoints` replaces its entire table, so the
    /// outgoing payload always carries every tracked file. Paths that
    /// resolve to no known root are accepted unverified.
    pub fn set_breakpoints(
        &self,
        file: &Path,
        lines: &[u32],
    ) -> Result<Vec<Breakpoint>, AdapterError> {
        let connection = self.conn()?;
        let (records, payload) = {
            let mut inner = self.lock();
            let (resource, verified) = match inner.resolver.resource_for_file(file) {
                Some(resource) => (resource, true),
                None => (file.to_string_lossy().replace('\\', "/"), false),
            };
            let records = inner.breakpoints.replace_resource(&resource, lines, verified);
            (records, inner.breakpoints.engine_payload())
        };
        connection.send_debugger_command(
            cmd::SET_BREAKPOINTS,
            Some(json!({ "breakpoints": payload })),
        )?;
        Ok(records)
    }

    /// Enable or disable halting on uncaught errors.
    pub fn set_break_on_error(&self, enabled: bool) -> Result<(), AdapterError> {
        self.conn()?
            .send_debugger_command(cmd::SET_BREAK_ON_ERROR, Some(json!({ "status": enabled })))?;
        Ok(())
    }

    fn flow(&self, command: &str) -> Result<(), AdapterError> {
        self.conn()?.send_debugger_command(command, None)?;
        Ok(())
    }

    pub fn pause(&self) -> Result<(), AdapterError> {
        self.flow(cmd::BREAK)
    }

    pub fn resume(&self) -> Result<(), AdapterError> {
        self.flow(cmd::CONTINUE)?;
        self.lock().state = SessionState::Running;
        Ok(())
    }

    pub fn step_over(&self) -> Result<(), AdapterError> {
        self.flow(cmd::STEP_OVER)
    }

    pub fn step_into(&self) -> Result<(), AdapterError> {
        self.flow(cmd::STEP_INTO)
    }

    pub fn step_out(&self) -> Result<(), AdapterError> {
        self.flow(cmd::STEP_OUT)
    }

    /// Restart the debuggee via the engine's reboot command.
    pub fn restart(&self) -> Result<(), AdapterError> {
        let _id = self.conn()?.send_command(cmd::REBOOT, Vec::new())?;
        Ok(())
    }

    /// The cached callstack of the current halt.
    pub fn stack_trace(&self) -> Result<Vec<SessionFrame>, AdapterError> {
        let inner = self.lock();
        if inner.callstack.is_empty() {
            return Err(AdapterError::NoCallstack);
        }
        Ok(inner
            .callstack
            .iter()
            .enumerate()
            .map(|(id, frame)| {
                let resource = SourcePathResolver::resource_key(&frame.source);
                let (name, subtle) = match &frame.function {
                    Some(function) => (function.clone(), false),
                    None => (format!("{resource}:{}", frame.line), true),
                };
                SessionFrame {
                    id,
                    name,
                    path: inner.resolver.file_for_resource(&frame.source),
                    line: frame.line,
                    subtle,
                }
            })
            .collect())
    }

    /// Locals and Upvalues pseudo-scopes for one frame, cached per halt.
    ///
    /// The record lists arrived with the callstack, so building the
    /// scope rows needs no engine round trip.
    pub fn scopes(&self, frame_id: usize) -> Result<Vec<Scope>, AdapterError> {
        let mut inner = self.lock();
        if frame_id >= inner.callstack.len() {
            return Err(AdapterError::NoCallstack);
        }
        let (locals_ref, upvalues_ref) = match inner.scope_refs.get(&frame_id) {
            Some(&refs) => refs,
            None => {
                let frame = inner.callstack[frame_id].clone();
                // table_path.level is the 0-based callstack index, top
                // frame first, the same index the front end uses.
                let context = ExpandContext::Frame { level: frame_id };
                let locals = inner.arena.materialize(&frame.local, &context);
                let locals_ref = inner.arena.alloc_resolved(locals);
                let upvalues = inner.arena.materialize(&frame.up_values, &context);
                let upvalues_ref = inner.arena.alloc_resolved(upvalues);
                inner.scope_refs.insert(frame_id, (locals_ref, upvalues_ref));
                (locals_ref, upvalues_ref)
            }
        };
        Ok(vec![
            Scope {
                name: "Locals".to_owned(),
                reference: locals_ref,
            },
            Scope {
                name: "Upvalues".to_owned(),
                reference: upvalues_ref,
            },
        ])
    }

    /// Children of one variable reference.
    ///
    /// Resolved nodes answer from cache. Unresolved nodes trigger
    /// exactly one fetch; concurrent callers for the same reference
    /// share it. A reference from a previous halt answers
    /// `UnknownReference`.
    pub async fn variables(&self, reference: i64) -> Result<Vec<Variable>, AdapterError> {
        let (decision, generation) = {
            let mut inner = self.lock();
            let generation = inner.arena.generation();
            (inner.arena.begin_fetch(reference), generation)
        };
        match decision {
            FetchDecision::Ready(children) => Ok(children),
            FetchDecision::Unknown => Err(AdapterError::UnknownReference(reference)),
            FetchDecision::Wait(rx) => rx
                .await
                .map_err(|_| AdapterError::Request("expansion abandoned".into()))?
                .map_err(AdapterError::Request),
            FetchDecision::Fetch(expansion) => {
                self.fetch_children(reference, generation, expansion).await
            }
        }
    }

    async fn fetch_children(
        &self,
        reference: i64,
        generation: u64,
        expansion: Expansion,
    ) -> Result<Vec<Variable>, AdapterError> {
        let result = match &expansion {
            Expansion::EngineTable {
                frame_level,
                local_name,
                path,
            } => {
                self.fetch_engine_table(*frame_level, local_name, path)
                    .await
            }
            Expansion::EvalChild { eval_id, path } => self.fetch_eval_child(*eval_id, path).await,
        };

        let mut inner = self.lock();
        if inner.arena.generation() != generation {
            // A new halt arrived while the fetch was in flight.
            return Err(AdapterError::UnknownReference(reference));
        }
        match result {
            Ok(records) => {
                let context = match expansion {
                    Expansion::EngineTable {
                        frame_level,
                        local_name,
                        path,
                    } => ExpandContext::Table {
                        level: frame_level,
                        local_name,
                        path,
                    },
                    Expansion::EvalChild { eval_id, path } => ExpandContext::Eval { eval_id, path },
                };
                let children = inner.arena.materialize(&records, &context);
                inner.arena.complete_fetch(reference, children.clone());
                Ok(children)
            }
            Err(err) => {
                inner.arena.fail_fetch(reference, &err.to_string());
                Err(err)
            }
        }
    }

    async fn fetch_engine_table(
        &self,
        frame_level: usize,
        local_name: &str,
        path: &[usize],
    ) -> Result<Vec<TableValue>, AdapterError> {
        let connection = self.conn()?;
        let node_index = self.next_node_index.fetch_add(1, Ordering::Relaxed);
        let rx = self.expand.register(node_index);
        connection.send_debugger_command(
            cmd::EXPAND_TABLE,
            Some(engine::expand_table_payload(
                node_index,
                frame_level,
                local_name,
                path,
            )),
        )?;
        match tokio::time::timeout(EXPAND_TIMEOUT, rx).await {
            Ok(Ok(table)) => Ok(table.into_values()),
            Ok(Err(_)) => Err(AdapterError::Request("expansion invalidated".into())),
            Err(_) => {
                self.expand.cancel(&node_index);
                Err(AdapterError::Request("expand_table timed out".into()))
            }
        }
    }

    async fn fetch_eval_child(
        &self,
        eval_id: u64,
        path: &[usize],
    ) -> Result<Vec<TableValue>, AdapterError> {
        let rpc = self.rpc_client()?;
        let reply = rpc
            .command("expand_eval", json!({ "id": eval_id, "path": path }))
            .await;
        if !reply.ok {
            return Err(AdapterError::Request(rpc_error_text(&reply.result)));
        }
        Ok(rpc_children(&reply.result))
    }

    /// Evaluate an expression in the debuggee.
    ///
    /// Hover expressions have `:` rewritten to `.` since method syntax
    /// is not a valid standalone expression. Failure semantics differ
    /// per context: repl failures surface as stderr plus an invalidated
    /// signal (side effects may have happened), watch failures become a
    /// fixed placeholder, hover failures are plain errors.
    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: usize,
        context: EvalContext,
    ) -> Result<EvalOutcome, AdapterError> {
        let rpc = self.rpc_client()?;
        let expression = match context {
            EvalContext::Hover => expression.replace(':', "."),
            _ => expression.to_owned(),
        };
        let reply = rpc
            .command(
                "eval",
                json!({ "expression": expression, "level": frame_id }),
            )
            .await;

        if !reply.ok {
            let error = rpc_error_text(&reply.result);
            return match context {
                EvalContext::Repl => {
                    self.emit(SessionEvent::Output {
                        category: "stderr".to_owned(),
                        message: format!("{error}\n"),
                    });
                    self.emit(SessionEvent::Invalidated);
                    Err(AdapterError::Request(error))
                }
                EvalContext::Watch => Ok(EvalOutcome {
                    value: WATCH_PLACEHOLDER.to_owned(),
                    type_tag: String::new(),
                    reference: 0,
                }),
                EvalContext::Hover => Err(AdapterError::Request(error)),
            };
        }

        let value = reply
            .result
            .get("value")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let type_tag = reply
            .result
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        // Functions are retained by the dispatcher too but have nothing
        // useful to expand, so only tables get a reference.
        let reference = match reply.result.get("eval_id").and_then(serde_json::Value::as_u64) {
            Some(eval_id) if type_tag == "table" => {
                self.lock().arena.alloc_unresolved(Expansion::EvalChild {
                    eval_id,
                    path: Vec::new(),
                })
            }
            _ => 0,
        };
        Ok(EvalOutcome {
            value,
            type_tag,
            reference,
        })
    }

    /// Completions for a bare dotted-identifier prefix.
    ///
    /// Anything else (operators, calls, literals) gets no completions;
    /// evaluating arbitrary text for completion could run side effects.
    pub async fn completions(
        &self,
        text: &str,
        column: usize,
        frame_id: usize,
    ) -> Result<Vec<CompletionItem>, AdapterError> {
        let Some((expr, _prefix)) = completion_target(text, column) else {
            return Ok(Vec::new());
        };
        let rpc = self.rpc_client()?;
        let reply = rpc
            .command(
                "eval",
                json!({ "expression": expr, "completion": true, "level": frame_id }),
            )
            .await;
        if !reply.ok {
            return Ok(Vec::new());
        }

        let mut items = Vec::new();
        for child in rpc_children_raw(&reply.result, "completions") {
            let Some(key) = child.get("key").and_then(serde_json::Value::as_str) else {
                continue;
            };
            if key == "(metatable)" {
                items.push(CompletionItem {
                    label: "(metatable)".to_owned(),
                    text: Some(format!("getmetatable({expr})")),
                    snippet: true,
                });
            } else if key.parse::<i64>().is_ok() {
                // Numeric keys cannot follow a dot; complete as [N].
                items.push(CompletionItem {
                    label: format!("[{key}]"),
                    text: Some(format!("[{key}]")),
                    snippet: false,
                });
            } else {
                items.push(CompletionItem {
                    label: key.to_owned(),
                    text: None,
                    snippet: false,
                });
            }
        }
        Ok(items)
    }

    /// Tear the session down.
    ///
    /// Breakpoints are cleared and the engine resumed first so a
    /// detaching debugger never leaves it halted. Idempotent.
    pub async fn disconnect(&self, terminate_debuggee: bool) {
        let connection = {
            let mut guard = self.connection.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(connection) = connection {
            self.lock().breakpoints.clear();
            let cleanup = connection
                .send_debugger_command(cmd::SET_BREAKPOINTS, Some(json!({ "breakpoints": {} })))
                .and_then(|()| connection.send_debugger_command(cmd::CONTINUE, None));
            if let Err(err) = cleanup {
                tracing::debug!(%err, "cleanup send failed during disconnect");
            }
            connection.close();
        }
        if terminate_debuggee {
            if let Some(mut engine) = self.engine.lock().await.take() {
                engine.kill_tree().await;
            }
        }
        self.lock().state = SessionState::Disconnected;
    }
}

fn rpc_error_text(result: &serde_json::Value) -> String {
    result
        .get("error")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("engine request failed")
        .to_owned()
}

fn rpc_children_raw<'a>(
    result: &'a serde_json::Value,
    key: &str,
) -> impl Iterator<Item = &'a serde_json::Value> {
    result
        .get(key)
        .and_then(serde_json::Value::as_array)
        .map(|v| v.as_slice())
        .unwrap_or(&[])
        .iter()
}

fn rpc_children(result: &serde_json::Value) -> Vec<TableValue> {
    rpc_children_raw(result, "children")
        .filter_map(|child| {
            Some(TableValue {
                var_name: None,
                key: Some(child.get("key")?.as_str()?.to_owned()),
                value_type: child
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                value: child
                    .get("value")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            })
        })
        .collect()
}

/// Split the text before `column` (1-based) into a dotted-identifier
/// expression and the partial key after its final dot.
fn completion_target(text: &str, column: usize) -> Option<(String, String)> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)*)\.(\w*)$").expect("completion regex is valid")
    });

    let chars = column.saturating_sub(1);
    let cut = text
        .char_indices()
        .nth(chars)
        .map_or(text.len(), |(i, _)| i);
    let head = &text[..cut];

    let captures = pattern.captures(head)?;
    let start = captures.get(1)?.start();
    // Reject anything that makes this more than a bare identifier chain.
    if head[..start]
        .chars()
        .next_back()
        .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.' || c == ':')
    {
        return None;
    }
    Some((captures[1].to_owned(), captures[2].to_owned()))
}
