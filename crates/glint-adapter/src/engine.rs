//! Engine-side message model.
//!
//! The console stream carries dynamically shaped JSON; everything the
//! session reacts to is classified into one tagged union here, with an
//! explicit `Unrecognized` variant instead of duck-typed field probing
//! at the call sites.

use serde::Deserialize;
use serde_json::Value;

/// Native debugger command names understood by the engine.
pub mod cmd {
    pub const REPORT_STATUS: &str = "report_status";
    pub const BREAK: &str = "break";
    pub const CONTINUE: &str = "continue";
    pub const STEP_OVER: &str = "step_over";
    pub const STEP_INTO: &str = "step_into";
    pub const STEP_OUT: &str = "step_out";
    pub const SET_BREAKPOINTS: &str = "set_breakpoints";
    pub const SET_BREAK_ON_ERROR: &str = "set_break_on_error";
    pub const EXPAND_TABLE: &str = "expand_table";
    pub const REBOOT: &str = "reboot";
}

/// Envelope `type` of replies produced by the injected RPC dispatcher.
pub const RPC_REPLY_TYPE: &str = "glint_debug_adapter";

/// One local or upvalue record as the engine reports it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableValue {
    /// Variable name (stack records).
    #[serde(default)]
    pub var_name: Option<String>,
    /// Table key (expansion records).
    #[serde(default)]
    pub key: Option<String>,
    /// Engine type tag: nil/boolean/number/string/table/function/userdata.
    #[serde(rename = "type", default)]
    pub value_type: String,
    /// Stringified value.
    #[serde(default)]
    pub value: String,
}

impl TableValue {
    /// The display name: `var_name` for stack records, `key` for table
    /// entries.
    pub fn name(&self) -> &str {
        self.var_name
            .as_deref()
            .or(self.key.as_deref())
            .unwrap_or("")
    }

    /// Whether this record denotes a further-expandable table.
    pub fn is_table(&self) -> bool {
        self.value_type == "table"
    }
}

/// One frame of an engine callstack notification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineFrame {
    /// Function name; absent for top-level chunks and native frames.
    #[serde(default)]
    pub function: Option<String>,
    /// Engine source string (`@`-prefixed when mapped).
    pub source: String,
    /// 1-based line number.
    pub line: u32,
    /// Ordered local variable records.
    #[serde(default)]
    pub local: Vec<TableValue>,
    /// Ordered upvalue records.
    #[serde(default)]
    pub up_values: Vec<TableValue>,
}

/// Reply payload of an `expand_table` push: either no children or a
/// list of child records.
#[derive(Debug, Clone, PartialEq)]
pub enum TableReply {
    /// The table has no children (engine sends the string `"nil"`).
    Nil,
    /// Child records, in engine order.
    Values(Vec<TableValue>),
}

impl TableReply {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(items) => TableReply::Values(
                items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect(),
            ),
            _ => TableReply::Nil,
        }
    }

    /// Children of this reply, empty for `Nil`.
    pub fn into_values(self) -> Vec<TableValue> {
        match self {
            TableReply::Nil => Vec::new(),
            TableReply::Values(values) => values,
        }
    }
}

/// Everything the session can receive from the engine, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// The script VM halted.
    Halted {
        /// Engine source string of the halt location.
        source: String,
        /// 1-based line.
        line: u32,
        /// Halt reason if the engine gave one (`breakpoint`, `step`, ...).
        reason: Option<String>,
        /// Error text when halting on an uncaught error.
        error: Option<String>,
    },
    /// A full callstack, sent after every halt.
    Callstack(Vec<EngineFrame>),
    /// Reply to an `expand_table` request, matched by node index.
    ExpandTable {
        /// The node index echoed from the request.
        node_index: u64,
        /// The expansion result.
        table: TableReply,
    },
    /// Reply from the injected RPC dispatcher, matched by request id.
    RpcReply {
        /// The request id echoed from the request.
        request_id: u64,
        /// Whether the dispatcher executed the request successfully.
        ok: bool,
        /// Request-type-specific result payload.
        result: Value,
    },
    /// An engine log line (`type: "message"`).
    Log {
        /// Log level string (info/warning/error).
        level: String,
        /// Originating engine system.
        system: String,
        /// The log text.
        message: String,
        /// Script callstack attached to Lua error logs.
        lua_callstack: Option<String>,
    },
    /// Anything we do not understand. Logged and ignored, never fatal.
    Unrecognized,
}

impl EngineMessage {
    /// Classify a decoded console payload.
    pub fn classify(json: &Value) -> EngineMessage {
        match json.get("type").and_then(Value::as_str) {
            Some("lua_debugger") => Self::classify_debugger(json),
            Some(RPC_REPLY_TYPE) => Self::classify_rpc_reply(json),
            Some("message") => EngineMessage::Log {
                level: str_field(json, "level"),
                system: str_field(json, "system"),
                message: str_field(json, "message"),
                lua_callstack: json
                    .get("lua_callstack")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            },
            _ => EngineMessage::Unrecognized,
        }
    }

    fn classify_debugger(json: &Value) -> EngineMessage {
        if let Some(node_index) = json.get("node_index").and_then(Value::as_u64) {
            let table = json
                .get("table")
                .map(TableReply::from_value)
                .unwrap_or(TableReply::Nil);
            return EngineMessage::ExpandTable { node_index, table };
        }
        match json.get("message").and_then(Value::as_str) {
            Some("halted") => {
                let (Some(source), Some(line)) = (
                    json.get("source").and_then(Value::as_str),
                    json.get("line").and_then(Value::as_u64),
                ) else {
                    return EngineMessage::Unrecognized;
                };
                EngineMessage::Halted {
                    source: source.to_owned(),
                    line: line as u32,
                    reason: json
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    error: json
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                }
            }
            Some("callstack") => {
                let frames = json
                    .get("stack")
                    .and_then(Value::as_array)
                    .map(|stack| {
                        stack
                            .iter()
                            .filter_map(|f| serde_json::from_value(f.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                EngineMessage::Callstack(frames)
            }
            _ => EngineMessage::Unrecognized,
        }
    }

    fn classify_rpc_reply(json: &Value) -> EngineMessage {
        let Some(request_id) = json.get("requestId").and_then(Value::as_u64) else {
            return EngineMessage::Unrecognized;
        };
        EngineMessage::RpcReply {
            request_id,
            ok: json.get("ok").and_then(Value::as_bool).unwrap_or(false),
            result: json.get("result").cloned().unwrap_or(Value::Null),
        }
    }
}

fn str_field(json: &Value, key: &str) -> String {
    json.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

/// Build the data payload for an `expand_table` request.
///
/// `frame_level` is the 0-based callstack index (0 = innermost frame),
/// matching the order frames arrive in the callstack message. `path`
/// is the 1-based child-index chain from the originating local or
/// upvalue down to the table being expanded.
pub fn expand_table_payload(
    node_index: u64,
    frame_level: usize,
    local_name: &str,
    path: &[usize],
) -> Value {
    serde_json::json!({
        "node_index": node_index,
        "local_num": 0,
        "table_path": {
            "level": frame_level,
            "local": local_name,
            "path": path,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn engine_classify_halted() {
        let msg = EngineMessage::classify(&json!({
            "type": "lua_debugger",
            "message": "halted",
            "source": "@core/boot.lua",
            "line": 17,
            "reason": "breakpoint",
        }));
        assert_eq!(
            msg,
            EngineMessage::Halted {
                source: "@core/boot.lua".into(),
                line: 17,
                reason: Some("breakpoint".into()),
                error: None,
            }
        );
    }

    #[test]
    fn engine_classify_callstack() {
        let msg = EngineMessage::classify(&json!({
            "type": "lua_debugger",
            "message": "callstack",
            "stack": [{
                "function": "update",
                "source": "scripts/game.lua",
                "line": 42,
                "local": [
                    {"var_name": "dt", "type": "number", "value": "0.016"},
                ],
                "up_values": [],
            }],
        }));
        let EngineMessage::Callstack(frames) = msg else {
            panic!("expected callstack");
        };
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function.as_deref(), Some("update"));
        assert_eq!(frames[0].local[0].name(), "dt");
        assert!(!frames[0].local[0].is_table());
    }

    #[test]
    fn engine_classify_expand_table() {
        let msg = EngineMessage::classify(&json!({
            "type": "lua_debugger",
            "node_index": 3,
            "table": [
                {"key": "x", "type": "number", "value": "1"},
                {"key": "y", "type": "table", "value": "{...}"},
            ],
        }));
        let EngineMessage::ExpandTable { node_index, table } = msg else {
            panic!("expected expand_table");
        };
        assert_eq!(node_index, 3);
        let values = table.into_values();
        assert_eq!(values.len(), 2);
        assert!(values[1].is_table());
    }

    #[test]
    fn engine_classify_expand_table_nil() {
        let msg = EngineMessage::classify(&json!({
            "type": "lua_debugger",
            "node_index": 9,
            "table": "nil",
        }));
        assert_eq!(
            msg,
            EngineMessage::ExpandTable {
                node_index: 9,
                table: TableReply::Nil,
            }
        );
    }

    #[test]
    fn engine_classify_rpc_reply() {
        let msg = EngineMessage::classify(&json!({
            "type": "glint_debug_adapter",
            "requestId": 12,
            "requestType": "eval",
            "ok": true,
            "result": {"value": "42", "type": "number"},
        }));
        assert_eq!(
            msg,
            EngineMessage::RpcReply {
                request_id: 12,
                ok: true,
                result: json!({"value": "42", "type": "number"}),
            }
        );
    }

    #[test]
    fn engine_classify_log() {
        let msg = EngineMessage::classify(&json!({
            "type": "message",
            "level": "error",
            "system": "Lua",
            "message": "boom",
            "message_type": "lua_error",
            "lua_callstack": "scripts/game.lua:10",
        }));
        let EngineMessage::Log { level, lua_callstack, .. } = msg else {
            panic!("expected log");
        };
        assert_eq!(level, "error");
        assert_eq!(lua_callstack.as_deref(), Some("scripts/game.lua:10"));
    }

    #[test]
    fn engine_classify_unrecognized() {
        assert_eq!(
            EngineMessage::classify(&json!({"type": "telemetry"})),
            EngineMessage::Unrecognized
        );
        assert_eq!(
            EngineMessage::classify(&json!({"type": "lua_debugger", "message": "???"})),
            EngineMessage::Unrecognized
        );
        assert_eq!(EngineMessage::classify(&json!(42)), EngineMessage::Unrecognized);
        // An RPC reply without a request id cannot be routed.
        assert_eq!(
            EngineMessage::classify(&json!({"type": "glint_debug_adapter", "ok": true})),
            EngineMessage::Unrecognized
        );
    }

    #[test]
    fn engine_expand_table_payload_shape() {
        let payload = expand_table_payload(5, 1, "player", &[2, 7]);
        assert_eq!(
            payload,
            json!({
                "node_index": 5,
                "local_num": 0,
                "table_path": {"level": 1, "local": "player", "path": [2, 7]},
            })
        );
    }
}
