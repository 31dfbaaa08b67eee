//! Injected RPC channel.
//!
//! The engine's native debugger vocabulary has no generic id-matched
//! replies, so the session bootstraps one: a small dispatcher is
//! installed into the debuggee VM over the script-injection channel,
//! once per debuggee, and from then on `command` sends an id-tagged
//! request and awaits the dispatcher's `glint_debug_adapter` reply on
//! the ordinary data stream. Requests fail closed on a short timeout
//! instead of hanging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OnceCell;

use glint_console::{Connection, Correlator};

/// Default reply timeout. Generous for a local VM, short enough that a
/// dead debuggee degrades to inline errors rather than a hung client.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Lua helpers and the request dispatcher, installed once per debuggee.
/// The `if not` guard makes re-injection a no-op in the VM.
const DISPATCHER_LUA: &str = r#"
if not GlintDebugAdapter then
    GlintDebugAdapter = { eval_results = {}, next_eval_id = 1 }

    local function to_console_string(x)
        if type(x) == 'table' then
            return string.format('%s', x)
        elseif type(x) == 'function' then
            local info = debug.getinfo(x)
            if info.what == 'C' then
                return 'C function'
            else
                return 'Lua function, ' .. info.short_src .. ':' .. info.linedefined
            end
        else
            return tostring(x)
        end
    end

    local function reply(req, ok, result)
        Application.console_send({
            type = 'glint_debug_adapter',
            requestId = req.requestId,
            requestType = req.requestType,
            ok = ok,
            result = result,
        })
    end

    local function retain(value)
        if type(value) ~= 'table' and type(value) ~= 'function' then
            return nil
        end
        local id = GlintDebugAdapter.next_eval_id
        GlintDebugAdapter.next_eval_id = id + 1
        GlintDebugAdapter.eval_results[id] = value
        return id
    end

    local function child_at(value, path)
        for _, index in ipairs(path or {}) do
            local i = 1
            local found = nil
            for k, v in pairs(value) do
                if i == index then found = v break end
                i = i + 1
            end
            if found == nil then return nil end
            value = found
        end
        return value
    end

    local function children_of(value)
        local out = {}
        for k, v in pairs(value) do
            out[#out + 1] = {
                key = tostring(k),
                type = type(v),
                value = to_console_string(v),
            }
        end
        local mt = getmetatable(value)
        if mt then
            out[#out + 1] = { key = '(metatable)', type = 'table', value = to_console_string(mt) }
        end
        return out
    end

    local handlers = {}

    handlers.eval = function(req)
        local chunk = loadstring(req.expression)
        if chunk == nil then
            chunk = loadstring('return ' .. req.expression)
        end
        if chunk == nil then
            return reply(req, false, { error = 'invalid expression' })
        end
        local ok, result = pcall(chunk)
        if not ok then
            return reply(req, false, { error = tostring(result) })
        end
        if req.completion then
            if type(result) ~= 'table' then
                return reply(req, true, { completions = {} })
            end
            return reply(req, true, { completions = children_of(result) })
        end
        reply(req, true, {
            value = to_console_string(result),
            type = type(result),
            eval_id = retain(result),
        })
    end

    handlers.expand_eval = function(req)
        local root = GlintDebugAdapter.eval_results[req.id]
        if root == nil then
            return reply(req, false, { error = 'unknown eval id' })
        end
        local value = child_at(root, req.path)
        if type(value) ~= 'table' then
            return reply(req, true, { children = {} })
        end
        reply(req, true, { children = children_of(value) })
    end

    function GlintDebugAdapter.dispatch(req)
        local handler = handlers[req.requestType]
        if handler == nil then
            return reply(req, false, { error = 'unknown request type' })
        end
        handler(req)
    end
end
"#;

/// Reply of one injected-RPC request. A timeout or a dead connection is
/// an `ok = false` reply, never an error or a hang.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    /// Whether the dispatcher executed the request.
    pub ok: bool,
    /// Request-type-specific payload.
    pub result: Value,
}

impl RpcReply {
    fn failed(message: &str) -> Self {
        Self {
            ok: false,
            result: serde_json::json!({ "error": message }),
        }
    }
}

/// Client side of the injected RPC channel.
#[derive(Debug)]
pub struct RpcClient {
    connection: Arc<Connection>,
    correlator: Correlator<u64, RpcReply>,
    next_id: AtomicU64,
    injected: OnceCell<()>,
    timeout: Duration,
}

impl RpcClient {
    /// Create a client for one console connection.
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            correlator: Correlator::new(),
            next_id: AtomicU64::new(1),
            injected: OnceCell::new(),
            timeout: RPC_TIMEOUT,
        }
    }

    /// Override the reply timeout (tests).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Route an incoming dispatcher reply. Unknown or already resolved
    /// ids are dropped.
    pub fn handle_reply(&self, request_id: u64, ok: bool, result: Value) {
        self.correlator.resolve(&request_id, RpcReply { ok, result });
    }

    /// Drop every in-flight request.
    pub fn cancel_all(&self) {
        self.correlator.cancel_all();
    }

    /// Send one request through the dispatcher and await its reply.
    ///
    /// `args` must be a JSON object; `requestType` and `requestId` are
    /// added to it. Installation of the dispatcher is single-flight:
    /// concurrent first callers share one injection.
    pub async fn command(&self, request_type: &str, args: Value) -> RpcReply {
        let inject_ok = self
            .injected
            .get_or_try_init(|| async { self.connection.send_lua(DISPATCHER_LUA) })
            .await
            .is_ok();
        if !inject_ok {
            return RpcReply::failed("dispatcher injection failed");
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut envelope = match args {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                tracing::warn!(?other, "rpc args must be an object");
                return RpcReply::failed("malformed request arguments");
            }
        };
        envelope.insert("requestType".into(), request_type.into());
        envelope.insert("requestId".into(), request_id.into());

        let script = format!(
            "GlintDebugAdapter.dispatch({})",
            lua_literal(&Value::Object(envelope))
        );

        let rx = self.correlator.register(request_id);
        if let Err(err) = self.connection.send_lua(&script) {
            self.correlator.cancel(&request_id);
            return RpcReply::failed(&err.to_string());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => RpcReply::failed("request invalidated"),
            Err(_) => {
                self.correlator.cancel(&request_id);
                tracing::debug!(request_type, request_id, "rpc request timed out");
                RpcReply::failed("request timed out")
            }
        }
    }
}

/// Render a JSON value as a Lua table literal.
///
/// Strings use long-bracket quoting so arbitrary user expressions
/// survive without an escaping pass; the bracket level is raised past
/// any closer contained in the string.
pub fn lua_literal(value: &Value) -> String {
    match value {
        Value::Null => "nil".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => lua_string(s),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(lua_literal).collect();
            format!("{{{}}}", parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("[{}] = {}", lua_string(k), lua_literal(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

fn lua_string(s: &str) -> String {
    let mut level = 0usize;
    // A trailing ']' only forms an early terminator against the
    // zero-level ']]' closer.
    while s.contains(&format!("]{}]", "=".repeat(level))) || (level == 0 && s.ends_with(']')) {
        level += 1;
    }
    let eq = "=".repeat(level);
    format!("[{eq}[{s}]{eq}]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rpc_lua_literal_scalars() {
        assert_eq!(lua_literal(&json!(null)), "nil");
        assert_eq!(lua_literal(&json!(true)), "true");
        assert_eq!(lua_literal(&json!(42)), "42");
        assert_eq!(lua_literal(&json!(1.5)), "1.5");
        assert_eq!(lua_literal(&json!("hi")), "[[hi]]");
    }

    #[test]
    fn rpc_lua_literal_structures() {
        assert_eq!(lua_literal(&json!([1, 2])), "{1, 2}");
        let obj = lua_literal(&json!({"level": 2, "path": [1, 3]}));
        assert!(obj.contains("[[[level]]] = 2"));
        assert!(obj.contains("[[[path]]] = {1, 3}"));
        assert!(obj.starts_with('{') && obj.ends_with('}'));
    }

    #[test]
    fn rpc_lua_string_escapes_closer() {
        let tricky = "x[1] = a[[b]]";
        let quoted = lua_string(tricky);
        assert!(quoted.starts_with("[=") || quoted.starts_with("[["));
        // The quoted form must not terminate early.
        let eq_level = quoted.chars().skip(1).take_while(|&c| c == '=').count();
        let closer = format!("]{}]", "=".repeat(eq_level));
        assert!(!tricky.contains(&closer));
    }

    #[test]
    fn rpc_dispatcher_guarded_for_reinjection() {
        assert!(DISPATCHER_LUA.trim_start().starts_with("if not GlintDebugAdapter"));
        assert!(DISPATCHER_LUA.contains("glint_debug_adapter"));
    }
}
