//! End-to-end session tests against a stub engine console server
//! speaking the real framed wire protocol over TCP.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use glint_adapter::session::{AttachConfig, DebugSession, EvalContext, SessionEvent};
use glint_adapter::AdapterError;
use glint_console::frame::encode_json;
use glint_console::FrameDecoder;

type Behavior = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

/// Serve one connection; every received JSON payload goes into the
/// returned log, replies come from the behavior closure.
async fn stub_engine(mut behavior: Behavior) -> (u16, Arc<Mutex<Vec<Value>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&received);
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 8192];
        // A peer that hangs up right after a burst of frames can break
        // the reply pipe with frames still in the decoder; keep
        // decoding and logging them, only stop writing.
        let mut writable = true;
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            decoder.extend(&buf[..n]);
            while let Ok(Some(message)) = decoder.next_message() {
                log.lock().unwrap().push(message.json.clone());
                for reply in behavior(&message.json) {
                    if writable && socket.write_all(&encode_json(&reply)).await.is_err() {
                        writable = false;
                    }
                }
            }
        }
    });
    (port, received)
}

fn debugger_command(json: &Value) -> Option<&str> {
    if json.get("type")?.as_str()? != "lua_debugger" {
        return None;
    }
    json.get("command")?.as_str()
}

fn halted_at(source: &str, line: u32) -> Value {
    json!({
        "type": "lua_debugger",
        "message": "halted",
        "source": source,
        "line": line,
    })
}

fn one_frame_callstack() -> Value {
    json!({
        "type": "lua_debugger",
        "message": "callstack",
        "stack": [{
            "function": "update",
            "source": "scripts/foo.lua",
            "line": 10,
            "local": [
                { "var_name": "hp", "type": "number", "value": "100" },
                { "var_name": "inventory", "type": "table", "value": "table: 0x1" },
            ],
            "up_values": [],
        }]
    })
}

fn inventory_children(node_index: u64) -> Value {
    json!({
        "type": "lua_debugger",
        "node_index": node_index,
        "table": [
            { "key": "sword", "type": "string", "value": "iron" },
            { "key": "gold", "type": "number", "value": "25" },
            { "key": "potions", "type": "number", "value": "3" },
        ]
    })
}

/// Behavior shared by most tests: report_status and continue both lead
/// to a halt with one frame; expand_table answers three children.
fn standard_behavior() -> Behavior {
    Box::new(|json| match debugger_command(json) {
        Some("report_status") | Some("continue") => {
            vec![halted_at("scripts/foo.lua", 10), one_frame_callstack()]
        }
        Some("expand_table") => {
            let node_index = json["node_index"].as_u64().unwrap();
            vec![inventory_children(node_index)]
        }
        _ => Vec::new(),
    })
}

async fn attach_to(port: u16) -> (Arc<DebugSession>, mpsc::UnboundedReceiver<SessionEvent>) {
    let (session, events) = DebugSession::new();
    session
        .attach(AttachConfig {
            ip: "127.0.0.1".into(),
            port,
            project_root: "/proj".into(),
            toolchain_root: None,
        })
        .await
        .unwrap();
    (session, events)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

async fn wait_for_callstack(session: &DebugSession) {
    for _ in 0..100 {
        if session.stack_trace().is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no callstack arrived");
}

fn count_commands(log: &Arc<Mutex<Vec<Value>>>, command: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|json| debugger_command(json) == Some(command))
        .count()
}

#[tokio::test]
async fn scenario_attach_inspect_lazy_expand() {
    let (port, log) = stub_engine(standard_behavior()).await;
    let (session, mut events) = attach_to(port).await;

    assert_eq!(next_event(&mut events).await, SessionEvent::Initialized);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Stopped { .. }
    ));
    wait_for_callstack(&session).await;

    let frames = session.stack_trace().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].name, "update");
    assert_eq!(frames[0].line, 10);
    assert!(!frames[0].subtle);

    let scopes = session.scopes(0).unwrap();
    assert_eq!(scopes.len(), 2);
    assert_eq!(scopes[0].name, "Locals");
    assert_eq!(scopes[1].name, "Upvalues");

    // Locals come straight from the cached callstack, no engine fetch.
    let locals = session.variables(scopes[0].reference).await.unwrap();
    assert_eq!(locals.len(), 2);
    assert_eq!(locals[0].name, "hp");
    assert_eq!(locals[1].name, "inventory");
    assert_eq!(locals[1].value, "{table}");
    assert!(locals[1].reference != 0);
    assert_eq!(count_commands(&log, "expand_table"), 0);

    // Expanding the table is exactly one round trip, addressed by the
    // 0-based callstack index of the owning frame.
    let children = session.variables(locals[1].reference).await.unwrap();
    assert_eq!(children.len(), 3);
    assert_eq!(count_commands(&log, "expand_table"), 1);
    let expand = log
        .lock()
        .unwrap()
        .iter()
        .find(|j| debugger_command(j) == Some("expand_table"))
        .cloned()
        .unwrap();
    assert_eq!(expand["table_path"]["level"], 0);
    assert_eq!(expand["table_path"]["local"], "inventory");

    // And a second request answers from cache.
    let again = session.variables(locals[1].reference).await.unwrap();
    assert_eq!(again, children);
    assert_eq!(count_commands(&log, "expand_table"), 1);
}

#[tokio::test]
async fn scenario_concurrent_expansion_coalesces() {
    let (port, log) = stub_engine(standard_behavior()).await;
    let (session, mut events) = attach_to(port).await;
    next_event(&mut events).await;
    wait_for_callstack(&session).await;

    let scopes = session.scopes(0).unwrap();
    let locals = session.variables(scopes[0].reference).await.unwrap();
    let table_ref = locals[1].reference;

    let (a, b) = tokio::join!(session.variables(table_ref), session.variables(table_ref));
    assert_eq!(a.unwrap().len(), 3);
    assert_eq!(b.unwrap().len(), 3);
    assert_eq!(count_commands(&log, "expand_table"), 1);
}

#[tokio::test]
async fn scenario_new_callstack_invalidates_references() {
    let (port, _log) = stub_engine(standard_behavior()).await;
    let (session, mut events) = attach_to(port).await;
    assert_eq!(next_event(&mut events).await, SessionEvent::Initialized);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Stopped { .. }
    ));
    wait_for_callstack(&session).await;

    let scopes = session.scopes(0).unwrap();
    let locals_ref = scopes[0].reference;
    assert!(session.variables(locals_ref).await.is_ok());

    // The stub halts again on continue, delivering a fresh callstack.
    session.resume().unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Stopped { .. }
    ));

    // Poll until the new callstack has displaced the old references.
    let mut invalidated = false;
    for _ in 0..100 {
        if matches!(
            session.variables(locals_ref).await,
            Err(AdapterError::UnknownReference(_))
        ) {
            invalidated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(invalidated, "old reference survived the new callstack");

    // The new halt hands out fresh, working references.
    let scopes = session.scopes(0).unwrap();
    assert_ne!(scopes[0].reference, locals_ref);
    assert!(session.variables(scopes[0].reference).await.is_ok());
}

#[tokio::test]
async fn scenario_breakpoint_payload_is_the_union() {
    let (port, log) = stub_engine(Box::new(|_| Vec::new())).await;
    let (session, _events) = attach_to(port).await;

    let records = session
        .set_breakpoints(std::path::Path::new("/proj/scripts/foo.lua"), &[10, 20])
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|bp| bp.verified));

    session
        .set_breakpoints(std::path::Path::new("/proj/other.lua"), &[5])
        .unwrap();

    // A path outside every root is accepted unverified.
    let outside = session
        .set_breakpoints(std::path::Path::new("/elsewhere/x.lua"), &[1])
        .unwrap();
    assert!(!outside[0].verified);

    // Give the writer task a moment to flush.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = log.lock().unwrap();
    let payloads: Vec<&Value> = sent
        .iter()
        .filter(|json| debugger_command(json) == Some("set_breakpoints"))
        .collect();
    assert_eq!(payloads.len(), 3);
    assert_eq!(
        payloads[0]["breakpoints"],
        json!({ "scripts/foo.lua": [10, 20] })
    );
    // File A's breakpoints survive every later send.
    assert_eq!(
        payloads[1]["breakpoints"],
        json!({ "other.lua": [5], "scripts/foo.lua": [10, 20] })
    );
    assert_eq!(payloads[2]["breakpoints"]["scripts/foo.lua"], json!([10, 20]));
}

#[tokio::test]
async fn scenario_halt_verifies_breakpoint_and_stops() {
    let halt = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let trigger = Arc::clone(&halt);
    let behavior: Behavior = Box::new(move |json| match debugger_command(json) {
        Some("continue") if trigger.load(std::sync::atomic::Ordering::SeqCst) => {
            vec![halted_at("scripts/foo.lua", 10), one_frame_callstack()]
        }
        _ => Vec::new(),
    });
    let (port, _log) = stub_engine(behavior).await;
    let (session, mut events) = attach_to(port).await;
    assert_eq!(next_event(&mut events).await, SessionEvent::Initialized);

    let records = session
        .set_breakpoints(std::path::Path::new("/proj/scripts/foo.lua"), &[10])
        .unwrap();
    assert!(records[0].verified);

    halt.store(true, std::sync::atomic::Ordering::SeqCst);
    session.resume().unwrap();

    let SessionEvent::BreakpointChanged(bp) = next_event(&mut events).await else {
        panic!("expected a breakpoint event first");
    };
    assert_eq!(bp.line, 10);
    assert!(bp.verified);

    let SessionEvent::Stopped { reason, .. } = next_event(&mut events).await else {
        panic!("expected a stopped event");
    };
    assert_eq!(reason, "breakpoint");
}

#[tokio::test]
async fn scenario_evaluate_over_injected_rpc() {
    let behavior: Behavior = Box::new(|json| {
        if json.get("type").and_then(Value::as_str) != Some("script") {
            return Vec::new();
        }
        let script = json["script"].as_str().unwrap();
        // The first script is the dispatcher installation.
        let Some(start) = script.find("[[[requestId]]] = ") else {
            return Vec::new();
        };
        let request_id: u64 = script[start + 18..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .unwrap();
        vec![json!({
            "type": "glint_debug_adapter",
            "requestId": request_id,
            "ok": true,
            "result": { "value": "42", "type": "number" },
        })]
    });
    let (port, _log) = stub_engine(behavior).await;
    let (session, _events) = attach_to(port).await;

    let outcome = session
        .evaluate("Game.answer", 0, EvalContext::Watch)
        .await
        .unwrap();
    assert_eq!(outcome.value, "42");
    assert_eq!(outcome.type_tag, "number");
    assert_eq!(outcome.reference, 0);
}

#[tokio::test]
async fn scenario_disconnect_resumes_and_clears() {
    let (port, log) = stub_engine(standard_behavior()).await;
    let (session, _events) = attach_to(port).await;
    session
        .set_breakpoints(std::path::Path::new("/proj/scripts/foo.lua"), &[10])
        .unwrap();

    session.disconnect(false).await;
    // Idempotent.
    session.disconnect(false).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = log.lock().unwrap();
    let cleared = sent
        .iter()
        .any(|j| debugger_command(j) == Some("set_breakpoints") && j["breakpoints"] == json!({}));
    assert!(cleared, "breakpoints were not cleared on disconnect");
    assert_eq!(
        sent.iter()
            .filter(|j| debugger_command(j) == Some("continue"))
            .count(),
        1
    );
}
