//! DAP request dispatch loop.
//!
//! One session per server run. Requests are handled sequentially in
//! arrival order; session events are forwarded as DAP events between
//! requests. A transport error terminates the session (terminated +
//! exited), it is never retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use glint_adapter::{
    AttachConfig, Build, DebugSession, EvalContext, LaunchConfig, SessionEvent,
};

use crate::protocol::{
    self, AttachArguments, Capabilities, CompletionsArguments, DisconnectArguments,
    EvaluateArguments, LaunchArguments, Request, Response, ScopesArguments,
    SetBreakpointsArguments, SetExceptionBreakpointsArguments, VariablesArguments,
};
use crate::transport::{self, TransportError};

/// The single synthetic thread presented for the script VM.
const THREAD_ID: i64 = 1;

/// Default `--wait-for-debugger` timeout for launches.
const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve one DAP session over the given byte streams.
pub async fn run<R, W>(reader: R, writer: W) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    // Requests are pulled on a dedicated task; select over plain
    // channels stays lossless when the other branch wins.
    let (request_tx, mut requests) = mpsc::channel::<Result<serde_json::Value, TransportError>>(16);
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            match transport::read_message(&mut reader).await {
                Ok(Some(value)) => {
                    if request_tx.send(Ok(value)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = request_tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });

    let (session, mut events) = DebugSession::new();
    let mut server = Server {
        writer,
        seq: 0,
        session,
    };

    loop {
        tokio::select! {
            message = requests.recv() => match message {
                Some(Ok(value)) => {
                    let request: Request = match serde_json::from_value(value) {
                        Ok(request) => request,
                        Err(err) => {
                            tracing::warn!(%err, "non-request message dropped");
                            continue;
                        }
                    };
                    let done = request.command == "disconnect";
                    server.handle_request(&request).await?;
                    if done {
                        break;
                    }
                }
                None => {
                    tracing::info!("front end closed the stream");
                    server.session.disconnect(false).await;
                    break;
                }
                Some(Err(err)) => {
                    tracing::error!(%err, "transport failure");
                    server.send_event("terminated", None).await?;
                    server
                        .send_event(
                            "exited",
                            Some(json!(protocol::ExitedEventBody { exit_code: 1 })),
                        )
                        .await?;
                    server.session.disconnect(false).await;
                    return Err(err);
                }
            },
            event = events.recv() => match event {
                Some(event) => server.forward_event(event).await?,
                None => break,
            },
        }
    }

    // Drain events the session produced while shutting down.
    while let Ok(event) = events.try_recv() {
        server.forward_event(event).await?;
    }
    Ok(())
}

struct Server<W> {
    writer: W,
    seq: i64,
    session: Arc<DebugSession>,
}

impl<W: AsyncWrite + Unpin> Server<W> {
    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    async fn write(&mut self, value: &serde_json::Value) -> Result<(), TransportError> {
        self.writer.write_all(&transport::encode_message(value)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_event(
        &mut self,
        event: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), TransportError> {
        let event = protocol::Event::new(self.next_seq(), event, body);
        self.write(&serde_json::to_value(&event)?).await
    }

    async fn forward_event(&mut self, event: SessionEvent) -> Result<(), TransportError> {
        match event {
            SessionEvent::Initialized => self.send_event("initialized", None).await,
            SessionEvent::Stopped {
                reason,
                description,
            } => {
                self.send_event(
                    "stopped",
                    Some(json!(protocol::StoppedEventBody {
                        reason,
                        description,
                        thread_id: THREAD_ID,
                        all_threads_stopped: true,
                    })),
                )
                .await
            }
            SessionEvent::BreakpointChanged(bp) => {
                self.send_event(
                    "breakpoint",
                    Some(json!(protocol::BreakpointEventBody {
                        reason: "changed".into(),
                        breakpoint: protocol::Breakpoint {
                            id: bp.id,
                            verified: bp.verified,
                            line: bp.line,
                        },
                    })),
                )
                .await
            }
            SessionEvent::Output { category, message } => {
                self.send_event(
                    "output",
                    Some(json!(protocol::OutputEventBody {
                        category,
                        output: message,
                    })),
                )
                .await
            }
            SessionEvent::Invalidated => {
                self.send_event("invalidated", Some(json!({ "areas": ["variables"] })))
                    .await
            }
            SessionEvent::Terminated => self.send_event("terminated", None).await,
            SessionEvent::Exited { code } => {
                self.send_event(
                    "exited",
                    Some(json!(protocol::ExitedEventBody { exit_code: code })),
                )
                .await
            }
        }
    }

    async fn handle_request(&mut self, request: &Request) -> Result<(), TransportError> {
        tracing::debug!(command = %request.command, seq = request.seq, "request");
        let result = self.dispatch(request).await;
        let seq = self.next_seq();
        let response = match result {
            Ok(body) => Response::success(seq, request, body),
            Err(message) => {
                tracing::debug!(command = %request.command, %message, "request failed");
                Response::error(seq, request, message)
            }
        };
        self.write(&serde_json::to_value(&response)?).await
    }

    /// Handle one request, returning the response body or an error
    /// message for the front end.
    async fn dispatch(&mut self, request: &Request) -> Result<Option<serde_json::Value>, String> {
        match request.command.as_str() {
            "initialize" => Ok(Some(json!(Capabilities::adapter()))),
            "configurationDone" => Ok(None),
            "attach" => {
                let args: AttachArguments = parse_args(request)?;
                self.session
                    .attach(AttachConfig {
                        ip: args.ip.unwrap_or_else(|| glint_console::DEFAULT_IP.to_owned()),
                        port: args.port,
                        project_root: root_or_cwd(args.project_root),
                        toolchain_root: args.toolchain.map(PathBuf::from),
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }
            "launch" => {
                let args: LaunchArguments = parse_args(request)?;
                let build = match args.build.as_deref() {
                    None | Some("dev") => Build::Dev,
                    Some("debug") => Build::Debug,
                    Some("release") => Build::Release,
                    Some(other) => return Err(format!("unknown build '{other}'")),
                };
                self.session
                    .launch(LaunchConfig {
                        toolchain_root: PathBuf::from(args.toolchain),
                        target_id: args.target_id,
                        build,
                        project_root: root_or_cwd(args.project_root),
                        timeout: args
                            .timeout
                            .map_or(DEFAULT_LAUNCH_TIMEOUT, Duration::from_secs),
                        extra_args: args.arguments,
                    })
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }
            "setBreakpoints" => {
                let args: SetBreakpointsArguments = parse_args(request)?;
                let path = args
                    .source
                    .path
                    .ok_or_else(|| "breakpoint source has no path".to_owned())?;
                let lines: Vec<u32> = args.breakpoints.iter().map(|bp| bp.line).collect();
                let records = self
                    .session
                    .set_breakpoints(std::path::Path::new(&path), &lines)
                    .map_err(|e| e.to_string())?;
                let breakpoints: Vec<protocol::Breakpoint> = records
                    .into_iter()
                    .map(|bp| protocol::Breakpoint {
                        id: bp.id,
                        verified: bp.verified,
                        line: bp.line,
                    })
                    .collect();
                Ok(Some(json!({ "breakpoints": breakpoints })))
            }
            "setExceptionBreakpoints" => {
                let args: SetExceptionBreakpointsArguments = parse_args(request)?;
                self.session
                    .set_break_on_error(args.filters.iter().any(|f| f == "error"))
                    .map_err(|e| e.to_string())?;
                Ok(None)
            }
            "threads" => Ok(Some(json!({
                "threads": [protocol::Thread { id: THREAD_ID, name: "Lua main".into() }]
            }))),
            "stackTrace" => {
                let frames = self.session.stack_trace().map_err(|e| e.to_string())?;
                let total = frames.len();
                let stack_frames: Vec<protocol::StackFrame> = frames
                    .into_iter()
                    .map(|frame| protocol::StackFrame {
                        id: frame.id,
                        name: frame.name,
                        source: Some(protocol::Source {
                            name: frame
                                .path
                                .file_name()
                                .map(|n| n.to_string_lossy().into_owned()),
                            path: Some(frame.path.to_string_lossy().into_owned()),
                        }),
                        line: frame.line,
                        column: 1,
                        presentation_hint: frame.subtle.then(|| "subtle".to_owned()),
                    })
                    .collect();
                Ok(Some(json!({
                    "stackFrames": stack_frames,
                    "totalFrames": total,
                })))
            }
            "scopes" => {
                let args: ScopesArguments = parse_args(request)?;
                let scopes = self
                    .session
                    .scopes(args.frame_id)
                    .map_err(|e| e.to_string())?;
                let scopes: Vec<protocol::Scope> = scopes
                    .into_iter()
                    .map(|scope| protocol::Scope {
                        name: scope.name,
                        variables_reference: scope.reference,
                        expensive: false,
                    })
                    .collect();
                Ok(Some(json!({ "scopes": scopes })))
            }
            "variables" => {
                let args: VariablesArguments = parse_args(request)?;
                let variables = self
                    .session
                    .variables(args.variables_reference)
                    .await
                    .map_err(|e| e.to_string())?;
                let variables: Vec<protocol::Variable> = variables
                    .into_iter()
                    .map(|v| protocol::Variable {
                        name: v.name,
                        value: v.value,
                        type_tag: Some(v.type_tag),
                        variables_reference: v.reference,
                    })
                    .collect();
                Ok(Some(json!({ "variables": variables })))
            }
            "evaluate" => {
                let args: EvaluateArguments = parse_args(request)?;
                let context = match args.context.as_deref() {
                    Some("hover") => EvalContext::Hover,
                    Some("watch") => EvalContext::Watch,
                    _ => EvalContext::Repl,
                };
                let outcome = self
                    .session
                    .evaluate(&args.expression, args.frame_id.unwrap_or(0), context)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Some(json!({
                    "result": outcome.value,
                    "type": outcome.type_tag,
                    "variablesReference": outcome.reference,
                })))
            }
            "completions" => {
                let args: CompletionsArguments = parse_args(request)?;
                let items = self
                    .session
                    .completions(&args.text, args.column, args.frame_id.unwrap_or(0))
                    .await
                    .map_err(|e| e.to_string())?;
                let targets: Vec<protocol::CompletionItem> = items
                    .into_iter()
                    .map(|item| protocol::CompletionItem {
                        label: item.label,
                        text: item.text,
                        item_type: item.snippet.then(|| "snippet".to_owned()),
                    })
                    .collect();
                Ok(Some(json!({ "targets": targets })))
            }
            "pause" => self.session.pause().map(|()| None).map_err(|e| e.to_string()),
            "continue" => self
                .session
                .resume()
                .map(|()| Some(json!({ "allThreadsContinued": true })))
                .map_err(|e| e.to_string()),
            "next" => self
                .session
                .step_over()
                .map(|()| None)
                .map_err(|e| e.to_string()),
            "stepIn" => self
                .session
                .step_into()
                .map(|()| None)
                .map_err(|e| e.to_string()),
            "stepOut" => self
                .session
                .step_out()
                .map(|()| None)
                .map_err(|e| e.to_string()),
            "restart" => self.session.restart().map(|()| None).map_err(|e| e.to_string()),
            "disconnect" => {
                let args: DisconnectArguments = match &request.arguments {
                    Some(_) => parse_args(request)?,
                    None => DisconnectArguments {
                        terminate_debuggee: None,
                    },
                };
                self.session
                    .disconnect(args.terminate_debuggee.unwrap_or(false))
                    .await;
                Ok(None)
            }
            "disassemble" => Err("the engine has no disassembly surface".to_owned()),
            other => Err(format!("unsupported request '{other}'")),
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, String> {
    let arguments = request
        .arguments
        .clone()
        .ok_or_else(|| format!("'{}' request without arguments", request.command))?;
    serde_json::from_value(arguments)
        .map_err(|err| format!("malformed '{}' arguments: {err}", request.command))
}

fn root_or_cwd(root: Option<String>) -> PathBuf {
    root.map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}
