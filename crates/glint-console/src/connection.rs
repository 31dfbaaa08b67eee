//! A connection to one engine console server.
//!
//! Owns the TCP socket and the frame codec. A spawned reader task
//! decodes frames strictly in arrival order and fans them out to
//! subscribers; a writer task puts each encoded frame on the socket
//! with a single write. Sends never block on a reply; anything that
//! needs confirmation correlates explicitly on top of the data stream.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::error::ConsoleError;
use crate::frame::{encode_json, FrameDecoder};

/// The compile server's conventional console port.
pub const COMPILER_PORT: u16 = 14032;

/// First port used by running game instances (instance N listens on
/// `GAME_PORT_BASE + N`).
pub const GAME_PORT_BASE: u16 = 14000;

/// Default address when none is given.
pub const DEFAULT_IP: &str = "127.0.0.1";

/// How much we pull off the socket per read call.
const READ_CHUNK: usize = 8192;

/// Lifecycle state of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP handshake in progress.
    Connecting,
    /// Connected; frames flow.
    Ready,
    /// Closed, from either end. `had_error` distinguishes a clean
    /// shutdown from a socket or protocol failure.
    Closed {
        /// Whether the connection ended due to an error.
        had_error: bool,
    },
}

/// Event delivered to connection subscribers, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    /// The connection is ready. Subscribers that attach to an already
    /// ready connection see this as their first event.
    Connected,
    /// The connection closed; no further events follow.
    Disconnected {
        /// Whether the close was caused by an error.
        had_error: bool,
    },
    /// One decoded console message.
    Data {
        /// The JSON section of the frame.
        json: serde_json::Value,
        /// The binary attachment, if any.
        binary: Option<Vec<u8>>,
    },
}

#[derive(Debug)]
struct Shared {
    name: String,
    state: Mutex<ConnectionState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConsoleEvent>>>,
}

impl Shared {
    fn fire(&self, event: ConsoleEvent) {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for tx in subscribers.iter() {
            // A dropped subscriber just stops listening.
            let _ = tx.send(event.clone());
        }
    }

    /// Transition to `Closed` once and fan out `Disconnected`. The
    /// state flips and the fan-out happen under the subscribers lock,
    /// so a concurrent `subscribe` lands either wholly before (and is
    /// reached by the fan-out) or wholly after (and sees the closed
    /// state); each subscriber gets the event exactly once.
    fn close_and_fire(&self, had_error: bool) {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, ConnectionState::Closed { .. }) {
                return;
            }
            *state = ConnectionState::Closed { had_error };
        }
        for tx in subscribers.iter() {
            let _ = tx.send(ConsoleEvent::Disconnected { had_error });
        }
    }
}

/// A live console connection. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Connection {
    shared: Arc<Shared>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Connection {
    /// Open a connection to `ip:port` and start its reader/writer tasks.
    pub async fn connect(ip: &str, port: u16) -> Result<Self, ConsoleError> {
        let stream = TcpStream::connect((ip, port)).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(Shared {
            name: format!("Glint ({ip}:{port})"),
            state: Mutex::new(ConnectionState::Ready),
            subscribers: Mutex::new(Vec::new()),
        });

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write_half, writer_rx));

        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(read_loop(read_half, Arc::clone(&shared), close_rx));

        tracing::debug!(name = %shared.name, "console connection established");
        Ok(Self {
            shared,
            writer_tx: Mutex::new(Some(writer_tx)),
            close_tx: Mutex::new(Some(close_tx)),
        })
    }

    /// Human-readable name, `Glint (ip:port)`.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Whether frames can currently be sent.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether the connection has terminated.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ConnectionState::Closed { .. })
    }

    /// Subscribe to connection events.
    ///
    /// Subscribers receive events in their registration order, each in
    /// strict arrival order. Attaching to an already ready connection
    /// delivers `Connected` first; attaching to a closed one delivers
    /// `Disconnected` immediately.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConsoleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Lock order matches `close_and_fire`: subscribers, then state.
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match self.state() {
            ConnectionState::Ready => {
                let _ = tx.send(ConsoleEvent::Connected);
            }
            ConnectionState::Closed { had_error } => {
                let _ = tx.send(ConsoleEvent::Disconnected { had_error });
            }
            ConnectionState::Connecting => {}
        }
        subscribers.push(tx);
        rx
    }

    /// Send a raw JSON object as one frame.
    pub fn send_json(&self, value: &serde_json::Value) -> Result<(), ConsoleError> {
        let frame = encode_json(value);
        let writer_tx = self.writer_tx.lock().unwrap_or_else(|e| e.into_inner());
        let tx = writer_tx.as_ref().ok_or(ConsoleError::Closed)?;
        tx.send(frame).map_err(|_| ConsoleError::Closed)
    }

    /// Send a generic console command. Returns the generated request id,
    /// the caller's correlation token for any reply.
    pub fn send_command(
        &self,
        command: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<String, ConsoleError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.send_json(&serde_json::json!({
            "id": id,
            "type": "command",
            "command": command,
            "arg": args,
        }))?;
        Ok(id)
    }

    /// Send a debugger command. Push-style: no id, no reply correlation.
    ///
    /// `data` fields are merged into the envelope alongside `type` and
    /// `command`.
    pub fn send_debugger_command(
        &self,
        command: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), ConsoleError> {
        let mut envelope = serde_json::Map::new();
        envelope.insert("type".into(), "lua_debugger".into());
        envelope.insert("command".into(), command.into());
        if let Some(serde_json::Value::Object(extra)) = data {
            for (k, v) in extra {
                envelope.insert(k, v);
            }
        }
        self.send_json(&serde_json::Value::Object(envelope))
    }

    /// Inject a Lua script into the debuggee VM.
    pub fn send_lua(&self, script: &str) -> Result<(), ConsoleError> {
        self.send_json(&serde_json::json!({
            "type": "script",
            "script": script,
        }))
    }

    /// Forcibly tear the connection down. Idempotent.
    pub fn close(&self) {
        let close_tx = {
            let mut guard = self.close_tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(tx) = close_tx {
            let _ = tx.send(());
        }
        // Drop the writer so the write task drains and exits.
        self.writer_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        // One buffer per frame keeps the header and payload in a single
        // write; the engine parser cannot reassemble a split header.
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    shared: Arc<Shared>,
    mut close_rx: oneshot::Receiver<()>,
) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; READ_CHUNK];
    let had_error = loop {
        tokio::select! {
            _ = &mut close_rx => break false,
            read = read_half.read(&mut chunk) => match read {
                Ok(0) => break false,
                Ok(n) => {
                    decoder.extend(&chunk[..n]);
                    loop {
                        match decoder.next_message() {
                            Ok(Some(message)) => shared.fire(ConsoleEvent::Data {
                                json: message.json,
                                binary: message.binary,
                            }),
                            Ok(None) => break,
                            Err(err) => {
                                tracing::warn!(
                                    name = %shared.name,
                                    %err,
                                    "protocol error, closing connection"
                                );
                                shared.close_and_fire(true);
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(name = %shared.name, %err, "console read failed");
                    break true;
                }
            }
        }
    };
    shared.close_and_fire(had_error);
}
