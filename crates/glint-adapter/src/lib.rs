//! Debug-session layer for the Glint engine.
//!
//! Sits between a front-end protocol layer and a [`glint_console`]
//! connection: breakpoint and source-path translation, the callstack
//! and lazy variable caches, expression evaluation over the injected
//! RPC channel, and launch/attach process supervision.

pub mod breakpoint;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod resolve;
pub mod rpc;
pub mod session;
pub mod toolchain;
pub mod variables;

pub use breakpoint::{Breakpoint, BreakpointManager};
pub use engine::{EngineFrame, EngineMessage, TableValue};
pub use error::AdapterError;
pub use launcher::{LaunchSpec, LaunchedEngine};
pub use resolve::SourcePathResolver;
pub use rpc::{RpcClient, RpcReply};
pub use session::{
    AttachConfig, CompletionItem, DebugSession, EvalContext, EvalOutcome, LaunchConfig, Scope,
    SessionEvent, SessionFrame, SessionState,
};
pub use toolchain::{Build, LaunchTarget, Toolchain};
pub use variables::{Variable, VariableArena};
